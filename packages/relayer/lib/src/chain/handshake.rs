//! Connection and channel handshake messages.

use ibc_proto::{
    google::protobuf::Any,
    ibc::core::{
        channel::v1::{
            Channel, Counterparty as ChannelCounterparty, MsgChannelOpenAck,
            MsgChannelOpenConfirm, MsgChannelOpenInit, MsgChannelOpenTry,
        },
        commitment::v1::MerklePrefix,
        connection::v1::{
            Counterparty as ConnectionCounterparty, MsgConnectionOpenAck,
            MsgConnectionOpenConfirm, MsgConnectionOpenInit, MsgConnectionOpenTry, Version,
        },
    },
};

use super::{client::ChainClient, light_client::to_any, paths, TxOutcome};
use crate::{
    error::ChainError,
    events::{self, find_attribute},
    height::Height,
    identifiers::{ChannelId, ClientId, ConnectionId, PortId},
    state::{ChannelState, Order},
};

const MSG_CONNECTION_OPEN_INIT_TYPE_URL: &str = "/ibc.core.connection.v1.MsgConnectionOpenInit";
const MSG_CONNECTION_OPEN_TRY_TYPE_URL: &str = "/ibc.core.connection.v1.MsgConnectionOpenTry";
const MSG_CONNECTION_OPEN_ACK_TYPE_URL: &str = "/ibc.core.connection.v1.MsgConnectionOpenAck";
const MSG_CONNECTION_OPEN_CONFIRM_TYPE_URL: &str =
    "/ibc.core.connection.v1.MsgConnectionOpenConfirm";
const MSG_CHANNEL_OPEN_INIT_TYPE_URL: &str = "/ibc.core.channel.v1.MsgChannelOpenInit";
const MSG_CHANNEL_OPEN_TRY_TYPE_URL: &str = "/ibc.core.channel.v1.MsgChannelOpenTry";
const MSG_CHANNEL_OPEN_ACK_TYPE_URL: &str = "/ibc.core.channel.v1.MsgChannelOpenAck";
const MSG_CHANNEL_OPEN_CONFIRM_TYPE_URL: &str = "/ibc.core.channel.v1.MsgChannelOpenConfirm";

/// Proofs of a connection end on the counterparty chain, for Try and Ack.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionHandshakeProof {
    /// The counterparty's client of this chain.
    pub client_id: ClientId,
    /// The proven connection on the counterparty.
    pub connection_id: ConnectionId,
    /// The counterparty's client state of this chain.
    pub client_state: Any,
    /// The header height of the counterparty the proofs verify against.
    pub proof_height: Height,
    /// Proof of the connection end.
    pub proof_connection: Vec<u8>,
    /// Proof of the client state.
    pub proof_client: Vec<u8>,
    /// Proof of the consensus state at `consensus_height`.
    pub proof_consensus: Vec<u8>,
    /// The latest height of `client_id`.
    pub consensus_height: Height,
}

/// Proof of a channel end on the counterparty chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelHandshakeProof {
    /// The counterparty port.
    pub port_id: PortId,
    /// The counterparty channel.
    pub channel_id: ChannelId,
    /// The header height of the counterparty the proof verifies against.
    pub proof_height: Height,
    /// Proof of the channel end.
    pub proof: Vec<u8>,
}

/// The connection version both sides announce: version 1 with both orderings.
#[must_use]
pub fn default_connection_version() -> Version {
    Version {
        identifier: "1".to_string(),
        features: vec![
            Order::Ordered.as_str().to_string(),
            Order::Unordered.as_str().to_string(),
        ],
    }
}

fn connection_counterparty(
    client_id: &ClientId,
    connection_id: Option<&ConnectionId>,
) -> ConnectionCounterparty {
    ConnectionCounterparty {
        client_id: client_id.to_string(),
        connection_id: connection_id.map(ToString::to_string).unwrap_or_default(),
        prefix: Some(MerklePrefix {
            key_prefix: paths::IBC_KEY_PREFIX.to_vec(),
        }),
    }
}

impl ChainClient {
    /// Opens a connection on `client_id` towards `remote_client_id`.
    ///
    /// # Errors
    /// Returns an error if the transaction fails or emits no connection id.
    #[tracing::instrument(skip_all, fields(chain_id = %self.chain_id(), %client_id))]
    pub async fn conn_open_init(
        &self,
        client_id: &ClientId,
        remote_client_id: &ClientId,
    ) -> Result<ConnectionId, ChainError> {
        let msg = MsgConnectionOpenInit {
            client_id: client_id.to_string(),
            counterparty: Some(connection_counterparty(remote_client_id, None)),
            version: Some(default_connection_version()),
            delay_period: 0,
            signer: self.sender_address().to_string(),
        };
        let outcome = self
            .submit(vec![to_any(MSG_CONNECTION_OPEN_INIT_TYPE_URL, &msg)])
            .await?;
        let connection_id =
            find_attribute(&outcome.events, events::CONNECTION_OPEN_INIT, "connection_id")?;
        tracing::info!(%connection_id, "Connection open init");
        Ok(connection_id.into())
    }

    /// Answers a connection opened on the counterparty.
    ///
    /// # Errors
    /// Returns an error if the transaction fails or emits no connection id.
    #[allow(deprecated)]
    #[tracing::instrument(skip_all, fields(chain_id = %self.chain_id(), %client_id))]
    pub async fn conn_open_try(
        &self,
        client_id: &ClientId,
        proof: &ConnectionHandshakeProof,
    ) -> Result<ConnectionId, ChainError> {
        let msg = MsgConnectionOpenTry {
            client_id: client_id.to_string(),
            client_state: Some(proof.client_state.clone()),
            counterparty: Some(connection_counterparty(
                &proof.client_id,
                Some(&proof.connection_id),
            )),
            delay_period: 0,
            counterparty_versions: vec![default_connection_version()],
            proof_height: Some(proof.proof_height.into()),
            proof_init: proof.proof_connection.clone(),
            proof_client: proof.proof_client.clone(),
            proof_consensus: proof.proof_consensus.clone(),
            consensus_height: Some(proof.consensus_height.into()),
            signer: self.sender_address().to_string(),
            ..Default::default()
        };
        let outcome = self
            .submit(vec![to_any(MSG_CONNECTION_OPEN_TRY_TYPE_URL, &msg)])
            .await?;
        let connection_id =
            find_attribute(&outcome.events, events::CONNECTION_OPEN_TRY, "connection_id")?;
        tracing::info!(%connection_id, "Connection open try");
        Ok(connection_id.into())
    }

    /// Acknowledges the counterparty's Try on our Init connection.
    ///
    /// # Errors
    /// Returns an error if the transaction fails.
    #[allow(deprecated)]
    #[tracing::instrument(skip_all, fields(chain_id = %self.chain_id(), %connection_id))]
    pub async fn conn_open_ack(
        &self,
        connection_id: &ConnectionId,
        proof: &ConnectionHandshakeProof,
    ) -> Result<TxOutcome, ChainError> {
        let msg = MsgConnectionOpenAck {
            connection_id: connection_id.to_string(),
            counterparty_connection_id: proof.connection_id.to_string(),
            version: Some(default_connection_version()),
            client_state: Some(proof.client_state.clone()),
            proof_height: Some(proof.proof_height.into()),
            proof_try: proof.proof_connection.clone(),
            proof_client: proof.proof_client.clone(),
            proof_consensus: proof.proof_consensus.clone(),
            consensus_height: Some(proof.consensus_height.into()),
            signer: self.sender_address().to_string(),
            ..Default::default()
        };
        self.submit(vec![to_any(MSG_CONNECTION_OPEN_ACK_TYPE_URL, &msg)])
            .await
    }

    /// Confirms our Try connection after the counterparty opened.
    ///
    /// # Errors
    /// Returns an error if the transaction fails.
    #[tracing::instrument(skip_all, fields(chain_id = %self.chain_id(), %connection_id))]
    pub async fn conn_open_confirm(
        &self,
        connection_id: &ConnectionId,
        proof: &ConnectionHandshakeProof,
    ) -> Result<TxOutcome, ChainError> {
        let msg = MsgConnectionOpenConfirm {
            connection_id: connection_id.to_string(),
            proof_ack: proof.proof_connection.clone(),
            proof_height: Some(proof.proof_height.into()),
            signer: self.sender_address().to_string(),
        };
        self.submit(vec![to_any(MSG_CONNECTION_OPEN_CONFIRM_TYPE_URL, &msg)])
            .await
    }

    /// Opens a channel on `port_id` over `connection_id`.
    ///
    /// # Errors
    /// Returns an error if the transaction fails or emits no channel id.
    #[tracing::instrument(skip_all, fields(chain_id = %self.chain_id(), %port_id, %connection_id))]
    pub async fn channel_open_init(
        &self,
        port_id: &PortId,
        remote_port_id: &PortId,
        ordering: Order,
        connection_id: &ConnectionId,
        version: &str,
    ) -> Result<ChannelId, ChainError> {
        let msg = MsgChannelOpenInit {
            port_id: port_id.to_string(),
            channel: Some(Channel {
                state: ChannelState::Init.as_i32(),
                ordering: ordering.as_i32(),
                counterparty: Some(ChannelCounterparty {
                    port_id: remote_port_id.to_string(),
                    channel_id: String::new(),
                }),
                connection_hops: vec![connection_id.to_string()],
                version: version.to_string(),
                upgrade_sequence: 0,
            }),
            signer: self.sender_address().to_string(),
        };
        let outcome = self
            .submit(vec![to_any(MSG_CHANNEL_OPEN_INIT_TYPE_URL, &msg)])
            .await?;
        let channel_id = find_attribute(&outcome.events, events::CHANNEL_OPEN_INIT, "channel_id")?;
        tracing::info!(%channel_id, "Channel open init");
        Ok(channel_id.into())
    }

    /// Answers a channel opened on the counterparty.
    ///
    /// # Errors
    /// Returns an error if the transaction fails or emits no channel id.
    #[allow(deprecated)]
    #[tracing::instrument(skip_all, fields(chain_id = %self.chain_id(), %port_id, %connection_id))]
    pub async fn channel_open_try(
        &self,
        port_id: &PortId,
        ordering: Order,
        connection_id: &ConnectionId,
        version: &str,
        counterparty_version: &str,
        proof: &ChannelHandshakeProof,
    ) -> Result<ChannelId, ChainError> {
        let msg = MsgChannelOpenTry {
            port_id: port_id.to_string(),
            channel: Some(Channel {
                state: ChannelState::TryOpen.as_i32(),
                ordering: ordering.as_i32(),
                counterparty: Some(ChannelCounterparty {
                    port_id: proof.port_id.to_string(),
                    channel_id: proof.channel_id.to_string(),
                }),
                connection_hops: vec![connection_id.to_string()],
                version: version.to_string(),
                upgrade_sequence: 0,
            }),
            counterparty_version: counterparty_version.to_string(),
            proof_init: proof.proof.clone(),
            proof_height: Some(proof.proof_height.into()),
            signer: self.sender_address().to_string(),
            ..Default::default()
        };
        let outcome = self
            .submit(vec![to_any(MSG_CHANNEL_OPEN_TRY_TYPE_URL, &msg)])
            .await?;
        let channel_id = find_attribute(&outcome.events, events::CHANNEL_OPEN_TRY, "channel_id")?;
        tracing::info!(%channel_id, "Channel open try");
        Ok(channel_id.into())
    }

    /// Acknowledges the counterparty's Try on our Init channel.
    ///
    /// # Errors
    /// Returns an error if the transaction fails.
    #[tracing::instrument(skip_all, fields(chain_id = %self.chain_id(), %port_id, %channel_id))]
    pub async fn channel_open_ack(
        &self,
        port_id: &PortId,
        channel_id: &ChannelId,
        counterparty_version: &str,
        proof: &ChannelHandshakeProof,
    ) -> Result<TxOutcome, ChainError> {
        let msg = MsgChannelOpenAck {
            port_id: port_id.to_string(),
            channel_id: channel_id.to_string(),
            counterparty_channel_id: proof.channel_id.to_string(),
            counterparty_version: counterparty_version.to_string(),
            proof_try: proof.proof.clone(),
            proof_height: Some(proof.proof_height.into()),
            signer: self.sender_address().to_string(),
        };
        self.submit(vec![to_any(MSG_CHANNEL_OPEN_ACK_TYPE_URL, &msg)])
            .await
    }

    /// Confirms our Try channel after the counterparty opened.
    ///
    /// # Errors
    /// Returns an error if the transaction fails.
    #[tracing::instrument(skip_all, fields(chain_id = %self.chain_id(), %port_id, %channel_id))]
    pub async fn channel_open_confirm(
        &self,
        port_id: &PortId,
        channel_id: &ChannelId,
        proof: &ChannelHandshakeProof,
    ) -> Result<TxOutcome, ChainError> {
        let msg = MsgChannelOpenConfirm {
            port_id: port_id.to_string(),
            channel_id: channel_id.to_string(),
            proof_ack: proof.proof.clone(),
            proof_height: Some(proof.proof_height.into()),
            signer: self.sender_address().to_string(),
        };
        self.submit(vec![to_any(MSG_CHANNEL_OPEN_CONFIRM_TYPE_URL, &msg)])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_version_announces_both_orderings() {
        let version = default_connection_version();
        assert_eq!(version.identifier, "1");
        assert_eq!(version.features, vec!["ORDER_ORDERED", "ORDER_UNORDERED"]);
    }

    #[test]
    fn counterparty_uses_ibc_prefix() {
        let counterparty = connection_counterparty(&ClientId::new("07-tendermint-3"), None);
        assert_eq!(counterparty.connection_id, "");
        assert_eq!(counterparty.prefix.unwrap().key_prefix, b"ibc");
    }
}

//! Membership and non-membership proofs of the IBC store.
//!
//! A proof for header `h` is queried at `h - 1`: the app hash committed in header `h`
//! is the root of the state after block `h - 1`.

use futures::try_join;
use ibc_proto::{google::protobuf::Any, ibc::core::commitment::v1::MerkleProof, ics23};
use prost::Message;

use super::{
    client::ChainClient,
    handshake::{ChannelHandshakeProof, ConnectionHandshakeProof},
    light_client, paths, ProofOp,
};
use crate::{
    error::ChainError,
    height::Height,
    identifiers::{ChannelId, ClientId, ConnectionId, PortId},
    packet::{Ack, Packet},
    state::Order,
};

/// A store value with its proof against a header height.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvenQuery {
    /// The stored value, empty for a proof of absence.
    pub value: Vec<u8>,
    /// The encoded `MerkleProof`.
    pub proof: Vec<u8>,
    /// The header height the proof verifies against.
    pub proof_height: Height,
}

/// Re-encodes ABCI proof operations as an ICS23 `MerkleProof`.
///
/// # Errors
/// Returns an error if there are no operations or an operation is not an ICS23 proof.
pub fn merkle_proof_from_ops(key: &str, ops: &[ProofOp]) -> Result<Vec<u8>, ChainError> {
    if ops.is_empty() {
        return Err(ChainError::MissingProof {
            path: key.to_string(),
        });
    }
    let proofs = ops
        .iter()
        .map(|op| ics23::CommitmentProof::decode(op.data.as_slice()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(MerkleProof { proofs }.encode_to_vec())
}

impl ChainClient {
    /// Reads `key` with a proof that verifies against the app hash of `header_height`.
    ///
    /// # Errors
    /// Returns an error if the query fails or returns no proof.
    pub async fn query_proven(
        &self,
        key: &str,
        header_height: Height,
    ) -> Result<ProvenQuery, ChainError> {
        let query_height = header_height.decrement()?;
        let response = self
            .query_store(key, Some(query_height.revision_height), true)
            .await?;
        let proof = merkle_proof_from_ops(key, &response.proof_ops)?;
        Ok(ProvenQuery {
            value: response.value,
            proof,
            proof_height: header_height,
        })
    }

    /// Proves a connection end together with the client and consensus state it relies on.
    ///
    /// The consensus height is the latest height of `client_id`.
    ///
    /// # Errors
    /// Returns an error if any query fails or the client state is missing.
    #[tracing::instrument(skip_all, fields(chain_id = %self.chain_id(), %client_id, %connection_id, %header_height))]
    pub async fn get_connection_proof(
        &self,
        client_id: &ClientId,
        connection_id: &ConnectionId,
        header_height: Height,
    ) -> Result<ConnectionHandshakeProof, ChainError> {
        let client_key = paths::client_state(client_id);
        let client_proof = self.query_proven(&client_key, header_height).await?;
        if client_proof.value.is_empty() {
            return Err(ChainError::NotFound { path: client_key });
        }
        let client_state = Any::decode(client_proof.value.as_slice())?;
        let consensus_height = light_client::latest_height(&light_client::decode_client_state(
            &client_state,
        )?)
        .ok_or_else(|| {
            ChainError::Decode(format!("client state of {client_id} has no latest height"))
        })?;

        let connection_key = paths::connection(connection_id);
        let consensus_key = paths::consensus_state(client_id, consensus_height);
        let (connection_proof, consensus_proof) = try_join!(
            self.query_proven(&connection_key, header_height),
            self.query_proven(&consensus_key, header_height)
        )?;

        Ok(ConnectionHandshakeProof {
            client_id: client_id.clone(),
            connection_id: connection_id.clone(),
            client_state,
            proof_height: header_height,
            proof_connection: connection_proof.proof,
            proof_client: client_proof.proof,
            proof_consensus: consensus_proof.proof,
            consensus_height,
        })
    }

    /// Proves a channel end.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn get_channel_proof(
        &self,
        port_id: &PortId,
        channel_id: &ChannelId,
        header_height: Height,
    ) -> Result<ChannelHandshakeProof, ChainError> {
        let proven = self
            .query_proven(&paths::channel_end(port_id, channel_id), header_height)
            .await?;
        Ok(ChannelHandshakeProof {
            port_id: port_id.clone(),
            channel_id: channel_id.clone(),
            proof_height: header_height,
            proof: proven.proof,
        })
    }

    /// Proves the commitment of a packet sent by this chain.
    ///
    /// # Errors
    /// Returns [`ChainError::NotFound`] if the commitment was already cleared.
    pub async fn get_packet_proof(
        &self,
        packet: &Packet,
        header_height: Height,
    ) -> Result<Vec<u8>, ChainError> {
        let key = paths::packet_commitment(
            &packet.source_port,
            &packet.source_channel,
            packet.sequence,
        );
        prove_membership(self.query_proven(&key, header_height).await?, key)
    }

    /// Proves the acknowledgement this chain wrote for a received packet.
    ///
    /// # Errors
    /// Returns [`ChainError::NotFound`] if no acknowledgement is stored.
    pub async fn get_ack_proof(&self, ack: &Ack, header_height: Height) -> Result<Vec<u8>, ChainError> {
        let packet = &ack.original_packet;
        let key = paths::packet_ack(
            &packet.destination_port,
            &packet.destination_channel,
            packet.sequence,
        );
        prove_membership(self.query_proven(&key, header_height).await?, key)
    }

    /// Proves that this chain did not receive a packet.
    ///
    /// Unordered channels prove the absence of the packet receipt, ordered channels
    /// prove the next sequence to receive.
    ///
    /// # Errors
    /// Returns an error if the channel does not exist or a query fails.
    pub async fn get_timeout_proof(
        &self,
        packet: &Packet,
        header_height: Height,
    ) -> Result<Vec<u8>, ChainError> {
        let channel = self
            .query_channel(&packet.destination_port, &packet.destination_channel)
            .await?
            .ok_or_else(|| ChainError::NotFound {
                path: paths::channel_end(&packet.destination_port, &packet.destination_channel),
            })?;
        let key = match Order::from_i32(channel.ordering) {
            Some(Order::Ordered) => {
                paths::next_sequence_recv(&packet.destination_port, &packet.destination_channel)
            }
            _ => paths::packet_receipt(
                &packet.destination_port,
                &packet.destination_channel,
                packet.sequence,
            ),
        };
        Ok(self.query_proven(&key, header_height).await?.proof)
    }
}

fn prove_membership(proven: ProvenQuery, key: String) -> Result<Vec<u8>, ChainError> {
    if proven.value.is_empty() {
        return Err(ChainError::NotFound { path: key });
    }
    Ok(proven.proof)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_ops_are_a_missing_proof() {
        assert!(matches!(
            merkle_proof_from_ops("connections/connection-0", &[]),
            Err(ChainError::MissingProof { .. })
        ));
    }

    #[test]
    fn ops_become_merkle_proof_entries() {
        let exist = ics23::CommitmentProof {
            proof: Some(ics23::commitment_proof::Proof::Exist(ics23::ExistenceProof {
                key: b"k".to_vec(),
                value: b"v".to_vec(),
                leaf: None,
                path: vec![],
            })),
        };
        let op = ProofOp {
            kind: "ics23:iavl".to_string(),
            key: b"k".to_vec(),
            data: exist.encode_to_vec(),
        };
        let encoded = merkle_proof_from_ops("k", &[op.clone(), op]).unwrap();
        let proof = MerkleProof::decode(encoded.as_slice()).unwrap();
        assert_eq!(proof.proofs, vec![exist.clone(), exist]);
    }
}

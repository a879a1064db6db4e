//! Connection and channel handshakes, and reattaching to existing connections.

use std::time::Duration;

use futures::try_join;
use ibc_proto::ibc::{
    core::{channel::v1::Channel, connection::v1::ConnectionEnd},
    lightclients::tendermint::v1::ClientState,
};

use super::{ChannelInfo, ChannelPair, Link};
use crate::{
    chain::{light_client, ChainClient, ChannelHandshakeProof, ConnectionHandshakeProof},
    endpoint::Endpoint,
    error::{ChainError, ProtocolStateError, RelayerError},
    height::Height,
    identifiers::{ChannelId, ClientId, ConnectionId, PortId},
    side::Side,
    state::{ChannelState, ConnectionState, Order},
};

async fn connection_in_state(
    chain: &ChainClient,
    connection_id: &ConnectionId,
    expected: ConnectionState,
) -> Result<ConnectionEnd, RelayerError> {
    let connection = chain.query_connection(connection_id).await?.ok_or_else(|| {
        ProtocolStateError::ConnectionNotFound {
            chain_id: chain.chain_id().clone(),
            connection_id: connection_id.clone(),
        }
    })?;
    let actual = ConnectionState::from(connection.state);
    if actual != expected {
        return Err(ProtocolStateError::ConnectionState {
            chain_id: chain.chain_id().clone(),
            connection_id: connection_id.clone(),
            expected,
            actual,
        }
        .into());
    }
    Ok(connection)
}

async fn channel_in_state(
    chain: &ChainClient,
    port_id: &PortId,
    channel_id: &ChannelId,
    expected: ChannelState,
) -> Result<Channel, RelayerError> {
    let channel = chain
        .query_channel(port_id, channel_id)
        .await?
        .ok_or_else(|| ProtocolStateError::ChannelNotFound {
            chain_id: chain.chain_id().clone(),
            port_id: port_id.clone(),
            channel_id: channel_id.clone(),
        })?;
    let actual = ChannelState::from(channel.state);
    if actual != expected {
        return Err(ProtocolStateError::ChannelState {
            chain_id: chain.chain_id().clone(),
            port_id: port_id.clone(),
            channel_id: channel_id.clone(),
            expected,
            actual,
        }
        .into());
    }
    Ok(channel)
}

/// Makes `src` state at its next header provable on `dest`: waits for a new block on
/// `src` and updates `dest`'s client of `src` to it.
///
/// Returns the header height the proofs must be taken at.
async fn prepare_proof_height(
    src: &ChainClient,
    dest: &ChainClient,
    dest_client_id: &ClientId,
) -> Result<Height, ChainError> {
    src.wait_one_block().await?;
    dest.update_client_from(dest_client_id, src).await
}

async fn channel_proof(
    prover: &Endpoint,
    verifier: &Endpoint,
    port_id: &PortId,
    channel_id: &ChannelId,
) -> Result<ChannelHandshakeProof, ChainError> {
    let header_height =
        prepare_proof_height(prover.client(), verifier.client(), verifier.client_id()).await?;
    prover
        .client()
        .get_channel_proof(port_id, channel_id, header_height)
        .await
}

/// The four step connection handshake between two chains with clients of each other.
///
/// Chain A initiates: Init on A, Try on B, Ack on A, Confirm on B.
#[derive(Clone, Debug)]
pub struct ConnectionHandshake {
    node_a: ChainClient,
    node_b: ChainClient,
    client_a: ClientId,
    client_b: ClientId,
}

impl ConnectionHandshake {
    /// `client_a` is the client of B hosted on A, `client_b` the client of A hosted on B.
    #[must_use]
    pub const fn new(
        node_a: ChainClient,
        node_b: ChainClient,
        client_a: ClientId,
        client_b: ClientId,
    ) -> Self {
        Self {
            node_a,
            node_b,
            client_a,
            client_b,
        }
    }

    async fn proof_from(
        &self,
        side: Side,
        connection_id: &ConnectionId,
    ) -> Result<ConnectionHandshakeProof, ChainError> {
        let (src, src_client, dest, dest_client) = match side {
            Side::A => (&self.node_a, &self.client_a, &self.node_b, &self.client_b),
            Side::B => (&self.node_b, &self.client_b, &self.node_a, &self.client_a),
        };
        let header_height = prepare_proof_height(src, dest, dest_client).await?;
        src.get_connection_proof(src_client, connection_id, header_height)
            .await
    }

    /// Opens the connection on A.
    ///
    /// # Errors
    /// Returns an error if the transaction fails.
    pub async fn init(&self) -> Result<ConnectionId, RelayerError> {
        Ok(self
            .node_a
            .conn_open_init(&self.client_a, &self.client_b)
            .await?)
    }

    /// Answers A's connection on B. A's connection must be in INIT.
    ///
    /// # Errors
    /// Returns a [`ProtocolStateError`] if the precondition does not hold, otherwise the
    /// first chain error.
    pub async fn try_open(&self, connection_a: &ConnectionId) -> Result<ConnectionId, RelayerError> {
        connection_in_state(&self.node_a, connection_a, ConnectionState::Init).await?;
        let proof = self.proof_from(Side::A, connection_a).await?;
        Ok(self.node_b.conn_open_try(&self.client_b, &proof).await?)
    }

    /// Opens A's connection. A must be in INIT and B in TRYOPEN.
    ///
    /// # Errors
    /// Returns a [`ProtocolStateError`] if the preconditions do not hold, otherwise the
    /// first chain error.
    pub async fn ack(
        &self,
        connection_a: &ConnectionId,
        connection_b: &ConnectionId,
    ) -> Result<(), RelayerError> {
        try_join!(
            connection_in_state(&self.node_a, connection_a, ConnectionState::Init),
            connection_in_state(&self.node_b, connection_b, ConnectionState::TryOpen)
        )?;
        let proof = self.proof_from(Side::B, connection_b).await?;
        self.node_a.conn_open_ack(connection_a, &proof).await?;
        Ok(())
    }

    /// Opens B's connection. B must be in TRYOPEN and A in OPEN.
    ///
    /// # Errors
    /// Returns a [`ProtocolStateError`] if the preconditions do not hold, otherwise the
    /// first chain error.
    pub async fn confirm(
        &self,
        connection_a: &ConnectionId,
        connection_b: &ConnectionId,
    ) -> Result<(), RelayerError> {
        try_join!(
            connection_in_state(&self.node_b, connection_b, ConnectionState::TryOpen),
            connection_in_state(&self.node_a, connection_a, ConnectionState::Open)
        )?;
        let proof = self.proof_from(Side::A, connection_a).await?;
        self.node_b.conn_open_confirm(connection_b, &proof).await?;
        Ok(())
    }

    /// Runs all four steps. Returns the connection ids on A and B.
    ///
    /// # Errors
    /// Returns the first failing step's error.
    #[tracing::instrument(skip_all, fields(chain_a = %self.node_a.chain_id(), chain_b = %self.node_b.chain_id()))]
    pub async fn run(&self) -> Result<(ConnectionId, ConnectionId), RelayerError> {
        let connection_a = self.init().await?;
        let connection_b = self.try_open(&connection_a).await?;
        self.ack(&connection_a, &connection_b).await?;
        self.confirm(&connection_a, &connection_b).await?;
        tracing::info!(%connection_a, %connection_b, "Connection open");
        Ok((connection_a, connection_b))
    }
}

/// The four step channel handshake over an open connection, initiated by `src`.
#[derive(Clone, Debug)]
pub struct ChannelHandshake {
    src: Endpoint,
    dest: Endpoint,
    ordering: Order,
    version: String,
}

impl ChannelHandshake {
    /// A handshake proposing `ordering` and `version` from `src` to `dest`.
    #[must_use]
    pub fn new(src: Endpoint, dest: Endpoint, ordering: Order, version: impl Into<String>) -> Self {
        Self {
            src,
            dest,
            ordering,
            version: version.into(),
        }
    }

    /// Opens the channel on `src`.
    ///
    /// # Errors
    /// Returns an error if the transaction fails.
    pub async fn init(&self, src_port: &PortId, dest_port: &PortId) -> Result<ChannelId, RelayerError> {
        Ok(self
            .src
            .client()
            .channel_open_init(
                src_port,
                dest_port,
                self.ordering,
                self.src.connection_id(),
                &self.version,
            )
            .await?)
    }

    /// Answers `src`'s channel on `dest`. The `src` channel must be in INIT.
    ///
    /// # Errors
    /// Returns a [`ProtocolStateError`] if the precondition does not hold, otherwise the
    /// first chain error.
    pub async fn try_open(&self, src: &ChannelInfo, dest_port: &PortId) -> Result<ChannelId, RelayerError> {
        channel_in_state(
            self.src.client(),
            &src.port_id,
            &src.channel_id,
            ChannelState::Init,
        )
        .await?;
        let proof = channel_proof(&self.src, &self.dest, &src.port_id, &src.channel_id).await?;
        Ok(self
            .dest
            .client()
            .channel_open_try(
                dest_port,
                self.ordering,
                self.dest.connection_id(),
                &self.version,
                &self.version,
                &proof,
            )
            .await?)
    }

    /// Opens the `src` channel. `src` must be in INIT and `dest` in TRYOPEN.
    ///
    /// # Errors
    /// Returns a [`ProtocolStateError`] if the preconditions do not hold, otherwise the
    /// first chain error.
    pub async fn ack(&self, pair: &ChannelPair) -> Result<(), RelayerError> {
        try_join!(
            channel_in_state(
                self.src.client(),
                &pair.src.port_id,
                &pair.src.channel_id,
                ChannelState::Init
            ),
            channel_in_state(
                self.dest.client(),
                &pair.dest.port_id,
                &pair.dest.channel_id,
                ChannelState::TryOpen
            )
        )?;
        let proof = channel_proof(
            &self.dest,
            &self.src,
            &pair.dest.port_id,
            &pair.dest.channel_id,
        )
        .await?;
        self.src
            .client()
            .channel_open_ack(&pair.src.port_id, &pair.src.channel_id, &self.version, &proof)
            .await?;
        Ok(())
    }

    /// Opens the `dest` channel. `dest` must be in TRYOPEN and `src` in OPEN.
    ///
    /// # Errors
    /// Returns a [`ProtocolStateError`] if the preconditions do not hold, otherwise the
    /// first chain error.
    pub async fn confirm(&self, pair: &ChannelPair) -> Result<(), RelayerError> {
        try_join!(
            channel_in_state(
                self.dest.client(),
                &pair.dest.port_id,
                &pair.dest.channel_id,
                ChannelState::TryOpen
            ),
            channel_in_state(
                self.src.client(),
                &pair.src.port_id,
                &pair.src.channel_id,
                ChannelState::Open
            )
        )?;
        let proof =
            channel_proof(&self.src, &self.dest, &pair.src.port_id, &pair.src.channel_id).await?;
        self.dest
            .client()
            .channel_open_confirm(&pair.dest.port_id, &pair.dest.channel_id, &proof)
            .await?;
        Ok(())
    }

    /// Runs all four steps.
    ///
    /// # Errors
    /// Returns the first failing step's error.
    #[tracing::instrument(skip_all, fields(src = %self.src.chain_id(), dest = %self.dest.chain_id(), %src_port, %dest_port))]
    pub async fn run(&self, src_port: &PortId, dest_port: &PortId) -> Result<ChannelPair, RelayerError> {
        let src = ChannelInfo {
            port_id: src_port.clone(),
            channel_id: self.init(src_port, dest_port).await?,
        };
        let dest = ChannelInfo {
            port_id: dest_port.clone(),
            channel_id: self.try_open(&src, dest_port).await?,
        };
        let pair = ChannelPair { src, dest };
        self.ack(&pair).await?;
        self.confirm(&pair).await?;
        tracing::info!(
            src_channel = %pair.src.channel_id,
            dest_channel = %pair.dest.channel_id,
            "Channel open"
        );
        Ok(pair)
    }
}

impl Link {
    /// Creates light clients of each other on both chains, opens a connection over them
    /// and returns the link.
    ///
    /// `trusting_period_a` applies to the client of A hosted on B, and vice versa. Both
    /// default to 2/3 of the tracked chain's unbonding period.
    ///
    /// # Errors
    /// Returns [`ProtocolStateError::SameChain`] if both nodes are the same chain, otherwise
    /// the first failing step's error.
    #[tracing::instrument(skip_all, fields(chain_a = %node_a.chain_id(), chain_b = %node_b.chain_id()))]
    pub async fn create_with_new_connections(
        node_a: ChainClient,
        node_b: ChainClient,
        trusting_period_a: Option<Duration>,
        trusting_period_b: Option<Duration>,
    ) -> Result<Self, RelayerError> {
        if node_a.chain_id() == node_b.chain_id() {
            return Err(ProtocolStateError::SameChain(node_a.chain_id().clone()).into());
        }

        let ((client_state_a, consensus_state_a), (client_state_b, consensus_state_b)) = try_join!(
            node_a.build_create_client_args(trusting_period_a),
            node_b.build_create_client_args(trusting_period_b)
        )?;
        let client_b = node_b
            .create_light_client(client_state_a, consensus_state_a)
            .await?;
        let client_a = node_a
            .create_light_client(client_state_b, consensus_state_b)
            .await?;

        // The first update needs a header past the creation height on each side.
        try_join!(node_a.wait_one_block(), node_b.wait_one_block())?;

        let handshake =
            ConnectionHandshake::new(node_a.clone(), node_b.clone(), client_a.clone(), client_b.clone());
        let (connection_a, connection_b) = handshake.run().await?;

        Ok(Self::new(
            Endpoint::new(node_a, client_a, connection_a),
            Endpoint::new(node_b, client_b, connection_b),
        ))
    }

    /// Validates an existing pair of open connections and returns the link over them.
    ///
    /// The connections must be OPEN counterparts of each other, their clients must track
    /// the given chains, and the latest consensus state of each client must match the
    /// header the tracked chain produced at that height.
    ///
    /// # Errors
    /// Returns a [`ProtocolStateError`] describing the first mismatch.
    #[tracing::instrument(skip_all, fields(chain_a = %node_a.chain_id(), chain_b = %node_b.chain_id(), %connection_a, %connection_b))]
    pub async fn create_with_existing_connections(
        node_a: ChainClient,
        node_b: ChainClient,
        connection_a: &ConnectionId,
        connection_b: &ConnectionId,
    ) -> Result<Self, RelayerError> {
        if node_a.chain_id() == node_b.chain_id() {
            return Err(ProtocolStateError::SameChain(node_a.chain_id().clone()).into());
        }

        let (end_a, end_b) = try_join!(
            connection_in_state(&node_a, connection_a, ConnectionState::Open),
            connection_in_state(&node_b, connection_b, ConnectionState::Open)
        )?;
        let counterparty_a = end_a
            .counterparty
            .ok_or_else(|| ProtocolStateError::MissingCounterparty(connection_a.to_string()))?;
        let counterparty_b = end_b
            .counterparty
            .ok_or_else(|| ProtocolStateError::MissingCounterparty(connection_b.to_string()))?;

        let client_a = ClientId::new(end_a.client_id);
        let client_b = ClientId::new(end_b.client_id);
        ensure_client_id("client id of connection A's counterparty", &client_b, &counterparty_a.client_id)?;
        ensure_client_id("client id of connection B's counterparty", &client_a, &counterparty_b.client_id)?;
        ensure_connection_id("connection A's counterparty", connection_b, &counterparty_a.connection_id)?;
        ensure_connection_id("connection B's counterparty", connection_a, &counterparty_b.connection_id)?;

        try_join!(
            ensure_client_tracks(&node_a, &client_a, &node_b),
            ensure_client_tracks(&node_b, &client_b, &node_a)
        )?;
        try_join!(
            assert_headers_match_consensus_state(&node_a, &client_a, &node_b),
            assert_headers_match_consensus_state(&node_b, &client_b, &node_a)
        )?;

        tracing::info!("Reattached to existing connections");
        Ok(Self::new(
            Endpoint::new(node_a, client_a, connection_a.clone()),
            Endpoint::new(node_b, client_b, connection_b.clone()),
        ))
    }

    /// Opens a channel initiated by `sender` from `src_port` to `dest_port`.
    ///
    /// # Errors
    /// Returns the first failing step's error.
    pub async fn create_channel(
        &self,
        sender: Side,
        src_port: &PortId,
        dest_port: &PortId,
        ordering: Order,
        version: &str,
    ) -> Result<ChannelPair, RelayerError> {
        let (src, dest) = self.get_ends(sender);
        ChannelHandshake::new(src.clone(), dest.clone(), ordering, version)
            .run(src_port, dest_port)
            .await
    }
}

fn ensure_client_id(
    what: &'static str,
    expected: &ClientId,
    actual: &str,
) -> Result<(), ProtocolStateError> {
    if expected.as_str() != actual {
        return Err(ProtocolStateError::ClientIdMismatch {
            what,
            expected: expected.clone(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

fn ensure_connection_id(
    what: &'static str,
    expected: &ConnectionId,
    actual: &str,
) -> Result<(), ProtocolStateError> {
    if expected.as_str() != actual {
        return Err(ProtocolStateError::ConnectionIdMismatch {
            what,
            expected: expected.clone(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

async fn query_client_state(
    host: &ChainClient,
    client_id: &ClientId,
) -> Result<ClientState, RelayerError> {
    match host.query_client_state(client_id).await {
        Err(ChainError::NotFound { .. }) => Err(ProtocolStateError::ClientNotFound {
            chain_id: host.chain_id().clone(),
            client_id: client_id.clone(),
        }
        .into()),
        other => Ok(other?),
    }
}

/// The client `client_id` on `host` must track the chain `tracked` is connected to.
async fn ensure_client_tracks(
    host: &ChainClient,
    client_id: &ClientId,
    tracked: &ChainClient,
) -> Result<(), RelayerError> {
    let client_state = query_client_state(host, client_id).await?;
    if client_state.chain_id != tracked.chain_id().as_str() {
        return Err(ProtocolStateError::ChainIdMismatch {
            client_id: client_id.clone(),
            expected: tracked.chain_id().clone(),
            actual: client_state.chain_id,
        }
        .into());
    }
    Ok(())
}

/// Compares the latest consensus state of `client_id` on `host` against the header
/// `tracked` produced at that height.
///
/// # Errors
/// Returns [`ProtocolStateError::ConsensusStateMismatch`] when the next validators hash or
/// the app hash differ.
pub async fn assert_headers_match_consensus_state(
    host: &ChainClient,
    client_id: &ClientId,
    tracked: &ChainClient,
) -> Result<(), RelayerError> {
    let client_state = query_client_state(host, client_id).await?;
    let height = light_client::latest_height(&client_state)
        .ok_or_else(|| ProtocolStateError::MissingLatestHeight(client_id.clone()))?;

    let (consensus_state, header) = try_join!(
        host.query_consensus_state(client_id, Some(height)),
        tracked.header(height.revision_height)
    )?;

    if consensus_state.next_validators_hash != header.next_validators_hash.as_bytes() {
        return Err(ProtocolStateError::ConsensusStateMismatch {
            client_id: client_id.clone(),
            field: "next_validators_hash",
        }
        .into());
    }
    let root = consensus_state
        .root
        .ok_or_else(|| ProtocolStateError::MissingConsensusRoot(client_id.clone()))?;
    if root.hash != header.app_hash.as_bytes() {
        return Err(ProtocolStateError::ConsensusStateMismatch {
            client_id: client_id.clone(),
            field: "root",
        }
        .into());
    }
    Ok(())
}

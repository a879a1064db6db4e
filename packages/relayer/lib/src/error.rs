//! Error types returned by the relayer.
//!
//! [`ChainError`] covers everything that can go wrong while talking to a single chain.
//! [`ProtocolStateError`] is returned when the on-chain IBC state does not allow the
//! requested step. [`RelayerError`] wraps both for the link level operations.

use std::time::Duration;

use thiserror::Error;

use crate::{
    identifiers::{ChainId, ChannelId, ClientId, ConnectionId, PortId},
    state::{ChannelState, ConnectionState},
};

/// A failure while querying or submitting to one chain.
#[derive(Debug, Error)]
pub enum ChainError {
    /// The RPC transport or node returned an error.
    #[error("rpc error: {0}")]
    Rpc(String),
    /// The node refused the transaction before inclusion (`CheckTx` failure).
    #[error("transaction rejected with code {code}: {log}")]
    BroadcastRejected {
        /// The ABCI error code.
        code: u32,
        /// The raw log returned by the node.
        log: String,
    },
    /// The transaction was included in a block but its execution failed.
    #[error("transaction {tx_hash} failed with code {code}: {log}")]
    TxFailed {
        /// The transaction hash.
        tx_hash: String,
        /// The ABCI error code.
        code: u32,
        /// The raw log of the failed execution.
        log: String,
    },
    /// The transaction was not included within the configured timeout.
    #[error("transaction {tx_hash} not included after {timeout:?}")]
    TxTimeout {
        /// The transaction hash.
        tx_hash: String,
        /// How long we waited.
        timeout: Duration,
    },
    /// A condition we were polling for did not hold before the deadline.
    #[error("timed out after {timeout:?} waiting for {what}")]
    WaitTimeout {
        /// Description of the awaited condition.
        what: String,
        /// How long we waited.
        timeout: Duration,
    },
    /// An ABCI query returned a non-zero code.
    #[error("query {path} failed with code {code}: {log}")]
    Query {
        /// The queried path.
        path: String,
        /// The ABCI error code.
        code: u32,
        /// The raw log.
        log: String,
    },
    /// A store entry that must exist was empty.
    #[error("no value stored under {path}")]
    NotFound {
        /// The store key.
        path: String,
    },
    /// Data returned by the chain could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
    /// A transaction did not emit the event attribute we need.
    #[error("missing attribute `{attribute}` in `{kind}` event")]
    MissingEvent {
        /// The event type.
        kind: String,
        /// The attribute key.
        attribute: String,
    },
    /// A proven query came back without proof operations.
    #[error("query of {path} returned no proof")]
    MissingProof {
        /// The store key.
        path: String,
    },
    /// The number of proofs does not match the number of messages.
    #[error("got {proofs} proofs for {items} messages")]
    ProofCountMismatch {
        /// Number of messages.
        items: usize,
        /// Number of proofs.
        proofs: usize,
    },
    /// A height could not be parsed or is out of range.
    #[error("invalid height: {0}")]
    InvalidHeight(String),
}

impl From<prost::DecodeError> for ChainError {
    fn from(err: prost::DecodeError) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<tendermint_rpc::Error> for ChainError {
    fn from(err: tendermint_rpc::Error) -> Self {
        Self::Rpc(err.to_string())
    }
}

impl From<tendermint::Error> for ChainError {
    fn from(err: tendermint::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

/// The on-chain IBC state does not allow the requested operation.
#[derive(Debug, Error)]
#[allow(clippy::module_name_repetitions)]
pub enum ProtocolStateError {
    /// Both ends of a link point at the same chain.
    #[error("cannot link chain {0} to itself")]
    SameChain(ChainId),
    /// The client does not exist on the chain.
    #[error("client {client_id} not found on {chain_id}")]
    ClientNotFound {
        /// The chain queried.
        chain_id: ChainId,
        /// The missing client.
        client_id: ClientId,
    },
    /// The connection does not exist on the chain.
    #[error("connection {connection_id} not found on {chain_id}")]
    ConnectionNotFound {
        /// The chain queried.
        chain_id: ChainId,
        /// The missing connection.
        connection_id: ConnectionId,
    },
    /// The channel does not exist on the chain.
    #[error("channel {port_id}/{channel_id} not found on {chain_id}")]
    ChannelNotFound {
        /// The chain queried.
        chain_id: ChainId,
        /// The channel port.
        port_id: PortId,
        /// The missing channel.
        channel_id: ChannelId,
    },
    /// A connection or channel end has no counterparty set.
    #[error("{0} has no counterparty")]
    MissingCounterparty(String),
    /// A connection is not in the state the handshake step requires.
    #[error("connection {connection_id} on {chain_id} is {actual}, expected {expected}")]
    ConnectionState {
        /// The chain holding the connection.
        chain_id: ChainId,
        /// The connection.
        connection_id: ConnectionId,
        /// The required state.
        expected: ConnectionState,
        /// The state found on chain.
        actual: ConnectionState,
    },
    /// A channel is not in the state the handshake step requires.
    #[error("channel {port_id}/{channel_id} on {chain_id} is {actual}, expected {expected}")]
    ChannelState {
        /// The chain holding the channel.
        chain_id: ChainId,
        /// The channel port.
        port_id: PortId,
        /// The channel.
        channel_id: ChannelId,
        /// The required state.
        expected: ChannelState,
        /// The state found on chain.
        actual: ChannelState,
    },
    /// The two connections do not reference each other's clients.
    #[error("{what} mismatch: expected {expected}, found {actual}")]
    ClientIdMismatch {
        /// Which reference mismatched.
        what: &'static str,
        /// The client we expected.
        expected: ClientId,
        /// The client found on chain.
        actual: String,
    },
    /// The two connections are not each other's counterparty.
    #[error("{what} mismatch: expected {expected}, found {actual}")]
    ConnectionIdMismatch {
        /// Which reference mismatched.
        what: &'static str,
        /// The connection we expected.
        expected: ConnectionId,
        /// The connection found on chain.
        actual: String,
    },
    /// A light client tracks a different chain than the one it is linked to.
    #[error("client {client_id} tracks chain {actual}, expected {expected}")]
    ChainIdMismatch {
        /// The client.
        client_id: ClientId,
        /// The chain id of the counterparty node.
        expected: ChainId,
        /// The chain id stored in the client state.
        actual: String,
    },
    /// A consensus state does not match the counterparty header at the same height.
    #[error("consensus state of {client_id} does not match the counterparty header: {field} differs")]
    ConsensusStateMismatch {
        /// The client.
        client_id: ClientId,
        /// The mismatched field.
        field: &'static str,
    },
    /// A consensus state carries no commitment root.
    #[error("consensus state of {0} has no commitment root")]
    MissingConsensusRoot(ClientId),
    /// A client state carries no latest height.
    #[error("client state of {0} has no latest height")]
    MissingLatestHeight(ClientId),
}

/// Any error surfaced by link operations.
#[derive(Debug, Error)]
#[allow(clippy::module_name_repetitions)]
pub enum RelayerError {
    /// A chain query or transaction failed.
    #[error(transparent)]
    Chain(#[from] ChainError),
    /// The on-chain state does not allow the operation.
    #[error(transparent)]
    ProtocolState(#[from] ProtocolStateError),
    /// A configuration value could not be parsed.
    #[error("config error: {0}")]
    Config(String),
}

//! Access to a single Tendermint chain.
//!
//! [`ChainRpc`] is the raw capability: node queries plus signed transaction submission.
//! [`ChainClient`] builds the IBC specific queries, proofs, headers and messages on top.

use ibc_proto::google::protobuf::Any;
use tendermint::{block::signed_header::SignedHeader, validator::Set as ValidatorSet, Time};

use crate::{error::ChainError, identifiers::ChainId};

mod client;
mod handshake;
pub mod light_client;
mod packets;
pub mod paths;
mod proofs;
mod rpc;

pub use client::ChainClient;
pub use handshake::{ChannelHandshakeProof, ConnectionHandshakeProof};
pub use proofs::ProvenQuery;
pub use rpc::{TendermintRpc, TxSigner};

pub use crate::events::{Event, EventAttribute};

/// The latest block as reported by `/status`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainStatus {
    /// The network name.
    pub chain_id: ChainId,
    /// The latest committed height.
    pub height: u64,
    /// The time of the latest committed block.
    pub time: Time,
}

/// A transaction found by `/tx_search`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxResult {
    /// Hex encoded transaction hash.
    pub hash: String,
    /// The height of the including block.
    pub height: u64,
    /// The execution result code, 0 on success.
    pub code: u32,
    /// The emitted events.
    pub events: Vec<Event>,
}

/// One page of `/tx_search` results.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxSearchPage {
    /// The transactions on this page.
    pub txs: Vec<TxResult>,
    /// The total number of matches across all pages.
    pub total_count: u32,
}

/// One page of `/block_search` results.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockSearchPage {
    /// The heights of the matching blocks on this page.
    pub heights: Vec<u64>,
    /// The total number of matches across all pages.
    pub total_count: u32,
}

/// The events of one block from `/block_results`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockResults {
    /// The block height.
    pub height: u64,
    /// Events of each transaction in the block.
    pub tx_events: Vec<Vec<Event>>,
    /// Events emitted outside of transactions (begin, end and finalize block).
    pub block_events: Vec<Event>,
}

/// A single Merkle proof operation as returned by `/abci_query`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProofOp {
    /// The operation type, e.g. `ics23:iavl`.
    pub kind: String,
    /// The key proven by this operation.
    pub key: Vec<u8>,
    /// The encoded ICS23 commitment proof.
    pub data: Vec<u8>,
}

/// The response to an `/abci_query`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AbciQuery {
    /// The ABCI result code, 0 on success.
    pub code: u32,
    /// The raw log.
    pub log: String,
    /// The stored value, empty when the key is absent.
    pub value: Vec<u8>,
    /// The proof operations when the query asked for a proof.
    pub proof_ops: Vec<ProofOp>,
    /// The height the query was answered at.
    pub height: u64,
}

/// A transaction included in a block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOutcome {
    /// The height of the including block.
    pub height: u64,
    /// Hex encoded transaction hash.
    pub tx_hash: String,
    /// The emitted events.
    pub events: Vec<Event>,
}

/// The chain capability consumed by [`ChainClient`].
///
/// Implementations never retry; every failure is reported as a [`ChainError`].
#[async_trait::async_trait]
pub trait ChainRpc: Send + Sync {
    /// The chain id and latest block.
    async fn status(&self) -> Result<ChainStatus, ChainError>;

    /// The signed header at `height`, or the latest one.
    async fn signed_header(&self, height: Option<u64>) -> Result<SignedHeader, ChainError>;

    /// The complete validator set at `height`, with the proposer of that block.
    async fn validators(&self, height: u64) -> Result<ValidatorSet, ChainError>;

    /// One page of transactions matching a Tendermint event query, oldest first.
    async fn tx_search(
        &self,
        query: &str,
        page: u32,
        per_page: u8,
    ) -> Result<TxSearchPage, ChainError>;

    /// One page of blocks matching a Tendermint event query, oldest first.
    async fn block_search(
        &self,
        query: &str,
        page: u32,
        per_page: u8,
    ) -> Result<BlockSearchPage, ChainError>;

    /// All events of the block at `height`.
    async fn block_results(&self, height: u64) -> Result<BlockResults, ChainError>;

    /// A raw ABCI query.
    async fn abci_query(
        &self,
        path: &str,
        data: Vec<u8>,
        height: Option<u64>,
        prove: bool,
    ) -> Result<AbciQuery, ChainError>;

    /// Signs the messages into one transaction, broadcasts it and waits for inclusion.
    ///
    /// A transaction rejected by `CheckTx` or failing in `DeliverTx` is an error.
    async fn broadcast_tx(&self, messages: Vec<Any>) -> Result<TxOutcome, ChainError>;
}

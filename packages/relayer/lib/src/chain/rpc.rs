//! [`ChainRpc`] over a Tendermint RPC node.

use std::{str::FromStr, sync::Arc};

use futures::try_join;
use ibc_proto::google::protobuf::Any;
use tendermint::{
    abci, block::signed_header::SignedHeader, block::Height as TmHeight,
    validator::Set as ValidatorSet,
};
use tendermint_rpc::{query::Query, Client, HttpClient, Order, Paging};

use super::{
    AbciQuery, BlockResults, BlockSearchPage, ChainRpc, ChainStatus, Event, ProofOp, TxOutcome,
    TxResult, TxSearchPage,
};
use crate::{config::BroadcastConfig, error::ChainError, utils::poll_until};

/// Produces signed transaction bytes. Key management lives outside the relayer.
#[async_trait::async_trait]
pub trait TxSigner: Send + Sync {
    /// Wraps the messages into a transaction body, signs it and returns the encoded `TxRaw`.
    async fn sign_tx(&self, messages: Vec<Any>) -> Result<Vec<u8>, ChainError>;
}

/// A [`ChainRpc`] backed by a Tendermint HTTP client and an external signer.
#[derive(Clone)]
pub struct TendermintRpc {
    client: HttpClient,
    signer: Arc<dyn TxSigner>,
    broadcast: BroadcastConfig,
}

impl TendermintRpc {
    /// Create a new [`Self`] instance.
    #[must_use]
    pub fn new(client: HttpClient, signer: Arc<dyn TxSigner>, broadcast: BroadcastConfig) -> Self {
        Self {
            client,
            signer,
            broadcast,
        }
    }

    /// Get the HTTP client for tendermint.
    #[must_use]
    pub const fn client(&self) -> &HttpClient {
        &self.client
    }
}

fn tm_height(height: u64) -> Result<TmHeight, ChainError> {
    TmHeight::try_from(height).map_err(|e| ChainError::InvalidHeight(e.to_string()))
}

fn parse_query(query: &str) -> Result<Query, ChainError> {
    Query::from_str(query).map_err(|e| ChainError::Rpc(format!("invalid query `{query}`: {e}")))
}

/// Whether a `/tx` error only means the transaction is not indexed yet.
fn is_tx_not_found(message: &str) -> bool {
    message.contains("not found")
}

fn convert_event(event: abci::Event) -> Event {
    Event::new(
        event.kind,
        event.attributes.iter().filter_map(|attr| {
            Some((
                attr.key_str().ok()?.to_string(),
                attr.value_str().ok()?.to_string(),
            ))
        }),
    )
}

fn convert_events(events: Vec<abci::Event>) -> Vec<Event> {
    events.into_iter().map(convert_event).collect()
}

#[async_trait::async_trait]
impl ChainRpc for TendermintRpc {
    async fn status(&self) -> Result<ChainStatus, ChainError> {
        let status = self.client.status().await?;
        Ok(ChainStatus {
            chain_id: status.node_info.network.as_str().into(),
            height: status.sync_info.latest_block_height.value(),
            time: status.sync_info.latest_block_time,
        })
    }

    async fn signed_header(&self, height: Option<u64>) -> Result<SignedHeader, ChainError> {
        let commit = match height {
            Some(h) => self.client.commit(tm_height(h)?).await?,
            None => self.client.latest_commit().await?,
        };
        Ok(commit.signed_header)
    }

    async fn validators(&self, height: u64) -> Result<ValidatorSet, ChainError> {
        let height = tm_height(height)?;
        let (commit, response) = try_join!(
            self.client.commit(height),
            self.client.validators(height, Paging::All)
        )?;
        let proposer_address = commit.signed_header.header.proposer_address;
        let proposer = response
            .validators
            .iter()
            .find(|validator| validator.address == proposer_address)
            .cloned();
        Ok(ValidatorSet::new(response.validators, proposer))
    }

    async fn tx_search(
        &self,
        query: &str,
        page: u32,
        per_page: u8,
    ) -> Result<TxSearchPage, ChainError> {
        let response = self
            .client
            .tx_search(parse_query(query)?, false, page, per_page, Order::Ascending)
            .await?;
        Ok(TxSearchPage {
            txs: response
                .txs
                .into_iter()
                .map(|tx| TxResult {
                    hash: tx.hash.to_string(),
                    height: tx.height.value(),
                    code: tx.tx_result.code.value(),
                    events: convert_events(tx.tx_result.events),
                })
                .collect(),
            total_count: response.total_count,
        })
    }

    async fn block_search(
        &self,
        query: &str,
        page: u32,
        per_page: u8,
    ) -> Result<BlockSearchPage, ChainError> {
        let response = self
            .client
            .block_search(parse_query(query)?, page, per_page, Order::Ascending)
            .await?;
        Ok(BlockSearchPage {
            heights: response
                .blocks
                .iter()
                .map(|block| block.block.header.height.value())
                .collect(),
            total_count: response.total_count,
        })
    }

    async fn block_results(&self, height: u64) -> Result<BlockResults, ChainError> {
        let response = self.client.block_results(tm_height(height)?).await?;
        Ok(BlockResults {
            height: response.height.value(),
            tx_events: response
                .txs_results
                .unwrap_or_default()
                .into_iter()
                .map(|tx| convert_events(tx.events))
                .collect(),
            block_events: response
                .begin_block_events
                .unwrap_or_default()
                .into_iter()
                .chain(response.end_block_events.unwrap_or_default())
                .chain(response.finalize_block_events)
                .map(convert_event)
                .collect(),
        })
    }

    async fn abci_query(
        &self,
        path: &str,
        data: Vec<u8>,
        height: Option<u64>,
        prove: bool,
    ) -> Result<AbciQuery, ChainError> {
        let height = height.map(tm_height).transpose()?;
        let response = self
            .client
            .abci_query(Some(path.to_string()), data, height, prove)
            .await?;
        Ok(AbciQuery {
            code: response.code.value(),
            log: response.log,
            value: response.value,
            proof_ops: response
                .proof
                .map(|proof| {
                    proof
                        .ops
                        .into_iter()
                        .map(|op| ProofOp {
                            kind: op.field_type,
                            key: op.key,
                            data: op.data,
                        })
                        .collect()
                })
                .unwrap_or_default(),
            height: response.height.value(),
        })
    }

    #[tracing::instrument(skip_all, fields(messages = messages.len()))]
    async fn broadcast_tx(&self, messages: Vec<Any>) -> Result<TxOutcome, ChainError> {
        let tx_bytes = self.signer.sign_tx(messages).await?;
        let response = self.client.broadcast_tx_sync(tx_bytes).await?;
        if response.code.is_err() {
            return Err(ChainError::BroadcastRejected {
                code: response.code.value(),
                log: response.log,
            });
        }

        let hash = response.hash;
        tracing::debug!(tx_hash = %hash, "Transaction accepted, waiting for inclusion");

        let client = &self.client;
        let tx = poll_until(
            "transaction inclusion",
            self.broadcast.timeout,
            self.broadcast.poll_interval,
            move || async move {
                match client.tx(hash, false).await {
                    Ok(tx) => Ok(Some(tx)),
                    Err(err) if is_tx_not_found(&err.to_string()) => Ok(None),
                    Err(err) => Err(err.into()),
                }
            },
        )
        .await
        .map_err(|err| match err {
            ChainError::WaitTimeout { timeout, .. } => ChainError::TxTimeout {
                tx_hash: hash.to_string(),
                timeout,
            },
            err => err,
        })?;

        if tx.tx_result.code.is_err() {
            return Err(ChainError::TxFailed {
                tx_hash: hash.to_string(),
                code: tx.tx_result.code.value(),
                log: tx.tx_result.log,
            });
        }

        Ok(TxOutcome {
            height: tx.height.value(),
            tx_hash: hash.to_string(),
            events: convert_events(tx.tx_result.events),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_missing_transactions_are_retried() {
        assert!(is_tx_not_found(
            "response error: Internal error: tx (7C0F) not found (code: -32603)"
        ));
        assert!(!is_tx_not_found("http error: connection refused"));
        assert!(!is_tx_not_found("serde parse error: missing field `height`"));
    }
}

//! [`MockChain`], a single process Tendermint chain implementing [`ChainRpc`].

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use cosmos_sdk_proto::cosmos::staking::v1beta1::{QueryParamsRequest, QueryParamsResponse};
use ibc_proto::{
    google::protobuf::Any,
    ibc::core::channel::v1::{
        QueryUnreceivedAcksRequest, QueryUnreceivedAcksResponse, QueryUnreceivedPacketsRequest,
        QueryUnreceivedPacketsResponse,
    },
};
use ics23::{commitment_proof::Proof, CommitmentProof, ExistenceProof, NonExistenceProof};
use prost::Message;
use sha2::{Digest, Sha256};
use tendermint::{
    block::signed_header::SignedHeader, validator::Set as ValidatorSet, AppHash, Time,
};
use tendermint_testgen::{
    light_block::TmLightBlock, Generator, Header as TestgenHeader,
    LightBlock as TestgenLightBlock, Validator as TestgenValidator,
};

use super::ibc::{Emitted, IbcState, TxContext};
use crate::{
    chain::{
        paths, AbciQuery, BlockResults, BlockSearchPage, ChainClient, ChainRpc, ChainStatus,
        Event, ProofOp, TxOutcome, TxResult, TxSearchPage,
    },
    config::{BroadcastConfig, ChainClientConfig},
    error::ChainError,
    identifiers::{ChainId, ChannelId, PortId},
};

/// Unix time of block 0.
const GENESIS_SECS: i64 = 1_700_000_000;
/// Seconds between two blocks.
pub const BLOCK_SECS: i64 = 5;
/// The staking unbonding period reported by the chain.
pub const UNBONDING_SECS: i64 = 21 * 24 * 60 * 60;

fn default_validators() -> Vec<TestgenValidator> {
    vec![
        TestgenValidator::new("1").voting_power(50),
        TestgenValidator::new("2").voting_power(50),
    ]
}

fn block_time_secs(height: u64) -> i64 {
    i64::try_from(height)
        .unwrap_or(i64::MAX)
        .saturating_mul(BLOCK_SECS)
        .saturating_add(GENESIS_SECS)
}

fn query_failure(code: u32, log: impl Into<String>) -> AbciQuery {
    AbciQuery {
        code,
        log: log.into(),
        ..AbciQuery::default()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Condition {
    Equals(String, String),
    AtLeast(String, u64),
    AtMost(String, u64),
}

/// Parses the `key='value' AND key>=N AND key<=N` subset of the Tendermint query language.
fn parse_conditions(query: &str) -> Result<Vec<Condition>, ChainError> {
    query
        .split(" AND ")
        .map(|part| {
            let part = part.trim();
            let number = |key: &str, value: &str| {
                value
                    .trim()
                    .parse()
                    .map(|n| (key.trim().to_string(), n))
                    .map_err(|_| ChainError::Rpc(format!("invalid number in `{part}`")))
            };
            if let Some((key, value)) = part.split_once(">=") {
                let (key, n) = number(key, value)?;
                Ok(Condition::AtLeast(key, n))
            } else if let Some((key, value)) = part.split_once("<=") {
                let (key, n) = number(key, value)?;
                Ok(Condition::AtMost(key, n))
            } else if let Some((key, value)) = part.split_once('=') {
                Ok(Condition::Equals(
                    key.trim().to_string(),
                    value.trim().trim_matches('\'').to_string(),
                ))
            } else {
                Err(ChainError::Rpc(format!("unsupported query condition `{part}`")))
            }
        })
        .collect()
}

/// Whether a block or transaction at `height` with `events` satisfies every condition.
/// `height_key` is `tx.height` or `block.height`.
fn matches(conditions: &[Condition], height_key: &str, height: u64, events: &[Event]) -> bool {
    let has_attribute = |key: &str, value: &str| {
        key.split_once('.').is_some_and(|(kind, attribute)| {
            events
                .iter()
                .any(|event| event.kind == kind && event.attribute(attribute) == Some(value))
        })
    };
    conditions.iter().all(|condition| match condition {
        Condition::Equals(key, value) if key == height_key => value.parse() == Ok(height),
        Condition::Equals(key, value) => has_attribute(key, value),
        Condition::AtLeast(key, min) => key == height_key && height >= *min,
        Condition::AtMost(key, max) => key == height_key && height <= *max,
    })
}

fn page_bounds(total: usize, page: u32, per_page: u8) -> (usize, usize) {
    let per_page = usize::from(per_page.max(1));
    let start = (page.max(1) as usize - 1).saturating_mul(per_page).min(total);
    (start, (start + per_page).min(total))
}

fn proof_ops(key: &str, value: &[u8], root: &[u8]) -> Vec<ProofOp> {
    let store_proof = if value.is_empty() {
        Proof::Nonexist(NonExistenceProof {
            key: key.as_bytes().to_vec(),
            left: None,
            right: None,
        })
    } else {
        Proof::Exist(ExistenceProof {
            key: key.as_bytes().to_vec(),
            value: value.to_vec(),
            leaf: None,
            path: vec![],
        })
    };
    let root_proof = Proof::Exist(ExistenceProof {
        key: paths::IBC_KEY_PREFIX.to_vec(),
        value: root.to_vec(),
        leaf: None,
        path: vec![],
    });
    vec![
        ProofOp {
            kind: "ics23:iavl".to_string(),
            key: key.as_bytes().to_vec(),
            data: CommitmentProof {
                proof: Some(store_proof),
            }
            .encode_to_vec(),
        },
        ProofOp {
            kind: "ics23:simple".to_string(),
            key: paths::IBC_KEY_PREFIX.to_vec(),
            data: CommitmentProof {
                proof: Some(root_proof),
            }
            .encode_to_vec(),
        },
    ]
}

#[derive(Debug)]
struct MockState {
    chain_id: ChainId,
    height: u64,
    ibc: IbcState,
    snapshots: BTreeMap<u64, BTreeMap<String, Vec<u8>>>,
    blocks: BTreeMap<u64, TmLightBlock>,
    txs: Vec<TxResult>,
    block_events: BTreeMap<u64, Vec<Event>>,
    broadcast_failure: Option<String>,
    end_block_sends: bool,
    validator_queries: Vec<u64>,
}

impl MockState {
    fn new(chain_id: ChainId) -> Self {
        let mut state = Self {
            chain_id,
            height: 0,
            ibc: IbcState::default(),
            snapshots: BTreeMap::new(),
            blocks: BTreeMap::new(),
            txs: Vec::new(),
            block_events: BTreeMap::new(),
            broadcast_failure: None,
            end_block_sends: false,
            validator_queries: Vec::new(),
        };
        state.seal_block();
        state
    }

    fn seal_block(&mut self) -> u64 {
        self.height += 1;
        self.snapshots.insert(self.height, self.ibc.store.clone());
        self.height
    }

    fn ensure_committed(&self, height: u64) -> Result<(), ChainError> {
        if height == 0 || height > self.height {
            return Err(ChainError::Rpc(format!(
                "height {height} is not available, latest height is {}",
                self.height
            )));
        }
        Ok(())
    }

    fn app_hash(&self, height: u64) -> Vec<u8> {
        Sha256::digest(format!("{}/{height}", self.chain_id)).to_vec()
    }

    fn light_block(&mut self, height: u64) -> Result<TmLightBlock, ChainError> {
        if let Some(block) = self.blocks.get(&height) {
            return Ok(block.clone());
        }
        let validators = default_validators();
        let app_hash = AppHash::try_from(self.app_hash(height))?;
        let time = Time::from_unix_timestamp(block_time_secs(height), 0)?;
        let block = TestgenLightBlock::new_default_with_header(
            TestgenHeader::new(&validators)
                .app_hash(app_hash)
                .height(height)
                .chain_id(self.chain_id.as_str())
                .next_validators(&validators)
                .time(time),
        )
        .validators(&validators)
        .next_validators(&validators)
        .generate()
        .map_err(|e| ChainError::Rpc(format!("failed to generate block {height}: {e}")))?;
        self.blocks.insert(height, block.clone());
        Ok(block)
    }

    fn store_query(&self, data: &[u8], height: Option<u64>, prove: bool) -> AbciQuery {
        let height = height.unwrap_or(self.height);
        let Some(snapshot) = self.snapshots.get(&height) else {
            return query_failure(
                26,
                format!("height {height} is not available, latest height is {}", self.height),
            );
        };
        let key = String::from_utf8_lossy(data).into_owned();
        let value = snapshot.get(&key).cloned().unwrap_or_default();
        let proof_ops = if prove {
            proof_ops(&key, &value, &self.app_hash(height + 1))
        } else {
            Vec::new()
        };
        AbciQuery {
            code: 0,
            log: String::new(),
            value,
            proof_ops,
            height,
        }
    }

    fn grpc_query(&self, path: &str, data: &[u8]) -> Result<AbciQuery, ChainError> {
        let value = match path {
            paths::UNRECEIVED_PACKETS_PATH => {
                let request = QueryUnreceivedPacketsRequest::decode(data)?;
                let sequences = self.ibc.unreceived_packets(
                    &PortId::new(request.port_id),
                    &ChannelId::new(request.channel_id),
                    request.packet_commitment_sequences,
                );
                match sequences {
                    Ok(sequences) => QueryUnreceivedPacketsResponse {
                        sequences,
                        height: None,
                    }
                    .encode_to_vec(),
                    Err(log) => return Ok(query_failure(22, log)),
                }
            }
            paths::UNRECEIVED_ACKS_PATH => {
                let request = QueryUnreceivedAcksRequest::decode(data)?;
                QueryUnreceivedAcksResponse {
                    sequences: self.ibc.unreceived_acks(
                        &PortId::new(request.port_id),
                        &ChannelId::new(request.channel_id),
                        request.packet_ack_sequences,
                    ),
                    height: None,
                }
                .encode_to_vec()
            }
            paths::STAKING_PARAMS_PATH => {
                QueryParamsRequest::decode(data)?;
                let mut response = QueryParamsResponse::default();
                let params = response.params.get_or_insert_with(Default::default);
                params.unbonding_time.get_or_insert_with(Default::default).seconds = UNBONDING_SECS;
                response.encode_to_vec()
            }
            other => return Ok(query_failure(6, format!("unknown query path {other}"))),
        };
        Ok(AbciQuery {
            value,
            height: self.height,
            ..AbciQuery::default()
        })
    }

    fn broadcast(&mut self, messages: &[Any]) -> Result<TxOutcome, ChainError> {
        if let Some(log) = &self.broadcast_failure {
            return Err(ChainError::BroadcastRejected {
                code: 11,
                log: log.clone(),
            });
        }

        let tx_hash = hex::encode_upper(Sha256::digest(format!(
            "{}/{}",
            self.chain_id,
            self.txs.len()
        )));
        let ctx = TxContext {
            height: self.height + 1,
            revision_number: self.chain_id.revision_number(),
            time_nanos: u64::try_from(block_time_secs(self.height + 1)).unwrap_or_default()
                * 1_000_000_000,
            end_block_sends: self.end_block_sends,
        };
        let mut ibc = self.ibc.clone();
        let mut emitted = Emitted::default();
        let result = messages
            .iter()
            .try_for_each(|msg| ibc.deliver(&ctx, msg, &mut emitted));

        if let Err(log) = result {
            let height = self.seal_block();
            self.txs.push(TxResult {
                hash: tx_hash.clone(),
                height,
                code: 1,
                events: Vec::new(),
            });
            tracing::debug!(chain_id = %self.chain_id, height, %log, "Transaction failed");
            return Err(ChainError::TxFailed {
                tx_hash,
                code: 1,
                log,
            });
        }

        self.ibc = ibc;
        let height = self.seal_block();
        if !emitted.block_events.is_empty() {
            self.block_events
                .entry(height)
                .or_default()
                .extend(emitted.block_events);
        }
        self.txs.push(TxResult {
            hash: tx_hash.clone(),
            height,
            code: 0,
            events: emitted.tx_events.clone(),
        });
        Ok(TxOutcome {
            height,
            tx_hash,
            events: emitted.tx_events,
        })
    }
}

/// An in-memory chain with a minimal IBC module and an ICS20 bank.
///
/// Every call to `/status` commits an empty block and every broadcast transaction is
/// committed in a block of its own, so heights advance as fast as the relayer polls.
/// State is snapshotted per height; the app hash of block `h + 1` commits to the
/// state after block `h`. Headers are signed by two fixed validators.
///
/// Cloning shares the chain.
#[derive(Clone, Debug)]
pub struct MockChain {
    state: Arc<Mutex<MockState>>,
}

impl MockChain {
    /// Creates a chain at height 1.
    #[must_use]
    pub fn new(chain_id: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::new(ChainId::new(chain_id)))),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MockState>, ChainError> {
        self.state
            .lock()
            .map_err(|_| ChainError::Rpc("mock chain state poisoned".to_string()))
    }

    /// A [`ChainClient`] for this chain signing as `sender`, polling every millisecond.
    #[must_use]
    pub fn client(&self, sender: impl Into<String>) -> ChainClient {
        let config = ChainClientConfig {
            estimated_block_time: Duration::from_millis(1),
            estimated_indexer_time: Duration::from_millis(1),
            block_wait_timeout: Duration::from_secs(5),
            broadcast: BroadcastConfig {
                poll_interval: Duration::from_millis(1),
                timeout: Duration::from_secs(5),
            },
        };
        ChainClient::new(
            Arc::new(self.clone()),
            self.chain_id(),
            sender.into(),
            config,
        )
    }

    /// The chain id.
    #[must_use]
    pub fn chain_id(&self) -> ChainId {
        self.lock()
            .map(|state| state.chain_id.clone())
            .unwrap_or_else(|_| ChainId::new(""))
    }

    /// The latest committed height.
    #[must_use]
    pub fn height(&self) -> u64 {
        self.lock().map_or(0, |state| state.height)
    }

    /// Commits `count` empty blocks.
    pub fn advance_blocks(&self, count: u64) {
        if let Ok(mut state) = self.lock() {
            for _ in 0..count {
                state.seal_block();
            }
        }
    }

    /// The ICS20 balance of `address` in `denom`.
    #[must_use]
    pub fn balance(&self, address: &str, denom: &str) -> u128 {
        self.lock().map_or(0, |state| {
            state
                .ibc
                .balances
                .get(&(address.to_string(), denom.to_string()))
                .copied()
                .unwrap_or_default()
        })
    }

    /// Makes every broadcast fail with `CheckTx` rejection `log`, or stops doing so.
    pub fn set_broadcast_failure(&self, log: Option<&str>) {
        if let Ok(mut state) = self.lock() {
            state.broadcast_failure = log.map(ToString::to_string);
        }
    }

    /// Emits `send_packet` events as block events instead of transaction events.
    pub fn set_end_block_sends(&self, enabled: bool) {
        if let Ok(mut state) = self.lock() {
            state.end_block_sends = enabled;
        }
    }

    /// Heights passed to `/validators`, in call order.
    #[must_use]
    pub fn validator_queries(&self) -> Vec<u64> {
        self.lock()
            .map(|state| state.validator_queries.clone())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl ChainRpc for MockChain {
    async fn status(&self) -> Result<ChainStatus, ChainError> {
        let mut state = self.lock()?;
        let height = state.seal_block();
        Ok(ChainStatus {
            chain_id: state.chain_id.clone(),
            height,
            time: Time::from_unix_timestamp(block_time_secs(height), 0)?,
        })
    }

    async fn signed_header(&self, height: Option<u64>) -> Result<SignedHeader, ChainError> {
        let mut state = self.lock()?;
        let height = height.unwrap_or(state.height);
        state.ensure_committed(height)?;
        Ok(state.light_block(height)?.signed_header)
    }

    async fn validators(&self, height: u64) -> Result<ValidatorSet, ChainError> {
        let mut state = self.lock()?;
        state.validator_queries.push(height);
        // The next validator set is known one block ahead.
        state.ensure_committed(height.saturating_sub(1).max(1))?;
        Ok(state.light_block(height)?.validators)
    }

    async fn tx_search(
        &self,
        query: &str,
        page: u32,
        per_page: u8,
    ) -> Result<TxSearchPage, ChainError> {
        let conditions = parse_conditions(query)?;
        let state = self.lock()?;
        let found: Vec<&TxResult> = state
            .txs
            .iter()
            .filter(|tx| tx.code == 0 && matches(&conditions, "tx.height", tx.height, &tx.events))
            .collect();
        let (start, end) = page_bounds(found.len(), page, per_page);
        Ok(TxSearchPage {
            txs: found[start..end].iter().map(|tx| (*tx).clone()).collect(),
            total_count: u32::try_from(found.len()).unwrap_or(u32::MAX),
        })
    }

    async fn block_search(
        &self,
        query: &str,
        page: u32,
        per_page: u8,
    ) -> Result<BlockSearchPage, ChainError> {
        let conditions = parse_conditions(query)?;
        let state = self.lock()?;
        let found: Vec<u64> = state
            .block_events
            .iter()
            .filter(|(height, events)| matches(&conditions, "block.height", **height, events))
            .map(|(height, _)| *height)
            .collect();
        let (start, end) = page_bounds(found.len(), page, per_page);
        Ok(BlockSearchPage {
            heights: found[start..end].to_vec(),
            total_count: u32::try_from(found.len()).unwrap_or(u32::MAX),
        })
    }

    async fn block_results(&self, height: u64) -> Result<BlockResults, ChainError> {
        let state = self.lock()?;
        state.ensure_committed(height)?;
        Ok(BlockResults {
            height,
            tx_events: state
                .txs
                .iter()
                .filter(|tx| tx.height == height)
                .map(|tx| tx.events.clone())
                .collect(),
            block_events: state.block_events.get(&height).cloned().unwrap_or_default(),
        })
    }

    async fn abci_query(
        &self,
        path: &str,
        data: Vec<u8>,
        height: Option<u64>,
        prove: bool,
    ) -> Result<AbciQuery, ChainError> {
        let state = self.lock()?;
        if path == paths::IBC_STORE_PATH {
            return Ok(state.store_query(&data, height, prove));
        }
        state.grpc_query(path, &data)
    }

    async fn broadcast_tx(&self, messages: Vec<Any>) -> Result<TxOutcome, ChainError> {
        self.lock()?.broadcast(&messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conditions_are_parsed() {
        let conditions = parse_conditions(
            "send_packet.packet_connection='connection-0' AND tx.height>=5 AND tx.height<=9",
        )
        .unwrap();
        assert_eq!(
            conditions,
            vec![
                Condition::Equals(
                    "send_packet.packet_connection".to_string(),
                    "connection-0".to_string()
                ),
                Condition::AtLeast("tx.height".to_string(), 5),
                Condition::AtMost("tx.height".to_string(), 9),
            ]
        );
        assert!(parse_conditions("tx.height>=five").is_err());
    }

    #[test]
    fn conditions_match_events_and_heights() {
        let events = vec![Event::new(
            "send_packet",
            [("packet_connection", "connection-0")],
        )];
        let conditions =
            parse_conditions("send_packet.packet_connection='connection-0' AND tx.height>=5")
                .unwrap();
        assert!(matches(&conditions, "tx.height", 5, &events));
        assert!(!matches(&conditions, "tx.height", 4, &events));
        assert!(!matches(&conditions, "tx.height", 5, &[]));
    }

    #[test]
    fn pages_are_clamped() {
        assert_eq!(page_bounds(5, 1, 2), (0, 2));
        assert_eq!(page_bounds(5, 3, 2), (4, 5));
        assert_eq!(page_bounds(5, 4, 2), (5, 5));
    }

    #[tokio::test]
    async fn status_commits_blocks() {
        let chain = MockChain::new("chain-a-1");
        assert_eq!(chain.height(), 1);
        let first = chain.status().await.unwrap();
        let second = chain.status().await.unwrap();
        assert_eq!(second.height, first.height + 1);
        assert!(second.time > first.time);

        let header = chain.signed_header(Some(first.height)).await.unwrap();
        assert_eq!(header.header.height.value(), first.height);
        assert_eq!(header.header.chain_id.as_str(), "chain-a-1");
        assert!(chain.signed_header(Some(second.height + 1)).await.is_err());
    }

    #[tokio::test]
    async fn store_queries_read_snapshots() {
        let chain = MockChain::new("chain-a-1");
        let key = paths::IBC_STORE_PATH;
        let missing = chain
            .abci_query(key, b"clients/x/clientState".to_vec(), Some(1), true)
            .await
            .unwrap();
        assert_eq!(missing.code, 0);
        assert!(missing.value.is_empty());
        assert_eq!(missing.proof_ops.len(), 2);

        let future = chain
            .abci_query(key, b"clients/x/clientState".to_vec(), Some(100), false)
            .await
            .unwrap();
        assert_ne!(future.code, 0);
    }

    #[tokio::test]
    async fn broadcast_failure_is_a_rejection() {
        let chain = MockChain::new("chain-a-1");
        chain.set_broadcast_failure(Some("out of gas"));
        let err = chain.broadcast_tx(vec![]).await.unwrap_err();
        assert!(matches!(err, ChainError::BroadcastRejected { code: 11, .. }));
        assert_eq!(chain.height(), 1);
    }

    #[tokio::test]
    async fn failed_messages_leave_no_state() {
        let chain = MockChain::new("chain-a-1");
        let err = chain
            .broadcast_tx(vec![Any {
                type_url: "/unknown.Msg".to_string(),
                value: vec![],
            }])
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::TxFailed { code: 1, .. }));
        assert_eq!(chain.height(), 2);
    }
}

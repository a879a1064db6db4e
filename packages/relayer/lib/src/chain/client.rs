//! The IBC aware client for a single chain.

use std::{fmt, sync::Arc, time::Duration};

use cosmos_sdk_proto::cosmos::staking::v1beta1::{QueryParamsRequest, QueryParamsResponse};
use futures::try_join;
use futures_timer::Delay;
use ibc_proto::{
    google::protobuf::Any,
    ibc::{
        core::{
            channel::v1::{
                Channel, QueryUnreceivedAcksRequest, QueryUnreceivedAcksResponse,
                QueryUnreceivedPacketsRequest, QueryUnreceivedPacketsResponse,
            },
            client::v1::{MsgCreateClient, MsgUpdateClient},
            connection::v1::ConnectionEnd,
        },
        lightclients::tendermint::v1::{ClientState, ConsensusState, Header},
    },
};
use prost::Message;
use tendermint::{
    block::{signed_header::SignedHeader, Commit, Header as TmHeader},
    validator::Set as ValidatorSet,
    Time,
};

use super::{
    light_client::{self, CLIENT_STATE_TYPE_URL, CONSENSUS_STATE_TYPE_URL, HEADER_TYPE_URL},
    paths, AbciQuery, ChainRpc, ChainStatus, TxOutcome, TxResult,
};
use crate::{
    config::ChainClientConfig,
    error::ChainError,
    events::{self, find_attribute},
    height::Height,
    identifiers::{ChainId, ChannelId, ClientId, ConnectionId, PortId},
    utils::wait_for_condition,
};

/// Results requested per page when paginating searches.
const SEARCH_PAGE_SIZE: u8 = 100;

const MSG_CREATE_CLIENT_TYPE_URL: &str = "/ibc.core.client.v1.MsgCreateClient";
const MSG_UPDATE_CLIENT_TYPE_URL: &str = "/ibc.core.client.v1.MsgUpdateClient";

/// A signing client for one chain. Cheap to clone.
#[derive(Clone)]
pub struct ChainClient {
    rpc: Arc<dyn ChainRpc>,
    chain_id: ChainId,
    sender: String,
    config: ChainClientConfig,
}

impl fmt::Debug for ChainClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainClient")
            .field("chain_id", &self.chain_id)
            .field("sender", &self.sender)
            .finish_non_exhaustive()
    }
}

impl ChainClient {
    /// Creates a client for a chain whose id is already known.
    #[must_use]
    pub fn new(
        rpc: Arc<dyn ChainRpc>,
        chain_id: ChainId,
        sender: String,
        config: ChainClientConfig,
    ) -> Self {
        Self {
            rpc,
            chain_id,
            sender,
            config,
        }
    }

    /// Creates a client, reading the chain id from the node.
    ///
    /// # Errors
    /// Returns an error if the node status cannot be fetched.
    pub async fn connect(
        rpc: Arc<dyn ChainRpc>,
        sender: String,
        config: ChainClientConfig,
    ) -> Result<Self, ChainError> {
        let status = rpc.status().await?;
        tracing::info!(chain_id = %status.chain_id, height = status.height, "Connected to chain");
        Ok(Self::new(rpc, status.chain_id, sender, config))
    }

    /// The chain id.
    #[must_use]
    pub const fn chain_id(&self) -> &ChainId {
        &self.chain_id
    }

    /// The address signing this client's transactions.
    #[must_use]
    pub fn sender_address(&self) -> &str {
        &self.sender
    }

    /// The timing configuration.
    #[must_use]
    pub const fn config(&self) -> &ChainClientConfig {
        &self.config
    }

    /// The revision number of the chain, from the chain id suffix.
    #[must_use]
    pub fn revision_number(&self) -> u64 {
        self.chain_id.revision_number()
    }

    /// Turns a block height of this chain into an IBC [`Height`].
    #[must_use]
    pub fn revision_height(&self, height: u64) -> Height {
        Height::new(self.revision_number(), height)
    }

    /// The node status.
    ///
    /// # Errors
    /// Returns an error if the RPC call fails.
    pub async fn status(&self) -> Result<ChainStatus, ChainError> {
        self.rpc.status().await
    }

    /// The latest block height.
    ///
    /// # Errors
    /// Returns an error if the RPC call fails.
    pub async fn current_height(&self) -> Result<u64, ChainError> {
        Ok(self.rpc.status().await?.height)
    }

    /// The latest block height as an IBC [`Height`].
    ///
    /// # Errors
    /// Returns an error if the RPC call fails.
    pub async fn current_revision(&self) -> Result<Height, ChainError> {
        Ok(self.revision_height(self.current_height().await?))
    }

    /// The time of the latest signed header.
    ///
    /// # Errors
    /// Returns an error if the RPC call fails.
    pub async fn current_time(&self) -> Result<Time, ChainError> {
        Ok(self.latest_header().await?.time)
    }

    /// The height `blocks_in_future` blocks after the latest header.
    ///
    /// # Errors
    /// Returns an error if the RPC call fails.
    pub async fn timeout_height(&self, blocks_in_future: u64) -> Result<Height, ChainError> {
        let header = self.latest_header().await?;
        Ok(self.revision_height(header.height.value() + blocks_in_future))
    }

    /// Waits until the chain produced at least one more block.
    ///
    /// # Errors
    /// Returns an error if the node fails or no block arrives before `block_wait_timeout`.
    #[tracing::instrument(skip_all, fields(chain_id = %self.chain_id))]
    pub async fn wait_one_block(&self) -> Result<(), ChainError> {
        let start = self.current_height().await?;
        wait_for_condition(
            "next block",
            self.config.block_wait_timeout,
            self.config.estimated_block_time,
            move || async move { Ok(self.current_height().await? > start) },
        )
        .await?;
        tracing::trace!(start, "Chain advanced");
        Ok(())
    }

    /// Gives the tx indexer time to index the latest block.
    pub async fn wait_for_indexer(&self) {
        Delay::new(self.config.estimated_indexer_time).await;
    }

    /// The signed header at `height`, or the latest one.
    ///
    /// # Errors
    /// Returns an error if the RPC call fails.
    pub async fn get_signed_header(&self, height: Option<u64>) -> Result<SignedHeader, ChainError> {
        self.rpc.signed_header(height).await
    }

    /// The commit for the block at `height`, or the latest one.
    ///
    /// # Errors
    /// Returns an error if the RPC call fails.
    pub async fn get_commit(&self, height: Option<u64>) -> Result<Commit, ChainError> {
        Ok(self.get_signed_header(height).await?.commit)
    }

    /// The block header at `height`.
    ///
    /// # Errors
    /// Returns an error if the RPC call fails.
    pub async fn header(&self, height: u64) -> Result<TmHeader, ChainError> {
        Ok(self.get_signed_header(Some(height)).await?.header)
    }

    /// The latest block header.
    ///
    /// # Errors
    /// Returns an error if the RPC call fails.
    pub async fn latest_header(&self) -> Result<TmHeader, ChainError> {
        Ok(self.get_signed_header(None).await?.header)
    }

    /// The validator set at `height`.
    ///
    /// # Errors
    /// Returns an error if the RPC call fails, e.g. when the height was pruned.
    pub async fn validator_set(&self, height: u64) -> Result<ValidatorSet, ChainError> {
        self.rpc.validators(height).await
    }

    /// Builds an update header for a client of this chain that trusts `trusted_height`.
    ///
    /// The header carries the latest signed header, its validator set, and the validator
    /// set at `trusted_height + 1` as trusted validators.
    ///
    /// # Errors
    /// Returns an error if a header or validator set cannot be fetched.
    #[tracing::instrument(skip_all, fields(chain_id = %self.chain_id, %trusted_height))]
    pub async fn build_header(&self, trusted_height: Height) -> Result<Header, ChainError> {
        let signed_header = self.get_signed_header(None).await?;
        let height = signed_header.header.height.value();
        let (validator_set, trusted_validators) = try_join!(
            self.validator_set(height),
            self.validator_set(trusted_height.revision_height + 1)
        )?;
        tracing::debug!(height, "Built update header");

        Ok(light_client::build_tendermint_header(
            signed_header,
            validator_set,
            trusted_height,
            trusted_validators,
        ))
    }

    /// The unbonding period from the staking module parameters.
    ///
    /// # Errors
    /// Returns an error if the query fails or the parameters are missing.
    pub async fn unbonding_period(&self) -> Result<Duration, ChainError> {
        let response: QueryParamsResponse = self
            .query_grpc(paths::STAKING_PARAMS_PATH, &QueryParamsRequest {})
            .await?;
        let unbonding = response
            .params
            .and_then(|params| params.unbonding_time)
            .ok_or_else(|| ChainError::Decode("No unbonding time found".to_string()))?;
        Ok(light_client::from_proto_duration(
            unbonding.seconds,
            unbonding.nanos,
        ))
    }

    /// The client and consensus state for a new light client tracking this chain.
    ///
    /// The trusting period defaults to 2/3 of the unbonding period.
    ///
    /// # Errors
    /// Returns an error if the latest header or the staking parameters cannot be fetched.
    pub async fn build_create_client_args(
        &self,
        trusting_period: Option<Duration>,
    ) -> Result<(ClientState, ConsensusState), ChainError> {
        let (header, unbonding_period) = try_join!(self.latest_header(), self.unbonding_period())?;
        let trusting_period = trusting_period
            .unwrap_or_else(|| light_client::default_trusting_period(unbonding_period));

        let client_state = light_client::build_tendermint_client_state(
            self.chain_id.to_string(),
            self.revision_height(header.height.value()),
            trusting_period,
            unbonding_period,
        );
        let consensus_state = light_client::consensus_state_from_header(&header);
        Ok((client_state, consensus_state))
    }

    /// Creates a `07-tendermint` light client on this chain.
    ///
    /// # Errors
    /// Returns an error if the transaction fails or emits no client id.
    #[tracing::instrument(skip_all, fields(chain_id = %self.chain_id))]
    pub async fn create_light_client(
        &self,
        client_state: ClientState,
        consensus_state: ConsensusState,
    ) -> Result<ClientId, ChainError> {
        tracing::info!(
            "Creating client for {} at height: {}",
            client_state.chain_id,
            client_state
                .latest_height
                .as_ref()
                .map(Height::from)
                .unwrap_or_default()
        );
        let msg = MsgCreateClient {
            client_state: Some(light_client::to_any(CLIENT_STATE_TYPE_URL, &client_state)),
            consensus_state: Some(light_client::to_any(
                CONSENSUS_STATE_TYPE_URL,
                &consensus_state,
            )),
            signer: self.sender.clone(),
        };
        let outcome = self
            .submit(vec![light_client::to_any(MSG_CREATE_CLIENT_TYPE_URL, &msg)])
            .await?;
        let client_id = find_attribute(&outcome.events, events::CREATE_CLIENT, "client_id")?;
        Ok(client_id.into())
    }

    /// Submits an update header to a light client on this chain.
    ///
    /// # Errors
    /// Returns an error if the transaction fails.
    pub async fn update_light_client(
        &self,
        client_id: &ClientId,
        header: Header,
    ) -> Result<TxOutcome, ChainError> {
        let msg = MsgUpdateClient {
            client_id: client_id.to_string(),
            client_message: Some(light_client::to_any(HEADER_TYPE_URL, &header)),
            signer: self.sender.clone(),
        };
        self.submit(vec![light_client::to_any(MSG_UPDATE_CLIENT_TYPE_URL, &msg)])
            .await
    }

    /// Updates `client_id` on this chain to the latest header of `src`.
    ///
    /// Returns the height of the submitted header on `src`.
    ///
    /// # Errors
    /// Returns an error if the client cannot be queried, the header cannot be built or the
    /// update transaction fails.
    #[tracing::instrument(skip_all, fields(chain_id = %self.chain_id, %client_id, src = %src.chain_id))]
    pub async fn update_client_from(
        &self,
        client_id: &ClientId,
        src: &Self,
    ) -> Result<Height, ChainError> {
        let client_state = self.query_client_state(client_id).await?;
        let trusted_height = light_client::latest_height(&client_state).ok_or_else(|| {
            ChainError::Decode(format!("client state of {client_id} has no latest height"))
        })?;
        let header = src.build_header(trusted_height).await?;
        let height = light_client::header_height(&header)?;

        tracing::info!(
            "Updating '{}' from height: {} to height: {}",
            client_id,
            trusted_height,
            height
        );
        self.update_light_client(client_id, header).await?;
        Ok(src.revision_height(height))
    }

    /// The tendermint client state of `client_id`.
    ///
    /// # Errors
    /// Returns [`ChainError::NotFound`] if the client does not exist.
    pub async fn query_client_state(&self, client_id: &ClientId) -> Result<ClientState, ChainError> {
        let path = paths::client_state(client_id);
        let any = self.query_required::<Any>(&path).await?;
        light_client::decode_client_state(&any)
    }

    /// The consensus state of `client_id` at `height`, or at its latest height.
    ///
    /// # Errors
    /// Returns [`ChainError::NotFound`] if the client or consensus state does not exist.
    pub async fn query_consensus_state(
        &self,
        client_id: &ClientId,
        height: Option<Height>,
    ) -> Result<ConsensusState, ChainError> {
        let height = match height {
            Some(height) => height,
            None => {
                let client_state = self.query_client_state(client_id).await?;
                light_client::latest_height(&client_state).ok_or_else(|| {
                    ChainError::Decode(format!("client state of {client_id} has no latest height"))
                })?
            }
        };
        let path = paths::consensus_state(client_id, height);
        let any = self.query_required::<Any>(&path).await?;
        light_client::decode_consensus_state(&any)
    }

    /// The connection end, `None` if it does not exist.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn query_connection(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<Option<ConnectionEnd>, ChainError> {
        self.query_optional(&paths::connection(connection_id)).await
    }

    /// The channel end, `None` if it does not exist.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn query_channel(
        &self,
        port_id: &PortId,
        channel_id: &ChannelId,
    ) -> Result<Option<Channel>, ChainError> {
        self.query_optional(&paths::channel_end(port_id, channel_id))
            .await
    }

    /// The stored packet commitment, empty if there is none.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn query_packet_commitment(
        &self,
        port_id: &PortId,
        channel_id: &ChannelId,
        sequence: u64,
    ) -> Result<Vec<u8>, ChainError> {
        let path = paths::packet_commitment(port_id, channel_id, sequence);
        Ok(self.query_store(&path, None, false).await?.value)
    }

    /// The subset of `sequences` this chain has not received on the channel.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn query_unreceived_packets(
        &self,
        port_id: &PortId,
        channel_id: &ChannelId,
        sequences: Vec<u64>,
    ) -> Result<Vec<u64>, ChainError> {
        let request = QueryUnreceivedPacketsRequest {
            port_id: port_id.to_string(),
            channel_id: channel_id.to_string(),
            packet_commitment_sequences: sequences,
        };
        let response: QueryUnreceivedPacketsResponse = self
            .query_grpc(paths::UNRECEIVED_PACKETS_PATH, &request)
            .await?;
        Ok(response.sequences)
    }

    /// The subset of `sequences` whose acknowledgement this chain has not processed.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn query_unreceived_acks(
        &self,
        port_id: &PortId,
        channel_id: &ChannelId,
        sequences: Vec<u64>,
    ) -> Result<Vec<u64>, ChainError> {
        let request = QueryUnreceivedAcksRequest {
            port_id: port_id.to_string(),
            channel_id: channel_id.to_string(),
            packet_ack_sequences: sequences,
        };
        let response: QueryUnreceivedAcksResponse = self
            .query_grpc(paths::UNRECEIVED_ACKS_PATH, &request)
            .await?;
        Ok(response.sequences)
    }

    /// The next sequence the channel expects to receive.
    ///
    /// # Errors
    /// Returns an error if the query fails or the value is malformed.
    pub async fn query_next_sequence_receive(
        &self,
        port_id: &PortId,
        channel_id: &ChannelId,
    ) -> Result<u64, ChainError> {
        let path = paths::next_sequence_recv(port_id, channel_id);
        let value = self.query_store(&path, None, false).await?.value;
        decode_sequence(&path, &value)
    }

    /// Pages through `/tx_search` until every match was fetched.
    ///
    /// # Errors
    /// Returns an error if any page fails.
    pub async fn tx_search_all(&self, query: &str) -> Result<Vec<TxResult>, ChainError> {
        let mut txs = Vec::new();
        for page in 1.. {
            let result = self.rpc.tx_search(query, page, SEARCH_PAGE_SIZE).await?;
            let done = result.txs.is_empty();
            txs.extend(result.txs);
            if done || txs.len() >= result.total_count as usize {
                break;
            }
        }
        Ok(txs)
    }

    /// Pages through `/block_search` until every match was fetched.
    ///
    /// # Errors
    /// Returns an error if any page fails.
    pub async fn block_search_all(&self, query: &str) -> Result<Vec<u64>, ChainError> {
        let mut heights = Vec::new();
        for page in 1.. {
            let result = self.rpc.block_search(query, page, SEARCH_PAGE_SIZE).await?;
            let done = result.heights.is_empty();
            heights.extend(result.heights);
            if done || heights.len() >= result.total_count as usize {
                break;
            }
        }
        Ok(heights)
    }

    /// The events of the block at `height`.
    ///
    /// # Errors
    /// Returns an error if the RPC call fails.
    pub async fn block_results(&self, height: u64) -> Result<super::BlockResults, ChainError> {
        self.rpc.block_results(height).await
    }

    /// Reads a key of the IBC store.
    pub(super) async fn query_store(
        &self,
        key: &str,
        height: Option<u64>,
        prove: bool,
    ) -> Result<AbciQuery, ChainError> {
        let response = self
            .rpc
            .abci_query(paths::IBC_STORE_PATH, key.as_bytes().to_vec(), height, prove)
            .await?;
        if response.code != 0 {
            return Err(ChainError::Query {
                path: key.to_string(),
                code: response.code,
                log: response.log,
            });
        }
        Ok(response)
    }

    async fn query_optional<M: Message + Default>(&self, key: &str) -> Result<Option<M>, ChainError> {
        let value = self.query_store(key, None, false).await?.value;
        if value.is_empty() {
            return Ok(None);
        }
        Ok(Some(M::decode(value.as_slice())?))
    }

    async fn query_required<M: Message + Default>(&self, key: &str) -> Result<M, ChainError> {
        self.query_optional(key).await?.ok_or_else(|| ChainError::NotFound {
            path: key.to_string(),
        })
    }

    async fn query_grpc<Req, Res>(&self, path: &str, request: &Req) -> Result<Res, ChainError>
    where
        Req: Message,
        Res: Message + Default,
    {
        let response = self
            .rpc
            .abci_query(path, request.encode_to_vec(), None, false)
            .await?;
        if response.code != 0 {
            return Err(ChainError::Query {
                path: path.to_string(),
                code: response.code,
                log: response.log,
            });
        }
        Ok(Res::decode(response.value.as_slice())?)
    }

    /// Broadcasts the messages as one transaction.
    pub(super) async fn submit(&self, messages: Vec<Any>) -> Result<TxOutcome, ChainError> {
        let count = messages.len();
        let outcome = self.rpc.broadcast_tx(messages).await?;
        tracing::debug!(
            chain_id = %self.chain_id,
            tx_hash = %outcome.tx_hash,
            height = outcome.height,
            "Submitted {count} messages"
        );
        Ok(outcome)
    }
}

/// Decodes a big endian `u64` sequence stored under `path`.
pub(super) fn decode_sequence(path: &str, value: &[u8]) -> Result<u64, ChainError> {
    let bytes: [u8; 8] = value
        .try_into()
        .map_err(|_| ChainError::Decode(format!("{path} holds {} bytes", value.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

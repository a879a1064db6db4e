//! The IBC module of [`MockChain`](super::MockChain): clients, connections, channels,
//! packets and ICS20 transfers over a flat key value store.
//!
//! Proofs are not checked cryptographically. A proof is accepted when the verifying
//! client has a consensus state at the proof height and the first ICS23 proof proves
//! the expected key, with the expected value for memberships.
#![allow(deprecated)]

use std::collections::BTreeMap;

use ibc_proto::{
    google::protobuf::Any,
    ibc::{
        applications::transfer::v1::MsgTransfer,
        core::{
            channel::v1::{
                Channel, MsgAcknowledgement, MsgChannelOpenAck, MsgChannelOpenConfirm,
                MsgChannelOpenInit, MsgChannelOpenTry, MsgRecvPacket, MsgTimeout,
            },
            client::v1::{Height as RawHeight, MsgCreateClient, MsgUpdateClient},
            commitment::v1::MerkleProof,
            connection::v1::{
                ConnectionEnd, MsgConnectionOpenAck, MsgConnectionOpenConfirm,
                MsgConnectionOpenInit, MsgConnectionOpenTry,
            },
        },
        lightclients::tendermint::v1::{ClientState, ConsensusState},
    },
};
use ics23::commitment_proof::Proof;
use prost::Message;
use serde::Deserialize;

use crate::{
    chain::{light_client, paths},
    events::{self, Event, EventAttribute},
    height::Height,
    identifiers::{ChannelId, ClientId, ConnectionId, PortId},
    packet::{ack_commitment, Packet},
    state::{ChannelState, ConnectionState, Order},
};

/// The acknowledgement written for every received packet.
pub const SUCCESS_ACK: &[u8] = br#"{"result":"AQ=="}"#;

type TxResult<T = ()> = Result<T, String>;

/// Block level facts a message executes against.
#[derive(Clone, Copy, Debug)]
pub(super) struct TxContext {
    pub height: u64,
    pub revision_number: u64,
    pub time_nanos: u64,
    pub end_block_sends: bool,
}

/// Events emitted by a transaction.
#[derive(Debug, Default)]
pub(super) struct Emitted {
    pub tx_events: Vec<Event>,
    pub block_events: Vec<Event>,
}

#[derive(Deserialize)]
struct FungibleTokenPacketData {
    denom: String,
    #[serde(with = "ibc_link_utils::serde::number_as_string")]
    amount: u128,
    receiver: String,
}

/// The mutable IBC state, cloned per transaction so failed transactions leave no trace.
#[derive(Clone, Debug, Default)]
pub(super) struct IbcState {
    pub store: BTreeMap<String, Vec<u8>>,
    pub balances: BTreeMap<(String, String), u128>,
    next_client: u64,
    next_connection: u64,
    next_channel: u64,
}

fn decode<M: Message + Default>(bytes: &[u8]) -> TxResult<M> {
    M::decode(bytes).map_err(|e| e.to_string())
}

fn required<T>(value: Option<T>, what: &str) -> TxResult<T> {
    value.ok_or_else(|| format!("missing {what}"))
}

fn packet_event(kind: &str, packet: &Packet, connection_id: &str, ordering: Order) -> Event {
    Event::new(
        kind,
        [
            ("packet_data", String::from_utf8_lossy(&packet.data).into_owned()),
            ("packet_data_hex", hex::encode(&packet.data)),
            ("packet_timeout_height", packet.timeout_height.to_string()),
            ("packet_timeout_timestamp", packet.timeout_timestamp.to_string()),
            ("packet_sequence", packet.sequence.to_string()),
            ("packet_src_port", packet.source_port.to_string()),
            ("packet_src_channel", packet.source_channel.to_string()),
            ("packet_dst_port", packet.destination_port.to_string()),
            ("packet_dst_channel", packet.destination_channel.to_string()),
            ("packet_channel_ordering", ordering.as_str().to_string()),
            ("packet_connection", connection_id.to_string()),
        ],
    )
}

impl IbcState {
    /// Executes one message.
    pub fn deliver(&mut self, ctx: &TxContext, msg: &Any, out: &mut Emitted) -> TxResult {
        let value = msg.value.as_slice();
        match msg.type_url.as_str() {
            "/ibc.core.client.v1.MsgCreateClient" => self.create_client(&decode(value)?, out),
            "/ibc.core.client.v1.MsgUpdateClient" => self.update_client(&decode(value)?, out),
            "/ibc.core.connection.v1.MsgConnectionOpenInit" => {
                self.conn_open_init(&decode(value)?, out)
            }
            "/ibc.core.connection.v1.MsgConnectionOpenTry" => {
                self.conn_open_try(&decode(value)?, out)
            }
            "/ibc.core.connection.v1.MsgConnectionOpenAck" => {
                self.conn_open_ack(&decode(value)?, out)
            }
            "/ibc.core.connection.v1.MsgConnectionOpenConfirm" => {
                self.conn_open_confirm(&decode(value)?, out)
            }
            "/ibc.core.channel.v1.MsgChannelOpenInit" => self.chan_open_init(&decode(value)?, out),
            "/ibc.core.channel.v1.MsgChannelOpenTry" => self.chan_open_try(&decode(value)?, out),
            "/ibc.core.channel.v1.MsgChannelOpenAck" => self.chan_open_ack(&decode(value)?, out),
            "/ibc.core.channel.v1.MsgChannelOpenConfirm" => {
                self.chan_open_confirm(&decode(value)?, out)
            }
            "/ibc.applications.transfer.v1.MsgTransfer" => {
                self.transfer(ctx, &decode(value)?, out)
            }
            "/ibc.core.channel.v1.MsgRecvPacket" => self.recv_packet(ctx, &decode(value)?, out),
            "/ibc.core.channel.v1.MsgAcknowledgement" => {
                self.acknowledge(&decode(value)?, out)
            }
            "/ibc.core.channel.v1.MsgTimeout" => self.timeout(&decode(value)?, out),
            other => Err(format!("unsupported message {other}")),
        }
    }

    /// Sequences of `sequences` not received on the channel.
    pub fn unreceived_packets(
        &self,
        port_id: &PortId,
        channel_id: &ChannelId,
        sequences: Vec<u64>,
    ) -> TxResult<Vec<u64>> {
        let channel = self.channel(port_id, channel_id)?;
        if Order::from_i32(channel.ordering) == Some(Order::Ordered) {
            let next = self.sequence(&paths::next_sequence_recv(port_id, channel_id))?;
            return Ok(sequences.into_iter().filter(|seq| *seq >= next).collect());
        }
        Ok(sequences
            .into_iter()
            .filter(|seq| {
                !self
                    .store
                    .contains_key(&paths::packet_receipt(port_id, channel_id, *seq))
            })
            .collect())
    }

    /// Sequences of `sequences` whose commitment was not cleared by an acknowledgement.
    pub fn unreceived_acks(
        &self,
        port_id: &PortId,
        channel_id: &ChannelId,
        sequences: Vec<u64>,
    ) -> Vec<u64> {
        sequences
            .into_iter()
            .filter(|seq| {
                self.store
                    .contains_key(&paths::packet_commitment(port_id, channel_id, *seq))
            })
            .collect()
    }

    fn get<M: Message + Default>(&self, key: &str) -> TxResult<Option<M>> {
        self.store.get(key).map(|bytes| decode(bytes)).transpose()
    }

    fn put<M: Message>(&mut self, key: String, msg: &M) {
        self.store.insert(key, msg.encode_to_vec());
    }

    fn sequence(&self, key: &str) -> TxResult<u64> {
        let bytes = required(self.store.get(key), key)?;
        let bytes: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| format!("malformed sequence at {key}"))?;
        Ok(u64::from_be_bytes(bytes))
    }

    fn set_sequence(&mut self, key: String, sequence: u64) {
        self.store.insert(key, sequence.to_be_bytes().to_vec());
    }

    fn client_state(&self, client_id: &str) -> TxResult<ClientState> {
        let any: Any = required(
            self.get(&paths::client_state(&ClientId::new(client_id)))?,
            &format!("client {client_id}"),
        )?;
        light_client::decode_client_state(&any).map_err(|e| e.to_string())
    }

    fn consensus_state(&self, client_id: &str, height: Height) -> TxResult<ConsensusState> {
        let key = paths::consensus_state(&ClientId::new(client_id), height);
        let any: Any = required(self.get(&key)?, &key)?;
        light_client::decode_consensus_state(&any).map_err(|e| e.to_string())
    }

    fn connection(&self, connection_id: &str) -> TxResult<ConnectionEnd> {
        required(
            self.get(&paths::connection(&ConnectionId::new(connection_id)))?,
            &format!("connection {connection_id}"),
        )
    }

    fn channel(&self, port_id: &PortId, channel_id: &ChannelId) -> TxResult<Channel> {
        required(
            self.get(&paths::channel_end(port_id, channel_id))?,
            &format!("channel {port_id}/{channel_id}"),
        )
    }

    fn open_channel(&self, port_id: &PortId, channel_id: &ChannelId) -> TxResult<Channel> {
        let channel = self.channel(port_id, channel_id)?;
        if ChannelState::from(channel.state) != ChannelState::Open {
            return Err(format!("channel {port_id}/{channel_id} is not open"));
        }
        Ok(channel)
    }

    /// The connection and its client a channel runs over.
    fn channel_route(&self, channel: &Channel) -> TxResult<(String, String)> {
        let connection_id = required(channel.connection_hops.first(), "connection hop")?;
        let connection = self.connection(connection_id)?;
        Ok((connection_id.clone(), connection.client_id))
    }

    fn first_proof(
        &self,
        client_id: &str,
        proof_height: Option<&RawHeight>,
        proof: &[u8],
    ) -> TxResult<Option<Proof>> {
        let height = Height::from(required(proof_height, "proof height")?);
        self.consensus_state(client_id, height)
            .map_err(|_| format!("client {client_id} has no consensus state at {height}"))?;
        let merkle: MerkleProof = decode(proof)?;
        Ok(required(merkle.proofs.into_iter().next(), "commitment proof")?.proof)
    }

    fn proven_value(
        &self,
        client_id: &str,
        proof_height: Option<&RawHeight>,
        proof: &[u8],
        path: &str,
    ) -> TxResult<Vec<u8>> {
        match self.first_proof(client_id, proof_height, proof)? {
            Some(Proof::Exist(exist)) if exist.key == path.as_bytes() => Ok(exist.value),
            _ => Err(format!("invalid membership proof for {path}")),
        }
    }

    fn verify_absence(
        &self,
        client_id: &str,
        proof_height: Option<&RawHeight>,
        proof: &[u8],
        path: &str,
    ) -> TxResult {
        match self.first_proof(client_id, proof_height, proof)? {
            Some(Proof::Nonexist(absent)) if absent.key == path.as_bytes() => Ok(()),
            _ => Err(format!("invalid non-membership proof for {path}")),
        }
    }

    fn proven_connection(
        &self,
        client_id: &str,
        proof_height: Option<&RawHeight>,
        proof: &[u8],
        connection_id: &str,
        expected: ConnectionState,
    ) -> TxResult<ConnectionEnd> {
        let path = paths::connection(&ConnectionId::new(connection_id));
        let remote: ConnectionEnd = decode(&self.proven_value(client_id, proof_height, proof, &path)?)?;
        let actual = ConnectionState::from(remote.state);
        if actual != expected {
            return Err(format!("counterparty connection is {actual}, expected {expected}"));
        }
        Ok(remote)
    }

    fn proven_channel(
        &self,
        client_id: &str,
        proof_height: Option<&RawHeight>,
        proof: &[u8],
        port_id: &str,
        channel_id: &str,
        expected: ChannelState,
    ) -> TxResult<Channel> {
        let path = paths::channel_end(&PortId::new(port_id), &ChannelId::new(channel_id));
        let remote: Channel = decode(&self.proven_value(client_id, proof_height, proof, &path)?)?;
        let actual = ChannelState::from(remote.state);
        if actual != expected {
            return Err(format!("counterparty channel is {actual}, expected {expected}"));
        }
        Ok(remote)
    }

    fn verify_client_proofs(
        &self,
        client_id: &str,
        proof_height: Option<&RawHeight>,
        counterparty_client: &str,
        proof_client: &[u8],
        proof_consensus: &[u8],
        consensus_height: Option<&RawHeight>,
    ) -> TxResult {
        let client_path = paths::client_state(&ClientId::new(counterparty_client));
        self.proven_value(client_id, proof_height, proof_client, &client_path)?;
        let consensus_path = paths::consensus_state(
            &ClientId::new(counterparty_client),
            Height::from(required(consensus_height, "consensus height")?),
        );
        self.proven_value(client_id, proof_height, proof_consensus, &consensus_path)?;
        Ok(())
    }

    fn create_client(&mut self, msg: &MsgCreateClient, out: &mut Emitted) -> TxResult {
        let client_state_any = required(msg.client_state.clone(), "client state")?;
        let consensus_any = required(msg.consensus_state.clone(), "consensus state")?;
        let client_state =
            light_client::decode_client_state(&client_state_any).map_err(|e| e.to_string())?;
        light_client::decode_consensus_state(&consensus_any).map_err(|e| e.to_string())?;
        let height = required(light_client::latest_height(&client_state), "latest height")?;

        let client_id = ClientId::new(format!("07-tendermint-{}", self.next_client));
        self.next_client += 1;
        self.put(paths::client_state(&client_id), &client_state_any);
        self.put(paths::consensus_state(&client_id, height), &consensus_any);

        out.tx_events.push(Event::new(
            events::CREATE_CLIENT,
            [
                ("client_id", client_id.to_string()),
                ("client_type", "07-tendermint".to_string()),
                ("consensus_height", height.to_string()),
            ],
        ));
        Ok(())
    }

    fn update_client(&mut self, msg: &MsgUpdateClient, out: &mut Emitted) -> TxResult {
        let mut client_state = self.client_state(&msg.client_id)?;
        let header = light_client::decode_header(&required(
            msg.client_message.clone(),
            "client message",
        )?)
        .map_err(|e| e.to_string())?;

        let raw_header = required(
            header.signed_header.and_then(|signed| signed.header),
            "signed header",
        )?;
        let tm_header =
            tendermint::block::Header::try_from(raw_header).map_err(|e| e.to_string())?;
        if tm_header.chain_id.as_str() != client_state.chain_id {
            return Err(format!(
                "header of {} submitted to client of {}",
                tm_header.chain_id, client_state.chain_id
            ));
        }

        let trusted_height = Height::from(required(header.trusted_height.as_ref(), "trusted height")?);
        let trusted = self.consensus_state(&msg.client_id, trusted_height)?;
        let trusted_validators = tendermint::validator::Set::try_from(required(
            header.trusted_validators,
            "trusted validators",
        )?)
        .map_err(|e| e.to_string())?;
        if trusted_validators.hash().as_bytes() != trusted.next_validators_hash.as_slice() {
            return Err(format!(
                "trusted validators do not match the next validators hash at {trusted_height}"
            ));
        }

        let latest = required(light_client::latest_height(&client_state), "latest height")?;
        let new_height = Height::new(latest.revision_number, tm_header.height.value());
        if new_height < trusted_height {
            return Err(format!("header {new_height} is before trusted {trusted_height}"));
        }
        let consensus = light_client::consensus_state_from_header(&tm_header);
        self.put(
            paths::consensus_state(&ClientId::new(&msg.client_id), new_height),
            &light_client::to_any(light_client::CONSENSUS_STATE_TYPE_URL, &consensus),
        );
        if new_height > latest {
            client_state.latest_height = Some(new_height.into());
            self.put(
                paths::client_state(&ClientId::new(&msg.client_id)),
                &light_client::to_any(light_client::CLIENT_STATE_TYPE_URL, &client_state),
            );
        }

        out.tx_events.push(Event::new(
            "update_client",
            [
                ("client_id", msg.client_id.clone()),
                ("consensus_height", new_height.to_string()),
            ],
        ));
        Ok(())
    }

    fn conn_open_init(&mut self, msg: &MsgConnectionOpenInit, out: &mut Emitted) -> TxResult {
        self.client_state(&msg.client_id)?;
        let counterparty = required(msg.counterparty.clone(), "counterparty")?;
        let version = required(msg.version.clone(), "version")?;

        let connection_id = format!("connection-{}", self.next_connection);
        self.next_connection += 1;
        out.tx_events.push(Event::new(
            events::CONNECTION_OPEN_INIT,
            [
                ("connection_id", connection_id.clone()),
                ("client_id", msg.client_id.clone()),
                ("counterparty_client_id", counterparty.client_id.clone()),
            ],
        ));
        self.put(
            paths::connection(&ConnectionId::new(connection_id)),
            &ConnectionEnd {
                client_id: msg.client_id.clone(),
                versions: vec![version],
                state: ConnectionState::Init.as_i32(),
                counterparty: Some(counterparty),
                delay_period: msg.delay_period,
            },
        );
        Ok(())
    }

    fn conn_open_try(&mut self, msg: &MsgConnectionOpenTry, out: &mut Emitted) -> TxResult {
        self.client_state(&msg.client_id)?;
        let counterparty = required(msg.counterparty.clone(), "counterparty")?;
        let remote = self.proven_connection(
            &msg.client_id,
            msg.proof_height.as_ref(),
            &msg.proof_init,
            &counterparty.connection_id,
            ConnectionState::Init,
        )?;
        let remote_counterparty = required(remote.counterparty, "counterparty of remote")?;
        if remote.client_id != counterparty.client_id || remote_counterparty.client_id != msg.client_id
        {
            return Err("counterparty connection uses different clients".to_string());
        }
        self.verify_client_proofs(
            &msg.client_id,
            msg.proof_height.as_ref(),
            &counterparty.client_id,
            &msg.proof_client,
            &msg.proof_consensus,
            msg.consensus_height.as_ref(),
        )?;

        let connection_id = format!("connection-{}", self.next_connection);
        self.next_connection += 1;
        out.tx_events.push(Event::new(
            events::CONNECTION_OPEN_TRY,
            [
                ("connection_id", connection_id.clone()),
                ("client_id", msg.client_id.clone()),
                ("counterparty_client_id", counterparty.client_id.clone()),
                ("counterparty_connection_id", counterparty.connection_id.clone()),
            ],
        ));
        self.put(
            paths::connection(&ConnectionId::new(connection_id)),
            &ConnectionEnd {
                client_id: msg.client_id.clone(),
                versions: msg.counterparty_versions.clone(),
                state: ConnectionState::TryOpen.as_i32(),
                counterparty: Some(counterparty),
                delay_period: msg.delay_period,
            },
        );
        Ok(())
    }

    fn conn_open_ack(&mut self, msg: &MsgConnectionOpenAck, out: &mut Emitted) -> TxResult {
        let mut end = self.connection(&msg.connection_id)?;
        if ConnectionState::from(end.state) != ConnectionState::Init {
            return Err(format!("connection {} is not in INIT", msg.connection_id));
        }
        let remote = self.proven_connection(
            &end.client_id,
            msg.proof_height.as_ref(),
            &msg.proof_try,
            &msg.counterparty_connection_id,
            ConnectionState::TryOpen,
        )?;
        if remote.counterparty.map(|c| c.connection_id) != Some(msg.connection_id.clone()) {
            return Err("counterparty connection does not point back".to_string());
        }
        let counterparty = required(end.counterparty.as_mut(), "counterparty")?;
        counterparty.connection_id = msg.counterparty_connection_id.clone();
        let counterparty_client = counterparty.client_id.clone();
        self.verify_client_proofs(
            &end.client_id,
            msg.proof_height.as_ref(),
            &counterparty_client,
            &msg.proof_client,
            &msg.proof_consensus,
            msg.consensus_height.as_ref(),
        )?;

        end.state = ConnectionState::Open.as_i32();
        self.put(paths::connection(&ConnectionId::new(&msg.connection_id)), &end);
        out.tx_events.push(Event::new(
            "connection_open_ack",
            [
                ("connection_id", msg.connection_id.clone()),
                ("counterparty_connection_id", msg.counterparty_connection_id.clone()),
            ],
        ));
        Ok(())
    }

    fn conn_open_confirm(&mut self, msg: &MsgConnectionOpenConfirm, out: &mut Emitted) -> TxResult {
        let mut end = self.connection(&msg.connection_id)?;
        if ConnectionState::from(end.state) != ConnectionState::TryOpen {
            return Err(format!("connection {} is not in TRYOPEN", msg.connection_id));
        }
        let counterparty = required(end.counterparty.clone(), "counterparty")?;
        self.proven_connection(
            &end.client_id,
            msg.proof_height.as_ref(),
            &msg.proof_ack,
            &counterparty.connection_id,
            ConnectionState::Open,
        )?;

        end.state = ConnectionState::Open.as_i32();
        self.put(paths::connection(&ConnectionId::new(&msg.connection_id)), &end);
        out.tx_events.push(Event::new(
            "connection_open_confirm",
            [("connection_id", msg.connection_id.clone())],
        ));
        Ok(())
    }

    fn new_channel(&mut self, port_id: &PortId, channel: &Channel) -> ChannelId {
        let channel_id = ChannelId::new(format!("channel-{}", self.next_channel));
        self.next_channel += 1;
        self.put(paths::channel_end(port_id, &channel_id), channel);
        for key in [
            paths::next_sequence_send(port_id, &channel_id),
            paths::next_sequence_recv(port_id, &channel_id),
            paths::next_sequence_ack(port_id, &channel_id),
        ] {
            self.set_sequence(key, 1);
        }
        channel_id
    }

    fn chan_open_init(&mut self, msg: &MsgChannelOpenInit, out: &mut Emitted) -> TxResult {
        let mut channel = required(msg.channel.clone(), "channel")?;
        let connection_id = required(channel.connection_hops.first(), "connection hop")?.clone();
        let connection = self.connection(&connection_id)?;
        if ConnectionState::from(connection.state) != ConnectionState::Open {
            return Err(format!("connection {connection_id} is not open"));
        }
        channel.state = ChannelState::Init.as_i32();

        let port_id = PortId::new(&msg.port_id);
        let channel_id = self.new_channel(&port_id, &channel);
        let counterparty = required(channel.counterparty, "counterparty")?;
        out.tx_events.push(Event::new(
            events::CHANNEL_OPEN_INIT,
            [
                ("port_id", msg.port_id.clone()),
                ("channel_id", channel_id.to_string()),
                ("counterparty_port_id", counterparty.port_id),
                ("connection_id", connection_id),
            ],
        ));
        Ok(())
    }

    fn chan_open_try(&mut self, msg: &MsgChannelOpenTry, out: &mut Emitted) -> TxResult {
        let mut channel = required(msg.channel.clone(), "channel")?;
        let (connection_id, client_id) = self.channel_route(&channel)?;
        if ConnectionState::from(self.connection(&connection_id)?.state) != ConnectionState::Open {
            return Err(format!("connection {connection_id} is not open"));
        }
        let counterparty = required(channel.counterparty.clone(), "counterparty")?;
        let remote = self.proven_channel(
            &client_id,
            msg.proof_height.as_ref(),
            &msg.proof_init,
            &counterparty.port_id,
            &counterparty.channel_id,
            ChannelState::Init,
        )?;
        if remote.ordering != channel.ordering {
            return Err("channel ordering differs from counterparty".to_string());
        }
        channel.state = ChannelState::TryOpen.as_i32();

        let port_id = PortId::new(&msg.port_id);
        let channel_id = self.new_channel(&port_id, &channel);
        out.tx_events.push(Event::new(
            events::CHANNEL_OPEN_TRY,
            [
                ("port_id", msg.port_id.clone()),
                ("channel_id", channel_id.to_string()),
                ("counterparty_port_id", counterparty.port_id),
                ("counterparty_channel_id", counterparty.channel_id),
                ("connection_id", connection_id),
            ],
        ));
        Ok(())
    }

    fn chan_open_ack(&mut self, msg: &MsgChannelOpenAck, out: &mut Emitted) -> TxResult {
        let port_id = PortId::new(&msg.port_id);
        let channel_id = ChannelId::new(&msg.channel_id);
        let mut channel = self.channel(&port_id, &channel_id)?;
        if ChannelState::from(channel.state) != ChannelState::Init {
            return Err(format!("channel {port_id}/{channel_id} is not in INIT"));
        }
        let (_, client_id) = self.channel_route(&channel)?;
        let counterparty = required(channel.counterparty.as_mut(), "counterparty")?;
        self.proven_channel(
            &client_id,
            msg.proof_height.as_ref(),
            &msg.proof_try,
            &counterparty.port_id,
            &msg.counterparty_channel_id,
            ChannelState::TryOpen,
        )?;

        counterparty.channel_id = msg.counterparty_channel_id.clone();
        channel.state = ChannelState::Open.as_i32();
        self.put(paths::channel_end(&port_id, &channel_id), &channel);
        out.tx_events.push(Event::new(
            "channel_open_ack",
            [
                ("port_id", msg.port_id.clone()),
                ("channel_id", msg.channel_id.clone()),
            ],
        ));
        Ok(())
    }

    fn chan_open_confirm(&mut self, msg: &MsgChannelOpenConfirm, out: &mut Emitted) -> TxResult {
        let port_id = PortId::new(&msg.port_id);
        let channel_id = ChannelId::new(&msg.channel_id);
        let mut channel = self.channel(&port_id, &channel_id)?;
        if ChannelState::from(channel.state) != ChannelState::TryOpen {
            return Err(format!("channel {port_id}/{channel_id} is not in TRYOPEN"));
        }
        let (_, client_id) = self.channel_route(&channel)?;
        let counterparty = required(channel.counterparty.clone(), "counterparty")?;
        self.proven_channel(
            &client_id,
            msg.proof_height.as_ref(),
            &msg.proof_ack,
            &counterparty.port_id,
            &counterparty.channel_id,
            ChannelState::Open,
        )?;

        channel.state = ChannelState::Open.as_i32();
        self.put(paths::channel_end(&port_id, &channel_id), &channel);
        out.tx_events.push(Event::new(
            "channel_open_confirm",
            [
                ("port_id", msg.port_id.clone()),
                ("channel_id", msg.channel_id.clone()),
            ],
        ));
        Ok(())
    }

    fn transfer(&mut self, ctx: &TxContext, msg: &MsgTransfer, out: &mut Emitted) -> TxResult {
        let port_id = PortId::new(&msg.source_port);
        let channel_id = ChannelId::new(&msg.source_channel);
        let channel = self.open_channel(&port_id, &channel_id)?;
        let (connection_id, _) = self.channel_route(&channel)?;
        let counterparty = required(channel.counterparty, "counterparty")?;
        let token = required(msg.token.clone(), "token")?;

        let sequence_key = paths::next_sequence_send(&port_id, &channel_id);
        let sequence = self.sequence(&sequence_key)?;
        self.set_sequence(sequence_key, sequence + 1);

        let data = serde_json::to_vec(&serde_json::json!({
            "amount": token.amount,
            "denom": token.denom,
            "receiver": msg.receiver,
            "sender": msg.sender,
        }))
        .map_err(|e| e.to_string())?;
        let packet = Packet {
            sequence,
            source_port: port_id,
            source_channel: channel_id,
            destination_port: counterparty.port_id.into(),
            destination_channel: counterparty.channel_id.into(),
            data,
            timeout_height: msg.timeout_height.as_ref().map(Height::from).into(),
            timeout_timestamp: msg.timeout_timestamp,
        };
        if packet.timeout_height.height().is_none() && packet.timeout_timestamp == 0 {
            return Err("packet needs a timeout height or timestamp".to_string());
        }
        self.store.insert(
            paths::packet_commitment(&packet.source_port, &packet.source_channel, sequence),
            packet.commitment(),
        );

        let ordering = Order::from_i32(channel.ordering).unwrap_or(Order::Unordered);
        let event = packet_event(events::SEND_PACKET, &packet, &connection_id, ordering);
        if ctx.end_block_sends {
            out.block_events.push(event);
        } else {
            out.tx_events.push(event);
        }
        Ok(())
    }

    fn recv_packet(&mut self, ctx: &TxContext, msg: &MsgRecvPacket, out: &mut Emitted) -> TxResult {
        let packet = Packet::from(required(msg.packet.clone(), "packet")?);
        let channel = self.open_channel(&packet.destination_port, &packet.destination_channel)?;
        let (connection_id, client_id) = self.channel_route(&channel)?;

        let commitment_path =
            paths::packet_commitment(&packet.source_port, &packet.source_channel, packet.sequence);
        let proven = self.proven_value(
            &client_id,
            msg.proof_height.as_ref(),
            &msg.proof_commitment,
            &commitment_path,
        )?;
        if proven != packet.commitment() {
            return Err(format!("commitment mismatch for packet {}", packet.sequence));
        }
        if packet
            .timeout_height
            .has_expired(Height::new(ctx.revision_number, ctx.height))
            || packet.timestamp_expired(ctx.time_nanos)
        {
            return Err(format!("packet {} timed out", packet.sequence));
        }

        let ordering = Order::from_i32(channel.ordering).unwrap_or(Order::Unordered);
        let (port, chan) = (&packet.destination_port, &packet.destination_channel);
        match ordering {
            Order::Ordered => {
                let key = paths::next_sequence_recv(port, chan);
                let next = self.sequence(&key)?;
                if packet.sequence < next {
                    return Ok(());
                }
                if packet.sequence > next {
                    return Err(format!("packet {} out of order, expected {next}", packet.sequence));
                }
                self.set_sequence(key, next + 1);
            }
            Order::Unordered => {
                let key = paths::packet_receipt(port, chan, packet.sequence);
                if self.store.contains_key(&key) {
                    return Ok(());
                }
                self.store.insert(key, vec![1]);
            }
        }

        self.store.insert(
            paths::packet_ack(port, chan, packet.sequence),
            ack_commitment(SUCCESS_ACK),
        );
        if let Ok(data) = serde_json::from_slice::<FungibleTokenPacketData>(&packet.data) {
            let denom = format!("{port}/{chan}/{}", data.denom);
            *self.balances.entry((data.receiver, denom)).or_default() += data.amount;
        }

        out.tx_events
            .push(packet_event("recv_packet", &packet, &connection_id, ordering));
        let mut ack_event = packet_event(
            events::WRITE_ACKNOWLEDGEMENT,
            &packet,
            &connection_id,
            ordering,
        );
        ack_event.attributes.extend([
            EventAttribute {
                key: "packet_ack".to_string(),
                value: String::from_utf8_lossy(SUCCESS_ACK).into_owned(),
            },
            EventAttribute {
                key: "packet_ack_hex".to_string(),
                value: hex::encode(SUCCESS_ACK),
            },
        ]);
        out.tx_events.push(ack_event);
        Ok(())
    }

    /// The stored commitment of a packet this chain sent, `None` once cleared.
    fn live_commitment(&self, packet: &Packet) -> TxResult<Option<String>> {
        let key =
            paths::packet_commitment(&packet.source_port, &packet.source_channel, packet.sequence);
        match self.store.get(&key) {
            None => Ok(None),
            Some(stored) if *stored == packet.commitment() => Ok(Some(key)),
            Some(_) => Err(format!("packet {} does not match its commitment", packet.sequence)),
        }
    }

    fn acknowledge(&mut self, msg: &MsgAcknowledgement, out: &mut Emitted) -> TxResult {
        let packet = Packet::from(required(msg.packet.clone(), "packet")?);
        let channel = self.open_channel(&packet.source_port, &packet.source_channel)?;
        let Some(commitment_key) = self.live_commitment(&packet)? else {
            return Ok(());
        };
        let (connection_id, client_id) = self.channel_route(&channel)?;

        let ack_path = paths::packet_ack(
            &packet.destination_port,
            &packet.destination_channel,
            packet.sequence,
        );
        let proven = self.proven_value(&client_id, msg.proof_height.as_ref(), &msg.proof_acked, &ack_path)?;
        if proven != ack_commitment(&msg.acknowledgement) {
            return Err(format!("acknowledgement mismatch for packet {}", packet.sequence));
        }

        let ordering = Order::from_i32(channel.ordering).unwrap_or(Order::Unordered);
        if ordering == Order::Ordered {
            let key = paths::next_sequence_ack(&packet.source_port, &packet.source_channel);
            let next = self.sequence(&key)?;
            if packet.sequence != next {
                return Err(format!("ack {} out of order, expected {next}", packet.sequence));
            }
            self.set_sequence(key, next + 1);
        }

        self.store.remove(&commitment_key);
        out.tx_events
            .push(packet_event("acknowledge_packet", &packet, &connection_id, ordering));
        Ok(())
    }

    fn timeout(&mut self, msg: &MsgTimeout, out: &mut Emitted) -> TxResult {
        let packet = Packet::from(required(msg.packet.clone(), "packet")?);
        let port_id = packet.source_port.clone();
        let channel_id = packet.source_channel.clone();
        let mut channel = self.channel(&port_id, &channel_id)?;
        let Some(commitment_key) = self.live_commitment(&packet)? else {
            return Ok(());
        };
        let (connection_id, client_id) = self.channel_route(&channel)?;

        let proof_height = Height::from(required(msg.proof_height.as_ref(), "proof height")?);
        let consensus = self.consensus_state(&client_id, proof_height)?;
        let counterparty_nanos = consensus
            .timestamp
            .as_ref()
            .map_or(0, light_client::timestamp_nanos);
        if !packet.timeout_height.has_expired(proof_height)
            && !packet.timestamp_expired(counterparty_nanos)
        {
            return Err(format!(
                "packet {} has not timed out at {proof_height}",
                packet.sequence
            ));
        }

        let ordering = Order::from_i32(channel.ordering).unwrap_or(Order::Unordered);
        let (dst_port, dst_chan) = (&packet.destination_port, &packet.destination_channel);
        match ordering {
            Order::Ordered => {
                let path = paths::next_sequence_recv(dst_port, dst_chan);
                let proven =
                    self.proven_value(&client_id, msg.proof_height.as_ref(), &msg.proof_unreceived, &path)?;
                if proven != msg.next_sequence_recv.to_be_bytes() {
                    return Err("next sequence receive does not match proof".to_string());
                }
                if msg.next_sequence_recv > packet.sequence {
                    return Err(format!("packet {} was received", packet.sequence));
                }
                channel.state = ChannelState::Closed.as_i32();
                self.put(paths::channel_end(&port_id, &channel_id), &channel);
            }
            Order::Unordered => {
                let path = paths::packet_receipt(dst_port, dst_chan, packet.sequence);
                self.verify_absence(&client_id, msg.proof_height.as_ref(), &msg.proof_unreceived, &path)?;
            }
        }

        self.store.remove(&commitment_key);
        out.tx_events
            .push(packet_event("timeout_packet", &packet, &connection_id, ordering));
        Ok(())
    }
}

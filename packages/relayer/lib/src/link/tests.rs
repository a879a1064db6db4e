use std::{sync::Arc, time::Duration};

use ibc_proto::cosmos::base::v1beta1::Coin;

use super::*;
use crate::{
    chain::{light_client, ChainClient},
    config::ChainClientConfig,
    endpoint::QueryOpts,
    error::{ChainError, ProtocolStateError, RelayerError},
    height::{Height, TimeoutHeight},
    identifiers::{ChainId, ConnectionId, PortId},
    state::{ChannelState, Order},
    testing::MockChain,
};

const RECEIVER: &str = "cosmos1receiver";
const FAR_TIMEOUT: TimeoutHeight = TimeoutHeight::At(Height::new(1, 1_000_000));

struct Setup {
    chain_a: MockChain,
    chain_b: MockChain,
    link: Link,
    channels: ChannelPair,
}

impl Setup {
    async fn new(ordering: Order) -> anyhow::Result<Self> {
        let _ = tracing_subscriber::fmt::try_init();
        let chain_a = MockChain::new("chain-a-1");
        let chain_b = MockChain::new("chain-b-1");
        let link = Link::create_with_new_connections(
            chain_a.client("relayer-a"),
            chain_b.client("relayer-b"),
            None,
            None,
        )
        .await?;
        let channels = link
            .create_channel(Side::A, &"transfer".into(), &"transfer".into(), ordering, "ics20-1")
            .await?;
        Ok(Self {
            chain_a,
            chain_b,
            link,
            channels,
        })
    }

    /// Sends `amount` stake from A over the first channel, returns the tx height.
    async fn send_from_a(&self, amount: u64, timeout_height: TimeoutHeight) -> u64 {
        self.send_on(&self.channels.src, amount, timeout_height)
            .await
    }

    async fn send_on(&self, channel: &ChannelInfo, amount: u64, timeout_height: TimeoutHeight) -> u64 {
        self.link
            .end_a()
            .client()
            .transfer_tokens(
                &channel.port_id,
                &channel.channel_id,
                Coin {
                    denom: "stake".to_string(),
                    amount: amount.to_string(),
                },
                RECEIVER,
                timeout_height,
                0,
            )
            .await
            .unwrap()
            .height
    }

    fn received_on_b(&self, channel: &ChannelInfo) -> u128 {
        self.chain_b.balance(
            RECEIVER,
            &format!("{}/{}/stake", channel.port_id, channel.channel_id),
        )
    }

    async fn commitment_on_a(&self, sequence: u64) -> Vec<u8> {
        self.link
            .end_a()
            .client()
            .query_packet_commitment(
                &self.channels.src.port_id,
                &self.channels.src.channel_id,
                sequence,
            )
            .await
            .unwrap()
    }
}

fn sequences(packets: &[crate::packet::PacketWithMetadata]) -> Vec<u64> {
    packets.iter().map(|p| p.packet.sequence).collect()
}

#[tokio::test]
async fn transfers_arrive_and_get_acknowledged() {
    let setup = Setup::new(Order::Unordered).await.unwrap();
    for amount in [1000, 2222, 3456] {
        setup.send_from_a(amount, FAR_TIMEOUT).await;
    }

    let info = setup.link.relay_all().await.unwrap();
    assert_eq!(
        info,
        RelayInfo {
            packets_from_a: 3,
            packets_from_b: 0,
            acks_from_a: 0,
            acks_from_b: 3,
        }
    );
    assert_eq!(setup.received_on_b(&setup.channels.dest), 6678);
    for sequence in 1..=3 {
        assert!(setup.commitment_on_a(sequence).await.is_empty());
    }
}

#[tokio::test]
async fn transfers_move_through_each_relay_step() {
    let setup = Setup::new(Order::Unordered).await.unwrap();
    let mut send_heights = Vec::new();
    for amount in [1000, 2222, 3456] {
        send_heights.push(setup.send_from_a(amount, FAR_TIMEOUT).await);
    }

    let pending = setup
        .link
        .get_pending_packets(Side::A, QueryOpts::default())
        .await
        .unwrap();
    assert_eq!(sequences(&pending), vec![1, 2, 3]);
    let pending_heights: Vec<u64> = pending.iter().map(|p| p.height).collect();
    assert_eq!(pending_heights, send_heights);

    let acks = setup.link.relay_packets(Side::A, &pending).await.unwrap();
    assert_eq!(acks.len(), 3);
    assert_eq!(setup.received_on_b(&setup.channels.dest), 6678);

    setup.chain_b.advance_blocks(1);
    let pending_acks = setup
        .link
        .get_pending_acks(Side::B, QueryOpts::default())
        .await
        .unwrap();
    assert_eq!(pending_acks.len(), 3);
    assert!(setup
        .link
        .relay_acks(Side::B, &pending_acks)
        .await
        .unwrap()
        .is_some());
    assert!(setup
        .link
        .get_pending_acks(Side::B, QueryOpts::default())
        .await
        .unwrap()
        .is_empty());
    for sequence in 1..=3 {
        assert!(setup.commitment_on_a(sequence).await.is_empty());
    }
}

#[tokio::test]
async fn nothing_is_relayed_twice() {
    let setup = Setup::new(Order::Unordered).await.unwrap();
    setup.send_from_a(100, FAR_TIMEOUT).await;

    assert_eq!(setup.link.relay_all().await.unwrap().packets_from_a, 1);
    assert_eq!(setup.link.relay_all().await.unwrap(), RelayInfo::default());
    assert!(setup
        .link
        .get_pending_packets(Side::A, QueryOpts::default())
        .await
        .unwrap()
        .is_empty());
    assert_eq!(setup.received_on_b(&setup.channels.dest), 100);
}

#[tokio::test]
async fn identical_window_finds_the_packet_of_that_block() {
    let setup = Setup::new(Order::Unordered).await.unwrap();
    setup.send_from_a(1, FAR_TIMEOUT).await;
    let height = setup.send_from_a(2, FAR_TIMEOUT).await;
    setup.send_from_a(3, FAR_TIMEOUT).await;

    let window = QueryOpts {
        min_height: Some(height),
        max_height: Some(height),
    };
    let pending = setup
        .link
        .get_pending_packets(Side::A, window)
        .await
        .unwrap();
    assert_eq!(sequences(&pending), vec![2]);
    assert_eq!(pending[0].height, height);
}

#[tokio::test]
async fn partial_relay_leaves_the_rest_pending() {
    let setup = Setup::new(Order::Unordered).await.unwrap();
    for amount in [10, 20, 30] {
        setup.send_from_a(amount, FAR_TIMEOUT).await;
    }
    let pending = setup
        .link
        .get_pending_packets(Side::A, QueryOpts::default())
        .await
        .unwrap();
    assert_eq!(sequences(&pending), vec![1, 2, 3]);

    let acks = setup
        .link
        .relay_packets(Side::A, &[pending[0].clone(), pending[2].clone()])
        .await
        .unwrap();
    assert_eq!(acks.len(), 2);
    assert_eq!(setup.received_on_b(&setup.channels.dest), 40);

    let still_pending = setup
        .link
        .get_pending_packets(Side::A, QueryOpts::default())
        .await
        .unwrap();
    assert_eq!(sequences(&still_pending), vec![2]);

    setup.chain_b.advance_blocks(1);
    let pending_acks = setup
        .link
        .get_pending_acks(Side::B, QueryOpts::default())
        .await
        .unwrap();
    assert_eq!(pending_acks.len(), 2);
    assert!(setup
        .link
        .relay_acks(Side::B, &pending_acks)
        .await
        .unwrap()
        .is_some());
    assert!(setup
        .link
        .get_pending_acks(Side::B, QueryOpts::default())
        .await
        .unwrap()
        .is_empty());
    assert!(setup.commitment_on_a(1).await.is_empty());
    assert!(!setup.commitment_on_a(2).await.is_empty());
}

#[tokio::test]
async fn packets_on_two_channels_are_relayed_together() {
    let setup = Setup::new(Order::Unordered).await.unwrap();
    let second = setup
        .link
        .create_channel(Side::A, &"transfer".into(), &"transfer".into(), Order::Unordered, "ics20-1")
        .await
        .unwrap();
    assert_ne!(second.src.channel_id, setup.channels.src.channel_id);

    for amount in [1, 2, 3] {
        setup.send_on(&setup.channels.src, amount, FAR_TIMEOUT).await;
        setup.send_on(&second.src, amount * 10, FAR_TIMEOUT).await;
    }

    let pending = setup
        .link
        .get_pending_packets(Side::A, QueryOpts::default())
        .await
        .unwrap();
    assert_eq!(pending.len(), 6);
    for channel in [&setup.channels, &second] {
        let on_channel: Vec<_> = pending
            .iter()
            .filter(|p| p.packet.source_channel == channel.src.channel_id)
            .collect();
        assert_eq!(on_channel.len(), 3);
        assert!(on_channel
            .iter()
            .all(|p| p.packet.destination_channel == channel.dest.channel_id));
    }

    let info = setup.link.relay_all().await.unwrap();
    assert_eq!(info.packets_from_a, 6);
    assert_eq!(info.acks_from_b, 6);
    assert_eq!(setup.received_on_b(&setup.channels.dest), 6);
    assert_eq!(setup.received_on_b(&second.dest), 60);
}

#[tokio::test]
async fn ordered_channel_relays_in_sequence() {
    let setup = Setup::new(Order::Ordered).await.unwrap();
    setup.send_from_a(5, FAR_TIMEOUT).await;
    setup.send_from_a(7, FAR_TIMEOUT).await;

    let info = setup.link.relay_all().await.unwrap();
    assert_eq!(info.packets_from_a, 2);
    assert_eq!(info.acks_from_b, 2);
    assert_eq!(setup.received_on_b(&setup.channels.dest), 12);
    assert_eq!(
        setup
            .link
            .end_b()
            .client()
            .query_next_sequence_receive(&setup.channels.dest.port_id, &setup.channels.dest.channel_id)
            .await
            .unwrap(),
        3
    );
}

#[tokio::test]
async fn expiring_packets_are_timed_out() {
    let setup = Setup::new(Order::Unordered).await.unwrap();
    let expiring = setup.link.end_b().client().timeout_height(1).await.unwrap();
    setup
        .send_from_a(500, TimeoutHeight::At(expiring))
        .await;
    setup.send_from_a(600, FAR_TIMEOUT).await;

    let info = setup.link.relay_all().await.unwrap();
    assert_eq!(info.packets_from_a, 1);
    assert_eq!(setup.received_on_b(&setup.channels.dest), 600);
    assert!(setup.commitment_on_a(1).await.is_empty());
    assert!(setup.commitment_on_a(2).await.is_empty());

    assert_eq!(setup.link.relay_all().await.unwrap(), RelayInfo::default());
}

#[tokio::test]
async fn heights_from_a_cycle_bound_the_next_one() {
    let setup = Setup::new(Order::Unordered).await.unwrap();
    setup.send_from_a(1, FAR_TIMEOUT).await;

    let config = crate::config::LinkConfig::default();
    let first = setup
        .link
        .check_and_relay_packets_and_acks(
            RelayedHeights::default(),
            config.timeout_threshold_blocks,
            config.timeout_threshold_seconds,
        )
        .await
        .unwrap();
    assert!(first.packet_height_a.is_some());
    assert!(first.ack_height_b.is_some());

    let sent_at = setup.send_from_a(2, FAR_TIMEOUT).await;
    assert!(sent_at >= first.packet_height_a.unwrap());
    let second = setup
        .link
        .check_and_relay_packets_and_acks(
            first,
            config.timeout_threshold_blocks,
            config.timeout_threshold_seconds,
        )
        .await
        .unwrap();
    assert!(second.packet_height_a >= first.packet_height_a);
    assert_eq!(setup.received_on_b(&setup.channels.dest), 3);
}

#[tokio::test]
async fn packets_in_block_events_are_found() {
    let setup = Setup::new(Order::Unordered).await.unwrap();
    setup.chain_a.set_end_block_sends(true);
    let height = setup.send_from_a(42, FAR_TIMEOUT).await;

    let pending = setup
        .link
        .get_pending_packets(Side::A, QueryOpts::default())
        .await
        .unwrap();
    assert_eq!(sequences(&pending), vec![1]);
    assert_eq!(pending[0].height, height);

    assert_eq!(setup.link.relay_all().await.unwrap().packets_from_a, 1);
    assert_eq!(setup.received_on_b(&setup.channels.dest), 42);
}

#[tokio::test]
async fn filtered_packets_are_skipped() {
    let mut setup = Setup::new(Order::Unordered).await.unwrap();
    for amount in [1, 2, 3] {
        setup.send_from_a(amount, FAR_TIMEOUT).await;
    }
    setup
        .link
        .set_packet_filter(Arc::new(|packet: &Packet| packet.sequence != 2));

    assert_eq!(setup.link.relay_all().await.unwrap().packets_from_a, 2);
    assert_eq!(setup.received_on_b(&setup.channels.dest), 4);

    setup.link.clear_packet_filter();
    assert_eq!(setup.link.relay_all().await.unwrap().packets_from_a, 1);
}

#[tokio::test]
async fn a_rejected_broadcast_fails_the_cycle() {
    let setup = Setup::new(Order::Unordered).await.unwrap();
    setup.send_from_a(9, FAR_TIMEOUT).await;

    setup.chain_b.set_broadcast_failure(Some("out of gas"));
    let err = setup.link.relay_all().await.unwrap_err();
    assert!(matches!(err, ChainError::BroadcastRejected { .. }));
    assert_eq!(setup.received_on_b(&setup.channels.dest), 0);

    setup.chain_b.set_broadcast_failure(None);
    assert_eq!(setup.link.relay_all().await.unwrap().packets_from_a, 1);
    assert_eq!(setup.received_on_b(&setup.channels.dest), 9);
}

#[tokio::test]
async fn fresh_clients_are_not_updated() {
    let setup = Setup::new(Order::Unordered).await.unwrap();
    let day = Duration::from_secs(24 * 60 * 60);
    assert_eq!(
        setup.link.update_client_if_stale(Side::A, day).await.unwrap(),
        None
    );

    let updated = setup
        .link
        .update_client_if_stale(Side::A, Duration::ZERO)
        .await
        .unwrap()
        .unwrap();
    let client_state = setup
        .link
        .end_b()
        .client()
        .query_client_state(setup.link.end_b().client_id())
        .await
        .unwrap();
    assert_eq!(light_client::latest_height(&client_state), Some(updated));
}

#[tokio::test]
async fn update_headers_carry_the_validators_after_the_trusted_height() {
    let setup = Setup::new(Order::Unordered).await.unwrap();
    let client_state = setup
        .link
        .end_b()
        .client()
        .query_client_state(setup.link.end_b().client_id())
        .await
        .unwrap();
    let trusted = light_client::latest_height(&client_state).unwrap();

    let updated = setup.link.update_client(Side::A).await.unwrap();
    assert!(updated >= trusted);
    assert!(setup
        .chain_a
        .validator_queries()
        .contains(&(trusted.revision_height + 1)));
}

#[tokio::test]
async fn update_client_to_height_keeps_a_sufficient_client() {
    let setup = Setup::new(Order::Unordered).await.unwrap();
    let known = setup.link.update_client(Side::B).await.unwrap();
    let kept = setup
        .link
        .update_client_to_height(Side::B, known.revision_height)
        .await
        .unwrap();
    assert_eq!(kept, known);

    let raised = setup
        .link
        .update_client_to_height(Side::B, known.revision_height + 1)
        .await
        .unwrap();
    assert!(raised.revision_height > known.revision_height);
}

#[tokio::test]
async fn handshake_steps_cannot_be_repeated_or_skipped() {
    let setup = Setup::new(Order::Unordered).await.unwrap();
    let handshake = ChannelHandshake::new(
        setup.link.end_a().clone(),
        setup.link.end_b().clone(),
        Order::Unordered,
        "ics20-1",
    );
    let port = PortId::new("transfer");
    let src = ChannelInfo {
        port_id: "transfer".into(),
        channel_id: handshake.init(&port, &port).await.unwrap(),
    };
    let missing = ChannelPair {
        src: src.clone(),
        dest: ChannelInfo {
            port_id: "transfer".into(),
            channel_id: "channel-99".into(),
        },
    };
    assert!(matches!(
        handshake.ack(&missing).await,
        Err(RelayerError::ProtocolState(ProtocolStateError::ChannelNotFound { .. }))
    ));

    let dest = ChannelInfo {
        port_id: "transfer".into(),
        channel_id: handshake.try_open(&src, &port).await.unwrap(),
    };
    let pair = ChannelPair { src, dest };
    assert!(matches!(
        handshake.confirm(&pair).await,
        Err(RelayerError::ProtocolState(ProtocolStateError::ChannelState {
            expected: ChannelState::Open,
            actual: ChannelState::Init,
            ..
        }))
    ));
    handshake.ack(&pair).await.unwrap();
    assert!(handshake.ack(&pair).await.is_err());
    handshake.confirm(&pair).await.unwrap();

    let connections = ConnectionHandshake::new(
        setup.link.end_a().client().clone(),
        setup.link.end_b().client().clone(),
        setup.link.end_a().client_id().clone(),
        setup.link.end_b().client_id().clone(),
    );
    assert!(matches!(
        connections.try_open(setup.link.end_a().connection_id()).await,
        Err(RelayerError::ProtocolState(ProtocolStateError::ConnectionState { .. }))
    ));
}

#[tokio::test]
async fn existing_connections_can_be_reattached() {
    let setup = Setup::new(Order::Unordered).await.unwrap();
    let link = Link::create_with_existing_connections(
        setup.chain_a.client("relayer-a"),
        setup.chain_b.client("relayer-b"),
        setup.link.end_a().connection_id(),
        setup.link.end_b().connection_id(),
    )
    .await
    .unwrap();
    assert_eq!(link.end_a().client_id(), setup.link.end_a().client_id());
    assert_eq!(link.end_b().client_id(), setup.link.end_b().client_id());

    setup.send_from_a(77, FAR_TIMEOUT).await;
    assert_eq!(link.relay_all().await.unwrap().packets_from_a, 1);
    assert_eq!(setup.received_on_b(&setup.channels.dest), 77);
}

#[tokio::test]
async fn mismatched_connections_are_rejected() {
    let setup = Setup::new(Order::Unordered).await.unwrap();
    let other = Link::create_with_new_connections(
        setup.chain_a.client("relayer-a"),
        setup.chain_b.client("relayer-b"),
        None,
        None,
    )
    .await
    .unwrap();

    let err = Link::create_with_existing_connections(
        setup.chain_a.client("relayer-a"),
        setup.chain_b.client("relayer-b"),
        setup.link.end_a().connection_id(),
        other.end_b().connection_id(),
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        RelayerError::ProtocolState(ProtocolStateError::ClientIdMismatch { .. })
    ));

    let err = Link::create_with_existing_connections(
        setup.chain_a.client("relayer-a"),
        setup.chain_a.client("relayer-a"),
        setup.link.end_a().connection_id(),
        setup.link.end_a().connection_id(),
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        RelayerError::ProtocolState(ProtocolStateError::SameChain(_))
    ));

    let err = Link::create_with_existing_connections(
        setup.chain_a.client("relayer-a"),
        setup.chain_b.client("relayer-b"),
        &ConnectionId::new("connection-42"),
        setup.link.end_b().connection_id(),
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        RelayerError::ProtocolState(ProtocolStateError::ConnectionNotFound { .. })
    ));
}

#[tokio::test]
async fn connections_over_the_same_clients_must_be_counterparts() {
    let setup = Setup::new(Order::Unordered).await.unwrap();
    let (_, second_b) = ConnectionHandshake::new(
        setup.chain_a.client("relayer-a"),
        setup.chain_b.client("relayer-b"),
        setup.link.end_a().client_id().clone(),
        setup.link.end_b().client_id().clone(),
    )
    .run()
    .await
    .unwrap();
    assert_ne!(&second_b, setup.link.end_b().connection_id());

    let err = Link::create_with_existing_connections(
        setup.chain_a.client("relayer-a"),
        setup.chain_b.client("relayer-b"),
        setup.link.end_a().connection_id(),
        &second_b,
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        RelayerError::ProtocolState(ProtocolStateError::ConnectionIdMismatch { .. })
    ));
}

#[tokio::test]
async fn clients_of_another_chain_are_rejected() {
    let setup = Setup::new(Order::Unordered).await.unwrap();
    let relabelled = ChainClient::new(
        Arc::new(setup.chain_b.clone()),
        ChainId::new("chain-x-1"),
        "relayer-b".to_string(),
        ChainClientConfig::default(),
    );

    let err = Link::create_with_existing_connections(
        setup.chain_a.client("relayer-a"),
        relabelled,
        setup.link.end_a().connection_id(),
        setup.link.end_b().connection_id(),
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        RelayerError::ProtocolState(ProtocolStateError::ChainIdMismatch { .. })
    ));
}

#[tokio::test]
async fn consensus_states_must_match_the_tracked_headers() {
    let setup = Setup::new(Order::Unordered).await.unwrap();
    let end_a = setup.link.end_a();
    assert_headers_match_consensus_state(
        end_a.client(),
        end_a.client_id(),
        &setup.chain_b.client("relayer-b"),
    )
    .await
    .unwrap();

    let chain_c = MockChain::new("chain-c-1");
    chain_c.advance_blocks(setup.chain_b.height() + 1);
    let err = assert_headers_match_consensus_state(
        end_a.client(),
        end_a.client_id(),
        &chain_c.client("relayer-c"),
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        RelayerError::ProtocolState(ProtocolStateError::ConsensusStateMismatch { field: "root", .. })
    ));
}

#[tokio::test]
async fn linking_a_chain_to_itself_fails() {
    let chain = MockChain::new("chain-a-1");
    let err = Link::create_with_new_connections(
        chain.client("relayer"),
        chain.client("relayer"),
        None,
        None,
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        RelayerError::ProtocolState(ProtocolStateError::SameChain(_))
    ));
}

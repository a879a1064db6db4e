//! Packet, acknowledgement and timeout relay.

use std::collections::{BTreeMap, HashSet};

use futures::{future::try_join_all, join, try_join};

use super::{Link, RelayInfo, RelayedHeights};
use crate::{
    config::LinkConfig,
    endpoint::QueryOpts,
    error::ChainError,
    events::parse_acks_from_events,
    height::{Height, TimeoutHeight},
    identifiers::{ChannelId, PortId},
    packet::{Ack, AckWithMetadata, Packet, PacketWithMetadata},
    side::Side,
};

/// Splits pending packets into those the destination can still receive and those that
/// time out by `cutoff_height` or `cutoff_time_secs` on the destination.
///
/// Every packet lands in exactly one of the two returned sets.
#[must_use]
pub fn split_pending_packets(
    cutoff_height: Height,
    cutoff_time_secs: u64,
    packets: Vec<PacketWithMetadata>,
) -> (Vec<PacketWithMetadata>, Vec<PacketWithMetadata>) {
    let cutoff_nanos = cutoff_time_secs.saturating_mul(1_000_000_000);
    packets.into_iter().partition(|p| {
        p.packet.timeout_height > TimeoutHeight::At(cutoff_height)
            && !p.packet.timestamp_expired(cutoff_nanos)
    })
}

/// Keeps the items whose sequence `query` reports as unreceived, issuing one query per
/// channel. Discovery order is preserved.
async fn filter_unreceived<T, K, Q, Fut>(items: Vec<T>, key: K, query: Q) -> Result<Vec<T>, ChainError>
where
    K: Fn(&T) -> (PortId, ChannelId, u64),
    Q: Fn(PortId, ChannelId, Vec<u64>) -> Fut,
    Fut: std::future::Future<Output = Result<Vec<u64>, ChainError>>,
{
    if items.is_empty() {
        return Ok(items);
    }

    let mut by_channel: BTreeMap<(PortId, ChannelId), Vec<u64>> = BTreeMap::new();
    for item in &items {
        let (port, channel, sequence) = key(item);
        by_channel.entry((port, channel)).or_default().push(sequence);
    }

    let unreceived = try_join_all(by_channel.into_iter().map(|((port, channel), sequences)| {
        let fut = query(port.clone(), channel.clone(), sequences);
        async move {
            let unreceived = fut.await?;
            Ok::<_, ChainError>(
                unreceived
                    .into_iter()
                    .map(|sequence| (port.clone(), channel.clone(), sequence))
                    .collect::<Vec<_>>(),
            )
        }
    }))
    .await?
    .into_iter()
    .flatten()
    .collect::<HashSet<_>>();

    Ok(items
        .into_iter()
        .filter(|item| unreceived.contains(&key(item)))
        .collect())
}

fn destination_key(packet: &Packet) -> (PortId, ChannelId, u64) {
    (
        packet.destination_port.clone(),
        packet.destination_channel.clone(),
        packet.sequence,
    )
}

fn source_key(packet: &Packet) -> (PortId, ChannelId, u64) {
    (
        packet.source_port.clone(),
        packet.source_channel.clone(),
        packet.sequence,
    )
}

fn unix_secs(time: tendermint::Time) -> u64 {
    u64::try_from(time.unix_timestamp()).unwrap_or_default()
}

impl Link {
    /// Packets sent on `source` that the destination has not received and whose
    /// commitment still exists on `source`.
    ///
    /// # Errors
    /// Returns an error if any query fails.
    #[tracing::instrument(skip_all, fields(%source))]
    pub async fn get_pending_packets(
        &self,
        source: Side,
        opts: QueryOpts,
    ) -> Result<Vec<PacketWithMetadata>, ChainError> {
        let (src, dest) = self.get_ends(source);
        let sent: Vec<_> = src
            .query_sent_packets(opts)
            .await?
            .into_iter()
            .filter(|p| self.accepts(&p.packet))
            .collect();

        let unreceived = filter_unreceived(
            sent,
            |p| destination_key(&p.packet),
            move |port, channel, sequences| async move {
                dest.client()
                    .query_unreceived_packets(&port, &channel, sequences)
                    .await
            },
        )
        .await?;

        // A timeout on the source clears the commitment without the destination noticing.
        let commitments = try_join_all(unreceived.iter().map(|p| {
            src.client().query_packet_commitment(
                &p.packet.source_port,
                &p.packet.source_channel,
                p.packet.sequence,
            )
        }))
        .await?;
        let pending: Vec<_> = unreceived
            .into_iter()
            .zip(commitments)
            .filter_map(|(p, commitment)| (!commitment.is_empty()).then_some(p))
            .collect();

        tracing::debug!(pending = pending.len(), "Pending packets");
        Ok(pending)
    }

    /// Acknowledgements written on `source` that the original sender has not processed.
    ///
    /// # Errors
    /// Returns an error if any query fails.
    #[tracing::instrument(skip_all, fields(%source))]
    pub async fn get_pending_acks(
        &self,
        source: Side,
        opts: QueryOpts,
    ) -> Result<Vec<AckWithMetadata>, ChainError> {
        let (src, dest) = self.get_ends(source);
        let written: Vec<_> = src
            .query_written_acks(opts)
            .await?
            .into_iter()
            .filter(|ack| self.accepts(&ack.original_packet))
            .collect();

        let pending = filter_unreceived(
            written,
            |ack| source_key(&ack.original_packet),
            move |port, channel, sequences| async move {
                dest.client()
                    .query_unreceived_acks(&port, &channel, sequences)
                    .await
            },
        )
        .await?;

        tracing::debug!(pending = pending.len(), "Pending acknowledgements");
        Ok(pending)
    }

    /// Delivers packets sent on `source` to the counterparty in one transaction.
    ///
    /// Returns the acknowledgements written by that transaction.
    ///
    /// # Errors
    /// Returns an error if the client update, a proof query or the transaction fails.
    #[tracing::instrument(skip_all, fields(%source, packets = packets.len()))]
    pub async fn relay_packets(
        &self,
        source: Side,
        packets: &[PacketWithMetadata],
    ) -> Result<Vec<AckWithMetadata>, ChainError> {
        let Some(max_height) = packets.iter().map(|p| p.height).max() else {
            return Ok(vec![]);
        };
        let (src, dest) = self.get_ends(source);

        // The commitment is only provable against a header after the sending block.
        let header_height = self
            .update_client_to_height(source, max_height + 1)
            .await?;
        let proofs = try_join_all(
            packets
                .iter()
                .map(|p| src.client().get_packet_proof(&p.packet, header_height)),
        )
        .await?;

        let raw: Vec<Packet> = packets.iter().map(|p| p.packet.clone()).collect();
        let outcome = dest
            .client()
            .receive_packets(&raw, proofs, header_height)
            .await?;
        tracing::info!(
            "Relayed {} packets from {} to {} at height {}",
            packets.len(),
            src.chain_id(),
            dest.chain_id(),
            outcome.height
        );

        Ok(parse_acks_from_events(&outcome.events)?
            .into_iter()
            .map(|ack| {
                AckWithMetadata::new(
                    ack,
                    outcome.height,
                    outcome.tx_hash.clone(),
                    outcome.events.clone(),
                )
            })
            .collect())
    }

    /// Delivers acknowledgements written on `source` to the chain that sent the packets.
    ///
    /// Returns the height of the submitting transaction, `None` when there was nothing to do.
    ///
    /// # Errors
    /// Returns an error if the client update, a proof query or the transaction fails.
    #[tracing::instrument(skip_all, fields(%source, acks = acks.len()))]
    pub async fn relay_acks(
        &self,
        source: Side,
        acks: &[AckWithMetadata],
    ) -> Result<Option<u64>, ChainError> {
        let Some(max_height) = acks.iter().map(|ack| ack.height).max() else {
            return Ok(None);
        };
        let (src, dest) = self.get_ends(source);

        let header_height = self
            .update_client_to_height(source, max_height + 1)
            .await?;
        let raw: Vec<Ack> = acks.iter().map(Ack::from).collect();
        let proofs = try_join_all(
            raw.iter()
                .map(|ack| src.client().get_ack_proof(ack, header_height)),
        )
        .await?;

        let outcome = dest
            .client()
            .acknowledge_packets(&raw, proofs, header_height)
            .await?;
        tracing::info!(
            "Relayed {} acks from {} to {} at height {}",
            acks.len(),
            src.chain_id(),
            dest.chain_id(),
            outcome.height
        );
        Ok(Some(outcome.height))
    }

    /// Times out packets sent on `source` that the counterparty can no longer receive.
    ///
    /// The proofs of absence come from the counterparty, so this updates `source`'s client
    /// of the counterparty first.
    ///
    /// Returns the height of the submitting transaction, `None` when there was nothing to do.
    ///
    /// # Errors
    /// Returns an error if the client update, a proof query or the transaction fails.
    #[tracing::instrument(skip_all, fields(%source, packets = packets.len()))]
    pub async fn timeout_packets(
        &self,
        source: Side,
        packets: &[PacketWithMetadata],
    ) -> Result<Option<u64>, ChainError> {
        if packets.is_empty() {
            return Ok(None);
        }
        let (src, dest) = self.get_ends(source);

        // The timeout must be provable at a header the destination produced after expiry.
        dest.client().wait_one_block().await?;
        let header_height = self.update_client(source.other()).await?;

        let (next_sequences, proofs) = try_join!(
            try_join_all(packets.iter().map(|p| {
                dest.client().query_next_sequence_receive(
                    &p.packet.destination_port,
                    &p.packet.destination_channel,
                )
            })),
            try_join_all(
                packets
                    .iter()
                    .map(|p| dest.client().get_timeout_proof(&p.packet, header_height))
            )
        )?;

        let raw: Vec<Packet> = packets.iter().map(|p| p.packet.clone()).collect();
        let outcome = src
            .client()
            .timeout_packets(&raw, proofs, next_sequences, header_height)
            .await?;
        tracing::info!(
            "Timed out {} packets on {} at height {}",
            packets.len(),
            src.chain_id(),
            outcome.height
        );
        Ok(Some(outcome.height))
    }

    /// Runs one relay cycle in both directions: packets, then acknowledgements, then
    /// timeouts.
    ///
    /// Packets that time out within `timeout_threshold_blocks` blocks or
    /// `timeout_threshold_seconds` seconds on the destination are timed out instead of
    /// delivered. Returns the height hints for the next cycle.
    ///
    /// # Errors
    /// Returns the first error of either direction. The other direction's in flight work
    /// for this cycle is dropped.
    pub async fn check_and_relay_packets_and_acks(
        &self,
        relay_from: RelayedHeights,
        timeout_threshold_blocks: u64,
        timeout_threshold_seconds: u64,
    ) -> Result<RelayedHeights, ChainError> {
        let (heights, _) = self
            .do_check_and_relay(
                relay_from,
                timeout_threshold_blocks,
                timeout_threshold_seconds,
            )
            .await?;
        Ok(heights)
    }

    /// Runs one relay cycle from scratch with the default timeout thresholds.
    ///
    /// # Errors
    /// Returns the first error of either direction.
    pub async fn relay_all(&self) -> Result<RelayInfo, ChainError> {
        let config = LinkConfig::default();
        let (_, info) = self
            .do_check_and_relay(
                RelayedHeights::default(),
                config.timeout_threshold_blocks,
                config.timeout_threshold_seconds,
            )
            .await?;
        Ok(info)
    }

    #[tracing::instrument(skip_all, fields(chain_a = %self.end_a.chain_id(), chain_b = %self.end_b.chain_id()))]
    async fn do_check_and_relay(
        &self,
        relay_from: RelayedHeights,
        timeout_threshold_blocks: u64,
        timeout_threshold_seconds: u64,
    ) -> Result<(RelayedHeights, RelayInfo), ChainError> {
        let (client_a, client_b) = (self.end_a.client(), self.end_b.client());

        let (packet_height_a, packet_height_b, packets_a, packets_b) = try_join!(
            client_a.current_height(),
            client_b.current_height(),
            self.get_pending_packets(Side::A, QueryOpts::from_height(relay_from.packet_height_a)),
            self.get_pending_packets(Side::B, QueryOpts::from_height(relay_from.packet_height_b))
        )?;

        // Packets from A time out on B and vice versa.
        let (cutoff_height_a, cutoff_time_a, cutoff_height_b, cutoff_time_b) = try_join!(
            client_b.timeout_height(timeout_threshold_blocks),
            client_b.current_time(),
            client_a.timeout_height(timeout_threshold_blocks),
            client_a.current_time()
        )?;
        let (submit_a, timeout_a) = split_pending_packets(
            cutoff_height_a,
            unix_secs(cutoff_time_a) + timeout_threshold_seconds,
            packets_a,
        );
        let (submit_b, timeout_b) = split_pending_packets(
            cutoff_height_b,
            unix_secs(cutoff_time_b) + timeout_threshold_seconds,
            packets_b,
        );

        let (written_b, written_a) = try_join!(
            self.relay_packets(Side::A, &submit_a),
            self.relay_packets(Side::B, &submit_b)
        )?;
        for (side, submitted, acks_written) in [
            (Side::A, submit_a.len(), written_b.len()),
            (Side::B, submit_b.len(), written_a.len()),
        ] {
            let (src, dest) = self.get_ends(side);
            tracing::info!(
                src = %src.chain_id(),
                dst = %dest.chain_id(),
                submitted,
                acks_written,
                "Relayed packets"
            );
        }

        join!(client_a.wait_for_indexer(), client_b.wait_for_indexer());

        let (ack_height_a, ack_height_b, acks_a, acks_b) = try_join!(
            client_a.current_height(),
            client_b.current_height(),
            self.get_pending_acks(Side::A, QueryOpts::from_height(relay_from.ack_height_a)),
            self.get_pending_acks(Side::B, QueryOpts::from_height(relay_from.ack_height_b))
        )?;
        try_join!(
            self.relay_acks(Side::A, &acks_a),
            self.relay_acks(Side::B, &acks_b)
        )?;

        if !timeout_a.is_empty() || !timeout_b.is_empty() {
            tracing::info!(
                timeouts_a = timeout_a.len(),
                timeouts_b = timeout_b.len(),
                "Timing out packets"
            );
        }
        try_join!(
            self.timeout_packets(Side::A, &timeout_a),
            self.timeout_packets(Side::B, &timeout_b)
        )?;

        Ok((
            RelayedHeights {
                packet_height_a: Some(packet_height_a),
                packet_height_b: Some(packet_height_b),
                ack_height_a: Some(ack_height_a),
                ack_height_b: Some(ack_height_b),
            },
            RelayInfo {
                packets_from_a: submit_a.len(),
                packets_from_b: submit_b.len(),
                acks_from_a: acks_a.len(),
                acks_from_b: acks_b.len(),
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn pending(sequence: u64, timeout_height: TimeoutHeight, timeout_timestamp: u64) -> PacketWithMetadata {
        PacketWithMetadata {
            packet: Packet {
                sequence,
                source_port: "transfer".into(),
                source_channel: "channel-0".into(),
                destination_port: "transfer".into(),
                destination_channel: "channel-0".into(),
                data: vec![],
                timeout_height,
                timeout_timestamp,
            },
            height: sequence,
        }
    }

    #[rstest]
    #[case::no_timeout(TimeoutHeight::Never, 0, true)]
    #[case::height_after_cutoff(TimeoutHeight::At(Height::new(1, 101)), 0, true)]
    #[case::height_at_cutoff(TimeoutHeight::At(Height::new(1, 100)), 0, false)]
    #[case::height_before_cutoff(TimeoutHeight::At(Height::new(1, 50)), 0, false)]
    #[case::newer_revision(TimeoutHeight::At(Height::new(2, 1)), 0, true)]
    #[case::time_after_cutoff(TimeoutHeight::Never, 2_001_000_000_000, true)]
    #[case::time_at_cutoff(TimeoutHeight::Never, 2_000_000_000_000, false)]
    #[case::both_but_time_expired(TimeoutHeight::At(Height::new(1, 500)), 1_000_000_000_000, false)]
    fn split_decides_by_height_and_time(
        #[case] timeout_height: TimeoutHeight,
        #[case] timeout_timestamp: u64,
        #[case] submit: bool,
    ) {
        let (to_submit, to_timeout) = split_pending_packets(
            Height::new(1, 100),
            2_000,
            vec![pending(1, timeout_height, timeout_timestamp)],
        );
        assert_eq!(to_submit.len(), usize::from(submit));
        assert_eq!(to_timeout.len(), usize::from(!submit));
    }

    #[test]
    fn split_is_exhaustive_and_disjoint() {
        let packets: Vec<_> = (1..=40)
            .map(|i| {
                let height = if i % 3 == 0 {
                    TimeoutHeight::Never
                } else {
                    TimeoutHeight::At(Height::new(1, i * 5))
                };
                let time = if i % 4 == 0 { 0 } else { i * 100_000_000_000 };
                pending(i, height, time)
            })
            .collect();

        let (to_submit, to_timeout) =
            split_pending_packets(Height::new(1, 100), 2_000, packets.clone());
        assert_eq!(to_submit.len() + to_timeout.len(), packets.len());

        let submitted: HashSet<u64> = to_submit.iter().map(|p| p.packet.sequence).collect();
        let timed_out: HashSet<u64> = to_timeout.iter().map(|p| p.packet.sequence).collect();
        assert!(submitted.is_disjoint(&timed_out));
        assert!(!submitted.is_empty());
        assert!(!timed_out.is_empty());
    }
}

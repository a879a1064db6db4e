//! One side of a [`Link`](crate::link::Link): a chain client bound to its client and
//! connection towards the counterparty.

use futures::{future::try_join_all, try_join};

use crate::{
    chain::ChainClient,
    error::ChainError,
    events::{self, Event},
    identifiers::{ChainId, ClientId, ConnectionId},
    packet::{AckWithMetadata, PacketWithMetadata},
};

/// Height window of an event search. Both bounds are inclusive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueryOpts {
    /// Ignore events below this height.
    pub min_height: Option<u64>,
    /// Ignore events above this height.
    pub max_height: Option<u64>,
}

impl QueryOpts {
    /// Only a lower bound.
    #[must_use]
    pub const fn from_height(min_height: Option<u64>) -> Self {
        Self {
            min_height,
            max_height: None,
        }
    }

    fn query(&self, base: &str, height_key: &str) -> String {
        let mut query = base.to_string();
        if let Some(min) = self.min_height {
            query.push_str(&format!(" AND {height_key}>={min}"));
        }
        if let Some(max) = self.max_height {
            query.push_str(&format!(" AND {height_key}<={max}"));
        }
        query
    }
}

/// A chain seen through one IBC connection. Immutable once created.
#[derive(Clone, Debug)]
pub struct Endpoint {
    client: ChainClient,
    client_id: ClientId,
    connection_id: ConnectionId,
}

impl Endpoint {
    /// Binds `client` to its light client of the counterparty and the connection over it.
    #[must_use]
    pub const fn new(client: ChainClient, client_id: ClientId, connection_id: ConnectionId) -> Self {
        Self {
            client,
            client_id,
            connection_id,
        }
    }

    /// The chain client.
    #[must_use]
    pub const fn client(&self) -> &ChainClient {
        &self.client
    }

    /// The light client of the counterparty hosted on this chain.
    #[must_use]
    pub const fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// The connection to the counterparty.
    #[must_use]
    pub const fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// The chain id.
    #[must_use]
    pub const fn chain_id(&self) -> &ChainId {
        self.client.chain_id()
    }

    /// Every packet sent over this connection within the window.
    ///
    /// Packets found through transaction events come first, followed by those found in
    /// block events. The two sources are not deduplicated against each other.
    ///
    /// # Errors
    /// Returns an error if a search fails or an event is malformed.
    #[tracing::instrument(skip_all, fields(chain_id = %self.chain_id(), connection_id = %self.connection_id))]
    pub async fn query_sent_packets(
        &self,
        opts: QueryOpts,
    ) -> Result<Vec<PacketWithMetadata>, ChainError> {
        let (mut packets, from_blocks) = try_join!(
            self.sent_packets_from_txs(opts),
            self.sent_packets_from_blocks(opts)
        )?;
        tracing::debug!(
            from_txs = packets.len(),
            from_blocks = from_blocks.len(),
            "Found sent packets"
        );
        packets.extend(from_blocks);
        Ok(packets)
    }

    /// Every acknowledgement written on this chain for packets arriving over this connection.
    ///
    /// # Errors
    /// Returns an error if the search fails or an event is malformed.
    #[tracing::instrument(skip_all, fields(chain_id = %self.chain_id(), connection_id = %self.connection_id))]
    pub async fn query_written_acks(
        &self,
        opts: QueryOpts,
    ) -> Result<Vec<AckWithMetadata>, ChainError> {
        let query = opts.query(
            &format!(
                "{}.packet_connection='{}'",
                events::WRITE_ACKNOWLEDGEMENT,
                self.connection_id
            ),
            "tx.height",
        );
        let txs = self.client.tx_search_all(&query).await?;

        let mut acks = Vec::new();
        for tx in txs {
            let on_connection = self.events_on_connection(&tx.events);
            for ack in events::parse_acks_from_events(&on_connection)? {
                acks.push(AckWithMetadata::new(
                    ack,
                    tx.height,
                    tx.hash.clone(),
                    tx.events.clone(),
                ));
            }
        }
        tracing::debug!(acks = acks.len(), "Found written acknowledgements");
        Ok(acks)
    }

    async fn sent_packets_from_txs(
        &self,
        opts: QueryOpts,
    ) -> Result<Vec<PacketWithMetadata>, ChainError> {
        let query = opts.query(&self.send_packet_query(), "tx.height");
        let txs = self.client.tx_search_all(&query).await?;

        let mut packets = Vec::new();
        for tx in txs {
            let on_connection = self.events_on_connection(&tx.events);
            packets.extend(
                events::parse_packets_from_events(&on_connection)?
                    .into_iter()
                    .map(|packet| PacketWithMetadata {
                        packet,
                        height: tx.height,
                    }),
            );
        }
        Ok(packets)
    }

    async fn sent_packets_from_blocks(
        &self,
        opts: QueryOpts,
    ) -> Result<Vec<PacketWithMetadata>, ChainError> {
        let query = opts.query(&self.send_packet_query(), "block.height");
        let heights = self.client.block_search_all(&query).await?;
        let blocks = try_join_all(heights.into_iter().map(|h| self.client.block_results(h))).await?;

        let mut packets = Vec::new();
        for block in blocks {
            let on_connection = self.events_on_connection(&block.block_events);
            packets.extend(
                events::parse_packets_from_events(&on_connection)?
                    .into_iter()
                    .map(|packet| PacketWithMetadata {
                        packet,
                        height: block.height,
                    }),
            );
        }
        Ok(packets)
    }

    fn send_packet_query(&self) -> String {
        format!(
            "{}.packet_connection='{}'",
            events::SEND_PACKET,
            self.connection_id
        )
    }

    /// Drops events that name a different connection. Events without a
    /// `packet_connection` attribute are kept.
    fn events_on_connection(&self, events: &[Event]) -> Vec<Event> {
        events
            .iter()
            .filter(|event| {
                event
                    .attribute("packet_connection")
                    .map_or(true, |conn| conn == self.connection_id.as_str())
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_appends_height_bounds() {
        let base = "send_packet.packet_connection='connection-0'";
        assert_eq!(QueryOpts::default().query(base, "tx.height"), base);
        assert_eq!(
            QueryOpts {
                min_height: Some(5),
                max_height: Some(9)
            }
            .query(base, "block.height"),
            "send_packet.packet_connection='connection-0' AND block.height>=5 AND block.height<=9"
        );
        assert_eq!(
            QueryOpts::from_height(Some(3)).query(base, "tx.height"),
            "send_packet.packet_connection='connection-0' AND tx.height>=3"
        );
    }
}

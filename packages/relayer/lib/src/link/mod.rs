//! A pair of [`Endpoint`]s forming one IBC connection between two chains.
//!
//! [`Link`] drives the handshakes, keeps both light clients fresh and relays packets,
//! acknowledgements and timeouts. Every operation is written once against a
//! `(src, dest)` pair selected by a [`Side`].

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    endpoint::Endpoint,
    identifiers::{ChannelId, PortId},
    packet::Packet,
    side::Side,
};

mod clients;
mod handshake;
mod relay;
#[cfg(test)]
mod tests;

pub use handshake::{assert_headers_match_consensus_state, ChannelHandshake, ConnectionHandshake};
pub use relay::split_pending_packets;

/// Decides whether a packet is relayed. Packets it rejects are skipped silently.
pub type PacketFilter = Arc<dyn Fn(&Packet) -> bool + Send + Sync>;

/// One end of a channel.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// The port.
    pub port_id: PortId,
    /// The channel.
    pub channel_id: ChannelId,
}

/// Both ends of an open channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPair {
    /// The end on the chain that initiated the handshake.
    pub src: ChannelInfo,
    /// The end on the counterparty.
    pub dest: ChannelInfo,
}

/// Lower bounds for the next discovery queries, returned by each relay cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayedHeights {
    /// Search packets sent on A from this height.
    pub packet_height_a: Option<u64>,
    /// Search packets sent on B from this height.
    pub packet_height_b: Option<u64>,
    /// Search acknowledgements written on A from this height.
    pub ack_height_a: Option<u64>,
    /// Search acknowledgements written on B from this height.
    pub ack_height_b: Option<u64>,
}

/// What one relay cycle did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayInfo {
    /// Packets sent on A and submitted to B.
    pub packets_from_a: usize,
    /// Packets sent on B and submitted to A.
    pub packets_from_b: usize,
    /// Acknowledgements written on A and relayed to B.
    pub acks_from_a: usize,
    /// Acknowledgements written on B and relayed to A.
    pub acks_from_b: usize,
}

/// An open connection between two chains.
#[derive(Clone)]
pub struct Link {
    end_a: Endpoint,
    end_b: Endpoint,
    packet_filter: Option<PacketFilter>,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("end_a", &self.end_a)
            .field("end_b", &self.end_b)
            .field("packet_filter", &self.packet_filter.is_some())
            .finish()
    }
}

impl Link {
    /// Pairs two endpoints without checking them. Use
    /// [`Link::create_with_existing_connections`] for untrusted input.
    pub(crate) const fn new(end_a: Endpoint, end_b: Endpoint) -> Self {
        Self {
            end_a,
            end_b,
            packet_filter: None,
        }
    }

    /// The endpoint on chain A.
    #[must_use]
    pub const fn end_a(&self) -> &Endpoint {
        &self.end_a
    }

    /// The endpoint on chain B.
    #[must_use]
    pub const fn end_b(&self) -> &Endpoint {
        &self.end_b
    }

    /// The endpoint on `side`.
    #[must_use]
    pub const fn endpoint(&self, side: Side) -> &Endpoint {
        match side {
            Side::A => &self.end_a,
            Side::B => &self.end_b,
        }
    }

    /// `(src, dest)` for an operation originating on `side`.
    #[must_use]
    pub const fn get_ends(&self, side: Side) -> (&Endpoint, &Endpoint) {
        (self.endpoint(side), self.endpoint(side.other()))
    }

    /// Only relay packets accepted by `filter`.
    pub fn set_packet_filter(&mut self, filter: PacketFilter) {
        self.packet_filter = Some(filter);
    }

    /// Relay every packet again.
    pub fn clear_packet_filter(&mut self) {
        self.packet_filter = None;
    }

    fn accepts(&self, packet: &Packet) -> bool {
        self.packet_filter
            .as_ref()
            .map_or(true, |filter| filter(packet))
    }
}

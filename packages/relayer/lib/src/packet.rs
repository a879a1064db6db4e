//! IBC packets and acknowledgements as seen by the relayer.

use ibc_proto::ibc::core::channel::v1::Packet as RawPacket;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    events::Event,
    height::TimeoutHeight,
    identifiers::{ChannelId, PortId},
};

/// An IBC packet committed on its source chain.
#[serde_with::serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    /// The per-channel sequence number.
    pub sequence: u64,
    /// The port on the sending chain.
    pub source_port: PortId,
    /// The channel on the sending chain.
    pub source_channel: ChannelId,
    /// The port on the receiving chain.
    pub destination_port: PortId,
    /// The channel on the receiving chain.
    pub destination_channel: ChannelId,
    /// Opaque application data.
    #[serde_as(as = "serde_with::hex::Hex")]
    pub data: Vec<u8>,
    /// Destination height at which the packet times out.
    pub timeout_height: TimeoutHeight,
    /// Destination time in nanoseconds at which the packet times out, 0 for none.
    pub timeout_timestamp: u64,
}

impl Packet {
    /// The commitment the sending chain stores for this packet.
    ///
    /// `sha256(timeout_timestamp || timeout_revision || timeout_height || sha256(data))`,
    /// all integers big endian.
    #[must_use]
    pub fn commitment(&self) -> Vec<u8> {
        let timeout = self.timeout_height.height().unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(self.timeout_timestamp.to_be_bytes());
        hasher.update(timeout.revision_number.to_be_bytes());
        hasher.update(timeout.revision_height.to_be_bytes());
        hasher.update(Sha256::digest(&self.data));
        hasher.finalize().to_vec()
    }

    /// Whether the packet has a timestamp timeout at or before `time_nanos`.
    #[must_use]
    pub const fn timestamp_expired(&self, time_nanos: u64) -> bool {
        self.timeout_timestamp != 0 && self.timeout_timestamp <= time_nanos
    }
}

/// The commitment stored for an acknowledgement.
#[must_use]
pub fn ack_commitment(acknowledgement: &[u8]) -> Vec<u8> {
    Sha256::digest(acknowledgement).to_vec()
}

impl From<RawPacket> for Packet {
    fn from(raw: RawPacket) -> Self {
        Self {
            sequence: raw.sequence,
            source_port: raw.source_port.into(),
            source_channel: raw.source_channel.into(),
            destination_port: raw.destination_port.into(),
            destination_channel: raw.destination_channel.into(),
            data: raw.data,
            timeout_height: raw.timeout_height.into(),
            timeout_timestamp: raw.timeout_timestamp,
        }
    }
}

impl From<Packet> for RawPacket {
    fn from(packet: Packet) -> Self {
        Self {
            sequence: packet.sequence,
            source_port: packet.source_port.into(),
            source_channel: packet.source_channel.into(),
            destination_port: packet.destination_port.into(),
            destination_channel: packet.destination_channel.into(),
            data: packet.data,
            timeout_height: packet.timeout_height.into(),
            timeout_timestamp: packet.timeout_timestamp,
        }
    }
}

/// A packet together with the height of the block that committed it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacketWithMetadata {
    /// The packet.
    pub packet: Packet,
    /// The source chain height of the `send_packet` event.
    pub height: u64,
}

/// An acknowledgement written by the receiving chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ack {
    /// The packet this acknowledges.
    pub original_packet: Packet,
    /// The raw acknowledgement bytes.
    pub acknowledgement: Vec<u8>,
}

/// An acknowledgement with the transaction that wrote it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AckWithMetadata {
    /// The packet this acknowledges.
    pub original_packet: Packet,
    /// The raw acknowledgement bytes.
    pub acknowledgement: Vec<u8>,
    /// The height of the block that wrote the acknowledgement.
    pub height: u64,
    /// The hash of the transaction that wrote the acknowledgement.
    pub tx_hash: String,
    /// All events of that transaction.
    pub tx_events: Vec<Event>,
}

impl AckWithMetadata {
    /// Attaches transaction metadata to an acknowledgement.
    #[must_use]
    pub fn new(ack: Ack, height: u64, tx_hash: String, tx_events: Vec<Event>) -> Self {
        Self {
            original_packet: ack.original_packet,
            acknowledgement: ack.acknowledgement,
            height,
            tx_hash,
            tx_events,
        }
    }
}

impl From<&AckWithMetadata> for Ack {
    fn from(ack: &AckWithMetadata) -> Self {
        Self {
            original_packet: ack.original_packet.clone(),
            acknowledgement: ack.acknowledgement.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::height::Height;

    fn packet(timeout_height: TimeoutHeight) -> Packet {
        Packet {
            sequence: 1,
            source_port: "transfer".into(),
            source_channel: "channel-0".into(),
            destination_port: "transfer".into(),
            destination_channel: "channel-1".into(),
            data: b"{}".to_vec(),
            timeout_height,
            timeout_timestamp: 0,
        }
    }

    #[test]
    fn raw_packet_without_timeout_height_has_none() {
        let raw = RawPacket::from(packet(TimeoutHeight::Never));
        assert_eq!(raw.timeout_height, Some(Default::default()));
        assert_eq!(Packet::from(raw).timeout_height, TimeoutHeight::Never);
    }

    #[test]
    fn commitment_depends_on_timeout() {
        let never = packet(TimeoutHeight::Never);
        let at = packet(TimeoutHeight::At(Height::new(1, 100)));
        assert_eq!(never.commitment().len(), 32);
        assert_ne!(never.commitment(), at.commitment());
    }

    #[test]
    fn data_is_hex_encoded_in_json() {
        let p = packet(TimeoutHeight::At(Height::new(1, 100)));
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["data"], "7b7d");
        assert_eq!(serde_json::from_value::<Packet>(json).unwrap(), p);
    }

    #[test]
    fn zero_timestamp_never_expires() {
        let mut p = packet(TimeoutHeight::Never);
        assert!(!p.timestamp_expired(u64::MAX));
        p.timeout_timestamp = 10;
        assert!(p.timestamp_expired(10));
        assert!(!p.timestamp_expired(9));
    }
}

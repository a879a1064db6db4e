//! ABCI events and the IBC packet events the relayer consumes.

use serde::{Deserialize, Serialize};

use crate::{
    error::ChainError,
    height::TimeoutHeight,
    packet::{Ack, Packet},
};

/// Emitted by the sending chain when a packet is committed.
pub const SEND_PACKET: &str = "send_packet";
/// Emitted by the receiving chain when it writes an acknowledgement.
pub const WRITE_ACKNOWLEDGEMENT: &str = "write_acknowledgement";
/// Emitted when a light client is created.
pub const CREATE_CLIENT: &str = "create_client";
/// Emitted by the first connection handshake step.
pub const CONNECTION_OPEN_INIT: &str = "connection_open_init";
/// Emitted by the second connection handshake step.
pub const CONNECTION_OPEN_TRY: &str = "connection_open_try";
/// Emitted by the first channel handshake step.
pub const CHANNEL_OPEN_INIT: &str = "channel_open_init";
/// Emitted by the second channel handshake step.
pub const CHANNEL_OPEN_TRY: &str = "channel_open_try";

/// A single key/value attribute of an [`Event`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAttribute {
    /// The attribute key.
    pub key: String,
    /// The attribute value.
    pub value: String,
}

/// An ABCI event as returned by transaction and block queries.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// The event type, e.g. `send_packet`.
    pub kind: String,
    /// The attributes in emission order.
    pub attributes: Vec<EventAttribute>,
}

impl Event {
    /// Creates an event from `(key, value)` pairs.
    pub fn new<K, V>(kind: impl Into<String>, attributes: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            kind: kind.into(),
            attributes: attributes
                .into_iter()
                .map(|(key, value)| EventAttribute {
                    key: key.into(),
                    value: value.into(),
                })
                .collect(),
        }
    }

    /// The value of the first attribute with the given key.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|attr| attr.key == key)
            .map(|attr| attr.value.as_str())
    }

    fn require(&self, key: &str) -> Result<&str, ChainError> {
        self.attribute(key).ok_or_else(|| ChainError::MissingEvent {
            kind: self.kind.clone(),
            attribute: key.to_string(),
        })
    }
}

/// Returns the first value of `key` in the first event of type `kind`.
///
/// # Errors
/// Returns [`ChainError::MissingEvent`] when no such attribute was emitted.
pub fn find_attribute(events: &[Event], kind: &str, key: &str) -> Result<String, ChainError> {
    events
        .iter()
        .filter(|event| event.kind == kind)
        .find_map(|event| event.attribute(key))
        .map(ToString::to_string)
        .ok_or_else(|| ChainError::MissingEvent {
            kind: kind.to_string(),
            attribute: key.to_string(),
        })
}

/// Parses every `send_packet` event into a [`Packet`].
///
/// # Errors
/// Returns an error if a `send_packet` event is malformed.
pub fn parse_packets_from_events(events: &[Event]) -> Result<Vec<Packet>, ChainError> {
    events
        .iter()
        .filter(|event| event.kind == SEND_PACKET)
        .map(parse_packet)
        .collect()
}

/// Parses every `write_acknowledgement` event into an [`Ack`].
///
/// # Errors
/// Returns an error if a `write_acknowledgement` event is malformed.
pub fn parse_acks_from_events(events: &[Event]) -> Result<Vec<Ack>, ChainError> {
    events
        .iter()
        .filter(|event| event.kind == WRITE_ACKNOWLEDGEMENT)
        .map(|event| {
            Ok(Ack {
                original_packet: parse_packet(event)?,
                acknowledgement: bytes_attribute(event, "packet_ack")?,
            })
        })
        .collect()
}

/// Parses the packet fields shared by `send_packet`, `recv_packet` and
/// `write_acknowledgement` events.
///
/// # Errors
/// Returns an error if a required attribute is missing or malformed.
pub fn parse_packet(event: &Event) -> Result<Packet, ChainError> {
    let sequence = event.require("packet_sequence")?;
    let timeout_height = event
        .attribute("packet_timeout_height")
        .map_or(Ok(TimeoutHeight::Never), str::parse)?;
    let timeout_timestamp = event
        .attribute("packet_timeout_timestamp")
        .map_or(Ok(0), str::parse)
        .map_err(|e| ChainError::Decode(format!("packet_timeout_timestamp: {e}")))?;

    Ok(Packet {
        sequence: sequence
            .parse()
            .map_err(|e| ChainError::Decode(format!("packet_sequence: {e}")))?,
        source_port: event.require("packet_src_port")?.into(),
        source_channel: event.require("packet_src_channel")?.into(),
        destination_port: event.require("packet_dst_port")?.into(),
        destination_channel: event.require("packet_dst_channel")?.into(),
        data: bytes_attribute(event, "packet_data")?,
        timeout_height,
        timeout_timestamp,
    })
}

/// Reads `{key}_hex` when present, falling back to the plain `{key}` attribute.
fn bytes_attribute(event: &Event, key: &str) -> Result<Vec<u8>, ChainError> {
    if let Some(encoded) = event.attribute(&format!("{key}_hex")) {
        return hex::decode(encoded).map_err(|e| ChainError::Decode(format!("{key}_hex: {e}")));
    }
    Ok(event.require(key)?.as_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::height::Height;

    fn send_packet_event(data_attr: (&str, &str)) -> Event {
        Event::new(
            SEND_PACKET,
            [
                data_attr,
                ("packet_timeout_height", "1-1234"),
                ("packet_timeout_timestamp", "0"),
                ("packet_sequence", "7"),
                ("packet_src_port", "transfer"),
                ("packet_src_channel", "channel-0"),
                ("packet_dst_port", "transfer"),
                ("packet_dst_channel", "channel-3"),
                ("packet_connection", "connection-0"),
            ],
        )
    }

    #[test]
    fn parses_plain_and_hex_packet_data() {
        let plain = parse_packet(&send_packet_event(("packet_data", "hello"))).unwrap();
        let hexed = parse_packet(&send_packet_event(("packet_data_hex", "68656c6c6f"))).unwrap();
        assert_eq!(plain, hexed);
        assert_eq!(plain.data, b"hello");
        assert_eq!(plain.sequence, 7);
        assert_eq!(plain.timeout_height, TimeoutHeight::At(Height::new(1, 1234)));
        assert_eq!(plain.destination_channel.as_str(), "channel-3");
    }

    #[test]
    fn zero_timeout_height_is_never() {
        let mut event = send_packet_event(("packet_data", "x"));
        event.attributes[1].value = "0-0".to_string();
        assert_eq!(parse_packet(&event).unwrap().timeout_height, TimeoutHeight::Never);
    }

    #[test]
    fn parses_acks_and_ignores_other_events() {
        let mut ack = send_packet_event(("packet_data", "hello"));
        ack.kind = WRITE_ACKNOWLEDGEMENT.to_string();
        ack.attributes.push(EventAttribute {
            key: "packet_ack_hex".to_string(),
            value: hex::encode(br#"{"result":"AQ=="}"#),
        });
        let events = vec![Event::new("message", [("action", "recv")]), ack];

        let acks = parse_acks_from_events(&events).unwrap();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].acknowledgement, br#"{"result":"AQ=="}"#);
        assert!(parse_packets_from_events(&events).unwrap().is_empty());
    }

    #[test]
    fn missing_sequence_is_an_error() {
        let mut event = send_packet_event(("packet_data", "x"));
        event.attributes.retain(|attr| attr.key != "packet_sequence");
        assert!(matches!(
            parse_packet(&event),
            Err(ChainError::MissingEvent { attribute, .. }) if attribute == "packet_sequence"
        ));
    }

    #[test]
    fn find_attribute_reports_missing_event() {
        let events = vec![Event::new(CREATE_CLIENT, [("client_id", "07-tendermint-0")])];
        assert_eq!(
            find_attribute(&events, CREATE_CLIENT, "client_id").unwrap(),
            "07-tendermint-0"
        );
        assert!(find_attribute(&events, CONNECTION_OPEN_INIT, "connection_id").is_err());
    }
}

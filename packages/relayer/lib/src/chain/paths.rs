//! ICS-24 store keys and ABCI query paths.

use crate::{
    height::Height,
    identifiers::{ChannelId, ClientId, ConnectionId, PortId},
};

/// The ABCI path for raw reads of the IBC store.
pub const IBC_STORE_PATH: &str = "store/ibc/key";
/// The key prefix of the IBC store, used as the connection commitment prefix.
pub const IBC_KEY_PREFIX: &[u8] = b"ibc";

/// gRPC query for the packet sequences a channel has not received yet.
pub const UNRECEIVED_PACKETS_PATH: &str = "/ibc.core.channel.v1.Query/UnreceivedPackets";
/// gRPC query for the acknowledgements a channel has not processed yet.
pub const UNRECEIVED_ACKS_PATH: &str = "/ibc.core.channel.v1.Query/UnreceivedAcks";
/// gRPC query for the staking module parameters.
pub const STAKING_PARAMS_PATH: &str = "/cosmos.staking.v1beta1.Query/Params";

/// `clients/{client_id}/clientState`
#[must_use]
pub fn client_state(client_id: &ClientId) -> String {
    format!("clients/{client_id}/clientState")
}

/// `clients/{client_id}/consensusStates/{revision}-{height}`
#[must_use]
pub fn consensus_state(client_id: &ClientId, height: Height) -> String {
    format!("clients/{client_id}/consensusStates/{height}")
}

/// `connections/{connection_id}`
#[must_use]
pub fn connection(connection_id: &ConnectionId) -> String {
    format!("connections/{connection_id}")
}

/// `channelEnds/ports/{port_id}/channels/{channel_id}`
#[must_use]
pub fn channel_end(port_id: &PortId, channel_id: &ChannelId) -> String {
    format!("channelEnds/ports/{port_id}/channels/{channel_id}")
}

/// `commitments/ports/{port_id}/channels/{channel_id}/sequences/{sequence}`
#[must_use]
pub fn packet_commitment(port_id: &PortId, channel_id: &ChannelId, sequence: u64) -> String {
    format!("commitments/ports/{port_id}/channels/{channel_id}/sequences/{sequence}")
}

/// `acks/ports/{port_id}/channels/{channel_id}/sequences/{sequence}`
#[must_use]
pub fn packet_ack(port_id: &PortId, channel_id: &ChannelId, sequence: u64) -> String {
    format!("acks/ports/{port_id}/channels/{channel_id}/sequences/{sequence}")
}

/// `receipts/ports/{port_id}/channels/{channel_id}/sequences/{sequence}`
#[must_use]
pub fn packet_receipt(port_id: &PortId, channel_id: &ChannelId, sequence: u64) -> String {
    format!("receipts/ports/{port_id}/channels/{channel_id}/sequences/{sequence}")
}

/// `nextSequenceSend/ports/{port_id}/channels/{channel_id}`
#[must_use]
pub fn next_sequence_send(port_id: &PortId, channel_id: &ChannelId) -> String {
    format!("nextSequenceSend/ports/{port_id}/channels/{channel_id}")
}

/// `nextSequenceRecv/ports/{port_id}/channels/{channel_id}`
#[must_use]
pub fn next_sequence_recv(port_id: &PortId, channel_id: &ChannelId) -> String {
    format!("nextSequenceRecv/ports/{port_id}/channels/{channel_id}")
}

/// `nextSequenceAck/ports/{port_id}/channels/{channel_id}`
#[must_use]
pub fn next_sequence_ack(port_id: &PortId, channel_id: &ChannelId) -> String {
    format!("nextSequenceAck/ports/{port_id}/channels/{channel_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_follow_ics24() {
        let port = PortId::new("transfer");
        let channel = ChannelId::new("channel-2");
        assert_eq!(
            packet_commitment(&port, &channel, 5),
            "commitments/ports/transfer/channels/channel-2/sequences/5"
        );
        assert_eq!(
            consensus_state(&ClientId::new("07-tendermint-0"), Height::new(1, 42)),
            "clients/07-tendermint-0/consensusStates/1-42"
        );
        assert_eq!(
            next_sequence_recv(&port, &channel),
            "nextSequenceRecv/ports/transfer/channels/channel-2"
        );
    }
}

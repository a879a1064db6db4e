//! Packet lifecycle messages: receive, acknowledge, timeout and ICS20 transfers.

use ibc_link_utils::ensure;
use ibc_proto::{
    cosmos::base::v1beta1::Coin,
    ibc::{
        applications::transfer::v1::MsgTransfer,
        core::channel::v1::{MsgAcknowledgement, MsgRecvPacket, MsgTimeout},
    },
};

use super::{client::ChainClient, light_client::to_any, TxOutcome};
use crate::{
    error::ChainError,
    height::{Height, TimeoutHeight},
    identifiers::{ChannelId, PortId},
    packet::{Ack, Packet},
};

const MSG_RECV_PACKET_TYPE_URL: &str = "/ibc.core.channel.v1.MsgRecvPacket";
const MSG_ACKNOWLEDGEMENT_TYPE_URL: &str = "/ibc.core.channel.v1.MsgAcknowledgement";
const MSG_TIMEOUT_TYPE_URL: &str = "/ibc.core.channel.v1.MsgTimeout";
const MSG_TRANSFER_TYPE_URL: &str = "/ibc.applications.transfer.v1.MsgTransfer";

fn ensure_proof_count(items: usize, proofs: usize) -> Result<(), ChainError> {
    ensure!(items == proofs, ChainError::ProofCountMismatch { items, proofs });
    Ok(())
}

impl ChainClient {
    /// Delivers packets sent by the counterparty, one message per packet in a single tx.
    ///
    /// `proofs[i]` proves the commitment of `packets[i]` at `proof_height`.
    ///
    /// # Errors
    /// Returns an error if the proof count does not match or the transaction fails.
    #[tracing::instrument(skip_all, fields(chain_id = %self.chain_id(), packets = packets.len(), %proof_height))]
    pub async fn receive_packets(
        &self,
        packets: &[Packet],
        proofs: Vec<Vec<u8>>,
        proof_height: Height,
    ) -> Result<TxOutcome, ChainError> {
        ensure_proof_count(packets.len(), proofs.len())?;
        let messages = packets
            .iter()
            .zip(proofs)
            .map(|(packet, proof)| {
                let msg = MsgRecvPacket {
                    packet: Some(packet.clone().into()),
                    proof_commitment: proof,
                    proof_height: Some(proof_height.into()),
                    signer: self.sender_address().to_string(),
                };
                to_any(MSG_RECV_PACKET_TYPE_URL, &msg)
            })
            .collect();
        self.submit(messages).await
    }

    /// Delivers acknowledgements written by the counterparty.
    ///
    /// # Errors
    /// Returns an error if the proof count does not match or the transaction fails.
    #[tracing::instrument(skip_all, fields(chain_id = %self.chain_id(), acks = acks.len(), %proof_height))]
    pub async fn acknowledge_packets(
        &self,
        acks: &[Ack],
        proofs: Vec<Vec<u8>>,
        proof_height: Height,
    ) -> Result<TxOutcome, ChainError> {
        ensure_proof_count(acks.len(), proofs.len())?;
        let messages = acks
            .iter()
            .zip(proofs)
            .map(|(ack, proof)| {
                let msg = MsgAcknowledgement {
                    packet: Some(ack.original_packet.clone().into()),
                    acknowledgement: ack.acknowledgement.clone(),
                    proof_acked: proof,
                    proof_height: Some(proof_height.into()),
                    signer: self.sender_address().to_string(),
                };
                to_any(MSG_ACKNOWLEDGEMENT_TYPE_URL, &msg)
            })
            .collect();
        self.submit(messages).await
    }

    /// Times out packets this chain sent and the counterparty never received.
    ///
    /// `next_sequence_recv[i]` is the counterparty's next receive sequence on the channel
    /// of `packets[i]`.
    ///
    /// # Errors
    /// Returns an error if the input lengths differ or the transaction fails.
    #[tracing::instrument(skip_all, fields(chain_id = %self.chain_id(), packets = packets.len(), %proof_height))]
    pub async fn timeout_packets(
        &self,
        packets: &[Packet],
        proofs: Vec<Vec<u8>>,
        next_sequence_recv: Vec<u64>,
        proof_height: Height,
    ) -> Result<TxOutcome, ChainError> {
        ensure_proof_count(packets.len(), proofs.len())?;
        ensure_proof_count(packets.len(), next_sequence_recv.len())?;
        let messages = packets
            .iter()
            .zip(proofs)
            .zip(next_sequence_recv)
            .map(|((packet, proof), next_sequence_recv)| {
                let msg = MsgTimeout {
                    packet: Some(packet.clone().into()),
                    proof_unreceived: proof,
                    proof_height: Some(proof_height.into()),
                    next_sequence_recv,
                    signer: self.sender_address().to_string(),
                };
                to_any(MSG_TIMEOUT_TYPE_URL, &msg)
            })
            .collect();
        self.submit(messages).await
    }

    /// Sends an ICS20 token transfer.
    ///
    /// A zero `timeout_timestamp` disables the timestamp timeout.
    ///
    /// # Errors
    /// Returns an error if the transaction fails.
    #[tracing::instrument(skip_all, fields(chain_id = %self.chain_id(), %port_id, %channel_id))]
    pub async fn transfer_tokens(
        &self,
        port_id: &PortId,
        channel_id: &ChannelId,
        token: Coin,
        receiver: &str,
        timeout_height: TimeoutHeight,
        timeout_timestamp: u64,
    ) -> Result<TxOutcome, ChainError> {
        tracing::debug!(amount = %token.amount, denom = %token.denom, receiver, "Transferring tokens");
        let msg = MsgTransfer {
            source_port: port_id.to_string(),
            source_channel: channel_id.to_string(),
            token: Some(token),
            sender: self.sender_address().to_string(),
            receiver: receiver.to_string(),
            timeout_height: timeout_height.into(),
            timeout_timestamp,
            ..Default::default()
        };
        self.submit(vec![to_any(MSG_TRANSFER_TYPE_URL, &msg)]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proof_count_must_match() {
        assert!(ensure_proof_count(2, 2).is_ok());
        assert!(matches!(
            ensure_proof_count(3, 1),
            Err(ChainError::ProofCountMismatch { items: 3, proofs: 1 })
        ));
    }
}

//! Utilities for `07-tendermint` light clients.
//!
//! Builds client states, consensus states and update headers, and wraps IBC messages
//! into `Any`s for submission.

use std::time::Duration as StdDuration;

use ibc_proto::{
    google::protobuf::{Any, Duration, Timestamp},
    ibc::{
        core::commitment::v1::MerkleRoot,
        lightclients::tendermint::v1::{ClientState, ConsensusState, Fraction, Header},
    },
};
use prost::Message;
use tendermint::{block::signed_header::SignedHeader, validator::Set as ValidatorSet, Time};

use crate::{error::ChainError, height::Height};

/// Type URL of a tendermint client state.
pub const CLIENT_STATE_TYPE_URL: &str = "/ibc.lightclients.tendermint.v1.ClientState";
/// Type URL of a tendermint consensus state.
pub const CONSENSUS_STATE_TYPE_URL: &str = "/ibc.lightclients.tendermint.v1.ConsensusState";
/// Type URL of a tendermint update header.
pub const HEADER_TYPE_URL: &str = "/ibc.lightclients.tendermint.v1.Header";

/// Default trust level for Tendermint light clients (1/3)
#[must_use]
pub const fn default_trust_level() -> Fraction {
    Fraction {
        numerator: 1,
        denominator: 3,
    }
}

/// Default max clock drift for Tendermint light clients (20 seconds)
#[must_use]
pub const fn default_max_clock_drift() -> Duration {
    Duration {
        seconds: 20,
        nanos: 0,
    }
}

/// The recommended trusting period: 2/3 of the unbonding period.
#[must_use]
pub fn default_trusting_period(unbonding_period: StdDuration) -> StdDuration {
    unbonding_period * 2 / 3
}

/// Build a Tendermint client state with common defaults
///
/// # Arguments
/// * `chain_id` - The chain ID
/// * `height` - The latest height
/// * `trusting_period` - The trusting period
/// * `unbonding_period` - The unbonding period
///
/// Returns a `ClientState` with default trust level, max clock drift, ICS23 IAVL and
/// Tendermint proof specs and the standard upgrade path.
#[must_use]
pub fn build_tendermint_client_state(
    chain_id: String,
    height: Height,
    trusting_period: StdDuration,
    unbonding_period: StdDuration,
) -> ClientState {
    ClientState {
        chain_id,
        trust_level: Some(default_trust_level()),
        trusting_period: Some(to_proto_duration(trusting_period)),
        unbonding_period: Some(to_proto_duration(unbonding_period)),
        max_clock_drift: Some(default_max_clock_drift()),
        latest_height: Some(height.into()),
        proof_specs: vec![ics23::iavl_spec(), ics23::tendermint_spec()],
        upgrade_path: vec!["upgrade".to_string(), "upgradedIBCState".to_string()],
        ..Default::default()
    }
}

/// The consensus state a light client stores for a header.
#[must_use]
pub fn consensus_state_from_header(header: &tendermint::block::Header) -> ConsensusState {
    ConsensusState {
        timestamp: Some(to_proto_timestamp(header.time)),
        root: Some(MerkleRoot {
            hash: header.app_hash.as_bytes().to_vec(),
        }),
        next_validators_hash: header.next_validators_hash.as_bytes().to_vec(),
    }
}

/// Assembles an update header.
///
/// `trusted_validators` must be the validator set at `trusted_height + 1`: the consensus
/// state at the trusted height commits to the *next* validators hash.
#[must_use]
pub fn build_tendermint_header(
    signed_header: SignedHeader,
    validator_set: ValidatorSet,
    trusted_height: Height,
    trusted_validators: ValidatorSet,
) -> Header {
    Header {
        signed_header: Some(signed_header.into()),
        validator_set: Some(validator_set.into()),
        trusted_height: Some(trusted_height.into()),
        trusted_validators: Some(trusted_validators.into()),
    }
}

/// The height of the signed header carried by an update header.
///
/// # Errors
/// Returns an error if the header is missing or has a negative height.
pub fn header_height(header: &Header) -> Result<u64, ChainError> {
    header
        .signed_header
        .as_ref()
        .and_then(|sh| sh.header.as_ref())
        .ok_or_else(|| ChainError::Decode("update header without signed header".to_string()))
        .and_then(|h| {
            u64::try_from(h.height).map_err(|e| ChainError::InvalidHeight(e.to_string()))
        })
}

/// Wraps a protobuf message into an `Any` with the given type URL.
pub fn to_any<M: Message>(type_url: &str, msg: &M) -> Any {
    Any {
        type_url: type_url.to_string(),
        value: msg.encode_to_vec(),
    }
}

/// Decodes a tendermint client state from its `Any` encoding.
///
/// # Errors
/// Returns an error if the type URL does not match or the value cannot be decoded.
pub fn decode_client_state(any: &Any) -> Result<ClientState, ChainError> {
    decode_any(any, CLIENT_STATE_TYPE_URL)
}

/// Decodes a tendermint consensus state from its `Any` encoding.
///
/// # Errors
/// Returns an error if the type URL does not match or the value cannot be decoded.
pub fn decode_consensus_state(any: &Any) -> Result<ConsensusState, ChainError> {
    decode_any(any, CONSENSUS_STATE_TYPE_URL)
}

/// Decodes a tendermint update header from its `Any` encoding.
///
/// # Errors
/// Returns an error if the type URL does not match or the value cannot be decoded.
pub fn decode_header(any: &Any) -> Result<Header, ChainError> {
    decode_any(any, HEADER_TYPE_URL)
}

fn decode_any<M: Message + Default>(any: &Any, type_url: &str) -> Result<M, ChainError> {
    if any.type_url != type_url {
        return Err(ChainError::Decode(format!(
            "expected {type_url}, got {}",
            any.type_url
        )));
    }
    Ok(M::decode(any.value.as_slice())?)
}

/// The latest height stored in a client state.
#[must_use]
pub fn latest_height(client_state: &ClientState) -> Option<Height> {
    client_state.latest_height.as_ref().map(Height::from)
}

/// Converts a [`std::time::Duration`] to its protobuf representation.
#[must_use]
pub fn to_proto_duration(duration: StdDuration) -> Duration {
    Duration {
        seconds: i64::try_from(duration.as_secs()).unwrap_or(i64::MAX),
        nanos: i32::try_from(duration.subsec_nanos()).unwrap_or_default(),
    }
}

/// Converts a protobuf duration, clamping negative values to zero.
#[must_use]
pub fn from_proto_duration(seconds: i64, nanos: i32) -> StdDuration {
    StdDuration::new(
        u64::try_from(seconds).unwrap_or_default(),
        u32::try_from(nanos).unwrap_or_default(),
    )
}

/// Converts a tendermint time to a protobuf timestamp.
#[must_use]
pub fn to_proto_timestamp(time: Time) -> Timestamp {
    let nanos = time.unix_timestamp_nanos();
    Timestamp {
        seconds: i64::try_from(nanos.div_euclid(1_000_000_000)).unwrap_or(i64::MAX),
        nanos: i32::try_from(nanos.rem_euclid(1_000_000_000)).unwrap_or_default(),
    }
}

/// Nanoseconds since the unix epoch of a protobuf timestamp, 0 when negative.
#[must_use]
pub fn timestamp_nanos(timestamp: &Timestamp) -> u64 {
    u64::try_from(timestamp.seconds)
        .unwrap_or_default()
        .saturating_mul(1_000_000_000)
        .saturating_add(u64::try_from(timestamp.nanos).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_state_uses_defaults() {
        let unbonding = StdDuration::from_secs(21 * 24 * 3600);
        let state = build_tendermint_client_state(
            "chain-b-1".to_string(),
            Height::new(1, 10),
            default_trusting_period(unbonding),
            unbonding,
        );

        assert_eq!(state.trust_level, Some(Fraction { numerator: 1, denominator: 3 }));
        assert_eq!(state.max_clock_drift.unwrap().seconds, 20);
        assert_eq!(state.trusting_period.unwrap().seconds, 14 * 24 * 3600);
        assert_eq!(state.upgrade_path, vec!["upgrade", "upgradedIBCState"]);
        assert_eq!(state.proof_specs.len(), 2);
        assert_eq!(latest_height(&state), Some(Height::new(1, 10)));
    }

    #[test]
    fn any_round_trip_checks_type_url() {
        let state = ConsensusState {
            next_validators_hash: vec![1; 32],
            ..Default::default()
        };
        let any = to_any(CONSENSUS_STATE_TYPE_URL, &state);
        assert_eq!(decode_consensus_state(&any).unwrap(), state);
        assert!(decode_client_state(&any).is_err());
    }

    #[test]
    fn timestamps_split_seconds_and_nanos() {
        let time = Time::from_unix_timestamp(1_700_000_000, 250).unwrap();
        let ts = to_proto_timestamp(time);
        assert_eq!(ts.seconds, 1_700_000_000);
        assert_eq!(ts.nanos, 250);
        assert_eq!(timestamp_nanos(&ts), 1_700_000_000_000_000_250);
    }
}

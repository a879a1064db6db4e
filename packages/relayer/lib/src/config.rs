//! Configuration for chain clients and relay loops.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::DurationMilliSeconds;

use crate::error::RelayerError;

/// Timing parameters of a [`ChainClient`](crate::chain::ChainClient).
///
/// Durations are serialized as milliseconds.
#[serde_with::serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::module_name_repetitions)]
pub struct ChainClientConfig {
    /// How often to poll the node while waiting for the next block.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_block_time")]
    pub estimated_block_time: Duration,
    /// How long the node's tx indexer needs to catch up after a block.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_indexer_time")]
    pub estimated_indexer_time: Duration,
    /// Upper bound for waiting on a new block.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_block_wait_timeout")]
    pub block_wait_timeout: Duration,
    /// Transaction broadcast settings.
    #[serde(default)]
    pub broadcast: BroadcastConfig,
}

/// How long to wait for a broadcast transaction to be included.
#[serde_with::serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::module_name_repetitions)]
pub struct BroadcastConfig {
    /// The interval between inclusion checks.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// Give up after this long.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_broadcast_timeout")]
    pub timeout: Duration,
}

/// Parameters for a caller driven relay loop over a [`Link`](crate::link::Link).
#[serde_with::serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::module_name_repetitions)]
pub struct LinkConfig {
    /// Update a light client when its newest consensus state is older than this.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_max_client_age")]
    pub max_client_age: Duration,
    /// Packets timing out within this many destination blocks are timed out instead of relayed.
    #[serde(default = "default_timeout_threshold_blocks")]
    pub timeout_threshold_blocks: u64,
    /// Packets timing out within this many seconds are timed out instead of relayed.
    #[serde(default = "default_timeout_threshold_seconds")]
    pub timeout_threshold_seconds: u64,
}

const fn default_block_time() -> Duration {
    Duration::from_millis(400)
}

const fn default_indexer_time() -> Duration {
    Duration::from_millis(500)
}

const fn default_block_wait_timeout() -> Duration {
    Duration::from_secs(60)
}

const fn default_poll_interval() -> Duration {
    Duration::from_millis(300)
}

const fn default_broadcast_timeout() -> Duration {
    Duration::from_secs(60)
}

const fn default_max_client_age() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

const fn default_timeout_threshold_blocks() -> u64 {
    2
}

const fn default_timeout_threshold_seconds() -> u64 {
    6
}

impl Default for ChainClientConfig {
    fn default() -> Self {
        Self {
            estimated_block_time: default_block_time(),
            estimated_indexer_time: default_indexer_time(),
            block_wait_timeout: default_block_wait_timeout(),
            broadcast: BroadcastConfig::default(),
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            timeout: default_broadcast_timeout(),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_client_age: default_max_client_age(),
            timeout_threshold_blocks: default_timeout_threshold_blocks(),
            timeout_threshold_seconds: default_timeout_threshold_seconds(),
        }
    }
}

/// Parse a configuration value into the target struct while producing
/// detailed path-aware error messages.
///
/// # Errors
/// Returns [`RelayerError::Config`] with the JSON path of the failing field.
pub fn parse_config<T>(value: serde_json::Value) -> Result<T, RelayerError>
where
    T: serde::de::DeserializeOwned,
{
    let json_string = value.to_string();

    let mut deserializer = serde_json::Deserializer::from_str(&json_string);
    serde_path_to_error::deserialize::<_, T>(&mut deserializer)
        .map_err(|e| RelayerError::Config(format!("config error at {}: {}", e.path(), e)))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn empty_object_uses_defaults() {
        let config: ChainClientConfig = parse_config(json!({})).unwrap();
        assert_eq!(config, ChainClientConfig::default());
        assert_eq!(config.estimated_block_time, Duration::from_millis(400));
        assert_eq!(config.broadcast.timeout, Duration::from_secs(60));
    }

    #[test]
    fn durations_are_milliseconds() {
        let config: ChainClientConfig = parse_config(json!({
            "estimated_block_time": 1000,
            "broadcast": { "poll_interval": 50 }
        }))
        .unwrap();
        assert_eq!(config.estimated_block_time, Duration::from_secs(1));
        assert_eq!(config.broadcast.poll_interval, Duration::from_millis(50));
        assert_eq!(config.broadcast.timeout, Duration::from_secs(60));
    }

    #[test]
    fn durations_serialize_as_milliseconds() {
        let json = serde_json::to_value(LinkConfig::default()).unwrap();
        assert_eq!(json["max_client_age"], 86_400_000);
        assert_eq!(parse_config::<LinkConfig>(json).unwrap(), LinkConfig::default());
    }

    #[test]
    fn error_names_the_failing_path() {
        let err = parse_config::<LinkConfig>(json!({ "timeout_threshold_blocks": "soon" }))
            .unwrap_err();
        match err {
            RelayerError::Config(msg) => assert!(msg.contains("timeout_threshold_blocks"), "{msg}"),
            other => panic!("unexpected error: {other}"),
        }
    }
}

#![doc = include_str!("../README.md")]
#![deny(
    clippy::nursery,
    clippy::pedantic,
    warnings,
    missing_docs,
    unused_crate_dependencies
)]

pub mod chain;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod height;
pub mod identifiers;
pub mod link;
pub mod packet;
pub mod side;
pub mod state;
pub mod utils;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use chain::{ChainClient, ChainRpc};
pub use endpoint::{Endpoint, QueryOpts};
pub use error::{ChainError, ProtocolStateError, RelayerError};
pub use height::{Height, TimeoutHeight};
pub use link::{ChannelInfo, ChannelPair, Link, PacketFilter, RelayInfo, RelayedHeights};
pub use packet::{AckWithMetadata, Packet, PacketWithMetadata};
pub use side::Side;

//! In-memory chains for exercising a [`Link`](crate::link::Link) without nodes.

mod ibc;
mod mock_chain;

pub use ibc::SUCCESS_ACK;
pub use mock_chain::{MockChain, BLOCK_SECS, UNBONDING_SECS};

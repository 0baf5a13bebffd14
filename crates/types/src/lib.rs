//! Shared types for the Goldcoin node: network parameters, block structures
//! and the peer-to-peer wire codec.

pub use block::{Block, BlockHeader, VERSION_AUX_POW};
pub use messages::{IngestMessage, NodeEvent};

pub mod block;
mod consensus;
pub mod messages;
pub mod network;

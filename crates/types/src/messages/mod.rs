use std::net::SocketAddr;

use bitcoin::network::constants::ServiceFlags;
use bitcoin::Transaction;

use crate::block::{Block, BlockHeader};

pub mod p2p;

/// Items pushed onto the ingestion queue by the peer-to-peer layer and
/// consumed by the chain worker. No validation happens in-session; payloads
/// are handed over as received.
#[derive(Clone, Debug)]
pub enum IngestMessage {
    /// A transaction received from the given peer.
    Tx(Transaction, SocketAddr),
    /// A block received from the given peer.
    Block(Block, SocketAddr),
    /// Headers received from the given peer. Each one is processed as a
    /// block ingestion item.
    Headers(Vec<BlockHeader>, SocketAddr),
}

/// Events published to node subscribers.
#[derive(Clone, Debug)]
pub enum NodeEvent {
    /// A peer completed the handshake.
    Connected {
        /// Remote address.
        addr: SocketAddr,
        /// Whether we dialed the peer.
        outbound: bool,
        /// The peer's user agent.
        user_agent: String,
        /// Negotiated protocol version.
        version: u32,
        /// The peer's advertised chain height.
        height: i32,
    },
    /// A peer connection was torn down.
    Disconnected {
        /// Remote address.
        addr: SocketAddr,
        /// Human-readable reason.
        reason: String,
    },
    /// A peer address was learned.
    Addr {
        /// The advertised address.
        addr: SocketAddr,
        /// Services the address claims to provide.
        services: ServiceFlags,
        /// Last-seen time, as seconds since epoch.
        time: u32,
    },
}

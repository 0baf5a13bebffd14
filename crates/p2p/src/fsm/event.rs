//! State machine events.
use crate::net::LocalTime;

use crate::fsm::{
    addrmgr::Event as AddressEvent, invmgr::Event as InventoryEvent, peermgr::Event as PeerEvent,
    pingmgr::Event as PingEvent, syncmgr::Event as ChainEvent,
};

/// A peer-to-peer event.
#[derive(Debug, Clone)]
pub enum Event {
    /// The node is initializing its state machine and about to start
    /// network activity.
    Initializing,
    /// The node is initialized and ready.
    Ready {
        /// Block height of the local chain.
        height: i64,
        /// Local time.
        time: LocalTime,
    },
    /// An address manager event.
    Address(AddressEvent),
    /// A peer manager event.
    Peer(PeerEvent),
    /// An inventory manager event.
    Inventory(InventoryEvent),
    /// A ping manager event.
    Ping(PingEvent),
    /// A chain sync event.
    Chain(ChainEvent),
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<PeerEvent> for Event {
    fn from(e: PeerEvent) -> Self {
        Self::Peer(e)
    }
}

impl From<AddressEvent> for Event {
    fn from(e: AddressEvent) -> Self {
        Self::Address(e)
    }
}

impl From<InventoryEvent> for Event {
    fn from(e: InventoryEvent) -> Self {
        Self::Inventory(e)
    }
}

impl From<PingEvent> for Event {
    fn from(e: PingEvent) -> Self {
        Self::Ping(e)
    }
}

impl From<ChainEvent> for Event {
    fn from(e: ChainEvent) -> Self {
        Self::Chain(e)
    }
}

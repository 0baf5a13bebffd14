//! Inventory manager.
//!
//! Takes care of the inventory work queue: announcements from peers are
//! queued until a `getdata` decision, and `getdata` requests from peers are
//! served from the chain store and the relay cache.
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use tracing::debug;

use bitcoin::network::constants::ServiceFlags;
use bitcoin::{Transaction, Txid};

use gold_chain::ChainStore;
use gold_types::messages::p2p::Inventory;

use crate::{
    common::collections::AddressBook,
    common::time::Clock,
    fsm::handler::{PeerId, Socket},
    net::{LocalDuration, LocalTime},
};

use super::output::{SetTimer, Wire};

/// Time before a relayed transaction is evicted from the relay cache.
pub const RELAY_CACHE_TTL: LocalDuration = LocalDuration::from_mins(30);

/// Time between queue processing runs.
const TICK_INTERVAL: LocalDuration = LocalDuration::from_secs(1);

/// An event emitted by the inventory manager.
#[derive(Debug, Clone)]
pub enum Event {
    /// A transaction was announced to our peers.
    TxRelayed {
        /// The announced transaction ID.
        txid: Txid,
        /// Number of peers the announcement went to.
        peers: usize,
    },
    /// Inventories were requested from a peer.
    Requested {
        /// The requested inventory.
        inv: Inventory,
        /// The peer the request went to.
        peer: PeerId,
    },
}

impl std::fmt::Display for Event {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::TxRelayed { txid, peers } => {
                write!(fmt, "Transaction {} was relayed to {} peer(s)", txid, peers)
            }
            Event::Requested { inv, peer } => {
                write!(fmt, "Requested {:?} from peer {}", inv, peer)
            }
        }
    }
}

/// Inventory manager peer.
#[derive(Debug)]
pub struct Peer {
    /// Is this peer a transaction relay?
    pub relay: bool,
    /// Peer announced services.
    pub services: ServiceFlags,

    /// Peer socket.
    _socket: Socket,
}

/// Inventory manager state.
#[derive(Debug)]
pub struct InventoryManager<T, U, C> {
    /// Peer map.
    peers: AddressBook<PeerId, Peer>,
    /// Announcements awaiting a `getdata` decision, in arrival order.
    /// Bounded: announcements arriving while full are dropped.
    queue: VecDeque<(Inventory, PeerId)>,
    /// Bound on the inventory queue.
    max_inv: usize,
    /// Short-lived transactions relayed without store persistence.
    relay: HashMap<Txid, (Transaction, LocalTime)>,
    /// How many peers announced each tracked transaction.
    propagation: HashMap<Txid, usize>,

    store: T,
    upstream: U,
    clock: C,
}

impl<T: ChainStore, U: Wire<Event> + SetTimer, C: Clock> InventoryManager<T, U, C> {
    /// Create a new inventory manager.
    pub fn new(max_inv: usize, store: T, rng: fastrand::Rng, upstream: U, clock: C) -> Self {
        Self {
            peers: AddressBook::new(rng),
            queue: VecDeque::new(),
            max_inv,
            relay: HashMap::new(),
            propagation: HashMap::new(),
            store,
            upstream,
            clock,
        }
    }

    /// Called when a peer is negotiated.
    pub fn peer_negotiated(&mut self, socket: Socket, services: ServiceFlags, relay: bool) {
        self.peers.insert(
            socket.addr,
            Peer {
                services,
                relay,
                _socket: socket,
            },
        );
    }

    /// Called when a peer disconnected.
    pub fn peer_disconnected(&mut self, id: &PeerId) {
        self.peers.remove(id);
    }

    /// Whether the peer is tracked.
    pub fn is_connected(&self, addr: &SocketAddr) -> bool {
        self.peers.contains_key(addr)
    }

    /// Number of queued announcements.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Called when an `inv` message is received.
    ///
    /// Tracked transactions bump their propagation count. Announcements are
    /// queued for a `getdata` decision; when the queue is full they are
    /// dropped, not blocked on.
    pub fn received_inv(&mut self, addr: PeerId, inventories: Vec<Inventory>) {
        for inv in inventories {
            if let Inventory::Tx(txid) = &inv {
                if let Some(count) = self.propagation.get_mut(txid) {
                    *count += 1;
                }
            }
            if self.queue.len() >= self.max_inv {
                debug!(target: "p2p", "{}: Inventory queue is full, dropping {:?}", addr, inv);
                continue;
            }
            self.queue.push_back((inv, addr));
        }
        self.upstream.set_timer(TICK_INTERVAL);
    }

    /// Called when a `getdata` message is received. Serves transactions
    /// from the chain store, falling back to the relay cache; blocks from
    /// the store only. Unknown hashes are silently ignored.
    pub fn received_getdata(&mut self, addr: PeerId, inventories: Vec<Inventory>) {
        for inv in inventories {
            match inv {
                Inventory::Tx(txid) => {
                    let tx = self
                        .store
                        .tx(&txid)
                        .or_else(|| self.relay.get(&txid).map(|(tx, _)| tx.clone()));

                    if let Some(tx) = tx {
                        self.upstream.tx(addr, tx);
                    }
                }
                Inventory::Block(hash) => {
                    if let Some(block) = self.store.block(&hash) {
                        self.upstream.block(addr, block);
                    }
                }
            }
        }
    }

    /// Relay a transaction: remember it in the relay cache, start tracking
    /// its propagation, and announce it to all peers.
    pub fn relay(&mut self, tx: Transaction) {
        let txid = tx.txid();
        let now = self.clock.local_time();

        self.relay.insert(txid, (tx, now));
        self.propagation.entry(txid).or_insert(0);

        let peers: Vec<_> = self.peers.keys().copied().collect();
        for peer in &peers {
            self.upstream.inv(*peer, vec![Inventory::Tx(txid)]);
        }
        self.upstream.event(Event::TxRelayed {
            txid,
            peers: peers.len(),
        });
    }

    /// Number of peers that announced the given transaction, if tracked.
    pub fn propagation(&self, txid: &Txid) -> Option<usize> {
        self.propagation.get(txid).copied()
    }

    /// Called on a timer wake. Makes `getdata` decisions for queued
    /// announcements, in arrival order, and evicts stale relay entries.
    pub fn received_wake(&mut self) {
        let now = self.clock.local_time();

        while let Some((inv, origin)) = self.queue.pop_front() {
            // The origin may be gone by the time we make a decision.
            if !self.peers.contains_key(&origin) {
                continue;
            }
            let known = match &inv {
                Inventory::Tx(txid) => {
                    self.store.tx(txid).is_some() || self.relay.contains_key(txid)
                }
                Inventory::Block(hash) => self.store.block_height(hash).is_some(),
            };
            if known {
                continue;
            }
            self.upstream.get_data(origin, vec![inv]);
            self.upstream.event(Event::Requested { inv, peer: origin });
        }

        self.relay
            .retain(|_, (_, since)| now - *since < RELAY_CACHE_TTL);
        self.propagation
            .retain(|txid, _| self.relay.contains_key(txid) || self.store.tx(txid).is_some());
    }
}

//! Chain sync manager.
//!
//! Serves `getblocks` and `getheaders` requests from the chain store, and
//! drives our own block download: starting from genesis on an empty chain
//! and walking the main chain forward with locators.
use std::collections::VecDeque;

use tracing::debug;

use bitcoin::hashes::Hash;
use bitcoin::network::message_blockdata::{GetBlocksMessage, GetHeadersMessage};
use bitcoin::BlockHash;

use gold_chain::ChainStore;
use gold_types::messages::p2p::Inventory;

use crate::{
    common::collections::AddressBook,
    fsm::handler::PeerId,
    net::{Link, LocalDuration},
};

use super::output::{SetTimer, Wire};

/// Maximum number of block inventories served for one `getblocks`.
pub const MAX_GETBLOCKS_ENTRIES: usize = 500;
/// Maximum number of headers served for one `getheaders`.
pub const MAX_GETHEADERS_ENTRIES: usize = 2000;
/// How many recent `getblocks` requests are remembered per peer, to drop
/// replays.
pub const RECENT_GETBLOCKS: usize = 3;
/// How long to wait before re-requesting the genesis block.
pub const GENESIS_RETRY_TIMEOUT: LocalDuration = LocalDuration::from_secs(3);

/// An event emitted by the sync manager.
#[derive(Debug, Clone)]
pub enum Event {
    /// We served headers to a peer.
    ServedHeaders {
        /// The requesting peer.
        addr: PeerId,
        /// Number of headers served.
        count: usize,
    },
    /// We served block inventories to a peer.
    ServedInventories {
        /// The requesting peer.
        addr: PeerId,
        /// Number of inventories served.
        count: usize,
    },
    /// We requested the genesis block to bootstrap an empty chain.
    RequestedGenesis {
        /// The peer asked.
        addr: PeerId,
    },
    /// We requested blocks above our tip.
    Syncing {
        /// The peer asked.
        addr: PeerId,
        /// Our chain height at the time.
        height: i64,
    },
}

impl std::fmt::Display for Event {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::ServedHeaders { addr, count } => {
                write!(fmt, "{}: Served {} header(s)", addr, count)
            }
            Event::ServedInventories { addr, count } => {
                write!(fmt, "{}: Served {} block inventorie(s)", addr, count)
            }
            Event::RequestedGenesis { addr } => {
                write!(fmt, "{}: Requested genesis block", addr)
            }
            Event::Syncing { addr, height } => {
                write!(fmt, "{}: Requesting blocks above height {}", addr, height)
            }
        }
    }
}

/// Sync manager peer state.
#[derive(Debug)]
struct Peer {
    /// The last few `getblocks` tuples received from this peer. Replays of
    /// a remembered tuple produce no reply.
    recent_getblocks: VecDeque<(u32, Vec<BlockHash>, BlockHash)>,
}

/// Sync manager state.
#[derive(Debug)]
pub struct SyncManager<T, U> {
    peers: AddressBook<PeerId, Peer>,
    /// Protocol version placed in our `getblocks` requests.
    protocol_version: u32,
    /// Hash of the network's genesis block.
    genesis: BlockHash,
    /// Peer to retry `getblocks` against once the genesis block arrives.
    pending_retry: Option<PeerId>,

    store: T,
    upstream: U,
}

impl<T: ChainStore, U: Wire<Event> + SetTimer> SyncManager<T, U> {
    /// Create a new sync manager.
    pub fn new(
        protocol_version: u32,
        genesis: BlockHash,
        store: T,
        rng: fastrand::Rng,
        upstream: U,
    ) -> Self {
        Self {
            peers: AddressBook::new(rng),
            protocol_version,
            genesis,
            pending_retry: None,
            store,
            upstream,
        }
    }

    /// Called when a peer negotiated. Outbound peers are asked for blocks
    /// right away: this is the block download pipeline's entry point.
    pub fn peer_negotiated(&mut self, addr: PeerId, link: Link) {
        self.peers.insert(
            addr,
            Peer {
                recent_getblocks: VecDeque::new(),
            },
        );

        if link.is_outbound() {
            self.send_getblocks(addr, None);
        }
    }

    /// Called when a peer disconnected.
    pub fn peer_disconnected(&mut self, addr: &PeerId) {
        self.peers.remove(addr);

        if self.pending_retry == Some(*addr) {
            self.pending_retry = None;
        }
    }

    /// Whether the peer is tracked.
    pub fn is_connected(&self, addr: &PeerId) -> bool {
        self.peers.contains_key(addr)
    }

    /// Called when a `getblocks` or `getheaders` message was received.
    ///
    /// Looks the locator tip up on our main chain and serves the blocks
    /// above it, ascending. A locator whose tip is unknown to us yields no
    /// reply: the locator fallback walk is not implemented.
    pub fn received_getblocks(
        &mut self,
        addr: &PeerId,
        version: u32,
        locator_hashes: Vec<BlockHash>,
        stop_hash: BlockHash,
        headers_only: bool,
    ) {
        let Some(peer) = self.peers.get_mut(addr) else {
            return;
        };

        // Drop replayed requests.
        let request = (version, locator_hashes, stop_hash);
        if peer.recent_getblocks.contains(&request) {
            debug!(target: "p2p", "{}: Ignoring duplicate `getblocks`", addr);
            return;
        }
        peer.recent_getblocks.push_back(request.clone());
        if peer.recent_getblocks.len() > RECENT_GETBLOCKS {
            peer.recent_getblocks.pop_front();
        }
        let (_, locator_hashes, _) = request;

        let Some(first) = locator_hashes.first() else {
            return;
        };
        let Some(height) = self.store.block_height(first) else {
            debug!(target: "p2p", "{}: `getblocks` locator tip is unknown", addr);
            return;
        };
        if height > self.store.height() {
            return;
        }

        if headers_only {
            let headers = self.store.headers_after(height, MAX_GETHEADERS_ENTRIES);
            let count = headers.len();

            self.upstream.headers(*addr, headers);
            self.upstream.event(Event::ServedHeaders { addr: *addr, count });
        } else {
            let hashes = self.store.hashes_after(height, MAX_GETBLOCKS_ENTRIES);
            let count = hashes.len();

            self.upstream
                .inv(*addr, hashes.into_iter().map(Inventory::Block).collect());
            self.upstream
                .event(Event::ServedInventories { addr: *addr, count });
        }
    }

    /// Request blocks above our tip from the given peer.
    ///
    /// On an empty chain there is nothing to build a locator from: the
    /// genesis block is requested by hash instead, and the request is
    /// re-armed until it arrives.
    pub fn send_getblocks(&mut self, addr: PeerId, locator: Option<Vec<BlockHash>>) {
        let height = self.store.height();

        if height == -1 {
            self.get_genesis_block(addr);
            return;
        }
        let msg = GetBlocksMessage {
            version: self.protocol_version,
            locator_hashes: locator.unwrap_or_else(|| self.store.locator()),
            stop_hash: BlockHash::all_zeros(),
        };

        self.upstream.get_blocks(addr, msg);
        self.upstream.event(Event::Syncing { addr, height });
    }

    /// Request headers above our tip from the given peer.
    pub fn send_getheaders(&mut self, addr: PeerId, locator: Option<Vec<BlockHash>>) {
        let height = self.store.height();

        if height == -1 {
            self.get_genesis_block(addr);
            return;
        }
        let msg = GetHeadersMessage {
            version: self.protocol_version,
            locator_hashes: locator.unwrap_or_else(|| self.store.locator()),
            stop_hash: BlockHash::all_zeros(),
        };

        self.upstream.get_headers(addr, msg);
        self.upstream.event(Event::Syncing { addr, height });
    }

    /// Request the genesis block by hash and schedule a retry.
    fn get_genesis_block(&mut self, addr: PeerId) {
        self.upstream
            .get_data(addr, vec![Inventory::Block(self.genesis)]);
        self.upstream.set_timer(GENESIS_RETRY_TIMEOUT);
        self.upstream.event(Event::RequestedGenesis { addr });

        self.pending_retry = Some(addr);
    }

    /// Called on a timer wake. Follows up on a pending genesis bootstrap.
    pub fn received_wake(&mut self) {
        if let Some(addr) = self.pending_retry.take() {
            if self.peers.contains_key(&addr) {
                self.send_getblocks(addr, None);
            }
        }
    }
}

//! The peer-to-peer address manager.
//!
//! Keeps the book of known peer addresses, samples them for outbound
//! connections and answers `getaddr` requests.
use std::collections::{HashMap, HashSet};
use std::net;
use std::net::SocketAddr;

use tracing::trace;

use bitcoin::network::address::Address;
use bitcoin::network::constants::ServiceFlags;

use crate::{
    common::peer::{AddressSource, KnownAddress, Source, Store},
    common::time::Clock,
    net::{Disconnect, LocalDuration, LocalTime},
};

use super::output::{SetTimer, Wire};

/// Time to wait until a request times out.
pub const REQUEST_TIMEOUT: LocalDuration = LocalDuration::from_mins(1);

/// Idle timeout. Used to run periodic functions.
pub const IDLE_TIMEOUT: LocalDuration = LocalDuration::from_mins(1);

/// Sample timeout. How long before a sampled address can be returned again.
pub const SAMPLE_TIMEOUT: LocalDuration = LocalDuration::from_mins(3);

/// How recently an address must have been seen to be served in a `getaddr`
/// reply.
pub const GETADDR_RECENCY: LocalDuration = LocalDuration::from_mins(3 * 60);

/// Maximum number of sampled addresses returned in a `getaddr` reply.
/// With our own address included, a reply never exceeds 251 records.
pub const MAX_GETADDR_ADDRESSES: usize = 250;

/// Maximum number of addresses expected in an `addr` message.
const MAX_ADDR_ADDRESSES: usize = 1000;
/// Maximum number of addresses we store for a given address range.
const MAX_RANGE_SIZE: usize = 256;

/// An event emitted by the address manager.
#[derive(Debug, Clone)]
pub enum Event {
    /// Peer addresses have been received.
    AddressesReceived {
        /// Number of addresses received.
        count: usize,
        /// Source of addresses received.
        source: Source,
    },
    /// Address book exhausted.
    AddressBookExhausted,
}

impl std::fmt::Display for Event {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::AddressesReceived { count, source } => {
                write!(
                    fmt,
                    "received {} address(es) from source `{}`",
                    count, source
                )
            }
            Event::AddressBookExhausted => {
                write!(
                    fmt,
                    "Address book exhausted.. fetching new addresses from peers"
                )
            }
        }
    }
}

/// Address manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether we include our own address in `getaddr` replies.
    pub announce: bool,
    /// Services we advertise for our own address.
    pub local_services: ServiceFlags,
}

/// Manages peer network addresses.
#[derive(Debug)]
pub struct AddressManager<P, U, C> {
    /// Peer address store.
    peers: P,
    bans: HashSet<net::IpAddr>,
    address_ranges: HashMap<u8, HashSet<SocketAddr>>,
    connected: HashSet<SocketAddr>,
    sources: HashSet<net::SocketAddr>,
    local_addrs: HashSet<net::SocketAddr>,
    /// Addresses other peers claim we appear as. Deliberately a multiset:
    /// the advertised address is the most frequently observed one.
    external_addrs: Vec<net::SocketAddr>,
    /// The last time we asked our peers for new addresses.
    last_request: Option<LocalTime>,
    /// The last time we idled.
    last_idle: Option<LocalTime>,
    cfg: Config,
    upstream: U,
    rng: fastrand::Rng,
    clock: C,
}

impl<P: Store, U, C> AddressManager<P, U, C> {
    /// Check whether we have unused addresses.
    pub fn is_exhausted(&self) -> bool {
        let time = self
            .last_idle
            .expect("AddressManager::is_exhausted: manager must be initialized");

        for (addr, ka) in self.peers.iter() {
            // Unsuccessful attempt to connect.
            if ka.last_attempt.is_some() && ka.last_success.is_none() {
                continue;
            }
            if time - ka.last_sampled.unwrap_or_default() < SAMPLE_TIMEOUT {
                continue;
            }
            if !self.connected.contains(addr) {
                return false;
            }
        }
        true
    }
}

impl<P: Store, U: Wire<Event> + SetTimer, C: Clock> AddressManager<P, U, C> {
    pub fn initialize(&mut self) {
        self.idle();
    }

    /// Get addresses from connected peers.
    pub fn get_addresses(&mut self) {
        for peer in &self.sources {
            self.upstream.get_addr(*peer);
        }
    }

    /// Called when we receive a `getaddr` message.
    ///
    /// Replies with our own address, when announcing is enabled, plus a
    /// random sample of recently active addresses.
    pub fn received_getaddr(&mut self, from: &net::SocketAddr) {
        let now = self.clock.local_time();
        let mut addrs = Vec::new();

        if self.cfg.announce {
            if let Some(our_addr) = self.external_address() {
                addrs.push((
                    now.as_secs() as u32,
                    Address::new(&our_addr, self.cfg.local_services),
                ));
            }
        }

        // Only addresses seen alive within the recency window qualify.
        let mut recent = Vec::new();
        for (_, ka) in self.peers.iter() {
            let Some(last_active) = ka.last_active else {
                continue;
            };
            if now - last_active <= GETADDR_RECENCY {
                recent.push((last_active.as_secs() as u32, ka.addr.clone()));
            }
        }
        self.rng.shuffle(&mut recent);

        addrs.extend(recent.into_iter().take(MAX_GETADDR_ADDRESSES));
        self.upstream.addr(*from, addrs);
    }

    /// Called when a tick is received.
    pub fn received_wake(&mut self) {
        let local_time = self.clock.local_time();

        trace!(target: "p2p", "Received wake");

        // If we're already using all the addresses we have available, we
        // should fetch more.
        if local_time - self.last_request.unwrap_or_default() >= REQUEST_TIMEOUT
            && self.is_exhausted()
        {
            self.upstream.event(Event::AddressBookExhausted);

            self.get_addresses();
            self.last_request = Some(local_time);
            self.upstream.set_timer(REQUEST_TIMEOUT);
        }

        if local_time - self.last_idle.unwrap_or_default() >= IDLE_TIMEOUT {
            self.idle();
        }
    }

    /// Called when a peer signaled activity.
    pub fn peer_active(&mut self, addr: net::SocketAddr) {
        let time = self.clock.local_time();
        if let Some(ka) = self.peers.get_mut(&addr) {
            ka.last_active = Some(time);
        }
    }

    /// Called when a peer connection is attempted.
    pub fn peer_attempted(&mut self, addr: &SocketAddr) {
        let time = self.clock.local_time();
        // We're only interested in connection attempts for addresses we
        // keep track of.
        if let Some(ka) = self.peers.get_mut(addr) {
            ka.last_attempt = Some(time);
        }
    }

    /// Called when a peer has connected.
    pub fn peer_connected(&mut self, addr: &SocketAddr) {
        self.insert(
            vec![(
                self.clock.local_time().as_secs() as u32,
                Address::new(addr, ServiceFlags::NONE),
            )],
            Source::Peer(*addr),
        );
        self.populate_address_ranges(addr);
        self.connected.insert(*addr);
    }

    /// Called when a peer has handshaked. Inserts the peer's derived
    /// address into the book.
    pub fn peer_negotiated(&mut self, addr: &SocketAddr, services: ServiceFlags) {
        let time = self.clock.local_time();

        self.sources.insert(*addr);

        if let Some(ka) = self.peers.get_mut(addr) {
            // Only ask for addresses when connecting for the first time.
            if ka.last_success.is_none() {
                self.upstream.get_addr(*addr);
            }
            // Keep track of when the last successful handshake was.
            ka.last_success = Some(time);
            ka.last_active = Some(time);
            ka.addr.services = services;
        }
    }

    /// Called when a peer disconnected.
    pub fn peer_disconnected(
        &mut self,
        addr: &SocketAddr,
        reason: Disconnect<crate::fsm::handler::DisconnectReason>,
    ) {
        if self.connected.remove(addr) {
            // Disconnected peers cannot be used as a source for new
            // addresses.
            self.sources.remove(addr);

            // If the reason for disconnecting the peer suggests that we
            // shouldn't try to connect to this peer again, then remove the
            // peer from the address book. Otherwise, we leave it in the
            // address buckets so that it can be chosen in the future.
            if let Disconnect::StateMachine(r) = reason {
                if !r.is_transient() {
                    self.ban(addr);
                }
            } else if reason.is_dial_err() || reason.is_banned() {
                self.ban(addr);
            }
        }
    }

    /// Record an address of ours, as seen by the listener.
    pub fn record_local_address(&mut self, addr: net::SocketAddr) {
        self.local_addrs.insert(addr);
    }

    fn idle(&mut self) {
        self.last_idle = Some(self.clock.local_time());
        self.upstream.set_timer(IDLE_TIMEOUT);
    }
}

impl<P: Store, U: Wire<Event>, C: Clock> AddressManager<P, U, C> {
    /// Create a new, empty address manager.
    pub fn new(cfg: Config, rng: fastrand::Rng, peers: P, upstream: U, clock: C) -> Self {
        let addrs = peers.iter().map(|(addr, _)| *addr).collect::<Vec<_>>();
        let mut addrmgr = Self {
            peers,
            bans: HashSet::new(),
            address_ranges: HashMap::new(),
            connected: HashSet::new(),
            sources: HashSet::new(),
            local_addrs: HashSet::new(),
            external_addrs: Vec::new(),
            last_request: None,
            last_idle: None,
            cfg,
            upstream,
            rng,
            clock,
        };

        for addr in addrs.iter() {
            addrmgr.populate_address_ranges(addr);
        }
        addrmgr
    }

    /// The number of peers known.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether there are any peers known to the address manager.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty() || self.address_ranges.is_empty()
    }

    /// Whether the peer is banned.
    pub fn is_banned(&self, addr: &SocketAddr) -> bool {
        self.bans.contains(&addr.ip())
    }

    /// Called when we received an `addr` message from a peer.
    pub fn received_addr(&mut self, peer: net::SocketAddr, addrs: Vec<(u32, Address)>) {
        if addrs.is_empty() || addrs.len() > MAX_ADDR_ADDRESSES {
            // Peer misbehaving, got empty message or too many addresses.
            return;
        }
        let source = Source::Peer(peer);

        self.upstream.event(Event::AddressesReceived {
            count: addrs.len(),
            source,
        });
        self.insert(addrs, source);
    }

    /// Add addresses to the address manager. The input matches that of the
    /// `addr` message sent by peers on the network.
    pub fn insert(&mut self, addrs: impl IntoIterator<Item = (u32, Address)>, source: Source) {
        let time = self
            .last_idle
            .expect("AddressManager::insert: manager must be initialized before inserting");

        for (last_active, addr) in addrs {
            // Ignore addresses that don't have a "last active" time.
            if last_active == 0 {
                continue;
            }

            // Ignore addresses that are too far into the future.
            if LocalTime::from_secs(last_active as u64) > time + LocalDuration::from_mins(60) {
                continue;
            }

            let Ok(socket_addr) = addr.socket_addr() else {
                continue;
            };

            // No banned addresses.
            if self.bans.contains(&socket_addr.ip()) {
                continue;
            }

            // No local addresses.
            if self.local_addrs.contains(&socket_addr) {
                continue;
            }

            // Record the address, and ignore addresses we already know.
            // Note that this should never overwrite an existing address.
            if !self.peers.insert(
                &socket_addr,
                KnownAddress::new(
                    addr.clone(),
                    source,
                    Some(LocalTime::from_secs(last_active as u64)),
                ),
            ) {
                continue;
            }

            self.populate_address_ranges(&socket_addr);
        }
    }

    /// Pick an address at random from the set of known addresses.
    ///
    /// This function tries to ensure a good geo-diversity of addresses,
    /// such that an adversary controlling a disproportionately large number
    /// of addresses in the same address range does not have an advantage
    /// over other peers.
    ///
    /// This works under the assumption that adversaries are *localized*.
    pub fn sample(&mut self, services: ServiceFlags) -> Option<(Address, Source)> {
        if self.is_empty() {
            return None;
        }
        let time = self
            .last_idle
            .expect("AddressManager::sample: manager must be initialized before sampling");

        let mut ranges: Vec<_> = self.address_ranges.values().collect();
        self.rng.shuffle(&mut ranges);

        // First select a random address range.
        for range in ranges.drain(..) {
            assert!(!range.is_empty());

            let mut ips: Vec<_> = range.iter().collect();
            self.rng.shuffle(&mut ips);

            // Then select a random address in that range.
            for ip in ips.drain(..) {
                let ka = self.peers.get_mut(ip).expect("address must exist");

                // If the address was already attempted unsuccessfully, skip it.
                if ka.last_attempt.is_some() && ka.last_success.is_none() {
                    continue;
                }
                // If we recently sampled this address, don't return it again.
                if time - ka.last_sampled.unwrap_or_default() < SAMPLE_TIMEOUT {
                    continue;
                }
                // If we're already connected to this address, skip it.
                if self.connected.contains(ip) {
                    continue;
                }
                // If the peer hasn't signaled the required services, skip it.
                if !ka.addr.services.has(services) {
                    continue;
                }
                // Ok, we've found a worthy address!
                ka.last_sampled = Some(time);

                return Some((ka.addr.clone(), ka.source));
            }
        }

        None
    }

    ////////////////////////////////////////////////////////////////////////////

    /// Populate address ranges with an IP. This may remove an existing IP if
    /// its range is full.
    fn populate_address_ranges(&mut self, addr: &SocketAddr) -> u8 {
        let key = addr_key(&addr.ip());
        let range = self.address_ranges.entry(key).or_default();

        // If the address range is already full, remove a random address
        // before inserting this new one.
        if range.len() == MAX_RANGE_SIZE {
            let ix = self.rng.usize(..range.len());
            let addr = range
                .iter()
                .cloned()
                .nth(ix)
                .expect("the range is not empty");

            range.remove(&addr);
            self.peers.remove(&addr);
        }
        range.insert(*addr);
        key
    }

    /// Remove an address from the address book and prevent it from being
    /// sampled again.
    fn ban(&mut self, addr: &SocketAddr) -> bool {
        let key = addr_key(&addr.ip());

        if let Some(range) = self.address_ranges.get_mut(&key) {
            range.remove(addr);

            self.peers.remove(addr);
            self.bans.insert(addr.ip());

            if range.is_empty() {
                self.address_ranges.remove(&key);
            }
            return true;
        }
        false
    }
}

impl<P: Store, U: Wire<Event> + SetTimer, C: Clock> AddressSource for AddressManager<P, U, C> {
    fn sample(&mut self, services: ServiceFlags) -> Option<(Address, Source)> {
        AddressManager::sample(self, services)
    }

    fn record_external_address(&mut self, addr: net::SocketAddr) {
        self.external_addrs.push(addr);
    }

    fn external_address(&mut self) -> Option<net::SocketAddr> {
        // The most frequently observed external address wins. Observations
        // are deliberately not deduplicated.
        let mut count: HashMap<net::SocketAddr, usize> = HashMap::new();

        for addr in &self.external_addrs {
            *count.entry(*addr).or_default() += 1;
        }
        count
            .into_iter()
            .max_by_key(|(_, count)| *count)
            .map(|(addr, _)| addr)
    }

    fn insert(&mut self, addrs: impl IntoIterator<Item = (u32, Address)>, source: Source) {
        AddressManager::insert(self, addrs, source);
    }
}

/// Check whether an IP address is locally routable.
pub fn is_local(addr: &net::IpAddr) -> bool {
    match addr {
        net::IpAddr::V4(addr) => {
            addr.is_private() || addr.is_loopback() || addr.is_link_local() || addr.is_unspecified()
        }
        net::IpAddr::V6(_) => false,
    }
}

/// Get the 8-bit key of an IP address. This key is based on the IP address's
/// range, and is used as a key to group IP addresses by range.
pub fn addr_key(ip: &net::IpAddr) -> u8 {
    match ip {
        net::IpAddr::V4(ip) => {
            // Use the /16 range (first two components) of the IP address to
            // key into the range buckets.
            //
            // Eg. 124.99.123.1 and 124.54.123.1 would be placed in
            // different buckets, but 100.99.43.12 and 100.99.12.8
            // would be placed in the same bucket.
            let octets: [u8; 4] = ip.octets();
            let bits: u16 = (octets[0] as u16) << 8 | octets[1] as u16;

            (bits % u8::MAX as u16) as u8
        }
        net::IpAddr::V6(ip) => {
            // Use the first 32 bits of an IPv6 address to as a key.
            let segments: [u16; 8] = ip.segments();
            let bits: u32 = (segments[0] as u32) << 16 | segments[1] as u32;

            (bits % u8::MAX as u32) as u8
        }
    }
}

//! Peer session manager.
//!
//! Owns the per-connection lifecycle: `new → handshake → connected →
//! disconnected`. A session enters `handshake` when the transport reports a
//! connection, and `connected` once the remote's `version` has been
//! received. Peers that never send `verack` still complete: receiving their
//! `version` and acknowledging it is enough. This is a pragmatic concession
//! to observed network behavior.
use std::collections::HashMap;
use std::{net, net::SocketAddr, sync::Arc};

use tracing::debug;

use bitcoin::{
    network::address::Address, network::constants::ServiceFlags,
    network::message_network::VersionMessage,
};

use crate::{
    common::peer::{AddressSource, Source},
    common::time::Clock,
    fsm::addrmgr::is_local,
    fsm::handler::{DisconnectReason, Whitelist, MIN_PROTOCOL_VERSION},
    fsm::handler::{PeerId, Socket},
    net::{Disconnect as NetDisconnect, Link, LocalDuration, LocalTime},
};

use super::output::{Connect, Disconnect, SetTimer, Wire};

/// Time to wait for an outbound dial to complete.
pub const DIAL_TIMEOUT: LocalDuration = LocalDuration::from_secs(6);
/// Time to wait until idle.
pub const IDLE_TIMEOUT: LocalDuration = LocalDuration::from_mins(1);
/// Target number of concurrent outbound peer connections.
pub const TARGET_OUTBOUND_PEERS: usize = 8;
/// Maximum number of inbound peer connections.
pub const MAX_INBOUND_PEERS: usize = 16;

/// A time offset, in seconds.
type TimeOffset = i64;

/// An event originating in the peer manager.
#[derive(Debug, Clone)]
pub enum Event {
    /// The `version` message was received from a peer.
    VersionReceived {
        /// The peer's id.
        addr: PeerId,
        /// The version message.
        msg: VersionMessage,
    },
    /// A peer has completed the handshake.
    Negotiated {
        /// The peer's id.
        addr: PeerId,
        /// Connection link.
        link: Link,
        /// Services offered by negotiated peer.
        services: ServiceFlags,
        /// Peer user agent.
        user_agent: String,
        /// Negotiated protocol version.
        version: u32,
        /// The peer's advertised chain height.
        height: i32,
    },
    /// Connecting to a peer found from the specified source.
    Connecting(PeerId, Source, ServiceFlags),
    /// Connection attempt failed.
    ConnectionFailed(PeerId, Arc<std::io::Error>),
    /// A new peer has connected and entered the handshake.
    Connected(PeerId, Link),
    /// A peer has been disconnected.
    Disconnected(PeerId, NetDisconnect<DisconnectReason>),
}

impl std::fmt::Display for Event {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VersionReceived { addr, msg } => write!(
                fmt,
                "{}: Peer version = {}, height = {}, agent = {}, services = {}",
                addr, msg.version, msg.start_height, msg.user_agent, msg.services,
            ),
            Self::Negotiated {
                addr, services, ..
            } => write!(fmt, "{}: Peer negotiated with services {}", addr, services),
            Self::Connecting(addr, source, services) => {
                write!(
                    fmt,
                    "Connecting to peer {} from source `{}` with {}",
                    addr, source, services
                )
            }
            Self::Connected(addr, link) => write!(fmt, "{}: Peer connected ({:?})", &addr, link),
            Self::ConnectionFailed(addr, err) => {
                write!(fmt, "{}: Peer connection attempt failed: {}", &addr, err)
            }
            Self::Disconnected(addr, reason) => {
                write!(fmt, "Disconnected from {} ({})", &addr, reason)
            }
        }
    }
}

/// Peer manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Protocol version.
    pub protocol_version: u32,
    /// Peer whitelist. Whitelisted peers are always accepted inbound.
    pub whitelist: Whitelist,
    /// Services offered by this implementation.
    pub services: ServiceFlags,
    /// Peer addresses to persist connections with.
    pub persistent: Vec<net::SocketAddr>,
    /// Services required by peers.
    pub required_services: ServiceFlags,
    /// Whether inbound connections from unknown peers are accepted.
    pub accept_connections: bool,
    /// Whether to announce our own address after a handshake.
    pub announce: bool,
    /// Target number of outbound peer connections.
    pub target_outbound_peers: usize,
    /// Maximum number of inbound peer connections.
    pub max_inbound_peers: usize,
    /// Time a peer has to complete the handshake before being dropped.
    pub connection_timeout: LocalDuration,
    /// Maximum time to wait between reconnection attempts.
    pub retry_max_wait: LocalDuration,
    /// Minimum time to wait between reconnection attempts.
    pub retry_min_wait: LocalDuration,
    /// Our user agent.
    pub user_agent: &'static str,
}

/// Peer handshake state. `ReceivedVersion` corresponds to a session still in
/// the handshake; `Negotiated` to an established session.
#[derive(Copy, Clone, Debug, PartialOrd, PartialEq, Ord, Eq)]
enum HandshakeState {
    /// Received "version". The acknowledgment completes the handshake.
    ReceivedVersion { since: LocalTime },
    /// Handshake is complete.
    Negotiated { since: LocalTime },
}

/// A peer connection. Peers that haven't yet sent their `version` message
/// are stored as connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    /// Remote peer socket.
    pub socket: Socket,
    /// Local peer address.
    pub local_addr: net::SocketAddr,
    /// Whether this is an inbound or outbound peer connection.
    pub link: Link,
    /// Connected since this time. Reset when the handshake completes.
    pub since: LocalTime,
    /// The nonce sent in our `version` message, used to detect connections
    /// to self.
    nonce: u64,
}

/// Peer state.
#[derive(Debug, Clone)]
pub enum Peer {
    /// A connection is being attempted.
    Connecting {
        /// Time the connection was attempted.
        time: LocalTime,
    },
    /// A connection is established.
    Connected {
        /// Connection.
        conn: Connection,
        /// Peer information, if a `version` message was received.
        peer: Option<PeerInfo>,
    },
}

/// A peer with protocol information.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// The peer's services.
    pub services: ServiceFlags,
    /// Peer user agent string.
    pub user_agent: String,
    /// An offset in seconds, between this peer's clock and ours.
    /// A positive offset means the peer's clock is ahead of ours.
    pub time_offset: TimeOffset,
    /// Whether this peer relays transactions.
    pub relay: bool,
    /// The max protocol version supported by both the peer and us.
    pub version: u32,
    /// The peer's advertised chain height at handshake time.
    pub start_height: i32,
    /// Whether this is a persistent peer.
    pub persistent: bool,
    /// Peer handshake state.
    state: HandshakeState,
}

impl PeerInfo {
    /// Check whether the peer has finished negotiating.
    pub fn is_negotiated(&self) -> bool {
        matches!(self.state, HandshakeState::Negotiated { .. })
    }
}

/// Manages peer connections and handshake.
#[derive(Debug)]
pub struct PeerManager<U, C> {
    /// Peer manager configuration.
    pub config: Config,
    /// Last time we were idle.
    last_idle: Option<LocalTime>,
    /// Connection states.
    peers: HashMap<SocketAddr, Peer>,
    /// Peers that have been disconnected and a retry attempt is scheduled.
    disconnected: HashMap<net::SocketAddr, (Option<LocalTime>, usize)>,
    upstream: U,
    rng: fastrand::Rng,
    clock: C,
}

impl<U: Wire<Event> + SetTimer + Connect + Disconnect, C: Clock> PeerManager<U, C> {
    /// Create a new peer manager.
    pub fn new(config: Config, rng: fastrand::Rng, upstream: U, clock: C) -> Self {
        Self {
            config,
            last_idle: None,
            peers: HashMap::new(),
            disconnected: HashMap::new(),
            upstream,
            rng,
            clock,
        }
    }

    /// Initialize the peer manager. Must be called once.
    pub fn initialize<A: AddressSource>(&mut self, addrs: &mut A) {
        let peers = self.config.persistent.clone();

        for addr in peers {
            if !self.connect(&addr) {
                debug!(target: "p2p", "{}: unable to connect to persistent peer", addr);
            }
        }
        self.upstream.set_timer(IDLE_TIMEOUT);
        self.maintain_connections(addrs);
    }

    /// Called when a peer connected, inbound accept or outbound dial
    /// completion. Returns `false` if the peer was rejected.
    pub fn peer_connected<A: AddressSource>(
        &mut self,
        addr: PeerId,
        local_addr: net::SocketAddr,
        link: Link,
        height: i64,
        addrs: &mut A,
    ) -> bool {
        let local_time = self.clock.local_time();

        #[cfg(debug_assertions)]
        if link.is_outbound() {
            debug_assert!(self.is_connecting(&addr), "{} is not connecting", addr)
        }
        debug_assert!(!self.is_connected(&addr), "{} is already connected", addr);

        if link.is_inbound() {
            // Inbound peers are only let in while we accept connections,
            // unless whitelisted. Rejection is quiet.
            if !self.config.accept_connections && !self.whitelisted(&addr.ip()) {
                self.upstream
                    .disconnect(addr, DisconnectReason::ConnectionRejected);
                return false;
            }
            if self.connected().filter(|c| c.link.is_inbound()).count()
                >= self.config.max_inbound_peers
            {
                self.upstream
                    .disconnect(addr, DisconnectReason::ConnectionLimit);
                return false;
            }
        }

        let nonce = self.rng.u64(..);
        let version = self.version(addr, local_addr, nonce, height, addrs);

        self.peers.insert(
            addr,
            Peer::Connected {
                conn: Connection {
                    socket: Socket::new(addr),
                    local_addr,
                    link,
                    since: local_time,
                    nonce,
                },
                peer: None,
            },
        );
        self.disconnected.remove(&addr);

        // Both link directions introduce themselves first, and arm the
        // handshake timeout.
        self.upstream.version(addr, version);
        self.upstream.set_timer(self.config.connection_timeout);
        self.upstream.event(Event::Connected(addr, link));

        true
    }

    /// Called when a peer disconnected.
    pub fn peer_disconnected<A: AddressSource>(
        &mut self,
        addr: &SocketAddr,
        addrs: &mut A,
        reason: NetDisconnect<DisconnectReason>,
    ) {
        let local_time = self.clock.local_time();

        if self.is_connected(addr) {
            self.upstream.event(Event::Disconnected(*addr, reason));
        } else if self.is_connecting(addr) {
            // If we haven't yet established a connection, the disconnect
            // reason should always be a `ConnectionError`.
            if let NetDisconnect::ConnectionError(err) = reason {
                self.upstream.event(Event::ConnectionFailed(*addr, err));
            }
        }
        self.peers.remove(addr);

        if self.config.persistent.contains(addr) {
            self.persistent_disconnected(addr, local_time);
        } else {
            // If an outbound peer disconnected, we should make sure to
            // maintain our target outbound connection count.
            self.maintain_connections(addrs);
        }
    }

    /// Called when a `version` message was received. On success, the
    /// handshake completes immediately: the version is acknowledged with
    /// `verack` without waiting for the peer's own acknowledgment.
    pub fn received_version<A: AddressSource>(
        &mut self,
        addr: &PeerId,
        msg: VersionMessage,
        addrs: &mut A,
    ) -> Option<(PeerInfo, Connection, LocalDuration)> {
        match self.handle_version(addr, msg, addrs) {
            Ok(negotiated) => negotiated,
            Err(reason) => {
                self._disconnect(*addr, reason);
                None
            }
        }
    }

    fn handle_version<A: AddressSource>(
        &mut self,
        addr: &PeerId,
        msg: VersionMessage,
        addrs: &mut A,
    ) -> Result<Option<(PeerInfo, Connection, LocalDuration)>, DisconnectReason> {
        let now = self.clock.local_time();

        let Some(Peer::Connected { conn, peer }) = self.peers.get(addr) else {
            return Ok(None);
        };
        // The version record is set exactly once; replays are dropped.
        if peer.is_some() {
            debug!(target: "p2p", "{}: Ignoring duplicate `version`", addr);
            return Ok(None);
        }

        self.upstream.event(Event::VersionReceived {
            addr: *addr,
            msg: msg.clone(),
        });

        let VersionMessage {
            // Peer's local time.
            timestamp,
            // Highest protocol version understood by the peer.
            version,
            // Services offered by this peer.
            services,
            // User agent.
            user_agent,
            // Peer nonce.
            nonce,
            // Our address, as seen by the remote peer.
            receiver,
            // Relay node.
            relay,
            // The peer's chain height.
            start_height,
            ..
        } = msg;

        let trusted = self.config.whitelist.contains(&addr.ip(), &user_agent)
            || is_local(&addr.ip());

        // Don't support peers with too old of a protocol version.
        if version < MIN_PROTOCOL_VERSION {
            return Err(DisconnectReason::PeerProtocolVersion(version));
        }

        // Peers that don't advertise the `NETWORK` service are not full
        // nodes, and can't serve us the chain.
        if conn.link.is_outbound() && !services.has(self.config.required_services) && !trusted {
            return Err(DisconnectReason::PeerServices(services));
        }

        // Check for self-connections: the nonce we receive must not be one
        // we sent ourselves.
        for connection in self.connected() {
            if connection.nonce == nonce {
                return Err(DisconnectReason::SelfConnection);
            }
        }

        // Record the address this peer has of us.
        if let Ok(external) = receiver.socket_addr() {
            addrs.record_external_address(external);
        }

        let conn = conn.clone();
        let persistent = self.config.persistent.contains(&conn.socket.addr);

        self.peers.insert(
            conn.socket.addr,
            Peer::Connected {
                conn: conn.clone(),
                peer: Some(PeerInfo {
                    time_offset: timestamp.saturating_sub(now.as_secs() as i64),
                    services,
                    persistent,
                    user_agent,
                    state: HandshakeState::ReceivedVersion { since: now },
                    relay,
                    start_height,
                    version: u32::min(self.config.protocol_version, version),
                }),
            },
        );

        // Acknowledge, then complete without waiting for the peer's
        // `verack`.
        self.upstream.verack(conn.socket.addr);

        Ok(self.complete_handshake(addr, addrs))
    }

    /// Called when a `verack` message was received. Completes the handshake
    /// for sessions which haven't already completed it on `version`.
    pub fn received_verack<A: AddressSource>(
        &mut self,
        addr: &PeerId,
        addrs: &mut A,
    ) -> Option<(PeerInfo, Connection, LocalDuration)> {
        self.complete_handshake(addr, addrs)
    }

    /// Complete the handshake. Idempotent: only a session still in the
    /// handshake transitions; repeated calls are no-ops.
    ///
    /// Returns the peer info, connection, and handshake round-trip time.
    fn complete_handshake<A: AddressSource>(
        &mut self,
        addr: &PeerId,
        addrs: &mut A,
    ) -> Option<(PeerInfo, Connection, LocalDuration)> {
        let now = self.clock.local_time();

        let Some(Peer::Connected {
            conn,
            peer: Some(peer),
        }) = self.peers.get_mut(addr)
        else {
            return None;
        };
        let HandshakeState::ReceivedVersion { .. } = peer.state else {
            return None;
        };

        let rtt = now - conn.since;

        peer.state = HandshakeState::Negotiated { since: now };
        // The session's uptime is measured from handshake completion.
        conn.since = now;

        let peer = peer.clone();
        let conn = conn.clone();

        self.upstream.event(Event::Negotiated {
            addr: *addr,
            link: conn.link,
            services: peer.services,
            user_agent: peer.user_agent.clone(),
            version: peer.version,
            height: peer.start_height,
        });

        if self.config.announce {
            if let Some(our_addr) = addrs.external_address() {
                self.upstream.addr(
                    *addr,
                    vec![(
                        now.as_secs() as u32,
                        Address::new(&our_addr, self.config.services),
                    )],
                );
            }
        }

        Some((peer, conn, rtt))
    }

    /// Called on a timer wake. Times out stale handshakes and dials, and
    /// maintains the outbound connection target.
    pub fn received_wake<A: AddressSource>(&mut self, addrs: &mut A) {
        let mut timed_out = Vec::new();
        let local_time = self.clock.local_time();

        // Time out all peers that have been idle in a "connecting" state
        // for too long.
        for addr in self.idle_peers(local_time).collect::<Vec<_>>() {
            timed_out.push((addr, "connection"));
        }
        // Time out peers that haven't completed the handshake quickly
        // enough. This covers both sessions without a `version` and
        // sessions which received one but were never completed.
        for (addr, peer) in &self.peers {
            if let Peer::Connected { conn, peer } = peer {
                let incomplete = match peer {
                    None => local_time - conn.since >= self.config.connection_timeout,
                    Some(info) => match info.state {
                        HandshakeState::ReceivedVersion { since } => {
                            local_time - since >= self.config.connection_timeout
                        }
                        HandshakeState::Negotiated { .. } => false,
                    },
                };
                if incomplete {
                    timed_out.push((*addr, "handshake"));
                }
            }
        }
        // Disconnect all timed out peers.
        for (addr, reason) in timed_out {
            self._disconnect(addr, DisconnectReason::PeerTimeout(reason));
        }

        if local_time - self.last_idle.unwrap_or_default() >= IDLE_TIMEOUT {
            self.maintain_connections(addrs);
            self.upstream.set_timer(IDLE_TIMEOUT);
            self.last_idle = Some(local_time);
        }

        self.maintain_persistent();
    }

    /// Whitelist a peer.
    pub fn whitelist(&mut self, addr: net::SocketAddr) -> bool {
        self.config.whitelist.addr.insert(addr.ip())
    }

    /// Whether the given address is whitelisted.
    fn whitelisted(&self, ip: &net::IpAddr) -> bool {
        self.config.whitelist.addr.contains(ip) || is_local(ip)
    }

    /// Create a `version` message for this peer. The sender address is the
    /// external address peers know us by, when one is known.
    pub fn version<A: AddressSource>(
        &self,
        addr: net::SocketAddr,
        local_addr: net::SocketAddr,
        nonce: u64,
        height: i64,
        addrs: &mut A,
    ) -> VersionMessage {
        let from = addrs.external_address().unwrap_or(local_addr);

        VersionMessage {
            // Our max supported protocol version.
            version: self.config.protocol_version,
            // Local services.
            services: self.config.services,
            // Local time.
            timestamp: self.clock.local_time().as_secs() as i64,
            // Receiver address, as perceived by us.
            receiver: Address::new(&addr, ServiceFlags::NONE),
            // Our external address, or the local one when no peer has told
            // us better.
            sender: Address::new(&from, self.config.services),
            // A nonce to detect connections to self.
            nonce,
            // Our user agent string.
            user_agent: self.config.user_agent.to_owned(),
            // Our chain height.
            start_height: height as i32,
            // Ask peers to relay transaction `inv` messages.
            relay: true,
        }
    }

    /// A persistent peer has been disconnected. Schedule a reconnect with
    /// exponential backoff.
    fn persistent_disconnected(&mut self, addr: &net::SocketAddr, local_time: LocalTime) {
        let (retry_at, attempts) = self.disconnected.entry(*addr).or_default();
        let delay = LocalDuration::from_secs(2u64.saturating_pow(*attempts as u32))
            .clamp(self.config.retry_min_wait, self.config.retry_max_wait);

        *retry_at = Some(local_time + delay);
        *attempts += 1;

        self.upstream.set_timer(delay);
    }

    /// Maintain persistent peer connections.
    fn maintain_persistent(&mut self) {
        let local_time = self.clock.local_time();
        let mut reconnect = Vec::new();

        for (addr, (retry_at, _)) in &mut self.disconnected {
            if let Some(t) = retry_at {
                if *t <= local_time {
                    *retry_at = None;
                    reconnect.push(*addr);
                }
            }
        }

        for addr in reconnect {
            if !self.connect(&addr) {
                debug!(target: "p2p", "{}: couldn't reconnect to persistent peer", addr);
            }
        }
    }
}

/// Connection management functions.
impl<U: Connect + Disconnect + SetTimer + Wire<Event>, C: Clock> PeerManager<U, C> {
    /// Called when a peer is being connected to.
    pub fn peer_attempted(&mut self, addr: &net::SocketAddr) {
        // Since all "attempts" are made from this module, we expect that
        // when a peer is attempted, we know about it already.
        //
        // It's possible that as we were attempting to connect to a peer,
        // that peer in the meantime connected to us. Hence we also account
        // for an already-connected *inbound* peer.
        debug_assert!(self.is_connecting(addr) || self.is_inbound(addr));
    }

    /// Check whether a peer is connected via an inbound link.
    pub fn is_inbound(&self, addr: &PeerId) -> bool {
        self.peers.get(addr).map_or(
            false,
            |c| matches!(c, Peer::Connected { conn, .. } if conn.link.is_inbound()),
        )
    }

    /// Check whether a peer is connecting.
    pub fn is_connecting(&self, addr: &PeerId) -> bool {
        self.peers
            .get(addr)
            .map_or(false, |c| matches!(c, Peer::Connecting { .. }))
    }

    /// Check whether a peer is connected.
    pub fn is_connected(&self, addr: &PeerId) -> bool {
        self.peers
            .get(addr)
            .map_or(false, |c| matches!(c, Peer::Connected { .. }))
    }

    /// Check whether a peer is disconnected.
    pub fn is_disconnected(&self, addr: &PeerId) -> bool {
        !self.is_connected(addr) && !self.is_connecting(addr)
    }

    /// Iterator over peers that have at least sent their `version` message.
    pub fn peers(&self) -> impl Iterator<Item = (&PeerInfo, &Connection)> + Clone {
        self.peers.values().filter_map(move |c| match c {
            Peer::Connected {
                conn,
                peer: Some(peer),
            } => Some((peer, conn)),
            _ => None,
        })
    }

    /// Returns connecting peers.
    pub fn connecting(&self) -> impl Iterator<Item = &PeerId> {
        self.peers
            .iter()
            .filter(|(_, p)| matches!(p, Peer::Connecting { .. }))
            .map(|(addr, _)| addr)
    }

    /// Iterator over peers in a *connected* state.
    pub fn connected(&self) -> impl Iterator<Item = &Connection> + Clone {
        self.peers.values().filter_map(|c| match c {
            Peer::Connected { conn, .. } => Some(conn),
            _ => None,
        })
    }

    /// Iterator over fully negotiated peers.
    pub fn negotiated(&self, link: Link) -> impl Iterator<Item = (&PeerInfo, &Connection)> + Clone {
        self.peers()
            .filter(move |(p, c)| p.is_negotiated() && c.link == link)
    }

    /// Connect to a peer.
    pub fn connect(&mut self, addr: &PeerId) -> bool {
        let time = self.clock.local_time();

        if self.is_connected(addr) || self.is_connecting(addr) {
            return true;
        }

        self.peers.insert(*addr, Peer::Connecting { time });
        self.upstream.connect(*addr, DIAL_TIMEOUT);

        true
    }

    /// Disconnect from a peer.
    pub fn disconnect(&mut self, addr: PeerId, reason: DisconnectReason) {
        if self.is_connected(&addr) {
            self._disconnect(addr, reason);
        }
    }

    /// Disconnect a peer (internal).
    fn _disconnect(&mut self, addr: PeerId, reason: DisconnectReason) {
        self.upstream.disconnect(addr, reason);
    }

    /// Attempt to maintain a certain number of outbound peers.
    fn maintain_connections<A: AddressSource>(&mut self, addrs: &mut A) {
        // If we have persistent peers configured, we don't use this
        // mechanism for maintaining connections. Instead, we retry the
        // configured peers.
        if !self.config.persistent.is_empty() {
            return;
        }

        let outbound = self.connected().filter(|c| c.link.is_outbound()).count();
        let connecting = self.connecting().count();
        let target = self.config.target_outbound_peers;
        let delta = target.saturating_sub(outbound + connecting);

        for _ in 0..delta {
            let Some((addr, source)) = addrs.sample(self.config.required_services) else {
                break;
            };
            let Ok(sockaddr) = addr.socket_addr() else {
                continue;
            };
            debug_assert!(!self.is_connected(&sockaddr));

            if self.connect(&sockaddr) {
                self.upstream
                    .event(Event::Connecting(sockaddr, source, addr.services));
            }
        }
    }

    /// Peers that have been idle in a connecting state longer than
    /// [`DIAL_TIMEOUT`].
    fn idle_peers(&self, now: LocalTime) -> impl Iterator<Item = PeerId> + '_ {
        self.peers.iter().filter_map(move |(addr, c)| {
            if let Peer::Connecting { time } = c {
                if now - *time >= DIAL_TIMEOUT {
                    return Some(*addr);
                }
            }
            None
        })
    }
}

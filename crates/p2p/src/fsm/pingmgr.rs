//! Ping manager.
//!
//! Sends periodic pings and tracks per-peer latency. A peer whose pong
//! doesn't arrive within the liveness timeout is disconnected. Latency is
//! measured in milliseconds throughout.
use std::collections::HashMap;
use std::net::SocketAddr;

use crate::{
    common::time::Clock,
    fsm::handler::{DisconnectReason, PeerId},
    net::{LocalDuration, LocalTime},
};

use super::output::{Disconnect, SetTimer, Wire};

/// Protocol version above which ping/pong carry a nonce.
pub const BIP0031_VERSION: u32 = 60000;

/// Time interval between pings.
pub const PING_INTERVAL: LocalDuration = LocalDuration::from_mins(2);

/// An event emitted by the ping manager.
#[derive(Debug, Clone)]
pub enum Event {
    /// A ping round-trip was measured.
    RoundTripMeasured {
        /// The peer.
        addr: PeerId,
        /// Round-trip latency.
        latency: LocalDuration,
    },
}

impl std::fmt::Display for Event {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::RoundTripMeasured { addr, latency } => {
                write!(fmt, "{}: Peer latency is {}", addr, latency)
            }
        }
    }
}

/// Whether a ping is outstanding.
#[derive(Debug, Copy, Clone)]
enum State {
    /// No ping in flight.
    Idle { since: LocalTime },
    /// A ping was sent and a matching pong is awaited.
    AwaitingPong { nonce: u32, since: LocalTime },
}

#[derive(Debug)]
struct Peer {
    /// Negotiated protocol version. Peers at or below
    /// [`BIP0031_VERSION`] get nonce-less pings and no latency tracking.
    version: u32,
    /// Most recently measured round-trip latency.
    latency: LocalDuration,
    state: State,
}

/// Sends pings and disconnects unresponsive peers.
#[derive(Debug)]
pub struct PingManager<U, C> {
    peers: HashMap<PeerId, Peer>,
    /// Time after which an unanswered ping closes the connection.
    ping_timeout: LocalDuration,
    rng: fastrand::Rng,
    upstream: U,
    clock: C,
}

impl<U: Wire<Event> + SetTimer + Disconnect, C: Clock> PingManager<U, C> {
    /// Create a new ping manager.
    pub fn new(ping_timeout: LocalDuration, rng: fastrand::Rng, upstream: U, clock: C) -> Self {
        Self {
            peers: HashMap::new(),
            ping_timeout,
            rng,
            upstream,
            clock,
        }
    }

    /// Called when a peer negotiated. The handshake round-trip seeds the
    /// latency measurement.
    pub fn peer_negotiated(&mut self, addr: PeerId, version: u32, handshake_rtt: LocalDuration) {
        let since = self.clock.local_time();

        self.peers.insert(
            addr,
            Peer {
                version,
                latency: handshake_rtt,
                state: State::Idle { since },
            },
        );
        self.upstream.set_timer(PING_INTERVAL);
    }

    /// Called when a peer disconnected.
    pub fn peer_disconnected(&mut self, addr: &PeerId) {
        self.peers.remove(addr);
    }

    /// Whether the peer is tracked.
    pub fn is_connected(&self, addr: &PeerId) -> bool {
        self.peers.contains_key(addr)
    }

    /// Latest latency measurement for the given peer.
    pub fn latency(&self, addr: &PeerId) -> Option<LocalDuration> {
        self.peers.get(addr).map(|p| p.latency)
    }

    /// Called when a `ping` message was received. A nonce-less ping, as
    /// sent by pre-BIP 0031 peers, gets no reply.
    pub fn received_ping(&mut self, addr: SocketAddr, nonce: Option<u32>) -> bool {
        if !self.peers.contains_key(&addr) {
            return false;
        }
        if let Some(nonce) = nonce {
            self.upstream.pong(addr, nonce);
        }
        true
    }

    /// Called when a `pong` message was received. Only a pong matching the
    /// outstanding ping nonce refreshes the latency; others are ignored.
    pub fn received_pong(&mut self, addr: SocketAddr, nonce: u32, now: LocalTime) -> bool {
        let Some(peer) = self.peers.get_mut(&addr) else {
            return false;
        };
        match peer.state {
            State::AwaitingPong {
                nonce: expected,
                since,
            } if nonce == expected => {
                peer.latency = now - since;
                peer.state = State::Idle { since: now };

                self.upstream.event(Event::RoundTripMeasured {
                    addr,
                    latency: peer.latency,
                });
                true
            }
            _ => false,
        }
    }

    /// Called on a timer wake. Disconnects peers whose pong is overdue and
    /// pings peers that have been idle for a while.
    pub fn received_wake(&mut self) {
        let now = self.clock.local_time();
        let mut unresponsive = Vec::new();
        let mut ping = Vec::new();

        for (addr, peer) in &self.peers {
            match peer.state {
                State::AwaitingPong { since, .. } => {
                    if now - since >= self.ping_timeout {
                        unresponsive.push(*addr);
                    }
                }
                State::Idle { since } => {
                    if now - since >= PING_INTERVAL {
                        ping.push(*addr);
                    }
                }
            }
        }

        for addr in unresponsive {
            self.upstream
                .disconnect(addr, DisconnectReason::PeerTimeout("ping"));
            self.peers.remove(&addr);
        }
        for addr in ping {
            self.ping(addr, now);
        }
    }

    /// Send a ping to the given peer.
    fn ping(&mut self, addr: PeerId, now: LocalTime) {
        let ping_timeout = self.ping_timeout;
        let Some(peer) = self.peers.get_mut(&addr) else {
            return;
        };

        if peer.version > BIP0031_VERSION {
            let nonce = self.rng.u32(..);

            peer.state = State::AwaitingPong { nonce, since: now };
            self.upstream.ping(addr, Some(nonce));
            self.upstream.set_timer(ping_timeout);
        } else {
            // Pre-BIP 0031 pings carry no nonce, so the round-trip can't be
            // measured. Latency pessimistically pins to the timeout ceiling.
            peer.latency = ping_timeout;
            peer.state = State::Idle { since: now };
            self.upstream.ping(addr, None);
        }
    }
}

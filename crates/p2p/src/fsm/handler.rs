//! Protocol state machine.
//!
//! Glues the sub-protocol managers together and dispatches inbound messages
//! to them with a single match. All node-wide state (the connection set,
//! the address book, the inventory queue, the relay cache) lives behind
//! this type and is only ever touched from the reactor thread.
use std::collections::HashSet;
use std::{borrow::Cow, fmt, net, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use flume as chan;
use tracing::{debug, warn};

use bitcoin::network::Magic;
use bitcoin::{network::constants::ServiceFlags, network::Address, Transaction};

use gold_chain::ChainStore;
use gold_types::messages::p2p::{NetworkMessage, RawNetworkMessage};
use gold_types::network::Network;
use gold_types::{IngestMessage, NodeEvent};

use crate::fsm::output::Outbox;
use crate::notifier::Notifier;
use crate::{
    common::peer,
    common::time::AdjustedClock,
    fsm::addrmgr::AddressManager,
    fsm::event::Event,
    fsm::invmgr::InventoryManager,
    fsm::peermgr::PeerManager,
    fsm::pingmgr::PingManager,
    fsm::peermgr,
    fsm::syncmgr::SyncManager,
    net::{Disconnect, Link, LocalDuration, LocalTime},
};

pub type PeerId = net::SocketAddr;

/// Peer-to-peer protocol version.
pub const PROTOCOL_VERSION: u32 = 70001;
/// Minimum protocol version accepted from peers.
pub const MIN_PROTOCOL_VERSION: u32 = 31800;
/// User agent included in `version` messages.
pub const USER_AGENT: &str = concat!("/gold:", env!("CARGO_PKG_VERSION"), "/");

/// Default handshake and liveness timeout.
pub const DEFAULT_CONNECTION_TIMEOUT: LocalDuration = LocalDuration::from_secs(30);
/// Default bound on the inventory work queue.
pub const DEFAULT_MAX_INV: usize = 50_000;

/// Configured limits.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Target outbound peer connections.
    pub max_outbound_peers: usize,
    /// Maximum inbound peer connections.
    pub max_inbound_peers: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_outbound_peers: peermgr::TARGET_OUTBOUND_PEERS,
            max_inbound_peers: peermgr::MAX_INBOUND_PEERS,
        }
    }
}

/// Peer whitelist.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    /// Trusted addresses.
    pub(crate) addr: HashSet<net::IpAddr>,
    /// Trusted user-agents.
    pub(crate) user_agent: HashSet<String>,
}

impl Whitelist {
    pub(crate) fn contains(&self, addr: &net::IpAddr, user_agent: &str) -> bool {
        self.addr.contains(addr) || self.user_agent.contains(user_agent)
    }
}

/// Reference counting virtual socket.
/// When there are no more references held, this peer can be dropped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Socket {
    /// Socket address.
    pub addr: net::SocketAddr,
    /// Reference counter.
    refs: Arc<()>,
}

impl Socket {
    /// Create a new virtual socket.
    pub fn new(addr: impl Into<net::SocketAddr>) -> Self {
        Self {
            addr: addr.into(),
            refs: Arc::new(()),
        }
    }

    /// Get the number of references to this virtual socket.
    pub fn refs(&self) -> usize {
        Arc::strong_count(&self.refs)
    }
}

impl From<net::SocketAddr> for Socket {
    fn from(addr: net::SocketAddr) -> Self {
        Self::new(addr)
    }
}

/// Disconnect reason.
#[derive(Debug, Clone)]
pub enum DisconnectReason {
    /// Peer is misbehaving.
    PeerMisbehaving(&'static str),
    /// Peer protocol version is too old.
    PeerProtocolVersion(u32),
    /// Peer doesn't have the required services.
    PeerServices(ServiceFlags),
    /// Peer magic is invalid.
    PeerMagic(Magic),
    /// Peer timed out.
    PeerTimeout(&'static str),
    /// Connection to self was detected.
    SelfConnection,
    /// Inbound connection limit reached.
    ConnectionLimit,
    /// Inbound connections are not accepted and the peer is not
    /// whitelisted.
    ConnectionRejected,
    /// Error trying to decode incoming message.
    DecodeError,
    /// Peer was forced to disconnect by external command.
    Command,
    /// Peer was banned due to the violation of protocol rules.
    PeerBanned,
}

impl DisconnectReason {
    /// Check whether the disconnect reason is transient, ie. may no longer
    /// be applicable after some time.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLimit | Self::ConnectionRejected | Self::PeerTimeout(_)
        )
    }
}

impl From<DisconnectReason> for crate::net::Disconnect<DisconnectReason> {
    fn from(reason: DisconnectReason) -> Self {
        Self::StateMachine(reason)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerMisbehaving(reason) => write!(f, "peer misbehaving: {}", reason),
            Self::PeerProtocolVersion(_) => write!(f, "peer protocol version mismatch"),
            Self::PeerServices(_) => write!(f, "peer doesn't have the required services"),
            Self::PeerMagic(magic) => write!(f, "received message with invalid magic: {}", magic),
            Self::PeerTimeout(s) => write!(f, "peer timed out: {:?}", s),
            Self::SelfConnection => write!(f, "detected self-connection"),
            Self::ConnectionLimit => write!(f, "inbound connection limit reached"),
            Self::ConnectionRejected => write!(f, "inbound connections are not accepted"),
            Self::DecodeError => write!(f, "message decode error"),
            Self::Command => write!(f, "received external command"),
            Self::PeerBanned => write!(f, "peer was banned due to violation of protocol rules"),
        }
    }
}

/// A remote peer.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Peer address.
    pub addr: net::SocketAddr,
    /// Local peer address.
    pub local_addr: net::SocketAddr,
    /// Whether this is an inbound or outbound peer connection.
    pub link: Link,
    /// Connected since this time.
    pub since: LocalTime,
    /// The peer's services.
    pub services: ServiceFlags,
    /// Peer user agent string.
    pub user_agent: String,
    /// Whether this peer relays transactions.
    pub relay: bool,
    /// The peer's advertised chain height at handshake time.
    pub height: i32,
}

impl Peer {
    /// Check if this is an outbound peer.
    pub fn is_outbound(&self) -> bool {
        self.link.is_outbound()
    }
}

impl From<(&peermgr::PeerInfo, &peermgr::Connection)> for Peer {
    fn from((peer, conn): (&peermgr::PeerInfo, &peermgr::Connection)) -> Self {
        Self {
            addr: conn.socket.addr,
            local_addr: conn.local_addr,
            link: conn.link,
            since: conn.since,
            services: peer.services,
            user_agent: peer.user_agent.clone(),
            relay: peer.relay,
            height: peer.start_height,
        }
    }
}

/// An instance of the peer-to-peer protocol. Parametrized over the chain
/// store, the peer-address store and the clock.
pub struct StateMachine<T, P, C> {
    /// The network we're connecting to.
    pub network: Network,
    /// Peer address manager.
    pub(super) addrmgr: AddressManager<P, Outbox, C>,
    /// Ping manager.
    pub(super) pingmgr: PingManager<Outbox, C>,
    /// Peer manager.
    pub peermgr: PeerManager<Outbox, C>,
    /// Inventory manager.
    pub(super) invmgr: InventoryManager<T, Outbox, C>,
    /// Chain sync manager.
    pub(super) syncmgr: SyncManager<T, Outbox>,
    /// Chain store handle.
    store: T,
    /// Network-adjusted clock.
    pub clock: C,
    /// Random number generator.
    pub rng: fastrand::Rng,
    /// Outbound I/O. Used to communicate protocol events with a reactor.
    pub outbox: Outbox,
    /// Ingestion queue and subscriber fan-out.
    notifier: Notifier,
}

/// State machine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// The network we are connected to.
    pub network: Network,
    /// Peers to connect to. Also whitelisted for inbound connections.
    pub connect: Vec<net::SocketAddr>,
    /// Services offered by our peer.
    pub services: ServiceFlags,
    /// Required peer services.
    pub required_services: ServiceFlags,
    /// Peer whitelist. Peers in this list are trusted by default.
    pub whitelist: Whitelist,
    /// Our user agent.
    pub user_agent: &'static str,
    /// Handshake and ping liveness timeout.
    pub connection_timeout: LocalDuration,
    /// Bound on the inventory work queue.
    pub max_inv: usize,
    /// Whether to announce our own address.
    pub announce: bool,
    /// Whether to accept inbound connections from unknown peers.
    pub accept_connections: bool,
    /// Configured limits.
    pub limits: Limits,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            connect: Vec::new(),
            services: ServiceFlags::NETWORK,
            required_services: ServiceFlags::NETWORK,
            whitelist: Whitelist::default(),
            user_agent: USER_AGENT,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            max_inv: DEFAULT_MAX_INV,
            announce: false,
            accept_connections: true,
            limits: Limits::default(),
        }
    }
}

impl<T, P, C> Iterator for StateMachine<T, P, C> {
    type Item = super::output::Io;

    fn next(&mut self) -> Option<Self::Item> {
        self.outbox.next()
    }
}

/// A command or request that can be sent to the protocol.
#[derive(Clone)]
pub enum Command {
    /// Get connected peers.
    GetPeers(ServiceFlags, chan::Sender<Vec<Peer>>),
    /// Broadcast to peers matching the predicate.
    Broadcast(NetworkMessage, fn(Peer) -> bool, chan::Sender<Vec<PeerId>>),
    /// Send a message to a random peer.
    Query(NetworkMessage, chan::Sender<Option<SocketAddr>>),
    /// Connect to a peer.
    Connect(SocketAddr),
    /// Disconnect from a peer.
    Disconnect(SocketAddr),
    /// Import addresses into the address book.
    ImportAddresses(Vec<Address>),
    /// Relay a transaction to our peers.
    RelayTransaction(Transaction),
    /// Forbid a peer from connecting to us.
    BanPeer(SocketAddr),
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GetPeers(flags, _) => write!(f, "GetPeers({})", flags),
            Self::Broadcast(msg, _, _) => write!(f, "Broadcast({:?})", msg.cmd()),
            Self::Query(msg, _) => write!(f, "Query({:?})", msg.cmd()),
            Self::Connect(addr) => write!(f, "Connect({})", addr),
            Self::Disconnect(addr) => write!(f, "Disconnect({})", addr),
            Self::ImportAddresses(addrs) => write!(f, "ImportAddresses({:?})", addrs),
            Self::RelayTransaction(tx) => write!(f, "RelayTransaction({})", tx.txid()),
            Self::BanPeer(addr) => write!(f, "BanPeer({:?})", addr),
        }
    }
}

impl<T, P, C> StateMachine<T, P, C>
where
    T: ChainStore,
    P: peer::Store,
    C: AdjustedClock<PeerId>,
{
    /// Construct a new protocol instance.
    pub fn new(
        store: T,
        peers: P,
        clock: C,
        rng: fastrand::Rng,
        config: Config,
        notifier: Notifier,
    ) -> Self {
        let Config {
            network,
            connect,
            services,
            mut whitelist,
            user_agent,
            connection_timeout,
            max_inv,
            announce,
            accept_connections,
            required_services,
            limits,
        } = config;

        // Persistent peers are always accepted inbound.
        for addr in &connect {
            whitelist.addr.insert(addr.ip());
        }

        let outbox = Outbox::new(network);
        let pingmgr = PingManager::new(
            connection_timeout,
            rng.clone(),
            outbox.clone(),
            clock.clone(),
        );
        let peermgr = PeerManager::new(
            peermgr::Config {
                protocol_version: PROTOCOL_VERSION,
                whitelist,
                persistent: connect,
                target_outbound_peers: limits.max_outbound_peers,
                max_inbound_peers: limits.max_inbound_peers,
                accept_connections,
                announce,
                connection_timeout,
                retry_max_wait: LocalDuration::from_mins(60),
                retry_min_wait: LocalDuration::from_secs(1),
                required_services,
                services,
                user_agent,
            },
            rng.clone(),
            outbox.clone(),
            clock.clone(),
        );
        let addrmgr = AddressManager::new(
            crate::fsm::addrmgr::Config {
                announce,
                local_services: services,
            },
            rng.clone(),
            peers,
            outbox.clone(),
            clock.clone(),
        );
        let invmgr = InventoryManager::new(
            max_inv,
            store.clone(),
            rng.clone(),
            outbox.clone(),
            clock.clone(),
        );
        let syncmgr = SyncManager::new(
            PROTOCOL_VERSION,
            network.genesis_hash(),
            store.clone(),
            rng.clone(),
            outbox.clone(),
        );

        Self {
            network,
            clock,
            addrmgr,
            pingmgr,
            peermgr,
            invmgr,
            syncmgr,
            store,
            rng,
            outbox,
            notifier,
        }
    }

    /// Process a user command.
    pub async fn command(&mut self, cmd: Command) {
        debug!(target: "p2p", "Received command: {:?}", cmd);

        match cmd {
            Command::GetPeers(services, reply) => {
                let peers = self
                    .peermgr
                    .peers()
                    .filter(|(p, _)| p.is_negotiated())
                    .filter(|(p, _)| p.services.has(services))
                    .map(Peer::from)
                    .collect::<Vec<Peer>>();

                reply.send_async(peers).await.ok();
            }
            Command::Connect(addr) => {
                self.peermgr.whitelist(addr);
                self.peermgr.connect(&addr);
            }
            Command::Disconnect(addr) => {
                self.disconnect(addr, DisconnectReason::Command);
            }
            Command::Query(msg, reply) => {
                reply.send_async(self.query(msg, |_| true)).await.ok();
            }
            Command::Broadcast(msg, predicate, reply) => {
                let peers = self.broadcast(msg, |p| predicate(p.clone()));
                reply.send_async(peers).await.ok();
            }
            Command::ImportAddresses(addrs) => {
                // Nb. For imported addresses, the time last active is the
                // current time.
                let time = self.clock.local_time().as_secs() as u32;

                self.addrmgr.insert(
                    addrs.into_iter().map(|a| (time, a)),
                    peer::Source::Imported,
                );
            }
            Command::RelayTransaction(tx) => {
                self.invmgr.relay(tx);
            }
            Command::BanPeer(addr) => {
                self.addrmgr.peer_disconnected(&addr, Disconnect::PeerBanned);
                self.peermgr.disconnect(addr, DisconnectReason::PeerBanned);
            }
        }
    }

    /// Disconnect a peer.
    pub fn disconnect(&mut self, addr: PeerId, reason: DisconnectReason) {
        self.peermgr.disconnect(addr, reason);
    }

    /// A peer completed the handshake: wire it into every sub-protocol and
    /// notify subscribers.
    fn peer_negotiated(
        &mut self,
        addr: PeerId,
        info: peermgr::PeerInfo,
        conn: peermgr::Connection,
        rtt: LocalDuration,
    ) {
        self.addrmgr.peer_negotiated(&addr, info.services);
        self.pingmgr.peer_negotiated(addr, info.version, rtt);
        self.invmgr
            .peer_negotiated(conn.socket.clone(), info.services, info.relay);
        self.syncmgr.peer_negotiated(addr, conn.link);

        self.notifier.notify(NodeEvent::Connected {
            addr,
            outbound: conn.link.is_outbound(),
            user_agent: info.user_agent.clone(),
            version: info.version,
            height: info.start_height,
        });
    }

    /// Send a message to all negotiated peers matching the predicate.
    fn broadcast<Q>(&mut self, msg: NetworkMessage, predicate: Q) -> Vec<PeerId>
    where
        Q: Fn(&Peer) -> bool,
    {
        let mut peers = Vec::new();

        for (peer_info, connection) in self.peermgr.peers() {
            let peer = Peer::from((peer_info, connection));
            if predicate(&peer) && peer_info.is_negotiated() {
                peers.push(peer.addr);
                self.outbox.message(peer.addr, msg.clone());
            }
        }

        peers
    }

    /// Send a message to a random outbound peer. Returns the peer id.
    fn query<Q>(&mut self, msg: NetworkMessage, f: Q) -> Option<PeerId>
    where
        Q: Fn(&Peer) -> bool,
    {
        let peers = self
            .peermgr
            .negotiated(Link::Outbound)
            .map(Peer::from)
            .filter(f)
            .collect::<Vec<_>>();

        match peers.len() {
            n if n > 0 => {
                let r = self.rng.usize(..n);
                let p = peers.get(r).expect("index is within bounds");

                self.outbox.message(p.addr, msg);

                Some(p.addr)
            }
            _ => None,
        }
    }
}

#[async_trait]
impl<T, P, C> crate::net::StateMachine for StateMachine<T, P, C>
where
    T: ChainStore + Send,
    P: peer::Store + Send,
    C: AdjustedClock<PeerId> + Sync + Send,
{
    type Message = RawNetworkMessage;
    type Event = Event;
    type DisconnectReason = DisconnectReason;

    async fn initialize(&mut self, time: LocalTime) {
        self.clock.set(time);
        self.outbox.event(Event::Initializing);
        self.addrmgr.initialize();
        self.peermgr.initialize(&mut self.addrmgr);

        self.outbox.event(Event::Ready {
            height: self.store.height(),
            time,
        });
    }

    async fn message_received(&mut self, addr: &SocketAddr, msg: Cow<'_, RawNetworkMessage>) {
        let now = self.clock.local_time();
        let addr = *addr;
        let msg = msg.into_owned();

        if msg.magic != self.network.magic() {
            self.disconnect(addr, DisconnectReason::PeerMagic(msg.magic));
            return;
        }

        if !self.peermgr.is_connected(&addr) {
            debug!(target: "p2p", "Received `{}` from unknown peer {}", msg.payload.cmd(), addr);
            return;
        }

        debug!(target: "p2p", "Received `{}` from {}", msg.payload.cmd(), addr);

        match msg.payload {
            NetworkMessage::Version(version) => {
                if let Some((info, conn, rtt)) =
                    self.peermgr.received_version(&addr, version, &mut self.addrmgr)
                {
                    self.clock.record_offset(addr, info.time_offset);
                    self.peer_negotiated(addr, info, conn, rtt);
                }
            }
            NetworkMessage::Verack => {
                if let Some((info, conn, rtt)) =
                    self.peermgr.received_verack(&addr, &mut self.addrmgr)
                {
                    self.peer_negotiated(addr, info, conn, rtt);
                }
            }
            NetworkMessage::Ping(nonce) => {
                if self.pingmgr.received_ping(addr, nonce) {
                    self.addrmgr.peer_active(addr);
                }
            }
            NetworkMessage::Pong(nonce) => {
                if self.pingmgr.received_pong(addr, nonce, now) {
                    self.addrmgr.peer_active(addr);
                }
            }
            NetworkMessage::Addr(addresses) => {
                for (time, address) in &addresses {
                    if let Ok(socket_addr) = address.socket_addr() {
                        self.notifier.notify(NodeEvent::Addr {
                            addr: socket_addr,
                            services: address.services,
                            time: *time,
                        });
                    }
                }
                self.addrmgr.received_addr(addr, addresses);
            }
            NetworkMessage::GetAddr => {
                self.addrmgr.received_getaddr(&addr);
            }
            NetworkMessage::Inv(inv) => {
                self.invmgr.received_inv(addr, inv);
            }
            NetworkMessage::GetData(inv) => {
                self.invmgr.received_getdata(addr, inv);
            }
            NetworkMessage::GetBlocks(msg) => {
                self.syncmgr.received_getblocks(
                    &addr,
                    msg.version,
                    msg.locator_hashes,
                    msg.stop_hash,
                    false,
                );
            }
            NetworkMessage::GetHeaders(msg) => {
                self.syncmgr.received_getblocks(
                    &addr,
                    msg.version,
                    msg.locator_hashes,
                    msg.stop_hash,
                    true,
                );
            }
            NetworkMessage::Headers(headers) => {
                self.notifier.ingest(IngestMessage::Headers(headers, addr));
            }
            NetworkMessage::Block(block) => {
                self.notifier.ingest(IngestMessage::Block(block, addr));
            }
            NetworkMessage::Tx(tx) => {
                self.notifier.ingest(IngestMessage::Tx(tx, addr));
            }
            NetworkMessage::Alert(payload) => {
                warn!(target: "p2p", "{}: Received alert ({} bytes)", addr, payload.len());
            }
            NetworkMessage::Unknown { command, .. } => {
                debug!(target: "p2p", "{}: Received unknown command `{}`", addr, command);
            }
        }
    }

    fn attempted(&mut self, addr: &net::SocketAddr) {
        self.addrmgr.peer_attempted(addr);
        self.peermgr.peer_attempted(addr);
    }

    fn connected(
        &mut self,
        addr: net::SocketAddr,
        local_addr: &net::SocketAddr,
        link: Link,
    ) -> bool {
        if self.addrmgr.is_banned(&addr) {
            debug!(target: "p2p", "Rejecting banned peer {}", addr);
            crate::fsm::output::Disconnect::disconnect(
                &self.outbox,
                addr,
                DisconnectReason::PeerBanned,
            );
            return false;
        }
        let height = self.store.height();

        if !self
            .peermgr
            .peer_connected(addr, *local_addr, link, height, &mut self.addrmgr)
        {
            return false;
        }

        self.addrmgr.record_local_address(*local_addr);
        self.addrmgr.peer_connected(&addr);

        true
    }

    async fn disconnected(&mut self, addr: &SocketAddr, reason: Disconnect<DisconnectReason>) {
        let was_connected = self.peermgr.is_connected(addr);

        self.addrmgr.peer_disconnected(addr, reason.clone());
        self.pingmgr.peer_disconnected(addr);
        self.invmgr.peer_disconnected(addr);
        self.syncmgr.peer_disconnected(addr);
        self.peermgr
            .peer_disconnected(addr, &mut self.addrmgr, reason.clone());

        if was_connected {
            self.notifier.notify(NodeEvent::Disconnected {
                addr: *addr,
                reason: reason.to_string(),
            });
        }
    }

    fn tick(&mut self, local_time: LocalTime) {
        self.clock.set(local_time);
    }

    async fn timer_expired(&mut self) {
        self.pingmgr.received_wake();
        self.addrmgr.received_wake();
        self.invmgr.received_wake();
        self.syncmgr.received_wake();
        self.peermgr.received_wake(&mut self.addrmgr);
    }
}

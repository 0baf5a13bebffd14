//! The peer-to-peer client: wires the service to a reactor and hands out
//! handles for the rest of the node to talk to it.
use std::net::SocketAddr;
use std::time::SystemTime;
use std::{net, time};

use async_trait::async_trait;
use flume as chan;
use tokio_util::sync::CancellationToken;

use bitcoin::network::{constants::ServiceFlags, Address};
use bitcoin::Transaction;

use gold_chain::ChainStore;
use gold_types::messages::p2p::NetworkMessage;
use gold_types::network::Network;
use gold_types::{IngestMessage, NodeEvent};

use crate::{
    client::error::Error,
    client::handle,
    client::peer::Cache,
    client::service::Service,
    common::peer::{KnownAddress, Source, Store},
    common::time::{AdjustedTime, RefClock},
    fsm::handler,
    fsm::handler::PeerId,
    fsm::handler::{Command, Limits, Peer},
    net::{LocalDuration, NetReactor, NetWaker},
    notifier::Notifier,
};

use super::boot_nodes::insert_boot_nodes;

/// P2P client configuration.
#[derive(Debug, Clone)]
pub struct P2PConfig {
    /// The network to join.
    pub network: Network,
    /// Peers to maintain persistent connections with. Always accepted
    /// inbound.
    pub connect: Vec<SocketAddr>,
    /// Client listen address.
    pub listen: SocketAddr,
    /// User agent string.
    pub user_agent: &'static str,
    /// Handshake and ping liveness timeout.
    pub connection_timeout: LocalDuration,
    /// Bound on the inventory work queue.
    pub max_inv: usize,
    /// Whether to announce our own address to peers.
    pub announce: bool,
    /// Whether to accept inbound connections from unknown peers.
    pub accept_connections: bool,
    /// Configured limits (inbound/outbound connections).
    pub limits: Limits,
}

impl P2PConfig {
    /// Create a new configuration for the given network.
    pub fn new(
        network: Network,
        listen: SocketAddr,
        connect: Vec<net::SocketAddr>,
        max_inb: usize,
        max_outb: usize,
    ) -> Self {
        Self {
            network,
            limits: Limits {
                max_outbound_peers: max_outb,
                max_inbound_peers: max_inb,
            },
            listen,
            connect,
            ..Self::default()
        }
    }
}

impl Default for P2PConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            connect: Vec::new(),
            listen: ([0, 0, 0, 0], 0).into(),
            user_agent: handler::USER_AGENT,
            connection_timeout: handler::DEFAULT_CONNECTION_TIMEOUT,
            max_inv: handler::DEFAULT_MAX_INV,
            announce: false,
            accept_connections: true,
            limits: Limits::default(),
        }
    }
}

/// Runs a pre-loaded client.
pub struct P2PClient<T: ChainStore, R: NetReactor> {
    handle: Handle<R::Waker>,
    service: Service<T, Cache, RefClock<AdjustedTime<SocketAddr>>>,
    listen: SocketAddr,
    commands: chan::Receiver<Command>,
    reactor: R,
}

impl<T: ChainStore, R: NetReactor> P2PClient<T, R> {
    /// Create a new client. Ingestion items are pushed onto the given
    /// channel for the chain worker to consume.
    pub fn new(
        config: P2PConfig,
        store: T,
        ingest: chan::Sender<IngestMessage>,
    ) -> Result<Self, Error> {
        let (commands_tx, commands_rx) = chan::unbounded::<Command>();

        let (listening_send, listening) = chan::bounded(1);
        let reactor = <R as NetReactor>::new(listening_send)?;
        let notifier = Notifier::new(ingest);

        let local_time = SystemTime::now().into();
        let clock = AdjustedTime::<SocketAddr>::new(local_time);
        let rng = fastrand::Rng::new();

        let mut peers = Cache::new();

        insert_boot_nodes(&mut peers, config.network);

        for addr in &config.connect {
            peers.insert(
                addr,
                KnownAddress::new(
                    Address::new(addr, ServiceFlags::NONE),
                    Source::Imported,
                    None,
                ),
            );
        }

        let listen = config.listen;
        let service = Service::new(
            store,
            peers,
            RefClock::from(clock),
            rng,
            config,
            notifier.clone(),
        );

        let handle = Handle {
            commands: commands_tx,
            waker: reactor.waker(),
            timeout: time::Duration::from_secs(60),
            listening,
            notifier,
        };

        Ok(P2PClient {
            handle,
            listen,
            commands: commands_rx,
            reactor,
            service,
        })
    }

    /// Run a pre-loaded p2p client.
    pub async fn run(mut self, cancellation: CancellationToken) {
        let result = self
            .reactor
            .run(&self.listen, self.service, self.commands, cancellation)
            .await;

        if let Err(e) = result {
            tracing::error!(target: "p2p", "P2P is down. P2P client run error: {}", e);
        }
    }

    /// Create a new handle to communicate with the client.
    pub fn handle(&self) -> Handle<R::Waker> {
        self.handle.clone()
    }
}

/// Handle on a running client.
#[derive(Clone)]
pub struct Handle<W: NetWaker> {
    pub commands: chan::Sender<Command>,
    pub waker: W,
    pub timeout: time::Duration,
    pub listening: chan::Receiver<net::SocketAddr>,
    notifier: Notifier,
}

impl<W: NetWaker> Handle<W> {
    /// Subscribe to node events.
    pub fn subscribe(&self) -> chan::Receiver<NodeEvent> {
        self.notifier.subscribe()
    }

    /// Send a command to the command channel, and wake up the event loop.
    async fn _command(&self, cmd: Command) -> Result<(), handle::Error> {
        if self.commands.send_async(cmd).await.is_err() {
            return Err(handle::Error::Command);
        }
        self.waker.wake()?;

        Ok(())
    }
}

#[async_trait]
impl<W: NetWaker> handle::Handle for Handle<W> {
    async fn command(&self, cmd: Command) -> Result<(), handle::Error> {
        self._command(cmd).await
    }

    async fn broadcast(
        &self,
        msg: NetworkMessage,
        predicate: fn(Peer) -> bool,
    ) -> Result<Vec<net::SocketAddr>, handle::Error> {
        let (transmit, receive) = chan::bounded(1);
        self.command(Command::Broadcast(msg, predicate, transmit))
            .await?;

        match receive.recv_async().await {
            Ok(addrs) => Ok(addrs),
            Err(_) => Err(handle::Error::Timeout),
        }
    }

    async fn query(&self, msg: NetworkMessage) -> Result<Option<net::SocketAddr>, handle::Error> {
        let (transmit, receive) = chan::bounded::<Option<SocketAddr>>(1);
        self.command(Command::Query(msg, transmit)).await?;

        match receive.recv_async().await {
            Ok(addr) => Ok(addr),
            Err(_) => Err(handle::Error::Timeout),
        }
    }

    async fn get_peers(&self, services: ServiceFlags) -> Result<Vec<Peer>, handle::Error> {
        let (transmit, receive) = chan::bounded(1);
        self.command(Command::GetPeers(services, transmit)).await?;

        match receive.recv_async().await {
            Ok(peers) => Ok(peers),
            Err(_) => Err(handle::Error::Timeout),
        }
    }

    async fn relay_transaction(&self, tx: Transaction) -> Result<(), handle::Error> {
        self.command(Command::RelayTransaction(tx)).await
    }

    async fn connect_peer(&self, addr: PeerId) -> Result<(), handle::Error> {
        self.command(Command::Connect(addr)).await
    }

    async fn ban_peer(&self, addr: SocketAddr) -> Result<(), handle::Error> {
        self.command(Command::BanPeer(addr)).await
    }
}

//! Client service. Wraps the state machine and handles decoding and
//! encoding of network messages.
use std::borrow::{Borrow, Cow};
use std::collections::HashMap;
use std::net;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use bitcoin::consensus::Encodable;

use gold_chain::ChainStore;

use crate::{
    client,
    client::P2PConfig,
    common::peer,
    common::time::AdjustedClock,
    fsm,
    net::LocalTime,
    net::StateMachine,
    net::{Disconnect, Io, Link},
    notifier::Notifier,
};

/// Client service. The frame parser lives here: raw bytes from the reactor
/// are decoded into whole messages before they reach the state machine.
pub struct Service<T, P, C> {
    inboxes: HashMap<net::SocketAddr, client::stream::Decoder>,
    machine: fsm::handler::StateMachine<T, P, C>,
}

impl<T, P, C> Service<T, P, C>
where
    T: ChainStore,
    P: peer::Store,
    C: AdjustedClock<net::SocketAddr>,
{
    /// Create a new client service.
    pub fn new(
        store: T,
        peers: P,
        clock: C,
        rng: fastrand::Rng,
        config: P2PConfig,
        notifier: Notifier,
    ) -> Self {
        Self {
            inboxes: HashMap::new(),
            machine: fsm::handler::StateMachine::new(
                store,
                peers,
                clock,
                rng,
                fsm::handler::Config {
                    network: config.network,
                    connect: config.connect,
                    user_agent: config.user_agent,
                    connection_timeout: config.connection_timeout,
                    max_inv: config.max_inv,
                    announce: config.announce,
                    accept_connections: config.accept_connections,
                    limits: config.limits,

                    ..fsm::handler::Config::default()
                },
                notifier,
            ),
        }
    }
}

#[async_trait]
impl<T, P, C> crate::net::Service for Service<T, P, C>
where
    T: ChainStore + Send + Sync,
    P: peer::Store + Send + Sync,
    C: AdjustedClock<net::SocketAddr> + Sync + Send,
{
    type Command = fsm::handler::Command;

    async fn command_received(&mut self, cmd: Self::Command) {
        self.machine.command(cmd).await
    }
}

#[async_trait]
impl<T, P, C> StateMachine for Service<T, P, C>
where
    T: ChainStore + Send + Sync,
    P: peer::Store + Send + Sync,
    C: AdjustedClock<net::SocketAddr> + Sync + Send,
{
    type Message = [u8];
    type Event = fsm::event::Event;
    type DisconnectReason = fsm::handler::DisconnectReason;

    async fn initialize(&mut self, time: LocalTime) {
        self.machine.initialize(time).await;
    }

    async fn message_received(&mut self, addr: &net::SocketAddr, bytes: Cow<'_, [u8]>) {
        let Some(inbox) = self.inboxes.get_mut(addr) else {
            debug!(target: "p2p", "Received message from unknown peer {}", addr);
            return;
        };

        inbox.input(bytes.borrow());

        loop {
            // Nb. The inbox has to be re-borrowed: the state machine may
            // run between decodes.
            let Some(inbox) = self.inboxes.get_mut(addr) else {
                return;
            };
            match inbox.decode_next() {
                Ok(Some(msg)) => self.machine.message_received(addr, Cow::Owned(msg)).await,
                Ok(None) => break,
                Err(err) if err.is_fatal() => {
                    error!(target: "p2p", "{}: Fatal framing error: {}", addr, err);
                    self.machine
                        .disconnect(*addr, fsm::handler::DisconnectReason::DecodeError);
                    return;
                }
                Err(err) => {
                    // A single bad frame is dropped; the session continues.
                    warn!(target: "p2p", "{}: Dropping invalid frame: {}", addr, err);
                }
            }
        }
    }

    fn attempted(&mut self, addr: &net::SocketAddr) {
        self.machine.attempted(addr)
    }

    fn connected(
        &mut self,
        addr: net::SocketAddr,
        local_addr: &net::SocketAddr,
        link: Link,
    ) -> bool {
        if !self.machine.connected(addr, local_addr, link) {
            return false;
        }
        self.inboxes.insert(
            addr,
            client::stream::Decoder::new(1024, self.machine.network.magic()),
        );
        true
    }

    async fn disconnected(
        &mut self,
        addr: &net::SocketAddr,
        reason: Disconnect<Self::DisconnectReason>,
    ) {
        self.inboxes.remove(addr);
        self.machine.disconnected(addr, reason).await
    }

    fn tick(&mut self, local_time: LocalTime) {
        self.machine.tick(local_time);
    }

    async fn timer_expired(&mut self) {
        self.machine.timer_expired().await;
    }
}

impl<T, P, C> Iterator for Service<T, P, C> {
    type Item = Io<Vec<u8>, fsm::event::Event, fsm::handler::DisconnectReason>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.machine.next() {
            Some(Io::Write(addr, msg)) => {
                let mut buf = Vec::new();

                msg.consensus_encode(&mut buf)
                    .expect("writing to an in-memory buffer doesn't fail");
                Some(Io::Write(addr, buf))
            }
            Some(Io::Event(e)) => Some(Io::Event(e)),
            Some(Io::Connect(a)) => Some(Io::Connect(a)),
            Some(Io::Disconnect(a, r)) => Some(Io::Disconnect(a, r)),
            Some(Io::SetTimer(d)) => Some(Io::SetTimer(d)),

            None => None,
        }
    }
}

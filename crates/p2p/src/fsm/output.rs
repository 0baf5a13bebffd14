//! Protocol output capabilities.
//!
//! See [`Outbox`] type.
//!
//! Each sub-protocol, eg. the "ping" or "handshake" protocols are given a
//! copy of this outbox with specific capabilities, eg. peer disconnection,
//! message sending etc. to communicate with the network.
use std::sync::{Arc, Mutex};
use std::{collections::VecDeque, net};

use tracing::debug;

use bitcoin::network::address::Address;
use bitcoin::network::message_blockdata::{GetBlocksMessage, GetHeadersMessage};
use bitcoin::network::message_network::VersionMessage;
use bitcoin::Transaction;

use gold_types::messages::p2p::{Inventory, NetworkMessage, RawNetworkMessage};
use gold_types::network::Network;
use gold_types::{Block, BlockHeader};

use crate::{
    fsm::event::Event,
    fsm::handler::{DisconnectReason, PeerId},
    net::LocalDuration,
};

/// Maximum number of inventory entries per `inv` frame.
pub const MAX_INVENTORY_BATCH: usize = 251;

/// Output of a state transition of the protocol state machine.
pub type Io = crate::net::Io<RawNetworkMessage, Event, DisconnectReason>;

impl From<Event> for Io {
    fn from(event: Event) -> Self {
        Io::Event(event)
    }
}

/// Ability to connect to peers.
pub trait Connect {
    /// Connect to peer.
    fn connect(&self, addr: net::SocketAddr, timeout: LocalDuration);
}

/// Ability to disconnect from peers.
pub trait Disconnect {
    /// Disconnect from peer.
    fn disconnect(&self, addr: net::SocketAddr, reason: DisconnectReason);
}

/// The ability to set a timer.
pub trait SetTimer {
    /// Ask to be woken up in a predefined amount of time.
    fn set_timer(&self, duration: LocalDuration) -> &Self;
}

/// Bitcoin-family wire protocol.
pub trait Wire<E> {
    /// Emit an event.
    fn event(&self, event: E);

    // Handshake messages //////////////////////////////////////////////////////

    /// Send a `version` message.
    fn version(&mut self, addr: PeerId, msg: VersionMessage) -> &mut Self;

    /// Send a `verack` message.
    fn verack(&mut self, addr: PeerId) -> &mut Self;

    // Ping/pong ///////////////////////////////////////////////////////////////

    /// Send a `ping` message. The nonce is absent for peers at or below
    /// the BIP 0031 protocol version.
    fn ping(&mut self, addr: net::SocketAddr, nonce: Option<u32>) -> &Self;

    /// Send a `pong` message.
    fn pong(&mut self, addr: net::SocketAddr, nonce: u32) -> &Self;

    // Addresses //////////////////////////////////////////////////////////////

    /// Send a `getaddr` message.
    fn get_addr(&mut self, addr: PeerId);

    /// Send an `addr` message.
    fn addr(&mut self, addr: PeerId, addrs: Vec<(u32, Address)>);

    // Inventory ///////////////////////////////////////////////////////////////

    /// Send an `inv` message to a peer, batched in frames of at most
    /// [`MAX_INVENTORY_BATCH`] entries.
    fn inv(&mut self, addr: PeerId, inventories: Vec<Inventory>) -> &mut Self;

    /// Send a `getdata` message to a peer.
    fn get_data(&mut self, addr: PeerId, inventories: Vec<Inventory>) -> &mut Self;

    /// Send a `tx` message to a peer.
    fn tx(&mut self, addr: PeerId, tx: Transaction) -> &mut Self;

    /// Send a `block` message to a peer.
    fn block(&mut self, addr: PeerId, block: Block) -> &mut Self;

    // Block download //////////////////////////////////////////////////////////

    /// Send a `getblocks` message to a peer.
    fn get_blocks(&mut self, addr: PeerId, msg: GetBlocksMessage) -> &mut Self;

    /// Send a `getheaders` message to a peer.
    fn get_headers(&mut self, addr: PeerId, msg: GetHeadersMessage) -> &mut Self;

    /// Send a `headers` message to a peer.
    fn headers(&mut self, addr: PeerId, headers: Vec<BlockHeader>) -> &mut Self;
}

/// Holds protocol outputs and pending I/O.
#[derive(Debug, Clone)]
pub struct Outbox {
    /// The network we are on.
    network: Network,
    /// Output queue.
    outbound: Arc<Mutex<VecDeque<Io>>>,
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new(Network::Mainnet)
    }
}

impl Iterator for Outbox {
    type Item = Io;

    /// Get the next item in the outbound queue.
    fn next(&mut self) -> Option<Io> {
        self.outbound
            .lock()
            .expect("lock is not poisoned")
            .pop_front()
    }
}

impl Outbox {
    /// Create a new outbox.
    pub fn new(network: Network) -> Self {
        Self {
            network,
            outbound: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Push an output to the channel.
    pub fn push(&self, output: Io) {
        self.outbound
            .lock()
            .expect("lock is not poisoned")
            .push_back(output);
    }

    /// Push a message to the channel.
    pub fn message(&mut self, addr: PeerId, payload: NetworkMessage) -> &Self {
        debug!(target: "p2p", "Sending `{}` to {}", payload.cmd(), addr);

        self.push(Io::Write(
            addr,
            RawNetworkMessage {
                magic: self.network.magic(),
                payload,
            },
        ));

        self
    }

    /// Push an event to the channel.
    pub fn event(&self, event: Event) {
        self.push(Io::Event(event));
    }
}

impl Disconnect for Outbox {
    fn disconnect(&self, addr: net::SocketAddr, reason: DisconnectReason) {
        debug!(target: "p2p", "Disconnecting from {}: {}", addr, reason);

        self.push(Io::Disconnect(addr, reason));
    }
}

impl SetTimer for Outbox {
    fn set_timer(&self, duration: LocalDuration) -> &Self {
        self.push(Io::SetTimer(duration));
        self
    }
}

impl Connect for Outbox {
    fn connect(&self, addr: net::SocketAddr, timeout: LocalDuration) {
        self.push(Io::Connect(addr));
        self.push(Io::SetTimer(timeout));
    }
}

impl<E: Into<Event> + std::fmt::Display> Wire<E> for Outbox {
    fn event(&self, event: E) {
        debug!(target: "p2p", "{}", &event);
        self.event(event.into());
    }

    fn version(&mut self, addr: PeerId, msg: VersionMessage) -> &mut Self {
        self.message(addr, NetworkMessage::Version(msg));
        self
    }

    fn verack(&mut self, addr: PeerId) -> &mut Self {
        self.message(addr, NetworkMessage::Verack);
        self
    }

    fn ping(&mut self, addr: net::SocketAddr, nonce: Option<u32>) -> &Self {
        self.message(addr, NetworkMessage::Ping(nonce));
        self
    }

    fn pong(&mut self, addr: net::SocketAddr, nonce: u32) -> &Self {
        self.message(addr, NetworkMessage::Pong(nonce));
        self
    }

    fn get_addr(&mut self, addr: PeerId) {
        self.message(addr, NetworkMessage::GetAddr);
    }

    fn addr(&mut self, addr: PeerId, addrs: Vec<(u32, Address)>) {
        self.message(addr, NetworkMessage::Addr(addrs));
    }

    fn inv(&mut self, addr: PeerId, inventories: Vec<Inventory>) -> &mut Self {
        for batch in inventories.chunks(MAX_INVENTORY_BATCH) {
            self.message(addr, NetworkMessage::Inv(batch.to_vec()));
        }
        self
    }

    fn get_data(&mut self, addr: PeerId, inventories: Vec<Inventory>) -> &mut Self {
        self.message(addr, NetworkMessage::GetData(inventories));
        self
    }

    fn tx(&mut self, addr: PeerId, tx: Transaction) -> &mut Self {
        self.message(addr, NetworkMessage::Tx(tx));
        self
    }

    fn block(&mut self, addr: PeerId, block: Block) -> &mut Self {
        self.message(addr, NetworkMessage::Block(block));
        self
    }

    fn get_blocks(&mut self, addr: PeerId, msg: GetBlocksMessage) -> &mut Self {
        self.message(addr, NetworkMessage::GetBlocks(msg));
        self
    }

    fn get_headers(&mut self, addr: PeerId, msg: GetHeadersMessage) -> &mut Self {
        self.message(addr, NetworkMessage::GetHeaders(msg));
        self
    }

    fn headers(&mut self, addr: PeerId, headers: Vec<BlockHeader>) -> &mut Self {
        self.message(addr, NetworkMessage::Headers(headers));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::Txid;
    use quickcheck::quickcheck;

    fn inv_frames(outbox: &mut Outbox) -> Vec<usize> {
        let mut sizes = Vec::new();

        for io in outbox.by_ref() {
            if let Io::Write(
                _,
                RawNetworkMessage {
                    payload: NetworkMessage::Inv(batch),
                    ..
                },
            ) = io
            {
                sizes.push(batch.len());
            }
        }
        sizes
    }

    #[test]
    fn test_inv_batches_in_frames_of_251() {
        let mut outbox = Outbox::new(Network::Mainnet);
        let addr = ([10, 0, 0, 1], 8121).into();
        let inventories = vec![Inventory::Tx(Txid::all_zeros()); 502];

        Wire::<Event>::inv(&mut outbox, addr, inventories);

        assert_eq!(inv_frames(&mut outbox), vec![251, 251]);
    }

    quickcheck! {
        fn prop_inv_batch_sizes(count: usize) -> bool {
            let count = count % 2000;
            let mut outbox = Outbox::new(Network::Mainnet);
            let addr = ([10, 0, 0, 1], 8121).into();

            Wire::<Event>::inv(
                &mut outbox,
                addr,
                vec![Inventory::Tx(Txid::all_zeros()); count],
            );
            let frames = inv_frames(&mut outbox);

            frames.iter().sum::<usize>() == count
                && frames.iter().all(|n| *n <= MAX_INVENTORY_BATCH)
                && frames.len() == count.div_ceil(MAX_INVENTORY_BATCH)
        }
    }
}

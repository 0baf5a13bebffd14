//! Protocol state machine tests.
//!
//! The machine is driven directly: connections are announced, raw messages
//! are fed in, timers are fired, and the outbox is drained and inspected.
use std::borrow::Cow;
use std::net::SocketAddr;

use flume as chan;

use bitcoin::absolute::LockTime;
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::network::address::Address;
use bitcoin::network::constants::ServiceFlags;
use bitcoin::network::message_blockdata::{GetBlocksMessage, GetHeadersMessage};
use bitcoin::network::message_network::VersionMessage;
use bitcoin::hash_types::TxMerkleNode;
use bitcoin::{BlockHash, Transaction, Txid};

use gold_chain::{ChainStore, MemoryStore};
use gold_types::messages::p2p::{Inventory, NetworkMessage, RawNetworkMessage};
use gold_types::network::Network;
use gold_types::{BlockHeader, IngestMessage, NodeEvent};

use crate::client::peer::Cache;
use crate::common::time::{AdjustedTime, RefClock};
use crate::net::{Io, Link, LocalDuration, LocalTime, StateMachine as _};
use crate::notifier::Notifier;

use super::handler::{Config, DisconnectReason, StateMachine, Whitelist, PROTOCOL_VERSION};
use super::pingmgr;

type Machine = StateMachine<MemoryStore, Cache, RefClock<AdjustedTime<SocketAddr>>>;

/// Test harness around the state machine.
struct Node {
    machine: Machine,
    ingest: chan::Receiver<IngestMessage>,
    events: chan::Receiver<NodeEvent>,
    time: LocalTime,
    local_addr: SocketAddr,
}

impl Node {
    async fn new(config: Config, store: MemoryStore) -> Self {
        let (ingest_tx, ingest_rx) = chan::bounded(1024);
        let notifier = Notifier::new(ingest_tx);
        let events = notifier.subscribe();

        let time = LocalTime::from_secs(1_700_000_000);
        let clock = RefClock::from(AdjustedTime::new(time));
        let rng = fastrand::Rng::with_seed(812121);

        let mut machine = StateMachine::new(store, Cache::new(), clock, rng, config, notifier);
        machine.initialize(time).await;

        let mut node = Self {
            machine,
            ingest: ingest_rx,
            events,
            time,
            local_addr: ([192, 0, 2, 1], 8121).into(),
        };
        node.drain();
        node
    }

    /// Drain the outbox.
    fn drain(&mut self) -> Vec<super::output::Io> {
        self.machine.by_ref().collect()
    }

    /// Drain the outbox, keeping only written frames.
    fn frames(&mut self) -> Vec<(SocketAddr, NetworkMessage)> {
        self.drain()
            .into_iter()
            .filter_map(|io| match io {
                Io::Write(addr, msg) => Some((addr, msg.payload)),
                _ => None,
            })
            .collect()
    }

    /// Drain the outbox, keeping only disconnects.
    fn disconnects(&mut self) -> Vec<(SocketAddr, DisconnectReason)> {
        self.drain()
            .into_iter()
            .filter_map(|io| match io {
                Io::Disconnect(addr, reason) => Some((addr, reason)),
                _ => None,
            })
            .collect()
    }

    /// Advance the clock.
    fn elapse(&mut self, duration: LocalDuration) {
        self.time = self.time + duration;
        self.machine.tick(self.time);
    }

    /// Advance the clock and fire the timers.
    async fn wake(&mut self, duration: LocalDuration) {
        self.elapse(duration);
        self.machine.timer_expired().await;
    }

    /// Announce an inbound connection.
    fn accept(&mut self, addr: SocketAddr) -> bool {
        let local_addr = self.local_addr;
        self.machine.connected(addr, &local_addr, Link::Inbound)
    }

    /// Dial a peer and complete the TCP connection.
    fn dial(&mut self, addr: SocketAddr) {
        let local_addr = self.local_addr;

        self.machine.peermgr.connect(&addr);
        self.machine.attempted(&addr);
        self.machine.connected(addr, &local_addr, Link::Outbound);
    }

    /// Feed a message from the given peer into the machine.
    async fn receive(&mut self, addr: SocketAddr, payload: NetworkMessage) {
        self.machine
            .message_received(
                &addr,
                Cow::Owned(RawNetworkMessage {
                    magic: Network::Mainnet.magic(),
                    payload,
                }),
            )
            .await;
    }

    /// Drive a peer through the whole handshake.
    async fn negotiate(&mut self, addr: SocketAddr, link: Link, version: u32) {
        match link {
            Link::Inbound => {
                self.accept(addr);
            }
            Link::Outbound => self.dial(addr),
        }
        self.drain();
        self.receive(addr, NetworkMessage::Version(version_msg(addr, version, 0)))
            .await;
    }

    fn connected_events(&self) -> usize {
        self.events
            .try_iter()
            .filter(|e| matches!(e, NodeEvent::Connected { .. }))
            .count()
    }
}

fn version_msg(sender: SocketAddr, version: u32, start_height: i32) -> VersionMessage {
    VersionMessage {
        version,
        services: ServiceFlags::NETWORK,
        timestamp: 1_700_000_000,
        receiver: Address::new(&([203, 0, 113, 7], 8121).into(), ServiceFlags::NONE),
        sender: Address::new(&sender, ServiceFlags::NETWORK),
        nonce: 491_827_373,
        user_agent: "/gold-test:0.1.0/".to_owned(),
        start_height,
        relay: true,
    }
}

fn txid(n: u8) -> Txid {
    Txid::from_raw_hash(sha256d::Hash::hash(&[n]))
}

fn genesis_header() -> BlockHeader {
    BlockHeader {
        version: 1,
        prev_blockhash: BlockHash::all_zeros(),
        merkle_root: TxMerkleNode::all_zeros(),
        time: 1_368_576_000,
        bits: 0x1d00ffff,
        nonce: 0,
        aux_pow: None,
    }
}

/// An in-memory store holding a chain of `n` headers.
fn store_with(n: usize) -> (MemoryStore, Vec<BlockHeader>) {
    let store = MemoryStore::new();
    let mut headers = vec![genesis_header()];

    for i in 1..n {
        let prev = &headers[i - 1];
        headers.push(BlockHeader {
            version: 1,
            prev_blockhash: prev.block_hash(),
            merkle_root: TxMerkleNode::all_zeros(),
            time: prev.time + 120,
            bits: prev.bits,
            nonce: i as u32,
            aux_pow: None,
        });
    }
    for header in &headers {
        store.import_header(header.clone()).unwrap();
    }
    (store, headers)
}

fn dummy_tx() -> Transaction {
    Transaction {
        version: 2,
        lock_time: LockTime::ZERO,
        input: vec![],
        output: vec![],
    }
}

#[tokio::test]
async fn test_outbound_handshake_happy_path() {
    let (store, _) = store_with(4);
    let mut node = Node::new(Config::default(), store).await;
    let remote: SocketAddr = ([99, 0, 0, 1], 8333).into();

    node.dial(remote);

    let frames = node.frames();
    assert!(
        matches!(&frames[..], [(addr, NetworkMessage::Version(_))] if *addr == remote),
        "dialing sends our version first"
    );

    node.receive(
        remote,
        NetworkMessage::Version(version_msg(remote, 70002, 200_000)),
    )
    .await;

    // Receiving the peer's version acknowledges it and completes the
    // handshake without waiting for a verack.
    let frames = node.frames();
    assert!(matches!(frames[0], (_, NetworkMessage::Verack)));
    assert_eq!(node.machine.peermgr.negotiated(Link::Outbound).count(), 1);

    node.receive(remote, NetworkMessage::Verack).await;

    // Completing twice is a no-op.
    assert_eq!(node.machine.peermgr.negotiated(Link::Outbound).count(), 1);
    assert_eq!(node.connected_events(), 1);
}

#[tokio::test]
async fn test_inbound_peer_that_never_sends_verack() {
    let (store, _) = store_with(4);
    let timeout = LocalDuration::from_secs(30);
    let mut node = Node::new(Config::default(), store).await;
    let remote: SocketAddr = ([99, 0, 0, 2], 56789).into();

    assert!(node.accept(remote));

    // We introduce ourselves to inbound peers as well.
    let frames = node.frames();
    assert!(matches!(frames[0], (_, NetworkMessage::Version(_))));

    node.receive(
        remote,
        NetworkMessage::Version(version_msg(remote, 70001, 0)),
    )
    .await;
    assert_eq!(node.machine.peermgr.negotiated(Link::Inbound).count(), 1);
    node.drain();

    // No handshake timeout fires on the established session.
    node.wake(timeout + LocalDuration::from_secs(1)).await;
    assert!(node.disconnects().is_empty());
    assert_eq!(node.connected_events(), 1);
}

#[tokio::test]
async fn test_handshake_timeout_closes_connection() {
    let (store, _) = store_with(1);
    let mut node = Node::new(Config::default(), store).await;
    let remote: SocketAddr = ([99, 0, 0, 3], 8333).into();

    node.accept(remote);
    node.drain();

    node.wake(LocalDuration::from_secs(31)).await;

    let disconnects = node.disconnects();
    assert!(
        matches!(&disconnects[..], [(addr, DisconnectReason::PeerTimeout("handshake"))] if *addr == remote)
    );
}

#[tokio::test]
async fn test_inbound_rejected_when_not_accepting() {
    let (store, _) = store_with(1);
    let mut whitelist = Whitelist::default();
    whitelist.addr.insert([99, 0, 0, 5].into());

    let config = Config {
        accept_connections: false,
        whitelist,
        ..Config::default()
    };
    let mut node = Node::new(config, store).await;

    // Unknown peers are turned away quietly.
    assert!(!node.accept(([99, 0, 0, 4], 1234).into()));
    let disconnects = node.disconnects();
    assert!(matches!(
        &disconnects[..],
        [(_, DisconnectReason::ConnectionRejected)]
    ));

    // Whitelisted peers are let through.
    assert!(node.accept(([99, 0, 0, 5], 1234).into()));
}

#[tokio::test]
async fn test_self_connection_is_detected() {
    let (store, _) = store_with(1);
    let mut node = Node::new(Config::default(), store).await;
    let remote: SocketAddr = ([99, 0, 0, 6], 8333).into();

    node.dial(remote);

    let frames = node.frames();
    let our_nonce = match &frames[0] {
        (_, NetworkMessage::Version(version)) => version.nonce,
        other => panic!("expected a version frame, got {:?}", other.1.cmd()),
    };

    // A peer echoing our own nonce back is ourselves.
    let mut version = version_msg(remote, 70001, 0);
    version.nonce = our_nonce;
    node.receive(remote, NetworkMessage::Version(version)).await;

    let disconnects = node.disconnects();
    assert!(matches!(
        &disconnects[..],
        [(_, DisconnectReason::SelfConnection)]
    ));
}

#[tokio::test]
async fn test_getblocks_flood_is_suppressed() {
    let (store, headers) = store_with(600);
    let mut node = Node::new(Config::default(), store).await;
    let remote: SocketAddr = ([99, 0, 0, 7], 8333).into();

    node.negotiate(remote, Link::Inbound, 70001).await;
    node.drain();

    let request = NetworkMessage::GetBlocks(GetBlocksMessage {
        version: 70001,
        locator_hashes: vec![headers[99].block_hash()],
        stop_hash: BlockHash::all_zeros(),
    });

    // The first request is served: 500 hashes in batches of 251.
    node.receive(remote, request.clone()).await;
    let inv_sizes: Vec<usize> = node
        .frames()
        .into_iter()
        .filter_map(|(_, msg)| match msg {
            NetworkMessage::Inv(inv) => Some(inv.len()),
            _ => None,
        })
        .collect();
    assert_eq!(inv_sizes, vec![251, 249]);

    // Replays produce no outbound side effect.
    node.receive(remote, request.clone()).await;
    node.receive(remote, request).await;
    assert!(node.frames().is_empty());
}

#[tokio::test]
async fn test_getblocks_remembers_only_last_three() {
    let (store, headers) = store_with(16);
    let mut node = Node::new(Config::default(), store).await;
    let remote: SocketAddr = ([99, 0, 0, 8], 8333).into();

    node.negotiate(remote, Link::Inbound, 70001).await;
    node.drain();

    let request = |height: usize| {
        NetworkMessage::GetBlocks(GetBlocksMessage {
            version: 70001,
            locator_hashes: vec![headers[height].block_hash()],
            stop_hash: BlockHash::all_zeros(),
        })
    };

    // Four distinct requests overflow the replay memory.
    for height in 0..4 {
        node.receive(remote, request(height)).await;
    }
    node.drain();

    // The first tuple was evicted, so its replay is served again.
    node.receive(remote, request(0)).await;
    assert!(!node.frames().is_empty());

    // The last tuple is still remembered.
    node.receive(remote, request(3)).await;
    assert!(node.frames().is_empty());
}

#[tokio::test]
async fn test_getblocks_with_unknown_locator_yields_nothing() {
    let (store, _) = store_with(8);
    let mut node = Node::new(Config::default(), store).await;
    let remote: SocketAddr = ([99, 0, 0, 9], 8333).into();

    node.negotiate(remote, Link::Inbound, 70001).await;
    node.drain();

    node.receive(
        remote,
        NetworkMessage::GetBlocks(GetBlocksMessage {
            version: 70001,
            locator_hashes: vec![BlockHash::from_raw_hash(sha256d::Hash::hash(b"unknown"))],
            stop_hash: BlockHash::all_zeros(),
        }),
    )
    .await;

    assert!(node.frames().is_empty());
}

#[tokio::test]
async fn test_getheaders_serves_tip_header() {
    let (store, headers) = store_with(8);
    let mut node = Node::new(Config::default(), store).await;
    let remote: SocketAddr = ([99, 0, 0, 10], 8333).into();

    node.negotiate(remote, Link::Inbound, 70001).await;
    node.drain();

    // A locator at the block below our tip yields exactly the tip header.
    node.receive(
        remote,
        NetworkMessage::GetHeaders(GetHeadersMessage {
            version: 70001,
            locator_hashes: vec![headers[6].block_hash()],
            stop_hash: BlockHash::all_zeros(),
        }),
    )
    .await;

    let frames = node.frames();
    match &frames[..] {
        [(_, NetworkMessage::Headers(served))] => {
            assert_eq!(served.len(), 1);
            assert_eq!(served[0], headers[7]);
        }
        other => panic!("expected a single headers frame, got {} frames", other.len()),
    }
}

#[tokio::test]
async fn test_empty_chain_bootstraps_from_genesis() {
    let mut node = Node::new(Config::default(), MemoryStore::new()).await;
    let remote: SocketAddr = ([99, 0, 0, 11], 8333).into();
    let genesis = Network::Mainnet.genesis_hash();

    node.negotiate(remote, Link::Outbound, 70001).await;

    // With no chain to build a locator from, the genesis block is
    // requested by hash.
    let requested: Vec<_> = node
        .frames()
        .into_iter()
        .filter_map(|(_, msg)| match msg {
            NetworkMessage::GetData(inv) => Some(inv),
            _ => None,
        })
        .collect();
    assert_eq!(requested, vec![vec![Inventory::Block(genesis)]]);

    // The request is re-armed while the chain stays empty.
    node.wake(LocalDuration::from_secs(3)).await;
    let requested: Vec<_> = node
        .frames()
        .into_iter()
        .filter_map(|(_, msg)| match msg {
            NetworkMessage::GetData(inv) => Some(inv),
            _ => None,
        })
        .collect();
    assert_eq!(requested, vec![vec![Inventory::Block(genesis)]]);
}

#[tokio::test]
async fn test_sync_starts_with_getblocks_on_nonempty_chain() {
    let (store, _) = store_with(32);
    let locator = store.locator();
    let mut node = Node::new(Config::default(), store).await;
    let remote: SocketAddr = ([99, 0, 0, 12], 8333).into();

    node.negotiate(remote, Link::Outbound, 70001).await;

    let getblocks: Vec<_> = node
        .frames()
        .into_iter()
        .filter_map(|(_, msg)| match msg {
            NetworkMessage::GetBlocks(msg) => Some(msg),
            _ => None,
        })
        .collect();

    assert_eq!(getblocks.len(), 1);
    assert_eq!(getblocks[0].version, PROTOCOL_VERSION);
    assert_eq!(getblocks[0].locator_hashes, locator);
    assert_eq!(getblocks[0].stop_hash, BlockHash::all_zeros());
}

#[tokio::test]
async fn test_send_getheaders_uses_store_locator() {
    let (store, _) = store_with(16);
    let locator = store.locator();
    let mut node = Node::new(Config::default(), store).await;
    let remote: SocketAddr = ([99, 0, 0, 22], 8333).into();

    node.negotiate(remote, Link::Inbound, 70001).await;
    node.drain();

    node.machine.syncmgr.send_getheaders(remote, None);

    let frames = node.frames();
    match &frames[..] {
        [(_, NetworkMessage::GetHeaders(msg))] => {
            assert_eq!(msg.locator_hashes, locator);
            assert_eq!(msg.stop_hash, BlockHash::all_zeros());
        }
        other => panic!("expected a getheaders frame, got {} frames", other.len()),
    }
}

#[tokio::test]
async fn test_ping_liveness() {
    let (store, _) = store_with(4);
    let mut node = Node::new(Config::default(), store).await;
    let remote: SocketAddr = ([99, 0, 0, 13], 8333).into();

    node.negotiate(remote, Link::Inbound, 70002).await;
    node.drain();

    // After the ping interval, a nonce ping goes out.
    node.wake(pingmgr::PING_INTERVAL).await;
    let nonce = node
        .frames()
        .into_iter()
        .find_map(|(_, msg)| match msg {
            NetworkMessage::Ping(Some(nonce)) => Some(nonce),
            _ => None,
        })
        .expect("a ping was sent");

    // A matching pong 42ms later sets the latency.
    node.elapse(LocalDuration::from_millis(42));
    node.receive(remote, NetworkMessage::Pong(nonce ^ 1)).await; // unmatched: ignored
    node.receive(remote, NetworkMessage::Pong(nonce)).await;

    assert_eq!(
        node.machine.pingmgr.latency(&remote),
        Some(LocalDuration::from_millis(42))
    );

    // The next ping goes unanswered: the connection is closed after the
    // liveness timeout.
    node.wake(pingmgr::PING_INTERVAL).await;
    assert!(!node.frames().is_empty());

    node.wake(LocalDuration::from_secs(31)).await;
    let disconnects = node.disconnects();
    assert!(
        matches!(&disconnects[..], [(addr, DisconnectReason::PeerTimeout("ping"))] if *addr == remote)
    );
}

#[tokio::test]
async fn test_old_peers_get_nonceless_pings() {
    let (store, _) = store_with(4);
    let mut node = Node::new(Config::default(), store).await;
    let remote: SocketAddr = ([99, 0, 0, 14], 8333).into();

    node.negotiate(remote, Link::Inbound, pingmgr::BIP0031_VERSION)
        .await;
    node.drain();

    node.wake(pingmgr::PING_INTERVAL).await;
    let pings: Vec<_> = node
        .frames()
        .into_iter()
        .filter_map(|(_, msg)| match msg {
            NetworkMessage::Ping(nonce) => Some(nonce),
            _ => None,
        })
        .collect();

    assert_eq!(pings, vec![None]);
    // Latency pins to the timeout ceiling: no round-trip can be measured.
    assert_eq!(
        node.machine.pingmgr.latency(&remote),
        Some(LocalDuration::from_secs(30))
    );
}

#[tokio::test]
async fn test_ping_gets_pong_reply() {
    let (store, _) = store_with(4);
    let mut node = Node::new(Config::default(), store).await;
    let remote: SocketAddr = ([99, 0, 0, 15], 8333).into();

    node.negotiate(remote, Link::Inbound, 70001).await;
    node.drain();

    node.receive(remote, NetworkMessage::Ping(Some(42))).await;
    let frames = node.frames();
    assert!(matches!(&frames[..], [(_, NetworkMessage::Pong(42))]));

    // Nonce-less pings get no reply.
    node.receive(remote, NetworkMessage::Ping(None)).await;
    assert!(node.frames().is_empty());
}

#[tokio::test]
async fn test_inv_backpressure_drops_overflow() {
    let (store, _) = store_with(4);
    let config = Config {
        max_inv: 10,
        ..Config::default()
    };
    let mut node = Node::new(config, store).await;
    let remote: SocketAddr = ([99, 0, 0, 16], 8333).into();

    node.negotiate(remote, Link::Inbound, 70001).await;
    node.drain();

    let announcements: Vec<Inventory> = (0..15).map(|i| Inventory::Tx(txid(i))).collect();
    node.receive(remote, NetworkMessage::Inv(announcements)).await;

    // Exactly ten were queued; the overflow was dropped without error.
    assert_eq!(node.machine.invmgr.queued(), 10);

    // The queued announcements are requested from their origin, one
    // `getdata` each.
    node.wake(LocalDuration::from_secs(1)).await;
    let getdata_count = node
        .frames()
        .into_iter()
        .filter(|(_, msg)| matches!(msg, NetworkMessage::GetData(_)))
        .count();
    assert_eq!(getdata_count, 10);
    assert_eq!(node.machine.invmgr.queued(), 0);
}

#[tokio::test]
async fn test_getdata_served_from_relay_cache() {
    let (store, _) = store_with(4);
    let mut node = Node::new(Config::default(), store).await;
    let remote: SocketAddr = ([99, 0, 0, 17], 8333).into();

    node.negotiate(remote, Link::Inbound, 70001).await;
    node.drain();

    let tx = dummy_tx();
    let tx_id = tx.txid();

    node.machine
        .command(super::handler::Command::RelayTransaction(tx.clone()))
        .await;

    // The relayed transaction is announced to the peer..
    let frames = node.frames();
    assert!(frames
        .iter()
        .any(|(_, msg)| matches!(msg, NetworkMessage::Inv(inv) if inv == &vec![Inventory::Tx(tx_id)])));

    // ..and served from the relay cache, without store persistence.
    node.receive(remote, NetworkMessage::GetData(vec![Inventory::Tx(tx_id)]))
        .await;
    let frames = node.frames();
    assert!(matches!(&frames[..], [(_, NetworkMessage::Tx(served))] if *served == tx));

    // Unknown hashes are silently ignored.
    node.receive(remote, NetworkMessage::GetData(vec![Inventory::Tx(txid(99))]))
        .await;
    assert!(node.frames().is_empty());
}

#[tokio::test]
async fn test_inv_tracks_propagation_of_relayed_tx() {
    let (store, _) = store_with(4);
    let mut node = Node::new(Config::default(), store).await;
    let a: SocketAddr = ([99, 0, 0, 18], 8333).into();
    let b: SocketAddr = ([99, 0, 1, 18], 8333).into();

    node.negotiate(a, Link::Inbound, 70001).await;
    node.negotiate(b, Link::Inbound, 70001).await;
    node.drain();

    let tx = dummy_tx();
    let txid = tx.txid();

    node.machine
        .command(super::handler::Command::RelayTransaction(tx))
        .await;
    assert_eq!(node.machine.invmgr.propagation(&txid), Some(0));

    node.receive(a, NetworkMessage::Inv(vec![Inventory::Tx(txid)]))
        .await;
    node.receive(b, NetworkMessage::Inv(vec![Inventory::Tx(txid)]))
        .await;

    assert_eq!(node.machine.invmgr.propagation(&txid), Some(2));
}

#[tokio::test]
async fn test_payloads_are_queued_for_ingestion() {
    let (store, headers) = store_with(4);
    let mut node = Node::new(Config::default(), store).await;
    let remote: SocketAddr = ([99, 0, 0, 19], 8333).into();

    node.negotiate(remote, Link::Inbound, 70001).await;
    node.drain();

    node.receive(remote, NetworkMessage::Tx(dummy_tx())).await;
    node.receive(remote, NetworkMessage::Headers(vec![headers[1].clone()]))
        .await;

    let queued: Vec<_> = node.ingest.try_iter().collect();
    assert!(matches!(queued[0], IngestMessage::Tx(_, addr) if addr == remote));
    assert!(matches!(&queued[1], IngestMessage::Headers(h, _) if h.len() == 1));
}

#[tokio::test]
async fn test_getaddr_reply_is_recent_and_bounded() {
    let (store, _) = store_with(4);
    let mut node = Node::new(Config::default(), store).await;
    let remote: SocketAddr = ([99, 0, 0, 20], 8333).into();

    node.negotiate(remote, Link::Inbound, 70001).await;
    node.drain();

    let now = node.time.as_secs() as u32;
    let stale = now - 4 * 60 * 60;

    // 300 fresh addresses spread over distinct ranges, and 50 stale ones.
    let mut addresses = Vec::new();
    for i in 0..300u32 {
        let addr: SocketAddr = ([44, (i / 250) as u8 + 1, (i % 250) as u8, 1], 8121).into();
        addresses.push((now, Address::new(&addr, ServiceFlags::NETWORK)));
    }
    for i in 0..50u32 {
        let addr: SocketAddr = ([45, 1, i as u8, 1], 8121).into();
        addresses.push((stale, Address::new(&addr, ServiceFlags::NETWORK)));
    }
    node.receive(remote, NetworkMessage::Addr(addresses)).await;
    node.drain();

    node.receive(remote, NetworkMessage::GetAddr).await;

    let frames = node.frames();
    let reply = frames
        .iter()
        .find_map(|(_, msg)| match msg {
            NetworkMessage::Addr(addrs) => Some(addrs),
            _ => None,
        })
        .expect("a getaddr reply was sent");

    assert_eq!(reply.len(), 250);
    for (time, _) in reply {
        assert!(now - time <= 3 * 60 * 60);
    }
}

#[tokio::test]
async fn test_disconnect_notifies_subscribers_once() {
    let (store, _) = store_with(4);
    let mut node = Node::new(Config::default(), store).await;
    let remote: SocketAddr = ([99, 0, 0, 21], 8333).into();

    node.negotiate(remote, Link::Inbound, 70001).await;
    node.drain();
    assert_eq!(node.connected_events(), 1);

    node.machine
        .disconnected(
            &remote,
            crate::net::Disconnect::StateMachine(DisconnectReason::Command),
        )
        .await;
    assert!(node.machine.peermgr.is_disconnected(&remote));

    let disconnected = node
        .events
        .try_iter()
        .filter(|e| matches!(e, NodeEvent::Disconnected { .. }))
        .count();
    assert_eq!(disconnected, 1);
}

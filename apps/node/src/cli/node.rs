use std::time::Duration;

use flume as chan;
use tokio::select;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use gold_chain::{ChainStore, MemoryStore};
use gold_p2p::{
    client::{Handle, P2PClient},
    net::{ReactorTcp, Waker},
};
use gold_types::{IngestMessage, NodeEvent};

use crate::config::NodeConfig;

/// Size of the ingestion queue between the p2p layer and the chain worker.
const INGEST_QUEUE_SIZE: usize = 1000;
/// The limit of time to wait for the node to shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Node encapsulates the services making up a running node.
pub struct Node {
    config: NodeConfig,
    store: MemoryStore,

    cancellation: CancellationToken,
    pub(crate) task_tracker: TaskTracker,
}

impl Node {
    pub fn new(config: NodeConfig) -> eyre::Result<Self> {
        Ok(Self {
            config,
            store: MemoryStore::new(),
            cancellation: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        })
    }

    /// Wait for the signal from any node's service about the cancellation.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    pub async fn run(&self) -> eyre::Result<()> {
        let (ingest_tx, ingest_rx) = chan::bounded(INGEST_QUEUE_SIZE);

        let handle = self.spawn_p2p(ingest_tx)?;

        self.spawn_chain_worker(ingest_rx);
        self.spawn_event_logger(&handle);

        self.task_tracker.close();

        Ok(())
    }

    fn spawn_p2p(&self, ingest: chan::Sender<IngestMessage>) -> eyre::Result<Handle<Waker>> {
        let client = P2PClient::<MemoryStore, ReactorTcp>::new(
            self.config.p2p.to_client_config(self.config.network)?,
            self.store.clone(),
            ingest,
        )?;

        let handle = client.handle();

        self.task_tracker.spawn(client.run(self.cancellation.clone()));

        Ok(handle)
    }

    /// The chain worker drains the ingestion queue into the chain store.
    /// Validation failures only affect the offending payload.
    fn spawn_chain_worker(&self, ingest: chan::Receiver<IngestMessage>) {
        let store = self.store.clone();
        let cancellation = self.cancellation.clone();

        self.task_tracker.spawn(async move {
            loop {
                select! {
                    _ = cancellation.cancelled() => break,
                    msg = ingest.recv_async() => {
                        let Ok(msg) = msg else { break };

                        match msg {
                            IngestMessage::Tx(tx, from) => {
                                debug!(target: "chain", "Ingesting transaction {} from {}", tx.txid(), from);
                                store.import_tx(tx);
                            }
                            IngestMessage::Block(block, from) => {
                                if let Err(err) = store.import_block(block) {
                                    warn!(target: "chain", "Rejected block from {}: {}", from, err);
                                }
                            }
                            IngestMessage::Headers(headers, from) => {
                                for header in headers {
                                    if let Err(err) = store.import_header(header) {
                                        warn!(target: "chain", "Rejected header from {}: {}", from, err);
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        });
    }

    /// Surface node events in the logs.
    fn spawn_event_logger(&self, handle: &Handle<Waker>) {
        let events = handle.subscribe();
        let cancellation = self.cancellation.clone();

        self.task_tracker.spawn(async move {
            loop {
                select! {
                    _ = cancellation.cancelled() => break,
                    event = events.recv_async() => {
                        let Ok(event) = event else { break };

                        match event {
                            NodeEvent::Connected { addr, outbound, ref user_agent, version, height } => {
                                info!(
                                    target: "node",
                                    "Peer {} connected (outbound={}, agent={}, version={}, height={})",
                                    addr, outbound, user_agent, version, height
                                );
                            }
                            NodeEvent::Disconnected { addr, ref reason } => {
                                info!(target: "node", "Peer {} disconnected: {}", addr, reason);
                            }
                            NodeEvent::Addr { addr, services, .. } => {
                                debug!(target: "node", "Learned address {} ({})", addr, services);
                            }
                        }
                    }
                }
            }
        });
    }

    pub async fn shutdown(&self) {
        info!("Shutting down node, finishing received requests...");

        self.cancellation.cancel();

        let timeout = self
            .config
            .shutdown_timeout
            .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECS);

        select! {
            // Wait until all tasks are finished
            _ = self.task_tracker.wait() => {},
            // Or wait for and exit by timeout
            _ = sleep(Duration::from_secs(timeout)) => {
                info!("Shutdown timeout reached, exiting...");
            },
        }
    }
}

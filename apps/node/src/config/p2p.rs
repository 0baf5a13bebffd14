use std::net::{SocketAddr, ToSocketAddrs};

use eyre::{Context, OptionExt};
use serde::{Deserialize, Serialize};

use gold_p2p::client;
use gold_p2p::net::LocalDuration;
use gold_types::network::Network;

/// Default number of peers connected to this node.
pub const DEFAULT_MAX_INBOUND_CONNECTIONS: usize = 125;

/// Default number of peers this node is connected to.
pub const DEFAULT_MAX_OUTBOUND_CONNECTIONS: usize = 8;

/// Default handshake and ping liveness timeout, in seconds.
pub const DEFAULT_CONNECTION_TIMEOUT: u64 = 30;

/// Default bound on the inventory work queue.
pub const DEFAULT_MAX_INV: usize = 50_000;

#[derive(Serialize, Deserialize, Clone)]
pub struct P2pConfig {
    /// Address to listen on for incoming connections.
    pub address: String,
    /// Maximum amount of inbound connections.
    #[serde(default = "default_max_inbound_connections")]
    pub max_inbound_connections: usize,
    /// Maximum amount of outbound connections.
    #[serde(default = "default_max_outbound_connections")]
    pub max_outbound_connections: usize,
    /// Peers to maintain persistent connections with. Always accepted
    /// inbound.
    #[serde(default)]
    pub connect: Vec<String>,
    /// Handshake and ping liveness timeout, in seconds.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    /// Bound on the inventory work queue.
    #[serde(default = "default_max_inv")]
    pub max_inv: usize,
    /// Whether to announce our own address to peers.
    #[serde(default)]
    pub announce: bool,
    /// Whether to accept inbound connections from unknown peers.
    #[serde(default = "default_accept_connections")]
    pub accept_connections: bool,
}

fn default_max_inbound_connections() -> usize {
    DEFAULT_MAX_INBOUND_CONNECTIONS
}

fn default_max_outbound_connections() -> usize {
    DEFAULT_MAX_OUTBOUND_CONNECTIONS
}

fn default_connection_timeout() -> u64 {
    DEFAULT_CONNECTION_TIMEOUT
}

fn default_max_inv() -> usize {
    DEFAULT_MAX_INV
}

fn default_accept_connections() -> bool {
    true
}

impl P2pConfig {
    pub fn to_client_config(&self, network: Network) -> eyre::Result<client::P2PConfig> {
        let connect: Vec<SocketAddr> = self
            .connect
            .iter()
            .map(|x| {
                x.to_socket_addrs()
                    .wrap_err("Failed to resolve peer address")
            })
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .flatten()
            .collect();

        let address = self
            .address
            .to_socket_addrs()
            .wrap_err("Failed to resolve address")?
            .next()
            .ok_or_eyre("No address found in listen address")?;

        let mut config = client::P2PConfig::new(
            network,
            address,
            connect,
            self.max_inbound_connections,
            self.max_outbound_connections,
        );
        config.connection_timeout = LocalDuration::from_secs(self.connection_timeout);
        config.max_inv = self.max_inv;
        config.announce = self.announce;
        config.accept_connections = self.accept_connections;

        Ok(config)
    }
}

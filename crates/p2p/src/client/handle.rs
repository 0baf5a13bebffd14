//! Node handles are created from nodes by users of the library, to
//! communicate with the underlying protocol instance.
use std::net;
use std::net::SocketAddr;

use async_trait::async_trait;
use flume as chan;
use thiserror::Error;

use bitcoin::network::constants::ServiceFlags;
use bitcoin::Transaction;

use gold_types::messages::p2p::NetworkMessage;

use crate::fsm::handler::{Command, Peer, PeerId};

/// An error resulting from a handle method.
#[derive(Error, Debug)]
pub enum Error {
    /// The command channel disconnected.
    #[error("command channel disconnected")]
    Disconnected,
    /// The command returned an error.
    #[error("command failed")]
    Command,
    /// The operation timed out.
    #[error("the operation timed out")]
    Timeout,
    /// An I/O error occured.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<chan::RecvError> for Error {
    fn from(_: chan::RecvError) -> Self {
        Self::Disconnected
    }
}

impl<T> From<chan::SendError<T>> for Error {
    fn from(_: chan::SendError<T>) -> Self {
        Self::Disconnected
    }
}

/// A handle for communicating with a node process.
#[async_trait]
pub trait Handle: Sized + Send + Sync + Clone {
    /// Send a command to the client.
    async fn command(&self, cmd: Command) -> Result<(), Error>;

    /// Broadcast a message to peers matching the predicate.
    /// To only broadcast to outbound peers, use [`Peer::is_outbound`].
    async fn broadcast(
        &self,
        msg: NetworkMessage,
        predicate: fn(Peer) -> bool,
    ) -> Result<Vec<net::SocketAddr>, Error>;

    /// Send a message to a random *outbound* peer. Return the chosen
    /// peer or nothing if no peer was available.
    async fn query(&self, msg: NetworkMessage) -> Result<Option<net::SocketAddr>, Error>;

    /// List negotiated peers offering the given services.
    async fn get_peers(&self, services: ServiceFlags) -> Result<Vec<Peer>, Error>;

    /// Relay a transaction to our peers.
    async fn relay_transaction(&self, tx: Transaction) -> Result<(), Error>;

    /// Connect to the given peer.
    async fn connect_peer(&self, addr: PeerId) -> Result<(), Error>;

    /// Ban the given peer.
    async fn ban_peer(&self, addr: SocketAddr) -> Result<(), Error>;
}

#[cfg(any(test, feature = "mocks"))]
mockall::mock! {
    pub Handle {}

    impl Clone for Handle {
        fn clone(&self) -> Self;
    }

    #[async_trait]
    impl Handle for Handle {
        async fn command(&self, cmd: Command) -> Result<(), Error>;
        async fn broadcast(
            &self,
            msg: NetworkMessage,
            predicate: fn(Peer) -> bool,
        ) -> Result<Vec<net::SocketAddr>, Error>;
        async fn query(&self, msg: NetworkMessage) -> Result<Option<net::SocketAddr>, Error>;
        async fn get_peers(&self, services: ServiceFlags) -> Result<Vec<Peer>, Error>;
        async fn relay_transaction(&self, tx: Transaction) -> Result<(), Error>;
        async fn connect_peer(&self, addr: PeerId) -> Result<(), Error>;
        async fn ban_peer(&self, addr: SocketAddr) -> Result<(), Error>;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_mock() {
        let mut _mock = MockHandle::new();
    }
}

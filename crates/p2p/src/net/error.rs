//! Errors surfaced by the reactor.

use std::fmt::Debug;
use std::{io, net};

use thiserror::Error;

/// An error that takes the reactor down. Per-connection failures never
/// surface here; they only close the offending session.
#[derive(Error, Debug)]
pub enum Error {
    /// The listening socket could not be bound.
    #[error("could not listen for connections on {addr}: {err}")]
    Listen {
        /// The configured listen address.
        addr: net::SocketAddr,
        /// The underlying bind error.
        err: io::Error,
    },

    /// An I/O error on the poll loop itself.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

//! Client error module.
use std::io;

use flume as chan;
use thiserror::Error;

use crate::fsm::handler::Command;

/// A client error.
#[derive(Error, Debug)]
pub enum Error {
    /// An error occuring from a client handle.
    #[error(transparent)]
    Handle(#[from] crate::client::handle::Error),
    /// An error coming from the networking sub-system.
    #[error(transparent)]
    Net(#[from] crate::net::error::Error),
    /// An I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// A communication channel error.
    #[error("command channel disconnected")]
    Channel,
}

impl From<chan::SendError<Command>> for Error {
    fn from(_: chan::SendError<Command>) -> Self {
        Self::Channel
    }
}

impl From<chan::RecvError> for Error {
    fn from(_: chan::RecvError) -> Self {
        Self::Channel
    }
}

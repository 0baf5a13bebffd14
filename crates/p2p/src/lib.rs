//! Peer-to-peer layer of the Goldcoin node.
//!
//! The [`fsm`] module holds the protocol state machine: a deterministic core
//! that consumes network inputs and timer wakes, and emits I/O instructions
//! through an outbox. The [`net`] module is the scheduling substrate: a
//! single-threaded poll reactor that owns sockets and timers and drives the
//! state machine. The [`client`] module wires both together behind a handle
//! usable from other tasks.
#![allow(clippy::type_complexity)]

pub mod client;
pub mod common;
pub mod fsm;
pub mod net;

mod notifier;
pub use notifier::Notifier;

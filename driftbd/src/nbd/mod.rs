//! NBD serving layer.
//!
//! Wraps the `nbd` crate's wire types with the transmission engine that
//! drives a single connection against an [`IoHandler`], plus the
//! [`Listener`] abstraction the daemon accepts connections through.
//!
//! The engine is deliberately role-blind: serve, listen-for-migration,
//! and post-takeover serving all run the same loop, differing only in
//! whether entrust is honoured.

mod handler;
mod listener;
mod server;

pub use handler::{DeviceHandler, HandlerResult, IoHandler};
pub use listener::{Listener, StreamListener};
pub use server::{NbdServer, SessionEnd};

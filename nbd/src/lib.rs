//! Oldstyle NBD (Network Block Device) protocol implementation.
//!
//! This crate provides the wire codec and an async client for the
//! pre-negotiation NBD dialect used by driftbd: a fixed 152-byte hello,
//! 28-byte requests, 16-byte replies, and the ENTRUST handoff extension.
//!
//! Policy (retries, timeouts, bounds checks) lives with the callers;
//! this crate only frames bytes.

mod client;
mod protocol;

pub use client::{read_hello, NbdClient};
pub use protocol::*;

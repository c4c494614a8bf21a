//! The I/O handler behind every NBD connection.
//!
//! The trait keeps the wire engine ignorant of storage and lets tests
//! substitute fakes. `DeviceHandler` is the real one: it owns the write
//! gate that serializes mutations, feeds a migration relay when one is
//! attached, and refuses writes once authority has been handed off.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, MutexGuard};

use crate::device::Device;
use crate::error::StoreError;
use crate::mirror::MirrorRelay;

pub type HandlerResult<T> = std::result::Result<T, StoreError>;

/// Operations the transmission engine needs from storage.
#[async_trait]
pub trait IoHandler: Send + Sync {
    /// Read bytes from the device.
    async fn read(&self, offset: u64, length: usize) -> HandlerResult<Bytes>;

    /// Write bytes to the device. With `fua`, the touched range must be
    /// on stable storage before this returns.
    async fn write(&self, offset: u64, data: Bytes, fua: bool) -> HandlerResult<()>;

    /// Flush the whole device.
    async fn flush(&self) -> HandlerResult<()>;
}

/// Handler backed by the real device.
pub struct DeviceHandler {
    device: Arc<Device>,
    write_gate: Mutex<()>,
    relay: RwLock<Option<Arc<MirrorRelay>>>,
    closed: AtomicBool,
}

impl DeviceHandler {
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            write_gate: Mutex::new(()),
            relay: RwLock::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Start copying every write into `relay`.
    pub fn attach_relay(&self, relay: Arc<MirrorRelay>) {
        *self.relay.write().unwrap() = Some(relay);
    }

    /// Stop forwarding writes; the session is over.
    pub fn detach_relay(&self) {
        *self.relay.write().unwrap() = None;
    }

    /// Hold the write gate, keeping every writer out until the guard
    /// drops. The migration session takes this for the entrust window so
    /// "no writes pending" stays true while the handoff is offered.
    pub async fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_gate.lock().await
    }

    /// Permanently refuse new writes. Called once the destination holds
    /// authority; reads stay possible for connections that are mid-flight.
    pub fn close_writes(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn writes_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl IoHandler for DeviceHandler {
    async fn read(&self, offset: u64, length: usize) -> HandlerResult<Bytes> {
        self.device.read_at(offset, length)
    }

    async fn write(&self, offset: u64, data: Bytes, fua: bool) -> HandlerResult<()> {
        // Apply-then-enqueue happens under the gate so the relay queue
        // order is exactly the local apply order.
        let waiter = {
            let _gate = self.write_gate.lock().await;
            if self.closed.load(Ordering::Acquire) {
                return Err(StoreError::WritesClosed);
            }
            self.device.write_at(offset, &data)?;
            if fua {
                self.device.flush_range(offset, data.len() as u64)?;
            }
            let relay = self.relay.read().unwrap();
            relay.as_ref().and_then(|r| r.submit(offset, data.clone()))
        };

        // Awaiting outside the gate lets other writers proceed; a dropped
        // ack means the session fell back to a retry that will recopy
        // this range, so the local write alone is enough to reply on.
        if let Some(ack) = waiter {
            let _ = ack.await;
        }
        Ok(())
    }

    async fn flush(&self) -> HandlerResult<()> {
        self.device.flush_all()
    }
}

//! The ordered queue carrying live client writes to a migration session.
//!
//! Every client write that lands while a session is active is applied
//! locally and then pushed here, under the same write gate, so queue
//! order always equals local apply order. The session drains the queue
//! into the destination connection.
//!
//! The queue has two regimes. While the bulk copy (or a reconnect retry)
//! is running, submissions are fire-and-forget: the client is acked as
//! soon as the local write lands, and the queued copy is pushed out when
//! the session catches up. Once the session reports itself live, each
//! submission carries an ack slot and the client's reply is withheld
//! until the destination has confirmed that exact write. This is the
//! ordering barrier that makes the final images identical.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

/// One write travelling to the destination.
pub struct RelayedWrite {
    pub offset: u64,
    pub data: Bytes,
    /// Present in the live regime: resolved once the destination acked.
    /// Dropped (never resolved) if the session falls back to a retry;
    /// the submitter treats that as "no longer live" and carries on.
    pub ack: Option<oneshot::Sender<()>>,
}

/// Sender half handed to the write path.
pub struct MirrorRelay {
    tx: mpsc::UnboundedSender<RelayedWrite>,
    live: AtomicBool,
}

impl MirrorRelay {
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<RelayedWrite>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx,
                live: AtomicBool::new(false),
            }),
            rx,
        )
    }

    /// Queue a locally-applied write for forwarding.
    ///
    /// Returns an ack receiver when the session is live; the caller must
    /// await it before replying to its client. Returns `None` when the
    /// session is still catching up, or already gone.
    pub fn submit(&self, offset: u64, data: Bytes) -> Option<oneshot::Receiver<()>> {
        if self.live.load(Ordering::Acquire) {
            let (ack_tx, ack_rx) = oneshot::channel();
            match self.tx.send(RelayedWrite {
                offset,
                data,
                ack: Some(ack_tx),
            }) {
                Ok(()) => Some(ack_rx),
                Err(_) => None,
            }
        } else {
            let _ = self.tx.send(RelayedWrite {
                offset,
                data,
                ack: None,
            });
            None
        }
    }

    /// Enter or leave the synchronous regime.
    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::Release);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }
}

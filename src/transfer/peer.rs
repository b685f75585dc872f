//! Peer link seam and the receive-path inbox.
//!
//! Outbound frames go through a caller-supplied [`PeerLink`]. Inbound peer
//! Info messages are validated on the transport thread by a [`PeerInbox`]
//! and handed to the waiting coordinator over a channel, so a blocked
//! handshake or checkpoint wait consumes already-validated messages
//! instead of racing the receive path over shared state.

use crate::transfer::protocol::{decode_frame, Frame, SyncInfo};
use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Outbound half of the peer transport. Implementations are expected to
/// be cheap and non-blocking-ish; the coordinator retries a bounded number
/// of times on failure.
pub trait PeerLink: Send {
    /// Ship one encoded frame to the peer device. `false` = not sent.
    fn send(&mut self, frame: &[u8]) -> bool;
}

/// Flags shared between the coordinator, the peer receive path and the
/// backend adapter.
#[derive(Debug)]
pub struct SessionShared {
    /// Sticky desynchronization flag: once set, every further inbound
    /// frame is dropped until the session is torn down.
    pub role_exit: AtomicBool,
    /// Cleared at teardown; unblocks pollers within one interval. Held as
    /// its own `Arc` so the backend adapter can poll it without depending
    /// on this module.
    pub alive: Arc<AtomicBool>,
}

impl Default for SessionShared {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionShared {
    pub fn new() -> Self {
        Self {
            role_exit: AtomicBool::new(false),
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn role_exit(&self) -> bool {
        self.role_exit.load(Ordering::Acquire)
    }

    pub fn set_role_exit(&self) {
        self.role_exit.store(true, Ordering::Release);
    }

    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

/// Validating entry point for frames arriving over the peer link while
/// the coordinator may be blocked waiting. Cloneable; lives on the
/// transport thread.
#[derive(Clone)]
pub struct PeerInbox {
    tx: Sender<SyncInfo>,
    shared: Arc<SessionShared>,
    max_payload: usize,
}

impl PeerInbox {
    pub(crate) fn from_parts(
        tx: Sender<SyncInfo>,
        shared: Arc<SessionShared>,
        max_payload: usize,
    ) -> Self {
        Self {
            tx,
            shared,
            max_payload,
        }
    }

    /// Validate one raw peer frame and forward its Info payload to the
    /// coordinator. Any validation failure is sticky: the session is
    /// considered desynchronized and all further frames are dropped.
    ///
    /// Returns `true` when the frame was accepted.
    pub fn deliver(&self, raw: &[u8]) -> bool {
        if self.shared.role_exit() {
            return false;
        }

        match decode_frame(raw, self.max_payload) {
            Ok(Frame::Info(info)) => {
                tracing::debug!(status = ?info.status, pn = info.pn, "peer info");
                let _ = self.tx.send(info);
                true
            }
            Ok(Frame::Data { frame_number, .. }) => {
                // the waiting side never receives mirrored data; a Data
                // frame here means the peers disagree about their roles
                tracing::error!(frame_number, "unexpected data frame on peer inbox");
                self.shared.set_role_exit();
                false
            }
            Err(err) => {
                tracing::error!("peer frame rejected: {err}");
                self.shared.set_role_exit();
                false
            }
        }
    }
}

//! Backend transport adapter.
//!
//! Thin shim binding the streaming buffer to the external transport's
//! connect/disconnect/read/write primitives, presented to the middleware
//! as a uniform open/close/read/write/ioctl surface. Also keeps the
//! image-valid-report bookkeeping used once at the very end of a transfer,
//! so the validity decision is driven by the side that actually applies
//! the image.

use crate::buffer::StreamBuffer;
use crate::error::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Control operations on a backend, replacing the raw ioctl integers of
/// older firmware stacks with a typed surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendCtl {
    /// Transport reports the link came up.
    Connect,
    /// Transport reports the link went down.
    Disconnect,
    /// The peer asked us to report image validity when the transfer ends.
    RequestValidReport,
    /// The image-applying side reports whether the received image is valid.
    ValidReport(bool),
}

/// Uniform surface the middleware drives a transport through.
pub trait Backend: Send {
    fn open(&mut self, capacity: usize) -> Result<()>;
    fn close(&mut self);
    /// Blocking read of exactly `buf.len()` bytes; returns 0 when the
    /// session is torn down or the link is lost with nothing buffered.
    fn read(&mut self, buf: &mut [u8]) -> usize;
    /// Non-blocking write; `false` means the buffer is full and the
    /// transport must retry.
    fn write(&mut self, data: &[u8]) -> bool;
    fn ioctl(&mut self, ctl: BackendCtl);
}

/// Backend bound to the in-memory streaming buffer.
pub struct StreamBackend {
    buffer: Arc<StreamBuffer>,
    alive: Arc<AtomicBool>,
    poll_interval: Duration,
    valid_report_requested: bool,
    valid_report: Option<bool>,
}

impl StreamBackend {
    pub fn new(buffer: Arc<StreamBuffer>, alive: Arc<AtomicBool>, poll_interval: Duration) -> Self {
        Self {
            buffer,
            alive,
            poll_interval,
            valid_report_requested: false,
            valid_report: None,
        }
    }

    pub fn valid_report_requested(&self) -> bool {
        self.valid_report_requested
    }

    pub fn valid_report(&self) -> Option<bool> {
        self.valid_report
    }

    pub fn buffer(&self) -> &Arc<StreamBuffer> {
        &self.buffer
    }
}

impl Backend for StreamBackend {
    fn open(&mut self, capacity: usize) -> Result<()> {
        self.valid_report_requested = false;
        self.valid_report = None;
        self.buffer.open(capacity)
    }

    fn close(&mut self) {
        self.buffer.close();
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        loop {
            if !self.alive.load(Ordering::Acquire) {
                return 0;
            }

            let n = self.buffer.read(buf);
            if n > 0 {
                return n;
            }

            // a dead link with nothing buffered will never produce data
            if !self.buffer.is_connected() && self.buffer.buffered() == 0 {
                tracing::debug!("backend read aborted: link down, buffer drained");
                return 0;
            }

            std::thread::sleep(self.poll_interval);
        }
    }

    fn write(&mut self, data: &[u8]) -> bool {
        self.buffer.write(data)
    }

    fn ioctl(&mut self, ctl: BackendCtl) {
        match ctl {
            BackendCtl::Connect => self.buffer.connect(),
            BackendCtl::Disconnect => self.buffer.disconnect(),
            BackendCtl::RequestValidReport => self.valid_report_requested = true,
            BackendCtl::ValidReport(ok) => {
                tracing::info!(valid = ok, "image valid report received");
                self.valid_report = Some(ok);
            }
        }
    }
}

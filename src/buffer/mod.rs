//! Streaming ring buffer between frame reception and the flash-write
//! consumer.
//!
//! Single writer (the transport-facing coordinator thread), single reader
//! (the flash pipeline). Writes that would overflow are rejected outright —
//! that rejection is the only backpressure signal toward the transport.
//! Reads never return partial data and never block unbounded: a reader
//! waits one bounded slice for the writer's signal, and a disconnect wakes
//! it immediately.
//!
//! For resumed transfers the coordinator injects a synthetic image prefix
//! ahead of the real payload and arms a one-shot skip so bytes a previous
//! attempt already flashed are discarded instead of served twice.

use crate::error::{OtaError, Result};
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Link state changes, delivered to the coordinator's control loop instead
/// of being invoked from transport-thread context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Disconnected,
}

struct Ring {
    buf: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
    used: usize,
    /// Leading bytes that belong to an injected synthetic prefix. Served
    /// before the skip is applied.
    virtual_remaining: usize,
    /// Real-payload bytes to discard once the prefix has been drained.
    skip_remaining: usize,
}

impl Ring {
    fn new(capacity: usize) -> Result<Self> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(capacity)
            .map_err(|_| OtaError::NoMemory("stream buffer"))?;
        buf.resize(capacity, 0);
        Ok(Self {
            buf,
            read_pos: 0,
            write_pos: 0,
            used: 0,
            virtual_remaining: 0,
            skip_remaining: 0,
        })
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn push(&mut self, data: &[u8]) {
        let cap = self.capacity();
        let first = (cap - self.write_pos).min(data.len());
        self.buf[self.write_pos..self.write_pos + first].copy_from_slice(&data[..first]);
        if first < data.len() {
            self.buf[..data.len() - first].copy_from_slice(&data[first..]);
        }
        self.write_pos = (self.write_pos + data.len()) % cap;
        self.used += data.len();
    }

    fn pop(&mut self, out: &mut [u8]) {
        let cap = self.capacity();
        let out_len = out.len();
        let first = (cap - self.read_pos).min(out_len);
        out[..first].copy_from_slice(&self.buf[self.read_pos..self.read_pos + first]);
        if first < out_len {
            out[first..].copy_from_slice(&self.buf[..out_len - first]);
        }
        self.read_pos = (self.read_pos + out_len) % cap;
        self.used -= out_len;
    }

    fn drop_front(&mut self, n: usize) {
        self.read_pos = (self.read_pos + n) % self.capacity();
        self.used -= n;
    }

    /// Discard buffered real-payload bytes covered by the armed skip.
    fn apply_skip(&mut self) {
        if self.virtual_remaining == 0 && self.skip_remaining > 0 && self.used > 0 {
            let n = self.skip_remaining.min(self.used);
            self.drop_front(n);
            self.skip_remaining -= n;
        }
    }

    /// Bytes a reader may take right now. Capped to the prefix while one is
    /// being drained so skipped payload is never served early.
    fn readable(&self) -> usize {
        if self.virtual_remaining > 0 {
            self.used.min(self.virtual_remaining)
        } else if self.skip_remaining > 0 {
            0
        } else {
            self.used
        }
    }
}

pub struct StreamBuffer {
    inner: Mutex<Option<Ring>>,
    readable: Condvar,
    connected: AtomicBool,
    read_wait: Duration,
    event_tx: Sender<LinkEvent>,
    event_rx: Receiver<LinkEvent>,
}

impl StreamBuffer {
    pub fn new(read_wait: Duration) -> Self {
        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        Self {
            inner: Mutex::new(None),
            readable: Condvar::new(),
            connected: AtomicBool::new(false),
            read_wait,
            event_tx,
            event_rx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Ring>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate the backing storage. Idempotent per session: reopening an
    /// open buffer resets it.
    pub fn open(&self, capacity: usize) -> Result<()> {
        if capacity == 0 {
            return Err(OtaError::InvalidParam("buffer capacity"));
        }
        let mut inner = self.lock();
        *inner = Some(Ring::new(capacity)?);
        Ok(())
    }

    /// Release the backing storage and wake any blocked reader. Safe to
    /// call on a never-opened buffer.
    pub fn close(&self) {
        let mut inner = self.lock();
        *inner = None;
        drop(inner);
        self.readable.notify_all();
    }

    /// Copy `data` in. Rejected (state unchanged) when the buffer is not
    /// open or the bytes do not fit — the caller must retry later.
    pub fn write(&self, data: &[u8]) -> bool {
        if data.is_empty() {
            return true;
        }
        let mut inner = self.lock();
        let Some(ring) = inner.as_mut() else {
            return false;
        };
        if ring.used + data.len() > ring.capacity() {
            return false;
        }
        ring.push(data);
        drop(inner);
        self.readable.notify_one();
        true
    }

    /// Inject the synthetic resume prefix. Only valid while the buffer is
    /// empty; the prefix bytes are served to the reader before the armed
    /// skip is applied to real payload.
    pub fn inject_prefix(&self, data: &[u8]) -> bool {
        let mut inner = self.lock();
        let Some(ring) = inner.as_mut() else {
            return false;
        };
        if ring.used != 0 || data.len() > ring.capacity() {
            return false;
        }
        ring.push(data);
        ring.virtual_remaining = data.len();
        drop(inner);
        self.readable.notify_one();
        true
    }

    /// Arm a one-shot discard of the next `n` real-payload bytes. Used when
    /// the downstream consumer already holds bytes a previous attempt
    /// flashed.
    pub fn set_skip(&self, n: usize) {
        let mut inner = self.lock();
        if let Some(ring) = inner.as_mut() {
            ring.skip_remaining = n;
        }
    }

    /// Read exactly `out.len()` bytes, or nothing.
    ///
    /// Waits at most one bounded slice for data when empty. Returns 0 when
    /// the wait expires, when fewer bytes than requested are buffered, or
    /// when the buffer is closed — the polling consumer decides whether to
    /// come back.
    pub fn read(&self, out: &mut [u8]) -> usize {
        if out.is_empty() {
            return 0;
        }
        let mut inner = self.lock();

        let mut must_wait = false;
        if let Some(ring) = inner.as_mut() {
            ring.apply_skip();
            must_wait = ring.readable() == 0;
        }
        if must_wait {
            let (guard, _timeout) = self
                .readable
                .wait_timeout(inner, self.read_wait)
                .unwrap_or_else(|e| e.into_inner());
            inner = guard;
        }

        let Some(ring) = inner.as_mut() else {
            return 0;
        };
        ring.apply_skip();

        let avail = ring.readable();
        if avail < out.len() {
            return 0;
        }

        ring.pop(out);
        if ring.virtual_remaining > 0 {
            ring.virtual_remaining -= out.len();
        }
        out.len()
    }

    /// Bytes currently readable without waiting.
    pub fn buffered(&self) -> usize {
        let mut inner = self.lock();
        match inner.as_mut() {
            Some(ring) => {
                ring.apply_skip();
                ring.readable()
            }
            None => 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.lock().as_ref().map_or(0, Ring::capacity)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Transport connect notification.
    pub fn connect(&self) {
        self.connected.store(true, Ordering::Release);
        let _ = self.event_tx.send(LinkEvent::Connected);
    }

    /// Transport disconnect notification. Also releases a reader currently
    /// blocked waiting for data, so the consumer never stalls past a lost
    /// connection.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        let _ = self.event_tx.send(LinkEvent::Disconnected);
        self.readable.notify_all();
    }

    /// Receiver for link state changes; the coordinator's control loop
    /// drains this instead of being called back from the transport thread.
    pub fn events(&self) -> Receiver<LinkEvent> {
        self.event_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    fn buffer(capacity: usize) -> StreamBuffer {
        let buf = StreamBuffer::new(Duration::from_millis(20));
        buf.open(capacity).unwrap();
        buf
    }

    #[test]
    fn test_write_then_read() {
        let buf = buffer(16);
        assert!(buf.write(b"hello"));
        let mut out = [0u8; 5];
        assert_eq!(buf.read(&mut out), 5);
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn test_over_capacity_write_rejected_unchanged() {
        let buf = buffer(8);
        assert!(buf.write(b"abcd"));
        assert!(!buf.write(b"efghi"));
        assert_eq!(buf.buffered(), 4);
        let mut out = [0u8; 4];
        assert_eq!(buf.read(&mut out), 4);
        assert_eq!(&out, b"abcd");
    }

    #[test]
    fn test_wraparound() {
        let buf = buffer(8);
        assert!(buf.write(b"abcdef"));
        let mut out = [0u8; 4];
        assert_eq!(buf.read(&mut out), 4);
        // write wraps past the end of the backing storage
        assert!(buf.write(b"ghijk"));
        let mut out = [0u8; 7];
        assert_eq!(buf.read(&mut out), 7);
        assert_eq!(&out, b"efghijk");
    }

    #[test]
    fn test_no_partial_read() {
        let buf = buffer(16);
        assert!(buf.write(b"abc"));
        let mut out = [0u8; 8];
        assert_eq!(buf.read(&mut out), 0);
        assert_eq!(buf.buffered(), 3);
    }

    #[test]
    fn test_empty_read_waits_bounded() {
        let buf = buffer(16);
        let mut out = [0u8; 1];
        let start = Instant::now();
        assert_eq!(buf.read(&mut out), 0);
        assert!(start.elapsed() >= Duration::from_millis(15));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_writer_releases_blocked_reader() {
        let buf = Arc::new(StreamBuffer::new(Duration::from_secs(2)));
        buf.open(16).unwrap();

        let reader = {
            let buf = Arc::clone(&buf);
            std::thread::spawn(move || {
                let mut out = [0u8; 3];
                let n = buf.read(&mut out);
                (n, out)
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(buf.write(b"xyz"));

        let (n, out) = reader.join().unwrap();
        assert_eq!(n, 3);
        assert_eq!(&out, b"xyz");
    }

    #[test]
    fn test_disconnect_wakes_reader() {
        let buf = Arc::new(StreamBuffer::new(Duration::from_secs(10)));
        buf.open(16).unwrap();
        buf.connect();

        let reader = {
            let buf = Arc::clone(&buf);
            std::thread::spawn(move || {
                let mut out = [0u8; 1];
                buf.read(&mut out)
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        buf.disconnect();
        assert_eq!(reader.join().unwrap(), 0);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_link_events_delivered_in_order() {
        let buf = buffer(16);
        let events = buf.events();
        buf.connect();
        buf.disconnect();
        assert_eq!(events.try_recv().unwrap(), LinkEvent::Connected);
        assert_eq!(events.try_recv().unwrap(), LinkEvent::Disconnected);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_prefix_served_before_skip() {
        let buf = buffer(64);
        assert!(buf.inject_prefix(b"HDR"));
        buf.set_skip(4);
        // real payload resumes mid-stream; first 4 bytes were already flashed
        assert!(buf.write(b"0123456789"));

        let mut hdr = [0u8; 3];
        assert_eq!(buf.read(&mut hdr), 3);
        assert_eq!(&hdr, b"HDR");

        let mut payload = [0u8; 6];
        assert_eq!(buf.read(&mut payload), 6);
        assert_eq!(&payload, b"456789");
    }

    #[test]
    fn test_prefix_rejected_when_not_empty() {
        let buf = buffer(16);
        assert!(buf.write(b"x"));
        assert!(!buf.inject_prefix(b"HDR"));
    }

    #[test]
    fn test_close_is_safe_without_data() {
        let buf = StreamBuffer::new(Duration::from_millis(10));
        buf.close();
        buf.close();
        assert_eq!(buf.capacity(), 0);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Total bytes read equals total bytes accepted by writes,
            /// for arbitrary chunkings respecting capacity.
            #[test]
            fn conserves_bytes(chunks in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 1..48), 1..24
            )) {
                let buf = StreamBuffer::new(Duration::from_millis(1));
                buf.open(64).unwrap();

                let mut written: Vec<u8> = Vec::new();
                let mut read_back: Vec<u8> = Vec::new();
                for chunk in &chunks {
                    if buf.write(chunk) {
                        written.extend_from_slice(chunk);
                    } else {
                        // full: drain before retrying
                        let n = buf.buffered();
                        let mut out = vec![0u8; n];
                        prop_assert_eq!(buf.read(&mut out), n);
                        read_back.extend_from_slice(&out);
                        if buf.write(chunk) {
                            written.extend_from_slice(chunk);
                        }
                    }
                }
                let n = buf.buffered();
                let mut out = vec![0u8; n];
                if n > 0 {
                    prop_assert_eq!(buf.read(&mut out), n);
                    read_back.extend_from_slice(&out);
                }
                prop_assert_eq!(read_back, written);
            }
        }
    }
}

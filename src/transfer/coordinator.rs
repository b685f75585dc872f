//! Transfer/sync coordinator.
//!
//! Owns the session state machine and guarantees that a Primary and
//! Secondary device apply byte-identical firmware streams, or both abort.
//! The Primary drives the handshake and checkpoint cadence; the Secondary
//! mirrors it. A Standalone session runs the same data path without any
//! peer traffic.
//!
//! Lifecycle: [`Session::init`] → register [`Session::inbox`] with the
//! peer transport → [`Session::handshake`] → [`Session::start`] →
//! [`Session::process_frame`] per received message → [`Session::check`]
//! once the image is complete → [`Session::deinit`].

use crate::breakpoint::{resume_offset, BpState, Breakpoint, BreakpointInit, BreakpointStore};
use crate::buffer::StreamBuffer;
use crate::config::OtaConfig;
use crate::error::{OtaError, Result};
use crate::image::{DirEntry, FwHead, ImageDirectory};
use crate::transfer::peer::{PeerInbox, PeerLink, SessionShared};
use crate::transfer::protocol::{
    decode_frame, encode_data, encode_info, Frame, Status, SyncInfo, ROLE_BIT,
};
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Device role within a paired transfer, fixed at session start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Standalone,
    Primary,
    Secondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    HandshakeSent,
    Active,
    Checkpoint,
    FirmwareCheck,
    Done,
    Aborted,
    Halted,
}

/// Parameters the surrounding application resolves before starting a
/// session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Declared image size. Bit 31 set means this init was triggered by a
    /// peer's Ready and the local device takes the Secondary role.
    pub fw_size: u32,
    pub fw_ver: u32,
    /// Opaque transfer identifier; a matching id on the next attempt is
    /// what allows a resume.
    pub unique_id: u32,
    /// Whether a peer device participates in this transfer.
    pub paired: bool,
    /// Secondary only: the breakpoint checksum the Primary declared in
    /// its Ready.
    pub peer_bk_checksum: Option<u32>,
    /// Whether the caller wants a resume offset computed.
    pub resume: bool,
}

/// Result of breakpoint validation during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeDecision {
    /// Start from byte 0.
    Fresh,
    /// Resume the stream at this global byte offset.
    Resume { offset: u32 },
}

/// Outcome of feeding one raw frame to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Data frame validated and handed to the flash pipeline.
    Accepted { len: usize },
    /// The streaming buffer had no room; the same frame must be retried.
    BufferFull,
    /// Peer status message processed.
    PeerStatus(Status),
    /// The peer ordered the transfer to stop; tear the session down.
    PeerHalted,
    /// The peer finished its image and ran its check; run ours.
    PeerFirmwareCheck,
    /// All declared bytes arrived; run the firmware check.
    Complete,
    /// Frame dropped: the session is desynchronized (sticky) or draining.
    Rejected,
}

/// Progress callback payload, emitted once per accepted data frame.
#[derive(Debug, Clone, Copy)]
pub struct ProgressReport {
    pub arrived: u32,
    pub total: u32,
    /// Clamped to 99 until the firmware check passes.
    pub percent: u8,
}

type ProgressObserver = Box<dyn FnMut(ProgressReport) + Send>;

pub struct Session {
    config: OtaConfig,
    role: Role,
    state: SessionState,
    unique_id: u32,
    resume_requested: bool,
    /// Local progress; mirrored to the peer in every Info frame.
    local: SyncInfo,
    /// Last validated progress the peer declared.
    peer: Option<SyncInfo>,
    /// Payload bytes accepted from the transport stream.
    arrived: u32,
    /// High-water mark of bytes the flash pipeline holds (resume point
    /// included); never regresses during overlap replay.
    flashed: u32,
    /// Global offset the breakpoint said the previous attempt reached.
    resume_at: u32,
    breakpoint: Breakpoint,
    resumed_record: bool,
    store: BreakpointStore,
    directory: Option<ImageDirectory>,
    buffer: Arc<StreamBuffer>,
    link: Option<Box<dyn PeerLink>>,
    shared: Arc<SessionShared>,
    peer_tx: Sender<SyncInfo>,
    peer_rx: Receiver<SyncInfo>,
    discard: bool,
    fw_checked: bool,
    progress: Option<ProgressObserver>,
}

impl Session {
    /// Create a session: validate the topology, load and gate the
    /// persisted breakpoint, allocate the streaming buffer. No peer
    /// traffic happens yet — register the [`PeerInbox`] with the
    /// transport first, then call [`Session::handshake`].
    pub fn init(
        session: SessionConfig,
        config: OtaConfig,
        mut store: BreakpointStore,
        directory: Option<ImageDirectory>,
        buffer: Arc<StreamBuffer>,
        link: Option<Box<dyn PeerLink>>,
    ) -> Result<Self> {
        config.validate()?;

        let fw_size = session.fw_size & !ROLE_BIT;
        if fw_size == 0 {
            return Err(OtaError::InvalidParam("fw_size"));
        }

        let role = if !session.paired {
            Role::Standalone
        } else if session.fw_size & ROLE_BIT != 0 {
            Role::Secondary
        } else {
            Role::Primary
        };
        if role != Role::Standalone && link.is_none() {
            return Err(OtaError::Device("paired session without a peer link".into()));
        }

        let (breakpoint, bp_init) = store.init(session.unique_id)?;
        let (resumed_record, bk_checksum) = match bp_init {
            BreakpointInit::Resume { checksum } => (true, checksum),
            BreakpointInit::StartFresh => (false, 0),
        };

        buffer.open(config.buffer_capacity)?;

        let shared = Arc::new(SessionShared::new());
        let (peer_tx, peer_rx) = crossbeam_channel::unbounded();

        let local = SyncInfo {
            fw_size,
            fw_ver: session.fw_ver,
            cur_fn: 0,
            bk_checksum,
            unique_id: session.unique_id,
            pn: 0,
            status: Status::Ready,
        };

        tracing::info!(
            role = ?role,
            fw_size,
            unique_id = session.unique_id,
            resumed_record,
            "session created"
        );

        Ok(Self {
            config,
            role,
            state: SessionState::Idle,
            unique_id: session.unique_id,
            resume_requested: session.resume,
            local,
            peer: session.peer_bk_checksum.map(|bk_checksum| SyncInfo {
                fw_size,
                fw_ver: session.fw_ver,
                cur_fn: 0,
                bk_checksum,
                unique_id: session.unique_id,
                pn: 0,
                status: Status::Ready,
            }),
            arrived: 0,
            flashed: 0,
            resume_at: 0,
            breakpoint,
            resumed_record,
            store,
            directory,
            buffer,
            link,
            shared,
            peer_tx,
            peer_rx,
            discard: false,
            fw_checked: false,
            progress: None,
        })
    }

    /// Receive-path handle for peer Info frames; register it with the
    /// transport glue before calling [`Session::handshake`].
    pub fn inbox(&self) -> PeerInbox {
        PeerInbox::from_parts(
            self.peer_tx.clone(),
            Arc::clone(&self.shared),
            self.config.max_payload,
        )
    }

    /// Alive flag for wiring up a backend adapter; cleared at teardown.
    pub fn alive_flag(&self) -> Arc<std::sync::atomic::AtomicBool> {
        Arc::clone(&self.shared.alive)
    }

    pub fn shared(&self) -> Arc<SessionShared> {
        Arc::clone(&self.shared)
    }

    pub fn set_progress_observer(&mut self, observer: ProgressObserver) {
        self.progress = Some(observer);
    }

    /// Install the authoritative image directory once the upgrade engine
    /// has parsed the stream head (fresh transfers learn it in-band).
    pub fn set_directory(&mut self, directory: ImageDirectory) {
        self.directory = Some(directory);
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn arrived(&self) -> u32 {
        self.arrived
    }

    pub fn frame_number(&self) -> u32 {
        self.local.cur_fn
    }

    pub fn breakpoint(&self) -> &Breakpoint {
        &self.breakpoint
    }

    /// Exchange Ready messages with the peer and decide whether the
    /// persisted breakpoint may steer a resume.
    ///
    /// A Primary blocks (bounded) for the peer's Ready reply; a Secondary
    /// already holds the Primary's Ready (it triggered this session) and
    /// proceeds immediately. Breakpoints are only honored when both
    /// devices declare the same breakpoint checksum.
    pub fn handshake(&mut self) -> Result<ResumeDecision> {
        if self.state != SessionState::Idle {
            return Err(OtaError::InvalidParam("handshake after session start"));
        }

        let mut sync_err = false;
        if self.role != Role::Standalone {
            self.local.status = Status::Ready;
            self.state = SessionState::HandshakeSent;

            self.drain_peer();
            self.send_info(self.local.pn)?;

            if self.role == Role::Primary {
                let info = self
                    .peer_rx
                    .recv_timeout(self.config.handshake_timeout())
                    .map_err(|_| {
                        self.state = SessionState::Aborted;
                        OtaError::PeerTimeout {
                            waiting_for: "handshake",
                        }
                    })?;
                let matched = info.status == Status::Ready && info.pn == self.local.pn;
                self.peer = Some(info);
                if !matched {
                    self.state = SessionState::Aborted;
                    return Err(OtaError::Device("peer not ready".into()));
                }
            }
            self.local.pn += 1;

            let peer_checksum = self.peer.map(|p| p.bk_checksum).unwrap_or(0);
            if self.local.bk_checksum != peer_checksum {
                tracing::warn!(
                    local = self.local.bk_checksum,
                    peer = peer_checksum,
                    "breakpoint checksums disagree"
                );
                sync_err = true;
            }
        } else {
            self.state = SessionState::HandshakeSent;
        }

        // a loaded record is only trusted when the peer agrees on it and
        // the caller actually asked to resume
        if self.resumed_record && (sync_err || !self.resume_requested) {
            self.store.wipe()?;
            self.breakpoint = Breakpoint::default();
            self.local.bk_checksum = 0;
            self.resumed_record = false;
        }

        let decision = if self.resume_requested {
            let offset = self
                .directory
                .as_ref()
                .and_then(|dir| resume_offset(&self.breakpoint, dir))
                .unwrap_or(0);
            if offset > 0 {
                self.resume_at = offset;
                ResumeDecision::Resume { offset }
            } else {
                ResumeDecision::Fresh
            }
        } else {
            ResumeDecision::Fresh
        };

        tracing::info!(decision = ?decision, "handshake complete");
        Ok(decision)
    }

    /// Arm the stream and go active.
    ///
    /// For a resumed transfer (`offset > 0`) the authoritative image head
    /// must be supplied: a synthetic head+manifest prefix is injected into
    /// the streaming buffer, and any overlap between where the transport
    /// restarts and where the flash pipeline already got is marked for
    /// discard.
    pub fn start(&mut self, offset: u32, head: Option<&FwHead>) -> Result<()> {
        if self.state != SessionState::HandshakeSent {
            return Err(OtaError::InvalidParam("start before handshake"));
        }

        if offset > 0 {
            let head = head.ok_or(OtaError::InvalidParam("resume requires the image head"))?;
            let prefix = crate::image::synthesize(head);
            if !self.buffer.inject_prefix(prefix.bytes()) {
                return Err(OtaError::InvalidParam("stream buffer not empty"));
            }

            let resume_at = self.resume_at.max(offset);
            let skip = resume_at - offset;
            if skip > 0 {
                self.buffer.set_skip(skip as usize);
            }
            self.arrived = offset;
            self.flashed = resume_at;
            tracing::info!(offset, skip, prefix_len = prefix.len(), "stream armed for resume");
        } else {
            self.arrived = 0;
            self.flashed = 0;
        }

        self.breakpoint.unique_id = self.unique_id;
        self.state = SessionState::Active;
        Ok(())
    }

    /// Feed one raw frame received from the transport.
    ///
    /// Checksum or sequence violations flip the sticky `role_exit` flag:
    /// the session silently drops everything afterwards and must be
    /// aborted by the caller. Timeouts inside a checkpoint wait surface
    /// as errors — a Primary must abort rather than run past a
    /// desynchronized Secondary.
    pub fn process_frame(&mut self, raw: &[u8]) -> Result<FrameOutcome> {
        if self.shared.role_exit() {
            return Ok(FrameOutcome::Rejected);
        }

        let frame = match decode_frame(raw, self.config.max_payload) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::error!("frame rejected: {err}");
                self.shared.set_role_exit();
                return Ok(FrameOutcome::Rejected);
            }
        };

        match frame {
            Frame::Info(info) => self.handle_info(info),
            Frame::Data {
                frame_number,
                payload,
            } => self.handle_data(frame_number, payload),
        }
    }

    fn handle_info(&mut self, info: SyncInfo) -> Result<FrameOutcome> {
        let status = info.status;
        self.peer = Some(info);

        if self.role == Role::Primary {
            // the primary consumes peer info through its inbox; a copy
            // arriving here is forwarded to any pending wait
            let _ = self.peer_tx.send(info);
            return Ok(FrameOutcome::PeerStatus(status));
        }

        tracing::debug!(status = ?status, pn = info.pn, "peer status");
        match status {
            Status::Ready | Status::Inquire => Ok(FrameOutcome::PeerStatus(status)),
            Status::FwCheck => Ok(FrameOutcome::PeerFirmwareCheck),
            Status::Halt => {
                tracing::info!("peer halted the transfer");
                Ok(FrameOutcome::PeerHalted)
            }
        }
    }

    fn handle_data(&mut self, frame_number: u32, payload: &[u8]) -> Result<FrameOutcome> {
        if self.discard {
            return Ok(FrameOutcome::Rejected);
        }
        if self.state != SessionState::Active {
            return Err(OtaError::InvalidParam("data frame outside active state"));
        }

        if frame_number != self.local.cur_fn + 1 {
            tracing::error!(
                expected = self.local.cur_fn + 1,
                got = frame_number,
                "frame sequence violated"
            );
            self.shared.set_role_exit();
            return Ok(FrameOutcome::Rejected);
        }

        if !self.buffer.write(payload) {
            tracing::debug!(len = payload.len(), "stream buffer full, frame deferred");
            return Ok(FrameOutcome::BufferFull);
        }

        // mirror the validated payload to the secondary before counting it
        if self.role == Role::Primary {
            let mirrored = encode_data(self.local.cur_fn + 1, payload);
            self.send_peer(&mirrored)?;
        }

        if self.role != Role::Standalone
            && (self.local.cur_fn % self.config.checkpoint_interval == 0
                || self.arrived + self.config.low_water >= self.local.fw_size)
        {
            self.checkpoint()?;
        }

        self.local.cur_fn += 1;
        self.arrived += payload.len() as u32;
        if self.arrived > self.flashed {
            self.flashed = self.arrived;
        }
        self.update_breakpoint()?;
        self.report_progress();

        if self.arrived >= self.local.fw_size {
            tracing::info!(arrived = self.arrived, "image complete");
            self.state = SessionState::FirmwareCheck;
            Ok(FrameOutcome::Complete)
        } else {
            Ok(FrameOutcome::Accepted {
                len: payload.len(),
            })
        }
    }

    /// Confirm the peer's progress before taking more frames. Bounds how
    /// far the two devices can drift and how much data an abort can lose.
    fn checkpoint(&mut self) -> Result<()> {
        self.state = SessionState::Checkpoint;
        self.local.status = Status::Inquire;

        // the mirrored frame is already on the wire, so the peer's ack may
        // already be queued; it must not be drained before the wait
        self.send_info(self.local.pn)?;

        if self.role == Role::Primary {
            tracing::debug!(pn = self.local.pn, "checkpoint wait");
            let info = self
                .peer_rx
                .recv_timeout(self.config.checkpoint_timeout())
                .map_err(|_| {
                    self.state = SessionState::Aborted;
                    OtaError::PeerTimeout {
                        waiting_for: "checkpoint",
                    }
                })?;
            let matched = info.status == Status::Inquire && info.pn == self.local.pn;
            self.peer = Some(info);
            if !matched {
                self.state = SessionState::Aborted;
                return Err(OtaError::Desynchronized);
            }
        }

        self.local.pn += 1;
        self.state = SessionState::Active;
        Ok(())
    }

    /// Run the local integrity check once the full image has arrived.
    /// `verify_file` is supplied by the flash pipeline side and must
    /// confirm each directory entry against what was written. Idempotent
    /// after the first success.
    pub fn check<F>(&mut self, mut verify_file: F) -> Result<()>
    where
        F: FnMut(&DirEntry) -> bool,
    {
        if self.fw_checked {
            return Ok(());
        }
        match self.state {
            SessionState::Active | SessionState::Checkpoint | SessionState::FirmwareCheck => {}
            _ => return Err(OtaError::InvalidParam("check outside an active session")),
        }

        // stop feeding the buffer; late frames are dropped, not written
        self.discard = true;

        let entries: Vec<DirEntry> = self
            .directory
            .as_ref()
            .ok_or(OtaError::InvalidParam("no image directory for check"))?
            .entries()
            .to_vec();

        for entry in &entries {
            if !verify_file(entry) {
                tracing::error!(file = entry.name_str(), "firmware check failed");
                self.state = SessionState::Aborted;
                return Err(OtaError::FwCheck(entry.name_str().to_string()));
            }
        }

        if self.role == Role::Primary {
            self.local.status = Status::FwCheck;
            self.send_info(0)?;
        }

        self.fw_checked = true;
        self.local.status = Status::FwCheck;
        self.state = SessionState::Done;

        if let Some(last) = entries.last() {
            self.breakpoint = Breakpoint {
                unique_id: self.unique_id,
                file_name: last.name,
                write_offset: last.length,
                file_length: last.length,
                file_checksum: last.checksum,
                state: BpState::Done,
            };
            self.store.update(self.breakpoint)?;
        }
        self.report_progress();

        tracing::info!("firmware check passed");
        Ok(())
    }

    /// Tear the session down. A Primary signals Halt so the peer stops
    /// too; the session's unique id is persisted for future resume
    /// matching whether or not the transfer completed.
    pub fn deinit(mut self) -> Result<()> {
        if self.role == Role::Primary {
            self.local.status = Status::Halt;
            let frame = encode_info(&self.local, 0);
            if let Some(link) = self.link.as_mut() {
                if !link.send(&frame) {
                    tracing::warn!("halt notification not delivered");
                }
            }
        }

        self.shared.alive.store(false, Ordering::Release);
        self.buffer.close();
        self.store.finish_session(self.unique_id)?;
        self.state = SessionState::Halted;

        tracing::info!(unique_id = self.unique_id, "session torn down");
        Ok(())
    }

    fn send_info(&mut self, seq: u32) -> Result<()> {
        if self.role == Role::Standalone {
            return Ok(());
        }
        let frame = encode_info(&self.local, seq);
        self.send_peer(&frame)
    }

    fn send_peer(&mut self, frame: &[u8]) -> Result<()> {
        let retries = self.config.send_retries;
        let link = self
            .link
            .as_mut()
            .ok_or(OtaError::InvalidParam("no peer link"))?;
        for attempt in 0..retries {
            if link.send(frame) {
                return Ok(());
            }
            tracing::warn!(attempt, "peer send failed");
        }
        Err(OtaError::PeerSend { attempts: retries })
    }

    /// Discard stale queued peer messages before arming a fresh wait.
    fn drain_peer(&mut self) {
        while self.peer_rx.try_recv().is_ok() {}
    }

    /// Map the flash high-water mark back to {file, offset-in-file} and
    /// persist it.
    fn update_breakpoint(&mut self) -> Result<()> {
        let Some(dir) = self.directory.as_ref() else {
            return Ok(());
        };
        let pos = self.flashed;
        let Some(entry) = dir
            .entries()
            .iter()
            .find(|e| e.offset <= pos && pos < e.offset + e.length)
        else {
            // head/padding region; nothing file-scoped to record
            return Ok(());
        };

        let record = Breakpoint {
            unique_id: self.unique_id,
            file_name: entry.name,
            write_offset: pos - entry.offset,
            file_length: entry.length,
            file_checksum: entry.checksum,
            state: BpState::Writing,
        };
        if record != self.breakpoint {
            self.breakpoint = record;
            self.store.update(record)?;
        }
        Ok(())
    }

    fn report_progress(&mut self) {
        let Some(observer) = self.progress.as_mut() else {
            return;
        };
        let total = self.local.fw_size;
        let percent = if self.fw_checked {
            100
        } else {
            (((self.arrived as u64) * 100 / total.max(1) as u64) as u8).min(99)
        };
        observer(ProgressReport {
            arrived: self.arrived,
            total,
            percent,
        });
    }
}

//! Persisted transfer breakpoint.
//!
//! One fixed-size record survives power loss: which file of the image was
//! being written, how far into it the flash pipeline got, and the overall
//! transfer state. The store also remembers the unique id of the last
//! finished session so a later attempt can tell "same logical transfer,
//! may resume" from "new transfer, must restart".

use crate::error::{OtaError, Result};
use crate::image::FILE_NAME_LEN;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fs;
use std::path::{Path, PathBuf};

/// "OTBP" on disk.
const BP_FILE_MAGIC: u32 = 0x5042_544F;

/// Serialized record size: unique_id + name + offset + length + checksum + state.
pub const BP_RECORD_SIZE: usize = 4 + FILE_NAME_LEN + 4 + 4 + 4 + 1;

/// Full store file: magic + last_session_id + record + record byte-sum.
const BP_FILE_SIZE: usize = 4 + 4 + BP_RECORD_SIZE + 4;

/// Overall transfer state carried by the breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum BpState {
    #[default]
    Idle = 0,
    Writing = 1,
    Done = 2,
}

impl BpState {
    fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Idle),
            1 => Some(Self::Writing),
            2 => Some(Self::Done),
            _ => None,
        }
    }
}

/// The persisted breakpoint record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Breakpoint {
    pub unique_id: u32,
    pub file_name: [u8; FILE_NAME_LEN],
    /// Write offset within the current file, not within the whole image.
    pub write_offset: u32,
    pub file_length: u32,
    pub file_checksum: u32,
    pub state: BpState,
}

impl Default for Breakpoint {
    fn default() -> Self {
        Self {
            unique_id: 0,
            file_name: [0; FILE_NAME_LEN],
            write_offset: 0,
            file_length: 0,
            file_checksum: 0,
            state: BpState::Idle,
        }
    }
}

impl Breakpoint {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(BP_RECORD_SIZE);
        buf.put_u32_le(self.unique_id);
        buf.put_slice(&self.file_name);
        buf.put_u32_le(self.write_offset);
        buf.put_u32_le(self.file_length);
        buf.put_u32_le(self.file_checksum);
        buf.put_u8(self.state as u8);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < BP_RECORD_SIZE {
            return Err(OtaError::Parse("breakpoint record truncated".into()));
        }
        let unique_id = payload.get_u32_le();
        let mut file_name = [0u8; FILE_NAME_LEN];
        payload.copy_to_slice(&mut file_name);
        let write_offset = payload.get_u32_le();
        let file_length = payload.get_u32_le();
        let file_checksum = payload.get_u32_le();
        let state = BpState::from_u8(payload.get_u8())
            .ok_or_else(|| OtaError::Parse("bad breakpoint state".into()))?;
        Ok(Self {
            unique_id,
            file_name,
            write_offset,
            file_length,
            file_checksum,
            state,
        })
    }

    /// Wrapping byte-sum over the serialized record. This is the value
    /// exchanged with the peer during the handshake to decide whether both
    /// devices hold the same resume point.
    pub fn checksum(&self) -> u32 {
        self.encode()
            .iter()
            .fold(0u32, |acc, &b| acc.wrapping_add(b as u32))
    }
}

/// Outcome of validating the persisted breakpoint against a new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointInit {
    /// Nothing to resume; the store was wiped.
    StartFresh,
    /// The record is trusted locally; `checksum` is its record byte-sum.
    Resume { checksum: u32 },
}

/// File-backed breakpoint store.
pub struct BreakpointStore {
    path: PathBuf,
    last_session_id: u32,
    record: Breakpoint,
}

impl BreakpointStore {
    /// Open the store, loading any persisted state. A missing or corrupt
    /// file is treated as an empty store, never as an error: resume state
    /// is advisory and must not block a fresh transfer.
    pub fn open(path: &Path) -> Self {
        let (last_session_id, record) = match Self::load(path) {
            Ok(loaded) => loaded,
            Err(err) => {
                tracing::warn!("breakpoint store unreadable, starting empty: {err}");
                (0, Breakpoint::default())
            }
        };
        Self {
            path: path.to_path_buf(),
            last_session_id,
            record,
        }
    }

    fn load(path: &Path) -> Result<(u32, Breakpoint)> {
        if !path.exists() {
            return Ok((0, Breakpoint::default()));
        }
        let raw = fs::read(path)?;
        if raw.len() != BP_FILE_SIZE {
            return Err(OtaError::Parse(format!(
                "breakpoint file has {} bytes, expected {BP_FILE_SIZE}",
                raw.len()
            )));
        }
        let mut payload = Bytes::copy_from_slice(&raw);
        let magic = payload.get_u32_le();
        if magic != BP_FILE_MAGIC {
            return Err(OtaError::Parse(format!("bad breakpoint magic {magic:#010x}")));
        }
        let last_session_id = payload.get_u32_le();
        let record_bytes = payload.copy_to_bytes(BP_RECORD_SIZE);
        let stored_sum = payload.get_u32_le();

        let computed: u32 = record_bytes
            .iter()
            .fold(0u32, |acc, &b| acc.wrapping_add(b as u32));
        if computed != stored_sum {
            return Err(OtaError::Parse(format!(
                "breakpoint record sum mismatch: stored {stored_sum:#010x}, computed {computed:#010x}"
            )));
        }

        let record = Breakpoint::decode(record_bytes)?;
        Ok((last_session_id, record))
    }

    /// Persist the current state with write-temp-then-rename.
    fn save(&self) -> Result<()> {
        let mut buf = BytesMut::with_capacity(BP_FILE_SIZE);
        buf.put_u32_le(BP_FILE_MAGIC);
        buf.put_u32_le(self.last_session_id);
        let record_bytes = self.record.encode();
        buf.put_slice(&record_bytes);
        buf.put_u32_le(
            record_bytes
                .iter()
                .fold(0u32, |acc, &b| acc.wrapping_add(b as u32)),
        );

        let temp = self.path.with_extension("tmp");
        fs::write(&temp, &buf)?;
        fs::rename(&temp, &self.path)?;
        Ok(())
    }

    /// Validate the persisted record against a new session's unique id.
    ///
    /// The record is only trusted when the requested id matches the last
    /// finished session's id and the record was left in `Writing` state;
    /// anything else wipes the store so a stale record can never steer a
    /// different transfer.
    pub fn init(&mut self, unique_id: u32) -> Result<(Breakpoint, BreakpointInit)> {
        if unique_id != self.last_session_id || self.record.state != BpState::Writing {
            tracing::info!(
                unique_id,
                last = self.last_session_id,
                state = ?self.record.state,
                "no resumable breakpoint, starting fresh"
            );
            self.wipe()?;
            return Ok((self.record, BreakpointInit::StartFresh));
        }

        let checksum = self.record.checksum();
        tracing::info!(
            unique_id,
            file = self.record.file_name_str(),
            offset = self.record.write_offset,
            checksum,
            "resumable breakpoint loaded"
        );
        Ok((self.record, BreakpointInit::Resume { checksum }))
    }

    /// Reset the record to empty and persist.
    pub fn wipe(&mut self) -> Result<()> {
        self.record = Breakpoint::default();
        self.save()
    }

    /// Persist updated in-transfer progress.
    pub fn update(&mut self, record: Breakpoint) -> Result<()> {
        self.record = record;
        self.save()
    }

    /// Record the finished (or aborted) session's id for future resume
    /// matching. Called from session teardown.
    pub fn finish_session(&mut self, unique_id: u32) -> Result<()> {
        self.last_session_id = unique_id;
        self.save()
    }

    pub fn record(&self) -> &Breakpoint {
        &self.record
    }

    pub fn last_session_id(&self) -> u32 {
        self.last_session_id
    }
}

impl Breakpoint {
    pub fn file_name_str(&self) -> &str {
        let end = self
            .file_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(FILE_NAME_LEN);
        std::str::from_utf8(&self.file_name[..end]).unwrap_or("")
    }
}

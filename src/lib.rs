//! Resumable OTA firmware transfer middleware for paired two-device
//! products.
//!
//! The crate sits between a session-oriented transport (e.g. a Bluetooth
//! profile channel) and an external flash pipeline, and keeps two paired
//! devices' flash contents byte-identical while a new firmware image
//! streams in:
//!
//! - [`transfer`] — wire framing, the peer link seam, and the session
//!   coordinator (roles, handshake, checkpoints, firmware check).
//! - [`breakpoint`] — the persisted resume record and the pure resume
//!   offset calculator.
//! - [`buffer`] — the bounded ring decoupling frame reception from the
//!   slower flash-write consumer.
//! - [`backend`] — the open/close/read/write/ioctl adapter the flash
//!   pipeline drives.
//! - [`image`] — the firmware image head/directory model and the
//!   synthetic prefix built when a transfer resumes mid-file.
//!
//! Flash programming, image signing, UI, and the link layer itself are
//! out of scope; the application wires those around the session
//! lifecycle (`init` → `handshake` → `start` → `process_frame`* →
//! `check` → `deinit`).

pub mod backend;
pub mod breakpoint;
pub mod buffer;
pub mod config;
pub mod error;
pub mod image;
pub mod transfer;

pub use breakpoint::{resume_offset, Breakpoint, BreakpointInit, BreakpointStore};
pub use config::OtaConfig;
pub use error::{ExitCode, OtaError, Result};
pub use transfer::{
    FrameOutcome, PeerInbox, PeerLink, ResumeDecision, Role, Session, SessionConfig, SessionState,
};

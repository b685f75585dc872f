//! Transfer protocol: wire framing, peer seam, and the session
//! coordinator.
//!
//! ```text
//! phone/transport ──frames──> Coordinator ──payload──> Streaming Buffer ──> flash pipeline
//!                                  │
//!                                  └──mirrored frames──> peer Coordinator
//! ```
//!
//! Two-phase peer design:
//! 1. Handshake — both devices exchange Ready with their breakpoint
//!    checksums; resume is only honored when they agree.
//! 2. Streaming — the Primary validates, mirrors, and periodically
//!    checkpoints the Secondary's progress before taking more frames.

pub mod coordinator;
pub mod peer;
pub mod protocol;

pub use coordinator::{
    FrameOutcome, ProgressReport, ResumeDecision, Role, Session, SessionConfig, SessionState,
};
pub use peer::{PeerInbox, PeerLink, SessionShared};
pub use protocol::{
    byte_sum, decode_frame, encode_data, encode_info, Frame, Status, SyncInfo, FRAME_OVERHEAD,
    MAX_PAYLOAD, MSG_DATA, MSG_INFO, ROLE_BIT, SYNC_INFO_SIZE,
};

//! Persisted breakpoint state and resume offset calculation.

pub mod resume;
pub mod store;

pub use resume::resume_offset;
pub use store::{BpState, Breakpoint, BreakpointInit, BreakpointStore, BP_RECORD_SIZE};

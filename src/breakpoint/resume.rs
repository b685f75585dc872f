//! Resume offset calculation.
//!
//! Pure lookup: a breakpoint names a file identity and a write offset
//! inside it; the authoritative image directory translates that into a
//! global byte offset to resume the stream from. Any disagreement means
//! the resume state cannot be trusted and the transfer restarts at byte 0.

use crate::breakpoint::store::{BpState, Breakpoint};
use crate::image::ImageDirectory;

/// Compute the global byte offset to resume from.
///
/// Returns `None` (not resumable) when the breakpoint was not mid-write,
/// when no directory entry matches the breakpoint's {name, length,
/// checksum} exactly, or when the file-scoped write offset exceeds the
/// matched entry's length.
pub fn resume_offset(bp: &Breakpoint, dir: &ImageDirectory) -> Option<u32> {
    if bp.state != BpState::Writing {
        return None;
    }

    let entry = dir.find(&bp.file_name, bp.file_length, bp.file_checksum)?;

    if bp.write_offset > entry.length {
        tracing::error!(
            file = bp.file_name_str(),
            write_offset = bp.write_offset,
            length = entry.length,
            "breakpoint write offset exceeds file length"
        );
        return None;
    }

    Some(entry.offset + bp.write_offset)
}

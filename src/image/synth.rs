//! Resume prefix synthesizer.
//!
//! A resumed transfer starts mid-file, but the downstream flash pipeline
//! expects every stream to open with the image head and directory table.
//! This module rebuilds that prefix in memory: the authoritative head and
//! directory are copied unmodified, a descriptive manifest is rendered
//! behind them, and the head is restamped with the manifest reference and a
//! fresh self-checksum.

use crate::image::header::{DirEntry, FwHead, ManifestRef, FW_HEAD_SIZE};
use bytes::{BufMut, Bytes, BytesMut};

/// Synthesized stream prefix: head ‖ manifest.
#[derive(Debug, Clone)]
pub struct ResumePrefix {
    bytes: Bytes,
    manifest_len: usize,
}

impl ResumePrefix {
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Combined byte length of head plus manifest.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn manifest_len(&self) -> usize {
        self.manifest_len
    }

    pub fn manifest_bytes(&self) -> &[u8] {
        &self.bytes[FW_HEAD_SIZE..]
    }
}

/// Build the synthetic prefix for a resumed session.
pub fn synthesize(head: &FwHead) -> ResumePrefix {
    let manifest = render_manifest(head);

    let mut stamped = head.clone();
    stamped.manifest = ManifestRef {
        offset: FW_HEAD_SIZE as u32,
        length: manifest.len() as u32,
        checksum: crc32fast::hash(&manifest),
    };

    // encode() recomputes the head self-checksum over the stamped fields
    let head_bytes = stamped.encode();

    let mut buf = BytesMut::with_capacity(head_bytes.len() + manifest.len());
    buf.put_slice(&head_bytes);
    buf.put_slice(&manifest);

    ResumePrefix {
        bytes: buf.freeze(),
        manifest_len: manifest.len(),
    }
}

/// Partition classification by file name, matching the image tooling's
/// naming scheme.
fn partition_type(entry: &DirEntry) -> &'static str {
    let name = entry.name_str();
    if name.starts_with("mbrec") {
        "boot"
    } else if name.starts_with("param") {
        "param"
    } else if name.starts_with("sdfs") {
        "data"
    } else if name.starts_with("recovery") {
        "recovery"
    } else {
        "system"
    }
}

fn render_manifest(head: &FwHead) -> Vec<u8> {
    let mut text = String::new();
    text.push_str("<firmware>\n");
    text.push_str(&format!("version=0x{:08x}\n", head.new_ver.version_code));
    text.push_str(&format!("files={}\n", head.dir.len()));

    for (idx, entry) in head.dir.entries().iter().enumerate() {
        text.push_str("<file>\n");
        text.push_str(&format!("type={}\n", partition_type(entry)));
        text.push_str(&format!("id={}\n", idx + 1));
        text.push_str(&format!("name={}\n", entry.name_str()));
        text.push_str(&format!("size={}\n", entry.length));
        text.push_str(&format!("checksum=0x{:08x}\n", entry.checksum));
        text.push_str("</file>\n");
    }

    text.push_str("</firmware>\n");
    text.into_bytes()
}

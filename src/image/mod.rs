//! Firmware image model: head, directory table, resume prefix synthesis.

pub mod header;
pub mod synth;

pub use header::{
    head_checksum, DirEntry, FwHead, FwVersion, ImageDirectory, ManifestRef, FILE_NAME_LEN,
    FW_DIR_OFFSET, FW_HEAD_MAGIC, FW_HEAD_SIZE, MANIFEST_REF_OFFSET, MAX_DIR_ENTRIES,
};
pub use synth::{synthesize, ResumePrefix};

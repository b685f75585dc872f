//! Firmware image header and directory table.
//!
//! The image starts with a fixed 1024-byte head: a 32-byte hdr block, a
//! manifest reference, two version blocks, and a 16-entry file directory at
//! offset 0x200. All integers are little-endian. The head carries a CRC32
//! self-checksum over everything past its first 8 bytes (magic + checksum
//! field are excluded from the covered range).

use crate::error::{OtaError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// "AOTA"
pub const FW_HEAD_MAGIC: u32 = 0x4154_4F41;

/// Total size of the image head.
pub const FW_HEAD_SIZE: usize = 0x400;

/// Byte offset of the directory table inside the head.
pub const FW_DIR_OFFSET: usize = 0x200;

/// Byte offset of the manifest reference inside the head.
pub const MANIFEST_REF_OFFSET: usize = 0x20;

pub const MAX_DIR_ENTRIES: usize = 16;
pub const FILE_NAME_LEN: usize = 12;

const VER_BLOCK_SIZE: usize = 0x60;
const DIR_ENTRY_SIZE: usize = 32;

/// CRC32 over the head bytes, skipping the magic and checksum fields.
pub fn head_checksum(head_bytes: &[u8]) -> u32 {
    crc32fast::hash(&head_bytes[8..FW_HEAD_SIZE])
}

// =============================================================================
// Directory
// =============================================================================

/// One file in the image directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    pub name: [u8; FILE_NAME_LEN],
    /// Offset of the file's first byte within the whole image.
    pub offset: u32,
    pub length: u32,
    pub checksum: u32,
}

impl DirEntry {
    pub fn new(name: &str, offset: u32, length: u32, checksum: u32) -> Self {
        let mut entry = Self {
            name: [0u8; FILE_NAME_LEN],
            offset,
            length,
            checksum,
        };
        let bytes = name.as_bytes();
        let n = bytes.len().min(FILE_NAME_LEN);
        entry.name[..n].copy_from_slice(&bytes[..n]);
        entry
    }

    /// File name with NUL padding stripped.
    pub fn name_str(&self) -> &str {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(FILE_NAME_LEN);
        std::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.name[0] == 0
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.name);
        buf.put_bytes(0, 4);
        buf.put_u32_le(self.offset);
        buf.put_u32_le(self.length);
        buf.put_bytes(0, 4);
        buf.put_u32_le(self.checksum);
    }

    fn decode(payload: &mut Bytes) -> Result<Self> {
        if payload.remaining() < DIR_ENTRY_SIZE {
            return Err(OtaError::Parse("directory entry truncated".into()));
        }
        let mut name = [0u8; FILE_NAME_LEN];
        payload.copy_to_slice(&mut name);
        payload.advance(4);
        let offset = payload.get_u32_le();
        let length = payload.get_u32_le();
        payload.advance(4);
        let checksum = payload.get_u32_le();
        Ok(Self {
            name,
            offset,
            length,
            checksum,
        })
    }
}

/// Authoritative table of the files making up the image. Supplied by the
/// upgrade engine; never mutated by this crate.
#[derive(Debug, Clone, Default)]
pub struct ImageDirectory {
    entries: Vec<DirEntry>,
}

impl ImageDirectory {
    pub fn new(entries: Vec<DirEntry>) -> Result<Self> {
        if entries.len() > MAX_DIR_ENTRIES {
            return Err(OtaError::InvalidParam("too many directory entries"));
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[DirEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find the entry exactly matching a file identity. All three fields
    /// must agree; a name-only match is not authoritative.
    pub fn find(&self, name: &[u8; FILE_NAME_LEN], length: u32, checksum: u32) -> Option<&DirEntry> {
        self.entries
            .iter()
            .find(|e| &e.name == name && e.length == length && e.checksum == checksum)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&DirEntry> {
        self.entries.iter().find(|e| e.name_str() == name)
    }
}

// =============================================================================
// Version block
// =============================================================================

#[derive(Debug, Clone)]
pub struct FwVersion {
    pub version_name: [u8; 32],
    pub board_name: [u8; 32],
    pub hardware_ver: [u8; 4],
    pub version_code: u32,
    pub build_time: [u8; 16],
}

impl Default for FwVersion {
    fn default() -> Self {
        Self {
            version_name: [0; 32],
            board_name: [0; 32],
            hardware_ver: [0; 4],
            version_code: 0,
            build_time: [0; 16],
        }
    }
}

impl FwVersion {
    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.version_name);
        buf.put_slice(&self.board_name);
        buf.put_slice(&self.hardware_ver);
        buf.put_u32_le(self.version_code);
        buf.put_bytes(0, 8);
        buf.put_slice(&self.build_time);
    }

    fn decode(payload: &mut Bytes) -> Result<Self> {
        if payload.remaining() < VER_BLOCK_SIZE {
            return Err(OtaError::Parse("version block truncated".into()));
        }
        let mut ver = Self::default();
        payload.copy_to_slice(&mut ver.version_name);
        payload.copy_to_slice(&mut ver.board_name);
        payload.copy_to_slice(&mut ver.hardware_ver);
        ver.version_code = payload.get_u32_le();
        payload.advance(8);
        payload.copy_to_slice(&mut ver.build_time);
        Ok(ver)
    }
}

// =============================================================================
// Head
// =============================================================================

/// Reference to the descriptive manifest appended behind a synthesized head.
/// Zeroed in images produced by the build tooling; stamped by the resume
/// prefix synthesizer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManifestRef {
    pub offset: u32,
    pub length: u32,
    pub checksum: u32,
}

#[derive(Debug, Clone)]
pub struct FwHead {
    pub header_version: u16,
    pub file_cnt: u16,
    pub flag: u16,
    pub dir_offset: u16,
    pub data_offset: u16,
    pub data_size: u32,
    pub data_checksum: u32,
    pub manifest: ManifestRef,
    pub new_ver: FwVersion,
    pub old_ver: FwVersion,
    pub dir: ImageDirectory,
}

impl FwHead {
    pub fn new(dir: ImageDirectory, data_size: u32, data_checksum: u32) -> Self {
        Self {
            header_version: 1,
            file_cnt: dir.len() as u16,
            flag: 0,
            dir_offset: FW_DIR_OFFSET as u16,
            data_offset: FW_HEAD_SIZE as u16,
            data_size,
            data_checksum,
            manifest: ManifestRef::default(),
            new_ver: FwVersion::default(),
            old_ver: FwVersion::default(),
            dir,
        }
    }

    /// Serialize to the fixed 1024-byte layout with a freshly computed
    /// self-checksum.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FW_HEAD_SIZE);

        buf.put_u32_le(FW_HEAD_MAGIC);
        buf.put_u32_le(0); // checksum patched below
        buf.put_u16_le(self.header_version);
        buf.put_u16_le(FW_HEAD_SIZE as u16);
        buf.put_u16_le(self.file_cnt);
        buf.put_u16_le(self.flag);
        buf.put_u16_le(self.dir_offset);
        buf.put_u16_le(self.data_offset);
        buf.put_u32_le(self.data_size);
        buf.put_u32_le(self.data_checksum);
        buf.put_bytes(0, 4);

        debug_assert_eq!(buf.len(), MANIFEST_REF_OFFSET);
        buf.put_u32_le(self.manifest.offset);
        buf.put_u32_le(self.manifest.length);
        buf.put_u32_le(self.manifest.checksum);
        buf.put_bytes(0, 0x40 - MANIFEST_REF_OFFSET - 12);

        self.new_ver.encode_into(&mut buf);
        self.old_ver.encode_into(&mut buf);
        buf.put_bytes(0, FW_DIR_OFFSET - 0x100);

        debug_assert_eq!(buf.len(), FW_DIR_OFFSET);
        for entry in self.dir.entries() {
            entry.encode_into(&mut buf);
        }
        buf.put_bytes(0, FW_HEAD_SIZE - buf.len());

        let crc = head_checksum(&buf);
        buf[4..8].copy_from_slice(&crc.to_le_bytes());

        buf.freeze()
    }

    /// Parse and verify a 1024-byte head. Magic, declared size and the
    /// self-checksum must all hold.
    pub fn decode(head_bytes: &[u8]) -> Result<Self> {
        if head_bytes.len() < FW_HEAD_SIZE {
            return Err(OtaError::Parse("image head truncated".into()));
        }

        let mut payload = Bytes::copy_from_slice(&head_bytes[..FW_HEAD_SIZE]);
        let magic = payload.get_u32_le();
        if magic != FW_HEAD_MAGIC {
            return Err(OtaError::Parse(format!("bad image magic {magic:#010x}")));
        }
        let header_checksum = payload.get_u32_le();
        let computed = head_checksum(&head_bytes[..FW_HEAD_SIZE]);
        if computed != header_checksum {
            return Err(OtaError::Parse(format!(
                "image head checksum mismatch: stored {header_checksum:#010x}, computed {computed:#010x}"
            )));
        }

        let header_version = payload.get_u16_le();
        let header_size = payload.get_u16_le();
        if header_size as usize != FW_HEAD_SIZE {
            return Err(OtaError::Parse(format!(
                "unexpected head size {header_size}"
            )));
        }
        let file_cnt = payload.get_u16_le();
        if file_cnt as usize > MAX_DIR_ENTRIES {
            return Err(OtaError::Parse(format!("file count {file_cnt} too large")));
        }
        let flag = payload.get_u16_le();
        let dir_offset = payload.get_u16_le();
        let data_offset = payload.get_u16_le();
        let data_size = payload.get_u32_le();
        let data_checksum = payload.get_u32_le();
        payload.advance(4);

        let manifest = ManifestRef {
            offset: payload.get_u32_le(),
            length: payload.get_u32_le(),
            checksum: payload.get_u32_le(),
        };
        payload.advance(0x40 - MANIFEST_REF_OFFSET - 12);

        let new_ver = FwVersion::decode(&mut payload)?;
        let old_ver = FwVersion::decode(&mut payload)?;
        payload.advance(FW_DIR_OFFSET - 0x100);

        let mut entries = Vec::with_capacity(file_cnt as usize);
        for _ in 0..file_cnt {
            entries.push(DirEntry::decode(&mut payload)?);
        }

        Ok(Self {
            header_version,
            file_cnt,
            flag,
            dir_offset,
            data_offset,
            data_size,
            data_checksum,
            manifest,
            new_ver,
            old_ver,
            dir: ImageDirectory::new(entries)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_dir() -> ImageDirectory {
        ImageDirectory::new(vec![
            DirEntry::new("mbrec.bin", 0x400, 0x1000, 0x1111_2222),
            DirEntry::new("system.bin", 0x1400, 0x2_0000, 0x3333_4444),
        ])
        .unwrap()
    }

    #[test]
    fn test_head_roundtrip() {
        let head = FwHead::new(sample_dir(), 0x2_1400, 0xAABB_CCDD);
        let encoded = head.encode();
        assert_eq!(encoded.len(), FW_HEAD_SIZE);

        let decoded = FwHead::decode(&encoded).unwrap();
        assert_eq!(decoded.file_cnt, 2);
        assert_eq!(decoded.data_size, 0x2_1400);
        assert_eq!(decoded.data_checksum, 0xAABB_CCDD);
        assert_eq!(decoded.dir.entries()[0].name_str(), "mbrec.bin");
        assert_eq!(decoded.dir.entries()[1].offset, 0x1400);
    }

    #[test]
    fn test_head_rejects_corruption() {
        let head = FwHead::new(sample_dir(), 0x2_1400, 0xAABB_CCDD);
        let mut bytes = head.encode().to_vec();
        bytes[0x203] ^= 0xFF;
        assert!(FwHead::decode(&bytes).is_err());
    }

    #[test]
    fn test_head_rejects_bad_magic() {
        let head = FwHead::new(sample_dir(), 0, 0);
        let mut bytes = head.encode().to_vec();
        bytes[0] = 0x00;
        assert!(FwHead::decode(&bytes).is_err());
    }

    #[test]
    fn test_directory_find_is_exact() {
        let dir = sample_dir();
        let entry = DirEntry::new("system.bin", 0, 0x2_0000, 0x3333_4444);
        assert!(dir.find(&entry.name, 0x2_0000, 0x3333_4444).is_some());
        // same name, wrong checksum
        assert!(dir.find(&entry.name, 0x2_0000, 0xDEAD_BEEF).is_none());
        // same name, wrong length
        assert!(dir.find(&entry.name, 0x1000, 0x3333_4444).is_none());
    }

    #[test]
    fn test_name_truncated_to_field_width() {
        let entry = DirEntry::new("averylongfilename.bin", 0, 0, 0);
        assert_eq!(entry.name_str(), "averylongfil");
    }
}

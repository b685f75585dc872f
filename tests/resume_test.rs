//! Breakpoint persistence and mid-file resume.
//!
//! An aborted transfer leaves a persisted breakpoint behind; the next
//! session with the same unique id resumes from it, the stream gets a
//! synthesized image prefix, and overlap the transport re-sends is
//! discarded instead of served to the flash pipeline twice.

use otaw::backend::{Backend, BackendCtl, StreamBackend};
use otaw::breakpoint::{resume_offset, BreakpointStore};
use otaw::buffer::StreamBuffer;
use otaw::image::{synthesize, DirEntry, FwHead, ImageDirectory, FW_HEAD_SIZE};
use otaw::transfer::encode_data;
use otaw::{FrameOutcome, OtaConfig, ResumeDecision, Session, SessionConfig, SessionState};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const FILE_OFFSET: u32 = 0x400;
const FILE_LEN: u32 = 4096;
const FW_SIZE: u32 = FILE_OFFSET + FILE_LEN;
const FRAME_LEN: usize = 512;

fn test_config() -> OtaConfig {
    OtaConfig {
        read_wait_ms: 10,
        ..Default::default()
    }
}

fn directory() -> ImageDirectory {
    ImageDirectory::new(vec![DirEntry::new(
        "system.bin",
        FILE_OFFSET,
        FILE_LEN,
        0xC0DE,
    )])
    .unwrap()
}

fn image_head() -> FwHead {
    FwHead::new(directory(), FW_SIZE, 0xFACE)
}

fn image_bytes() -> Vec<u8> {
    (0..FW_SIZE).map(|i| (i * 13 + 5) as u8).collect()
}

fn session(tmp: &TempDir, resume: bool, buffer: &Arc<StreamBuffer>) -> Session {
    let store = BreakpointStore::open(&tmp.path().join("bp.bin"));
    Session::init(
        SessionConfig {
            fw_size: FW_SIZE,
            fw_ver: 3,
            unique_id: 99,
            paired: false,
            peer_bk_checksum: None,
            resume,
        },
        test_config(),
        store,
        Some(directory()),
        Arc::clone(buffer),
        None,
    )
    .unwrap()
}

fn drain(buffer: &StreamBuffer, into: &mut Vec<u8>) {
    let n = buffer.buffered();
    if n > 0 {
        let mut out = vec![0u8; n];
        assert_eq!(buffer.read(&mut out), n);
        into.extend_from_slice(&out);
    }
}

#[test]
fn test_abort_then_resume_mid_file() {
    let tmp = TempDir::new().unwrap();
    let image = image_bytes();

    // --- first attempt: 2048 bytes land, then the transport dies ---
    let buffer = Arc::new(StreamBuffer::new(Duration::from_millis(10)));
    let mut first = session(&tmp, false, &buffer);
    assert_eq!(first.handshake().unwrap(), ResumeDecision::Fresh);
    first.start(0, None).unwrap();

    let mut flashed = Vec::new();
    for n in 1..=4u32 {
        let start = (n as usize - 1) * FRAME_LEN;
        let frame = encode_data(n, &image[start..start + FRAME_LEN]);
        assert!(matches!(
            first.process_frame(&frame).unwrap(),
            FrameOutcome::Accepted { .. }
        ));
        drain(&buffer, &mut flashed);
    }
    assert_eq!(first.arrived(), 2048);
    assert_eq!(flashed, &image[..2048]);
    // the flash pipeline is 1024 bytes into system.bin at this point
    assert_eq!(first.breakpoint().write_offset, 2048 - FILE_OFFSET);
    first.deinit().unwrap();

    // --- second attempt, same unique id: resume ---
    let buffer = Arc::new(StreamBuffer::new(Duration::from_millis(10)));
    let mut second = session(&tmp, true, &buffer);
    let offset = match second.handshake().unwrap() {
        ResumeDecision::Resume { offset } => offset,
        other => panic!("expected resume, got {other:?}"),
    };
    assert_eq!(offset, 2048);

    // the transport can only restart on a 1 KiB boundary, 512 bytes back
    let head = image_head();
    let restart = 1536u32;
    second.start(restart, Some(&head)).unwrap();

    // downstream sees a well-formed image start even though the transfer
    // resumes mid-file; the flash pipeline reads through the backend
    // adapter the way the product wires it
    let mut backend = StreamBackend::new(
        Arc::clone(&buffer),
        second.alive_flag(),
        Duration::from_millis(5),
    );
    backend.ioctl(BackendCtl::Connect);

    let prefix = synthesize(&head);
    let mut served = vec![0u8; prefix.len()];
    assert_eq!(backend.read(&mut served), prefix.len());
    assert_eq!(served, prefix.bytes().as_ref());
    let reparsed = FwHead::decode(&served).unwrap();
    assert_eq!(reparsed.data_size, FW_SIZE);

    // stream the remainder from the restart offset
    let mut resumed = Vec::new();
    let mut n = 0u32;
    let mut pos = restart as usize;
    while pos < image.len() {
        n += 1;
        let end = (pos + FRAME_LEN).min(image.len());
        let frame = encode_data(n, &image[pos..end]);
        let outcome = second.process_frame(&frame).unwrap();
        if end == image.len() {
            assert_eq!(outcome, FrameOutcome::Complete);
        } else {
            assert!(matches!(outcome, FrameOutcome::Accepted { .. }));
        }
        drain(&buffer, &mut resumed);
        pos = end;
    }

    assert_eq!(second.arrived(), FW_SIZE);
    assert_eq!(second.state(), SessionState::FirmwareCheck);

    // the 512 re-sent bytes below the breakpoint were discarded, not
    // served twice: the consumer continues exactly at byte 2048
    assert_eq!(resumed, &image[2048..]);

    second.check(|_| true).unwrap();
    second.deinit().unwrap();
}

#[test]
fn test_resume_denied_for_different_transfer() {
    let tmp = TempDir::new().unwrap();
    let image = image_bytes();

    let buffer = Arc::new(StreamBuffer::new(Duration::from_millis(10)));
    let mut first = session(&tmp, false, &buffer);
    first.handshake().unwrap();
    first.start(0, None).unwrap();
    let mut sink = Vec::new();
    for n in 1..=4u32 {
        let start = (n as usize - 1) * FRAME_LEN;
        first
            .process_frame(&encode_data(n, &image[start..start + FRAME_LEN]))
            .unwrap();
        drain(&buffer, &mut sink);
    }
    first.deinit().unwrap();

    // a different unique id is a different logical transfer
    let store = BreakpointStore::open(&tmp.path().join("bp.bin"));
    let buffer = Arc::new(StreamBuffer::new(Duration::from_millis(10)));
    let mut second = Session::init(
        SessionConfig {
            fw_size: FW_SIZE,
            fw_ver: 3,
            unique_id: 100,
            paired: false,
            peer_bk_checksum: None,
            resume: true,
        },
        test_config(),
        store,
        Some(directory()),
        buffer,
        None,
    )
    .unwrap();
    assert_eq!(second.handshake().unwrap(), ResumeDecision::Fresh);
}

#[test]
fn test_synthesized_manifest_matches_resume_lookup() {
    // round-trip: the entry the synthesizer described must be the entry
    // the resume calculator finds for a breakpoint built from it
    let head = image_head();
    let prefix = synthesize(&head);
    let reparsed = FwHead::decode(prefix.bytes()).unwrap();

    let entry = &reparsed.dir.entries()[0];
    let mut bp = otaw::Breakpoint {
        unique_id: 99,
        write_offset: 100,
        file_length: entry.length,
        file_checksum: entry.checksum,
        state: otaw::breakpoint::BpState::Writing,
        ..Default::default()
    };
    bp.file_name = entry.name;

    let offset = resume_offset(&bp, &reparsed.dir).unwrap();
    assert_eq!(offset, entry.offset + 100);

    let original = directory();
    let found = original
        .find(&bp.file_name, bp.file_length, bp.file_checksum)
        .unwrap();
    assert_eq!(found.name, entry.name);
    assert_eq!(found.length, entry.length);
    assert_eq!(found.checksum, entry.checksum);

    // the manifest sits right behind the fixed-size head
    assert_eq!(reparsed.manifest.offset as usize, FW_HEAD_SIZE);
    assert_eq!(reparsed.manifest.length as usize, prefix.manifest_len());
    assert_ne!(reparsed.manifest.checksum, 0);
}

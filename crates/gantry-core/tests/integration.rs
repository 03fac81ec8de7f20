//! End-to-end transfer tests driving real subprocesses and pipes, acting as
//! the host engine on the orchestration side.

#![cfg(unix)]

use std::io::{Read, Write};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use gantry_core::config::TransferConfig;
use gantry_core::error::GantryError;
use gantry_core::host::{
    HostMessenger, MessageLevel, ObjectKind, ObjectSource, ObjectSpec, PluginStatus,
};
use gantry_core::session::backup::{BackupSession, ObjectStep};
use gantry_core::session::restore::RestoreSession;
use gantry_types::{ChunkDigest, DigestAlgo};

const CHUNK: usize = 4096;

struct NullMessenger;

impl HostMessenger for NullMessenger {
    fn job_message(&self, _level: MessageLevel, _text: &str) {}
}

fn test_config() -> TransferConfig {
    TransferConfig {
        chunk_size: CHUNK,
        max_ram_chunks: 2,
        queue_depth: 8,
        queue_timeout_secs: 30,
        image_suffixes: vec![".img".into()],
        ..Default::default()
    }
}

/// 2.5 chunks of image data; the middle chunk is all-zero.
fn test_image() -> Vec<u8> {
    let mut image = Vec::with_capacity(CHUNK * 2 + CHUNK / 2);
    image.extend((0..CHUNK).map(|i| (i % 251) as u8 + 1));
    image.extend(std::iter::repeat(0u8).take(CHUNK));
    image.extend((0..CHUNK / 2).map(|i| (i % 13) as u8 + 100));
    image
}

fn fixture_tar(image: &[u8]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());

    let mut header = tar::Header::new_gnu();
    header.set_size(13);
    header.set_mode(0o644);
    header.set_mtime(1_700_000_000);
    header.set_entry_type(tar::EntryType::Regular);
    builder
        .append_data(&mut header, "manifest.json", &b"{\"layers\":1}\n"[..])
        .unwrap();

    let mut dir = tar::Header::new_gnu();
    dir.set_size(0);
    dir.set_mode(0o755);
    dir.set_entry_type(tar::EntryType::Directory);
    builder.append_data(&mut dir, "vm0/", &b""[..]).unwrap();

    let mut img = tar::Header::new_gnu();
    img.set_size(image.len() as u64);
    img.set_mode(0o600);
    img.set_entry_type(tar::EntryType::Regular);
    builder
        .append_data(&mut img, "vm0/disk0.img", image)
        .unwrap();

    builder.into_inner().unwrap()
}

fn read_source(source: ObjectSource) -> Vec<u8> {
    match source {
        ObjectSource::Empty => Vec::new(),
        ObjectSource::Pipe(mut f) => {
            let mut bytes = Vec::new();
            f.read_to_end(&mut bytes).unwrap();
            bytes
        }
    }
}

#[test]
fn backup_delivers_chunked_image_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let tar_path = dir.path().join("export.tar");
    let image = test_image();
    std::fs::write(&tar_path, fixture_tar(&image)).unwrap();

    let mut command = Command::new("cat");
    command.arg(&tar_path);
    let cancel = Arc::new(AtomicBool::new(false));
    let mut session = BackupSession::start(test_config(), command, cancel).unwrap();

    let mut objects = Vec::new();
    loop {
        match session.next_object(&NullMessenger).unwrap() {
            ObjectStep::Object { spec, source } => objects.push((spec, read_source(source))),
            ObjectStep::Finished => break,
            ObjectStep::Stopped => panic!("unexpected stop"),
        }
    }
    let status = session.finish(&NullMessenger).unwrap();
    assert_eq!(status, PluginStatus::Done);

    assert_eq!(objects.len(), 5, "manifest + dir + 3 chunks");

    let (manifest_spec, manifest_bytes) = &objects[0];
    assert_eq!(manifest_spec.path, "manifest.json");
    assert_eq!(manifest_spec.kind, ObjectKind::RegularFile);
    assert_eq!(manifest_bytes.as_slice(), b"{\"layers\":1}\n");
    assert_eq!(objects[1].0.kind, ObjectKind::Directory);

    for (i, (spec, bytes)) in objects[2..].iter().enumerate() {
        let start = i * CHUNK;
        let end = (start + CHUNK).min(image.len());
        assert_eq!(spec.path, format!("vm0/disk0.img-{i:06}.chunk"));
        assert_eq!(spec.size, image.len() as u64, "chunks carry the image size");

        // The digest rides in the configured metadata fields and survives
        // the slot round trip, truncated to the 3x64-bit budget.
        let words = [spec.atime, spec.mtime, spec.ctime];
        let digest = ChunkDigest::compute(DigestAlgo::default(), &image[start..end]);
        assert_eq!(ChunkDigest::unpack_slots(&words).as_slice(), &digest.0[..24]);

        if i == 1 {
            assert!(bytes.is_empty(), "all-zero chunk hands back an empty source");
        } else {
            assert_eq!(bytes.as_slice(), &image[start..end]);
        }
    }
}

#[derive(Clone)]
struct SharedSink(Arc<Mutex<Vec<u8>>>);

impl SharedSink {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }

    fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn chunk_spec(image: &str, index: u64, image_size: u64) -> ObjectSpec {
    ObjectSpec {
        path: format!("{image}-{index:06}.chunk"),
        kind: ObjectKind::RegularFile,
        size: image_size,
        mode: 0o600,
        uid: 0,
        gid: 0,
        atime: 0,
        mtime: 0,
        ctime: 0,
        link_target: None,
    }
}

fn file_spec(name: &str, size: u64) -> ObjectSpec {
    ObjectSpec {
        path: name.to_string(),
        kind: ObjectKind::RegularFile,
        size,
        mode: 0o644,
        uid: 0,
        gid: 0,
        atime: 0,
        mtime: 1_700_000_000,
        ctime: 0,
        link_target: None,
    }
}

fn parse_tar(bytes: &[u8]) -> Vec<(String, Vec<u8>)> {
    let mut archive = tar::Archive::new(bytes);
    let mut out = Vec::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let name = entry.path().unwrap().to_string_lossy().into_owned();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).unwrap();
        out.push((name, data));
    }
    out
}

#[test]
fn restore_reconstructs_image_from_out_of_order_chunks() {
    let image = test_image();
    let image_size = image.len() as u64;
    let sink = SharedSink::new();
    let cancel = Arc::new(AtomicBool::new(false));
    let mut session =
        RestoreSession::start(test_config(), Box::new(sink.clone()), cancel).unwrap();
    let m = NullMessenger;

    // Chunk 0 bootstraps the collector and the assembly thread.
    let mut w = session
        .create_object(&chunk_spec("vm0/disk0.img", 0, image_size), &m)
        .unwrap();
    w.write_all(&image[..CHUNK]).unwrap();
    drop(w);

    // Chunk 2 arrives before chunk 1.
    let mut w = session
        .create_object(&chunk_spec("vm0/disk0.img", 2, image_size), &m)
        .unwrap();
    w.write_all(&image[2 * CHUNK..]).unwrap();
    drop(w);

    // A non-chunk object mid-reconstruction: must land after the image
    // entry, not inside it.
    let mut w = session.create_object(&file_spec("manifest.json", 13), &m).unwrap();
    w.write_all(b"{\"layers\":1}\n").unwrap();
    drop(w);

    // Chunk 1 is all-zero: the host closes the descriptor without writing.
    let w = session
        .create_object(&chunk_spec("vm0/disk0.img", 1, image_size), &m)
        .unwrap();
    drop(w);

    let status = session.end_of_job(&m).unwrap();
    assert_eq!(status, PluginStatus::Done);

    let entries = parse_tar(&sink.contents());
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].0, "vm0/disk0.img");
    assert_eq!(entries[0].1, image, "byte-for-byte reconstruction");
    assert_eq!(entries[1].0, "manifest.json");
    assert_eq!(entries[1].1, b"{\"layers\":1}\n");
}

#[test]
fn restore_streams_into_import_tool() {
    let image = test_image();
    let image_size = image.len() as u64;
    let dir = tempfile::tempdir().unwrap();
    let out_path = dir.path().join("import.tar");

    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(format!("cat > '{}'", out_path.display()));
    let cancel = Arc::new(AtomicBool::new(false));
    let mut session = RestoreSession::start_with_tool(test_config(), command, cancel).unwrap();
    let m = NullMessenger;

    for index in [0u64, 2, 1] {
        let mut w = session
            .create_object(&chunk_spec("vm0/disk0.img", index, image_size), &m)
            .unwrap();
        let start = index as usize * CHUNK;
        let end = (start + CHUNK).min(image.len());
        let slice = &image[start..end];
        if slice.iter().any(|&b| b != 0) {
            w.write_all(slice).unwrap();
        }
        drop(w);
    }

    let status = session.end_of_job(&m).unwrap();
    assert_eq!(status, PluginStatus::Done);

    let entries = parse_tar(&std::fs::read(&out_path).unwrap());
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, "vm0/disk0.img");
    assert_eq!(entries[0].1, image);
}

#[test]
fn stalled_export_tool_is_fatal_not_retried() {
    let mut config = test_config();
    config.queue_timeout_secs = 1;

    let mut command = Command::new("sleep");
    command.arg("30");
    let cancel = Arc::new(AtomicBool::new(false));
    let mut session = BackupSession::start(config, command, Arc::clone(&cancel)).unwrap();

    let err = session.next_object(&NullMessenger).unwrap_err();
    assert!(matches!(err, GantryError::Stalled { .. }), "got: {err}");

    // The host gives up: cancel and tear down.
    cancel.store(true, Ordering::SeqCst);
    let status = session.finish(&NullMessenger).unwrap();
    assert_eq!(status, PluginStatus::Stopped);
}

#[test]
fn cancellation_reports_stopped_not_error() {
    let dir = tempfile::tempdir().unwrap();
    let tar_path = dir.path().join("export.tar");
    std::fs::write(&tar_path, fixture_tar(&test_image())).unwrap();

    let mut command = Command::new("cat");
    command.arg(&tar_path);
    let cancel = Arc::new(AtomicBool::new(true));
    let mut session = BackupSession::start(test_config(), command, cancel).unwrap();

    match session.next_object(&NullMessenger).unwrap() {
        ObjectStep::Stopped => {}
        _ => panic!("expected Stopped"),
    }
    let status = session.finish(&NullMessenger).unwrap();
    assert_eq!(status, PluginStatus::Stopped);
}

#[test]
fn garbage_export_stream_is_an_upstream_failure() {
    let mut command = Command::new("sh");
    command.arg("-c").arg("yes gantry | head -c 4096");
    let cancel = Arc::new(AtomicBool::new(false));
    let mut session = BackupSession::start(test_config(), command, cancel).unwrap();

    let mut saw_error = false;
    for _ in 0..4 {
        match session.next_object(&NullMessenger) {
            Err(GantryError::Upstream(_)) => {
                saw_error = true;
                break;
            }
            Err(e) => panic!("unexpected error: {e}"),
            Ok(ObjectStep::Finished) => break,
            Ok(_) => continue,
        }
    }
    assert!(saw_error, "garbage stream must surface as an upstream failure");
}

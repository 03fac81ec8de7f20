use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::debug;

use crate::collect::{ChunkCollector, CollectorReader};
use crate::config::TransferConfig;
use crate::entry::{parse_chunk_name, Entry, EntryMeta, RegularEntry};
use crate::error::{GantryError, Result};
use crate::host::{HostMessenger, ObjectKind, ObjectSpec, PluginStatus};
use crate::pipe::{self, PipeBridge};
use crate::queue::{entry_queue, EntryRx, EntryTx};
use crate::relay::LogRelay;

use super::{
    reap_tool, spawn_import_tool, spawn_stderr_relay, terminate_tool, wait_with_timeout,
    TOOL_EXIT_TIMEOUT,
};

type SharedStream = Arc<Mutex<tar::Builder<Box<dyn Write + Send>>>>;

/// Restore-direction orchestrator.
///
/// The host replays objects one at a time, possibly interleaving chunks of
/// a disk image with unrelated objects. Chunk objects are routed into a
/// per-image [`ChunkCollector`]; a background assembly thread per image
/// copies the collector's sequential output into the reconstruction stream
/// as one synthetic archive entry. Non-chunk objects go to the stream
/// directly, or onto the deferred queue while a reconstruction holds the
/// stream.
pub struct RestoreSession {
    config: TransferConfig,
    relay: Arc<LogRelay>,
    cancel: Arc<AtomicBool>,
    stream: SharedStream,
    /// Per-image collectors, keyed by image path. Owned here — threads that
    /// need one get a clone of the `Arc`, never a global lookup.
    collectors: HashMap<String, Arc<ChunkCollector>>,
    assemblies_in_flight: Arc<AtomicUsize>,
    deferred_tx: EntryTx,
    deferred_rx: EntryRx,
    drains: Vec<JoinHandle<Result<()>>>,
    assemblies: Vec<JoinHandle<Result<()>>>,
    child: Option<Child>,
    stderr: Option<JoinHandle<()>>,
    cancel_handled: bool,
}

impl RestoreSession {
    /// Start a restore writing the reconstruction stream to `sink`
    /// (typically a destination file).
    pub fn start(
        config: TransferConfig,
        sink: Box<dyn Write + Send>,
        cancel: Arc<AtomicBool>,
    ) -> Result<Self> {
        config.validate()?;
        let (deferred_tx, deferred_rx) = entry_queue(config.queue_depth);
        Ok(Self {
            config,
            relay: Arc::new(LogRelay::new()),
            cancel,
            stream: Arc::new(Mutex::new(tar::Builder::new(sink))),
            collectors: HashMap::new(),
            assemblies_in_flight: Arc::new(AtomicUsize::new(0)),
            deferred_tx,
            deferred_rx,
            drains: Vec::new(),
            assemblies: Vec::new(),
            child: None,
            stderr: None,
            cancel_handled: false,
        })
    }

    /// Start a restore feeding the reconstruction stream into the import
    /// tool's stdin.
    pub fn start_with_tool(
        config: TransferConfig,
        mut command: Command,
        cancel: Arc<AtomicBool>,
    ) -> Result<Self> {
        let mut child = spawn_import_tool(&mut command)?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| GantryError::Other("BUG: import tool stdin not piped".into()))?;
        let stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| GantryError::Other("BUG: import tool stderr not piped".into()))?;
        debug!(pid = child.id(), "import tool started");

        let mut session = Self::start(config, Box::new(stdin), cancel)?;
        session.stderr = Some(spawn_stderr_relay(stderr_pipe, Arc::clone(&session.relay)));
        session.child = Some(child);
        Ok(session)
    }

    /// Serve the host's "create object" call.
    ///
    /// Returns the write end of a pipe the host pushes the object's bytes
    /// into; a short-lived drain thread on the other end routes them. Must
    /// be called from the orchestration thread.
    pub fn create_object(
        &mut self,
        spec: &ObjectSpec,
        messenger: &dyn HostMessenger,
    ) -> Result<File> {
        self.relay.flush(messenger, PluginStatus::More)?;
        if self.cancel.load(Ordering::Relaxed) {
            self.handle_cancel();
            return Err(GantryError::Interrupted);
        }

        match parse_chunk_name(&spec.path) {
            Some((image, index)) => {
                let image = image.to_string();
                self.create_chunk_writer(spec, image, index)
            }
            None => self.create_regular_writer(spec),
        }
    }

    /// End of job: everything has been replayed and all object descriptors
    /// closed. Joins worker threads, drains deferred objects into the
    /// stream, finishes the archive, and reaps the import tool.
    pub fn end_of_job(mut self, messenger: &dyn HostMessenger) -> Result<PluginStatus> {
        if self.cancel.load(Ordering::Relaxed) {
            self.handle_cancel();
        }
        let cancelled = self.cancel_handled;

        // Host writes are done: every drain thread finishes once it sees
        // EOF. Keep draining the deferred queue while they wind down so a
        // pusher blocked on a full queue cannot deadlock the join.
        let mut deferred_entries: Vec<Entry> = Vec::new();
        loop {
            while let Some(entry) = self.deferred_rx.try_pop() {
                deferred_entries.push(entry);
            }
            if self.drains.iter().all(|h| h.is_finished()) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        while let Some(entry) = self.deferred_rx.try_pop() {
            deferred_entries.push(entry);
        }

        let mut first_err: Option<GantryError> = None;
        for handle in self.drains.drain(..) {
            let outcome = handle
                .join()
                .unwrap_or_else(|_| Err(GantryError::Other("restore drain thread panicked".into())));
            if let Err(e) = outcome {
                first_err.get_or_insert(e);
            }
        }

        // A failed drain means some chunk will never arrive; unblock the
        // assemblies so they can report instead of waiting forever.
        if first_err.is_some() {
            for collector in self.collectors.values() {
                collector.abort("image reconstruction aborted");
            }
        }
        for handle in self.assemblies.drain(..) {
            let outcome = handle
                .join()
                .unwrap_or_else(|_| Err(GantryError::Other("assembly thread panicked".into())));
            if let Err(e) = outcome {
                first_err.get_or_insert(e);
            }
        }

        let RestoreSession {
            relay,
            stream,
            collectors,
            deferred_tx,
            deferred_rx,
            mut child,
            stderr,
            ..
        } = self;
        drop(deferred_tx);
        drop(deferred_rx);
        drop(collectors);

        // Deferred non-chunk objects, in arrival order, after every image.
        let mut drain_err: Option<GantryError> = None;
        for entry in deferred_entries {
            match entry {
                Entry::Regular(regular) => {
                    let mut guard = stream.lock().unwrap();
                    if let Err(e) = append_regular_entry(&mut guard, &regular) {
                        drain_err = Some(e);
                        break;
                    }
                }
                Entry::Error(msg) => {
                    drain_err = Some(GantryError::Upstream(msg));
                    break;
                }
                Entry::Chunk(_) => {
                    drain_err = Some(GantryError::Other(
                        "BUG: chunk entry on the deferred queue".into(),
                    ));
                    break;
                }
            }
        }

        // Terminate the archive; dropping the builder closes the sink so
        // the import tool sees EOF on stdin.
        {
            let mut guard = stream.lock().unwrap();
            if let Err(e) = guard.finish() {
                if drain_err.is_none() {
                    drain_err = Some(e.into());
                }
            }
        }
        drop(stream);

        if let Some(handle) = stderr {
            let _ = handle.join();
        }
        let reap = match &mut child {
            Some(c) if !cancelled => reap_tool(c, TOOL_EXIT_TIMEOUT),
            Some(c) => {
                let _ = wait_with_timeout(c, TOOL_EXIT_TIMEOUT);
                Ok(())
            }
            None => Ok(()),
        };

        let default = if cancelled {
            PluginStatus::Stopped
        } else {
            PluginStatus::Done
        };
        let status = relay.flush(messenger, default)?;
        if !cancelled {
            if let Some(e) = first_err.or(drain_err) {
                return Err(e);
            }
            reap?;
        }
        Ok(status)
    }

    fn create_chunk_writer(
        &mut self,
        spec: &ObjectSpec,
        image: String,
        index: u64,
    ) -> Result<File> {
        if index == 0 && !self.collectors.contains_key(&image) {
            // First chunk of a new image bootstraps the collector and its
            // assembly thread. spec.size is the whole image's size.
            let collector = Arc::new(ChunkCollector::new(
                spec.size,
                self.config.chunk_size,
                self.config.max_ram_chunks,
                self.config.spill_dir.clone(),
            ));
            self.collectors.insert(image.clone(), Arc::clone(&collector));
            self.spawn_assembly(image.clone(), spec.size, collector);
        }
        let collector = self.collectors.get(&image).cloned().ok_or_else(|| {
            GantryError::InvalidChunk(format!("chunk {index} for untracked image '{image}'"))
        })?;

        let mut bridge = PipeBridge::open()?;
        let reader = bridge.take_reader()?;
        let writer = bridge.take_writer()?;
        self.drains.push(std::thread::spawn(move || {
            // An empty object body is the all-zero marker.
            let bytes = pipe::drain(reader)?;
            collector.add(index, bytes)
        }));
        Ok(writer)
    }

    fn create_regular_writer(&mut self, spec: &ObjectSpec) -> Result<File> {
        let name = spec.path.clone();
        let meta = EntryMeta {
            kind: spec.kind,
            size: spec.size,
            mode: spec.mode,
            uid: spec.uid,
            gid: spec.gid,
            mtime: spec.mtime,
            link_target: spec.link_target.clone(),
        };

        let mut bridge = PipeBridge::open()?;
        let reader = bridge.take_reader()?;
        let writer = bridge.take_writer()?;
        let stream = Arc::clone(&self.stream);
        let in_flight = Arc::clone(&self.assemblies_in_flight);
        let deferred = self.deferred_tx.clone();
        self.drains.push(std::thread::spawn(move || {
            let bytes = pipe::drain(reader)?;
            let data = if bytes.is_empty() { None } else { Some(bytes) };
            let entry = RegularEntry { name, data, meta };
            if in_flight.load(Ordering::SeqCst) > 0 {
                // An image reconstruction holds the stream; preserve its
                // contiguity by deferring this object to end-of-job.
                deferred.push(Entry::Regular(entry))
            } else {
                let mut guard = stream.lock().unwrap();
                append_regular_entry(&mut guard, &entry)
            }
        }));
        Ok(writer)
    }

    fn spawn_assembly(&mut self, image: String, image_size: u64, collector: Arc<ChunkCollector>) {
        let stream = Arc::clone(&self.stream);
        let in_flight = Arc::clone(&self.assemblies_in_flight);
        in_flight.fetch_add(1, Ordering::SeqCst);
        debug!(image = %image, size = image_size, "starting image reconstruction");
        self.assemblies.push(std::thread::spawn(move || {
            let result = write_image_entry(&stream, &image, image_size, collector);
            in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }));
    }

    /// One-time cancellation cleanup: stop the tool, poison the collectors,
    /// and mark the deferred queue. Partially written destination state is
    /// not rolled back — that cleanup belongs to the caller.
    fn handle_cancel(&mut self) {
        if self.cancel_handled {
            return;
        }
        self.cancel_handled = true;
        debug!("restore cancelled, terminating import tool");
        if let Some(child) = &mut self.child {
            terminate_tool(child, TOOL_EXIT_TIMEOUT);
        }
        for collector in self.collectors.values() {
            collector.abort("restore cancelled");
        }
        let _ = self.deferred_tx.try_push(Entry::Error("restore cancelled".into()));
    }
}

/// Copy the whole image out of the collector into the stream as one
/// synthetic archive entry. Holds the stream lock for the whole copy: the
/// entry must be contiguous in the archive, so concurrent non-chunk
/// objects wait or take the deferred queue.
fn write_image_entry(
    stream: &SharedStream,
    image: &str,
    image_size: u64,
    collector: Arc<ChunkCollector>,
) -> Result<()> {
    let mut guard = stream.lock().unwrap();
    let mut header = tar::Header::new_gnu();
    header.set_size(image_size);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_entry_type(tar::EntryType::Regular);
    let reader = CollectorReader::new(collector, image_size);
    guard.append_data(&mut header, image, reader)?;
    debug!(image = %image, "image reconstruction complete");
    Ok(())
}

fn append_regular_entry(
    builder: &mut tar::Builder<Box<dyn Write + Send>>,
    entry: &RegularEntry,
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_mode(entry.meta.mode);
    header.set_uid(entry.meta.uid as u64);
    header.set_gid(entry.meta.gid as u64);
    header.set_mtime(entry.meta.mtime.max(0) as u64);
    match entry.meta.kind {
        ObjectKind::Directory => {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            builder.append_data(&mut header, &entry.name, std::io::empty())?;
        }
        ObjectKind::Symlink => {
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            let target = entry.meta.link_target.as_deref().unwrap_or("");
            builder.append_link(&mut header, &entry.name, target)?;
        }
        ObjectKind::RegularFile => {
            header.set_entry_type(tar::EntryType::Regular);
            let data = entry.data.as_deref().unwrap_or(&[]);
            header.set_size(data.len() as u64);
            builder.append_data(&mut header, &entry.name, data)?;
        }
    }
    Ok(())
}

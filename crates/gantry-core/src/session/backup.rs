use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::debug;

use crate::config::TransferConfig;
use crate::entry::Entry;
use crate::error::{GantryError, Result};
use crate::host::{HostMessenger, ObjectKind, ObjectSource, ObjectSpec, PluginStatus};
use crate::pipe::{self, PipeBridge};
use crate::queue::{entry_queue, EntryRx};
use crate::relay::LogRelay;
use crate::split::split_archive;

use super::{
    reap_tool, spawn_export_tool, spawn_stderr_relay, terminate_tool, wait_with_timeout,
    TOOL_EXIT_TIMEOUT,
};

/// One step of the host's "describe next object" loop.
#[derive(Debug)]
pub enum ObjectStep {
    /// Hand this object to the host; more may follow.
    Object {
        spec: ObjectSpec,
        source: ObjectSource,
    },
    /// Every entry has been delivered.
    Finished,
    /// Cancellation observed; call [`BackupSession::finish`].
    Stopped,
}

/// Backup-direction orchestrator.
///
/// Owns the export tool subprocess, the stream-reader thread feeding the
/// entry queue through the splitter, the stderr-relay thread, and at most
/// one in-flight feeder thread for the object the host is currently
/// reading. All host-facing calls happen on the thread that calls
/// [`next_object`].
///
/// [`next_object`]: BackupSession::next_object
pub struct BackupSession {
    config: TransferConfig,
    relay: Arc<LogRelay>,
    cancel: Arc<AtomicBool>,
    rx: EntryRx,
    child: Child,
    reader: Option<JoinHandle<()>>,
    stderr: Option<JoinHandle<()>>,
    feeder: Option<JoinHandle<Result<()>>>,
}

impl BackupSession {
    /// Spawn the export tool and the reader threads.
    pub fn start(
        config: TransferConfig,
        mut command: Command,
        cancel: Arc<AtomicBool>,
    ) -> Result<Self> {
        config.validate()?;
        let mut child = spawn_export_tool(&mut command)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GantryError::Other("BUG: export tool stdout not piped".into()))?;
        let stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| GantryError::Other("BUG: export tool stderr not piped".into()))?;

        let (tx, rx) = entry_queue(config.queue_depth);
        let relay = Arc::new(LogRelay::new());

        let split_config = config.clone();
        let reader = std::thread::spawn(move || split_archive(stdout, &split_config, &tx));
        let stderr = spawn_stderr_relay(stderr_pipe, Arc::clone(&relay));
        debug!(pid = child.id(), "export tool started");

        Ok(Self {
            config,
            relay,
            cancel,
            rx,
            child,
            reader: Some(reader),
            stderr: Some(stderr),
            feeder: None,
        })
    }

    /// Serve the host's next per-object request.
    ///
    /// Pops one entry from the bounded queue (a timeout means the upstream
    /// stalled, which is fatal, not retried) and translates it into the
    /// host's descriptor plus a byte source. Must be called from the
    /// orchestration thread; staged relay messages are forwarded here.
    pub fn next_object(&mut self, messenger: &dyn HostMessenger) -> Result<ObjectStep> {
        self.relay.flush(messenger, PluginStatus::More)?;
        // The host has finished reading the previous object by the time it
        // asks for the next one, so the previous feeder is done.
        self.join_feeder()?;

        if self.cancel.load(Ordering::Relaxed) {
            return Ok(ObjectStep::Stopped);
        }

        match self.rx.pop(self.config.queue_timeout())? {
            None => Ok(ObjectStep::Finished),
            Some(Entry::Error(msg)) => Err(GantryError::Upstream(msg)),
            Some(Entry::Chunk(chunk)) => {
                let mut spec = ObjectSpec {
                    path: chunk.name,
                    kind: ObjectKind::RegularFile,
                    // The whole image's size on every chunk: the restore
                    // side needs the aggregate before any chunk arrives.
                    size: chunk.image_size,
                    mode: 0o600,
                    uid: 0,
                    gid: 0,
                    atime: 0,
                    mtime: 0,
                    ctime: 0,
                    link_target: None,
                };
                let words = chunk
                    .digest
                    .pack_into_slots(self.config.digest_fields.len());
                spec.apply_digest_slots(&self.config.digest_fields, &words);

                let source = if chunk.data.is_empty() {
                    ObjectSource::Empty
                } else {
                    self.pipe_source(chunk.data)?
                };
                Ok(ObjectStep::Object { spec, source })
            }
            Some(Entry::Regular(regular)) => {
                let spec = ObjectSpec {
                    path: regular.name,
                    kind: regular.meta.kind,
                    size: regular.meta.size,
                    mode: regular.meta.mode,
                    uid: regular.meta.uid,
                    gid: regular.meta.gid,
                    atime: regular.meta.mtime,
                    mtime: regular.meta.mtime,
                    ctime: regular.meta.mtime,
                    link_target: regular.meta.link_target,
                };
                let source = match regular.data {
                    Some(data) if !data.is_empty() => self.pipe_source(data)?,
                    _ => ObjectSource::Empty,
                };
                Ok(ObjectStep::Object { spec, source })
            }
        }
    }

    /// Join threads, reap the tool, flush remaining messages, and report the
    /// final status. On cancellation the tool is terminated and the result
    /// is `Stopped`, not an error.
    pub fn finish(self, messenger: &dyn HostMessenger) -> Result<PluginStatus> {
        let BackupSession {
            config: _,
            relay,
            cancel,
            rx,
            mut child,
            reader,
            stderr,
            feeder,
        } = self;

        let cancelled = cancel.load(Ordering::Relaxed);
        if cancelled {
            terminate_tool(&mut child, TOOL_EXIT_TIMEOUT);
        }

        // Dropping the receiver unblocks a splitter stuck pushing into a
        // full queue; it observes the closed channel and stops.
        drop(rx);
        if let Some(handle) = feeder {
            match handle.join() {
                Ok(result) => {
                    if !cancelled {
                        result?;
                    }
                }
                Err(_) => return Err(GantryError::Other("feeder thread panicked".into())),
            }
        }
        if let Some(handle) = reader {
            let _ = handle.join();
        }
        if let Some(handle) = stderr {
            let _ = handle.join();
        }

        let reap = if cancelled {
            let _ = wait_with_timeout(&mut child, TOOL_EXIT_TIMEOUT);
            Ok(())
        } else {
            reap_tool(&mut child, TOOL_EXIT_TIMEOUT)
        };

        let default = if cancelled {
            PluginStatus::Stopped
        } else {
            PluginStatus::Done
        };
        let status = relay.flush(messenger, default)?;
        reap?;
        Ok(status)
    }

    fn join_feeder(&mut self) -> Result<()> {
        if let Some(handle) = self.feeder.take() {
            handle
                .join()
                .map_err(|_| GantryError::Other("feeder thread panicked".into()))??;
        }
        Ok(())
    }

    fn pipe_source(&mut self, data: Vec<u8>) -> Result<ObjectSource> {
        let mut bridge = PipeBridge::open()?;
        let reader = bridge.take_reader()?;
        let writer = bridge.take_writer()?;
        self.feeder = Some(pipe::spawn_feeder(writer, data, bridge.capacity()));
        Ok(ObjectSource::Pipe(reader))
    }
}

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::error::{GantryError, Result};
use crate::host::{HostMessenger, MessageLevel, PluginStatus};

/// Thread-safe mailbox for diagnostics produced on worker threads.
///
/// The host engine's job-message call must only be invoked from the one
/// thread the host calls into, so worker threads stage lines here with
/// [`put`] and the orchestration thread forwards them with [`flush`].
///
/// [`put`]: LogRelay::put
/// [`flush`]: LogRelay::flush
pub struct LogRelay {
    mailbox: Mutex<VecDeque<(MessageLevel, String)>>,
}

impl LogRelay {
    pub fn new() -> Self {
        Self {
            mailbox: Mutex::new(VecDeque::new()),
        }
    }

    /// Classify and enqueue one raw diagnostic line. Callable from any thread.
    pub fn put(&self, line: &str) {
        let level = classify(line);
        let mut mailbox = self.mailbox.lock().unwrap();
        mailbox.push_back((level, line.to_string()));
    }

    /// Drain the mailbox in insertion order, forwarding each message to the
    /// host. Returns `default` when no fatal entry was seen, otherwise an
    /// `Upstream` error carrying the first fatal line.
    ///
    /// Only the orchestration thread may call this — it is the only thread
    /// allowed to call back into the host engine.
    pub fn flush(
        &self,
        messenger: &dyn HostMessenger,
        default: PluginStatus,
    ) -> Result<PluginStatus> {
        let drained: Vec<(MessageLevel, String)> = {
            let mut mailbox = self.mailbox.lock().unwrap();
            mailbox.drain(..).collect()
        };
        let mut first_fatal: Option<String> = None;
        for (level, line) in drained {
            messenger.job_message(level, &line);
            if level == MessageLevel::Fatal && first_fatal.is_none() {
                first_fatal = Some(line);
            }
        }
        match first_fatal {
            Some(line) => Err(GantryError::Upstream(line)),
            None => Ok(default),
        }
    }
}

impl Default for LogRelay {
    fn default() -> Self {
        Self::new()
    }
}

fn classify(line: &str) -> MessageLevel {
    let trimmed = line.trim_start();
    if has_prefix_ignore_case(trimmed, "error") {
        MessageLevel::Fatal
    } else if has_prefix_ignore_case(trimmed, "warn") {
        MessageLevel::Warning
    } else {
        MessageLevel::Info
    }
}

fn has_prefix_ignore_case(line: &str, prefix: &str) -> bool {
    line.get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

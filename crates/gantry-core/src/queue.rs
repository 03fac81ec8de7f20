use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::entry::Entry;
use crate::error::{GantryError, Result};

/// Create the bounded entry queue between stream producers and the
/// orchestration thread.
///
/// The producer blocks on [`EntryTx::push`] while the queue is full
/// (backpressure); the consumer blocks on [`EntryRx::pop`] up to a timeout
/// that turns a stalled upstream into a hard failure.
pub fn entry_queue(depth: usize) -> (EntryTx, EntryRx) {
    let (tx, rx) = bounded(depth);
    (EntryTx { tx }, EntryRx { rx })
}

#[derive(Clone)]
pub struct EntryTx {
    tx: Sender<Entry>,
}

impl EntryTx {
    /// Push one entry, blocking while the queue is full. Fails only when the
    /// consumer side is gone, which producers treat as "stop quietly".
    pub fn push(&self, entry: Entry) -> Result<()> {
        self.tx
            .send(entry)
            .map_err(|_| GantryError::Other("entry queue consumer is gone".into()))
    }

    /// Non-blocking push for cancellation paths that must not wait on a
    /// full queue. Returns whether the entry was accepted.
    pub fn try_push(&self, entry: Entry) -> bool {
        self.tx.try_send(entry).is_ok()
    }
}

pub struct EntryRx {
    rx: Receiver<Entry>,
}

impl EntryRx {
    /// Pop the next entry. `Ok(None)` means every producer finished and the
    /// queue is drained; a timeout means the upstream stalled and is fatal,
    /// not retried.
    pub fn pop(&self, timeout: Duration) -> Result<Option<Entry>> {
        match self.rx.recv_timeout(timeout) {
            Ok(entry) => Ok(Some(entry)),
            Err(RecvTimeoutError::Timeout) => Err(GantryError::Stalled {
                seconds: timeout.as_secs(),
            }),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }

    /// Non-blocking pop for draining a queue whose producers are done.
    pub fn try_pop(&self) -> Option<Entry> {
        self.rx.try_recv().ok()
    }
}

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};

use tracing::debug;

use crate::error::{GantryError, Result};

/// Concurrent, capacity-bounded, two-tier out-of-order chunk buffer.
///
/// Producers call [`add`] with chunks in any order; a single consumer calls
/// [`read`] and receives the image as a strictly sequential byte stream. RAM
/// holds at most `max_ram_chunks` chunks; everything else spills to
/// anonymous temp files. The consumer always needs the smallest outstanding
/// index next, so RAM preferentially holds the smallest indices seen so far
/// and the eviction candidate is the largest RAM-resident index.
///
/// `read` never returns short and has no end-of-stream signal: callers
/// request exactly the bytes they need, and own any stall timeout — the
/// collector cannot distinguish a slow producer from a dead one.
///
/// [`add`]: ChunkCollector::add
/// [`read`]: ChunkCollector::read
pub struct ChunkCollector {
    state: Mutex<CollectorState>,
    progress: Condvar,
    image_size: u64,
    chunk_size: usize,
    max_ram_chunks: usize,
    spill_dir: Option<PathBuf>,
}

struct CollectorState {
    /// RAM tier: index -> chunk bytes.
    ram: HashMap<u64, Vec<u8>>,
    /// Max-heap over RAM-resident indices; the top is the eviction
    /// candidate. May hold stale entries for indices consumed out of the
    /// middle — cleaned lazily by `ram_largest`.
    ram_heap: BinaryHeap<u64>,
    /// Disk tier: index -> spill file handle (anonymous, deleted on close).
    disk: HashMap<u64, File>,
    /// Min-heap over disk-resident indices; the top is the next promotion
    /// candidate. Entries only leave via promotion of the top, so no lazy
    /// cleanup is needed.
    disk_heap: BinaryHeap<Reverse<u64>>,
    /// Indices known to be logical zero-fill. No capacity consumed.
    zero: HashSet<u64>,
    /// The next index the consumer requires. Only ever advances.
    next_index: u64,
    /// Leftover bytes from a previous materialization, served before any
    /// new chunk is consumed.
    staging: Vec<u8>,
    cursor: usize,
    /// High-water mark of RAM-resident chunks, for the bounded-memory
    /// invariant.
    peak_ram: usize,
    /// Set by `abort`: wakes and fails all current and future reads.
    failed: Option<String>,
}

impl ChunkCollector {
    pub fn new(
        image_size: u64,
        chunk_size: usize,
        max_ram_chunks: usize,
        spill_dir: Option<PathBuf>,
    ) -> Self {
        debug_assert!(chunk_size > 0, "chunk_size must be non-zero");
        debug_assert!(max_ram_chunks > 0, "max_ram_chunks must be non-zero");
        Self {
            state: Mutex::new(CollectorState {
                ram: HashMap::new(),
                ram_heap: BinaryHeap::new(),
                disk: HashMap::new(),
                disk_heap: BinaryHeap::new(),
                zero: HashSet::new(),
                next_index: 0,
                staging: Vec::new(),
                cursor: 0,
                peak_ram: 0,
                failed: None,
            }),
            progress: Condvar::new(),
            image_size,
            chunk_size,
            max_ram_chunks,
            spill_dir,
        }
    }

    /// Number of chunks the image splits into.
    pub fn chunk_count(&self) -> u64 {
        self.image_size.div_ceil(self.chunk_size as u64)
    }

    /// Byte length of chunk `index`: `chunk_size` for all but a short final
    /// chunk, whose length is `image_size mod chunk_size`.
    pub fn chunk_len(&self, index: u64) -> usize {
        let start = index * self.chunk_size as u64;
        (self.image_size - start).min(self.chunk_size as u64) as usize
    }

    /// Insert one chunk. Empty `data` marks the index as logical zero-fill.
    ///
    /// Wakes a blocked reader when the chunk it is waiting on arrives.
    pub fn add(&self, index: u64, data: Vec<u8>) -> Result<()> {
        if index >= self.chunk_count() {
            return Err(GantryError::InvalidChunk(format!(
                "chunk index {index} out of range for {} byte image",
                self.image_size
            )));
        }
        if !data.is_empty() && data.len() != self.chunk_len(index) {
            return Err(GantryError::InvalidChunk(format!(
                "chunk {index} carries {} bytes, expected {}",
                data.len(),
                self.chunk_len(index)
            )));
        }

        let mut st = self.state.lock().unwrap();
        if let Some(msg) = &st.failed {
            return Err(GantryError::Upstream(msg.clone()));
        }
        if index < st.next_index
            || st.zero.contains(&index)
            || st.ram.contains_key(&index)
            || st.disk.contains_key(&index)
        {
            return Err(GantryError::InvalidChunk(format!(
                "chunk {index} delivered twice"
            )));
        }

        let awaited = index == st.next_index;
        self.insert(&mut st, index, data)?;
        if awaited {
            self.progress.notify_all();
        }
        Ok(())
    }

    /// Read exactly `n` bytes of the sequential image stream, blocking until
    /// enough chunks have arrived.
    pub fn read(&self, n: usize) -> Result<Vec<u8>> {
        let mut st = self.state.lock().unwrap();

        // Fast path: the staging buffer already holds enough unread bytes.
        if st.staging.len() - st.cursor >= n {
            let start = st.cursor;
            st.cursor += n;
            return Ok(st.staging[start..start + n].to_vec());
        }

        let mut out = Vec::with_capacity(n);
        let cursor = st.cursor;
        out.extend_from_slice(&st.staging[cursor..]);
        st.staging.clear();
        st.cursor = 0;

        while out.len() < n {
            if st.next_index >= self.chunk_count() {
                return Err(GantryError::Other(format!(
                    "read past end of {} byte image",
                    self.image_size
                )));
            }
            while !Self::is_ready(&st) {
                if let Some(msg) = &st.failed {
                    return Err(GantryError::Upstream(msg.clone()));
                }
                st = self.progress.wait(st).unwrap();
            }
            if let Some(msg) = &st.failed {
                return Err(GantryError::Upstream(msg.clone()));
            }

            let index = st.next_index;
            let len = self.chunk_len(index);
            if st.zero.remove(&index) {
                // Logical zero-fill: no tier entry ever existed.
                out.resize(out.len() + len, 0);
            } else {
                let data = st
                    .ram
                    .remove(&index)
                    .ok_or_else(|| GantryError::Other("BUG: ready chunk missing from RAM".into()))?;
                out.extend_from_slice(&data);
                self.rebalance(&mut st)?;
            }
            st.next_index += 1;
        }

        // Keep any excess as the new staging buffer.
        if out.len() > n {
            st.staging = out.split_off(n);
        }
        Ok(out)
    }

    /// Poison the collector: blocked and future `read`/`add` calls fail.
    /// Used for cancellation and upstream failure; there is no partial
    /// output to roll back here, spill files die with their handles.
    pub fn abort(&self, message: &str) {
        let mut st = self.state.lock().unwrap();
        if st.failed.is_none() {
            st.failed = Some(message.to_string());
        }
        self.progress.notify_all();
    }

    /// High-water mark of RAM-resident chunks.
    pub fn peak_ram_chunks(&self) -> usize {
        self.state.lock().unwrap().peak_ram
    }

    /// The next index the consumer requires (monotonically non-decreasing).
    pub fn next_index(&self) -> u64 {
        self.state.lock().unwrap().next_index
    }

    fn is_ready(st: &CollectorState) -> bool {
        st.zero.contains(&st.next_index) || st.ram.contains_key(&st.next_index)
    }

    /// Tier placement. Eviction re-enters the same logic via an explicit
    /// pending list rather than recursion, so eviction and direct-to-disk
    /// insertion share the one spill path.
    fn insert(&self, st: &mut CollectorState, index: u64, data: Vec<u8>) -> Result<()> {
        let mut pending = vec![(index, data, false)];
        while let Some((idx, bytes, spill_only)) = pending.pop() {
            if bytes.is_empty() {
                st.zero.insert(idx);
                continue;
            }
            if !spill_only {
                if st.ram.len() < self.max_ram_chunks {
                    st.ram.insert(idx, bytes);
                    st.ram_heap.push(idx);
                    st.peak_ram = st.peak_ram.max(st.ram.len());
                    continue;
                }
                if let Some(largest) = Self::ram_largest(st) {
                    if idx < largest {
                        // This chunk is needed sooner than the current RAM
                        // maximum: push that one out and take its slot.
                        let evicted = st.ram.remove(&largest).ok_or_else(|| {
                            GantryError::Other("BUG: ram heap out of sync".into())
                        })?;
                        st.ram_heap.pop();
                        debug!(evicted = largest, inserted = idx, "evicting chunk to disk");
                        pending.push((largest, evicted, true));
                        pending.push((idx, bytes, false));
                        continue;
                    }
                }
            }
            self.spill(st, idx, bytes)?;
        }
        Ok(())
    }

    /// After a RAM chunk was consumed, pull the smallest disk-resident index
    /// back through the insert path to keep near-term data warm, and drop
    /// (thereby delete) its spill handle.
    fn rebalance(&self, st: &mut CollectorState) -> Result<()> {
        if st.ram.len() >= self.max_ram_chunks {
            return Ok(());
        }
        let Some(&Reverse(index)) = st.disk_heap.peek() else {
            return Ok(());
        };
        st.disk_heap.pop();
        let mut file = st
            .disk
            .remove(&index)
            .ok_or_else(|| GantryError::Other("BUG: disk heap out of sync".into()))?;
        file.seek(SeekFrom::Start(0))?;
        let mut bytes = Vec::with_capacity(self.chunk_len(index));
        file.read_to_end(&mut bytes)?;
        drop(file);
        self.insert(st, index, bytes)
    }

    fn spill(&self, st: &mut CollectorState, index: u64, bytes: Vec<u8>) -> Result<()> {
        let mut file = match &self.spill_dir {
            Some(dir) => tempfile::tempfile_in(dir)?,
            None => tempfile::tempfile()?,
        };
        file.write_all(&bytes)?;
        st.disk.insert(index, file);
        st.disk_heap.push(Reverse(index));
        Ok(())
    }

    /// Largest RAM-resident index, discarding heap entries left stale by
    /// consumption out of the middle.
    fn ram_largest(st: &mut CollectorState) -> Option<u64> {
        while let Some(&top) = st.ram_heap.peek() {
            if st.ram.contains_key(&top) {
                return Some(top);
            }
            st.ram_heap.pop();
        }
        None
    }

    #[cfg(test)]
    fn ram_indices(&self) -> Vec<u64> {
        let st = self.state.lock().unwrap();
        let mut v: Vec<u64> = st.ram.keys().copied().collect();
        v.sort_unstable();
        v
    }

    #[cfg(test)]
    fn disk_indices(&self) -> Vec<u64> {
        let st = self.state.lock().unwrap();
        let mut v: Vec<u64> = st.disk.keys().copied().collect();
        v.sort_unstable();
        v
    }

    #[cfg(test)]
    fn tier_entry_count(&self) -> usize {
        let st = self.state.lock().unwrap();
        st.ram.len() + st.disk.len()
    }
}

/// Adapter serving a collector as a bounded sequential byte source, for
/// handing to archive writers that pull from an `io::Read`.
pub struct CollectorReader {
    collector: Arc<ChunkCollector>,
    remaining: u64,
}

impl CollectorReader {
    pub fn new(collector: Arc<ChunkCollector>, total: u64) -> Self {
        Self {
            collector,
            remaining: total,
        }
    }
}

impl Read for CollectorReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let want = (buf.len() as u64).min(self.remaining) as usize;
        if want == 0 {
            return Ok(0);
        }
        let bytes = self
            .collector
            .read(want)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        buf[..want].copy_from_slice(&bytes);
        self.remaining -= want as u64;
        Ok(want)
    }
}

use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::thread::JoinHandle;

use crate::error::{GantryError, Result};

/// Pipe capacity assumed when the kernel won't tell us (the POSIX default).
const FALLBACK_CAPACITY: usize = 64 * 1024;

/// An OS pipe bridging in-memory byte buffers to the host engine's
/// file-descriptor I/O contract.
///
/// The host pulls backup data by reading a descriptor it owns, and pushes
/// restore data by writing one — it never accepts an in-memory buffer. So
/// each transferred object gets a pipe, with a short-lived thread on the
/// engine's side of it.
pub struct PipeBridge {
    read: Option<File>,
    write: Option<File>,
    capacity: usize,
}

impl PipeBridge {
    /// Open a pipe and grow its kernel buffer toward the OS maximum.
    pub fn open() -> Result<Self> {
        let (read, write) = raw_pipe()?;
        let capacity = tune_capacity(&write);
        Ok(Self {
            read: Some(read),
            write: Some(write),
            capacity,
        })
    }

    /// Kernel buffer capacity of this pipe, in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Hand out the read end (the host's side during backup).
    pub fn take_reader(&mut self) -> Result<File> {
        self.read
            .take()
            .ok_or_else(|| GantryError::Other("pipe read end already taken".into()))
    }

    /// Hand out the write end (the host's side during restore).
    pub fn take_writer(&mut self) -> Result<File> {
        self.write
            .take()
            .ok_or_else(|| GantryError::Other("pipe write end already taken".into()))
    }
}

/// Write all of `data` in capacity-sized slices, then close the write end so
/// the reader sees EOF.
pub fn write_all(mut writer: File, data: &[u8], capacity: usize) -> Result<()> {
    let step = capacity.max(1);
    for slice in data.chunks(step) {
        writer.write_all(slice)?;
    }
    // Dropping the handle closes the descriptor and delivers EOF.
    drop(writer);
    Ok(())
}

/// Spawn the feeder thread: write everything, close, exit.
pub fn spawn_feeder(writer: File, data: Vec<u8>, capacity: usize) -> JoinHandle<Result<()>> {
    std::thread::spawn(move || write_all(writer, &data, capacity))
}

/// Bulk-read the read end until EOF, consuming (and closing) it.
pub fn drain(mut reader: File) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf)?;
    Ok(buf)
}

fn raw_pipe() -> Result<(File, File)> {
    let mut fds = [0 as libc::c_int; 2];

    #[cfg(target_os = "linux")]
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    #[cfg(not(target_os = "linux"))]
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };

    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    // Safety: both descriptors are freshly created and owned here.
    let (read, write) = unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) };

    #[cfg(not(target_os = "linux"))]
    for end in [&read, &write] {
        unsafe {
            libc::fcntl(end.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC);
        }
    }

    Ok((read, write))
}

/// Grow the pipe buffer to the system maximum and report what we got.
fn tune_capacity(write: &File) -> usize {
    #[cfg(target_os = "linux")]
    {
        let want = std::fs::read_to_string("/proc/sys/fs/pipe-max-size")
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .unwrap_or(1024 * 1024);
        unsafe {
            libc::fcntl(write.as_raw_fd(), libc::F_SETPIPE_SZ, want as libc::c_int);
        }
        let got = unsafe { libc::fcntl(write.as_raw_fd(), libc::F_GETPIPE_SZ) };
        if got > 0 {
            return got as usize;
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = write;

    FALLBACK_CAPACITY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_reports_capacity() {
        let bridge = PipeBridge::open().unwrap();
        assert!(bridge.capacity() > 0);
    }

    #[test]
    fn feeder_round_trip() {
        let mut bridge = PipeBridge::open().unwrap();
        let capacity = bridge.capacity();
        let reader = bridge.take_reader().unwrap();
        let writer = bridge.take_writer().unwrap();

        // Larger than one pipe buffer so the feeder must block mid-write.
        let data: Vec<u8> = (0..capacity * 2 + 17).map(|i| (i % 251) as u8).collect();
        let feeder = spawn_feeder(writer, data.clone(), capacity);

        let out = drain(reader).unwrap();
        feeder.join().unwrap().unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn closing_write_end_signals_eof() {
        let mut bridge = PipeBridge::open().unwrap();
        let reader = bridge.take_reader().unwrap();
        let writer = bridge.take_writer().unwrap();
        drop(writer);
        assert!(drain(reader).unwrap().is_empty());
    }

    #[test]
    fn ends_can_only_be_taken_once() {
        let mut bridge = PipeBridge::open().unwrap();
        bridge.take_reader().unwrap();
        assert!(bridge.take_reader().is_err());
    }
}

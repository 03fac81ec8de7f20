use std::io::Read;

use tar::EntryType;
use tracing::debug;

use gantry_types::ChunkDigest;

use crate::config::TransferConfig;
use crate::entry::{format_chunk_name, ChunkEntry, Entry, EntryMeta, RegularEntry};
use crate::error::Result;
use crate::host::ObjectKind;
use crate::queue::EntryTx;

/// Read the export tool's archive stream sequentially, slicing chunkable
/// disk images into fixed-size addressable chunks and passing everything
/// else through unmodified.
///
/// Runs on the stream-reader thread. All failures surface as a single
/// `Entry::Error` on the queue; if the queue is already closed the consumer
/// has failed or been cancelled, and the error push is a silent no-op.
pub fn split_archive<R: Read>(reader: R, config: &TransferConfig, tx: &EntryTx) {
    if let Err(e) = split_inner(reader, config, tx) {
        let _ = tx.push(Entry::Error(e.to_string()));
    }
}

fn split_inner<R: Read>(reader: R, config: &TransferConfig, tx: &EntryTx) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().into_owned();
        let size = entry.size();

        if is_chunkable(config, &path, size) {
            split_image(&mut entry, &path, size, config, tx)?;
        } else {
            pass_through(&mut entry, &path, tx)?;
        }
    }
    Ok(())
}

/// An entry is chunked when its path looks like a disk image and it is
/// larger than one chunk.
fn is_chunkable(config: &TransferConfig, path: &str, size: u64) -> bool {
    size > config.chunk_size as u64
        && config
            .image_suffixes
            .iter()
            .any(|suffix| path.ends_with(suffix.as_str()))
}

fn split_image<R: Read>(
    entry: &mut tar::Entry<'_, R>,
    path: &str,
    image_size: u64,
    config: &TransferConfig,
    tx: &EntryTx,
) -> Result<()> {
    let mut window = vec![0u8; config.chunk_size];
    let mut remaining = image_size;
    let mut index: u64 = 0;

    while remaining > 0 {
        let want = remaining.min(config.chunk_size as u64) as usize;
        entry.read_exact(&mut window[..want])?;
        let slice = &window[..want];

        let digest = ChunkDigest::compute(config.digest, slice);
        let data = if slice.iter().all(|&b| b == 0) {
            Vec::new()
        } else {
            slice.to_vec()
        };

        let chunk = ChunkEntry {
            name: format_chunk_name(path, index, config.index_width),
            index,
            data,
            digest,
            // Every chunk carries the whole image's size: the restore side
            // rebuilds one synthetic entry and needs the aggregate size
            // before any chunk arrives.
            image_size,
        };
        tx.push(Entry::Chunk(chunk))?;

        index += 1;
        remaining -= want as u64;
    }
    debug!(image = path, chunks = index, "image split complete");
    Ok(())
}

fn pass_through<R: Read>(entry: &mut tar::Entry<'_, R>, path: &str, tx: &EntryTx) -> Result<()> {
    let header = entry.header();
    let kind = match header.entry_type() {
        EntryType::Directory => ObjectKind::Directory,
        EntryType::Symlink => ObjectKind::Symlink,
        _ => ObjectKind::RegularFile,
    };
    let meta = EntryMeta {
        kind,
        size: entry.size(),
        mode: header.mode()?,
        uid: header.uid()? as u32,
        gid: header.gid()? as u32,
        mtime: header.mtime()? as i64,
        link_target: header
            .link_name()?
            .map(|p| p.to_string_lossy().into_owned()),
    };

    let data = if kind == ObjectKind::RegularFile && meta.size > 0 {
        let mut bytes = Vec::with_capacity(meta.size as usize);
        entry.read_to_end(&mut bytes)?;
        Some(bytes)
    } else {
        None
    };

    tx.push(Entry::Regular(RegularEntry {
        name: path.to_string(),
        data,
        meta,
    }))
}

use gantry_types::ChunkDigest;

use crate::host::ObjectKind;

/// Archive-entry metadata carried by non-chunk objects.
#[derive(Debug, Clone)]
pub struct EntryMeta {
    pub kind: ObjectKind,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: i64,
    pub link_target: Option<String>,
}

/// One fixed-size slice of a disk image.
///
/// `data` is empty iff the chunk is provably all-zero. `image_size` is the
/// total size of the image the chunk belongs to — constant across all chunks
/// of one image, so the restore side knows the aggregate size before any
/// bytes arrive.
#[derive(Debug, Clone)]
pub struct ChunkEntry {
    pub name: String,
    pub index: u64,
    pub data: Vec<u8>,
    pub digest: ChunkDigest,
    pub image_size: u64,
}

impl ChunkEntry {
    pub fn is_zero(&self) -> bool {
        self.data.is_empty()
    }
}

/// Any non-chunked object passing through the pipeline unmodified.
#[derive(Debug, Clone)]
pub struct RegularEntry {
    pub name: String,
    pub data: Option<Vec<u8>>,
    pub meta: EntryMeta,
}

/// An element of the bounded entry queue. Created once, consumed exactly
/// once; `Error` terminates the pipeline when observed.
#[derive(Debug, Clone)]
pub enum Entry {
    Chunk(ChunkEntry),
    Regular(RegularEntry),
    Error(String),
}

/// Format a chunk object name: `<image>-<zero-padded index>.chunk`.
pub fn format_chunk_name(image: &str, index: u64, width: usize) -> String {
    format!("{image}-{index:0width$}.chunk")
}

/// Parse a chunk object name back into `(image, index)`.
///
/// Accepts any index width (the padding is cosmetic); returns `None` for
/// names that don't follow the convention.
pub fn parse_chunk_name(name: &str) -> Option<(&str, u64)> {
    let stem = name.strip_suffix(".chunk")?;
    let dash = stem.rfind('-')?;
    let (image, digits) = (&stem[..dash], &stem[dash + 1..]);
    if image.is_empty() || digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((image, digits.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_name_round_trip() {
        let name = format_chunk_name("vm/disk0.img", 42, 6);
        assert_eq!(name, "vm/disk0.img-000042.chunk");
        assert_eq!(parse_chunk_name(&name), Some(("vm/disk0.img", 42)));
    }

    #[test]
    fn chunk_name_index_zero() {
        let name = format_chunk_name("a.raw", 0, 4);
        assert_eq!(name, "a.raw-0000.chunk");
        assert_eq!(parse_chunk_name(&name), Some(("a.raw", 0)));
    }

    #[test]
    fn parse_accepts_any_width() {
        assert_eq!(parse_chunk_name("img-7.chunk"), Some(("img", 7)));
        assert_eq!(
            parse_chunk_name("img-000000000007.chunk"),
            Some(("img", 7))
        );
    }

    #[test]
    fn parse_rejects_non_chunk_names() {
        assert_eq!(parse_chunk_name("manifest.json"), None);
        assert_eq!(parse_chunk_name("img-12.tar"), None);
        assert_eq!(parse_chunk_name("img-.chunk"), None);
        assert_eq!(parse_chunk_name("-12.chunk"), None);
        assert_eq!(parse_chunk_name("img-1a2.chunk"), None);
    }

    #[test]
    fn parse_uses_last_dash() {
        // Image paths may themselves contain dashes.
        assert_eq!(
            parse_chunk_name("my-vm/disk-a.img-003.chunk"),
            Some(("my-vm/disk-a.img", 3))
        );
    }
}

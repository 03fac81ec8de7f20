use std::path::PathBuf;
use std::sync::Once;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use gantry_types::DigestAlgo;

use crate::error::{GantryError, Result};

/// Chunk sizes must be a multiple of this alignment.
pub const CHUNK_ALIGNMENT: usize = 4096;

static TRUNCATION_WARNING: Once = Once::new();

/// A host metadata field repurposed as a digest slot.
///
/// The host engine compares these numeric fields between backup generations
/// for change detection; carrying digest words in them turns that comparison
/// into a content-addressed dedup check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetaField {
    Atime,
    Mtime,
    Ctime,
}

/// Configuration for the chunked image transfer engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Size of one image chunk in bytes. Must be a multiple of
    /// [`CHUNK_ALIGNMENT`].
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Maximum number of chunks the restore collector keeps in RAM before
    /// spilling to disk.
    #[serde(default = "default_max_ram_chunks")]
    pub max_ram_chunks: usize,

    /// Directory for spill files. Default: the OS temp directory.
    #[serde(default)]
    pub spill_dir: Option<PathBuf>,

    /// Capacity of the bounded entry queue between stream reader and
    /// orchestration thread.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Seconds to wait for the next entry before declaring the upstream
    /// stalled.
    #[serde(default = "default_queue_timeout_secs")]
    pub queue_timeout_secs: u64,

    #[serde(default)]
    pub digest: DigestAlgo,

    /// Host metadata fields carrying packed digest words, most-significant
    /// first.
    #[serde(default = "default_digest_fields")]
    pub digest_fields: Vec<MetaField>,

    /// Width of the zero-padded decimal chunk index in object names.
    #[serde(default = "default_index_width")]
    pub index_width: usize,

    /// Path suffixes that mark an archive entry as a chunkable disk image.
    #[serde(default = "default_image_suffixes")]
    pub image_suffixes: Vec<String>,
}

fn default_chunk_size() -> usize {
    64 * 1024 * 1024
}

fn default_max_ram_chunks() -> usize {
    8
}

fn default_queue_depth() -> usize {
    16
}

fn default_queue_timeout_secs() -> u64 {
    300
}

fn default_digest_fields() -> Vec<MetaField> {
    vec![MetaField::Atime, MetaField::Mtime, MetaField::Ctime]
}

fn default_index_width() -> usize {
    6
}

fn default_image_suffixes() -> Vec<String> {
    vec!["layer.tar".into(), ".img".into(), ".raw".into()]
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_ram_chunks: default_max_ram_chunks(),
            spill_dir: None,
            queue_depth: default_queue_depth(),
            queue_timeout_secs: default_queue_timeout_secs(),
            digest: DigestAlgo::default(),
            digest_fields: default_digest_fields(),
            index_width: default_index_width(),
            image_suffixes: default_image_suffixes(),
        }
    }
}

impl TransferConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size % CHUNK_ALIGNMENT != 0 {
            return Err(GantryError::Config(format!(
                "chunk_size must be a non-zero multiple of {CHUNK_ALIGNMENT}, got {}",
                self.chunk_size
            )));
        }
        if self.max_ram_chunks == 0 {
            return Err(GantryError::Config(
                "max_ram_chunks must be at least 1".into(),
            ));
        }
        if self.queue_depth == 0 {
            return Err(GantryError::Config("queue_depth must be at least 1".into()));
        }
        if self.digest_fields.is_empty() {
            return Err(GantryError::Config(
                "digest_fields must name at least one host metadata field".into(),
            ));
        }
        if self.index_width == 0 {
            return Err(GantryError::Config("index_width must be at least 1".into()));
        }

        // A slot budget narrower than the digest loses dedup fidelity but is
        // an accepted tradeoff, not a failure.
        let slot_bits = 64 * self.digest_fields.len();
        if self.digest.bits() > slot_bits {
            TRUNCATION_WARNING.call_once(|| {
                warn!(
                    digest_bits = self.digest.bits(),
                    slot_bits, "digest wider than metadata slot budget, truncating"
                );
            });
        }
        Ok(())
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_secs)
    }
}

pub mod digest;

pub use digest::{ChunkDigest, DigestAlgo};

//! cfs-core: shared types for the chunkfuse pipeline
//!
//! A plaintext tree is split into fixed-size chunks; every chunk is
//! identified by the SHA-512 over its plaintext bytes. The index database
//! maps relative paths to [`FileEntry`] records carrying the ordered chunk
//! list (files) or the immediate children (directories).

pub mod error;
pub mod scan;
pub mod types;

pub use error::{CfsError, CfsResult};
pub use scan::{scan_tree, ScanSummary};
pub use types::{chunk_size, ChunkHash, FileEntry, FolderEntry, IndexDb};

/// Plaintext chunk size: a multiple of the 131072-byte FUSE read buffer and
/// of common disk block sizes (1 GiB).
pub const CHUNK_SIZE: i64 = 131072 * 4096 * 2;

/// Scanner hashing buffer. Must divide `CHUNK_SIZE` evenly (16 MiB).
pub const BUFFER_SIZE: usize = 16_777_216;

/// Key of the scanned tree's root directory in the index database.
pub const ROOT_KEY: &str = ".";

const _: () = assert!(CHUNK_SIZE % BUFFER_SIZE as i64 == 0);

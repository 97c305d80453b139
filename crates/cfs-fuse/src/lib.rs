//! cfs-fuse: mounts the index database as a read-only plaintext tree.
//!
//! Two layers: [`handle::FileHandle`] streams one remote chunk object with a
//! bounded forward-only cache, and [`driver::ChunkFs`] projects the index
//! database onto path-based FUSE operations, decrypting on the way out.

pub mod driver;
mod file;
pub mod handle;
pub mod mount;

pub use driver::ChunkFs;
pub use handle::{FileHandle, HandleError};
pub use mount::{mount, MountConfig};

//! cfs-sync: pushing a scanned tree to the object store and trashing
//! orphaned chunks.

pub mod clean;
pub mod upload;

pub use clean::{find_orphans, trash_orphans, OrphanReport};
pub use upload::{refresh_db, upload_tree, UploadReport};

//! Mount entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use fuse3::path::Session;
use fuse3::MountOptions;
use tracing::info;

use cfs_crypto::KeySchedule;
use cfs_store::ObjectStore;

use crate::driver::ChunkFs;

pub struct MountConfig {
    pub store: Arc<dyn ObjectStore>,
    pub keys: KeySchedule,
    pub db_object_name: String,
    /// Database refresh throttle in seconds; 0 selects the default.
    pub interval: u64,
    pub mountpoint: PathBuf,
    pub allow_other: bool,
}

/// Initialise the listing, load the database and serve the filesystem
/// until it is unmounted.
///
/// A database that cannot be loaded at start is a configuration error —
/// better to fail the mount than to serve an empty tree.
pub async fn mount(cfg: MountConfig) -> Result<()> {
    cfg.store
        .init_file_list()
        .await
        .context("initialising the remote listing")?;

    let fs = ChunkFs::new(cfg.store, cfg.keys, cfg.db_object_name, cfg.interval);

    let status = fs.check_db_update().await;
    if status != 0 {
        bail!("initial database load failed (status {status})");
    }

    let mut opts = MountOptions::default();
    opts.fs_name("chunkfuse");
    opts.read_only(true);
    opts.force_readdir_plus(true);
    if cfg.allow_other {
        opts.allow_other(true);
    }

    info!(mountpoint = %cfg.mountpoint.display(), "mounting chunkfuse (unprivileged)");

    let handle = Session::new(opts)
        .mount_with_unprivileged(fs, &cfg.mountpoint)
        .await
        .context("FUSE mount failed")?;

    handle.await.context("FUSE session ended with an error")
}

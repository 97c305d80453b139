//! Upload engine: scan → diff against the remote listing → push missing
//! chunks → replace the remote database.
//!
//! The order matters for idempotency: chunks are discoverable by
//! `(name, size)`, so an interrupted run re-skips everything already saved,
//! and the database object is replaced only after every chunk it references
//! exists.

use std::path::Path;

use anyhow::{Context, Result};
use tokio::io::AsyncSeekExt;
use tracing::{debug, info};

use cfs_core::{chunk_size, scan_tree, CHUNK_SIZE};
use cfs_crypto::{db_from_file, db_to_file, CryptReader, KeySchedule};
use cfs_store::ObjectStore;

#[derive(Debug, Default)]
pub struct UploadReport {
    pub changed: bool,
    pub uploaded_chunks: usize,
}

/// Scan the tree and rewrite the local database file when something
/// changed. Returns the changed flag.
pub fn refresh_db(keys: &KeySchedule, db_path: &Path, dir: &Path) -> Result<bool> {
    let db_key = keys.db_key();
    let old_db = db_from_file(db_path, &db_key)
        .with_context(|| format!("loading database: {}", db_path.display()))?;

    let (new_db, changed, summary) =
        scan_tree(dir, &old_db).with_context(|| format!("scanning: {}", dir.display()))?;
    info!(%summary, "scan finished");

    if changed {
        db_to_file(db_path, &db_key, &new_db)
            .with_context(|| format!("writing database: {}", db_path.display()))?;
    }
    Ok(changed)
}

/// Scan, then push every chunk the store does not hold yet and finally
/// replace the remote database object.
pub async fn upload_tree(
    store: &dyn ObjectStore,
    keys: &KeySchedule,
    db_path: &Path,
    dir: &Path,
    db_object_name: &str,
    force: bool,
) -> Result<UploadReport> {
    let changed = refresh_db(keys, db_path, dir)?;
    if !changed && !force {
        info!("nothing changed, nothing to upload");
        return Ok(UploadReport {
            changed,
            uploaded_chunks: 0,
        });
    }

    let db = db_from_file(db_path, &keys.db_key())?;

    store
        .init_file_list()
        .await
        .context("initialising the remote listing")?;
    let listing = store.file_list().await;

    let mut uploaded = 0usize;
    for (rel_path, entry) in db.iter().filter(|(_, e)| e.is_file) {
        for (chunk_nr, hash) in entry.chunks.iter().enumerate() {
            let name = keys.chunk_name_hex(hash.as_bytes());
            let size = chunk_size(chunk_nr, entry.size);

            let exists = listing
                .values()
                .any(|obj| obj.size == size && obj.name == name);
            if exists {
                continue;
            }

            debug!(path = %rel_path, chunk = chunk_nr, name = %name, size, "uploading chunk");

            let mut fh = tokio::fs::File::open(dir.join(rel_path))
                .await
                .with_context(|| format!("opening plaintext file: {rel_path}"))?;
            fh.seek(std::io::SeekFrom::Start(chunk_nr as u64 * CHUNK_SIZE as u64))
                .await?;

            let reader = CryptReader::new(fh, keys.chunk_key(hash.as_bytes()));
            store
                .save(&name, Box::new(reader), size as u64)
                .await
                .with_context(|| format!("uploading chunk {chunk_nr} of {rel_path}"))?;
            uploaded += 1;
        }
    }
    info!(chunks = uploaded, "chunk upload finished");

    // Replace the database last: readers only ever see an index whose
    // chunks are all present.
    store
        .update_file_list()
        .await
        .context("refreshing the remote listing")?;
    for obj in store.file_list().await.values() {
        if obj.name == db_object_name {
            debug!(id = %obj.id, "trashing old database object");
            store.trash(&obj.id).await?;
        }
    }

    let db_file = tokio::fs::File::open(db_path)
        .await
        .with_context(|| format!("opening database file: {}", db_path.display()))?;
    store
        .save(db_object_name, Box::new(db_file), 0)
        .await
        .context("uploading the database")?;
    info!(name = db_object_name, "database replaced");

    Ok(UploadReport {
        changed,
        uploaded_chunks: uploaded,
    })
}

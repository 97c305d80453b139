//! Cleaner: enumerate chunks the current database no longer references and
//! trash them.
//!
//! Only objects whose name has the 128-hex chunk shape are candidates; the
//! database object and anything else are never touched. A size mismatch also
//! counts as orphaned — the real chunk of that name has a different size.

use anyhow::{Context, Result};
use tracing::{debug, info};

use cfs_core::{chunk_size, IndexDb};
use cfs_crypto::KeySchedule;
use cfs_store::{ObjectStore, RemoteObject};

/// Hex length of a derived chunk name.
const CHUNK_NAME_HEX_LEN: usize = 128;

#[derive(Debug, Default)]
pub struct OrphanReport {
    pub orphans: Vec<RemoteObject>,
    pub total_objects: usize,
    pub total_bytes: i64,
    pub orphan_bytes: i64,
}

/// Build the reverse index `name → size` from `db` and collect every stored
/// object that should not exist. Initialises the store listing.
pub async fn find_orphans(
    store: &dyn ObjectStore,
    keys: &KeySchedule,
    db: &IndexDb,
) -> Result<OrphanReport> {
    store
        .init_file_list()
        .await
        .context("initialising the remote listing")?;

    let mut expected = std::collections::HashMap::new();
    for entry in db.values().filter(|e| e.is_file) {
        for (chunk_nr, hash) in entry.chunks.iter().enumerate() {
            expected.insert(
                keys.chunk_name_hex(hash.as_bytes()),
                chunk_size(chunk_nr, entry.size),
            );
        }
    }

    let mut report = OrphanReport::default();
    for obj in store.file_list().await.into_values() {
        report.total_objects += 1;
        report.total_bytes += obj.size;

        if obj.name.len() != CHUNK_NAME_HEX_LEN {
            continue;
        }
        let wanted = expected.get(&obj.name);
        if wanted.is_none_or(|&size| size != obj.size) {
            debug!(name = %obj.name, size = obj.size, "orphaned chunk");
            report.orphan_bytes += obj.size;
            report.orphans.push(obj);
        }
    }

    info!(
        total = report.total_objects,
        orphans = report.orphans.len(),
        orphan_bytes = report.orphan_bytes,
        "orphan scan finished"
    );
    Ok(report)
}

/// Trash every object in `orphans`. Call only after the operator confirmed
/// the report.
pub async fn trash_orphans(store: &dyn ObjectStore, orphans: &[RemoteObject]) -> Result<()> {
    for obj in orphans {
        store
            .trash(&obj.id)
            .await
            .with_context(|| format!("trashing {}", obj.name))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::upload_tree;
    use cfs_crypto::generate_keyfile;
    use cfs_store::DiskStore;

    #[tokio::test]
    async fn clean_removes_stale_chunks_only() {
        let tmp = tempfile::tempdir().unwrap();
        let key_path = tmp.path().join("test.key");
        generate_keyfile(&key_path).unwrap();
        let keys = KeySchedule::load(&key_path).unwrap();

        let tree = tmp.path().join("tree");
        let chunks = tmp.path().join("chunks");
        std::fs::create_dir(&tree).unwrap();
        std::fs::create_dir(&chunks).unwrap();
        std::fs::write(tree.join("a.txt"), b"first version").unwrap();

        let db_path = tmp.path().join("test.db");
        let store = DiskStore::new(&chunks);
        upload_tree(&store, &keys, &db_path, &tree, "index.db", false)
            .await
            .unwrap();

        // Rewrite the file: the old chunk becomes an orphan on the next
        // scan+upload.
        std::fs::write(tree.join("a.txt"), b"second version, longer").unwrap();
        upload_tree(&store, &keys, &db_path, &tree, "index.db", false)
            .await
            .unwrap();

        let db = cfs_crypto::db_from_file(&db_path, &keys.db_key()).unwrap();
        let report = find_orphans(&store, &keys, &db).await.unwrap();

        assert_eq!(report.orphans.len(), 1);
        assert_eq!(report.orphans[0].name.len(), 128);
        assert_eq!(report.orphans[0].size, b"first version".len() as i64);

        trash_orphans(&store, &report.orphans).await.unwrap();

        // The live chunk and the database survive.
        let after = find_orphans(&store, &keys, &db).await.unwrap();
        assert!(after.orphans.is_empty());
        assert_eq!(after.total_objects, 2);
    }

    #[tokio::test]
    async fn db_object_is_never_a_candidate() {
        let tmp = tempfile::tempdir().unwrap();
        let key_path = tmp.path().join("test.key");
        generate_keyfile(&key_path).unwrap();
        let keys = KeySchedule::load(&key_path).unwrap();

        let chunks = tmp.path().join("chunks");
        std::fs::create_dir(&chunks).unwrap();
        std::fs::write(chunks.join("index.db"), b"not a chunk").unwrap();
        // A stray 128-char name that is no derived chunk → orphan.
        std::fs::write(chunks.join("ab".repeat(64)), b"junk").unwrap();

        let store = DiskStore::new(&chunks);
        let report = find_orphans(&store, &keys, &IndexDb::new()).await.unwrap();

        assert_eq!(report.orphans.len(), 1);
        assert_eq!(report.orphans[0].name, "ab".repeat(64));
    }
}

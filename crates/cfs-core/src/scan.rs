//! Tree scanner: walk a plaintext directory, hash chunks, build the index
//! database.
//!
//! Entries whose `(size, is_file, mtime)` all match the previous database are
//! reused without re-reading the file; everything else is re-chunked with a
//! streaming SHA-512. Directory listings are always rebuilt from the live
//! walk, which repairs stale listings for free.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use sha2::{Digest, Sha512};
use tracing::debug;
use walkdir::WalkDir;

use crate::{CfsError, CfsResult, ChunkHash, FileEntry, FolderEntry, IndexDb};
use crate::{BUFFER_SIZE, CHUNK_SIZE, ROOT_KEY};

/// Scan statistics, written to the log after every run.
#[derive(Debug, Clone, Default)]
pub struct ScanSummary {
    pub entries: usize,
    pub new_or_updated: usize,
    pub removed: usize,
    pub changed: bool,
}

impl fmt::Display for ScanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "entries={} changed={} new_or_updated={} removed={}",
            self.entries, self.changed, self.new_or_updated, self.removed
        )
    }
}

/// Walk `root` and build a fresh index database, reusing chunk lists from
/// `old_db` where size, kind and mtime are unchanged.
///
/// `changed` is true when any entry was added or updated, or when entries
/// from the old database no longer exist on disk.
pub fn scan_tree(root: &Path, old_db: &IndexDb) -> CfsResult<(IndexDb, bool, ScanSummary)> {
    // Working copy; whatever is left at the end was removed from disk.
    let mut leftover = old_db.clone();

    let mut new_db = IndexDb::new();
    let mut changed = false;
    let mut new_or_updated = 0usize;

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| CfsError::Scan(format!("walk failed: {e}")))?;
        let path = entry.path();
        let key = rel_key(root, path)?;

        let meta = entry
            .metadata()
            .map_err(|e| CfsError::Scan(format!("stat failed for {}: {e}", path.display())))?;
        let is_file = !meta.is_dir();
        let size = meta.len() as i64;
        let mtime = unix_mtime(&meta);

        let children = if is_file {
            Vec::new()
        } else {
            read_dir_names(path)?
        };

        let mut db_entry = match leftover.get(&key) {
            Some(e) if e.size == size && e.is_file == is_file && e.mtime == mtime => e.clone(),
            _ => {
                new_or_updated += 1;
                changed = true;
                debug!(path = %key, "new or changed");

                if is_file {
                    scan_file(path)?
                } else {
                    FileEntry {
                        size,
                        mtime,
                        is_file,
                        ..FileEntry::default()
                    }
                }
            }
        };

        // The listing is cheap to rebuild and comparing it is not; always
        // take the live one so directories never go stale.
        db_entry.children = children;

        leftover.remove(&key);
        new_db.insert(key, db_entry);
    }

    if !leftover.is_empty() {
        changed = true;
    }

    let summary = ScanSummary {
        entries: new_db.len(),
        new_or_updated,
        removed: leftover.len(),
        changed,
    };

    Ok((new_db, changed, summary))
}

/// Read one plaintext file and compute its chunk-hash list.
///
/// The file is streamed through `BUFFER_SIZE` buffers; a chunk hash is
/// finalised whenever the accumulated chunk reaches `CHUNK_SIZE` or the file
/// ends. Empty files get an empty list and a zero-size chunk is never
/// emitted.
pub(crate) fn scan_file(path: &Path) -> CfsResult<FileEntry> {
    let mut fh = File::open(path)?;

    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut file_size: i64 = 0;
    let mut chunk_len: i64 = 0;
    let mut hasher = Sha512::new();
    let mut chunks = Vec::new();

    loop {
        let n = fh.read(&mut buffer)?;
        if n > 0 {
            file_size += n as i64;
            chunk_len += n as i64;
            hasher.update(&buffer[..n]);
        }

        // Close the chunk at the size boundary or at EOF.
        if chunk_len >= CHUNK_SIZE || n == 0 {
            let digest = hasher.finalize_reset();
            if file_size > 0 && chunk_len > 0 {
                chunks.push(ChunkHash::try_from(digest.as_slice())?);
            }
            chunk_len = 0;
        }

        if n == 0 {
            break;
        }
    }

    let meta = std::fs::metadata(path)?;
    if file_size != meta.len() as i64 {
        return Err(CfsError::Scan(format!(
            "file was not completely read (mutated during scan?): {}",
            path.display()
        )));
    }

    Ok(FileEntry {
        size: file_size,
        mtime: unix_mtime(&meta),
        is_file: !meta.is_dir(),
        chunks,
        children: Vec::new(),
    })
}

/// List a directory's immediate children, sorted by name.
fn read_dir_names(dir: &Path) -> CfsResult<Vec<FolderEntry>> {
    let mut names: Vec<PathBuf> = std::fs::read_dir(dir)?
        .map(|res| res.map(|e| e.path()))
        .collect::<Result<_, _>>()?;
    names.sort();

    let mut out = Vec::with_capacity(names.len());
    for path in names {
        let meta = std::fs::metadata(&path)?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| CfsError::Scan(format!("non-UTF-8 name: {}", path.display())))?
            .to_string();
        out.push(FolderEntry {
            name,
            is_file: !meta.is_dir(),
        });
    }
    Ok(out)
}

/// Database key for `path` below `root`: `"."` for the root itself,
/// otherwise the `/`-joined relative path.
fn rel_key(root: &Path, path: &Path) -> CfsResult<String> {
    let rel = path
        .strip_prefix(root)
        .map_err(|_| CfsError::Scan(format!("path escapes scan root: {}", path.display())))?;

    let mut parts = Vec::new();
    for comp in rel.components() {
        let part = comp
            .as_os_str()
            .to_str()
            .ok_or_else(|| CfsError::Scan(format!("non-UTF-8 path: {}", path.display())))?;
        parts.push(part);
    }

    if parts.is_empty() {
        Ok(ROOT_KEY.to_string())
    } else {
        Ok(parts.join("/"))
    }
}

fn unix_mtime(meta: &std::fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // 128-byte key file from the published derivation vectors; its SHA-512
    // doubles as a known chunk hash.
    const KEYFILE_HEX: &str = "60a47fe220af89723bebda9fb741b479e15b74c817df1326b26d807d086376f6\
                               f3fe03a457d8458168cdc89f09303fe570f51305b48180e7d9fc6ef3e6aa2796\
                               915d5ca065469277d7a7eb4983f6dbcd932180cb6115bf1334c725a72b9be480\
                               b35a30a821f38a9b44660bdf0baabdf6391ad67fa1b5484503751d9afe0d4cf0";

    fn write_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut fh = File::create(&path).unwrap();
        fh.write_all(data).unwrap();
        path
    }

    #[test]
    fn scan_file_known_hash() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_file(tmp.path(), "keyfile.dat", &hex::decode(KEYFILE_HEX).unwrap());

        let entry = scan_file(&path).unwrap();
        assert_eq!(entry.size, 128);
        assert!(entry.is_file);
        assert_eq!(entry.chunks.len(), 1);

        let expected = hex::decode(
            "dd5610dabc3b5c9bf4f567aad68aaba0489dd5b9c6552c8c8b6ac4ec6dfa7143\
             0c827dd2675ba6760bb635c59964218a3f17f6b995932f5c47cfef666761ce69",
        )
        .unwrap();
        assert_eq!(entry.chunks[0].as_bytes().as_slice(), expected.as_slice());
    }

    #[test]
    fn scan_file_empty_has_no_chunks() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_file(tmp.path(), "empty.dat", b"");

        let entry = scan_file(&path).unwrap();
        assert_eq!(entry.size, 0);
        assert!(entry.chunks.is_empty());
    }

    #[test]
    fn scan_tree_change_detection() {
        let tmp = tempfile::tempdir().unwrap();
        write_file(tmp.path(), "a.txt", b"hello");
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        write_file(&tmp.path().join("sub"), "b.txt", b"world");

        // First scan of an empty database reports a change.
        let (db, changed, _) = scan_tree(tmp.path(), &IndexDb::new()).unwrap();
        assert!(changed);
        assert!(db.contains_key("."));
        assert!(db.contains_key("a.txt"));
        assert!(db.contains_key("sub"));
        assert!(db.contains_key("sub/b.txt"));

        // An unchanged tree scans clean.
        let (db, changed, _) = scan_tree(tmp.path(), &db).unwrap();
        assert!(!changed);

        // A vanished entry is detected through the leftover set.
        let mut with_ghost = db.clone();
        with_ghost.insert("i-am-a-ghost.txt".into(), FileEntry::default());
        let (_, changed, summary) = scan_tree(tmp.path(), &with_ghost).unwrap();
        assert!(changed);
        assert_eq!(summary.removed, 1);
    }

    #[test]
    fn scan_tree_rename_keeps_chunk_hashes() {
        let tmp = tempfile::tempdir().unwrap();
        write_file(tmp.path(), "orig.bin", b"stable content");

        let (db1, _, _) = scan_tree(tmp.path(), &IndexDb::new()).unwrap();
        let before = db1.get("orig.bin").unwrap().chunks.clone();

        std::fs::rename(tmp.path().join("orig.bin"), tmp.path().join("renamed.bin")).unwrap();
        let (db2, changed, _) = scan_tree(tmp.path(), &db1).unwrap();

        assert!(changed);
        assert_eq!(db2.get("renamed.bin").unwrap().chunks, before);
    }

    #[test]
    fn scan_tree_root_lists_children() {
        let tmp = tempfile::tempdir().unwrap();
        write_file(tmp.path(), "z.txt", b"z");
        write_file(tmp.path(), "a.txt", b"a");
        std::fs::create_dir(tmp.path().join("dir")).unwrap();

        let (db, _, _) = scan_tree(tmp.path(), &IndexDb::new()).unwrap();
        let root = db.get(".").unwrap();
        assert!(!root.is_file);

        let names: Vec<&str> = root.children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "dir", "z.txt"]);
        assert!(!root.children[1].is_file);
        assert!(root.children[0].is_file);
    }
}

//! Read-only path-based FUSE driver over the index database.
//!
//! Every attribute, listing and read is answered from the in-memory
//! database snapshot plus the remote listing; file content is streamed
//! through per-chunk [`FileHandle`]s and decrypted on the way out. The
//! database snapshot is refreshed opportunistically (and throttled) from
//! attr/listing operations.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use fuse3::path::prelude::*;
use fuse3::{Errno, FileType};
use futures_util::stream;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use cfs_core::{FileEntry, IndexDb, ROOT_KEY};
use cfs_crypto::{decode_db, KeySchedule};
use cfs_store::ObjectStore;

use crate::file::OpenFile;

/// Seconds between two database refresh attempts when no interval is
/// configured.
pub const DEFAULT_REFRESH_INTERVAL: u64 = 600;

/// Upper bound for the database download; far above any real index.
const DB_DOWNLOAD_LIMIT: u64 = 44_222_111;

/// TTL for kernel dentry/attr cache entries.
const ATTR_TTL: Duration = Duration::from_secs(5);

/// Fixed numbers for `statfs`: a 100 TiB volume with 8 KiB blocks.
const STATFS_TOTAL_BYTES: u64 = 109_951_162_777_600;
const STATFS_BLOCK_SIZE: u64 = 8192;

struct DbState {
    db: IndexDb,
    /// Unix time of the last refresh attempt, successful or not.
    last_refresh: i64,
    /// Remote mtime of the database object currently loaded.
    last_db_mtime: i64,
}

/// The filesystem. All mutation happens under the two mutexes; the key
/// schedule and store are immutable after construction.
pub struct ChunkFs {
    store: Arc<dyn ObjectStore>,
    keys: KeySchedule,
    db_object_name: String,
    /// Refresh throttle in seconds; 0 selects the default.
    interval: u64,
    state: Mutex<DbState>,
    open_files: Mutex<HashMap<u64, OpenFile>>,
    next_fh: AtomicU64,
    uid: u32,
    gid: u32,
}

impl ChunkFs {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        keys: KeySchedule,
        db_object_name: impl Into<String>,
        interval: u64,
    ) -> Self {
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        ChunkFs {
            store,
            keys,
            db_object_name: db_object_name.into(),
            interval,
            state: Mutex::new(DbState {
                db: IndexDb::new(),
                last_refresh: 0,
                last_db_mtime: 0,
            }),
            open_files: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
            uid,
            gid,
        }
    }

    /// Try to load a newer database object, at most once per interval.
    ///
    /// Status codes (also logged at debug level):
    ///   0   reloaded a newer database
    ///   401 throttled, interval not elapsed
    ///   402 listing refresh failed
    ///   403 no database object in the watched folder
    ///   404 database object unchanged
    ///   405 database download failed
    ///   406 database decrypt/authentication failed
    pub async fn check_db_update(&self) -> u32 {
        let mut state = self.state.lock().await;

        let interval = if self.interval > 0 {
            self.interval
        } else {
            DEFAULT_REFRESH_INTERVAL
        };

        // Throttle every attempt, successful or not.
        let now = unix_now();
        if state.last_refresh + interval as i64 > now {
            return 401;
        }
        state.last_refresh = now;

        debug!("checking for a newer database object");

        if let Err(e) = self.store.update_file_list().await {
            warn!("can't refresh the remote listing: {e}");
            return 402;
        }

        let listing = self.store.file_list().await;
        let newest = listing
            .values()
            .filter(|obj| obj.name == self.db_object_name)
            .max_by_key(|obj| obj.mtime);

        let newest = match newest {
            Some(obj) if obj.mtime > 0 => obj,
            _ => {
                warn!(name = %self.db_object_name, "no database object found");
                return 403;
            }
        };

        if newest.mtime == state.last_db_mtime {
            debug!(mtime = newest.mtime, "database object unchanged");
            return 404;
        }

        let mut download = match self.store.read(&newest.id, 0, DB_DOWNLOAD_LIMIT).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("can't open the database object: {e}");
                return 405;
            }
        };
        let mut blob = Vec::new();
        if let Err(e) = download.read_to_end(&mut blob).await {
            warn!("can't download the database object: {e}");
            return 405;
        }

        let new_db = match decode_db(&blob, &self.keys.db_key()) {
            Ok(db) => db,
            Err(e) => {
                // Possibly a database that is still being written.
                warn!("can't decrypt the database object: {e}");
                return 406;
            }
        };

        state.db = new_db;
        // Only after the new database is installed; a failure above must
        // never poison the known-good snapshot.
        state.last_db_mtime = newest.mtime;

        info!(
            name = %self.db_object_name,
            mtime = state.last_db_mtime,
            entries = state.db.len(),
            "database reloaded"
        );
        0
    }

    /// Database key for a FUSE path: the root maps to `"."`.
    fn db_key_for(path: &str) -> &str {
        let trimmed = path.trim_start_matches('/');
        if trimmed.is_empty() {
            ROOT_KEY
        } else {
            trimmed
        }
    }

    async fn lookup_entry(&self, path: &str) -> Option<FileEntry> {
        let state = self.state.lock().await;
        state.db.get(Self::db_key_for(path)).cloned()
    }

    fn entry_attr(&self, entry: &FileEntry) -> FileAttr {
        let t = UNIX_EPOCH + Duration::from_secs(entry.mtime);
        let (kind, perm, nlink, size) = if entry.is_file {
            (FileType::RegularFile, 0o644, 1, entry.size as u64)
        } else {
            (
                FileType::Directory,
                0o755,
                entry.children.len() as u32,
                entry.size as u64,
            )
        };

        FileAttr {
            size,
            blocks: size.div_ceil(512),
            atime: t,
            mtime: t,
            ctime: t,
            #[cfg(target_os = "macos")]
            crtime: t,
            kind,
            perm,
            nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 4096,
            #[cfg(target_os = "macos")]
            flags: 0,
        }
    }

    /// Resolve a file entry into an `OpenFile` against the current remote
    /// listing.
    pub(crate) async fn open_file(&self, path: &str) -> Result<OpenFile, Errno> {
        let entry = self.lookup_entry(path).await.ok_or_else(|| {
            warn!(path, "open: not found in the database");
            Errno::from(libc::ENOENT)
        })?;

        if !entry.is_file {
            return Err(Errno::from(libc::ENOENT));
        }

        let listing = self.store.file_list().await;
        OpenFile::resolve(entry, &self.keys, &listing).ok_or_else(|| {
            warn!(path, "open: chunk object missing from the remote listing");
            Errno::from(libc::ENOENT)
        })
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &dyn ObjectStore {
        self.store.as_ref()
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl PathFilesystem for ChunkFs {
    async fn init(&self, _req: Request) -> fuse3::Result<ReplyInit> {
        debug!(db = %self.db_object_name, "chunkfuse init");
        Ok(ReplyInit {
            max_write: NonZeroU32::new(128 * 1024).unwrap(),
        })
    }

    async fn destroy(&self, _req: Request) {
        info!("chunkfuse unmounted");
    }

    async fn getattr(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        _fh: Option<u64>,
        _flags: u32,
    ) -> fuse3::Result<ReplyAttr> {
        self.check_db_update().await;

        let path = path
            .and_then(|p| p.to_str())
            .ok_or_else(|| Errno::from(libc::ENOENT))?;

        let entry = self.lookup_entry(path).await.ok_or_else(|| {
            debug!(path, "getattr: not found in the database");
            Errno::from(libc::ENOENT)
        })?;

        Ok(ReplyAttr {
            ttl: ATTR_TTL,
            attr: self.entry_attr(&entry),
        })
    }

    async fn lookup(&self, _req: Request, parent: &OsStr, name: &OsStr) -> fuse3::Result<ReplyEntry> {
        let parent = parent.to_str().unwrap_or("/");
        let name = name.to_str().ok_or_else(|| Errno::from(libc::ENOENT))?;

        let full = if parent == "/" {
            format!("/{name}")
        } else {
            format!("{}/{name}", parent.trim_end_matches('/'))
        };

        let entry = self
            .lookup_entry(&full)
            .await
            .ok_or_else(|| Errno::from(libc::ENOENT))?;

        Ok(ReplyEntry {
            ttl: ATTR_TTL,
            attr: self.entry_attr(&entry),
        })
    }

    async fn opendir(&self, _req: Request, path: &OsStr, _flags: u32) -> fuse3::Result<ReplyOpen> {
        let path = path.to_str().ok_or_else(|| Errno::from(libc::ENOENT))?;
        let entry = self
            .lookup_entry(path)
            .await
            .ok_or_else(|| Errno::from(libc::ENOENT))?;
        if entry.is_file {
            return Err(Errno::from(libc::ENOTDIR));
        }
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    type DirEntryStream<'a>
        = stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntry>>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntryPlus>>>
    where
        Self: 'a;

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        path: &'a OsStr,
        _fh: u64,
        offset: i64,
    ) -> fuse3::Result<ReplyDirectory<Self::DirEntryStream<'a>>> {
        self.check_db_update().await;

        let path = path.to_str().unwrap_or("/");
        let entry = self
            .lookup_entry(path)
            .await
            .ok_or_else(|| Errno::from(libc::ENOENT))?;
        if entry.is_file {
            return Err(Errno::from(libc::ENOTDIR));
        }

        let mut entries: Vec<fuse3::Result<DirectoryEntry>> = Vec::new();
        if offset == 0 {
            entries.push(Ok(DirectoryEntry {
                kind: FileType::Directory,
                name: ".".into(),
                offset: 1,
            }));
        }
        if offset <= 1 {
            entries.push(Ok(DirectoryEntry {
                kind: FileType::Directory,
                name: "..".into(),
                offset: 2,
            }));
        }

        let mut next_offset = 3i64;
        for child in &entry.children {
            // Only the type bit matters for a plain readdir.
            let kind = if child.is_file {
                FileType::RegularFile
            } else {
                FileType::Directory
            };
            if next_offset > offset {
                entries.push(Ok(DirectoryEntry {
                    kind,
                    name: child.name.clone().into(),
                    offset: next_offset,
                }));
            }
            next_offset += 1;
        }

        Ok(ReplyDirectory {
            entries: stream::iter(entries),
        })
    }

    async fn readdirplus<'a>(
        &'a self,
        _req: Request,
        path: &'a OsStr,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> fuse3::Result<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        self.check_db_update().await;

        let path_str = path.to_str().unwrap_or("/");
        let dir = self
            .lookup_entry(path_str)
            .await
            .ok_or_else(|| Errno::from(libc::ENOENT))?;
        if dir.is_file {
            return Err(Errno::from(libc::ENOTDIR));
        }

        let offset = offset as i64;

        let mut entries: Vec<fuse3::Result<DirectoryEntryPlus>> = Vec::new();
        if offset == 0 {
            entries.push(Ok(DirectoryEntryPlus {
                kind: FileType::Directory,
                name: ".".into(),
                offset: 1,
                attr: self.entry_attr(&dir),
                entry_ttl: ATTR_TTL,
                attr_ttl: ATTR_TTL,
            }));
        }
        if offset <= 1 {
            entries.push(Ok(DirectoryEntryPlus {
                kind: FileType::Directory,
                name: "..".into(),
                offset: 2,
                attr: self.entry_attr(&dir),
                entry_ttl: ATTR_TTL,
                attr_ttl: ATTR_TTL,
            }));
        }

        let mut next_offset = 3i64;
        for child in &dir.children {
            if next_offset > offset {
                let child_path = if path_str == "/" || path_str.is_empty() {
                    child.name.clone()
                } else {
                    format!("{}/{}", Self::db_key_for(path_str), child.name)
                };
                let attr = match self.lookup_entry(&child_path).await {
                    Some(child_entry) => self.entry_attr(&child_entry),
                    // Listing and entry disagree mid-refresh; report the
                    // child with the kind bit only.
                    None => self.entry_attr(&FileEntry {
                        is_file: child.is_file,
                        ..FileEntry::default()
                    }),
                };
                entries.push(Ok(DirectoryEntryPlus {
                    kind: if child.is_file {
                        FileType::RegularFile
                    } else {
                        FileType::Directory
                    },
                    name: child.name.clone().into(),
                    offset: next_offset,
                    attr,
                    entry_ttl: ATTR_TTL,
                    attr_ttl: ATTR_TTL,
                }));
            }
            next_offset += 1;
        }

        Ok(ReplyDirectoryPlus {
            entries: stream::iter(entries),
        })
    }

    async fn open(&self, _req: Request, path: &OsStr, _flags: u32) -> fuse3::Result<ReplyOpen> {
        let path = path.to_str().ok_or_else(|| Errno::from(libc::ENOENT))?;
        let open_file = self.open_file(path).await?;

        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.open_files.lock().await.insert(fh, open_file);

        debug!(path, fh, "file opened");
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> fuse3::Result<ReplyData> {
        let mut open_files = self.open_files.lock().await;
        let open_file = open_files.get_mut(&fh).ok_or_else(|| Errno::from(libc::EBADF))?;

        let data = open_file
            .read_at(self.store.as_ref(), offset, size as usize)
            .await
            .map_err(|e| {
                warn!(fh, offset, size, "read failed: {e}");
                Errno::from(libc::EIO)
            })?;

        Ok(ReplyData {
            data: Bytes::from(data),
        })
    }

    async fn release(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> fuse3::Result<()> {
        if let Some(mut open_file) = self.open_files.lock().await.remove(&fh) {
            open_file.release().await;
            debug!(fh, "file released");
        }
        Ok(())
    }

    async fn flush(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        _fh: u64,
        _lock_owner: u64,
    ) -> fuse3::Result<()> {
        Ok(())
    }

    async fn statfs(&self, _req: Request, _path: &OsStr) -> fuse3::Result<ReplyStatFs> {
        let state = self.state.lock().await;
        let used: u64 = state.db.values().map(|e| e.size.max(0) as u64).sum();
        let free = STATFS_TOTAL_BYTES.saturating_sub(used);

        Ok(ReplyStatFs {
            blocks: STATFS_TOTAL_BYTES / STATFS_BLOCK_SIZE,
            bfree: free / STATFS_BLOCK_SIZE,
            bavail: free / STATFS_BLOCK_SIZE,
            files: state.db.len() as u64,
            ffree: 0,
            bsize: STATFS_BLOCK_SIZE as u32,
            namelen: 255,
            frsize: STATFS_BLOCK_SIZE as u32,
        })
    }
}

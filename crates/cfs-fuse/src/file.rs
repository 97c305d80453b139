//! One open file: resolved chunk ids/keys and the per-chunk stream readers.
//!
//! `chunk_keys` and `file_ids` are captured at open time, so an open file
//! keeps serving reads consistently even when the database is refreshed
//! underneath it.

use std::collections::HashMap;

use tracing::{debug, warn};

use cfs_core::{chunk_size, FileEntry, CHUNK_SIZE};
use cfs_crypto::{crypt_bytes, KeySchedule};
use cfs_store::{ObjectStore, RemoteObject};

use crate::handle::{FileHandle, HandleError};

/// How often a failed chunk read may tear down and reopen its handles.
/// Recovers from stale upstream connections without retrying forever.
const ERROR_RETRIES: u32 = 3;

pub(crate) struct OpenFile {
    entry: FileEntry,
    chunk_keys: Vec<[u8; 32]>,
    file_ids: Vec<String>,
    handles: HashMap<usize, FileHandle>,
    retries_left: u32,
}

impl OpenFile {
    /// Resolve every chunk of `entry` against the remote listing. A chunk
    /// matches by encrypted name **and** expected size; any miss fails the
    /// open.
    pub(crate) fn resolve(
        entry: FileEntry,
        keys: &KeySchedule,
        listing: &HashMap<String, RemoteObject>,
    ) -> Option<Self> {
        let mut chunk_keys = Vec::with_capacity(entry.chunks.len());
        let mut file_ids = Vec::with_capacity(entry.chunks.len());

        for (chunk_nr, hash) in entry.chunks.iter().enumerate() {
            let name = keys.chunk_name_hex(hash.as_bytes());
            let size = chunk_size(chunk_nr, entry.size);

            let object = listing
                .values()
                .find(|obj| obj.name == name && obj.size == size)?;

            chunk_keys.push(keys.chunk_key(hash.as_bytes()));
            file_ids.push(object.id.clone());
        }

        Some(OpenFile {
            entry,
            chunk_keys,
            file_ids,
            handles: HashMap::new(),
            retries_left: ERROR_RETRIES,
        })
    }

    /// Read up to `length` cleartext bytes at `offset`.
    ///
    /// Dispatches to the chunk containing `offset`; when the request spans
    /// a chunk boundary the remainder continues in the next chunk at
    /// offset 0. Short reads at the end of the file come back short; reads
    /// past the last chunk come back empty.
    pub(crate) async fn read_at(
        &mut self,
        store: &dyn ObjectStore,
        offset: u64,
        length: usize,
    ) -> Result<Vec<u8>, HandleError> {
        if self.entry.size < 1 {
            return Ok(Vec::new());
        }

        let mut out = Vec::with_capacity(length);
        let mut offset = offset;
        let mut want = length;

        loop {
            let chunk_nr = (offset / CHUNK_SIZE as u64) as usize;
            let chunk_offset = offset % CHUNK_SIZE as u64;

            // The kernel likes to probe one buffer past the end; there is
            // no chunk there, just EOF.
            if chunk_nr >= self.chunk_keys.len() {
                break;
            }

            let mut buf = self.download_chunk(store, chunk_nr, chunk_offset, want).await?;
            crypt_bytes(&mut buf, chunk_offset, &self.chunk_keys[chunk_nr]);
            out.extend_from_slice(&buf);

            // Requests are bounded by kernel read buffers, far below
            // CHUNK_SIZE, so at most one extra round completes the read.
            let overflow = chunk_offset as i64 + want as i64 - CHUNK_SIZE;
            if overflow <= 0 {
                break;
            }
            offset = offset + want as u64 - overflow as u64;
            want = overflow as usize;
        }

        Ok(out)
    }

    /// Fetch bytes from one chunk, reopening all handles on transient
    /// stream errors while retries remain.
    async fn download_chunk(
        &mut self,
        store: &dyn ObjectStore,
        chunk_nr: usize,
        chunk_offset: u64,
        length: usize,
    ) -> Result<Vec<u8>, HandleError> {
        loop {
            // Opening a stream is expensive; handles are kept per chunk and
            // reused across reads.
            if !self.handles.contains_key(&chunk_nr) {
                debug!(chunk = chunk_nr, file_id = %self.file_ids[chunk_nr], "new chunk handle");
                let handle = FileHandle::open(store, &self.file_ids[chunk_nr], chunk_offset).await?;
                self.handles.insert(chunk_nr, handle);
            }

            let result = self
                .handles
                .get(&chunk_nr)
                .expect("handle inserted above")
                .download(chunk_offset, length)
                .await;

            match result {
                Ok(bytes) => return Ok(bytes),
                Err(e) if self.retries_left > 0 => {
                    warn!(
                        chunk = chunk_nr,
                        offset = chunk_offset,
                        retries_left = self.retries_left,
                        "chunk read failed, reopening handles: {e}"
                    );
                    self.release().await;
                    self.retries_left -= 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Close every per-chunk handle.
    pub(crate) async fn release(&mut self) {
        for (chunk_nr, handle) in self.handles.drain() {
            debug!(chunk = chunk_nr, "closing chunk handle");
            handle.close_and_clear().await;
        }
    }
}

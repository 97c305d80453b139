//! Per-chunk streaming reader with a bounded forward-only cache.
//!
//! One `FileHandle` wraps one open range request against a remote chunk
//! object. Reads must move (mostly) forward: the cache absorbs small
//! re-reads and the preload window absorbs reads slightly before the
//! requested start, but data evicted from the cache is gone and skipping
//! far ahead still downloads every byte in between.

use std::collections::VecDeque;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::trace;

use cfs_store::{ByteStream, ObjectStore, StoreError};

/// Cache ceiling per handle. Handles add up fast — one per open chunk.
pub const MAX_CACHE_SIZE: usize = 10 * 1024 * 1024;

/// How far before a requested offset the initial range read starts, so
/// small backward re-reads still hit the cache.
pub const PRELOAD_SIZE: u64 = 1024 * 1024;

/// Upper bound of the open-ended range request. Chunks cap at 1 GiB anyway;
/// the stream simply ends at EOF.
pub const MAX_FILE_SIZE: u64 = 20 * 1024 * 1024 * 1024;

/// Longest tolerated skip past the already-downloaded position. The skipped
/// bytes are still downloaded; this only bounds the damage.
pub const MAX_FORWARD_JUMP: u64 = 50 * 1024 * 1024;

/// Size of one upstream read and of one cache block.
pub const READ_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Debug, Error)]
pub enum HandleError {
    #[error("can't read backward: requested_offset={requested}, cache_start_offset={cache_start}")]
    ReadBackward { requested: u64, cache_start: u64 },

    #[error("requested offset too far ahead: requested_offset={requested}, stream_offset={stream}")]
    JumpTooFar { requested: u64, stream: u64 },

    #[error("upstream read failed: {0}")]
    Upstream(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One contiguous block of downloaded bytes and its absolute offset within
/// the chunk object.
struct CacheBlock {
    offset: u64,
    bytes: Bytes,
}

struct Inner {
    /// Open range request; `None` after `close_and_clear`.
    stream: Option<ByteStream>,
    /// Next not-yet-downloaded byte of the remote object.
    next_offset: u64,
    /// Downloaded blocks, oldest first. Never empty while the stream is
    /// open: construction seeds one block and eviction keeps the tail.
    cache: VecDeque<CacheBlock>,
}

/// A mutex serialises all public operations; upstream reads happen under
/// the lock.
pub struct FileHandle {
    inner: Mutex<Inner>,
}

impl FileHandle {
    /// Open a range request for `file_id` around `offset`.
    ///
    /// The request starts `PRELOAD_SIZE` early (clamped to 0) and one block
    /// is read eagerly so the cache is never empty afterwards. The block
    /// may be short or even empty for a zero-length object.
    pub async fn open(
        store: &dyn ObjectStore,
        file_id: &str,
        offset: u64,
    ) -> Result<Self, HandleError> {
        let start = offset.saturating_sub(PRELOAD_SIZE);
        let mut stream = store.read(file_id, start, MAX_FILE_SIZE).await?;

        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let n = stream.read(&mut buf).await?;
        buf.truncate(n);

        let mut cache = VecDeque::new();
        cache.push_back(CacheBlock {
            offset: start,
            bytes: buf.into(),
        });

        Ok(FileHandle {
            inner: Mutex::new(Inner {
                stream: Some(stream),
                next_offset: start + n as u64,
                cache,
            }),
        })
    }

    /// Return up to `length` bytes starting at `requested`. Less than
    /// `length` means the object ended; an empty result is EOF, not a
    /// failure.
    pub async fn download(&self, requested: u64, length: usize) -> Result<Vec<u8>, HandleError> {
        let mut inner = self.inner.lock().await;

        // Reading before the cache is gone for good.
        let cache_start = inner
            .cache
            .front()
            .map(|b| b.offset)
            .unwrap_or(inner.next_offset);
        if requested < cache_start {
            return Err(HandleError::ReadBackward {
                requested,
                cache_start,
            });
        }

        // Sequential-ish access only; huge skips would silently download
        // everything in between.
        if requested > inner.next_offset + MAX_FORWARD_JUMP {
            return Err(HandleError::JumpTooFar {
                requested,
                stream: inner.next_offset,
            });
        }

        // Fill: pull blocks until the request is covered or the object
        // ends. A request past EOF simply stops producing bytes.
        while requested + length as u64 > inner.next_offset {
            let Some(stream) = inner.stream.as_mut() else {
                break;
            };
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            buf.truncate(n);

            let offset = inner.next_offset;
            inner.cache.push_back(CacheBlock {
                offset,
                bytes: buf.into(),
            });
            inner.next_offset += n as u64;
        }

        // Locate, from the tail, the block the request starts in.
        let start_idx = inner
            .cache
            .iter()
            .rposition(|b| b.offset <= requested)
            .unwrap_or(0);

        // Gather until the requested length is covered or the chain ends.
        let block = &inner.cache[start_idx];
        // Clamped: an EOF over-read inside the jump window lands past the
        // block's end.
        let inner_offset = ((requested - block.offset) as usize).min(block.bytes.len());

        let mut out = Vec::with_capacity(length.min(MAX_CACHE_SIZE));
        out.extend_from_slice(&block.bytes[inner_offset..]);
        for block in inner.cache.iter().skip(start_idx + 1) {
            if out.len() >= length {
                break;
            }
            out.extend_from_slice(&block.bytes);
        }
        out.truncate(length);

        Self::evict(&mut inner.cache);

        trace!(requested, length, returned = out.len(), "download");
        Ok(out)
    }

    /// Drop oldest blocks until the cached total fits `MAX_CACHE_SIZE`.
    /// Tail-anchored: the newest blocks always survive.
    fn evict(cache: &mut VecDeque<CacheBlock>) {
        let mut kept = 0usize;
        let mut cut = 0usize;
        for (idx, block) in cache.iter().enumerate().rev() {
            if kept + block.bytes.len() > MAX_CACHE_SIZE {
                cut = idx + 1;
                break;
            }
            kept += block.bytes.len();
        }
        if cut > 0 {
            cache.drain(..cut);
        }
    }

    /// Close the upstream stream and drop the cache. Idempotent.
    pub async fn close_and_clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.stream = None;
        inner.next_offset = 0;
        inner.cache.clear();
    }

    #[cfg(test)]
    async fn cached_bytes(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.cache.iter().map(|b| b.bytes.len()).sum()
    }
}

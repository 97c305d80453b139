//! cfs-store: storage drivers behind one narrow contract.
//!
//! The rest of the system only sees [`ObjectStore`]: ranged reads by object
//! id, stream uploads, soft deletes and a cached flat listing of the watched
//! folder. Two drivers exist — the remote cloud driver
//! ([`cloud::CloudStore`], fed by a [`cloud::CloudApi`]) and a local-disk
//! driver ([`disk::DiskStore`]) that is mostly useful for tests and offline
//! setups.

pub mod cache;
pub mod cloud;
pub mod disk;
pub mod http;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncRead;

pub use cache::ListingCache;
pub use cloud::{CloudApi, CloudStore};
pub use disk::DiskStore;
pub use http::DriveApi;

/// A readable byte stream from the store. Dropping it closes the
/// connection.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("file list not initialised")]
    NotInitialised,

    #[error("api error: {0}")]
    Api(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One object in the store's listing. `mtime` is unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteObject {
    pub id: String,
    pub name: String,
    pub size: i64,
    pub mtime: i64,
}

/// The storage contract every driver provides.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Open a byte stream for `id`, starting at `offset` and bounded by
    /// `upper` with HTTP-style `Range: bytes=offset-upper` semantics. The
    /// stream may end earlier at EOF; an over-large bound is harmless.
    async fn read(&self, id: &str, offset: u64, upper: u64) -> StoreResult<ByteStream>;

    /// Store the stream under `name` and return the new object id. With
    /// `max_bytes > 0` at most that many bytes are consumed, otherwise the
    /// reader is drained to EOF. Names are not guaranteed unique.
    async fn save(&self, name: &str, reader: ByteStream, max_bytes: u64) -> StoreResult<String>;

    /// Soft-delete; whether the object can be restored is driver-defined.
    async fn trash(&self, id: &str) -> StoreResult<()>;

    /// Populate the in-memory listing of the watched folder. May be slow;
    /// must run at least once before [`Self::update_file_list`].
    async fn init_file_list(&self) -> StoreResult<()>;

    /// Bring the listing up to date. Much cheaper than a full re-list for
    /// drivers with a change stream.
    async fn update_file_list(&self) -> StoreResult<()>;

    /// A defensive copy of the current listing, keyed by object id. Offline.
    async fn file_list(&self) -> HashMap<String, RemoteObject>;
}

//! Persisted remote listing for fast restarts.
//!
//! The cache stores the full listing plus the change-page cursor, tagged
//! with a signature binding it to the watched folder and account. A
//! signature mismatch (different folder, different credentials) discards
//! the cache; a matching cache must still survive one live change-diff
//! before the driver accepts it.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::RemoteObject;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingCache {
    pub file_list: HashMap<String, RemoteObject>,
    pub change_start_page_token: String,
    pub cache_sig: String,
}

impl ListingCache {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("reading listing cache: {}", path.display()))?;
        ciborium::from_reader(bytes.as_slice())
            .with_context(|| format!("decoding listing cache: {}", path.display()))
    }

    /// Write atomically (temp file, then rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).context("encoding listing cache")?;

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &buf)
            .with_context(|| format!("writing listing cache: {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("renaming listing cache: {}", path.display()))?;
        Ok(())
    }
}

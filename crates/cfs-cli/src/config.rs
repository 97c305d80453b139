//! Optional TOML configuration, merged under the command line flags.
//!
//! Everything has a sensible default, so the config file is only needed to
//! avoid repeating flags.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CfsConfig {
    pub key: Option<PathBuf>,
    pub db: Option<PathBuf>,
    pub storage: StorageConfig,
    pub mount: MountSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// "drive" or "local".
    pub module: Option<String>,
    /// Folder id (drive) or directory path (local).
    pub dest: Option<String>,
    /// OAuth token file for the drive module.
    pub token: Option<PathBuf>,
    /// Override the drive API base URL (tests, proxies).
    pub api_base: Option<String>,
    /// Name of the database object in the chunk folder.
    pub db_file_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MountSection {
    /// Database refresh throttle in seconds.
    pub interval: Option<u64>,
    /// Listing cache file; empty disables the cache.
    pub cache: Option<PathBuf>,
    pub allow_other: Option<bool>,
}

impl CfsConfig {
    /// Load the file when it exists; defaults otherwise.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(CfsConfig::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config: {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_file_missing() {
        let cfg = CfsConfig::load(Path::new("/does/not/exist.toml")).unwrap();
        assert!(cfg.key.is_none());
        assert!(cfg.storage.module.is_none());
    }

    #[test]
    fn parses_partial_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cfs.toml");
        std::fs::write(
            &path,
            r#"
key = "/etc/cfs/cfs.key"

[storage]
module = "drive"
dest = "folder-id-123"
db_file_name = "index.db"

[mount]
interval = 120
"#,
        )
        .unwrap();

        let cfg = CfsConfig::load(&path).unwrap();
        assert_eq!(cfg.key.as_deref(), Some(Path::new("/etc/cfs/cfs.key")));
        assert_eq!(cfg.storage.module.as_deref(), Some("drive"));
        assert_eq!(cfg.storage.dest.as_deref(), Some("folder-id-123"));
        assert_eq!(cfg.mount.interval, Some(120));
        assert!(cfg.mount.cache.is_none());
    }

    #[test]
    fn rejects_bad_toml() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cfs.toml");
        std::fs::write(&path, "key = [broken").unwrap();
        assert!(CfsConfig::load(&path).is_err());
    }
}

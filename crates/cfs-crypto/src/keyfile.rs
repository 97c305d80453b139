//! Key schedule: 128-byte key file → three derived secrets.

use std::fmt;
use std::path::Path;

use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Sha256, Sha512};
use zeroize::Zeroize;

use cfs_core::{CfsError, CfsResult};

use crate::{CHUNK_KEY_LEN, CHUNK_NAME_LEN};

/// Exact size of the key file on disk.
pub const KEY_FILE_LEN: usize = 128;

const SECRET_LEN: usize = 64;

/// The three derived secrets. Immutable after load; zeroized on drop.
#[derive(Clone)]
pub struct KeySchedule {
    /// Chunk encryption keys are derived from this.
    crypt_secret: Vec<u8>,
    /// Remote chunk names are derived from this.
    hash_secret: Vec<u8>,
    /// The index-db key is derived from this.
    index_secret: Vec<u8>,
}

impl KeySchedule {
    /// Load the key file and derive the secrets. The file must be exactly
    /// [`KEY_FILE_LEN`] bytes; anything else is a configuration error.
    pub fn load(path: &Path) -> CfsResult<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| CfsError::Config(format!("can't read key file {}: {e}", path.display())))?;

        if bytes.len() != KEY_FILE_LEN {
            return Err(CfsError::Config(format!(
                "key file must be exactly {} bytes long (read {} bytes)",
                KEY_FILE_LEN,
                bytes.len()
            )));
        }

        let mut crypt_secret = vec![0u8; SECRET_LEN];
        let mut hash_secret = vec![0u8; SECRET_LEN];
        let mut index_secret = vec![0u8; SECRET_LEN];
        pbkdf2_hmac::<Sha512>(&bytes[..64], b"master_secret", 60_000, &mut crypt_secret);
        pbkdf2_hmac::<Sha512>(&bytes[64..], b"hash_secret", 60_000, &mut hash_secret);
        pbkdf2_hmac::<Sha512>(&bytes[32..96], b"index_secret", 99_999, &mut index_secret);

        Ok(KeySchedule {
            crypt_secret,
            hash_secret,
            index_secret,
        })
    }

    /// Per-chunk AES-256 key, derived from the crypt secret and the SHA-512
    /// over the chunk's plaintext.
    pub fn chunk_key(&self, chunk_hash: &[u8]) -> [u8; CHUNK_KEY_LEN] {
        let mut key = [0u8; CHUNK_KEY_LEN];
        pbkdf2_hmac::<Sha256>(&self.crypt_secret, chunk_hash, 10_000, &mut key);
        key
    }

    /// Raw remote name for a chunk. Deterministic per hash, so equal
    /// plaintexts dedup across the deployment while leaking nothing else.
    pub fn chunk_name(&self, chunk_hash: &[u8]) -> [u8; CHUNK_NAME_LEN] {
        let mut name = [0u8; CHUNK_NAME_LEN];
        pbkdf2_hmac::<Sha512>(&self.hash_secret, chunk_hash, 500, &mut name);
        name
    }

    /// Remote chunk name as the 128 lowercase hex characters used on the
    /// object store.
    pub fn chunk_name_hex(&self, chunk_hash: &[u8]) -> String {
        hex::encode(self.chunk_name(chunk_hash))
    }

    /// AES-256 key for the index database.
    pub fn db_key(&self) -> [u8; CHUNK_KEY_LEN] {
        let mut key = [0u8; CHUNK_KEY_LEN];
        pbkdf2_hmac::<Sha256>(&self.index_secret, b"dbkey", 5_000, &mut key);
        key
    }

    #[cfg(test)]
    pub(crate) fn from_secrets(crypt: Vec<u8>, hash: Vec<u8>, index: Vec<u8>) -> Self {
        KeySchedule {
            crypt_secret: crypt,
            hash_secret: hash,
            index_secret: index,
        }
    }

    #[cfg(test)]
    pub(crate) fn secrets(&self) -> (&[u8], &[u8], &[u8]) {
        (&self.crypt_secret, &self.hash_secret, &self.index_secret)
    }
}

impl Drop for KeySchedule {
    fn drop(&mut self) {
        self.crypt_secret.zeroize();
        self.hash_secret.zeroize();
        self.index_secret.zeroize();
    }
}

impl fmt::Debug for KeySchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySchedule")
            .field("crypt_secret", &"[REDACTED]")
            .field("hash_secret", &"[REDACTED]")
            .field("index_secret", &"[REDACTED]")
            .finish()
    }
}

/// Write a fresh key file of [`KEY_FILE_LEN`] random bytes, mode 0600.
///
/// An existing file is never overwritten. The new file is loaded once before
/// returning so a broken write surfaces immediately.
pub fn generate_keyfile(path: &Path) -> CfsResult<()> {
    if path.exists() {
        return Err(CfsError::Config(format!(
            "key file already exists: {}",
            path.display()
        )));
    }

    let mut key = [0u8; KEY_FILE_LEN];
    OsRng.fill_bytes(&mut key);

    write_private(path, &key)?;
    key.zeroize();

    // Trial load: the generated file must round-trip through the schedule.
    let schedule = KeySchedule::load(path)?;
    let _ = schedule.db_key();
    Ok(())
}

#[cfg(unix)]
fn write_private(path: &Path, data: &[u8]) -> CfsResult<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut fh = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    fh.write_all(data)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &Path, data: &[u8]) -> CfsResult<()> {
    std::fs::write(path, data)?;
    Ok(())
}

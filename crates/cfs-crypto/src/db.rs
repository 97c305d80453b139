//! Encrypted index-database codec.
//!
//! On-disk format: 12-byte GCM nonce ‖ AES-256-GCM(ciphertext ‖ tag) over
//! the CBOR-serialized map. The CBOR bytes are internal; only the
//! nonce-plus-sealed layout is a contract.

use std::path::Path;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

use cfs_core::{CfsError, CfsResult, IndexDb};

use crate::CHUNK_KEY_LEN;

/// Standard GCM nonce length.
pub const NONCE_LEN: usize = 12;

/// Codec failures. All are fatal for the caller, but they are reported
/// distinctly: a truncated blob, a failed authentication and a broken
/// serialization are different operational problems.
#[derive(Debug, Error)]
pub enum DbCodecError {
    #[error("db blob is too short ({0} bytes)")]
    TooShort(usize),

    #[error("db authentication failed (wrong key or corrupted data)")]
    Auth,

    #[error("db serialization failed: {0}")]
    Encode(String),

    #[error("db deserialization failed: {0}")]
    Decode(String),
}

/// Serialize and seal the database: fresh random nonce, then AES-256-GCM.
pub fn encode_db(db: &IndexDb, key: &[u8; CHUNK_KEY_LEN]) -> Result<Vec<u8>, DbCodecError> {
    let mut plaintext = Vec::new();
    ciborium::into_writer(db, &mut plaintext).map_err(|e| DbCodecError::Encode(e.to_string()))?;

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let cipher = Aes256Gcm::new(key.into());
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
        .map_err(|_| DbCodecError::Encode("GCM seal failed".into()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Open and deserialize a sealed database blob.
pub fn decode_db(blob: &[u8], key: &[u8; CHUNK_KEY_LEN]) -> Result<IndexDb, DbCodecError> {
    if blob.len() < NONCE_LEN + 1 {
        return Err(DbCodecError::TooShort(blob.len()));
    }

    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);

    let cipher = Aes256Gcm::new(key.into());
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| DbCodecError::Auth)?;

    ciborium::from_reader(plaintext.as_slice()).map_err(|e| DbCodecError::Decode(e.to_string()))
}

/// Seal the database into a file, overwriting any previous content.
pub fn db_to_file(path: &Path, key: &[u8; CHUNK_KEY_LEN], db: &IndexDb) -> CfsResult<()> {
    let blob = encode_db(db, key).map_err(|e| CfsError::Crypto(e.to_string()))?;
    std::fs::write(path, blob)?;
    Ok(())
}

/// Load a database file. A missing file yields an empty database (first
/// run); any other failure is reported.
pub fn db_from_file(path: &Path, key: &[u8; CHUNK_KEY_LEN]) -> CfsResult<IndexDb> {
    if !path.exists() {
        return Ok(IndexDb::new());
    }
    let blob = std::fs::read(path)?;
    decode_db(&blob, key).map_err(|e| CfsError::Crypto(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfs_core::{ChunkHash, FileEntry, FolderEntry};
    use sha2::{Digest, Sha256, Sha512};

    fn test_key() -> [u8; CHUNK_KEY_LEN] {
        Sha256::digest(b"was geht up key").into()
    }

    fn sample_db() -> IndexDb {
        let chunk = |data: &[u8]| ChunkHash::try_from(Sha512::digest(data).as_slice()).unwrap();

        let mut db = IndexDb::new();
        db.insert(
            ".".into(),
            FileEntry {
                size: 0,
                mtime: 34,
                is_file: false,
                chunks: vec![],
                children: vec![
                    FolderEntry {
                        name: "file".into(),
                        is_file: true,
                    },
                    FolderEntry {
                        name: "folder".into(),
                        is_file: false,
                    },
                ],
            },
        );
        db.insert(
            "hallo".into(),
            FileEntry {
                size: 444,
                mtime: 34,
                is_file: true,
                chunks: vec![chunk(b"eins")],
                children: vec![],
            },
        );
        db.insert(
            "großes haus".into(),
            FileEntry {
                size: 1_234_567,
                mtime: 44,
                is_file: true,
                chunks: vec![chunk(b"zwei"), chunk(b"drei")],
                children: vec![],
            },
        );
        db.insert("leer".into(), FileEntry::default());
        db
    }

    #[test]
    fn roundtrip() {
        let db = sample_db();
        let blob = encode_db(&db, &test_key()).unwrap();
        let back = decode_db(&blob, &test_key()).unwrap();
        assert_eq!(back, db);
    }

    #[test]
    fn nonce_is_fresh_per_encode() {
        let db = sample_db();
        let blob1 = encode_db(&db, &test_key()).unwrap();
        let blob2 = encode_db(&db, &test_key()).unwrap();

        assert_ne!(&blob1[..NONCE_LEN], &blob2[..NONCE_LEN], "nonce reused");
        assert_ne!(&blob1[NONCE_LEN..], &blob2[NONCE_LEN..], "ciphertext equal");

        assert_eq!(decode_db(&blob1, &test_key()).unwrap(), db);
        assert_eq!(decode_db(&blob2, &test_key()).unwrap(), db);
    }

    #[test]
    fn wrong_key_fails_auth() {
        let blob = encode_db(&sample_db(), &test_key()).unwrap();
        let wrong: [u8; CHUNK_KEY_LEN] = Sha256::digest(b"not the key").into();
        assert!(matches!(decode_db(&blob, &wrong), Err(DbCodecError::Auth)));
    }

    #[test]
    fn tampered_blob_fails_auth() {
        let mut blob = encode_db(&sample_db(), &test_key()).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        assert!(matches!(decode_db(&blob, &test_key()), Err(DbCodecError::Auth)));
    }

    #[test]
    fn short_blob_is_rejected() {
        assert!(matches!(
            decode_db(&[0u8; NONCE_LEN], &test_key()),
            Err(DbCodecError::TooShort(_))
        ));
        assert!(matches!(
            decode_db(b"hallo error", &test_key()),
            Err(DbCodecError::TooShort(_))
        ));
    }

    #[test]
    fn file_helpers_roundtrip_and_bootstrap() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("index.db");

        // Missing file bootstraps an empty database.
        assert!(db_from_file(&path, &test_key()).unwrap().is_empty());

        let db = sample_db();
        db_to_file(&path, &test_key(), &db).unwrap();
        assert_eq!(db_from_file(&path, &test_key()).unwrap(), db);
    }
}

//! Index database types.
//!
//! The database is an ordered map from relative path to [`FileEntry`]. The
//! root directory is keyed by `"."`. Only `size`, `mtime` and the file/folder
//! distinction matter for attributes; everything else the filesystem reports
//! is static.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::CHUNK_SIZE;

/// The index database: relative path → entry. `BTreeMap` keeps the encoding
/// stable across runs.
pub type IndexDb = BTreeMap<String, FileEntry>;

/// One path in the index database.
///
/// Files carry `chunks`, the full ordered chunk-hash list; directories carry
/// `children`, their immediate content (needed for a fast `readdir`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Size in bytes (0 for directories).
    pub size: i64,
    /// Last modification, seconds since the epoch.
    pub mtime: u64,
    /// true = file, false = directory.
    pub is_file: bool,
    /// If file: the chunk hashes in file order. Empty files have an empty
    /// list; a zero-length chunk is never recorded.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<ChunkHash>,
    /// If directory: the immediate children, sorted by name.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FolderEntry>,
}

/// A directory child: name plus the file/folder distinction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderEntry {
    pub name: String,
    pub is_file: bool,
}

/// SHA-512 over the plaintext of one chunk; the chunk's logical identity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkHash([u8; 64]);

impl ChunkHash {
    pub const LEN: usize = 64;

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl TryFrom<&[u8]> for ChunkHash {
    type Error = crate::CfsError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let arr: [u8; 64] = bytes.try_into().map_err(|_| {
            crate::CfsError::Scan(format!(
                "chunk hash must be {} bytes, got {}",
                Self::LEN,
                bytes.len()
            ))
        })?;
        Ok(ChunkHash(arr))
    }
}

impl fmt::Debug for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkHash({}…)", hex::encode(&self.0[..8]))
    }
}

// 64-byte arrays have no serde derive; encode as a raw byte string so the
// CBOR stays compact.
impl Serialize for ChunkHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for ChunkHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HashVisitor;

        impl<'de> Visitor<'de> for HashVisitor {
            type Value = ChunkHash;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a 64-byte chunk hash")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                ChunkHash::try_from(v).map_err(|_| E::invalid_length(v.len(), &self))
            }

            fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                self.visit_bytes(&v)
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut arr = [0u8; 64];
                for (i, slot) in arr.iter_mut().enumerate() {
                    *slot = seq
                        .next_element()?
                        .ok_or_else(|| de::Error::invalid_length(i, &self))?;
                }
                Ok(ChunkHash(arr))
            }
        }

        deserializer.deserialize_bytes(HashVisitor)
    }
}

/// Size of chunk `chunk_nr` of a file with `file_size` plaintext bytes.
///
/// Full chunks are `CHUNK_SIZE` long, the final chunk holds the remainder
/// and every chunk past the end is 0.
pub fn chunk_size(chunk_nr: usize, file_size: i64) -> i64 {
    let end = (chunk_nr as i64 + 1) * CHUNK_SIZE;

    if end <= file_size {
        return CHUNK_SIZE;
    }
    if end - file_size > CHUNK_SIZE {
        return 0;
    }
    file_size % CHUNK_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha512};

    #[test]
    fn chunk_hash_from_sha512() {
        let digest = Sha512::digest(b"test");
        let hash = ChunkHash::try_from(digest.as_slice()).unwrap();

        let expected = hex::decode(
            "ee26b0dd4af7e749aa1a8ee3c10ae9923f618980772e473f8819a5d4940e0db2\
             7ac185f8a0e1d5f84f88bc887fd67b143732c304cc5fa9ad8e6f57f50028a8ff",
        )
        .unwrap();
        assert_eq!(hash.as_bytes().as_slice(), expected.as_slice());
    }

    #[test]
    fn chunk_hash_rejects_wrong_length() {
        assert!(ChunkHash::try_from(&[0u8; 63][..]).is_err());
        assert!(ChunkHash::try_from(&[0u8; 65][..]).is_err());
    }

    #[test]
    fn chunk_hash_cbor_roundtrip() {
        let hash = ChunkHash::try_from(Sha512::digest(b"roundtrip").as_slice()).unwrap();
        let mut buf = Vec::new();
        ciborium::into_writer(&hash, &mut buf).unwrap();
        let back: ChunkHash = ciborium::from_reader(buf.as_slice()).unwrap();
        assert_eq!(hash, back);
    }

    #[test]
    fn chunk_size_empty_file() {
        assert_eq!(chunk_size(0, 0), 0);
        assert_eq!(chunk_size(1, 0), 0);
    }

    #[test]
    fn chunk_size_small_file() {
        assert_eq!(chunk_size(0, 17), 17);
        assert_eq!(chunk_size(1, 17), 0);
        assert_eq!(chunk_size(2, 17), 0);
    }

    #[test]
    fn chunk_size_multi_chunk_file() {
        let size = CHUNK_SIZE * 3 + 99;
        assert_eq!(chunk_size(0, size), CHUNK_SIZE);
        assert_eq!(chunk_size(1, size), CHUNK_SIZE);
        assert_eq!(chunk_size(2, size), CHUNK_SIZE);
        assert_eq!(chunk_size(3, size), 99);
        assert_eq!(chunk_size(4, size), 0);
        assert_eq!(chunk_size(5, size), 0);
    }

    #[test]
    fn chunk_size_at_boundaries() {
        assert_eq!(chunk_size(0, CHUNK_SIZE), CHUNK_SIZE);
        assert_eq!(chunk_size(1, CHUNK_SIZE), 0);
        assert_eq!(chunk_size(3, CHUNK_SIZE), 0);

        assert_eq!(chunk_size(0, CHUNK_SIZE - 1), CHUNK_SIZE - 1);
        assert_eq!(chunk_size(1, CHUNK_SIZE - 1), 0);

        assert_eq!(chunk_size(0, CHUNK_SIZE + 1), CHUNK_SIZE);
        assert_eq!(chunk_size(1, CHUNK_SIZE + 1), 1);
        assert_eq!(chunk_size(2, CHUNK_SIZE + 1), 0);
    }

    #[test]
    fn chunk_size_sums_to_file_size() {
        for &size in &[0i64, 1, 17, CHUNK_SIZE - 1, CHUNK_SIZE, CHUNK_SIZE + 1, CHUNK_SIZE * 3 + 99]
        {
            let total: i64 = (0..8).map(|i| chunk_size(i, size)).sum();
            assert_eq!(total, size, "sum law violated for size {size}");
        }
    }
}

//! cfs-crypto: client-side encryption for chunkfuse
//!
//! Key hierarchy, derived from a 128-byte random key file:
//! ```text
//! key file (128 random bytes)
//!   ├── crypt secret  = PBKDF2-SHA512(bytes[0..64],  "master_secret", 60000)
//!   │     └── per-chunk AES-256-CTR key = PBKDF2-SHA256(crypt, chunk_hash, 10000)
//!   ├── hash secret   = PBKDF2-SHA512(bytes[64..128], "hash_secret",  60000)
//!   │     └── remote chunk name = PBKDF2-SHA512(hash, chunk_hash, 500) as hex
//!   └── index secret  = PBKDF2-SHA512(bytes[32..96], "index_secret", 99999)
//!         └── index-db AES-256-GCM key = PBKDF2-SHA256(index, "dbkey", 5000)
//! ```
//!
//! Every iteration count, length and salt is part of the on-disk contract;
//! changing any of them silently invalidates all existing data.

pub mod cipher;
pub mod db;
pub mod keyfile;

pub use cipher::{crypt_bytes, CryptReader};
pub use db::{db_from_file, db_to_file, decode_db, encode_db, DbCodecError, NONCE_LEN};
pub use keyfile::{generate_keyfile, KeySchedule, KEY_FILE_LEN};

/// AES-256 key length.
pub const CHUNK_KEY_LEN: usize = 32;

/// Raw length of a derived remote chunk name (rendered as 128 hex chars).
pub const CHUNK_NAME_LEN: usize = 64;

//! Per-chunk AES-256-CTR with random-access offsets.
//!
//! There is no nonce: every chunk has its own derived key, the counter
//! starts at 0 and increments per 16-byte AES block, and there is no
//! padding. Encrypting and decrypting are the same operation.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};

use crate::CHUNK_KEY_LEN;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// En/decrypt `data` in place as if it started at byte `offset` of its
/// chunk.
///
/// The keystream position is the absolute chunk offset: block
/// `offset / 16`, big-endian counter, plus the intra-block remainder.
/// `data` may be empty.
pub fn crypt_bytes(data: &mut [u8], offset: u64, chunk_key: &[u8; CHUNK_KEY_LEN]) {
    let iv = [0u8; 16];
    let mut cipher = Aes256Ctr::new(chunk_key.into(), &iv.into());
    cipher.seek(offset);
    cipher.apply_keystream(data);
}

/// Wraps a reader and encrypts (or decrypts) everything flowing through it,
/// tracking the cumulative chunk offset. Used to stream plaintext chunks to
/// the object store without buffering them.
pub struct CryptReader<R> {
    inner: R,
    chunk_key: [u8; CHUNK_KEY_LEN],
    offset: u64,
}

impl<R> CryptReader<R> {
    pub fn new(inner: R, chunk_key: [u8; CHUNK_KEY_LEN]) -> Self {
        CryptReader {
            inner,
            chunk_key,
            offset: 0,
        }
    }
}

impl<R: tokio::io::AsyncRead + Unpin> tokio::io::AsyncRead for CryptReader<R> {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();

        match std::pin::Pin::new(&mut this.inner).poll_read(cx, buf) {
            std::task::Poll::Ready(Ok(())) => {
                let fresh = &mut buf.filled_mut()[before..];
                crypt_bytes(fresh, this.offset, &this.chunk_key);
                this.offset += fresh.len() as u64;
                std::task::Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

//! Crypto primitives for PeerVault
//!
//! Node identifier generation, key-id hashing, and the streaming
//! AES-256-CTR pipeline used to encrypt blobs on the wire. The cipher
//! prepends a fresh random IV to every stream, so ciphertext is always
//! exactly `IV_LEN` bytes longer than the plaintext.

use aes::cipher::{KeyIvInit, StreamCipher};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Length of the random IV prepended to every encrypted stream.
pub const IV_LEN: usize = 16;

/// Length of an encryption key and of a raw node identifier.
pub const KEY_LEN: usize = 32;

/// Size of the read-encrypt-write chunks.
const CHUNK_SIZE: usize = 32 * 1024;

/// Crypto error types
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("entropy source failure: {0}")]
    Entropy(String),
    #[error("invalid key encoding: {0}")]
    InvalidKey(String),
    #[error("stream ended before the {IV_LEN}-byte IV")]
    MissingIv,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A 32-byte symmetric key shared by every node in a vault network.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    /// Generate a fresh random key.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut buf = [0u8; KEY_LEN];
        OsRng
            .try_fill_bytes(&mut buf)
            .map_err(|e| CryptoError::Entropy(e.to_string()))?;
        Ok(Self(buf))
    }

    /// Build a key from raw bytes, padding or truncating to 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = [0u8; KEY_LEN];
        if bytes.len() != KEY_LEN {
            warn!(
                supplied = bytes.len(),
                expected = KEY_LEN,
                "encryption key has wrong length, padding/truncating"
            );
        }
        let n = bytes.len().min(KEY_LEN);
        buf[..n].copy_from_slice(&bytes[..n]);
        Self(buf)
    }

    /// Build a key from a hex string.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s.trim()).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self::from_bytes(&bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// Generate a random node identifier, rendered as 64 hex characters.
pub fn generate_node_id() -> Result<String, CryptoError> {
    let mut buf = [0u8; KEY_LEN];
    OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|e| CryptoError::Entropy(e.to_string()))?;
    Ok(hex::encode(buf))
}

/// Derive the key-id for a user-supplied blob name.
///
/// Stable across nodes; this is the on-disk and on-wire address of the
/// blob, not a secret.
pub fn hash_key(name: &str) -> String {
    hex::encode(Sha256::digest(name.as_bytes()))
}

/// Encrypt `src` into `dst` in AES-256-CTR, prepending a fresh IV.
///
/// Returns the number of bytes written to `dst`, IV included, so the
/// result is always `plaintext_len + IV_LEN`.
pub async fn encrypt_stream<R, W>(
    key: &EncryptionKey,
    src: &mut R,
    dst: &mut W,
) -> Result<u64, CryptoError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut iv = [0u8; IV_LEN];
    OsRng
        .try_fill_bytes(&mut iv)
        .map_err(|e| CryptoError::Entropy(e.to_string()))?;
    dst.write_all(&iv).await?;

    let mut cipher = Aes256Ctr::new(key.as_bytes().into(), (&iv).into());
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut written = IV_LEN as u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..n]);
        dst.write_all(&buf[..n]).await?;
        written += n as u64;
    }
    dst.flush().await?;
    Ok(written)
}

/// Decrypt a stream produced by [`encrypt_stream`].
///
/// Reads the leading IV from `src` and decrypts the remainder into
/// `dst`. The returned count covers plaintext bytes only.
pub async fn decrypt_stream<R, W>(
    key: &EncryptionKey,
    src: &mut R,
    dst: &mut W,
) -> Result<u64, CryptoError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut iv = [0u8; IV_LEN];
    src.read_exact(&mut iv).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            CryptoError::MissingIv
        } else {
            CryptoError::Io(e)
        }
    })?;

    let mut cipher = Aes256Ctr::new(key.as_bytes().into(), (&iv).into());
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut written = 0u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..n]);
        dst.write_all(&buf[..n]).await?;
        written += n as u64;
    }
    dst.flush().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn encrypt_to_vec(key: &EncryptionKey, data: &[u8]) -> (u64, Vec<u8>) {
        let mut out = Cursor::new(Vec::new());
        let n = encrypt_stream(key, &mut &data[..], &mut out).await.unwrap();
        (n, out.into_inner())
    }

    #[tokio::test]
    async fn encrypt_decrypt_round_trip() {
        let key = EncryptionKey::generate().unwrap();
        let data = b"some not so important data".to_vec();

        let (n, ciphertext) = encrypt_to_vec(&key, &data).await;
        assert_eq!(n, data.len() as u64 + IV_LEN as u64);
        assert_eq!(ciphertext.len(), data.len() + IV_LEN);
        assert_ne!(&ciphertext[IV_LEN..], &data[..]);

        let mut plaintext = Cursor::new(Vec::new());
        let m = decrypt_stream(&key, &mut &ciphertext[..], &mut plaintext)
            .await
            .unwrap();
        assert_eq!(m, data.len() as u64);
        assert_eq!(plaintext.into_inner(), data);
    }

    #[tokio::test]
    async fn empty_payload_still_carries_iv() {
        let key = EncryptionKey::generate().unwrap();
        let (n, ciphertext) = encrypt_to_vec(&key, b"").await;
        assert_eq!(n, IV_LEN as u64);
        assert_eq!(ciphertext.len(), IV_LEN);

        let mut plaintext = Cursor::new(Vec::new());
        let m = decrypt_stream(&key, &mut &ciphertext[..], &mut plaintext)
            .await
            .unwrap();
        assert_eq!(m, 0);
        assert!(plaintext.into_inner().is_empty());
    }

    #[tokio::test]
    async fn fresh_iv_per_stream() {
        let key = EncryptionKey::generate().unwrap();
        let data = b"same plaintext";
        let (_, a) = encrypt_to_vec(&key, data).await;
        let (_, b) = encrypt_to_vec(&key, data).await;
        assert_ne!(a[..IV_LEN], b[..IV_LEN]);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn large_payload_spans_chunks() {
        let key = EncryptionKey::generate().unwrap();
        let data: Vec<u8> = (0..(CHUNK_SIZE * 3 + 17)).map(|i| i as u8).collect();

        let (_, ciphertext) = encrypt_to_vec(&key, &data).await;
        let mut plaintext = Cursor::new(Vec::new());
        decrypt_stream(&key, &mut &ciphertext[..], &mut plaintext)
            .await
            .unwrap();
        assert_eq!(plaintext.into_inner(), data);
    }

    #[tokio::test]
    async fn truncated_stream_is_missing_iv() {
        let key = EncryptionKey::generate().unwrap();
        let short = [0u8; IV_LEN - 1];
        let mut out = Cursor::new(Vec::new());
        let err = decrypt_stream(&key, &mut &short[..], &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, CryptoError::MissingIv));
    }

    #[test]
    fn key_is_padded_or_truncated() {
        let short = EncryptionKey::from_bytes(b"short");
        assert_eq!(&short.as_bytes()[..5], b"short");
        assert_eq!(short.as_bytes()[5..], [0u8; 27]);

        let long = EncryptionKey::from_bytes(&[7u8; 40]);
        assert_eq!(long.as_bytes(), &[7u8; 32]);
    }

    #[test]
    fn key_from_hex() {
        let key = EncryptionKey::from_hex(&"01".repeat(32)).unwrap();
        assert_eq!(key.as_bytes(), &[1u8; 32]);
        assert!(EncryptionKey::from_hex("not hex").is_err());
    }

    #[test]
    fn hash_key_is_stable_hex() {
        let a = hash_key("hello.txt");
        let b = hash_key("hello.txt");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.bytes().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, hash_key("other.txt"));
    }

    #[test]
    fn node_ids_are_unique() {
        let a = generate_node_id().unwrap();
        let b = generate_node_id().unwrap();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }
}

//! Content-addressed blob store.
//!
//! Blobs live at `<root>/<owner-node-id>/<seg1>/<seg2>/.../<key-id>`,
//! where the segments are fixed-width slices of the hex key-id and the
//! leaf is the full key-id. The store never encrypts; callers wrap the
//! source or sink with a cipher filter as needed.

use parking_lot::Mutex;
use peervault_crypto::{decrypt_stream, hash_key, CryptoError, EncryptionKey};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::debug;

/// Width of one directory segment of the content address.
pub const SEGMENT_LEN: usize = 5;

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("blob {key_id} not found under owner {owner}")]
    NotFound { owner: String, key_id: String },
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Relative location of a blob below its owner directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathAddress {
    pub segments: Vec<String>,
    pub leaf: String,
}

impl PathAddress {
    /// Top-level subtree used for whole-key deletion.
    pub fn first_segment(&self) -> &str {
        self.segments.first().map(String::as_str).unwrap_or(&self.leaf)
    }

    /// Directory chain below the owner directory.
    pub fn dir(&self) -> PathBuf {
        self.segments.iter().collect()
    }

    /// Full relative path, leaf included.
    pub fn full(&self) -> PathBuf {
        self.dir().join(&self.leaf)
    }
}

/// Split a key-id into fixed-width segments: `seg1/seg2/.../<key-id>`.
///
/// Trailing characters that do not fill a whole segment stay out of the
/// directory chain; the leaf always carries the full key-id.
pub fn content_address(key_id: &str) -> PathAddress {
    let whole = key_id.len() / SEGMENT_LEN;
    let segments = (0..whole)
        .map(|i| key_id[i * SEGMENT_LEN..(i + 1) * SEGMENT_LEN].to_string())
        .collect();
    PathAddress {
        segments,
        leaf: key_id.to_string(),
    }
}

/// Information about one stored blob, as reported by [`Store::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Original user key, or a `file_<prefix>` placeholder when unknown.
    pub key: String,
    /// Hex key-id (the on-disk leaf name).
    pub key_id: String,
    pub size: u64,
    pub owner: String,
}

/// On-disk content-addressed store rooted at a single directory.
pub struct Store {
    root: PathBuf,
    /// Best-effort side table mapping key-ids back to user keys so that
    /// `list` can show human names. In-memory only, never authoritative.
    key_names: Mutex<HashMap<String, String>>,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            key_names: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn owner_dir(&self, owner: &str) -> PathBuf {
        self.root.join(owner)
    }

    fn blob_path(&self, owner: &str, key_id: &str) -> PathBuf {
        self.owner_dir(owner).join(content_address(key_id).full())
    }

    /// Check whether a blob exists for a user key.
    pub async fn has(&self, owner: &str, key: &str) -> Result<bool, StoreError> {
        self.has_id(owner, &hash_key(key)).await
    }

    /// Check whether a blob exists for a key-id.
    pub async fn has_id(&self, owner: &str, key_id: &str) -> Result<bool, StoreError> {
        match fs::metadata(self.blob_path(owner, key_id)).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Stream `src` into the blob for a user key, recording the name
    /// mapping. Returns the number of bytes written.
    pub async fn write<R>(&self, owner: &str, key: &str, src: &mut R) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let key_id = hash_key(key);
        self.register_name(&key_id, key);
        self.write_id(owner, &key_id, src).await
    }

    /// Stream `src` into the blob addressed by a key-id.
    pub async fn write_id<R>(&self, owner: &str, key_id: &str, src: &mut R) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut file = self.create_blob(owner, key_id).await?;
        let n = tokio::io::copy(src, &mut file).await?;
        file.flush().await?;
        Ok(n)
    }

    /// Stream `src` through the decryption filter into the blob
    /// addressed by a key-id. Returns plaintext bytes written.
    pub async fn write_decrypt_id<R>(
        &self,
        enc_key: &EncryptionKey,
        owner: &str,
        key_id: &str,
        src: &mut R,
    ) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut file = self.create_blob(owner, key_id).await?;
        let n = decrypt_stream(enc_key, src, &mut file).await?;
        Ok(n)
    }

    async fn create_blob(&self, owner: &str, key_id: &str) -> Result<File, StoreError> {
        let addr = content_address(key_id);
        let dir = self.owner_dir(owner).join(addr.dir());
        fs::create_dir_all(&dir).await?;
        Ok(File::create(dir.join(&addr.leaf)).await?)
    }

    /// Open the blob for a user key, returning its size and a reader
    /// whose ownership transfers to the caller.
    pub async fn read(&self, owner: &str, key: &str) -> Result<(u64, File), StoreError> {
        self.read_id(owner, &hash_key(key)).await
    }

    /// Open the blob for a key-id.
    pub async fn read_id(&self, owner: &str, key_id: &str) -> Result<(u64, File), StoreError> {
        let path = self.blob_path(owner, key_id);
        let file = File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound {
                    owner: owner.to_string(),
                    key_id: key_id.to_string(),
                }
            } else {
                StoreError::Io(e)
            }
        })?;
        let size = file.metadata().await?.len();
        Ok((size, file))
    }

    /// Remove the blob for a user key.
    pub async fn delete(&self, owner: &str, key: &str) -> Result<(), StoreError> {
        self.delete_id(owner, &hash_key(key)).await
    }

    /// Remove the blob for a key-id by deleting its first-segment
    /// subtree under the owner.
    pub async fn delete_id(&self, owner: &str, key_id: &str) -> Result<(), StoreError> {
        let addr = content_address(key_id);
        let subtree = self.owner_dir(owner).join(addr.first_segment());
        match fs::remove_dir_all(&subtree).await {
            Ok(()) => {
                debug!(key_id, owner, "deleted blob subtree");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Find an owner directory holding the blob for `key_id`, if any.
    pub async fn locate_owner(&self, key_id: &str) -> Result<Option<String>, StoreError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let owner = entry.file_name().to_string_lossy().into_owned();
            if self.has_id(&owner, key_id).await? {
                return Ok(Some(owner));
            }
        }
        Ok(None)
    }

    /// List every blob stored under one owner.
    pub fn list(&self, owner: &str) -> Result<Vec<FileInfo>, StoreError> {
        let owner_dir = self.owner_dir(owner);
        if !owner_dir.is_dir() {
            return Ok(Vec::new());
        }

        let names = self.key_names.lock();
        let mut files = Vec::new();
        let mut stack = vec![owner_dir];
        while let Some(dir) = stack.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                let Ok(meta) = entry.metadata() else { continue };
                let key_id = entry.file_name().to_string_lossy().into_owned();
                let key = names.get(&key_id).cloned().unwrap_or_else(|| {
                    format!("file_{}", &key_id[..key_id.len().min(8)])
                });
                files.push(FileInfo {
                    key,
                    key_id,
                    size: meta.len(),
                    owner: owner.to_string(),
                });
            }
        }
        Ok(files)
    }

    /// List every blob in the store, grouped by owner.
    pub fn list_all(&self) -> Result<HashMap<String, Vec<FileInfo>>, StoreError> {
        let mut all = HashMap::new();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(all),
            Err(e) => return Err(e.into()),
        };
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let owner = entry.file_name().to_string_lossy().into_owned();
            match self.list(&owner) {
                Ok(files) if !files.is_empty() => {
                    all.insert(owner, files);
                }
                _ => {}
            }
        }
        Ok(all)
    }

    /// Remove the whole store root.
    pub async fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Record a key-id -> user-key mapping for `list`.
    pub fn register_name(&self, key_id: &str, key: &str) {
        self.key_names
            .lock()
            .insert(key_id.to_string(), key.to_string());
    }

    /// Drop every recorded name mapping.
    pub fn clear_names(&self) {
        self.key_names.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path().join("vault"));
        (dir, store)
    }

    #[test]
    fn content_address_shape() {
        let key_id = hash_key("momsbestpicture");
        let addr = content_address(&key_id);

        assert_eq!(addr.leaf, key_id);
        assert_eq!(addr.segments.len(), key_id.len() / SEGMENT_LEN);
        for seg in &addr.segments {
            assert_eq!(seg.len(), SEGMENT_LEN);
        }
        assert_eq!(addr.segments.concat(), key_id[..addr.segments.len() * SEGMENT_LEN].to_string());
        assert_eq!(addr.first_segment(), &key_id[..SEGMENT_LEN]);
    }

    #[tokio::test]
    async fn write_read_round_trip() {
        let (_dir, store) = test_store();
        let data = b"some jpg bytes".to_vec();

        let n = store.write("node-a", "picture.jpg", &mut &data[..]).await.unwrap();
        assert_eq!(n, data.len() as u64);
        assert!(store.has("node-a", "picture.jpg").await.unwrap());

        let (size, mut file) = store.read("node-a", "picture.jpg").await.unwrap();
        assert_eq!(size, data.len() as u64);
        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut file, &mut out).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn missing_blob_reports_not_found() {
        let (_dir, store) = test_store();
        assert!(!store.has("node-a", "nope").await.unwrap());
        let err = store.read("node-a", "nope").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn delete_removes_subtree() {
        let (_dir, store) = test_store();
        store.write("node-a", "doc", &mut &b"abc"[..]).await.unwrap();
        assert!(store.has("node-a", "doc").await.unwrap());

        store.delete("node-a", "doc").await.unwrap();
        assert!(!store.has("node-a", "doc").await.unwrap());

        let first = content_address(&hash_key("doc")).first_segment().to_string();
        assert!(!store.root().join("node-a").join(first).exists());

        // deleting again is a no-op
        store.delete("node-a", "doc").await.unwrap();
    }

    #[tokio::test]
    async fn same_key_same_path() {
        let (_dir, store) = test_store();
        store.write("node-a", "doc", &mut &b"v1"[..]).await.unwrap();
        store.write("node-a", "doc", &mut &b"v2"[..]).await.unwrap();

        let files = store.list("node-a").unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].size, 2);
    }

    #[tokio::test]
    async fn wire_and_local_addressing_agree() {
        let (_dir, store) = test_store();
        let key_id = hash_key("doc");

        store.write("node-a", "doc", &mut &b"abc"[..]).await.unwrap();
        assert!(store.has_id("node-a", &key_id).await.unwrap());

        let (_, mut file) = store.read_id("node-a", &key_id).await.unwrap();
        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut file, &mut out).await.unwrap();
        assert_eq!(out, b"abc");
    }

    #[tokio::test]
    async fn locate_owner_scans_namespaces() {
        let (_dir, store) = test_store();
        let key_id = hash_key("doc");

        assert!(store.locate_owner(&key_id).await.unwrap().is_none());

        store.write_id("node-b", &key_id, &mut &b"abc"[..]).await.unwrap();
        assert_eq!(
            store.locate_owner(&key_id).await.unwrap().as_deref(),
            Some("node-b")
        );
    }

    #[tokio::test]
    async fn list_uses_name_table_and_placeholders() {
        let (_dir, store) = test_store();
        store.write("node-a", "named.txt", &mut &b"x"[..]).await.unwrap();
        let orphan_id = hash_key("forgotten");
        store.write_id("node-a", &orphan_id, &mut &b"yy"[..]).await.unwrap();

        let mut files = store.list("node-a").unwrap();
        files.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(files.len(), 2);
        assert_eq!(files[1].key, "named.txt");
        assert_eq!(files[0].key, format!("file_{}", &orphan_id[..8]));

        store.clear_names();
        let files = store.list("node-a").unwrap();
        assert!(files.iter().all(|f| f.key.starts_with("file_")));
    }

    #[tokio::test]
    async fn clear_removes_root() {
        let (_dir, store) = test_store();
        store.write("node-a", "doc", &mut &b"abc"[..]).await.unwrap();
        store.clear().await.unwrap();
        assert!(!store.root().exists());
        assert!(store.list_all().unwrap().is_empty());
    }
}

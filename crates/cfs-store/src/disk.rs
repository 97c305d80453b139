//! Local-disk driver: one flat directory, object id = Base64 of the file
//! name.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;

use crate::{ByteStream, ObjectStore, RemoteObject, StoreError, StoreResult};

pub struct DiskStore {
    dir: PathBuf,
    list: Mutex<Option<HashMap<String, RemoteObject>>>,
}

impl DiskStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        DiskStore {
            dir: dir.into(),
            list: Mutex::new(None),
        }
    }

    fn path_for(&self, id: &str) -> StoreResult<PathBuf> {
        let raw = BASE64
            .decode(id)
            .map_err(|e| StoreError::Api(format!("bad object id {id:?}: {e}")))?;
        let name = String::from_utf8(raw)
            .map_err(|e| StoreError::Api(format!("bad object id {id:?}: {e}")))?;
        Ok(self.dir.join(name))
    }
}

#[async_trait]
impl ObjectStore for DiskStore {
    async fn read(&self, id: &str, offset: u64, _upper: u64) -> StoreResult<ByteStream> {
        let path = self.path_for(id)?;
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|_| StoreError::NotFound(id.to_string()))?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        Ok(Box::new(file))
    }

    async fn save(&self, name: &str, mut reader: ByteStream, max_bytes: u64) -> StoreResult<String> {
        let path = self.dir.join(name);
        let mut writer = tokio::fs::File::create(&path).await?;

        if max_bytes > 0 {
            let mut limited = reader.take(max_bytes);
            tokio::io::copy(&mut limited, &mut writer).await?;
        } else {
            tokio::io::copy(&mut reader, &mut writer).await?;
        }
        writer.sync_all().await?;

        Ok(BASE64.encode(name))
    }

    async fn trash(&self, id: &str) -> StoreResult<()> {
        let path = self.path_for(id)?;
        tokio::fs::remove_file(&path).await?;
        Ok(())
    }

    async fn init_file_list(&self) -> StoreResult<()> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut list = HashMap::new();

        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let id = BASE64.encode(&name);
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            list.insert(
                id.clone(),
                RemoteObject {
                    id,
                    name,
                    size: meta.len() as i64,
                    mtime,
                },
            );
        }

        *self.list.lock().await = Some(list);
        Ok(())
    }

    async fn update_file_list(&self) -> StoreResult<()> {
        // A directory listing is cheap; a full re-scan is the update.
        self.init_file_list().await
    }

    async fn file_list(&self) -> HashMap<String, RemoteObject> {
        self.list.lock().await.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn save_read_roundtrip_with_offset() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DiskStore::new(tmp.path());

        let id = store
            .save("obj.bin", Box::new(&b"hello chunk world"[..]), 0)
            .await
            .unwrap();

        let mut stream = store.read(&id, 6, u64::MAX).await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"chunk world");
    }

    #[tokio::test]
    async fn save_honours_max_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DiskStore::new(tmp.path());

        let id = store
            .save("short.bin", Box::new(&b"0123456789"[..]), 4)
            .await
            .unwrap();

        let mut stream = store.read(&id, 0, u64::MAX).await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"0123");
    }

    #[tokio::test]
    async fn listing_and_trash() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DiskStore::new(tmp.path());

        let id = store.save("a.bin", Box::new(&b"aaaa"[..]), 0).await.unwrap();
        store.save("b.bin", Box::new(&b"bb"[..]), 0).await.unwrap();

        store.init_file_list().await.unwrap();
        let list = store.file_list().await;
        assert_eq!(list.len(), 2);
        assert_eq!(list.get(&id).unwrap().size, 4);
        assert_eq!(list.get(&id).unwrap().name, "a.bin");

        store.trash(&id).await.unwrap();
        store.update_file_list().await.unwrap();
        assert_eq!(store.file_list().await.len(), 1);
    }
}

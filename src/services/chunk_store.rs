use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::SystemTime;
use tokio::io::{AsyncRead, AsyncWriteExt};

/// A staged chunk on disk. The name encodes `<order>_<file_id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHandle {
    pub name: String,
    pub path: PathBuf,
}

/// Any staged entry, with its modification time, as seen by the sweeper.
#[derive(Debug, Clone)]
pub struct StagedEntry {
    pub handle: ChunkHandle,
    pub modified: SystemTime,
}

pub fn chunk_name(file_id: &str, order: u64) -> String {
    format!("{}_{}", order, file_id)
}

impl ChunkHandle {
    /// Full-width parse of the leading order. Leading `+`, empty digits or
    /// overflow are rejected rather than silently truncated.
    pub fn order(&self) -> Option<u64> {
        let (digits, _) = self.name.split_once('_')?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    /// True when the name is `<token>_<file_id>` for some order token, valid or
    /// not. Hidden temporaries never match.
    pub fn belongs_to(&self, file_id: &str) -> bool {
        self.name
            .strip_suffix(file_id)
            .and_then(|rest| rest.strip_suffix('_'))
            .is_some_and(|token| !token.contains('_') && !token.starts_with('.'))
    }

    /// The upload id embedded in the name, if this is a chunk rather than a
    /// temporary file.
    pub fn file_id(&self) -> Option<&str> {
        self.order()?;
        self.name.split_once('_').map(|(_, id)| id)
    }
}

/// Durable staging area for in-flight chunks.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Persists `bytes` as chunk `order` of `file_id`, replacing any previous copy.
    /// Readers never observe a partially written chunk.
    async fn put(&self, file_id: &str, order: u64, bytes: Bytes) -> io::Result<ChunkHandle>;

    /// Every chunk currently staged for `file_id`, in no particular order.
    /// Names with a malformed order token are included so the merge can refuse them.
    async fn list_chunks(&self, file_id: &str) -> io::Result<Vec<ChunkHandle>>;

    /// Every entry in the staging area, chunks and leftovers alike.
    async fn list_all(&self) -> io::Result<Vec<StagedEntry>>;

    async fn open(&self, handle: &ChunkHandle) -> io::Result<Pin<Box<dyn AsyncRead + Send>>>;

    /// Removing an already missing chunk succeeds.
    async fn remove(&self, handle: &ChunkHandle) -> io::Result<()>;

    /// Best-effort removal of every chunk of `file_id`. Returns how many were removed.
    async fn discard(&self, file_id: &str) -> usize {
        let handles = match self.list_chunks(file_id).await {
            Ok(handles) => handles,
            Err(e) => {
                tracing::warn!(file_id, "Failed to list chunks for cleanup: {}", e);
                return 0;
            }
        };

        let mut removed = 0;
        for handle in handles {
            match self.remove(&handle).await {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(file_id, chunk = %handle.name, "Failed to remove chunk: {}", e),
            }
        }
        removed
    }
}

/// Local-disk chunk store rooted at a staging directory.
#[derive(Debug, Clone)]
pub struct LocalChunkStore {
    dir: PathBuf,
}

impl LocalChunkStore {
    pub async fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    async fn read_dir_entries(&self) -> io::Result<Vec<(String, PathBuf, std::fs::Metadata)>> {
        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = reader.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                // Removed between listing and stat
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            if !metadata.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            entries.push((name, entry.path(), metadata));
        }
        Ok(entries)
    }
}

#[async_trait]
impl ChunkStore for LocalChunkStore {
    async fn put(&self, file_id: &str, order: u64, bytes: Bytes) -> io::Result<ChunkHandle> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let name = chunk_name(file_id, order);
        let path = self.dir.join(&name);
        let part = self
            .dir
            .join(format!(".{}.{}.part", name, uuid::Uuid::new_v4().simple()));

        let write = async {
            let mut file = tokio::fs::File::create(&part).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&part, &path).await
        };

        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(e);
        }

        Ok(ChunkHandle { name, path })
    }

    async fn list_chunks(&self, file_id: &str) -> io::Result<Vec<ChunkHandle>> {
        Ok(self
            .read_dir_entries()
            .await?
            .into_iter()
            .map(|(name, path, _)| ChunkHandle { name, path })
            .filter(|h| h.belongs_to(file_id))
            .collect())
    }

    async fn list_all(&self) -> io::Result<Vec<StagedEntry>> {
        Ok(self
            .read_dir_entries()
            .await?
            .into_iter()
            .map(|(name, path, metadata)| StagedEntry {
                handle: ChunkHandle { name, path },
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            })
            .collect())
    }

    async fn open(&self, handle: &ChunkHandle) -> io::Result<Pin<Box<dyn AsyncRead + Send>>> {
        let file = tokio::fs::File::open(&handle.path).await?;
        Ok(Box::pin(file))
    }

    async fn remove(&self, handle: &ChunkHandle) -> io::Result<()> {
        match tokio::fs::remove_file(&handle.path).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn handle(name: &str) -> ChunkHandle {
        ChunkHandle {
            name: name.to_string(),
            path: PathBuf::from(name),
        }
    }

    #[test]
    fn test_parse_chunk_name() {
        assert_eq!(handle("0_abc").order(), Some(0));
        assert_eq!(handle("12_abc").order(), Some(12));
        assert_eq!(handle("12_abc").file_id(), Some("abc"));
        // Ids may contain underscores; only the first one separates the order
        assert_eq!(handle("3_my_upload_id").file_id(), Some("my_upload_id"));
        assert_eq!(
            handle("18446744073709551615_x").order(),
            Some(u64::MAX)
        );

        assert_eq!(handle("18446744073709551616_x").order(), None);
        assert_eq!(handle("+1_abc").order(), None);
        assert_eq!(handle("_abc").order(), None);
        assert_eq!(handle("abc").order(), None);
        assert_eq!(handle(".0_abc.1234.part").file_id(), None);
    }

    #[test]
    fn test_belongs_to_matches_on_suffix() {
        assert!(handle("0_abc").belongs_to("abc"));
        assert!(handle("3_my_upload_id").belongs_to("my_upload_id"));
        // Malformed order tokens still belong to the upload
        assert!(handle("x1_abc").belongs_to("abc"));
        assert!(handle("_abc").belongs_to("abc"));

        assert!(!handle("3_my_upload_id").belongs_to("upload_id"));
        assert!(!handle("0_abc").belongs_to("bc"));
        assert!(!handle("0_abcd").belongs_to("abc"));
        assert!(!handle(".0_abc").belongs_to("abc"));
        assert!(!handle("abc").belongs_to("abc"));
    }

    #[tokio::test]
    async fn test_put_list_open_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalChunkStore::new(dir.path().join("temp")).await.unwrap();

        store.put("upload-1", 0, Bytes::from_static(b"first")).await.unwrap();
        store.put("upload-1", 1, Bytes::from_static(b"second")).await.unwrap();
        store.put("upload-10", 0, Bytes::from_static(b"other")).await.unwrap();

        let mut chunks = store.list_chunks("upload-1").await.unwrap();
        chunks.sort_by_key(|h| h.order());
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].name, "0_upload-1");

        let mut content = Vec::new();
        store
            .open(&chunks[1])
            .await
            .unwrap()
            .read_to_end(&mut content)
            .await
            .unwrap();
        assert_eq!(content, b"second");

        store.remove(&chunks[0]).await.unwrap();
        // Second removal of the same chunk is not an error
        store.remove(&chunks[0]).await.unwrap();
        assert_eq!(store.list_chunks("upload-1").await.unwrap().len(), 1);
        assert_eq!(store.list_chunks("upload-10").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_includes_malformed_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalChunkStore::new(dir.path()).await.unwrap();
        store.put("f", 0, Bytes::from_static(b"ok")).await.unwrap();
        tokio::fs::write(dir.path().join("1a_f"), b"stray").await.unwrap();

        let mut names: Vec<String> = store
            .list_chunks("f")
            .await
            .unwrap()
            .into_iter()
            .map(|h| h.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["0_f", "1a_f"]);
    }

    #[tokio::test]
    async fn test_put_overwrites_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalChunkStore::new(dir.path()).await.unwrap();

        store.put("f", 0, Bytes::from_static(b"old")).await.unwrap();
        let handle = store.put("f", 0, Bytes::from_static(b"new")).await.unwrap();

        assert_eq!(store.list_all().await.unwrap().len(), 1);
        assert_eq!(tokio::fs::read(&handle.path).await.unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_discard() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalChunkStore::new(dir.path()).await.unwrap();
        for order in 0..3 {
            store.put("gone", order, Bytes::from_static(b"x")).await.unwrap();
        }
        store.put("kept", 0, Bytes::from_static(b"x")).await.unwrap();

        assert_eq!(store.discard("gone").await, 3);
        assert!(store.list_chunks("gone").await.unwrap().is_empty());
        assert_eq!(store.list_chunks("kept").await.unwrap().len(), 1);
    }
}

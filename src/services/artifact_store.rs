use sha2::{Digest, Sha256};
use std::io;
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Namespace for final artifacts: `<root>/<owner>/<uuid>/<name>`.
///
/// Artifacts are assembled in a temporary file under the staging directory and
/// only renamed into the namespace once they passed every check.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    staging: PathBuf,
}

/// An artifact under assembly. Dropping it deletes the temporary file.
pub struct PendingArtifact {
    temp: NamedTempFile,
    file: Option<tokio::fs::File>,
    hasher: Sha256,
    size: u64,
}

/// A sealed artifact ready for scanning, classification and promotion.
#[derive(Debug)]
pub struct SealedArtifact {
    temp: NamedTempFile,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    /// Relative to the root, `/`-separated
    pub storage_path: String,
    pub absolute_path: PathBuf,
}

fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.contains('/')
        && !segment.contains('\\')
        && !segment.contains('\0')
}

impl ArtifactStore {
    pub async fn new(root: impl Into<PathBuf>, staging: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        let staging = staging.into();
        tokio::fs::create_dir_all(&root).await?;
        tokio::fs::create_dir_all(&staging).await?;
        Ok(Self { root, staging })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Opens a fresh temporary artifact next to the staged chunks.
    pub async fn begin(&self) -> io::Result<PendingArtifact> {
        tokio::fs::create_dir_all(&self.staging).await?;
        let temp = tempfile::Builder::new()
            .prefix(".artifact-")
            .tempfile_in(&self.staging)?;
        let file = tokio::fs::File::from_std(temp.reopen()?);
        Ok(PendingArtifact {
            temp,
            file: Some(file),
            hasher: Sha256::new(),
            size: 0,
        })
    }

    /// Moves a sealed artifact to `<root>/<owner_id>/<uuid>/<filename>`.
    /// The caller passes an already sanitized filename.
    pub async fn promote(
        &self,
        artifact: SealedArtifact,
        owner_id: &str,
        filename: &str,
    ) -> io::Result<StoredArtifact> {
        if !is_safe_segment(owner_id) || !is_safe_segment(filename) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsafe path segment for artifact",
            ));
        }

        let bucket = uuid::Uuid::new_v4().to_string();
        let dir = self.root.join(owner_id).join(&bucket);
        tokio::fs::create_dir_all(&dir).await?;

        let absolute_path = dir.join(filename);
        if let Err(e) = artifact.temp.persist_noclobber(&absolute_path) {
            // PersistError hands the temp file back; dropping it deletes it
            drop(e.file);
            let _ = tokio::fs::remove_dir(&dir).await;
            return Err(e.error);
        }

        Ok(StoredArtifact {
            storage_path: format!("{}/{}/{}", owner_id, bucket, filename),
            absolute_path,
        })
    }

    /// Maps a stored relative path back onto the filesystem, refusing anything
    /// that would escape the root.
    pub fn resolve(&self, storage_path: &str) -> io::Result<PathBuf> {
        let relative = Path::new(storage_path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if storage_path.is_empty() || escapes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid storage path '{}'", storage_path),
            ));
        }
        Ok(self.root.join(relative))
    }

    /// Deletes an artifact. A missing file counts as removed.
    pub async fn remove(&self, storage_path: &str) -> io::Result<()> {
        let path = self.resolve(storage_path)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        // The per-upload directory only ever holds this one file
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::remove_dir(parent).await;
        }
        Ok(())
    }
}

impl PendingArtifact {
    /// Appends everything from `reader`, hashing as it goes.
    pub async fn append<R>(&mut self, mut reader: R) -> io::Result<u64>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("artifact already sealed"))?;

        let mut buffer = vec![0u8; 64 * 1024];
        let mut copied = 0u64;
        loop {
            let n = reader.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            self.hasher.update(&buffer[..n]);
            file.write_all(&buffer[..n]).await?;
            copied += n as u64;
        }
        self.size += copied;
        Ok(copied)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Flushes to disk and fixes the whole-file digest.
    pub async fn seal(mut self) -> io::Result<SealedArtifact> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(SealedArtifact {
            temp: self.temp,
            size: self.size,
            sha256: hex::encode(self.hasher.finalize()),
        })
    }
}

impl SealedArtifact {
    /// Fresh read handle from the start of the artifact.
    pub async fn reader(&self) -> io::Result<tokio::fs::File> {
        tokio::fs::File::open(self.temp.path()).await
    }

    /// Reads up to `len` leading bytes, fewer if the artifact is shorter.
    pub async fn sample(&self, len: usize) -> io::Result<Vec<u8>> {
        let mut sample = Vec::with_capacity(len);
        self.reader()
            .await?
            .take(len as u64)
            .read_to_end(&mut sample)
            .await?;
        Ok(sample)
    }

    pub fn temp_path(&self) -> &Path {
        self.temp.path()
    }
}

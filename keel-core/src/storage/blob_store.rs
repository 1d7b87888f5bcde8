use crate::error::{KeelError, Result};
use crate::storage::objects::{
    BlobObjects, BlobReader, ByteRange, Envelope, is_valid_hash, validate_hash,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha512};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

const COPY_BUFFER_SIZE: usize = 64 * 1024;
const TMP_PREFIX: &str = "tmp.";

/// FsBlobStore keeps whole objects on local disk, addressed by content:
/// `objects/{sha512[0..2]}/{sha512}`.
pub struct FsBlobStore {
    base_path: PathBuf,
}

impl FsBlobStore {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        let objects_dir = base_path.join("objects");
        std::fs::create_dir_all(&objects_dir)?;

        // leftovers of writes interrupted by a crash or a timeout
        for entry in std::fs::read_dir(&objects_dir)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(TMP_PREFIX) {
                if let Err(error) = std::fs::remove_file(entry.path()) {
                    tracing::warn!(
                        "Failed to remove stale temporary object: path={} error={}",
                        entry.path().display(),
                        error
                    );
                }
            }
        }

        Ok(Self { base_path })
    }

    pub fn object_path(&self, sha512: &str) -> Result<PathBuf> {
        validate_hash(sha512)?;
        Ok(self.objects_dir().join(&sha512[..2]).join(sha512))
    }

    fn objects_dir(&self) -> PathBuf {
        self.base_path.join("objects")
    }

    async fn envelope_at(&self, sha512: &str, path: &Path) -> Result<Envelope> {
        let metadata = match fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(KeelError::NotFound(format!("object {}", sha512)));
            }
            Err(error) => return Err(error.into()),
        };

        let created_at: DateTime<Utc> = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        Ok(Envelope {
            sha512: sha512.to_string(),
            size_bytes: metadata.len(),
            created_at,
        })
    }
}

#[async_trait]
impl BlobObjects for FsBlobStore {
    async fn write_blob(
        &self,
        mut body: BlobReader,
        expected_sha512: Option<&str>,
    ) -> Result<Envelope> {
        if let Some(expected) = expected_sha512 {
            validate_hash(expected)?;
        }

        let tmp_path = self
            .objects_dir()
            .join(format!("{}{}", TMP_PREFIX, ulid::Ulid::new()));
        let mut file = fs::File::create(&tmp_path).await?;
        let mut hasher = Sha512::new();
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];

        let copied: Result<()> = async {
            loop {
                let read = body.read(&mut buf).await?;
                if read == 0 {
                    break;
                }
                hasher.update(&buf[..read]);
                file.write_all(&buf[..read]).await?;
            }
            file.sync_all().await?;
            Ok(())
        }
        .await;
        drop(file);

        if let Err(error) = copied {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(error);
        }

        let actual = hex::encode(hasher.finalize());
        if let Some(expected) = expected_sha512
            && expected != actual
        {
            fs::remove_file(&tmp_path).await?;
            return Err(KeelError::HashMismatch {
                expected: expected.to_string(),
                actual,
            });
        }

        let object_path = self.object_path(&actual)?;
        if object_path.exists() {
            fs::remove_file(&tmp_path).await?;
            return self.envelope_at(&actual, &object_path).await;
        }

        if let Some(parent) = object_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&tmp_path, &object_path).await?;

        self.envelope_at(&actual, &object_path).await
    }

    async fn open_blob(&self, sha512: &str, range: Option<ByteRange>) -> Result<BlobReader> {
        let path = self.object_path(sha512)?;
        let mut file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(KeelError::NotFound(format!("object {}", sha512)));
            }
            Err(error) => return Err(error.into()),
        };

        let Some(range) = range else {
            return Ok(Box::new(file));
        };
        let range = range.resolve(file.metadata().await?.len())?;
        file.seek(SeekFrom::Start(range.start)).await?;
        Ok(Box::new(file.take(range.length())))
    }

    async fn blob_envelope(&self, sha512: &str) -> Result<Envelope> {
        let path = self.object_path(sha512)?;
        self.envelope_at(sha512, &path).await
    }

    async fn delete_blob(&self, sha512: &str) -> Result<()> {
        let path = self.object_path(sha512)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Err(KeelError::NotFound(format!("object {}", sha512)))
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn list_blobs(&self) -> Result<Vec<Envelope>> {
        let mut envelopes = Vec::new();
        let mut fanout = fs::read_dir(self.objects_dir()).await?;

        while let Some(dir) = fanout.next_entry().await? {
            if !dir.file_type().await?.is_dir() {
                continue;
            }

            let mut entries = fs::read_dir(dir.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                if !is_valid_hash(&name) {
                    continue;
                }

                match self.envelope_at(&name, &entry.path()).await {
                    Ok(envelope) => envelopes.push(envelope),
                    // deleted between listing and stat
                    Err(KeelError::NotFound(_)) => continue,
                    Err(error) => return Err(error),
                }
            }
        }

        envelopes.sort_by(|left, right| left.sha512.cmp(&right.sha512));
        Ok(envelopes)
    }
}

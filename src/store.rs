//! Archive store collaborators: the multipart upload contract and local
//! implementations of it.

use crate::buffer::{tree_hash_file, Sha256Digest};
use crate::types::Chunk;
use anyhow::{bail, Context};
use futures_util::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

/// One part of a multipart upload: a chunk's bytes and their digest.
#[derive(Debug, Clone)]
pub struct Part {
    pub chunk: Chunk,
    pub bytes: Vec<u8>,
    pub sha256: Sha256Digest,
}

impl Part {
    /// The inclusive byte range header for this part, e.g. `bytes 0-1048575/*`.
    pub fn content_range(&self) -> String {
        format!(
            "bytes {}-{}/*",
            self.chunk.start,
            self.chunk.end.saturating_sub(1)
        )
    }

    /// Hex-encoded SHA-256 of the part's bytes.
    pub fn checksum(&self) -> String {
        hex::encode(self.sha256)
    }
}

/// A remote store accepting archives as multipart uploads.
///
/// Implementations own the transport, credentials and any transport-level
/// retries.
pub trait ArchiveStore: Send + Sync + 'static {
    /// Starts an upload of `path` in parts of `part_size` bytes and returns
    /// its upload id.
    fn initiate<'a>(&'a self, path: &'a Path, part_size: u64)
        -> BoxFuture<'a, anyhow::Result<String>>;

    /// Sends one part of an initiated upload.
    fn upload_part<'a>(&'a self, upload_id: &'a str, part: Part)
        -> BoxFuture<'a, anyhow::Result<()>>;

    /// Finishes an upload, handing the store the archive size and the
    /// hex-encoded tree hash to verify. Returns the archive id.
    fn complete<'a>(
        &'a self,
        upload_id: &'a str,
        archive_size: u64,
        tree_hash: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<String>>;
}

/// State of an in-flight upload, persisted next to its parts.
#[derive(Serialize, Deserialize, Debug, Clone)]
struct UploadManifest {
    description: String,
    part_size: u64,
    initiated_at: String,
}

/// Metadata stored alongside every archive in a [`LocalVault`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRecord {
    pub archive_id: String,
    pub description: String,
    pub size: u64,
    pub tree_hash: String,
    pub created_at: String,
}

/// Snapshot of everything a [`LocalVault`] holds.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VaultInventory {
    pub vault: PathBuf,
    pub generated_at: String,
    pub archive_count: usize,
    pub total_size: u64,
    pub archives: Vec<ArchiveRecord>,
}

fn timestamp() -> String {
    humantime::format_rfc3339_seconds(SystemTime::now()).to_string()
}

/// A directory-backed archive store.
///
/// Parts are written at their offsets into `uploads/<upload id>/archive`.
/// Completion recomputes the tree hash of the assembled bytes and, if it
/// matches, moves them to `archives/<archive id>` with a JSON record.
#[derive(Debug)]
pub struct LocalVault {
    root: PathBuf,
    sequence: AtomicU64,
}

impl LocalVault {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn upload_dir(&self, upload_id: &str) -> PathBuf {
        self.root.join("uploads").join(upload_id)
    }

    /// Location of a completed archive's bytes.
    pub fn archive_path(&self, archive_id: &str) -> PathBuf {
        self.root.join("archives").join(archive_id)
    }

    /// Reads the record of a completed archive.
    pub async fn read_record(&self, archive_id: &str) -> anyhow::Result<ArchiveRecord> {
        let path = self.root.join("archives").join(format!("{}.json", archive_id));
        let content = tokio::fs::read(&path)
            .await
            .with_context(|| format!("no archive record at {}", path.display()))?;
        Ok(serde_json::from_slice(&content)?)
    }

    /// Reads every archive record in the vault, oldest first.
    ///
    /// A vault with no `archives` directory yet holds no archives.
    pub async fn list_archives(&self) -> anyhow::Result<Vec<ArchiveRecord>> {
        let dir = self.root.join("archives");
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("cannot read {}", dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let content = tokio::fs::read(&path).await?;
            let record: ArchiveRecord = serde_json::from_slice(&content)
                .with_context(|| format!("malformed archive record {}", path.display()))?;
            records.push(record);
        }
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.archive_id.cmp(&b.archive_id))
        });
        Ok(records)
    }

    /// Builds an inventory of the vault from its archive records.
    pub async fn inventory(&self) -> anyhow::Result<VaultInventory> {
        let archives = self.list_archives().await?;
        Ok(VaultInventory {
            vault: self.root().to_path_buf(),
            generated_at: timestamp(),
            archive_count: archives.len(),
            total_size: archives.iter().map(|r| r.size).sum(),
            archives,
        })
    }

    fn new_upload_id(&self, path: &Path) -> String {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update(nanos.to_le_bytes());
        hasher.update(sequence.to_le_bytes());
        hex::encode(&hasher.finalize()[..16])
    }

    async fn read_manifest(&self, upload_id: &str) -> anyhow::Result<UploadManifest> {
        let path = self.upload_dir(upload_id).join("manifest.json");
        let content = tokio::fs::read(&path)
            .await
            .with_context(|| format!("unknown upload {}", upload_id))?;
        Ok(serde_json::from_slice(&content)?)
    }
}

impl ArchiveStore for LocalVault {
    fn initiate<'a>(
        &'a self,
        path: &'a Path,
        part_size: u64,
    ) -> BoxFuture<'a, anyhow::Result<String>> {
        async move {
            let upload_id = self.new_upload_id(path);
            let dir = self.upload_dir(&upload_id);
            tokio::fs::create_dir_all(&dir).await?;

            let manifest = UploadManifest {
                description: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string()),
                part_size,
                initiated_at: timestamp(),
            };
            let manifest_json = serde_json::to_vec_pretty(&manifest)?;
            tokio::fs::write(dir.join("manifest.json"), manifest_json).await?;

            info!("Initiated upload {} for {}", upload_id, path.display());
            Ok(upload_id)
        }
        .boxed()
    }

    fn upload_part<'a>(
        &'a self,
        upload_id: &'a str,
        part: Part,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        async move {
            let dir = self.upload_dir(upload_id);
            if !tokio::fs::try_exists(&dir).await? {
                bail!("unknown upload {}", upload_id);
            }

            let actual: Sha256Digest = Sha256::digest(&part.bytes).into();
            if actual != part.sha256 {
                bail!(
                    "checksum mismatch for {}: expected {}, got {}",
                    part.content_range(),
                    part.checksum(),
                    hex::encode(actual)
                );
            }

            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(dir.join("archive"))
                .await?;
            file.seek(SeekFrom::Start(part.chunk.start)).await?;
            file.write_all(&part.bytes).await?;
            file.flush().await?;

            debug!("Stored {} of upload {}", part.content_range(), upload_id);
            Ok(())
        }
        .boxed()
    }

    fn complete<'a>(
        &'a self,
        upload_id: &'a str,
        archive_size: u64,
        tree_hash: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<String>> {
        async move {
            let manifest = self.read_manifest(upload_id).await?;
            let dir = self.upload_dir(upload_id);
            let assembled = dir.join("archive");

            let size = tokio::fs::metadata(&assembled)
                .await
                .with_context(|| format!("upload {} has no parts", upload_id))?
                .len();
            if size != archive_size {
                bail!(
                    "size mismatch for upload {}: expected {} bytes, got {} bytes",
                    upload_id,
                    archive_size,
                    size
                );
            }

            let path = assembled.clone();
            let part_size = manifest.part_size;
            let computed = tokio::task::spawn_blocking(move || tree_hash_file(&path, part_size))
                .await
                .context("tree hash task failed")??;
            let computed = hex::encode(computed);
            if computed != tree_hash {
                bail!(
                    "tree hash mismatch for upload {}: expected {}, got {}",
                    upload_id,
                    tree_hash,
                    computed
                );
            }

            let archive_id = upload_id.to_string();
            tokio::fs::create_dir_all(self.root.join("archives")).await?;
            tokio::fs::rename(&assembled, self.archive_path(&archive_id)).await?;

            let record = ArchiveRecord {
                archive_id: archive_id.clone(),
                description: manifest.description,
                size,
                tree_hash: computed,
                created_at: timestamp(),
            };
            tokio::fs::write(
                self.root.join("archives").join(format!("{}.json", archive_id)),
                serde_json::to_vec_pretty(&record)?,
            )
            .await?;
            tokio::fs::remove_dir_all(&dir).await?;

            info!("✅ Archive {} stored ({} bytes)", archive_id, size);
            Ok(archive_id)
        }
        .boxed()
    }
}

/// A store that accepts everything and only logs what it would send.
#[derive(Debug, Default)]
pub struct DryRunStore {
    sequence: AtomicU64,
}

impl DryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ArchiveStore for DryRunStore {
    fn initiate<'a>(
        &'a self,
        path: &'a Path,
        part_size: u64,
    ) -> BoxFuture<'a, anyhow::Result<String>> {
        async move {
            let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
            let upload_id = format!("dry-run-{}", sequence);
            info!(
                "[dry run] initiate {} for {} ({} byte parts)",
                upload_id,
                path.display(),
                part_size
            );
            Ok(upload_id)
        }
        .boxed()
    }

    fn upload_part<'a>(
        &'a self,
        upload_id: &'a str,
        part: Part,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        async move {
            debug!(
                "[dry run] {} {} checksum {}",
                upload_id,
                part.content_range(),
                part.checksum()
            );
            Ok(())
        }
        .boxed()
    }

    fn complete<'a>(
        &'a self,
        upload_id: &'a str,
        archive_size: u64,
        tree_hash: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<String>> {
        async move {
            info!(
                "[dry run] complete {} ({} bytes, tree hash {})",
                upload_id, archive_size, tree_hash
            );
            Ok(upload_id.to_string())
        }
        .boxed()
    }
}

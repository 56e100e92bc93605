//! Filesystem-backed resource store.
//!
//! Canonical files live in `data_dir`; every overwrite first copies the current file into
//! `backup_dir` as `<unix-millis>.<file-name>`. New contents are written to a temporary
//! sibling and renamed into place, so a crash leaves either the old or the new file, never
//! a torn one.

use anyhow::Context;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::catalog::types::{Catalog, Category};
use crate::error::{Error, Result};
use crate::store::version::VersionToken;

/// Load/persist interface of the catalog resource.
///
/// Callers must hold the category lock for the whole load → mutate → persist sequence;
/// the store itself does no locking.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Raw bytes of a canonical file; [`Error::NotFound`] when it does not exist.
    async fn read(&self, file_name: &str) -> Result<Vec<u8>>;

    /// Backs up the current file (if any), writes `bytes`, returns the new token.
    async fn write(&self, file_name: &str, bytes: &[u8]) -> Result<VersionToken>;

    async fn load(&self, category: Category) -> Result<(Catalog, VersionToken)> {
        let bytes = self.read(&category.builder_file()).await?;
        let token = VersionToken::of(&bytes);
        let catalog = Catalog::from_bytes(&bytes)
            .with_context(|| format!("failed to parse {}", category.builder_file()))?;
        Ok((catalog, token))
    }

    async fn persist(&self, catalog: &Catalog) -> Result<VersionToken> {
        let bytes = catalog
            .to_bytes()
            .context("failed to serialize catalog")?;
        self.write(&catalog.category.builder_file(), &bytes).await
    }
}

pub struct FileStore {
    data_dir: PathBuf,
    backup_dir: PathBuf,
}

impl FileStore {
    pub fn new(data_dir: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            backup_dir: backup_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn path_of(&self, file_name: &str) -> PathBuf {
        self.data_dir.join(file_name)
    }

    /// Provisions a brand new catalog file. Refuses to overwrite an existing one.
    pub async fn create(&self, catalog: &Catalog) -> anyhow::Result<VersionToken> {
        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .with_context(|| format!("failed to create {}", self.data_dir.display()))?;
        let path = self.path_of(&catalog.category.builder_file());
        let bytes = catalog.to_bytes()?;

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to create {}", path.display()))?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;

        let token = VersionToken::of(&bytes);
        tracing::info!("Created {} ({})", path.display(), token);
        Ok(token)
    }

    /// Backup snapshots of `file_name`, sorted by name.
    pub async fn backups(&self, file_name: &str) -> anyhow::Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.backup_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e.into()),
        };
        let suffix = format!(".{}", file_name);
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(&suffix) {
                found.push(entry.path());
            }
        }
        found.sort();
        Ok(found)
    }

    /// Copies the current canonical file into the backup area under a name no other
    /// snapshot uses. Returns `None` when there is nothing to back up yet.
    async fn make_backup(&self, file_name: &str) -> anyhow::Result<Option<PathBuf>> {
        let source = self.path_of(file_name);
        let bytes = match tokio::fs::read(&source).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", source.display()));
            }
        };

        tokio::fs::create_dir_all(&self.backup_dir)
            .await
            .with_context(|| format!("failed to create {}", self.backup_dir.display()))?;

        let stamp = now_ms();
        let mut attempt = 0u32;
        loop {
            let name = if attempt == 0 {
                format!("{}.{}", stamp, file_name)
            } else {
                format!("{}-{}.{}", stamp, attempt, file_name)
            };
            let backup = self.backup_dir.join(name);

            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&backup)
                .await
            {
                Ok(mut file) => {
                    file.write_all(&bytes).await?;
                    file.sync_all().await?;
                    tracing::info!(
                        "Backed up {} to {} ({})",
                        source.display(),
                        backup.display(),
                        VersionToken::of(&bytes)
                    );
                    return Ok(Some(backup));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("failed to create {}", backup.display()));
                }
            }
        }
    }

    async fn replace(&self, file_name: &str, bytes: &[u8]) -> anyhow::Result<()> {
        let dest = self.path_of(file_name);
        let tmp = self.path_of(&format!(".{}.partial", file_name));

        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .with_context(|| format!("failed to create {}", self.data_dir.display()))?;
        {
            let mut file = tokio::fs::File::create(&tmp)
                .await
                .with_context(|| format!("failed to create {}", tmp.display()))?;
            file.write_all(bytes)
                .await
                .with_context(|| format!("failed to write {}", tmp.display()))?;
            file.sync_all()
                .await
                .with_context(|| format!("failed to flush {}", tmp.display()))?;
        }

        tokio::fs::rename(&tmp, &dest).await.with_context(|| {
            format!(
                "failed to move {} into place at {}",
                tmp.display(),
                dest.display()
            )
        })?;
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for FileStore {
    async fn read(&self, file_name: &str) -> Result<Vec<u8>> {
        let path = self.path_of(file_name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::NotFound(format!("{} does not exist", file_name)))
            }
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("failed to read {}", path.display()))
                .into()),
        }
    }

    async fn write(&self, file_name: &str, bytes: &[u8]) -> Result<VersionToken> {
        self.make_backup(file_name).await?;
        self.replace(file_name, bytes).await?;

        let token = VersionToken::of(bytes);
        tracing::info!("Wrote {} ({})", self.path_of(file_name).display(), token);
        Ok(token)
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

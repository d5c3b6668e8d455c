//! Disk backed persistence for data that has to survive restarts
//!
//! Layout under the data directory:
//! - `current/<directory>/<name>`: live data, overwritten by `save`
//! - `snapshot/<directory>/<name>.<unix nanos>`: write-once copies
//! - `archive/<directory>/<name>`: data retired with `archive`

use crate::error::{ChainError, ChainResult};

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

const CURRENT_DIR: &str = "current";
const ARCHIVE_DIR: &str = "archive";
const SNAPSHOT_DIR: &str = "snapshot";

/// Longest accepted directory or file name
pub const MAX_NAME_LENGTH: usize = 128;

/// One persisted file read back by `read_all`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDescriptor {
    pub directory: String,
    pub name: String,
    pub content: Vec<u8>,
}

/// Storage operations used by components that persist state
#[async_trait]
pub trait PersistenceHandle: Send + Sync {
    async fn save(&self, data: &[u8], directory: &str, name: &str) -> ChainResult<()>;

    async fn snapshot(&self, data: &[u8], directory: &str, name: &str) -> ChainResult<PathBuf>;

    async fn read_all(&self) -> ChainResult<Vec<DataDescriptor>>;

    async fn archive(&self, directory: &str) -> ChainResult<()>;

    async fn delete(&self, directory: &str, name: &str) -> ChainResult<()>;
}

/// `PersistenceHandle` writing plain files under one data directory
pub struct DiskHandler {
    data_dir: PathBuf,
}

impl DiskHandler {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn area(&self, area: &str, directory: &str) -> ChainResult<PathBuf> {
        validate_name(directory)?;
        Ok(self.data_dir.join(area).join(directory))
    }
}

#[async_trait]
impl PersistenceHandle for DiskHandler {
    /// Write `data` to `current/<directory>/<name>`, replacing earlier contents
    async fn save(&self, data: &[u8], directory: &str, name: &str) -> ChainResult<()> {
        validate_name(name)?;
        let dir = self.area(CURRENT_DIR, directory)?;
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| ChainError::storage(&dir, e))?;

        // Readers never see a half written file
        let path = dir.join(name);
        let tmp_path = dir.join(format!(".{}.tmp", name));
        fs::write(&tmp_path, data)
            .await
            .map_err(|e| ChainError::storage(&tmp_path, e))?;
        fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| ChainError::storage(&path, e))?;

        debug!("Saved {} bytes to {}", data.len(), path.display());
        Ok(())
    }

    /// Write `data` to a new `snapshot/<directory>/<name>.<unix nanos>` file
    async fn snapshot(&self, data: &[u8], directory: &str, name: &str) -> ChainResult<PathBuf> {
        validate_name(name)?;
        let dir = self.area(SNAPSHOT_DIR, directory)?;
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| ChainError::storage(&dir, e))?;

        let mut suffix = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        loop {
            let path = dir.join(format!("{}.{}", name, suffix));
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    file.write_all(data)
                        .await
                        .map_err(|e| ChainError::storage(&path, e))?;
                    file.flush()
                        .await
                        .map_err(|e| ChainError::storage(&path, e))?;

                    debug!("Wrote snapshot {}", path.display());
                    return Ok(path);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => suffix += 1,
                Err(e) => return Err(ChainError::storage(&path, e)),
            }
        }
    }

    /// Every file stored under `current/`
    async fn read_all(&self) -> ChainResult<Vec<DataDescriptor>> {
        let root = self.data_dir.join(CURRENT_DIR);
        let mut descriptors = Vec::new();

        let mut directories = match fs::read_dir(&root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(descriptors),
            Err(e) => return Err(ChainError::storage(&root, e)),
        };

        while let Some(dir_entry) = directories
            .next_entry()
            .await
            .map_err(|e| ChainError::storage(&root, e))?
        {
            let dir_path = dir_entry.path();
            let is_dir = dir_entry
                .file_type()
                .await
                .map_err(|e| ChainError::storage(&dir_path, e))?
                .is_dir();
            let Some(directory) = dir_entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !is_dir {
                continue;
            }

            let mut files = fs::read_dir(&dir_path)
                .await
                .map_err(|e| ChainError::storage(&dir_path, e))?;
            while let Some(file_entry) = files
                .next_entry()
                .await
                .map_err(|e| ChainError::storage(&dir_path, e))?
            {
                let Some(name) = file_entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                // Leftovers of an interrupted save
                if name.starts_with('.') && name.ends_with(".tmp") {
                    continue;
                }

                let path = file_entry.path();
                let content = fs::read(&path)
                    .await
                    .map_err(|e| ChainError::storage(&path, e))?;
                descriptors.push(DataDescriptor {
                    directory: directory.clone(),
                    name,
                    content,
                });
            }
        }

        Ok(descriptors)
    }

    /// Move `current/<directory>` to `archive/<directory>`, merging file by file
    /// into an existing archive. A directory with no current data is a no-op.
    async fn archive(&self, directory: &str) -> ChainResult<()> {
        let source = self.area(CURRENT_DIR, directory)?;
        let target = self.area(ARCHIVE_DIR, directory)?;

        if !fs::try_exists(&source)
            .await
            .map_err(|e| ChainError::storage(&source, e))?
        {
            debug!("Nothing to archive in {}", source.display());
            return Ok(());
        }

        let archive_root = self.data_dir.join(ARCHIVE_DIR);
        fs::create_dir_all(&archive_root)
            .await
            .map_err(|e| ChainError::storage(&archive_root, e))?;

        if !fs::try_exists(&target)
            .await
            .map_err(|e| ChainError::storage(&target, e))?
        {
            fs::rename(&source, &target)
                .await
                .map_err(|e| ChainError::storage(&target, e))?;
            info!("Archived {}", directory);
            return Ok(());
        }

        let mut files = fs::read_dir(&source)
            .await
            .map_err(|e| ChainError::storage(&source, e))?;
        while let Some(entry) = files
            .next_entry()
            .await
            .map_err(|e| ChainError::storage(&source, e))?
        {
            let destination = target.join(entry.file_name());
            fs::rename(entry.path(), &destination)
                .await
                .map_err(|e| ChainError::storage(&destination, e))?;
        }
        fs::remove_dir(&source)
            .await
            .map_err(|e| ChainError::storage(&source, e))?;

        info!("Archived {} into existing archive", directory);
        Ok(())
    }

    /// Remove `current/<directory>/<name>`
    async fn delete(&self, directory: &str, name: &str) -> ChainResult<()> {
        validate_name(name)?;
        let path = self.area(CURRENT_DIR, directory)?.join(name);
        fs::remove_file(&path)
            .await
            .map_err(|e| ChainError::storage(&path, e))?;

        debug!("Deleted {}", path.display());
        Ok(())
    }
}

/// Reject names that are empty, too long, could escape their directory or
/// start with a dot.
///
/// Dot names are reserved for in-progress writes, which `read_all` skips.
fn validate_name(name: &str) -> ChainResult<()> {
    let invalid = name.is_empty()
        || name.chars().count() > MAX_NAME_LENGTH
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0']);

    if invalid {
        return Err(ChainError::InvalidName {
            name: name.to_string(),
            max: MAX_NAME_LENGTH,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sorted(mut descriptors: Vec<DataDescriptor>) -> Vec<DataDescriptor> {
        descriptors.sort_by(|a, b| (&a.directory, &a.name).cmp(&(&b.directory, &b.name)));
        descriptors
    }

    #[tokio::test]
    async fn test_save_overwrites_and_read_all_lists_current() {
        let tmp = TempDir::new().unwrap();
        let handler = DiskHandler::new(tmp.path());

        assert!(handler.read_all().await.unwrap().is_empty());

        handler.save(b"one", "heads", "latest").await.unwrap();
        handler.save(b"two", "heads", "latest").await.unwrap();
        handler.save(b"7", "nonces", "0xabc").await.unwrap();

        assert_eq!(
            sorted(handler.read_all().await.unwrap()),
            vec![
                DataDescriptor {
                    directory: "heads".into(),
                    name: "latest".into(),
                    content: b"two".to_vec(),
                },
                DataDescriptor {
                    directory: "nonces".into(),
                    name: "0xabc".into(),
                    content: b"7".to_vec(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_snapshots_never_overwrite() {
        let tmp = TempDir::new().unwrap();
        let handler = DiskHandler::new(tmp.path());

        let first = handler.snapshot(b"a", "heads", "latest").await.unwrap();
        let second = handler.snapshot(b"b", "heads", "latest").await.unwrap();

        assert_ne!(first, second);
        assert_eq!(std::fs::read(&first).unwrap(), b"a");
        assert_eq!(std::fs::read(&second).unwrap(), b"b");
        // Snapshots are not live data
        assert!(handler.read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_archive_merges_into_existing() {
        let tmp = TempDir::new().unwrap();
        let handler = DiskHandler::new(tmp.path());

        handler.save(b"1", "keys", "a").await.unwrap();
        handler.archive("keys").await.unwrap();
        handler.save(b"2", "keys", "b").await.unwrap();
        handler.archive("keys").await.unwrap();

        assert!(handler.read_all().await.unwrap().is_empty());
        let archived = tmp.path().join(ARCHIVE_DIR).join("keys");
        assert_eq!(std::fs::read(archived.join("a")).unwrap(), b"1");
        assert_eq!(std::fs::read(archived.join("b")).unwrap(), b"2");

        handler.archive("missing").await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_removes_single_file() {
        let tmp = TempDir::new().unwrap();
        let handler = DiskHandler::new(tmp.path());

        handler.save(b"1", "keys", "a").await.unwrap();
        handler.save(b"2", "keys", "b").await.unwrap();
        handler.delete("keys", "a").await.unwrap();

        let remaining = handler.read_all().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name, "b");

        assert!(matches!(
            handler.delete("keys", "a").await,
            Err(ChainError::Storage { .. })
        ));
    }

    #[tokio::test]
    async fn test_rejects_invalid_names() {
        let tmp = TempDir::new().unwrap();
        let handler = DiskHandler::new(tmp.path());
        let too_long = "x".repeat(MAX_NAME_LENGTH + 1);

        for (directory, name) in [
            ("..", "file"),
            ("dir", "."),
            ("dir", ".cache.tmp"),
            ("dir", ".hidden"),
            (".git", "file"),
            ("dir", "a/b"),
            ("a\\b", "file"),
            ("", "file"),
            ("dir", too_long.as_str()),
        ] {
            assert!(matches!(
                handler.save(b"x", directory, name).await,
                Err(ChainError::InvalidName { .. })
            ));
        }

        let longest = "x".repeat(MAX_NAME_LENGTH);
        handler.save(b"x", "dir", &longest).await.unwrap();
    }
}

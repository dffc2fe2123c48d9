use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use tokio::io::AsyncReadExt;

/// File access used by the cache, the manifest and unit loading.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn read(&self, path: &str) -> Result<Vec<u8>>;
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;
    async fn delete(&self, path: &str) -> Result<()>;
    async fn exists(&self, path: &str) -> Result<bool>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
    /// Size in bytes, or `None` when the path does not exist.
    async fn size(&self, path: &str) -> Result<Option<u64>>;
    /// Reads at most `limit` bytes from the start of the file.
    async fn read_head(&self, path: &str, limit: usize) -> Result<Vec<u8>>;

    async fn read_to_string(&self, path: &str) -> Result<String> {
        let bytes = self.read(path).await?;
        String::from_utf8(bytes).with_context(|| format!("{} is not valid UTF-8", path))
    }
}

#[derive(Debug, Default, Clone)]
pub struct NativeStorage;

impl NativeStorage {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Storage for NativeStorage {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        // Replace atomically via a sibling temp file.
        let tmp = format!("{}.part", path);
        tokio::fs::write(&tmp, content)
            .await
            .with_context(|| format!("Failed to write {}", tmp))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to move {} into place", path))?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        if tokio::fs::try_exists(path).await? {
            if Path::new(path).is_dir() {
                tokio::fs::remove_dir_all(path).await?;
            } else {
                tokio::fs::remove_file(path).await?;
            }
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(path).await?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let path = Path::new(prefix);
        let mut entries = Vec::new();

        if tokio::fs::try_exists(path).await? {
            if path.is_dir() {
                let mut dir = tokio::fs::read_dir(path).await?;
                while let Some(entry) = dir.next_entry().await? {
                    entries.push(entry.path().to_string_lossy().to_string());
                }
            } else {
                entries.push(prefix.to_string());
            }
        }

        entries.sort();
        Ok(entries)
    }

    async fn size(&self, path: &str) -> Result<Option<u64>> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to stat {}", path)),
        }
    }

    async fn read_head(&self, path: &str, limit: usize) -> Result<Vec<u8>> {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("Failed to open {}", path))?;
        let mut buf = Vec::with_capacity(limit);
        file.take(limit as u64).read_to_end(&mut buf).await?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_creates_parents_and_reads_back() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join("a/b/c.txt");
        let path_str = path.to_string_lossy().to_string();
        let storage = NativeStorage::new();

        storage.write(&path_str, b"hello").await?;
        assert!(storage.exists(&path_str).await?);
        assert_eq!(storage.read_to_string(&path_str).await?, "hello");
        assert_eq!(storage.size(&path_str).await?, Some(5));
        assert_eq!(storage.read_head(&path_str, 2).await?, b"he");
        assert!(!temp_dir.path().join("a/b/c.txt.part").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_size_of_missing_file_is_none() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join("missing.wav");
        let storage = NativeStorage::new();
        assert_eq!(storage.size(&path.to_string_lossy()).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_is_sorted() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        std::fs::write(temp_dir.path().join("b.txt"), "b")?;
        std::fs::write(temp_dir.path().join("a.txt"), "a")?;
        let storage = NativeStorage::new();

        let entries = storage.list(&temp_dir.path().to_string_lossy()).await?;
        assert_eq!(entries.len(), 2);
        assert!(entries[0].ends_with("a.txt"));
        assert!(entries[1].ends_with("b.txt"));
        Ok(())
    }
}

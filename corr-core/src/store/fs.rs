use std::path::{Path, PathBuf};

use crate::error::Result;

use super::Store;

/// Filesystem-backed store. Keys map to files under `root`, with `/`
/// preserved as the path separator; a key's directory is created lazily on
/// first write.
#[derive(Debug)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait::async_trait]
impl Store for FsStore {
    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(crate::error::StoreError::Io)?;
        }
        tokio::fs::write(&path, value)
            .await
            .map_err(crate::error::StoreError::Io)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(crate::error::StoreError::Io(e).into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) | Err(_) => Ok(()),
        }
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let base = self.path_for(prefix);
        let (dir, file_prefix) = if base.is_dir() {
            (base.clone(), String::new())
        } else {
            let parent = base.parent().unwrap_or(&self.root).to_path_buf();
            let file_prefix = base
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            (parent, file_prefix)
        };

        let mut keys = Vec::new();
        collect_keys(&self.root, &dir, &file_prefix, &mut keys).await?;
        keys.sort();
        Ok(keys)
    }
}

async fn collect_keys(
    root: &Path,
    dir: &Path,
    file_prefix: &str,
    out: &mut Vec<String>,
) -> Result<()> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(crate::error::StoreError::Io(e).into()),
    };

    while let Some(entry) = entries.next_entry().await.map_err(crate::error::StoreError::Io)? {
        let path = entry.path();
        if path.is_dir() {
            Box::pin(collect_keys(root, &path, "", out)).await?;
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if !file_prefix.is_empty() && !name.starts_with(file_prefix) {
            continue;
        }
        if let Ok(relative) = path.strip_prefix(root) {
            out.push(relative.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/"));
        }
    }
    Ok(())
}

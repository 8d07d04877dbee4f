//! Local filesystem storage for `file://` URIs and bare paths.
//!
//! Every path is confined to a root directory: relative paths resolve under
//! it, absolute paths must already lie inside it, and `..` is refused.
//! Metadata lives next to each object in `<path>.meta.json`.

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;

use super::{Metadata, Storage};

const META_SUFFIX: &str = ".meta.json";

#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn to_path(&self, uri: &str) -> Result<PathBuf> {
        let raw = Path::new(uri.strip_prefix("file://").unwrap_or(uri));
        if raw.components().any(|c| matches!(c, Component::ParentDir)) {
            anyhow::bail!("<{}> may not contain `..`", uri);
        }
        if raw.is_absolute() {
            if !raw.starts_with(&self.root) {
                anyhow::bail!("<{}> is outside {}", uri, self.root.display());
            }
            Ok(raw.to_path_buf())
        } else {
            Ok(self.root.join(raw))
        }
    }
}

fn meta_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(META_SUFFIX);
    PathBuf::from(name)
}

#[async_trait::async_trait]
impl Storage for LocalStorage {
    async fn read(&self, uri: &str) -> Result<Vec<u8>> {
        let path = self.to_path(uri)?;
        fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {:?}", path))
    }

    async fn write(&self, uri: &str, data: Vec<u8>, metadata: Metadata) -> Result<()> {
        let path = self.to_path(uri)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
        fs::write(&path, data)
            .await
            .with_context(|| format!("Failed to write {:?}", path))?;

        let meta = meta_path(&path);
        if metadata.is_empty() {
            if fs::try_exists(&meta).await.unwrap_or(false) {
                fs::remove_file(&meta).await.ok();
            }
        } else {
            fs::write(&meta, serde_json::to_vec(&metadata)?)
                .await
                .with_context(|| format!("Failed to write {:?}", meta))?;
        }
        Ok(())
    }

    async fn exists(&self, uri: &str) -> Result<bool> {
        Ok(fs::try_exists(self.to_path(uri)?).await?)
    }

    async fn metadata(&self, uri: &str) -> Result<Metadata> {
        let path = self.to_path(uri)?;
        if !fs::try_exists(&path).await? {
            anyhow::bail!("{:?} does not exist", path);
        }
        match fs::read(meta_path(&path)).await {
            Ok(raw) => serde_json::from_slice(&raw).context("Invalid metadata sidecar"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Metadata::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, uris: &[String]) -> Result<()> {
        for uri in uris {
            let path = self.to_path(uri)?;
            for p in [meta_path(&path), path] {
                match fs::remove_file(&p).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e).with_context(|| format!("Failed to delete {:?}", p)),
                }
            }
        }
        Ok(())
    }

    async fn list(&self, uri: &str) -> Result<Vec<String>> {
        let path = self.to_path(uri)?;
        let mut entries = fs::read_dir(&path)
            .await
            .with_context(|| format!("Failed to list {:?}", path))?;
        let base = uri.trim_end_matches('/');

        let mut children = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(META_SUFFIX) {
                continue;
            }
            children.push(format!("{}/{}", base, name));
        }
        children.sort();
        Ok(children)
    }
}

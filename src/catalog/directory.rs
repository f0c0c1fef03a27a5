//! Catalog backed by a mounted export directory.
//!
//! Layout: `<source>/albums/<album>/<file>` for personal albums and
//! `<source>/shared/<album>/<file>` for shared ones. An item's id is its
//! album-qualified relative path, which stays stable across listings.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;

use super::{AlbumFilters, AlbumKind, ItemMetadata, PhotoCatalog, RemoteError};

const PERSONAL_DIR: &str = "albums";
const SHARED_DIR: &str = "shared";

#[derive(Debug, Clone)]
pub struct DirectoryCatalog {
    source: PathBuf,
}

impl DirectoryCatalog {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    fn resolve(&self, item: &ItemMetadata) -> PathBuf {
        item.id.split('/').fold(self.source.clone(), |p, c| p.join(c))
    }
}

fn is_listable(name: &str) -> bool {
    !name.starts_with('.') && !name.ends_with(".part")
}

/// Sorted names of the entries in `dir` matching `want_dir`.
async fn sorted_entries(dir: &Path, want_dir: bool) -> Result<Vec<(String, PathBuf)>, RemoteError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut out = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_listable(&name) {
            continue;
        }
        let file_type = entry.file_type().await?;
        if file_type.is_dir() == want_dir && (want_dir || file_type.is_file()) {
            out.push((name, entry.path()));
        }
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

#[async_trait]
impl PhotoCatalog for DirectoryCatalog {
    async fn authenticate(&self) -> Result<(), RemoteError> {
        match fs::metadata(&self.source).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(RemoteError::Auth(format!(
                "{} is not a directory",
                self.source.display()
            ))),
            Err(e) => Err(RemoteError::Auth(format!(
                "cannot access {}: {}",
                self.source.display(),
                e
            ))),
        }
    }

    async fn requires_step_up(&self) -> bool {
        false
    }

    async fn list_items(&self, filters: &AlbumFilters) -> Result<Vec<ItemMetadata>, RemoteError> {
        let mut items = Vec::new();

        for (kind, dir) in [(AlbumKind::Personal, PERSONAL_DIR), (AlbumKind::Shared, SHARED_DIR)] {
            for (album, album_path) in sorted_entries(&self.source.join(dir), true).await? {
                if !filters.allows(kind, &album) {
                    tracing::debug!(album = %album, kind = %kind, "Album excluded by filter");
                    continue;
                }
                for (filename, path) in sorted_entries(&album_path, false).await? {
                    let meta = fs::metadata(&path).await?;
                    let created_at = meta.modified().ok().map(DateTime::<Utc>::from);
                    items.push(ItemMetadata {
                        id: format!("{}/{}/{}", dir, album, filename),
                        filename,
                        size: meta.len(),
                        album: album.clone(),
                        kind,
                        created_at,
                    });
                }
            }
        }

        tracing::debug!(count = items.len(), source = %self.source.display(), "Listed catalog");
        Ok(items)
    }

    async fn download(&self, item: &ItemMetadata, destination: &Path) -> Result<(), RemoteError> {
        let source = self.resolve(item);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut part = destination.as_os_str().to_owned();
        part.push(".part");
        let part = PathBuf::from(part);

        if let Err(e) = fs::copy(&source, &part).await {
            let _ = fs::remove_file(&part).await;
            let transient = e.kind() != std::io::ErrorKind::NotFound;
            return Err(RemoteError::Transfer {
                item: item.id.clone(),
                reason: e.to_string(),
                transient,
            });
        }
        fs::rename(&part, destination).await?;
        Ok(())
    }
}

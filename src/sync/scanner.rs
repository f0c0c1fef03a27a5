//! Local filesystem inventory under the sync root, album by album.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::Path;

use tokio::fs;

/// Files present under the sync root, grouped by the `/`-separated
/// directory holding them (`Trips`, `shared/Family`). Files directly under
/// the root are grouped under the empty name.
#[derive(Debug, Default, Clone)]
pub struct LocalInventory {
    albums: BTreeMap<String, BTreeSet<String>>,
}

fn split_relative(relative_path: &str) -> (&str, &str) {
    relative_path.rsplit_once('/').unwrap_or(("", relative_path))
}

impl LocalInventory {
    /// Whether a file exists at the given `/`-separated relative path.
    pub fn contains(&self, relative_path: &str) -> bool {
        let (album, file) = split_relative(relative_path);
        self.albums
            .get(album)
            .is_some_and(|files| files.contains(file))
    }

    pub fn insert(&mut self, relative_path: &str) {
        let (album, file) = split_relative(relative_path);
        self.albums
            .entry(album.to_string())
            .or_default()
            .insert(file.to_string());
    }

    pub fn file_count(&self) -> usize {
        self.albums.values().map(BTreeSet::len).sum()
    }

    /// Directories below the root that hold at least one file.
    pub fn album_count(&self) -> usize {
        self.albums.keys().filter(|a| !a.is_empty()).count()
    }
}

fn is_tracked_name(name: &str) -> bool {
    !name.starts_with('.') && !name.ends_with(".part")
}

/// Enumerate files under `root`. A missing root yields an empty inventory.
pub async fn scan(root: &Path) -> io::Result<LocalInventory> {
    let mut inventory = LocalInventory::default();
    let mut pending = vec![(root.to_path_buf(), String::new())];

    while let Some((dir, prefix)) = pending.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound && prefix.is_empty() => {
                return Ok(inventory)
            }
            Err(e) => return Err(e),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_tracked_name(&name) {
                continue;
            }
            let relative = if prefix.is_empty() {
                name
            } else {
                format!("{}/{}", prefix, name)
            };
            let file_type = entry.file_type().await?;
            if file_type.is_file() {
                inventory.insert(&relative);
            } else if file_type.is_dir() {
                pending.push((entry.path(), relative));
            }
        }
    }

    tracing::debug!(
        albums = inventory.album_count(),
        files = inventory.file_count(),
        root = %root.display(),
        "Scanned local tree"
    );
    Ok(inventory)
}

//! Scriptable in-memory catalog for tests.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{AlbumFilters, AlbumKind, ItemMetadata, PhotoCatalog, RemoteError};

pub fn item(id: &str, filename: &str, album: &str, size: u64) -> ItemMetadata {
    ItemMetadata {
        id: id.to_string(),
        filename: filename.to_string(),
        size,
        album: album.to_string(),
        kind: AlbumKind::Personal,
        created_at: None,
    }
}

pub fn shared_item(id: &str, filename: &str, album: &str, size: u64) -> ItemMetadata {
    ItemMetadata {
        kind: AlbumKind::Shared,
        ..item(id, filename, album, size)
    }
}

#[derive(Default)]
pub struct MockCatalog {
    items: Mutex<Vec<ItemMetadata>>,
    failing: Mutex<HashSet<String>>,
    throttled: Mutex<HashSet<String>>,
    auth_fails: AtomicBool,
    step_up: AtomicBool,
    accepted_code: Mutex<Option<String>>,
    downloaded: Mutex<Vec<String>>,
    download_delay: Mutex<Option<Duration>>,
    list_calls: AtomicUsize,
}

impl MockCatalog {
    pub fn new(items: Vec<ItemMetadata>) -> Self {
        Self {
            items: Mutex::new(items),
            ..Default::default()
        }
    }

    pub fn set_items(&self, items: Vec<ItemMetadata>) {
        *self.items.lock().unwrap() = items;
    }

    pub fn fail(&self, id: &str) {
        self.failing.lock().unwrap().insert(id.to_string());
    }

    pub fn heal(&self, id: &str) {
        self.failing.lock().unwrap().remove(id);
    }

    pub fn throttle(&self, id: &str) {
        self.throttled.lock().unwrap().insert(id.to_string());
    }

    pub fn clear_throttle(&self) {
        self.throttled.lock().unwrap().clear();
    }

    pub fn fail_auth(&self) {
        self.auth_fails.store(true, Ordering::SeqCst);
    }

    pub fn require_step_up(&self, code: &str) {
        self.step_up.store(true, Ordering::SeqCst);
        *self.accepted_code.lock().unwrap() = Some(code.to_string());
    }

    pub fn set_download_delay(&self, delay: Duration) {
        *self.download_delay.lock().unwrap() = Some(delay);
    }

    /// Ids of every successful transfer, in order.
    pub fn downloaded(&self) -> Vec<String> {
        self.downloaded.lock().unwrap().clone()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PhotoCatalog for MockCatalog {
    async fn authenticate(&self) -> Result<(), RemoteError> {
        if self.auth_fails.load(Ordering::SeqCst) {
            return Err(RemoteError::Auth("rejected".to_string()));
        }
        Ok(())
    }

    async fn requires_step_up(&self) -> bool {
        self.step_up.load(Ordering::SeqCst)
    }

    async fn list_items(&self, filters: &AlbumFilters) -> Result<Vec<ItemMetadata>, RemoteError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .items
            .lock()
            .unwrap()
            .iter()
            .filter(|i| filters.allows(i.kind, &i.album))
            .cloned()
            .collect())
    }

    async fn download(&self, item: &ItemMetadata, destination: &Path) -> Result<(), RemoteError> {
        let delay = *self.download_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.throttled.lock().unwrap().contains(&item.id) {
            return Err(RemoteError::Throttled { retry_after: None });
        }
        if self.failing.lock().unwrap().contains(&item.id) {
            return Err(RemoteError::Transfer {
                item: item.id.clone(),
                reason: "scripted failure".to_string(),
                transient: false,
            });
        }

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(destination, vec![0x42; item.size as usize]).await?;
        self.downloaded.lock().unwrap().push(item.id.clone());
        Ok(())
    }

    async fn request_new_code(&self) -> bool {
        true
    }

    async fn validate_code(&self, code: &str) -> bool {
        let accepted = self.accepted_code.lock().unwrap().clone();
        if accepted.as_deref() == Some(code) {
            self.step_up.store(false, Ordering::SeqCst);
            true
        } else {
            false
        }
    }
}

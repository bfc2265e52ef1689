//! FIFO recycling of on-disk HTTP cache directories across browser
//! generations.
//!
//! Generalizes `browser_setup.rs`'s `TempDirGuard` idiom (guard one
//! directory per launch, delete on drop unless consumed) from a single
//! owned directory to a reusable pool of them.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

const CACHE_DIR_PREFIX: &str = "puppeteer_disk_cache-";

pub struct CacheRecycler {
    queue: Mutex<VecDeque<PathBuf>>,
}

impl CacheRecycler {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().expect("cache recycler mutex poisoned").len()
    }

    /// Dequeue a recycled directory if one is available, else create a fresh
    /// one under the OS temp root.
    pub fn take_or_create(&self) -> std::io::Result<PathBuf> {
        if let Some(path) = self
            .queue
            .lock()
            .expect("cache recycler mutex poisoned")
            .pop_front()
        {
            return Ok(path);
        }
        Self::create_unique_dir()
    }

    fn create_unique_dir() -> std::io::Result<PathBuf> {
        let path = std::env::temp_dir().join(format!("{CACHE_DIR_PREFIX}{}", Uuid::new_v4()));
        std::fs::create_dir(&path)?;
        Ok(path)
    }

    /// Return a directory to the FIFO for a future launch to reuse.
    pub fn recycle(&self, path: PathBuf) {
        self.queue
            .lock()
            .expect("cache recycler mutex poisoned")
            .push_back(path);
    }

    /// Drain the FIFO and delete every directory it held. Deletion errors
    /// are logged and swallowed.
    pub async fn drain_delete_all(&self) {
        let dirs: Vec<PathBuf> = self
            .queue
            .lock()
            .expect("cache recycler mutex poisoned")
            .drain(..)
            .collect();
        for dir in dirs {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                warn!(path = %dir.display(), error = %e, "failed to delete recycled cache directory");
            }
        }
    }
}

impl Default for CacheRecycler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycle_then_take_consumes_exactly_one_entry() {
        let recycler = CacheRecycler::new();
        let dir = std::env::temp_dir().join(format!("{CACHE_DIR_PREFIX}test-{}", Uuid::new_v4()));
        std::fs::create_dir(&dir).unwrap();
        recycler.recycle(dir.clone());
        assert_eq!(recycler.len(), 1);

        let taken = recycler.take_or_create().unwrap();
        assert_eq!(taken, dir);
        assert_eq!(recycler.len(), 0);

        std::fs::remove_dir_all(&taken).ok();
    }

    #[tokio::test]
    async fn drain_delete_all_removes_directories_from_disk() {
        let recycler = CacheRecycler::new();
        let dir = recycler.take_or_create().unwrap();
        assert!(dir.exists());
        recycler.recycle(dir.clone());

        recycler.drain_delete_all().await;

        assert!(!dir.exists());
        assert_eq!(recycler.len(), 0);
    }
}

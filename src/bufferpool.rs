use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::constants::{BP_MAX_PAGES, PAGE_DATA_SIZE};
use crate::errors::DatabaseError;
use crate::page::Page;

/// Identifies one physical page held by the pool. Doubles as the pin token
/// returned by `fetch` and consumed by `release`.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct PageKey {
    pub table: String,
    pub range: usize,
    pub segment: usize,
    pub page_index: usize,
    pub column_index: usize,
}

impl PageKey {
    pub fn new(
        table: &str,
        range: usize,
        segment: usize,
        page_index: usize,
        column_index: usize,
    ) -> Self {
        PageKey {
            table: table.to_string(),
            range,
            segment,
            page_index,
            column_index,
        }
    }
}

/// Counters maintained by the pool, exposed as a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub max_pages: usize,
    pub cached: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub disk_writes: u64,
}

/// In-memory cache of pages with pin-aware LRU eviction and write-back.
///
/// Pages live behind `Arc<Mutex<_>>` so callers can hold a fetched page across
/// pool operations; the pin count is what keeps the entry resident. The pool's
/// own map and recency list are single-threaded — wrap the pool in a mutex to
/// share it.
pub struct BufferPool {
    max_pages: usize,

    /// When set, evicted dirty pages are written under this root and misses
    /// are served from it.
    storage_root: Option<PathBuf>,

    /// Recency list, most recently used first. Kept unbounded; capacity is
    /// enforced by `evict_oldest` so pinned pages are never dropped.
    frames: LruCache<PageKey, Arc<Mutex<Page>>>,

    hits: u64,
    misses: u64,
    evictions: u64,
    disk_writes: u64,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_capacity(BP_MAX_PAGES)
    }

    pub fn with_capacity(max_pages: usize) -> Self {
        BufferPool {
            max_pages,
            storage_root: None,
            frames: LruCache::unbounded(),
            hits: 0,
            misses: 0,
            evictions: 0,
            disk_writes: 0,
        }
    }

    /// A pool that persists evicted and flushed pages under `root`.
    pub fn with_storage(max_pages: usize, root: impl Into<PathBuf>) -> Result<Self, DatabaseError> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let mut pool = Self::with_capacity(max_pages);
        pool.storage_root = Some(root);
        Ok(pool)
    }

    /// Fetch the page for `key`, pinning it. A cached page is promoted to most
    /// recently used; a miss loads from disk (an empty page when no file
    /// exists), evicting the oldest unpinned entry if the pool is full.
    pub fn fetch(&mut self, key: &PageKey) -> Result<Arc<Mutex<Page>>, DatabaseError> {
        let cached = self.frames.get(key).map(Arc::clone);
        if let Some(page) = cached {
            self.hits += 1;
            page.lock().unwrap().pin();
            return Ok(page);
        }

        self.misses += 1;

        if self.frames.len() >= self.max_pages {
            self.evict_oldest()?;
        }

        let page = Arc::new(Mutex::new(self.load_from_disk(key)));
        page.lock().unwrap().pin();
        self.frames.put(key.clone(), Arc::clone(&page));
        Ok(page)
    }

    /// Drop one pin on the page for `key`. When the pin count reaches zero the
    /// entry becomes evictable and is promoted to most recently used.
    pub fn release(&mut self, key: &PageKey) -> Result<(), DatabaseError> {
        let entry = self
            .frames
            .peek(key)
            .map(Arc::clone)
            .ok_or_else(|| DatabaseError::NotFound(format!("page {:?} not cached", key)))?;

        let now_unpinned = {
            let mut page = entry.lock().unwrap();
            page.unpin();
            !page.is_pinned()
        };

        if now_unpinned {
            self.frames.promote(key);
        }

        Ok(())
    }

    /// Remove the oldest unpinned entry, writing it back first if dirty.
    fn evict_oldest(&mut self) -> Result<(), DatabaseError> {
        let victim = self
            .frames
            .iter()
            .rev()
            .find(|(_, entry)| !entry.lock().unwrap().is_pinned())
            .map(|(key, _)| key.clone());

        let key = match victim {
            Some(key) => key,
            None => return Err(DatabaseError::CacheExhausted(self.frames.len())),
        };

        if let Some(entry) = self.frames.pop(&key) {
            let mut page = entry.lock().unwrap();
            if page.is_dirty() {
                self.save_to_disk(&key, &mut page)?;
            }
            self.evictions += 1;
            debug!("evicted page {:?}", key);
        }

        Ok(())
    }

    /// Write a single cached page to disk if it is dirty.
    pub fn flush(&mut self, key: &PageKey) -> Result<(), DatabaseError> {
        let entry = match self.frames.peek(key) {
            Some(entry) => Arc::clone(entry),
            None => return Ok(()),
        };

        let mut page = entry.lock().unwrap();
        if page.is_dirty() {
            self.save_to_disk(key, &mut page)?;
        }
        Ok(())
    }

    /// Write every dirty page to disk.
    pub fn flush_all(&mut self) -> Result<(), DatabaseError> {
        let keys: Vec<PageKey> = self.frames.iter().map(|(key, _)| key.clone()).collect();
        for key in keys {
            self.flush(&key)?;
        }
        Ok(())
    }

    /// Drop every entry belonging to `table`. Fails without removing anything
    /// if any of them is pinned.
    pub fn drop_table(&mut self, table: &str) -> Result<(), DatabaseError> {
        let keys: Vec<PageKey> = self
            .frames
            .iter()
            .filter(|(key, _)| key.table == table)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &keys {
            if self.frames.peek(key).unwrap().lock().unwrap().is_pinned() {
                return Err(DatabaseError::InvariantViolation(format!(
                    "cannot drop table {}: page {:?} is pinned",
                    table, key
                )));
            }
        }

        for key in &keys {
            self.frames.pop(key);
        }

        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        let total = self.hits + self.misses;
        CacheStats {
            max_pages: self.max_pages,
            cached: self.frames.len(),
            hits: self.hits,
            misses: self.misses,
            hit_rate: if total > 0 {
                self.hits as f64 / total as f64
            } else {
                0.0
            },
            evictions: self.evictions,
            disk_writes: self.disk_writes,
        }
    }

    fn page_path(&self, key: &PageKey) -> Option<PathBuf> {
        self.storage_root.as_ref().map(|root| {
            root.join(&key.table)
                .join(format!("r{}", key.range))
                .join(format!("s{}", key.segment))
                .join(format!("p{}_c{}.dat", key.page_index, key.column_index))
        })
    }

    /// A read failure falls back to an empty page; only writes surface errors.
    fn load_from_disk(&self, key: &PageKey) -> Page {
        let path = match self.page_path(key) {
            Some(path) if path.exists() => path,
            _ => return Page::new(),
        };

        match fs::read(&path) {
            Ok(raw) if raw.len() >= 8 + PAGE_DATA_SIZE => Page::deserialize(&raw),
            Ok(_) => {
                warn!("short page file {:?}, treating as empty", path);
                Page::new()
            }
            Err(err) => {
                warn!("could not load {:?}: {}, treating as empty", path, err);
                Page::new()
            }
        }
    }

    fn save_to_disk(&mut self, key: &PageKey, page: &mut Page) -> Result<(), DatabaseError> {
        let path = match self.page_path(key) {
            Some(path) => path,
            None => return Ok(()),
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&path, page.serialize())?;
        page.mark_clean();
        self.disk_writes += 1;
        Ok(())
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        BufferPool::new()
    }
}

//! Per-worker LRU file cache with pin counts and race-resolved loads.
//!
//! The cache maps logical request paths to immutable file contents and
//! bounds the bytes it retains. Entries live in an index-based arena;
//! each entry is simultaneously a member of the key map and of an
//! intrusive (index-linked) recency list. A single mutex owns the whole
//! structure; only disk I/O during [`FileCache::load`] happens outside
//! it, with a post-read recheck resolving concurrent loads of the same
//! key to a single entry.
//!
//! # Handles and pinning
//!
//! [`FileCache::acquire`] and [`FileCache::load`] hand out a
//! [`CacheHandle`]: a scoped access token that pins the entry (bumps its
//! refcount) for as long as it lives and releases on drop. A pinned
//! entry is never evicted or invalidated, so bytes seen through a handle
//! stay valid and unchanged without further locking. Eviction that is
//! blocked by pins leaves the cache transiently over capacity; the next
//! release resolves it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, trace};

/// Capacity used when a cache is created with zero bytes.
const DEFAULT_CAPACITY_BYTES: u64 = 1024 * 1024;

/// Errors that can occur while loading a file into the cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The file could not be read from disk.
    #[error("I/O error reading {path}: {source}")]
    Io {
        /// The path that failed to read.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

impl CacheError {
    /// True when the failure was a permission denial (the handler maps
    /// this to 403 rather than 500).
    #[must_use]
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Self::Io { source, .. } => source.kind() == std::io::ErrorKind::PermissionDenied,
        }
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub items: usize,
    pub bytes_used: u64,
    pub capacity: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// One cached file.
struct CacheEntry {
    key: String,
    bytes: Arc<[u8]>,
    /// Outstanding handles. Non-zero pins the entry.
    refcount: u32,
    /// Neighbor toward the MRU end.
    prev: Option<usize>,
    /// Neighbor toward the LRU end.
    next: Option<usize>,
}

impl CacheEntry {
    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

#[derive(Default)]
struct CacheInner {
    capacity: u64,
    bytes_used: u64,
    entries: Vec<Option<CacheEntry>>,
    free_slots: Vec<usize>,
    index: HashMap<String, usize>,
    /// MRU end of the recency list.
    lru_head: Option<usize>,
    /// LRU end of the recency list.
    lru_tail: Option<usize>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Bounded in-memory cache of file contents keyed by logical path.
pub struct FileCache {
    inner: Mutex<CacheInner>,
}

/// Scoped access token to a pinned cache entry.
///
/// The referenced bytes remain valid and unchanged for the lifetime of
/// the handle; dropping it releases the pin and may trigger eviction if
/// the cache ran over capacity while the entry was pinned.
pub struct CacheHandle {
    cache: Arc<FileCache>,
    slot: usize,
    bytes: Arc<[u8]>,
}

impl CacheHandle {
    /// The cached file contents.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Entity size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

impl Drop for CacheHandle {
    fn drop(&mut self) {
        self.cache.release(self.slot);
    }
}

impl std::fmt::Debug for CacheHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHandle")
            .field("slot", &self.slot)
            .field("size", &self.bytes.len())
            .finish()
    }
}

impl FileCache {
    /// Creates a cache bounded at `capacity_bytes`. Zero is treated as a
    /// 1 MiB default.
    #[must_use]
    pub fn new(capacity_bytes: u64) -> Arc<Self> {
        let capacity = if capacity_bytes == 0 {
            DEFAULT_CAPACITY_BYTES
        } else {
            capacity_bytes
        };
        Arc::new(Self {
            inner: Mutex::new(CacheInner {
                capacity,
                ..CacheInner::default()
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Looks up `key`. On a hit the entry moves to the MRU position, its
    /// refcount rises, and a handle is returned; on a miss the miss
    /// counter rises and `None` is returned.
    #[must_use]
    pub fn acquire(self: &Arc<Self>, key: &str) -> Option<CacheHandle> {
        let mut inner = self.lock();
        let Some(&slot) = inner.index.get(key) else {
            inner.misses += 1;
            return None;
        };
        inner.move_to_front(slot);
        let entry = inner.entry_mut(slot);
        entry.refcount += 1;
        let bytes = Arc::clone(&entry.bytes);
        inner.hits += 1;
        trace!(key, "cache hit");
        Some(CacheHandle {
            cache: Arc::clone(self),
            slot,
            bytes,
        })
    }

    /// Looks up `key`, reading `absolute_path` from disk on a miss.
    ///
    /// The disk read happens outside the cache lock. After the read the
    /// lock is re-entered and the key re-checked: if a concurrent loader
    /// inserted it meanwhile, the fresh buffer is discarded and the
    /// existing entry is adopted (counted as a hit). Otherwise the new
    /// entry is inserted at the MRU position, pinned, and eviction runs
    /// if the cache went over capacity.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] if the file cannot be read.
    pub async fn load(
        self: &Arc<Self>,
        key: &str,
        absolute_path: &Path,
    ) -> Result<CacheHandle, CacheError> {
        if let Some(handle) = self.acquire(key) {
            return Ok(handle);
        }

        let contents = tokio::fs::read(absolute_path)
            .await
            .map_err(|source| CacheError::Io {
                path: absolute_path.to_path_buf(),
                source,
            })?;
        let bytes: Arc<[u8]> = Arc::from(contents);

        let mut inner = self.lock();

        // Another loader may have inserted this key while we were reading.
        if let Some(&slot) = inner.index.get(key) {
            inner.move_to_front(slot);
            let entry = inner.entry_mut(slot);
            entry.refcount += 1;
            let existing = Arc::clone(&entry.bytes);
            inner.hits += 1;
            trace!(key, "adopted concurrently loaded entry");
            return Ok(CacheHandle {
                cache: Arc::clone(self),
                slot,
                bytes: existing,
            });
        }

        let size = bytes.len() as u64;
        let slot = inner.insert_front(CacheEntry {
            key: key.to_string(),
            bytes: Arc::clone(&bytes),
            refcount: 1,
            prev: None,
            next: None,
        });
        inner.bytes_used += size;
        inner.evict_while_over_capacity();
        debug!(key, size, bytes_used = inner.bytes_used, "cached file");

        Ok(CacheHandle {
            cache: Arc::clone(self),
            slot,
            bytes,
        })
    }

    /// Removes `key` if present and unpinned. Returns `false` when the
    /// entry is absent or currently pinned.
    pub fn invalidate(&self, key: &str) -> bool {
        let mut inner = self.lock();
        let Some(&slot) = inner.index.get(key) else {
            return false;
        };
        if inner.entry(slot).refcount > 0 {
            return false;
        }
        inner.remove(slot);
        true
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            items: inner.index.len(),
            bytes_used: inner.bytes_used,
            capacity: inner.capacity,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }

    /// Drops one pin. Runs eviction when a blocked eviction left the
    /// cache over capacity.
    fn release(&self, slot: usize) {
        let mut inner = self.lock();
        let entry = inner.entry_mut(slot);
        debug_assert!(entry.refcount > 0, "release without matching acquire");
        entry.refcount = entry.refcount.saturating_sub(1);
        if inner.bytes_used > inner.capacity {
            inner.evict_while_over_capacity();
        }
    }

    /// Keys from MRU to LRU. Test-only visibility into recency order.
    #[cfg(test)]
    fn lru_keys(&self) -> Vec<String> {
        let inner = self.lock();
        let mut keys = Vec::with_capacity(inner.index.len());
        let mut cursor = inner.lru_head;
        while let Some(slot) = cursor {
            let entry = inner.entry(slot);
            keys.push(entry.key.clone());
            cursor = entry.next;
        }
        keys
    }
}

impl std::fmt::Debug for FileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = {
            let inner = self.lock();
            (inner.index.len(), inner.bytes_used, inner.capacity)
        };
        f.debug_struct("FileCache")
            .field("items", &stats.0)
            .field("bytes_used", &stats.1)
            .field("capacity", &stats.2)
            .finish()
    }
}

impl CacheInner {
    fn entry(&self, slot: usize) -> &CacheEntry {
        match self.entries.get(slot) {
            Some(Some(entry)) => entry,
            _ => unreachable!("slot {slot} is vacant"),
        }
    }

    fn entry_mut(&mut self, slot: usize) -> &mut CacheEntry {
        match self.entries.get_mut(slot) {
            Some(Some(entry)) => entry,
            _ => unreachable!("slot {slot} is vacant"),
        }
    }

    /// Allocates a slot for `entry` and links it at the MRU end.
    fn insert_front(&mut self, entry: CacheEntry) -> usize {
        let key = entry.key.clone();
        let slot = match self.free_slots.pop() {
            Some(slot) => {
                self.entries[slot] = Some(entry);
                slot
            }
            None => {
                self.entries.push(Some(entry));
                self.entries.len() - 1
            }
        };
        self.index.insert(key, slot);
        self.link_front(slot);
        slot
    }

    /// Unlinks `slot` from the recency list, the key map, and the arena.
    fn remove(&mut self, slot: usize) {
        self.unlink(slot);
        let Some(entry) = self.entries[slot].take() else {
            unreachable!("slot {slot} is vacant");
        };
        self.index.remove(&entry.key);
        self.bytes_used -= entry.size();
        self.free_slots.push(slot);
    }

    fn link_front(&mut self, slot: usize) {
        let old_head = self.lru_head;
        {
            let entry = self.entry_mut(slot);
            entry.prev = None;
            entry.next = old_head;
        }
        if let Some(head) = old_head {
            self.entry_mut(head).prev = Some(slot);
        }
        self.lru_head = Some(slot);
        if self.lru_tail.is_none() {
            self.lru_tail = Some(slot);
        }
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = {
            let entry = self.entry(slot);
            (entry.prev, entry.next)
        };
        match prev {
            Some(prev_slot) => self.entry_mut(prev_slot).next = next,
            None => self.lru_head = next,
        }
        match next {
            Some(next_slot) => self.entry_mut(next_slot).prev = prev,
            None => self.lru_tail = prev,
        }
    }

    fn move_to_front(&mut self, slot: usize) {
        if self.lru_head == Some(slot) {
            return;
        }
        self.unlink(slot);
        self.link_front(slot);
    }

    /// Strict-LRU eviction: walk from the LRU end toward MRU, skipping
    /// pinned entries, until the cache fits or only pinned entries
    /// remain. Pinned entries block eviction rather than violate the
    /// handle guarantee; the resulting transient over-capacity resolves
    /// on release.
    fn evict_while_over_capacity(&mut self) {
        while self.bytes_used > self.capacity {
            let mut cursor = self.lru_tail;
            while let Some(slot) = cursor {
                let entry = self.entry(slot);
                if entry.refcount == 0 {
                    break;
                }
                cursor = entry.prev;
            }
            let Some(victim) = cursor else {
                debug!(
                    bytes_used = self.bytes_used,
                    capacity = self.capacity,
                    "all entries pinned, deferring eviction"
                );
                return;
            };
            let key = self.entry(victim).key.clone();
            self.remove(victim);
            self.evictions += 1;
            debug!(key = %key, bytes_used = self.bytes_used, "evicted cache entry");
        }
    }
}

//! Data cache (spec §4.4): a sector-bitmap write-back cache keyed by
//! `(namespace, LPA)`, with LRU eviction among unpinned entries and a
//! flusher pool that claims entries by `LPA mod nr_flushers`. Grounded in
//! `original_source/myssd_sdk/src/ftl/data_cache.c`'s entry/flusher shape;
//! like `ftl::mapping`, restated with one coarse `spin::Mutex` instead of a
//! per-entry mutex since every call here runs to completion synchronously.

use crate::address::Lpa;
use crate::config::DeviceConfig;
use crate::error::{Error, Result};
use crate::worker::sync::{blocked_during, BlockReason};
use spin::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Clean,
    Dirty,
}

struct CacheEntry {
    nsid: u32,
    lpa: Lpa,
    data: Vec<u8>,
    sector_bitmap: u64,
    status: EntryStatus,
    pin_count: u32,
}

type Key = (u32, Lpa);

/// `(nsid, lpa, data, sector_bitmap)` of a dirty entry evicted from cache,
/// handed back to the caller so it can be written to flash before the
/// cache forgets it.
pub type EvictedDirty = (u32, Lpa, Vec<u8>, u64);

struct Inner {
    entries: HashMap<Key, CacheEntry>,
    lru: Vec<Key>,
    capacity: usize,
}

/// Sector-bitmap write-back cache shared by every worker (spec §4.4).
pub struct DataCache {
    cfg: DeviceConfig,
    inner: Mutex<Inner>,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl DataCache {
    pub fn new(cfg: DeviceConfig) -> Self {
        let capacity = cfg.data_cache_capacity_pages;
        DataCache {
            cfg,
            inner: Mutex::new(Inner { entries: HashMap::new(), lru: Vec::new(), capacity }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Read `sector_bitmap`'s sectors of `lpa`'s page, if cached. Records a
    /// hit/miss either way (spec §8 scenario 6: the hit-rate counter must
    /// strictly increase as the workload runs).
    pub fn read(&self, nsid: u32, lpa: Lpa) -> Option<Vec<u8>> {
        let mut inner = blocked_during(BlockReason::Lock, || self.inner.lock());
        let key = (nsid, lpa);
        if let Some(entry) = inner.entries.get(&key) {
            let data = entry.data.clone();
            inner.lru.retain(|&k| k != key);
            inner.lru.push(key);
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(data)
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Like `read`, but only returns the page if every sector in `requested`
    /// is currently valid in the cache; otherwise counts a miss and returns
    /// `None` so the caller can fall through to a flash read (spec §4.4's
    /// read path: "if present and all requested sectors are valid, read
    /// directly from the buffer").
    pub fn read_if_covers(&self, nsid: u32, lpa: Lpa, requested: u64) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock();
        let key = (nsid, lpa);
        if let Some(entry) = inner.entries.get(&key) {
            if entry.sector_bitmap & requested == requested {
                let data = entry.data.clone();
                inner.lru.retain(|&k| k != key);
                inner.lru.push(key);
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(data);
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Inspect a cached entry's buffer and valid-sector bitmap without
    /// touching hit/miss counters or LRU order, for overlaying valid cached
    /// sectors on top of a flash read (spec §4.4's read path).
    pub fn peek(&self, nsid: u32, lpa: Lpa) -> Option<(Vec<u8>, u64)> {
        let inner = self.inner.lock();
        inner.entries.get(&(nsid, lpa)).map(|e| (e.data.clone(), e.sector_bitmap))
    }

    /// Insert or update a page entirely in cache (used once flash has
    /// supplied the full page, e.g. after an update-read miss). Returns
    /// the dirty victim evicted to make room, if any, so the caller can
    /// write it back before it is lost.
    pub fn fill(
        &self,
        nsid: u32,
        lpa: Lpa,
        data: Vec<u8>,
        sector_bitmap: u64,
        status: EntryStatus,
    ) -> Result<Option<EvictedDirty>> {
        let mut inner = self.inner.lock();
        let evicted = self.evict_if_full(&mut inner)?;
        let key = (nsid, lpa);
        inner.entries.insert(
            key,
            CacheEntry { nsid, lpa, data, sector_bitmap, status, pin_count: 0 },
        );
        inner.lru.retain(|&k| k != key);
        inner.lru.push(key);
        Ok(evicted)
    }

    /// Merge a write into the cached page (or create a new dirty entry),
    /// unioning `sector_bitmap`. Returns the dirty victim evicted to make
    /// room, if any (spec §4.4: an evicted dirty entry must be written
    /// back, not dropped).
    pub fn write(
        &self,
        nsid: u32,
        lpa: Lpa,
        offset: usize,
        data: &[u8],
        sector_bitmap: u64,
    ) -> Result<Option<EvictedDirty>> {
        let mut inner = blocked_during(BlockReason::Lock, || self.inner.lock());
        let key = (nsid, lpa);
        let evicted = if !inner.entries.contains_key(&key) {
            let evicted = self.evict_if_full(&mut inner)?;
            inner.entries.insert(
                key,
                CacheEntry {
                    nsid,
                    lpa,
                    data: vec![0u8; self.cfg.flash_page_size],
                    sector_bitmap: 0,
                    status: EntryStatus::Clean,
                    pin_count: 0,
                },
            );
            evicted
        } else {
            None
        };
        let entry = inner.entries.get_mut(&key).unwrap();
        entry.data[offset..offset + data.len()].copy_from_slice(data);
        entry.sector_bitmap |= sector_bitmap;
        entry.status = EntryStatus::Dirty;
        inner.lru.retain(|&k| k != key);
        inner.lru.push(key);
        Ok(evicted)
    }

    pub fn pin(&self, nsid: u32, lpa: Lpa) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&(nsid, lpa)) {
            entry.pin_count += 1;
        }
    }

    pub fn unpin(&self, nsid: u32, lpa: Lpa) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&(nsid, lpa)) {
            entry.pin_count = entry.pin_count.saturating_sub(1);
        }
    }

    /// Evicts the LRU-oldest unpinned entry if the cache is full. A clean
    /// victim is simply dropped; a dirty victim's payload is handed back
    /// so the caller can generate a writeback transaction before it is
    /// lost (spec §4.4).
    fn evict_if_full(&self, inner: &mut Inner) -> Result<Option<EvictedDirty>> {
        if inner.entries.len() < inner.capacity {
            return Ok(None);
        }
        let victim = inner
            .lru
            .iter()
            .position(|key| inner.entries.get(key).map(|e| e.pin_count == 0).unwrap_or(false))
            .map(|pos| inner.lru[pos]);
        let Some(key) = victim else { return Err(Error::Busy) };
        inner.lru.retain(|&k| k != key);
        let entry = inner.entries.remove(&key).expect("victim key came from entries");
        if entry.status == EntryStatus::Dirty {
            Ok(Some((entry.nsid, entry.lpa, entry.data, entry.sector_bitmap)))
        } else {
            Ok(None)
        }
    }

    /// All dirty entries claimed by flusher `tag` (`LPA mod nr_flushers ==
    /// tag`), for that flusher's pass over the cache.
    pub fn dirty_entries_for_flusher(&self, tag: usize, nr_flushers: usize) -> Vec<(u32, Lpa, Vec<u8>, u64)> {
        let inner = self.inner.lock();
        inner
            .entries
            .values()
            .filter(|e| e.status == EntryStatus::Dirty && e.lpa as usize % nr_flushers == tag)
            .map(|e| (e.nsid, e.lpa, e.data.clone(), e.sector_bitmap))
            .collect()
    }

    pub fn mark_clean(&self, nsid: u32, lpa: Lpa) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&(nsid, lpa)) {
            entry.status = EntryStatus::Clean;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

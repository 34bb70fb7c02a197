use std::num::NonZeroUsize;

use lru::LruCache;

use crate::backend::RgbaFrame;

const DEFAULT_MEMORY_BUDGET_BYTES: usize = 128 * 1024 * 1024;
const DEFAULT_MAX_ENTRIES: usize = 8;

/// A page rasterized for a specific surface size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageBitmapKey {
    pub doc_id: u64,
    pub page: usize,
    pub width_px: u32,
    pub height_px: u32,
}

impl PageBitmapKey {
    pub fn new(doc_id: u64, page: usize, width_px: u32, height_px: u32) -> Self {
        Self {
            doc_id,
            page,
            width_px,
            height_px,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// LRU of page bitmaps bounded by entry count and total pixel bytes.
#[derive(Debug)]
pub struct PageBitmapCache {
    memory_budget_bytes: usize,
    memory_bytes: usize,
    entries: LruCache<PageBitmapKey, RgbaFrame>,
    counters: CacheCounters,
}

impl Default for PageBitmapCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_MEMORY_BUDGET_BYTES)
    }
}

impl PageBitmapCache {
    pub fn new(max_entries: usize, memory_budget_bytes: usize) -> Self {
        let max_entries = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            memory_budget_bytes: memory_budget_bytes.max(1),
            memory_bytes: 0,
            entries: LruCache::new(max_entries),
            counters: CacheCounters::default(),
        }
    }

    pub fn get_cloned(&mut self, key: &PageBitmapKey) -> Option<RgbaFrame> {
        match self.entries.get(key) {
            Some(frame) => {
                self.counters.hits += 1;
                Some(frame.clone())
            }
            None => {
                self.counters.misses += 1;
                None
            }
        }
    }

    /// Stores a frame; a frame larger than the whole budget is not cached.
    pub fn insert(&mut self, key: PageBitmapKey, frame: RgbaFrame) -> bool {
        let frame_bytes = frame.byte_len();
        if frame_bytes > self.memory_budget_bytes {
            return false;
        }

        if let Some(previous) = self.entries.pop(&key) {
            self.memory_bytes = self.memory_bytes.saturating_sub(previous.byte_len());
        }

        self.memory_bytes += frame_bytes;
        if let Some((_evicted_key, evicted)) = self.entries.push(key, frame) {
            self.memory_bytes = self.memory_bytes.saturating_sub(evicted.byte_len());
            self.counters.evictions += 1;
        }
        self.evict_while_over_budget();
        true
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.memory_bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &PageBitmapKey) -> bool {
        self.entries.contains(key)
    }

    pub fn memory_bytes(&self) -> usize {
        self.memory_bytes
    }

    pub fn counters(&self) -> CacheCounters {
        self.counters
    }

    fn evict_while_over_budget(&mut self) {
        while self.memory_bytes > self.memory_budget_bytes && self.entries.len() > 1 {
            let Some((_key, frame)) = self.entries.pop_lru() else {
                break;
            };
            self.memory_bytes = self.memory_bytes.saturating_sub(frame.byte_len());
            self.counters.evictions += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{PageBitmapCache, PageBitmapKey};
    use crate::backend::RgbaFrame;

    fn frame(width: u32, height: u32) -> RgbaFrame {
        RgbaFrame {
            width,
            height,
            pixels: vec![0xff; width as usize * height as usize * 4].into(),
        }
    }

    #[test]
    fn size_is_part_of_the_key() {
        let mut cache = PageBitmapCache::new(4, 1024 * 1024);
        let _ = cache.insert(PageBitmapKey::new(1, 0, 10, 10), frame(10, 10));

        assert!(cache.get_cloned(&PageBitmapKey::new(1, 0, 10, 10)).is_some());
        assert!(cache.get_cloned(&PageBitmapKey::new(1, 0, 20, 20)).is_none());

        let counters = cache.counters();
        assert_eq!(counters.hits, 1);
        assert_eq!(counters.misses, 1);
    }

    #[test]
    fn evicts_least_recent_at_capacity() {
        let mut cache = PageBitmapCache::new(2, 1024 * 1024);
        let first = PageBitmapKey::new(1, 0, 4, 4);
        let second = PageBitmapKey::new(1, 1, 5, 5);
        let third = PageBitmapKey::new(1, 2, 6, 6);
        let _ = cache.insert(first, frame(4, 4));
        let _ = cache.insert(second, frame(5, 5));
        let _ = cache.insert(third, frame(6, 6));

        assert!(!cache.contains(&first));
        assert_eq!(cache.len(), 2);
        assert_eq!(
            cache.memory_bytes(),
            frame(5, 5).byte_len() + frame(6, 6).byte_len()
        );
        assert_eq!(cache.counters().evictions, 1);
    }

    #[test]
    fn evicts_when_over_memory_budget() {
        let mut cache = PageBitmapCache::new(8, 10_000);
        let _ = cache.insert(PageBitmapKey::new(1, 0, 40, 40), frame(40, 40));
        let _ = cache.insert(PageBitmapKey::new(1, 1, 40, 40), frame(40, 40));

        assert_eq!(cache.len(), 1);
        assert!(cache.memory_bytes() <= 10_000);
    }

    #[test]
    fn reinsert_does_not_double_count_memory() {
        let mut cache = PageBitmapCache::new(4, 1024 * 1024);
        let key = PageBitmapKey::new(1, 0, 8, 8);
        let _ = cache.insert(key, frame(8, 8));
        let _ = cache.insert(key, frame(8, 8));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.memory_bytes(), frame(8, 8).byte_len());
    }

    #[test]
    fn oversize_frame_is_rejected_without_clearing() {
        let mut cache = PageBitmapCache::new(4, 100);
        let kept = PageBitmapKey::new(1, 0, 4, 4);
        let _ = cache.insert(kept, frame(4, 4));

        assert!(!cache.insert(PageBitmapKey::new(1, 1, 8, 8), frame(8, 8)));
        assert!(cache.contains(&kept));
    }

    #[test]
    fn cloned_frames_share_pixels() {
        let mut cache = PageBitmapCache::new(2, 1024 * 1024);
        let key = PageBitmapKey::new(1, 0, 4, 4);
        let stored = frame(4, 4);
        let _ = cache.insert(key, stored.clone());

        let cloned = cache.get_cloned(&key).expect("frame should be cached");
        assert!(std::sync::Arc::ptr_eq(&stored.pixels, &cloned.pixels));
    }
}

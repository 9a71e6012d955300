//! SeqLock quote cache.
//!
//! A pre-sized array of cache-line-aligned slots, one per instrument, each
//! guarded by an even/odd version counter. The writer (the single upstream
//! callback thread owning that instrument) never blocks; readers copy the
//! record out and retry if a write overlapped. Slot allocation goes through
//! a read-write-locked index map: the hot path only ever takes the read
//! side, first sight of an instrument takes the write side.

use crate::record::QuoteRecord;
use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use tracing::error;

/// A reader gives up after this many attempts and skips the instrument for
/// the current poll cycle.
const MAX_READ_ATTEMPTS: u32 = 100;

#[repr(align(64))]
struct Slot {
    /// Even when idle; odd while a write is in flight. Logical version of
    /// the stored record is `version / 2`.
    version: AtomicU64,
    has_data: AtomicBool,
    data: UnsafeCell<QuoteRecord>,
}

// Readers and the writer coordinate exclusively through `version`.
unsafe impl Sync for Slot {}

impl Slot {
    fn new() -> Self {
        Self {
            version: AtomicU64::new(0),
            has_data: AtomicBool::new(false),
            data: UnsafeCell::new(QuoteRecord::default()),
        }
    }
}

pub struct QuoteCache {
    slots: Box<[Slot]>,
    index: RwLock<HashMap<String, usize>>,
}

impl QuoteCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Slot::new()).collect(),
            index: RwLock::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.index.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slot index for a known instrument.
    pub fn index_of(&self, raw_id: &str) -> Option<usize> {
        self.index.read().ok()?.get(raw_id).copied()
    }

    /// Slot index, allocating on first sight. Returns `None` when the cache
    /// is full; the instrument is dropped rather than overwriting a foreign
    /// slot.
    pub fn get_or_create_index(&self, raw_id: &str) -> Option<usize> {
        if let Ok(map) = self.index.read() {
            if let Some(&index) = map.get(raw_id) {
                return Some(index);
            }
        }

        let mut map = self.index.write().ok()?;
        if let Some(&index) = map.get(raw_id) {
            return Some(index);
        }
        let index = map.len();
        if index >= self.slots.len() {
            error!(
                raw_id,
                capacity = self.slots.len(),
                "quote cache capacity exceeded, dropping instrument"
            );
            return None;
        }
        map.insert(raw_id.to_owned(), index);
        Some(index)
    }

    /// SeqLock write. Single writer per slot.
    pub fn store(&self, index: usize, record: &QuoteRecord) {
        let Some(slot) = self.slots.get(index) else {
            return;
        };
        let seq = slot.version.load(Ordering::Relaxed);
        slot.version.store(seq + 1, Ordering::Release);
        unsafe {
            std::ptr::write_volatile(slot.data.get(), *record);
        }
        slot.has_data.store(true, Ordering::Release);
        slot.version.store(seq + 2, Ordering::Release);
    }

    /// Bounded SeqLock read. Returns the record copy and its logical
    /// version, or `None` for an unwritten slot or read exhaustion.
    pub fn load(&self, index: usize) -> Option<(QuoteRecord, u64)> {
        let slot = self.slots.get(index)?;
        if !slot.has_data.load(Ordering::Acquire) {
            return None;
        }

        let mut attempts = 0u32;
        loop {
            let begin = slot.version.load(Ordering::Acquire);
            if begin % 2 == 1 {
                attempts += 1;
                if attempts > MAX_READ_ATTEMPTS {
                    return None;
                }
                std::thread::yield_now();
                continue;
            }

            let copy = unsafe { std::ptr::read_volatile(slot.data.get()) };

            let end = slot.version.load(Ordering::Acquire);
            if begin == end {
                return Some((copy, end / 2));
            }
            attempts += 1;
            if attempts > MAX_READ_ATTEMPTS {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn record_with(value: u64) -> QuoteRecord {
        // Every field derived from one value so a torn read is detectable.
        let mut record = QuoteRecord::default();
        record.timestamp = value;
        record.volume = value as i64;
        record.last_price = value as f64;
        record.ask_price = [value as f64; 10];
        record.bid_volume = [value as i32; 10];
        record
    }

    #[test]
    fn allocates_dense_stable_indexes() {
        let cache = QuoteCache::new(8);
        let a = cache.get_or_create_index("a").unwrap();
        let b = cache.get_or_create_index("b").unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(cache.get_or_create_index("a"), Some(0));
        assert_eq!(cache.index_of("b"), Some(1));
        assert_eq!(cache.index_of("missing"), None);
    }

    #[test]
    fn overflow_drops_instrument() {
        let cache = QuoteCache::new(2);
        assert!(cache.get_or_create_index("a").is_some());
        assert!(cache.get_or_create_index("b").is_some());
        assert!(cache.get_or_create_index("c").is_none());
        // Existing entries still resolve.
        assert_eq!(cache.index_of("a"), Some(0));
    }

    #[test]
    fn unwritten_slot_reads_none() {
        let cache = QuoteCache::new(2);
        let index = cache.get_or_create_index("a").unwrap();
        assert!(cache.load(index).is_none());
    }

    #[test]
    fn store_then_load_roundtrips_with_version() {
        let cache = QuoteCache::new(2);
        let index = cache.get_or_create_index("a").unwrap();

        cache.store(index, &record_with(7));
        let (record, version) = cache.load(index).unwrap();
        assert_eq!(record, record_with(7));
        assert_eq!(version, 1);

        cache.store(index, &record_with(9));
        let (record, version) = cache.load(index).unwrap();
        assert_eq!(record.timestamp, 9);
        assert_eq!(version, 2);
    }

    #[test]
    fn concurrent_readers_never_observe_torn_records() {
        let cache = Arc::new(QuoteCache::new(1));
        let index = cache.get_or_create_index("x").unwrap();
        cache.store(index, &record_with(0));

        let writer = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                for value in 1..=20_000u64 {
                    cache.store(index, &record_with(value));
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    let mut last_version = 0;
                    for _ in 0..50_000 {
                        if let Some((record, version)) = cache.load(index) {
                            let value = record.timestamp;
                            assert_eq!(record.volume, value as i64, "torn integer field");
                            assert_eq!(record.last_price, value as f64, "torn float field");
                            assert_eq!(record.ask_price[9], value as f64, "torn array field");
                            assert_eq!(record.bid_volume[0], value as i32, "torn array field");
                            assert!(version >= last_version, "version went backwards");
                            last_version = version;
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        let (_, version) = cache.load(index).unwrap();
        assert_eq!(version, 20_001);
    }
}

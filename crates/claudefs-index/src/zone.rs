//! Per-zone locks guarding the sampled (hook) sub-index.
//!
//! The table is allocated once with one lock per zone and never resized.
//! A lock remembers which thread holds it so that a thread re-entering its
//! own zone lock gets an error instead of deadlocking.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, MutexGuard};
use tracing::warn;

use crate::error::{IndexError, IndexResult};

const NO_HOLDER: u64 = 0;

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

fn current_thread_token() -> u64 {
    THREAD_TOKEN.with(|token| *token)
}

struct ZoneLock {
    hook: Mutex<()>,
    holder: AtomicU64,
}

/// Fixed table of zone locks, indexed by zone number.
pub struct ZoneTable {
    zones: Box<[CachePadded<ZoneLock>]>,
}

impl ZoneTable {
    /// Allocate one lock per zone.
    pub fn new(num_zones: u32) -> Self {
        let zones = (0..num_zones)
            .map(|_| {
                CachePadded::new(ZoneLock {
                    hook: Mutex::new(()),
                    holder: AtomicU64::new(NO_HOLDER),
                })
            })
            .collect();
        Self { zones }
    }

    /// Number of zones in the table.
    pub fn len(&self) -> u32 {
        self.zones.len() as u32
    }

    /// True if the table has no zones.
    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    /// Acquire a zone's lock, blocking until it is free.
    ///
    /// Fails with `ZoneLockReentered` if the calling thread already holds it.
    pub fn lock(&self, zone: u32) -> IndexResult<ZoneGuard<'_>> {
        let lock = self
            .zones
            .get(zone as usize)
            .ok_or(IndexError::ZoneOutOfRange {
                zone,
                num_zones: self.len(),
            })?;
        let me = current_thread_token();
        if lock.holder.load(Ordering::Acquire) == me {
            warn!(zone, "zone lock re-entered by its holder");
            return Err(IndexError::ZoneLockReentered { zone });
        }
        let guard = lock.hook.lock();
        lock.holder.store(me, Ordering::Release);
        Ok(ZoneGuard {
            zone,
            holder: &lock.holder,
            _guard: guard,
        })
    }

    #[cfg(test)]
    fn is_held_by_current_thread(&self, zone: u32) -> bool {
        self.zones
            .get(zone as usize)
            .is_some_and(|lock| lock.holder.load(Ordering::Acquire) == current_thread_token())
    }
}

impl std::fmt::Debug for ZoneTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZoneTable")
            .field("zones", &self.zones.len())
            .finish()
    }
}

/// A held zone lock. Released on drop.
pub struct ZoneGuard<'a> {
    zone: u32,
    holder: &'a AtomicU64,
    _guard: MutexGuard<'a, ()>,
}

impl ZoneGuard<'_> {
    /// The zone this guard locks.
    pub fn zone(&self) -> u32 {
        self.zone
    }

    /// True if the calling thread is the one holding this guard.
    pub fn is_held_by_current_thread(&self) -> bool {
        self.holder.load(Ordering::Acquire) == current_thread_token()
    }
}

impl Drop for ZoneGuard<'_> {
    fn drop(&mut self) {
        // Cleared before the mutex guard field is dropped.
        self.holder.store(NO_HOLDER, Ordering::Release);
    }
}

impl std::fmt::Debug for ZoneGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZoneGuard").field("zone", &self.zone).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_locks_are_cache_line_padded() {
        assert!(std::mem::align_of::<CachePadded<ZoneLock>>() >= 64);
    }

    #[test]
    fn test_lock_and_release() {
        let table = ZoneTable::new(2);
        {
            let guard = table.lock(1).unwrap();
            assert_eq!(guard.zone(), 1);
            assert!(guard.is_held_by_current_thread());
            assert!(table.is_held_by_current_thread(1));
            assert!(!table.is_held_by_current_thread(0));
        }
        assert!(!table.is_held_by_current_thread(1));
        assert!(table.lock(1).is_ok());
    }

    #[test]
    fn test_reentry_is_an_error() {
        let table = ZoneTable::new(1);
        let _guard = table.lock(0).unwrap();
        assert!(matches!(
            table.lock(0),
            Err(IndexError::ZoneLockReentered { zone: 0 })
        ));
    }

    #[test]
    fn test_out_of_range_zone() {
        let table = ZoneTable::new(3);
        assert!(matches!(
            table.lock(3),
            Err(IndexError::ZoneOutOfRange { zone: 3, num_zones: 3 })
        ));
    }

    #[test]
    fn test_other_threads_wait_for_the_lock() {
        let table = Arc::new(ZoneTable::new(1));
        let counter = Arc::new(AtomicU32::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let table = Arc::clone(&table);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let _guard = table.lock(0).unwrap();
                        let seen = counter.load(Ordering::Relaxed);
                        counter.store(seen + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }
}

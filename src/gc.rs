//! The garbage collector: a two-phase sweep over every on-disk record, run
//! periodically once `schedule()` is called.
//!
//! Phase A removes unlocked records that have passed their expiration age
//! (default-policy or per-record `ttl`). Phase B, only entered when
//! `sizeConstraintBytes != 0` and the cache is still over budget afterward,
//! evicts unlocked records oldest-`updateTimeSec`-first until back under
//! budget or out of unlocked records to evict.
//!
//! `schedule`/`unschedule` are idempotent: calling `schedule` while already
//! scheduled is a no-op, as is `unschedule` while not scheduled. A single
//! `JoinHandle` behind a `tokio::sync::Mutex` is what makes that idempotence
//! cheap to reason about.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::CacheConfig;
use crate::header::{RecordHeader, HEADER_SIZE};
use crate::internal_events::{
    GcSweepCompleted, GcTargetNotMet, RecordCorrupted, RecordEvicted, RecordExpired,
};
use crate::io::PosixIo;
use crate::layout::FileLayout;

pub struct GarbageCollector {
    config: Arc<CacheConfig>,
    layout: FileLayout,
    io: Arc<dyn PosixIo>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl GarbageCollector {
    pub fn new(config: Arc<CacheConfig>, io: Arc<dyn PosixIo>) -> Arc<Self> {
        let layout = FileLayout::new(Arc::clone(&config));
        Arc::new(Self {
            config,
            layout,
            io,
            handle: Mutex::new(None),
        })
    }

    /// Starts the periodic sweep if it isn't already running. A no-op
    /// otherwise.
    pub async fn schedule(self: &Arc<Self>) {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return;
        }
        let this = Arc::clone(self);
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.garbage_collection_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                this.run_sweep().await;
            }
        }));
    }

    /// Stops the periodic sweep if it's running. A no-op otherwise. Aborts
    /// the background task rather than waiting for an in-flight sweep to
    /// finish.
    pub async fn unschedule(&self) {
        let mut handle = self.handle.lock().await;
        if let Some(h) = handle.take() {
            h.abort();
        }
    }

    pub fn is_scheduled(&self) -> bool {
        // Best-effort snapshot; only used by tests and diagnostics, never to
        // gate correctness (schedule/unschedule take the lock themselves).
        self.handle.try_lock().map(|g| g.is_some()).unwrap_or(true)
    }

    /// Runs one full sweep synchronously. Exposed so `CacheFacade` can offer
    /// an explicit on-demand GC trigger in addition to the scheduled one.
    pub async fn run_sweep(&self) {
        let now = self.config.now();
        let mut expired_removed = 0u64;

        let mut live = Vec::new();
        for entry in self.layout.walk_records().await {
            let prefix = match self.io.read_prefix(&entry.path, HEADER_SIZE as usize).await {
                Ok(prefix) => prefix,
                Err(_) => {
                    if self.io.remove_file(&entry.path).await.is_ok() {
                        RecordCorrupted { key: &entry.key, reason: "unreadable".to_string() }.emit();
                    }
                    continue;
                }
            };
            let header = match RecordHeader::parse(&prefix) {
                Some(header) => header,
                None => {
                    if self.io.remove_file(&entry.path).await.is_ok() {
                        RecordCorrupted { key: &entry.key, reason: "not enough data to get header".to_string() }.emit();
                    }
                    continue;
                }
            };
            if let Err(e) = header.validate() {
                if self.io.remove_file(&entry.path).await.is_ok() {
                    RecordCorrupted { key: &entry.key, reason: e.to_string() }.emit();
                }
                continue;
            }

            let expired = header.is_expired(now, self.config.default_expiration_period_secs());
            if expired && !header.is_locked() {
                if self.io.remove_file(&entry.path).await.is_ok() {
                    expired_removed += 1;
                    RecordExpired { key: &entry.key }.emit();
                }
                continue;
            }
            live.push((entry, header));
        }

        let mut evicted = 0u64;
        let constraint = self.config.size_constraint_bytes;
        if constraint != 0 {
            let current_size: u64 = live.iter().map(|(e, _)| e.size).sum();
            let excess = self.layout.optimized_disk_size_for_cache_size(current_size);
            if excess > 0 {
                // Oldest-first: sort unlocked candidates by updateTimeSec
                // ascending, tie-broken by path, and delete until the excess
                // is covered or we run out of eviction candidates.
                let mut candidates: Vec<_> = live
                    .iter()
                    .filter(|(_, h)| !h.is_locked())
                    .collect();
                candidates.sort_by(|(entry_a, header_a), (entry_b, header_b)| {
                    header_a
                        .update_time_sec()
                        .cmp(&header_b.update_time_sec())
                        .then_with(|| entry_a.path.cmp(&entry_b.path))
                });

                let mut freed: i64 = 0;
                for (entry, _) in candidates {
                    if freed >= excess {
                        break;
                    }
                    if self.io.remove_file(&entry.path).await.is_ok() {
                        freed += entry.size as i64;
                        evicted += 1;
                        RecordEvicted { key: &entry.key, bytes: entry.size }.emit();
                    }
                }
                if freed < excess {
                    GcTargetNotMet { excess_bytes: (excess - freed) as u64 }.emit();
                }
            }
        }

        let current_size_bytes = self.layout.total_used_size_in_bytes().await;
        GcSweepCompleted { expired_removed, evicted, current_size_bytes }.emit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::RealPosixIo;
    use crate::store::RecordStore;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    fn config_with_clock(
        dir: &std::path::Path,
        time: Arc<AtomicU64>,
        expiration: Duration,
        size_constraint: u64,
    ) -> Arc<CacheConfig> {
        Arc::new(
            CacheConfig::from_path(dir)
                .default_expiration_period(expiration)
                .size_constraint_bytes(size_constraint)
                .current_time_sec(move || time.load(Ordering::SeqCst))
                .build(),
        )
    }

    #[tokio::test]
    async fn sweep_removes_expired_unlocked_records() {
        let dir = tempfile::tempdir().unwrap();
        let time = Arc::new(AtomicU64::new(1000));
        let config = config_with_clock(dir.path(), Arc::clone(&time), Duration::from_secs(60), 0);
        let io: Arc<dyn PosixIo> = Arc::new(RealPosixIo);
        let store = RecordStore::new(Arc::clone(&config), Arc::clone(&io));
        let gc = GarbageCollector::new(config, io);

        store.store("expires", &[0x01], 0, false).await;
        store.store("locked", &[0x02], 0, true).await;

        time.store(1100, Ordering::SeqCst);
        gc.run_sweep().await;

        assert_eq!(
            store.load("expires").await.result,
            crate::response::CacheResult::NotFound
        );
        assert_eq!(
            store.load("locked").await.result,
            crate::response::CacheResult::Succeeded
        );
    }

    #[tokio::test]
    async fn sweep_evicts_oldest_unlocked_first_under_size_constraint() {
        let dir = tempfile::tempdir().unwrap();
        let time = Arc::new(AtomicU64::new(1000));
        let config = config_with_clock(
            dir.path(),
            Arc::clone(&time),
            Duration::from_secs(60 * 60 * 24),
            10,
        );
        let io: Arc<dyn PosixIo> = Arc::new(RealPosixIo);
        let store = RecordStore::new(Arc::clone(&config), Arc::clone(&io));
        let gc = GarbageCollector::new(config, io);

        store.store("oldest", &[0xAA; 5], 0, false).await;
        time.store(1010, Ordering::SeqCst);
        store.store("newest", &[0xBB; 5], 0, false).await;

        gc.run_sweep().await;

        assert_eq!(
            store.load("oldest").await.result,
            crate::response::CacheResult::NotFound
        );
        assert_eq!(
            store.load("newest").await.result,
            crate::response::CacheResult::Succeeded
        );
    }

    #[tokio::test]
    async fn sweep_removes_corrupt_records() {
        let dir = tempfile::tempdir().unwrap();
        let time = Arc::new(AtomicU64::new(1000));
        let config = config_with_clock(dir.path(), Arc::clone(&time), Duration::from_secs(60), 0);
        let io: Arc<dyn PosixIo> = Arc::new(RealPosixIo);
        let store = RecordStore::new(Arc::clone(&config), Arc::clone(&io));
        let gc = GarbageCollector::new(Arc::clone(&config), Arc::clone(&io));

        store.store("corrupt", &[0x01], 0, false).await;
        let path = dir.path().join("co").join("corrupt");
        let mut bytes = tokio::fs::read(&path).await.unwrap();
        bytes[24] ^= 0xFF;
        tokio::fs::write(&path, &bytes).await.unwrap();

        gc.run_sweep().await;

        assert!(!path.exists());
        assert_eq!(
            store.load("corrupt").await.result,
            crate::response::CacheResult::NotFound
        );
    }

    #[tokio::test]
    async fn sweep_evicts_equal_timestamp_ties_by_path_order() {
        let dir = tempfile::tempdir().unwrap();
        let time = Arc::new(AtomicU64::new(1000));
        let config = config_with_clock(
            dir.path(),
            Arc::clone(&time),
            Duration::from_secs(60 * 60 * 24),
            5,
        );
        let io: Arc<dyn PosixIo> = Arc::new(RealPosixIo);
        let store = RecordStore::new(Arc::clone(&config), Arc::clone(&io));
        let gc = GarbageCollector::new(config, io);

        // Both records share the same updateTimeSec; the lexicographically
        // smaller path ("aaa") must be the one evicted.
        store.store("bbb", &[0xAA; 5], 0, false).await;
        store.store("aaa", &[0xBB; 5], 0, false).await;

        gc.run_sweep().await;

        assert_eq!(
            store.load("aaa").await.result,
            crate::response::CacheResult::NotFound
        );
        assert_eq!(
            store.load("bbb").await.result,
            crate::response::CacheResult::Succeeded
        );
    }

    #[tokio::test]
    async fn schedule_and_unschedule_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let time = Arc::new(AtomicU64::new(1000));
        let config = config_with_clock(dir.path(), Arc::clone(&time), Duration::from_secs(60), 0);
        let gc = GarbageCollector::new(config, Arc::new(RealPosixIo));

        gc.schedule().await;
        gc.schedule().await;
        assert!(gc.is_scheduled());

        gc.unschedule().await;
        gc.unschedule().await;
        assert!(!gc.is_scheduled());
    }
}

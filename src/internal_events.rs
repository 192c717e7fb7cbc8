//! Structured diagnostics for anomalous or noteworthy conditions.
//!
//! One struct per event, each emitting `metrics` counters/gauges from its
//! own `emit` method rather than a shared trait. Every event also logs via
//! `tracing`, and is handed to the cache's optional `debug_output` sink
//! formatted the same way.

use metrics::{counter, gauge};

pub struct RecordStored<'a> {
    pub key: &'a str,
    pub bytes: u64,
}

impl RecordStored<'_> {
    pub fn emit(&self) {
        counter!("cache_records_stored_total").increment(1);
        counter!("cache_bytes_stored_total").increment(self.bytes);
        tracing::debug!(key = self.key, bytes = self.bytes, "record stored");
    }
}

pub struct RecordLoaded<'a> {
    pub key: &'a str,
}

impl RecordLoaded<'_> {
    pub fn emit(&self) {
        counter!("cache_records_loaded_total").increment(1);
        tracing::debug!(key = self.key, "record loaded");
    }
}

pub struct RecordMiss<'a> {
    pub key: &'a str,
}

impl RecordMiss<'_> {
    pub fn emit(&self) {
        counter!("cache_records_miss_total").increment(1);
        tracing::trace!(key = self.key, "record not found");
    }
}

pub struct RecordCorrupted<'a> {
    pub key: &'a str,
    pub reason: String,
}

impl RecordCorrupted<'_> {
    pub fn emit(&self) {
        counter!("cache_records_corrupted_total").increment(1);
        tracing::warn!(key = self.key, reason = %self.reason, "record failed validation, removing");
    }
}

pub struct RecordExpired<'a> {
    pub key: &'a str,
}

impl RecordExpired<'_> {
    pub fn emit(&self) {
        counter!("cache_records_expired_total").increment(1);
        tracing::debug!(key = self.key, "record expired");
    }
}

pub struct RecordEvicted<'a> {
    pub key: &'a str,
    pub bytes: u64,
}

impl RecordEvicted<'_> {
    pub fn emit(&self) {
        counter!("cache_records_evicted_total").increment(1);
        counter!("cache_bytes_evicted_total").increment(self.bytes);
        tracing::debug!(key = self.key, bytes = self.bytes, "record evicted by size-bounded gc");
    }
}

pub struct GcSweepCompleted {
    pub expired_removed: u64,
    pub evicted: u64,
    pub current_size_bytes: u64,
}

impl GcSweepCompleted {
    pub fn emit(&self) {
        gauge!("cache_size_bytes").set(self.current_size_bytes as f64);
        tracing::info!(
            expired_removed = self.expired_removed,
            evicted = self.evicted,
            current_size_bytes = self.current_size_bytes,
            "garbage collection sweep completed"
        );
    }
}

pub struct GcTargetNotMet {
    pub excess_bytes: u64,
}

impl GcTargetNotMet {
    pub fn emit(&self) {
        tracing::warn!(
            excess_bytes = self.excess_bytes,
            "size-bounded gc could not reach target: not enough unlocked records"
        );
    }
}

pub struct LockUnderflow<'a> {
    pub key: &'a str,
}

impl LockUnderflow<'_> {
    pub fn emit(&self) {
        tracing::error!(key = self.key, "attempted to unlock a record with refCount == 0");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};
    use pretty_assertions::assert_eq;

    fn value_of(snapshot: &[(metrics_util::CompositeKey, Option<metrics::Unit>, Option<metrics::SharedString>, DebugValue)], name: &str) -> Option<DebugValue> {
        snapshot
            .iter()
            .find(|(key, ..)| key.key().name() == name)
            .map(|(.., value)| value.clone())
    }

    #[test]
    fn record_stored_increments_both_counters() {
        let recorder = DebuggingRecorder::default();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            RecordStored { key: "abcd1234", bytes: 16 }.emit();
        });

        let snapshot = snapshotter.snapshot().into_vec();
        assert_eq!(value_of(&snapshot, "cache_records_stored_total"), Some(DebugValue::Counter(1)));
        assert_eq!(value_of(&snapshot, "cache_bytes_stored_total"), Some(DebugValue::Counter(16)));
    }

    #[test]
    fn gc_sweep_completed_sets_size_gauge() {
        let recorder = DebuggingRecorder::default();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            GcSweepCompleted { expired_removed: 2, evicted: 1, current_size_bytes: 4096 }.emit();
        });

        let snapshot = snapshotter.snapshot().into_vec();
        assert_eq!(
            value_of(&snapshot, "cache_size_bytes"),
            Some(DebugValue::Gauge(4096.0.into()))
        );
    }
}

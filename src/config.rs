//! Cache configuration ([`CacheConfig`]) and its builder.
//!
//! A required path, everything else optional and defaulted, with "minimum
//! limit" floors applied at `build()` time rather than trusted to the
//! caller.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Relative priority of a queued operation. Lower priority lanes are only
/// drained once every higher-priority lane is empty; see
/// [`crate::queue::WorkQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Gc,
    Delete,
    Read,
    Write,
}

/// Floor under which `garbageCollectionInterval` is not allowed to drop,
/// to keep a misconfigured cache from hammering the disk.
pub const MIN_GC_INTERVAL: Duration = Duration::from_secs(1);

/// Floor under which `defaultExpirationPeriod` is not allowed to drop.
pub const MIN_EXPIRATION_PERIOD: Duration = Duration::from_secs(60);

/// Default value for `cacheIdentifier`.
pub const DEFAULT_CACHE_IDENTIFIER: &str = "persistent.cache";

/// A cache's fixed configuration, as built by [`CacheConfigBuilder`].
///
/// `current_time_sec` is the injectable clock: every timestamp the engine
/// reads or writes goes through it, which is what lets tests advance time
/// without sleeping.
#[derive(Clone)]
pub struct CacheConfig {
    pub(crate) cache_path: PathBuf,
    pub(crate) cache_identifier: String,
    pub(crate) use_directory_separation: bool,
    pub(crate) garbage_collection_interval: Duration,
    pub(crate) default_expiration_period: Duration,
    pub(crate) size_constraint_bytes: u64,
    pub(crate) max_concurrent_operations: usize,
    pub(crate) current_time_sec: Arc<dyn Fn() -> u64 + Send + Sync>,
    pub(crate) debug_output: Option<Arc<dyn Fn(String) + Send + Sync>>,
    pub(crate) timing_callback: Option<Arc<dyn Fn(&str, &str) + Send + Sync>>,
}

impl std::fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheConfig")
            .field("cache_path", &self.cache_path)
            .field("cache_identifier", &self.cache_identifier)
            .field("use_directory_separation", &self.use_directory_separation)
            .field("garbage_collection_interval", &self.garbage_collection_interval)
            .field("default_expiration_period", &self.default_expiration_period)
            .field("size_constraint_bytes", &self.size_constraint_bytes)
            .field("max_concurrent_operations", &self.max_concurrent_operations)
            .finish_non_exhaustive()
    }
}

impl CacheConfig {
    pub fn from_path<P: AsRef<Path>>(cache_path: P) -> CacheConfigBuilder {
        CacheConfigBuilder {
            cache_path: cache_path.as_ref().to_path_buf(),
            cache_identifier: None,
            use_directory_separation: None,
            garbage_collection_interval: None,
            default_expiration_period: None,
            size_constraint_bytes: None,
            max_concurrent_operations: None,
            current_time_sec: None,
            debug_output: None,
            timing_callback: None,
        }
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    pub fn cache_identifier(&self) -> &str {
        &self.cache_identifier
    }

    pub fn now(&self) -> u64 {
        (self.current_time_sec)()
    }

    pub fn default_expiration_period_secs(&self) -> u64 {
        self.default_expiration_period.as_secs()
    }

    pub fn max_concurrent_operations(&self) -> usize {
        self.max_concurrent_operations
    }

    /// Formats and forwards `line` to the optional debug sink. A no-op when
    /// no sink was configured.
    pub fn emit_debug(&self, line: impl FnOnce() -> String) {
        if let Some(sink) = &self.debug_output {
            sink(line());
        }
    }

    /// Reports a `Queued`/`Starting`/`Finished` transition for `operation` to
    /// the optional timing callback.
    pub fn emit_timing(&self, operation: &str, transition: &str) {
        if let Some(cb) = &self.timing_callback {
            cb(operation, transition);
        }
    }
}

/// Builder for [`CacheConfig`]. See the field-level docs on each setter for
/// defaults.
pub struct CacheConfigBuilder {
    cache_path: PathBuf,
    cache_identifier: Option<String>,
    use_directory_separation: Option<bool>,
    garbage_collection_interval: Option<Duration>,
    default_expiration_period: Option<Duration>,
    size_constraint_bytes: Option<u64>,
    max_concurrent_operations: Option<usize>,
    current_time_sec: Option<Arc<dyn Fn() -> u64 + Send + Sync>>,
    debug_output: Option<Arc<dyn Fn(String) + Send + Sync>>,
    timing_callback: Option<Arc<dyn Fn(&str, &str) + Send + Sync>>,
}

impl CacheConfigBuilder {
    /// Identifier used to name the underlying work queue. Defaults to
    /// `"persistent.cache"`.
    pub fn cache_identifier<S: Into<String>>(mut self, id: S) -> Self {
        self.cache_identifier = Some(id.into());
        self
    }

    /// Whether keys are sharded into two-character-prefix subdirectories.
    /// Defaults to `true`.
    pub fn use_directory_separation(mut self, enabled: bool) -> Self {
        self.use_directory_separation = Some(enabled);
        self
    }

    /// How often the garbage collector sweeps, once scheduled. Defaults to
    /// ~60s; floored at [`MIN_GC_INTERVAL`].
    pub fn garbage_collection_interval(mut self, interval: Duration) -> Self {
        self.garbage_collection_interval = Some(interval);
        self
    }

    /// Age at which an unlocked record with `ttl == 0` is considered
    /// expired. Defaults to ~10 minutes; floored at [`MIN_EXPIRATION_PERIOD`].
    pub fn default_expiration_period(mut self, period: Duration) -> Self {
        self.default_expiration_period = Some(period);
        self
    }

    /// Maximum total on-disk size the cache should occupy. `0` (the
    /// default) means unbounded; size-bounded eviction is skipped entirely
    /// in that case.
    pub fn size_constraint_bytes(mut self, bytes: u64) -> Self {
        self.size_constraint_bytes = Some(bytes);
        self
    }

    /// Number of worker tasks draining the work queue concurrently.
    /// Defaults to 2: a small, deliberately bounded pool rather than an
    /// unbounded one.
    pub fn max_concurrent_operations(mut self, count: usize) -> Self {
        self.max_concurrent_operations = Some(count);
        self
    }

    /// Injects a clock. Defaults to wall-clock Unix time. Tests should
    /// always override this.
    pub fn current_time_sec<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> u64 + Send + Sync + 'static,
    {
        self.current_time_sec = Some(Arc::new(clock));
        self
    }

    /// Optional diagnostic sink. Receives a formatted line for every
    /// anomalous condition (corrupt header, GC target not met, lock
    /// underflow) in addition to the `tracing` events those conditions emit.
    pub fn debug_output<F>(mut self, sink: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.debug_output = Some(Arc::new(sink));
        self
    }

    /// Optional hook fired with `(operation_name, transition)` at each of
    /// `Queued`/`Starting`/`Finished` for Store/Lock/Unlock/Remove/Read
    /// operations.
    pub fn timing_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.timing_callback = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> CacheConfig {
        let garbage_collection_interval = self
            .garbage_collection_interval
            .unwrap_or(Duration::from_secs(60))
            .max(MIN_GC_INTERVAL);
        let default_expiration_period = self
            .default_expiration_period
            .unwrap_or(Duration::from_secs(10 * 60))
            .max(MIN_EXPIRATION_PERIOD);
        let current_time_sec = self.current_time_sec.unwrap_or_else(|| {
            Arc::new(|| {
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0)
            })
        });

        CacheConfig {
            cache_path: self.cache_path,
            cache_identifier: self
                .cache_identifier
                .unwrap_or_else(|| DEFAULT_CACHE_IDENTIFIER.to_string()),
            use_directory_separation: self.use_directory_separation.unwrap_or(true),
            garbage_collection_interval,
            default_expiration_period,
            size_constraint_bytes: self.size_constraint_bytes.unwrap_or(0),
            max_concurrent_operations: self.max_concurrent_operations.unwrap_or(2).max(1),
            current_time_sec,
            debug_output: self.debug_output,
            timing_callback: self.timing_callback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_floored() {
        let config = CacheConfig::from_path("/tmp/whatever")
            .garbage_collection_interval(Duration::from_millis(1))
            .default_expiration_period(Duration::from_secs(1))
            .build();
        assert_eq!(config.garbage_collection_interval, MIN_GC_INTERVAL);
        assert_eq!(config.default_expiration_period, MIN_EXPIRATION_PERIOD);
    }

    #[test]
    fn injected_clock_is_used() {
        let config = CacheConfig::from_path("/tmp/whatever")
            .current_time_sec(|| 42)
            .build();
        assert_eq!(config.now(), 42);
    }

    #[test]
    fn size_constraint_defaults_unbounded() {
        let config = CacheConfig::from_path("/tmp/whatever").build();
        assert_eq!(config.size_constraint_bytes, 0);
    }
}

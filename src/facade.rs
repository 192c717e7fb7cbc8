//! The public operation surface: every method here constructs a work item,
//! enqueues it on [`crate::queue::WorkQueue`], and resolves once the worker
//! has run it under the key's lock. Debug and timing hooks fire at the
//! `Queued`/`Starting`/`Finished` transitions, each wrapped in an
//! `#[instrument]` span plus explicit `tracing` events per phase.
//!
//! Every async method here is the primary surface; `*_with_callback`
//! variants exist alongside for callers who prefer a callback plus a
//! caller-supplied completion target over an awaitable, dispatching onto a
//! [`CompletionTarget`] instead of returning a future.

use std::sync::Arc;

use crate::config::{CacheConfig, Priority};
use crate::gc::GarbageCollector;
use crate::io::PosixIo;
use crate::queue::WorkQueue;
use crate::response::Response;
use crate::store::RecordStore;

/// Where a `*_with_callback` completion is delivered. `Spawn` runs the
/// callback as an independent `tokio` task (the default: never inline on
/// the submission thread); `Handle` runs it on a specific runtime handle,
/// for callers that own their own executor.
#[derive(Clone)]
pub enum CompletionTarget {
    Spawn,
    Handle(tokio::runtime::Handle),
}

impl CompletionTarget {
    fn run(&self, fut: impl std::future::Future<Output = ()> + Send + 'static) {
        match self {
            CompletionTarget::Spawn => {
                tokio::spawn(fut);
            }
            CompletionTarget::Handle(handle) => {
                handle.spawn(fut);
            }
        }
    }
}

pub struct CacheFacade {
    config: Arc<CacheConfig>,
    store: Arc<RecordStore>,
    gc: Arc<GarbageCollector>,
    queue: Arc<WorkQueue>,
}

impl CacheFacade {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_io(config, Arc::new(crate::io::RealPosixIo))
    }

    pub fn with_io(config: CacheConfig, io: Arc<dyn PosixIo>) -> Self {
        let config = Arc::new(config);
        let store = Arc::new(RecordStore::new(Arc::clone(&config), Arc::clone(&io)));
        let gc = GarbageCollector::new(Arc::clone(&config), io);
        let queue = WorkQueue::new(config.max_concurrent_operations());
        Self { config, store, gc, queue }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn transition(&self, operation: &'static str, key: &str, phase: &'static str) {
        self.config.emit_timing(operation, phase);
        self.config
            .emit_debug(|| format!("{operation} {phase} key={key}"));
    }

    /// Submits `make_job` under `key`'s lock at `priority`, firing the
    /// `Queued`/`Starting`/`Finished` hooks around it, and returns the
    /// completed [`Response`].
    async fn run(
        &self,
        operation: &'static str,
        key: String,
        priority: Priority,
        make_job: impl FnOnce() -> std::pin::Pin<Box<dyn std::future::Future<Output = Response> + Send>>
            + Send
            + 'static,
    ) -> Response {
        self.transition(operation, &key, "Queued");
        let config = Arc::clone(&self.config);
        let key_for_job = key.clone();
        let rx = self.queue.submit(&key, priority, move || async move {
            config.emit_timing(operation, "Starting");
            config.emit_debug(|| format!("{operation} Starting key={key_for_job}"));
            let response = make_job().await;
            config.emit_timing(operation, "Finished");
            config.emit_debug(|| format!("{operation} Finished key={key_for_job}"));
            response
        });
        rx.await.unwrap_or_else(|_| {
            Response::operation_error(crate::error::CacheError::InternalInconsistency {
                detail: "work queue worker dropped without responding".to_string(),
            })
        })
    }

    #[tracing::instrument(skip(self, data), fields(key = %key, bytes = data.len()))]
    pub async fn store(&self, key: &str, data: Vec<u8>, locked: bool) -> Response {
        self.store_with_ttl(key, data, 0, locked).await
    }

    #[tracing::instrument(skip(self, data), fields(key = %key, bytes = data.len(), ttl))]
    pub async fn store_with_ttl(&self, key: &str, data: Vec<u8>, ttl: u64, locked: bool) -> Response {
        let store = Arc::clone(&self.store);
        let key_owned = key.to_string();
        self.run("store", key.to_string(), Priority::Write, move || {
            Box::pin(async move { store.store(&key_owned, &data, ttl, locked).await })
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(key = %key))]
    pub async fn load(&self, key: &str) -> Response {
        let store = Arc::clone(&self.store);
        let key_owned = key.to_string();
        self.run("load", key.to_string(), Priority::Read, move || {
            Box::pin(async move { store.load(&key_owned).await })
        })
        .await
    }

    /// Unlike the other operations, `loadWithPrefix` does not have a single
    /// natural lock key (the match is resolved on the worker); it submits
    /// under the prefix itself, which is sufficient to serialize repeated
    /// calls against the same prefix without taking a global lock.
    #[tracing::instrument(skip(self, choose_key), fields(prefix = %prefix))]
    pub async fn load_with_prefix(
        &self,
        prefix: &str,
        choose_key: impl FnOnce(Vec<String>) -> Option<String> + Send + 'static,
    ) -> Response {
        let store = Arc::clone(&self.store);
        let prefix_owned = prefix.to_string();
        self.run("load_with_prefix", prefix.to_string(), Priority::Read, move || {
            Box::pin(async move { store.load_with_prefix(&prefix_owned, choose_key).await })
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(key = %key))]
    pub async fn touch(&self, key: &str) -> Response {
        let store = Arc::clone(&self.store);
        let key_owned = key.to_string();
        self.run("touch", key.to_string(), Priority::Write, move || {
            Box::pin(async move { store.touch(&key_owned).await })
        })
        .await
    }

    /// A batch is a sequence of independent per-key operations, not a
    /// single atomic transaction. Partial failure leaves earlier successes
    /// applied.
    pub async fn lock(&self, keys: &[String]) -> Vec<Response> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.lock_one(key).await);
        }
        out
    }

    #[tracing::instrument(skip(self), fields(key = %key))]
    async fn lock_one(&self, key: &str) -> Response {
        let store = Arc::clone(&self.store);
        let key_owned = key.to_string();
        self.run("lock", key.to_string(), Priority::Write, move || {
            Box::pin(async move { store.lock_one(&key_owned).await })
        })
        .await
    }

    pub async fn unlock(&self, keys: &[String]) -> Vec<Response> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.unlock_one(key).await);
        }
        out
    }

    #[tracing::instrument(skip(self), fields(key = %key))]
    async fn unlock_one(&self, key: &str) -> Response {
        let store = Arc::clone(&self.store);
        let key_owned = key.to_string();
        self.run("unlock", key.to_string(), Priority::Write, move || {
            Box::pin(async move { store.unlock_one(&key_owned).await })
        })
        .await
    }

    pub async fn remove(&self, keys: &[String]) -> Vec<Response> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.remove_one(key).await);
        }
        out
    }

    #[tracing::instrument(skip(self), fields(key = %key))]
    async fn remove_one(&self, key: &str) -> Response {
        let store = Arc::clone(&self.store);
        let key_owned = key.to_string();
        self.run("remove", key.to_string(), Priority::Delete, move || {
            Box::pin(async move { store.remove_one(&key_owned).await })
        })
        .await
    }

    pub async fn prune(&self) -> Response {
        self.store.prune().await;
        Response::succeeded()
    }

    pub async fn wipe_locked(&self) -> Response {
        self.store.wipe_locked().await;
        Response::succeeded()
    }

    pub async fn wipe_unlocked(&self) -> Response {
        self.store.wipe_unlocked().await;
        Response::succeeded()
    }

    pub async fn total_used_size_in_bytes(&self) -> u64 {
        self.store.total_used_size_in_bytes().await
    }

    pub async fn locked_items_size_in_bytes(&self) -> u64 {
        self.store.locked_items_size_in_bytes().await
    }

    /// Idempotent; see `GarbageCollector::schedule`.
    pub async fn schedule_garbage_collector(&self) {
        self.gc.schedule().await;
    }

    /// Idempotent; see `GarbageCollector::unschedule`.
    pub async fn unschedule_garbage_collector(&self) {
        self.gc.unschedule().await;
    }

    /// Runs one GC sweep immediately, outside the scheduled interval.
    pub async fn run_garbage_collection_now(&self) {
        self.gc.run_sweep().await;
    }

    // -- callback-style surface, for callers migrating from the original --

    pub fn store_with_callback(
        self: &Arc<Self>,
        key: &str,
        data: Vec<u8>,
        locked: bool,
        callback: impl FnOnce(Response) + Send + 'static,
        target: CompletionTarget,
    ) {
        self.dispatch(target, {
            let this = Arc::clone(self);
            let key = key.to_string();
            async move { this.store(&key, data, locked).await }
        }, callback);
    }

    pub fn store_with_ttl_with_callback(
        self: &Arc<Self>,
        key: &str,
        data: Vec<u8>,
        ttl: u64,
        locked: bool,
        callback: impl FnOnce(Response) + Send + 'static,
        target: CompletionTarget,
    ) {
        self.dispatch(target, {
            let this = Arc::clone(self);
            let key = key.to_string();
            async move { this.store_with_ttl(&key, data, ttl, locked).await }
        }, callback);
    }

    pub fn load_with_callback(
        self: &Arc<Self>,
        key: &str,
        callback: impl FnOnce(Response) + Send + 'static,
        target: CompletionTarget,
    ) {
        self.dispatch(target, {
            let this = Arc::clone(self);
            let key = key.to_string();
            async move { this.load(&key).await }
        }, callback);
    }

    pub fn touch_with_callback(
        self: &Arc<Self>,
        key: &str,
        callback: impl FnOnce(Response) + Send + 'static,
        target: CompletionTarget,
    ) {
        self.dispatch(target, {
            let this = Arc::clone(self);
            let key = key.to_string();
            async move { this.touch(&key).await }
        }, callback);
    }

    /// Runs `fut` to completion and hands its `Response` to `callback` on
    /// `target`, never inline on the calling thread.
    fn dispatch(
        &self,
        target: CompletionTarget,
        fut: impl std::future::Future<Output = Response> + Send + 'static,
        callback: impl FnOnce(Response) + Send + 'static,
    ) {
        target.run(async move {
            let response = fut.await;
            callback(response);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::RealPosixIo;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    fn facade_with_clock(dir: &std::path::Path, time: Arc<AtomicU64>) -> Arc<CacheFacade> {
        let clock = Arc::clone(&time);
        let config = CacheConfig::from_path(dir)
            .current_time_sec(move || clock.load(Ordering::SeqCst))
            .build();
        Arc::new(CacheFacade::with_io(config, Arc::new(RealPosixIo)))
    }

    #[tokio::test]
    async fn store_then_load_through_facade() {
        let dir = tempfile::tempdir().unwrap();
        let facade = facade_with_clock(dir.path(), Arc::new(AtomicU64::new(1000)));

        let resp = facade.store("k1", vec![1, 2, 3], false).await;
        assert!(resp.is_success());

        let resp = facade.load("k1").await;
        assert_eq!(resp.record.unwrap().data, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn batched_lock_is_per_key_independent() {
        let dir = tempfile::tempdir().unwrap();
        let facade = facade_with_clock(dir.path(), Arc::new(AtomicU64::new(1000)));

        facade.store("a", vec![], false).await;
        facade.store("b", vec![], false).await;

        let results = facade.lock(&["a".to_string(), "missing".to_string()]).await;
        assert!(results[0].is_success());
        assert_eq!(results[1].result, crate::response::CacheResult::NotFound);
    }

    #[tokio::test]
    async fn timing_callback_fires_queued_starting_finished() {
        let dir = tempfile::tempdir().unwrap();
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&transitions);
        let config = CacheConfig::from_path(dir.path())
            .current_time_sec(|| 1000)
            .timing_callback(move |op, phase| {
                recorder.lock().unwrap().push(format!("{op}:{phase}"));
            })
            .build();
        let facade = CacheFacade::with_io(config, Arc::new(RealPosixIo));

        facade.store("k1", vec![], false).await;

        let seen = transitions.lock().unwrap().clone();
        assert_eq!(seen, vec!["store:Queued", "store:Starting", "store:Finished"]);
    }

    #[tokio::test]
    async fn schedule_garbage_collector_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let facade = facade_with_clock(dir.path(), Arc::new(AtomicU64::new(1000)));

        facade.schedule_garbage_collector().await;
        facade.schedule_garbage_collector().await;
        facade.unschedule_garbage_collector().await;
        facade.unschedule_garbage_collector().await;
    }

    #[tokio::test]
    async fn callback_surface_delivers_on_spawned_task() {
        let dir = tempfile::tempdir().unwrap();
        let facade = facade_with_clock(dir.path(), Arc::new(AtomicU64::new(1000)));
        let (tx, rx) = tokio::sync::oneshot::channel();

        facade.store_with_callback(
            "k1",
            vec![9],
            false,
            move |resp| {
                let _ = tx.send(resp);
            },
            CompletionTarget::Spawn,
        );

        let resp = rx.await.unwrap();
        assert!(resp.is_success());
    }
}

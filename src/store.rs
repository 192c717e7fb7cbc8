//! Per-key atomic record operations: `store`, `load`, `touch`, `lock`,
//! `unlock`, `remove`, and the bulk tree-walking operations (`prune`,
//! `wipe_locked`, `wipe_unlocked`, the two size queries). This is the core
//! of the engine.
//!
//! Every method here assumes the caller already holds the per-key lock
//! needed for atomicity; `RecordStore` itself is just stateless logic over
//! [`crate::layout::FileLayout`] and [`crate::io::PosixIo`]. It never holds
//! a file descriptor across operations: each method opens, acts, (fsyncs,)
//! and closes within itself.

use std::sync::Arc;

use crate::config::CacheConfig;
use crate::header::{HeaderError, RecordHeader, HEADER_SIZE};
use crate::internal_events::{
    LockUnderflow, RecordCorrupted, RecordExpired, RecordLoaded, RecordMiss, RecordStored,
};
use crate::io::PosixIo;
use crate::layout::FileLayout;
use crate::response::{CacheResult, Record, Response};

pub struct RecordStore {
    config: Arc<CacheConfig>,
    layout: FileLayout,
    io: Arc<dyn PosixIo>,
}

impl RecordStore {
    pub fn new(config: Arc<CacheConfig>, io: Arc<dyn PosixIo>) -> Self {
        let layout = FileLayout::new(Arc::clone(&config));
        Self { config, layout, io }
    }

    pub fn layout(&self) -> &FileLayout {
        &self.layout
    }

    /// Sets `refCount` absolutely (1 if `locked`, else 0), overwriting
    /// whatever a previous record at this key had.
    #[tracing::instrument(skip(self, data), fields(key, bytes = data.len()))]
    pub async fn store(&self, key: &str, data: &[u8], ttl: u64, locked: bool) -> Response {
        let now = self.config.now();
        let header = RecordHeader::make(ttl, data.len() as u64, now, locked);

        if let Err(source) = self.layout.create_sub_directory_for_key(key).await {
            return Response::operation_error(source.into());
        }

        let mut file_bytes = Vec::with_capacity(HEADER_SIZE as usize + data.len());
        file_bytes.extend_from_slice(zerocopy::IntoBytes::as_bytes(&header));
        file_bytes.extend_from_slice(data);

        let path = self.layout.path_for_key(key);
        match self.io.write_all_truncating(&path, &file_bytes).await {
            Ok(()) => {
                RecordStored { key, bytes: data.len() as u64 }.emit();
                Response::succeeded()
            }
            Err(source) => Response::operation_error(source.into()),
        }
    }

    /// Reads back a record's payload, validating the header and refreshing
    /// `updateTimeSec` when the record uses the default expiration policy.
    #[tracing::instrument(skip(self), fields(key))]
    pub async fn load(&self, key: &str) -> Response {
        let path = self.layout.path_for_key(key);
        let bytes = match self.io.read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                RecordMiss { key }.emit();
                return Response::not_found();
            }
            Err(source) => return Response::operation_error(source.into()),
        };

        if bytes.len() < HEADER_SIZE as usize {
            self.quarantine(key, "not enough data to get header").await;
            return Response::operation_error(
                HeaderError::NotEnoughDataToGetHeader { len: bytes.len() }.into(),
            );
        }

        let mut header = RecordHeader::parse(&bytes).expect("length already checked");
        if let Err(e) = header.validate() {
            self.quarantine(key, &e.to_string()).await;
            return Response::operation_error(e.into());
        }

        if header.is_stream_incomplete() {
            RecordMiss { key }.emit();
            return Response::not_found();
        }

        let now = self.config.now();
        let expired = header.is_expired(now, self.config.default_expiration_period_secs());
        if expired && !header.is_locked() {
            RecordExpired { key }.emit();
            return Response::not_found();
        }

        let payload_size = header.payload_size_bytes() as usize;
        let payload_start = HEADER_SIZE as usize;
        if bytes.len() < payload_start + payload_size {
            self.quarantine(key, "payload shorter than declared").await;
            return Response::operation_error(
                crate::error::CacheError::WrongPayloadSize {
                    expected: header.payload_size_bytes(),
                    found: (bytes.len() - payload_start) as u64,
                },
            );
        }
        let data = bytes[payload_start..payload_start + payload_size].to_vec();

        // Access-time refresh only applies to the default expiration policy.
        if header.ttl() == 0 {
            header.set_update_time_sec(now);
            header.refresh_crc();
            if let Err(source) = self
                .io
                .write_at(&path, 0, zerocopy::IntoBytes::as_bytes(&header))
                .await
            {
                return Response::operation_error(source.into());
            }
        }

        RecordLoaded { key }.emit();
        Response::succeeded_with_record(Record {
            key: key.to_string(),
            data,
            ref_count: header.ref_count(),
            ttl: header.ttl(),
        })
    }

    /// Loads the record chosen by `choose_key` out of every key under
    /// `prefix`. `choose_key` is invoked synchronously, on the worker that
    /// runs the rest of this operation.
    pub async fn load_with_prefix(
        &self,
        prefix: &str,
        choose_key: impl FnOnce(Vec<String>) -> Option<String>,
    ) -> Response {
        let candidates: Vec<String> = self
            .layout
            .walk_records()
            .await
            .into_iter()
            .map(|entry| entry.key)
            .filter(|key| key.starts_with(prefix))
            .collect();

        match choose_key(candidates) {
            Some(key) => self.load(&key).await,
            None => Response::not_found(),
        }
    }

    /// Refreshes `updateTimeSec` so the record's expiration clock restarts.
    /// A no-op (but still `Succeeded`) for records with a nonzero `ttl`,
    /// since those expire on a fixed schedule from `updateTimeSec` at write
    /// time rather than on access.
    pub async fn touch(&self, key: &str) -> Response {
        let path = self.layout.path_for_key(key);
        let prefix = match self.io.read_prefix(&path, HEADER_SIZE as usize).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Response::not_found(),
            Err(source) => return Response::operation_error(source.into()),
        };
        if prefix.len() < HEADER_SIZE as usize {
            self.quarantine(key, "not enough data to get header").await;
            return Response::operation_error(
                HeaderError::NotEnoughDataToGetHeader { len: prefix.len() }.into(),
            );
        }
        let mut header = RecordHeader::parse(&prefix).expect("length already checked");
        if let Err(e) = header.validate() {
            self.quarantine(key, &e.to_string()).await;
            return Response::operation_error(e.into());
        }

        let now = self.config.now();
        let expired = header.is_expired(now, self.config.default_expiration_period_secs());
        if expired && !header.is_locked() {
            return Response::not_found();
        }

        if header.ttl() != 0 {
            return Response::succeeded();
        }

        header.set_update_time_sec(now);
        header.refresh_crc();
        match self
            .io
            .write_at(&path, 0, zerocopy::IntoBytes::as_bytes(&header))
            .await
        {
            Ok(()) => Response::succeeded(),
            Err(source) => Response::operation_error(source.into()),
        }
    }

    /// Increments `refCount` for a single key; callers wanting batch lock
    /// semantics over several keys map this over the key list.
    pub async fn lock_one(&self, key: &str) -> Response {
        self.adjust_ref_count(key, 1).await
    }

    /// Decrements `refCount` for a single key. Decrementing a zero
    /// `refCount` is a programmer-fatal contract violation: it aborts rather
    /// than returning an error.
    pub async fn unlock_one(&self, key: &str) -> Response {
        self.adjust_ref_count(key, -1).await
    }

    async fn adjust_ref_count(&self, key: &str, delta: i64) -> Response {
        let path = self.layout.path_for_key(key);
        let prefix = match self.io.read_prefix(&path, HEADER_SIZE as usize).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Response::not_found(),
            Err(source) => return Response::operation_error(source.into()),
        };
        if prefix.len() < HEADER_SIZE as usize {
            self.quarantine(key, "not enough data to get header").await;
            return Response::operation_error(
                HeaderError::NotEnoughDataToGetHeader { len: prefix.len() }.into(),
            );
        }
        let mut header = RecordHeader::parse(&prefix).expect("length already checked");
        if let Err(e) = header.validate() {
            self.quarantine(key, &e.to_string()).await;
            return Response::operation_error(e.into());
        }

        if delta < 0 {
            if header.ref_count() == 0 {
                LockUnderflow { key }.emit();
                panic!("attempted to unlock record \"{key}\" with refCount already at 0");
            }
        } else {
            let now = self.config.now();
            let expired = header.is_expired(now, self.config.default_expiration_period_secs());
            if expired && !header.is_locked() {
                return Response::not_found();
            }
        }

        let new_count = (header.ref_count() as i64 + delta) as u32;
        header.set_ref_count(new_count);
        header.refresh_crc();
        match self
            .io
            .write_at(&path, 0, zerocopy::IntoBytes::as_bytes(&header))
            .await
        {
            Ok(()) => Response::succeeded_with_record(Record {
                key: key.to_string(),
                data: Vec::new(),
                ref_count: new_count,
                ttl: header.ttl(),
            }),
            Err(source) => Response::operation_error(source.into()),
        }
    }

    /// Unconditional deletion, for a single key.
    pub async fn remove_one(&self, key: &str) -> Response {
        self.layout.remove_data_for_key(key).await;
        Response::succeeded()
    }

    /// Removes every record, locked or not.
    pub async fn prune(&self) {
        self.layout.remove_all_data().await;
    }

    /// Removes every record with `refCount > 0`.
    pub async fn wipe_locked(&self) {
        for entry in self.layout.walk_records().await {
            if let Ok(bytes) = self.io.read_prefix(&entry.path, HEADER_SIZE as usize).await {
                if let Some(header) = RecordHeader::parse(&bytes) {
                    if header.validate().is_ok() && header.is_locked() {
                        let _ = self.io.remove_file(&entry.path).await;
                    }
                }
            }
        }
    }

    /// Removes every record with `refCount == 0`, including unreadable or
    /// corrupt ones.
    pub async fn wipe_unlocked(&self) {
        for entry in self.layout.walk_records().await {
            match self.io.read_prefix(&entry.path, HEADER_SIZE as usize).await {
                Ok(bytes) => match RecordHeader::parse(&bytes) {
                    Some(header) if header.validate().is_ok() && header.is_locked() => {}
                    _ => {
                        let _ = self.io.remove_file(&entry.path).await;
                    }
                },
                Err(_) => {
                    let _ = self.io.remove_file(&entry.path).await;
                }
            }
        }
    }

    pub async fn total_used_size_in_bytes(&self) -> u64 {
        self.layout.total_used_size_in_bytes().await
    }

    pub async fn locked_items_size_in_bytes(&self) -> u64 {
        self.layout.locked_items_size_in_bytes().await
    }

    /// A record that fails header validation (or is too short to have one)
    /// is corrupt: remove it from disk so subsequent lookups see `NotFound`.
    async fn quarantine(&self, key: &str, reason: &str) {
        RecordCorrupted { key, reason: reason.to_string() }.emit();
        let path = self.layout.path_for_key(key);
        let _ = self.io.remove_file(&path).await;
    }
}

//! Maps cache keys to file paths, and answers the size-accounting questions
//! the garbage collector and the public API need.
//!
//! [`FileLayout`] is a thin, stateless (beyond `CacheConfig`) helper. It
//! never opens a file itself for reading/writing record contents; that's
//! [`crate::store::RecordStore`]'s job, via [`crate::io::PosixIo`]. It is
//! however the one place that walks the cache directory tree: there is no
//! separate index, so every size/eviction decision starts from a directory
//! listing.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::CacheConfig;
use crate::header::RecordHeader;

/// One record found while walking the cache tree.
#[derive(Debug, Clone)]
pub struct RecordEntry {
    pub path: PathBuf,
    pub key: String,
    pub size: u64,
}

#[derive(Clone)]
pub struct FileLayout {
    config: Arc<CacheConfig>,
}

impl FileLayout {
    pub fn new(config: Arc<CacheConfig>) -> Self {
        Self { config }
    }

    /// Path of the subdirectory a key's record would live under, or the
    /// cache root itself when directory separation is disabled.
    pub fn sub_directory_path_for_key(&self, key: &str) -> PathBuf {
        if self.config.use_directory_separation {
            let prefix_len = key.chars().count().min(2);
            let prefix: String = key.chars().take(prefix_len).collect();
            self.config.cache_path.join(prefix)
        } else {
            self.config.cache_path.clone()
        }
    }

    /// Final path of the record file for `key`. Does not create any
    /// directories; callers on the write path call
    /// [`FileLayout::create_sub_directory_for_key`] first.
    pub fn path_for_key(&self, key: &str) -> PathBuf {
        self.sub_directory_path_for_key(key).join(key)
    }

    /// Creates the cache root directory. Returns `true` if it exists (or was
    /// just created), `false` if creation failed.
    pub async fn create_cache_directory(&self) -> bool {
        tokio::fs::create_dir_all(&self.config.cache_path)
            .await
            .is_ok()
    }

    /// Creates the subdirectory a given key's record belongs in, on demand.
    /// A no-op (and cheap) when directory separation is disabled.
    pub async fn create_sub_directory_for_key(&self, key: &str) -> std::io::Result<()> {
        tokio::fs::create_dir_all(self.sub_directory_path_for_key(key)).await
    }

    pub async fn remove_data_for_key(&self, key: &str) {
        let _ = tokio::fs::remove_file(self.path_for_key(key)).await;
    }

    pub async fn remove_all_data(&self) {
        let _ = tokio::fs::remove_dir_all(&self.config.cache_path).await;
        let _ = tokio::fs::create_dir_all(&self.config.cache_path).await;
    }

    pub async fn get_file_size_at_path(&self, path: &Path) -> u64 {
        tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
    }

    /// Walks the entire cache tree and returns every record found.
    ///
    /// This is the one place both GC and the size-accounting API share; both
    /// need "every record file, its key, and its size" as a starting point.
    pub async fn walk_records(&self) -> Vec<RecordEntry> {
        let mut out = Vec::new();
        if self.config.use_directory_separation {
            let mut top = match tokio::fs::read_dir(&self.config.cache_path).await {
                Ok(rd) => rd,
                Err(_) => return out,
            };
            while let Ok(Some(sub_entry)) = top.next_entry().await {
                let sub_path = sub_entry.path();
                if !sub_path.is_dir() {
                    continue;
                }
                if let Ok(mut inner) = tokio::fs::read_dir(&sub_path).await {
                    while let Ok(Some(entry)) = inner.next_entry().await {
                        self.push_if_file(&mut out, entry).await;
                    }
                }
            }
        } else if let Ok(mut rd) = tokio::fs::read_dir(&self.config.cache_path).await {
            while let Ok(Some(entry)) = rd.next_entry().await {
                self.push_if_file(&mut out, entry).await;
            }
        }
        out
    }

    async fn push_if_file(&self, out: &mut Vec<RecordEntry>, entry: tokio::fs::DirEntry) {
        let path = entry.path();
        let Ok(meta) = entry.metadata().await else {
            return;
        };
        if !meta.is_file() {
            return;
        }
        let Some(key) = path.file_name().and_then(|n| n.to_str()) else {
            return;
        };
        out.push(RecordEntry {
            path: path.clone(),
            key: key.to_string(),
            size: meta.len(),
        });
    }

    /// Sum of the size of every record file under the cache root.
    pub async fn total_used_size_in_bytes(&self) -> u64 {
        self.walk_records().await.iter().map(|e| e.size).sum()
    }

    /// Sum of the size of every *locked* (`refCount > 0`) record. Reads each
    /// record's header to determine lock state, so this is more expensive
    /// than [`FileLayout::total_used_size_in_bytes`].
    pub async fn locked_items_size_in_bytes(&self) -> u64 {
        let mut total = 0u64;
        for entry in self.walk_records().await {
            if let Ok(bytes) = tokio::fs::read(&entry.path).await {
                if let Some(header) = RecordHeader::parse(&bytes) {
                    if header.validate().is_ok() && header.is_locked() {
                        total += entry.size;
                    }
                }
            }
        }
        total
    }

    /// Given the current total cache size, returns the number of bytes GC
    /// should free to satisfy `sizeConstraintBytes`. `0` when already under
    /// the constraint, or when the constraint is disabled (`0` ==
    /// unbounded).
    pub fn optimized_disk_size_for_cache_size(&self, current: u64) -> i64 {
        let constraint = self.config.size_constraint_bytes;
        if constraint == 0 {
            return 0;
        }
        let current = current as i64;
        let constraint = constraint as i64;
        (current - constraint).max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;

    fn layout(path: &Path, separation: bool) -> FileLayout {
        let mut config = CacheConfig::from_path(path).build();
        config.use_directory_separation = separation;
        FileLayout::new(Arc::new(config))
    }

    #[test]
    fn path_for_key_with_separation() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path(), true);
        let path = layout.path_for_key("abcd1234");
        assert_eq!(path, dir.path().join("ab").join("abcd1234"));
    }

    #[test]
    fn path_for_key_without_separation() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path(), false);
        let path = layout.path_for_key("abcd1234");
        assert_eq!(path, dir.path().join("abcd1234"));
    }

    #[test]
    fn short_key_uses_whole_key_as_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path(), true);
        let path = layout.path_for_key("a");
        assert_eq!(path, dir.path().join("a").join("a"));
    }

    #[test]
    fn optimized_disk_size_is_zero_when_unbounded() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path(), true);
        assert_eq!(layout.optimized_disk_size_for_cache_size(1_000_000), 0);
    }
}

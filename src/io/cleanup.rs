//! Batched removal of intermediate blobs.
//!
//! Delete requests take at most [`MAX_DELETE_BATCH`] keys, so a
//! [`CleanupSet`] is drained in consecutive chunks, one blocking request at a
//! time. Deletion is not transactional: if a batch fails the remaining
//! batches are not attempted and keys already deleted stay deleted.

use crate::error::Result;
use crate::io::store::{BlobStore, MAX_DELETE_BATCH};
use std::collections::HashSet;

#[derive(Debug, Default)]
struct BucketKeys {
    bucket: String,
    keys: Vec<String>,
    seen: HashSet<String>,
}

/// Keys waiting to be deleted, grouped by bucket in insertion order.
#[derive(Debug, Default)]
pub struct CleanupSet {
    buckets: Vec<BucketKeys>,
}

/// What a purge removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Delete requests issued
    pub batches: usize,
    /// Keys deleted
    pub keys: usize,
}

impl CleanupSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `key` for deletion. Duplicates are ignored.
    pub fn add(&mut self, bucket: &str, key: impl Into<String>) {
        let key = key.into();
        let entry = match self.buckets.iter_mut().position(|b| b.bucket == bucket) {
            Some(idx) => &mut self.buckets[idx],
            None => {
                self.buckets.push(BucketKeys {
                    bucket: bucket.to_string(),
                    ..Default::default()
                });
                // just pushed
                let last = self.buckets.len() - 1;
                &mut self.buckets[last]
            }
        };
        if entry.seen.insert(key.clone()) {
            entry.keys.push(key);
        }
    }

    pub fn extend<I, K>(&mut self, bucket: &str, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        for key in keys {
            self.add(bucket, key);
        }
    }

    /// Number of keys still queued.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.keys.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delete every queued key.
    ///
    /// Keys leave the set once their batch succeeds, so calling this again
    /// after success issues no requests. On failure the set keeps the failed
    /// batch and everything after it.
    pub async fn purge(&mut self, store: &dyn BlobStore) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();

        for entry in &mut self.buckets {
            while !entry.keys.is_empty() {
                let n = entry.keys.len().min(MAX_DELETE_BATCH);
                store.delete_batch(&entry.bucket, &entry.keys[..n]).await?;

                for key in entry.keys.drain(..n) {
                    entry.seen.remove(&key);
                }
                report.batches += 1;
                report.keys += n;
                tracing::debug!(
                    "Deleted batch of {} keys from {} ({} remaining)",
                    n,
                    entry.bucket,
                    entry.keys.len()
                );
            }
        }

        self.buckets.retain(|b| !b.keys.is_empty());
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StitchError;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::path::Path;
    use std::sync::Mutex;

    /// Store that records delete calls and can fail the nth one.
    #[derive(Default)]
    struct RecordingStore {
        batches: Mutex<Vec<(String, Vec<String>)>>,
        fail_on: Option<usize>,
    }

    #[async_trait]
    impl BlobStore for RecordingStore {
        async fn download_to_buffer(&self, _bucket: &str, _key: &str) -> Result<Bytes> {
            unreachable!()
        }

        async fn upload_file(&self, _local: &Path, _bucket: &str, _key: &str) -> Result<u64> {
            unreachable!()
        }

        async fn delete_batch(&self, bucket: &str, keys: &[String]) -> Result<()> {
            let mut batches = self.batches.lock().unwrap();
            if self.fail_on == Some(batches.len()) {
                return Err(StitchError::Transfer {
                    message: "injected".to_string(),
                    source: None,
                });
            }
            assert!(keys.len() <= MAX_DELETE_BATCH);
            batches.push((bucket.to_string(), keys.to_vec()));
            Ok(())
        }
    }

    fn keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("tile_{}.tif", i)).collect()
    }

    #[tokio::test]
    async fn test_batch_sizes_2500() {
        let store = RecordingStore::default();
        let mut set = CleanupSet::new();
        set.extend("bucket", keys(2500));

        let report = set.purge(&store).await.unwrap();
        assert_eq!(report, CleanupReport { batches: 3, keys: 2500 });

        let batches = store.batches.lock().unwrap();
        let sizes: Vec<usize> = batches.iter().map(|(_, k)| k.len()).collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);
    }

    #[tokio::test]
    async fn test_batches_cover_keys_exactly_once() {
        for k in [0usize, 1, 999, 1000, 1001, 3000] {
            let store = RecordingStore::default();
            let mut set = CleanupSet::new();
            set.extend("bucket", keys(k));
            set.purge(&store).await.unwrap();

            let batches = store.batches.lock().unwrap();
            assert_eq!(batches.len(), k.div_ceil(MAX_DELETE_BATCH));

            let all: Vec<String> = batches.iter().flat_map(|(_, b)| b.clone()).collect();
            assert_eq!(all, keys(k));
        }
    }

    #[tokio::test]
    async fn test_second_purge_is_noop() {
        let store = RecordingStore::default();
        let mut set = CleanupSet::new();
        set.extend("bucket", keys(10));

        set.purge(&store).await.unwrap();
        let report = set.purge(&store).await.unwrap();
        assert_eq!(report.batches, 0);
        assert_eq!(store.batches.lock().unwrap().len(), 1);
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn test_failed_batch_aborts_rest() {
        let store = RecordingStore {
            fail_on: Some(1),
            ..Default::default()
        };
        let mut set = CleanupSet::new();
        set.extend("bucket", keys(2500));

        let err = set.purge(&store).await.unwrap_err();
        assert!(matches!(err, StitchError::Transfer { .. }));
        // first batch went through, nothing after the failure was attempted
        assert_eq!(store.batches.lock().unwrap().len(), 1);
        assert_eq!(set.len(), 1500);
    }

    #[tokio::test]
    async fn test_groups_by_bucket_and_dedupes() {
        let store = RecordingStore::default();
        let mut set = CleanupSet::new();
        set.add("main", "state.json");
        set.add("docs", "stats.json");
        set.add("main", "state.json");
        set.add("main", "spatial.json");
        assert_eq!(set.len(), 3);

        let report = set.purge(&store).await.unwrap();
        assert_eq!(report.batches, 2);

        let batches = store.batches.lock().unwrap();
        assert_eq!(batches[0].0, "main");
        assert_eq!(batches[0].1, vec!["state.json", "spatial.json"]);
        assert_eq!(batches[1].0, "docs");
    }
}

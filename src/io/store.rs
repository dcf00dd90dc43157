//! Blob store access for S3 and the local filesystem.
//!
//! The pipeline only needs three operations (download into memory, upload a
//! local file, delete a batch of keys), exposed through [`BlobStore`].
//! [`ObjectBlobStore`] implements them with `object_store`, keeping one
//! client per bucket.

use crate::config::{AwsConfig, RetryConfig, StoreConfig};
use crate::error::{Result, StitchError};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{self, StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::{ClientOptions, ObjectStore, WriteMultipart};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;

/// Maximum number of keys in one delete request (S3 DeleteObjects limit).
pub const MAX_DELETE_BATCH: usize = 1000;

/// Part size for multipart uploads.
const UPLOAD_PART_SIZE: usize = 16 * 1024 * 1024;

/// Remote bucket/key storage used by the pipeline.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Download a whole blob into memory.
    async fn download_to_buffer(&self, bucket: &str, key: &str) -> Result<Bytes>;

    /// Upload a local file, returning the number of bytes written.
    async fn upload_file(&self, local_path: &Path, bucket: &str, key: &str) -> Result<u64>;

    /// Delete up to [`MAX_DELETE_BATCH`] keys in one request.
    async fn delete_batch(&self, bucket: &str, keys: &[String]) -> Result<()>;

    /// Path GDAL opens to read `key` directly from storage.
    fn raster_path(&self, bucket: &str, key: &str) -> String {
        format!("/vsis3/{}/{}", bucket, key)
    }
}

/// Where [`ObjectBlobStore`] finds its buckets.
#[derive(Debug, Clone)]
enum Backend {
    S3 { aws: AwsConfig, retry: RetryConfig },
    Local { root: PathBuf },
}

/// [`BlobStore`] over `object_store`, with one cached client per bucket.
pub struct ObjectBlobStore {
    backend: Backend,
    stores: DashMap<String, Arc<dyn ObjectStore>>,
}

impl ObjectBlobStore {
    /// Create a store from configuration: local directory if `local_root`
    /// is set, authenticated S3 otherwise.
    pub fn from_config(config: &StoreConfig) -> Self {
        let backend = match &config.local_root {
            Some(root) => Backend::Local { root: root.clone() },
            None => Backend::S3 {
                aws: config.aws.clone(),
                retry: config.retry.clone(),
            },
        };
        Self {
            backend,
            stores: DashMap::new(),
        }
    }

    /// Store serving each bucket from `root/<bucket>`.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self {
            backend: Backend::Local { root: root.into() },
            stores: DashMap::new(),
        }
    }

    /// Store backed by an existing client, for all buckets.
    pub fn with_store(bucket: &str, store: Arc<dyn ObjectStore>) -> Self {
        let stores = DashMap::new();
        stores.insert(bucket.to_string(), store);
        Self {
            backend: Backend::S3 {
                aws: AwsConfig::default(),
                retry: RetryConfig::default(),
            },
            stores,
        }
    }

    fn store(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>> {
        if let Some(store) = self.stores.get(bucket) {
            return Ok(Arc::clone(store.value()));
        }

        let store: Arc<dyn ObjectStore> = match &self.backend {
            Backend::S3 { aws, retry } => create_authenticated_store(bucket, aws, retry)?,
            Backend::Local { root } => {
                let path = root.join(bucket);
                if !path.exists() {
                    std::fs::create_dir_all(&path)?;
                }
                tracing::info!("Creating LocalFileSystem store at: {}", path.display());
                let fs = LocalFileSystem::new_with_prefix(&path).map_err(|e| {
                    StitchError::transfer(format!("local store {}", path.display()), e)
                })?;
                Arc::new(fs)
            }
        };

        Ok(self
            .stores
            .entry(bucket.to_string())
            .or_insert(store)
            .value()
            .clone())
    }
}

#[async_trait]
impl BlobStore for ObjectBlobStore {
    async fn download_to_buffer(&self, bucket: &str, key: &str) -> Result<Bytes> {
        let store = self.store(bucket)?;
        let path = ObjectPath::from(key);
        let bytes = store
            .get(&path)
            .await
            .map_err(|e| StitchError::transfer(format!("get {}:{}", bucket, key), e))?
            .bytes()
            .await
            .map_err(|e| StitchError::transfer(format!("read {}:{}", bucket, key), e))?;
        tracing::debug!("Downloaded {}:{} ({} bytes)", bucket, key, bytes.len());
        Ok(bytes)
    }

    async fn upload_file(&self, local_path: &Path, bucket: &str, key: &str) -> Result<u64> {
        let store = self.store(bucket)?;
        let path = ObjectPath::from(key);

        let upload = store
            .put_multipart(&path)
            .await
            .map_err(|e| StitchError::transfer(format!("start upload {}:{}", bucket, key), e))?;
        let mut writer = WriteMultipart::new_with_chunk_size(upload, UPLOAD_PART_SIZE);

        let mut file = tokio::fs::File::open(local_path).await?;
        let mut buf = vec![0u8; UPLOAD_PART_SIZE];
        let mut total = 0u64;
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer
                .wait_for_capacity(4)
                .await
                .map_err(|e| StitchError::transfer(format!("upload {}:{}", bucket, key), e))?;
            writer.write(&buf[..n]);
            total += n as u64;
        }

        writer
            .finish()
            .await
            .map_err(|e| StitchError::transfer(format!("finish upload {}:{}", bucket, key), e))?;
        tracing::debug!("Uploaded {} to {}:{} ({} bytes)", local_path.display(), bucket, key, total);
        Ok(total)
    }

    async fn delete_batch(&self, bucket: &str, keys: &[String]) -> Result<()> {
        if keys.len() > MAX_DELETE_BATCH {
            return Err(StitchError::Transfer {
                message: format!(
                    "delete batch of {} keys exceeds the limit of {}",
                    keys.len(),
                    MAX_DELETE_BATCH
                ),
                source: None,
            });
        }
        if keys.is_empty() {
            return Ok(());
        }

        let store = self.store(bucket)?;
        let locations = stream::iter(
            keys.iter()
                .map(|k| Ok::<_, object_store::Error>(ObjectPath::from(k.as_str()))),
        )
        .boxed();

        store
            .delete_stream(locations)
            .or_else(|e| async move {
                // already gone counts as deleted
                match e {
                    object_store::Error::NotFound { path, .. } => Ok(ObjectPath::from(path)),
                    other => Err(other),
                }
            })
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| StitchError::transfer(format!("delete from {}", bucket), e))?;
        Ok(())
    }

    fn raster_path(&self, bucket: &str, key: &str) -> String {
        match &self.backend {
            Backend::Local { root } => root.join(bucket).join(key).display().to_string(),
            Backend::S3 { .. } => format!("/vsis3/{}/{}", bucket, key),
        }
    }
}

/// Create client options for S3 access.
///
/// The stage moves a handful of large objects, so the pool stays small and
/// the request timeout is generous enough for multipart parts.
fn create_client_options(aws: &AwsConfig) -> ClientOptions {
    let options = ClientOptions::new()
        // Connection timeout: how long to wait for a connection to be established
        .with_connect_timeout(Duration::from_secs(5))
        // Request timeout: covers one multipart part on a slow link
        .with_timeout(Duration::from_secs(300))
        .with_pool_idle_timeout(Duration::from_secs(90))
        .with_pool_max_idle_per_host(16);

    if aws.allow_http {
        options.with_allow_http(true)
    } else {
        options
    }
}

/// Create retry configuration for transient failures.
fn create_retry_config(retry: &RetryConfig) -> object_store::RetryConfig {
    object_store::RetryConfig {
        max_retries: retry.max_retries,
        // Initial backoff (doubles each retry)
        backoff: object_store::BackoffConfig {
            init_backoff: Duration::from_millis(retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(retry.max_backoff_ms),
            base: 2.0,
        },
        retry_timeout: Duration::from_secs(180),
    }
}

/// Create an authenticated S3 client for `bucket`.
///
/// Credentials and region are loaded from (in order):
/// - Environment variables (AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, AWS_REGION)
/// - AWS config files (~/.aws/credentials, ~/.aws/config)
/// - EC2 instance profile / container credentials
fn create_authenticated_store(
    bucket: &str,
    aws: &AwsConfig,
    retry: &RetryConfig,
) -> Result<Arc<dyn ObjectStore>> {
    tracing::info!("Creating authenticated S3 client for bucket: {}", bucket);

    let mut builder = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_client_options(create_client_options(aws))
        .with_retry(create_retry_config(retry));

    if let Some(region) = &aws.region {
        builder = builder.with_region(region);
    }
    if let Some(endpoint) = &aws.endpoint_url {
        builder = builder.with_endpoint(endpoint);
    }

    let store = builder
        .build()
        .map_err(|e| StitchError::transfer(format!("S3 client for bucket {}", bucket), e))?;
    Ok(Arc::new(store))
}

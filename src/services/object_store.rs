//! S3-compatible object storage.
//!
//! Uploads go through a small backend trait so the batch machinery can be
//! exercised against an in-memory double; `S3Backend` is the production
//! implementation. Batches are all-or-nothing: on the first failure no new
//! uploads start, in-flight ones drain, and every completed key is deleted
//! before the error reaches the caller.

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ObjectCannedAcl;
use aws_sdk_s3::Client;
use bytes::Bytes;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::S3Config;
use crate::error::{AppError, Result};

/// Upload fan-out width within one batch.
pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 5;

/// One member of an upload batch.
#[derive(Clone, Debug)]
pub struct UploadFile {
    pub key: String,
    pub body: Bytes,
    pub content_type: &'static str,
}

#[async_trait]
pub trait BlobBackend: Send + Sync {
    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

pub struct S3Backend {
    client: Client,
    bucket: String,
    cache_control: String,
}

impl S3Backend {
    pub async fn new(config: &S3Config) -> Result<Self> {
        let mut builder = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            builder = builder.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "media_pipeline",
            ));
        }
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let aws_config = builder.load().await;
        // Path-style addressing for MinIO-style endpoints.
        let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
            .force_path_style(config.endpoint.is_some())
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
            cache_control: format!("public, max-age={}", config.cache_seconds),
        })
    }

    /// Startup connectivity probe; processing depends entirely on the store.
    pub async fn health_check(&self) -> Result<()> {
        self.client
            .list_objects_v2()
            .bucket(&self.bucket)
            .max_keys(1)
            .send()
            .await
            .map_err(|e| {
                AppError::ObjectStore(format!("bucket {} not reachable: {e}", self.bucket))
            })?;
        info!(bucket = %self.bucket, "object store reachable");
        Ok(())
    }
}

#[async_trait]
impl BlobBackend for S3Backend {
    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body.to_vec()))
            .content_type(content_type)
            .cache_control(&self.cache_control)
            .acl(ObjectCannedAcl::PublicRead)
            .send()
            .await
            .map_err(|e| AppError::ObjectStore(format!("put {key} failed: {e}")))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        // S3 deletes are idempotent; a missing key is a success.
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| AppError::ObjectStore(format!("delete {key} failed: {e}")))?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct ObjectStore {
    backend: Arc<dyn BlobBackend>,
    public_base_url: Option<String>,
}

impl ObjectStore {
    pub fn new(backend: Arc<dyn BlobBackend>, public_base_url: Option<String>) -> Self {
        Self {
            backend,
            public_base_url,
        }
    }

    pub async fn s3(config: &S3Config) -> Result<Self> {
        let backend = S3Backend::new(config).await?;
        Ok(Self::new(Arc::new(backend), config.public_base_url.clone()))
    }

    fn normalize_key(key: &str) -> &str {
        key.strip_prefix('/').unwrap_or(key)
    }

    pub async fn put(&self, key: &str, body: Bytes, content_type: &str) -> Result<()> {
        self.backend
            .put(Self::normalize_key(key), body, content_type)
            .await
    }

    /// Atomic batch upload with bounded fan-out. Either every file lands or
    /// none remain; the error carries the index of the first failure.
    pub async fn put_multiple(&self, files: Vec<UploadFile>, concurrency: usize) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }
        let concurrency = concurrency.max(1);
        let mut queue = files.into_iter().enumerate();
        let mut in_flight: JoinSet<(usize, String, Result<()>)> = JoinSet::new();
        let mut uploaded: Vec<String> = Vec::new();
        let mut failure: Option<(usize, AppError)> = None;

        loop {
            while failure.is_none() && in_flight.len() < concurrency {
                let Some((index, file)) = queue.next() else {
                    break;
                };
                let backend = Arc::clone(&self.backend);
                let key = Self::normalize_key(&file.key).to_string();
                in_flight.spawn(async move {
                    let result = backend.put(&key, file.body, file.content_type).await;
                    (index, key, result)
                });
            }

            match in_flight.join_next().await {
                Some(Ok((_, key, Ok(())))) => uploaded.push(key),
                Some(Ok((index, _, Err(e)))) => {
                    if failure.is_none() {
                        failure = Some((index, e));
                    }
                }
                Some(Err(join_error)) => {
                    if failure.is_none() {
                        failure = Some((
                            0,
                            AppError::Internal(format!("upload task panicked: {join_error}")),
                        ));
                    }
                }
                None => break,
            }
        }

        if let Some((index, cause)) = failure {
            for key in &uploaded {
                if let Err(e) = self.backend.delete(key).await {
                    warn!(key = %key, error = %e, "batch rollback delete failed");
                }
            }
            return Err(AppError::ObjectStoreBatch {
                index,
                source: Box::new(cause),
            });
        }
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.backend.delete(Self::normalize_key(key)).await
    }

    /// `{publicBaseUrl}/{key}` with slashes normalized, or the bare key
    /// when no base is configured.
    pub fn public_url(&self, key: &str) -> String {
        let key = key.trim_start_matches('/');
        match &self.public_base_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), key),
            None => key.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct MemoryBackend {
        objects: Mutex<HashMap<String, Bytes>>,
        fail_key: Option<String>,
    }

    impl MemoryBackend {
        fn failing_on(key: &str) -> Self {
            Self {
                objects: Mutex::new(HashMap::new()),
                fail_key: Some(key.to_string()),
            }
        }

        async fn len(&self) -> usize {
            self.objects.lock().await.len()
        }
    }

    #[async_trait]
    impl BlobBackend for MemoryBackend {
        async fn put(&self, key: &str, body: Bytes, _content_type: &str) -> Result<()> {
            if self.fail_key.as_deref() == Some(key) {
                return Err(AppError::ObjectStore(format!("injected failure on {key}")));
            }
            self.objects.lock().await.insert(key.to_string(), body);
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.objects.lock().await.remove(key);
            Ok(())
        }
    }

    fn batch(keys: &[&str]) -> Vec<UploadFile> {
        keys.iter()
            .map(|key| UploadFile {
                key: key.to_string(),
                body: Bytes::from_static(b"data"),
                content_type: "image/jpeg",
            })
            .collect()
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let store = ObjectStore::new(Arc::new(MemoryBackend::default()), None);
        store.put_multiple(Vec::new(), 5).await.unwrap();
    }

    #[tokio::test]
    async fn successful_batch_lands_every_file() {
        let backend = Arc::new(MemoryBackend::default());
        let store = ObjectStore::new(backend.clone(), None);
        store
            .put_multiple(batch(&["a/1.jpg", "a/2.jpg", "a/3.jpg"]), 2)
            .await
            .unwrap();
        assert_eq!(backend.len().await, 3);
    }

    #[tokio::test]
    async fn failed_batch_rolls_back_completed_uploads() {
        let backend = Arc::new(MemoryBackend::failing_on("a/3.jpg"));
        let store = ObjectStore::new(backend.clone(), None);
        let err = store
            .put_multiple(batch(&["a/1.jpg", "a/2.jpg", "a/3.jpg", "a/4.jpg", "a/5.jpg"]), 2)
            .await
            .unwrap_err();
        match err {
            AppError::ObjectStoreBatch { index, .. } => assert_eq!(index, 2),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(backend.len().await, 0);
    }

    #[tokio::test]
    async fn leading_slash_is_stripped_once() {
        let backend = Arc::new(MemoryBackend::default());
        let store = ObjectStore::new(backend.clone(), None);
        store
            .put("/p/1/t.jpg", Bytes::from_static(b"x"), "image/jpeg")
            .await
            .unwrap();
        assert!(backend.objects.lock().await.contains_key("p/1/t.jpg"));
    }

    #[test]
    fn public_url_normalizes_slashes() {
        let store = ObjectStore::new(
            Arc::new(MemoryBackend::default()),
            Some("https://cdn.example.com/".to_string()),
        );
        assert_eq!(
            store.public_url("/p/1/t.jpg"),
            "https://cdn.example.com/p/1/t.jpg"
        );

        let bare = ObjectStore::new(Arc::new(MemoryBackend::default()), None);
        assert_eq!(bare.public_url("p/1/t.jpg"), "p/1/t.jpg");
    }
}

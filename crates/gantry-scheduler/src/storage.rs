//! S3-compatible log store, connected on first use.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use gantry_config::StorageConfig;
use gantry_core::artifact::LogStore;
use gantry_core::{Error, Result};
use object_store::aws::AmazonS3Builder;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use tokio::sync::OnceCell;
use tracing::info;

pub struct ObjectLogStore {
    config: StorageConfig,
    store: OnceCell<Arc<dyn ObjectStore>>,
}

impl ObjectLogStore {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            store: OnceCell::new(),
        }
    }

    async fn store(&self) -> Result<&Arc<dyn ObjectStore>> {
        self.store.get_or_try_init(|| async { self.connect() }).await
    }

    fn connect(&self) -> Result<Arc<dyn ObjectStore>> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&self.config.bucket)
            .with_region(&self.config.region);
        if let Some(endpoint) = &self.config.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"))
                .with_virtual_hosted_style_request(false);
        }
        if let Some(key) = &self.config.access_key {
            builder = builder.with_access_key_id(key);
        }
        if let Some(secret) = &self.config.secret_access_key {
            builder = builder.with_secret_access_key(secret);
        }

        let store = builder.build().map_err(storage_error)?;
        info!(bucket = %self.config.bucket, "object store connected");
        Ok(Arc::new(store))
    }
}

fn storage_error(e: object_store::Error) -> Error {
    match e {
        object_store::Error::NotFound { path, .. } => Error::NotFound(path),
        e => Error::ExternalService(e.to_string()),
    }
}

#[async_trait]
impl LogStore for ObjectLogStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.store()
            .await?
            .put(&Path::from(key), PutPayload::from(data))
            .await
            .map_err(storage_error)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let result = self
            .store()
            .await?
            .get(&Path::from(key))
            .await
            .map_err(storage_error)?;
        result.bytes().await.map_err(storage_error)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match self.store().await?.delete(&Path::from(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(storage_error(e)),
        }
    }
}

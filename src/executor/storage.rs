use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use object_store::gcp::{GoogleCloudStorage, GoogleCloudStorageBuilder};
use object_store::path::Path;
use object_store::signer::Signer;
use object_store::ObjectStore;
use tracing::debug;

use crate::config::DriverConfig;
use crate::error::{DriverError, Result};
use crate::remote::{ExportStorage, StoredObject};

/// Export bucket on Google Cloud Storage.
#[derive(Debug)]
pub struct GcsExportStorage {
    store: GoogleCloudStorage,
    bucket: String,
}

impl GcsExportStorage {
    /// `None` when the configuration names no export bucket.
    pub fn from_config(config: &DriverConfig) -> Result<Option<Self>> {
        let Some(bucket) = config.export_bucket.clone() else {
            return Ok(None);
        };

        let mut builder = GoogleCloudStorageBuilder::from_env().with_bucket_name(&bucket);
        if let Some(json) = config.decoded_credentials()? {
            builder = builder.with_service_account_key(json);
        } else if let Some(path) = &config.key_file {
            builder = builder.with_service_account_path(path);
        }

        let store = builder
            .build()
            .map_err(|e| DriverError::Configuration(format!("Export bucket '{}': {}", bucket, e)))?;
        Ok(Some(Self { store, bucket }))
    }
}

#[async_trait]
impl ExportStorage for GcsExportStorage {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<StoredObject>> {
        let objects = list_under(&self.store, prefix).await?;
        debug!(bucket = %self.bucket, prefix, count = objects.len(), "Listed export objects");
        Ok(objects)
    }

    async fn signed_read_url(&self, object: &StoredObject, ttl: Duration) -> Result<String> {
        let url = self
            .store
            .signed_url(http::Method::GET, &object_path(&object.name)?, ttl)
            .await?;
        Ok(url.to_string())
    }
}

/// Object names are taken verbatim. `Path::from` would percent-encode
/// characters such as `%` or non-ASCII letters a second time.
fn object_path(name: &str) -> Result<Path> {
    Path::parse(name).map_err(|e| DriverError::Storage(e.into()))
}

async fn list_under(store: &dyn ObjectStore, prefix: &str) -> Result<Vec<StoredObject>> {
    let prefix = object_path(prefix)?;
    let objects: Vec<_> = store.list(Some(&prefix)).try_collect().await?;

    Ok(objects
        .into_iter()
        .map(|meta| StoredObject {
            name: meta.location.as_ref().to_string(),
            size: Some(meta.size as u64),
        })
        .collect())
}

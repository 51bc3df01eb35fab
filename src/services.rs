//! Wiring of the store, pipelines and object storage from configuration.

use std::sync::Arc;

use anyhow::Result;
use tracing::warn;

use dossier_core::store::Store;

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::pipeline::{HttpPipelines, Pipelines};
use crate::sqlite_store::SqliteStore;
use crate::storage::{ObjectStorage, S3Storage};
use crate::upload::UploadCoordinator;

/// Backends shared by the server and the CLI.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn Store>,
    pub pipelines: Arc<dyn Pipelines>,
    pub storage: Option<Arc<dyn ObjectStorage>>,
}

impl Services {
    /// Open the database (creating tables if needed), the pipeline client,
    /// and S3 storage when `[storage]` is configured.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::migrate_pool(&pool).await?;

        // Missing credentials only matter to commands that store files.
        let storage: Option<Arc<dyn ObjectStorage>> = match config.storage {
            Some(ref storage) => match S3Storage::from_config(storage) {
                Ok(s3) => Some(Arc::new(s3)),
                Err(e) => {
                    warn!(error = %e, "object storage disabled");
                    None
                }
            },
            None => None,
        };

        Ok(Self {
            store: Arc::new(SqliteStore::new(pool)),
            pipelines: Arc::new(HttpPipelines::new(&config.pipelines)?),
            storage,
        })
    }

    pub fn with_storage(mut self, storage: Arc<dyn ObjectStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn coordinator(&self, config: &Config) -> UploadCoordinator {
        UploadCoordinator::new(
            self.store.clone(),
            self.storage.clone(),
            self.pipelines.clone(),
            config.upload.clone(),
        )
    }
}

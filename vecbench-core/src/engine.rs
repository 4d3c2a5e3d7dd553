use std::time::Instant;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{CollectionParams, ConnectionParams, SearchParams, UploadParams};
use crate::dataset::{DatasetConfig, QueryStream, RecordStream};
use crate::error::{Error, Result};
use crate::metrics::{LatencyRecorder, SearchStats, UploadStats};
use crate::types::{Distance, Params, Query, Record, SearchHit};

/// Knobs a configurator hands to the dataset reader before upload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionParams {
    /// L2-normalise vectors before they reach the engine
    #[serde(default)]
    pub normalize: bool,
}

/// Prepares an engine's index for a dataset
#[async_trait]
pub trait Configurator: Send + Sync {
    /// Engine family name
    fn name(&self) -> &str;

    /// Parameters the index is created with
    fn collection_params(&self) -> &CollectionParams;

    fn execution_params(&self, _distance: Distance, _vector_size: usize) -> ExecutionParams {
        ExecutionParams::default()
    }

    /// Remove any index state left by a previous run
    async fn clean(&mut self) -> Result<()>;

    /// Create the index for `dataset`
    async fn recreate(&mut self, dataset: &DatasetConfig) -> Result<()>;

    /// Clean, then recreate. A failed clean is expected on a fresh engine and is only logged.
    async fn configure(&mut self, dataset: &DatasetConfig) -> Result<()> {
        if let Err(e) = self.clean().await {
            warn!(engine = self.name(), error = %e, "Clean failed, continuing");
        }
        self.recreate(dataset).await
    }

    /// Release held connections; must be safe to call at any time
    async fn delete_client(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Loads records into an engine
#[async_trait]
pub trait Uploader: Send + Sync {
    fn name(&self) -> &str;

    /// One-time client setup before `upload`
    async fn init_client(
        &mut self,
        host: &str,
        distance: Distance,
        connection_params: &ConnectionParams,
        upload_params: &UploadParams,
    ) -> Result<()>;

    /// Parameters passed to the last `init_client`
    fn upload_params(&self) -> &UploadParams;

    /// Write one batch of records
    async fn upload_batch(&self, batch: Vec<Record>) -> Result<()>;

    /// Wait for the engine to finish indexing, reporting whatever it exposes
    async fn post_upload(&self, _distance: Distance) -> Result<Params> {
        Ok(Params::new())
    }

    /// Best-effort memory telemetry
    async fn get_memory_usage(&self) -> Result<Params> {
        Ok(Params::new())
    }

    /// Upload a lazy stream of records in batches, then run the post-upload barrier
    async fn upload(&self, distance: Distance, records: RecordStream) -> Result<UploadStats> {
        let params = self.upload_params();
        let batch_size = params.batch_size.max(1);
        let parallel = params.parallel.max(1);
        let start = Instant::now();

        let record_count = records
            .try_chunks(batch_size)
            .map_err(|e| e.1)
            .map_ok(|batch| async move {
                let len = batch.len();
                self.upload_batch(batch).await?;
                debug!(engine = self.name(), records = len, "Uploaded batch");
                Ok::<_, Error>(len)
            })
            .try_buffer_unordered(parallel)
            .try_fold(0usize, |total, len| async move { Ok(total + len) })
            .await?;
        let upload_time = start.elapsed().as_secs_f64();

        let post_upload = self.post_upload(distance).await?;
        let total_time = start.elapsed().as_secs_f64();

        let memory_usage = match self.get_memory_usage().await {
            Ok(usage) => usage,
            Err(e) => {
                warn!(engine = self.name(), error = %e, "Memory usage unavailable");
                Params::new()
            }
        };

        Ok(UploadStats {
            record_count,
            upload_time,
            total_time,
            post_upload,
            memory_usage,
        })
    }

    async fn delete_client(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Runs queries for one search configuration
#[async_trait]
pub trait Searcher: Send + Sync {
    fn name(&self) -> &str;

    /// One-time client setup before `search_all`
    async fn init_client(
        &mut self,
        host: &str,
        distance: Distance,
        connection_params: &ConnectionParams,
        search_params: &SearchParams,
    ) -> Result<()>;

    /// Parameters passed to the last `init_client`
    fn search_params(&self) -> &SearchParams;

    /// Execute a single query, returning at most `top` hits ordered by relevance
    async fn search_one(&self, _query: &Query, _top: usize) -> Result<Vec<SearchHit>> {
        Err(Error::Unsupported(format!(
            "Engine '{}' does not support single-query search",
            self.name()
        )))
    }

    /// Run every query, keeping up to `parallel` in flight
    async fn search_all(&self, _distance: Distance, queries: QueryStream) -> Result<SearchStats> {
        let params = self.search_params();
        let parallel = params.parallel.max(1);
        let top = params.top;

        let recorder = LatencyRecorder::new()?;
        let recorder = queries
            .map_ok(|query| async move {
                let start = Instant::now();
                let hits = self.search_one(&query, top).await?;
                debug!(hits = hits.len(), "Query finished");
                Ok::<_, Error>(start.elapsed())
            })
            .try_buffer_unordered(parallel)
            .try_fold(recorder, |mut recorder, latency| async move {
                recorder.record(latency);
                Ok(recorder)
            })
            .await?;

        Ok(recorder.finish(parallel))
    }

    async fn delete_client(&mut self) -> Result<()> {
        Ok(())
    }
}

/// The adapters driving one experiment
pub struct EngineClients {
    pub configurator: Box<dyn Configurator>,
    pub uploader: Box<dyn Uploader>,
    /// One searcher per search configuration, in configuration order
    pub searchers: Vec<Box<dyn Searcher>>,
}

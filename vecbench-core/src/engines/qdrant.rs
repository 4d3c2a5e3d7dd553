use std::time::Duration;

use async_trait::async_trait;
use qdrant_client::qdrant::point_id::PointIdOptions;
use qdrant_client::qdrant::{
    CollectionStatus, CreateCollectionBuilder, CreateFieldIndexCollectionBuilder,
    Distance as QdrantDistance, FieldType as QdrantFieldType, HnswConfigDiffBuilder, PointId,
    PointStruct, SearchParamsBuilder, SearchPointsBuilder, UpsertPointsBuilder,
    VectorParamsBuilder,
};
use qdrant_client::{Payload, Qdrant};
use tracing::{debug, info};

use crate::config::{CollectionParams, ConnectionParams, ExperimentConfig, SearchParams, UploadParams};
use crate::dataset::{DatasetConfig, FieldType, VectorKind};
use crate::engine::{Configurator, EngineClients, Searcher, Uploader};
use crate::error::{Error, Result};
use crate::types::{Distance, Params, Query, Record, SearchHit};

use super::port_from;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QdrantSettings {
    pub port: u16,
    pub api_key: Option<String>,
    pub collection_name: String,
}

impl QdrantSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            port: port_from(&lookup, "QDRANT_PORT", 6334)?,
            api_key: lookup("QDRANT_API_KEY"),
            collection_name: lookup("QDRANT_COLLECTION_NAME")
                .unwrap_or_else(|| "benchmark".to_string()),
        })
    }

    fn url(&self, host: &str) -> String {
        format!("http://{}:{}", host, self.port)
    }
}

fn connect(settings: &QdrantSettings, host: &str, connection_params: &ConnectionParams) -> Result<Qdrant> {
    let mut builder = Qdrant::from_url(&settings.url(host));

    if let Some(key) = &settings.api_key {
        builder = builder.api_key(key.clone());
    }
    if let Some(secs) = connection_params.timeout_secs {
        builder = builder.timeout(Duration::from_secs(secs));
    }

    let client = builder
        .build()
        .map_err(|e| Error::Connection(e.to_string()))?;
    debug!(host, port = settings.port, "Created Qdrant client");
    Ok(client)
}

fn distance(distance: Distance) -> QdrantDistance {
    match distance {
        Distance::L2 => QdrantDistance::Euclid,
        Distance::Cosine => QdrantDistance::Cosine,
        Distance::Dot => QdrantDistance::Dot,
    }
}

fn field_type(field_type: FieldType) -> QdrantFieldType {
    match field_type {
        FieldType::Int => QdrantFieldType::Integer,
        FieldType::Float => QdrantFieldType::Float,
        FieldType::Keyword => QdrantFieldType::Keyword,
        FieldType::Text => QdrantFieldType::Text,
        FieldType::Geo => QdrantFieldType::Geo,
    }
}

fn point_id(id: Option<PointId>) -> Result<u64> {
    match id.and_then(|id| id.point_id_options) {
        Some(PointIdOptions::Num(n)) => Ok(n),
        Some(PointIdOptions::Uuid(s)) => Err(Error::InvalidResponse(format!(
            "Expected a numeric point id, got '{}'",
            s
        ))),
        None => Err(Error::InvalidResponse("Point without id".into())),
    }
}

fn point(record: Record) -> Result<PointStruct> {
    let payload = match record.metadata {
        Some(metadata) => Payload::try_from(serde_json::Value::Object(metadata))
            .map_err(|e| Error::Config(format!("Invalid payload for point {}: {}", record.id, e)))?,
        None => Payload::new(),
    };
    Ok(PointStruct::new(record.id, record.vector, payload))
}

pub struct QdrantConfigurator {
    host: String,
    settings: QdrantSettings,
    collection_params: CollectionParams,
    connection_params: ConnectionParams,
    client: Option<Qdrant>,
}

impl QdrantConfigurator {
    pub fn with_settings(
        host: impl Into<String>,
        collection_params: CollectionParams,
        connection_params: ConnectionParams,
        settings: QdrantSettings,
    ) -> Self {
        Self {
            host: host.into(),
            settings,
            collection_params,
            connection_params,
            client: None,
        }
    }

    fn client(&mut self) -> Result<&Qdrant> {
        if self.client.is_none() {
            self.client = Some(connect(&self.settings, &self.host, &self.connection_params)?);
        }
        self.client.as_ref().ok_or(Error::NotConnected)
    }
}

#[async_trait]
impl Configurator for QdrantConfigurator {
    fn name(&self) -> &str {
        "qdrant"
    }

    fn collection_params(&self) -> &CollectionParams {
        &self.collection_params
    }

    async fn clean(&mut self) -> Result<()> {
        let collection = self.settings.collection_name.clone();
        self.client()?
            .delete_collection(collection)
            .await
            .map_err(|e| Error::QueryExecution(e.to_string()))?;
        Ok(())
    }

    async fn recreate(&mut self, dataset: &DatasetConfig) -> Result<()> {
        if dataset.kind == VectorKind::Sparse {
            return Err(Error::Unsupported(
                "Sparse collections are not supported for Qdrant".into(),
            ));
        }

        let collection = self.settings.collection_name.clone();
        let mut hnsw = HnswConfigDiffBuilder::default();
        if let Some(config) = &self.collection_params.hnsw_config {
            if let Some(m) = config.m {
                hnsw = hnsw.m(m);
            }
            if let Some(ef) = config.ef_construction {
                hnsw = hnsw.ef_construct(ef);
            }
        }

        let create = CreateCollectionBuilder::new(collection.clone())
            .vectors_config(VectorParamsBuilder::new(
                dataset.vector_size as u64,
                distance(dataset.distance),
            ))
            .hnsw_config(hnsw);

        let schema = dataset.schema.clone();
        let client = self.client()?;
        client
            .create_collection(create)
            .await
            .map_err(|e| Error::QueryExecution(e.to_string()))?;

        for (field, kind) in schema {
            client
                .create_field_index(CreateFieldIndexCollectionBuilder::new(
                    collection.clone(),
                    field,
                    field_type(kind),
                ))
                .await
                .map_err(|e| Error::QueryExecution(e.to_string()))?;
        }

        info!(collection = %collection, "Created Qdrant collection");
        Ok(())
    }

    async fn delete_client(&mut self) -> Result<()> {
        self.client = None;
        Ok(())
    }
}

pub struct QdrantUploader {
    settings: QdrantSettings,
    upload_params: UploadParams,
    client: Option<Qdrant>,
}

impl QdrantUploader {
    pub fn with_settings(settings: QdrantSettings) -> Self {
        Self {
            settings,
            upload_params: UploadParams::default(),
            client: None,
        }
    }

    fn client(&self) -> Result<&Qdrant> {
        self.client.as_ref().ok_or(Error::NotConnected)
    }
}

#[async_trait]
impl Uploader for QdrantUploader {
    fn name(&self) -> &str {
        "qdrant"
    }

    async fn init_client(
        &mut self,
        host: &str,
        _distance: Distance,
        connection_params: &ConnectionParams,
        upload_params: &UploadParams,
    ) -> Result<()> {
        self.client = Some(connect(&self.settings, host, connection_params)?);
        self.upload_params = upload_params.clone();
        Ok(())
    }

    fn upload_params(&self) -> &UploadParams {
        &self.upload_params
    }

    async fn upload_batch(&self, batch: Vec<Record>) -> Result<()> {
        let points = batch.into_iter().map(point).collect::<Result<Vec<_>>>()?;
        self.client()?
            .upsert_points(
                UpsertPointsBuilder::new(self.settings.collection_name.clone(), points).wait(true),
            )
            .await
            .map_err(|e| Error::QueryExecution(e.to_string()))?;
        Ok(())
    }

    /// Waits for the optimizers to settle (collection status green)
    async fn post_upload(&self, _distance: Distance) -> Result<Params> {
        let client = self.client()?;
        loop {
            let info = client
                .collection_info(self.settings.collection_name.clone())
                .await
                .map_err(|e| Error::QueryExecution(e.to_string()))?;
            let status = info.result.map(|r| r.status);
            if status == Some(CollectionStatus::Green as i32) {
                return Ok(Params::new());
            }
            info!(status = ?status, "Waiting for collection to be fully indexed");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    async fn delete_client(&mut self) -> Result<()> {
        self.client = None;
        Ok(())
    }
}

pub struct QdrantSearcher {
    settings: QdrantSettings,
    search_params: SearchParams,
    client: Option<Qdrant>,
}

impl QdrantSearcher {
    pub fn with_settings(settings: QdrantSettings) -> Self {
        Self {
            settings,
            search_params: SearchParams::default(),
            client: None,
        }
    }
}

#[async_trait]
impl Searcher for QdrantSearcher {
    fn name(&self) -> &str {
        "qdrant"
    }

    async fn init_client(
        &mut self,
        host: &str,
        _distance: Distance,
        connection_params: &ConnectionParams,
        search_params: &SearchParams,
    ) -> Result<()> {
        self.client = Some(connect(&self.settings, host, connection_params)?);
        self.search_params = search_params.clone();
        Ok(())
    }

    fn search_params(&self) -> &SearchParams {
        &self.search_params
    }

    async fn search_one(&self, query: &Query, top: usize) -> Result<Vec<SearchHit>> {
        let client = self.client.as_ref().ok_or(Error::NotConnected)?;

        let mut search = SearchPointsBuilder::new(
            self.settings.collection_name.clone(),
            query.vector.clone(),
            top as u64,
        );
        if let Some(ef) = self.search_params.ef() {
            search = search.params(SearchParamsBuilder::default().hnsw_ef(ef));
        }

        let response = client
            .search_points(search)
            .await
            .map_err(|e| Error::QueryExecution(e.to_string()))?;

        response
            .result
            .into_iter()
            .map(|point| Ok(SearchHit::new(point_id(point.id)?, point.score)))
            .collect()
    }

    async fn delete_client(&mut self) -> Result<()> {
        self.client = None;
        Ok(())
    }
}

pub fn clients(config: &ExperimentConfig) -> Result<EngineClients> {
    let settings = QdrantSettings::from_env()?;

    Ok(EngineClients {
        configurator: Box::new(QdrantConfigurator::with_settings(
            config.host.clone(),
            config.collection_params.clone(),
            config.connection_params.clone(),
            settings.clone(),
        )),
        uploader: Box::new(QdrantUploader::with_settings(settings.clone())),
        searchers: config
            .search_params
            .iter()
            .map(|_| Box::new(QdrantSearcher::with_settings(settings.clone())) as Box<dyn Searcher>)
            .collect(),
    })
}

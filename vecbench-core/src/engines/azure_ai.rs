//! Azure AI Search adapter over the REST API.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::config::{CollectionParams, ConnectionParams, ExperimentConfig, SearchParams, UploadParams};
use crate::dataset::{DatasetConfig, VectorKind};
use crate::engine::{Configurator, EngineClients, Searcher, Uploader};
use crate::error::{Error, Result};
use crate::types::{Distance, Params, Query, Record, SearchHit};

const KEY_FIELD: &str = "Id";
const VECTOR_FIELD: &str = "VectorField";
const ALGORITHM_NAME: &str = "simple-hnsw-config";
const PROFILE_NAME: &str = "simple-vector-profile";

const DEFAULT_M: u64 = 4;
const DEFAULT_EF_CONSTRUCTION: u64 = 100;
const DEFAULT_EF_SEARCH: u64 = 100;

/// Service coordinates and credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzureAiSettings {
    /// Base URL of the search service, without trailing slash
    pub endpoint: String,
    pub api_key: String,
    pub index_name: String,
    pub api_version: String,
}

impl AzureAiSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let api_key = lookup("AZUREAI_API_KEY").ok_or_else(|| {
            Error::Config(
                "An api key is required to use Azure AI Search. Specify it via AZUREAI_API_KEY=..."
                    .into(),
            )
        })?;
        let service = lookup("AZUREAI_SERVICE_NAME").unwrap_or_else(|| "vecsim-s2".to_string());

        Ok(Self {
            endpoint: format!("https://{}.search.windows.net", service),
            api_key,
            index_name: lookup("AZUREAI_INDEX_NAME").unwrap_or_else(|| "idx".to_string()),
            api_version: lookup("AZUREAI_API_VERSION").unwrap_or_else(|| "2023-11-01".to_string()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct IndexList {
    #[serde(default)]
    value: Vec<IndexName>,
}

#[derive(Debug, Deserialize)]
struct IndexName {
    name: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    value: Vec<SearchDocument>,
}

#[derive(Debug, Deserialize)]
struct SearchDocument {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "@search.score", default)]
    score: f32,
}

/// Thin REST client for one search service
#[derive(Debug, Clone)]
pub struct AzureAiClient {
    http: reqwest::Client,
    settings: AzureAiSettings,
}

impl AzureAiClient {
    pub fn new(settings: AzureAiSettings, connection_params: &ConnectionParams) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(secs) = connection_params.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let http = builder
            .build()
            .map_err(|e| Error::Connection(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { http, settings })
    }

    pub fn settings(&self) -> &AzureAiSettings {
        &self.settings
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}{}?api-version={}",
            self.settings.endpoint.trim_end_matches('/'),
            path,
            self.settings.api_version
        )
    }

    fn index_path(&self, suffix: &str) -> String {
        format!("/indexes/{}{}", self.settings.index_name, suffix)
    }

    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
        accepted: &[StatusCode],
    ) -> Result<reqwest::Response> {
        let url = self.url(path);
        debug!(method = %method, url = %url, "Azure AI request");

        let mut request = self
            .http
            .request(method, &url)
            .header("api-key", &self.settings.api_key);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        let status = response.status();
        if accepted.contains(&status) {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Error::Transport {
                status: status.as_u16(),
                body,
            })
        }
    }

    async fn json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        response
            .json()
            .await
            .map_err(|e| Error::InvalidResponse(e.to_string()))
    }

    pub async fn list_indices(&self) -> Result<Vec<String>> {
        let response = self
            .send(reqwest::Method::GET, "/indexes", None, &[StatusCode::OK])
            .await?;
        let list: IndexList = Self::json(response).await?;
        Ok(list.value.into_iter().map(|index| index.name).collect())
    }

    pub async fn delete_index(&self) -> Result<()> {
        self.send(
            reqwest::Method::DELETE,
            &self.index_path(""),
            None,
            &[StatusCode::OK, StatusCode::NO_CONTENT],
        )
        .await?;
        Ok(())
    }

    pub async fn create_index(&self, definition: &Value) -> Result<()> {
        self.send(
            reqwest::Method::POST,
            "/indexes",
            Some(definition),
            &[StatusCode::CREATED],
        )
        .await?;
        Ok(())
    }

    pub async fn add_docs(&self, docs: &Value) -> Result<()> {
        self.send(
            reqwest::Method::POST,
            &self.index_path("/docs/index"),
            Some(docs),
            &[StatusCode::OK],
        )
        .await?;
        Ok(())
    }

    pub async fn search(&self, body: &Value) -> Result<Vec<SearchHit>> {
        let response = self
            .send(
                reqwest::Method::POST,
                &self.index_path("/docs/search"),
                Some(body),
                &[StatusCode::OK],
            )
            .await?;
        let results: SearchResponse = Self::json(response).await?;

        results
            .value
            .into_iter()
            .map(|doc| {
                let id = doc.id.parse::<u64>().map_err(|_| {
                    Error::InvalidResponse(format!("Non-numeric document id '{}'", doc.id))
                })?;
                Ok(SearchHit::new(id, doc.score))
            })
            .collect()
    }

    /// Raw index statistics (`documentCount`, `storageSize`, `vectorIndexSize`)
    pub async fn index_stats(&self) -> Result<Params> {
        let response = self
            .send(
                reqwest::Method::GET,
                &self.index_path("/stats"),
                None,
                &[StatusCode::OK],
            )
            .await?;
        Self::json(response).await
    }
}

fn metric(distance: Distance) -> &'static str {
    match distance {
        Distance::L2 => "euclidean",
        Distance::Dot => "dotProduct",
        Distance::Cosine => "cosine",
    }
}

/// Index definition with a string key field and one HNSW vector field
fn index_definition(index_name: &str, dataset: &DatasetConfig, collection_params: &CollectionParams) -> Value {
    let hnsw = collection_params.hnsw_config.clone().unwrap_or_default();

    json!({
        "name": index_name,
        "fields": [
            {
                "name": KEY_FIELD,
                "type": "Edm.String",
                "key": true,
                "searchable": false,
                "filterable": true,
                "retrievable": true,
                "sortable": false,
                "facetable": false,
            },
            {
                "name": VECTOR_FIELD,
                "type": "Collection(Edm.Single)",
                "searchable": true,
                "retrievable": true,
                "dimensions": dataset.vector_size,
                "vectorSearchProfile": PROFILE_NAME,
            },
        ],
        "vectorSearch": {
            "algorithms": [
                {
                    "name": ALGORITHM_NAME,
                    "kind": "hnsw",
                    "hnswParameters": {
                        "m": hnsw.m.unwrap_or(DEFAULT_M),
                        "efConstruction": hnsw.ef_construction.unwrap_or(DEFAULT_EF_CONSTRUCTION),
                        "efSearch": hnsw.ef_search.unwrap_or(DEFAULT_EF_SEARCH),
                        "metric": metric(dataset.distance),
                    },
                }
            ],
            "profiles": [
                { "name": PROFILE_NAME, "algorithm": ALGORITHM_NAME }
            ],
        },
    })
}

fn upload_body(batch: &[Record]) -> Value {
    let docs: Vec<Value> = batch
        .iter()
        .map(|record| {
            json!({
                "@search.action": "mergeOrUpload",
                KEY_FIELD: record.id.to_string(),
                VECTOR_FIELD: record.vector,
            })
        })
        .collect();
    json!({ "value": docs })
}

fn search_body(query: &Query, top: usize) -> Value {
    json!({
        "count": false,
        "select": KEY_FIELD,
        "top": top,
        "vectorQueries": [
            {
                "kind": "vector",
                "vector": query.vector,
                "fields": VECTOR_FIELD,
                "k": top,
            }
        ],
    })
}

pub struct AzureAiConfigurator {
    client: AzureAiClient,
    collection_params: CollectionParams,
}

impl AzureAiConfigurator {
    pub fn new(collection_params: CollectionParams, connection_params: &ConnectionParams) -> Result<Self> {
        Self::with_settings(AzureAiSettings::from_env()?, collection_params, connection_params)
    }

    pub fn with_settings(
        settings: AzureAiSettings,
        collection_params: CollectionParams,
        connection_params: &ConnectionParams,
    ) -> Result<Self> {
        Ok(Self {
            client: AzureAiClient::new(settings, connection_params)?,
            collection_params,
        })
    }
}

#[async_trait]
impl Configurator for AzureAiConfigurator {
    fn name(&self) -> &str {
        "azure_ai"
    }

    fn collection_params(&self) -> &CollectionParams {
        &self.collection_params
    }

    async fn clean(&mut self) -> Result<()> {
        let indices = self.client.list_indices().await?;
        debug!(count = indices.len(), "Listed existing indices");

        let index_name = &self.client.settings().index_name;
        if indices.iter().any(|name| name == index_name) {
            info!(index = %index_name, "Deleting existing index");
            self.client.delete_index().await?;
        }
        Ok(())
    }

    async fn recreate(&mut self, dataset: &DatasetConfig) -> Result<()> {
        if dataset.kind == VectorKind::Sparse {
            return Err(Error::Unsupported(
                "Azure AI Search does not support sparse vectors".into(),
            ));
        }

        let definition = index_definition(
            &self.client.settings().index_name,
            dataset,
            &self.collection_params,
        );
        self.client.create_index(&definition).await?;
        info!(index = %self.client.settings().index_name, "Created Azure AI index");
        Ok(())
    }
}

pub struct AzureAiUploader {
    settings: AzureAiSettings,
    client: Option<AzureAiClient>,
    upload_params: UploadParams,
    /// Distinct ids sent; `mergeOrUpload` folds repeats into one document
    uploaded: Mutex<HashSet<u64>>,
}

impl AzureAiUploader {
    pub fn new() -> Result<Self> {
        Ok(Self::with_settings(AzureAiSettings::from_env()?))
    }

    pub fn with_settings(settings: AzureAiSettings) -> Self {
        Self {
            settings,
            client: None,
            upload_params: UploadParams::default(),
            uploaded: Mutex::new(HashSet::new()),
        }
    }

    fn client(&self) -> Result<&AzureAiClient> {
        self.client.as_ref().ok_or(Error::NotConnected)
    }

    fn uploaded_ids(&self) -> MutexGuard<'_, HashSet<u64>> {
        // the set stays consistent even if a holder panicked
        self.uploaded.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Uploader for AzureAiUploader {
    fn name(&self) -> &str {
        "azure_ai"
    }

    async fn init_client(
        &mut self,
        _host: &str,
        _distance: Distance,
        connection_params: &ConnectionParams,
        upload_params: &UploadParams,
    ) -> Result<()> {
        self.client = Some(AzureAiClient::new(self.settings.clone(), connection_params)?);
        self.upload_params = upload_params.clone();
        self.uploaded_ids().clear();
        Ok(())
    }

    fn upload_params(&self) -> &UploadParams {
        &self.upload_params
    }

    async fn upload_batch(&self, batch: Vec<Record>) -> Result<()> {
        self.client()?.add_docs(&upload_body(&batch)).await?;
        self.uploaded_ids().extend(batch.iter().map(|r| r.id));
        Ok(())
    }

    /// Waits until the index reports every uploaded document
    async fn post_upload(&self, _distance: Distance) -> Result<Params> {
        let client = self.client()?;
        let expected = self.uploaded_ids().len() as u64;

        loop {
            let stats = client.index_stats().await?;
            let indexed = stats
                .get("documentCount")
                .and_then(Value::as_u64)
                .unwrap_or_default();
            if indexed >= expected {
                return Ok(Params::new());
            }
            info!(indexed, expected, "Waiting for index to be fully processed");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    async fn get_memory_usage(&self) -> Result<Params> {
        self.client()?.index_stats().await
    }

    async fn delete_client(&mut self) -> Result<()> {
        self.client = None;
        Ok(())
    }
}

pub struct AzureAiSearcher {
    settings: AzureAiSettings,
    client: Option<AzureAiClient>,
    search_params: SearchParams,
}

impl AzureAiSearcher {
    pub fn new() -> Result<Self> {
        Ok(Self::with_settings(AzureAiSettings::from_env()?))
    }

    pub fn with_settings(settings: AzureAiSettings) -> Self {
        Self {
            settings,
            client: None,
            search_params: SearchParams::default(),
        }
    }
}

#[async_trait]
impl Searcher for AzureAiSearcher {
    fn name(&self) -> &str {
        "azure_ai"
    }

    async fn init_client(
        &mut self,
        _host: &str,
        _distance: Distance,
        connection_params: &ConnectionParams,
        search_params: &SearchParams,
    ) -> Result<()> {
        self.client = Some(AzureAiClient::new(self.settings.clone(), connection_params)?);
        self.search_params = search_params.clone();
        Ok(())
    }

    fn search_params(&self) -> &SearchParams {
        &self.search_params
    }

    async fn search_one(&self, query: &Query, top: usize) -> Result<Vec<SearchHit>> {
        let client = self.client.as_ref().ok_or(Error::NotConnected)?;
        client.search(&search_body(query, top)).await
    }

    async fn delete_client(&mut self) -> Result<()> {
        self.client = None;
        Ok(())
    }
}

/// Build the adapters from explicit settings; `host` is not used by this engine
pub fn clients_with_settings(config: &ExperimentConfig, settings: AzureAiSettings) -> Result<EngineClients> {
    Ok(EngineClients {
        configurator: Box::new(AzureAiConfigurator::with_settings(
            settings.clone(),
            config.collection_params.clone(),
            &config.connection_params,
        )?),
        uploader: Box::new(AzureAiUploader::with_settings(settings.clone())),
        searchers: config
            .search_params
            .iter()
            .map(|_| Box::new(AzureAiSearcher::with_settings(settings.clone())) as Box<dyn Searcher>)
            .collect(),
    })
}

pub fn clients(config: &ExperimentConfig) -> Result<EngineClients> {
    clients_with_settings(config, AzureAiSettings::from_env()?)
}

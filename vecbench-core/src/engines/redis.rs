//! RediSearch adapter: HNSW/FLAT vector index over hashes, driven with `FT.*` commands.

use std::collections::BTreeMap;
use std::time::Duration;

use ::redis::aio::{ConnectionLike, MultiplexedConnection};
use ::redis::cluster::ClusterClient;
use ::redis::cluster_async::ClusterConnection;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::{CollectionParams, ConnectionParams, ExperimentConfig, SearchParams, UploadParams};
use crate::dataset::{DatasetConfig, FieldType};
use crate::engine::{Configurator, EngineClients, Searcher, Uploader};
use crate::error::{Error, Result};
use crate::types::{Distance, Params, Query, Record, SearchHit};

use super::port_from;

const VECTOR_FIELD: &str = "vector";
const SCORE_FIELD: &str = "vector_score";
// GEO coordinates Redis accepts
const MAX_LATITUDE: f64 = 85.051_128_78;
const GPU_STATS_PORT: u16 = 5000;

/// Connection settings taken from the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisSettings {
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub index_name: String,
    /// Connect through the cluster protocol instead of a single node
    pub cluster: bool,
    /// Attach `device_info` from a GPU stats endpoint to memory telemetry
    pub gpu_stats: bool,
    /// Overrides `http://<host>:5000/`
    pub gpu_stats_endpoint: Option<String>,
}

impl RedisSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            port: port_from(&lookup, "REDIS_PORT", 6379)?,
            username: lookup("REDIS_USER"),
            password: lookup("REDIS_AUTH"),
            index_name: lookup("REDIS_INDEX_NAME").unwrap_or_else(|| "idx".to_string()),
            cluster: flag_from(&lookup, "REDIS_CLUSTER")?,
            gpu_stats: flag_from(&lookup, "GPU_STATS")?,
            gpu_stats_endpoint: lookup("GPU_STATS_ENDPOINT"),
        })
    }

    fn url(&self, host: &str) -> String {
        let auth = match (&self.username, &self.password) {
            (Some(user), Some(password)) => format!("{}:{}@", user, password),
            (None, Some(password)) => format!(":{}@", password),
            (Some(user), None) => format!("{}@", user),
            (None, None) => String::new(),
        };
        format!("redis://{}{}:{}", auth, host, self.port)
    }

    /// Where to fetch GPU stats from, if enabled
    fn gpu_stats_url(&self, host: &str) -> Option<String> {
        if !self.gpu_stats {
            return None;
        }
        Some(
            self.gpu_stats_endpoint
                .clone()
                .unwrap_or_else(|| format!("http://{}:{}/", host, GPU_STATS_PORT)),
        )
    }
}

fn flag_from(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<bool> {
    match lookup(key).as_deref().map(str::trim) {
        None | Some("") => Ok(false),
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(Error::Config(format!(
                "{} must be a boolean flag, got '{}'",
                key, value
            ))),
        },
    }
}

/// A single-node or cluster connection; both are cheap to clone
#[derive(Clone)]
enum RedisConnection {
    Single(MultiplexedConnection),
    Cluster(ClusterConnection),
}

impl ConnectionLike for RedisConnection {
    fn req_packed_command<'a>(
        &'a mut self,
        cmd: &'a ::redis::Cmd,
    ) -> ::redis::RedisFuture<'a, ::redis::Value> {
        match self {
            RedisConnection::Single(conn) => conn.req_packed_command(cmd),
            RedisConnection::Cluster(conn) => conn.req_packed_command(cmd),
        }
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a ::redis::Pipeline,
        offset: usize,
        count: usize,
    ) -> ::redis::RedisFuture<'a, Vec<::redis::Value>> {
        match self {
            RedisConnection::Single(conn) => conn.req_packed_commands(cmd, offset, count),
            RedisConnection::Cluster(conn) => conn.req_packed_commands(cmd, offset, count),
        }
    }

    fn get_db(&self) -> i64 {
        match self {
            RedisConnection::Single(conn) => conn.get_db(),
            RedisConnection::Cluster(conn) => conn.get_db(),
        }
    }
}

async fn open_connection(settings: &RedisSettings, host: &str) -> Result<RedisConnection> {
    if settings.cluster {
        let mut builder = ClusterClient::builder(vec![format!("redis://{}:{}", host, settings.port)]);
        if let Some(user) = &settings.username {
            builder = builder.username(user.clone());
        }
        if let Some(password) = &settings.password {
            builder = builder.password(password.clone());
        }
        let client = builder
            .build()
            .map_err(|e| Error::Config(format!("Invalid Redis cluster address: {}", e)))?;
        let conn = client
            .get_async_connection()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        Ok(RedisConnection::Cluster(conn))
    } else {
        let client = ::redis::Client::open(settings.url(host))
            .map_err(|e| Error::Config(format!("Invalid Redis address: {}", e)))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        Ok(RedisConnection::Single(conn))
    }
}

async fn connect(
    settings: &RedisSettings,
    host: &str,
    connection_params: &ConnectionParams,
) -> Result<RedisConnection> {
    let conn = match connection_params.timeout_secs {
        Some(secs) => tokio::time::timeout(Duration::from_secs(secs), open_connection(settings, host))
            .await
            .map_err(|_| Error::Connection(format!("Timed out after {}s", secs)))??,
        None => open_connection(settings, host).await?,
    };

    debug!(host, port = settings.port, cluster = settings.cluster, "Connected to Redis");
    Ok(conn)
}

/// GPU telemetry from a stats endpoint; any failure yields an empty map
async fn device_info(url: &str) -> Params {
    let fetched = async {
        let response = reqwest::get(url).await?.error_for_status()?;
        response.json::<Params>().await
    }
    .await;

    match fetched {
        Ok(info) => {
            debug!(url, "Retrieved device info");
            info
        }
        Err(e) => {
            warn!(url, error = %e, "Failed to query GPU stats");
            Params::new()
        }
    }
}

fn distance_metric(distance: Distance) -> &'static str {
    match distance {
        Distance::L2 => "L2",
        Distance::Cosine => "COSINE",
        Distance::Dot => "IP",
    }
}

/// Arguments of `FT.CREATE` after the index name
fn index_schema(dataset: &DatasetConfig, collection_params: &CollectionParams) -> Vec<String> {
    let algorithm = collection_params.algorithm();

    let mut attributes = vec![
        ("TYPE".to_string(), "FLOAT32".to_string()),
        ("DIM".to_string(), dataset.vector_size.to_string()),
        (
            "DISTANCE_METRIC".to_string(),
            distance_metric(dataset.distance).to_string(),
        ),
    ];
    if algorithm == "HNSW" {
        if let Some(hnsw) = &collection_params.hnsw_config {
            let knobs = [
                ("M", hnsw.m),
                ("EF_CONSTRUCTION", hnsw.ef_construction),
                ("EF_RUNTIME", hnsw.ef_search),
            ];
            for (name, value) in knobs {
                if let Some(value) = value {
                    attributes.push((name.to_string(), value.to_string()));
                }
            }
        }
    }

    let mut args: Vec<String> = ["ON", "HASH", "SCHEMA", VECTOR_FIELD, "VECTOR"]
        .into_iter()
        .map(String::from)
        .collect();
    args.push(algorithm);
    args.push((attributes.len() * 2).to_string());
    for (name, value) in attributes {
        args.push(name);
        args.push(value);
    }

    for (field, field_type) in &dataset.schema {
        args.push(field.clone());
        match field_type {
            FieldType::Int | FieldType::Float => args.push("NUMERIC".into()),
            FieldType::Text => args.push("TEXT".into()),
            FieldType::Geo => args.push("GEO".into()),
            FieldType::Keyword => {
                args.extend(["TAG".to_string(), "SEPARATOR".to_string(), ";".to_string()]);
            }
        }
    }
    args
}

fn vector_bytes(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Hash field value for one metadata entry, `None` for values Redis cannot index
fn payload_value(key: &str, value: &serde_json::Value) -> Option<String> {
    use serde_json::Value;

    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(_) | Value::Number(_) => Some(value.to_string()),
        // multi-valued keyword fields are indexed as one TAG
        Value::Array(items) if key == "labels" => Some(
            items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(";"),
        ),
        Value::Array(_) => None,
        Value::Object(map) => {
            let lon = map.get("lon")?.as_f64()?;
            let lat = map.get("lat")?.as_f64()?;
            Some(format!(
                "{},{}",
                lon.clamp(-180.0, 180.0),
                lat.clamp(-MAX_LATITUDE, MAX_LATITUDE)
            ))
        }
    }
}

/// `used_memory` from an `INFO memory` reply; cluster replies are summed per node
fn used_memory(reply: &::redis::Value) -> Option<u64> {
    match reply {
        ::redis::Value::Map(nodes) => nodes.iter().map(|(_, node)| used_memory(node)).sum(),
        other => {
            let text: String = ::redis::from_redis_value(other).ok()?;
            text.lines()
                .find_map(|line| line.strip_prefix("used_memory:"))
                .and_then(|v| v.trim().parse::<u64>().ok())
        }
    }
}

/// `FT.INFO` reply flattened to its scalar fields
async fn index_info(conn: &mut RedisConnection, index: &str) -> Result<BTreeMap<String, String>> {
    let reply: Vec<::redis::Value> = ::redis::cmd("FT.INFO")
        .arg(index)
        .query_async(conn)
        .await
        .map_err(|e| Error::QueryExecution(e.to_string()))?;

    let info = reply
        .chunks(2)
        .filter_map(|pair| match pair {
            [key, value] => {
                let key = ::redis::from_redis_value::<String>(key).ok()?;
                let value = ::redis::from_redis_value::<String>(value).ok()?;
                Some((key, value))
            }
            _ => None,
        })
        .collect();
    Ok(info)
}

pub struct RedisConfigurator {
    host: String,
    collection_params: CollectionParams,
    connection_params: ConnectionParams,
    settings: RedisSettings,
    conn: Option<RedisConnection>,
}

impl RedisConfigurator {
    pub fn new(
        host: impl Into<String>,
        collection_params: CollectionParams,
        connection_params: ConnectionParams,
    ) -> Result<Self> {
        Ok(Self::with_settings(
            host,
            collection_params,
            connection_params,
            RedisSettings::from_env()?,
        ))
    }

    pub fn with_settings(
        host: impl Into<String>,
        collection_params: CollectionParams,
        connection_params: ConnectionParams,
        settings: RedisSettings,
    ) -> Self {
        Self {
            host: host.into(),
            collection_params,
            connection_params,
            settings,
            conn: None,
        }
    }

    async fn connection(&mut self) -> Result<RedisConnection> {
        if self.conn.is_none() {
            self.conn = Some(connect(&self.settings, &self.host, &self.connection_params).await?);
        }
        self.conn.clone().ok_or(Error::NotConnected)
    }
}

#[async_trait]
impl Configurator for RedisConfigurator {
    fn name(&self) -> &str {
        "redis"
    }

    fn collection_params(&self) -> &CollectionParams {
        &self.collection_params
    }

    async fn clean(&mut self) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = ::redis::cmd("FT.DROPINDEX")
            .arg(&self.settings.index_name)
            .arg("DD")
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::QueryExecution(e.to_string()))?;
        Ok(())
    }

    async fn recreate(&mut self, dataset: &DatasetConfig) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = ::redis::cmd("FT.CREATE")
            .arg(&self.settings.index_name)
            .arg(index_schema(dataset, &self.collection_params))
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::QueryExecution(e.to_string()))?;
        info!(index = %self.settings.index_name, "Created Redis index");
        Ok(())
    }

    async fn delete_client(&mut self) -> Result<()> {
        self.conn = None;
        Ok(())
    }
}

pub struct RedisUploader {
    settings: RedisSettings,
    host: String,
    algorithm: String,
    upload_params: UploadParams,
    conn: Option<RedisConnection>,
}

impl RedisUploader {
    pub fn new(collection_params: &CollectionParams) -> Result<Self> {
        Ok(Self::with_settings(collection_params, RedisSettings::from_env()?))
    }

    pub fn with_settings(collection_params: &CollectionParams, settings: RedisSettings) -> Self {
        Self {
            settings,
            host: String::new(),
            algorithm: collection_params.algorithm(),
            upload_params: UploadParams::default(),
            conn: None,
        }
    }

    fn connection(&self) -> Result<RedisConnection> {
        self.conn.clone().ok_or(Error::NotConnected)
    }

    fn reports_indexing(&self) -> bool {
        self.algorithm == "HNSW" || self.algorithm == "FLAT"
    }
}

#[async_trait]
impl Uploader for RedisUploader {
    fn name(&self) -> &str {
        "redis"
    }

    async fn init_client(
        &mut self,
        host: &str,
        _distance: Distance,
        connection_params: &ConnectionParams,
        upload_params: &UploadParams,
    ) -> Result<()> {
        self.conn = Some(connect(&self.settings, host, connection_params).await?);
        self.host = host.to_string();
        self.upload_params = upload_params.clone();
        Ok(())
    }

    fn upload_params(&self) -> &UploadParams {
        &self.upload_params
    }

    async fn upload_batch(&self, batch: Vec<Record>) -> Result<()> {
        let mut conn = self.connection()?;
        let mut pipe = ::redis::pipe();

        for record in batch {
            let mut hset = ::redis::cmd("HSET");
            hset.arg(record.id.to_string())
                .arg(VECTOR_FIELD)
                .arg(vector_bytes(&record.vector));
            for (key, value) in record.metadata.iter().flatten() {
                if let Some(value) = payload_value(key, value) {
                    hset.arg(key).arg(value);
                }
            }
            pipe.add_command(hset).ignore();
        }

        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::QueryExecution(e.to_string()))?;
        Ok(())
    }

    async fn post_upload(&self, _distance: Distance) -> Result<Params> {
        if !self.reports_indexing() {
            debug!(algorithm = %self.algorithm, "Index progress not reported, skipping wait");
            return Ok(Params::new());
        }

        let mut conn = self.connection()?;
        let index = &self.settings.index_name;
        loop {
            let info = index_info(&mut conn, index).await?;
            // RediSearch reports a fraction, MemoryDB a lag
            let percent = info.get("percent_indexed").and_then(|v| v.parse::<f64>().ok());
            let lag = info.get("current_lag").and_then(|v| v.parse::<f64>().ok());

            match (percent, lag) {
                (Some(p), _) if p < 1.0 => {
                    info!(percent_indexed = p * 100.0, "Waiting for index to be fully processed");
                }
                (_, Some(l)) if l > 0.0 => {
                    info!(current_lag = l, "Waiting for index to be fully processed");
                }
                _ => return Ok(Params::new()),
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    async fn get_memory_usage(&self) -> Result<Params> {
        let mut conn = self.connection()?;
        let memory: ::redis::Value = ::redis::cmd("INFO")
            .arg("memory")
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::QueryExecution(e.to_string()))?;

        let mut usage = Params::new();
        if let Some(used) = used_memory(&memory) {
            usage.insert("used_memory".into(), used.into());
        }

        let index: Params = if self.reports_indexing() {
            index_info(&mut conn, &self.settings.index_name)
                .await?
                .into_iter()
                .map(|(k, v)| (k, v.into()))
                .collect()
        } else {
            Params::new()
        };
        usage.insert("index_info".into(), index.into());

        let device = match self.settings.gpu_stats_url(&self.host) {
            Some(url) => device_info(&url).await,
            None => Params::new(),
        };
        usage.insert("device_info".into(), device.into());
        Ok(usage)
    }

    async fn delete_client(&mut self) -> Result<()> {
        self.conn = None;
        Ok(())
    }
}

pub struct RedisSearcher {
    settings: RedisSettings,
    algorithm: String,
    search_params: SearchParams,
    conn: Option<RedisConnection>,
}

impl RedisSearcher {
    pub fn new(collection_params: &CollectionParams) -> Result<Self> {
        Ok(Self::with_settings(collection_params, RedisSettings::from_env()?))
    }

    pub fn with_settings(collection_params: &CollectionParams, settings: RedisSettings) -> Self {
        Self {
            settings,
            algorithm: collection_params.algorithm(),
            search_params: SearchParams::default(),
            conn: None,
        }
    }

    fn knn_query(&self) -> String {
        let ef_runtime = if self.algorithm == "HNSW" && self.search_params.ef().is_some() {
            " EF_RUNTIME $EF"
        } else {
            ""
        };
        format!(
            "*=>[KNN $K @{} $BLOB{} AS {}]",
            VECTOR_FIELD, ef_runtime, SCORE_FIELD
        )
    }
}

/// `FT.SEARCH` reply: total count, then alternating key and field list
fn parse_search_reply(reply: &[::redis::Value]) -> Result<Vec<SearchHit>> {
    reply
        .get(1..)
        .unwrap_or_default()
        .chunks(2)
        .map(|pair| {
            let key: String = ::redis::from_redis_value(&pair[0])
                .map_err(|e| Error::InvalidResponse(e.to_string()))?;
            let id = key
                .parse::<u64>()
                .map_err(|_| Error::InvalidResponse(format!("Non-numeric document key '{}'", key)))?;

            let fields: Vec<String> = match pair.get(1) {
                Some(value) => ::redis::from_redis_value(value)
                    .map_err(|e| Error::InvalidResponse(e.to_string()))?,
                None => Vec::new(),
            };
            let score = fields
                .chunks(2)
                .find(|kv| kv.len() == 2 && kv[0] == SCORE_FIELD)
                .and_then(|kv| kv[1].parse::<f32>().ok())
                .unwrap_or_default();

            Ok(SearchHit::new(id, score))
        })
        .collect()
}

#[async_trait]
impl Searcher for RedisSearcher {
    fn name(&self) -> &str {
        "redis"
    }

    async fn init_client(
        &mut self,
        host: &str,
        _distance: Distance,
        connection_params: &ConnectionParams,
        search_params: &SearchParams,
    ) -> Result<()> {
        self.conn = Some(connect(&self.settings, host, connection_params).await?);
        self.search_params = search_params.clone();
        Ok(())
    }

    fn search_params(&self) -> &SearchParams {
        &self.search_params
    }

    async fn search_one(&self, query: &Query, top: usize) -> Result<Vec<SearchHit>> {
        let mut conn = self.conn.clone().ok_or(Error::NotConnected)?;
        let ef = self.search_params.ef().filter(|_| self.algorithm == "HNSW");

        let mut cmd = ::redis::cmd("FT.SEARCH");
        cmd.arg(&self.settings.index_name)
            .arg(self.knn_query())
            .arg("PARAMS")
            .arg(if ef.is_some() { 6 } else { 4 })
            .arg("K")
            .arg(top)
            .arg("BLOB")
            .arg(vector_bytes(&query.vector));
        if let Some(ef) = ef {
            cmd.arg("EF").arg(ef);
        }
        cmd.arg("SORTBY")
            .arg(SCORE_FIELD)
            .arg("ASC")
            .arg("LIMIT")
            .arg(0)
            .arg(top)
            .arg("RETURN")
            .arg(1)
            .arg(SCORE_FIELD)
            .arg("DIALECT")
            .arg(2);

        let reply: Vec<::redis::Value> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::QueryExecution(e.to_string()))?;
        parse_search_reply(&reply)
    }

    async fn delete_client(&mut self) -> Result<()> {
        self.conn = None;
        Ok(())
    }
}

pub fn clients(config: &ExperimentConfig) -> Result<EngineClients> {
    let settings = RedisSettings::from_env()?;
    let collection_params = &config.collection_params;

    Ok(EngineClients {
        configurator: Box::new(RedisConfigurator::with_settings(
            config.host.clone(),
            collection_params.clone(),
            config.connection_params.clone(),
            settings.clone(),
        )),
        uploader: Box::new(RedisUploader::with_settings(collection_params, settings.clone())),
        searchers: config
            .search_params
            .iter()
            .map(|_| {
                Box::new(RedisSearcher::with_settings(collection_params, settings.clone()))
                    as Box<dyn Searcher>
            })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HnswConfig;
    use crate::dataset::{FileSet, VectorKind};
    use serde_json::json;

    fn settings() -> RedisSettings {
        RedisSettings::from_lookup(|_| None).unwrap()
    }

    #[test]
    fn test_settings_from_lookup() {
        let s = settings();
        assert_eq!(s.port, 6379);
        assert_eq!(s.index_name, "idx");
        assert_eq!(s.url("localhost"), "redis://localhost:6379");

        let s = RedisSettings::from_lookup(|key| match key {
            "REDIS_PORT" => Some("6380".into()),
            "REDIS_AUTH" => Some("secret".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(s.url("db"), "redis://:secret@db:6380");

        let bad = RedisSettings::from_lookup(|key| (key == "REDIS_PORT").then(|| "x".into()));
        assert!(matches!(bad, Err(Error::Config(_))));
    }

    #[test]
    fn test_cluster_and_gpu_flags() {
        let s = settings();
        assert!(!s.cluster);
        assert_eq!(s.gpu_stats_url("db"), None);

        let s = RedisSettings::from_lookup(|key| match key {
            "REDIS_CLUSTER" => Some("1".into()),
            "GPU_STATS" => Some("true".into()),
            _ => None,
        })
        .unwrap();
        assert!(s.cluster);
        assert_eq!(s.gpu_stats_url("db").as_deref(), Some("http://db:5000/"));

        let s = RedisSettings::from_lookup(|key| match key {
            "GPU_STATS" => Some("yes".into()),
            "GPU_STATS_ENDPOINT" => Some("http://stats:9000/gpu".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(s.gpu_stats_url("db").as_deref(), Some("http://stats:9000/gpu"));

        let off = RedisSettings::from_lookup(|key| (key == "REDIS_CLUSTER").then(|| "0".into())).unwrap();
        assert!(!off.cluster);

        let bad = RedisSettings::from_lookup(|key| (key == "REDIS_CLUSTER").then(|| "maybe".into()));
        assert!(matches!(bad, Err(Error::Config(_))));
    }

    #[test]
    fn test_used_memory_single_and_cluster() {
        let single = ::redis::Value::BulkString(b"# Memory\r\nused_memory:1024\r\nused_memory_human:1K\r\n".to_vec());
        assert_eq!(used_memory(&single), Some(1024));

        let cluster = ::redis::Value::Map(vec![
            (
                ::redis::Value::SimpleString("node-a:6379".into()),
                ::redis::Value::BulkString(b"used_memory:100\r\n".to_vec()),
            ),
            (
                ::redis::Value::SimpleString("node-b:6379".into()),
                ::redis::Value::BulkString(b"used_memory:50\r\n".to_vec()),
            ),
        ]);
        assert_eq!(used_memory(&cluster), Some(150));

        assert_eq!(used_memory(&::redis::Value::Nil), None);
    }

    #[tokio::test]
    async fn test_device_info_from_stats_endpoint() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gpu"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"gpu_memory_used": 512, "name": "A100"})),
            )
            .mount(&server)
            .await;

        let info = device_info(&format!("{}/gpu", server.uri())).await;
        assert_eq!(info["gpu_memory_used"], 512);
        assert_eq!(info["name"], "A100");
    }

    #[tokio::test]
    async fn test_device_info_failure_is_empty() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        assert!(device_info(&server.uri()).await.is_empty());
        // nothing listening
        assert!(device_info("http://127.0.0.1:1/").await.is_empty());
    }

    #[test]
    fn test_index_schema() {
        let dataset = DatasetConfig {
            name: "ds".into(),
            distance: Distance::Dot,
            vector_size: 25,
            schema: BTreeMap::from([
                ("city".to_string(), FieldType::Keyword),
                ("price".to_string(), FieldType::Float),
            ]),
            kind: VectorKind::Dense,
            path: Default::default(),
            load: FileSet::default(),
            search: FileSet::default(),
        };
        let params = CollectionParams {
            hnsw_config: Some(HnswConfig {
                m: Some(16),
                ef_construction: Some(200),
                ef_search: None,
            }),
            ..Default::default()
        };

        let args = index_schema(&dataset, &params);
        assert_eq!(
            args,
            vec![
                "ON", "HASH", "SCHEMA", "vector", "VECTOR", "HNSW", "10", "TYPE", "FLOAT32",
                "DIM", "25", "DISTANCE_METRIC", "IP", "M", "16", "EF_CONSTRUCTION", "200", "city",
                "TAG", "SEPARATOR", ";", "price", "NUMERIC",
            ]
        );

        let flat = CollectionParams {
            algorithm: Some("flat".into()),
            ..params
        };
        let args = index_schema(&dataset, &flat);
        assert_eq!(args[5], "FLAT");
        assert_eq!(args[6], "6");
    }

    #[test]
    fn test_payload_values() {
        assert_eq!(payload_value("a", &json!("x")), Some("x".into()));
        assert_eq!(payload_value("a", &json!(3)), Some("3".into()));
        assert_eq!(payload_value("a", &json!(null)), None);
        assert_eq!(payload_value("labels", &json!(["a", "b"])), Some("a;b".into()));
        assert_eq!(payload_value("tags", &json!(["a", "b"])), None);
        assert_eq!(
            payload_value("loc", &json!({"lon": 10.5, "lat": 89.0})),
            Some(format!("10.5,{}", MAX_LATITUDE))
        );
    }

    #[test]
    fn test_vector_bytes() {
        let bytes = vector_bytes(&[1.0, -2.5]);
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[..4], &1.0f32.to_le_bytes());
        assert_eq!(&bytes[4..], &(-2.5f32).to_le_bytes());
    }

    #[test]
    fn test_knn_query() {
        let mut searcher = RedisSearcher::with_settings(&CollectionParams::default(), settings());
        assert_eq!(
            searcher.knn_query(),
            "*=>[KNN $K @vector $BLOB AS vector_score]"
        );

        searcher.search_params = serde_json::from_value(json!({"search_params": {"ef": 64}})).unwrap();
        assert_eq!(
            searcher.knn_query(),
            "*=>[KNN $K @vector $BLOB EF_RUNTIME $EF AS vector_score]"
        );
    }

    #[tokio::test]
    async fn test_uninitialized_clients() {
        let uploader = RedisUploader::with_settings(&CollectionParams::default(), settings());
        let result = uploader.upload_batch(Vec::new()).await;
        assert!(matches!(result, Err(Error::NotConnected)));

        let mut searcher = RedisSearcher::with_settings(&CollectionParams::default(), settings());
        assert!(searcher.delete_client().await.is_ok());
    }
}

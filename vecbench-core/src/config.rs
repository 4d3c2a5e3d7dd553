use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::dataset::DatasetConfig;
use crate::error::{Error, Result};
use crate::types::Params;

/// Top-level configuration for vecbench
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory that result records and the manifest are written to
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
    /// Benchmark datasets, referenced by name
    #[serde(default)]
    pub datasets: Vec<DatasetConfig>,
    /// Experiments, referenced by name
    #[serde(default)]
    pub experiments: Vec<ExperimentConfig>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    pub fn from_str(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    pub fn experiment(&self, name: &str) -> Result<&ExperimentConfig> {
        self.experiments
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| Error::Config(format!("Experiment '{}' not found", name)))
    }

    pub fn dataset(&self, name: &str) -> Result<&DatasetConfig> {
        self.datasets
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| Error::Config(format!("Dataset '{}' not found", name)))
    }
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

/// Engine family an experiment drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Redis,
    AzureAi,
    Qdrant,
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EngineKind::Redis => "redis",
            EngineKind::AzureAi => "azure_ai",
            EngineKind::Qdrant => "qdrant",
        };
        f.write_str(name)
    }
}

/// One experiment: an engine plus the parameters to drive it with
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Experiment name, the first component of every result file name
    pub name: String,
    pub engine: EngineKind,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub connection_params: ConnectionParams,
    #[serde(default)]
    pub collection_params: CollectionParams,
    #[serde(default)]
    pub upload_params: UploadParams,
    /// One entry per search configuration; the position is the search id
    #[serde(default)]
    pub search_params: Vec<SearchParams>,
}

fn default_host() -> String {
    "localhost".to_string()
}

/// Connection settings shared by every adapter of an experiment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Request timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(flatten)]
    pub extra: Params,
}

/// Index/collection creation settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionParams {
    /// Index algorithm (e.g. `hnsw`, `flat`); engine default when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hnsw_config: Option<HnswConfig>,
    #[serde(flatten)]
    pub extra: Params,
}

impl CollectionParams {
    /// Upper-cased algorithm name, `HNSW` when unset
    pub fn algorithm(&self) -> String {
        self.algorithm
            .as_deref()
            .unwrap_or("hnsw")
            .to_ascii_uppercase()
    }
}

/// HNSW graph parameters; accepts the spellings used by the supported engines
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HnswConfig {
    #[serde(default, alias = "M", skip_serializing_if = "Option::is_none")]
    pub m: Option<u64>,
    #[serde(
        default,
        alias = "EF_CONSTRUCTION",
        alias = "efConstruction",
        alias = "ef_construct",
        skip_serializing_if = "Option::is_none"
    )]
    pub ef_construction: Option<u64>,
    #[serde(
        default,
        alias = "EF_RUNTIME",
        alias = "efSearch",
        skip_serializing_if = "Option::is_none"
    )]
    pub ef_search: Option<u64>,
}

/// Upload stage settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadParams {
    /// Records per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Max batches in flight
    #[serde(default = "default_parallel")]
    pub parallel: usize,
    #[serde(flatten)]
    pub extra: Params,
}

impl Default for UploadParams {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            parallel: default_parallel(),
            extra: Params::new(),
        }
    }
}

fn default_batch_size() -> usize {
    64
}

fn default_parallel() -> usize {
    1
}

fn default_top() -> usize {
    10
}

/// One search configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchParams {
    /// Number of concurrent query clients this configuration represents
    #[serde(default = "default_parallel")]
    pub parallel: usize,
    /// Number of neighbours to request per query
    #[serde(default = "default_top")]
    pub top: usize,
    /// Engine runtime knobs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_params: Option<EngineSearchParams>,
    #[serde(flatten)]
    pub extra: Params,
}

impl SearchParams {
    /// Runtime `ef`, if configured
    pub fn ef(&self) -> Option<u64> {
        self.search_params.as_ref().and_then(|p| p.ef)
    }
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            parallel: default_parallel(),
            top: default_top(),
            search_params: None,
            extra: Params::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineSearchParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ef: Option<u64>,
    #[serde(flatten)]
    pub extra: Params,
}

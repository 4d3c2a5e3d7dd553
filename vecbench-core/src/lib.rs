pub mod config;
pub mod dataset;
pub mod engine;
pub mod engines;
pub mod error;
pub mod experiment;
pub mod metrics;
pub mod store;
pub mod summary;
pub mod types;

// re-exports
pub use config::{Config, EngineKind, ExperimentConfig};
pub use dataset::{DatasetConfig, DatasetReader, DatasetSource, JsonlDataset};
pub use engine::{Configurator, EngineClients, ExecutionParams, Searcher, Uploader};
pub use error::{Error, Result};
pub use experiment::{Experiment, RunOptions, RunOutcome, SearchOutcome, SearchStatus};
pub use metrics::{LatencyMetrics, SearchStats, UploadStats};
pub use store::{ExperimentRecord, RecordKey, ResultStore, Stage};
pub use summary::{KpiStats, summarize};
pub use types::{Distance, Params, Query, Record, SearchHit};

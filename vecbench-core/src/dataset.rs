use std::collections::BTreeMap;
use std::path::PathBuf;

use futures::stream::{self, BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};

use crate::error::{Error, Result};
use crate::types::{Distance, Query, Record, normalize};

/// Lazy, single-pass stream of records to upload
pub type RecordStream = BoxStream<'static, Result<Record>>;

/// Lazy stream of queries; a fresh one is obtained for every searcher
pub type QueryStream = BoxStream<'static, Result<Query>>;

/// Benchmark dataset descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub name: String,
    pub distance: Distance,
    pub vector_size: usize,
    /// Payload field name -> field type
    #[serde(default)]
    pub schema: BTreeMap<String, FieldType>,
    #[serde(default, rename = "type")]
    pub kind: VectorKind,
    /// Root directory the load and search files live in
    #[serde(default)]
    pub path: PathBuf,
    #[serde(default)]
    pub load: FileSet,
    #[serde(default)]
    pub search: FileSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Int,
    Float,
    Keyword,
    Text,
    Geo,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorKind {
    #[default]
    Dense,
    Sparse,
}

/// Files designated for one dataset role
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileSet {
    #[serde(default)]
    pub files: Vec<String>,
}

/// Reads the contents of a dataset
pub trait DatasetReader: Send + Sync {
    /// Records to upload, in file order
    fn read_data(&self) -> RecordStream;

    /// Queries to search with; every call starts from the beginning
    fn read_queries(&self) -> QueryStream;
}

/// A dataset that can hand out readers
pub trait DatasetSource: Send + Sync {
    fn config(&self) -> &DatasetConfig;

    /// Create a reader, L2-normalising vectors when `normalize` is set
    fn reader(&self, normalize: bool) -> Result<Box<dyn DatasetReader>>;
}

/// Dataset stored as JSON lines: one record or query object per line
#[derive(Debug, Clone)]
pub struct JsonlDataset {
    config: DatasetConfig,
}

impl JsonlDataset {
    pub fn new(config: DatasetConfig) -> Self {
        Self { config }
    }
}

impl DatasetSource for JsonlDataset {
    fn config(&self) -> &DatasetConfig {
        &self.config
    }

    fn reader(&self, normalize: bool) -> Result<Box<dyn DatasetReader>> {
        if self.config.kind == VectorKind::Sparse {
            return Err(Error::Unsupported(format!(
                "Dataset '{}' uses sparse vectors, which the JSON lines reader does not support",
                self.config.name
            )));
        }

        let resolve = |files: &[String]| -> Vec<PathBuf> {
            files.iter().map(|f| self.config.path.join(f)).collect()
        };

        Ok(Box::new(JsonlReader {
            data_files: resolve(&self.config.load.files),
            query_files: resolve(&self.config.search.files),
            normalize,
        }))
    }
}

/// Reader over the load and search files of a [`JsonlDataset`]
#[derive(Debug, Clone)]
pub struct JsonlReader {
    data_files: Vec<PathBuf>,
    query_files: Vec<PathBuf>,
    normalize: bool,
}

impl DatasetReader for JsonlReader {
    fn read_data(&self) -> RecordStream {
        let normalize_vectors = self.normalize;
        jsonl_stream::<Record>(self.data_files.clone())
            .map(move |record: Result<Record>| -> Result<Record> {
                let mut record = record?;
                if normalize_vectors {
                    normalize(&mut record.vector);
                }
                Ok(record)
            })
            .boxed()
    }

    fn read_queries(&self) -> QueryStream {
        let normalize_vectors = self.normalize;
        jsonl_stream::<Query>(self.query_files.clone())
            .map(move |query: Result<Query>| -> Result<Query> {
                let mut query = query?;
                if normalize_vectors {
                    normalize(&mut query.vector);
                }
                Ok(query)
            })
            .boxed()
    }
}

struct LineCursor {
    pending: std::vec::IntoIter<PathBuf>,
    current: Option<(PathBuf, Lines<BufReader<File>>)>,
}

/// Stream every non-blank line of `files` in order, parsed as `T`
fn jsonl_stream<T>(files: Vec<PathBuf>) -> BoxStream<'static, Result<T>>
where
    T: DeserializeOwned + Send + 'static,
{
    let cursor = LineCursor {
        pending: files.into_iter(),
        current: None,
    };
    stream::try_unfold(cursor, next_item::<T>).boxed()
}

async fn next_item<T: DeserializeOwned>(mut cursor: LineCursor) -> Result<Option<(T, LineCursor)>> {
    loop {
        if let Some((path, lines)) = cursor.current.as_mut() {
            match lines.next_line().await? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => {
                    let item = serde_json::from_str(&line).map_err(|e| {
                        Error::Config(format!("Malformed line in {}: {}", path.display(), e))
                    })?;
                    return Ok(Some((item, cursor)));
                }
                None => cursor.current = None,
            }
        }

        match cursor.pending.next() {
            Some(path) => {
                let file = File::open(&path).await.map_err(|e| {
                    Error::Config(format!("Cannot open {}: {}", path.display(), e))
                })?;
                cursor.current = Some((path, BufReader::new(file).lines()));
            }
            None => return Ok(None),
        }
    }
}

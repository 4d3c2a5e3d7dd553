//! File-backed, append-only persistence of experiment records.
//!
//! Every record is written to its own JSON file named
//! `<experiment>-<dataset>-<stage>-[<search_id>-]<timestamp>.json`. The record
//! is staged in a hidden temp file, indexed in `manifest.jsonl` under its
//! logical key, then moved into place without clobbering. Existence checks read
//! the manifest and only count entries whose file is present, so they never
//! depend on parsing file names, an interrupted write counts as absent, and a
//! result file removed by an operator stops counting.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::types::Params;

const MANIFEST_FILE: &str = "manifest.jsonl";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

/// Experiment stage a record belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Upload,
    Search,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Upload => f.write_str("upload"),
            Stage::Search => f.write_str("search"),
        }
    }
}

/// Logical identity of a record, independent of when it was written
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub experiment: String,
    pub dataset: String,
    pub stage: Stage,
    pub search_id: Option<usize>,
}

impl RecordKey {
    pub fn upload(experiment: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self {
            experiment: experiment.into(),
            dataset: dataset.into(),
            stage: Stage::Upload,
            search_id: None,
        }
    }

    pub fn search(
        experiment: impl Into<String>,
        dataset: impl Into<String>,
        search_id: usize,
    ) -> Self {
        Self {
            experiment: experiment.into(),
            dataset: dataset.into(),
            stage: Stage::Search,
            search_id: Some(search_id),
        }
    }

    /// Stable SHA-256 digest of the key's components
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [self.experiment.as_str(), self.dataset.as_str()] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(self.stage.to_string().as_bytes());
        hasher.update([0u8]);
        if let Some(id) = self.search_id {
            hasher.update(id.to_string().as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    fn file_stem(&self, timestamp: &str) -> String {
        match self.search_id {
            Some(id) => format!(
                "{}-{}-{}-{}-{}",
                self.experiment, self.dataset, self.stage, id, timestamp
            ),
            None => format!(
                "{}-{}-{}-{}",
                self.experiment, self.dataset, self.stage, timestamp
            ),
        }
    }
}

/// Which search ids an existence check matches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchIdMatch {
    Any,
    Exact(usize),
}

/// The persisted unit of work product
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    pub params: Params,
    pub results: Params,
}

/// One line of the manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Digest of the logical key
    pub key: String,
    pub experiment: String,
    pub dataset: String,
    pub stage: Stage,
    #[serde(default)]
    pub search_id: Option<usize>,
    /// Result file name, relative to the store root
    pub file: String,
    pub written_at: DateTime<Utc>,
}

/// Result directory plus its manifest
#[derive(Debug, Clone)]
pub struct ResultStore {
    root: PathBuf,
}

impl ResultStore {
    /// Open (and create if needed) a result directory
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Open a result directory that must already exist
    pub fn open_existing(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(Error::Config(format!(
                "Result directory {} does not exist",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist `record` under a new timestamped file and index it.
    ///
    /// Never overwrites: if the timestamped name is taken, a counter is appended.
    /// No partially written file ever carries a result name.
    pub fn write(&self, key: &RecordKey, record: &ExperimentRecord) -> Result<PathBuf> {
        let mut staged = tempfile::Builder::new()
            .prefix(".staged-")
            .suffix(".tmp")
            .tempfile_in(&self.root)?;
        {
            let mut writer = BufWriter::new(staged.as_file_mut());
            serde_json::to_writer_pretty(&mut writer, record)?;
            writer.flush()?;
        }
        staged.as_file().sync_all()?;

        let stem = key.file_stem(&Local::now().format(TIMESTAMP_FORMAT).to_string());
        let mut attempt = 0usize;
        loop {
            let name = if attempt == 0 {
                format!("{}.json", stem)
            } else {
                format!("{}-{}.json", stem, attempt)
            };
            attempt += 1;
            let path = self.root.join(&name);
            if path.exists() {
                continue;
            }

            // indexed before the file appears: an entry without its file never counts
            self.append_manifest(&ManifestEntry {
                key: key.digest(),
                experiment: key.experiment.clone(),
                dataset: key.dataset.clone(),
                stage: key.stage,
                search_id: key.search_id,
                file: name,
                written_at: Utc::now(),
            })?;

            match staged.persist_noclobber(&path) {
                Ok(_) => {
                    info!(path = %path.display(), "Saved results");
                    return Ok(path);
                }
                Err(e) if e.error.kind() == ErrorKind::AlreadyExists => staged = e.file,
                Err(e) => return Err(e.error.into()),
            }
        }
    }

    /// Count stored records matching a logical key, ignoring timestamps
    pub fn exists(
        &self,
        experiment: &str,
        dataset: &str,
        stage: Stage,
        search_id: SearchIdMatch,
    ) -> Result<usize> {
        let digest = match search_id {
            SearchIdMatch::Exact(id) => Some(
                RecordKey {
                    experiment: experiment.to_string(),
                    dataset: dataset.to_string(),
                    stage,
                    search_id: Some(id),
                }
                .digest(),
            ),
            SearchIdMatch::Any => None,
        };

        let count = self
            .live_entries()?
            .into_iter()
            .filter(|entry| match &digest {
                Some(digest) => &entry.key == digest,
                None => {
                    entry.experiment == experiment
                        && entry.dataset == dataset
                        && entry.stage == stage
                }
            })
            .count();
        Ok(count)
    }

    /// Distinct search ids with at least one stored record
    pub fn completed_search_ids(&self, experiment: &str, dataset: &str) -> Result<BTreeSet<usize>> {
        Ok(self
            .live_entries()?
            .into_iter()
            .filter(|e| {
                e.stage == Stage::Search && e.experiment == experiment && e.dataset == dataset
            })
            .filter_map(|e| e.search_id)
            .collect())
    }

    /// Read a record back from disk
    pub fn read(&self, path: impl AsRef<Path>) -> Result<ExperimentRecord> {
        let path = path.as_ref();
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Every manifest entry, in write order
    pub fn entries(&self) -> Result<Vec<ManifestEntry>> {
        let path = self.root.join(MANIFEST_FILE);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let entries = contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed manifest line");
                    None
                }
            })
            .collect();
        Ok(entries)
    }

    /// Manifest entries whose result file is still present
    fn live_entries(&self) -> Result<Vec<ManifestEntry>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| self.root.join(&e.file).is_file())
            .collect())
    }

    fn append_manifest(&self, entry: &ManifestEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut manifest = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(self.root.join(MANIFEST_FILE))?;
        if ends_mid_line(&mut manifest)? {
            warn!("Manifest ends in an incomplete line, starting a new one");
            line.insert(0, '\n');
        }
        // single write so concurrent appenders do not interleave within a line
        manifest.write_all(line.as_bytes())?;
        Ok(())
    }
}

/// Whether a previous append was cut off before its newline
fn ends_mid_line(file: &mut File) -> std::io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

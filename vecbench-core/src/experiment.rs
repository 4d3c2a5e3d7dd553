use std::path::PathBuf;

use serde::Serialize;
use tracing::{error, info};

use crate::config::{ExperimentConfig, SearchParams};
use crate::dataset::{DatasetReader, DatasetSource};
use crate::engine::{Configurator, EngineClients, Searcher, Uploader};
use crate::error::{Error, Result};
use crate::store::{ExperimentRecord, RecordKey, ResultStore, SearchIdMatch, Stage};
use crate::types::{Params, to_params};

/// Which stages to run and which search configurations to (re)run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub skip_upload: bool,
    pub skip_search: bool,
    /// Skip work that already has a stored record
    pub skip_if_exists: bool,
    /// Allow-list of `parallel` values to run; empty runs everything
    pub parallels: Vec<usize>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            skip_upload: false,
            skip_search: false,
            skip_if_exists: true,
            parallels: Vec::new(),
        }
    }
}

/// What a run did
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every configured search already had a record; nothing was run
    AlreadyComplete { searches: usize },
    Completed {
        /// Upload record, unless the upload stage was skipped
        upload: Option<PathBuf>,
        /// One entry per search configuration when the search stage ran
        searches: Vec<SearchOutcome>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchOutcome {
    pub search_id: usize,
    pub parallel: usize,
    pub status: SearchStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStatus {
    /// Ran and was stored at this path
    Recorded(PathBuf),
    /// Skipped because a record already exists
    AlreadyRecorded,
    /// Skipped by the parallel allow-list
    Filtered,
}

/// Whether a search configuration with `parallel` clients passes the allow-list
pub fn parallel_selected(parallel: usize, parallels: &[usize]) -> bool {
    parallels.is_empty() || parallels.contains(&parallel)
}

/// One search configuration: its stable id, parameters and the searcher running it
pub struct SearchConfiguration {
    pub search_id: usize,
    pub params: SearchParams,
    searcher: Box<dyn Searcher>,
}

/// Drives one engine through configure, upload and search for a dataset,
/// skipping work the result store already holds
pub struct Experiment {
    config: ExperimentConfig,
    configurator: Box<dyn Configurator>,
    uploader: Box<dyn Uploader>,
    searches: Vec<SearchConfiguration>,
    store: ResultStore,
}

impl Experiment {
    pub fn new(config: ExperimentConfig, clients: EngineClients, store: ResultStore) -> Result<Self> {
        if clients.searchers.len() != config.search_params.len() {
            return Err(Error::Config(format!(
                "Experiment '{}' has {} search configurations but {} searchers",
                config.name,
                config.search_params.len(),
                clients.searchers.len()
            )));
        }

        let searches = config
            .search_params
            .iter()
            .cloned()
            .zip(clients.searchers)
            .enumerate()
            .map(|(search_id, (params, searcher))| SearchConfiguration {
                search_id,
                params,
                searcher,
            })
            .collect();

        Ok(Self {
            config,
            configurator: clients.configurator,
            uploader: clients.uploader,
            searches,
            store,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn searches(&self) -> &[SearchConfiguration] {
        &self.searches
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    /// Run the experiment against `dataset`.
    ///
    /// Any adapter error aborts the remaining stages; records already written stay.
    pub async fn run(&mut self, dataset: &dyn DatasetSource, options: &RunOptions) -> Result<RunOutcome> {
        let dataset_name = dataset.config().name.clone();

        if options.skip_if_exists && self.all_searches_recorded(&dataset_name)? {
            info!(
                experiment = %self.config.name,
                dataset = %dataset_name,
                searches = self.searches.len(),
                "Skipping run, all search configurations already ran"
            );
            return Ok(RunOutcome::AlreadyComplete {
                searches: self.searches.len(),
            });
        }

        let distance = dataset.config().distance;
        let execution_params = self
            .configurator
            .execution_params(distance, dataset.config().vector_size);
        let reader = dataset.reader(execution_params.normalize)?;

        let upload = if options.skip_upload {
            None
        } else {
            Some(self.run_upload(dataset, reader.as_ref()).await?)
        };

        let searches = if options.skip_search {
            Vec::new()
        } else {
            self.run_searches(dataset, reader.as_ref(), options).await?
        };

        info!(experiment = %self.config.name, results = %self.store.root().display(), "Experiment stage: Done");
        Ok(RunOutcome::Completed { upload, searches })
    }

    /// Release every adapter's resources, even if some of them fail
    pub async fn delete_client(&mut self) -> Result<()> {
        let mut first_error = None;
        let mut note = |result: Result<()>, what: &str| {
            if let Err(e) = result {
                error!(adapter = what, error = %e, "Failed to release client");
                first_error.get_or_insert(e);
            }
        };

        note(self.uploader.delete_client().await, "uploader");
        note(self.configurator.delete_client().await, "configurator");
        for search in &mut self.searches {
            note(search.searcher.delete_client().await, "searcher");
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Records for ids outside the configured list (e.g. from a longer list) do not count
    fn all_searches_recorded(&self, dataset: &str) -> Result<bool> {
        let completed = self
            .store
            .completed_search_ids(&self.config.name, dataset)?
            .into_iter()
            .filter(|id| *id < self.searches.len())
            .count();
        Ok(completed == self.searches.len())
    }

    async fn run_upload(&mut self, dataset: &dyn DatasetSource, reader: &dyn DatasetReader) -> Result<PathBuf> {
        let config = dataset.config();

        info!(engine = self.configurator.name(), "Experiment stage: Configure");
        self.configurator.configure(config).await?;

        info!(engine = self.uploader.name(), "Experiment stage: Upload");
        self.uploader
            .init_client(
                &self.config.host,
                config.distance,
                &self.config.connection_params,
                &self.config.upload_params,
            )
            .await?;
        let stats = self.uploader.upload(config.distance, reader.read_data()).await?;
        info!(
            records = stats.record_count,
            upload_time = stats.upload_time,
            total_time = stats.total_time,
            "Upload finished"
        );

        // collection params win on conflicting keys
        let mut params: Params = to_params(self.uploader.upload_params())?;
        params.extend(to_params(self.configurator.collection_params())?);

        let record = ExperimentRecord {
            params,
            results: to_params(&stats)?,
        };
        self.store
            .write(&RecordKey::upload(&self.config.name, &config.name), &record)
    }

    async fn run_searches(
        &mut self,
        dataset: &dyn DatasetSource,
        reader: &dyn DatasetReader,
        options: &RunOptions,
    ) -> Result<Vec<SearchOutcome>> {
        let config = dataset.config();
        info!("Experiment stage: Search");

        let mut outcomes = Vec::with_capacity(self.searches.len());
        for search in &mut self.searches {
            let search_id = search.search_id;
            let parallel = search.params.parallel;
            let ef = search
                .params
                .ef()
                .map(|ef| ef.to_string())
                .unwrap_or_else(|| "n/a".to_string());

            if options.skip_if_exists
                && self.store.exists(
                    &self.config.name,
                    &config.name,
                    Stage::Search,
                    SearchIdMatch::Exact(search_id),
                )? >= 1
            {
                info!(search_id, "Skipping search, it already has a record");
                outcomes.push(SearchOutcome {
                    search_id,
                    parallel,
                    status: SearchStatus::AlreadyRecorded,
                });
                continue;
            }

            if !parallel_selected(parallel, &options.parallels) {
                info!(search_id, ef = %ef, clients = parallel, "Skipping search configuration");
                outcomes.push(SearchOutcome {
                    search_id,
                    parallel,
                    status: SearchStatus::Filtered,
                });
                continue;
            }

            info!(search_id, ef = %ef, clients = parallel, "Running search configuration");
            search
                .searcher
                .init_client(
                    &self.config.host,
                    config.distance,
                    &self.config.connection_params,
                    &search.params,
                )
                .await?;
            let stats = search
                .searcher
                .search_all(config.distance, reader.read_queries())
                .await?;
            info!(search_id, rps = stats.rps, p99_us = stats.latency.p99_us, "Search finished");

            let record = ExperimentRecord {
                params: to_params(&search.params)?,
                results: to_params(&stats)?,
            };
            let path = self.store.write(
                &RecordKey::search(&self.config.name, &config.name, search_id),
                &record,
            )?;
            outcomes.push(SearchOutcome {
                search_id,
                parallel,
                status: SearchStatus::Recorded(path),
            });
        }

        Ok(outcomes)
    }
}

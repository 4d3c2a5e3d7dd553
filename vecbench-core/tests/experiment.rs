use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use serde_json::json;
use vecbench_core::config::{CollectionParams, ConnectionParams, SearchParams, UploadParams};
use vecbench_core::dataset::{FileSet, QueryStream, RecordStream, VectorKind};
use vecbench_core::engine::ExecutionParams;
use vecbench_core::store::SearchIdMatch;
use vecbench_core::*;

type Log = Arc<Mutex<Vec<String>>>;

fn calls(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

struct FakeConfigurator {
    log: Log,
    params: CollectionParams,
    normalize: bool,
    fail_teardown: bool,
}

#[async_trait]
impl Configurator for FakeConfigurator {
    fn name(&self) -> &str {
        "fake"
    }

    fn collection_params(&self) -> &CollectionParams {
        &self.params
    }

    fn execution_params(&self, _distance: Distance, _vector_size: usize) -> ExecutionParams {
        ExecutionParams {
            normalize: self.normalize,
        }
    }

    async fn clean(&mut self) -> Result<()> {
        self.log.lock().unwrap().push("clean".into());
        // a fresh engine has nothing to clean
        Err(Error::QueryExecution("no such index".into()))
    }

    async fn recreate(&mut self, dataset: &DatasetConfig) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("recreate:{}", dataset.name));
        Ok(())
    }

    async fn delete_client(&mut self) -> Result<()> {
        self.log.lock().unwrap().push("configurator.delete".into());
        if self.fail_teardown {
            return Err(Error::Connection("already gone".into()));
        }
        Ok(())
    }
}

struct FakeUploader {
    log: Log,
    params: UploadParams,
    fail: bool,
}

#[async_trait]
impl Uploader for FakeUploader {
    fn name(&self) -> &str {
        "fake"
    }

    async fn init_client(
        &mut self,
        host: &str,
        _distance: Distance,
        _connection_params: &ConnectionParams,
        upload_params: &UploadParams,
    ) -> Result<()> {
        self.log.lock().unwrap().push(format!("uploader.init:{}", host));
        self.params = upload_params.clone();
        Ok(())
    }

    fn upload_params(&self) -> &UploadParams {
        &self.params
    }

    async fn upload_batch(&self, batch: Vec<Record>) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("upload_batch:{}", batch.len()));
        if self.fail {
            return Err(Error::Transport {
                status: 503,
                body: "unavailable".into(),
            });
        }
        Ok(())
    }

    async fn delete_client(&mut self) -> Result<()> {
        self.log.lock().unwrap().push("uploader.delete".into());
        Ok(())
    }
}

struct FakeSearcher {
    id: usize,
    log: Log,
    params: SearchParams,
}

#[async_trait]
impl Searcher for FakeSearcher {
    fn name(&self) -> &str {
        "fake"
    }

    async fn init_client(
        &mut self,
        _host: &str,
        _distance: Distance,
        _connection_params: &ConnectionParams,
        search_params: &SearchParams,
    ) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("searcher{}.init:{}", self.id, search_params.parallel));
        self.params = search_params.clone();
        Ok(())
    }

    fn search_params(&self) -> &SearchParams {
        &self.params
    }

    async fn search_one(&self, _query: &Query, top: usize) -> Result<Vec<SearchHit>> {
        self.log
            .lock()
            .unwrap()
            .push(format!("searcher{}.query", self.id));
        Ok((0..top as u64).map(|id| SearchHit::new(id, 0.5)).collect())
    }

    async fn delete_client(&mut self) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("searcher{}.delete", self.id));
        Ok(())
    }
}

struct FakeDataset {
    config: DatasetConfig,
    normalize_requested: Arc<Mutex<Option<bool>>>,
}

impl FakeDataset {
    fn new(name: &str) -> Self {
        Self {
            config: DatasetConfig {
                name: name.into(),
                distance: Distance::Cosine,
                vector_size: 2,
                schema: BTreeMap::new(),
                kind: VectorKind::Dense,
                path: Default::default(),
                load: FileSet::default(),
                search: FileSet::default(),
            },
            normalize_requested: Arc::new(Mutex::new(None)),
        }
    }
}

struct FakeReader;

impl DatasetReader for FakeReader {
    fn read_data(&self) -> RecordStream {
        stream::iter((0..5u64).map(|id| {
            Ok(Record {
                id,
                vector: vec![1.0, 0.0],
                metadata: None,
            })
        }))
        .boxed()
    }

    fn read_queries(&self) -> QueryStream {
        stream::iter((0..2).map(|_| {
            Ok(Query {
                vector: vec![0.0, 1.0],
                meta_conditions: None,
                expected_result: None,
            })
        }))
        .boxed()
    }
}

impl DatasetSource for FakeDataset {
    fn config(&self) -> &DatasetConfig {
        &self.config
    }

    fn reader(&self, normalize: bool) -> Result<Box<dyn DatasetReader>> {
        *self.normalize_requested.lock().unwrap() = Some(normalize);
        Ok(Box::new(FakeReader))
    }
}

struct Harness {
    config: ExperimentConfig,
    log: Log,
    normalize: bool,
    fail_upload: bool,
    fail_teardown: bool,
}

impl Harness {
    fn new(parallels: &[usize]) -> Self {
        let search_params = parallels
            .iter()
            .map(|&parallel| SearchParams {
                parallel,
                top: 3,
                ..serde_json::from_value(json!({"search_params": {"ef": 64}})).unwrap()
            })
            .collect();

        Self {
            config: ExperimentConfig {
                name: "bench1".into(),
                engine: EngineKind::Redis,
                host: "db.local".into(),
                connection_params: ConnectionParams::default(),
                collection_params: serde_json::from_value(json!({
                    "hnsw_config": {"m": 16},
                    "batch_size": 999,
                }))
                .unwrap(),
                upload_params: UploadParams {
                    batch_size: 2,
                    ..Default::default()
                },
                search_params,
            },
            log: Arc::new(Mutex::new(Vec::new())),
            normalize: false,
            fail_upload: false,
            fail_teardown: false,
        }
    }

    fn clients(&self) -> EngineClients {
        EngineClients {
            configurator: Box::new(FakeConfigurator {
                log: self.log.clone(),
                params: self.config.collection_params.clone(),
                normalize: self.normalize,
                fail_teardown: self.fail_teardown,
            }),
            uploader: Box::new(FakeUploader {
                log: self.log.clone(),
                params: UploadParams::default(),
                fail: self.fail_upload,
            }),
            searchers: (0..self.config.search_params.len())
                .map(|id| {
                    Box::new(FakeSearcher {
                        id,
                        log: self.log.clone(),
                        params: SearchParams::default(),
                    }) as Box<dyn Searcher>
                })
                .collect(),
        }
    }

    fn experiment(&self, store: &ResultStore) -> Experiment {
        Experiment::new(self.config.clone(), self.clients(), store.clone()).unwrap()
    }
}

fn search_count(store: &ResultStore, search_id: usize) -> usize {
    store
        .exists("bench1", "ds1", Stage::Search, SearchIdMatch::Exact(search_id))
        .unwrap()
}

fn upload_count(store: &ResultStore) -> usize {
    store
        .exists("bench1", "ds1", Stage::Upload, SearchIdMatch::Any)
        .unwrap()
}

fn placeholder() -> ExperimentRecord {
    ExperimentRecord::default()
}

#[tokio::test]
async fn test_fresh_run_records_every_stage() {
    let dir = tempfile::tempdir().unwrap();
    let store = ResultStore::open(dir.path()).unwrap();
    let harness = Harness::new(&[1, 4]);

    let outcome = harness
        .experiment(&store)
        .run(&FakeDataset::new("ds1"), &RunOptions::default())
        .await
        .unwrap();

    let RunOutcome::Completed { upload, searches } = outcome else {
        panic!("expected a completed run");
    };
    assert!(upload.is_some());
    assert_eq!(searches.len(), 2);
    assert!(
        searches
            .iter()
            .all(|s| matches!(s.status, SearchStatus::Recorded(_)))
    );

    assert_eq!(
        calls(&harness.log),
        vec![
            "clean",
            "recreate:ds1",
            "uploader.init:db.local",
            "upload_batch:2",
            "upload_batch:2",
            "upload_batch:1",
            "searcher0.init:1",
            "searcher0.query",
            "searcher0.query",
            "searcher1.init:4",
            "searcher1.query",
            "searcher1.query",
        ]
    );
    assert_eq!(upload_count(&store), 1);
    assert_eq!(search_count(&store, 0), 1);
    assert_eq!(search_count(&store, 1), 1);
}

#[tokio::test]
async fn test_complete_rerun_makes_no_calls() {
    let dir = tempfile::tempdir().unwrap();
    let store = ResultStore::open(dir.path()).unwrap();
    let harness = Harness::new(&[1, 4, 8]);
    let dataset = FakeDataset::new("ds1");

    harness
        .experiment(&store)
        .run(&dataset, &RunOptions::default())
        .await
        .unwrap();
    harness.log.lock().unwrap().clear();
    let files_before = store.entries().unwrap().len();

    let outcome = harness
        .experiment(&store)
        .run(&dataset, &RunOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::AlreadyComplete { searches: 3 });
    assert!(calls(&harness.log).is_empty());
    assert_eq!(store.entries().unwrap().len(), files_before);
}

#[tokio::test]
async fn test_partial_resume_runs_only_missing_search() {
    let dir = tempfile::tempdir().unwrap();
    let store = ResultStore::open(dir.path()).unwrap();
    store
        .write(&RecordKey::search("bench1", "ds1", 0), &placeholder())
        .unwrap();
    store
        .write(&RecordKey::search("bench1", "ds1", 1), &placeholder())
        .unwrap();

    let harness = Harness::new(&[1, 2, 4]);
    let outcome = harness
        .experiment(&store)
        .run(&FakeDataset::new("ds1"), &RunOptions::default())
        .await
        .unwrap();

    let RunOutcome::Completed { searches, .. } = outcome else {
        panic!("expected a completed run");
    };
    let statuses: Vec<_> = searches.iter().map(|s| &s.status).collect();
    assert_eq!(statuses[0], &SearchStatus::AlreadyRecorded);
    assert_eq!(statuses[1], &SearchStatus::AlreadyRecorded);
    assert!(matches!(statuses[2], SearchStatus::Recorded(_)));

    let log = calls(&harness.log);
    assert!(!log.iter().any(|c| c.starts_with("searcher0") || c.starts_with("searcher1")));
    assert!(log.contains(&"searcher2.init:4".to_string()));
    assert_eq!(search_count(&store, 0), 1);
    assert_eq!(search_count(&store, 2), 1);
}

#[tokio::test]
async fn test_parallel_allow_list() {
    let dir = tempfile::tempdir().unwrap();
    let store = ResultStore::open(dir.path()).unwrap();
    let harness = Harness::new(&[1, 4, 8]);

    let options = RunOptions {
        parallels: vec![1, 8],
        ..Default::default()
    };
    let outcome = harness
        .experiment(&store)
        .run(&FakeDataset::new("ds1"), &options)
        .await
        .unwrap();

    let RunOutcome::Completed { searches, .. } = outcome else {
        panic!("expected a completed run");
    };
    assert_eq!(searches[1].status, SearchStatus::Filtered);
    assert_eq!(searches[1].parallel, 4);

    assert_eq!(upload_count(&store), 1);
    assert_eq!(search_count(&store, 0), 1);
    assert_eq!(search_count(&store, 1), 0);
    assert_eq!(search_count(&store, 2), 1);
    assert!(!calls(&harness.log).iter().any(|c| c.starts_with("searcher1")));

    // the filtered configuration keeps the run incomplete
    harness.log.lock().unwrap().clear();
    let outcome = harness
        .experiment(&store)
        .run(&FakeDataset::new("ds1"), &RunOptions::default())
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Completed { .. }));
    assert_eq!(search_count(&store, 1), 1);
    assert_eq!(search_count(&store, 0), 1);
}

#[tokio::test]
async fn test_allow_list_matching_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = ResultStore::open(dir.path()).unwrap();
    let harness = Harness::new(&[1, 4]);

    let options = RunOptions {
        skip_upload: true,
        parallels: vec![16],
        ..Default::default()
    };
    harness
        .experiment(&store)
        .run(&FakeDataset::new("ds1"), &options)
        .await
        .unwrap();

    assert!(calls(&harness.log).is_empty());
    assert!(store.entries().unwrap().is_empty());
}

#[tokio::test]
async fn test_stages_are_independent() {
    let dir = tempfile::tempdir().unwrap();
    let store = ResultStore::open(dir.path()).unwrap();
    let harness = Harness::new(&[1]);

    let search_only = RunOptions {
        skip_upload: true,
        ..Default::default()
    };
    let outcome = harness
        .experiment(&store)
        .run(&FakeDataset::new("ds1"), &search_only)
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Completed { upload: None, .. }));
    assert_eq!(
        calls(&harness.log),
        vec!["searcher0.init:1", "searcher0.query", "searcher0.query"]
    );
    assert_eq!(upload_count(&store), 0);

    harness.log.lock().unwrap().clear();
    let upload_only = RunOptions {
        skip_search: true,
        skip_if_exists: false,
        ..Default::default()
    };
    let outcome = harness
        .experiment(&store)
        .run(&FakeDataset::new("ds1"), &upload_only)
        .await
        .unwrap();
    let RunOutcome::Completed { upload, searches } = outcome else {
        panic!("expected a completed run");
    };
    assert!(upload.is_some());
    assert!(searches.is_empty());
    assert!(!calls(&harness.log).iter().any(|c| c.starts_with("searcher")));
    assert_eq!(search_count(&store, 0), 1);
}

#[tokio::test]
async fn test_records_carry_params_and_results() {
    let dir = tempfile::tempdir().unwrap();
    let store = ResultStore::open(dir.path()).unwrap();
    let harness = Harness::new(&[4]);

    let outcome = harness
        .experiment(&store)
        .run(&FakeDataset::new("ds1"), &RunOptions::default())
        .await
        .unwrap();
    let RunOutcome::Completed { upload, searches } = outcome else {
        panic!("expected a completed run");
    };

    let upload = store.read(upload.unwrap()).unwrap();
    // collection params win over upload params on conflicting keys
    assert_eq!(upload.params["batch_size"], 999);
    assert_eq!(upload.params["parallel"], 1);
    assert_eq!(upload.params["hnsw_config"]["m"], 16);
    assert_eq!(upload.results["record_count"], 5);
    assert!(upload.results.contains_key("upload_time"));
    assert!(upload.results.contains_key("total_time"));

    let SearchStatus::Recorded(path) = &searches[0].status else {
        panic!("expected a recorded search");
    };
    let search = store.read(path).unwrap();
    assert_eq!(
        serde_json::Value::Object(search.params),
        serde_json::to_value(&harness.config.search_params[0]).unwrap()
    );
    assert_eq!(search.results["query_count"], 2);
    assert_eq!(search.results["parallel"], 4);
    assert!(search.results.contains_key("rps"));
    assert!(search.results.contains_key("p99_us"));
}

#[tokio::test]
async fn test_upload_failure_aborts_run() {
    let dir = tempfile::tempdir().unwrap();
    let store = ResultStore::open(dir.path()).unwrap();
    let mut harness = Harness::new(&[1, 4]);
    harness.fail_upload = true;

    let mut experiment = harness.experiment(&store);
    let result = experiment
        .run(&FakeDataset::new("ds1"), &RunOptions::default())
        .await;

    assert!(matches!(result, Err(Error::Transport { status: 503, .. })));
    assert!(store.entries().unwrap().is_empty());
    assert!(!calls(&harness.log).iter().any(|c| c.starts_with("searcher")));

    experiment.delete_client().await.unwrap();
    let log = calls(&harness.log);
    for adapter in ["uploader.delete", "configurator.delete", "searcher0.delete", "searcher1.delete"] {
        assert!(log.contains(&adapter.to_string()), "{} not released", adapter);
    }
}

#[tokio::test]
async fn test_teardown_continues_past_failures() {
    let dir = tempfile::tempdir().unwrap();
    let store = ResultStore::open(dir.path()).unwrap();
    let mut harness = Harness::new(&[1, 2]);
    harness.fail_teardown = true;

    // never initialised
    let result = harness.experiment(&store).delete_client().await;

    assert!(matches!(result, Err(Error::Connection(_))));
    assert_eq!(
        calls(&harness.log),
        vec![
            "uploader.delete",
            "configurator.delete",
            "searcher0.delete",
            "searcher1.delete",
        ]
    );
}

#[tokio::test]
async fn test_records_outside_configured_ids_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let store = ResultStore::open(dir.path()).unwrap();
    store
        .write(&RecordKey::search("bench1", "ds1", 0), &placeholder())
        .unwrap();
    store
        .write(&RecordKey::search("bench1", "ds1", 5), &placeholder())
        .unwrap();

    let harness = Harness::new(&[1, 2]);
    let options = RunOptions {
        skip_upload: true,
        ..Default::default()
    };
    let outcome = harness
        .experiment(&store)
        .run(&FakeDataset::new("ds1"), &options)
        .await
        .unwrap();

    assert!(matches!(outcome, RunOutcome::Completed { .. }));
    let log = calls(&harness.log);
    assert!(log.contains(&"searcher1.init:2".to_string()));
    assert!(!log.iter().any(|c| c.starts_with("searcher0")));
}

#[tokio::test]
async fn test_force_reruns_complete_experiment() {
    let dir = tempfile::tempdir().unwrap();
    let store = ResultStore::open(dir.path()).unwrap();
    let harness = Harness::new(&[1]);
    let dataset = FakeDataset::new("ds1");

    let options = RunOptions {
        skip_upload: true,
        ..Default::default()
    };
    harness.experiment(&store).run(&dataset, &options).await.unwrap();

    let forced = RunOptions {
        skip_if_exists: false,
        ..options
    };
    harness.experiment(&store).run(&dataset, &forced).await.unwrap();

    assert_eq!(search_count(&store, 0), 2);
}

#[tokio::test]
async fn test_records_are_scoped_to_dataset() {
    let dir = tempfile::tempdir().unwrap();
    let store = ResultStore::open(dir.path()).unwrap();
    store
        .write(&RecordKey::search("bench1", "other", 0), &placeholder())
        .unwrap();

    let harness = Harness::new(&[1]);
    let outcome = harness
        .experiment(&store)
        .run(&FakeDataset::new("ds1"), &RunOptions::default())
        .await
        .unwrap();

    assert!(matches!(outcome, RunOutcome::Completed { .. }));
    assert_eq!(search_count(&store, 0), 1);
}

#[tokio::test]
async fn test_normalize_flag_reaches_reader() {
    let dir = tempfile::tempdir().unwrap();
    let store = ResultStore::open(dir.path()).unwrap();
    let mut harness = Harness::new(&[1]);
    harness.normalize = true;
    let dataset = FakeDataset::new("ds1");

    harness
        .experiment(&store)
        .run(&dataset, &RunOptions::default())
        .await
        .unwrap();

    assert_eq!(*dataset.normalize_requested.lock().unwrap(), Some(true));
}

#[test]
fn test_searcher_count_must_match_configurations() {
    let dir = tempfile::tempdir().unwrap();
    let store = ResultStore::open(dir.path()).unwrap();
    let harness = Harness::new(&[1, 2]);

    let mut clients = harness.clients();
    clients.searchers.pop();

    let result = Experiment::new(harness.config.clone(), clients, store);
    assert!(matches!(result, Err(Error::Config(_))));
}

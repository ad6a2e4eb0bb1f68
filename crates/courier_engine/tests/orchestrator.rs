use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use courier_core::{default_stage_graph, ConfigError, StageDefinition, StageGraph, StageStatus};
use courier_engine::{
    EngineError, ExecutorRegistry, ManifestStore, Orchestrator, StageError, StageExecutor,
    StageInput, StageOutcome,
};
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

static INIT: Once = Once::new();

fn init_logging() {
    INIT.call_once(courier_logging::initialize_for_tests);
}

/// Writes a fixed set of files into the stage work dir and counts runs.
struct EmitFiles {
    files: Vec<(&'static str, &'static str)>,
    runs: Arc<AtomicUsize>,
}

impl EmitFiles {
    fn new(files: Vec<(&'static str, &'static str)>) -> (Arc<Self>, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(Self {
                files,
                runs: runs.clone(),
            }),
            runs,
        )
    }
}

#[async_trait::async_trait]
impl StageExecutor for EmitFiles {
    async fn execute(&self, input: StageInput) -> Result<StageOutcome, StageError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        fs::create_dir_all(&input.work_dir)?;
        let mut artifacts = Vec::new();
        for (name, content) in &self.files {
            let path = input.work_dir.join(name);
            fs::write(&path, content)?;
            artifacts.push(path);
        }
        Ok(StageOutcome { artifacts })
    }
}

/// Succeeds normally but fires a cancellation token on the way out, so the
/// orchestrator sees it at the next stage boundary.
struct CancelsAfterSuccess {
    token: std::sync::Mutex<Option<CancellationToken>>,
}

#[async_trait::async_trait]
impl StageExecutor for CancelsAfterSuccess {
    async fn execute(&self, input: StageInput) -> Result<StageOutcome, StageError> {
        fs::create_dir_all(&input.work_dir)?;
        let path = input.work_dir.join("a.html");
        fs::write(&path, "alpha")?;
        if let Some(token) = self.token.lock().unwrap().as_ref() {
            token.cancel();
        }
        Ok(StageOutcome {
            artifacts: vec![path],
        })
    }
}

struct AlwaysFails;

#[async_trait::async_trait]
impl StageExecutor for AlwaysFails {
    async fn execute(&self, _input: StageInput) -> Result<StageOutcome, StageError> {
        Err(StageError::Executor("translation quota exceeded".into()))
    }
}

fn demo_graph() -> StageGraph {
    StageGraph::new(vec![
        StageDefinition::new("fetch", "fetch"),
        StageDefinition::new("translate", "translate").depends_on("fetch"),
    ])
    .unwrap()
}

fn orchestrator_in(temp: &TempDir, graph: StageGraph, registry: ExecutorRegistry) -> Orchestrator {
    Orchestrator::new(
        graph,
        registry,
        ManifestStore::new(temp.path().join("state")),
        temp.path().join("work"),
    )
    .unwrap()
}

#[tokio::test]
async fn run_skip_clean_rerun_scenario() {
    init_logging();
    let temp = TempDir::new().unwrap();
    let (fetch, fetch_runs) = EmitFiles::new(vec![("a.html", "alpha"), ("b.html", "beta")]);
    let (translate, translate_runs) =
        EmitFiles::new(vec![("a.txt", "alpha zh"), ("b.txt", "beta zh")]);
    let mut registry = ExecutorRegistry::new();
    registry.register("fetch", fetch);
    registry.register("translate", translate);
    let orchestrator = orchestrator_in(&temp, demo_graph(), registry);

    // First run executes both stages.
    let report = orchestrator.run("demo", &["translate"], false).await.unwrap();
    assert_eq!(report.status_of("fetch"), Some(StageStatus::Succeeded));
    assert_eq!(report.status_of("translate"), Some(StageStatus::Succeeded));
    assert!(report.first_failure.is_none());
    assert!(report.stages.iter().all(|s| s.artifact_count == 2));

    // Second run skips both; no executor is invoked again.
    let report = orchestrator.run("demo", &["translate"], false).await.unwrap();
    assert_eq!(report.status_of("fetch"), Some(StageStatus::Skipped));
    assert_eq!(report.status_of("translate"), Some(StageStatus::Skipped));
    assert_eq!(fetch_runs.load(Ordering::SeqCst), 1);
    assert_eq!(translate_runs.load(Ordering::SeqCst), 1);

    // Cleaning translate leaves fetch's manifest alone.
    orchestrator.clean("demo", Some(&["translate"]), false).unwrap();
    let inspected = orchestrator.inspect("demo");
    assert_eq!(inspected[0].status, StageStatus::Succeeded);
    assert_eq!(inspected[1].status, StageStatus::Pending);

    // The next run re-executes only translate.
    let report = orchestrator.run("demo", &["translate"], false).await.unwrap();
    assert_eq!(report.status_of("fetch"), Some(StageStatus::Skipped));
    assert_eq!(report.status_of("translate"), Some(StageStatus::Succeeded));
    assert_eq!(fetch_runs.load(Ordering::SeqCst), 1);
    assert_eq!(translate_runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failure_halts_downstream_subtree_only() {
    init_logging();
    let temp = TempDir::new().unwrap();
    let (fetch, _) = EmitFiles::new(vec![("a.html", "alpha")]);
    let (format, format_runs) = EmitFiles::new(vec![("a.fmt", "x")]);
    let (title, title_runs) = EmitFiles::new(vec![("a.title", "x")]);
    let (publish, publish_runs) = EmitFiles::new(vec![("receipt.json", "{}")]);
    let mut registry = ExecutorRegistry::new();
    registry.register("fetch", fetch);
    registry.register("translate", Arc::new(AlwaysFails));
    registry.register("format", format);
    registry.register("title", title);
    registry.register("publish", publish);
    let orchestrator = orchestrator_in(&temp, default_stage_graph(), registry);

    let report = orchestrator.run("demo", &["publish"], false).await.unwrap();
    assert_eq!(report.status_of("fetch"), Some(StageStatus::Succeeded));
    assert_eq!(report.status_of("translate"), Some(StageStatus::Failed));
    assert_eq!(report.status_of("format"), Some(StageStatus::Pending));
    assert_eq!(report.status_of("title"), Some(StageStatus::Pending));
    assert_eq!(report.status_of("publish"), Some(StageStatus::Pending));
    let (failed_stage, detail) = report.first_failure.unwrap();
    assert_eq!(failed_stage, "translate");
    assert!(detail.contains("quota"));

    assert_eq!(format_runs.load(Ordering::SeqCst), 0);
    assert_eq!(title_runs.load(Ordering::SeqCst), 0);
    assert_eq!(publish_runs.load(Ordering::SeqCst), 0);

    // fetch's succeeded manifest survives the failure untouched.
    let inspected = orchestrator.inspect("demo");
    assert_eq!(inspected[0].status, StageStatus::Succeeded);
    assert_eq!(inspected[1].status, StageStatus::Failed);
    assert!(inspected[2..].iter().all(|s| s.status == StageStatus::Pending));
}

#[tokio::test]
async fn independent_subtree_still_executes_after_failure() {
    let temp = TempDir::new().unwrap();
    let (solo, solo_runs) = EmitFiles::new(vec![("out.txt", "ok")]);
    let mut registry = ExecutorRegistry::new();
    registry.register("broken", Arc::new(AlwaysFails));
    registry.register("solo", solo);
    let graph = StageGraph::new(vec![
        StageDefinition::new("broken", "broken"),
        StageDefinition::new("solo", "solo"),
    ])
    .unwrap();
    let orchestrator = orchestrator_in(&temp, graph, registry);

    let report = orchestrator.run("demo", &["broken", "solo"], false).await.unwrap();
    assert_eq!(report.status_of("broken"), Some(StageStatus::Failed));
    assert_eq!(report.status_of("solo"), Some(StageStatus::Succeeded));
    assert_eq!(solo_runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn force_reruns_valid_stages() {
    let temp = TempDir::new().unwrap();
    let (fetch, fetch_runs) = EmitFiles::new(vec![("a.html", "alpha")]);
    let (translate, translate_runs) = EmitFiles::new(vec![("a.txt", "alpha zh")]);
    let mut registry = ExecutorRegistry::new();
    registry.register("fetch", fetch);
    registry.register("translate", translate);
    let orchestrator = orchestrator_in(&temp, demo_graph(), registry);

    orchestrator.run("demo", &["translate"], false).await.unwrap();
    let report = orchestrator.run("demo", &["translate"], true).await.unwrap();
    assert_eq!(report.status_of("fetch"), Some(StageStatus::Succeeded));
    assert_eq!(report.status_of("translate"), Some(StageStatus::Succeeded));
    assert_eq!(fetch_runs.load(Ordering::SeqCst), 2);
    assert_eq!(translate_runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn changed_config_invalidates_the_fingerprint() {
    let temp = TempDir::new().unwrap();
    let (fetch, fetch_runs) = EmitFiles::new(vec![("a.html", "alpha")]);
    let (translate, translate_runs) = EmitFiles::new(vec![("a.txt", "alpha zh")]);
    let store = ManifestStore::new(temp.path().join("state"));

    let graph_with = |model: &str| {
        StageGraph::new(vec![
            StageDefinition::new("fetch", "fetch"),
            StageDefinition::new("translate", "translate")
                .depends_on("fetch")
                .with_config(json!({ "model": model })),
        ])
        .unwrap()
    };
    let mut registry = ExecutorRegistry::new();
    registry.register("fetch", fetch);
    registry.register("translate", translate);

    let orchestrator = Orchestrator::new(
        graph_with("small"),
        registry.clone(),
        store.clone(),
        temp.path().join("work"),
    )
    .unwrap();
    orchestrator.run("demo", &["translate"], false).await.unwrap();

    // Same stores, new configuration: only translate is stale.
    let orchestrator = Orchestrator::new(
        graph_with("large"),
        registry,
        store,
        temp.path().join("work"),
    )
    .unwrap();
    let report = orchestrator.run("demo", &["translate"], false).await.unwrap();
    assert_eq!(report.status_of("fetch"), Some(StageStatus::Skipped));
    assert_eq!(report.status_of("translate"), Some(StageStatus::Succeeded));
    assert_eq!(fetch_runs.load(Ordering::SeqCst), 1);
    assert_eq!(translate_runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn resume_continues_from_first_missing_manifest() {
    let temp = TempDir::new().unwrap();
    let (fetch, fetch_runs) = EmitFiles::new(vec![("a.html", "alpha")]);
    let (translate, translate_runs) = EmitFiles::new(vec![("a.txt", "alpha zh")]);
    let mut registry = ExecutorRegistry::new();
    registry.register("fetch", fetch);
    registry.register("translate", translate);
    let orchestrator = orchestrator_in(&temp, demo_graph(), registry);

    orchestrator.run("demo", &["fetch"], false).await.unwrap();
    assert_eq!(fetch_runs.load(Ordering::SeqCst), 1);

    let report = orchestrator.resume("demo").await.unwrap();
    assert_eq!(report.status_of("fetch"), Some(StageStatus::Skipped));
    assert_eq!(report.status_of("translate"), Some(StageStatus::Succeeded));
    assert_eq!(translate_runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancellation_is_honored_at_the_next_stage_boundary() {
    let temp = TempDir::new().unwrap();
    let fetch = Arc::new(CancelsAfterSuccess {
        token: std::sync::Mutex::new(None),
    });
    let (translate, translate_runs) = EmitFiles::new(vec![("a.txt", "alpha zh")]);
    let mut registry = ExecutorRegistry::new();
    registry.register("fetch", fetch.clone());
    registry.register("translate", translate);
    let orchestrator = orchestrator_in(&temp, demo_graph(), registry);
    *fetch.token.lock().unwrap() = Some(orchestrator.cancellation_token());

    let err = orchestrator.run("demo", &["translate"], false).await.unwrap_err();
    assert!(matches!(err, EngineError::Cancelled));
    assert_eq!(translate_runs.load(Ordering::SeqCst), 0);

    // The completed stage's record survives the abort intact.
    let inspected = orchestrator.inspect("demo");
    assert_eq!(inspected[0].status, StageStatus::Succeeded);
    assert_eq!(inspected[1].status, StageStatus::Pending);
}

#[test]
fn unknown_executor_fails_at_construction() {
    let temp = TempDir::new().unwrap();
    let (fetch, _) = EmitFiles::new(vec![]);
    let mut registry = ExecutorRegistry::new();
    registry.register("fetch", fetch);
    let err = Orchestrator::new(
        demo_graph(),
        registry,
        ManifestStore::new(temp.path().join("state")),
        temp.path().join("work"),
    )
    .unwrap_err();
    assert_eq!(
        err,
        ConfigError::UnknownExecutor {
            stage: "translate".into(),
            executor: "translate".into(),
        }
    );
}

#[tokio::test]
async fn corrupt_manifest_is_fatal_for_run_but_not_inspect() {
    let temp = TempDir::new().unwrap();
    let (fetch, _) = EmitFiles::new(vec![("a.html", "alpha")]);
    let (translate, _) = EmitFiles::new(vec![("a.txt", "alpha zh")]);
    let mut registry = ExecutorRegistry::new();
    registry.register("fetch", fetch);
    registry.register("translate", translate);
    let orchestrator = orchestrator_in(&temp, demo_graph(), registry);

    orchestrator.run("demo", &["translate"], false).await.unwrap();
    let manifest_path = temp.path().join("state/demo/fetch.json");
    fs::write(&manifest_path, "{broken").unwrap();

    let err = orchestrator.run("demo", &["translate"], false).await.unwrap_err();
    assert!(matches!(err, EngineError::Manifest(_)));

    let inspected = orchestrator.inspect("demo");
    assert_eq!(inspected[0].status, StageStatus::Pending);
    assert!(inspected[0].error.is_some());

    // clean is the documented way out.
    orchestrator.clean("demo", None, true).unwrap();
    let inspected = orchestrator.inspect("demo");
    assert!(inspected.iter().all(|s| s.status == StageStatus::Pending));
    let report = orchestrator.run("demo", &["translate"], false).await.unwrap();
    assert_eq!(report.status_of("fetch"), Some(StageStatus::Succeeded));
}

#[tokio::test]
async fn clean_with_artifacts_removes_work_dirs() {
    let temp = TempDir::new().unwrap();
    let (fetch, _) = EmitFiles::new(vec![("a.html", "alpha")]);
    let (translate, _) = EmitFiles::new(vec![("a.txt", "alpha zh")]);
    let mut registry = ExecutorRegistry::new();
    registry.register("fetch", fetch);
    registry.register("translate", translate);
    let orchestrator = orchestrator_in(&temp, demo_graph(), registry);

    orchestrator.run("demo", &["translate"], false).await.unwrap();
    let work_dir = orchestrator.stage_work_dir("demo", "fetch");
    assert!(work_dir.is_dir());

    orchestrator.clean("demo", None, true).unwrap();
    assert!(!work_dir.exists());
    assert!(orchestrator
        .inspect("demo")
        .iter()
        .all(|s| s.status == StageStatus::Pending));
}

#[test]
fn clean_rejects_unknown_stage_names() {
    let temp = TempDir::new().unwrap();
    let (fetch, _) = EmitFiles::new(vec![]);
    let (translate, _) = EmitFiles::new(vec![]);
    let mut registry = ExecutorRegistry::new();
    registry.register("fetch", fetch);
    registry.register("translate", translate);
    let orchestrator = orchestrator_in(&temp, demo_graph(), registry);

    let err = orchestrator.clean("demo", Some(&["upload"]), false).unwrap_err();
    assert!(matches!(err, EngineError::Config(ConfigError::UnknownStage(_))));
}

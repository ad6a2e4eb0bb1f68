use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use courier_core::{
    fingerprint_stage, hash_file, ArtifactRecord, ConfigError, Fingerprint, StageGraph,
    StageRunRecord, StageStatus,
};
use courier_logging::{courier_info, courier_warn};

use crate::executor::{ExecutorRegistry, StageInput};
use crate::manifest_store::{slugify, ManifestStore};
use crate::types::EngineError;

/// One stage's view in a run report or inspection.
#[derive(Debug, Clone)]
pub struct StageReport {
    pub name: String,
    pub status: StageStatus,
    pub fingerprint: Option<Fingerprint>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub artifact_count: usize,
    pub error: Option<String>,
}

impl StageReport {
    fn pending(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: StageStatus::Pending,
            fingerprint: None,
            started_at: None,
            finished_at: None,
            artifact_count: 0,
            error: None,
        }
    }

    fn from_record(record: &StageRunRecord) -> Self {
        Self {
            name: record.stage.clone(),
            status: record.status,
            fingerprint: Some(record.fingerprint.clone()),
            started_at: Some(record.started_at),
            finished_at: record.finished_at,
            artifact_count: record.artifacts.len(),
            error: record.error.clone(),
        }
    }
}

/// Outcome of one `run` invocation for one channel.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub channel: String,
    pub stages: Vec<StageReport>,
    /// First failed stage and its error detail, if any stage failed.
    pub first_failure: Option<(String, String)>,
}

impl RunReport {
    pub fn status_of(&self, stage: &str) -> Option<StageStatus> {
        self.stages
            .iter()
            .find(|report| report.name == stage)
            .map(|report| report.status)
    }
}

/// Sequences stages for one channel in topological order, consulting the
/// manifest store so already-succeeded work with an unchanged fingerprint
/// is skipped.
///
/// Execution within one run is strictly sequential; parallelism, if wanted,
/// belongs across channels with separate state roots, never within one.
pub struct Orchestrator {
    graph: StageGraph,
    registry: ExecutorRegistry,
    store: ManifestStore,
    work_root: PathBuf,
    cancel: CancellationToken,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("graph", &self.graph)
            .field("work_root", &self.work_root)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Fails with `ConfigError::UnknownExecutor` before anything runs when
    /// a stage names an unregistered capability.
    pub fn new(
        graph: StageGraph,
        registry: ExecutorRegistry,
        store: ManifestStore,
        work_root: PathBuf,
    ) -> Result<Self, ConfigError> {
        registry.validate(&graph)?;
        Ok(Self {
            graph,
            registry,
            store,
            work_root,
            cancel: CancellationToken::new(),
        })
    }

    /// Token for cooperative cancellation, checked at stage boundaries.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stage_work_dir(&self, channel: &str, stage: &str) -> PathBuf {
        self.work_root.join(slugify(channel)).join(stage)
    }

    /// Executes the transitive closure of `requested` in topological order.
    ///
    /// A stage failure is recorded and halts its downstream subtree for this
    /// invocation; independent subtrees still execute. The report carries
    /// per-stage outcomes; `Err` is reserved for configuration problems,
    /// manifest corruption, IO and cancellation.
    pub async fn run(
        &self,
        channel: &str,
        requested: &[&str],
        force: bool,
    ) -> Result<RunReport, EngineError> {
        let order = self.graph.closure(requested)?;
        let mut report = RunReport {
            channel: channel.to_string(),
            stages: Vec::new(),
            first_failure: None,
        };
        let mut blocked: HashSet<String> = HashSet::new();

        for stage in order {
            if self.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            if blocked.contains(&stage.name) {
                report.stages.push(StageReport::pending(&stage.name));
                continue;
            }

            // Inputs are the artifacts of direct upstream stages, resolved
            // from their manifests.
            let mut inputs: Vec<PathBuf> = Vec::new();
            for dep in &stage.depends_on {
                if let Some(record) = self.store.load(channel, dep)? {
                    inputs.extend(record.artifacts.iter().map(|a| PathBuf::from(&a.path)));
                }
            }
            let mut input_hashes = Vec::with_capacity(inputs.len());
            for path in &inputs {
                input_hashes.push(hash_file(path)?);
            }
            let fingerprint = fingerprint_stage(&stage.name, &stage.config, &input_hashes);

            let existing = self.store.load(channel, &stage.name)?;
            if !force {
                if let Some(existing) = &existing {
                    if existing.is_valid_for(&fingerprint) {
                        courier_info!(
                            "stage '{}' for channel '{channel}' is up to date; skipping",
                            stage.name
                        );
                        let mut skipped = StageReport::from_record(existing);
                        skipped.status = StageStatus::Skipped;
                        report.stages.push(skipped);
                        continue;
                    }
                }
            }

            let executor = self.registry.get(&stage.executor).ok_or_else(|| {
                EngineError::Config(ConfigError::UnknownExecutor {
                    stage: stage.name.clone(),
                    executor: stage.executor.clone(),
                })
            })?;

            let record = StageRunRecord::running(&stage.name, channel, fingerprint);
            self.store.save(&record)?;
            courier_info!("stage '{}' for channel '{channel}' running", stage.name);

            let input = StageInput {
                channel: channel.to_string(),
                config: stage.config.clone(),
                inputs,
                work_dir: self.stage_work_dir(channel, &stage.name),
            };
            match executor.execute(input).await {
                Ok(outcome) => {
                    let mut artifacts = Vec::with_capacity(outcome.artifacts.len());
                    for path in &outcome.artifacts {
                        artifacts.push(ArtifactRecord {
                            path: path.display().to_string(),
                            hash: hash_file(path)?,
                            size: fs::metadata(path)?.len(),
                        });
                    }
                    let record = record.finish_success(artifacts);
                    self.store.save(&record)?;
                    courier_info!(
                        "stage '{}' for channel '{channel}' succeeded with {} artifact(s)",
                        stage.name,
                        record.artifacts.len()
                    );
                    report.stages.push(StageReport::from_record(&record));
                }
                Err(err) => {
                    let detail = err.to_string();
                    let record = record.finish_failure(&detail);
                    self.store.save(&record)?;
                    courier_warn!(
                        "stage '{}' for channel '{channel}' failed: {detail}",
                        stage.name
                    );
                    for dependent in self.graph.dependents_of(&stage.name) {
                        blocked.insert(dependent.to_string());
                    }
                    if report.first_failure.is_none() {
                        report.first_failure = Some((stage.name.clone(), detail));
                    }
                    report.stages.push(StageReport::from_record(&record));
                }
            }
        }
        Ok(report)
    }

    /// Continues from the first stage without a valid manifest.
    pub async fn resume(&self, channel: &str) -> Result<RunReport, EngineError> {
        let all = self.graph.names();
        self.run(channel, &all, false).await
    }

    /// Read-only status of every declared stage. Missing manifests report
    /// `pending`; corrupt ones report `pending` with the error attached
    /// rather than failing the inspection.
    pub fn inspect(&self, channel: &str) -> Vec<StageReport> {
        self.graph
            .stages()
            .iter()
            .map(|stage| match self.store.load(channel, &stage.name) {
                Ok(Some(record)) => StageReport::from_record(&record),
                Ok(None) => StageReport::pending(&stage.name),
                Err(err) => {
                    let mut report = StageReport::pending(&stage.name);
                    report.error = Some(err.to_string());
                    report
                }
            })
            .collect()
    }

    /// Deletes manifests (and, optionally, artifacts) for the given stages
    /// or for all of them, after which `inspect` reports them `pending`.
    pub fn clean(
        &self,
        channel: &str,
        stages: Option<&[&str]>,
        remove_artifacts: bool,
    ) -> Result<(), EngineError> {
        if let Some(stages) = stages {
            for stage in stages {
                if self.graph.get(stage).is_none() {
                    return Err(EngineError::Config(ConfigError::UnknownStage(
                        (*stage).to_string(),
                    )));
                }
            }
        }
        self.store.delete(channel, stages)?;
        if remove_artifacts {
            let dirs: Vec<PathBuf> = match stages {
                Some(stages) => stages
                    .iter()
                    .map(|stage| self.stage_work_dir(channel, stage))
                    .collect(),
                None => vec![self.work_root.join(slugify(channel))],
            };
            for dir in dirs {
                if dir.is_dir() {
                    fs::remove_dir_all(&dir)?;
                }
            }
        }
        Ok(())
    }
}

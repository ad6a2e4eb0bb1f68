use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Fingerprint, StageStatus};

/// One file produced by a stage, recorded for idempotency and inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub path: String,
    pub hash: String,
    pub size: u64,
}

/// Persisted outcome of one stage for one channel.
///
/// Written when the stage starts (`running`) and rewritten atomically with a
/// terminal status on completion. Subsequent runs read it to decide
/// skip-vs-execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRunRecord {
    pub stage: String,
    pub channel: String,
    pub status: StageStatus,
    pub fingerprint: Fingerprint,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRecord>,
}

impl StageRunRecord {
    /// A fresh record at the moment the stage transitions to `running`.
    pub fn running(
        stage: impl Into<String>,
        channel: impl Into<String>,
        fingerprint: Fingerprint,
    ) -> Self {
        Self {
            stage: stage.into(),
            channel: channel.into(),
            status: StageStatus::Running,
            fingerprint,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
            artifacts: Vec::new(),
        }
    }

    pub fn finish_success(mut self, artifacts: Vec<ArtifactRecord>) -> Self {
        self.status = StageStatus::Succeeded;
        self.finished_at = Some(Utc::now());
        self.artifacts = artifacts;
        self.error = None;
        self
    }

    pub fn finish_failure(mut self, error: impl Into<String>) -> Self {
        self.status = StageStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error.into());
        self
    }

    /// True when a later run may skip the stage: terminal success with the
    /// fingerprint recomputed from current inputs and configuration.
    pub fn is_valid_for(&self, fingerprint: &Fingerprint) -> bool {
        self.status == StageStatus::Succeeded && &self.fingerprint == fingerprint
    }
}

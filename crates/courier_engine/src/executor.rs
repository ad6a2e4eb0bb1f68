use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

use courier_core::{ConfigError, StageGraph};

use crate::types::{RequestDescriptor, ResponseDescriptor, StageError};

/// Resolved inputs handed to a stage executor: the artifact paths of its
/// succeeded upstream stages plus its own configuration and scratch space.
#[derive(Debug, Clone)]
pub struct StageInput {
    pub channel: String,
    pub config: Value,
    pub inputs: Vec<PathBuf>,
    pub work_dir: PathBuf,
}

/// What an executor reports back: the files it produced. Hashes and sizes
/// are recorded by the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct StageOutcome {
    pub artifacts: Vec<PathBuf>,
}

/// Opaque stage capability. The orchestrator never inspects an executor's
/// behaviour, only its declared success or failure and produced artifacts.
#[async_trait::async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(&self, input: StageInput) -> Result<StageOutcome, StageError>;
}

/// Site-specific extraction collaborator used by the fetch stage: yields
/// the initial requests and maps each response to zero or more items.
pub trait ContentExtractor: Send + Sync {
    fn start_requests(&self, channel: &str) -> Vec<RequestDescriptor>;
    fn parse(&self, response: &ResponseDescriptor) -> Result<Vec<ExtractedItem>, StageError>;
}

/// One structured item extracted from a response.
#[derive(Debug, Clone)]
pub struct ExtractedItem {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Capability registry: stable string identifier -> executor. Validated
/// eagerly at startup so unknown identifiers fail before anything runs.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn StageExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, executor: Arc<dyn StageExecutor>) {
        self.executors.insert(name.into(), executor);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StageExecutor>> {
        self.executors.get(name).cloned()
    }

    /// Checks every stage's executor identifier against the registry.
    pub fn validate(&self, graph: &StageGraph) -> Result<(), ConfigError> {
        for stage in graph.stages() {
            if !self.executors.contains_key(&stage.executor) {
                return Err(ConfigError::UnknownExecutor {
                    stage: stage.name.clone(),
                    executor: stage.executor.clone(),
                });
            }
        }
        Ok(())
    }
}

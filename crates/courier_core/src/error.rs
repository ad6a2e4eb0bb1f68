use thiserror::Error;

/// Configuration problems detected before any stage runs or request is sent.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown stage '{0}'")]
    UnknownStage(String),
    #[error("stage '{0}' declared more than once")]
    DuplicateStage(String),
    #[error("stage '{stage}' depends on undeclared stage '{dependency}'")]
    UnknownDependency { stage: String, dependency: String },
    #[error("dependency cycle involving stage '{0}'")]
    CycleDetected(String),
    #[error("stage '{stage}' names unregistered executor '{executor}'")]
    UnknownExecutor { stage: String, executor: String },
    #[error("malformed session context: {0}")]
    MalformedSessionContext(String),
}

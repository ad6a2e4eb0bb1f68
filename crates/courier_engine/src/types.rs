use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use courier_core::ConfigError;

use crate::manifest_store::ManifestError;

/// One outgoing request. Fields left `None` inherit the transport defaults;
/// header overrides take precedence over session headers except for
/// `Cookie`, which is always derived from the live jar.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Bytes>,
    pub timeout: Option<Duration>,
    pub min_delay: Option<Duration>,
    pub max_delay: Option<Duration>,
    pub max_attempts: Option<u32>,
    pub backoff_factor: Option<f64>,
}

impl RequestDescriptor {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            headers: BTreeMap::new(),
            body: None,
            timeout: None,
            min_delay: None,
            max_delay: None,
            max_attempts: None,
            backoff_factor: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// The transport's view of a completed exchange. Immutable once returned.
#[derive(Debug, Clone)]
pub struct ResponseDescriptor {
    /// Final URL after redirects.
    pub url: String,
    pub status: u16,
    /// Response headers in arrival order; names are lowercased.
    pub headers: Vec<(String, String)>,
    /// Raw body bytes (content-encoding already undone by the client).
    pub body: Bytes,
    /// Charset-decoded body text; lossy for binary payloads.
    pub text: String,
    pub elapsed: Duration,
}

impl ResponseDescriptor {
    /// First header with the given name, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failure: {0}")]
    Connection(String),
    #[error("http status {0}")]
    HttpStatus(u16),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error(
        "trusted session fingerprint appears expired for {host}: \
         {consecutive} consecutive {status} responses"
    )]
    FingerprintExpired {
        host: String,
        consecutive: u32,
        status: u16,
    },
    #[error("request cancelled")]
    Cancelled,
}

/// Failure of one stage executor, surfaced to the orchestrator.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("executor failure: {0}")]
    Executor(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that abort a whole run, as opposed to failing one stage.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("run cancelled")]
    Cancelled,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

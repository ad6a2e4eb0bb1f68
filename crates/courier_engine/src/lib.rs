//! Courier engine: trusted-session HTTP transport and pipeline execution.
mod decode;
mod executor;
mod fetch_stage;
mod jar;
mod manifest_store;
mod orchestrator;
mod persist;
mod rate_limit;
mod session;
mod transport;
mod types;

pub use decode::{decode_text, DecodedText};
pub use executor::{
    ContentExtractor, ExecutorRegistry, ExtractedItem, StageExecutor, StageInput, StageOutcome,
};
pub use fetch_stage::FetchExecutor;
pub use jar::{Cookie, CookieJar};
pub use manifest_store::{ManifestError, ManifestStore};
pub use orchestrator::{Orchestrator, RunReport, StageReport};
pub use persist::{ensure_dir, AtomicFileWriter, PersistError};
pub use rate_limit::RateLimiter;
pub use session::{default_header_template, SessionContext, SessionStore};
pub use transport::{backoff_delay, FingerprintPolicy, Transport, TransportSettings};
pub use types::{
    EngineError, RequestDescriptor, ResponseDescriptor, StageError, TransportError,
};

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_logging::courier_warn;

use crate::jar::{Cookie, CookieJar};
use crate::persist::AtomicFileWriter;
use crate::PersistError;

/// Header keys that must never be replayed from a capture; the transport
/// derives them itself per request.
const EXCLUDED_HEADER_KEYS: &[&str] = &["cookie", "cookie2", "host", "content-length"];

/// The trusted header/cookie bundle captured by the external browser
/// bootstrap. Loaded as a whole; never merged field-by-field from two
/// sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    pub cookies: Vec<Cookie>,
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub captured_at: Option<DateTime<Utc>>,
}

impl SessionContext {
    /// A context built entirely from the static default template, used when
    /// no capture file is present or the capture is malformed.
    pub fn from_template(template: &BTreeMap<String, String>) -> Self {
        Self {
            cookies: Vec::new(),
            headers: template.clone(),
            captured_at: None,
        }
    }

    pub fn jar(&self) -> CookieJar {
        CookieJar::new(self.cookies.clone())
    }
}

/// Static fallback headers for runs without a captured session.
pub fn default_header_template() -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    headers.insert(
        "user-agent".to_string(),
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
         (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36"
            .to_string(),
    );
    headers.insert(
        "accept".to_string(),
        "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8"
            .to_string(),
    );
    headers.insert("accept-language".to_string(), "en-US,en;q=0.9".to_string());
    headers.insert("upgrade-insecure-requests".to_string(), "1".to_string());
    headers
}

/// Reads and rewrites the session context file.
///
/// Phase A (out of scope) drives a real browser through the site's
/// challenges and writes the capture; this store only consumes and
/// maintains it.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
    template: BTreeMap<String, String>,
}

impl SessionStore {
    pub fn new(path: PathBuf, template: BTreeMap<String, String>) -> Self {
        Self { path, template }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Loads the capture if present and well-formed, otherwise falls back,
    /// as a whole, to the default template. A file missing either `cookies`
    /// or `headers` counts as malformed; partial merges are disallowed.
    pub fn load(&self) -> SessionContext {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => return SessionContext::from_template(&self.template),
        };
        match serde_json::from_str::<SessionContext>(&raw) {
            Ok(mut context) => {
                context.headers = normalize_headers(&context.headers);
                context
            }
            Err(err) => {
                courier_warn!(
                    "session context at {} is malformed ({err}); using default template",
                    self.path.display()
                );
                SessionContext::from_template(&self.template)
            }
        }
    }

    /// Persists the context with the jar's current cookies, atomically.
    pub fn save(&self, context: &SessionContext, jar: &CookieJar) -> Result<(), PersistError> {
        let mut updated = context.clone();
        updated.cookies = jar.cookies().to_vec();
        updated.headers = normalize_headers(&updated.headers);
        let body =
            serde_json::to_vec_pretty(&updated).map_err(|e| PersistError::Io(e.into()))?;

        let dir = self
            .path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        let filename = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "session.json".to_string());
        AtomicFileWriter::new(dir).write(&filename, &body)?;
        Ok(())
    }
}

/// Lowercases keys, drops hop-by-hop and pseudo headers, and strips `zstd`
/// from `accept-encoding` since the client is not built to decode it.
fn normalize_headers(raw: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut normalized = BTreeMap::new();
    for (key, value) in raw {
        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() || key.starts_with(':') {
            continue;
        }
        if EXCLUDED_HEADER_KEYS.contains(&key.as_str()) {
            continue;
        }
        if key == "accept-encoding" {
            normalized.insert(key, strip_unsupported_encodings(value));
        } else {
            normalized.insert(key, value.clone());
        }
    }
    normalized
}

fn strip_unsupported_encodings(value: &str) -> String {
    let supported: Vec<&str> = value
        .split(',')
        .map(str::trim)
        .filter(|enc| !enc.is_empty() && !enc.eq_ignore_ascii_case("zstd"))
        .collect();
    if supported.is_empty() {
        value.to_string()
    } else {
        supported.join(", ")
    }
}

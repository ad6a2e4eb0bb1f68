use std::fmt;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Idempotency fingerprint: lowercase hex SHA-256 over a stage's resolved
/// inputs and configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hex SHA-256 of a byte slice, used for artifact content hashes.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    to_hex(&hasher.finalize())
}

/// Hex SHA-256 of a file's contents.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(hash_bytes(&bytes))
}

/// Computes the fingerprint for one stage from its name, configuration and
/// the content hashes of its resolved inputs.
///
/// Input hashes are sorted lexicographically so resolver ordering does not
/// leak into the result. The configuration is serialized through
/// `serde_json::Value`, whose map keys are ordered, giving a canonical form.
pub fn fingerprint_stage(stage_name: &str, config: &Value, input_hashes: &[String]) -> Fingerprint {
    let mut sorted = input_hashes.to_vec();
    sorted.sort();

    let mut hasher = Sha256::new();
    hasher.update(stage_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(config.to_string().as_bytes());
    for hash in &sorted {
        hasher.update([0u8]);
        hasher.update(hash.as_bytes());
    }
    Fingerprint(to_hex(&hasher.finalize()))
}

fn to_hex(digest: &[u8]) -> String {
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(&mut hex, "{byte:02x}");
    }
    hex
}

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use courier_core::StageRunRecord;

use crate::persist::{AtomicFileWriter, PersistError};

#[derive(Debug, Error)]
pub enum ManifestError {
    /// An unreadable record is fatal for the channel's run; `clean` is the
    /// only way out.
    #[error("corrupt manifest for stage '{stage}' in channel '{channel}': {detail}")]
    Corrupt {
        channel: String,
        stage: String,
        detail: String,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("persist error: {0}")]
    Persist(#[from] PersistError),
}

/// Persists one stage run record per stage per channel as JSON files under
/// `<root>/<channel-slug>/<stage>.json`, written with atomic replace.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    root: PathBuf,
}

impl ManifestStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn channel_dir(&self, channel: &str) -> PathBuf {
        self.root.join(slugify(channel))
    }

    pub fn path_for(&self, channel: &str, stage: &str) -> PathBuf {
        self.channel_dir(channel).join(format!("{stage}.json"))
    }

    /// `None` when the stage has never run for this channel.
    pub fn load(
        &self,
        channel: &str,
        stage: &str,
    ) -> Result<Option<StageRunRecord>, ManifestError> {
        let path = self.path_for(channel, stage);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(ManifestError::Io(err)),
        };
        serde_json::from_str::<StageRunRecord>(&raw)
            .map(Some)
            .map_err(|err| ManifestError::Corrupt {
                channel: channel.to_string(),
                stage: stage.to_string(),
                detail: err.to_string(),
            })
    }

    pub fn save(&self, record: &StageRunRecord) -> Result<PathBuf, ManifestError> {
        let body = serde_json::to_vec_pretty(record).map_err(|err| ManifestError::Corrupt {
            channel: record.channel.clone(),
            stage: record.stage.clone(),
            detail: err.to_string(),
        })?;
        let writer = AtomicFileWriter::new(self.channel_dir(&record.channel));
        Ok(writer.write(&format!("{}.json", record.stage), &body)?)
    }

    /// Deletes records for the given stages, or all of them when `stages`
    /// is `None`. Missing files are not an error.
    pub fn delete(&self, channel: &str, stages: Option<&[&str]>) -> Result<(), ManifestError> {
        match stages {
            Some(stages) => {
                for stage in stages {
                    remove_if_present(&self.path_for(channel, stage))?;
                }
            }
            None => {
                let dir = self.channel_dir(channel);
                if dir.is_dir() {
                    fs::remove_dir_all(&dir)?;
                }
            }
        }
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Filesystem-safe channel namespace: lowercased, anything that is not
/// alphanumeric, `-` or `_` becomes `-`.
pub fn slugify(channel: &str) -> String {
    let slug: String = channel
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = slug.trim_matches('-');
    if trimmed.is_empty() {
        "default".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_keeps_safe_chars_and_replaces_the_rest() {
        assert_eq!(slugify("demo"), "demo");
        assert_eq!(slugify("Real Estate/US"), "real-estate-us");
        assert_eq!(slugify("///"), "default");
    }
}

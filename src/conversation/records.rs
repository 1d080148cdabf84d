//! Append-only JSON record files for completed conversations.
//!
//! Each file holds a JSON array. Records are stamped with an id of the form
//! `<PREFIX>-<unix millis>` and an ISO-8601 timestamp, followed by the fields of
//! the final conversation state.

use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ConversationState;

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("Failed to create record directory {path:?}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Read records {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Serialize records: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Write records {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub id: String,
    pub timestamp: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl InteractionRecord {
    pub fn new(prefix: &str, state: &ConversationState) -> Self {
        let now = Utc::now();
        let fields = match state.as_value() {
            Value::Object(map) => map.clone(),
            other => {
                let mut map = Map::new();
                map.insert("state".to_string(), other.clone());
                map
            }
        };
        Self {
            id: format!("{}-{}", prefix, now.timestamp_millis()),
            timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            fields,
        }
    }
}

/// Writes records under one data directory.
#[derive(Debug, Clone)]
pub struct RecordStore {
    dir: PathBuf,
}

impl RecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    /// Load every record in `file_name`. Missing or unreadable files read as empty.
    pub fn load(&self, file_name: &str) -> Vec<Value> {
        let path = self.path_for(file_name);
        match read_records(&path) {
            Ok(records) => records,
            Err(e) => {
                log::warn!("Records: failed to read {:?}: {}", path, e);
                Vec::new()
            }
        }
    }

    /// Existing records for an append. A file that does not hold a JSON array
    /// is renamed aside so its contents survive the rewrite.
    fn load_for_append(&self, path: &Path) -> Result<Vec<Value>, RecordError> {
        match read_records(path) {
            Ok(records) => Ok(records),
            Err(ReadError::Parse(e)) => {
                let stamp = Utc::now().timestamp_millis();
                let aside = path.with_extension(format!("unreadable-{}.json", stamp));
                log::warn!(
                    "Records: {:?} is not a JSON array ({}), moving it to {:?}",
                    path,
                    e,
                    aside
                );
                std::fs::rename(path, &aside).map_err(|source| RecordError::Write {
                    path: aside.clone(),
                    source,
                })?;
                Ok(Vec::new())
            }
            Err(ReadError::Io(source)) => Err(RecordError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Append a record for `state` and return it.
    pub fn append(
        &self,
        file_name: &str,
        prefix: &str,
        state: &ConversationState,
    ) -> Result<InteractionRecord, RecordError> {
        let record = InteractionRecord::new(prefix, state);
        let path = self.path_for(file_name);
        let mut records = self.load_for_append(&path)?;
        records.push(serde_json::to_value(&record)?);

        write_atomic(&path, &serde_json::to_string_pretty(&records)?)?;

        log::info!("Records: saved {} to {:?}", record.id, path);
        Ok(record)
    }
}

enum ReadError {
    Io(std::io::Error),
    Parse(serde_json::Error),
}

impl std::fmt::Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadError::Io(e) => e.fmt(f),
            ReadError::Parse(e) => e.fmt(f),
        }
    }
}

/// A missing file holds no records.
fn read_records(path: &Path) -> Result<Vec<Value>, ReadError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).map_err(ReadError::Parse),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(ReadError::Io(e)),
    }
}

/// Write to a temp file in the same directory, then rename over the target.
fn write_atomic(path: &Path, contents: &str) -> Result<(), RecordError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| RecordError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, contents).map_err(|source| RecordError::Write {
        path: tmp_path.clone(),
        source,
    })?;

    // Windows refuses to rename over an existing file.
    if cfg!(windows) && path.exists() {
        if let Err(source) = std::fs::remove_file(path) {
            if source.kind() != std::io::ErrorKind::NotFound {
                return Err(RecordError::Write {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }
    }

    std::fs::rename(&tmp_path, path).map_err(|source| RecordError::Write {
        path: path.to_path_buf(),
        source,
    })
}

//! Flat-file result artifacts: one JSON array per (country, requested code), consumed once.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use tradestat_core::{ConsolidatedRecord, HsLevel};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tradestat-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no artifact or record for {key}")]
    NotFound { key: String },
    #[error("artifact {path} is not a valid record array")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("serializing artifact {key}")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("io error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SavedArtifact {
    pub key: String,
    pub path: PathBuf,
    pub records: usize,
}

/// Strips whitespace, then anything that is not an ASCII letter or digit.
pub fn sanitize_country(country_code: &str) -> String {
    country_code
        .chars()
        .filter(|c| !c.is_whitespace())
        .filter(char::is_ascii_alphanumeric)
        .collect()
}

pub fn artifact_key(country_code: &str, requested_code: &str) -> String {
    format!("{}_{requested_code}", sanitize_country(country_code))
}

/// Exact `HSCode` match first; otherwise shorten `code` one character at a time and take the
/// first record whose code starts with the prefix, never going below `level_digits` characters.
/// Without a numeric level only the exact match is tried.
pub fn find_record<'a>(
    records: &'a [ConsolidatedRecord],
    code: &str,
    level_digits: Option<usize>,
) -> Option<&'a ConsolidatedRecord> {
    if let Some(hit) = records.iter().find(|r| r.hs_code == code) {
        return Some(hit);
    }
    let level_digits = level_digits?;

    let mut prefix: Vec<char> = code.chars().collect();
    while prefix.len() > level_digits {
        prefix.pop();
        let needle: String = prefix.iter().collect();
        if let Some(hit) = records.iter().find(|r| r.hs_code.starts_with(&needle)) {
            return Some(hit);
        }
    }
    None
}

/// Directory of one-shot result artifacts.
///
/// `consume` is serialised through a lock so two readers in this process cannot both be
/// served the same artifact.
#[derive(Debug)]
pub struct ResultStore {
    root: PathBuf,
    consume_lock: Mutex<()>,
}

impl ResultStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            consume_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_path(&self, country_code: &str, code: &str) -> PathBuf {
        self.root
            .join(format!("{}.json", artifact_key(country_code, code)))
    }

    /// Writes the records as a pretty JSON array, replacing any artifact with the same key.
    pub async fn save(
        &self,
        country_code: &str,
        requested_code: &str,
        records: &[ConsolidatedRecord],
    ) -> Result<SavedArtifact, StoreError> {
        let key = artifact_key(country_code, requested_code);
        let path = self.artifact_path(country_code, requested_code);

        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StoreError::io(&self.root, e))?;

        let bytes = serde_json::to_vec_pretty(records).map_err(|source| StoreError::Serialize {
            key: key.clone(),
            source,
        })?;

        let temp_path = self
            .root
            .join(format!(".{key}.{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| StoreError::io(&temp_path, e))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| StoreError::io(&temp_path, e))?;
        file.flush()
            .await
            .map_err(|e| StoreError::io(&temp_path, e))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::io(&path, err));
        }

        info!(%key, records = records.len(), path = %path.display(), "saved result artifact");
        Ok(SavedArtifact {
            key,
            path,
            records: records.len(),
        })
    }

    /// Looks up one record and deletes the backing artifact on success.
    ///
    /// A failed delete is logged and otherwise ignored.
    pub async fn consume(
        &self,
        country_code: &str,
        code: &str,
        hs_level: &HsLevel,
    ) -> Result<ConsolidatedRecord, StoreError> {
        let key = artifact_key(country_code, code);
        let path = self.artifact_path(country_code, code);
        let _guard = self.consume_lock.lock().await;

        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound { key });
            }
            Err(err) => return Err(StoreError::io(&path, err)),
        };
        let records: Vec<ConsolidatedRecord> =
            serde_json::from_str(&text).map_err(|source| StoreError::Corrupt {
                path: path.clone(),
                source,
            })?;

        let record = find_record(&records, code, hs_level.digits())
            .cloned()
            .ok_or_else(|| StoreError::NotFound { key: key.clone() })?;

        match fs::remove_file(&path).await {
            Ok(()) => debug!(%key, "consumed result artifact"),
            Err(err) => warn!(%key, error = %err, "failed to delete consumed artifact"),
        }
        Ok(record)
    }
}

//! JSON file run marker.
//!
//! Persists the last end-of-day run date so a restart later in the same
//! session does not clear the watchlists a second time.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::application::ports::{PersistenceError, RunMarkerStore};

#[derive(Debug, Serialize, Deserialize)]
struct MarkerFile {
    last_run: NaiveDate,
}

/// Run marker stored as a small JSON document.
#[derive(Debug, Clone)]
pub struct FileRunMarkerStore {
    path: PathBuf,
}

impl FileRunMarkerStore {
    /// Store at `path`. The file is created on the first recorded run.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the marker file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RunMarkerStore for FileRunMarkerStore {
    async fn last_run(&self) -> Result<Option<NaiveDate>, PersistenceError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                let marker: MarkerFile = serde_json::from_slice(&bytes)?;
                Ok(Some(marker.last_run))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn record_run(&self, date: NaiveDate) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let body = serde_json::to_vec_pretty(&MarkerFile { last_run: date })?;
        let staging = self.path.with_extension("tmp");
        tokio::fs::write(&staging, body).await?;
        tokio::fs::rename(&staging, &self.path).await?;

        tracing::debug!(path = %self.path.display(), %date, "Run marker written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_means_never_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRunMarkerStore::new(dir.path().join("marker.json"));
        assert_eq!(store.last_run().await.unwrap(), None);
    }

    #[tokio::test]
    async fn records_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRunMarkerStore::new(dir.path().join("state").join("marker.json"));
        let date = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();

        store.record_run(date).await.unwrap();
        assert_eq!(store.last_run().await.unwrap(), Some(date));

        let reopened = FileRunMarkerStore::new(store.path());
        assert_eq!(reopened.last_run().await.unwrap(), Some(date));
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("marker.json");
        std::fs::write(&path, b"not json").unwrap();

        let err = FileRunMarkerStore::new(&path).last_run().await.unwrap_err();
        assert!(matches!(err, PersistenceError::Serialization(_)));
    }
}

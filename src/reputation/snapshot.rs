use crate::error::GateError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Persisted set of banned origins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BanSnapshot {
    pub banned: Vec<String>,
    pub last_updated: DateTime<Utc>,
}

impl BanSnapshot {
    pub fn new(mut banned: Vec<String>) -> Self {
        banned.sort();
        banned.dedup();
        Self {
            banned,
            last_updated: Utc::now(),
        }
    }
}

/// Ban snapshot file, rewritten whole on every save.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// `Ok(None)` when no snapshot has been written yet.
    pub async fn load(&self) -> Result<Option<BanSnapshot>, GateError> {
        let content = match tokio::fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(GateError::persistence(&self.path, e)),
        };

        serde_json::from_slice(&content)
            .map(Some)
            .map_err(|e| GateError::corrupt(&self.path, e))
    }

    /// Write to a sibling temp file and rename it over the snapshot, so a
    /// crash mid-write leaves the previous snapshot intact.
    pub async fn save(&self, snapshot: &BanSnapshot) -> Result<(), GateError> {
        let data = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| GateError::corrupt(&self.path, e))?;
        let temp_path = self.temp_path();

        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(|e| GateError::persistence(&temp_path, e))?;
        file.write_all(&data)
            .await
            .map_err(|e| GateError::persistence(&temp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| GateError::persistence(&temp_path, e))?;
        drop(file);

        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| GateError::persistence(&self.path, e))
    }
}

//! Checkpoint storage for analysis state.

use crate::error::StoreError;
use crate::models::AnalysisState;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

/// Key-value store of analysis states keyed by analysis id.
///
/// `get` hands out owned snapshots; callers never see live state.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<AnalysisState>, StoreError>;
    async fn set(&self, state: &AnalysisState) -> Result<(), StoreError>;
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;
}

/// In-process store. State is lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    states: RwLock<HashMap<String, AnalysisState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<AnalysisState>, StoreError> {
        Ok(self.states.read().await.get(id).cloned())
    }

    async fn set(&self, state: &AnalysisState) -> Result<(), StoreError> {
        self.states
            .write()
            .await
            .insert(state.id.clone(), state.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.states.write().await.remove(id).is_some())
    }
}

/// One pretty-printed JSON file per analysis in a directory.
///
/// Writes go to a temporary file in the same directory which is then
/// renamed over the target, so a reader never sees a half-written state.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Creates the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> PathBuf {
        // Ids are uuids in practice; anything path-like is flattened.
        let safe: String = id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn get(&self, id: &str) -> Result<Option<AnalysisState>, StoreError> {
        match tokio::fs::read(self.path_for(id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, state: &AnalysisState) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(state)?;
        let dir = self.dir.clone();
        let target = self.path_for(&state.id);

        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&bytes)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&target).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

        debug!(analysis = %state.id, "Checkpoint written");
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

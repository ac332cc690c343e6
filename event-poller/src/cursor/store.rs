use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::CursorError;

/// Durable home for the opaque last-run state.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// `None` when nothing was ever saved.
    async fn load(&self) -> Result<Option<Vec<u8>>, CursorError>;

    async fn save(&self, state: &[u8]) -> Result<(), CursorError>;
}

/// Keeps the state in a single file. Saves go through a temp file and a rename, so a crash
/// mid-write leaves the previous state in place.
pub struct FileCursorStore {
    path: PathBuf,
}

impl FileCursorStore {
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
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_error(&self, source: std::io::Error) -> CursorError {
        CursorError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl CursorStore for FileCursorStore {
    async fn load(&self) -> Result<Option<Vec<u8>>, CursorError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_error(e)),
        }
    }

    async fn save(&self, state: &[u8]) -> Result<(), CursorError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }

        let temp_path = self.temp_path();
        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(|e| self.io_error(e))?;
        file.write_all(state).await.map_err(|e| self.io_error(e))?;
        file.sync_all().await.map_err(|e| self.io_error(e))?;
        drop(file);

        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| self.io_error(e))
    }
}

/// Process-local store, for tests and for running without persistence.
#[derive(Default)]
pub struct MemoryCursorStore {
    state: Mutex<Option<Vec<u8>>>,
}

impl MemoryCursorStore {
    pub fn with_state(state: Vec<u8>) -> Self {
        Self {
            state: Mutex::new(Some(state)),
        }
    }

    pub async fn state(&self) -> Option<Vec<u8>> {
        self.state.lock().await.clone()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self) -> Result<Option<Vec<u8>>, CursorError> {
        Ok(self.state().await)
    }

    async fn save(&self, state: &[u8]) -> Result<(), CursorError> {
        *self.state.lock().await = Some(state.to_vec());
        Ok(())
    }
}

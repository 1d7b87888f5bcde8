use super::{MemoryBackend, MetadataBackend, SqliteBackend};
use crate::{KeelError, Result};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct BackendBuilder {
    kind: Option<String>,
    sqlite_path: Option<PathBuf>,
}

impl BackendBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn sqlite_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.sqlite_path = Some(path.into());
        self
    }

    fn resolve_kind(&self) -> Result<String> {
        let kind = self
            .kind
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        if kind.is_empty() {
            return Err(KeelError::Config(
                "metadata backend kind cannot be empty".to_string(),
            ));
        }

        Ok(kind)
    }

    pub fn build(&self) -> Result<Arc<dyn MetadataBackend>> {
        let kind = self.resolve_kind()?;

        match kind.as_str() {
            "memory" => Ok(Arc::new(MemoryBackend::new())),
            "sqlite" => {
                let path = self.sqlite_path.clone().ok_or_else(|| {
                    KeelError::Config("sqlite path is required for sqlite backend".to_string())
                })?;
                if path.as_os_str().is_empty() {
                    return Err(KeelError::Config(
                        "sqlite path cannot be empty for sqlite backend".to_string(),
                    ));
                }

                let backend = SqliteBackend::new(path)?;
                Ok(Arc::new(backend))
            }
            other => Err(KeelError::Config(format!(
                "unsupported metadata backend: {}",
                other
            ))),
        }
    }
}

//! Persisting rendered glider configs.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::model::GliderConfig;

/// Persists a rendered [`GliderConfig`].
pub trait ConfigWriter: Send + Sync {
    fn write(&self, config: &GliderConfig) -> Result<()>;

    /// Path the tunnel should be pointed at.
    fn path(&self) -> &Path;
}

/// Writes the config to a fixed file, creating parent directories.
///
/// The text goes to a sibling temp file first and is renamed into place so
/// a running glider never reads a half-written config.
#[derive(Debug, Clone)]
pub struct FileConfigWriter {
    path: PathBuf,
}

impl FileConfigWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigWriter for FileConfigWriter {
    fn write(&self, config: &GliderConfig) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, config.render())
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to move config into {}", self.path.display()))?;
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

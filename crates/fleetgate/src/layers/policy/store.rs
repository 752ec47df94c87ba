use super::registry::RegistryFile;
use anyhow::Context;
use std::path::PathBuf;

/// Durable home of the registry; approvals write through it before a new
/// snapshot is published.
pub trait RegistryStore: Send + Sync {
    fn save(&self, file: &RegistryFile) -> anyhow::Result<()>;
}

pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RegistryStore for JsonFileStore {
    fn save(&self, file: &RegistryFile) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let payload = serde_json::to_vec_pretty(file).context("failed to encode registry")?;
        let staging = self.path.with_extension("json.tmp");
        std::fs::write(&staging, payload)
            .with_context(|| format!("failed to write {}", staging.display()))?;
        std::fs::rename(&staging, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

/// Keeps approvals in memory only.
pub struct EphemeralStore;

impl RegistryStore for EphemeralStore {
    fn save(&self, _file: &RegistryFile) -> anyhow::Result<()> {
        Ok(())
    }
}

//! On-disk JSON cache of selected kernel configurations.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::KernelConfig;
use crate::error::Result;

/// Location of the cache file for one kernel, static key and device.
///
/// Spaces in the device name become underscores.
pub fn cache_file_path(root: &Path, kernel_name: &str, static_key: &str, device_name: &str) -> PathBuf {
    let device = device_name.replace(' ', "_");
    root.join("configs")
        .join(kernel_name)
        .join(format!("{static_key},{device}.json"))
}

/// Dynamic key to configuration, backed by one JSON file.
#[derive(Debug, Clone)]
pub struct ConfigCache {
    path: PathBuf,
    entries: BTreeMap<String, Option<KernelConfig>>,
}

impl ConfigCache {
    /// Load the cache at `path`. A missing file yields an empty cache.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let entries: BTreeMap<String, Option<KernelConfig>> = serde_json::from_str(&raw)?;
            debug!(path = %path.display(), entries = entries.len(), "loaded kernel config cache");
            entries
        } else {
            warn!(path = %path.display(), "kernel config cache does not exist");
            BTreeMap::new()
        };
        Ok(Self { path, entries })
    }

    /// Write the cache, creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(&self.entries)?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` if the key was never seen; `Some(None)` if it is cached as null.
    pub fn get(&self, key: &str) -> Option<Option<&KernelConfig>> {
        self.entries.get(key).map(Option::as_ref)
    }

    pub fn insert(&mut self, key: impl Into<String>, config: Option<KernelConfig>) {
        self.entries.insert(key.into(), config);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

//! Plugin host configuration.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::error::HostError;

/// Configuration for the plugin host.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Directory relative config and module paths are resolved against
    pub base_dir: PathBuf,

    /// Allow a context to load more than one distinct module
    pub allow_multiple_modules: bool,
}

impl HostConfig {
    /// Create a new configuration rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            allow_multiple_modules: false,
        }
    }

    /// Allow loading several distinct modules into one context.
    pub fn allow_multiple_modules(mut self, allow: bool) -> Self {
        self.allow_multiple_modules = allow;
        self
    }

    /// Resolve `path` against the base directory and normalize it.
    ///
    /// Existing paths are canonicalized; others are cleaned lexically.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        };
        std::fs::canonicalize(&joined).unwrap_or_else(|_| clean_path(&joined))
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        // Directory of the running executable, like an application base directory
        let base_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));

        Self::new(base_dir)
    }
}

pub(crate) fn clean_path(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !cleaned.pop() {
                    cleaned.push(component);
                }
            }
            other => cleaned.push(other),
        }
    }
    cleaned
}

/// Runtime configuration descriptor, read from a JSON file.
///
/// ```json
/// {
///   "runtime": { "name": "native", "abiVersion": 1 },
///   "properties": { "app.name": "demo" }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// Runtime the descriptor targets
    pub runtime: RuntimeSpec,

    /// Free-form string properties for the host
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSpec {
    pub name: String,
    pub abi_version: u32,
}

impl RuntimeConfig {
    /// Read and parse a descriptor.
    pub fn from_file(path: &Path) -> Result<Self, HostError> {
        if !path.is_file() {
            return Err(HostError::InitializationFailed(format!(
                "Runtime config not found: {:?}",
                path
            )));
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content).map_err(|e| match e {
            HostError::InitializationFailed(msg) => {
                HostError::InitializationFailed(format!("{:?}: {}", path, msg))
            }
            other => other,
        })
    }

    /// Parse a descriptor from JSON text.
    pub fn parse(content: &str) -> Result<Self, HostError> {
        serde_json::from_str(content).map_err(|e| {
            HostError::InitializationFailed(format!("Failed to parse runtime config: {}", e))
        })
    }

    /// Get a property value.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

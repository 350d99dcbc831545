//! Read-only store of named JSON fixtures

use serde_json::Value;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use crate::error::{HarnessError, HarnessResult};

/// Fixture store rooted at a directory; `credentials` maps to `credentials.json`
#[derive(Debug, Clone)]
pub struct FixtureStore {
    root: PathBuf,
}

impl FixtureStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a fixture by name, rejecting names that escape the root
    pub fn path_of(&self, name: &str) -> HarnessResult<PathBuf> {
        let rel = Path::new(name);
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if name.is_empty() || escapes {
            return Err(HarnessError::Fixture {
                name: name.to_string(),
                reason: "fixture names must be relative paths inside the fixtures directory".into(),
            });
        }

        let mut path = self.root.join(rel);
        if path.extension().is_none() {
            path.set_extension("json");
        }
        Ok(path)
    }

    pub fn load(&self, name: &str) -> HarnessResult<Value> {
        let path = self.path_of(name)?;
        debug!("Loading fixture {} from {}", name, path.display());

        let content = std::fs::read_to_string(&path).map_err(|e| HarnessError::Fixture {
            name: name.to_string(),
            reason: format!("cannot read {}: {}", path.display(), e),
        })?;

        serde_json::from_str(&content).map_err(|e| HarnessError::Fixture {
            name: name.to_string(),
            reason: format!("invalid JSON: {}", e),
        })
    }
}

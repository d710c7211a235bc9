//! Flow definitions on disk, one JSON file per flow

use std::fs;
use std::path::{Path, PathBuf};

use super::model::GleipFlow;
use crate::error::{GleipError, Result};

/// Listing entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSummary {
    pub id: String,
    pub name: String,
    pub steps: usize,
    pub path: PathBuf,
}

/// Directory of `<id>.json` flow files
#[derive(Debug, Clone)]
pub struct FlowStore {
    dir: PathBuf,
}

impl FlowStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(GleipError::Store(format!("invalid flow id '{}'", id)));
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }

    /// All readable flows, sorted by name. Unparseable files are skipped.
    pub fn list(&self) -> Result<Vec<FlowSummary>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut flows = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match load_file(&path) {
                Ok(flow) => flows.push(FlowSummary {
                    id: flow.id,
                    name: flow.name,
                    steps: flow.steps.len(),
                    path,
                }),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable flow file"),
            }
        }

        flows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(flows)
    }

    pub fn load(&self, id: &str) -> Result<GleipFlow> {
        let path = self.path_for(id)?;
        if !path.exists() {
            return Err(GleipError::Store(format!("flow '{}' not found", id)));
        }
        load_file(&path)
    }

    /// Write `flow`, replacing any earlier version
    pub fn save(&self, flow: &GleipFlow) -> Result<PathBuf> {
        let path = self.path_for(&flow.id)?;
        fs::create_dir_all(&self.dir)?;

        let json = serde_json::to_string_pretty(flow)
            .map_err(|e| GleipError::Store(format!("failed to serialize flow '{}': {}", flow.id, e)))?;
        fs::write(&path, json)?;

        tracing::debug!(id = %flow.id, path = %path.display(), "Flow saved");
        Ok(path)
    }

    /// Remove a flow. Returns false if it did not exist.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let path = self.path_for(id)?;
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        Ok(true)
    }
}

/// Read a flow definition from any path
pub fn load_file(path: &Path) -> Result<GleipFlow> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| GleipError::Store(format!("failed to parse {}: {}", path.display(), e)))
}

//! Where scripts come from, and how free text becomes a script reference.

use crate::config::{Script, Variables};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

/// Read-only script lookup by id.
#[async_trait]
pub trait ScriptStore: Send + Sync {
    async fn load(&self, id: &str) -> Result<Script>;
}

/// Scripts stored as `<dir>/<id>.json`, `.yaml` or `.yml`.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(Error::Config(format!("invalid script id '{}'", id)));
        }
        for ext in ["json", "yaml", "yml"] {
            let path = self.root.join(format!("{}.{}", id, ext));
            if path.is_file() {
                return Ok(path);
            }
        }
        Err(Error::Config(format!(
            "script '{}' not found in {}",
            id,
            self.root.display()
        )))
    }
}

#[async_trait]
impl ScriptStore for DirectoryStore {
    async fn load(&self, id: &str) -> Result<Script> {
        let path = self.path_for(id)?;
        debug!("Loading script {} from {}", id, path.display());
        let script = Script::load(&path)?;
        Ok(script.with_id(id))
    }
}

/// Scripts held in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    scripts: RwLock<HashMap<String, Script>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: impl Into<String>, script: Script) {
        let id = id.into();
        self.scripts.write().insert(id.clone(), script.with_id(id));
    }

    pub fn with(self, id: impl Into<String>, script: Script) -> Self {
        self.insert(id, script);
        self
    }
}

#[async_trait]
impl ScriptStore for MemoryStore {
    async fn load(&self, id: &str) -> Result<Script> {
        self.scripts
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::Config(format!("script '{}' not found", id)))
    }
}

/// What a classifier made of a piece of free text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentMatch {
    pub category: String,
    #[serde(default)]
    pub parameters: Variables,
    /// Script id to run, if the intent maps to one.
    pub script_reference: Option<String>,
}

/// Maps free text to a script. Implemented outside this crate.
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(&self, text: &str) -> Option<IntentMatch>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_directory_store_finds_extensions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("search.json"),
            r#"{"title": "Search", "steps": [{"type": "navigate", "url": "https://example.com"}]}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("login.yml"),
            "title: Login\nsteps:\n  - type: navigate\n    url: https://example.com/login\n",
        )
        .unwrap();

        let store = DirectoryStore::new(dir.path());
        let search = store.load("search").await.unwrap();
        assert_eq!(search.id, "search");
        assert_eq!(search.steps.len(), 1);
        let login = store.load("login").await.unwrap();
        assert_eq!(login.title, "Login");

        assert!(store.load("missing").await.is_err());
        assert!(store.load("../etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let script = Script::parse(r#"{"title": "T", "steps": []}"#).unwrap();
        let store = MemoryStore::new().with("t", script);
        assert_eq!(store.load("t").await.unwrap().id, "t");
        assert!(store.load("u").await.is_err());
    }
}

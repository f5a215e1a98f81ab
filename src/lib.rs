//! # eoka-pilot
//!
//! Script-driven browser automation. Scripts are JSON (or YAML) documents in
//! the DevTools Recorder shape; they run against a live page over a
//! remote-debugging channel, with sessions that survive unexpected detaches
//! and a relay that correlates requests across independently-lived tasks.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use eoka_pilot::{protocol::EokaClient, LaunchConfig, Runner, RunOptions, Script, Settings, Variables};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> eoka_pilot::Result<()> {
//! let script = Script::load("search.json")?;
//! let client = Arc::new(EokaClient::launch(&LaunchConfig::default()).await?);
//! let target = client.initial_target().await?;
//!
//! let runner = Runner::new(client, Settings::default());
//! let result = runner
//!     .run(&script, &Variables::new().set("q", "rust"), RunOptions::new(target))
//!     .await;
//! println!("success: {}", result.success);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod protocol;
pub mod relay;
pub mod resolver;
pub mod runner;
pub mod session;
pub mod store;
pub mod testing;

pub use config::{Action, Condition, Script, Selectors, Settings, Step, StepKind, Variables};
pub use protocol::{LaunchConfig, ProtocolClient, ProtocolError};
pub use relay::{Command, Orchestrator, OrchestratorHandle, Port, RelayError, Reply, WorkerHost};
pub use runner::{ExecutionResult, ProgressEvent, RunOptions, Runner, ScriptError};
pub use session::{SessionHandle, SessionManager, SessionState};
pub use store::{DirectoryStore, IntentClassifier, IntentMatch, MemoryStore, ScriptStore};

/// Result type for eoka-pilot operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading scripts or talking to the browser.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("json parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_script() {
        let json = r#"{"title": "Test", "steps": []}"#;
        let script = Script::parse(json).unwrap();
        assert_eq!(script.title, "Test");
        assert!(script.steps.is_empty());
        assert!(script.parameters.is_empty());
        assert!(script.description.is_none());
    }

    #[test]
    fn test_parse_recorder_script() {
        let json = r##"{
  "title": "Search",
  "description": "search for a term",
  "parameters": {"q": "rust"},
  "steps": [
    {"type": "setViewport", "width": 1280, "height": 720, "deviceScaleFactor": 1, "isMobile": false},
    {"type": "navigate", "url": "https://example.com/?q={{q}}"},
    {"type": "click", "selectors": [["aria/Search"], ["#search"]], "offsetX": 10, "offsetY": 5},
    {"type": "change", "selectors": [["#search"]], "value": "{{q}}"},
    {"type": "keyDown", "key": "Enter"},
    {"type": "keyUp", "key": "Enter"}
  ]
}"##;
        let script = Script::parse(json).unwrap();
        assert_eq!(script.steps.len(), 6);
        assert_eq!(script.parameters.get("q"), Some("rust"));
        assert_eq!(script.steps[0].kind(), StepKind::SetViewport);
        assert_eq!(script.steps[3].kind(), StepKind::Type);
    }

    #[test]
    fn test_parse_yaml_script() {
        let yaml = r#"
title: "Yaml"
parameters:
  user: alice
steps:
  - type: navigate
    url: "https://example.com"
  - type: steps
    loop:
      iterations: 2
    steps:
      - type: scroll
        y: 200
"#;
        let script = Script::parse_yaml(yaml).unwrap();
        assert_eq!(script.steps.len(), 2);
        assert_eq!(script.step_count(), 3);
        assert!(script.steps[1].repeat.is_some());
    }

    #[test]
    fn test_unknown_step_rejected_at_load() {
        let json = r#"{"title": "Bad", "steps": [{"type": "navigate", "url": "x"}, {"type": "fly"}]}"#;
        let err = Script::parse(json).unwrap_err();
        assert!(matches!(err, Error::Json(_)));
        assert!(err.to_string().contains("fly"));
    }

    #[test]
    fn test_validation_errors() {
        let json = r#"{"steps": [{"type": "navigate", "url": ""}]}"#;
        assert!(matches!(Script::parse(json), Err(Error::Config(_))));

        let json = r#"{"steps": [{"type": "click", "selectors": []}]}"#;
        assert!(matches!(Script::parse(json), Err(Error::Config(_))));
    }

    #[test]
    fn test_nesting_depth_limit() {
        let mut step = serde_json::json!({"type": "scroll", "y": 1});
        for _ in 0..(config::schema::MAX_NESTING_DEPTH + 2) {
            step = serde_json::json!({"type": "steps", "steps": [step]});
        }
        let json = serde_json::json!({"steps": [step]}).to_string();
        assert!(matches!(Script::parse(&json), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_from_file_sets_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("login.json");
        std::fs::write(&path, r#"{"title": "Login", "steps": []}"#).unwrap();
        let script = Script::load(&path).unwrap();
        assert_eq!(script.id, "login");
    }
}

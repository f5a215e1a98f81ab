mod executor;

pub use executor::{ExecutionContext, ACTION_JS};

use crate::config::{Script, Settings, StepKind, Variables};
use crate::protocol::{ProtocolClient, ProtocolError};
use crate::resolver::{ResolveError, Resolver};
use crate::session::SessionManager;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Outcome codes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    #[serde(rename = "success")]
    Success,
    StepFailed,
    SessionLost,
    NotFound,
    RelayTimeout,
    RelayDisconnected,
    InvalidCommand,
    Cancelled,
}

impl ResultCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::StepFailed => "StepFailed",
            Self::SessionLost => "SessionLost",
            Self::NotFound => "NotFound",
            Self::RelayTimeout => "RelayTimeout",
            Self::RelayDisconnected => "RelayDisconnected",
            Self::InvalidCommand => "InvalidCommand",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a single step failed.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StepFailure {
    #[error("no element matched {selectors}")]
    NotFound { selectors: String },

    #[error("timed out after {timeout_ms}ms waiting for {what}")]
    Timeout { what: String, timeout_ms: u64 },

    #[error("session detached: {message}")]
    Detached { message: String },

    #[error("{message}")]
    Protocol { message: String },

    #[error("invalid step: {message}")]
    Invalid { message: String },
}

impl StepFailure {
    pub fn is_detach(&self) -> bool {
        matches!(self, Self::Detached { .. })
    }
}

impl From<ProtocolError> for StepFailure {
    fn from(e: ProtocolError) -> Self {
        if e.is_detach() {
            Self::Detached {
                message: e.to_string(),
            }
        } else {
            Self::Protocol {
                message: e.to_string(),
            }
        }
    }
}

impl From<ResolveError> for StepFailure {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::NotFound { selectors, .. } => Self::NotFound { selectors },
            ResolveError::Protocol(e) => e.into(),
        }
    }
}

/// Errors that end a script run.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScriptError {
    #[error("step {path} ({kind}) failed: {cause}")]
    StepFailed {
        index: usize,
        path: String,
        kind: StepKind,
        cause: StepFailure,
    },

    #[error("session lost during step {path} ({kind})")]
    SessionLost {
        index: usize,
        path: String,
        kind: StepKind,
    },

    #[error("cancelled before step {index}")]
    Cancelled { index: usize },

    #[error("could not attach: {0}")]
    Setup(String),
}

impl ScriptError {
    pub fn code(&self) -> ResultCode {
        match self {
            Self::StepFailed {
                cause: StepFailure::NotFound { .. },
                ..
            } => ResultCode::NotFound,
            Self::StepFailed { .. } => ResultCode::StepFailed,
            // a target we cannot attach to is a session failure
            Self::SessionLost { .. } | Self::Setup(_) => ResultCode::SessionLost,
            Self::Cancelled { .. } => ResultCode::Cancelled,
        }
    }

    /// Top-level index of the step that failed.
    pub fn step_index(&self) -> Option<usize> {
        match self {
            Self::StepFailed { index, .. }
            | Self::SessionLost { index, .. }
            | Self::Cancelled { index } => Some(*index),
            Self::Setup(_) => None,
        }
    }

    pub fn step_path(&self) -> Option<&str> {
        match self {
            Self::StepFailed { path, .. } | Self::SessionLost { path, .. } => Some(path),
            _ => None,
        }
    }

    pub fn kind(&self) -> Option<StepKind> {
        match self {
            Self::StepFailed { kind, .. } | Self::SessionLost { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Emitted after every completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub script_id: String,
    /// Top-level step index.
    pub step_index: usize,
    /// Dotted location for nested steps, e.g. `2.0.1`.
    pub path: String,
    pub kind: StepKind,
}

/// Cancellation flag, checked between steps.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Whether both flags are clones of the same flag.
    pub fn same_as(&self, other: &CancelFlag) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Per-run options.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Target (tab) to run against.
    pub target: String,
    /// Detach once the script finishes instead of keeping the session.
    pub detach: bool,
    pub cancel: CancelFlag,
    pub progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl RunOptions {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            detach: false,
            cancel: CancelFlag::new(),
            progress: None,
        }
    }

    pub fn detach(mut self, detach: bool) -> Self {
        self.detach = detach;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        self.progress = Some(tx);
        self
    }
}

/// Result of running a script. Failures are data, never panics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub code: ResultCode,
    pub tab_id: Option<String>,
    pub error: Option<String>,
    pub step_index: Option<usize>,
    pub step_path: Option<String>,
    pub step_kind: Option<StepKind>,
    /// Completed steps, nested ones included.
    pub steps_executed: usize,
    pub duration_ms: u64,
}

impl ExecutionResult {
    /// A failure that happened before any step ran.
    pub fn failed(code: ResultCode, error: impl Into<String>) -> Self {
        Self {
            success: false,
            code,
            tab_id: None,
            error: Some(error.into()),
            step_index: None,
            step_path: None,
            step_kind: None,
            steps_executed: 0,
            duration_ms: 0,
        }
    }
}

/// Runs scripts against targets, sharing one session manager.
pub struct Runner {
    sessions: SessionManager,
    resolver: Resolver,
    settings: Settings,
}

impl Runner {
    /// Create a runner with its own session manager.
    pub fn new(client: Arc<dyn ProtocolClient>, settings: Settings) -> Self {
        let sessions = SessionManager::new(client, &settings);
        Self::with_sessions(sessions, settings)
    }

    /// Create a runner over an existing session manager.
    pub fn with_sessions(sessions: SessionManager, settings: Settings) -> Self {
        let resolver = Resolver::new(settings.clickable.clone(), settings.poll_interval());
        Self {
            sessions,
            resolver,
            settings,
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Run `script` with `overrides` layered over its parameters.
    pub async fn run(
        &self,
        script: &Script,
        overrides: &Variables,
        options: RunOptions,
    ) -> ExecutionResult {
        let start = Instant::now();
        let variables = Variables::merged(&script.parameters, overrides);
        info!(
            "Running script '{}' ({} steps) on {}",
            script.id,
            script.steps.len(),
            options.target
        );

        // Scripts on the same target run one at a time, in arrival order.
        let _lease = self.sessions.acquire(&options.target).await;

        let attached = if options.cancel.is_cancelled() {
            info!("Script '{}' cancelled while queued", script.id);
            Err(ScriptError::Cancelled { index: 0 })
        } else {
            self.sessions
                .ensure_attached(&options.target)
                .await
                .map_err(|e| ScriptError::Setup(e.to_string()))
        };

        let (outcome, steps_executed, keep_alive) = match attached {
            Ok(session) => {
                let keep_alive = session.keep_alive_after_completion;
                let mut ctx = ExecutionContext {
                    script_id: script.id.clone(),
                    current_step_index: 0,
                    variables,
                    session,
                    started_at: Utc::now(),
                    cancel: options.cancel.clone(),
                    steps_executed: 0,
                };
                let env = executor::Env {
                    client: self.sessions.client().as_ref(),
                    sessions: &self.sessions,
                    resolver: &self.resolver,
                    settings: &self.settings,
                    progress: options.progress.as_ref(),
                };
                let outcome = executor::run_steps(&env, &mut ctx, &script.steps).await;
                (outcome, ctx.steps_executed, keep_alive)
            }
            Err(e) => (Err(e), 0, true),
        };

        if options.detach || !keep_alive {
            if let Err(e) = self.sessions.detach(&options.target).await {
                warn!("Detach after '{}' failed: {}", script.id, e);
            }
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        match outcome {
            Ok(()) => {
                info!(
                    "Script '{}' finished: {} steps in {}ms",
                    script.id, steps_executed, duration_ms
                );
                ExecutionResult {
                    success: true,
                    code: ResultCode::Success,
                    tab_id: Some(options.target),
                    error: None,
                    step_index: None,
                    step_path: None,
                    step_kind: None,
                    steps_executed,
                    duration_ms,
                }
            }
            Err(e) => {
                warn!("Script '{}' failed: {}", script.id, e);
                ExecutionResult {
                    success: false,
                    code: e.code(),
                    tab_id: Some(options.target),
                    error: Some(e.to_string()),
                    step_index: e.step_index(),
                    step_path: e.step_path().map(str::to_string),
                    step_kind: e.kind(),
                    steps_executed,
                    duration_ms,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let not_found = ScriptError::StepFailed {
            index: 1,
            path: "1".into(),
            kind: StepKind::Click,
            cause: StepFailure::NotFound {
                selectors: "[#a]".into(),
            },
        };
        assert_eq!(not_found.code(), ResultCode::NotFound);
        assert_eq!(not_found.step_index(), Some(1));
        assert_eq!(not_found.kind(), Some(StepKind::Click));

        let timeout = ScriptError::StepFailed {
            index: 0,
            path: "0".into(),
            kind: StepKind::WaitForExpression,
            cause: StepFailure::Timeout {
                what: "x".into(),
                timeout_ms: 10,
            },
        };
        assert_eq!(timeout.code(), ResultCode::StepFailed);
        assert_eq!(ScriptError::Cancelled { index: 3 }.code(), ResultCode::Cancelled);
        assert_eq!(ScriptError::Setup("x".into()).step_index(), None);
    }

    #[test]
    fn test_failure_from_protocol_error() {
        let f: StepFailure = ProtocolError::SessionDetached("S1".into()).into();
        assert!(f.is_detach());
        let f: StepFailure = ProtocolError::Evaluation("boom".into()).into();
        assert!(!f.is_detach());
    }

    #[test]
    fn test_result_serialization() {
        let r = ExecutionResult::failed(ResultCode::InvalidCommand, "empty script id");
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["success"], false);
        assert_eq!(v["code"], "InvalidCommand");
        assert_eq!(v["stepsExecuted"], 0);
        assert_eq!(serde_json::to_value(ResultCode::Success).unwrap(), "success");
    }

    #[test]
    fn test_cancel_flag_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!flag.is_cancelled());
        clone.cancel();
        assert!(flag.is_cancelled());
    }
}

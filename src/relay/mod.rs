//! Cross-context request relay.
//!
//! An [`Orchestrator`] task owns one persistent link to the worker host and
//! any number of [`Port`]s, one per short-lived caller. Callers number their
//! own requests; the orchestrator maps each to a relay-local id before
//! forwarding it on the link and maps the answer back when it returns.

mod orchestrator;
mod port;
mod worker;

pub use orchestrator::{Orchestrator, OrchestratorHandle, RelayConfig};
pub use port::{Notification, Port};
pub use worker::{LocalConnector, WorkerHost};

use crate::config::Variables;
use crate::runner::{ExecutionResult, ProgressEvent, ResultCode};
use crate::store::IntentMatch;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Requests a caller can make.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    #[serde(rename_all = "camelCase")]
    RunScript {
        script_id: String,
        #[serde(default)]
        parameters: Variables,
        #[serde(default)]
        target: Option<String>,
        #[serde(default)]
        detach: bool,
    },
    ProcessIntent {
        text: String,
        #[serde(default)]
        target: Option<String>,
    },
    Attach {
        target: String,
    },
    Detach {
        target: String,
    },
    #[serde(rename_all = "camelCase")]
    Cancel { script_id: String },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::RunScript { .. } => "runScript",
            Command::ProcessIntent { .. } => "processIntent",
            Command::Attach { .. } => "attach",
            Command::Detach { .. } => "detach",
            Command::Cancel { .. } => "cancel",
        }
    }
}

/// Answers from the worker host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Reply {
    Execution(ExecutionResult),
    #[serde(rename_all = "camelCase")]
    Attached {
        target_id: String,
        session_id: String,
        generation: u64,
    },
    #[serde(rename_all = "camelCase")]
    Detached { target_id: String },
    #[serde(rename_all = "camelCase")]
    Cancelled { script_id: String, found: bool },
    /// The classifier understood the text but it names no script.
    Intent(IntentMatch),
    NoMatch { text: String },
    /// The worker could not act on the command.
    Failed { code: ResultCode, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("request timed out")]
    Timeout,

    #[error("worker link disconnected")]
    Disconnected,

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("relay closed")]
    Closed,
}

impl RelayError {
    pub fn code(&self) -> ResultCode {
        match self {
            RelayError::Timeout => ResultCode::RelayTimeout,
            RelayError::Disconnected | RelayError::Closed => ResultCode::RelayDisconnected,
            RelayError::InvalidCommand(_) => ResultCode::InvalidCommand,
        }
    }
}

/// A request on the worker link, tagged with its relay-local id.
#[derive(Debug, Clone)]
pub struct LinkRequest {
    pub relay_id: u64,
    pub command: Command,
}

/// Traffic from the worker host back to the orchestrator.
#[derive(Debug, Clone)]
pub enum LinkMessage {
    Response { relay_id: u64, reply: Reply },
    Progress { relay_id: u64, event: ProgressEvent },
}

/// The orchestrator's end of the persistent worker link.
pub struct WorkerLink {
    pub requests: mpsc::UnboundedSender<LinkRequest>,
    pub messages: mpsc::UnboundedReceiver<LinkMessage>,
}

/// Opens the worker link, and reopens it after it drops.
#[async_trait]
pub trait WorkerConnector: Send + Sync {
    async fn connect(&self) -> Result<WorkerLink, RelayError>;
}

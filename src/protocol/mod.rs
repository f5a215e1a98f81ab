//! Remote-debugging protocol seam.
//!
//! Everything above this module talks to the page through [`ProtocolClient`]:
//! attach/detach a target, evaluate in page, dispatch input, navigate. Session
//! lifecycle changes arrive asynchronously as [`SessionEvent`]s on a broadcast
//! channel rather than through callbacks.

pub mod cdp;
pub mod stealth;

pub use cdp::CdpClient;
pub use stealth::{EokaClient, LaunchConfig};

use crate::config::steps::MouseButton;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

/// Page expressions shared by the session and step layers.
pub const READY_STATE_JS: &str = "document.readyState";
pub const LOCATION_JS: &str = "location.href";
pub const BODY_TEXT_JS: &str = "document.body ? document.body.innerText : ''";

/// Errors raised by a protocol backend.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("CDP error: {message} (code: {code})")]
    Cdp { code: i64, message: String },

    #[error("session {0} detached")]
    SessionDetached(String),

    #[error("target not found: {0}")]
    TargetNotFound(String),

    #[error("evaluation failed: {0}")]
    Evaluation(String),

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("browser error: {0}")]
    Browser(#[from] eoka::Error),
}

impl ProtocolError {
    /// Whether this failure means the debugging session went away underneath us.
    pub fn is_detach(&self) -> bool {
        matches!(self, Self::SessionDetached(_) | Self::ConnectionClosed)
    }
}

/// Asynchronous session lifecycle notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A debugging session was detached from its target.
    Detached {
        target_id: String,
        session_id: String,
        reason: String,
    },
    /// The target (tab) itself went away.
    TargetClosed { target_id: String },
    /// The whole control channel dropped.
    Disconnected,
}

/// Low-level input sent to the page.
#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    MouseMove {
        x: f64,
        y: f64,
    },
    MouseDown {
        x: f64,
        y: f64,
        button: MouseButton,
        click_count: u32,
    },
    MouseUp {
        x: f64,
        y: f64,
        button: MouseButton,
        click_count: u32,
    },
    KeyDown {
        key: String,
    },
    KeyUp {
        key: String,
    },
    InsertText {
        text: String,
    },
}

/// Device metrics override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
    pub device_scale_factor: f64,
    pub mobile: bool,
}

/// A remote-debugging control channel.
///
/// Session-scoped calls take the `session_id` returned by [`attach`](Self::attach).
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Attach a debugging session to `target_id`, returning its session id.
    async fn attach(&self, target_id: &str) -> ProtocolResult<String>;

    /// Detach a session. The target keeps running.
    async fn detach(&self, session_id: &str) -> ProtocolResult<()>;

    /// Evaluate an expression in the page, returning its JSON value.
    async fn evaluate(&self, session_id: &str, expression: &str) -> ProtocolResult<Value>;

    /// Call a page-side function source with one JSON argument.
    async fn call_function(
        &self,
        session_id: &str,
        function: &str,
        args: &Value,
    ) -> ProtocolResult<Value> {
        let expression = format!("({})({})", function, args);
        self.evaluate(session_id, &expression).await
    }

    async fn dispatch_input(&self, session_id: &str, event: &InputEvent) -> ProtocolResult<()>;

    async fn navigate(&self, session_id: &str, url: &str) -> ProtocolResult<()>;

    async fn set_viewport(&self, session_id: &str, viewport: &Viewport) -> ProtocolResult<()>;

    /// Subscribe to session lifecycle events.
    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;
}

/// Move, press and release at a point.
pub async fn click_at(
    client: &dyn ProtocolClient,
    session_id: &str,
    x: f64,
    y: f64,
    button: MouseButton,
    click_count: u32,
) -> ProtocolResult<()> {
    client
        .dispatch_input(session_id, &InputEvent::MouseMove { x, y })
        .await?;
    for count in 1..=click_count.max(1) {
        client
            .dispatch_input(
                session_id,
                &InputEvent::MouseDown {
                    x,
                    y,
                    button,
                    click_count: count,
                },
            )
            .await?;
        client
            .dispatch_input(
                session_id,
                &InputEvent::MouseUp {
                    x,
                    y,
                    button,
                    click_count: count,
                },
            )
            .await?;
    }
    Ok(())
}

/// Whether a JSON value is truthy in the JS sense.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!("x")));
        assert!(is_truthy(&json!([])));
        assert!(is_truthy(&json!({})));
    }

    #[test]
    fn test_detach_classification() {
        assert!(ProtocolError::SessionDetached("s".into()).is_detach());
        assert!(ProtocolError::ConnectionClosed.is_detach());
        assert!(!ProtocolError::Evaluation("boom".into()).is_detach());
        assert!(!ProtocolError::TargetNotFound("t".into()).is_detach());
    }
}

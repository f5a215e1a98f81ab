//! Raw CDP over WebSocket with flattened sessions.

use super::{InputEvent, ProtocolClient, ProtocolError, ProtocolResult, SessionEvent, Viewport};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Chrome answers commands on a vanished flattened session with this code.
const SESSION_NOT_FOUND: i64 = -32001;

#[derive(Debug, Serialize)]
struct CdpRequest<'a> {
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct CdpMessage {
    id: Option<u64>,
    result: Option<Value>,
    error: Option<CdpErrorBody>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CdpErrorBody {
    code: i64,
    message: String,
}

/// Chrome returns PascalCase field names for this endpoint.
#[derive(Debug, Deserialize)]
struct BrowserVersion {
    #[serde(rename = "Browser", default)]
    browser: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub target_id: String,
    #[serde(rename = "type")]
    pub target_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
}

struct Pending {
    session_id: Option<String>,
    tx: oneshot::Sender<ProtocolResult<Value>>,
}

/// State shared between the client and its receive task.
struct Shared {
    pending: Mutex<HashMap<u64, Pending>>,
    /// session id -> target id
    sessions: Mutex<HashMap<String, String>>,
    events: broadcast::Sender<SessionEvent>,
}

impl Shared {
    fn fail_session(&self, session_id: &str) {
        let failed: Vec<Pending> = {
            let mut pending = self.pending.lock();
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, p)| p.session_id.as_deref() == Some(session_id))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };
        for p in failed {
            let _ = p
                .tx
                .send(Err(ProtocolError::SessionDetached(session_id.to_string())));
        }
    }

    fn session_gone(&self, session_id: &str, reason: &str) {
        let target_id = self.sessions.lock().remove(session_id);
        self.fail_session(session_id);
        // Sessions we detached ourselves are already gone from the map.
        if let Some(target_id) = target_id {
            debug!("session {} for {} detached: {}", session_id, target_id, reason);
            let _ = self.events.send(SessionEvent::Detached {
                target_id,
                session_id: session_id.to_string(),
                reason: reason.to_string(),
            });
        }
    }

    fn target_gone(&self, target_id: &str) {
        let sessions: Vec<String> = self
            .sessions
            .lock()
            .iter()
            .filter(|(_, t)| t.as_str() == target_id)
            .map(|(s, _)| s.clone())
            .collect();
        for session_id in sessions {
            self.session_gone(&session_id, "target destroyed");
        }
        let _ = self.events.send(SessionEvent::TargetClosed {
            target_id: target_id.to_string(),
        });
    }

    fn handle_event(&self, method: &str, params: &Value, session_id: Option<&str>) {
        match method {
            "Target.detachedFromTarget" => {
                if let Some(sid) = params["sessionId"].as_str() {
                    self.session_gone(sid, "detached from target");
                }
            }
            "Inspector.detached" => {
                if let Some(sid) = session_id {
                    let reason = params["reason"].as_str().unwrap_or("inspector detached");
                    self.session_gone(sid, reason);
                }
            }
            "Target.targetCrashed" => {
                if let Some(target_id) = params["targetId"].as_str() {
                    let sessions: Vec<String> = self
                        .sessions
                        .lock()
                        .iter()
                        .filter(|(_, t)| t.as_str() == target_id)
                        .map(|(s, _)| s.clone())
                        .collect();
                    for sid in sessions {
                        self.session_gone(&sid, "target crashed");
                    }
                }
            }
            "Target.targetDestroyed" => {
                if let Some(target_id) = params["targetId"].as_str() {
                    self.target_gone(target_id);
                }
            }
            _ => trace!("CDP event: {}", method),
        }
    }

    fn disconnected(&self) {
        let pending: Vec<Pending> = self.pending.lock().drain().map(|(_, p)| p).collect();
        for p in pending {
            let _ = p.tx.send(Err(ProtocolError::ConnectionClosed));
        }
        let sessions: Vec<(String, String)> = self.sessions.lock().drain().collect();
        for (session_id, target_id) in sessions {
            let _ = self.events.send(SessionEvent::Detached {
                target_id,
                session_id,
                reason: "connection closed".into(),
            });
        }
        let _ = self.events.send(SessionEvent::Disconnected);
    }
}

/// CDP client connected to an existing browser's debugging endpoint.
pub struct CdpClient {
    browser_ws_url: String,
    ws_tx: Arc<tokio::sync::Mutex<WsSink>>,
    request_id: AtomicU64,
    shared: Arc<Shared>,
    _recv_task: tokio::task::JoinHandle<()>,
}

impl CdpClient {
    /// Connect to a browser.
    ///
    /// `endpoint` is either an HTTP debugging endpoint (`http://localhost:9222`),
    /// which is resolved through `/json/version`, or a browser WebSocket URL.
    pub async fn connect(endpoint: &str) -> ProtocolResult<Self> {
        let browser_ws_url = if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
            endpoint.to_string()
        } else {
            let version_url = format!("{}/json/version", endpoint.trim_end_matches('/'));
            debug!("Fetching browser version from {}", version_url);
            let version: BrowserVersion = reqwest::get(&version_url)
                .await
                .map_err(|e| ProtocolError::ConnectionFailed(format!("{}: {}", endpoint, e)))?
                .json()
                .await
                .map_err(|e| ProtocolError::ConnectionFailed(format!("{}: {}", endpoint, e)))?;
            debug!("Found browser: {}", version.browser);
            version.web_socket_debugger_url
        };

        let (ws_stream, _) = tokio_tungstenite::connect_async(browser_ws_url.as_str())
            .await
            .map_err(|e| ProtocolError::ConnectionFailed(format!("WebSocket: {}", e)))?;
        let (ws_sink, ws_source) = ws_stream.split();

        let (events, _) = broadcast::channel(64);
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            events,
        });

        let recv_task = {
            let shared = shared.clone();
            tokio::spawn(async move {
                Self::receive_loop(ws_source, &shared).await;
                shared.disconnected();
            })
        };

        let client = Self {
            browser_ws_url,
            ws_tx: Arc::new(tokio::sync::Mutex::new(ws_sink)),
            request_id: AtomicU64::new(1),
            shared,
            _recv_task: recv_task,
        };

        client
            .call("Target.setDiscoverTargets", Some(json!({"discover": true})), None)
            .await?;
        debug!("CDP client connected to {}", client.browser_ws_url);
        Ok(client)
    }

    async fn receive_loop(mut ws_source: WsSource, shared: &Shared) {
        while let Some(msg) = ws_source.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    trace!("CDP recv: {}", text);
                    let msg: CdpMessage = match serde_json::from_str(&text) {
                        Ok(m) => m,
                        Err(e) => {
                            warn!("Failed to parse CDP message: {}", e);
                            continue;
                        }
                    };
                    if let Some(id) = msg.id {
                        let Some(req) = shared.pending.lock().remove(&id) else {
                            continue;
                        };
                        let result = match msg.error {
                            Some(err) if err.code == SESSION_NOT_FOUND => {
                                Err(ProtocolError::SessionDetached(
                                    req.session_id.clone().unwrap_or_default(),
                                ))
                            }
                            Some(err) => Err(ProtocolError::Cdp {
                                code: err.code,
                                message: err.message,
                            }),
                            None => Ok(msg.result.unwrap_or(Value::Null)),
                        };
                        let _ = req.tx.send(result);
                    } else if let Some(method) = msg.method.as_deref() {
                        shared.handle_event(method, &msg.params, msg.session_id.as_deref());
                    }
                }
                Ok(Message::Close(_)) => {
                    debug!("WebSocket closed");
                    break;
                }
                Err(e) => {
                    warn!("WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }
    }

    /// Send a CDP command and wait for its response.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        session_id: Option<&str>,
    ) -> ProtocolResult<Value> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let request = CdpRequest {
            id,
            method,
            params,
            session_id,
        };
        let json = serde_json::to_string(&request)?;
        trace!("CDP send: {}", json);

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(
            id,
            Pending {
                session_id: session_id.map(str::to_string),
                tx,
            },
        );

        let sent = {
            let mut ws = self.ws_tx.lock().await;
            ws.send(Message::Text(json.into())).await
        };
        if let Err(e) = sent {
            self.shared.pending.lock().remove(&id);
            return Err(ProtocolError::WebSocket(e.to_string()));
        }

        match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed),
            Err(_) => {
                self.shared.pending.lock().remove(&id);
                Err(ProtocolError::Timeout(format!("{} timed out", method)))
            }
        }
    }

    pub fn browser_ws_url(&self) -> &str {
        &self.browser_ws_url
    }

    /// List page targets.
    pub async fn page_targets(&self) -> ProtocolResult<Vec<TargetInfo>> {
        let result = self.call("Target.getTargets", None, None).await?;
        let targets: Vec<TargetInfo> = serde_json::from_value(result["targetInfos"].clone())?;
        Ok(targets
            .into_iter()
            .filter(|t| t.target_type == "page")
            .collect())
    }
}

impl Drop for CdpClient {
    fn drop(&mut self) {
        self._recv_task.abort();
    }
}

/// Virtual key code and text for keys that need them to trigger default actions.
fn key_definition(key: &str) -> (Option<i64>, Option<String>) {
    match key {
        "Enter" => (Some(13), Some("\r".into())),
        "Tab" => (Some(9), None),
        "Backspace" => (Some(8), None),
        "Escape" => (Some(27), None),
        "Delete" => (Some(46), None),
        "ArrowLeft" => (Some(37), None),
        "ArrowUp" => (Some(38), None),
        "ArrowRight" => (Some(39), None),
        "ArrowDown" => (Some(40), None),
        "Home" => (Some(36), None),
        "End" => (Some(35), None),
        "PageUp" => (Some(33), None),
        "PageDown" => (Some(34), None),
        " " | "Space" => (Some(32), Some(" ".into())),
        k if k.chars().count() == 1 => (None, Some(k.to_string())),
        _ => (None, None),
    }
}

fn key_event(kind: &str, key: &str) -> Value {
    let (code, text) = key_definition(key);
    let mut params = json!({"type": kind, "key": key});
    if let Some(code) = code {
        params["windowsVirtualKeyCode"] = json!(code);
    }
    if kind == "keyDown" {
        if let Some(text) = text {
            params["text"] = json!(text);
        }
    }
    params
}

#[async_trait]
impl ProtocolClient for CdpClient {
    async fn attach(&self, target_id: &str) -> ProtocolResult<String> {
        let result = self
            .call(
                "Target.attachToTarget",
                Some(json!({"targetId": target_id, "flatten": true})),
                None,
            )
            .await
            .map_err(|e| match e {
                ProtocolError::Cdp { message, .. } if message.contains("No target") => {
                    ProtocolError::TargetNotFound(target_id.to_string())
                }
                other => other,
            })?;

        let session_id = result["sessionId"]
            .as_str()
            .ok_or_else(|| ProtocolError::Evaluation("attach returned no sessionId".into()))?
            .to_string();
        self.shared
            .sessions
            .lock()
            .insert(session_id.clone(), target_id.to_string());

        self.call("Page.enable", None, Some(&session_id)).await?;
        self.call("Runtime.enable", None, Some(&session_id)).await?;
        debug!("Attached to {} as session {}", target_id, session_id);
        Ok(session_id)
    }

    async fn detach(&self, session_id: &str) -> ProtocolResult<()> {
        self.shared.sessions.lock().remove(session_id);
        self.call(
            "Target.detachFromTarget",
            Some(json!({"sessionId": session_id})),
            None,
        )
        .await?;
        Ok(())
    }

    async fn evaluate(&self, session_id: &str, expression: &str) -> ProtocolResult<Value> {
        let result = self
            .call(
                "Runtime.evaluate",
                Some(json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                })),
                Some(session_id),
            )
            .await?;

        if let Some(details) = result.get("exceptionDetails") {
            let message = details["exception"]["description"]
                .as_str()
                .or_else(|| details["text"].as_str())
                .unwrap_or("uncaught exception");
            return Err(ProtocolError::Evaluation(message.to_string()));
        }
        Ok(result["result"]["value"].clone())
    }

    async fn dispatch_input(&self, session_id: &str, event: &InputEvent) -> ProtocolResult<()> {
        let (method, params) = match event {
            InputEvent::MouseMove { x, y } => (
                "Input.dispatchMouseEvent",
                json!({"type": "mouseMoved", "x": x, "y": y}),
            ),
            InputEvent::MouseDown {
                x,
                y,
                button,
                click_count,
            } => (
                "Input.dispatchMouseEvent",
                json!({"type": "mousePressed", "x": x, "y": y, "button": button.as_str(), "clickCount": click_count}),
            ),
            InputEvent::MouseUp {
                x,
                y,
                button,
                click_count,
            } => (
                "Input.dispatchMouseEvent",
                json!({"type": "mouseReleased", "x": x, "y": y, "button": button.as_str(), "clickCount": click_count}),
            ),
            InputEvent::KeyDown { key } => ("Input.dispatchKeyEvent", key_event("keyDown", key)),
            InputEvent::KeyUp { key } => ("Input.dispatchKeyEvent", key_event("keyUp", key)),
            InputEvent::InsertText { text } => ("Input.insertText", json!({"text": text})),
        };
        self.call(method, Some(params), Some(session_id)).await?;
        Ok(())
    }

    async fn navigate(&self, session_id: &str, url: &str) -> ProtocolResult<()> {
        let result = self
            .call("Page.navigate", Some(json!({"url": url})), Some(session_id))
            .await?;
        match result["errorText"].as_str() {
            Some(err) if !err.is_empty() => Err(ProtocolError::Navigation(format!("{}: {}", url, err))),
            _ => Ok(()),
        }
    }

    async fn set_viewport(&self, session_id: &str, viewport: &Viewport) -> ProtocolResult<()> {
        self.call(
            "Emulation.setDeviceMetricsOverride",
            Some(serde_json::to_value(viewport)?),
            Some(session_id),
        )
        .await?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> Shared {
        let (events, _) = broadcast::channel(16);
        Shared {
            pending: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            events,
        }
    }

    #[test]
    fn test_request_serialization() {
        let req = CdpRequest {
            id: 7,
            method: "Runtime.evaluate",
            params: Some(json!({"expression": "1"})),
            session_id: Some("S1"),
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["id"], 7);
        assert_eq!(v["sessionId"], "S1");

        let req = CdpRequest {
            id: 8,
            method: "Target.getTargets",
            params: None,
            session_id: None,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert!(v.get("sessionId").is_none());
        assert!(v.get("params").is_none());
    }

    #[test]
    fn test_key_events() {
        let down = key_event("keyDown", "Enter");
        assert_eq!(down["windowsVirtualKeyCode"], 13);
        assert_eq!(down["text"], "\r");
        let up = key_event("keyUp", "Enter");
        assert!(up.get("text").is_none());
        let a = key_event("keyDown", "a");
        assert_eq!(a["text"], "a");
        assert!(a.get("windowsVirtualKeyCode").is_none());
    }

    #[tokio::test]
    async fn test_detach_event_fails_pending_for_session() {
        let shared = shared();
        let mut events = shared.events.subscribe();
        shared.sessions.lock().insert("S1".into(), "T1".into());

        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        shared.pending.lock().insert(
            1,
            Pending {
                session_id: Some("S1".into()),
                tx: tx1,
            },
        );
        shared.pending.lock().insert(
            2,
            Pending {
                session_id: None,
                tx: tx2,
            },
        );

        shared.handle_event(
            "Target.detachedFromTarget",
            &json!({"sessionId": "S1", "targetId": "T1"}),
            None,
        );

        assert!(matches!(
            rx1.await.unwrap(),
            Err(ProtocolError::SessionDetached(s)) if s == "S1"
        ));
        assert_eq!(shared.pending.lock().len(), 1);
        drop(rx2);
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Detached {
                target_id: "T1".into(),
                session_id: "S1".into(),
                reason: "detached from target".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_self_detach_is_silent() {
        let shared = shared();
        let mut events = shared.events.subscribe();
        shared.handle_event("Target.detachedFromTarget", &json!({"sessionId": "gone"}), None);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_fails_everything() {
        let shared = shared();
        let mut events = shared.events.subscribe();
        shared.sessions.lock().insert("S1".into(), "T1".into());
        let (tx, rx) = oneshot::channel();
        shared.pending.lock().insert(
            1,
            Pending {
                session_id: Some("S1".into()),
                tx,
            },
        );
        shared.disconnected();
        assert!(matches!(rx.await.unwrap(), Err(ProtocolError::ConnectionClosed)));
        assert!(matches!(events.recv().await.unwrap(), SessionEvent::Detached { .. }));
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Disconnected);
    }
}

//! In-memory browser for tests.
//!
//! [`FakeBrowser`] implements [`ProtocolClient`] over a single fake page whose
//! elements are keyed by the exact selector string that should find them.
//! It records every call and can inject detaches and attach failures.

use crate::protocol::{
    InputEvent, ProtocolClient, ProtocolError, ProtocolResult, SessionEvent, Viewport,
    BODY_TEXT_JS, LOCATION_JS, READY_STATE_JS,
};
use crate::resolver::BBox;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::broadcast;

/// An element on the fake page.
#[derive(Debug, Clone)]
pub struct FakeElement {
    pub tag: String,
    pub path: String,
    pub bbox: BBox,
    pub visible: bool,
    pub text: String,
    /// Returned instead of the element when a clickable ancestor is asked for.
    pub clickable_ancestor: Option<Box<FakeElement>>,
}

impl FakeElement {
    pub fn new(tag: &str, path: &str) -> Self {
        Self {
            tag: tag.to_string(),
            path: path.to_string(),
            bbox: BBox {
                x: 0.0,
                y: 0.0,
                width: 100.0,
                height: 20.0,
            },
            visible: true,
            text: String::new(),
            clickable_ancestor: None,
        }
    }

    pub fn at(mut self, x: f64, y: f64, width: f64, height: f64) -> Self {
        self.bbox = BBox {
            x,
            y,
            width,
            height,
        };
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    pub fn inside(mut self, ancestor: FakeElement) -> Self {
        self.clickable_ancestor = Some(Box::new(ancestor));
        self
    }

    /// Handle the fake hands out for this element.
    pub fn handle(&self) -> String {
        format!("ref:{}", self.path)
    }

    fn has_handle(&self, handle: &str) -> bool {
        self.handle() == handle
            || self
                .clickable_ancestor
                .as_ref()
                .is_some_and(|a| a.has_handle(handle))
    }

    fn to_json(&self) -> Value {
        json!({
            "found": true,
            "selector": self.path,
            "handle": self.handle(),
            "tag": self.tag,
            "text": self.text,
            "visible": self.visible,
            "bbox": self.bbox,
        })
    }
}

/// A call the fake received.
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Evaluate { session_id: String, expression: String },
    Call { session_id: String, op: String, args: Value },
    Input { session_id: String, event: InputEvent },
    Navigate { session_id: String, url: String },
    Viewport { session_id: String, viewport: Viewport },
}

#[derive(Default)]
struct State {
    url: String,
    body_text: String,
    elements: HashMap<String, FakeElement>,
    /// Elements that show up after this many lookups of their selector.
    pending_elements: HashMap<String, (usize, FakeElement)>,
    expressions: HashMap<String, Value>,
    /// session id -> target id
    sessions: HashMap<String, String>,
    next_session: u64,
    attach_counts: HashMap<String, usize>,
    failing_attach: HashSet<String>,
    /// Targets whose readyState check errors.
    failing_ready: HashSet<String>,
    detaches: usize,
    /// Remaining page actions that fail with a detach.
    detach_on_action: usize,
    resolve_log: Vec<String>,
    log: Vec<Recorded>,
}

pub struct FakeBrowser {
    state: Mutex<State>,
    attach_delay: Mutex<Duration>,
    events: broadcast::Sender<SessionEvent>,
}

impl Default for FakeBrowser {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBrowser {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(State {
                url: "about:blank".into(),
                ..Default::default()
            }),
            attach_delay: Mutex::new(Duration::ZERO),
            events,
        }
    }

    /// Put an element on the page, found by `selector`.
    pub fn add_element(&self, selector: &str, element: FakeElement) {
        self.state.lock().elements.insert(selector.to_string(), element);
    }

    /// Put an element on the page that only appears after `lookups` failed lookups.
    pub fn add_element_later(&self, selector: &str, lookups: usize, element: FakeElement) {
        self.state
            .lock()
            .pending_elements
            .insert(selector.to_string(), (lookups, element));
    }

    pub fn remove_element(&self, selector: &str) {
        self.state.lock().elements.remove(selector);
    }

    pub fn set_body_text(&self, text: &str) {
        self.state.lock().body_text = text.to_string();
    }

    /// Answer `expression` with `value`.
    pub fn set_expression(&self, expression: &str, value: Value) {
        self.state
            .lock()
            .expressions
            .insert(expression.to_string(), value);
    }

    pub fn set_attach_delay(&self, delay: Duration) {
        *self.attach_delay.lock() = delay;
    }

    /// Make attaching to `target_id` fail.
    pub fn fail_attach(&self, target_id: &str) {
        self.state.lock().failing_attach.insert(target_id.to_string());
    }

    /// Make the readyState check on `target_id` fail with a protocol error.
    pub fn fail_ready(&self, target_id: &str) {
        self.state.lock().failing_ready.insert(target_id.to_string());
    }

    /// Close `target_id`, dropping its sessions.
    pub fn close_target(&self, target_id: &str) {
        self.state.lock().sessions.retain(|_, t| t.as_str() != target_id);
        let _ = self.events.send(SessionEvent::TargetClosed {
            target_id: target_id.to_string(),
        });
    }

    /// Make the next `count` page actions (input, navigation) drop their session.
    pub fn detach_on_next_actions(&self, count: usize) {
        self.state.lock().detach_on_action = count;
    }

    /// Drop the live session on `target_id` as if the browser detached it.
    pub fn emit_detach(&self, target_id: &str) {
        let session = {
            let mut state = self.state.lock();
            let session = state
                .sessions
                .iter()
                .find(|(_, t)| t.as_str() == target_id)
                .map(|(s, _)| s.clone());
            if let Some(s) = &session {
                state.sessions.remove(s);
            }
            session
        };
        if let Some(session_id) = session {
            let _ = self.events.send(SessionEvent::Detached {
                target_id: target_id.to_string(),
                session_id,
                reason: "injected".into(),
            });
        }
    }

    pub fn attach_count(&self, target_id: &str) -> usize {
        self.state
            .lock()
            .attach_counts
            .get(target_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn detach_count(&self) -> usize {
        self.state.lock().detaches
    }

    pub fn url(&self) -> String {
        self.state.lock().url.clone()
    }

    /// Selectors looked up, in order.
    pub fn resolve_log(&self) -> Vec<String> {
        self.state.lock().resolve_log.clone()
    }

    pub fn log(&self) -> Vec<Recorded> {
        self.state.lock().log.clone()
    }

    pub fn inputs(&self) -> Vec<InputEvent> {
        self.log()
            .into_iter()
            .filter_map(|r| match r {
                Recorded::Input { event, .. } => Some(event),
                _ => None,
            })
            .collect()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter_map(|r| match r {
                Recorded::Navigate { url, .. } => Some(url),
                _ => None,
            })
            .collect()
    }

    /// Page-function calls with the given `op`, in order.
    pub fn calls(&self, op: &str) -> Vec<Value> {
        self.log()
            .into_iter()
            .filter_map(|r| match r {
                Recorded::Call { op: o, args, .. } if o == op => Some(args),
                _ => None,
            })
            .collect()
    }

    fn live(&self, state: &State, session_id: &str) -> ProtocolResult<()> {
        if state.sessions.contains_key(session_id) {
            Ok(())
        } else {
            Err(ProtocolError::SessionDetached(session_id.to_string()))
        }
    }

    /// Fail a page action with a detach if one is armed.
    fn maybe_drop(&self, session_id: &str) -> ProtocolResult<()> {
        let dropped = {
            let mut state = self.state.lock();
            self.live(&state, session_id)?;
            if state.detach_on_action == 0 {
                return Ok(());
            }
            state.detach_on_action -= 1;
            state.sessions.remove(session_id)
        };
        if let Some(target_id) = dropped {
            let _ = self.events.send(SessionEvent::Detached {
                target_id,
                session_id: session_id.to_string(),
                reason: "injected".into(),
            });
        }
        Err(ProtocolError::SessionDetached(session_id.to_string()))
    }

    fn lookup(state: &mut State, selector: &str) -> Option<FakeElement> {
        if let Some(el) = state.elements.get(selector) {
            return Some(el.clone());
        }
        let ready = match state.pending_elements.get_mut(selector) {
            Some((0, _)) => true,
            Some((n, _)) => {
                *n -= 1;
                false
            }
            None => false,
        };
        if ready {
            if let Some((_, el)) = state.pending_elements.remove(selector) {
                state.elements.insert(selector.to_string(), el.clone());
                return Some(el);
            }
        }
        None
    }
}

#[async_trait]
impl ProtocolClient for FakeBrowser {
    async fn attach(&self, target_id: &str) -> ProtocolResult<String> {
        let delay = *self.attach_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        *state.attach_counts.entry(target_id.to_string()).or_default() += 1;
        if state.failing_attach.contains(target_id) {
            return Err(ProtocolError::TargetNotFound(target_id.to_string()));
        }
        state.next_session += 1;
        let session_id = format!("S{}", state.next_session);
        state.sessions.insert(session_id.clone(), target_id.to_string());
        Ok(session_id)
    }

    async fn detach(&self, session_id: &str) -> ProtocolResult<()> {
        let mut state = self.state.lock();
        state.sessions.remove(session_id);
        state.detaches += 1;
        Ok(())
    }

    async fn evaluate(&self, session_id: &str, expression: &str) -> ProtocolResult<Value> {
        let mut state = self.state.lock();
        self.live(&state, session_id)?;
        state.log.push(Recorded::Evaluate {
            session_id: session_id.to_string(),
            expression: expression.to_string(),
        });
        if expression == READY_STATE_JS
            && state
                .sessions
                .get(session_id)
                .is_some_and(|t| state.failing_ready.contains(t))
        {
            return Err(ProtocolError::Cdp {
                code: -32000,
                message: "Execution context was destroyed".into(),
            });
        }
        if let Some(v) = state.expressions.get(expression) {
            return Ok(v.clone());
        }
        Ok(match expression {
            READY_STATE_JS => json!("complete"),
            LOCATION_JS => json!(state.url),
            BODY_TEXT_JS => json!(state.body_text),
            _ => Value::Null,
        })
    }

    async fn call_function(
        &self,
        session_id: &str,
        _function: &str,
        args: &Value,
    ) -> ProtocolResult<Value> {
        let mut state = self.state.lock();
        self.live(&state, session_id)?;
        let op = args["op"].as_str().unwrap_or_default().to_string();
        state.log.push(Recorded::Call {
            session_id: session_id.to_string(),
            op: op.clone(),
            args: args.clone(),
        });

        if op != "resolve" {
            // actions find their element by handle only
            return Ok(match args["handle"].as_str() {
                Some(handle) => json!(state.elements.values().any(|el| el.has_handle(handle))),
                None => json!(true),
            });
        }
        let selector = args["selector"].as_str().unwrap_or_default().to_string();
        state.resolve_log.push(selector.clone());
        Ok(match Self::lookup(&mut state, &selector) {
            Some(el) => {
                let wants_clickable = !args["clickable"].is_null();
                match (&el.clickable_ancestor, wants_clickable) {
                    (Some(ancestor), true) => ancestor.to_json(),
                    _ => el.to_json(),
                }
            }
            None => json!({"found": false}),
        })
    }

    async fn dispatch_input(&self, session_id: &str, event: &InputEvent) -> ProtocolResult<()> {
        self.maybe_drop(session_id)?;
        self.state.lock().log.push(Recorded::Input {
            session_id: session_id.to_string(),
            event: event.clone(),
        });
        Ok(())
    }

    async fn navigate(&self, session_id: &str, url: &str) -> ProtocolResult<()> {
        self.maybe_drop(session_id)?;
        let mut state = self.state.lock();
        state.url = url.to_string();
        state.log.push(Recorded::Navigate {
            session_id: session_id.to_string(),
            url: url.to_string(),
        });
        Ok(())
    }

    async fn set_viewport(&self, session_id: &str, viewport: &Viewport) -> ProtocolResult<()> {
        let mut state = self.state.lock();
        self.live(&state, session_id)?;
        state.log.push(Recorded::Viewport {
            session_id: session_id.to_string(),
            viewport: viewport.clone(),
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sessions_and_detach_injection() {
        let fake = FakeBrowser::new();
        let mut events = fake.subscribe();
        let s = fake.attach("T1").await.unwrap();
        fake.navigate(&s, "https://example.com").await.unwrap();

        fake.detach_on_next_actions(1);
        let err = fake
            .dispatch_input(&s, &InputEvent::KeyDown { key: "a".into() })
            .await
            .unwrap_err();
        assert!(err.is_detach());
        assert!(matches!(events.recv().await.unwrap(), SessionEvent::Detached { .. }));

        // The old session stays dead.
        assert!(fake.evaluate(&s, "1").await.unwrap_err().is_detach());
        let s2 = fake.attach("T1").await.unwrap();
        assert_ne!(s, s2);
        assert_eq!(fake.attach_count("T1"), 2);
        assert_eq!(fake.navigations(), vec!["https://example.com"]);
    }

    #[tokio::test]
    async fn test_late_element() {
        let fake = FakeBrowser::new();
        let s = fake.attach("T1").await.unwrap();
        fake.add_element_later("#late", 2, FakeElement::new("div", "#late"));
        let args = json!({"op": "resolve", "selector": "#late"});
        for _ in 0..2 {
            let v = fake.call_function(&s, "", &args).await.unwrap();
            assert_eq!(v["found"], false);
        }
        let v = fake.call_function(&s, "", &args).await.unwrap();
        assert_eq!(v["found"], true);
    }
}

//! Backend that launches its own stealth browser through `eoka`.
//!
//! Each tab is a target; the session id of an attached tab is its target id.
//! Mouse presses are synthesized in page since `eoka` only exposes pointer
//! movement at the protocol level.

use super::{InputEvent, ProtocolClient, ProtocolError, ProtocolResult, SessionEvent, Viewport};
use crate::config::steps::MouseButton;
use async_trait::async_trait;
use eoka::{Browser, Page};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

/// Browser launch options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    pub headless: bool,
    pub proxy: Option<String>,
    pub user_agent: Option<String>,
    pub viewport_width: u32,
    pub viewport_height: u32,
    /// Page opened at launch.
    pub start_url: String,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            headless: false,
            proxy: None,
            user_agent: None,
            viewport_width: 1280,
            viewport_height: 720,
            start_url: "about:blank".into(),
        }
    }
}

pub struct EokaClient {
    browser: Mutex<Option<Browser>>,
    pages: Mutex<HashMap<String, Page>>,
    attached: parking_lot::Mutex<HashSet<String>>,
    initial: String,
    events: broadcast::Sender<SessionEvent>,
}

impl EokaClient {
    /// Launch a browser and open the start page.
    pub async fn launch(config: &LaunchConfig) -> ProtocolResult<Self> {
        let stealth = eoka::StealthConfig {
            headless: config.headless,
            proxy: config.proxy.clone(),
            user_agent: config.user_agent.clone(),
            viewport_width: config.viewport_width,
            viewport_height: config.viewport_height,
            ..Default::default()
        };

        debug!(
            "Launching browser (headless: {}, proxy: {:?})",
            config.headless, config.proxy
        );
        let browser = Browser::launch_with_config(stealth).await?;
        let page = browser.new_page(&config.start_url).await?;
        let initial = page.target_id().to_string();

        let mut pages = HashMap::new();
        pages.insert(initial.clone(), page);
        let (events, _) = broadcast::channel(64);

        Ok(Self {
            browser: Mutex::new(Some(browser)),
            pages: Mutex::new(pages),
            attached: parking_lot::Mutex::new(HashSet::new()),
            initial,
            events,
        })
    }

    /// Target id of the tab opened at launch.
    pub async fn initial_target(&self) -> ProtocolResult<String> {
        if self.pages.lock().await.contains_key(&self.initial) {
            Ok(self.initial.clone())
        } else {
            Err(ProtocolError::TargetNotFound(self.initial.clone()))
        }
    }

    /// Open a new tab and return its target id.
    pub async fn open_page(&self, url: &str) -> ProtocolResult<String> {
        let browser = self.browser.lock().await;
        let browser = browser.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        let page = browser.new_page(url).await?;
        let target_id = page.target_id().to_string();
        self.pages.lock().await.insert(target_id.clone(), page);
        debug!("Opened tab {} at {}", target_id, url);
        Ok(target_id)
    }

    /// Close a tab. An attached session on it is reported as detached.
    pub async fn close_page(&self, target_id: &str) -> ProtocolResult<()> {
        {
            let browser = self.browser.lock().await;
            let browser = browser.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
            browser.close_tab(target_id).await?;
        }
        self.pages.lock().await.remove(target_id);
        if self.attached.lock().remove(target_id) {
            let _ = self.events.send(SessionEvent::Detached {
                target_id: target_id.to_string(),
                session_id: target_id.to_string(),
                reason: "tab closed".into(),
            });
        }
        let _ = self.events.send(SessionEvent::TargetClosed {
            target_id: target_id.to_string(),
        });
        Ok(())
    }

    /// Close the browser.
    pub async fn close(&self) -> ProtocolResult<()> {
        self.pages.lock().await.clear();
        self.attached.lock().clear();
        if let Some(browser) = self.browser.lock().await.take() {
            browser.close().await?;
        }
        let _ = self.events.send(SessionEvent::Disconnected);
        Ok(())
    }

    fn check_attached(&self, session_id: &str) -> ProtocolResult<()> {
        if self.attached.lock().contains(session_id) {
            Ok(())
        } else {
            Err(ProtocolError::SessionDetached(session_id.to_string()))
        }
    }
}

/// Dispatch a synthetic mouse event on whatever element sits at the point.
fn pointer_script(x: f64, y: f64, events: &[&str], button: MouseButton, detail: u32) -> String {
    let button = match button {
        MouseButton::Left => 0,
        MouseButton::Middle => 1,
        MouseButton::Right => 2,
    };
    let names = serde_json::to_string(events).unwrap_or_else(|_| "[]".into());
    format!(
        r#"(() => {{
            const el = document.elementFromPoint({x}, {y});
            if (!el) return false;
            for (const type of {names}) {{
                el.dispatchEvent(new MouseEvent(type, {{
                    bubbles: true, cancelable: true, view: window,
                    clientX: {x}, clientY: {y}, button: {button}, detail: {detail}
                }}));
            }}
            if ({detail} === 1 && {button} === 0 && {names}.includes('click') && typeof el.focus === 'function') el.focus();
            return true;
        }})()"#
    )
}

#[async_trait]
impl ProtocolClient for EokaClient {
    async fn attach(&self, target_id: &str) -> ProtocolResult<String> {
        if !self.pages.lock().await.contains_key(target_id) {
            return Err(ProtocolError::TargetNotFound(target_id.to_string()));
        }
        self.attached.lock().insert(target_id.to_string());
        Ok(target_id.to_string())
    }

    async fn detach(&self, session_id: &str) -> ProtocolResult<()> {
        self.attached.lock().remove(session_id);
        Ok(())
    }

    async fn evaluate(&self, session_id: &str, expression: &str) -> ProtocolResult<Value> {
        self.check_attached(session_id)?;
        let pages = self.pages.lock().await;
        let page = pages
            .get(session_id)
            .ok_or_else(|| ProtocolError::SessionDetached(session_id.to_string()))?;
        let value: Option<Value> = page.evaluate(expression).await?;
        Ok(value.unwrap_or(Value::Null))
    }

    async fn dispatch_input(&self, session_id: &str, event: &InputEvent) -> ProtocolResult<()> {
        self.check_attached(session_id)?;
        let pages = self.pages.lock().await;
        let page = pages
            .get(session_id)
            .ok_or_else(|| ProtocolError::SessionDetached(session_id.to_string()))?;

        match event {
            InputEvent::MouseMove { x, y } => {
                page.session()
                    .dispatch_mouse_event(eoka::cdp::MouseEventType::MouseMoved, *x, *y, None, None)
                    .await?;
            }
            InputEvent::MouseDown {
                x,
                y,
                button,
                click_count,
            } => {
                page.execute(&pointer_script(*x, *y, &["mousedown"], *button, *click_count))
                    .await?;
            }
            InputEvent::MouseUp {
                x,
                y,
                button,
                click_count,
            } => {
                let events: &[&str] = match (button, click_count) {
                    (MouseButton::Right, _) => &["mouseup", "contextmenu"],
                    (_, 2) => &["mouseup", "click", "dblclick"],
                    _ => &["mouseup", "click"],
                };
                page.execute(&pointer_script(*x, *y, events, *button, *click_count))
                    .await?;
            }
            InputEvent::KeyDown { key } => {
                page.human().press_key(key).await?;
            }
            InputEvent::KeyUp { key } => {
                // press_key already released it
                debug!("keyUp {} folded into the preceding press", key);
            }
            InputEvent::InsertText { text } => {
                page.type_text(text).await?;
            }
        }
        Ok(())
    }

    async fn navigate(&self, session_id: &str, url: &str) -> ProtocolResult<()> {
        self.check_attached(session_id)?;
        let pages = self.pages.lock().await;
        let page = pages
            .get(session_id)
            .ok_or_else(|| ProtocolError::SessionDetached(session_id.to_string()))?;
        page.goto(url).await?;
        Ok(())
    }

    async fn set_viewport(&self, _session_id: &str, _viewport: &Viewport) -> ProtocolResult<()> {
        Err(ProtocolError::Unsupported("set-viewport"))
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_config_defaults() {
        let config: LaunchConfig = serde_yaml::from_str("headless: true").unwrap();
        assert!(config.headless);
        assert_eq!(config.viewport_width, 1280);
        assert_eq!(config.start_url, "about:blank");
    }

    #[test]
    fn test_pointer_script_shape() {
        let js = pointer_script(10.0, 20.5, &["mouseup", "click"], MouseButton::Left, 1);
        assert!(js.contains("elementFromPoint(10, 20.5)"));
        assert!(js.contains(r#"["mouseup","click"]"#));
    }

    #[tokio::test]
    #[ignore = "requires Chrome"]
    async fn test_launch_and_evaluate() {
        let client = EokaClient::launch(&LaunchConfig {
            headless: true,
            ..Default::default()
        })
        .await
        .unwrap();
        let target = client.initial_target().await.unwrap();
        let session = client.attach(&target).await.unwrap();
        let v = client.evaluate(&session, "1 + 2").await.unwrap();
        assert_eq!(v, serde_json::json!(3));
        client.close().await.unwrap();
    }
}

use super::{CancelFlag, ProgressEvent, ScriptError, StepFailure};
use crate::config::steps::{
    ClickAction, KeyAction, KeyDirection, NavigateAction, ScrollAction, SetViewportAction,
    TargetAction, TypeAction, WaitForElementAction, WaitForExpressionAction,
};
use crate::config::{Action, Condition, Settings, Step, Variables};
use crate::protocol::{
    self, InputEvent, ProtocolClient, Viewport, BODY_TEXT_JS, LOCATION_JS, READY_STATE_JS,
};
use crate::resolver::{ResolveOptions, Resolver};
use crate::session::{SessionHandle, SessionManager};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde_json::json;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// State of one script run. Owned by that run alone.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub script_id: String,
    /// Top-level step being executed.
    pub current_step_index: usize,
    /// Script parameters with caller overrides applied.
    pub variables: Variables,
    pub session: SessionHandle,
    pub started_at: DateTime<Utc>,
    pub cancel: CancelFlag,
    pub steps_executed: usize,
}

/// Everything a step needs besides the context.
pub(super) struct Env<'a> {
    pub client: &'a dyn ProtocolClient,
    pub sessions: &'a SessionManager,
    pub resolver: &'a Resolver,
    pub settings: &'a Settings,
    pub progress: Option<&'a mpsc::UnboundedSender<ProgressEvent>>,
}

/// Page function for element actions. Takes `{op, handle, x, y}`.
pub const ACTION_JS: &str = r#"
(args) => {
    // Elements are addressed by the handle the resolver tagged them with,
    // searched through open shadow roots.
    function byHandle(h) {
        const sel = '[data-pilot-ref="' + h + '"]';
        const walk = root => {
            const hit = root.querySelector(sel);
            if (hit) return hit;
            for (const n of root.querySelectorAll('*')) {
                if (n.shadowRoot) {
                    const inner = walk(n.shadowRoot);
                    if (inner) return inner;
                }
            }
            return null;
        };
        return walk(document);
    }

    const el = args.handle ? byHandle(args.handle) : null;
    switch (args.op) {
        case 'focus':
            if (!el) return false;
            el.scrollIntoView({block: 'center', inline: 'center'});
            el.focus();
            if ('value' in el) el.value = '';
            else if (el.isContentEditable) el.textContent = '';
            return true;
        case 'commit':
            if (!el) return false;
            el.dispatchEvent(new Event('input', {bubbles: true}));
            el.dispatchEvent(new Event('change', {bubbles: true}));
            return true;
        case 'scroll':
            if (args.handle && !el) return false;
            (el || window).scrollBy(args.x, args.y);
            return true;
    }
    return false;
}
"#;

/// Location of a step in the tree.
#[derive(Debug, Clone)]
struct StepPath(Vec<usize>);

impl StepPath {
    fn root(index: usize) -> Self {
        Self(vec![index])
    }

    fn child(&self, index: usize) -> Self {
        let mut path = self.0.clone();
        path.push(index);
        Self(path)
    }
}

impl fmt::Display for StepPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|i| i.to_string()).collect();
        f.write_str(&parts.join("."))
    }
}

fn failed(ctx: &ExecutionContext, step: &Step, path: &StepPath, cause: StepFailure) -> ScriptError {
    ScriptError::StepFailed {
        index: ctx.current_step_index,
        path: path.to_string(),
        kind: step.kind(),
        cause,
    }
}

fn lost(ctx: &ExecutionContext, step: &Step, path: &StepPath) -> ScriptError {
    ScriptError::SessionLost {
        index: ctx.current_step_index,
        path: path.to_string(),
        kind: step.kind(),
    }
}

/// Run top-level steps in order.
pub(super) async fn run_steps(
    env: &Env<'_>,
    ctx: &mut ExecutionContext,
    steps: &[Step],
) -> Result<(), ScriptError> {
    for (index, step) in steps.iter().enumerate() {
        if ctx.cancel.is_cancelled() {
            info!("Script '{}' cancelled before step {}", ctx.script_id, index);
            return Err(ScriptError::Cancelled { index });
        }
        ctx.current_step_index = index;
        let path = StepPath::root(index);

        let step = step.resolve(&ctx.variables).map_err(|e| {
            failed(
                ctx,
                step,
                &path,
                StepFailure::Invalid {
                    message: e.to_string(),
                },
            )
        })?;
        run_step(env, ctx, &step, path).await?;

        if env.settings.step_delay_ms > 0 && index + 1 < steps.len() {
            tokio::time::sleep(Duration::from_millis(env.settings.step_delay_ms)).await;
        }
    }
    Ok(())
}

fn run_step<'a, 'e>(
    env: &'a Env<'e>,
    ctx: &'a mut ExecutionContext,
    step: &'a Step,
    path: StepPath,
) -> BoxFuture<'a, Result<(), ScriptError>> {
    Box::pin(async move {
        if let Some(condition) = &step.condition {
            let holds = guarded(env, ctx, step, &path, move |s| check(env, s, condition)).await?;
            if !holds {
                info!("Skipping step {} ({}): condition not met", path, step.kind());
                return Ok(());
            }
        }

        match &step.repeat {
            None => run_body(env, ctx, step, &path).await?,
            Some(spec) => {
                for iteration in 0..spec.iterations {
                    if iteration > 0 && spec.wait_between_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(spec.wait_between_ms)).await;
                    }
                    if ctx.cancel.is_cancelled() {
                        info!("Loop at {} cancelled after {} iterations", path, iteration);
                        return Err(ScriptError::Cancelled {
                            index: ctx.current_step_index,
                        });
                    }
                    if let Some(condition) = &spec.condition {
                        let holds =
                            guarded(env, ctx, step, &path, move |s| check(env, s, condition))
                                .await?;
                        if !holds {
                            debug!(
                                "Loop at {} ended after {} iterations",
                                path, iteration
                            );
                            break;
                        }
                    }
                    run_body(env, ctx, step, &path).await?;
                }
            }
        }

        ctx.steps_executed += 1;
        if let Some(tx) = env.progress {
            let _ = tx.send(ProgressEvent {
                script_id: ctx.script_id.clone(),
                step_index: ctx.current_step_index,
                path: path.to_string(),
                kind: step.kind(),
            });
        }
        Ok(())
    })
}

async fn run_body(
    env: &Env<'_>,
    ctx: &mut ExecutionContext,
    step: &Step,
    path: &StepPath,
) -> Result<(), ScriptError> {
    match &step.action {
        Action::Steps(a) => {
            for (i, child) in a.steps.iter().enumerate() {
                if ctx.cancel.is_cancelled() {
                    return Err(ScriptError::Cancelled {
                        index: ctx.current_step_index,
                    });
                }
                run_step(env, ctx, child, path.child(i)).await?;
            }
            Ok(())
        }
        _ => guarded(env, ctx, step, path, move |s| perform(env, s, step)).await,
    }
}

/// Run `op` against the current session. A detach gets one retry on the
/// reattached session; a second detach means the session is lost.
async fn guarded<T, F, Fut>(
    env: &Env<'_>,
    ctx: &mut ExecutionContext,
    step: &Step,
    path: &StepPath,
    op: F,
) -> Result<T, ScriptError>
where
    F: Fn(SessionHandle) -> Fut,
    Fut: Future<Output = Result<T, StepFailure>>,
{
    match op(ctx.session.clone()).await {
        Ok(v) => return Ok(v),
        Err(e) if e.is_detach() => {
            warn!("Step {} ({}) lost its session: {}", path, step.kind(), e);
        }
        Err(e) => return Err(failed(ctx, step, path, e)),
    }

    let Some(session) = env.sessions.recover(&ctx.session).await else {
        return Err(lost(ctx, step, path));
    };
    info!(
        "Retrying step {} on session {} (generation {})",
        path, session.session_id, session.generation
    );
    ctx.session = session;

    match op(ctx.session.clone()).await {
        Ok(v) => Ok(v),
        Err(e) if e.is_detach() => Err(lost(ctx, step, path)),
        Err(e) => Err(failed(ctx, step, path, e)),
    }
}

fn step_timeout(env: &Env<'_>, step: &Step) -> Duration {
    step.timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| env.settings.default_timeout())
}

/// Dispatch a leaf step to its handler.
async fn perform(env: &Env<'_>, session: SessionHandle, step: &Step) -> Result<(), StepFailure> {
    let sid = session.session_id.as_str();
    let timeout = step_timeout(env, step);
    match &step.action {
        Action::Navigate(a) => navigate(env, sid, a, timeout).await,
        Action::Click(a) => click(env, sid, a, timeout).await,
        Action::Type(a) => type_text(env, sid, a, timeout).await,
        Action::Hover(a) => hover(env, sid, a, timeout).await,
        Action::Scroll(a) => scroll(env, sid, a, timeout).await,
        Action::WaitForElement(a) => wait_for_element(env, sid, a, timeout).await,
        Action::WaitForExpression(a) => wait_for_expression(env, sid, a, timeout).await,
        Action::SetViewport(a) => set_viewport(env, sid, a).await,
        Action::Key(a) => key(env, sid, a).await,
        // children are run by run_body
        Action::Steps(_) => Ok(()),
    }
}

async fn check(env: &Env<'_>, session: SessionHandle, condition: &Condition) -> Result<bool, StepFailure> {
    let sid = session.session_id.as_str();
    let holds = match condition {
        Condition::Expression(expression) => {
            protocol::is_truthy(&env.client.evaluate(sid, expression).await?)
        }
        Condition::Element { selectors, exists } => {
            env.resolver.probe(env.client, sid, selectors).await?.is_some() == *exists
        }
        Condition::UrlContains(pattern) => env
            .client
            .evaluate(sid, LOCATION_JS)
            .await?
            .as_str()
            .unwrap_or_default()
            .contains(pattern.as_str()),
        Condition::TextContains(pattern) => env
            .client
            .evaluate(sid, BODY_TEXT_JS)
            .await?
            .as_str()
            .unwrap_or_default()
            .contains(pattern.as_str()),
    };
    debug!("Condition {:?} -> {}", condition, holds);
    Ok(holds)
}

/// Poll `probe` until it returns true or `timeout` passes.
async fn wait_until<F, Fut>(
    env: &Env<'_>,
    timeout: Duration,
    what: &str,
    mut probe: F,
) -> Result<(), StepFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, StepFailure>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if probe().await? {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(StepFailure::Timeout {
                what: what.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        tokio::time::sleep(env.settings.poll_interval()).await;
    }
}

async fn navigate(
    env: &Env<'_>,
    sid: &str,
    a: &NavigateAction,
    timeout: Duration,
) -> Result<(), StepFailure> {
    info!("navigate: {}", a.url);
    env.client.navigate(sid, &a.url).await?;
    wait_until(env, timeout, "page load", move || async move {
        let state = env.client.evaluate(sid, READY_STATE_JS).await?;
        Ok(matches!(state.as_str(), Some("interactive") | Some("complete")))
    })
    .await
}

async fn click(
    env: &Env<'_>,
    sid: &str,
    a: &ClickAction,
    timeout: Duration,
) -> Result<(), StepFailure> {
    let el = env
        .resolver
        .resolve(
            env.client,
            sid,
            &a.selectors,
            &ResolveOptions::new(timeout).clickable(),
        )
        .await?;
    let x = el.bbox.x + a.offset_x.unwrap_or(el.bbox.width / 2.0);
    let y = el.bbox.y + a.offset_y.unwrap_or(el.bbox.height / 2.0);
    info!(
        "click: <{}> {} at ({:.0}, {:.0}) x{}",
        el.tag, el.path, x, y, a.click_count
    );
    protocol::click_at(env.client, sid, x, y, a.button, a.click_count).await?;
    Ok(())
}

async fn type_text(
    env: &Env<'_>,
    sid: &str,
    a: &TypeAction,
    timeout: Duration,
) -> Result<(), StepFailure> {
    let el = env
        .resolver
        .resolve(env.client, sid, &a.selectors, &ResolveOptions::new(timeout))
        .await?;
    info!("type: {} chars into {}", a.value.chars().count(), el.path);

    let focused = env
        .client
        .call_function(sid, ACTION_JS, &json!({"op": "focus", "handle": el.handle}))
        .await?;
    if !protocol::is_truthy(&focused) {
        return Err(StepFailure::NotFound {
            selectors: el.path.clone(),
        });
    }
    if !a.value.is_empty() {
        env.client
            .dispatch_input(
                sid,
                &InputEvent::InsertText {
                    text: a.value.clone(),
                },
            )
            .await?;
    }
    env.client
        .call_function(sid, ACTION_JS, &json!({"op": "commit", "handle": el.handle}))
        .await?;
    Ok(())
}

async fn hover(
    env: &Env<'_>,
    sid: &str,
    a: &TargetAction,
    timeout: Duration,
) -> Result<(), StepFailure> {
    let el = env
        .resolver
        .resolve(env.client, sid, &a.selectors, &ResolveOptions::new(timeout))
        .await?;
    let (x, y) = el.bbox.center();
    info!("hover: {}", el.path);
    env.client
        .dispatch_input(sid, &InputEvent::MouseMove { x, y })
        .await?;
    Ok(())
}

async fn scroll(
    env: &Env<'_>,
    sid: &str,
    a: &ScrollAction,
    timeout: Duration,
) -> Result<(), StepFailure> {
    let el = if a.selectors.is_empty() {
        None
    } else {
        Some(
            env.resolver
                .resolve(env.client, sid, &a.selectors, &ResolveOptions::new(timeout))
                .await?,
        )
    };
    info!(
        "scroll: ({}, {}) in {}",
        a.x,
        a.y,
        el.as_ref().map(|e| e.path.as_str()).unwrap_or("window")
    );
    let handle = el.map(|e| e.handle);
    let done = env
        .client
        .call_function(
            sid,
            ACTION_JS,
            &json!({"op": "scroll", "handle": handle, "x": a.x, "y": a.y}),
        )
        .await?;
    if !protocol::is_truthy(&done) {
        return Err(StepFailure::NotFound {
            selectors: a.selectors.to_string(),
        });
    }
    Ok(())
}

async fn wait_for_element(
    env: &Env<'_>,
    sid: &str,
    a: &WaitForElementAction,
    timeout: Duration,
) -> Result<(), StepFailure> {
    info!("waitForElement: {} (visible: {})", a.selectors, a.visible);
    if a.visible {
        env.resolver
            .wait_visible(env.client, sid, &a.selectors, timeout)
            .await?;
    } else {
        env.resolver
            .resolve(env.client, sid, &a.selectors, &ResolveOptions::new(timeout))
            .await?;
    }
    Ok(())
}

async fn wait_for_expression(
    env: &Env<'_>,
    sid: &str,
    a: &WaitForExpressionAction,
    timeout: Duration,
) -> Result<(), StepFailure> {
    info!("waitForExpression: {}", a.expression);
    wait_until(env, timeout, &a.expression, move || async move {
        Ok(protocol::is_truthy(&env.client.evaluate(sid, &a.expression).await?))
    })
    .await
}

async fn set_viewport(env: &Env<'_>, sid: &str, a: &SetViewportAction) -> Result<(), StepFailure> {
    info!("setViewport: {}x{}", a.width, a.height);
    let viewport = Viewport {
        width: a.width,
        height: a.height,
        device_scale_factor: a.device_scale_factor,
        mobile: a.is_mobile,
    };
    env.client.set_viewport(sid, &viewport).await?;
    Ok(())
}

async fn key(env: &Env<'_>, sid: &str, a: &KeyAction) -> Result<(), StepFailure> {
    info!("key {:?}: {}", a.direction, a.key);
    let key = a.key.clone();
    match a.direction {
        KeyDirection::Down => {
            env.client
                .dispatch_input(sid, &InputEvent::KeyDown { key })
                .await?
        }
        KeyDirection::Up => env.client.dispatch_input(sid, &InputEvent::KeyUp { key }).await?,
        KeyDirection::Press => {
            env.client
                .dispatch_input(sid, &InputEvent::KeyDown { key: key.clone() })
                .await?;
            env.client
                .dispatch_input(sid, &InputEvent::KeyUp { key })
                .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_path_display() {
        let root = StepPath::root(2);
        assert_eq!(root.to_string(), "2");
        assert_eq!(root.child(0).child(3).to_string(), "2.0.3");
    }
}

//! Per-target session lifecycle.
//!
//! Each target moves through `Detached -> Attaching -> Attached`, and from
//! `Attached` either back to `Detached` (explicit detach, or an unexpected one
//! while idle) or into `Reattaching` when it drops while a script holds the
//! target's lease. A reattach makes exactly one attempt; it ends in `Attached`
//! with a new generation or in `Detached`.
//!
//! State is published on a `watch` channel per target and driven by a task
//! that consumes the client's [`SessionEvent`] stream.

use crate::config::{SessionSettings, Settings};
use crate::protocol::{ProtocolClient, ProtocolError, ProtocolResult, SessionEvent, READY_STATE_JS};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A live attachment to a target.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHandle {
    pub target_id: String,
    pub session_id: String,
    pub attached_at: DateTime<Utc>,
    pub keep_alive_after_completion: bool,
    /// Bumped on every attach, including reattaches.
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Detached,
    Attaching,
    Attached(SessionHandle),
    Reattaching,
}

impl SessionState {
    pub fn handle(&self) -> Option<&SessionHandle> {
        match self {
            SessionState::Attached(h) => Some(h),
            _ => None,
        }
    }
}

struct TargetSlot {
    target_id: String,
    /// Serializes attach attempts so concurrent callers share one.
    attach_lock: tokio::sync::Mutex<()>,
    /// Script lease. tokio's mutex is fair, so waiters run in FIFO order.
    lease: Arc<tokio::sync::Mutex<()>>,
    running: AtomicBool,
    state: watch::Sender<SessionState>,
}

struct Inner {
    client: Arc<dyn ProtocolClient>,
    settings: SessionSettings,
    keep_alive: bool,
    poll_interval: Duration,
    targets: Mutex<HashMap<String, Arc<TargetSlot>>>,
    generation: AtomicU64,
}

/// Held by a running script. Other scripts on the same target queue behind it.
pub struct ScriptLease {
    slot: Arc<TargetSlot>,
    _guard: OwnedMutexGuard<()>,
}

impl ScriptLease {
    pub fn target_id(&self) -> &str {
        &self.slot.target_id
    }
}

impl Drop for ScriptLease {
    fn drop(&mut self) {
        self.slot.running.store(false, Ordering::SeqCst);
    }
}

/// Owns every session. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Create a manager and start its event loop.
    pub fn new(client: Arc<dyn ProtocolClient>, settings: &Settings) -> Self {
        let events = client.subscribe();
        let inner = Arc::new(Inner {
            client,
            settings: settings.session.clone(),
            keep_alive: settings.keep_alive,
            poll_interval: settings.poll_interval(),
            targets: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        });
        tokio::spawn(event_loop(Arc::downgrade(&inner), events));
        Self { inner }
    }

    pub fn client(&self) -> &Arc<dyn ProtocolClient> {
        &self.inner.client
    }

    /// Current state for a target.
    pub fn state(&self, target_id: &str) -> SessionState {
        self.inner
            .targets
            .lock()
            .get(target_id)
            .map(|slot| slot.state.borrow().clone())
            .unwrap_or(SessionState::Detached)
    }

    /// Watch a target's state.
    pub fn watch(&self, target_id: &str) -> watch::Receiver<SessionState> {
        self.inner.slot(target_id).state.subscribe()
    }

    /// The current handle for a target, if attached.
    pub fn handle(&self, target_id: &str) -> Option<SessionHandle> {
        self.state(target_id).handle().cloned()
    }

    /// Attach to `target_id` unless already attached.
    ///
    /// Concurrent callers share one underlying attach and get the same handle.
    pub async fn ensure_attached(&self, target_id: &str) -> ProtocolResult<SessionHandle> {
        let slot = self.inner.slot(target_id);
        if let Some(handle) = slot.state.borrow().handle() {
            return Ok(handle.clone());
        }

        let _attach = slot.attach_lock.lock().await;
        // A concurrent caller (or a reattach) may have finished while we waited.
        if let Some(handle) = slot.state.borrow().handle() {
            return Ok(handle.clone());
        }

        slot.state.send_replace(SessionState::Attaching);
        match self.inner.connect(&slot).await {
            Ok(handle) => {
                info!(
                    "Attached to {} (session {}, generation {})",
                    target_id, handle.session_id, handle.generation
                );
                slot.state.send_replace(SessionState::Attached(handle.clone()));
                Ok(handle)
            }
            Err(e) => {
                slot.state.send_replace(SessionState::Detached);
                Err(e)
            }
        }
    }

    /// Take the script lease for a target, waiting behind earlier holders.
    pub async fn acquire(&self, target_id: &str) -> ScriptLease {
        let slot = self.inner.slot(target_id);
        let guard = slot.lease.clone().lock_owned().await;
        slot.running.store(true, Ordering::SeqCst);
        debug!("Script lease taken on {}", target_id);
        ScriptLease {
            slot,
            _guard: guard,
        }
    }

    /// Recover after a step failed because `stale` went away.
    ///
    /// Starts the reattach if the event loop hasn't yet, then waits for its
    /// outcome. Returns `None` when the session is lost.
    pub async fn recover(&self, stale: &SessionHandle) -> Option<SessionHandle> {
        let slot = self.inner.slot(&stale.target_id);
        let mut rx = slot.state.subscribe();

        if slot.running.load(Ordering::SeqCst) {
            self.inner
                .clone()
                .start_reattach(slot.clone(), stale.session_id.clone());
        }

        let wait = async {
            loop {
                {
                    let state = rx.borrow_and_update();
                    match &*state {
                        SessionState::Attached(h) if h.generation > stale.generation => {
                            return Some(h.clone());
                        }
                        SessionState::Detached => return None,
                        _ => {}
                    }
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        };

        let timeout = Duration::from_millis(self.inner.settings.recover_timeout_ms);
        match tokio::time::timeout(timeout, wait).await {
            Ok(handle) => handle,
            Err(_) => {
                warn!("Timed out waiting for {} to reattach", stale.target_id);
                None
            }
        }
    }

    /// Explicitly detach from a target. Detaching an idle target is a no-op.
    pub async fn detach(&self, target_id: &str) -> ProtocolResult<()> {
        let slot = self.inner.slot(target_id);
        let _attach = slot.attach_lock.lock().await;
        let previous = slot.state.send_replace(SessionState::Detached);
        if let SessionState::Attached(handle) = previous {
            info!("Detaching from {} (session {})", target_id, handle.session_id);
            self.inner.client.detach(&handle.session_id).await?;
        }
        Ok(())
    }
}

impl Inner {
    fn slot(&self, target_id: &str) -> Arc<TargetSlot> {
        self.targets
            .lock()
            .entry(target_id.to_string())
            .or_insert_with(|| {
                Arc::new(TargetSlot {
                    target_id: target_id.to_string(),
                    attach_lock: tokio::sync::Mutex::new(()),
                    lease: Arc::new(tokio::sync::Mutex::new(())),
                    running: AtomicBool::new(false),
                    state: watch::channel(SessionState::Detached).0,
                })
            })
            .clone()
    }

    fn existing(&self, target_id: &str) -> Option<Arc<TargetSlot>> {
        self.targets.lock().get(target_id).cloned()
    }

    /// Drop a slot nothing is using.
    fn forget(&self, slot: &Arc<TargetSlot>) {
        if slot.running.load(Ordering::SeqCst) {
            return;
        }
        let idle = slot.lease.try_lock().is_ok() && slot.attach_lock.try_lock().is_ok();
        if !idle {
            return;
        }
        let mut targets = self.targets.lock();
        if targets
            .get(&slot.target_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            targets.remove(&slot.target_id);
            debug!("Forgot closed target {}", slot.target_id);
        }
    }

    /// Attach and wait for the page to be ready. Caller holds the attach lock.
    async fn connect(&self, slot: &TargetSlot) -> ProtocolResult<SessionHandle> {
        let session_id = self.client.attach(&slot.target_id).await?;
        if let Err(e) = self.wait_ready(&session_id).await {
            if !e.is_detach() {
                if let Err(detach) = self.client.detach(&session_id).await {
                    warn!("Failed to release session {}: {}", session_id, detach);
                }
            }
            return Err(e);
        }
        Ok(SessionHandle {
            target_id: slot.target_id.clone(),
            session_id,
            attached_at: Utc::now(),
            keep_alive_after_completion: self.keep_alive,
            generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
        })
    }

    async fn wait_ready(&self, session_id: &str) -> ProtocolResult<()> {
        let deadline = Instant::now() + Duration::from_millis(self.settings.ready_timeout_ms);
        loop {
            match self.client.evaluate(session_id, READY_STATE_JS).await {
                Ok(v) if matches!(v.as_str(), Some("interactive") | Some("complete")) => {
                    return Ok(());
                }
                Ok(v) => debug!("Waiting for ready, readyState={}", v),
                Err(e) if e.is_detach() => return Err(e),
                Err(ProtocolError::Evaluation(msg)) => debug!("readyState probe failed: {}", msg),
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                warn!("Page not ready after {}ms, continuing", self.settings.ready_timeout_ms);
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Move `slot` into `Reattaching` if it is still on `stale_session`, and
    /// spawn the single reattach attempt.
    fn start_reattach(self: Arc<Self>, slot: Arc<TargetSlot>, stale_session: String) {
        let claimed = slot.state.send_if_modified(|state| match state {
            SessionState::Attached(h) if h.session_id == stale_session => {
                *state = SessionState::Reattaching;
                true
            }
            _ => false,
        });
        if !claimed {
            return;
        }

        tokio::spawn(async move {
            let _attach = slot.attach_lock.lock().await;
            // ensure_attached got the lock first and already attached
            if !matches!(*slot.state.borrow(), SessionState::Reattaching) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(self.settings.reattach_backoff_ms)).await;
            match self.connect(&slot).await {
                Ok(handle) => {
                    info!(
                        "Reattached to {} (session {}, generation {})",
                        slot.target_id, handle.session_id, handle.generation
                    );
                    slot.state.send_replace(SessionState::Attached(handle));
                }
                Err(e) => {
                    warn!("Reattach to {} failed: {}", slot.target_id, e);
                    slot.state.send_replace(SessionState::Detached);
                }
            }
        });
    }

    fn on_event(self: &Arc<Self>, event: SessionEvent) {
        match event {
            SessionEvent::Detached {
                target_id,
                session_id,
                reason,
            } => {
                let Some(slot) = self.existing(&target_id) else {
                    return;
                };
                let current = slot
                    .state
                    .borrow()
                    .handle()
                    .map(|h| h.session_id == session_id)
                    .unwrap_or(false);
                if !current {
                    debug!("Ignoring detach of stale session {}", session_id);
                    return;
                }
                if slot.running.load(Ordering::SeqCst) {
                    warn!("{} detached mid-script ({}), reattaching", target_id, reason);
                    self.clone().start_reattach(slot, session_id);
                } else {
                    info!("{} detached while idle ({})", target_id, reason);
                    slot.state.send_if_modified(|state| match state {
                        SessionState::Attached(h) if h.session_id == session_id => {
                            *state = SessionState::Detached;
                            true
                        }
                        _ => false,
                    });
                }
            }
            SessionEvent::TargetClosed { target_id } => {
                if let Some(slot) = self.existing(&target_id) {
                    info!("Target {} closed", target_id);
                    slot.state.send_if_modified(|state| {
                        if matches!(state, SessionState::Attached(_)) {
                            *state = SessionState::Detached;
                            true
                        } else {
                            false
                        }
                    });
                    self.forget(&slot);
                }
            }
            SessionEvent::Disconnected => warn!("Protocol connection dropped"),
        }
    }
}

async fn event_loop(inner: Weak<Inner>, mut events: tokio::sync::broadcast::Receiver<SessionEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(n)) => {
                warn!("Session event loop lagged, {} events dropped", n);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.on_event(event);
    }
    debug!("Session event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBrowser;

    fn settings() -> Settings {
        let mut s = Settings::default();
        s.poll_interval_ms = 5;
        s.session.reattach_backoff_ms = 5;
        s.session.recover_timeout_ms = 500;
        s
    }

    #[tokio::test]
    async fn test_ensure_attached_reuses_handle() {
        let fake = Arc::new(FakeBrowser::new());
        let manager = SessionManager::new(fake.clone(), &settings());

        let a = manager.ensure_attached("T1").await.unwrap();
        let b = manager.ensure_attached("T1").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(fake.attach_count("T1"), 1);
        assert!(a.keep_alive_after_completion);
    }

    #[tokio::test]
    async fn test_attach_failure_leaves_detached() {
        let fake = Arc::new(FakeBrowser::new());
        fake.fail_attach("T9");
        let manager = SessionManager::new(fake.clone(), &settings());

        assert!(manager.ensure_attached("T9").await.is_err());
        assert_eq!(manager.state("T9"), SessionState::Detached);
    }

    #[tokio::test]
    async fn test_failed_readiness_releases_session() {
        let fake = Arc::new(FakeBrowser::new());
        fake.fail_ready("T1");
        let manager = SessionManager::new(fake.clone(), &settings());

        for _ in 0..3 {
            assert!(matches!(
                manager.ensure_attached("T1").await,
                Err(ProtocolError::Cdp { code: -32000, .. })
            ));
            assert_eq!(manager.state("T1"), SessionState::Detached);
        }
        assert_eq!(fake.attach_count("T1"), 3);
        assert_eq!(fake.detach_count(), 3);
    }

    #[tokio::test]
    async fn test_closed_target_is_forgotten_when_idle() {
        let fake = Arc::new(FakeBrowser::new());
        let manager = SessionManager::new(fake.clone(), &settings());
        manager.ensure_attached("T1").await.unwrap();
        manager.ensure_attached("T2").await.unwrap();
        let _lease = manager.acquire("T2").await;
        assert_eq!(manager.inner.targets.lock().len(), 2);

        fake.close_target("T1");
        fake.close_target("T2");
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(manager.state("T1"), SessionState::Detached);
        assert_eq!(manager.state("T2"), SessionState::Detached);
        // T2 still has a lease holder
        let tracked: Vec<String> = manager.inner.targets.lock().keys().cloned().collect();
        assert_eq!(tracked, vec!["T2".to_string()]);
    }

    #[tokio::test]
    async fn test_idle_detach_goes_detached_silently() {
        let fake = Arc::new(FakeBrowser::new());
        let manager = SessionManager::new(fake.clone(), &settings());
        let handle = manager.ensure_attached("T1").await.unwrap();

        let mut rx = manager.watch("T1");
        fake.emit_detach("T1");
        rx.wait_for(|s| *s == SessionState::Detached).await.unwrap();

        // No reattach while idle.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(fake.attach_count("T1"), 1);
        assert_eq!(manager.state("T1"), SessionState::Detached);

        // Explicit re-attach gets a newer generation.
        let again = manager.ensure_attached("T1").await.unwrap();
        assert!(again.generation > handle.generation);
    }

    #[tokio::test]
    async fn test_detach_while_running_reattaches() {
        let fake = Arc::new(FakeBrowser::new());
        let manager = SessionManager::new(fake.clone(), &settings());
        let _lease = manager.acquire("T1").await;
        let handle = manager.ensure_attached("T1").await.unwrap();

        fake.emit_detach("T1");
        let recovered = manager.recover(&handle).await.unwrap();
        assert!(recovered.generation > handle.generation);
        assert_ne!(recovered.session_id, handle.session_id);
        assert_eq!(fake.attach_count("T1"), 2);
    }

    #[tokio::test]
    async fn test_failed_reattach_is_lost() {
        let fake = Arc::new(FakeBrowser::new());
        let manager = SessionManager::new(fake.clone(), &settings());
        let _lease = manager.acquire("T1").await;
        let handle = manager.ensure_attached("T1").await.unwrap();

        fake.fail_attach("T1");
        fake.emit_detach("T1");
        assert!(manager.recover(&handle).await.is_none());
        assert_eq!(manager.state("T1"), SessionState::Detached);
    }

    #[tokio::test]
    async fn test_explicit_detach() {
        let fake = Arc::new(FakeBrowser::new());
        let manager = SessionManager::new(fake.clone(), &settings());
        manager.ensure_attached("T1").await.unwrap();
        manager.detach("T1").await.unwrap();
        assert_eq!(manager.state("T1"), SessionState::Detached);
        assert_eq!(fake.detach_count(), 1);
        // Idempotent
        manager.detach("T1").await.unwrap();
        assert_eq!(fake.detach_count(), 1);
    }

    #[tokio::test]
    async fn test_leases_are_fifo() {
        let fake = Arc::new(FakeBrowser::new());
        let manager = SessionManager::new(fake, &settings());
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = manager.acquire("T1").await;
        let mut tasks = Vec::new();
        for i in 0..3 {
            let manager = manager.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let _lease = manager.acquire("T1").await;
                order.lock().push(i);
            }));
            // let each waiter queue before the next
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(first);
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }
}

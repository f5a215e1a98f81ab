use super::orchestrator::ToOrchestrator;
use super::{Command, RelayError, Reply};
use crate::runner::ProgressEvent;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

pub(super) enum PortMessage {
    Response {
        request_id: u64,
        result: Result<Reply, RelayError>,
    },
    Progress {
        request_id: u64,
        event: ProgressEvent,
    },
}

/// A progress notification for one of this port's requests.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub request_id: u64,
    pub event: ProgressEvent,
}

type Waiters = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Reply, RelayError>>>>>;

/// One caller's channel to the orchestrator.
///
/// Request ids are scoped to the port, so two ports may both use id 1.
pub struct Port {
    id: u64,
    orchestrator: mpsc::UnboundedSender<ToOrchestrator>,
    next_request: AtomicU64,
    waiters: Waiters,
    notifications: tokio::sync::Mutex<mpsc::UnboundedReceiver<Notification>>,
    backstop: Duration,
    dispatch: JoinHandle<()>,
}

impl Port {
    pub(super) fn open(
        id: u64,
        orchestrator: mpsc::UnboundedSender<ToOrchestrator>,
        backstop: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let waiters: Waiters = Arc::new(Mutex::new(HashMap::new()));
        let _ = orchestrator.send(ToOrchestrator::OpenPort { port_id: id, tx });

        let dispatch = tokio::spawn(dispatch(rx, waiters.clone(), notify_tx));
        Self {
            id,
            orchestrator,
            next_request: AtomicU64::new(0),
            waiters,
            notifications: tokio::sync::Mutex::new(notify_rx),
            backstop,
            dispatch,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Send a command and wait for its reply.
    pub async fn send(&self, command: Command) -> Result<Reply, RelayError> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(request_id, tx);

        let sent = self.orchestrator.send(ToOrchestrator::Request {
            port_id: self.id,
            request_id,
            command,
        });
        if sent.is_err() {
            self.waiters.lock().remove(&request_id);
            return Err(RelayError::Closed);
        }

        match tokio::time::timeout(self.backstop, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RelayError::Closed),
            Err(_) => {
                self.waiters.lock().remove(&request_id);
                Err(RelayError::Timeout)
            }
        }
    }

    /// Next progress notification, or `None` once the port is closed.
    pub async fn next_notification(&self) -> Option<Notification> {
        self.notifications.lock().await.recv().await
    }

    /// Notifications already received, without waiting.
    pub async fn drain_notifications(&self) -> Vec<Notification> {
        let mut rx = self.notifications.lock().await;
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        let _ = self
            .orchestrator
            .send(ToOrchestrator::ClosePort { port_id: self.id });
        self.dispatch.abort();
    }
}

async fn dispatch(
    mut rx: mpsc::UnboundedReceiver<PortMessage>,
    waiters: Waiters,
    notify: mpsc::UnboundedSender<Notification>,
) {
    while let Some(msg) = rx.recv().await {
        match msg {
            PortMessage::Response { request_id, result } => {
                match waiters.lock().remove(&request_id) {
                    Some(tx) => {
                        let _ = tx.send(result);
                    }
                    None => debug!("No waiter for request {}", request_id),
                }
            }
            PortMessage::Progress { request_id, event } => {
                let _ = notify.send(Notification { request_id, event });
            }
        }
    }

    for (_, tx) in waiters.lock().drain() {
        let _ = tx.send(Err(RelayError::Closed));
    }
}

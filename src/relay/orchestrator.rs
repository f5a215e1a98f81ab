use super::port::{Port, PortMessage};
use super::{Command, LinkMessage, LinkRequest, RelayError, Reply, WorkerConnector};
use crate::config::{RelaySettings, Variables};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Relay timing and the parameters merged under every script run.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub timeout: Duration,
    pub sweep_interval: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_backoff: Duration,
    pub default_parameters: Variables,
}

impl RelayConfig {
    pub fn with_defaults(mut self, defaults: Variables) -> Self {
        self.default_parameters = defaults;
        self
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig::from(&RelaySettings::default())
    }
}

impl From<&RelaySettings> for RelayConfig {
    fn from(s: &RelaySettings) -> Self {
        Self {
            timeout: Duration::from_millis(s.timeout_ms),
            sweep_interval: Duration::from_millis(s.sweep_interval_ms.max(1)),
            reconnect_attempts: s.reconnect_attempts,
            reconnect_backoff: Duration::from_millis(s.reconnect_backoff_ms),
            default_parameters: Variables::new(),
        }
    }
}

pub(super) enum ToOrchestrator {
    OpenPort {
        port_id: u64,
        tx: mpsc::UnboundedSender<PortMessage>,
    },
    ClosePort {
        port_id: u64,
    },
    Request {
        port_id: u64,
        request_id: u64,
        command: Command,
    },
    PendingCount(oneshot::Sender<usize>),
    Shutdown,
}

struct PendingRequest {
    port_id: u64,
    request_id: u64,
    command: &'static str,
    created_at: DateTime<Utc>,
    timeout_at: Instant,
}

/// Handle to a running orchestrator task.
#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::UnboundedSender<ToOrchestrator>,
    next_port: Arc<AtomicU64>,
    backstop: Duration,
}

impl OrchestratorHandle {
    /// Open a channel for one caller context.
    pub fn open_port(&self) -> Port {
        let port_id = self.next_port.fetch_add(1, Ordering::Relaxed) + 1;
        Port::open(port_id, self.tx.clone(), self.backstop)
    }

    /// Requests forwarded to the worker and not yet answered.
    pub async fn pending_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(ToOrchestrator::PendingCount(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(ToOrchestrator::Shutdown);
    }
}

/// Owns the worker link and routes every request and reply across it.
pub struct Orchestrator {
    connector: Arc<dyn WorkerConnector>,
    config: RelayConfig,
    inbox: mpsc::UnboundedReceiver<ToOrchestrator>,
    link: Option<mpsc::UnboundedSender<LinkRequest>>,
    link_rx: Option<mpsc::UnboundedReceiver<LinkMessage>>,
    ports: HashMap<u64, mpsc::UnboundedSender<PortMessage>>,
    pending: HashMap<u64, PendingRequest>,
    next_relay_id: u64,
}

impl Orchestrator {
    /// Start the orchestrator task. The worker link is opened lazily.
    pub fn spawn(connector: Arc<dyn WorkerConnector>, config: RelayConfig) -> OrchestratorHandle {
        let (tx, inbox) = mpsc::unbounded_channel();
        let backstop = config.timeout + config.sweep_interval + Duration::from_secs(1);
        let orchestrator = Orchestrator {
            connector,
            config,
            inbox,
            link: None,
            link_rx: None,
            ports: HashMap::new(),
            pending: HashMap::new(),
            next_relay_id: 0,
        };
        tokio::spawn(orchestrator.run());
        OrchestratorHandle {
            tx,
            next_port: Arc::new(AtomicU64::new(0)),
            backstop,
        }
    }

    async fn run(mut self) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = self.inbox.recv() => match msg {
                    Some(ToOrchestrator::Shutdown) | None => break,
                    Some(msg) => self.handle(msg).await,
                },
                msg = next_link_message(&mut self.link_rx) => match msg {
                    Some(msg) => self.on_link_message(msg),
                    None => self.link_lost().await,
                },
                _ = sweep.tick() => self.sweep(),
            }
        }

        for (_, entry) in self.pending.drain() {
            if let Some(port) = self.ports.get(&entry.port_id) {
                let _ = port.send(PortMessage::Response {
                    request_id: entry.request_id,
                    result: Err(RelayError::Closed),
                });
            }
        }
        debug!("Orchestrator stopped");
    }

    async fn handle(&mut self, msg: ToOrchestrator) {
        match msg {
            ToOrchestrator::OpenPort { port_id, tx } => {
                debug!("Port {} opened", port_id);
                self.ports.insert(port_id, tx);
            }
            ToOrchestrator::ClosePort { port_id } => {
                debug!("Port {} closed", port_id);
                self.ports.remove(&port_id);
                self.pending.retain(|_, p| p.port_id != port_id);
            }
            ToOrchestrator::Request {
                port_id,
                request_id,
                command,
            } => self.forward(port_id, request_id, command).await,
            ToOrchestrator::PendingCount(tx) => {
                let _ = tx.send(self.pending.len());
            }
            ToOrchestrator::Shutdown => {}
        }
    }

    async fn forward(&mut self, port_id: u64, request_id: u64, command: Command) {
        let command = match self.prepare(command) {
            Ok(command) => command,
            Err(e) => {
                debug!("Rejected request {} on port {}: {}", request_id, port_id, e);
                self.respond(port_id, request_id, Err(e));
                return;
            }
        };

        if self.link.is_none() && !self.connect(1).await {
            self.respond(port_id, request_id, Err(RelayError::Disconnected));
            return;
        }

        self.next_relay_id += 1;
        let relay_id = self.next_relay_id;
        let name = command.name();
        debug!(
            "Forwarding {} request {} from port {} as {}",
            name, request_id, port_id, relay_id
        );

        let sent = self
            .link
            .as_ref()
            .map(|link| link.send(LinkRequest { relay_id, command }).is_ok())
            .unwrap_or(false);
        if !sent {
            self.respond(port_id, request_id, Err(RelayError::Disconnected));
            self.link_lost().await;
            return;
        }

        self.pending.insert(
            relay_id,
            PendingRequest {
                port_id,
                request_id,
                command: name,
                created_at: Utc::now(),
                timeout_at: Instant::now() + self.config.timeout,
            },
        );
    }

    /// Validate a command and apply the default parameters.
    fn prepare(&self, mut command: Command) -> Result<Command, RelayError> {
        let (value, what) = match &command {
            Command::RunScript { script_id, .. } | Command::Cancel { script_id } => {
                (script_id, "script id")
            }
            Command::ProcessIntent { text, .. } => (text, "intent text"),
            Command::Attach { target } | Command::Detach { target } => (target, "target"),
        };
        if value.trim().is_empty() {
            return Err(RelayError::InvalidCommand(format!("{} is empty", what)));
        }

        if let Command::RunScript { parameters, .. } = &mut command {
            *parameters = Variables::merged(&self.config.default_parameters, parameters);
        }
        Ok(command)
    }

    fn on_link_message(&mut self, msg: LinkMessage) {
        match msg {
            LinkMessage::Response { relay_id, reply } => match self.pending.remove(&relay_id) {
                Some(entry) => {
                    debug!(
                        "Request {} ({}) answered after {}ms",
                        relay_id,
                        entry.command,
                        (Utc::now() - entry.created_at).num_milliseconds()
                    );
                    self.respond(entry.port_id, entry.request_id, Ok(reply));
                }
                None => debug!("Dropping reply for unknown request {}", relay_id),
            },
            LinkMessage::Progress { relay_id, event } => match self.pending.get(&relay_id) {
                Some(entry) => {
                    if let Some(port) = self.ports.get(&entry.port_id) {
                        let _ = port.send(PortMessage::Progress {
                            request_id: entry.request_id,
                            event,
                        });
                    }
                }
                None => debug!("Dropping progress for unknown request {}", relay_id),
            },
        }
    }

    fn respond(&self, port_id: u64, request_id: u64, result: Result<Reply, RelayError>) {
        match self.ports.get(&port_id) {
            Some(port) => {
                let _ = port.send(PortMessage::Response { request_id, result });
            }
            None => debug!("Port {} gone, dropping reply {}", port_id, request_id),
        }
    }

    fn sweep(&mut self) {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.timeout_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for relay_id in expired {
            if let Some(entry) = self.pending.remove(&relay_id) {
                warn!(
                    "Request {} ({}) timed out after {}ms",
                    relay_id,
                    entry.command,
                    self.config.timeout.as_millis()
                );
                self.respond(entry.port_id, entry.request_id, Err(RelayError::Timeout));
            }
        }
    }

    /// Fail everything in flight, then try to reopen the link.
    async fn link_lost(&mut self) {
        self.link = None;
        self.link_rx = None;
        let in_flight: Vec<PendingRequest> = self.pending.drain().map(|(_, p)| p).collect();
        warn!("Worker link lost with {} request(s) in flight", in_flight.len());
        for entry in in_flight {
            self.respond(entry.port_id, entry.request_id, Err(RelayError::Timeout));
        }
        self.connect(self.config.reconnect_attempts).await;
    }

    async fn connect(&mut self, attempts: u32) -> bool {
        for attempt in 1..=attempts.max(1) {
            match self.connector.connect().await {
                Ok(link) => {
                    info!("Worker link connected");
                    self.link = Some(link.requests);
                    self.link_rx = Some(link.messages);
                    return true;
                }
                Err(e) => {
                    warn!("Worker link attempt {}/{} failed: {}", attempt, attempts, e);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.reconnect_backoff * attempt).await;
                    }
                }
            }
        }
        false
    }
}

async fn next_link_message(rx: &mut Option<mpsc::UnboundedReceiver<LinkMessage>>) -> Option<LinkMessage> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::WorkerLink;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Hands the worker side of each link to the test.
    struct ManualConnector {
        links: Mutex<Vec<(mpsc::UnboundedReceiver<LinkRequest>, mpsc::UnboundedSender<LinkMessage>)>>,
        notify: mpsc::UnboundedSender<()>,
        refuse: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl WorkerConnector for ManualConnector {
        async fn connect(&self) -> Result<WorkerLink, RelayError> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(RelayError::Disconnected);
            }
            let (req_tx, req_rx) = mpsc::unbounded_channel();
            let (msg_tx, msg_rx) = mpsc::unbounded_channel();
            self.links.lock().push((req_rx, msg_tx));
            let _ = self.notify.send(());
            Ok(WorkerLink {
                requests: req_tx,
                messages: msg_rx,
            })
        }
    }

    fn manual() -> (Arc<ManualConnector>, mpsc::UnboundedReceiver<()>) {
        let (notify, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(ManualConnector {
            links: Mutex::new(Vec::new()),
            notify,
            refuse: std::sync::atomic::AtomicBool::new(false),
        });
        (connector, rx)
    }

    fn fast_config() -> RelayConfig {
        RelayConfig {
            timeout: Duration::from_millis(200),
            sweep_interval: Duration::from_millis(20),
            reconnect_attempts: 2,
            reconnect_backoff: Duration::from_millis(5),
            default_parameters: Variables::new(),
        }
    }

    #[tokio::test]
    async fn test_rejects_empty_script_id() {
        let (connector, _rx) = manual();
        let handle = Orchestrator::spawn(connector.clone(), fast_config());
        let port = handle.open_port();

        let err = port
            .send(Command::RunScript {
                script_id: " ".into(),
                parameters: Variables::new(),
                target: None,
                detach: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidCommand(_)));
        assert!(connector.links.lock().is_empty());
    }

    #[tokio::test]
    async fn test_defaults_merge_under_caller_parameters() {
        let (connector, mut connected) = manual();
        let config = fast_config().with_defaults(Variables::new().set("q", "default").set("lang", "en"));
        let handle = Orchestrator::spawn(connector.clone(), config);
        let port = handle.open_port();

        let send = tokio::spawn(async move {
            port.send(Command::RunScript {
                script_id: "search".into(),
                parameters: Variables::new().set("q", "mine"),
                target: None,
                detach: false,
            })
            .await
        });

        connected.recv().await.unwrap();
        let (mut requests, messages) = connector.links.lock().pop().unwrap();
        let request = requests.recv().await.unwrap();
        match &request.command {
            Command::RunScript { parameters, .. } => {
                assert_eq!(parameters.get("q"), Some("mine"));
                assert_eq!(parameters.get("lang"), Some("en"));
            }
            other => panic!("unexpected command {:?}", other),
        }
        messages
            .send(LinkMessage::Response {
                relay_id: request.relay_id,
                reply: Reply::NoMatch { text: "ok".into() },
            })
            .unwrap();
        assert_eq!(
            send.await.unwrap().unwrap(),
            Reply::NoMatch { text: "ok".into() }
        );
    }

    #[tokio::test]
    async fn test_sweep_times_out_unanswered_requests() {
        let (connector, _rx) = manual();
        let handle = Orchestrator::spawn(connector.clone(), fast_config());
        let port = handle.open_port();

        let err = port
            .send(Command::Attach { target: "T1".into() })
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::Timeout);
        assert_eq!(handle.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_disconnected_when_worker_unreachable() {
        let (connector, _rx) = manual();
        connector.refuse.store(true, Ordering::SeqCst);
        let handle = Orchestrator::spawn(connector, fast_config());
        let port = handle.open_port();

        let err = port
            .send(Command::Detach { target: "T1".into() })
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::Disconnected);
    }
}

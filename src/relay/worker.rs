use super::{Command, LinkMessage, LinkRequest, RelayError, Reply, WorkerConnector, WorkerLink};
use crate::config::Variables;
use crate::runner::{CancelFlag, ProgressEvent, ResultCode, RunOptions, Runner};
use crate::store::{IntentClassifier, ScriptStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// The long-lived side of the relay: owns the runner and answers commands.
pub struct WorkerHost {
    runner: Arc<Runner>,
    store: Arc<dyn ScriptStore>,
    classifier: Option<Arc<dyn IntentClassifier>>,
    default_target: Option<String>,
    running: Mutex<HashMap<String, Vec<CancelFlag>>>,
}

impl WorkerHost {
    pub fn new(runner: Arc<Runner>, store: Arc<dyn ScriptStore>) -> Self {
        Self {
            runner,
            store,
            classifier: None,
            default_target: None,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn IntentClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Target used when a command names none.
    pub fn with_default_target(mut self, target: impl Into<String>) -> Self {
        self.default_target = Some(target.into());
        self
    }

    pub fn runner(&self) -> &Arc<Runner> {
        &self.runner
    }

    /// Start answering requests and return the orchestrator's end of the link.
    pub fn serve(self: Arc<Self>) -> WorkerLink {
        let (req_tx, mut req_rx) = mpsc::unbounded_channel::<LinkRequest>();
        let (msg_tx, msg_rx) = mpsc::unbounded_channel::<LinkMessage>();

        tokio::spawn(async move {
            while let Some(LinkRequest { relay_id, command }) = req_rx.recv().await {
                let host = self.clone();
                let messages = msg_tx.clone();
                tokio::spawn(async move {
                    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
                    let forward_to = messages.clone();
                    let forwarder = tokio::spawn(async move {
                        while let Some(event) = progress_rx.recv().await {
                            let _ = forward_to.send(LinkMessage::Progress { relay_id, event });
                        }
                    });

                    let reply = host.handle(command, Some(progress_tx)).await;
                    // Progress for this request goes out before its reply.
                    let _ = forwarder.await;
                    let _ = messages.send(LinkMessage::Response { relay_id, reply });
                });
            }
            debug!("Worker link closed by orchestrator");
        });

        WorkerLink {
            requests: req_tx,
            messages: msg_rx,
        }
    }

    /// Answer a single command.
    pub async fn handle(
        &self,
        command: Command,
        progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
    ) -> Reply {
        debug!("Handling {}", command.name());
        match command {
            Command::RunScript {
                script_id,
                parameters,
                target,
                detach,
            } => {
                self.run_script(&script_id, &parameters, target, detach, progress)
                    .await
            }
            Command::ProcessIntent { text, target } => {
                self.process_intent(&text, target, progress).await
            }
            Command::Attach { target } => {
                match self.runner.sessions().ensure_attached(&target).await {
                    Ok(handle) => Reply::Attached {
                        target_id: handle.target_id,
                        session_id: handle.session_id,
                        generation: handle.generation,
                    },
                    Err(e) => Reply::Failed {
                        code: ResultCode::SessionLost,
                        error: e.to_string(),
                    },
                }
            }
            Command::Detach { target } => match self.runner.sessions().detach(&target).await {
                Ok(()) => Reply::Detached { target_id: target },
                Err(e) => Reply::Failed {
                    code: ResultCode::SessionLost,
                    error: e.to_string(),
                },
            },
            Command::Cancel { script_id } => {
                let flags = self.running.lock().get(&script_id).cloned();
                let found = match flags {
                    Some(flags) => {
                        info!("Cancelling {} run(s) of '{}'", flags.len(), script_id);
                        flags.iter().for_each(CancelFlag::cancel);
                        true
                    }
                    None => false,
                };
                Reply::Cancelled { script_id, found }
            }
        }
    }

    async fn run_script(
        &self,
        script_id: &str,
        parameters: &Variables,
        target: Option<String>,
        detach: bool,
        progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
    ) -> Reply {
        let Some(target) = target.or_else(|| self.default_target.clone()) else {
            return Reply::Failed {
                code: ResultCode::InvalidCommand,
                error: "no target given".into(),
            };
        };
        let script = match self.store.load(script_id).await {
            Ok(script) => script,
            Err(e) => {
                warn!("Cannot load script '{}': {}", script_id, e);
                return Reply::Failed {
                    code: ResultCode::InvalidCommand,
                    error: e.to_string(),
                };
            }
        };

        let cancel = CancelFlag::new();
        self.running
            .lock()
            .entry(script_id.to_string())
            .or_default()
            .push(cancel.clone());

        let mut options = RunOptions::new(target)
            .detach(detach)
            .with_cancel(cancel.clone());
        if let Some(tx) = progress {
            options = options.with_progress(tx);
        }
        let result = self.runner.run(&script, parameters, options).await;

        let mut running = self.running.lock();
        if let Some(flags) = running.get_mut(script_id) {
            flags.retain(|f| !f.same_as(&cancel));
            if flags.is_empty() {
                running.remove(script_id);
            }
        }
        Reply::Execution(result)
    }

    async fn process_intent(
        &self,
        text: &str,
        target: Option<String>,
        progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
    ) -> Reply {
        let Some(classifier) = &self.classifier else {
            return Reply::Failed {
                code: ResultCode::InvalidCommand,
                error: "no intent classifier configured".into(),
            };
        };
        let Some(intent) = classifier.classify(text).await else {
            debug!("No intent for {:?}", text);
            return Reply::NoMatch { text: text.into() };
        };
        match intent.script_reference.clone() {
            Some(script_id) => {
                info!("Intent '{}' runs script '{}'", intent.category, script_id);
                self.run_script(&script_id, &intent.parameters, target, false, progress)
                    .await
            }
            None => Reply::Intent(intent),
        }
    }
}

/// Connects the orchestrator to a worker host in the same process.
pub struct LocalConnector {
    host: Arc<WorkerHost>,
}

impl LocalConnector {
    pub fn new(host: Arc<WorkerHost>) -> Self {
        Self { host }
    }
}

#[async_trait]
impl WorkerConnector for LocalConnector {
    async fn connect(&self) -> Result<WorkerLink, RelayError> {
        Ok(self.host.clone().serve())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Script, Settings};
    use crate::store::{IntentMatch, MemoryStore};
    use crate::testing::{FakeBrowser, FakeElement};

    struct Keywords;

    #[async_trait]
    impl IntentClassifier for Keywords {
        async fn classify(&self, text: &str) -> Option<IntentMatch> {
            if text.starts_with("search") {
                Some(IntentMatch {
                    category: "search".into(),
                    parameters: Variables::new().set("q", text.trim_start_matches("search ")),
                    script_reference: Some("search".into()),
                })
            } else if text == "hello" {
                Some(IntentMatch {
                    category: "greeting".into(),
                    parameters: Variables::new(),
                    script_reference: None,
                })
            } else {
                None
            }
        }
    }

    fn host(browser: &Arc<FakeBrowser>) -> WorkerHost {
        let script = Script::parse(
            r##"{"title": "Search", "steps": [{"type": "type", "selectors": ["#q"], "value": "{{q}}"}]}"##,
        )
        .unwrap();
        let store = MemoryStore::new().with("search", script);
        let runner = Runner::new(browser.clone(), Settings::default());
        WorkerHost::new(Arc::new(runner), Arc::new(store)).with_default_target("T1")
    }

    #[tokio::test]
    async fn test_intent_runs_referenced_script() {
        let browser = Arc::new(FakeBrowser::new());
        browser.add_element("#q", FakeElement::new("input", "input#q").at(10.0, 10.0, 100.0, 20.0));
        let host = host(&browser).with_classifier(Arc::new(Keywords));

        let reply = host
            .handle(
                Command::ProcessIntent {
                    text: "search rust".into(),
                    target: None,
                },
                None,
            )
            .await;
        match reply {
            Reply::Execution(result) => assert!(result.success, "{:?}", result.error),
            other => panic!("unexpected reply {:?}", other),
        }

        let reply = host
            .handle(
                Command::ProcessIntent {
                    text: "hello".into(),
                    target: None,
                },
                None,
            )
            .await;
        assert!(matches!(reply, Reply::Intent(ref m) if m.category == "greeting"));

        let reply = host
            .handle(
                Command::ProcessIntent {
                    text: "what".into(),
                    target: None,
                },
                None,
            )
            .await;
        assert_eq!(reply, Reply::NoMatch { text: "what".into() });
    }

    #[tokio::test]
    async fn test_unknown_script_fails() {
        let browser = Arc::new(FakeBrowser::new());
        let reply = host(&browser)
            .handle(
                Command::RunScript {
                    script_id: "nope".into(),
                    parameters: Variables::new(),
                    target: None,
                    detach: false,
                },
                None,
            )
            .await;
        assert!(matches!(
            reply,
            Reply::Failed {
                code: ResultCode::InvalidCommand,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_attach_and_detach() {
        let browser = Arc::new(FakeBrowser::new());
        let host = host(&browser);

        let reply = host
            .handle(Command::Attach { target: "T1".into() }, None)
            .await;
        assert!(matches!(reply, Reply::Attached { ref target_id, .. } if target_id == "T1"));

        let reply = host
            .handle(Command::Detach { target: "T1".into() }, None)
            .await;
        assert_eq!(
            reply,
            Reply::Detached {
                target_id: "T1".into()
            }
        );
        assert_eq!(browser.detach_count(), 1);

        let reply = host
            .handle(
                Command::Cancel {
                    script_id: "search".into(),
                },
                None,
            )
            .await;
        assert_eq!(
            reply,
            Reply::Cancelled {
                script_id: "search".into(),
                found: false
            }
        );
    }
}

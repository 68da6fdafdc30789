//! Conversation cycle: send one message, stream the reply, run the requested tool, save the exchange.
//!
//! At most one cycle is in flight. Each cycle runs on its own task and reports progress to the
//! single attached listener; a cycle with no listener still runs to completion and is saved.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{self, Config};
use crate::exec::ShellExecutor;
use crate::history::{ConversationEntry, HistoryError, HistoryStore};
use crate::llm::{AnthropicClient, ContentBlock, MessagesApi, MessagesRequest};
use crate::stream::{accumulate, CompletedResponse, EventDecoder};
use crate::tools::{AttachedImage, CommandCapture, DispatchOutcome, ToolDispatcher};

/// Where the orchestrator is in its cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CycleState {
    #[default]
    Idle,
    Sending,
    StreamingResponse,
    Dispatching,
}

/// Progress reported to the listener, in order. `Finished` is always the last event of a cycle.
#[derive(Debug, Clone)]
pub enum CycleEvent {
    /// Full response text so far.
    ResponseUpdated(String),
    /// Stream is over; no further text updates follow.
    ResponseComplete(CompletedResponse),
    /// Non-empty output of a tool run (stdout followed by stderr).
    ToolOutput { tool: String, output: String },
    /// A screenshot was taken and will be attached to the next message.
    ScreenshotQueued,
    /// The request or stream failed; nothing was saved.
    Failed(String),
    /// The exchange could not be written to history.
    HistoryFailed(String),
    /// The cycle is over. Carries the saved entry when one was written.
    Finished(Option<ConversationEntry>),
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("a message is already being processed")]
    Busy,
    #[error("message is empty")]
    EmptyMessage,
    #[error(transparent)]
    History(#[from] HistoryError),
}

/// Collaborators used by every cycle.
pub struct Services {
    pub api: Arc<dyn MessagesApi>,
    pub dispatcher: ToolDispatcher,
    pub history: HistoryStore,
    pub model: String,
    pub max_tokens: u32,
}

impl Services {
    /// Wire up the real client, shell executor, screenshot command and history file.
    /// Fails before any network access when no API key is configured.
    pub fn from_config(config: &Config, config_path: &Path) -> anyhow::Result<Self> {
        let api = AnthropicClient::from_config(config)?;
        let dispatcher = ToolDispatcher::new(
            Arc::new(ShellExecutor::new()),
            Arc::new(
                CommandCapture::new(config.tools.screenshot_command.clone())
                    .with_timeout(config.tools.command_timeout()),
            ),
        )
        .with_command_timeout(config.tools.command_timeout());
        let history = HistoryStore::open(config::resolve_history_path(config, config_path))?;
        Ok(Self {
            api: Arc::new(api),
            dispatcher,
            history,
            model: config.api.model.clone(),
            max_tokens: config.api.max_tokens,
        })
    }
}

/// State shared between the orchestrator and its cycle task.
struct Shared {
    services: Services,
    state: watch::Sender<CycleState>,
    listener: Mutex<Option<mpsc::UnboundedSender<CycleEvent>>>,
    pending_image: Mutex<Option<AttachedImage>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Orchestrator {
    shared: Arc<Shared>,
    runtime: Handle,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl Orchestrator {
    /// Cycles are spawned onto `runtime`, so the caller's thread never waits on the network.
    pub fn new(services: Services, runtime: Handle) -> Self {
        let (state, _) = watch::channel(CycleState::Idle);
        Self {
            shared: Arc::new(Shared {
                services,
                state,
                listener: Mutex::new(None),
                pending_image: Mutex::new(None),
            }),
            runtime,
            cancel: CancellationToken::new(),
            worker: None,
        }
    }

    pub fn state(&self) -> CycleState {
        *self.shared.state.borrow()
    }

    pub fn is_idle(&self) -> bool {
        self.state() == CycleState::Idle
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<CycleState> {
        self.shared.state.subscribe()
    }

    /// Resolve once no cycle is in flight.
    pub async fn wait_idle(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|s| *s == CycleState::Idle).await;
    }

    /// Attach the event listener, replacing any previous one.
    pub fn listen(&self) -> mpsc::UnboundedReceiver<CycleEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.shared.listener) = Some(tx);
        rx
    }

    /// Drop the listener; events of the running cycle are discarded from now on.
    pub fn detach_listener(&self) {
        lock(&self.shared.listener).take();
    }

    pub fn has_pending_image(&self) -> bool {
        lock(&self.shared.pending_image).is_some()
    }

    /// Start a cycle for `text`. Rejected without side effects unless idle.
    pub fn send_message(&mut self, text: &str) -> Result<(), OrchestratorError> {
        let message = text.trim();
        if message.is_empty() {
            return Err(OrchestratorError::EmptyMessage);
        }
        let claimed = self.shared.state.send_if_modified(|s| {
            if *s == CycleState::Idle {
                *s = CycleState::Sending;
                true
            } else {
                false
            }
        });
        if !claimed {
            log::debug!("orchestrator: rejecting message, cycle in progress");
            return Err(OrchestratorError::Busy);
        }
        let image = lock(&self.shared.pending_image).take();
        let shared = self.shared.clone();
        let cancel = self.cancel.child_token();
        let message = message.to_string();
        self.worker = Some(
            self.runtime
                .spawn(async move { shared.run(cancel, message, image).await }),
        );
        Ok(())
    }

    /// The history store, for callers that need to run history I/O off their own thread.
    pub fn history(&self) -> &HistoryStore {
        &self.shared.services.history
    }

    pub fn load_history(&self) -> Result<Vec<ConversationEntry>, HistoryError> {
        self.shared.services.history.load()
    }

    /// Clear saved history; only allowed while idle.
    pub fn clear_history(&self) -> Result<(), OrchestratorError> {
        if !self.is_idle() {
            return Err(OrchestratorError::Busy);
        }
        self.shared.services.history.clear()?;
        Ok(())
    }

    /// Cancel the running cycle (if any) and wait at most `grace` for its task to stop.
    pub async fn shutdown(mut self, grace: Duration) {
        self.cancel.cancel();
        if let Some(worker) = self.worker.take() {
            if tokio::time::timeout(grace, worker).await.is_err() {
                log::warn!("orchestrator: cycle did not stop within {:?}", grace);
            }
        }
    }
}

impl Shared {
    fn set_state(&self, state: CycleState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: CycleEvent) {
        let mut listener = lock(&self.listener);
        if let Some(tx) = listener.as_ref() {
            if tx.send(event).is_err() {
                *listener = None;
            }
        }
    }

    async fn run(&self, cancel: CancellationToken, message: String, image: Option<AttachedImage>) {
        let cycle_id = uuid::Uuid::new_v4().simple().to_string();
        let cycle_id = &cycle_id[..8];
        log::info!("orchestrator[{}]: cycle started", cycle_id);
        let entry = tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("orchestrator[{}]: cycle cancelled", cycle_id);
                None
            }
            entry = self.cycle(cycle_id, &message, image) => entry,
        };
        self.emit(CycleEvent::Finished(entry));
        self.set_state(CycleState::Idle);
        log::info!("orchestrator[{}]: cycle finished", cycle_id);
    }

    async fn cycle(
        &self,
        cycle_id: &str,
        message: &str,
        image: Option<AttachedImage>,
    ) -> Option<ConversationEntry> {
        let services = &self.services;
        let mut content = Vec::new();
        if let Some(ref img) = image {
            content.push(img.to_content_block());
        }
        content.push(ContentBlock::text(message));
        let request = MessagesRequest::user(services.model.clone(), services.max_tokens, content);

        let body = match services.api.stream_messages(&request).await {
            Ok(body) => body,
            Err(e) => {
                self.fail(cycle_id, e.to_string(), image);
                return None;
            }
        };
        self.set_state(CycleState::StreamingResponse);

        let mut decoder = EventDecoder::new(body);
        let completed = match accumulate(&mut decoder, &mut |text: &str| {
            self.emit(CycleEvent::ResponseUpdated(text.to_string()))
        })
        .await
        {
            Ok(completed) => completed,
            Err(e) => {
                self.fail(cycle_id, e.to_string(), image);
                return None;
            }
        };
        self.emit(CycleEvent::ResponseComplete(completed.clone()));

        self.set_state(CycleState::Dispatching);
        let mut response = completed.text.clone();
        if let Some(call) = completed.invocation() {
            log::info!("orchestrator[{}]: dispatching {}", cycle_id, call.name);
            match services.dispatcher.dispatch(&call.name, &call.args).await {
                DispatchOutcome::Command(result) => {
                    let output = result.combined();
                    response = compose_response(&response, &call.name, &output);
                    self.emit(CycleEvent::ToolOutput {
                        tool: call.name,
                        output,
                    });
                }
                DispatchOutcome::Screenshot(img) => {
                    *lock(&self.pending_image) = Some(img);
                    self.emit(CycleEvent::ScreenshotQueued);
                }
                DispatchOutcome::Nothing => {}
            }
        }

        // The history lock may be held by another process; wait for it off the async workers so
        // cancellation still takes effect.
        let history = services.history.clone();
        let message = message.to_string();
        let saved = tokio::task::spawn_blocking(move || history.append(&message, &response))
            .await
            .map_err(|e| e.to_string())
            .and_then(|res| res.map_err(|e| e.to_string()));
        match saved {
            Ok(entry) => Some(entry),
            Err(e) => {
                log::error!("orchestrator[{}]: saving history failed: {}", cycle_id, e);
                self.emit(CycleEvent::HistoryFailed(e));
                None
            }
        }
    }

    /// Abort the cycle: report the error and keep the unsent image for the next message.
    fn fail(&self, cycle_id: &str, error: String, image: Option<AttachedImage>) {
        log::warn!("orchestrator[{}]: request failed: {}", cycle_id, error);
        if let Some(img) = image {
            lock(&self.pending_image).get_or_insert(img);
        }
        self.emit(CycleEvent::Failed(error));
    }
}

/// Saved/displayed response: assistant text followed by the tool's output.
pub fn compose_response(text: &str, tool: &str, output: &str) -> String {
    let mut out = String::from(text);
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    if !out.is_empty() {
        out.push('\n');
    }
    out.push_str(&format!("[{}]\n{}", tool, output));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{CommandExecutor, CommandOutput, ExecError};
    use crate::llm::{ApiError, ByteStream};
    use crate::tools::{CaptureError, ScreenCapture};
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use image::DynamicImage;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Serves canned SSE bodies in order; optionally waits on a gate before answering.
    struct FakeApi {
        bodies: Mutex<VecDeque<Result<String, String>>>,
        requests: Mutex<Vec<MessagesRequest>>,
        gate: Option<Arc<Notify>>,
    }

    impl FakeApi {
        fn new(bodies: Vec<Result<String, String>>) -> Self {
            Self {
                bodies: Mutex::new(bodies.into()),
                requests: Mutex::new(Vec::new()),
                gate: None,
            }
        }

        fn request_count(&self) -> usize {
            lock(&self.requests).len()
        }
    }

    #[async_trait]
    impl MessagesApi for Arc<FakeApi> {
        async fn stream_messages(&self, request: &MessagesRequest) -> Result<ByteStream, ApiError> {
            lock(&self.requests).push(request.clone());
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let next = lock(&self.bodies)
                .pop_front()
                .unwrap_or_else(|| Ok(String::new()));
            match next {
                Ok(body) => Ok(futures_util::stream::iter(vec![Ok(body.into_bytes())]).boxed()),
                Err(e) => Err(ApiError::Api(e)),
            }
        }
    }

    struct CountingExecutor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CommandExecutor for Arc<CountingExecutor> {
        async fn execute(&self, command: &str, _: Duration) -> Result<CommandOutput, ExecError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(CommandOutput {
                stdout: format!("ran {}\n", command),
                stderr: String::new(),
            })
        }
    }

    struct FakeCapture;

    #[async_trait]
    impl ScreenCapture for FakeCapture {
        async fn capture(&self) -> Result<DynamicImage, CaptureError> {
            Ok(DynamicImage::new_rgb8(320, 240))
        }
    }

    fn text_frame(text: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"type":"content_block_delta","delta":{"type":"text_delta","text":text}})
        )
    }

    fn tool_frames(name: &str, fragments: &[&str]) -> String {
        let mut s = format!(
            "data: {}\n\n",
            serde_json::json!({"type":"content_block_start","content_block":{"type":"tool_use","name":name,"input":{}}})
        );
        for f in fragments {
            s.push_str(&format!(
                "data: {}\n\n",
                serde_json::json!({"type":"content_block_delta","delta":{"type":"input_json_delta","partial_json":f}})
            ));
        }
        s
    }

    const STOP: &str = "data: {\"type\":\"message_stop\"}\n\n";

    struct Harness {
        orchestrator: Orchestrator,
        api: Arc<FakeApi>,
        executor: Arc<CountingExecutor>,
        dir: std::path::PathBuf,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    fn harness(api: FakeApi) -> Harness {
        let dir = std::env::temp_dir().join(format!("perch-orch-test-{}", uuid::Uuid::new_v4()));
        let history = HistoryStore::open(dir.join("history.json")).expect("open history");
        let api = Arc::new(api);
        let executor = Arc::new(CountingExecutor {
            calls: AtomicUsize::new(0),
        });
        let services = Services {
            api: Arc::new(api.clone()),
            dispatcher: ToolDispatcher::new(Arc::new(executor.clone()), Arc::new(FakeCapture)),
            history,
            model: "test-model".to_string(),
            max_tokens: 64,
        };
        Harness {
            orchestrator: Orchestrator::new(services, Handle::current()),
            api,
            executor,
            dir,
        }
    }

    async fn drain(rx: &mut mpsc::UnboundedReceiver<CycleEvent>) -> Vec<CycleEvent> {
        let mut events = Vec::new();
        loop {
            let ev = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("cycle did not finish")
                .expect("listener closed");
            let done = matches!(ev, CycleEvent::Finished(_));
            events.push(ev);
            if done {
                return events;
            }
        }
    }

    #[tokio::test]
    async fn text_cycle_streams_updates_and_saves_history() {
        let body = format!("{}{}{}", text_frame("Hel"), text_frame("lo"), STOP);
        let mut h = harness(FakeApi::new(vec![Ok(body)]));
        let mut rx = h.orchestrator.listen();
        h.orchestrator.send_message("  hi  ").unwrap();
        let events = drain(&mut rx).await;
        h.orchestrator.wait_idle().await;

        let updates: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                CycleEvent::ResponseUpdated(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(updates, ["Hel", "Hello"]);
        assert!(matches!(events[2], CycleEvent::ResponseComplete(ref c) if c.text == "Hello"));
        match events.last() {
            Some(CycleEvent::Finished(Some(entry))) => {
                assert_eq!(entry.message, "hi");
                assert_eq!(entry.response, "Hello");
            }
            other => panic!("unexpected final event {:?}", other),
        }
        let history = h.orchestrator.load_history().unwrap();
        assert_eq!(history.len(), 1);

        let requests = lock(&h.api.requests);
        let req = &requests[0];
        assert!(req.stream);
        assert_eq!(req.model, "test-model");
        assert_eq!(req.messages[0].content, vec![ContentBlock::text("hi")]);
    }

    #[tokio::test]
    async fn bash_tool_output_is_reported_and_saved() {
        let body = format!(
            "{}{}{}",
            text_frame("Listing."),
            tool_frames("bash", &["{\"comm", "and\":\"ls\"}"]),
            STOP
        );
        let mut h = harness(FakeApi::new(vec![Ok(body)]));
        let mut rx = h.orchestrator.listen();
        h.orchestrator.send_message("list files").unwrap();
        let events = drain(&mut rx).await;

        assert!(events.iter().any(|e| matches!(
            e,
            CycleEvent::ToolOutput { tool, output } if tool == "bash" && output == "ran ls\n"
        )));
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 1);
        match events.last() {
            Some(CycleEvent::Finished(Some(entry))) => {
                assert_eq!(entry.response, "Listing.\n\n[bash]\nran ls\n");
            }
            other => panic!("unexpected final event {:?}", other),
        }
    }

    #[tokio::test]
    async fn truncated_tool_arguments_skip_dispatch_but_keep_text() {
        let body = format!("{}{}", text_frame("ok"), tool_frames("bash", &["{\"comm"]));
        let mut h = harness(FakeApi::new(vec![Ok(body)]));
        let mut rx = h.orchestrator.listen();
        h.orchestrator.send_message("go").unwrap();
        let events = drain(&mut rx).await;
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 0);
        assert!(!events
            .iter()
            .any(|e| matches!(e, CycleEvent::ToolOutput { .. })));
        let history = h.orchestrator.load_history().unwrap();
        assert_eq!(history[0].response, "ok");
    }

    #[tokio::test]
    async fn second_send_while_busy_is_rejected() {
        let gate = Arc::new(Notify::new());
        let mut api = FakeApi::new(vec![Ok(format!("{}{}", text_frame("done"), STOP))]);
        api.gate = Some(gate.clone());
        let mut h = harness(api);
        let mut rx = h.orchestrator.listen();

        h.orchestrator.send_message("first").unwrap();
        assert_ne!(h.orchestrator.state(), CycleState::Idle);
        assert!(matches!(
            h.orchestrator.send_message("second"),
            Err(OrchestratorError::Busy)
        ));
        assert!(matches!(
            h.orchestrator.clear_history(),
            Err(OrchestratorError::Busy)
        ));

        gate.notify_one();
        drain(&mut rx).await;
        h.orchestrator.wait_idle().await;
        assert_eq!(h.api.request_count(), 1);
        let history = h.orchestrator.load_history().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message, "first");
    }

    #[tokio::test]
    async fn transport_failure_saves_nothing_and_returns_to_idle() {
        let mut h = harness(FakeApi::new(vec![Err("529 overloaded".to_string())]));
        let mut rx = h.orchestrator.listen();
        h.orchestrator.send_message("hello").unwrap();
        let events = drain(&mut rx).await;
        h.orchestrator.wait_idle().await;
        assert!(matches!(events[0], CycleEvent::Failed(ref m) if m.contains("529 overloaded")));
        assert!(matches!(events.last(), Some(CycleEvent::Finished(None))));
        assert!(h.orchestrator.load_history().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stream_error_frame_aborts_without_history() {
        let body = format!(
            "{}data: {{\"type\":\"error\",\"error\":{{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}}}\n\n",
            text_frame("partial")
        );
        let mut h = harness(FakeApi::new(vec![Ok(body)]));
        let mut rx = h.orchestrator.listen();
        h.orchestrator.send_message("hello").unwrap();
        let events = drain(&mut rx).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, CycleEvent::Failed(m) if m.contains("Overloaded"))));
        assert!(h.orchestrator.load_history().unwrap().is_empty());
    }

    #[tokio::test]
    async fn screenshot_is_attached_to_the_next_request() {
        let first = format!(
            "{}{}",
            tool_frames("computer", &["{\"action\":", "\"screenshot\"}"]),
            STOP
        );
        let second = format!("{}{}", text_frame("I see a desktop"), STOP);
        let mut h = harness(FakeApi::new(vec![Ok(first), Ok(second)]));
        let mut rx = h.orchestrator.listen();

        h.orchestrator.send_message("look").unwrap();
        let events = drain(&mut rx).await;
        h.orchestrator.wait_idle().await;
        assert!(events
            .iter()
            .any(|e| matches!(e, CycleEvent::ScreenshotQueued)));
        assert!(h.orchestrator.has_pending_image());
        // The screenshot request itself carried no image.
        assert_eq!(lock(&h.api.requests)[0].messages[0].content.len(), 1);

        h.orchestrator.send_message("what do you see?").unwrap();
        drain(&mut rx).await;
        h.orchestrator.wait_idle().await;
        let requests = lock(&h.api.requests);
        let content = &requests[1].messages[0].content;
        assert_eq!(content.len(), 2);
        assert!(matches!(content[0], ContentBlock::Image { .. }));
        assert_eq!(content[1], ContentBlock::text("what do you see?"));
        drop(requests);
        assert!(!h.orchestrator.has_pending_image());
    }

    #[tokio::test]
    async fn failed_request_keeps_pending_image() {
        let first = format!("{}{}", tool_frames("computer", &["{\"action\":\"screenshot\"}"]), STOP);
        let mut h = harness(FakeApi::new(vec![Ok(first), Err("500".to_string())]));
        let mut rx = h.orchestrator.listen();
        h.orchestrator.send_message("look").unwrap();
        drain(&mut rx).await;
        h.orchestrator.wait_idle().await;
        h.orchestrator.send_message("again").unwrap();
        drain(&mut rx).await;
        h.orchestrator.wait_idle().await;
        assert!(h.orchestrator.has_pending_image());
    }

    #[tokio::test]
    async fn cycle_without_listener_still_saves() {
        let body = format!("{}{}", text_frame("unseen"), STOP);
        let mut h = harness(FakeApi::new(vec![Ok(body)]));
        let rx = h.orchestrator.listen();
        h.orchestrator.detach_listener();
        drop(rx);
        h.orchestrator.send_message("anyone?").unwrap();
        tokio::time::timeout(Duration::from_secs(5), h.orchestrator.wait_idle())
            .await
            .unwrap();
        let history = h.orchestrator.load_history().unwrap();
        assert_eq!(history[0].response, "unseen");
    }

    #[tokio::test]
    async fn clear_history_when_idle() {
        let body = format!("{}{}", text_frame("x"), STOP);
        let mut h = harness(FakeApi::new(vec![Ok(body)]));
        let mut rx = h.orchestrator.listen();
        h.orchestrator.send_message("y").unwrap();
        drain(&mut rx).await;
        h.orchestrator.wait_idle().await;
        h.orchestrator.clear_history().unwrap();
        assert!(h.orchestrator.load_history().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let mut h = harness(FakeApi::new(vec![]));
        assert!(matches!(
            h.orchestrator.send_message("   "),
            Err(OrchestratorError::EmptyMessage)
        ));
        assert_eq!(h.api.request_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_cancels_a_stuck_cycle() {
        let dir = std::env::temp_dir().join(format!("perch-orch-test-{}", uuid::Uuid::new_v4()));
        let mut api = FakeApi::new(vec![]);
        api.gate = Some(Arc::new(Notify::new()));
        let services = Services {
            api: Arc::new(Arc::new(api)),
            dispatcher: ToolDispatcher::new(Arc::new(ShellExecutor::new()), Arc::new(FakeCapture)),
            history: HistoryStore::open(dir.join("history.json")).unwrap(),
            model: "test-model".to_string(),
            max_tokens: 1,
        };
        let mut orchestrator = Orchestrator::new(services, Handle::current());
        let state = orchestrator.subscribe();
        orchestrator.send_message("never answered").unwrap();

        tokio::time::timeout(
            Duration::from_secs(5),
            orchestrator.shutdown(Duration::from_secs(2)),
        )
        .await
        .unwrap();
        assert_eq!(*state.borrow(), CycleState::Idle);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn shutdown_is_bounded_while_history_is_locked_elsewhere() {
        use fs2::FileExt;

        let body = format!("{}{}", text_frame("saved later"), STOP);
        let mut h = harness(FakeApi::new(vec![Ok(body)]));
        let lock_path = h.dir.join("history.json.lock");
        let holder = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .unwrap();
        holder.lock_exclusive().unwrap();

        let mut state = h.orchestrator.subscribe();
        h.orchestrator.send_message("hello").unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == CycleState::Dispatching),
        )
        .await
        .expect("cycle never reached dispatching")
        .unwrap();

        let orchestrator = std::mem::replace(
            &mut h.orchestrator,
            Orchestrator::new(
                Services {
                    api: Arc::new(Arc::new(FakeApi::new(vec![]))),
                    dispatcher: ToolDispatcher::new(Arc::new(ShellExecutor::new()), Arc::new(FakeCapture)),
                    history: HistoryStore::open(h.dir.join("unused.json")).unwrap(),
                    model: String::new(),
                    max_tokens: 1,
                },
                Handle::current(),
            ),
        );
        tokio::time::timeout(
            Duration::from_secs(2),
            orchestrator.shutdown(Duration::from_millis(200)),
        )
        .await
        .expect("shutdown blocked on the history lock");
        assert_eq!(*state.borrow(), CycleState::Idle);

        // Let the pending write finish before the runtime shuts down.
        holder.unlock().unwrap();
    }

    #[test]
    fn compose_response_appends_tool_output() {
        assert_eq!(compose_response("", "bash", "hi\n"), "[bash]\nhi\n");
        assert_eq!(
            compose_response("Done.\n", "bash", "x"),
            "Done.\n\n[bash]\nx"
        );
    }
}

//! Perch Desktop: egui app state and UI.

use eframe::egui;
use lib::history::{ConversationEntry, HistoryStore};
use lib::orchestrator::{CycleEvent, Orchestrator, Services};
use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

const CHAT_INPUT_HEIGHT: f32 = 72.0;
const LOG_BUFFER_MAX_LINES: usize = 2000;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
/// Repaint interval while a cycle is in flight, so streamed text shows up without input events.
const BUSY_REPAINT: Duration = Duration::from_millis(50);

/// Ring buffer of log lines for the Logs screen. Written by DesktopLogger.
static LOG_LINES: OnceLock<Mutex<VecDeque<String>>> = OnceLock::new();

fn log_buffer() -> &'static Mutex<VecDeque<String>> {
    LOG_LINES.get_or_init(|| Mutex::new(VecDeque::new()))
}

fn push_log_line(line: String) {
    if let Ok(mut buf) = log_buffer().lock() {
        buf.push_back(line);
        while buf.len() > LOG_BUFFER_MAX_LINES {
            buf.pop_front();
        }
    }
}

/// Logger that appends to LOG_LINES for display in the Logs screen.
struct DesktopLogger;

impl log::Log for DesktopLogger {
    fn enabled(&self, _: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let line = format!(
            "{} [{}] {}",
            chrono::Local::now().format("%H:%M:%S%.3f"),
            record.level(),
            record.args()
        );
        push_log_line(line);
    }

    fn flush(&self) {}
}

static LOGGER: DesktopLogger = DesktopLogger;

pub fn install_logger() {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(log::LevelFilter::Debug);
}

/// Build the runtime that runs conversation cycles and an orchestrator on it.
pub fn start_orchestrator() -> anyhow::Result<(tokio::runtime::Runtime, Orchestrator)> {
    let (config, path) = lib::config::load_config(None)?;
    let services = Services::from_config(&config, &path)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;
    log::info!(
        "desktop started (model {}, history {})",
        services.model,
        services.history.path().display()
    );
    let orchestrator = Orchestrator::new(services, runtime.handle().clone());
    Ok((runtime, orchestrator))
}

#[derive(Clone, Copy, PartialEq, Eq, Default)]
enum Screen {
    #[default]
    Chat,
    History,
    Logs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    User,
    Assistant,
    Tool,
    Notice,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ChatMessage {
    role: Role,
    content: String,
}

impl ChatMessage {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// In-memory transcript for the current window, built from cycle events.
#[derive(Debug, Default)]
struct Transcript {
    messages: Vec<ChatMessage>,
    /// Index of the assistant message receiving streamed text.
    streaming: Option<usize>,
    error: Option<String>,
}

impl Transcript {
    fn push_user(&mut self, text: &str) {
        self.messages.push(ChatMessage::new(Role::User, text.trim()));
        self.streaming = None;
        self.error = None;
    }

    /// Apply one event. Returns the saved entry when the cycle finished with one.
    fn apply(&mut self, event: CycleEvent) -> Option<ConversationEntry> {
        match event {
            CycleEvent::ResponseUpdated(text) => match self.streaming {
                Some(i) => self.messages[i].content = text,
                None => {
                    self.messages.push(ChatMessage::new(Role::Assistant, text));
                    self.streaming = Some(self.messages.len() - 1);
                }
            },
            CycleEvent::ResponseComplete(_) => self.streaming = None,
            CycleEvent::ToolOutput { tool, output } => {
                self.messages.push(ChatMessage::new(
                    Role::Tool,
                    format!("[{}]\n{}", tool, output.trim_end()),
                ));
            }
            CycleEvent::ScreenshotQueued => {
                self.messages.push(ChatMessage::new(
                    Role::Notice,
                    "Screenshot captured. It will be sent with your next message.",
                ));
            }
            CycleEvent::Failed(e) => self.error = Some(e),
            CycleEvent::HistoryFailed(e) => {
                self.error = Some(format!("Response not saved to history: {}", e))
            }
            CycleEvent::Finished(entry) => {
                self.streaming = None;
                return entry;
            }
        }
        None
    }
}

/// Result of a history operation run on the blocking pool.
#[derive(Debug)]
enum HistoryReply {
    Loaded(Result<Vec<ConversationEntry>, String>),
    Cleared(Result<(), String>),
}

/// Run `op` on the runtime's blocking pool so a history lock held by another process never
/// stalls the UI thread. The reply is polled from the returned receiver.
fn spawn_history_op<F>(
    runtime: &tokio::runtime::Handle,
    store: HistoryStore,
    op: F,
) -> mpsc::Receiver<HistoryReply>
where
    F: FnOnce(&HistoryStore) -> HistoryReply + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    runtime.spawn_blocking(move || {
        let _ = tx.send(op(&store));
    });
    rx
}

pub struct PerchApp {
    /// Taken on drop for a bounded runtime shutdown.
    runtime: Option<tokio::runtime::Runtime>,
    /// Taken on drop for shutdown.
    orchestrator: Option<Orchestrator>,
    events: UnboundedReceiver<CycleEvent>,
    transcript: Transcript,
    /// Current input text for the chat box.
    chat_input: String,
    /// Cached history entries for the History screen (oldest first).
    history: Vec<ConversationEntry>,
    history_error: Option<String>,
    /// When Some, a load or clear is in flight; the history lock may be held by another process.
    history_receiver: Option<mpsc::Receiver<HistoryReply>>,
    /// Current screen (Chat, History, Logs).
    current_screen: Screen,
}

impl PerchApp {
    /// Space between the main screen title and the content below.
    const SCREEN_TITLE_BOTTOM_SPACING: f32 = 12.0;
    const SCREEN_FOOTER_SPACING: f32 = 16.0;

    pub fn new(runtime: tokio::runtime::Runtime, orchestrator: Orchestrator) -> Self {
        let events = orchestrator.listen();
        let mut app = Self {
            runtime: Some(runtime),
            orchestrator: Some(orchestrator),
            events,
            transcript: Transcript::default(),
            chat_input: String::new(),
            history: Vec::new(),
            history_error: None,
            history_receiver: None,
            current_screen: Screen::default(),
        };
        app.reload_history();
        app
    }

    fn is_busy(&self) -> bool {
        self.orchestrator
            .as_ref()
            .map(|o| !o.is_idle())
            .unwrap_or(false)
    }

    fn history_busy(&self) -> bool {
        self.history_receiver.is_some()
    }

    fn start_history_op<F>(&mut self, op: F)
    where
        F: FnOnce(&HistoryStore) -> HistoryReply + Send + 'static,
    {
        let (Some(runtime), Some(orchestrator)) = (self.runtime.as_ref(), self.orchestrator.as_ref())
        else {
            return;
        };
        let store = orchestrator.history().clone();
        self.history_receiver = Some(spawn_history_op(runtime.handle(), store, op));
    }

    fn reload_history(&mut self) {
        self.start_history_op(|store| {
            HistoryReply::Loaded(store.load().map_err(|e| e.to_string()))
        });
    }

    fn poll_history(&mut self) {
        let Some(rx) = self.history_receiver.as_ref() else {
            return;
        };
        let reply = match rx.try_recv() {
            Ok(reply) => reply,
            Err(mpsc::TryRecvError::Empty) => return,
            Err(mpsc::TryRecvError::Disconnected) => {
                self.history_receiver = None;
                return;
            }
        };
        self.history_receiver = None;
        match reply {
            HistoryReply::Loaded(Ok(entries)) => {
                self.history = entries;
                self.history_error = None;
            }
            HistoryReply::Cleared(Ok(())) => {
                self.history.clear();
                self.history_error = None;
            }
            HistoryReply::Loaded(Err(e)) | HistoryReply::Cleared(Err(e)) => {
                log::warn!("history operation failed: {}", e);
                self.history_error = Some(e);
            }
        }
    }

    fn poll_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            if let Some(entry) = self.transcript.apply(event) {
                self.history.push(entry);
            }
        }
    }

    fn send(&mut self) {
        let Some(orchestrator) = self.orchestrator.as_mut() else {
            return;
        };
        let text = self.chat_input.trim().to_string();
        if text.is_empty() {
            return;
        }
        match orchestrator.send_message(&text) {
            Ok(()) => {
                self.transcript.push_user(&text);
                self.chat_input.clear();
            }
            Err(e) => self.transcript.error = Some(e.to_string()),
        }
    }

    /// Only while idle, so a cycle finishing mid-clear cannot be lost.
    fn clear_history(&mut self) {
        if self.is_busy() {
            self.history_error = Some(lib::orchestrator::OrchestratorError::Busy.to_string());
            return;
        }
        self.start_history_op(|store| {
            HistoryReply::Cleared(store.clear().map_err(|e| e.to_string()))
        });
    }

    fn render_chat_message(ui: &mut egui::Ui, m: &ChatMessage) {
        let visuals = &ui.style().visuals;
        let fill = match m.role {
            Role::User => visuals.extreme_bg_color,
            _ => visuals.panel_fill,
        };
        let frame = egui::Frame::none()
            .fill(fill)
            .stroke(egui::Stroke::new(
                1.0,
                visuals.widgets.noninteractive.bg_stroke.color,
            ))
            .rounding(egui::Rounding::same(8.0))
            .inner_margin(egui::Margin::same(8.0));

        frame.show(ui, |ui| {
            ui.set_width(ui.available_width());
            match m.role {
                Role::User => {
                    ui.label(egui::RichText::new(&m.content).strong());
                }
                Role::Assistant => {
                    ui.label(&m.content);
                }
                Role::Tool => {
                    ui.label(
                        egui::RichText::new(&m.content).family(egui::FontFamily::Monospace),
                    );
                }
                Role::Notice => {
                    ui.label(egui::RichText::new(&m.content).italics().weak());
                }
            }
        });
    }

    /// Messages fill the space above a fixed input area; Send is disabled while a cycle is in flight.
    fn ui_chat(&mut self, ui: &mut egui::Ui) {
        let busy = self.is_busy();
        let pending_image = self
            .orchestrator
            .as_ref()
            .map(|o| o.has_pending_image())
            .unwrap_or(false);

        let bottom_height = CHAT_INPUT_HEIGHT + 64.0 + Self::SCREEN_FOOTER_SPACING;
        let messages_height = (ui.available_height() - bottom_height).max(80.0);
        egui::ScrollArea::vertical()
            .max_height(messages_height)
            .stick_to_bottom(true)
            .auto_shrink([false, false])
            .show(ui, |ui| {
                if self.transcript.messages.is_empty() {
                    ui.label(egui::RichText::new("Ask anything. Perch can run shell commands and take screenshots.").weak());
                }
                for m in &self.transcript.messages {
                    Self::render_chat_message(ui, m);
                    ui.add_space(8.0);
                }
            });

        ui.add_space(8.0);
        if let Some(err) = &self.transcript.error {
            ui.colored_label(ui.visuals().error_fg_color, err);
        }
        if pending_image {
            ui.label(egui::RichText::new("📷 Screenshot will be attached to your next message.").small());
        }

        let input = ui.add_enabled(
            !busy,
            egui::TextEdit::multiline(&mut self.chat_input)
                .desired_rows(3)
                .desired_width(f32::INFINITY)
                .hint_text("Message (Ctrl/Cmd+Enter to send)"),
        );
        let submit = input.has_focus()
            && ui.input(|i| i.key_pressed(egui::Key::Enter) && i.modifiers.command);

        ui.add_space(4.0);
        ui.horizontal(|ui| {
            let send_clicked = ui
                .add_enabled(!busy && !self.chat_input.trim().is_empty(), egui::Button::new("Send"))
                .clicked();
            if busy {
                ui.spinner();
                let status = match self.orchestrator.as_ref().map(|o| o.state()) {
                    Some(lib::orchestrator::CycleState::Sending) => "Sending…",
                    Some(lib::orchestrator::CycleState::StreamingResponse) => "Receiving…",
                    Some(lib::orchestrator::CycleState::Dispatching) => "Running tool…",
                    _ => "",
                };
                ui.label(status);
            }
            if (send_clicked || submit) && !busy {
                self.send();
            }
        });
        ui.add_space(Self::SCREEN_FOOTER_SPACING);
    }

    fn ui_history_screen(&mut self, ui: &mut egui::Ui) {
        let busy = self.is_busy();
        let history_busy = self.history_busy();
        ui.horizontal(|ui| {
            if ui
                .add_enabled(!history_busy, egui::Button::new("Refresh"))
                .clicked()
            {
                self.reload_history();
            }
            if ui
                .add_enabled(
                    !busy && !history_busy && !self.history.is_empty(),
                    egui::Button::new("Clear History"),
                )
                .clicked()
            {
                self.clear_history();
            }
            if history_busy {
                ui.spinner();
            }
        });
        ui.add_space(8.0);
        if let Some(err) = &self.history_error {
            ui.colored_label(ui.visuals().error_fg_color, err);
        }
        egui::ScrollArea::vertical()
            .auto_shrink([false, false])
            .show(ui, |ui| {
                if self.history.is_empty() {
                    ui.label("No saved conversations yet.");
                }
                // Newest first.
                for entry in self.history.iter().rev() {
                    ui.label(egui::RichText::new(&entry.timestamp).small().weak());
                    Self::render_chat_message(ui, &ChatMessage::new(Role::User, entry.message.clone()));
                    ui.add_space(4.0);
                    Self::render_chat_message(
                        ui,
                        &ChatMessage::new(Role::Assistant, entry.response.clone()),
                    );
                    ui.add_space(12.0);
                }
            });
    }

    fn ui_logs_screen(&self, ui: &mut egui::Ui) {
        let lines: Vec<String> = log_buffer()
            .lock()
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default();

        let available = ui.available_height();
        let scroll_height = (available - Self::SCREEN_FOOTER_SPACING).max(0.0);
        egui::ScrollArea::vertical()
            .max_height(scroll_height)
            .stick_to_bottom(true)
            .show(ui, |ui| {
                for line in &lines {
                    ui.label(
                        egui::RichText::new(line.as_str()).family(egui::FontFamily::Monospace),
                    );
                }
                if lines.is_empty() {
                    ui.label("No log output yet.");
                }
            });
        ui.add_space(Self::SCREEN_FOOTER_SPACING);
    }
}

impl eframe::App for PerchApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.poll_events();
        self.poll_history();
        if self.is_busy() || self.history_busy() {
            ctx.request_repaint_after(BUSY_REPAINT);
        }

        egui::TopBottomPanel::top("header").show(ctx, |ui| {
            ui.add_space(8.0);
            ui.horizontal(|ui| {
                ui.heading("Perch");
                ui.add_space(16.0);
                let current_screen = &mut self.current_screen;
                for (screen, label) in [
                    (Screen::Chat, "Chat"),
                    (Screen::History, "History"),
                    (Screen::Logs, "Logs"),
                ] {
                    if ui.selectable_label(*current_screen == screen, label).clicked() {
                        *current_screen = screen;
                    }
                }
            });
            ui.add_space(8.0);
        });

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.add_space(Self::SCREEN_TITLE_BOTTOM_SPACING);
            match self.current_screen {
                Screen::Chat => self.ui_chat(ui),
                Screen::History => self.ui_history_screen(ui),
                Screen::Logs => self.ui_logs_screen(ui),
            }
        });
    }
}

impl Drop for PerchApp {
    fn drop(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        if let Some(orchestrator) = self.orchestrator.take() {
            orchestrator.detach_listener();
            runtime.block_on(orchestrator.shutdown(SHUTDOWN_GRACE));
        }
        // Blocking history work may still be waiting on another process's lock.
        runtime.shutdown_timeout(SHUTDOWN_GRACE);
        log::info!("desktop stopped");
    }
}

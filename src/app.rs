use anyhow::{Context, Result};
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use futures::StreamExt;
use ratatui::{backend::Backend, Terminal};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use apimap_chat::chat::ChatGateway;
use apimap_chat::client::RunStatus;
use apimap_chat::config::{Args, LoadingState, LoadingStep, StepStatus};
use apimap_chat::graph::{GraphClient, GraphEvent, RunInput};
use apimap_chat::reconciler::ResourceReconciler;

use crate::ui;

/// Current input mode
#[derive(Debug, Clone, PartialEq)]
pub enum InputMode {
    Normal,
    Editing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryRole {
    User,
    Assistant,
    System,
}

/// One transcript entry.
#[derive(Debug, Clone)]
pub struct ChatEntry {
    pub role: EntryRole,
    pub text: String,
}

/// Everything the session knows about its remote resources, carried
/// explicitly instead of looked up ambiently.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub vector_store_id: Option<String>,
    pub assistant_id: Option<String>,
    pub thread_id: Option<String>,
    pub assistant_ready: bool,
    pub uploaded_files_count: u32,
    /// A graph run raised an interrupt; the next message resumes it
    /// instead of starting a new run.
    pub pending_interrupt: bool,
}

/// Graph-execution backend, selected with --graph-url. The active thread id
/// still lives in the session context.
pub struct GraphBackend {
    pub client: GraphClient,
    pub assistant: String,
}

/// Application state
pub struct App {
    pub input_mode: InputMode,
    pub input: String,
    pub input_cursor_position: usize,
    pub messages: Vec<ChatEntry>,
    pub should_quit: bool,
    pub waiting_for_response: bool,
    pub thinking_dots: String,
    pub last_thinking_update: Instant,
    pub debug: bool,
    pub show_help: bool,
    pub scroll_state: ratatui::widgets::ScrollbarState,
    pub vertical_scroll: usize,
    pub is_loading: bool,
    pub loading_steps: Vec<LoadingStep>,
    pub session: SessionContext,
}

impl App {
    pub fn new(debug: bool) -> Self {
        let loading_steps = LoadingState::ALL
            .iter()
            .map(|state| LoadingStep {
                message: state.message().to_string(),
                status: StepStatus::Pending,
            })
            .collect();

        App {
            input_mode: InputMode::Normal,
            input: String::new(),
            input_cursor_position: 0,
            messages: Vec::new(),
            should_quit: false,
            waiting_for_response: false,
            thinking_dots: ".".to_string(),
            last_thinking_update: Instant::now(),
            debug,
            show_help: false,
            scroll_state: ratatui::widgets::ScrollbarState::default(),
            vertical_scroll: 0,
            is_loading: true,
            loading_steps,
            session: SessionContext::default(),
        }
    }

    // ------------------------------------------------------------------
    // Loading screen state
    // ------------------------------------------------------------------

    fn step_index(state: LoadingState) -> usize {
        LoadingState::ALL
            .iter()
            .position(|s| *s == state)
            .unwrap_or(0)
    }

    pub fn begin_step(&mut self, state: LoadingState) {
        self.loading_steps[Self::step_index(state)].status = StepStatus::InProgress;
    }

    pub fn complete_step(&mut self, state: LoadingState) {
        self.loading_steps[Self::step_index(state)].status = StepStatus::Success;
    }

    pub fn fail_step(&mut self, state: LoadingState, error: String) {
        self.loading_steps[Self::step_index(state)].status = StepStatus::Failed(error);
    }

    pub fn finish_loading(&mut self) {
        self.is_loading = false;
    }

    // ------------------------------------------------------------------
    // Main loop
    // ------------------------------------------------------------------

    pub async fn run<B: Backend>(
        &mut self,
        terminal: &mut Terminal<B>,
        gateway: &ChatGateway,
        reconciler: &ResourceReconciler,
        graph: Option<&GraphBackend>,
        args: &Args,
    ) -> Result<()> {
        loop {
            self.update_thinking_animation();

            terminal.draw(|f| ui::render(f, self, args))?;

            if self.should_quit {
                break;
            }

            if event::poll(Duration::from_millis(100))? {
                match event::read()? {
                    Event::Key(key_event) => {
                        if let Some(message) = self.handle_key_event(key_event)? {
                            if let Some(command) = message.strip_prefix('/') {
                                let command = command.to_string();
                                self.handle_command(&command, terminal, gateway, reconciler, graph, args)
                                    .await?;
                            } else {
                                self.deliver(message, terminal, gateway, graph, args)
                                    .await?;
                            }
                        }
                    }
                    Event::Resize(_, _) => {}
                    _ => {}
                }
            }
        }

        Ok(())
    }

    /// Send a user message through the active backend and surface the
    /// outcome in the transcript. Remote failures become system entries;
    /// nothing is retried automatically.
    async fn deliver<B: Backend>(
        &mut self,
        text: String,
        terminal: &mut Terminal<B>,
        gateway: &ChatGateway,
        graph: Option<&GraphBackend>,
        args: &Args,
    ) -> Result<()> {
        if !self.session.assistant_ready {
            self.push_entry(
                EntryRole::System,
                "The assistant is still initializing; try again in a moment.".to_string(),
            );
            return Ok(());
        }

        self.push_entry(EntryRole::User, text.clone());
        self.set_waiting(true);
        terminal.draw(|f| ui::render(f, self, args))?;

        let outcome = match graph {
            Some(backend) => self.stream_from_graph(backend, &text, terminal, args).await,
            None => self.run_assistant(gateway, &text).await,
        };

        if let Err(e) = outcome {
            error!("Message delivery failed: {:?}", e);
            self.push_entry(
                EntryRole::System,
                format!("An error occurred while communicating with the assistant: {:#}", e),
            );
        }

        self.set_waiting(false);
        Ok(())
    }

    /// Assistant-service path: append the message, run to a terminal state,
    /// report anything but `completed` verbatim.
    async fn run_assistant(&mut self, gateway: &ChatGateway, text: &str) -> Result<()> {
        let thread_id = self
            .session
            .thread_id
            .clone()
            .context("No active conversation thread")?;
        let assistant_id = self
            .session
            .assistant_id
            .clone()
            .context("Assistant is not ready")?;

        gateway.send_message(&thread_id, text).await?;
        let (response, status) = gateway.run(&thread_id, &assistant_id).await?;

        match status {
            RunStatus::Completed => {
                let reply = response.unwrap_or_else(|| "(empty response)".to_string());
                self.push_entry(EntryRole::Assistant, reply);
            }
            other => {
                self.push_entry(
                    EntryRole::System,
                    format!("The assistant run ended with status: {}", other),
                );
            }
        }
        Ok(())
    }

    /// Graph path: stream events into the transcript, redrawing as chunks
    /// arrive. Interrupts are surfaced as system entries.
    async fn stream_from_graph<B: Backend>(
        &mut self,
        backend: &GraphBackend,
        text: &str,
        terminal: &mut Terminal<B>,
        args: &Args,
    ) -> Result<()> {
        let thread_id = self
            .session
            .thread_id
            .clone()
            .context("No active conversation thread")?;

        let input = if self.session.pending_interrupt {
            self.session.pending_interrupt = false;
            RunInput::Resume(Value::String(text.to_string()))
        } else {
            RunInput::user_message(text)
        };

        let mut stream = backend
            .client
            .run_stream(&backend.assistant, &thread_id, input)
            .await?;

        let entry_index = self.messages.len();
        self.push_entry(EntryRole::Assistant, String::new());
        let mut accumulated = String::new();

        while let Some(event) = stream.next().await {
            match event? {
                GraphEvent::AiChunk(chunk) => {
                    accumulated.push_str(&chunk);
                    self.messages[entry_index].text = accumulated.clone();
                    terminal.draw(|f| ui::render(f, self, args))?;
                }
                GraphEvent::Interrupt(value) => {
                    self.session.pending_interrupt = true;
                    self.push_entry(
                        EntryRole::System,
                        format!(
                            "The assistant needs input before continuing: {}. Your next message resumes it.",
                            value
                        ),
                    );
                    terminal.draw(|f| ui::render(f, self, args))?;
                }
                GraphEvent::Done => break,
                GraphEvent::Other(value) => {
                    if self.debug {
                        self.push_entry(EntryRole::System, format!("stream event: {}", value));
                    }
                }
            }
        }

        if accumulated.is_empty() {
            self.messages.remove(entry_index);
        }
        Ok(())
    }

    /// Open a fresh thread on the active backend.
    async fn fresh_thread(
        &self,
        gateway: &ChatGateway,
        graph: Option<&GraphBackend>,
        args: &Args,
    ) -> Result<String> {
        match graph {
            Some(backend) => Ok(backend
                .client
                .create_thread(&args.user, Some(&backend.assistant))
                .await?
                .thread_id),
            None => gateway.create_thread().await,
        }
    }

    /// Handle slash commands typed into the input box.
    async fn handle_command<B: Backend>(
        &mut self,
        command: &str,
        terminal: &mut Terminal<B>,
        gateway: &ChatGateway,
        reconciler: &ResourceReconciler,
        graph: Option<&GraphBackend>,
        args: &Args,
    ) -> Result<()> {
        let mut parts = command.split_whitespace();
        let name = parts.next().unwrap_or_default();

        match name {
            "help" => {
                self.toggle_help();
            }
            "clear" => {
                // Reset conversation: new thread, same resources. The empty
                // transcript shows the greeting again.
                self.set_waiting(true);
                terminal.draw(|f| ui::render(f, self, args))?;
                let previous = self.session.thread_id.clone();
                match self.fresh_thread(gateway, graph, args).await {
                    Ok(thread_id) => {
                        info!("Conversation reset, new thread {}", thread_id);
                        // Graph threads are server-side state scoped to this
                        // user; drop the superseded one.
                        if let (Some(backend), Some(old)) = (graph, previous) {
                            if let Err(e) = backend.client.delete_thread(&old).await {
                                warn!("Could not delete previous graph thread {}: {}", old, e);
                            }
                        }
                        self.session.thread_id = Some(thread_id);
                        self.session.pending_interrupt = false;
                        self.messages.clear();
                        self.vertical_scroll = 0;
                    }
                    Err(e) => {
                        self.push_entry(
                            EntryRole::System,
                            format!("Error resetting conversation: {:#}", e),
                        );
                    }
                }
                self.set_waiting(false);
            }
            "status" => {
                let text = self.status_text(reconciler);
                self.push_entry(EntryRole::System, text);
            }
            "attach" => {
                let paths: Vec<&str> = parts.collect();
                if paths.is_empty() {
                    self.push_entry(
                        EntryRole::System,
                        "Usage: /attach <path> [<path>...]".to_string(),
                    );
                } else {
                    self.attach_files(&paths, terminal, gateway, args).await?;
                }
            }
            "reset" => {
                self.full_reset(terminal, gateway, reconciler, graph, args)
                    .await?;
            }
            _ => {
                self.push_entry(
                    EntryRole::System,
                    format!(
                        "Unknown command: /{}. Type /help for available commands.",
                        name
                    ),
                );
            }
        }
        Ok(())
    }

    fn status_text(&self, reconciler: &ResourceReconciler) -> String {
        let status = reconciler.status();
        let mut lines = Vec::new();

        if !status.has_config() {
            lines.push("No persistent resources configured yet.".to_string());
        }
        if let Some(id) = &status.config.vector_store_id {
            lines.push(format!("Vector store: active ({})", truncate_id(id)));
        }
        if let Some(id) = &status.config.assistant_id {
            lines.push(format!("Assistant: active ({})", truncate_id(id)));
        }
        if let Some(count) = status.config.knowledge_base_files {
            lines.push(format!("Knowledge base files: {}", count));
        }
        if let Some(created) = status.config.created_at {
            lines.push(format!("Created at unix time {:.0}", created));
        }
        if let Some(thread_id) = &self.session.thread_id {
            lines.push(format!("Thread: {}", truncate_id(thread_id)));
        }
        lines.push(format!(
            "Business data files uploaded this session: {}",
            self.session.uploaded_files_count
        ));
        lines.join("\n")
    }

    /// Read local files and add them to the vector store for analysis.
    async fn attach_files<B: Backend>(
        &mut self,
        paths: &[&str],
        terminal: &mut Terminal<B>,
        gateway: &ChatGateway,
        args: &Args,
    ) -> Result<()> {
        let Some(vector_store_id) = self.session.vector_store_id.clone() else {
            self.push_entry(
                EntryRole::System,
                "Vector store is not ready; cannot attach files.".to_string(),
            );
            return Ok(());
        };

        let mut files = Vec::new();
        for path in paths {
            match std::fs::read(path) {
                Ok(bytes) => {
                    let name = std::path::Path::new(path)
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| path.to_string());
                    files.push((name, bytes));
                }
                Err(e) => {
                    self.push_entry(
                        EntryRole::System,
                        format!("Could not read {}: {}", path, e),
                    );
                }
            }
        }
        if files.is_empty() {
            return Ok(());
        }

        self.set_waiting(true);
        terminal.draw(|f| ui::render(f, self, args))?;

        match gateway.add_files(&vector_store_id, &files).await {
            Ok(()) => {
                self.session.uploaded_files_count += files.len() as u32;
                self.push_entry(
                    EntryRole::System,
                    format!(
                        "Added {} files to the analysis ({} total this session)",
                        files.len(),
                        self.session.uploaded_files_count
                    ),
                );
            }
            Err(e) => {
                self.push_entry(EntryRole::System, format!("Error uploading files: {:#}", e));
            }
        }

        self.set_waiting(false);
        Ok(())
    }

    /// Full reset: delete remote resources and the config file, then
    /// provision everything from scratch.
    async fn full_reset<B: Backend>(
        &mut self,
        terminal: &mut Terminal<B>,
        gateway: &ChatGateway,
        reconciler: &ResourceReconciler,
        graph: Option<&GraphBackend>,
        args: &Args,
    ) -> Result<()> {
        self.set_waiting(true);
        terminal.draw(|f| ui::render(f, self, args))?;

        match reconciler.reset().await {
            Ok(results) => {
                for (resource, outcome) in results {
                    self.push_entry(EntryRole::System, format!("{}: {}", resource, outcome));
                }
            }
            Err(e) => {
                self.push_entry(EntryRole::System, format!("Error during cleanup: {:#}", e));
                self.set_waiting(false);
                return Ok(());
            }
        }

        self.session = SessionContext::default();

        match reconciler.ensure_ready().await {
            Ok(ready) => {
                self.session.vector_store_id = Some(ready.vector_store_id);
                self.session.assistant_id = Some(ready.assistant_id);
                match self.fresh_thread(gateway, graph, args).await {
                    Ok(thread_id) => {
                        self.session.thread_id = Some(thread_id);
                        self.session.assistant_ready = true;
                        self.messages.clear();
                        self.push_entry(
                            EntryRole::System,
                            "System reset complete; fresh resources created.".to_string(),
                        );
                    }
                    Err(e) => {
                        self.push_entry(
                            EntryRole::System,
                            format!("Reset created resources but no thread: {:#}", e),
                        );
                    }
                }
            }
            Err(e) => {
                self.push_entry(
                    EntryRole::System,
                    format!("Failed to re-initialize after reset: {:#}", e),
                );
            }
        }

        self.set_waiting(false);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Input handling
    // ------------------------------------------------------------------

    /// Handle a key event and return a message if one should be sent
    fn handle_key_event(
        &mut self,
        key_event: crossterm::event::KeyEvent,
    ) -> Result<Option<String>> {
        if key_event.kind != KeyEventKind::Press {
            return Ok(None);
        }

        if self.show_help {
            match key_event.code {
                KeyCode::Esc | KeyCode::Char('q') | KeyCode::F(1) => {
                    self.toggle_help();
                }
                _ => {}
            }
            return Ok(None);
        }

        match self.input_mode {
            InputMode::Normal => match key_event.code {
                KeyCode::Char('q') => {
                    self.should_quit = true;
                }
                KeyCode::Char('i') => {
                    self.input_mode = InputMode::Editing;
                }
                KeyCode::Up => {
                    self.scroll_up();
                }
                KeyCode::Down => {
                    self.scroll_down();
                }
                KeyCode::F(1) => {
                    self.toggle_help();
                }
                _ => {}
            },
            InputMode::Editing => match key_event.code {
                KeyCode::Enter => {
                    if let Some(message) = self.submit_message() {
                        self.input_mode = InputMode::Normal;
                        return Ok(Some(message));
                    }
                }
                KeyCode::Char(to_insert) => {
                    self.enter_char(to_insert);
                }
                KeyCode::Backspace => {
                    self.delete_char();
                }
                KeyCode::Left => {
                    self.move_cursor_left();
                }
                KeyCode::Right => {
                    self.move_cursor_right();
                }
                KeyCode::Esc => {
                    self.input_mode = InputMode::Normal;
                }
                _ => {}
            },
        }
        Ok(None)
    }

    pub fn move_cursor_left(&mut self) {
        let cursor_moved_left = self.input_cursor_position.saturating_sub(1);
        self.input_cursor_position = self.clamp_cursor(cursor_moved_left);
    }

    pub fn move_cursor_right(&mut self) {
        let cursor_moved_right = self.input_cursor_position.saturating_add(1);
        self.input_cursor_position = self.clamp_cursor(cursor_moved_right);
    }

    pub fn enter_char(&mut self, new_char: char) {
        let index = self.byte_index();
        self.input.insert(index, new_char);
        self.move_cursor_right();
    }

    fn byte_index(&self) -> usize {
        self.input
            .char_indices()
            .map(|(i, _)| i)
            .nth(self.input_cursor_position)
            .unwrap_or(self.input.len())
    }

    pub fn delete_char(&mut self) {
        if self.input_cursor_position != 0 {
            let current_index = self.input_cursor_position;
            let before_char_to_delete = self.input.chars().take(current_index - 1);
            let after_char_to_delete = self.input.chars().skip(current_index);
            self.input = before_char_to_delete.chain(after_char_to_delete).collect();
            self.move_cursor_left();
        }
    }

    fn clamp_cursor(&self, new_cursor_pos: usize) -> usize {
        new_cursor_pos.clamp(0, self.input.chars().count())
    }

    pub fn reset_input(&mut self) {
        self.input.clear();
        self.input_cursor_position = 0;
    }

    pub fn submit_message(&mut self) -> Option<String> {
        if self.input.trim().is_empty() {
            return None;
        }
        let message = self.input.clone();
        self.reset_input();
        Some(message)
    }

    // ------------------------------------------------------------------
    // Transcript and scrolling
    // ------------------------------------------------------------------

    pub fn push_entry(&mut self, role: EntryRole, text: String) {
        self.messages.push(ChatEntry { role, text });
        // Keep the view pinned to the newest message.
        self.vertical_scroll = 0;
    }

    pub fn scroll_up(&mut self) {
        let total_lines = self.calculate_total_display_lines();
        let available_height = 20;

        if total_lines > available_height {
            let max_scroll = total_lines.saturating_sub(available_height);
            if self.vertical_scroll < max_scroll {
                self.vertical_scroll += 1;
            }
        }
    }

    pub fn scroll_down(&mut self) {
        self.vertical_scroll = self.vertical_scroll.saturating_sub(1);
    }

    /// Rough line count for scroll clamping; the UI does the exact math.
    fn calculate_total_display_lines(&self) -> usize {
        let available_width = 70;
        let mut total_lines = 0;
        for entry in &self.messages {
            total_lines += 1;
            total_lines += textwrap::fill(&entry.text, available_width).lines().count();
            total_lines += 1;
        }
        total_lines
    }

    pub fn update_thinking_animation(&mut self) {
        if self.waiting_for_response
            && self.last_thinking_update.elapsed() > Duration::from_millis(500)
        {
            self.thinking_dots = match self.thinking_dots.as_str() {
                "." => "..".to_string(),
                ".." => "...".to_string(),
                _ => ".".to_string(),
            };
            self.last_thinking_update = Instant::now();
        }
    }

    pub fn set_waiting(&mut self, waiting: bool) {
        self.waiting_for_response = waiting;
        if waiting {
            self.thinking_dots = ".".to_string();
            self.last_thinking_update = Instant::now();
        }
    }

    pub fn toggle_help(&mut self) {
        self.show_help = !self.show_help;
    }
}

/// Shorten a remote id for display, the way the status panel shows them.
pub fn truncate_id(id: &str) -> String {
    if id.len() <= 20 {
        id.to_string()
    } else {
        format!("{}...", &id[..20])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_trims_empty_input() {
        let mut app = App::new(false);
        app.input = "   ".to_string();
        assert_eq!(app.submit_message(), None);

        app.input = "map my data".to_string();
        app.input_cursor_position = app.input.chars().count();
        assert_eq!(app.submit_message(), Some("map my data".to_string()));
        assert!(app.input.is_empty());
        assert_eq!(app.input_cursor_position, 0);
    }

    #[test]
    fn test_cursor_editing_is_char_aware() {
        let mut app = App::new(false);
        for c in "héllo".chars() {
            app.enter_char(c);
        }
        assert_eq!(app.input, "héllo");
        app.delete_char();
        assert_eq!(app.input, "héll");
    }

    #[test]
    fn test_truncate_id() {
        assert_eq!(truncate_id("vs_short"), "vs_short");
        let long = "vs_0123456789abcdef0123456789";
        assert_eq!(truncate_id(long), "vs_0123456789abcdef0...");
    }
}

use ratatui::{
    layout::{Alignment, Constraint, Direction, Layout, Margin},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, List, ListItem, Paragraph, Scrollbar, ScrollbarOrientation, Wrap},
    Frame,
};

use apimap_chat::config::{greeting_for, Args, StepStatus};
use apimap_chat::reconciler::ASSISTANT_NAME;

use crate::app::{truncate_id, App, ChatEntry, EntryRole, InputMode};

/// Render the main user interface
pub fn render(f: &mut Frame, app: &mut App, args: &Args) {
    if app.is_loading {
        render_loading_screen(f, app, args);
    } else {
        render_chat_screen(f, app, args);
    }
}

/// Boot-style loading screen listing each startup step with its status.
pub fn render_loading_screen(f: &mut Frame, app: &App, _args: &Args) {
    let area = f.area();

    let background = Block::default().style(Style::default().bg(Color::Black));
    f.render_widget(background, area);

    let main_area = ratatui::layout::Rect {
        x: 1,
        y: 1,
        width: area.width.saturating_sub(2),
        height: area.height.saturating_sub(2),
    };

    let mut lines = vec![
        Line::from(vec![
            Span::styled(
                "apimap-chat ",
                Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
            ),
            Span::styled(env!("CARGO_PKG_VERSION"), Style::default().fg(Color::White)),
            Span::styled(" starting up...", Style::default().fg(Color::Gray)),
        ]),
        Line::from(""),
    ];

    for step in &app.loading_steps {
        lines.push(Line::from(vec![
            Span::styled(
                format!("{:<50}", step.message),
                Style::default().fg(Color::White),
            ),
            Span::styled(
                step.status.symbol(),
                Style::default()
                    .fg(step.status.color())
                    .add_modifier(Modifier::BOLD),
            ),
        ]));

        if let StepStatus::Failed(error) = &step.status {
            lines.push(Line::from(vec![
                Span::styled(
                    "  Error: ",
                    Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
                ),
                Span::styled(error.clone(), Style::default().fg(Color::Red)),
            ]));
            lines.push(Line::from(""));
        }
    }

    let footer_y = area.height.saturating_sub(3);
    let footer_area = ratatui::layout::Rect {
        x: 1,
        y: footer_y,
        width: area.width.saturating_sub(2),
        height: 1,
    };

    let failed = app
        .loading_steps
        .iter()
        .any(|s| matches!(s.status, StepStatus::Failed(_)));
    let footer_line = if failed {
        Line::from(Span::styled(
            "Startup failed. Press Ctrl+C to exit.",
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        ))
    } else {
        Line::from(Span::styled(
            "First launch uploads the knowledge base; this happens only once.",
            Style::default().fg(Color::DarkGray),
        ))
    };

    let paragraph = Paragraph::new(lines).style(Style::default().bg(Color::Black));
    f.render_widget(paragraph, main_area);

    let footer_paragraph = Paragraph::new(vec![footer_line]).style(Style::default().bg(Color::Black));
    f.render_widget(footer_paragraph, footer_area);
}

/// Render the main chat screen
pub fn render_chat_screen(f: &mut Frame, app: &mut App, args: &Args) {
    let size = f.area();

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1), // Title bar
            Constraint::Min(1),    // Chat area
            Constraint::Length(3), // Input area
            Constraint::Length(1), // Status bar
        ])
        .split(size);

    render_title_bar(f, chunks[0], args);
    render_chat_area(f, chunks[1], app);
    render_input_area(f, chunks[2], app);
    render_status_bar(f, chunks[3], app, args);

    if app.show_help {
        render_help_popup(f, size);
    }
}

fn render_title_bar(f: &mut Frame, area: ratatui::layout::Rect, args: &Args) {
    let title_paragraph = Paragraph::new(args.title.clone())
        .style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
        .alignment(Alignment::Center);
    f.render_widget(title_paragraph, area);
}

fn role_header(role: EntryRole) -> (&'static str, Style) {
    match role {
        EntryRole::User => (
            "You:",
            Style::default().fg(Color::Green).add_modifier(Modifier::BOLD),
        ),
        EntryRole::Assistant => (
            "Assistant:",
            Style::default().fg(Color::Blue).add_modifier(Modifier::BOLD),
        ),
        EntryRole::System => (
            "System:",
            Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
        ),
    }
}

/// Flatten one entry into a header line plus wrapped, indented body lines.
fn entry_items(entry: &ChatEntry, available_width: usize) -> Vec<ListItem<'static>> {
    let (prefix, style) = role_header(entry.role);

    let mut items = vec![ListItem::new(Line::from(Span::styled(prefix, style)))];
    let wrapped = textwrap::fill(&entry.text, available_width);
    for line in wrapped.lines() {
        items.push(ListItem::new(Line::from(format!("  {}", line))));
    }
    items.push(ListItem::new(Line::from("")));
    items
}

/// Render the transcript. While it is empty, the greeting for the deployed
/// assistant takes its place.
fn render_chat_area(f: &mut Frame, area: ratatui::layout::Rect, app: &mut App) {
    let messages_block = Block::default().borders(Borders::ALL).title("Chat");

    let available_width = (area.width.saturating_sub(6)) as usize;

    let mut all_items: Vec<ListItem> = Vec::new();
    if app.messages.is_empty() {
        if let Some(greeting) = greeting_for(ASSISTANT_NAME) {
            let entry = ChatEntry {
                role: EntryRole::Assistant,
                text: greeting.to_string(),
            };
            all_items.extend(entry_items(&entry, available_width));
        }
    } else {
        for entry in &app.messages {
            all_items.extend(entry_items(entry, available_width));
        }
    }

    let total_lines = all_items.len();
    let available_height = area.height.saturating_sub(2) as usize;

    // vertical_scroll = 0 shows the newest lines; scrolling up moves the
    // window toward older ones.
    let start_index = if total_lines <= available_height {
        0
    } else {
        let max_scroll = total_lines.saturating_sub(available_height);
        max_scroll.saturating_sub(app.vertical_scroll.min(max_scroll))
    };
    let end_index = (start_index + available_height).min(total_lines);

    let visible_items: Vec<ListItem> = all_items
        .into_iter()
        .skip(start_index)
        .take(end_index - start_index)
        .collect();

    let messages_list = List::new(visible_items).block(messages_block);
    f.render_widget(messages_list, area);

    if total_lines > available_height {
        app.scroll_state = app
            .scroll_state
            .content_length(total_lines)
            .position(start_index);

        let scrollbar = Scrollbar::default()
            .orientation(ScrollbarOrientation::VerticalRight)
            .begin_symbol(Some("↑"))
            .end_symbol(Some("↓"));
        f.render_stateful_widget(
            scrollbar,
            area.inner(Margin {
                vertical: 1,
                horizontal: 0,
            }),
            &mut app.scroll_state,
        );
    }
}

fn render_input_area(f: &mut Frame, area: ratatui::layout::Rect, app: &App) {
    let input_block = Block::default()
        .borders(Borders::ALL)
        .title(match app.input_mode {
            InputMode::Normal => "Input (Press 'i' to edit, 'q' to quit, F1 for help)",
            InputMode::Editing => "Input (Press Esc to stop editing, Enter to send)",
        })
        .title_style(match app.input_mode {
            InputMode::Normal => Style::default(),
            InputMode::Editing => Style::default().fg(Color::Yellow),
        });

    let mut input_text = app.input.clone();
    if app.waiting_for_response {
        input_text = format!("Thinking{} (please wait)", app.thinking_dots);
    }

    let input_paragraph = Paragraph::new(input_text)
        .style(match app.input_mode {
            InputMode::Normal => Style::default(),
            InputMode::Editing => Style::default().fg(Color::Yellow),
        })
        .block(input_block)
        .wrap(Wrap { trim: true });
    f.render_widget(input_paragraph, area);

    if app.input_mode == InputMode::Editing && !app.waiting_for_response {
        f.set_cursor_position((area.x + app.input_cursor_position as u16 + 1, area.y + 1));
    }
}

fn render_status_bar(f: &mut Frame, area: ratatui::layout::Rect, app: &App, args: &Args) {
    let store = app
        .session
        .vector_store_id
        .as_deref()
        .map(truncate_id)
        .unwrap_or_else(|| "-".to_string());
    let assistant = app
        .session
        .assistant_id
        .as_deref()
        .map(truncate_id)
        .unwrap_or_else(|| "-".to_string());
    let backend = if args.graph_url.is_some() {
        "graph"
    } else {
        "assistant"
    };

    let status_line = Line::from(vec![Span::styled(
        format!(
            " Store: {} | Assistant: {} | Backend: {} | Uploaded: {} | Messages: {} ",
            store,
            assistant,
            backend,
            app.session.uploaded_files_count,
            app.messages.len()
        ),
        Style::default().fg(Color::White),
    )]);

    let status_paragraph =
        Paragraph::new(vec![status_line]).style(Style::default().bg(Color::DarkGray));
    f.render_widget(status_paragraph, area);
}

fn render_help_popup(f: &mut Frame, area: ratatui::layout::Rect) {
    let popup_area = centered_rect(80, 80, area);
    f.render_widget(Clear, popup_area);

    let help_text = vec![
        Line::from(Span::styled(
            "apimap-chat Help",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        )),
        Line::from(""),
        Line::from(Span::styled(
            "Keys:",
            Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
        )),
        Line::from("  i          - Enter input mode"),
        Line::from("  Esc        - Exit input mode / close popups"),
        Line::from("  Enter      - Send message (in input mode)"),
        Line::from("  Up / Down  - Scroll through the chat"),
        Line::from("  q          - Quit application"),
        Line::from("  F1         - Toggle this help"),
        Line::from(""),
        Line::from(Span::styled(
            "Commands:",
            Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
        )),
        Line::from("  /attach <path>...  - Upload business data files for analysis"),
        Line::from("  /clear             - Start a fresh conversation (same knowledge base)"),
        Line::from("  /status            - Show vector store / assistant status"),
        Line::from("  /reset             - Delete remote resources and re-provision"),
        Line::from("  /help              - Toggle this help"),
        Line::from(""),
        Line::from("Press F1 or Esc to close this help"),
    ];

    let help_paragraph = Paragraph::new(help_text)
        .block(
            Block::default()
                .title("Help")
                .borders(Borders::ALL)
                .title_style(Style::default().fg(Color::Yellow))
                .style(Style::default().bg(Color::Black).fg(Color::White)),
        )
        .style(Style::default().bg(Color::Black).fg(Color::White))
        .wrap(Wrap { trim: true });
    f.render_widget(help_paragraph, popup_area);
}

/// Helper function to create a centered rect
fn centered_rect(percent_x: u16, percent_y: u16, r: ratatui::layout::Rect) -> ratatui::layout::Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

use crate::app::{Action, App, Mode, Phase, SettingsCapture, SettingsSection, SettingsState, STATUS_BAR_HEIGHT};
use crate::theme::{self, icons};
use chrono::{DateTime, Local};
use ratatui::{
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, Paragraph, Wrap},
    Frame,
};
use startall_core::{
    ansi::{self, Token},
    filter,
    pane_tree::Area,
    LogLine, Pane, PaneId,
};

const HELP_KEYS: &[(&str, Action)] = &[
    ("Tab / S-Tab", Action::NextPane),
    ("|  -", Action::SplitVertical),
    ("x", Action::ClosePane),
    ("[  ]", Action::GrowPane),
    ("n", Action::RenamePane),
    ("/", Action::TextFilter),
    ("c", Action::CycleColor),
    ("Esc", Action::ClearFilters),
    ("Space", Action::TogglePause),
    ("P", Action::TogglePauseAll),
    ("Up Down PgUp PgDn", Action::ScrollUp),
    ("Home End", Action::ScrollBottom),
    ("j / k", Action::CursorNext),
    ("s", Action::ToggleProcess),
    ("S", Action::StopProcess),
    ("r", Action::RestartProcess),
    ("i", Action::SendInput),
    ("h", Action::ToggleHidden),
    ("f", Action::ToggleScope),
    ("m", Action::MoveProcessHere),
    ("e", Action::OpenRunPicker),
    ("l", Action::ToggleLineNumbers),
    ("t", Action::ToggleTimestamps),
    (":", Action::OpenPalette),
    ("o", Action::OpenSettings),
    ("?", Action::Help),
    ("q / C-c", Action::Quit),
];

pub fn render(frame: &mut Frame, app: &App) {
    let area = frame.size();
    match app.phase {
        Phase::Selecting => render_selection(frame, app, area),
        Phase::Running => render_running(frame, app, area),
    }
    render_overlay(frame, app, area);
}

fn render_selection(frame: &mut Frame, app: &App, area: Rect) {
    let block = Block::default()
        .borders(Borders::ALL)
        .title(Span::styled(" startall ", theme::HEADER_STYLE));
    let inner = block.inner(area);
    frame.render_widget(block, area);

    let mut lines = vec![
        Line::from(vec![
            Span::raw("Starting in "),
            Span::styled(format!("{}s", app.countdown), theme::WARNING_STYLE),
            Span::styled(
                "   space toggle  a all  enter start now  o settings  q quit",
                theme::MUTED_STYLE,
            ),
        ]),
        Line::from(""),
    ];
    let visible = app.visible_commands();
    if visible.is_empty() {
        lines.push(Line::from(Span::styled(
            "No commands match the include/ignore patterns.",
            theme::WARNING_STYLE,
        )));
    }
    for (index, command) in visible.iter().enumerate() {
        let mark = if app.selection.contains(&command.name) {
            icons::CHECKED
        } else {
            icons::UNCHECKED
        };
        if index == app.cursor {
            lines.push(Line::from(Span::styled(
                format!("{mark} {}  {}", command.display_name, command.invocation()),
                theme::SELECTED_STYLE,
            )));
        } else {
            lines.push(Line::from(vec![
                Span::raw(format!("{mark} ")),
                Span::styled(command.display_name.clone(), theme::source_style(&command.name)),
                Span::styled(format!("  {}", command.invocation()), theme::MUTED_STYLE),
            ]));
        }
    }
    frame.render_widget(Paragraph::new(lines), inner);
}

fn render_running(frame: &mut Frame, app: &App, area: Rect) {
    let body = Rect {
        height: area.height.saturating_sub(STATUS_BAR_HEIGHT),
        ..area
    };
    let status = Rect {
        y: body.y + body.height,
        height: area.height - body.height,
        ..area
    };
    let layout = app.tree.layout(Area {
        x: body.x,
        y: body.y,
        width: body.width,
        height: body.height,
    });
    for (id, pane_area) in layout {
        let rect = Rect::new(pane_area.x, pane_area.y, pane_area.width, pane_area.height);
        render_pane(frame, app, id, rect);
    }
    render_status_bar(frame, app, status);
}

fn render_pane(frame: &mut Frame, app: &App, id: PaneId, rect: Rect) {
    let Some(pane) = app.tree.find(id) else {
        return;
    };
    let focused = id == app.focused;
    let block = Block::default()
        .borders(Borders::ALL)
        .title(pane_title(pane))
        .border_style(theme::border_style(focused, pane.paused));
    let inner = block.inner(rect);
    frame.render_widget(block, rect);

    let lines = app.pane_lines(id);
    let window = filter::visible_window(
        lines.len(),
        inner.height as usize,
        pane.scroll_offset,
        pane.paused,
    );
    let rows: Vec<Line> = lines[window]
        .iter()
        .map(|line| render_log_line(app, line, inner.width as usize))
        .collect();
    frame.render_widget(Paragraph::new(rows), inner);
}

fn pane_title(pane: &Pane) -> Line<'static> {
    let mut spans = vec![Span::styled(format!(" {} ", pane.name), theme::HEADER_STYLE)];
    if !pane.process_scope.is_empty() {
        let scope: Vec<&str> = pane.process_scope.iter().map(String::as_str).collect();
        spans.push(Span::styled(format!("[{}] ", scope.join(",")), theme::MUTED_STYLE));
    }
    if !pane.hidden.is_empty() {
        spans.push(Span::styled(format!("-{} ", pane.hidden.len()), theme::MUTED_STYLE));
    }
    if !pane.text_filter.is_empty() {
        spans.push(Span::styled(format!("/{}/ ", pane.text_filter), theme::KEY_STYLE));
    }
    if let Some(color) = pane.color_filter {
        spans.push(Span::styled(
            format!("{color} "),
            Style::new().fg(basic_color(color.codes()[0] - 30, false)),
        ));
    }
    if pane.paused {
        spans.push(Span::styled(format!("{} ", icons::FROZEN), theme::WARNING_STYLE));
    }
    Line::from(spans)
}

fn render_log_line(app: &App, line: &LogLine, width: usize) -> Line<'static> {
    let mut spans = Vec::new();
    if app.config.show_line_numbers {
        spans.push(Span::styled(format!("{:>5} ", line.seq), theme::MUTED_STYLE));
    }
    if app.config.show_timestamps {
        if let Some(at) = DateTime::from_timestamp_millis(line.timestamp_ms) {
            let local = at.with_timezone(&Local);
            spans.push(Span::styled(
                format!("{} ", local.format("%H:%M:%S")),
                theme::MUTED_STYLE,
            ));
        }
    }
    spans.push(Span::styled(
        format!("{} ", line.source),
        theme::source_style(&line.source),
    ));
    let used: usize = spans.iter().map(|span| span.content.chars().count()).sum();
    let text = ansi::truncate(&line.text, width.saturating_sub(used));
    spans.extend(ansi_spans(&text));
    Line::from(spans)
}

/// Converts SGR-colored text into styled spans; other escapes are dropped.
pub fn ansi_spans(text: &str) -> Vec<Span<'static>> {
    let mut spans = Vec::new();
    let mut style = Style::default();
    for token in ansi::tokenize(text) {
        match token {
            Token::Text(run) => spans.push(Span::styled(run.to_string(), style)),
            Token::Sgr { params, .. } => style = apply_sgr(style, &params),
            Token::Control(_) => {}
        }
    }
    spans
}

fn apply_sgr(mut style: Style, params: &[u16]) -> Style {
    if params.is_empty() {
        return Style::default();
    }
    let mut codes = params.iter().copied();
    while let Some(code) = codes.next() {
        style = match code {
            0 => Style::default(),
            1 => style.add_modifier(Modifier::BOLD),
            2 => style.add_modifier(Modifier::DIM),
            3 => style.add_modifier(Modifier::ITALIC),
            4 => style.add_modifier(Modifier::UNDERLINED),
            7 => style.add_modifier(Modifier::REVERSED),
            22 => style.remove_modifier(Modifier::BOLD | Modifier::DIM),
            23 => style.remove_modifier(Modifier::ITALIC),
            24 => style.remove_modifier(Modifier::UNDERLINED),
            27 => style.remove_modifier(Modifier::REVERSED),
            30..=37 => style.fg(basic_color(code - 30, false)),
            39 => style.fg(Color::Reset),
            40..=47 => style.bg(basic_color(code - 40, false)),
            49 => style.bg(Color::Reset),
            90..=97 => style.fg(basic_color(code - 90, true)),
            100..=107 => style.bg(basic_color(code - 100, true)),
            38 | 48 => match extended_color(&mut codes) {
                Some(color) if code == 38 => style.fg(color),
                Some(color) => style.bg(color),
                None => style,
            },
            _ => style,
        };
    }
    style
}

/// Reads the `5;n` or `2;r;g;b` tail of a 38/48 code.
fn extended_color(codes: &mut impl Iterator<Item = u16>) -> Option<Color> {
    match codes.next()? {
        5 => Some(Color::Indexed(codes.next()?.min(255) as u8)),
        2 => {
            let r = codes.next()?.min(255) as u8;
            let g = codes.next()?.min(255) as u8;
            let b = codes.next()?.min(255) as u8;
            Some(Color::Rgb(r, g, b))
        }
        _ => None,
    }
}

fn basic_color(index: u16, bright: bool) -> Color {
    match (index, bright) {
        (0, false) => Color::Black,
        (1, false) => Color::Red,
        (2, false) => Color::Green,
        (3, false) => Color::Yellow,
        (4, false) => Color::Blue,
        (5, false) => Color::Magenta,
        (6, false) => Color::Cyan,
        (7, false) => Color::Gray,
        (0, true) => Color::DarkGray,
        (1, true) => Color::LightRed,
        (2, true) => Color::LightGreen,
        (3, true) => Color::LightYellow,
        (4, true) => Color::LightBlue,
        (5, true) => Color::LightMagenta,
        (6, true) => Color::LightCyan,
        _ => Color::White,
    }
}

fn render_status_bar(frame: &mut Frame, app: &App, area: Rect) {
    let mut processes = Vec::new();
    for (index, command) in app.visible_commands().iter().enumerate() {
        let state = app.state(&command.name);
        let label = format!(
            " {} {} ",
            theme::status_icon(state.status),
            command.display_name
        );
        let style = if index == app.cursor {
            theme::SELECTED_STYLE
        } else {
            Style::new().fg(theme::status_color(state.status))
        };
        processes.push(Span::styled(label, style));
    }
    let hint = if app.status.is_empty() {
        Line::from(vec![
            Span::styled("? ", theme::KEY_STYLE),
            Span::styled("help  ", theme::MUTED_STYLE),
            Span::styled(": ", theme::KEY_STYLE),
            Span::styled("palette  ", theme::MUTED_STYLE),
            Span::styled("s ", theme::KEY_STYLE),
            Span::styled("start/stop  ", theme::MUTED_STYLE),
            Span::styled("q ", theme::KEY_STYLE),
            Span::styled("quit", theme::MUTED_STYLE),
            Span::styled(
                if app.streams_paused() {
                    format!("   {} output paused", icons::FROZEN)
                } else {
                    String::new()
                },
                theme::WARNING_STYLE,
            ),
        ])
    } else {
        Line::from(Span::styled(app.status.clone(), theme::WARNING_STYLE))
    };
    frame.render_widget(Paragraph::new(vec![Line::from(processes), hint]), area);
}

fn render_overlay(frame: &mut Frame, app: &App, area: Rect) {
    match &app.mode {
        Mode::Normal => {}
        Mode::TextFilterInput => render_input_modal(frame, area, "Filter pane text", &app.input),
        Mode::PaneNamingInput => render_input_modal(frame, area, "Rename pane", &app.input),
        Mode::StdinInput { target } => {
            render_input_modal(frame, area, &format!("Send to {target}"), &app.input)
        }
        Mode::Settings(state) => render_settings(frame, app, state, area),
        Mode::CommandPalette { selected } => render_palette(frame, app, *selected, area),
        Mode::RunPicker { selected } => render_run_picker(frame, app, *selected, area),
        Mode::OneOffOverlay => render_one_off(frame, app, area),
        Mode::Help => render_help(frame, area),
    }
}

fn render_input_modal(frame: &mut Frame, area: Rect, title: &str, input: &str) {
    let rect = centered_rect(60, 20, area);
    frame.render_widget(Clear, rect);
    let block = Block::default()
        .borders(Borders::ALL)
        .title(title.to_string())
        .border_style(Style::new().fg(Color::Yellow));
    let paragraph = Paragraph::new(vec![
        Line::from(format!("{input}_")),
        Line::from(Span::styled("enter apply  esc cancel", theme::MUTED_STYLE)),
    ])
    .block(block)
    .alignment(Alignment::Left);
    frame.render_widget(paragraph, rect);
}

fn render_settings(frame: &mut Frame, app: &App, state: &SettingsState, area: Rect) {
    let rect = centered_rect(70, 70, area);
    frame.render_widget(Clear, rect);
    let block = Block::default()
        .borders(Borders::ALL)
        .title(Span::styled(" Settings ", theme::HEADER_STYLE));
    let inner = block.inner(rect);
    frame.render_widget(block, rect);

    let tabs: Vec<Span> = SettingsSection::ALL
        .iter()
        .map(|section| {
            let style = if *section == state.section {
                theme::SELECTED_STYLE
            } else {
                theme::MUTED_STYLE
            };
            Span::styled(format!(" {} ", section.title()), style)
        })
        .collect();
    let mut lines = vec![Line::from(tabs), Line::from("")];

    let rows: Vec<String> = match state.section {
        SettingsSection::Include => match &app.config.include {
            Some(patterns) => patterns.clone(),
            None => Vec::new(),
        },
        SettingsSection::Ignore => app.config.ignore.clone(),
        SettingsSection::Shortcuts => app
            .commands
            .iter()
            .map(|command| match app.config.shortcut_for(&command.name) {
                Some(key) => format!("{key}  {}", command.name),
                None => format!("-  {}", command.name),
            })
            .collect(),
        SettingsSection::Display => vec![
            format!("Line numbers: {}", on_off(app.config.show_line_numbers)),
            format!("Timestamps:   {}", on_off(app.config.show_timestamps)),
        ],
    };
    if rows.is_empty() {
        let empty = match state.section {
            SettingsSection::Include => "(everything included)",
            _ => "(none)",
        };
        lines.push(Line::from(Span::styled(empty, theme::MUTED_STYLE)));
    }
    for (index, row) in rows.into_iter().enumerate() {
        if index == state.selected {
            lines.push(Line::from(Span::styled(row, theme::SELECTED_STYLE)));
        } else {
            lines.push(Line::from(row));
        }
    }
    lines.push(Line::from(""));
    let footer = match (&state.capture, state.section) {
        (Some(SettingsCapture::AddPattern), _) => format!("pattern: {}_   (* matches anything)", app.input),
        (Some(SettingsCapture::AssignShortcut { command }), _) => {
            format!("press a key for {command}   esc cancel")
        }
        (None, SettingsSection::Include | SettingsSection::Ignore) => {
            "a add  d delete  tab section  esc close".to_string()
        }
        (None, SettingsSection::Shortcuts) => "enter assign  d remove  tab section  esc close".to_string(),
        (None, SettingsSection::Display) => "enter toggle  tab section  esc close".to_string(),
    };
    lines.push(Line::from(Span::styled(footer, theme::KEY_STYLE)));
    frame.render_widget(Paragraph::new(lines).wrap(Wrap { trim: false }), inner);
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}

fn render_palette(frame: &mut Frame, app: &App, selected: usize, area: Rect) {
    let rect = centered_rect(50, 50, area);
    frame.render_widget(Clear, rect);
    let block = Block::default().borders(Borders::ALL).title("Command palette");
    let mut lines = vec![Line::from(format!("> {}_", app.input)), Line::from("")];
    for (index, action) in app.palette_matches().iter().enumerate() {
        let label = action.label().to_string();
        if index == selected {
            lines.push(Line::from(Span::styled(label, theme::SELECTED_STYLE)));
        } else {
            lines.push(Line::from(label));
        }
    }
    frame.render_widget(Paragraph::new(lines).block(block), rect);
}

fn render_run_picker(frame: &mut Frame, app: &App, selected: usize, area: Rect) {
    let rect = centered_rect(50, 50, area);
    frame.render_widget(Clear, rect);
    let block = Block::default().borders(Borders::ALL).title("Run once");
    let lines: Vec<Line> = app
        .commands
        .iter()
        .enumerate()
        .map(|(index, command)| {
            let row = format!("{}  {}", command.name, command.invocation());
            if index == selected {
                Line::from(Span::styled(row, theme::SELECTED_STYLE))
            } else {
                Line::from(row)
            }
        })
        .collect();
    frame.render_widget(Paragraph::new(lines).block(block), rect);
}

fn render_one_off(frame: &mut Frame, app: &App, area: Rect) {
    let Some(view) = &app.one_off else {
        return;
    };
    let rect = centered_rect(80, 70, area);
    frame.render_widget(Clear, rect);
    let state = match view.exit {
        None => "running".to_string(),
        Some(Some(code)) => format!("exited with code {code}"),
        Some(None) => "terminated".to_string(),
    };
    let block = Block::default()
        .borders(Borders::ALL)
        .title(format!(" {} ({state}) ", view.name))
        .border_style(Style::new().fg(Color::Yellow));
    let inner = block.inner(rect);
    frame.render_widget(block, rect);

    let height = inner.height.saturating_sub(1) as usize;
    let start = view.lines.len().saturating_sub(height);
    let mut lines: Vec<Line> = view
        .lines
        .iter()
        .skip(start)
        .map(|text| Line::from(ansi_spans(&ansi::truncate(text, inner.width as usize))))
        .collect();
    lines.push(Line::from(Span::styled(
        "esc close (stops the command)",
        theme::MUTED_STYLE,
    )));
    frame.render_widget(Paragraph::new(lines), inner);
}

fn render_help(frame: &mut Frame, area: Rect) {
    let rect = centered_rect(60, 80, area);
    frame.render_widget(Clear, rect);
    let mut lines = vec![
        Line::from(Span::styled(
            "Keyboard Shortcuts",
            Style::default().add_modifier(Modifier::BOLD),
        )),
        Line::from(""),
    ];
    for (keys, action) in HELP_KEYS {
        lines.push(Line::from(vec![
            Span::styled(format!("{keys:<18}"), theme::KEY_STYLE),
            Span::raw(action.label()),
        ]));
    }
    lines.push(Line::from(""));
    lines.push(Line::from("Other keys run their configured shortcut once."));
    let block = Block::default()
        .borders(Borders::ALL)
        .title("Help")
        .border_style(Style::default().fg(Color::Yellow));
    frame.render_widget(Paragraph::new(lines).block(block).wrap(Wrap { trim: false }), rect);
}

fn centered_rect(percent_x: u16, percent_y: u16, rect: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(rect);
    let horizontal = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1]);
    horizontal[1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::SupervisorOutput;
    use ratatui::{backend::TestBackend, Terminal};
    use startall_core::{Command, Config};
    use std::path::PathBuf;

    #[test]
    fn sgr_codes_map_to_styles() {
        let spans = ansi_spans("\x1b[1;31merror\x1b[0m ok \x1b[38;5;208mhot");
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[0].content, "error");
        assert_eq!(spans[0].style.fg, Some(Color::Red));
        assert!(spans[0].style.add_modifier.contains(Modifier::BOLD));
        assert_eq!(spans[1].style, Style::default());
        assert_eq!(spans[2].style.fg, Some(Color::Indexed(208)));
    }

    #[test]
    fn truecolor_and_bare_reset() {
        let spans = ansi_spans("\x1b[48;2;0;31;200mblue\x1b[m plain");
        assert_eq!(spans[0].style.bg, Some(Color::Rgb(0, 31, 200)));
        assert_eq!(spans[0].style.fg, None);
        assert_eq!(spans[1].content, " plain");
        assert_eq!(spans[1].style, Style::default());
    }

    #[test]
    fn non_color_escapes_are_dropped() {
        let spans = ansi_spans("\x1b]0;title\x07done\x1b[2K");
        let text: String = spans.iter().map(|span| span.content.to_string()).collect();
        assert_eq!(text, "done");
    }

    #[test]
    fn running_screen_renders_panes_and_status() {
        let dir = tempfile::tempdir().expect("temp dir");
        let commands = vec![Command {
            name: "web".to_string(),
            display_name: "web".to_string(),
            program: "npm".to_string(),
            args: vec!["run".to_string(), "web".to_string()],
            cwd: PathBuf::from("."),
        }];
        let mut app = App::new(commands, Config::default(), dir.path().join("startall.json"));
        app.launch();
        app.ingest(SupervisorOutput::Log {
            source: "web".to_string(),
            text: "\x1b[32mlistening on 3000\x1b[0m".to_string(),
        });
        let mut terminal = Terminal::new(TestBackend::new(60, 12)).expect("terminal");
        terminal.draw(|frame| render(frame, &app)).expect("draw");
        let buffer = terminal.backend().buffer();
        let screen: String = buffer.content.iter().map(|cell| cell.symbol()).collect();
        assert!(screen.contains("listening on 3000"));
        assert!(screen.contains("main"));
        assert!(!screen.contains("\x1b"));
    }
}

use ratatui::style::{Color, Modifier, Style};
use startall_core::RunStatus;

pub const HEADER_STYLE: Style = Style::new()
    .fg(Color::Rgb(142, 192, 124))
    .add_modifier(Modifier::BOLD);
pub const SELECTED_STYLE: Style = Style::new()
    .bg(Color::Rgb(131, 165, 152))
    .fg(Color::Black)
    .add_modifier(Modifier::BOLD);
pub const MUTED_STYLE: Style = Style::new().fg(Color::Rgb(146, 131, 116));
pub const KEY_STYLE: Style = Style::new().fg(Color::Cyan);
pub const WARNING_STYLE: Style = Style::new().fg(Color::Rgb(250, 189, 47));

const FOCUSED_BORDER: Color = Color::Rgb(131, 165, 152);
const FROZEN_BORDER: Color = Color::Rgb(250, 189, 47);
const IDLE_BORDER: Color = Color::Rgb(80, 73, 69);

pub fn border_style(focused: bool, frozen: bool) -> Style {
    let color = match (focused, frozen) {
        (_, true) => FROZEN_BORDER,
        (true, false) => FOCUSED_BORDER,
        (false, false) => IDLE_BORDER,
    };
    let style = Style::new().fg(color);
    if focused {
        style.add_modifier(Modifier::BOLD)
    } else {
        style
    }
}

/// Stable per-command color, so a source keeps its color across panes and
/// restarts.
pub fn source_style(source: &str) -> Style {
    let palette = [
        Color::Rgb(131, 165, 152),
        Color::Rgb(69, 133, 136),
        Color::Rgb(142, 192, 124),
        Color::Rgb(104, 157, 106),
        Color::Rgb(184, 187, 38),
        Color::Rgb(250, 189, 47),
        Color::Rgb(254, 128, 25),
        Color::Rgb(211, 134, 155),
        Color::Rgb(177, 98, 134),
        Color::Rgb(189, 174, 147),
    ];
    let mut hash: u64 = 1469598103934665603;
    for b in source.as_bytes() {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(1099511628211);
    }
    let color = palette[(hash as usize) % palette.len()];
    Style::new().fg(color).add_modifier(Modifier::BOLD)
}

pub mod icons {
    pub const RUNNING: &str = "●";
    pub const STOPPED: &str = "○";
    pub const CRASHED: &str = "✗";
    pub const EXITED: &str = "✓";
    pub const CHECKED: &str = "[x]";
    pub const UNCHECKED: &str = "[ ]";
    pub const FROZEN: &str = "⏸";
}

pub fn status_icon(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => icons::RUNNING,
        RunStatus::Stopped => icons::STOPPED,
        RunStatus::Crashed => icons::CRASHED,
        RunStatus::Exited => icons::EXITED,
    }
}

pub fn status_color(status: RunStatus) -> Color {
    match status {
        RunStatus::Running => Color::Rgb(184, 187, 38),
        RunStatus::Crashed => Color::Rgb(251, 73, 52),
        RunStatus::Exited => Color::Rgb(131, 165, 152),
        RunStatus::Stopped => Color::Rgb(146, 131, 116),
    }
}

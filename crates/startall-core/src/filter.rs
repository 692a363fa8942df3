use crate::ansi;
use crate::output_log::{LogLine, OutputLog};
use crate::pane_tree::Pane;
use std::ops::Range;

/// Conjunction of the pane's scope, hidden set, text filter and color
/// filter.
pub fn line_matches(pane: &Pane, line: &LogLine) -> bool {
    if !pane.process_scope.is_empty() && !pane.process_scope.contains(&line.source) {
        return false;
    }
    if pane.hidden.contains(&line.source) {
        return false;
    }
    let needle = pane.text_filter.trim();
    if !needle.is_empty() {
        let needle = needle.to_lowercase();
        let in_text = ansi::strip(&line.text).to_lowercase().contains(&needle);
        if !in_text && !line.source.to_lowercase().contains(&needle) {
            return false;
        }
    }
    if let Some(color) = pane.color_filter {
        if !ansi::has_color(&line.text, color) {
            return false;
        }
    }
    true
}

pub fn lines_for<'a>(pane: &Pane, log: &'a OutputLog) -> Vec<&'a LogLine> {
    log.iter().filter(|line| line_matches(pane, line)).collect()
}

/// Range of `total` filtered lines to materialize for a pane `height` rows
/// tall. A live pane always shows the newest lines; a frozen pane keeps its
/// position `scroll_offset` lines above the bottom.
pub fn visible_window(total: usize, height: usize, scroll_offset: usize, paused: bool) -> Range<usize> {
    if height == 0 || total == 0 {
        return 0..0;
    }
    let offset = if paused {
        scroll_offset.min(total.saturating_sub(height))
    } else {
        0
    };
    let end = total - offset;
    let start = end.saturating_sub(height);
    start..end
}

/// Largest useful scroll offset for a pane of `height` rows.
pub fn max_scroll(total: usize, height: usize) -> usize {
    total.saturating_sub(height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ansi::ColorClass;

    fn pane() -> Pane {
        Pane::new("main")
    }

    #[test]
    fn scope_and_text_filter_compose() {
        let mut log = OutputLog::default();
        log.append("a", "an error happened");
        log.append("b", "another error happened");
        log.append("a", "all good");
        let mut pane = pane();
        pane.process_scope.insert("a".to_string());
        pane.text_filter = "err".to_string();
        let lines = lines_for(&pane, &log);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].source, "a");
        assert_eq!(lines[0].text, "an error happened");
    }

    #[test]
    fn empty_scope_shows_everything_but_hidden() {
        let mut log = OutputLog::default();
        log.append("web", "listening");
        log.append("db", "ready");
        let mut pane = pane();
        pane.hidden.insert("db".to_string());
        let sources: Vec<_> = lines_for(&pane, &log).iter().map(|l| l.source.clone()).collect();
        assert_eq!(sources, vec!["web"]);
    }

    #[test]
    fn text_filter_is_case_insensitive_and_matches_source() {
        let mut log = OutputLog::default();
        log.append("api", "GET /health 200");
        log.append("web", "compiled");
        let mut pane = pane();
        pane.text_filter = "API".to_string();
        assert_eq!(lines_for(&pane, &log).len(), 1);
        pane.text_filter = "health".to_string();
        assert_eq!(lines_for(&pane, &log)[0].source, "api");
    }

    #[test]
    fn text_filter_ignores_escape_bytes() {
        let mut log = OutputLog::default();
        log.append("web", "\x1b[31mERR\x1b[0mOR");
        let mut pane = pane();
        pane.text_filter = "error".to_string();
        assert_eq!(lines_for(&pane, &log).len(), 1);
    }

    #[test]
    fn color_filter_keeps_only_matching_lines() {
        let mut log = OutputLog::default();
        log.append("web", "\x1b[91mfailed\x1b[0m");
        log.append("web", "\x1b[32mok\x1b[0m");
        log.append("web", "plain");
        let mut pane = pane();
        pane.color_filter = Some(ColorClass::Red);
        let lines = lines_for(&pane, &log);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].text.contains("failed"));
    }

    #[test]
    fn live_window_shows_tail() {
        assert_eq!(visible_window(100, 10, 30, false), 90..100);
        assert_eq!(visible_window(5, 10, 0, false), 0..5);
        assert_eq!(visible_window(0, 10, 0, false), 0..0);
    }

    #[test]
    fn frozen_window_honors_scroll_offset() {
        assert_eq!(visible_window(100, 10, 30, true), 60..70);
        assert_eq!(visible_window(100, 10, 500, true), 0..10);
        assert_eq!(max_scroll(100, 10), 90);
    }
}

use chrono::Utc;
use std::collections::VecDeque;

pub const DEFAULT_LOG_CAPACITY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub source: String,
    pub text: String,
    pub timestamp_ms: i64,
    /// Global ingestion order; survives eviction, so renderers can tell
    /// which lines are new since the last frame.
    pub seq: u64,
}

/// Bounded FIFO of interleaved output lines from every command.
#[derive(Debug, Clone)]
pub struct OutputLog {
    lines: VecDeque<LogLine>,
    capacity: usize,
    next_seq: u64,
}

impl Default for OutputLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl OutputLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
            next_seq: 1,
        }
    }

    pub fn append(&mut self, source: &str, text: &str) -> u64 {
        self.append_at(source, text, Utc::now().timestamp_millis())
    }

    pub fn append_at(&mut self, source: &str, text: &str, timestamp_ms: i64) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.lines.push_back(LogLine {
            source: source.to_string(),
            text: text.to_string(),
            timestamp_ms,
            seq,
        });
        while self.lines.len() > self.capacity {
            self.lines.pop_front();
        }
        seq
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &LogLine> + '_ {
        self.lines.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_is_bounded_to_most_recent_lines() {
        let mut log = OutputLog::default();
        for i in 0..1500 {
            log.append("web", &format!("line {i}"));
        }
        assert_eq!(log.len(), DEFAULT_LOG_CAPACITY);
        let lines: Vec<_> = log.iter().collect();
        assert_eq!(lines[0].text, "line 500");
        assert_eq!(lines[999].text, "line 1499");
        assert!(lines.windows(2).all(|pair| pair[0].seq < pair[1].seq));
        assert_eq!(lines[999].seq, 1500);
    }

    #[test]
    fn sequence_numbers_are_global_across_sources() {
        let mut log = OutputLog::new(10);
        let a = log.append("api", "one");
        let b = log.append("db", "two");
        let c = log.append("api", "three");
        assert!(a < b && b < c);
        let newer: Vec<_> = log
            .iter()
            .filter(|line| line.seq > a)
            .map(|line| line.text.as_str())
            .collect();
        assert_eq!(newer, vec!["two", "three"]);
    }

    #[test]
    fn zero_capacity_keeps_one_line() {
        let mut log = OutputLog::new(0);
        log.append("a", "first");
        log.append("a", "second");
        assert_eq!(log.len(), 1);
        assert_eq!(log.iter().next().map(|l| l.text.as_str()), Some("second"));
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;
use vte::{Params, Parser, Perform};

pub const RESET: &str = "\x1b[0m";

const ESC: char = '\x1b';

/// Color family of a terminal foreground escape code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorClass {
    Red,
    Green,
    Yellow,
    Blue,
    Magenta,
    Cyan,
    White,
}

impl ColorClass {
    pub const ALL: [ColorClass; 7] = [
        ColorClass::Red,
        ColorClass::Green,
        ColorClass::Yellow,
        ColorClass::Blue,
        ColorClass::Magenta,
        ColorClass::Cyan,
        ColorClass::White,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ColorClass::Red => "red",
            ColorClass::Green => "green",
            ColorClass::Yellow => "yellow",
            ColorClass::Blue => "blue",
            ColorClass::Magenta => "magenta",
            ColorClass::Cyan => "cyan",
            ColorClass::White => "white",
        }
    }

    /// Standard (30-37) and bright (90-97) SGR codes for this family.
    pub fn codes(&self) -> [u16; 2] {
        let offset = match self {
            ColorClass::Red => 1,
            ColorClass::Green => 2,
            ColorClass::Yellow => 3,
            ColorClass::Blue => 4,
            ColorClass::Magenta => 5,
            ColorClass::Cyan => 6,
            ColorClass::White => 7,
        };
        [30 + offset, 90 + offset]
    }

    /// Cycles `None -> red -> ... -> white -> None`.
    pub fn cycle(current: Option<ColorClass>) -> Option<ColorClass> {
        match current {
            None => Some(Self::ALL[0]),
            Some(color) => {
                let index = Self::ALL.iter().position(|c| *c == color).unwrap_or(0);
                Self::ALL.get(index + 1).copied()
            }
        }
    }
}

impl fmt::Display for ColorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token<'a> {
    Text(&'a str),
    /// A `CSI ... m` sequence: its parameters, colon subparameters
    /// flattened in order, and the raw bytes.
    Sgr { params: Vec<u16>, raw: &'a str },
    /// Any other escape sequence or control byte, kept verbatim.
    Control(&'a str),
}

/// Splits raw terminal output into printable runs and escape sequences.
/// Escape sequences are never split: an unterminated one swallows the rest
/// of the input.
pub fn tokenize(text: &str) -> Vec<Token<'_>> {
    let mut parser = Parser::new();
    let mut scanner = Scanner {
        text,
        pos: 0,
        last_end: 0,
        run_start: None,
        tokens: Vec::new(),
    };
    for (pos, byte) in text.bytes().enumerate() {
        scanner.pos = pos;
        parser.advance(&mut scanner, &[byte]);
    }
    scanner.finish()
}

/// Feeds `vte` one byte at a time so every callback knows which byte
/// completed it; the bytes since the previous token form its raw text.
struct Scanner<'a> {
    text: &'a str,
    pos: usize,
    last_end: usize,
    run_start: Option<usize>,
    tokens: Vec<Token<'a>>,
}

impl<'a> Scanner<'a> {
    fn flush_run(&mut self) {
        let text = self.text;
        if let Some(start) = self.run_start.take() {
            self.tokens.push(Token::Text(&text[start..self.last_end]));
        }
    }

    fn push_char(&mut self, start: usize) {
        let text = self.text;
        if start > self.last_end {
            self.flush_run();
            self.tokens
                .push(Token::Control(&text[self.last_end..start]));
        }
        if self.run_start.is_none() {
            self.run_start = Some(start);
        }
        self.last_end = self.pos + 1;
    }

    fn push_sequence(&mut self, params: Option<Vec<u16>>) {
        let text = self.text;
        self.flush_run();
        let end = self.pos + 1;
        let raw = &text[self.last_end..end];
        self.tokens.push(match params {
            Some(params) => Token::Sgr { params, raw },
            None => Token::Control(raw),
        });
        self.last_end = end;
    }

    fn finish(mut self) -> Vec<Token<'a>> {
        let text = self.text;
        self.flush_run();
        if self.last_end < self.text.len() {
            self.tokens.push(Token::Control(&text[self.last_end..]));
        }
        self.tokens
    }
}

impl Perform for Scanner<'_> {
    fn print(&mut self, c: char) {
        let start = (self.pos + 1).saturating_sub(c.len_utf8());
        self.push_char(start);
    }

    fn execute(&mut self, byte: u8) {
        if byte == b'\t' {
            self.push_char(self.pos);
        } else {
            self.push_sequence(None);
        }
    }

    fn csi_dispatch(&mut self, params: &Params, intermediates: &[u8], ignore: bool, action: char) {
        if action == 'm' && intermediates.is_empty() && !ignore {
            let flat = params.iter().flat_map(|group| group.iter().copied()).collect();
            self.push_sequence(Some(flat));
        } else {
            self.push_sequence(None);
        }
    }

    fn esc_dispatch(&mut self, _intermediates: &[u8], _ignore: bool, _byte: u8) {
        self.push_sequence(None);
    }

    fn osc_dispatch(&mut self, _params: &[&[u8]], _bell_terminated: bool) {
        self.push_sequence(None);
    }

    fn unhook(&mut self) {
        self.push_sequence(None);
    }
}

/// True when any SGR sequence in `text` sets a foreground color from
/// `class`, alone (`ESC[31m`) or inside a compound list (`ESC[1;31m`).
/// The operands of 38/48/58 extended colors are not codes of their own.
pub fn has_color(text: &str, class: ColorClass) -> bool {
    if !text.contains(ESC) {
        return false;
    }
    let codes = class.codes();
    tokenize(text).into_iter().any(|token| match token {
        Token::Sgr { params, .. } => sgr_codes(&params).any(|code| codes.contains(&code)),
        _ => false,
    })
}

/// Walks SGR parameters, skipping the `5;n` and `2;r;g;b` tails of
/// extended color codes.
fn sgr_codes(params: &[u16]) -> impl Iterator<Item = u16> + '_ {
    let mut index = 0;
    std::iter::from_fn(move || {
        let code = *params.get(index)?;
        index += match code {
            38 | 48 | 58 => match params.get(index + 1) {
                Some(5) => 3,
                Some(2) => 5,
                _ => 1,
            },
            _ => 1,
        };
        Some(code)
    })
}

pub fn strip(text: &str) -> String {
    tokenize(text)
        .into_iter()
        .filter_map(|token| match token {
            Token::Text(run) => Some(run),
            _ => None,
        })
        .collect()
}

/// Truncates to `width` visible characters. Escape sequences are copied
/// whole and do not count toward the width; a reset is appended when
/// anything was cut so styling does not leak into the next line.
pub fn truncate(text: &str, width: usize) -> String {
    let mut out = String::with_capacity(text.len().min(width * 4 + RESET.len()));
    let mut remaining = width;
    let mut truncated = false;
    for token in tokenize(text) {
        match token {
            Token::Text(run) => {
                if remaining == 0 {
                    truncated = true;
                    break;
                }
                let mut chars = run.char_indices();
                let cut = chars.nth(remaining).map(|(idx, _)| idx);
                match cut {
                    Some(idx) => {
                        out.push_str(&run[..idx]);
                        truncated = true;
                        break;
                    }
                    None => {
                        remaining -= run.chars().count();
                        out.push_str(run);
                    }
                }
            }
            Token::Sgr { raw, .. } | Token::Control(raw) => out.push_str(raw),
        }
    }
    if truncated {
        out.push_str(RESET);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bright_red_matches_red_filter() {
        assert!(has_color("\x1b[91mfailed\x1b[0m", ColorClass::Red));
        assert!(has_color("\x1b[31mfailed\x1b[0m", ColorClass::Red));
    }

    #[test]
    fn green_does_not_match_red() {
        assert!(!has_color("\x1b[32mok\x1b[0m", ColorClass::Red));
        assert!(has_color("\x1b[32mok\x1b[0m", ColorClass::Green));
    }

    #[test]
    fn plain_text_matches_no_color() {
        for class in ColorClass::ALL {
            assert!(!has_color("error: 31 things went wrong", class));
        }
    }

    #[test]
    fn compound_sequence_matches_any_parameter() {
        assert!(has_color("\x1b[1;31mbold red\x1b[0m", ColorClass::Red));
        assert!(has_color("\x1b[4;1;33mwarn", ColorClass::Yellow));
        assert!(!has_color("\x1b[1;34mblue", ColorClass::Red));
    }

    #[test]
    fn cursor_sequences_are_not_colors() {
        assert!(!has_color("\x1b[31Gcolumn", ColorClass::Red));
        assert!(!has_color("\x1b[2K\x1b[0m", ColorClass::White));
    }

    #[test]
    fn extended_color_operands_are_not_codes() {
        assert!(!has_color("\x1b[38;5;31mteal\x1b[0m", ColorClass::Red));
        assert!(!has_color("\x1b[38;2;0;31;200mblue\x1b[0m", ColorClass::Red));
        assert!(!has_color("\x1b[48;5;91mbg", ColorClass::Red));
        assert!(has_color("\x1b[38;5;208;31mafter", ColorClass::Red));
        assert!(has_color("\x1b[38;2;1;2;3;1;91mafter", ColorClass::Red));
    }

    #[test]
    fn colon_subparameters_are_flattened() {
        let tokens = tokenize("\x1b[38:5:31mx");
        assert_eq!(
            tokens[0],
            Token::Sgr {
                params: vec![38, 5, 31],
                raw: "\x1b[38:5:31m",
            }
        );
        assert!(!has_color("\x1b[38:5:31mx", ColorClass::Red));
    }

    #[test]
    fn tokens_cover_every_input_byte() {
        let line = "\x1b]0;title\x1b\\go\tnow\x1b[1;32mok\x1b[K\r";
        let rebuilt: String = tokenize(line)
            .into_iter()
            .map(|token| match token {
                Token::Text(run) => run,
                Token::Sgr { raw, .. } | Token::Control(raw) => raw,
            })
            .collect();
        assert_eq!(rebuilt, line);
        assert_eq!(strip(line), "go\tnowok");
    }

    #[test]
    fn strip_removes_escapes() {
        assert_eq!(strip("\x1b[1;32mready\x1b[0m in 3ms"), "ready in 3ms");
        assert_eq!(strip("\x1b]0;title\x07body"), "body");
    }

    #[test]
    fn truncate_counts_only_visible_chars() {
        let line = "\x1b[31mabcdef\x1b[0m";
        let cut = truncate(line, 3);
        assert_eq!(cut, "\x1b[31mabc\x1b[0m");
        assert_eq!(strip(&cut).chars().count(), 3);
    }

    #[test]
    fn truncate_never_splits_escape_sequences() {
        let line = "ab\x1b[38;5;208mcdef";
        let cut = truncate(line, 2);
        assert_eq!(cut, "ab\x1b[38;5;208m\x1b[0m");
        let cut = truncate(line, 3);
        assert_eq!(cut, "ab\x1b[38;5;208mc\x1b[0m");
    }

    #[test]
    fn truncate_leaves_short_lines_untouched() {
        assert_eq!(truncate("\x1b[32mok\x1b[0m", 10), "\x1b[32mok\x1b[0m");
        assert_eq!(truncate("héllo", 5), "héllo");
        assert_eq!(truncate("héllo", 2), "hé\x1b[0m");
    }

    #[test]
    fn color_cycle_wraps_to_none() {
        let mut current = None;
        for _ in 0..ColorClass::ALL.len() {
            current = ColorClass::cycle(current);
            assert!(current.is_some());
        }
        assert_eq!(ColorClass::cycle(current), None);
    }
}

use crate::error::ConfigError;
use globset::GlobBuilder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_CONFIG_FILE: &str = "startall.json";
pub const DEFAULT_COUNTDOWN_SECS: u32 = 10;
pub const DEFAULT_RESTART_DELAY_MS: u64 = 100;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub default_selection: Vec<String>,
    /// Absent means every command is included.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<Vec<String>>,
    #[serde(default)]
    pub ignore: Vec<String>,
    /// Single-character key to command name.
    #[serde(default)]
    pub shortcuts: BTreeMap<String, String>,
    #[serde(default)]
    pub show_line_numbers: bool,
    #[serde(default)]
    pub show_timestamps: bool,
    /// Kept as raw JSON so a damaged layout never invalidates the rest of
    /// the file.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub pane_layout: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub countdown_seconds: Option<u32>,
}

impl Config {
    /// Reads the config file, falling back to defaults when it is missing
    /// or unreadable.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) => {
                warn!("config_read_failed: {}: {err}", path.display());
                return Self::default();
            }
        };
        match serde_json::from_str(&contents) {
            Ok(config) => config,
            Err(err) => {
                warn!("config_parse_failed: {}: {err}", path.display());
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut contents = serde_json::to_string_pretty(self)?;
        contents.push('\n');
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn countdown(&self) -> u32 {
        self.countdown_seconds.unwrap_or(DEFAULT_COUNTDOWN_SECS)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms.unwrap_or(DEFAULT_RESTART_DELAY_MS))
    }

    /// Include patterns first (all names when unset), then ignore patterns.
    pub fn is_included(&self, name: &str) -> bool {
        let included = match &self.include {
            Some(patterns) => patterns.iter().any(|pattern| matches_glob(pattern, name)),
            None => true,
        };
        included && !self.ignore.iter().any(|pattern| matches_glob(pattern, name))
    }

    pub fn add_include(&mut self, pattern: &str) -> bool {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return false;
        }
        let include = self.include.get_or_insert_with(Vec::new);
        if include.iter().any(|existing| existing == pattern) {
            return false;
        }
        include.push(pattern.to_string());
        true
    }

    pub fn add_ignore(&mut self, pattern: &str) -> bool {
        let pattern = pattern.trim();
        if pattern.is_empty() || self.ignore.iter().any(|existing| existing == pattern) {
            return false;
        }
        self.ignore.push(pattern.to_string());
        true
    }

    /// Removing the last include pattern restores "include everything".
    pub fn remove_include(&mut self, index: usize) -> Option<String> {
        let include = self.include.as_mut()?;
        if index >= include.len() {
            return None;
        }
        let removed = include.remove(index);
        if include.is_empty() {
            self.include = None;
        }
        Some(removed)
    }

    pub fn remove_ignore(&mut self, index: usize) -> Option<String> {
        (index < self.ignore.len()).then(|| self.ignore.remove(index))
    }

    /// Binds `key` to `command`. A key has one command and a command has one
    /// key, so any previous binding of either is dropped.
    pub fn assign_shortcut(&mut self, key: char, command: &str) {
        self.shortcuts.retain(|_, bound| bound != command);
        self.shortcuts.insert(key.to_string(), command.to_string());
    }

    pub fn remove_shortcut(&mut self, command: &str) -> bool {
        let before = self.shortcuts.len();
        self.shortcuts.retain(|_, bound| bound != command);
        before != self.shortcuts.len()
    }

    pub fn shortcut_for(&self, command: &str) -> Option<char> {
        self.shortcuts
            .iter()
            .find(|(_, bound)| bound.as_str() == command)
            .and_then(|(key, _)| single_char(key))
    }

    pub fn command_for_key(&self, key: char) -> Option<&str> {
        self.shortcuts
            .iter()
            .find(|(bound_key, _)| single_char(bound_key) == Some(key))
            .map(|(_, command)| command.as_str())
    }
}

fn single_char(key: &str) -> Option<char> {
    let mut chars = key.chars();
    let first = chars.next()?;
    chars.next().is_none().then_some(first)
}

/// Anchored match where `*` stands for zero or more characters and every
/// other character is literal.
pub fn matches_glob(pattern: &str, name: &str) -> bool {
    let escaped = pattern
        .split('*')
        .map(globset::escape)
        .collect::<Vec<_>>()
        .join("*");
    match GlobBuilder::new(&escaped).literal_separator(false).build() {
        Ok(glob) => glob.compile_matcher().is_match(name),
        Err(err) => {
            warn!("glob_invalid: {pattern}: {err}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn glob_star_matches_any_run() {
        assert!(matches_glob("dev*", "dev"));
        assert!(matches_glob("dev*", "dev:web"));
        assert!(matches_glob("*:watch", "css:watch"));
        assert!(matches_glob("build/*", "build/docs/site"));
        assert!(!matches_glob("dev*", "predev"));
        assert!(!matches_glob("test", "test:unit"));
        assert!(matches_glob("lint[js]", "lint[js]"));
        assert!(!matches_glob("lint?", "lints"));
    }

    #[test]
    fn include_then_ignore() {
        let mut config = Config::default();
        assert!(config.is_included("anything"));
        config.add_include("dev*");
        config.add_ignore("*:legacy");
        assert!(config.is_included("dev:web"));
        assert!(!config.is_included("dev:legacy"));
        assert!(!config.is_included("lint"));
        assert_eq!(config.remove_include(0).as_deref(), Some("dev*"));
        assert!(config.include.is_none());
        assert!(config.is_included("lint"));
    }

    #[test]
    fn shortcut_keys_are_exclusive() {
        let mut config = Config::default();
        config.assign_shortcut('b', "lint");
        config.assign_shortcut('b', "build");
        assert_eq!(config.command_for_key('b'), Some("build"));
        assert_eq!(config.shortcut_for("lint"), None);
        assert_eq!(config.shortcut_for("build"), Some('b'));

        config.assign_shortcut('x', "build");
        assert_eq!(config.command_for_key('b'), None);
        assert_eq!(config.shortcuts.len(), 1);
    }

    #[test]
    fn missing_or_broken_file_loads_defaults() {
        let file = NamedTempFile::new().expect("temp file");
        std::fs::write(file.path(), "{ not json").expect("write");
        assert_eq!(Config::load(file.path()), Config::default());
        let missing = file.path().with_extension("missing");
        assert_eq!(Config::load(&missing), Config::default());
    }

    #[test]
    fn save_and_load_round_trip() {
        let file = NamedTempFile::new().expect("temp file");
        let mut config = Config::default();
        config.default_selection = vec!["web".to_string(), "api".to_string()];
        config.add_ignore("*:ci");
        config.assign_shortcut('t', "test");
        config.show_timestamps = true;
        config.pane_layout = serde_json::json!({ "type": "pane", "name": "main" });
        config.save(file.path()).expect("save");

        let raw = std::fs::read_to_string(file.path()).expect("read");
        assert!(raw.contains("\"defaultSelection\""));
        assert!(raw.contains("\"showTimestamps\": true"));
        assert!(!raw.contains("\"include\""));
        assert_eq!(Config::load(file.path()), config);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let file = NamedTempFile::new().expect("temp file");
        std::fs::write(file.path(), r#"{ "ignore": ["docs*"], "countdownSeconds": 3 }"#)
            .expect("write");
        let config = Config::load(file.path());
        assert_eq!(config.ignore, vec!["docs*".to_string()]);
        assert_eq!(config.countdown(), 3);
        assert_eq!(config.restart_delay(), Duration::from_millis(DEFAULT_RESTART_DELAY_MS));
        assert!(config.pane_layout.is_null());
    }
}

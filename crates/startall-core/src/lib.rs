pub mod ansi;
pub mod config;
pub mod error;
pub mod filter;
pub mod manifest;
pub mod output_log;
pub mod pane_tree;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

pub use ansi::ColorClass;
pub use config::Config;
pub use error::{ConfigError, ManifestError};
pub use output_log::{LogLine, OutputLog, DEFAULT_LOG_CAPACITY};
pub use pane_tree::{CloseOutcome, Pane, PaneId, PaneNode, PaneTree, Split, SplitDirection};

/// A named, persistently run command declared in the project manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub display_name: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl Command {
    pub fn invocation(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Stopped,
    Running,
    Crashed,
    Exited,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Stopped
    }
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Stopped => "stopped",
            RunStatus::Running => "running",
            RunStatus::Crashed => "crashed",
            RunStatus::Exited => "exited",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunState {
    pub status: RunStatus,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
}

impl RunState {
    pub fn running(pid: Option<u32>) -> Self {
        Self {
            status: RunStatus::Running,
            pid,
            exit_code: None,
        }
    }

    /// Exit code 0 is a clean exit; anything else, including a missing code
    /// (killed by a signal), counts as a crash.
    pub fn finished(exit_code: Option<i32>) -> Self {
        let status = if exit_code == Some(0) {
            RunStatus::Exited
        } else {
            RunStatus::Crashed
        };
        Self {
            status,
            pid: None,
            exit_code,
        }
    }
}

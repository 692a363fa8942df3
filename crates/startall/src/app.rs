use crate::supervisor::SupervisorOutput;
use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use startall_core::{
    filter, pane_tree::Area, CloseOutcome, ColorClass, Command, Config, LogLine, OutputLog,
    PaneId, PaneTree, RunState, SplitDirection,
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;
use tracing::{info, warn};

pub const STATUS_BAR_HEIGHT: u16 = 2;
const ONE_OFF_CAPACITY: usize = 1000;
const RESIZE_STEP: f64 = 0.1;

/// Requests from the state machine to the supervisor. This is the only way
/// key handling reaches a live process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Start(String),
    Stop(String),
    Restart(String),
    Toggle(String),
    SendInput { name: String, text: String },
    ExecuteOnce(String),
    CancelOneOff,
    PauseStreams,
    ResumeStreams,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Selecting,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SettingsSection {
    #[default]
    Include,
    Ignore,
    Shortcuts,
    Display,
}

impl SettingsSection {
    pub const ALL: [SettingsSection; 4] = [
        SettingsSection::Include,
        SettingsSection::Ignore,
        SettingsSection::Shortcuts,
        SettingsSection::Display,
    ];

    pub fn title(&self) -> &'static str {
        match self {
            SettingsSection::Include => "Include",
            SettingsSection::Ignore => "Ignore",
            SettingsSection::Shortcuts => "Shortcuts",
            SettingsSection::Display => "Display",
        }
    }

    fn step(self, delta: isize) -> Self {
        let index = Self::ALL.iter().position(|s| *s == self).unwrap_or(0) as isize;
        let len = Self::ALL.len() as isize;
        Self::ALL[(index + delta).rem_euclid(len) as usize]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsCapture {
    AddPattern,
    AssignShortcut { command: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SettingsState {
    pub section: SettingsSection,
    pub selected: usize,
    pub capture: Option<SettingsCapture>,
}

/// Exactly one mode is active. Text-capturing modes receive every printable
/// key, so shortcuts can never fire while the operator is typing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Normal,
    TextFilterInput,
    PaneNamingInput,
    StdinInput { target: String },
    Settings(SettingsState),
    CommandPalette { selected: usize },
    RunPicker { selected: usize },
    OneOffOverlay,
    Help,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Quit,
    NextPane,
    PrevPane,
    SplitVertical,
    SplitHorizontal,
    ClosePane,
    TextFilter,
    RenamePane,
    SendInput,
    CycleColor,
    TogglePause,
    TogglePauseAll,
    OpenSettings,
    OpenPalette,
    OpenRunPicker,
    CursorNext,
    CursorPrev,
    ToggleProcess,
    StopProcess,
    RestartProcess,
    ToggleHidden,
    ToggleScope,
    MoveProcessHere,
    ToggleLineNumbers,
    ToggleTimestamps,
    GrowPane,
    ShrinkPane,
    ScrollUp,
    ScrollDown,
    PageUp,
    PageDown,
    ScrollTop,
    ScrollBottom,
    ClearFilters,
    Help,
}

impl Action {
    pub const PALETTE: [Action; 25] = [
        Action::SplitVertical,
        Action::SplitHorizontal,
        Action::ClosePane,
        Action::NextPane,
        Action::RenamePane,
        Action::GrowPane,
        Action::ShrinkPane,
        Action::TextFilter,
        Action::CycleColor,
        Action::ClearFilters,
        Action::TogglePause,
        Action::TogglePauseAll,
        Action::ToggleProcess,
        Action::StopProcess,
        Action::RestartProcess,
        Action::SendInput,
        Action::ToggleHidden,
        Action::ToggleScope,
        Action::MoveProcessHere,
        Action::OpenRunPicker,
        Action::ToggleLineNumbers,
        Action::ToggleTimestamps,
        Action::OpenSettings,
        Action::Help,
        Action::Quit,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Action::Quit => "Quit",
            Action::NextPane => "Focus next pane",
            Action::PrevPane => "Focus previous pane",
            Action::SplitVertical => "Split pane vertically",
            Action::SplitHorizontal => "Split pane horizontally",
            Action::ClosePane => "Close pane",
            Action::TextFilter => "Filter pane text",
            Action::RenamePane => "Rename pane",
            Action::SendInput => "Send input to process",
            Action::CycleColor => "Cycle color filter",
            Action::TogglePause => "Freeze/unfreeze pane",
            Action::TogglePauseAll => "Freeze/unfreeze all panes",
            Action::OpenSettings => "Settings",
            Action::OpenPalette => "Command palette",
            Action::OpenRunPicker => "Run command once",
            Action::CursorNext => "Select next process",
            Action::CursorPrev => "Select previous process",
            Action::ToggleProcess => "Start/stop process",
            Action::StopProcess => "Stop process",
            Action::RestartProcess => "Restart process",
            Action::ToggleHidden => "Hide/show process in pane",
            Action::ToggleScope => "Add/remove process from pane",
            Action::MoveProcessHere => "Move process to pane",
            Action::ToggleLineNumbers => "Toggle line numbers",
            Action::ToggleTimestamps => "Toggle timestamps",
            Action::GrowPane => "Grow pane",
            Action::ShrinkPane => "Shrink pane",
            Action::ScrollUp => "Scroll up",
            Action::ScrollDown => "Scroll down",
            Action::PageUp => "Page up",
            Action::PageDown => "Page down",
            Action::ScrollTop => "Scroll to top",
            Action::ScrollBottom => "Scroll to bottom",
            Action::ClearFilters => "Clear pane filters",
            Action::Help => "Help",
        }
    }

    fn for_key(code: KeyCode) -> Option<Action> {
        let action = match code {
            KeyCode::Char('q') => Action::Quit,
            KeyCode::Tab => Action::NextPane,
            KeyCode::BackTab => Action::PrevPane,
            KeyCode::Char('|') => Action::SplitVertical,
            KeyCode::Char('-') => Action::SplitHorizontal,
            KeyCode::Char('x') => Action::ClosePane,
            KeyCode::Char('/') => Action::TextFilter,
            KeyCode::Char('n') => Action::RenamePane,
            KeyCode::Char('i') => Action::SendInput,
            KeyCode::Char('c') => Action::CycleColor,
            KeyCode::Char(' ') => Action::TogglePause,
            KeyCode::Char('P') => Action::TogglePauseAll,
            KeyCode::Char('o') => Action::OpenSettings,
            KeyCode::Char(':') => Action::OpenPalette,
            KeyCode::Char('e') => Action::OpenRunPicker,
            KeyCode::Char('j') => Action::CursorNext,
            KeyCode::Char('k') => Action::CursorPrev,
            KeyCode::Char('s') => Action::ToggleProcess,
            KeyCode::Char('S') => Action::StopProcess,
            KeyCode::Char('r') => Action::RestartProcess,
            KeyCode::Char('h') => Action::ToggleHidden,
            KeyCode::Char('f') => Action::ToggleScope,
            KeyCode::Char('m') => Action::MoveProcessHere,
            KeyCode::Char('l') => Action::ToggleLineNumbers,
            KeyCode::Char('t') => Action::ToggleTimestamps,
            KeyCode::Char(']') => Action::GrowPane,
            KeyCode::Char('[') => Action::ShrinkPane,
            KeyCode::Char('?') => Action::Help,
            KeyCode::Up => Action::ScrollUp,
            KeyCode::Down => Action::ScrollDown,
            KeyCode::PageUp => Action::PageUp,
            KeyCode::PageDown => Action::PageDown,
            KeyCode::Home => Action::ScrollTop,
            KeyCode::End => Action::ScrollBottom,
            KeyCode::Esc => Action::ClearFilters,
            _ => return None,
        };
        Some(action)
    }

    /// Keys with a built-in binding can never be used as shortcuts.
    pub fn is_reserved(key: char) -> bool {
        Self::for_key(KeyCode::Char(key)).is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneOffView {
    pub name: String,
    pub lines: VecDeque<String>,
    /// `Some` once the process has exited; the inner value is its code.
    pub exit: Option<Option<i32>>,
}

enum InputOutcome {
    Editing,
    Commit,
    Cancel,
}

pub struct App {
    pub commands: Vec<Command>,
    pub config: Config,
    config_path: PathBuf,
    pub phase: Phase,
    pub mode: Mode,
    pub tree: PaneTree,
    pub focused: PaneId,
    pub log: OutputLog,
    pub states: BTreeMap<String, RunState>,
    pub selection: BTreeSet<String>,
    pub cursor: usize,
    pub countdown: u32,
    pub input: String,
    pub one_off: Option<OneOffView>,
    pub status: String,
    pub dirty: bool,
    viewport: (u16, u16),
    streams_paused: bool,
}

impl App {
    pub fn new(commands: Vec<Command>, config: Config, config_path: PathBuf) -> Self {
        let tree = if config.pane_layout.is_null() {
            PaneTree::default()
        } else {
            PaneTree::from_value(&config.pane_layout)
        };
        let focused = tree.first_id();
        let mut app = Self {
            commands,
            countdown: config.countdown(),
            config,
            config_path,
            phase: Phase::Selecting,
            mode: Mode::Normal,
            tree,
            focused,
            log: OutputLog::default(),
            states: BTreeMap::new(),
            selection: BTreeSet::new(),
            cursor: 0,
            input: String::new(),
            one_off: None,
            status: String::new(),
            dirty: true,
            viewport: (80, 24),
            streams_paused: false,
        };
        app.selection = app.initial_selection();
        app
    }

    /// The persisted default selection, or every displayed command when
    /// none is saved yet.
    fn initial_selection(&self) -> BTreeSet<String> {
        let visible = self.visible_commands();
        let saved: BTreeSet<String> = visible
            .iter()
            .filter(|command| self.config.default_selection.contains(&command.name))
            .map(|command| command.name.clone())
            .collect();
        if saved.is_empty() && self.config.default_selection.is_empty() {
            visible.iter().map(|command| command.name.clone()).collect()
        } else {
            saved
        }
    }

    /// Commands passing the include/ignore patterns, in manifest order.
    pub fn visible_commands(&self) -> Vec<&Command> {
        self.commands
            .iter()
            .filter(|command| self.config.is_included(&command.name))
            .collect()
    }

    pub fn cursor_command(&self) -> Option<String> {
        let visible = self.visible_commands();
        visible
            .get(self.cursor.min(visible.len().saturating_sub(1)))
            .map(|command| command.name.clone())
    }

    pub fn state(&self, name: &str) -> RunState {
        self.states.get(name).cloned().unwrap_or_default()
    }

    pub fn set_states(&mut self, states: BTreeMap<String, RunState>) {
        if self.states != states {
            self.states = states;
            self.dirty = true;
        }
    }

    pub fn streams_paused(&self) -> bool {
        self.streams_paused
    }

    pub fn set_viewport(&mut self, width: u16, height: u16) {
        self.viewport = (width, height);
        self.dirty = true;
    }

    /// Region shared by all panes; the status bar takes the bottom rows.
    pub fn body_area(&self) -> Area {
        let (width, height) = self.viewport;
        Area {
            x: 0,
            y: 0,
            width,
            height: height.saturating_sub(STATUS_BAR_HEIGHT),
        }
    }

    pub fn pane_inner_height(&self, id: PaneId) -> usize {
        self.tree
            .layout(self.body_area())
            .into_iter()
            .find(|(pane_id, _)| *pane_id == id)
            .map(|(_, area)| area.height.saturating_sub(2) as usize)
            .unwrap_or(0)
    }

    pub fn pane_lines(&self, id: PaneId) -> Vec<&LogLine> {
        match self.tree.find(id) {
            Some(pane) => filter::lines_for(pane, &self.log),
            None => Vec::new(),
        }
    }

    pub fn palette_matches(&self) -> Vec<Action> {
        let query = self.input.trim().to_lowercase();
        Action::PALETTE
            .iter()
            .copied()
            .filter(|action| fuzzy_match(action.label(), &query))
            .collect()
    }

    pub fn handle_key(&mut self, key: KeyEvent) -> Vec<Effect> {
        if key.kind == KeyEventKind::Release {
            return Vec::new();
        }
        self.dirty = true;
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            return vec![Effect::Quit];
        }
        let mut effects = Vec::new();
        match self.mode.clone() {
            Mode::Settings(state) => self.handle_key_settings(key, state),
            Mode::Help => self.handle_key_help(key),
            Mode::OneOffOverlay => self.handle_key_one_off(key, &mut effects),
            Mode::CommandPalette { selected } => {
                self.handle_key_palette(key, selected, &mut effects)
            }
            Mode::RunPicker { selected } => self.handle_key_run_picker(key, selected, &mut effects),
            Mode::TextFilterInput | Mode::PaneNamingInput | Mode::StdinInput { .. } => {
                self.handle_key_input(key, &mut effects)
            }
            Mode::Normal => match self.phase {
                Phase::Selecting => self.handle_key_selecting(key, &mut effects),
                Phase::Running => self.handle_key_running(key, &mut effects),
            },
        }
        if self.phase == Phase::Running {
            self.sync_stream_pause(&mut effects);
        }
        effects
    }

    /// Advances the launch countdown. Open overlays hold it.
    pub fn tick_countdown(&mut self) -> Vec<Effect> {
        if self.phase != Phase::Selecting || self.mode != Mode::Normal {
            return Vec::new();
        }
        self.dirty = true;
        self.countdown = self.countdown.saturating_sub(1);
        if self.countdown == 0 {
            self.launch()
        } else {
            Vec::new()
        }
    }

    /// Leaves the selection screen for good and persists the selection.
    pub fn launch(&mut self) -> Vec<Effect> {
        if self.phase == Phase::Running {
            return Vec::new();
        }
        let names = self.persist_selection();
        self.phase = Phase::Running;
        self.mode = Mode::Normal;
        self.cursor = 0;
        self.dirty = true;
        info!("launching: {}", names.join(", "));
        names.into_iter().map(Effect::Start).collect()
    }

    pub fn ingest(&mut self, output: SupervisorOutput) {
        self.dirty = true;
        match output {
            SupervisorOutput::Log { source, text } => {
                self.log.append(&source, &text);
                let Some(line) = self.log.iter().next_back() else {
                    return;
                };
                // Frozen panes keep their view still while the log grows.
                for pane in self.tree.panes_mut() {
                    if pane.paused && filter::line_matches(pane, line) {
                        pane.scroll_offset += 1;
                    }
                }
            }
            SupervisorOutput::OneOffLine(text) => {
                if let Some(view) = self.one_off.as_mut() {
                    if view.lines.len() >= ONE_OFF_CAPACITY {
                        view.lines.pop_front();
                    }
                    view.lines.push_back(text);
                }
            }
            SupervisorOutput::OneOffExited(code) => {
                if let Some(view) = self.one_off.as_mut() {
                    view.exit = Some(code);
                }
            }
        }
    }

    fn handle_key_selecting(&mut self, key: KeyEvent, effects: &mut Vec<Effect>) {
        let len = self.visible_commands().len();
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => effects.push(Effect::Quit),
            KeyCode::Char('j') | KeyCode::Down => self.move_cursor(1, len),
            KeyCode::Char('k') | KeyCode::Up => self.move_cursor(-1, len),
            KeyCode::Char(' ') => {
                if let Some(name) = self.cursor_command() {
                    if !self.selection.remove(&name) {
                        self.selection.insert(name);
                    }
                    self.persist_selection();
                    self.reset_countdown();
                }
            }
            KeyCode::Char('a') => {
                let visible: Vec<String> = self
                    .visible_commands()
                    .iter()
                    .map(|command| command.name.clone())
                    .collect();
                if visible.iter().all(|name| self.selection.contains(name)) {
                    self.selection.clear();
                } else {
                    self.selection.extend(visible);
                }
                self.persist_selection();
                self.reset_countdown();
            }
            KeyCode::Enter => effects.extend(self.launch()),
            KeyCode::Char('o') => self.mode = Mode::Settings(SettingsState::default()),
            KeyCode::Char('?') => self.mode = Mode::Help,
            _ => {}
        }
    }

    fn handle_key_running(&mut self, key: KeyEvent, effects: &mut Vec<Effect>) {
        if key.modifiers.intersects(KeyModifiers::CONTROL | KeyModifiers::ALT) {
            return;
        }
        if let Some(action) = Action::for_key(key.code) {
            self.perform(action, effects);
            return;
        }
        let KeyCode::Char(ch) = key.code else {
            return;
        };
        let Some(command) = self.config.command_for_key(ch).map(str::to_string) else {
            return;
        };
        if self.commands.iter().any(|known| known.name == command) {
            self.open_one_off(command, effects);
        } else {
            self.status = format!("Shortcut '{ch}' points at unknown command {command}");
        }
    }

    fn perform(&mut self, action: Action, effects: &mut Vec<Effect>) {
        match action {
            Action::Quit => effects.push(Effect::Quit),
            Action::NextPane => self.focused = self.tree.next_id(self.focused),
            Action::PrevPane => self.focused = self.tree.prev_id(self.focused),
            Action::SplitVertical => self.split_focused(SplitDirection::Vertical),
            Action::SplitHorizontal => self.split_focused(SplitDirection::Horizontal),
            Action::ClosePane => self.close_focused(),
            Action::TextFilter => {
                self.input = self
                    .tree
                    .find(self.focused)
                    .map(|pane| pane.text_filter.clone())
                    .unwrap_or_default();
                self.mode = Mode::TextFilterInput;
            }
            Action::RenamePane => {
                self.input = self
                    .tree
                    .find(self.focused)
                    .map(|pane| pane.name.clone())
                    .unwrap_or_default();
                self.mode = Mode::PaneNamingInput;
            }
            Action::SendInput => {
                let Some(name) = self.cursor_command() else {
                    return;
                };
                if self.state(&name).status.is_running() {
                    self.input.clear();
                    self.mode = Mode::StdinInput { target: name };
                } else {
                    self.status = format!("{name} is not running");
                }
            }
            Action::CycleColor => {
                if let Some(pane) = self.tree.find_mut(self.focused) {
                    pane.color_filter = ColorClass::cycle(pane.color_filter);
                    refreeze(pane);
                }
                self.persist_layout();
            }
            Action::TogglePause => {
                if let Some(pane) = self.tree.find_mut(self.focused) {
                    pane.paused = !pane.paused;
                    if !pane.paused {
                        pane.scroll_offset = 0;
                    }
                }
            }
            Action::TogglePauseAll => {
                let pause = self.tree.panes().iter().any(|pane| !pane.paused);
                for pane in self.tree.panes_mut() {
                    pane.paused = pause;
                    if !pause {
                        pane.scroll_offset = 0;
                    }
                }
            }
            Action::OpenSettings => self.mode = Mode::Settings(SettingsState::default()),
            Action::OpenPalette => {
                self.input.clear();
                self.mode = Mode::CommandPalette { selected: 0 };
            }
            Action::OpenRunPicker => self.mode = Mode::RunPicker { selected: 0 },
            Action::CursorNext => self.move_cursor(1, self.visible_commands().len()),
            Action::CursorPrev => self.move_cursor(-1, self.visible_commands().len()),
            Action::ToggleProcess => {
                if let Some(name) = self.cursor_command() {
                    effects.push(Effect::Toggle(name));
                }
            }
            Action::StopProcess => {
                if let Some(name) = self.cursor_command() {
                    effects.push(Effect::Stop(name));
                }
            }
            Action::RestartProcess => {
                if let Some(name) = self.cursor_command() {
                    effects.push(Effect::Restart(name));
                }
            }
            Action::ToggleHidden => {
                if let Some(name) = self.cursor_command() {
                    if let Some(pane) = self.tree.find_mut(self.focused) {
                        pane.toggle_hidden(&name);
                    }
                    self.persist_layout();
                }
            }
            Action::ToggleScope => {
                if let Some(name) = self.cursor_command() {
                    if let Some(pane) = self.tree.find_mut(self.focused) {
                        pane.toggle_scope(&name);
                    }
                    self.persist_layout();
                }
            }
            Action::MoveProcessHere => {
                if let Some(name) = self.cursor_command() {
                    if self.tree.assign_process(self.focused, &name) {
                        self.persist_layout();
                    }
                }
            }
            Action::ToggleLineNumbers => {
                self.config.show_line_numbers = !self.config.show_line_numbers;
                self.save_config();
            }
            Action::ToggleTimestamps => {
                self.config.show_timestamps = !self.config.show_timestamps;
                self.save_config();
            }
            Action::GrowPane => {
                if self.tree.resize(self.focused, RESIZE_STEP) {
                    self.persist_layout();
                }
            }
            Action::ShrinkPane => {
                if self.tree.resize(self.focused, -RESIZE_STEP) {
                    self.persist_layout();
                }
            }
            Action::ScrollUp => self.scroll_focused(1),
            Action::ScrollDown => self.scroll_focused(-1),
            Action::PageUp => {
                let page = self.pane_inner_height(self.focused).max(1) as isize;
                self.scroll_focused(page);
            }
            Action::PageDown => {
                let page = self.pane_inner_height(self.focused).max(1) as isize;
                self.scroll_focused(-page);
            }
            Action::ScrollTop => self.scroll_focused(isize::MAX),
            Action::ScrollBottom => self.scroll_focused(isize::MIN),
            Action::ClearFilters => {
                if let Some(pane) = self.tree.find_mut(self.focused) {
                    pane.text_filter.clear();
                    pane.color_filter = None;
                    pane.paused = false;
                    pane.scroll_offset = 0;
                }
                self.persist_layout();
            }
            Action::Help => self.mode = Mode::Help,
        }
    }

    fn handle_key_input(&mut self, key: KeyEvent, effects: &mut Vec<Effect>) {
        match self.edit_input(&key) {
            InputOutcome::Editing => {}
            InputOutcome::Cancel => {
                self.input.clear();
                self.mode = Mode::Normal;
            }
            InputOutcome::Commit => {
                let text = std::mem::take(&mut self.input);
                match std::mem::replace(&mut self.mode, Mode::Normal) {
                    Mode::TextFilterInput => {
                        if let Some(pane) = self.tree.find_mut(self.focused) {
                            pane.text_filter = text.trim().to_string();
                            refreeze(pane);
                        }
                        self.persist_layout();
                    }
                    Mode::PaneNamingInput => {
                        let name = text.trim();
                        if !name.is_empty() {
                            if let Some(pane) = self.tree.find_mut(self.focused) {
                                pane.name = name.to_string();
                            }
                            self.persist_layout();
                        }
                    }
                    Mode::StdinInput { target } => {
                        effects.push(Effect::SendInput { name: target, text })
                    }
                    _ => {}
                }
            }
        }
    }

    fn handle_key_settings(&mut self, key: KeyEvent, mut state: SettingsState) {
        if let Some(capture) = state.capture.clone() {
            match capture {
                SettingsCapture::AddPattern => match self.edit_input(&key) {
                    InputOutcome::Editing => {}
                    InputOutcome::Cancel => {
                        self.input.clear();
                        state.capture = None;
                    }
                    InputOutcome::Commit => {
                        let pattern = std::mem::take(&mut self.input);
                        let added = match state.section {
                            SettingsSection::Include => self.config.add_include(&pattern),
                            SettingsSection::Ignore => self.config.add_ignore(&pattern),
                            _ => false,
                        };
                        if added {
                            self.save_config();
                            self.clamp_cursor();
                        }
                        state.capture = None;
                    }
                },
                SettingsCapture::AssignShortcut { command } => match key.code {
                    KeyCode::Esc => state.capture = None,
                    KeyCode::Char(ch)
                        if !ch.is_whitespace()
                            && !key.modifiers.intersects(KeyModifiers::CONTROL | KeyModifiers::ALT) =>
                    {
                        if Action::is_reserved(ch) {
                            self.status = format!("'{ch}' is a built-in key");
                        } else {
                            self.config.assign_shortcut(ch, &command);
                            self.save_config();
                            self.status = format!("'{ch}' runs {command}");
                            state.capture = None;
                        }
                    }
                    _ => {}
                },
            }
            self.mode = Mode::Settings(state);
            return;
        }

        let len = self.settings_len(state.section);
        match key.code {
            KeyCode::Esc | KeyCode::Char('q') | KeyCode::Char('o') => {
                self.mode = Mode::Normal;
                return;
            }
            KeyCode::Tab | KeyCode::Right => {
                state.section = state.section.step(1);
                state.selected = 0;
            }
            KeyCode::BackTab | KeyCode::Left => {
                state.section = state.section.step(-1);
                state.selected = 0;
            }
            KeyCode::Char('j') | KeyCode::Down if len > 0 => {
                state.selected = (state.selected + 1) % len;
            }
            KeyCode::Char('k') | KeyCode::Up if len > 0 => {
                state.selected = (state.selected + len - 1) % len;
            }
            KeyCode::Char('a')
                if matches!(state.section, SettingsSection::Include | SettingsSection::Ignore) =>
            {
                self.input.clear();
                state.capture = Some(SettingsCapture::AddPattern);
            }
            KeyCode::Char('d') | KeyCode::Delete => {
                let changed = match state.section {
                    SettingsSection::Include => self.config.remove_include(state.selected).is_some(),
                    SettingsSection::Ignore => self.config.remove_ignore(state.selected).is_some(),
                    SettingsSection::Shortcuts => match self.commands.get(state.selected) {
                        Some(command) => {
                            let name = command.name.clone();
                            self.config.remove_shortcut(&name)
                        }
                        None => false,
                    },
                    SettingsSection::Display => false,
                };
                if changed {
                    self.save_config();
                    self.clamp_cursor();
                }
                let len = self.settings_len(state.section);
                state.selected = state.selected.min(len.saturating_sub(1));
            }
            KeyCode::Enter => match state.section {
                SettingsSection::Shortcuts => {
                    if let Some(command) = self.commands.get(state.selected) {
                        state.capture = Some(SettingsCapture::AssignShortcut {
                            command: command.name.clone(),
                        });
                    }
                }
                SettingsSection::Display => {
                    if state.selected == 0 {
                        self.config.show_line_numbers = !self.config.show_line_numbers;
                    } else {
                        self.config.show_timestamps = !self.config.show_timestamps;
                    }
                    self.save_config();
                }
                SettingsSection::Include | SettingsSection::Ignore => {}
            },
            _ => {}
        }
        self.mode = Mode::Settings(state);
    }

    pub fn settings_len(&self, section: SettingsSection) -> usize {
        match section {
            SettingsSection::Include => self.config.include.as_ref().map_or(0, Vec::len),
            SettingsSection::Ignore => self.config.ignore.len(),
            SettingsSection::Shortcuts => self.commands.len(),
            SettingsSection::Display => 2,
        }
    }

    fn handle_key_help(&mut self, key: KeyEvent) {
        if matches!(
            key.code,
            KeyCode::Esc | KeyCode::Char('?') | KeyCode::Char('q') | KeyCode::Enter
        ) {
            self.mode = Mode::Normal;
        }
    }

    fn handle_key_one_off(&mut self, key: KeyEvent, effects: &mut Vec<Effect>) {
        if matches!(key.code, KeyCode::Esc | KeyCode::Char('q') | KeyCode::Enter) {
            self.mode = Mode::Normal;
            self.one_off = None;
            effects.push(Effect::CancelOneOff);
        }
    }

    fn handle_key_palette(&mut self, key: KeyEvent, selected: usize, effects: &mut Vec<Effect>) {
        let len = self.palette_matches().len();
        match key.code {
            KeyCode::Up => {
                self.mode = Mode::CommandPalette {
                    selected: selected.saturating_sub(1),
                }
            }
            KeyCode::Down => {
                self.mode = Mode::CommandPalette {
                    selected: (selected + 1).min(len.saturating_sub(1)),
                }
            }
            _ => match self.edit_input(&key) {
                InputOutcome::Editing => self.mode = Mode::CommandPalette { selected: 0 },
                InputOutcome::Cancel => {
                    self.input.clear();
                    self.mode = Mode::Normal;
                }
                InputOutcome::Commit => {
                    let action = self.palette_matches().get(selected).copied();
                    self.input.clear();
                    self.mode = Mode::Normal;
                    if let Some(action) = action {
                        self.perform(action, effects);
                    }
                }
            },
        }
    }

    fn handle_key_run_picker(&mut self, key: KeyEvent, selected: usize, effects: &mut Vec<Effect>) {
        let len = self.commands.len();
        match key.code {
            KeyCode::Esc | KeyCode::Char('q') => self.mode = Mode::Normal,
            KeyCode::Char('j') | KeyCode::Down if len > 0 => {
                self.mode = Mode::RunPicker {
                    selected: (selected + 1) % len,
                }
            }
            KeyCode::Char('k') | KeyCode::Up if len > 0 => {
                self.mode = Mode::RunPicker {
                    selected: (selected + len - 1) % len,
                }
            }
            KeyCode::Enter => {
                if let Some(command) = self.commands.get(selected) {
                    let name = command.name.clone();
                    self.open_one_off(name, effects);
                }
            }
            _ => {}
        }
    }

    fn edit_input(&mut self, key: &KeyEvent) -> InputOutcome {
        match key.code {
            KeyCode::Esc => InputOutcome::Cancel,
            KeyCode::Enter => InputOutcome::Commit,
            KeyCode::Backspace => {
                self.input.pop();
                InputOutcome::Editing
            }
            KeyCode::Char(ch)
                if !key.modifiers.intersects(KeyModifiers::CONTROL | KeyModifiers::ALT) =>
            {
                self.input.push(ch);
                InputOutcome::Editing
            }
            _ => InputOutcome::Editing,
        }
    }

    fn open_one_off(&mut self, name: String, effects: &mut Vec<Effect>) {
        self.one_off = Some(OneOffView {
            name: name.clone(),
            lines: VecDeque::new(),
            exit: None,
        });
        self.mode = Mode::OneOffOverlay;
        effects.push(Effect::ExecuteOnce(name));
    }

    fn split_focused(&mut self, direction: SplitDirection) {
        if let Some(id) = self.tree.split(self.focused, direction) {
            self.focused = id;
            self.persist_layout();
        }
    }

    fn close_focused(&mut self) {
        let fallback = self.tree.prev_id(self.focused);
        match self.tree.close(self.focused) {
            CloseOutcome::Closed => {
                self.focused = if self.tree.find(fallback).is_some() {
                    fallback
                } else {
                    self.tree.first_id()
                };
                self.persist_layout();
            }
            CloseOutcome::LastPane => self.status = "Cannot close the last pane".to_string(),
            CloseOutcome::NotFound => self.focused = self.tree.first_id(),
        }
    }

    /// Positive `delta` scrolls towards older lines and freezes the pane;
    /// reaching the bottom again unfreezes it.
    fn scroll_focused(&mut self, delta: isize) {
        let height = self.pane_inner_height(self.focused);
        let total = self.pane_lines(self.focused).len();
        let max = filter::max_scroll(total, height);
        let Some(pane) = self.tree.find_mut(self.focused) else {
            return;
        };
        let current = if pane.paused {
            pane.scroll_offset.min(max)
        } else {
            0
        };
        let next = current.saturating_add_signed(delta).min(max);
        if next > 0 {
            pane.paused = true;
            pane.scroll_offset = next;
        } else if delta < 0 {
            pane.paused = false;
            pane.scroll_offset = 0;
        }
    }

    fn sync_stream_pause(&mut self, effects: &mut Vec<Effect>) {
        let all_paused = self.tree.panes().iter().all(|pane| pane.paused);
        if all_paused != self.streams_paused {
            self.streams_paused = all_paused;
            effects.push(if all_paused {
                Effect::PauseStreams
            } else {
                Effect::ResumeStreams
            });
        }
    }

    fn move_cursor(&mut self, delta: isize, len: usize) {
        if len == 0 {
            self.cursor = 0;
            return;
        }
        let len = len as isize;
        self.cursor = (self.cursor.min(len as usize - 1) as isize + delta).rem_euclid(len) as usize;
    }

    fn clamp_cursor(&mut self) {
        let len = self.visible_commands().len();
        self.cursor = self.cursor.min(len.saturating_sub(1));
    }

    fn reset_countdown(&mut self) {
        self.countdown = self.config.countdown();
    }

    /// Saves the checked commands in manifest order and returns them.
    fn persist_selection(&mut self) -> Vec<String> {
        let names: Vec<String> = self
            .visible_commands()
            .into_iter()
            .filter(|command| self.selection.contains(&command.name))
            .map(|command| command.name.clone())
            .collect();
        self.config.default_selection = names.clone();
        self.save_config();
        names
    }

    fn persist_layout(&mut self) {
        self.config.pane_layout = self.tree.to_value();
        self.save_config();
    }

    fn save_config(&mut self) {
        if let Err(err) = self.config.save(&self.config_path) {
            warn!("config_save_failed: {}: {err}", self.config_path.display());
            self.status = format!("Failed to save config: {err}");
        }
    }
}

/// A filter engages the freeze; clearing every filter releases it.
fn refreeze(pane: &mut startall_core::Pane) {
    if pane.has_filters() {
        pane.paused = true;
    } else {
        pane.paused = false;
        pane.scroll_offset = 0;
    }
}

/// Case-insensitive subsequence match; an empty query matches everything.
fn fuzzy_match(label: &str, query: &str) -> bool {
    let mut chars = label.chars().flat_map(char::to_lowercase);
    query
        .chars()
        .filter(|ch| !ch.is_whitespace())
        .all(|wanted| chars.any(|ch| ch == wanted))
}

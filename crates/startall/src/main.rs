mod app;
mod supervisor;
mod theme;
mod ui;

use anyhow::{Context, Result};
use app::{App, Effect};
use clap::Parser;
use crossterm::{
    event::{Event, EventStream},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use futures_util::StreamExt;
use ratatui::{backend::CrosstermBackend, Terminal};
use startall_core::{config::DEFAULT_CONFIG_FILE, manifest, Config};
use std::{
    fs::OpenOptions,
    io::{self, Stdout},
    path::PathBuf,
    sync::Mutex,
    time::Duration,
};
use supervisor::{ProcessEvent, Supervisor, SupervisorSettings, DEFAULT_KILL_GRACE};
use tokio::{
    sync::mpsc,
    time::{Instant, MissedTickBehavior},
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const RENDER_INTERVAL: Duration = Duration::from_millis(16);
const COUNTDOWN_INTERVAL: Duration = Duration::from_secs(1);
const MAX_EVENTS_PER_TURN: usize = 512;
const LOG_FILE_ENV: &str = "STARTALL_LOG_FILE";

#[derive(Parser, Debug)]
#[command(name = "startall")]
#[command(about = "Run every package.json script side by side in one terminal", long_about = None)]
struct Args {
    /// Config file holding selection, patterns, shortcuts and layout.
    #[arg(default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
}

type Tui = Terminal<CrosstermBackend<Stdout>>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();

    let root = std::env::current_dir().context("resolve working directory")?;
    let commands = match manifest::load_commands(&root) {
        Ok(commands) => commands,
        Err(err) => {
            eprintln!("startall: {err}");
            std::process::exit(1);
        }
    };
    let config = Config::load(&args.config);
    info!(
        "startup: {} commands, config {}",
        commands.len(),
        args.config.display()
    );

    let settings = SupervisorSettings {
        restart_delay: config.restart_delay(),
        kill_grace: DEFAULT_KILL_GRACE,
    };
    let (mut supervisor, mut process_rx) = Supervisor::new(commands.clone(), settings);
    let mut app = App::new(commands, config, args.config);

    let mut terminal = setup_terminal()?;
    let result = run(&mut terminal, &mut app, &mut supervisor, &mut process_rx).await;
    supervisor.shutdown_all();
    restore_terminal(&mut terminal)?;
    result
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_file = std::env::var(LOG_FILE_ENV)
        .ok()
        .filter(|path| !path.trim().is_empty())
        .and_then(|path| OpenOptions::new().create(true).append(true).open(path).ok());
    match log_file {
        Some(file) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::sink)
                .try_init();
        }
    }
}

fn setup_terminal() -> Result<Tui> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    Ok(Terminal::new(backend)?)
}

fn restore_terminal(terminal: &mut Tui) -> Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

async fn run(
    terminal: &mut Tui,
    app: &mut App,
    supervisor: &mut Supervisor,
    process_rx: &mut mpsc::UnboundedReceiver<ProcessEvent>,
) -> Result<()> {
    let mut events = EventStream::new();
    let mut countdown = tokio::time::interval_at(Instant::now() + COUNTDOWN_INTERVAL, COUNTDOWN_INTERVAL);
    let mut render = tokio::time::interval(RENDER_INTERVAL);
    render.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut signals = TerminationSignals::new()?;
    let size = terminal.size()?;
    app.set_viewport(size.width, size.height);

    loop {
        tokio::select! {
            maybe_event = events.next() => {
                match maybe_event {
                    Some(Ok(Event::Key(key))) => {
                        let effects = app.handle_key(key);
                        if apply_effects(app, supervisor, effects) {
                            break;
                        }
                    }
                    Some(Ok(Event::Resize(width, height))) => app.set_viewport(width, height),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => warn!("input_error: {err}"),
                    None => break,
                }
            }
            Some(event) = process_rx.recv() => {
                drain_process_events(app, supervisor, process_rx, event);
            }
            _ = countdown.tick() => {
                let effects = app.tick_countdown();
                if apply_effects(app, supervisor, effects) {
                    break;
                }
            }
            _ = render.tick() => {
                if app.dirty {
                    terminal.draw(|frame| ui::render(frame, app))?;
                    app.dirty = false;
                }
            }
            _ = signals.recv() => {
                info!("termination_signal: shutting down");
                break;
            }
        }
    }
    Ok(())
}

/// Folds a burst of process events in one turn so heavy output does not
/// starve input handling.
fn drain_process_events(
    app: &mut App,
    supervisor: &mut Supervisor,
    process_rx: &mut mpsc::UnboundedReceiver<ProcessEvent>,
    first: ProcessEvent,
) {
    let mut next = Some(first);
    let mut handled = 0;
    while let Some(event) = next.take() {
        if let Some(output) = supervisor.handle(event) {
            app.ingest(output);
        }
        handled += 1;
        if handled < MAX_EVENTS_PER_TURN {
            next = process_rx.try_recv().ok();
        }
    }
    app.set_states(supervisor.states().clone());
}

/// Runs state-machine effects against the supervisor. Returns true when the
/// session should end.
fn apply_effects(app: &mut App, supervisor: &mut Supervisor, effects: Vec<Effect>) -> bool {
    let mut quit = false;
    for effect in effects {
        match effect {
            Effect::Start(name) => supervisor.start(&name),
            Effect::Stop(name) => supervisor.stop(&name),
            Effect::Restart(name) => supervisor.restart(&name),
            Effect::Toggle(name) => supervisor.toggle(&name),
            Effect::SendInput { name, text } => supervisor.send_input(&name, &text),
            Effect::ExecuteOnce(name) => {
                if !supervisor.execute_once(&name) {
                    app.status = format!("Unknown command {name}");
                }
            }
            Effect::CancelOneOff => supervisor.cancel_one_off(),
            Effect::PauseStreams => supervisor.pause_streams(),
            Effect::ResumeStreams => supervisor.resume_streams(),
            Effect::Quit => quit = true,
        }
    }
    app.set_states(supervisor.states().clone());
    quit
}

struct TerminationSignals {
    #[cfg(unix)]
    term: tokio::signal::unix::Signal,
    #[cfg(unix)]
    hup: tokio::signal::unix::Signal,
}

impl TerminationSignals {
    #[cfg(unix)]
    fn new() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            term: signal(SignalKind::terminate())?,
            hup: signal(SignalKind::hangup())?,
        })
    }

    #[cfg(not(unix))]
    fn new() -> io::Result<Self> {
        Ok(Self {})
    }

    async fn recv(&mut self) {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = self.term.recv() => {}
                _ = self.hup.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
    use startall_core::{Command, RunStatus};
    use tokio::time::timeout;

    fn sleeper(name: &str) -> Command {
        Command {
            name: name.to_string(),
            display_name: name.to_string(),
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "sleep 30".to_string()],
            cwd: std::env::temp_dir(),
        }
    }

    fn press(app: &mut App, supervisor: &mut Supervisor, ch: char) -> bool {
        let effects = app.handle_key(KeyEvent::new(KeyCode::Char(ch), KeyModifiers::NONE));
        apply_effects(app, supervisor, effects)
    }

    #[tokio::test]
    async fn web_api_db_session() {
        let dir = tempfile::tempdir().expect("temp dir");
        let commands = vec![sleeper("web"), sleeper("api"), sleeper("db")];
        let config = Config {
            countdown_seconds: Some(1),
            ..Config::default()
        };
        let (mut supervisor, mut process_rx) =
            Supervisor::new(commands.clone(), SupervisorSettings::default());
        let mut app = App::new(commands, config, dir.path().join("startall.json"));

        let effects = app.tick_countdown();
        assert!(!apply_effects(&mut app, &mut supervisor, effects));
        for name in ["web", "api", "db"] {
            assert_eq!(app.state(name).status, RunStatus::Running, "{name}");
        }

        let original = app.focused;
        press(&mut app, &mut supervisor, '|');
        let fresh = app.focused;
        press(&mut app, &mut supervisor, 'j');
        press(&mut app, &mut supervisor, 'j');
        press(&mut app, &mut supervisor, 'm');
        press(&mut app, &mut supervisor, 'k');
        press(&mut app, &mut supervisor, 's');

        assert_eq!(app.state("api").status, RunStatus::Stopped);
        assert_eq!(app.state("web").status, RunStatus::Running);
        assert_eq!(app.state("db").status, RunStatus::Running);

        let deadline = Instant::now() + Duration::from_secs(3);
        while !app
            .pane_lines(original)
            .iter()
            .any(|line| line.source == "api" && line.text == "Process stopped")
        {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Ok(Some(event)) = timeout(remaining, process_rx.recv()).await else {
                break;
            };
            drain_process_events(&mut app, &mut supervisor, &mut process_rx, event);
        }
        assert!(app
            .pane_lines(original)
            .iter()
            .any(|line| line.source == "api" && line.text == "Process stopped"));
        assert!(app.pane_lines(fresh).iter().all(|line| line.source == "db"));
        assert_eq!(app.state("web").status, RunStatus::Running);

        assert!(press(&mut app, &mut supervisor, 'q'));
        supervisor.shutdown_all();
        assert_eq!(supervisor.running_count(), 0);
    }
}

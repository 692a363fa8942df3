use startall_core::{config::DEFAULT_RESTART_DELAY_MS, Command, RunState, RunStatus};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::process::Stdio;
use std::time::Duration;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin},
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(1500);
/// How long an exited process's readers may keep draining its pipes before
/// the exit is reported anyway. Only counted while streams are live.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(1000);

/// Raw notifications from process tasks, folded into state by
/// [`Supervisor::handle`] on the main loop.
#[derive(Debug)]
pub enum ProcessEvent {
    Output {
        name: String,
        text: String,
    },
    Exited {
        name: String,
        generation: u64,
        code: Option<i32>,
    },
    /// The process itself is gone; its readers may still be draining.
    Reaped {
        name: String,
        generation: u64,
    },
    RestartDue {
        name: String,
    },
    OneOffOutput {
        id: u64,
        text: String,
    },
    OneOffExited {
        id: u64,
        code: Option<i32>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorOutput {
    Log { source: String, text: String },
    OneOffLine(String),
    OneOffExited(Option<i32>),
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    pub restart_delay: Duration,
    pub kill_grace: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            restart_delay: Duration::from_millis(DEFAULT_RESTART_DELAY_MS),
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }
}

struct LiveProcess {
    generation: u64,
    pid: Option<u32>,
    reaped: bool,
    stdin_tx: Option<mpsc::UnboundedSender<String>>,
    kill_tx: Option<oneshot::Sender<()>>,
}

struct OneOffProcess {
    id: u64,
    name: String,
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
}

#[derive(Clone)]
enum Origin {
    Command { name: String, generation: u64 },
    OneOff { id: u64 },
}

impl Origin {
    fn line(&self, text: String) -> ProcessEvent {
        match self {
            Origin::Command { name, .. } => ProcessEvent::Output {
                name: name.clone(),
                text,
            },
            Origin::OneOff { id } => ProcessEvent::OneOffOutput { id: *id, text },
        }
    }

    fn exited(&self, code: Option<i32>) -> ProcessEvent {
        match self {
            Origin::Command { name, generation } => ProcessEvent::Exited {
                name: name.clone(),
                generation: *generation,
                code,
            },
            Origin::OneOff { id } => ProcessEvent::OneOffExited { id: *id, code },
        }
    }

    fn reaped(&self) -> Option<ProcessEvent> {
        match self {
            Origin::Command { name, generation } => Some(ProcessEvent::Reaped {
                name: name.clone(),
                generation: *generation,
            }),
            Origin::OneOff { .. } => None,
        }
    }
}

/// Owns every supervised command's process handle and [`RunState`].
///
/// Operations never block and never fail outward: spawn errors become a
/// `crashed` state, signal errors escalate to a kill, and everything the
/// operator should see is emitted as a synthetic log line.
pub struct Supervisor {
    commands: Vec<Command>,
    states: BTreeMap<String, RunState>,
    live: HashMap<String, LiveProcess>,
    /// Generations that were signalled to stop and have not exited yet.
    stopping: HashMap<String, u64>,
    pending_restarts: HashSet<String>,
    one_off: Option<OneOffProcess>,
    next_generation: u64,
    next_one_off: u64,
    paused_tx: watch::Sender<bool>,
    events_tx: mpsc::UnboundedSender<ProcessEvent>,
    settings: SupervisorSettings,
}

impl Supervisor {
    pub fn new(
        commands: Vec<Command>,
        settings: SupervisorSettings,
    ) -> (Self, mpsc::UnboundedReceiver<ProcessEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (paused_tx, _) = watch::channel(false);
        let supervisor = Self {
            commands,
            states: BTreeMap::new(),
            live: HashMap::new(),
            stopping: HashMap::new(),
            pending_restarts: HashSet::new(),
            one_off: None,
            next_generation: 0,
            next_one_off: 0,
            paused_tx,
            events_tx,
            settings,
        };
        (supervisor, events_rx)
    }

    pub fn command(&self, name: &str) -> Option<&Command> {
        self.commands.iter().find(|command| command.name == name)
    }

    pub fn state(&self, name: &str) -> RunState {
        self.states.get(name).cloned().unwrap_or_default()
    }

    pub fn states(&self) -> &BTreeMap<String, RunState> {
        &self.states
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.live.contains_key(name)
    }

    pub fn streams_paused(&self) -> bool {
        *self.paused_tx.borrow()
    }

    /// Spawns `name` unless it is already running. While a previous
    /// instance is still shutting down the start is deferred until it exits.
    pub fn start(&mut self, name: &str) {
        if self.is_running(name) {
            return;
        }
        if self.stopping.contains_key(name) {
            debug!("start_deferred: {name}");
            self.pending_restarts.insert(name.to_string());
            return;
        }
        self.pending_restarts.remove(name);
        let Some(command) = self.command(name).cloned() else {
            warn!("start_unknown_command: {name}");
            return;
        };
        let mut child = match build_process(&command).spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!("spawn_failed: {name}: {err}");
                self.states.insert(name.to_string(), RunState::finished(None));
                self.notice(name, format!("Failed to start: {err}"));
                return;
            }
        };
        self.next_generation += 1;
        let origin = Origin::Command {
            name: name.to_string(),
            generation: self.next_generation,
        };
        let pid = child.id();
        let paused = self.paused_tx.subscribe();
        let readers = self.attach_readers(&mut child, &origin, Some(paused.clone()));
        let stdin_tx = child.stdin.take().map(|stdin| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(write_stdin(
                stdin,
                rx,
                name.to_string(),
                self.events_tx.clone(),
            ));
            tx
        });
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(wait_for_exit(
            child,
            kill_rx,
            readers,
            Some(paused),
            origin,
            self.events_tx.clone(),
        ));
        self.live.insert(
            name.to_string(),
            LiveProcess {
                generation: self.next_generation,
                pid,
                reaped: false,
                stdin_tx,
                kill_tx: Some(kill_tx),
            },
        );
        self.states.insert(name.to_string(), RunState::running(pid));
        info!("process_started: {name} pid={pid:?}");
    }

    /// Terminates the command's whole process group, escalating to a kill
    /// after the grace period.
    pub fn stop(&mut self, name: &str) {
        self.pending_restarts.remove(name);
        let Some(mut live) = self.live.remove(name) else {
            return;
        };
        terminate(live.pid, live.kill_tx.take(), self.settings.kill_grace);
        if !live.reaped {
            self.stopping.insert(name.to_string(), live.generation);
        }
        self.states.insert(
            name.to_string(),
            RunState {
                status: RunStatus::Stopped,
                pid: None,
                exit_code: None,
            },
        );
        self.notice(name, "Process stopped".to_string());
        info!("process_stopped: {name}");
    }

    /// Stops now and starts again once the old instance has exited and the
    /// restart delay has passed, so the two never overlap.
    pub fn restart(&mut self, name: &str) {
        if self.command(name).is_none() {
            return;
        }
        self.stop(name);
        self.pending_restarts.insert(name.to_string());
        if !self.stopping.contains_key(name) {
            self.schedule_restart(name);
        }
    }

    fn schedule_restart(&self, name: &str) {
        let events_tx = self.events_tx.clone();
        let delay = self.settings.restart_delay;
        let name = name.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events_tx.send(ProcessEvent::RestartDue { name });
        });
    }

    pub fn toggle(&mut self, name: &str) {
        if self.is_running(name) {
            self.stop(name);
        } else {
            self.start(name);
        }
    }

    pub fn send_input(&mut self, name: &str, text: &str) {
        let Some(stdin_tx) = self.live.get(name).and_then(|live| live.stdin_tx.as_ref()) else {
            return;
        };
        if stdin_tx.send(text.to_string()).is_ok() {
            self.notice(name, format!("> {text}"));
        }
    }

    /// Runs `name` once outside the persistent set. Output goes to the
    /// one-off sink; a previous one-off is killed first.
    pub fn execute_once(&mut self, name: &str) -> bool {
        let Some(command) = self.command(name).cloned() else {
            return false;
        };
        self.cancel_one_off();
        self.next_one_off += 1;
        let id = self.next_one_off;
        let origin = Origin::OneOff { id };
        let mut child = match build_process(&command).spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!("one_off_spawn_failed: {name}: {err}");
                let _ = self.events_tx.send(origin.line(format!("Failed to start: {err}")));
                let _ = self.events_tx.send(origin.exited(None));
                self.one_off = Some(OneOffProcess {
                    id,
                    name: name.to_string(),
                    pid: None,
                    kill_tx: None,
                });
                return true;
            }
        };
        let pid = child.id();
        drop(child.stdin.take());
        let readers = self.attach_readers(&mut child, &origin, None);
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(wait_for_exit(
            child,
            kill_rx,
            readers,
            None,
            origin,
            self.events_tx.clone(),
        ));
        self.one_off = Some(OneOffProcess {
            id,
            name: name.to_string(),
            pid,
            kill_tx: Some(kill_tx),
        });
        info!("one_off_started: {name} pid={pid:?}");
        true
    }

    pub fn cancel_one_off(&mut self) {
        if let Some(mut one_off) = self.one_off.take() {
            force_kill(one_off.pid, one_off.kill_tx.take());
            debug!("one_off_cancelled: {}", one_off.name);
        }
    }

    pub fn pause_streams(&mut self) {
        self.paused_tx.send_replace(true);
    }

    pub fn resume_streams(&mut self) {
        self.paused_tx.send_replace(false);
    }

    /// Kills every process group immediately. Safe to call repeatedly.
    pub fn shutdown_all(&mut self) {
        self.pending_restarts.clear();
        self.stopping.clear();
        for (name, mut live) in self.live.drain() {
            force_kill(live.pid, live.kill_tx.take());
            self.states.insert(
                name,
                RunState {
                    status: RunStatus::Stopped,
                    pid: None,
                    exit_code: None,
                },
            );
        }
        self.cancel_one_off();
    }

    pub fn handle(&mut self, event: ProcessEvent) -> Option<SupervisorOutput> {
        match event {
            ProcessEvent::Output { name, text } => Some(SupervisorOutput::Log { source: name, text }),
            ProcessEvent::Exited {
                name,
                generation,
                code,
            } => {
                let current = self
                    .live
                    .get(&name)
                    .is_some_and(|live| live.generation == generation);
                if !current {
                    debug!("stale_exit_ignored: {name} generation={generation}");
                    return None;
                }
                self.live.remove(&name);
                self.states.insert(name.clone(), RunState::finished(code));
                info!("process_exited: {name} code={code:?}");
                Some(SupervisorOutput::Log {
                    source: name,
                    text: exit_message(code),
                })
            }
            ProcessEvent::Reaped { name, generation } => {
                if let Some(live) = self
                    .live
                    .get_mut(&name)
                    .filter(|live| live.generation == generation)
                {
                    live.reaped = true;
                } else if self.stopping.get(&name) == Some(&generation) {
                    self.stopping.remove(&name);
                    debug!("stopped_process_reaped: {name} generation={generation}");
                    if self.pending_restarts.contains(&name) {
                        self.schedule_restart(&name);
                    }
                }
                None
            }
            ProcessEvent::RestartDue { name } => {
                if self.pending_restarts.remove(&name) {
                    self.start(&name);
                }
                None
            }
            ProcessEvent::OneOffOutput { id, text } => self
                .one_off
                .as_ref()
                .filter(|one_off| one_off.id == id)
                .map(|_| SupervisorOutput::OneOffLine(text)),
            ProcessEvent::OneOffExited { id, code } => {
                let one_off = self.one_off.as_mut().filter(|one_off| one_off.id == id)?;
                one_off.pid = None;
                one_off.kill_tx = None;
                Some(SupervisorOutput::OneOffExited(code))
            }
        }
    }

    fn attach_readers(
        &self,
        child: &mut Child,
        origin: &Origin,
        paused: Option<watch::Receiver<bool>>,
    ) -> Vec<JoinHandle<()>> {
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump_lines(
                stdout,
                origin.clone(),
                self.events_tx.clone(),
                paused.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump_lines(
                stderr,
                origin.clone(),
                self.events_tx.clone(),
                paused,
            )));
        }
        readers
    }

    fn notice(&self, name: &str, text: String) {
        let _ = self.events_tx.send(ProcessEvent::Output {
            name: name.to_string(),
            text,
        });
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}

fn exit_message(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("Process exited with code {code}"),
        None => "Process terminated by signal".to_string(),
    }
}

fn build_process(command: &Command) -> tokio::process::Command {
    let mut process = std::process::Command::new(&command.program);
    process
        .args(&command.args)
        .current_dir(&command.cwd)
        .env("FORCE_COLOR", "1")
        .env("CLICOLOR_FORCE", "1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        process.process_group(0);
    }
    tokio::process::Command::from(process)
}

/// Forwards non-blank lines. While `paused` is set the stream is not read at
/// all, so output backs up in the pipe instead of in memory.
async fn pump_lines<R>(
    reader: R,
    origin: Origin,
    events_tx: mpsc::UnboundedSender<ProcessEvent>,
    mut paused: Option<watch::Receiver<bool>>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        if let Some(paused) = paused.as_mut() {
            if paused.wait_for(|paused| !*paused).await.is_err() {
                break;
            }
        }
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                if line.trim().is_empty() {
                    continue;
                }
                if events_tx.send(origin.line(line.to_string())).is_err() {
                    break;
                }
            }
        }
    }
}

async fn write_stdin(
    mut stdin: ChildStdin,
    mut rx: mpsc::UnboundedReceiver<String>,
    name: String,
    events_tx: mpsc::UnboundedSender<ProcessEvent>,
) {
    while let Some(text) = rx.recv().await {
        let mut payload = text.into_bytes();
        payload.push(b'\n');
        let result = match stdin.write_all(&payload).await {
            Ok(()) => stdin.flush().await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            warn!("stdin_write_failed: {name}: {err}");
            let _ = events_tx.send(ProcessEvent::Output {
                name: name.clone(),
                text: format!("[stdin error: {err}]"),
            });
            break;
        }
    }
}

/// Reports the exit only after the readers have forwarded everything the
/// process wrote, so the exit line is the last line of that run.
async fn wait_for_exit(
    mut child: Child,
    mut kill_rx: oneshot::Receiver<()>,
    readers: Vec<JoinHandle<()>>,
    paused: Option<watch::Receiver<bool>>,
    origin: Origin,
    events_tx: mpsc::UnboundedSender<ProcessEvent>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = &mut kill_rx => {
            let _ = child.start_kill();
            child.wait().await
        }
    };
    if let Some(reaped) = origin.reaped() {
        let _ = events_tx.send(reaped);
    }
    drain_readers(readers, paused).await;
    let code = status.ok().and_then(|status| status.code());
    let _ = events_tx.send(origin.exited(code));
}

/// Waits for each reader to hit end of stream. Paused time does not count
/// toward the timeout; a reader still blocked afterwards (a background
/// grandchild holding the pipe) is left running.
async fn drain_readers(readers: Vec<JoinHandle<()>>, mut paused: Option<watch::Receiver<bool>>) {
    for mut reader in readers {
        loop {
            if let Some(paused) = paused.as_mut() {
                if paused.wait_for(|paused| !*paused).await.is_err() {
                    return;
                }
            }
            if tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut reader).await.is_ok() {
                break;
            }
            let still_paused = paused.as_ref().is_some_and(|paused| *paused.borrow());
            if !still_paused {
                debug!("reader_drain_timeout");
                break;
            }
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) with a negative pid targets the process group created
    // for this child by `process_group(0)`.
    unsafe { libc::kill(-pid, signal) == 0 }
}

fn terminate(pid: Option<u32>, kill_tx: Option<oneshot::Sender<()>>, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        if signal_group(pid, libc::SIGTERM) {
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                if signal_group(pid, 0) {
                    debug!("kill_escalated: pid={pid}");
                    signal_group(pid, libc::SIGKILL);
                }
                if let Some(kill_tx) = kill_tx {
                    let _ = kill_tx.send(());
                }
            });
            return;
        }
    }
    #[cfg(not(unix))]
    let _ = (pid, grace);
    if let Some(kill_tx) = kill_tx {
        let _ = kill_tx.send(());
    }
}

fn force_kill(pid: Option<u32>, kill_tx: Option<oneshot::Sender<()>>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        signal_group(pid, libc::SIGKILL);
    }
    #[cfg(not(unix))]
    let _ = pid;
    if let Some(kill_tx) = kill_tx {
        let _ = kill_tx.send(());
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::time::{timeout, Instant};

    impl Supervisor {
        pub(crate) fn running_count(&self) -> usize {
            self.live.len()
        }

        pub(crate) fn one_off_name(&self) -> Option<&str> {
            self.one_off.as_ref().map(|one_off| one_off.name.as_str())
        }
    }

    fn sh(name: &str, script: &str) -> Command {
        Command {
            name: name.to_string(),
            display_name: name.to_string(),
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: std::env::temp_dir(),
        }
    }

    fn supervisor(commands: Vec<Command>) -> (Supervisor, mpsc::UnboundedReceiver<ProcessEvent>) {
        Supervisor::new(
            commands,
            SupervisorSettings {
                restart_delay: Duration::from_millis(50),
                kill_grace: Duration::from_millis(300),
            },
        )
    }

    /// Feeds events through the supervisor until `done` holds or the
    /// deadline passes; returns every output seen.
    async fn pump_until<F>(
        sup: &mut Supervisor,
        rx: &mut mpsc::UnboundedReceiver<ProcessEvent>,
        within: Duration,
        mut done: F,
    ) -> Vec<SupervisorOutput>
    where
        F: FnMut(&Supervisor, &[SupervisorOutput]) -> bool,
    {
        let deadline = Instant::now() + within;
        let mut seen = Vec::new();
        while !done(sup, &seen) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, rx.recv()).await {
                Ok(Some(event)) => {
                    if let Some(output) = sup.handle(event) {
                        seen.push(output);
                    }
                }
                _ => break,
            }
        }
        seen
    }

    fn log(source: &str, text: &str) -> SupervisorOutput {
        SupervisorOutput::Log {
            source: source.to_string(),
            text: text.to_string(),
        }
    }

    fn group_alive(pid: u32) -> bool {
        signal_group(pid, 0)
    }

    #[tokio::test]
    async fn clean_exit_records_exited_and_skips_blank_lines() {
        let (mut sup, mut rx) = supervisor(vec![sh("web", "printf 'hello\\n\\n  \\nworld\\n'")]);
        sup.start("web");
        assert_eq!(sup.state("web").status, RunStatus::Running);
        assert!(sup.state("web").pid.is_some());
        let seen = pump_until(&mut sup, &mut rx, Duration::from_secs(5), |sup, _| {
            sup.state("web").status == RunStatus::Exited
        })
        .await;
        assert_eq!(
            seen,
            vec![
                log("web", "hello"),
                log("web", "world"),
                log("web", "Process exited with code 0"),
            ]
        );
        assert_eq!(sup.state("web").exit_code, Some(0));
        assert_eq!(sup.state("web").pid, None);
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_crash() {
        let (mut sup, mut rx) = supervisor(vec![sh("api", "echo boom >&2; exit 3")]);
        sup.start("api");
        let seen = pump_until(&mut sup, &mut rx, Duration::from_secs(5), |sup, _| {
            sup.state("api").status == RunStatus::Crashed
        })
        .await;
        assert!(seen.contains(&log("api", "boom")));
        assert_eq!(sup.state("api").exit_code, Some(3));
    }

    #[tokio::test]
    async fn spawn_failure_is_crashed_without_pid() {
        let mut command = sh("ghost", "");
        command.program = "/nonexistent/startall-missing-binary".to_string();
        let (mut sup, mut rx) = supervisor(vec![command]);
        sup.start("ghost");
        let state = sup.state("ghost");
        assert_eq!(state.status, RunStatus::Crashed);
        assert_eq!(state.pid, None);
        assert!(!sup.is_running("ghost"));
        let seen = pump_until(&mut sup, &mut rx, Duration::from_secs(1), |_, seen| !seen.is_empty()).await;
        assert!(matches!(&seen[0], SupervisorOutput::Log { text, .. } if text.starts_with("Failed to start")));
    }

    #[tokio::test]
    async fn start_is_a_no_op_while_running() {
        let (mut sup, _rx) = supervisor(vec![sh("db", "sleep 30")]);
        sup.start("db");
        let pid = sup.state("db").pid;
        sup.start("db");
        assert_eq!(sup.state("db").pid, pid);
        assert_eq!(sup.running_count(), 1);
        sup.shutdown_all();
    }

    #[tokio::test]
    async fn stop_kills_the_whole_process_group() {
        let (mut sup, mut rx) = supervisor(vec![sh("web", "sleep 30 & sleep 30; wait")]);
        sup.start("web");
        let pid = sup.state("web").pid.expect("pid");
        tokio::time::sleep(Duration::from_millis(100)).await;
        sup.stop("web");
        assert_eq!(sup.state("web").status, RunStatus::Stopped);
        sup.stop("web");

        let seen = pump_until(&mut sup, &mut rx, Duration::from_secs(3), |_, _| !group_alive(pid)).await;
        assert!(!group_alive(pid), "process group survived stop");
        assert_eq!(
            seen.iter().filter(|o| **o == log("web", "Process stopped")).count(),
            1
        );
        assert!(!seen
            .iter()
            .any(|o| matches!(o, SupervisorOutput::Log { text, .. } if text.starts_with("Process exited"))));
        assert_eq!(sup.state("web").status, RunStatus::Stopped);
    }

    #[tokio::test]
    async fn stubborn_process_is_killed_after_grace() {
        let (mut sup, mut rx) = supervisor(vec![sh("api", "trap '' TERM; sleep 30 & wait; sleep 30")]);
        sup.start("api");
        let pid = sup.state("api").pid.expect("pid");
        tokio::time::sleep(Duration::from_millis(100)).await;
        sup.stop("api");
        pump_until(&mut sup, &mut rx, Duration::from_secs(5), |_, _| !group_alive(pid)).await;
        assert!(!group_alive(pid));
    }

    #[tokio::test]
    async fn restart_stops_once_then_starts_once() {
        let (mut sup, mut rx) = supervisor(vec![sh("x", "sleep 30")]);
        sup.start("x");
        let first = sup.state("x").pid.expect("pid");
        sup.restart("x");
        assert_eq!(sup.state("x").status, RunStatus::Stopped);
        assert_eq!(sup.running_count(), 0);
        sup.restart("x");

        let seen = pump_until(&mut sup, &mut rx, Duration::from_secs(2), |_, _| false).await;
        assert_eq!(sup.state("x").status, RunStatus::Running);
        assert_eq!(sup.running_count(), 1);
        assert_ne!(sup.state("x").pid, Some(first));
        assert_eq!(
            seen.iter().filter(|o| **o == log("x", "Process stopped")).count(),
            1
        );
        sup.shutdown_all();
    }

    #[tokio::test]
    async fn stop_cancels_pending_restart() {
        let (mut sup, mut rx) = supervisor(vec![sh("x", "sleep 30")]);
        sup.start("x");
        sup.restart("x");
        sup.stop("x");
        pump_until(&mut sup, &mut rx, Duration::from_millis(400), |_, _| false).await;
        assert_eq!(sup.state("x").status, RunStatus::Stopped);
        assert_eq!(sup.running_count(), 0);
    }

    #[tokio::test]
    async fn send_input_reaches_stdin_and_echoes() {
        let (mut sup, mut rx) = supervisor(vec![sh("repl", "read line; echo \"got $line\"")]);
        sup.start("repl");
        sup.send_input("repl", "ping");
        let seen = pump_until(&mut sup, &mut rx, Duration::from_secs(5), |sup, _| {
            sup.state("repl").status == RunStatus::Exited
        })
        .await;
        assert_eq!(seen[0], log("repl", "> ping"));
        assert!(seen.contains(&log("repl", "got ping")));
    }

    #[tokio::test]
    async fn send_input_to_stopped_command_is_dropped() {
        let (mut sup, mut rx) = supervisor(vec![sh("repl", "cat")]);
        sup.send_input("repl", "ignored");
        let seen = pump_until(&mut sup, &mut rx, Duration::from_millis(200), |_, _| false).await;
        assert!(seen.is_empty());
    }

    #[tokio::test]
    async fn paused_streams_hold_output_until_resumed() {
        let (mut sup, mut rx) = supervisor(vec![sh("web", "echo late")]);
        sup.pause_streams();
        sup.start("web");
        let seen = pump_until(&mut sup, &mut rx, Duration::from_millis(500), |_, _| false).await;
        assert!(!seen.contains(&log("web", "late")));
        assert!(sup.streams_paused());

        sup.resume_streams();
        let seen = pump_until(&mut sup, &mut rx, Duration::from_secs(5), |_, seen| {
            seen.contains(&log("web", "late"))
        })
        .await;
        assert!(seen.contains(&log("web", "late")));
    }

    #[tokio::test]
    async fn exit_line_follows_output_held_by_pause() {
        let (mut sup, mut rx) = supervisor(vec![sh("web", "echo late")]);
        sup.pause_streams();
        sup.start("web");
        let held = pump_until(&mut sup, &mut rx, Duration::from_millis(400), |_, _| false).await;
        assert!(held.is_empty());

        sup.resume_streams();
        let seen = pump_until(&mut sup, &mut rx, Duration::from_secs(5), |sup, _| {
            sup.state("web").status == RunStatus::Exited
        })
        .await;
        assert_eq!(
            seen,
            vec![log("web", "late"), log("web", "Process exited with code 0")]
        );
    }

    #[tokio::test]
    async fn restart_waits_for_slow_shutdown() {
        let (mut sup, mut rx) = Supervisor::new(
            vec![sh("x", "trap 'sleep 0.5; exit 0' TERM; sleep 30 & wait")],
            SupervisorSettings {
                restart_delay: Duration::from_millis(50),
                kill_grace: Duration::from_secs(5),
            },
        );
        sup.start("x");
        let first = sup.state("x").pid.expect("pid");
        tokio::time::sleep(Duration::from_millis(100)).await;
        let began = Instant::now();
        sup.restart("x");

        pump_until(&mut sup, &mut rx, Duration::from_secs(5), |sup, _| {
            sup.is_running("x")
        })
        .await;
        assert!(sup.is_running("x"));
        assert!(began.elapsed() >= Duration::from_millis(400));
        assert!(!group_alive(first), "old instance overlapped its replacement");
        assert_ne!(sup.state("x").pid, Some(first));
        sup.shutdown_all();
    }

    #[tokio::test]
    async fn start_during_shutdown_is_deferred() {
        let (mut sup, mut rx) = Supervisor::new(
            vec![sh("x", "trap 'sleep 0.3; exit 0' TERM; sleep 30 & wait")],
            SupervisorSettings {
                restart_delay: Duration::from_millis(50),
                kill_grace: Duration::from_secs(5),
            },
        );
        sup.start("x");
        let first = sup.state("x").pid.expect("pid");
        tokio::time::sleep(Duration::from_millis(100)).await;
        sup.stop("x");
        sup.start("x");
        assert!(!sup.is_running("x"));

        pump_until(&mut sup, &mut rx, Duration::from_secs(5), |sup, _| {
            sup.is_running("x")
        })
        .await;
        assert!(sup.is_running("x"));
        assert!(!group_alive(first));
        sup.shutdown_all();
    }

    #[tokio::test]
    async fn execute_once_uses_the_one_off_sink() {
        let (mut sup, mut rx) = supervisor(vec![sh("lint", "echo once")]);
        assert!(sup.execute_once("lint"));
        assert_eq!(sup.one_off_name(), Some("lint"));
        let seen = pump_until(&mut sup, &mut rx, Duration::from_secs(5), |_, seen| {
            seen.iter().any(|o| matches!(o, SupervisorOutput::OneOffExited(_)))
        })
        .await;
        assert_eq!(
            seen,
            vec![
                SupervisorOutput::OneOffLine("once".to_string()),
                SupervisorOutput::OneOffExited(Some(0)),
            ]
        );
        assert_eq!(sup.state("lint").status, RunStatus::Stopped);
        assert!(!sup.execute_once("unknown"));
    }

    #[tokio::test]
    async fn cancelled_one_off_output_is_discarded() {
        let (mut sup, mut rx) = supervisor(vec![sh("watch", "sleep 0.2; echo late; sleep 30")]);
        sup.execute_once("watch");
        sup.cancel_one_off();
        assert_eq!(sup.one_off_name(), None);
        let seen = pump_until(&mut sup, &mut rx, Duration::from_millis(600), |_, _| false).await;
        assert!(seen.is_empty());
    }

    #[tokio::test]
    async fn shutdown_all_is_idempotent() {
        let (mut sup, _rx) = supervisor(vec![sh("a", "sleep 30"), sh("b", "sleep 30")]);
        sup.start("a");
        sup.start("b");
        let pids: Vec<u32> = ["a", "b"]
            .iter()
            .filter_map(|name| sup.state(name).pid)
            .collect();
        sup.shutdown_all();
        sup.shutdown_all();
        assert_eq!(sup.running_count(), 0);
        assert_eq!(sup.state("a").status, RunStatus::Stopped);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(pids.iter().all(|pid| !group_alive(*pid)));
    }
}

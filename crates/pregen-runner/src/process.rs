use anyhow::{Context, Result};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::ProcessError;
use crate::watch::{LineSource, LogLine, NextLine};

pub const STOP_COMMAND: &str = "stop";

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

impl LaunchSpec {
    pub fn display_command(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Exited(Option<i32>),
    Killed,
}

/// A running server the benchmark can talk to: a pull-based line stream plus
/// a command channel.
pub trait ServerSession: LineSource {
    fn send_command(&mut self, command: &str) -> Result<()>;

    /// Asks the server to shut down and reaps it. With a timeout, a server that
    /// has not exited in time is killed.
    fn stop(&mut self, timeout: Option<Duration>) -> Result<StopOutcome>;
}

pub trait ServerLauncher {
    type Session: ServerSession;

    fn launch(&self, spec: &LaunchSpec) -> Result<Self::Session>;
}

/// Servers that are currently running. A shutdown handler holding a clone can
/// kill them before the benchmark process exits, since `Drop` does not run on
/// a signal.
#[derive(Debug, Clone, Default)]
pub struct LiveServers {
    children: Arc<Mutex<Vec<SharedChild>>>,
}

type SharedChild = Arc<Mutex<Child>>;

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl LiveServers {
    fn register(&self, child: &SharedChild) {
        lock(&self.children).push(Arc::clone(child));
    }

    fn unregister(&self, child: &SharedChild) {
        lock(&self.children).retain(|c| !Arc::ptr_eq(c, child));
    }

    pub fn len(&self) -> usize {
        lock(&self.children).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Kills and reaps every registered server still alive. Returns how many
    /// had to be killed.
    pub fn kill_all(&self) -> usize {
        let children: Vec<SharedChild> = lock(&self.children).drain(..).collect();
        let mut killed = 0;
        for child in children {
            let mut child = lock(&child);
            if let Ok(None) = child.try_wait() {
                warn!(pid = child.id(), "killing running server on shutdown");
                if child.kill().is_ok() {
                    killed += 1;
                }
                let _ = child.wait();
            }
        }
        killed
    }
}

/// Launches real child processes and tracks them in a [`LiveServers`] set.
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher {
    live: LiveServers,
}

impl ProcessLauncher {
    pub fn new(live: LiveServers) -> Self {
        Self { live }
    }
}

impl ServerLauncher for ProcessLauncher {
    type Session = ServerProcess;

    fn launch(&self, spec: &LaunchSpec) -> Result<ServerProcess> {
        ServerProcess::launch(spec, &self.live)
    }
}

/// A live child process with stdin open for commands and stdout/stderr merged
/// into one stream of timestamped lines.
///
/// Both output pipes are drained by background threads into an unbounded
/// channel for the whole life of the process, so the child never stalls on a
/// full pipe while the caller is sleeping or writing commands.
#[derive(Debug)]
pub struct ServerProcess {
    child: SharedChild,
    pid: u32,
    stdin: Option<ChildStdin>,
    lines: Receiver<LogLine>,
    live: LiveServers,
    reaped: bool,
}

impl ServerProcess {
    pub fn launch(spec: &LaunchSpec, live: &LiveServers) -> Result<Self> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        cmd.current_dir(&spec.working_dir);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: spec.program.clone(),
            source,
        })?;
        let pid = child.id();
        info!(pid, command = %spec.display_command(), "server launched");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (tx, rx) = mpsc::channel();
        let process = Self {
            stdin: child.stdin.take(),
            child: Arc::new(Mutex::new(child)),
            pid,
            lines: rx,
            live: live.clone(),
            reaped: false,
        };
        live.register(&process.child);

        if let Some(stdout) = stdout {
            spawn_line_pump("stdout", stdout, tx.clone())?;
        }
        if let Some(stderr) = stderr {
            spawn_line_pump("stderr", stderr, tx)?;
        }
        Ok(process)
    }

    fn try_wait(&self) -> Result<Option<ExitStatus>> {
        Ok(lock(&self.child).try_wait()?)
    }

    /// Polls for exit so the child lock is never held across a blocking wait.
    fn wait_until(&self, deadline: Option<Instant>) -> Result<Option<ExitStatus>> {
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(Some(status));
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(None);
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
    }

    fn mark_reaped(&mut self) {
        self.reaped = true;
        self.live.unregister(&self.child);
    }
}

fn spawn_line_pump<R: Read + Send + 'static>(
    name: &str,
    stream: R,
    tx: Sender<LogLine>,
) -> Result<()> {
    thread::Builder::new()
        .name(format!("server-{}", name))
        .spawn(move || {
            let mut reader = BufReader::new(stream);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        let text = String::from_utf8_lossy(&buf)
                            .trim_end_matches(['\r', '\n'])
                            .to_string();
                        if tx.send(LogLine::new(text, Instant::now())).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        })
        .with_context(|| format!("failed to start {} reader thread", name))?;
    Ok(())
}

impl LineSource for ServerProcess {
    fn next_line(&mut self, timeout: Option<Duration>) -> NextLine {
        match timeout {
            None => match self.lines.recv() {
                Ok(line) => NextLine::Line(line),
                Err(_) => NextLine::Closed,
            },
            Some(t) => match self.lines.recv_timeout(t) {
                Ok(line) => NextLine::Line(line),
                Err(RecvTimeoutError::Timeout) => NextLine::TimedOut,
                Err(RecvTimeoutError::Disconnected) => NextLine::Closed,
            },
        }
    }
}

impl ServerSession for ServerProcess {
    fn send_command(&mut self, command: &str) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| ProcessError::StdinClosed {
                command: command.to_string(),
            })?;
        let write = stdin
            .write_all(format!("{}\n", command).as_bytes())
            .and_then(|_| stdin.flush());
        if write.is_err() {
            self.stdin = None;
            return Err(ProcessError::StdinClosed {
                command: command.to_string(),
            }
            .into());
        }
        debug!(command, "sent server command");
        Ok(())
    }

    fn stop(&mut self, timeout: Option<Duration>) -> Result<StopOutcome> {
        if self.reaped {
            return Ok(StopOutcome::Exited(None));
        }
        if self.try_wait()?.is_none() {
            if let Err(err) = self.send_command(STOP_COMMAND) {
                warn!(error = %err, "could not send stop command, waiting for exit");
            }
        }
        // Closing stdin gives servers that ignore `stop` an EOF to react to.
        self.stdin = None;

        let status = self.wait_until(timeout.map(|t| Instant::now() + t))?;
        let outcome = match status {
            Some(status) => StopOutcome::Exited(status.code()),
            None => {
                warn!(pid = self.pid, "server did not stop in time, killing it");
                let mut child = lock(&self.child);
                child.kill()?;
                child.wait()?;
                StopOutcome::Killed
            }
        };
        self.mark_reaped();
        info!(outcome = ?outcome, "server stopped");
        Ok(outcome)
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        {
            let mut child = lock(&self.child);
            if let Ok(None) = child.try_wait() {
                warn!(pid = self.pid, "killing server left running");
                let _ = child.kill();
            }
            let _ = child.wait();
        }
        self.mark_reaped();
    }
}

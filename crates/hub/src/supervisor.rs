//! Supervision of the `greenhouse-logger` process.
//!
//! At most one child at a time. `start` and `stop` serialize on one async
//! mutex; `is_running` never waits on it and falls back to the last liveness
//! seen when an operation is in flight.
//!
//! Process control sits behind [`Launcher`] / [`ChildProcess`] so tests can
//! drive the state machine without spawning anything.

use std::fmt;
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

/// Poll period while waiting for the child to exit.
const EXIT_POLL: Duration = Duration::from_millis(100);

/// How long to wait for the kernel to reap a SIGKILLed child.
const KILL_WAIT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Results and errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Started {
    pub pid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stopped {
    pub pid: u32,
    /// SIGTERM was ignored and the child had to be killed.
    pub forced: bool,
}

/// How a child exited; `None` when it died from a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exit(pub Option<i32>);

impl fmt::Display for Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(code) => write!(f, "exit code {code}"),
            None => f.write_str("killed by signal"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("logger already running (pid {0})")]
    AlreadyRunning(u32),

    #[error("logger not running")]
    NotRunning,

    #[error("logger exited during startup ({0})")]
    ExitedEarly(Exit),

    #[error("failed to launch logger: {0}")]
    Launch(#[source] io::Error),

    #[error("logger (pid {pid}) still alive after SIGKILL")]
    StillAlive { pid: u32 },

    #[error("process control failed: {0}")]
    Io(#[from] io::Error),
}

// ---------------------------------------------------------------------------
// Backend traits
// ---------------------------------------------------------------------------

pub trait ChildProcess: Send {
    fn id(&self) -> u32;

    /// `Some` once the child has exited (and is reaped).
    fn try_wait(&mut self) -> io::Result<Option<Exit>>;

    /// Ask the child to stop (SIGTERM).
    fn terminate(&mut self) -> io::Result<()>;

    /// Force the child to stop (SIGKILL).
    fn kill(&mut self) -> io::Result<()>;
}

pub trait Launcher: Send + Sync {
    fn launch(&self) -> io::Result<Box<dyn ChildProcess>>;
}

// ---------------------------------------------------------------------------
// OS backend
// ---------------------------------------------------------------------------

/// Spawns the logger binary with its output appended to a log file.
pub struct ProcessLauncher {
    program: PathBuf,
    envs: Vec<(String, String)>,
    log_file: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            envs: Vec::new(),
            log_file: None,
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    fn output(&self) -> io::Result<(Stdio, Stdio)> {
        match &self.log_file {
            Some(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Ok((Stdio::from(file.try_clone()?), Stdio::from(file)))
            }
            None => Ok((Stdio::null(), Stdio::null())),
        }
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self) -> io::Result<Box<dyn ChildProcess>> {
        let (stdout, stderr) = self.output()?;
        let child = Command::new(&self.program)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()?;
        Ok(Box::new(OsChild(child)))
    }
}

struct OsChild(std::process::Child);

impl ChildProcess for OsChild {
    fn id(&self) -> u32 {
        self.0.id()
    }

    fn try_wait(&mut self) -> io::Result<Option<Exit>> {
        Ok(self.0.try_wait()?.map(|status| Exit(status.code())))
    }

    fn terminate(&mut self) -> io::Result<()> {
        let pid = libc::pid_t::try_from(self.0.id())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        // SAFETY: plain kill(2) on a pid we spawned and have not yet reaped.
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn kill(&mut self) -> io::Result<()> {
        self.0.kill()
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

pub struct Supervisor {
    launcher: Arc<dyn Launcher>,
    child: Mutex<Option<Box<dyn ChildProcess>>>,
    alive: AtomicBool,
    /// 0 when nothing is supervised.
    pid: AtomicU32,
    grace: Duration,
}

impl Supervisor {
    pub fn new(launcher: Arc<dyn Launcher>, grace: Duration) -> Self {
        Self {
            launcher,
            child: Mutex::new(None),
            alive: AtomicBool::new(false),
            pid: AtomicU32::new(0),
            grace,
        }
    }

    fn publish(&self, pid: Option<u32>) {
        self.alive.store(pid.is_some(), Ordering::SeqCst);
        self.pid.store(pid.unwrap_or(0), Ordering::SeqCst);
    }

    /// Reap the slot if its child has exited. Returns the live pid, if any.
    fn refresh(slot: &mut Option<Box<dyn ChildProcess>>) -> Option<u32> {
        let child = slot.as_mut()?;
        match child.try_wait() {
            Ok(None) => Some(child.id()),
            Ok(Some(exit)) => {
                info!(pid = child.id(), %exit, "logger exited on its own");
                *slot = None;
                None
            }
            Err(e) => {
                warn!(pid = child.id(), "cannot poll logger, assuming it is alive: {e}");
                Some(child.id())
            }
        }
    }

    /// The child is tracked from the moment it is launched, so a start
    /// abandoned during the grace period still leaves it supervised.
    pub async fn start(&self) -> Result<Started, SupervisorError> {
        let mut slot = self.child.lock().await;
        if let Some(pid) = Self::refresh(&mut slot) {
            return Err(SupervisorError::AlreadyRunning(pid));
        }

        let child = self.launcher.launch().map_err(SupervisorError::Launch)?;
        let pid = child.id();
        let child = slot.insert(child);
        self.publish(Some(pid));
        info!(pid, grace_ms = self.grace.as_millis() as u64, "logger launched");

        tokio::time::sleep(self.grace).await;

        match child.try_wait() {
            Ok(None) => {
                info!(pid, "logger started");
                Ok(Started { pid })
            }
            Ok(Some(exit)) => {
                warn!(pid, %exit, "logger died during startup");
                *slot = None;
                self.publish(None);
                Err(SupervisorError::ExitedEarly(exit))
            }
            Err(e) => {
                warn!(pid, "cannot poll new logger, killing it: {e}");
                if let Err(kill) = child.kill() {
                    warn!(pid, "SIGKILL failed: {kill}");
                }
                if wait_for_exit(&mut **child, KILL_WAIT).await.ok().flatten().is_some() {
                    *slot = None;
                    self.publish(None);
                }
                Err(SupervisorError::Io(e))
            }
        }
    }

    /// SIGTERM, wait up to `timeout`, then SIGKILL. Returns once the child
    /// is confirmed gone; until then it stays in the slot, so an abandoned
    /// stop leaves it tracked.
    pub async fn stop(&self, timeout: Duration) -> Result<Stopped, SupervisorError> {
        let mut slot = self.child.lock().await;
        let Some(pid) = Self::refresh(&mut slot) else {
            self.publish(None);
            return Err(SupervisorError::NotRunning);
        };
        let Some(child) = slot.as_mut() else {
            return Err(SupervisorError::NotRunning);
        };

        info!(pid, timeout_sec = timeout.as_secs(), "stopping logger");
        if let Err(e) = child.terminate() {
            warn!(pid, "SIGTERM failed: {e}");
        }
        let forced = match wait_for_exit(&mut **child, timeout).await? {
            Some(exit) => {
                info!(pid, %exit, "logger stopped");
                false
            }
            None => {
                warn!(pid, "logger ignored SIGTERM, killing");
                if let Err(e) = child.kill() {
                    warn!(pid, "SIGKILL failed: {e}");
                }
                match wait_for_exit(&mut **child, KILL_WAIT).await? {
                    Some(exit) => {
                        warn!(pid, %exit, "logger killed");
                        true
                    }
                    None => {
                        self.publish(Some(pid));
                        return Err(SupervisorError::StillAlive { pid });
                    }
                }
            }
        };
        *slot = None;
        self.publish(None);
        Ok(Stopped { pid, forced })
    }

    /// Never blocks behind a start/stop in progress.
    pub fn is_running(&self) -> bool {
        self.pid().is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        match self.child.try_lock() {
            Ok(mut slot) => {
                let pid = Self::refresh(&mut slot);
                self.publish(pid);
                pid
            }
            Err(_) => self
                .alive
                .load(Ordering::SeqCst)
                .then(|| self.pid.load(Ordering::SeqCst)),
        }
    }
}

async fn wait_for_exit(
    child: &mut dyn ChildProcess,
    timeout: Duration,
) -> Result<Option<Exit>, SupervisorError> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(exit) = child.try_wait()? {
            return Ok(Some(exit));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        tokio::time::sleep(EXIT_POLL).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

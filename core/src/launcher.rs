use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::bridge::InteractiveBridge;
use crate::error::Result;
use crate::error::SupervisorError;
use crate::output::OutputChannel;
use crate::output::ProcessLog;
use crate::registry::ProcessRecord;
use crate::registry::ProcessRegistry;
use crate::registry::ProcessStatus;
use crate::registry::pid_alive;
use crate::simple_id::SimpleId;
use crate::spawn;
use crate::spawn::SurfaceChild;

/// How long `run` waits for a process to finish before promoting it to
/// background supervision.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period between a polite termination request and escalation.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// How long the drain task may delay exit reconciliation after the tracked
/// process dies. Detached grandchildren can hold the output pipes open
/// indefinitely; the exit signal must not wait on them.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Retention policy applied by `sweep`: terminal records older than this, or
/// beyond this many, are dropped.
const SWEEP_MAX_AGE_DAYS: i64 = 7;
const SWEEP_MAX_TERMINAL: usize = 50;

/// A request to launch one shell command under supervision.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub command: String,
    pub cwd: Option<PathBuf>,
    /// Advisory hint that the caller expects a long-lived process. Skips the
    /// synchronous wait entirely.
    pub is_long_running: bool,
    pub interactive: bool,
    pub sync_timeout: Duration,
    /// Optional wall-clock ceiling after which the process is killed and
    /// marked timed out.
    pub hard_timeout: Option<Duration>,
}

impl RunRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            cwd: None,
            is_long_running: false,
            interactive: false,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            hard_timeout: None,
        }
    }
}

/// Outcome of `run`: either the process finished within the synchronous
/// window, or it was promoted to background supervision, or it went straight
/// onto an interactive surface.
#[derive(Debug)]
pub enum RunResult {
    Completed {
        exit_code: Option<i32>,
        captured_text: String,
    },
    Running {
        simple_id: SimpleId,
        captured_text: String,
    },
    Interactive {
        simple_id: SimpleId,
    },
}

impl RunResult {
    pub fn simple_id(&self) -> Option<SimpleId> {
        match self {
            RunResult::Completed { .. } => None,
            RunResult::Running { simple_id, .. } | RunResult::Interactive { simple_id } => {
                Some(*simple_id)
            }
        }
    }

    pub fn captured_text(&self) -> &str {
        match self {
            RunResult::Completed { captured_text, .. }
            | RunResult::Running { captured_text, .. } => captured_text,
            RunResult::Interactive { .. } => "",
        }
    }
}

/// In-memory handle over a process this supervisor instance spawned.
/// Registry records outlive these; a `LiveChild` exists only while the
/// supervision task is running.
pub(crate) struct LiveChild {
    pub(crate) pid: u32,
    pub(crate) stdin_tx: Option<mpsc::Sender<Vec<u8>>>,
    pub(crate) exit: watch::Receiver<Option<i32>>,
    #[cfg(unix)]
    killer: StdMutex<Option<Box<dyn portable_pty::ChildKiller + Send + Sync>>>,
}

impl LiveChild {
    fn kill_hard(&self) {
        // Group signal first so forked grandchildren die with the leader,
        // then the surface's own killer in case the process changed groups.
        spawn::terminate_forced(self.pid);
        #[cfg(unix)]
        {
            let taken = {
                let mut killer = self
                    .killer
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                killer.take()
            };
            if let Some(mut killer) = taken {
                let _ = killer.kill();
            }
        }
    }
}

pub(crate) struct SupervisorInner {
    pub(crate) registry: ProcessRegistry,
    pub(crate) channel: OutputChannel,
    children: StdMutex<HashMap<SimpleId, Arc<LiveChild>>>,
    home: PathBuf,
}

impl SupervisorInner {
    fn children(&self) -> MutexGuard<'_, HashMap<SimpleId, Arc<LiveChild>>> {
        self.children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn live_child(&self, simple_id: SimpleId) -> Option<Arc<LiveChild>> {
        self.children().get(&simple_id).cloned()
    }
}

/// Process supervisor: spawns shell commands, promotes slow ones to
/// background tracking, and serves lookups, kills, and output streams for
/// everything in its registry. Cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    /// Open a supervisor rooted at `home`, creating the directory layout and
    /// loading the persisted process index.
    pub fn open(home: &Path) -> Result<Self> {
        std::fs::create_dir_all(home)?;
        let registry = ProcessRegistry::open(home)?;
        let channel = OutputChannel::open(home)?;
        Ok(Self {
            inner: Arc::new(SupervisorInner {
                registry,
                channel,
                children: StdMutex::new(HashMap::new()),
                home: home.to_path_buf(),
            }),
        })
    }

    /// Open at `$OVERSEER_HOME`, falling back to the platform data dir.
    pub fn open_default() -> Result<Self> {
        let home = match std::env::var_os("OVERSEER_HOME") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("overseer"),
        };
        Self::open(&home)
    }

    pub fn home(&self) -> &Path {
        &self.inner.home
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.inner.registry
    }

    pub fn log(&self, simple_id: SimpleId) -> Option<Arc<ProcessLog>> {
        if let Some(log) = self.inner.channel.get(simple_id) {
            return Some(log);
        }
        // A record that predates this supervisor instance still has its
        // on-disk mirror; rehydrate from that.
        let record = self.inner.registry.get(simple_id)?;
        Some(self.inner.channel.attach(simple_id, &record.log_path))
    }

    pub fn bridge(&self) -> InteractiveBridge {
        InteractiveBridge::new(Arc::clone(&self.inner))
    }

    /// Launch a command. Non-interactive processes are awaited for
    /// `sync_timeout`; if still running they are promoted to background
    /// supervision and identified by their simple id from then on.
    pub async fn run(&self, request: RunRequest) -> Result<RunResult> {
        let cwd = match &request.cwd {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };

        let interactive = request.interactive || is_self_invocation(&request.command);
        if interactive && !request.interactive {
            info!("self-invocation detected, routing `{}` to an interactive surface", request.command);
        }

        let simple_id = self.inner.registry.next_simple_id();
        let log = self.inner.channel.create(simple_id);

        let child = if interactive {
            spawn::spawn_interactive(&request.command, &cwd, simple_id)?
        } else {
            spawn::spawn_piped(&request.command, &cwd, simple_id)?
        };

        self.inner.registry.insert(ProcessRecord {
            simple_id,
            native_pid: child.pid,
            command_text: request.command.clone(),
            preview: condense_preview(&request.command),
            start_time: Utc::now(),
            status: ProcessStatus::Running,
            is_interactive: interactive,
            log_path: log.path().to_path_buf(),
            cwd,
        });
        debug!("tracking {simple_id} (pid {})", child.pid);

        let exit_rx = self.supervise(simple_id, child, Arc::clone(&log), request.hard_timeout);

        if interactive {
            return Ok(RunResult::Interactive { simple_id });
        }

        if !request.is_long_running {
            let mut exit_rx = exit_rx;
            let waited = tokio::time::timeout(
                request.sync_timeout,
                exit_rx.wait_for(|code| code.is_some()),
            )
            .await;
            if let Ok(Ok(code)) = waited {
                let exit_code = *code;
                let captured_text = log.text();
                // Fast-path completion leaves no residue: the record and its
                // log are gone as if the command had run in the foreground.
                self.inner.registry.remove(simple_id);
                self.inner.channel.remove(simple_id, true);
                return Ok(RunResult::Completed {
                    exit_code,
                    captured_text,
                });
            }
        }

        info!("{simple_id} promoted to background supervision");
        Ok(RunResult::Running {
            simple_id,
            captured_text: log.text(),
        })
    }

    /// Wire up the drain and supervision tasks for a freshly spawned child
    /// and register its live handle. Returns a watch over the exit code.
    fn supervise(
        &self,
        simple_id: SimpleId,
        child: SurfaceChild,
        log: Arc<ProcessLog>,
        hard_timeout: Option<Duration>,
    ) -> watch::Receiver<Option<i32>> {
        let pid = child.pid;
        let output_rx = child.output_rx;
        let stdin_tx = child.stdin_tx;
        let wait = child.wait;
        #[cfg(unix)]
        let killer = child.killer;

        // Single writer per process: the drain task is the only appender.
        let drain = output_rx.map(|mut rx| {
            let log = Arc::clone(&log);
            tokio::spawn(async move {
                while let Some(bytes) = rx.recv().await {
                    log.append(bytes);
                }
            })
        });

        let (exit_tx, exit_rx) = watch::channel(None);
        let live = Arc::new(LiveChild {
            pid,
            stdin_tx,
            exit: exit_rx.clone(),
            #[cfg(unix)]
            killer: StdMutex::new(killer),
        });
        self.inner.children().insert(simple_id, Arc::clone(&live));

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut wait = wait;
            let exit_code = match hard_timeout {
                Some(ceiling) => {
                    tokio::select! {
                        joined = &mut wait => joined.ok().flatten(),
                        _ = tokio::time::sleep(ceiling) => {
                            warn!("{simple_id} exceeded its {ceiling:?} ceiling, killing");
                            inner.registry.mark_terminal(simple_id, ProcessStatus::TimedOut);
                            live.kill_hard();
                            wait.await.ok().flatten()
                        }
                    }
                }
                None => wait.await.ok().flatten(),
            };

            // Let the drain finish before the status flips so a watcher that
            // sees a terminal status has also seen the final output — but
            // only up to DRAIN_GRACE: an orphan holding the pipes must not
            // stall exit reconciliation forever.
            if let Some(drain) = drain {
                let _ = tokio::time::timeout(DRAIN_GRACE, drain).await;
            }
            inner
                .registry
                .mark_terminal(simple_id, ProcessStatus::Completed { exit_code });
            inner.children().remove(&simple_id);
            let _ = exit_tx.send(Some(exit_code.unwrap_or(-1)));
            debug!("{simple_id} exited with {exit_code:?}");
        });

        exit_rx
    }

    /// Resolve an optional user reference to a record: explicit simple id or
    /// pid when given, otherwise the most recently started running process.
    pub fn resolve(&self, reference: Option<&str>) -> Result<ProcessRecord> {
        match reference {
            Some(reference) => self
                .inner
                .registry
                .resolve(reference)
                .ok_or_else(|| SupervisorError::not_found(reference)),
            None => self
                .inner
                .registry
                .most_recent()
                .ok_or_else(|| SupervisorError::not_found("<most recent>")),
        }
    }

    /// Terminate a tracked process. Polite first, forced after `KILL_GRACE`,
    /// error if it survives both. `force` skips the polite step. Killing an
    /// already-terminal record is a no-op.
    pub async fn kill(&self, simple_id: SimpleId, force: bool) -> Result<()> {
        let record = self
            .inner
            .registry
            .get(simple_id)
            .ok_or_else(|| SupervisorError::not_found(simple_id.to_string()))?;
        if record.status.is_terminal() {
            return Ok(());
        }
        // Mark first so a concurrent natural exit cannot claim Completed.
        self.inner.registry.mark_terminal(simple_id, ProcessStatus::Killed);

        if let Some(live) = self.inner.live_child(simple_id) {
            if !force {
                spawn::terminate_graceful(live.pid);
                if wait_for_exit(live.exit.clone(), KILL_GRACE).await {
                    return Ok(());
                }
                info!("{simple_id} ignored polite termination, escalating");
            }
            live.kill_hard();
            if wait_for_exit(live.exit.clone(), KILL_GRACE).await {
                return Ok(());
            }
            return Err(SupervisorError::TerminateTimeout {
                simple_id,
                pid: live.pid,
            });
        }

        // No live handle (spawned by a prior instance): fall back to pid
        // signalling and liveness probes.
        if !pid_alive(record.native_pid) {
            return Ok(());
        }
        if !force {
            spawn::terminate_graceful(record.native_pid);
            tokio::time::sleep(KILL_GRACE).await;
            if !pid_alive(record.native_pid) {
                return Ok(());
            }
        }
        spawn::terminate_forced(record.native_pid);
        tokio::time::sleep(KILL_GRACE).await;
        if pid_alive(record.native_pid) {
            return Err(SupervisorError::TerminateTimeout {
                simple_id,
                pid: record.native_pid,
            });
        }
        Ok(())
    }

    /// Drop a terminal record and its log. Running processes must be killed
    /// first.
    pub fn purge(&self, simple_id: SimpleId) -> Result<ProcessRecord> {
        match self.inner.registry.purge(simple_id) {
            Some(record) => {
                self.inner.channel.remove(simple_id, true);
                Ok(record)
            }
            None => Err(SupervisorError::not_found(simple_id.to_string())),
        }
    }

    /// Apply the retention policy: drop terminal records older than a week
    /// or beyond the terminal-count cap, logs included. Returns how many
    /// records were removed.
    pub fn sweep(&self) -> usize {
        let removed = self.inner.registry.sweep(
            chrono::Duration::days(SWEEP_MAX_AGE_DAYS),
            SWEEP_MAX_TERMINAL,
        );
        for record in &removed {
            self.inner.channel.remove(record.simple_id, true);
        }
        if !removed.is_empty() {
            info!("swept {} stale record(s)", removed.len());
        }
        removed.len()
    }
}

/// True when the command would re-enter this binary, which deadlocks the
/// piped path waiting on its own output.
fn is_self_invocation(command_text: &str) -> bool {
    let Some(argv) = shlex::split(command_text) else {
        return false;
    };
    let Some(first) = argv.first() else {
        return false;
    };
    let stem = Path::new(first)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(first);
    if stem == "overseer" {
        return true;
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.file_stem().and_then(|s| s.to_str().map(str::to_string)))
        .is_some_and(|own| own == stem)
}

/// A one-line preview of a command for listings: the last stage of a shell
/// pipeline chain, with wrapping quotes stripped.
fn condense_preview(command_text: &str) -> String {
    let flattened = command_text.split_whitespace().collect::<Vec<_>>().join(" ");
    let last_stage = ["&&", "||", ";"]
        .iter()
        .filter_map(|sep| flattened.rsplit(sep).next())
        .min_by_key(|stage| stage.len())
        .unwrap_or(&flattened)
        .trim();
    let trimmed = last_stage
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| {
            last_stage
                .strip_prefix('"')
                .and_then(|s| s.strip_suffix('"'))
        })
        .unwrap_or(last_stage);
    trimmed.to_string()
}

async fn wait_for_exit(mut exit: watch::Receiver<Option<i32>>, window: Duration) -> bool {
    tokio::time::timeout(window, exit.wait_for(|code| code.is_some()))
        .await
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn preview_takes_last_pipeline_stage() {
        assert_eq!(
            condense_preview("cd /srv/app && npm run dev"),
            "npm run dev"
        );
        assert_eq!(condense_preview("make build; ./bin/serve"), "./bin/serve");
        assert_eq!(condense_preview("echo 'hello world'"), "echo 'hello world'");
        assert_eq!(condense_preview("true && 'quoted cmd'"), "quoted cmd");
    }

    #[test]
    fn self_invocation_matches_binary_stem() {
        assert!(is_self_invocation("overseer ps"));
        assert!(is_self_invocation("/usr/local/bin/overseer watch 3"));
        assert!(!is_self_invocation("overseer-unrelated --flag"));
        assert!(!is_self_invocation("echo overseer"));
    }
}

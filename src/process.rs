//! Backend process supervision: launching, readiness gating, exit watching,
//! liveness probing and process-group termination.
//!
//! One [`Slot`] exists per supervisor key and is never removed. Its child
//! handle cycles `absent -> live -> absent` across cold starts, traffic and
//! idle termination. All transitions happen under the slot's mutex; the
//! launcher keeps it held across the readiness wait so concurrent requests
//! for a cold key serialize through a single spawn.

use crate::config::HandlerConfig;
use crate::detector::{self, LaunchParams};
use crate::error::Error;
use crate::readiness;
use crate::upstream::Upstream;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Total time allowed for one launch to pass its readiness gate.
const READINESS_DEADLINE: Duration = Duration::from_secs(10);

/// Supervision state for one key.
pub struct Slot {
    pub(crate) state: Mutex<SlotState>,
}

#[derive(Default)]
pub(crate) struct SlotState {
    /// The live child, if any
    pub(crate) child: Option<BackendChild>,
    /// In-flight requests routed through this slot
    pub(crate) active: u64,
    /// Armed timer that terminates the child when it fires
    pub(crate) idle_timer: Option<AbortHandle>,
    /// Cause attached to the next exit log
    pub(crate) termination_reason: Option<String>,
    /// Bumped on every launch so the exit watcher only clears its own child
    pub(crate) generation: u64,
}

/// Handle to a live backend recorded in a slot.
pub(crate) struct BackendChild {
    pub(crate) pid: i32,
    pub(crate) generation: u64,
    cancel: CancellationToken,
    /// Effective launch parameters this child was started with
    pub(crate) params: LaunchParams,
}

impl BackendChild {
    /// Terminate the child's whole process group so grandchildren are
    /// reaped too. The exit watcher clears the slot afterwards.
    pub(crate) fn terminate(&self) {
        #[cfg(unix)]
        kill_process_group(self.pid);
        self.cancel.cancel();
    }
}

impl Slot {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SlotState::default()),
        })
    }

    /// Decrement the in-flight count; at zero, arm the idle timer.
    pub(crate) async fn finish_request(self: Arc<Self>, idle_timeout: Duration) {
        let mut state = self.state.lock().await;
        state.active = state.active.saturating_sub(1);
        if state.active == 0 {
            if let Some(timer) = state.idle_timer.take() {
                timer.abort();
            }
            let slot = Arc::clone(&self);
            let timer = tokio::spawn(async move {
                tokio::time::sleep(idle_timeout).await;
                slot.fire_idle_timeout().await;
            });
            state.idle_timer = Some(timer.abort_handle());
        }
    }

    async fn fire_idle_timeout(self: Arc<Self>) {
        let mut state = self.state.lock().await;
        if state.active != 0 {
            return;
        }
        if state.child.is_some() {
            state.termination_reason = Some("idle timeout".to_string());
        }
        if let Some(child) = &state.child {
            info!(pid = child.pid, "idle timeout reached, terminating backend");
            child.terminate();
        }
    }
}

/// Launch the backend for a slot and wait for it to become ready.
///
/// Called with the slot's lock held. On success the slot records the live
/// child together with its effective launch parameters, which are also
/// returned. On failure the child (if it was spawned) is terminated and
/// the exit watcher restores the slot to empty.
pub(crate) async fn start_backend(
    config: &HandlerConfig,
    slot: &Arc<Slot>,
    state: &mut SlotState,
    key: &str,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<LaunchParams, Error> {
    let params = if config.detector.is_empty() {
        LaunchParams::from_config(config)
    } else {
        let overrides = detector::run_detector(key).await?;
        LaunchParams::merged(config, overrides)
    };

    let upstream = Upstream::classify(&params.upstream)?;
    match &upstream {
        Upstream::Tcp { .. } => {
            if params.readiness_method.is_empty() {
                return Err(Error::InvalidConfig(
                    "a TCP upstream requires a readiness probe".to_string(),
                ));
            }
        }
        Upstream::Unix { path } => match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed stale backend socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Io(e)),
        },
    }

    let Some((program, args)) = params.executable.split_first() else {
        return Err(Error::InvalidConfig("no executable configured".to_string()));
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let working_dir = if params.working_dir.is_empty() {
        "."
    } else {
        params.working_dir.as_str()
    };
    cmd.current_dir(working_dir);

    cmd.env_clear();
    if config.pass_all {
        cmd.envs(std::env::vars());
    } else {
        for name in &config.pass_envs {
            if let Ok(value) = std::env::var(name) {
                cmd.env(name, value);
            }
        }
    }
    // Configured pairs come last so they win ties against imports.
    for pair in &params.envs {
        if let Some((name, value)) = pair.split_once('=') {
            cmd.env(name, value);
        }
    }

    set_process_group(&mut cmd);

    let mut child = cmd.spawn().map_err(|e| {
        error!(executable = %program, error = %e, "failed to start backend");
        Error::LaunchFailed {
            executable: program.clone(),
            source: e,
        }
    })?;
    let pid = child.id().map(|p| p as i32).unwrap_or_default();

    info!(pid, executable = %program, args = ?args, "started backend");

    let out_task = tokio::spawn(drain_lines(child.stdout.take(), pid, "stdout"));
    let err_task = tokio::spawn(drain_lines(child.stderr.take(), pid, "stderr"));

    state.generation += 1;
    let generation = state.generation;
    let cancel = CancellationToken::new();
    let (exit_tx, exit_rx) = oneshot::channel();

    spawn_exit_watcher(
        child,
        out_task,
        err_task,
        Arc::clone(slot),
        pid,
        generation,
        cancel.clone(),
        exit_tx,
    );

    state.child = Some(BackendChild {
        pid,
        generation,
        cancel,
        params: params.clone(),
    });

    let ready = readiness::wait_until_ready(
        params.readiness_method.clone(),
        params.readiness_path.clone(),
        upstream.clone(),
        shutdown_rx,
    );

    tokio::select! {
        _ = ready => {
            info!(pid, address = %upstream.dial_addr(), "backend ready");
            Ok(params)
        }
        status = exit_rx => {
            state.child = None;
            Err(Error::BackendExitedDuringReadiness(
                status.unwrap_or_else(|_| "unknown".to_string()),
            ))
        }
        _ = tokio::time::sleep(READINESS_DEADLINE) => {
            if let Some(child) = state.child.take() {
                child.terminate();
            }
            Err(Error::ReadinessTimeout)
        }
    }
}

/// Forward one output pipe to the log, line by line, until it closes.
async fn drain_lines<R>(pipe: Option<R>, pid: i32, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let Some(pipe) = pipe else { return };
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(pid, stream, line = %line, "backend output");
    }
}

/// Wait for the child to exit, drain the remaining log lines, then clear
/// the slot if this child is still the recorded one. The exit is signalled
/// before the lock is taken because the launcher holds the lock while
/// racing readiness against it.
#[allow(clippy::too_many_arguments)]
fn spawn_exit_watcher(
    mut child: Child,
    out_task: JoinHandle<()>,
    err_task: JoinHandle<()>,
    slot: Arc<Slot>,
    pid: i32,
    generation: u64,
    cancel: CancellationToken,
    exit_tx: oneshot::Sender<String>,
) {
    tokio::spawn(async move {
        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };
        let status = match exited {
            Some(status) => status,
            // Termination was requested before the child went down on its
            // own; make sure of it, then collect the status.
            None => {
                let _ = child.start_kill();
                child.wait().await
            }
        };
        let _ = out_task.await;
        let _ = err_task.await;

        let status_text = match &status {
            Ok(status) => status.to_string(),
            Err(e) => format!("wait failed: {}", e),
        };
        let _ = exit_tx.send(status_text.clone());

        let mut state = slot.state.lock().await;
        let reason = state
            .termination_reason
            .take()
            .unwrap_or_else(|| "unexpected exit".to_string());
        if state.child.as_ref().map(|c| c.generation) == Some(generation) {
            state.child = None;
        }
        drop(state);

        info!(pid, reason = %reason, status = %status_text, "backend terminated");
    });
}

/// Put the child into its own process group and, on Linux, arrange for it
/// to be signalled if the supervisor dies.
pub(crate) fn set_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            if libc::setpgid(0, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            #[cfg(target_os = "linux")]
            {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM as libc::c_ulong) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }
    #[cfg(not(unix))]
    {
        let _ = cmd;
    }
}

/// SIGKILL the whole process group so grandchildren are reaped.
#[cfg(unix)]
pub(crate) fn kill_process_group(pid: i32) {
    if pid <= 0 {
        return;
    }
    unsafe {
        libc::kill(-pid, libc::SIGKILL);
    }
}

/// Non-destructive liveness probe.
///
/// A process counts as alive when the null signal can be delivered and, on
/// Linux, it is not a zombie. Platforms without these facilities report
/// alive and rely on the exit watcher to clear stale state.
pub fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    #[cfg(unix)]
    {
        if unsafe { libc::kill(pid, 0) } != 0 {
            return false;
        }
        #[cfg(target_os = "linux")]
        {
            if is_zombie(pid) {
                return false;
            }
        }
        true
    }
    #[cfg(not(unix))]
    {
        true
    }
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: i32) -> bool {
    let stat = match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat,
        Err(_) => return false,
    };
    // The state field follows the parenthesized command name, which may
    // itself contain parentheses.
    stat.rsplit_once(')')
        .map(|(_, rest)| rest.trim_start().starts_with('Z'))
        .unwrap_or(false)
}

//! Supervision of the tool process.
//!
//! [`ProcessSupervisor`] owns at most one live child. Starting spawns the
//! tool with its stdout/stderr piped into the log, then polls the readiness
//! probe until the tool answers, exits, times out or the start is
//! cancelled. Stopping sends a graceful termination request and escalates
//! to a forced kill after the stop timeout.

mod health;
mod port;
mod signal;

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use health::{HealthCheck, HealthFuture, HttpHealthCheck, PROBE_TIMEOUT};
pub use port::resolve_port;
pub use signal::{SignalTerminator, Terminator};

use crate::environment::RuntimeEnvironment;
use crate::error::{Error, Result};
use crate::installer::Installation;
use crate::logging::TOOL_TARGET;

/// How long output readers may take to drain after the child exits.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Program and base arguments used to launch the tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Executable to run.
    pub program: PathBuf,
    /// Arguments placed before the listen flags.
    pub args: Vec<OsString>,
    /// Working directory.
    pub cwd: PathBuf,
}

impl LaunchSpec {
    /// Launches `entry_script` of `installation` with the environment's interpreter.
    #[must_use]
    pub fn for_installation(
        env: &RuntimeEnvironment,
        installation: &Installation,
        entry_script: &str,
    ) -> Self {
        Self {
            program: env.interpreter.clone(),
            args: vec![
                OsString::from("-s"),
                installation.root.join(entry_script).into_os_string(),
            ],
            cwd: installation.root.clone(),
        }
    }

    /// Returns every argument passed to the tool when listening on `port`.
    #[must_use]
    pub fn full_args(&self, options: &StartOptions, port: u16) -> Vec<OsString> {
        let mut args = self.args.clone();
        args.push("--windows-standalone-build".into());
        args.push("--listen".into());
        args.push(options.address.clone().into());
        args.push("--port".into());
        args.push(port.to_string().into());
        if options.headless {
            args.push("--disable-auto-launch".into());
        }
        args
    }
}

/// Parameters of one start.
#[derive(Debug, Clone, PartialEq)]
pub struct StartOptions {
    /// Address the tool listens on.
    pub address: String,
    /// Preferred port; another one is picked when it is taken.
    pub port: u16,
    /// Run without opening a browser.
    pub headless: bool,
    /// Wall-clock budget for becoming ready.
    pub timeout: Duration,
    /// Delay between readiness probes.
    pub poll_interval: Duration,
    /// Grace period used when a cancelled start stops the child.
    pub stop_timeout: Duration,
}

/// Snapshot of the live process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    /// OS process id.
    pub pid: u32,
    /// Listen address.
    pub address: String,
    /// Port actually bound.
    pub port: u16,
    /// When the process was spawned.
    pub started_at: DateTime<Utc>,
}

struct ProcessHandle {
    child: Child,
    info: ProcessInfo,
    readers: Vec<JoinHandle<()>>,
    ready: bool,
}

/// Starts, watches and stops the tool process.
pub struct ProcessSupervisor {
    health: Arc<dyn HealthCheck>,
    terminator: Arc<dyn Terminator>,
    handle: Option<ProcessHandle>,
}

impl ProcessSupervisor {
    /// Creates a supervisor using `health` as readiness probe.
    pub fn new(health: Arc<dyn HealthCheck>) -> Self {
        Self {
            health,
            terminator: Arc::new(SignalTerminator),
            handle: None,
        }
    }

    /// Replaces how graceful termination is requested.
    #[must_use]
    pub fn with_terminator(mut self, terminator: Arc<dyn Terminator>) -> Self {
        self.terminator = terminator;
        self
    }

    /// Returns the snapshot of the tracked process, if any.
    #[must_use]
    pub fn info(&self) -> Option<ProcessInfo> {
        self.handle.as_ref().map(|h| h.info.clone())
    }

    /// Returns true if a process is tracked and has not exited.
    ///
    /// A process found to have exited is released.
    pub async fn is_running(&mut self) -> bool {
        let exited = match self.handle.as_mut() {
            None => return false,
            Some(handle) => !matches!(handle.child.try_wait(), Ok(None)),
        };
        if exited {
            self.release().await;
        }
        !exited
    }

    /// Returns true if the tracked process has answered a readiness probe.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| h.ready)
    }

    /// Spawns the tool and waits until it is ready.
    ///
    /// Returns the existing process if one is live and ready. A live process
    /// that never became ready (a previous start timed out) is checked again
    /// with a fresh `timeout`. On timeout the process is left running. On
    /// cancellation it is stopped first.
    ///
    /// # Errors
    /// `Startup` if the tool exits before becoming ready, `Timeout`,
    /// `Cancelled`, `Config` for a zero poll interval, or `Io` if it cannot
    /// be spawned.
    pub async fn start(
        &mut self,
        launch: &LaunchSpec,
        options: &StartOptions,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<ProcessInfo> {
        if options.poll_interval.is_zero() {
            return Err(Error::Config("poll_interval must be positive".to_string()));
        }

        if self.is_running().await {
            if let Some(info) = self.info() {
                if self.is_ready() {
                    info!("[PROCESS] Already running (pid {})", info.pid);
                    return Ok(info);
                }
                info!("[PROCESS] pid {} is live but not ready; waiting again", info.pid);
                let deadline = Instant::now() + options.timeout;
                return self.wait_ready(info, deadline, options, cancel).await;
            }
        }

        let deadline = Instant::now() + options.timeout;
        let port = resolve_port(&options.address, options.port)?;

        let mut command = Command::new(&launch.program);
        command
            .args(launch.full_args(options, port))
            .current_dir(&launch.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| Error::io(&launch.program, e))?;

        let info = ProcessInfo {
            pid: child.id().unwrap_or(0),
            address: options.address.clone(),
            port,
            started_at: Utc::now(),
        };
        info!(
            "[PROCESS] Spawned pid {} listening on {}:{}",
            info.pid, info.address, info.port
        );

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(stdout, "stdout")));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(stderr, "stderr")));
        }

        self.handle = Some(ProcessHandle {
            child,
            info: info.clone(),
            readers,
            ready: false,
        });

        self.wait_ready(info, deadline, options, cancel).await
    }

    /// Polls the tracked process until it is ready, exits, times out or
    /// the start is cancelled.
    async fn wait_ready(
        &mut self,
        info: ProcessInfo,
        deadline: Instant,
        options: &StartOptions,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<ProcessInfo> {
        loop {
            let exit = match self.handle.as_mut() {
                Some(handle) => handle
                    .child
                    .try_wait()
                    .map_err(|e| Error::io(format!("pid {}", info.pid), e))?,
                None => return Err(Error::Startup { code: None }),
            };
            if let Some(status) = exit {
                warn!(
                    "[PROCESS] Exited before becoming ready with {:?}",
                    status.code()
                );
                self.release().await;
                return Err(Error::Startup {
                    code: status.code(),
                });
            }

            if self.health.check(&info.address, info.port).await {
                if let Some(handle) = self.handle.as_mut() {
                    handle.ready = true;
                }
                info!(
                    "[PROCESS] Ready on {}:{} after {:.1}s",
                    info.address,
                    info.port,
                    (Utc::now() - info.started_at).num_milliseconds() as f64 / 1000.0
                );
                return Ok(info);
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "[PROCESS] Not ready after {:.1}s; leaving pid {} running",
                    options.timeout.as_secs_f64(),
                    info.pid
                );
                return Err(Error::Timeout {
                    seconds: options.timeout.as_secs_f64(),
                });
            }

            let nap = options.poll_interval.min(deadline - now);
            tokio::select! {
                () = tokio::time::sleep(nap) => {}
                () = cancelled(cancel) => {
                    info!("[PROCESS] Start cancelled; stopping pid {}", info.pid);
                    self.stop(options.stop_timeout).await?;
                    return Err(Error::Cancelled);
                }
            }
        }
    }

    /// Stops the tracked process.
    ///
    /// Returns false when there was nothing to stop. If termination cannot
    /// be requested the process stays tracked.
    ///
    /// # Errors
    /// `Io` if requesting termination, waiting for or killing the process
    /// fails.
    pub async fn stop(&mut self, timeout: Duration) -> Result<bool> {
        let Some(mut handle) = self.handle.take() else {
            debug!("[PROCESS] Stop requested with nothing running");
            return Ok(false);
        };
        let pid = handle.info.pid;

        if let Ok(Some(status)) = handle.child.try_wait() {
            debug!("[PROCESS] pid {} had already exited with {:?}", pid, status.code());
            join_readers(handle.readers).await;
            return Ok(true);
        }

        info!("[PROCESS] Terminating pid {}", pid);
        if let Err(e) = self.terminator.terminate(&mut handle.child) {
            warn!("[PROCESS] Could not terminate pid {}: {}", pid, e);
            self.handle = Some(handle);
            return Err(Error::io(format!("pid {}", pid), e));
        }

        match tokio::time::timeout(timeout, handle.child.wait()).await {
            Ok(Ok(status)) => {
                info!("[PROCESS] pid {} exited with {:?}", pid, status.code());
            }
            Ok(Err(e)) => {
                return Err(Error::io(format!("pid {}", pid), e));
            }
            Err(_) => {
                warn!(
                    "[PROCESS] pid {} ignored termination for {:.1}s; killing",
                    pid,
                    timeout.as_secs_f64()
                );
                handle
                    .child
                    .kill()
                    .await
                    .map_err(|e| Error::io(format!("pid {}", pid), e))?;
            }
        }

        join_readers(handle.readers).await;
        Ok(true)
    }

    /// Resolves with the exit code once the tracked process exits on its own.
    ///
    /// Never resolves while nothing is tracked. The handle is kept until
    /// [`reap`](Self::reap), so dropping this future loses nothing.
    pub async fn wait_exit(&mut self) -> Option<i32> {
        let status = match self.handle.as_mut() {
            Some(handle) => handle.child.wait().await,
            None => std::future::pending().await,
        };
        match status {
            Ok(status) => status.code(),
            Err(e) => {
                warn!("[PROCESS] Waiting for exit failed: {}", e);
                None
            }
        }
    }

    /// Releases the handle of a process that has exited.
    pub async fn reap(&mut self) {
        if let Some(handle) = self.handle.as_ref() {
            debug!("[PROCESS] Reaping pid {}", handle.info.pid);
        }
        self.release().await;
    }

    /// Drops the handle of an exited process after draining its output.
    async fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            join_readers(handle.readers).await;
        }
    }
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("process", &self.info())
            .finish_non_exhaustive()
    }
}

/// Resolves once cancellation is requested; never if the sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|requested| *requested).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn forward_lines<R>(reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(target: TOOL_TARGET, "[{}] {}", stream, line);
    }
}

async fn join_readers(readers: Vec<JoinHandle<()>>) {
    for mut reader in readers {
        if tokio::time::timeout(READER_GRACE, &mut reader).await.is_err() {
            debug!("[PROCESS] Output reader still busy; aborting it");
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_args() {
        let launch = LaunchSpec {
            program: PathBuf::from("/opt/tool/.venv/bin/python"),
            args: vec!["-s".into(), "/opt/tool/main.py".into()],
            cwd: PathBuf::from("/opt/tool"),
        };
        let mut options = StartOptions {
            address: "127.0.0.1".to_string(),
            port: 8188,
            headless: false,
            timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(1),
        };

        let args: Vec<String> = launch
            .full_args(&options, 9000)
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "-s",
                "/opt/tool/main.py",
                "--windows-standalone-build",
                "--listen",
                "127.0.0.1",
                "--port",
                "9000"
            ]
        );

        options.headless = true;
        let args = launch.full_args(&options, 9000);
        assert_eq!(args.last().unwrap(), "--disable-auto-launch");
    }

    #[test]
    fn test_for_installation() {
        let env = RuntimeEnvironment {
            root: PathBuf::from("/opt/tool/.venv"),
            interpreter: PathBuf::from("/opt/tool/.venv/bin/python"),
            ready: true,
        };
        let installation = Installation {
            root: PathBuf::from("/opt/tool"),
            remote_url: String::new(),
            branch: "master".to_string(),
            revision: "abc".to_string(),
            ahead: 0,
            behind: 0,
        };

        let launch = LaunchSpec::for_installation(&env, &installation, "main.py");
        assert_eq!(launch.program, env.interpreter);
        assert_eq!(launch.cwd, installation.root);
        assert_eq!(launch.args[1], installation.root.join("main.py").into_os_string());
    }
}

//! Per-instance supervision.
//!
//! Every logical instance is driven by one actor task that owns its
//! installation, environment, process and state machine. Callers talk to
//! it through a cloneable [`SupervisorHandle`]; requests queue on a bounded
//! channel and are handled strictly in arrival order, so two lifecycle
//! operations never overlap on the same instance.

mod instance;
mod registry;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

pub use registry::InstanceRegistry;

use crate::command::{CommandRunner, SystemRunner};
use crate::config::{Config, StateStore};
use crate::environment::RuntimeEnvironment;
use crate::error::{Error, Result};
use crate::installer::Installation;
use crate::lifecycle::{LifecycleState, StateMachine, Subscription};
use crate::models::{AssetDownloader, HuggingFaceDownloader};
use crate::offload::Offloader;
use crate::process::{HealthCheck, HttpHealthCheck, ProcessInfo, SignalTerminator, Terminator};

/// Capacity of each instance's request queue.
pub const REQUEST_QUEUE_CAPACITY: usize = 32;

/// Collaborators shared by every instance.
#[derive(Clone)]
pub struct Services {
    /// Runs git, venv and pip.
    pub runner: Arc<dyn CommandRunner>,
    /// Fetches model assets.
    pub downloader: Arc<dyn AssetDownloader>,
    /// Decides when the tool is ready.
    pub health: Arc<dyn HealthCheck>,
    /// Asks the tool to exit.
    pub terminator: Arc<dyn Terminator>,
    /// Bounded pool for blocking work.
    pub offloader: Offloader,
}

impl Services {
    /// Real implementations configured from `config`.
    ///
    /// # Errors
    /// `Config` if the model endpoint is empty or the readiness probe
    /// cannot be built.
    pub fn system(config: &Config) -> Result<Self> {
        Ok(Self {
            runner: Arc::new(SystemRunner),
            downloader: Arc::new(HuggingFaceDownloader::from_env(
                config.models_endpoint.as_str(),
            )?),
            health: Arc::new(HttpHealthCheck::new(config.readiness_path.as_str())?),
            terminator: Arc::new(SignalTerminator),
            offloader: Offloader::new(config.offload_workers),
        })
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("offloader", &self.offloader)
            .finish_non_exhaustive()
    }
}

/// Serializable snapshot of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceStatus {
    /// Instance (context) name.
    pub name: String,
    /// Current lifecycle state.
    pub state: LifecycleState,
    /// Open installation, if any.
    pub installation: Option<Installation>,
    /// Provisioned environment, if any.
    pub environment: Option<RuntimeEnvironment>,
    /// Live process, if any.
    pub process: Option<ProcessInfo>,
    /// True if the remote has newer commits.
    pub update_available: bool,
}

pub(crate) enum Request {
    Initialize {
        install_dir: Option<PathBuf>,
        open_or_install: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    Update {
        force: bool,
        reply: oneshot::Sender<Result<Option<bool>>>,
    },
    Run {
        headless: bool,
        reply: oneshot::Sender<Result<ProcessInfo>>,
    },
    Stop {
        timeout: Option<Duration>,
        reply: oneshot::Sender<Result<bool>>,
    },
    Restart {
        headless: bool,
        timeout: Option<Duration>,
        reply: oneshot::Sender<Result<ProcessInfo>>,
    },
    Cleanup {
        reply: oneshot::Sender<Result<bool>>,
    },
    Refresh {
        reply: oneshot::Sender<Result<()>>,
    },
    Status {
        reply: oneshot::Sender<InstanceStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front end of one instance actor.
#[derive(Clone)]
pub struct SupervisorHandle {
    name: Arc<str>,
    requests: mpsc::Sender<Request>,
    state: StateMachine,
    cancel: Arc<watch::Sender<bool>>,
}

impl SupervisorHandle {
    /// Spawns the actor for `name` on the current tokio runtime.
    pub fn spawn(
        name: &str,
        config: Arc<Config>,
        store: StateStore,
        services: Services,
    ) -> (Self, JoinHandle<()>) {
        let (requests, receiver) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let (cancel, cancel_rx) = watch::channel(false);
        let cancel = Arc::new(cancel);
        let state = StateMachine::new();

        let actor = instance::Instance::new(
            name.to_string(),
            config,
            store,
            services,
            state.clone(),
            Arc::clone(&cancel),
            cancel_rx,
        );
        let task = tokio::spawn(actor.run(receiver));

        let handle = Self {
            name: Arc::from(name),
            requests,
            state,
            cancel,
        };
        (handle, task)
    }

    /// Returns the instance name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.state.get_state()
    }

    /// Registers `callback` for every state change of this instance.
    pub fn subscribe_state_changed<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&LifecycleState) + Send + Sync + 'static,
    {
        self.state.subscribe(callback)
    }

    /// Abandons a start that is waiting for readiness.
    ///
    /// The spawned process is stopped and the run fails with `Cancelled`.
    /// Has no effect on a start that has not begun yet.
    pub fn cancel_start(&self) {
        self.cancel.send_replace(true);
    }

    /// Opens the existing checkout at `install_dir` when `open_or_install` is
    /// true. When false, clones it if missing and installs dependencies and
    /// models. Without `install_dir` the persisted directory is used.
    ///
    /// # Errors
    /// Any error of the open or install path.
    pub async fn initialize(&self, install_dir: Option<PathBuf>, open_or_install: bool) -> Result<()> {
        self.call(|reply| Request::Initialize {
            install_dir,
            open_or_install,
            reply,
        })
        .await?
    }

    /// Pulls the remote when an update is available.
    ///
    /// `None` when nothing was attempted, `Some(false)` when the pull was
    /// refused, `Some(true)` after a successful update and re-provisioning.
    ///
    /// # Errors
    /// `AlreadyRunning`, `Git` or any provisioning error.
    pub async fn update(&self, force: bool) -> Result<Option<bool>> {
        self.call(|reply| Request::Update { force, reply }).await?
    }

    /// Starts the tool and waits until it is ready.
    ///
    /// Returns the live process when already `Running`. A process left over
    /// from a timed out start is waited on again instead of being respawned.
    ///
    /// The start belongs to the instance, not to this future: dropping it
    /// does not abandon the start, which keeps waiting until the tool is
    /// ready or the startup timeout elapses. Use
    /// [`cancel_start`](Self::cancel_start) to abandon it.
    ///
    /// # Errors
    /// `NotInstalled`, `Startup`, `Timeout` or `Cancelled`.
    pub async fn run(&self, headless: bool) -> Result<ProcessInfo> {
        self.call(|reply| Request::Run { headless, reply }).await?
    }

    /// Stops the tool; `None` uses the configured stop timeout.
    ///
    /// Returns false when nothing was running.
    ///
    /// # Errors
    /// `Io` if the process cannot be stopped.
    pub async fn stop(&self, timeout: Option<Duration>) -> Result<bool> {
        self.call(|reply| Request::Stop { timeout, reply }).await?
    }

    /// Stops then starts the tool. A failed stop aborts the restart.
    ///
    /// # Errors
    /// Errors of `stop`, then of `run`.
    pub async fn restart(&self, headless: bool, timeout: Option<Duration>) -> Result<ProcessInfo> {
        self.call(|reply| Request::Restart {
            headless,
            timeout,
            reply,
        })
        .await?
    }

    /// Deletes the installation. Returns false when there was none.
    ///
    /// # Errors
    /// `AlreadyRunning`, or `Permission` when removal kept failing.
    pub async fn cleanup(&self) -> Result<bool> {
        self.call(|reply| Request::Cleanup { reply }).await?
    }

    /// Re-opens the installation and re-checks for updates.
    ///
    /// # Errors
    /// Any error of the open path.
    pub async fn refresh(&self) -> Result<()> {
        self.call(|reply| Request::Refresh { reply }).await?
    }

    /// Returns a snapshot of the instance.
    ///
    /// # Errors
    /// `Closed` if the actor has shut down.
    pub async fn status(&self) -> Result<InstanceStatus> {
        self.call(|reply| Request::Status { reply }).await
    }

    /// Stops any live process and ends the actor.
    pub(crate) async fn shutdown(&self) {
        if self
            .call(|reply| Request::Shutdown { reply })
            .await
            .is_err()
        {
            tracing::debug!("[SUPERVISOR] '{}' was already shut down", self.name);
        }
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(make(reply))
            .await
            .map_err(|_| Error::Closed(self.name.to_string()))?;
        response
            .await
            .map_err(|_| Error::Closed(self.name.to_string()))
    }
}

impl std::fmt::Debug for SupervisorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorHandle")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

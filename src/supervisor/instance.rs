//! The instance actor.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::{InstanceStatus, Request, Services};
use crate::cleanup::CleanupManager;
use crate::config::{Config, InstanceRecord, StateStore};
use crate::environment::{EnvironmentProvisioner, RuntimeEnvironment};
use crate::error::{Error, Result};
use crate::installer::{Installation, RepositoryInstaller};
use crate::lifecycle::{LifecycleState, StateMachine};
use crate::models::ModelAssetFetcher;
use crate::process::{LaunchSpec, ProcessInfo, ProcessSupervisor, StartOptions};

pub(super) struct Instance {
    name: String,
    config: Arc<Config>,
    store: StateStore,
    services: Services,
    installer: Arc<RepositoryInstaller>,
    provisioner: Arc<EnvironmentProvisioner>,
    fetcher: ModelAssetFetcher,
    cleanup: CleanupManager,
    state: StateMachine,
    installation: Option<Installation>,
    environment: Option<RuntimeEnvironment>,
    process: ProcessSupervisor,
    update_available: bool,
    cancel: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
}

impl Instance {
    pub(super) fn new(
        name: String,
        config: Arc<Config>,
        store: StateStore,
        services: Services,
        state: StateMachine,
        cancel: Arc<watch::Sender<bool>>,
        cancel_rx: watch::Receiver<bool>,
    ) -> Self {
        let installer = Arc::new(RepositoryInstaller::new(
            Arc::clone(&services.runner),
            config.project_name.as_str(),
            config.repository_url.as_str(),
        ));
        let provisioner = Arc::new(EnvironmentProvisioner::new(
            Arc::clone(&services.runner),
            &config,
        ));
        let fetcher = ModelAssetFetcher::new(Arc::clone(&services.downloader));
        let cleanup = CleanupManager::new(config.cleanup_attempts, config.cleanup_backoff);
        let process = ProcessSupervisor::new(Arc::clone(&services.health))
            .with_terminator(Arc::clone(&services.terminator));

        Self {
            name,
            config,
            store,
            services,
            installer,
            provisioner,
            fetcher,
            cleanup,
            state,
            installation: None,
            environment: None,
            process,
            update_available: false,
            cancel,
            cancel_rx,
        }
    }

    pub(super) async fn run(mut self, mut requests: mpsc::Receiver<Request>) {
        debug!("[SUPERVISOR:{}] Actor started", self.name);

        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(Request::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(request) => self.handle(request).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                code = self.process.wait_exit() => self.on_process_exit(code).await,
            }
        }

        debug!("[SUPERVISOR:{}] Actor stopped", self.name);
    }

    async fn handle(&mut self, request: Request) {
        // A dropped reply receiver only means the caller stopped waiting.
        match request {
            Request::Initialize {
                install_dir,
                open_or_install,
                reply,
            } => {
                let _ = reply.send(self.initialize(install_dir, open_or_install).await);
            }
            Request::Update { force, reply } => {
                let _ = reply.send(self.update(force).await);
            }
            Request::Run { headless, reply } => {
                let _ = reply.send(self.start(headless).await);
            }
            Request::Stop { timeout, reply } => {
                let _ = reply.send(self.stop(timeout).await);
            }
            Request::Restart {
                headless,
                timeout,
                reply,
            } => {
                let _ = reply.send(self.restart(headless, timeout).await);
            }
            Request::Cleanup { reply } => {
                let _ = reply.send(self.remove_installation().await);
            }
            Request::Refresh { reply } => {
                let _ = reply.send(self.refresh().await);
            }
            Request::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Request::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn status(&self) -> InstanceStatus {
        InstanceStatus {
            name: self.name.clone(),
            state: self.state.get_state(),
            installation: self.installation.clone(),
            environment: self.environment.clone(),
            process: self.process.info(),
            update_available: self.update_available,
        }
    }

    fn set_state(&self, state: LifecycleState) {
        self.state.set_state(state);
    }

    /// Moves to `Error` carrying the message of `err`, and hands it back.
    fn fail(&self, err: Error) -> Error {
        error!("[SUPERVISOR:{}] {}", self.name, err);
        self.set_state(LifecycleState::Error(err.to_string()));
        err
    }

    async fn ensure_not_running(&mut self) -> Result<()> {
        if self.process.is_running().await {
            let pid = self.process.info().map_or(0, |info| info.pid);
            return Err(Error::AlreadyRunning { pid });
        }
        Ok(())
    }

    /// Forgets the installation and returns to `NotFound`.
    fn reset(&mut self) {
        self.installation = None;
        self.environment = None;
        self.update_available = false;
        if self.state.get_state() != LifecycleState::NotFound {
            self.set_state(LifecycleState::NotFound);
        }
    }

    async fn persisted_record(&self) -> Result<InstanceRecord> {
        let store = self.store.clone();
        let name = self.name.clone();
        let record = self
            .services
            .offloader
            .run("read state", move || store.get(&name))
            .await??;
        Ok(record)
    }

    async fn persisted_directory(&self) -> Result<Option<PathBuf>> {
        Ok(self.persisted_record().await?.install_directory)
    }

    async fn persist_directory(&self, directory: Option<PathBuf>) {
        let store = self.store.clone();
        let name = self.name.clone();
        let result = self
            .services
            .offloader
            .run("write state", move || {
                store.set_install_directory(&name, directory.as_deref())
            })
            .await;
        if let Err(e) = result.and_then(|r| r.map_err(Error::from)) {
            warn!("[SUPERVISOR:{}] Could not persist directory: {}", self.name, e);
        }
    }

    async fn persist_port(&self, port: Option<u16>) {
        let store = self.store.clone();
        let name = self.name.clone();
        let result = self
            .services
            .offloader
            .run("write state", move || store.set_port(&name, port))
            .await;
        if let Err(e) = result.and_then(|r| r.map_err(Error::from)) {
            warn!("[SUPERVISOR:{}] Could not persist port: {}", self.name, e);
        }
    }

    async fn initialize(&mut self, install_dir: Option<PathBuf>, open_or_install: bool) -> Result<()> {
        self.ensure_not_running().await?;

        let directory = match install_dir {
            Some(directory) => Some(directory),
            None => self.persisted_directory().await?,
        };
        let Some(directory) = directory else {
            info!(
                "[SUPERVISOR:{}] No installation directory given or remembered",
                self.name
            );
            return Ok(());
        };

        self.reset();
        let result = if open_or_install {
            self.open(directory).await
        } else {
            self.install(directory).await
        };
        self.forget_directory_on_failure(result).await
    }

    /// A directory that failed to initialize is not offered again.
    async fn forget_directory_on_failure(&self, result: Result<()>) -> Result<()> {
        if result.is_err() {
            self.persist_directory(None).await;
        }
        result
    }

    /// Open-only path: `NotFound -> Found -> Ready`.
    async fn open(&mut self, directory: PathBuf) -> Result<()> {
        if !directory.exists() {
            return Err(self.fail(Error::NotFound(format!(
                "{} does not exist",
                directory.display()
            ))));
        }

        let installer = Arc::clone(&self.installer);
        let path = directory.clone();
        let installation = match self
            .services
            .offloader
            .try_run("open", move || installer.open(&path))
            .await
        {
            Ok(installation) => installation,
            Err(e) => return Err(self.fail(e)),
        };

        self.set_state(LifecycleState::Found);
        self.persist_directory(Some(installation.root.clone())).await;
        self.installation = Some(installation.clone());

        let provisioner = Arc::clone(&self.provisioner);
        let inst = installation.clone();
        match self
            .services
            .offloader
            .try_run("create environment", move || provisioner.create(&inst))
            .await
        {
            Ok(env) => self.environment = Some(env),
            Err(e) => return Err(self.fail(e)),
        }

        self.check_for_update().await;
        self.set_state(LifecycleState::Ready);
        Ok(())
    }

    /// Install path: clone (or reuse) then provision everything.
    async fn install(&mut self, directory: PathBuf) -> Result<()> {
        let dir = directory.clone();
        let installer = Arc::clone(&self.installer);
        let located = self
            .services
            .offloader
            .run("locate", move || -> std::io::Result<Option<PathBuf>> {
                std::fs::create_dir_all(&dir)?;
                Ok(installer.locate(&dir))
            })
            .await
            .and_then(|r| r.map_err(|e| Error::io(&directory, e)));

        let installation = match located {
            Err(e) => return Err(self.fail(e)),
            Ok(Some(root)) => self.reuse_existing(root).await?,
            Ok(None) => self.clone_fresh(directory).await?,
        };

        self.persist_directory(Some(installation.root.clone())).await;
        self.installation = Some(installation.clone());
        self.provision(installation).await
    }

    async fn reuse_existing(&mut self, root: PathBuf) -> Result<Installation> {
        info!(
            "[SUPERVISOR:{}] Found existing installation at {}",
            self.name,
            root.display()
        );
        let installer = Arc::clone(&self.installer);
        let result = self
            .services
            .offloader
            .try_run("open", move || {
                let installation = installer.open(&root)?;
                installer.init_submodules(&installation)?;
                Ok(installation)
            })
            .await;

        match result {
            Ok(installation) => {
                self.set_state(LifecycleState::Found);
                Ok(installation)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn clone_fresh(&mut self, directory: PathBuf) -> Result<Installation> {
        self.set_state(LifecycleState::Downloading);

        let installer = Arc::clone(&self.installer);
        let url = self.config.repository_url.clone();
        let branch = self.config.repository_branch.clone();
        let result = self
            .services
            .offloader
            .try_run("clone", move || {
                RepositoryInstaller::clone(&installer, &url, &branch, &directory)
            })
            .await;

        result.map_err(|e| self.fail(e))
    }

    /// `ProvisioningEnv -> InstallingDependencies -> DownloadingModels -> Ready`.
    async fn provision(&mut self, installation: Installation) -> Result<()> {
        self.set_state(LifecycleState::ProvisioningEnv);
        let provisioner = Arc::clone(&self.provisioner);
        let inst = installation.clone();
        let env = match self
            .services
            .offloader
            .try_run("create environment", move || provisioner.create(&inst))
            .await
        {
            Ok(env) => env,
            Err(e) => return Err(self.fail(e)),
        };
        self.environment = Some(env.clone());

        self.set_state(LifecycleState::InstallingDependencies);
        let provisioner = Arc::clone(&self.provisioner);
        let root = installation.root.clone();
        let extra_index = self.config.extra_index_url.clone();
        let installed = self
            .services
            .offloader
            .try_run("install dependencies", move || {
                let files = provisioner.discover_requirement_files(&root);
                provisioner.install_dependencies(&env, extra_index.as_deref(), &files)
            })
            .await;
        if let Err(e) = installed {
            return Err(self.fail(e));
        }

        self.set_state(LifecycleState::DownloadingModels);
        if let Err(e) = self.fetch_models(&installation.root).await {
            return Err(self.fail(e));
        }

        self.check_for_update().await;
        self.set_state(LifecycleState::Ready);
        Ok(())
    }

    async fn fetch_models(&self, root: &Path) -> Result<()> {
        let Some(manifest) = self.config.models_manifest.as_ref() else {
            debug!("[SUPERVISOR:{}] No model manifest configured", self.name);
            return Ok(());
        };

        let fetcher = self.fetcher.clone();
        let manifest = root.join(manifest);
        let cache = root.join(&self.config.models_cache);
        let install_root = root.to_path_buf();
        let report = self
            .services
            .offloader
            .try_run("fetch models", move || {
                fetcher.fetch(&manifest, &cache, &install_root)
            })
            .await?;

        info!(
            "[SUPERVISOR:{}] Models: {} downloaded, {} already present",
            self.name,
            report.downloaded.len(),
            report.skipped.len()
        );
        Ok(())
    }

    /// Refreshes `update_available`; failures only log.
    async fn check_for_update(&mut self) {
        let Some(installation) = self.installation.clone() else {
            self.update_available = false;
            return;
        };

        let installer = Arc::clone(&self.installer);
        let inst = installation.clone();
        let result = self
            .services
            .offloader
            .try_run("check update", move || installer.check_update(&inst))
            .await;

        match result {
            Ok((ahead, behind)) => {
                if let Some(current) = self.installation.as_mut() {
                    current.ahead = ahead;
                    current.behind = behind;
                }
                self.update_available = behind > 0;
                if self.update_available {
                    info!(
                        "[SUPERVISOR:{}] Update available ({} new commit(s))",
                        self.name, behind
                    );
                }
            }
            Err(e) => {
                warn!("[SUPERVISOR:{}] Update check failed: {}", self.name, e);
                self.update_available = false;
            }
        }
    }

    async fn update(&mut self, force: bool) -> Result<Option<bool>> {
        self.ensure_not_running().await?;

        let Some(installation) = self.installation.clone() else {
            info!("[SUPERVISOR:{}] No installation to update", self.name);
            return Ok(None);
        };
        if !self.update_available {
            info!("[SUPERVISOR:{}] Already up to date", self.name);
            return Ok(None);
        }

        self.set_state(LifecycleState::Updating);
        let installer = Arc::clone(&self.installer);
        let inst = installation.clone();
        let pulled = self
            .services
            .offloader
            .try_run("pull", move || {
                if installer.pull(&inst, force)? {
                    installer.open(&inst.root).map(Some)
                } else {
                    Ok(None)
                }
            })
            .await;

        match pulled {
            Err(e) => Err(self.fail(e)),
            Ok(None) => {
                self.set_state(LifecycleState::Ready);
                Ok(Some(false))
            }
            Ok(Some(updated)) => {
                info!(
                    "[SUPERVISOR:{}] Updated {} -> {}",
                    self.name, installation.revision, updated.revision
                );
                self.installation = Some(updated.clone());
                self.provision(updated).await?;
                Ok(Some(true))
            }
        }
    }

    async fn start(&mut self, headless: bool) -> Result<ProcessInfo> {
        // A live process outside `Running` (a timed out start) goes back
        // through `Starting` so the state reflects the outcome.
        if self.process.is_running().await && self.state.get_state() == LifecycleState::Running {
            if let Some(info) = self.process.info() {
                info!(
                    "[SUPERVISOR:{}] Already running (pid {})",
                    self.name, info.pid
                );
                return Ok(info);
            }
        }

        let (Some(installation), Some(env)) = (self.installation.clone(), self.environment.clone())
        else {
            return Err(Error::NotInstalled);
        };

        let preferred = match self.persisted_record().await {
            Ok(record) => record.port.unwrap_or(self.config.instance_port),
            Err(e) => {
                warn!("[SUPERVISOR:{}] Could not read state: {}", self.name, e);
                self.config.instance_port
            }
        };

        // Only a cancel issued from here on applies to this start.
        self.cancel.send_replace(false);

        self.set_state(LifecycleState::Starting);
        let launch = LaunchSpec::for_installation(&env, &installation, &self.config.entry_script);
        let options = StartOptions {
            address: self.config.instance_address.clone(),
            port: preferred,
            headless,
            timeout: self.config.start_timeout,
            poll_interval: self.config.poll_interval,
            stop_timeout: self.config.stop_timeout,
        };

        match self.process.start(&launch, &options, &mut self.cancel_rx).await {
            Ok(info) => {
                let remembered = (info.port != self.config.instance_port).then_some(info.port);
                self.persist_port(remembered).await;
                self.set_state(LifecycleState::Running);
                Ok(info)
            }
            Err(Error::Cancelled) => {
                self.set_state(LifecycleState::Ready);
                Err(Error::Cancelled)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn stop(&mut self, timeout: Option<Duration>) -> Result<bool> {
        if !self.process.is_running().await {
            debug!("[SUPERVISOR:{}] Nothing to stop", self.name);
            return Ok(false);
        }

        self.set_state(LifecycleState::Stopping);
        let timeout = timeout.unwrap_or(self.config.stop_timeout);
        match self.process.stop(timeout).await {
            Ok(stopped) => {
                self.set_state(LifecycleState::Ready);
                Ok(stopped)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn restart(&mut self, headless: bool, timeout: Option<Duration>) -> Result<ProcessInfo> {
        self.stop(timeout).await?;
        self.start(headless).await
    }

    async fn remove_installation(&mut self) -> Result<bool> {
        self.ensure_not_running().await?;

        let Some(installation) = self.installation.clone() else {
            info!("[SUPERVISOR:{}] No installation to remove", self.name);
            return Ok(false);
        };

        self.set_state(LifecycleState::Uninstalling);
        let cleanup = self.cleanup;
        let root = installation.root.clone();
        let report = match self
            .services
            .offloader
            .run("remove installation", move || cleanup.remove_with_report(&root))
            .await
        {
            Ok(report) => report,
            Err(e) => return Err(self.fail(e)),
        };

        if !report.removed {
            return Err(self.fail(Error::Permission(format!(
                "could not remove {} after {} attempts",
                installation.root.display(),
                report.attempts
            ))));
        }

        self.installation = None;
        self.environment = None;
        self.update_available = false;
        self.persist_directory(None).await;
        self.persist_port(None).await;
        self.set_state(LifecycleState::NotFound);
        Ok(true)
    }

    async fn refresh(&mut self) -> Result<()> {
        self.ensure_not_running().await?;

        let directory = match self.installation.as_ref() {
            Some(installation) => Some(installation.root.clone()),
            None => self.persisted_directory().await?,
        };
        let Some(directory) = directory else {
            info!("[SUPERVISOR:{}] Nothing to refresh", self.name);
            return Ok(());
        };

        self.reset();
        let result = self.open(directory).await;
        self.forget_directory_on_failure(result).await
    }

    async fn on_process_exit(&mut self, code: Option<i32>) {
        self.process.reap().await;

        let state = self.state.get_state();
        if state != LifecycleState::Running {
            info!(
                "[SUPERVISOR:{}] Process exited with {:?} while {}",
                self.name, code, state
            );
            return;
        }

        if code == Some(0) {
            info!("[SUPERVISOR:{}] Tool exited cleanly", self.name);
            self.set_state(LifecycleState::Ready);
        } else {
            let message = format!(
                "The tool exited unexpectedly (exit code {})",
                code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
            );
            error!("[SUPERVISOR:{}] {}", self.name, message);
            self.set_state(LifecycleState::Error(message));
        }
    }

    async fn shutdown(&mut self) {
        match self.process.stop(self.config.stop_timeout).await {
            Ok(true) => {
                info!("[SUPERVISOR:{}] Stopped tool on shutdown", self.name);
                self.set_state(LifecycleState::Ready);
            }
            Ok(false) => {}
            Err(e) => warn!("[SUPERVISOR:{}] Stop on shutdown failed: {}", self.name, e),
        }
    }
}

//! Lifecycle state machine.
//!
//! Holds the single authoritative [`LifecycleState`] of one instance and
//! the list of observers that are told about every transition.
//!
//! Transitions are applied by the instance actor only, so notifications
//! reach subscribers in the order the transitions happened. Subscribers
//! are invoked synchronously on the thread that called
//! [`StateMachine::set_state`], after the internal locks are released, so
//! a callback may freely read the state or drop its own subscription.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use tracing::{debug, warn};

/// What an instance is currently doing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum LifecycleState {
    /// No installation is known.
    NotFound,
    /// An existing installation was opened.
    Found,
    /// A fresh checkout is being cloned.
    Downloading,
    /// The runtime environment is being created.
    ProvisioningEnv,
    /// Packages are being installed into the environment.
    InstallingDependencies,
    /// Model assets are being fetched.
    DownloadingModels,
    /// Installed and idle.
    Ready,
    /// The tool process was spawned and is not healthy yet.
    Starting,
    /// The tool answers its readiness endpoint.
    Running,
    /// The tool process is being terminated.
    Stopping,
    /// The checkout is being pulled.
    Updating,
    /// The installation directory is being removed.
    Uninstalling,
    /// The last operation failed; carries a human-readable message.
    Error(String),
}

impl LifecycleState {
    /// Returns a short, stable name for this state.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Found => "found",
            Self::Downloading => "downloading",
            Self::ProvisioningEnv => "provisioning_env",
            Self::InstallingDependencies => "installing_dependencies",
            Self::DownloadingModels => "downloading_models",
            Self::Ready => "ready",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Updating => "updating",
            Self::Uninstalling => "uninstalling",
            Self::Error(_) => "error",
        }
    }

    /// Returns true for the `Error` state.
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Returns the error message, if this is the `Error` state.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Error(message) => Some(message),
            _ => None,
        }
    }

    /// Returns true while an operation is in flight.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Downloading
                | Self::ProvisioningEnv
                | Self::InstallingDependencies
                | Self::DownloadingModels
                | Self::Starting
                | Self::Stopping
                | Self::Updating
                | Self::Uninstalling
        )
    }

    /// Returns true if moving from `self` to `next` is a legal transition.
    ///
    /// `Error` is reachable from everywhere and any operation may be
    /// retried from `Error`.
    #[must_use]
    pub fn can_transition_to(&self, next: &Self) -> bool {
        use LifecycleState::{
            DownloadingModels, Downloading, Found, InstallingDependencies, NotFound,
            ProvisioningEnv, Ready, Running, Starting, Stopping, Uninstalling, Updating,
        };

        if next.is_error() || self.is_error() {
            return true;
        }

        matches!(
            (self, next),
            (NotFound, Found | Downloading)
                | (Found, ProvisioningEnv | Ready)
                | (Downloading, ProvisioningEnv)
                | (ProvisioningEnv, InstallingDependencies)
                | (InstallingDependencies, DownloadingModels)
                | (DownloadingModels, Ready)
                | (Ready, Starting | Updating | Uninstalling | NotFound)
                | (Starting, Running | Ready)
                | (Running, Stopping | Ready)
                | (Stopping, Ready)
                | (Updating, ProvisioningEnv | Ready)
                | (Uninstalling, NotFound)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(message) => write!(f, "error: {}", message),
            other => f.write_str(other.name()),
        }
    }
}

type Callback = Arc<dyn Fn(&LifecycleState) + Send + Sync>;

struct Shared {
    state: Mutex<LifecycleState>,
    subscribers: Mutex<Vec<(u64, Callback)>>,
    next_id: AtomicU64,
}

/// The state variable of one instance plus its observers.
///
/// Cloning is cheap and yields another handle to the same machine.
#[derive(Clone)]
pub struct StateMachine {
    shared: Arc<Shared>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Creates a machine in the `NotFound` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(LifecycleState::NotFound),
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn get_state(&self) -> LifecycleState {
        match self.shared.state.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replaces the state and notifies every subscriber with the new value.
    ///
    /// Illegal transitions are applied anyway and logged.
    pub fn set_state(&self, new: LifecycleState) {
        let previous = {
            let mut guard = match self.shared.state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::replace(&mut *guard, new.clone())
        };

        if previous.can_transition_to(&new) {
            debug!("[LIFECYCLE] {} -> {}", previous, new);
        } else {
            warn!("[LIFECYCLE] Unexpected transition {} -> {}", previous, new);
        }

        // Snapshot so callbacks can (un)subscribe without deadlocking.
        let callbacks: Vec<Callback> = match self.shared.subscribers.lock() {
            Ok(guard) => guard.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            Err(poisoned) => poisoned
                .into_inner()
                .iter()
                .map(|(_, cb)| Arc::clone(cb))
                .collect(),
        };

        for callback in callbacks {
            callback(&new);
        }
    }

    /// Registers a callback invoked on every state change.
    ///
    /// The callback stays registered until the returned [`Subscription`]
    /// is dropped or explicitly unsubscribed.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&LifecycleState) + Send + Sync + 'static,
    {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut guard) = self.shared.subscribers.lock() {
            guard.push((id, Arc::new(callback)));
        }

        Subscription {
            id,
            shared: Arc::downgrade(&self.shared),
            active: true,
        }
    }

    /// Returns the number of registered callbacks.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.lock().map(|g| g.len()).unwrap_or(0)
    }
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("state", &self.get_state())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Disposer for a state-change callback.
///
/// Unsubscribing is idempotent and safe after the machine is gone.
#[must_use = "dropping a Subscription unregisters its callback"]
pub struct Subscription {
    id: u64,
    shared: Weak<Shared>,
    active: bool,
}

impl Subscription {
    /// Unregisters the callback. Further calls do nothing.
    pub fn unsubscribe(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;

        if let Some(shared) = self.shared.upgrade() {
            if let Ok(mut guard) = shared.subscribers.lock() {
                guard.retain(|(id, _)| *id != self.id);
            }
        }
    }

    /// Returns true until the subscription is disposed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}

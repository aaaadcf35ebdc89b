//! Named instance registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Services, SupervisorHandle};
use crate::config::{Config, StateStore};
use crate::error::{Error, Result};

type Entry = (SupervisorHandle, JoinHandle<()>);

/// Creates and owns one supervisor per context name.
pub struct InstanceRegistry {
    config: Arc<Config>,
    store: StateStore,
    services: Services,
    instances: Mutex<HashMap<String, Entry>>,
}

impl InstanceRegistry {
    /// Creates an empty registry sharing `config`, `store` and `services`.
    pub fn new(config: Config, store: StateStore, services: Services) -> Self {
        Self {
            config: Arc::new(config),
            store,
            services,
            instances: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.instances
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Returns the supervisor for `name`, spawning it on first use.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// `Config` if `name` is empty.
    pub fn get_or_create(&self, name: &str) -> Result<SupervisorHandle> {
        if name.is_empty() {
            return Err(Error::Config("instance name must not be empty".to_string()));
        }

        let mut instances = self.lock();
        if let Some((handle, _)) = instances.get(name) {
            return Ok(handle.clone());
        }

        debug!("[REGISTRY] Creating instance '{}'", name);
        let (handle, task) = SupervisorHandle::spawn(
            name,
            Arc::clone(&self.config),
            self.store.clone(),
            self.services.clone(),
        );
        instances.insert(name.to_string(), (handle.clone(), task));
        Ok(handle)
    }

    /// Returns the supervisor for `name` if it exists.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<SupervisorHandle> {
        self.lock().get(name).map(|(handle, _)| handle.clone())
    }

    /// Returns the registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Shuts down and forgets `name`. Returns false if it was unknown.
    pub async fn remove(&self, name: &str) -> bool {
        let entry = self.lock().remove(name);
        let Some((handle, task)) = entry else {
            return false;
        };
        shutdown(handle, task).await;
        info!("[REGISTRY] Removed instance '{}'", name);
        true
    }

    /// Shuts down every instance.
    pub async fn clear(&self) {
        let entries: Vec<Entry> = self.lock().drain().map(|(_, entry)| entry).collect();
        for (handle, task) in entries {
            shutdown(handle, task).await;
        }
    }
}

async fn shutdown(handle: SupervisorHandle, task: JoinHandle<()>) {
    handle.shutdown().await;
    if let Err(e) = task.await {
        warn!("[REGISTRY] Instance '{}' ended abnormally: {}", handle.name(), e);
    }
}

impl std::fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("instances", &self.names())
            .finish_non_exhaustive()
    }
}

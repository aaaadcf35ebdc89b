//! Toolwarden
//!
//! Installs, provisions and supervises an externally developed tool server
//! (ComfyUI by default) on behalf of a host application.
//!
//! # Architecture
//!
//! - **Installer**: clones, opens and updates the tool's git checkout
//! - **Environment**: creates the virtual environment and installs dependencies
//! - **Models**: fetches the model assets listed in a manifest
//! - **Process**: starts the tool, waits for readiness, stops it
//! - **Supervisor**: one actor per named instance driving the lifecycle
//!
//! # Usage
//!
//! ```no_run
//! use toolwarden::config::{Config, StateStore};
//! use toolwarden::supervisor::{InstanceRegistry, Services};
//!
//! # async fn demo() -> toolwarden::Result<()> {
//! let config = Config::default();
//! let services = Services::system(&config)?;
//! let registry = InstanceRegistry::new(config, StateStore::new(StateStore::default_path()), services);
//!
//! let instance = registry.get_or_create("default")?;
//! // `false` clones when missing and provisions; `true` only opens.
//! instance.initialize(Some("/opt/comfyui".into()), false).await?;
//! let process = instance.run(true).await?;
//! println!("listening on port {}", process.port);
//! # Ok(())
//! # }
//! ```

// Clippy configuration - allow common patterns
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]

pub mod cleanup;
pub mod command;
pub mod config;
pub mod environment;
pub mod error;
pub mod installer;
pub mod lifecycle;
pub mod logging;
pub mod models;
pub mod offload;
pub mod process;
pub mod supervisor;

// Re-export main types
pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use lifecycle::{LifecycleState, StateMachine, Subscription};
pub use supervisor::{InstanceRegistry, InstanceStatus, Services, SupervisorHandle};

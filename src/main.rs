//! Toolwarden - Main entry point.
//!
//! Usage: warden [OPTIONS] <COMMAND>
//!
//! Commands:
//!   install [DIR]    Clone (or reuse) and provision the tool
//!   open [DIR]       Open an existing installation
//!   update           Pull and re-provision when the remote moved
//!   run              Start the tool and keep it running until Ctrl-C
//!   status           Print the instance state
//!   cleanup          Delete the installation
//!   refresh          Re-open the installation and re-check for updates

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use toolwarden::config::{Config, StateStore};
use toolwarden::supervisor::{InstanceRegistry, Services, SupervisorHandle};
use toolwarden::{logging, InstanceStatus, LifecycleState};

#[derive(Debug, Parser)]
#[command(name = "warden", version, about = "Installs and supervises a tool server")]
struct Cli {
    /// Instance (context) name.
    #[arg(long, global = true, default_value = "default")]
    context: String,

    /// Configuration file (defaults to ~/.toolwarden/wardenrc).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Persisted state file (defaults to ~/.toolwarden/state.toml).
    #[arg(long, global = true)]
    state_file: Option<PathBuf>,

    /// Log to stderr at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Clone (or reuse) and provision the tool in DIR.
    Install { dir: Option<PathBuf> },
    /// Open an existing installation in DIR.
    Open { dir: Option<PathBuf> },
    /// Pull the latest revision and re-provision.
    Update {
        /// Discard local changes instead of refusing a non fast-forward pull.
        #[arg(long)]
        force: bool,
    },
    /// Start the tool and keep it running until Ctrl-C.
    Run {
        /// Let the tool open its browser UI.
        #[arg(long)]
        gui: bool,
        /// Seconds to wait for a graceful stop.
        #[arg(long, value_name = "S")]
        stop_timeout: Option<f64>,
    },
    /// Print the instance state.
    Status {
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// Delete the installation.
    Cleanup,
    /// Re-open the installation and re-check for updates.
    Refresh,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match cli.config.as_deref() {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    let mut config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("warden: cannot load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if cli.verbose {
        config.log_config.level = "debug".to_string();
    }

    // Keep the guard alive until exit or buffered log lines are lost.
    let _guard = match logging::init(&config.log_config, cli.verbose) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("warden: logging disabled: {}", e);
            None
        }
    };

    let state_path = cli.state_file.clone().unwrap_or_else(StateStore::default_path);
    let services = match Services::system(&config) {
        Ok(services) => services,
        Err(e) => {
            eprintln!("warden: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let registry = InstanceRegistry::new(config, StateStore::new(state_path), services);
    let result = match registry.get_or_create(&cli.context) {
        Ok(instance) => execute(&instance, cli.command).await,
        Err(e) => Err(e),
    };
    registry.clear().await;

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("warden: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn execute(instance: &SupervisorHandle, command: Command) -> toolwarden::Result<ExitCode> {
    match command {
        Command::Install { dir } => {
            instance.initialize(dir, false).await?;
            print_status(&instance.status().await?, false);
        }
        Command::Open { dir } => {
            instance.initialize(dir, true).await?;
            print_status(&instance.status().await?, false);
        }
        Command::Update { force } => {
            instance.initialize(None, true).await?;
            match instance.update(force).await? {
                None => println!("Already up to date."),
                Some(false) => println!("Update refused; rerun with --force to discard local changes."),
                Some(true) => println!("Updated."),
            }
        }
        Command::Run { gui, stop_timeout } => {
            instance.initialize(None, true).await?;
            let process = instance.run(!gui).await?;
            println!(
                "Running (pid {}) on http://{}:{}; press Ctrl-C to stop.",
                process.pid, process.address, process.port
            );

            // The channel only wakes the wait below; the state is read fresh.
            let (changes, mut wakeups) = tokio::sync::watch::channel(());
            let _subscription = instance.subscribe_state_changed(move |state| {
                info!("[CLI] State changed to {}", state);
                changes.send_replace(());
            });

            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        warn!("[CLI] Cannot listen for Ctrl-C: {}", e);
                    }
                }
                _ = wakeups.wait_for(|_| instance.state() != LifecycleState::Running) => {
                    let state = instance.state();
                    if let Some(message) = state.error_message() {
                        eprintln!("warden: {}", message);
                        return Ok(ExitCode::FAILURE);
                    }
                    println!("The tool exited ({}).", state);
                    return Ok(ExitCode::SUCCESS);
                }
            }

            let timeout = stop_timeout.and_then(|s| Duration::try_from_secs_f64(s).ok());
            instance.stop(timeout).await?;
            println!("Stopped.");
        }
        Command::Status { json } => {
            // A missing installation still yields a status worth printing.
            if let Err(e) = instance.initialize(None, true).await {
                warn!("[CLI] Could not open installation: {}", e);
            }
            print_status(&instance.status().await?, json);
        }
        Command::Cleanup => {
            instance.initialize(None, true).await?;
            if instance.cleanup().await? {
                println!("Installation removed.");
            } else {
                println!("Nothing to remove.");
            }
        }
        Command::Refresh => {
            instance.refresh().await?;
            print_status(&instance.status().await?, false);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_status(status: &InstanceStatus, json: bool) {
    if json {
        match serde_json::to_string_pretty(status) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("warden: cannot serialize status: {}", e),
        }
        return;
    }

    println!("Instance:  {}", status.name);
    println!("State:     {}", status.state);
    if let Some(installation) = &status.installation {
        println!("Directory: {}", installation.root.display());
        println!(
            "Revision:  {} ({})",
            installation.revision, installation.branch
        );
    }
    if let Some(environment) = &status.environment {
        println!("Python:    {}", environment.interpreter.display());
    }
    if let Some(process) = &status.process {
        println!("Process:   pid {} on {}:{}", process.pid, process.address, process.port);
    }
    if status.update_available {
        println!("Update:    available");
    }
}

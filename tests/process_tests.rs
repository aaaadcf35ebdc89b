//! Integration tests for the process supervisor.
//!
//! Child processes are small `sh` scripts; readiness is either scripted
//! through a fake probe or answered by a real HTTP server.

#![cfg(unix)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use toolwarden::ErrorKind;
use toolwarden::process::{
    HealthCheck, HealthFuture, HttpHealthCheck, LaunchSpec, ProcessSupervisor, StartOptions,
    Terminator,
};

/// Reports ready once it has been asked `ready_after` times.
struct ScriptedHealth {
    calls: AtomicUsize,
    ready_after: usize,
}

impl ScriptedHealth {
    fn ready_after(ready_after: usize) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            ready_after,
        })
    }

    fn never() -> Arc<Self> {
        Self::ready_after(usize::MAX)
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl HealthCheck for ScriptedHealth {
    fn check<'a>(&'a self, _address: &'a str, _port: u16) -> HealthFuture<'a> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Box::pin(async move { call >= self.ready_after })
    }
}

/// Readiness answer that a test can flip.
struct SwitchHealth(AtomicBool);

impl HealthCheck for SwitchHealth {
    fn check<'a>(&'a self, _address: &'a str, _port: u16) -> HealthFuture<'a> {
        let ready = self.0.load(Ordering::SeqCst);
        Box::pin(async move { ready })
    }
}

/// Never manages to deliver a termination request.
struct DeafTerminator;

impl Terminator for DeafTerminator {
    fn terminate(&self, _child: &mut tokio::process::Child) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "termination refused",
        ))
    }
}

fn shell(script: &str) -> LaunchSpec {
    LaunchSpec {
        program: PathBuf::from("sh"),
        args: vec!["-c".into(), script.into()],
        cwd: std::env::temp_dir(),
    }
}

fn options(timeout: Duration) -> StartOptions {
    StartOptions {
        address: "127.0.0.1".to_string(),
        port: 0,
        headless: true,
        timeout,
        poll_interval: Duration::from_millis(50),
        stop_timeout: Duration::from_secs(2),
    }
}

fn no_cancel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

// ============================================================================
// Start Tests
// ============================================================================

mod start_tests {
    use super::*;

    #[tokio::test]
    async fn test_start_waits_for_readiness() {
        let health = ScriptedHealth::ready_after(3);
        let mut supervisor = ProcessSupervisor::new(health.clone());
        let (_tx, mut cancel) = no_cancel();

        let info = supervisor
            .start(&shell("exec sleep 30"), &options(Duration::from_secs(10)), &mut cancel)
            .await
            .unwrap();

        assert!(info.pid > 0);
        assert_ne!(info.port, 0);
        assert_eq!(health.calls(), 3);
        assert!(supervisor.is_running().await);

        assert!(supervisor.stop(Duration::from_secs(2)).await.unwrap());
        assert!(!supervisor.is_running().await);
        assert!(supervisor.info().is_none());
    }

    #[tokio::test]
    async fn test_second_start_returns_live_process() {
        let mut supervisor = ProcessSupervisor::new(ScriptedHealth::ready_after(1));
        let (_tx, mut cancel) = no_cancel();
        let launch = shell("exec sleep 30");
        let options = options(Duration::from_secs(10));

        let first = supervisor.start(&launch, &options, &mut cancel).await.unwrap();
        let second = supervisor.start(&launch, &options, &mut cancel).await.unwrap();

        assert_eq!(first, second);
        supervisor.stop(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_busy_port_is_replaced() {
        let busy = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let taken = busy.local_addr().unwrap().port();
        let mut supervisor = ProcessSupervisor::new(ScriptedHealth::ready_after(1));
        let (_tx, mut cancel) = no_cancel();
        let mut options = options(Duration::from_secs(10));
        options.port = taken;

        let info = supervisor
            .start(&shell("exec sleep 30"), &options, &mut cancel)
            .await
            .unwrap();

        assert_ne!(info.port, taken);
        supervisor.stop(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_early_exit_is_startup_error() {
        let mut supervisor = ProcessSupervisor::new(ScriptedHealth::never());
        let (_tx, mut cancel) = no_cancel();

        let err = supervisor
            .start(&shell("exit 3"), &options(Duration::from_secs(10)), &mut cancel)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Startup);
        assert!(matches!(err, toolwarden::Error::Startup { code: Some(3) }));
        assert!(!supervisor.is_running().await);
    }

    #[tokio::test]
    async fn test_clean_early_exit_is_still_startup_error() {
        let mut supervisor = ProcessSupervisor::new(ScriptedHealth::never());
        let (_tx, mut cancel) = no_cancel();

        let err = supervisor
            .start(&shell("exit 0"), &options(Duration::from_secs(10)), &mut cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, toolwarden::Error::Startup { code: Some(0) }));
    }

    #[tokio::test]
    async fn test_timeout_leaves_process_running() {
        let mut supervisor = ProcessSupervisor::new(ScriptedHealth::never());
        let (_tx, mut cancel) = no_cancel();
        let started = Instant::now();

        let err = supervisor
            .start(
                &shell("exec sleep 30"),
                &options(Duration::from_millis(300)),
                &mut cancel,
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(supervisor.is_running().await, "timeout must not kill the tool");

        assert!(supervisor.stop(Duration::from_secs(2)).await.unwrap());
        assert!(!supervisor.is_running().await);
    }

    #[tokio::test]
    async fn test_start_after_timeout_rechecks_same_process() {
        let health = Arc::new(SwitchHealth(AtomicBool::new(false)));
        let mut supervisor = ProcessSupervisor::new(health.clone());
        let (_tx, mut cancel) = no_cancel();
        let launch = shell("exec sleep 30");
        let options = options(Duration::from_millis(300));

        let err = supervisor.start(&launch, &options, &mut cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        let pid = supervisor.info().unwrap().pid;
        assert!(!supervisor.is_ready());

        let err = supervisor.start(&launch, &options, &mut cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(supervisor.info().unwrap().pid, pid);

        health.0.store(true, Ordering::SeqCst);
        let info = supervisor.start(&launch, &options, &mut cancel).await.unwrap();

        assert_eq!(info.pid, pid);
        assert!(supervisor.is_ready());
        assert!(supervisor.stop(Duration::from_secs(2)).await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_poll_interval_is_config_error() {
        let mut supervisor = ProcessSupervisor::new(ScriptedHealth::ready_after(1));
        let (_tx, mut cancel) = no_cancel();
        let mut options = options(Duration::from_secs(1));
        options.poll_interval = Duration::ZERO;

        let err = supervisor
            .start(&shell("exec sleep 30"), &options, &mut cancel)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(supervisor.info().is_none());
    }

    #[tokio::test]
    async fn test_cancel_stops_child() {
        let mut supervisor = ProcessSupervisor::new(ScriptedHealth::never());
        let (tx, mut cancel) = no_cancel();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            tx.send_replace(true);
            tx
        });

        let started = Instant::now();
        let err = supervisor
            .start(&shell("exec sleep 30"), &options(Duration::from_secs(30)), &mut cancel)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!supervisor.is_running().await);
        drop(canceller.await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_program_is_io_error() {
        let mut supervisor = ProcessSupervisor::new(ScriptedHealth::ready_after(1));
        let (_tx, mut cancel) = no_cancel();
        let launch = LaunchSpec {
            program: PathBuf::from("/nonexistent/toolwarden-python"),
            args: Vec::new(),
            cwd: std::env::temp_dir(),
        };

        let err = supervisor
            .start(&launch, &options(Duration::from_secs(1)), &mut cancel)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Io);
    }
}

// ============================================================================
// Stop and Exit Tests
// ============================================================================

mod stop_tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_with_nothing_running() {
        let mut supervisor = ProcessSupervisor::new(ScriptedHealth::never());
        assert!(!supervisor.stop(Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill() {
        let mut supervisor = ProcessSupervisor::new(ScriptedHealth::ready_after(1));
        let (_tx, mut cancel) = no_cancel();
        supervisor
            .start(
                &shell("trap '' TERM; exec sleep 30"),
                &options(Duration::from_secs(10)),
                &mut cancel,
            )
            .await
            .unwrap();

        let started = Instant::now();
        assert!(supervisor.stop(Duration::from_millis(300)).await.unwrap());

        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!supervisor.is_running().await);
    }

    #[tokio::test]
    async fn test_refused_termination_keeps_process_tracked() {
        let mut supervisor = ProcessSupervisor::new(ScriptedHealth::ready_after(1))
            .with_terminator(Arc::new(DeafTerminator));
        let (_tx, mut cancel) = no_cancel();
        let info = supervisor
            .start(&shell("exec sleep 30"), &options(Duration::from_secs(10)), &mut cancel)
            .await
            .unwrap();

        let err = supervisor.stop(Duration::from_millis(200)).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(supervisor.is_running().await);
        assert_eq!(supervisor.info().unwrap().pid, info.pid);
    }

    #[tokio::test]
    async fn test_wait_exit_reports_code() {
        let mut supervisor = ProcessSupervisor::new(ScriptedHealth::ready_after(1));
        let (_tx, mut cancel) = no_cancel();
        supervisor
            .start(
                &shell("sleep 0.3; exit 4"),
                &options(Duration::from_secs(10)),
                &mut cancel,
            )
            .await
            .unwrap();

        let code = tokio::time::timeout(Duration::from_secs(10), supervisor.wait_exit())
            .await
            .unwrap();
        assert_eq!(code, Some(4));

        supervisor.reap().await;
        assert!(supervisor.info().is_none());
    }
}

// ============================================================================
// HTTP Readiness Tests
// ============================================================================

mod http_tests {
    use super::*;

    fn has_python() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_real_http_server_becomes_ready() {
        if !has_python() {
            eprintln!("python3 not available; skipping");
            return;
        }

        let health = Arc::new(HttpHealthCheck::new("/").unwrap());
        let mut supervisor = ProcessSupervisor::new(health);
        let (_tx, mut cancel) = no_cancel();
        // Positional parameters: $2 is the listen address, $4 the port.
        let launch = shell("exec python3 -m http.server \"$4\" --bind \"$2\"");

        let info = supervisor
            .start(&launch, &options(Duration::from_secs(30)), &mut cancel)
            .await
            .unwrap();

        let url = format!("http://127.0.0.1:{}/", info.port);
        let status = reqwest::Client::builder()
            .no_proxy()
            .build()
            .unwrap()
            .get(&url)
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status, reqwest::StatusCode::OK);

        assert!(supervisor.stop(Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_probe_is_false_when_nothing_listens() {
        let probe = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let health = HttpHealthCheck::new("/system_stats").unwrap();
        assert!(!health.check("127.0.0.1", port).await);
    }
}

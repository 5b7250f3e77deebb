//! Daemon startup and main loop for the ABR orchestrator
//!
//! Wires the job manager, reconciler, metrics updater and API server
//! together and owns the shutdown sequence.

use crate::api_server::{run_api_server, AppState, ServerError};
use crate::config::{Config, ConfigError};
use crate::encode::FfmpegLauncher;
use crate::ingest::{NginxRtmpStatus, PollError};
use crate::job_manager::{JobManager, JobManagerSettings};
use crate::lock::StreamLocks;
use crate::metrics::{
    build_snapshot, collect_system_metrics, new_shared_metrics, Counters, SharedMetrics,
};
use crate::reconciler::Reconciler;
use crate::startup::{run_startup_checks, StartupError};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Extra time beyond the encoder stop grace allowed for monitors to finish
const SHUTDOWN_MARGIN: Duration = Duration::from_secs(5);

const METRICS_INTERVAL: Duration = Duration::from_millis(500);

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Ingest status client error: {0}")]
    Ingest(#[from] PollError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    pub metrics: SharedMetrics,
    pub manager: JobManager,
    reconciler: Option<Reconciler>,
}

impl Daemon {
    /// Load config from file (with environment overrides) and initialize
    pub async fn new<P: AsRef<Path>>(config_path: P, skip_checks: bool) -> Result<Self, DaemonError> {
        let config = Config::load(config_path)?;
        Self::with_config(config, skip_checks)
    }

    /// Initialize with an already loaded configuration
    ///
    /// Runs startup checks, then builds the job manager and, when enabled,
    /// the reconciler with its ingest status client.
    pub fn with_config(config: Config, skip_checks: bool) -> Result<Self, DaemonError> {
        let report = run_startup_checks(&config, skip_checks)?;
        info!(
            encoder_major = ?report.encoder_major,
            stale_locks_removed = report.stale_locks_removed,
            "startup checks passed"
        );

        let manager = JobManager::new(
            JobManagerSettings::from_config(&config),
            StreamLocks::new(&config.output.lock_dir),
            Arc::new(FfmpegLauncher::new(config.encoder.binary.clone())),
            Arc::new(Counters::default()),
        );

        let reconciler = if config.reconciler.enabled {
            let source = NginxRtmpStatus::from_config(&config.ingest)?;
            info!(url = %source.url(), "reconciler polling ingest status");
            Some(Reconciler::new(
                Arc::new(source),
                manager.clone(),
                Duration::from_secs(config.reconciler.poll_interval_secs),
            ))
        } else {
            info!("reconciler disabled; jobs start only through the API");
            None
        };

        Ok(Self {
            config,
            metrics: new_shared_metrics(),
            manager,
            reconciler,
        })
    }

    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    /// Start the metrics update task
    ///
    /// Periodically rebuilds the shared snapshot from the job table,
    /// counters and system state.
    pub fn start_metrics_updater(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let metrics = self.metrics.clone();
        let manager = self.manager.clone();
        tokio::spawn(async move {
            loop {
                let snapshot = build_snapshot(
                    &manager.list_all(),
                    manager.counters(),
                    collect_system_metrics(),
                );
                *metrics.write().await = snapshot;

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(METRICS_INTERVAL) => {}
                }
            }
        })
    }

    /// Run every component until ctrl-c, SIGTERM or a fatal server error,
    /// then shut down: refuse new starts, stop all encoders and wait for
    /// monitors.
    pub async fn run_with_server(self) -> Result<(), DaemonError> {
        self.run_until(shutdown_signal()).await
    }

    /// Like [`Daemon::run_with_server`], with `stop` standing in for the
    /// process signals
    pub async fn run_until(self, stop: impl Future<Output = ()>) -> Result<(), DaemonError> {
        let shutdown = CancellationToken::new();

        let updater = self.start_metrics_updater(shutdown.clone());

        let reconciler = self
            .reconciler
            .map(|reconciler| tokio::spawn(reconciler.run(shutdown.clone())));

        let state = AppState {
            manager: self.manager.clone(),
            metrics: self.metrics.clone(),
        };
        let bind = self.config.server.bind.clone();
        let server_shutdown = shutdown.clone();
        let mut server =
            tokio::spawn(async move { run_api_server(&bind, state, server_shutdown).await });

        let mut result = Ok(());
        tokio::select! {
            _ = stop => info!("shutdown requested"),
            served = &mut server => {
                match served {
                    Ok(Err(e)) => {
                        error!(error = %e, "API server failed");
                        result = Err(DaemonError::Server(e));
                    }
                    Ok(Ok(())) => warn!("API server exited"),
                    Err(e) => error!(error = %e, "API server task panicked"),
                }
            }
        }

        shutdown.cancel();
        if let Some(handle) = reconciler {
            let _ = handle.await;
        }

        let wait = self.manager.settings().stop_grace + SHUTDOWN_MARGIN;
        if self.manager.shutdown(wait).await {
            info!("all jobs stopped");
        }

        let _ = updater.await;
        if !server.is_finished() {
            let _ = server.await;
        }
        result
    }
}

/// Resolves on ctrl-c or SIGTERM. A signal that cannot be listened for is
/// logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.output.root = dir.path().join("hls");
        config.output.lock_dir = dir.path().join("locks");
        config
    }

    #[tokio::test]
    async fn test_daemon_initialization_without_checks() {
        let dir = TempDir::new().unwrap();
        let daemon = Daemon::with_config(test_config(&dir), true).unwrap();

        assert!(daemon.reconciler.is_some());
        assert!(daemon.manager.list_all().is_empty());
        assert_eq!(daemon.manager.settings().ladder.len(), 4);
        assert!(dir.path().join("hls").is_dir());
        assert!(dir.path().join("locks").is_dir());
    }

    #[tokio::test]
    async fn test_reconciler_can_be_disabled() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.reconciler.enabled = false;

        let daemon = Daemon::with_config(config, true).unwrap();
        assert!(daemon.reconciler.is_none());
    }

    #[tokio::test]
    async fn test_metrics_updater_fills_snapshot() {
        let dir = TempDir::new().unwrap();
        let daemon = Daemon::with_config(test_config(&dir), true).unwrap();
        let shutdown = CancellationToken::new();

        let handle = daemon.start_metrics_updater(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(daemon.metrics.read().await.timestamp_unix_ms > 0);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_bind_address_is_reported() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.reconciler.enabled = false;
        config.server.bind = "not-an-address".to_string();

        let daemon = Daemon::with_config(config, true).unwrap();
        assert!(matches!(
            daemon.run_with_server().await,
            Err(DaemonError::Server(ServerError::Bind { .. }))
        ));
    }

    #[tokio::test]
    async fn test_stop_future_shuts_daemon_down() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.reconciler.enabled = false;
        config.server.bind = "127.0.0.1:0".to_string();

        let daemon = Daemon::with_config(config, true).unwrap();
        let manager = daemon.manager.clone();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let run = tokio::spawn(daemon.run_until(async {
            let _ = rx.await;
        }));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!run.is_finished());
        tx.send(()).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert!(matches!(
            manager.start("alpha").await,
            Err(crate::jobs::StartError::ShuttingDown)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sigterm_triggers_shutdown() {
        let mut signalled = Box::pin(shutdown_signal());
        // First poll installs the handlers
        assert!(
            tokio::time::timeout(Duration::from_millis(100), &mut signalled)
                .await
                .is_err()
        );

        let status = std::process::Command::new("kill")
            .arg("-TERM")
            .arg(std::process::id().to_string())
            .status()
            .unwrap();
        assert!(status.success());

        tokio::time::timeout(Duration::from_secs(5), signalled)
            .await
            .expect("SIGTERM should resolve the shutdown signal");
    }
}

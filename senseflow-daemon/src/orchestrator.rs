//! Daemon orchestration -- assembly, output wiring, and lifecycle management.
//!
//! The [`Orchestrator`] is the central coordinator of `senseflow-daemon`.
//! It validates configuration, builds the ingestion manager with one session
//! per configured device, forwards normalized measurements to the output
//! writer, and runs the main loop until a shutdown signal arrives.
//!
//! # Shutdown Order (producers first)
//!
//! 1. Ingestion manager (cancel every device session)
//! 2. Record writer (drain remaining measurements, flush output)
//! 3. Uptime updater

use std::future::Future;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use senseflow_core::config::SenseflowConfig;
use senseflow_core::metrics as m;
use senseflow_core::pipeline::Pipeline;
use senseflow_core::types::Measurement;
use senseflow_ingest::{
    IngestSettings, IngestionManager, IngestionManagerBuilder, MqttConnector, TransportConnector,
};

use crate::health::{DaemonHealth, DeviceHealth, ModuleHealth, aggregate_status};
use crate::metrics_server;

/// Interval between periodic health log lines.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// The main daemon orchestrator.
///
/// Generic over the transport so tests can drive sessions without a broker.
pub struct Orchestrator<C: TransportConnector = MqttConnector> {
    /// Loaded and validated configuration.
    config: SenseflowConfig,
    /// Ingestion manager (absent when `[ingest] enabled = false`).
    manager: Option<IngestionManager<C, mpsc::Sender<Measurement>>>,
    /// Measurement receiver handed to the record writer on `run`.
    record_rx: Option<mpsc::Receiver<Measurement>>,
    /// Shutdown broadcast sender (signals all background tasks).
    shutdown_tx: broadcast::Sender<()>,
    /// Daemon start time (for uptime reporting).
    start_time: Instant,
}

impl Orchestrator<MqttConnector> {
    /// Load configuration and build the orchestrator.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read or parsed
    /// - Configuration validation fails
    /// - Any device registration is invalid
    pub async fn build(config_path: &Path) -> Result<Self> {
        let config = SenseflowConfig::load(config_path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to load config: {}", e))?;
        Self::build_from_config(config).await
    }

    /// Build from an already-loaded configuration using the MQTT transport.
    pub async fn build_from_config(config: SenseflowConfig) -> Result<Self> {
        let settings = IngestSettings::from_core(&config.ingest);
        Self::build_with_connector(config, MqttConnector::new(&settings))
    }
}

impl<C: TransportConnector> Orchestrator<C> {
    /// Build from a configuration and an explicit transport connector.
    pub fn build_with_connector(config: SenseflowConfig, connector: C) -> Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("config validation failed: {}", e))?;

        // Install metrics recorder before any session records metrics
        if config.metrics.enabled {
            metrics_server::install_metrics_recorder(&config.metrics)?;
            tracing::info!(port = config.metrics.port, "metrics endpoint enabled");
        }

        let (shutdown_tx, _) = broadcast::channel(16);

        let (manager, record_rx) = if config.ingest.enabled {
            tracing::info!(devices = config.devices.len(), "initializing ingestion manager");
            let (manager, record_rx) = IngestionManagerBuilder::new(connector)
                .core_config(&config)
                .and_then(IngestionManagerBuilder::build)
                .map_err(|e| anyhow::anyhow!("failed to build ingestion manager: {}", e))?;
            (Some(manager), record_rx)
        } else {
            tracing::info!("ingest disabled, no device sessions will start");
            (None, None)
        };

        if config.metrics.enabled {
            record_daemon_metrics(config.devices.len());
        }

        tracing::info!(
            ingest_enabled = manager.is_some(),
            devices = config.devices.len(),
            "orchestrator initialized"
        );

        Ok(Self {
            config,
            manager,
            record_rx,
            shutdown_tx,
            start_time: Instant::now(),
        })
    }

    /// Start ingestion and write measurements to stdout until SIGTERM or SIGINT.
    pub async fn run(&mut self) -> Result<()> {
        self.run_until(wait_for_shutdown_signal(), tokio::io::stdout())
            .await
            .map(|_| ())
    }

    /// Start ingestion and write measurements to `output` until `shutdown` resolves.
    ///
    /// Returns the output writer after it has been drained and flushed.
    pub async fn run_until<F, W>(&mut self, shutdown: F, output: W) -> Result<W>
    where
        F: Future<Output = Result<&'static str>> + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pid_file = self.config.general.pid_file.clone();
        if !pid_file.is_empty() {
            write_pid_file(Path::new(&pid_file))?;
        }

        if let Some(manager) = self.manager.as_mut() {
            tracing::info!("starting ingestion manager");
            if let Err(e) = manager.start().await {
                tracing::error!(error = %e, "ingestion manager failed to start");
                if !pid_file.is_empty() {
                    remove_pid_file(Path::new(&pid_file));
                }
                return Err(e.into());
            }
        }

        let output = match self.record_rx.take() {
            Some(record_rx) => OutputStage::Writing(spawn_record_writer(
                record_rx,
                output,
                self.shutdown_tx.subscribe(),
            )),
            None => OutputStage::Idle(output),
        };

        let uptime_task = self.config.metrics.enabled.then(|| {
            spawn_uptime_updater(self.start_time, self.shutdown_tx.subscribe())
        });

        tracing::info!("entering main loop");
        tokio::pin!(shutdown);
        let mut health_interval = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        health_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let signal = loop {
            tokio::select! {
                signal = &mut shutdown => break signal,
                _ = health_interval.tick() => {
                    let health = self.health().await;
                    if health.status.is_healthy() {
                        tracing::debug!(uptime_secs = health.uptime_secs, "daemon healthy");
                    } else {
                        tracing::warn!(status = ?health.status, "daemon not healthy");
                    }
                }
            }
        };
        match &signal {
            Ok(name) => tracing::info!(signal = name, "shutdown signal received"),
            Err(e) => tracing::error!(error = %e, "shutdown signal handler failed"),
        }

        self.shutdown().await?;

        tracing::info!("broadcasting shutdown signal to all tasks");
        let _ = self.shutdown_tx.send(());

        let output = match output {
            OutputStage::Writing(task) => task
                .await
                .map_err(|e| anyhow::anyhow!("record writer task failed: {}", e))?,
            OutputStage::Idle(output) => output,
        };

        if let Some(task) = uptime_task {
            let _ = task.await;
        }

        if !pid_file.is_empty() {
            remove_pid_file(Path::new(&pid_file));
        }

        signal?;
        Ok(output)
    }

    /// Stop the ingestion manager (cancels every device session).
    async fn shutdown(&mut self) -> Result<()> {
        if let Some(manager) = self.manager.as_mut() {
            tracing::info!("stopping ingestion manager");
            manager.stop().await?;
        }
        Ok(())
    }

    /// Get the current aggregated health status.
    pub async fn health(&self) -> DaemonHealth {
        let (ingest_status, devices) = match &self.manager {
            Some(manager) => {
                let devices = manager
                    .active_devices()
                    .into_iter()
                    .filter_map(|id| {
                        let state = manager.session_state(&id)?;
                        Some(DeviceHealth { id, state })
                    })
                    .collect();
                (manager.health_check().await, devices)
            }
            None => (senseflow_core::pipeline::HealthStatus::Healthy, Vec::new()),
        };

        let modules = vec![ModuleHealth {
            name: "ingest".to_owned(),
            enabled: self.manager.is_some(),
            status: ingest_status,
        }];

        let uptime_secs = self.start_time.elapsed().as_secs();
        if self.config.metrics.enabled {
            #[allow(clippy::cast_precision_loss)]
            metrics::gauge!(m::DAEMON_UPTIME_SECONDS).set(uptime_secs as f64);
        }

        DaemonHealth {
            status: aggregate_status(&modules),
            uptime_secs,
            modules,
            devices,
        }
    }

    /// Get a reference to the loaded configuration.
    pub fn config(&self) -> &SenseflowConfig {
        &self.config
    }
}

/// Where the output writer lives while the daemon runs.
enum OutputStage<W> {
    /// Owned by the record writer task.
    Writing(JoinHandle<W>),
    /// Unused because ingest is disabled.
    Idle(W),
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
///
/// Returns the name of the signal that triggered the shutdown.
///
/// # Errors
///
/// Returns an error if signal handlers cannot be installed.
async fn wait_for_shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("failed to install SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("failed to install SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Write the current process PID to a file.
///
/// Used to prevent duplicate daemon instances.
///
/// # Security
///
/// - Uses `create_new(true)` to atomically create file (prevents TOCTOU races)
/// - Verifies the created file is a regular file
/// - Creates parent directory with restrictive permissions (0o700)
///
/// # Errors
///
/// Returns an error if the PID file already exists or cannot be written.
pub fn write_pid_file(path: &Path) -> Result<()> {
    use std::fs::{self, OpenOptions};
    use std::io::{ErrorKind, Write};

    if let Some(parent) = path.parent() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            let mut builder = fs::DirBuilder::new();
            builder.mode(0o700).recursive(true);
            builder.create(parent)?;
        }
        #[cfg(not(unix))]
        {
            fs::create_dir_all(parent)?;
        }
    }

    let pid = std::process::id();

    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            let existing_pid = fs::read_to_string(path).unwrap_or_else(|_| "unknown".to_string());
            return Err(anyhow::anyhow!(
                "PID file {} already exists with PID: {}. Is another instance running?",
                path.display(),
                existing_pid.trim()
            ));
        }
        Err(e) => return Err(e.into()),
    };

    let metadata = file.metadata()?;
    if !metadata.is_file() {
        let _ = fs::remove_file(path);
        return Err(anyhow::anyhow!(
            "PID file {} is not a regular file",
            path.display()
        ));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    writeln!(file, "{}", pid)?;

    tracing::info!(pid = pid, path = %path.display(), "PID file written");
    Ok(())
}

/// Remove the PID file on daemon shutdown.
///
/// Logs a warning but does not fail if the file cannot be removed.
pub fn remove_pid_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove PID file");
    } else {
        tracing::info!(path = %path.display(), "PID file removed");
    }
}

/// Spawn the task that writes each measurement as one JSON line.
///
/// On shutdown the task drains whatever is still queued, flushes the
/// writer, and hands it back through the `JoinHandle`.
pub fn spawn_record_writer<W>(
    mut record_rx: mpsc::Receiver<Measurement>,
    mut output: W,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut written: u64 = 0;
        loop {
            tokio::select! {
                record = record_rx.recv() => {
                    match record {
                        Some(record) => {
                            write_record(&mut output, &record).await;
                            written += 1;
                        }
                        None => {
                            tracing::debug!("record channel closed, exiting writer");
                            break;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    while let Ok(record) = record_rx.try_recv() {
                        write_record(&mut output, &record).await;
                        written += 1;
                    }
                    tracing::debug!("record writer shutting down");
                    break;
                }
            }
        }

        if let Err(e) = output.flush().await {
            tracing::warn!(error = %e, "failed to flush measurement output");
        }
        tracing::info!(records = written, "record writer finished");
        output
    })
}

async fn write_record<W: AsyncWrite + Unpin>(output: &mut W, record: &Measurement) {
    let mut line = match serde_json::to_vec(record) {
        Ok(line) => line,
        Err(e) => {
            tracing::warn!(device = %record.box_id, error = %e, "failed to serialize measurement");
            return;
        }
    };
    line.push(b'\n');
    if let Err(e) = output.write_all(&line).await {
        tracing::warn!(device = %record.box_id, error = %e, "failed to write measurement");
    }
}

/// Record daemon-level metrics (build info, devices registered).
///
/// This should be called once during orchestrator initialization.
fn record_daemon_metrics(device_count: usize) {
    metrics::gauge!(m::DAEMON_BUILD_INFO, "version" => env!("CARGO_PKG_VERSION")).set(1.0);

    #[allow(clippy::cast_precision_loss)]
    metrics::gauge!(m::DAEMON_DEVICES_REGISTERED).set(device_count as f64);

    tracing::debug!(
        device_count = device_count,
        version = env!("CARGO_PKG_VERSION"),
        "daemon metrics recorded"
    );
}

/// Spawn a background task that periodically updates the uptime metric.
///
/// Updates every 10 seconds to keep the metric fresh for Prometheus scrapes.
fn spawn_uptime_updater(
    start_time: Instant,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let uptime_secs = start_time.elapsed().as_secs();
                    #[allow(clippy::cast_precision_loss)]
                    metrics::gauge!(m::DAEMON_UPTIME_SECONDS).set(uptime_secs as f64);
                }
                _ = shutdown_rx.recv() => {
                    tracing::debug!("uptime updater shutting down");
                    break;
                }
            }
        }
    })
}

//! CLI argument definitions for senseflow-daemon.
//!
//! Uses `clap` v4 derive macros to parse command-line arguments.

use std::path::PathBuf;

use clap::Parser;

use senseflow_core::config::SenseflowConfig;

/// senseflow sensor ingestion daemon.
///
/// Connects to every configured device broker, decodes and filters
/// incoming payloads, and writes normalized measurements as JSON lines.
#[derive(Parser, Debug)]
#[command(name = "senseflow-daemon")]
#[command(version, about, long_about = None)]
pub struct DaemonCli {
    /// Path to senseflow.toml configuration file.
    #[arg(short, long, default_value = "/etc/senseflow/senseflow.toml")]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    ///
    /// Takes precedence over the config file and environment variables.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override log format (json, pretty).
    ///
    /// Takes precedence over the config file and environment variables.
    #[arg(long)]
    pub log_format: Option<String>,

    /// Validate configuration file and exit without starting the daemon.
    #[arg(long)]
    pub validate: bool,

    /// Override PID file path (takes precedence over config file).
    #[arg(long)]
    pub pid_file: Option<String>,
}

impl DaemonCli {
    /// Apply command-line overrides on top of the loaded configuration.
    pub fn apply_overrides(&self, config: &mut SenseflowConfig) {
        if let Some(level) = &self.log_level {
            config.general.log_level = level.clone();
        }
        if let Some(format) = &self.log_format {
            config.general.log_format = format.clone();
        }
        if let Some(pid_file) = &self.pid_file {
            config.general.pid_file = pid_file.clone();
        }
    }
}

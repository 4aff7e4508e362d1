use anyhow::Result;
use clap::Parser;

use senseflow_core::config::SenseflowConfig;
use senseflow_daemon::cli::DaemonCli;
use senseflow_daemon::logging::init_tracing;
use senseflow_daemon::orchestrator::Orchestrator;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = DaemonCli::parse();

    let mut config = SenseflowConfig::load(&cli.config)
        .await
        .map_err(|e| anyhow::anyhow!("failed to load {}: {}", cli.config.display(), e))?;
    cli.apply_overrides(&mut config);
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("config validation failed: {}", e))?;

    if cli.validate {
        println!(
            "{}: configuration is valid ({} device(s))",
            cli.config.display(),
            config.devices.len()
        );
        return Ok(());
    }

    init_tracing(&config.general)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "senseflow-daemon starting"
    );

    let mut orchestrator = Orchestrator::build_from_config(config).await?;
    orchestrator.run().await?;

    tracing::info!("senseflow-daemon shut down");
    Ok(())
}

mod cli;

use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use rtsp_gateway::config::AppConfig;
use rtsp_gateway::engine::{
    Collaborators, CountingSink, InferenceEngine, NoopInferenceEngine, SimulatedInferenceEngine,
    SimulatedPipelineEngine, StdioChannel,
};
use rtsp_gateway::logging::{LoggingOptions, init_logging};
use rtsp_gateway::orchestrator::Orchestrator;

use crate::cli::Args;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config =
        AppConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(dir) = args.log_dir {
        config.log.dir = Some(dir);
    }

    let (logging, guard) = init_logging(&LoggingOptions {
        directive: Some(
            args.log_level
                .unwrap_or_else(|| format!("rtsp_gateway={}", config.log.level)),
        ),
        log_dir: config.log.dir.clone(),
        retention_days: Some(config.log.retention_days),
    })?;

    if args.test_config {
        if test_configuration(&config) {
            return Ok(());
        }
        drop(guard);
        process::exit(1);
    }

    let shutdown = CancellationToken::new();
    logging.start_retention_cleanup(shutdown.child_token());

    info!(
        gateway = %config.name,
        version = env!("CARGO_PKG_VERSION"),
        filter = %logging.get_filter(),
        "Starting gateway"
    );

    let topics = &config.control.topics;
    let inference: Arc<dyn InferenceEngine> = if config.inference.enabled {
        Arc::new(SimulatedInferenceEngine::street_scene())
    } else {
        Arc::new(NoopInferenceEngine)
    };
    let collaborators = Collaborators {
        pipeline: Arc::new(SimulatedPipelineEngine::with_media()),
        inference,
        sink: Arc::new(CountingSink::new()),
        channel: Arc::new(StdioChannel::spawn(
            topics.command.clone(),
            vec![topics.response.clone(), format!("{}/", topics.status)],
        )),
    };

    let orchestrator =
        Orchestrator::new(config, collaborators).context("Failed to build orchestrator")?;
    orchestrator.start()?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");

    let report = orchestrator.stop().await;
    shutdown.cancel();
    info!(
        total = report.total_workers,
        graceful = report.graceful_stops,
        forced = report.forced_terminations,
        "Gateway stopped"
    );
    Ok(())
}

/// Validate the loaded configuration and report the verdict through the log.
fn test_configuration(config: &AppConfig) -> bool {
    match config.validate() {
        Ok(()) => {
            info!(gateway = %config.name, "Configuration is valid");
            true
        }
        Err(e) => {
            error!(error = %e, "Configuration is invalid");
            false
        }
    }
}

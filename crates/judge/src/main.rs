//! Alert judge
//!
//! Ingests metric samples, ships them to remote-write storage and evaluates
//! PUSH and PULL alert rules, queueing alert and recovery events.

use alert_judge::{api, app::App, config::JudgeConfig};
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "alert-judge", version, about = "Alert evaluation and sample ingest")]
struct Args {
    /// Configuration file (JSON, YAML or TOML)
    #[arg(long, env = "JUDGE_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let args = Args::parse();
    info!("Starting alert-judge");

    let config = JudgeConfig::load(args.config.as_deref()).map_err(|e| {
        error!(error = %format!("{e:#}"), "Configuration rejected");
        e
    })?;
    info!(
        endpoint = %config.heartbeat.local_addr,
        api_port = config.api.port,
        rules = %config.rules.path.display(),
        "Judge configured"
    );

    let app = App::start(config.clone()).await.map_err(|e| {
        error!(error = %format!("{e:#}"), "Startup failed");
        e
    })?;

    let api_handle = tokio::spawn(api::serve(
        config.api.port,
        app.state.clone(),
        app.cancel_token(),
    ));

    let reason = tokio::select! {
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => "SIGINT received",
            Err(e) => {
                warn!(error = %e, "Signal listener failed");
                "signal listener failed"
            }
        },
        served = api_handle => {
            match served {
                Ok(Err(e)) => error!(error = %format!("{e:#}"), "API server failed"),
                Err(e) => error!(error = %e, "API server task panicked"),
                Ok(Ok(())) => {}
            }
            "API server exited"
        }
    };

    info!(reason = reason, "Shutting down");
    app.shutdown(reason).await;
    Ok(())
}

//! Starts every strategy in a TOML config and runs them until Ctrl-C.
//!
//! Usage: `mm_runner [config.toml]`
//!
//! Exit status: 0 when every strategy stopped cleanly, 1 when any failed,
//! panicked or had to be aborted, 2 when the configuration is invalid.

use std::env;

use anyhow::{Context, Result};
use kalshi_mm::{
    config::{load_strategies, ApiKind, Credentials, StrategyConfig},
    ApiClient, RunReport, Runner, StrategyInstance, TelemetryFeed,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "config.toml";
const CONFIG_ERROR_EXIT: i32 = 2;

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    dotenvy::dotenv().ok();
    let path = env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let configs = match load_strategies(&path) {
        Ok(configs) => configs,
        Err(err) => {
            init_tracing(&[]);
            error!(path = %path, error = %err, "invalid configuration");
            std::process::exit(CONFIG_ERROR_EXIT);
        }
    };
    init_tracing(&configs);

    let runner = match build_runner(configs) {
        Ok(runner) => runner,
        Err(err) => {
            error!("startup failed: {err:#}");
            std::process::exit(CONFIG_ERROR_EXIT);
        }
    };

    let report = runner.run_until(shutdown_signal()).await;
    log_report(&report);
    std::process::exit(report.exit_code());
}

fn init_tracing(configs: &[StrategyConfig]) {
    let mut filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    for config in configs {
        let directive = format!(
            "[strategy{{name={}}}]={}",
            config.name,
            config.log_level.as_str().to_ascii_lowercase()
        );
        match directive.parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(err) => eprintln!("ignoring log level for strategy {}: {err}", config.name),
        }
    }
    if tracing::subscriber::set_global_default(
        tracing_subscriber::fmt().with_env_filter(filter).finish(),
    )
    .is_err()
    {
        // Tracing already initialised elsewhere.
    }
}

/// Builds every client before starting anything so a bad strategy never
/// leaves its siblings running.
fn build_runner(configs: Vec<StrategyConfig>) -> Result<Runner> {
    let needs_credentials = configs
        .iter()
        .any(|config| matches!(config.api.kind, ApiKind::Real));
    let credentials = if needs_credentials {
        Some(Credentials::from_env().context("loading exchange credentials")?)
    } else {
        None
    };

    let telemetry = TelemetryFeed::default();
    spawn_telemetry_logger(&telemetry);

    let mut instances = Vec::with_capacity(configs.len());
    for config in configs {
        let client = ApiClient::from_config(&config, credentials.as_ref())
            .with_context(|| format!("building client for strategy {}", config.name))?;
        instances.push(StrategyInstance::new(config, client).with_telemetry(telemetry.clone()));
    }

    let mut runner = Runner::default();
    for instance in instances {
        runner.start(instance)?;
    }
    info!(strategies = runner.running(), "all strategies started");
    Ok(runner)
}

fn spawn_telemetry_logger(feed: &TelemetryFeed) {
    let mut rx = feed.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(record) => match serde_json::to_string(&record) {
                    Ok(json) => debug!(target: "telemetry", "{json}"),
                    Err(err) => warn!(error = %err, "telemetry record not serializable"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "telemetry logger lagging");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for ctrl-c");
        return;
    }
    info!("ctrl-c received");
}

fn log_report(report: &RunReport) {
    for (name, exit) in &report.exits {
        info!(strategy = %name, exit = %exit, "final status");
    }
    info!(exit_code = report.exit_code(), "runner finished");
}

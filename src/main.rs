// =============================================================================
// Equity Feed — Main Entry Point
// =============================================================================
//
// Two modes, chosen by the first argument:
//   historical (default)  fetch -> clean -> save every configured symbol
//   realtime              stream trades for every configured symbol until
//                         Ctrl+C or the server ends the session
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod error;
mod market_data;
mod pipeline;
mod polygon;
mod runtime_config;
mod types;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::market_data::{Preprocessor, StreamingHandler};
use crate::pipeline::HistoricalPipeline;
use crate::polygon::{PolygonClient, PolygonConnector};
use crate::runtime_config::RuntimeConfig;

const CONFIG_PATH: &str = "pipeline_config.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Historical,
    Realtime,
}

impl std::str::FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "historical" | "hist" => Ok(Self::Historical),
            "realtime" | "live" => Ok(Self::Realtime),
            other => anyhow::bail!("unknown mode '{other}' (expected 'historical' or 'realtime')"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mode: Mode = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => Mode::Historical,
    };

    info!(mode = ?mode, "Equity Feed starting up");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    if !std::path::Path::new(CONFIG_PATH).exists() {
        if let Err(e) = config.save(CONFIG_PATH) {
            warn!(error = %e, "Failed to write default config");
        }
    }

    // Override symbols from env if available.
    if let Ok(syms) = std::env::var(runtime_config::SYMBOLS_ENV) {
        config.override_symbols(&syms);
    }
    info!(symbols = ?config.symbols, "Configured symbols");

    // ── 2. Credentials ───────────────────────────────────────────────────
    let api_key = runtime_config::api_key_from_env().map_err(|e| {
        error!(error = %e, "CRITICAL: provider API key is missing; the pipeline cannot run");
        e
    })?;

    match mode {
        Mode::Historical => run_historical(&config, api_key).await,
        Mode::Realtime => run_live(&config, api_key).await,
    }
}

async fn run_historical(config: &RuntimeConfig, api_key: String) -> anyhow::Result<()> {
    // ── 3. REST client + pipeline ────────────────────────────────────────
    let client = PolygonClient::with_options(
        api_key,
        &config.rest_base_url,
        config.page_limit,
        config.request_timeout(),
    )
    .context("failed to build Polygon REST client")?;

    let pipeline = HistoricalPipeline::new(
        client,
        Preprocessor::new(config.coercion_policy, config.outlier_threshold),
        &config.data_dir,
        config.verify_after_save,
    );

    // ── 4. One symbol at a time ──────────────────────────────────────────
    let requests: Vec<_> = config.symbols.iter().map(|s| config.request_for(s)).collect();
    let report = pipeline.run_batch(&requests).await;

    for r in &report.symbols {
        info!(symbol = %r.symbol, outcome = ?r.outcome, "result");
    }
    info!(
        saved = report.saved(),
        failed = report.failed(),
        dir = %pipeline.data_dir().display(),
        "Equity Feed historical run complete."
    );
    Ok(())
}

async fn run_live(config: &RuntimeConfig, api_key: String) -> anyhow::Result<()> {
    // ── 3. Streaming session ─────────────────────────────────────────────
    let connector = PolygonConnector::new(&config.stream_url, api_key, config.request_timeout());
    let mut handler = StreamingHandler::new(connector, config.stream_buffer_capacity);

    info!("Streaming trades. Press Ctrl+C to stop.");

    // ── 4. Stream until Ctrl+C or session end ────────────────────────────
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        warn!("Shutdown signal received; stopping gracefully");
    };

    pipeline::run_realtime(&mut handler, &config.symbols, shutdown)
        .await
        .context("real-time session failed")?;

    info!("Equity Feed shut down complete.");
    Ok(())
}

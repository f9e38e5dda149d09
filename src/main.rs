//! Application entry point for the `derived-metrics` service.
//!
//! Startup sequence:
//! - Loading `.env` and configuration from environment variables
//! - Initializing structured logging/tracing
//! - Creating the shared request cache over the HTTP transport, plus its
//!   background sweep
//! - Wiring the derived-series builder and mounting the `routes` gateway
//! - Binding the Axum HTTP server, with graceful shutdown on Ctrl-C
//!
//! # Environment Variables
//! See `config::load_from_env` for the service settings. Logging uses:
//! - `LOG_LEVEL` (optional) – log verbosity (default: `info`)
//! - `LOG_SPAN_EVENTS` (optional) – span event mode for tracing
//! - `FORCE_COLOR` (optional) – force ANSI colours on or off
//! - `RUST_LOG` (optional) – full filter directive, overrides `LOG_LEVEL`
use std::{env, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use axum::Router;
use dotenvy::dotenv;
use is_terminal::IsTerminal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use derived_metrics::backend::Endpoints;
use derived_metrics::cache::{HttpTransport, RequestCache};
use derived_metrics::routes::{self, AppState};
use derived_metrics::units::UnitRegistry;
use derived_metrics::{config, DerivedSeriesBuilder};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    dotenv().ok();
    init_tracing();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    let transport = HttpTransport::new(Duration::from_secs(cfg.http_timeout_secs))?;
    let cache = RequestCache::new(Arc::new(transport), cfg.cache_config());

    let shutdown = CancellationToken::new();
    let sweeper = cache.spawn_sweeper(Duration::from_secs(cfg.cache_sweep_secs), shutdown.clone());

    let units = UnitRegistry::with_preferences(&cfg.unit_prefs)?;
    let endpoints = Endpoints::new(&cfg.backend_url, &cfg.station_id);
    let builder = DerivedSeriesBuilder::new(cache, endpoints, units, cfg.station)
        .with_tolerance(Duration::from_secs(cfg.align_tolerance_secs));

    // Build app from routes gateway (EMBP)
    let app: Router = routes::router(AppState {
        builder,
        shutdown: shutdown.clone(),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.listen_port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    sweeper.await?;
    tracing::info!("Shutdown complete");

    Ok(())
}

// ---

/// Resolve on Ctrl-C, cancelling `token` so in-flight builds and the cache
/// sweeper stop.
async fn shutdown_signal(token: CancellationToken) {
    // ---
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received"),
        Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
    }
    token.cancel();
}

/// Install the compact fmt subscriber.
///
/// At the default `info` level the log shows startup config, catalog edits
/// and one line per built series. `debug` adds every cache hit, miss and
/// join plus each dropped point. HTTP client internals stay at `warn`
/// unless `RUST_LOG` overrides the whole filter. `LOG_SPAN_EVENTS=full` or
/// `enter_exit` adds span events; the default emits span close only.
/// Colour follows `FORCE_COLOR`, otherwise whether stdout is a terminal.
fn init_tracing() {
    // ---
    let span_events = match env::var("LOG_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    // Use RUST_LOG if available, otherwise fall back to LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("{level},hyper=warn,reqwest=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}

//! Scangate Proxy - antivirus-gating upload proxy

use axum::{middleware, routing::get, Router};
use clap::Parser;
use scangate_proxy::api::handlers::{health_check, upload_handler, AppState};
use scangate_proxy::config::Config;
use scangate_proxy::metrics::{http_metrics_middleware, metrics_handler, Metrics};
use scangate_proxy::pipeline::UploadPipeline;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How long in-flight requests get to finish after a shutdown signal.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

/// Version string including build timestamp for --version output
fn version_long() -> &'static str {
    // e.g. "0.4.1 (built 2026-07-30T09:12:44Z)"
    static V: std::sync::OnceLock<String> = std::sync::OnceLock::new();
    V.get_or_init(|| {
        format!(
            "{} (built {})",
            env!("CARGO_PKG_VERSION"),
            env!("SGP_BUILD_TIME"),
        )
    })
}

/// Scangate Proxy, an upload proxy gated on an ICAP virus scanner
#[derive(Parser, Debug)]
#[command(name = "scangate_proxy")]
#[command(version = version_long())]
#[command(author, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Listen address (overrides config)
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration from file if specified, otherwise use default loading
    let mut config = if let Some(ref path) = cli.config {
        Config::from_file(path)?
    } else {
        Config::load()
    };

    // CLI overrides
    if let Some(ref addr) = cli.listen {
        config.listen_addr = addr.parse()?;
    }

    // Initialize tracing.
    // Priority: RUST_LOG > SGP_LOG_LEVEL > --verbose > config default.
    // With LOG_ICAP_TRAFFIC off, only ERR-level lines are emitted.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| std::env::var("SGP_LOG_LEVEL").map(EnvFilter::new))
        .unwrap_or_else(|_| {
            if cli.verbose {
                EnvFilter::new("scangate_proxy=trace,tower_http=trace")
            } else if config.log_icap_traffic {
                EnvFilter::new("scangate_proxy=debug,tower_http=debug")
            } else {
                EnvFilter::new("scangate_proxy=error")
            }
        });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        "Starting Scangate Proxy v{} (built {})",
        env!("CARGO_PKG_VERSION"),
        env!("SGP_BUILD_TIME"),
    );
    info!("  Listen address: {}", config.listen_addr);
    info!(
        "  ICAP scanner: icap://{}:{}/{}",
        config.icap.host, config.icap.port, config.icap.service
    );
    info!("  ICAP preview size: {} bytes", config.icap.preview_size);
    info!("  Backend: {}", config.backend.url_for("/"));
    info!(
        "  Memory threshold: {} MB",
        config.upload.memory_threshold / 1024 / 1024
    );
    info!(
        "  Max file size: {} MB",
        config.upload.max_file_size / 1024 / 1024
    );
    info!("  Temp dir: {:?}", config.upload.temp_dir);
    if config.check_mime_type {
        info!("  MIME validation: strict");
    } else {
        warn!("  MIME validation: DISABLED (CHECK_MIME_TYPE=false)");
    }
    if config.allowed_extensions.is_empty() {
        info!("  Extension allowlist: (all extensions allowed)");
    } else {
        info!("  Extension allowlist: {:?}", config.allowed_extensions);
    }
    info!(
        "  Size-limit verdicts: {:?}",
        config.limits_exceeded_behaviour
    );

    let config = Arc::new(config);

    // Create Prometheus metrics
    let metrics = Arc::new(Metrics::new());
    metrics.process_start_time_seconds.set(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64(),
    );
    metrics
        .build_info
        .with_label_values(&[env!("CARGO_PKG_VERSION")])
        .set(1.0);

    let pipeline = UploadPipeline::new(config.clone(), Some(metrics.clone()))
        .map_err(|e| format!("pipeline init failed: {e}"))?;

    let state = Arc::new(AppState {
        pipeline,
        config: config.clone(),
        metrics: Some(metrics),
    });

    // Everything that is not health/metrics is an upload POST; the request
    // URI is preserved verbatim for the backend URL.
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .fallback(upload_handler)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            http_metrics_middleware,
        ))
        .with_state(state);

    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!("Scangate Proxy listening on http://{}", config.listen_addr);

    // Stop accepting on the shutdown signal, then give in-flight requests a
    // bounded drain window before forcing exit.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let mut graceful_rx = shutdown_rx.clone();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = graceful_rx.changed().await;
    });

    let mut drain_rx = shutdown_rx;
    let drain_deadline = async move {
        let _ = drain_rx.changed().await;
        tokio::time::sleep(SHUTDOWN_DRAIN).await;
    };

    tokio::select! {
        result = server => {
            result?;
            info!("Server shutdown complete");
        }
        _ = drain_deadline => {
            warn!(
                "Shutdown drain deadline ({}s) reached, exiting with connections open",
                SHUTDOWN_DRAIN.as_secs()
            );
        }
    }

    Ok(())
}

/// Handle shutdown signals (SIGINT, SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            warn!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}

//! Volume Events Exporter
//!
//! Watches NFS front-end volumes and records their create and delete events
//! as annotations on the backend claims serving them.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use volume_events_exporter::{
    sink, Error, ExportController, ExporterConfig, ExporterMetrics, KubeStore, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Volume Events Exporter - NFS volume lifecycle annotations on backend claims
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file; flags below override its values
    #[arg(long, env = "EXPORTER_CONFIG")]
    config: Option<PathBuf>,

    /// Namespace holding backend claims
    #[arg(long, env = "SYSTEM_NAMESPACE")]
    system_namespace: Option<String>,

    /// Prefix of backend claim names
    #[arg(long, env = "BACKEND_CLAIM_PREFIX")]
    backend_claim_prefix: Option<String>,

    /// Provisioner owning front-end volumes
    #[arg(long, env = "PROVISIONER")]
    provisioner: Option<String>,

    /// Steady-state resync interval in seconds
    #[arg(long, env = "RESYNC_INTERVAL")]
    resync_interval_secs: Option<u64>,

    /// Requeue interval after transient errors in seconds
    #[arg(long, env = "ERROR_REQUEUE_INTERVAL")]
    error_requeue_interval_secs: Option<u64>,

    /// Write attempts before a conflicting update is requeued
    #[arg(long, env = "MAX_CONFLICT_RETRIES")]
    max_conflict_retries: Option<u32>,

    /// Concurrent reconciliation workers
    #[arg(long, env = "WORKERS")]
    workers: Option<usize>,

    /// Do not hold a finalizer on front-end volumes
    #[arg(long, env = "DISABLE_FINALIZER")]
    disable_finalizer: bool,

    /// HTTP endpoint receiving every exported event
    #[arg(long, env = "CALLBACK_URL")]
    callback_url: Option<String>,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// Build the effective configuration: defaults, then file, then flags
    fn exporter_config(&self) -> Result<ExporterConfig> {
        let mut config = match &self.config {
            Some(path) => ExporterConfig::from_yaml_file(path)?,
            None => ExporterConfig::default(),
        };

        if let Some(namespace) = &self.system_namespace {
            config.system_namespace = namespace.clone();
        }
        if let Some(prefix) = &self.backend_claim_prefix {
            config.backend_claim_prefix = prefix.clone();
        }
        if let Some(provisioner) = &self.provisioner {
            config.provisioner = provisioner.clone();
        }
        if let Some(secs) = self.resync_interval_secs {
            config.resync_interval_secs = secs;
        }
        if let Some(secs) = self.error_requeue_interval_secs {
            config.error_requeue_interval_secs = secs;
        }
        if let Some(retries) = self.max_conflict_retries {
            config.max_conflict_retries = retries;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if self.disable_finalizer {
            config.manage_finalizer = false;
        }
        if self.callback_url.is_some() {
            config.callback_url = self.callback_url.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    let config = args.exporter_config()?;

    info!("Starting Volume Events Exporter");
    info!("  Version: {}", volume_events_exporter::VERSION);
    info!("  Provisioner: {}", config.provisioner);
    info!(
        "  Backend claims: {}/{}<volume>",
        config.system_namespace, config.backend_claim_prefix
    );
    info!("  Workers: {}", config.workers);
    info!("  Finalizer: {}", config.manage_finalizer);

    let ready = Arc::new(AtomicBool::new(false));

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_ready = ready.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_ready).await {
            error!("Health server error: {}", e);
        }
    });

    let metrics = ExporterMetrics::register(prometheus::default_registry())?;

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    let client = kube::Client::try_default().await?;
    let store = Arc::new(KubeStore::new(client));
    let sink = sink::from_config(&config)?;
    let controller = ExportController::new(config, store, sink, metrics);

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        signal_cancel.cancel();
    });

    ready.store(true, Ordering::SeqCst);
    controller.run(cancel).await?;

    info!("Exporter shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let directive = |d: &str| -> Result<tracing_subscriber::filter::Directive> {
        d.parse()
            .map_err(|e| Error::Configuration(format!("Invalid log directive {}: {}", d, e)))
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive(directive("hyper=warn")?)
        .add_directive(directive("kube=info")?)
        .add_directive(directive("tower=warn")?)
        .add_directive(directive("reqwest=warn")?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

fn respond(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str, ready: Arc<AtomicBool>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let ready = ready.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = ready.load(Ordering::SeqCst);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => respond(StatusCode::OK, "ok"),
                        "/readyz" if ready => respond(StatusCode::OK, "ok"),
                        "/readyz" => respond(StatusCode::SERVICE_UNAVAILABLE, "starting"),
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let metric_families = prometheus::gather();
                    let mut buffer = Vec::new();
                    match encoder.encode(&metric_families, &mut buffer) {
                        Ok(()) => {
                            let mut response = respond(StatusCode::OK, buffer);
                            if let Ok(value) = encoder.format_type().parse() {
                                response
                                    .headers_mut()
                                    .insert(hyper::header::CONTENT_TYPE, value);
                            }
                            response
                        }
                        Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                    }
                }
                _ => respond(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}

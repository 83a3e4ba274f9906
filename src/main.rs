//! Apps Orchestrator daemon
//!
//! Binds the ZFS, Kubernetes and middleware adapters to the orchestrator and
//! serves the REST API, health probes and Prometheus metrics.
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  REST :8090  │   │ health :8081 │   │ metrics :8080│
//! └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!        └──────────────────┼──────────────────┘
//!                 ┌─────────┴─────────┐
//!                 │  AppsOrchestrator │
//!                 └─────────┬─────────┘
//!        ┌──────────────────┼──────────────────┐
//!   ┌────┴─────┐     ┌──────┴──────┐     ┌─────┴──────┐
//!   │ zfs CLI  │     │ kube Client │     │ middleware │
//!   └──────────┘     └─────────────┘     └────────────┘
//! ```

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use apps_orchestrator::{
    ApiServer, ApiServerConfig, AppsOrchestrator, ClusterStatus, Error, KubeRuntime,
    KubeWorkloads, Metrics, MiddlewareClient, OrchestratorPorts, Result, Settings, ZfsCli,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Apps Orchestrator - lifecycle, backup and restore of the applications cluster
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Settings file (YAML)
    #[arg(long, env = "APPS_CONFIG")]
    config: Option<PathBuf>,

    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "127.0.0.1:8090")]
    api_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Cluster node name (overrides the settings file)
    #[arg(long, env = "NODE_NAME")]
    node_name: Option<String>,

    /// Path of the zfs binary
    #[arg(long, env = "ZFS_BINARY", default_value = "zfs")]
    zfs_binary: String,

    /// Take a post-update backup (with retention) once started
    #[arg(long, env = "POST_UPDATE_BACKUP")]
    post_update_backup: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!("Starting Apps Orchestrator");
    info!("  Version: {}", apps_orchestrator::VERSION);
    info!("  REST API: {}", args.api_addr);

    let mut settings = match &args.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    if let Some(node_name) = &args.node_name {
        settings.node_name = node_name.clone();
    }
    settings.validate()?;
    info!("  Pool: {}", settings.cluster.pool.as_deref().unwrap_or("<unconfigured>"));
    info!("  Node: {}", settings.node_name);

    // Bind adapters
    let client = kube::Client::try_default().await?;
    let zfs = Arc::new(ZfsCli::new(args.zfs_binary.clone()));
    let middleware = Arc::new(MiddlewareClient::new(settings.middleware_url.clone())?);
    let ports = OrchestratorPorts {
        snapshots: zfs.clone(),
        datasets: zfs,
        workloads: Arc::new(KubeWorkloads::new(client.clone(), settings.node_name.clone())),
        runtime: Arc::new(KubeRuntime::new(client, settings.node_name.clone())),
        releases: middleware.clone(),
        host: middleware,
    };

    let metrics = Metrics::new()?;
    let orchestrator = AppsOrchestrator::new(settings, ports, metrics.clone());
    orchestrator.initialize().await?;
    info!("Orchestrator initialized");

    if args.post_update_backup {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            if let Some(name) = orchestrator.post_update_hook().await {
                info!("Post-update backup {} created", name);
            }
        });
    }

    // Start health server
    let health_addr = parse_addr(&args.health_addr, "health server")?;
    let health_orchestrator = orchestrator.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr, health_orchestrator).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = parse_addr(&args.metrics_addr, "metrics server")?;
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr, metrics).await {
            error!("Metrics server error: {}", e);
        }
    });

    // Create and run API server
    let api_config = ApiServerConfig {
        rest_addr: parse_addr(&args.api_addr, "REST API")?,
    };
    let api_server = ApiServer::new(api_config, orchestrator);

    let shutdown = api_server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = shutdown.send(());
        }
    });

    api_server.run().await?;

    info!("Apps Orchestrator shutdown complete");
    Ok(())
}

fn parse_addr(addr: &str, what: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|e| Error::Configuration(format!("Invalid {} address {:?}: {}", what, addr, e)))
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

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn", "tower_http=info", "reqwest=warn"] {
        let directive = directive
            .parse()
            .map_err(|e| Error::Configuration(format!("bad log directive {directive:?}: {e}")))?;
        filter = filter.add_directive(directive);
    }

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

async fn run_health_server(addr: SocketAddr, orchestrator: Arc<AppsOrchestrator>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let orchestrator = orchestrator.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let orchestrator = orchestrator.clone();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => respond(StatusCode::OK, "ok"),
                        "/readyz" => {
                            if orchestrator.cluster_status().status == ClusterStatus::Pending {
                                respond(StatusCode::SERVICE_UNAVAILABLE, "initializing")
                            } else {
                                respond(StatusCode::OK, "ok")
                            }
                        }
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("Health server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Failed to bind health server: {}", e)))?
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: SocketAddr, metrics: Arc<Metrics>) -> Result<()> {
    use hyper::header::CONTENT_TYPE;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match metrics.encode() {
                            Ok((content_type, buffer)) => {
                                let mut response = respond(StatusCode::OK, buffer);
                                if let Ok(value) = content_type.parse() {
                                    response.headers_mut().insert(CONTENT_TYPE, value);
                                }
                                response
                            }
                            Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                        },
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Failed to bind metrics server: {}", e)))?
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}

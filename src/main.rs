//! Cloud Control Plane
//!
//! Runs the guest lifecycle control plane: the REST API, the task engine and
//! the registered provider drivers, with health and metrics endpoints.

use clap::Parser;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cloud_control_plane::{
    ApiServer, ApiServerConfig, ControlPlane, ControlPlaneConfig, DriverEnvironment, Error,
    FileTaskStore, MemoryGuestStore, MemoryTaskStore, OrchestratorConfig, Result, TaskEngine,
    TaskStoreRef,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Cloud Control Plane - staged guest lifecycle orchestration across providers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// REST API bind address [default: 0.0.0.0:8090]
    #[arg(long, env = "API_ADDR")]
    api_addr: Option<String>,

    /// Health server bind address [default: 0.0.0.0:8081]
    #[arg(long, env = "HEALTH_ADDR")]
    health_addr: Option<String>,

    /// Metrics server bind address [default: 0.0.0.0:8080]
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// YAML configuration file
    #[arg(long, env = "CONTROL_PLANE_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Directory for task records; in-memory when unset
    #[arg(long, env = "STATE_DIR")]
    state_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Print the configuration file JSON schema and exit
    #[arg(long)]
    print_config_schema: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config_schema {
        println!("{}", ControlPlaneConfig::schema_json()?);
        return Ok(());
    }

    init_logging(&args);

    let config = load_config(&args).await?;

    info!("Starting Cloud Control Plane");
    info!("  Version: {}", cloud_control_plane::VERSION);
    info!("  REST API: {}", config.api_addr);
    info!("  Providers: {}", config.providers.enabled.join(", "));

    // Task persistence
    let task_store: TaskStoreRef = match &config.state_dir {
        Some(dir) => {
            info!("  Task store: {}", dir.display());
            FileTaskStore::open(dir).await? as TaskStoreRef
        }
        None => {
            warn!("No state directory configured, task records are kept in memory");
            MemoryTaskStore::new() as TaskStoreRef
        }
    };

    // Registration phase
    let env = DriverEnvironment::simulated(config.stage_retry(), config.simulated_latency());
    let engine = TaskEngine::builder()
        .store(task_store)
        .quota(config.quota_ledger())
        .config(config.engine_config());
    let plane = ControlPlane::assemble(
        &env,
        &config.providers.enabled,
        Arc::new(MemoryGuestStore::new()),
        engine,
        OrchestratorConfig {
            track_quota: config.quota.enabled,
        },
    )?;

    if plane.engine.config().resume_on_start {
        let report = plane.engine.resume().await?;
        info!(
            resumed = report.resumed.len(),
            interrupted = report.interrupted.len(),
            waiting = report.waiting,
            "Resumed unfinished tasks"
        );
    }

    let ready = Arc::new(AtomicBool::new(true));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Start health server
    let health_addr = ControlPlaneConfig::socket_addr(&config.health_addr)?;
    let health_ready = ready.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr, health_ready).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = ControlPlaneConfig::socket_addr(&config.metrics_addr)?;
    let engine = plane.engine.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr, engine).await {
            error!("Metrics server error: {}", e);
        }
    });

    // Shutdown on ctrl-c
    let signal_tx = shutdown_tx.clone();
    let signal_ready = ready.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            signal_ready.store(false, Ordering::SeqCst);
            let _ = signal_tx.send(());
        }
    });

    let api_config = ApiServerConfig {
        rest_addr: ControlPlaneConfig::socket_addr(&config.api_addr)?,
    };
    ApiServer::new(api_config, plane.orchestrator.clone())
        .run(shutdown_tx.subscribe())
        .await?;

    info!("Control plane shutdown complete");
    Ok(())
}

// =============================================================================
// Configuration
// =============================================================================

/// File (or defaults) with CLI flags on top
async fn load_config(args: &Args) -> Result<ControlPlaneConfig> {
    let mut config = match &args.config {
        Some(path) => ControlPlaneConfig::load(path).await?,
        None => ControlPlaneConfig::default(),
    };

    if let Some(addr) = &args.api_addr {
        config.api_addr = addr.clone();
    }
    if let Some(addr) = &args.health_addr {
        config.health_addr = addr.clone();
    }
    if let Some(addr) = &args.metrics_addr {
        config.metrics_addr = addr.clone();
    }
    if let Some(dir) = &args.state_dir {
        config.state_dir = Some(dir.clone());
    }

    config.validate()?;
    Ok(config)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "tower_http=info", "axum=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
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
}

// =============================================================================
// Health Server
// =============================================================================

fn plain_response(
    status: hyper::StatusCode,
    body: impl Into<hyper::Body>,
) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: SocketAddr, ready: Arc<AtomicBool>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let ready = ready.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = ready.load(Ordering::SeqCst);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => plain_response(StatusCode::OK, "ok"),
                        "/readyz" if ready => plain_response(StatusCode::OK, "ok"),
                        "/readyz" => {
                            plain_response(StatusCode::SERVICE_UNAVAILABLE, "shutting down")
                        }
                        _ => plain_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

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

async fn run_metrics_server(addr: SocketAddr, engine: TaskEngine) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{header, Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let engine = engine.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let engine = engine.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match engine.metrics().encode_text() {
                            Ok(text) => {
                                let mut response = plain_response(StatusCode::OK, text);
                                response.headers_mut().insert(
                                    header::CONTENT_TYPE,
                                    header::HeaderValue::from_static(
                                        "text/plain; version=0.0.4",
                                    ),
                                );
                                response
                            }
                            Err(e) => plain_response(
                                StatusCode::INTERNAL_SERVER_ERROR,
                                e.to_string(),
                            ),
                        },
                        _ => plain_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use kube::Client;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod controller;
mod crd;
mod manager;
mod metrics;
mod notifier;
mod pod_client;
mod provider;
mod status;
mod util;

use controller::{Context, PoolController};
use manager::RunnerManager;
use notifier::AgentClient;
use pod_client::KubePodClient;
use provider::HttpRunnerProvider;
use status::HttpStatusClient;

#[derive(Parser)]
#[command(name = "quarry-operator")]
#[command(about = "Kubernetes operator for pools of self-hosted CI runners")]
struct Args {
    /// Kubernetes namespace to watch (empty = all namespaces)
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Metrics bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health probe bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable development mode (more verbose logging)
    #[arg(long, env = "DEV_MODE")]
    dev_mode: bool,

    /// Base URL of the CI provider API
    #[arg(long, env = "PROVIDER_URL")]
    provider_url: String,

    /// API token for the CI provider
    #[arg(long, env = "PROVIDER_TOKEN", hide_env_values = true)]
    provider_token: String,

    /// Organization the runner repositories belong to
    #[arg(long, env = "ORGANIZATION_NAME")]
    organization: String,

    /// Repositories RunnerPools may bind to (empty = any)
    #[arg(long, env = "REPOSITORY_NAMES", value_delimiter = ',')]
    repository_names: Vec<String>,

    /// Default container image for runner pods
    #[arg(long, env = "RUNNER_IMAGE", default_value = "ghcr.io/quarrylabs/runner:latest")]
    runner_image: String,

    /// Period of each pool's reconciliation loop
    #[arg(long, env = "SYNC_INTERVAL", default_value = "1m", value_parser = humantime::parse_duration)]
    sync_interval: Duration,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level.as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level.to_string())),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(args.dev_mode)
                .with_level(true)
                .with_ansi(std::env::var("NO_COLOR").is_err()),
        )
        .init();

    info!("starting quarry-operator");
    info!("version: {}", env!("CARGO_PKG_VERSION"));
    info!("watch namespace: {:?}", args.namespace);
    info!("sync interval: {:?}", args.sync_interval);

    metrics::init()?;

    let client = Client::try_default().await?;
    info!("kubernetes client initialized");

    let provider = Arc::new(HttpRunnerProvider::new(
        &args.provider_url,
        &args.provider_token,
        &args.organization,
    )?);

    let runner_manager = Arc::new(RunnerManager::new(
        args.sync_interval,
        Arc::new(KubePodClient::new(client.clone())),
        provider.clone(),
        Arc::new(HttpStatusClient::new()),
        Arc::new(AgentClient::new()),
    ));

    let context = Arc::new(Context {
        client: client.clone(),
        manager: runner_manager,
        provider,
        repository_names: args.repository_names,
        runner_image: args.runner_image,
    });

    let health_server = start_health_server(args.health_addr.clone());
    let metrics_server = start_metrics_server(args.metrics_addr.clone());

    let pool_controller = PoolController::new(client, args.namespace, context);
    let controller_task = tokio::spawn(async move {
        pool_controller.run().await;
    });

    info!("controller started");

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("received SIGINT, shutting down gracefully...");
        }
        _ = controller_task => {
            warn!("RunnerPool controller exited unexpectedly");
        }
        _ = health_server => {
            warn!("health server exited unexpectedly");
        }
        _ = metrics_server => {
            warn!("metrics server exited unexpectedly");
        }
    }

    info!("quarry-operator shutdown complete");
    Ok(())
}

async fn start_health_server(addr: String) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use std::convert::Infallible;
    use std::net::SocketAddr;

    async fn handle_request(req: Request<Body>) -> Result<Response<Body>, Infallible> {
        match req.uri().path() {
            "/healthz" | "/readyz" => Ok(Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "application/json")
                .body(Body::from(r#"{"status":"ok"}"#))
                .unwrap()),
            _ => Ok(Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::from("Not Found"))
                .unwrap()),
        }
    }

    let make_svc =
        make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle_request)) });

    let addr: SocketAddr = addr.parse()?;
    let server = Server::bind(&addr).serve(make_svc);

    info!("health server listening on {}", addr);

    if let Err(e) = server.await {
        warn!("health server error: {}", e);
    }

    Ok(())
}

async fn start_metrics_server(addr: String) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use std::convert::Infallible;
    use std::net::SocketAddr;

    async fn handle_request(req: Request<Body>) -> Result<Response<Body>, Infallible> {
        match req.uri().path() {
            "/metrics" => {
                let body = metrics::gather_text().unwrap_or_default();
                Ok(Response::builder()
                    .status(StatusCode::OK)
                    .header("content-type", "text/plain; version=0.0.4")
                    .body(Body::from(body))
                    .unwrap())
            }
            _ => Ok(Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::from("Not Found"))
                .unwrap()),
        }
    }

    let make_svc =
        make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle_request)) });

    let addr: SocketAddr = addr.parse()?;
    let server = Server::bind(&addr).serve(make_svc);

    info!("metrics server listening on {}", addr);

    if let Err(e) = server.await {
        warn!("metrics server error: {}", e);
    }

    Ok(())
}

//! Direct-Attached Storage Node Agent
//!
//! Runs on every storage node: listens for block-device uevents, keeps the
//! node's Drive records in sync with the devices present and releases the
//! capacity of deleted Volumes.

use clap::Parser;
use futures::TryStreamExt;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use prometheus::Registry;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use das_node_agent::config::{build_topology, DEFAULT_MOUNT_ROOT};
use das_node_agent::crd::labels::{sanitize_label_value, NODE_LABEL};
use das_node_agent::volume::sync_volume_labels;
use das_node_agent::{
    metrics, AgentConfig, DeviceBuilder, Drive, DriveEventHandler, DriveReconciler,
    DriveStoreRef, Error, KubeStore, Listener, ListenerConfig, MemoryStore, ReconcilerConfig,
    ReleaseOutcome, Result, SysfsProbe, UeventSocket, Volume, VolumeReleaser, VolumeStoreRef,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Direct-attached storage node agent
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name of the node the agent runs on
    #[arg(long, env = "NODE_ID")]
    node_id: String,

    /// Topology identity segment
    #[arg(long, env = "IDENTITY", default_value = "")]
    identity: String,

    /// Topology rack segment
    #[arg(long, env = "RACK", default_value = "")]
    rack: String,

    /// Topology zone segment
    #[arg(long, env = "ZONE", default_value = "")]
    zone: String,

    /// Topology region segment
    #[arg(long, env = "REGION", default_value = "")]
    region: String,

    /// Number of workers handling uevents
    #[arg(long, env = "THREADINESS", default_value = "4")]
    threadiness: usize,

    /// Capacity of the uevent queue
    #[arg(long, env = "QUEUE_CAPACITY", default_value = "1000")]
    queue_capacity: usize,

    /// Directory under which owned drives are mounted
    #[arg(long, env = "MOUNT_ROOT", default_value = DEFAULT_MOUNT_ROOT)]
    mount_root: PathBuf,

    /// Interval between full device resyncs in seconds (0 disables)
    #[arg(long, env = "RESYNC_INTERVAL_SECS", default_value = "300")]
    resync_interval_secs: u64,

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

    /// Run in standalone mode (in-memory store, no Kubernetes)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,
}

impl Args {
    fn agent_config(&self) -> AgentConfig {
        let topology = build_topology(
            &self.identity,
            &self.rack,
            &self.zone,
            &self.region,
            &self.node_id,
        );
        let mut reconciler = ReconcilerConfig::for_node(self.node_id.clone(), topology);
        reconciler.mount_root = self.mount_root.clone();

        AgentConfig {
            listener: ListenerConfig {
                threadiness: self.threadiness,
                queue_capacity: self.queue_capacity,
            },
            reconciler,
            resync_interval: (self.resync_interval_secs > 0)
                .then(|| Duration::from_secs(self.resync_interval_secs)),
            ..Default::default()
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let config = args.agent_config();
    if config.node_id().is_empty() {
        return Err(Error::Configuration("node id must not be empty".to_string()));
    }

    info!("Starting DAS node agent");
    info!("  Version: {}", das_node_agent::VERSION);
    info!("  Node: {}", config.node_id());
    info!("  Workers: {}", config.listener.threadiness);
    info!("  Mount root: {}", config.reconciler.mount_root.display());
    info!("  Standalone mode: {}", args.standalone);

    let registry = Registry::new();
    metrics::install(&registry)?;
    let ready = Arc::new(AtomicBool::new(false));

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_ready = ready.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_ready).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let metrics_registry = registry.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_registry).await {
            error!("Metrics server error: {}", e);
        }
    });

    // Resource stores
    let (drives, volumes, client): (DriveStoreRef, VolumeStoreRef, Option<Client>) =
        if args.standalone {
            info!("Using in-memory resource store");
            (
                Arc::new(MemoryStore::<Drive>::new()),
                Arc::new(MemoryStore::<Volume>::new()),
                None,
            )
        } else {
            let client = Client::try_default().await?;
            (
                Arc::new(KubeStore::<Drive>::new(client.clone())),
                Arc::new(KubeStore::<Volume>::new(client.clone())),
                Some(client),
            )
        };

    let reconciler = DriveReconciler::new(
        drives.clone(),
        volumes.clone(),
        config.reconciler.clone(),
        config.retry.clone(),
    );
    let builder = DeviceBuilder::new(Arc::new(SysfsProbe::new(config.probe.clone())));
    let handler = Arc::new(DriveEventHandler::new(
        builder,
        reconciler,
        drives.clone(),
        config.probe.sysfs_path.clone(),
    ));

    // Subscribe before the initial resync so no event falls in between
    let socket = UeventSocket::open()?;

    if let Err(e) = handler.resync().await {
        warn!("Initial device resync failed: {}", e);
    }
    if let Err(e) = sync_volume_labels(&drives, &volumes, &config.retry, config.node_id()).await {
        warn!("Initial volume label sync failed: {}", e);
    }
    ready.store(true, Ordering::SeqCst);

    let token = CancellationToken::new();

    if let Some(interval) = config.resync_interval {
        tokio::spawn(run_periodic_resync(handler.clone(), interval, token.clone()));
    }

    if let Some(client) = client {
        let releaser = VolumeReleaser::new(drives.clone(), volumes.clone(), config.retry.clone());
        tokio::spawn(run_volume_watcher(
            client,
            releaser,
            config.node_id().to_string(),
            token.clone(),
        ));
    }

    let shutdown = token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Unable to listen for shutdown signal: {}", e);
        }
        info!("Shutdown requested");
        shutdown.cancel();
    });

    let listener = Listener::new(socket, config.listener.clone());
    let result = listener.run(token.clone(), handler).await;
    token.cancel();

    if let Err(e) = &result {
        error!("Uevent listener stopped: {}", e);
    }
    info!("Agent shutdown complete");
    result
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
    for directive in ["hyper=warn", "kube=info"] {
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
// Background Tasks
// =============================================================================

async fn run_periodic_resync(
    handler: Arc<DriveEventHandler>,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // the first tick completes immediately; startup already resynced
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = handler.resync().await {
                    warn!("Periodic resync failed: {}", e);
                }
            }
        }
    }
}

async fn run_volume_watcher(
    client: Client,
    releaser: VolumeReleaser,
    node_id: String,
    token: CancellationToken,
) {
    let api: Api<Volume> = Api::all(client);
    let selector = format!("{}={}", NODE_LABEL, sanitize_label_value(&node_id));
    let stream = watcher(api, watcher::Config::default().labels(&selector))
        .default_backoff()
        .applied_objects();
    futures::pin_mut!(stream);

    info!("Watching volumes with {}", selector);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            next = stream.try_next() => match next {
                Ok(Some(volume)) => match releaser.release(&volume).await {
                    Ok(ReleaseOutcome::Released) | Ok(ReleaseOutcome::Skipped) => {}
                    Err(e) if e.is_retryable() => {
                        warn!(volume = %volume.name(), "unable to release volume, retried on next change: {}", e)
                    }
                    Err(e) => error!(volume = %volume.name(), "unable to release volume: {}", e),
                },
                Ok(None) => break,
                Err(e) => warn!("Volume watch error: {}", e),
            }
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str, ready: Arc<AtomicBool>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let ready = ready.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = ready.load(Ordering::SeqCst);
                async move {
                    let (status, body) = match req.uri().path() {
                        "/healthz" | "/livez" => (StatusCode::OK, "ok"),
                        "/readyz" if ready => (StatusCode::OK, "ok"),
                        "/readyz" => (StatusCode::SERVICE_UNAVAILABLE, "initial sync pending"),
                        _ => (StatusCode::NOT_FOUND, "not found"),
                    };
                    let mut response = Response::new(Body::from(body));
                    *response.status_mut() = status;
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid health server address: {}", e)))?;

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

async fn run_metrics_server(addr: &str, registry: Registry) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(move |_conn| {
        let registry = registry.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let registry = registry.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => {
                            let encoder = TextEncoder::new();
                            let mut buffer = Vec::new();
                            match encoder.encode(&registry.gather(), &mut buffer) {
                                Ok(()) => {
                                    let mut response = Response::new(Body::from(buffer));
                                    if let Ok(value) = HeaderValue::from_str(encoder.format_type()) {
                                        response.headers_mut().insert(CONTENT_TYPE, value);
                                    }
                                    response
                                }
                                Err(e) => {
                                    let mut response = Response::new(Body::from(e.to_string()));
                                    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                                    response
                                }
                            }
                        }
                        _ => {
                            let mut response = Response::new(Body::from("not found"));
                            *response.status_mut() = StatusCode::NOT_FOUND;
                            response
                        }
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid metrics server address: {}", e)))?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}

//! Gateway server binary: loads configuration, wires the request plane,
//! spawns the background workers, and serves the OpenAI-compatible API.
//! SIGHUP reloads the model registry; SIGTERM/ctrl-c drains gracefully.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use dotenv::dotenv;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use switchgate::api::{build_router, AppState};
use switchgate::auth::Authenticator;
use switchgate::config::GatewayConfig;
use switchgate::guard::BudgetGuard;
use switchgate::latency::LatencyTracker;
use switchgate::llm::providers::CallContext;
use switchgate::llm::HeuristicCounter;
use switchgate::pricing::StaticCostTable;
use switchgate::router::{
    FailoverOrchestrator, FailoverPolicy, ModelRegistry, RegistrySnapshot,
};
use switchgate::store::{
    CoordStore, GatewayStore, MemoryCoordStore, MemoryGatewayStore, PgStore, RedisCoordStore,
};
use switchgate::usage::{UsageQueue, UsageWorker, UsageWorkerConfig};

#[derive(Parser, Debug)]
#[command(name = "switchgate", about = "OpenAI-compatible LLM gateway")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml", env = "SWITCHGATE_CONFIG")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if dotenv().is_err() {
        // The .env file is optional; real deployments set the environment.
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "switchgate=info,tower_http=warn".into()),
        )
        .init();

    let args = Args::parse();
    let config = GatewayConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    info!(
        models = config.model_list.len(),
        strategy = %config.router.routing_strategy,
        "configuration loaded"
    );

    // Shared coordination store: redis when configured, otherwise a
    // process-local fallback good for one replica.
    let coord: Arc<dyn CoordStore> = match &config.redis {
        Some(redis) => match RedisCoordStore::connect(&redis.url).await {
            Ok(store) => {
                info!("connected to redis");
                Arc::new(store)
            }
            Err(err) => {
                warn!(%err, "redis unreachable, falling back to in-process coordination");
                Arc::new(MemoryCoordStore::new())
            }
        },
        None => {
            info!("no redis configured, using in-process coordination");
            Arc::new(MemoryCoordStore::new())
        }
    };

    // Durable store: PostgreSQL when configured. Without it keys and usage
    // live in memory only, which is fine for local development.
    let store: Arc<dyn GatewayStore> = match &config.database {
        Some(database) => {
            let pg = PgStore::connect(&database.url, database.max_connections)
                .await
                .context("connecting to the database")?;
            info!("connected to the database");
            Arc::new(pg)
        }
        None => {
            warn!("no database configured, using an in-memory store");
            Arc::new(MemoryGatewayStore::new())
        }
    };

    let registry = Arc::new(ModelRegistry::from_config(&config)?);
    let latency = Arc::new(LatencyTracker::new(Arc::clone(&coord)));
    let guard = Arc::new(BudgetGuard::new(
        Arc::clone(&coord),
        Arc::clone(&store),
        config.budget.clone(),
    ));
    let auth = Arc::new(Authenticator::new(
        Arc::clone(&store),
        Duration::from_secs(60),
    ));
    let orchestrator = Arc::new(FailoverOrchestrator::new(
        Arc::clone(&registry),
        Arc::clone(&latency),
        config.router.routing_strategy,
        FailoverPolicy::from(&config.router),
    ));
    let usage_queue = Arc::new(UsageQueue::new(
        Arc::clone(&coord),
        config.usage.stream.clone(),
    ));

    let shutdown = CancellationToken::new();

    // Usage settlement worker.
    let worker = UsageWorker::new(
        Arc::clone(&coord),
        Arc::clone(&store),
        Arc::clone(&guard),
        UsageWorkerConfig::from(&config.usage),
    );
    let worker_handle = tokio::spawn(worker.run(shutdown.clone()));

    // Background health prober.
    let prober_handle = if config.router.health_check_interval > 0 {
        Some(tokio::spawn(health_prober(
            Arc::clone(&registry),
            Duration::from_secs(config.router.health_check_interval),
            shutdown.clone(),
        )))
    } else {
        None
    };

    // SIGHUP swaps in a freshly built registry snapshot.
    tokio::spawn(reload_on_sighup(
        args.config.clone(),
        Arc::clone(&registry),
        Arc::clone(&coord),
        shutdown.clone(),
    ));

    let state = Arc::new(AppState {
        registry,
        orchestrator,
        auth,
        guard,
        usage: usage_queue,
        latency,
        coord,
        pricing: Arc::new(StaticCostTable::default()),
        counter: Arc::new(HeuristicCounter),
    });
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server address")?;
    info!(%addr, "gateway listening");

    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_stop_signal().await;
        info!("shutdown signal received, draining");
        server_shutdown.cancel();
    });

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .context("server error")?;

    // Let the worker flush its final batch.
    let _ = worker_handle.await;
    if let Some(prober) = prober_handle {
        prober.abort();
    }
    info!("gateway stopped");
    Ok(())
}

async fn wait_for_stop_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("sigterm handler installs");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

/// Periodically probe every instance's backend and feed the health
/// tracker, so dead deployments drop out of routing between requests.
async fn health_prober(
    registry: Arc<ModelRegistry>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let snapshot = registry.load();
        for instance in snapshot.all_instances() {
            let ctx = CallContext::new(Duration::from_secs(10), shutdown.child_token());
            match instance.provider.health_check(&ctx).await {
                Ok(true) => instance.health.record_success(),
                Ok(false) => instance.health.record_failure("health check reported unhealthy"),
                Err(err) => instance.health.record_failure(&err.message),
            }
        }
    }
}

async fn reload_on_sighup(
    path: PathBuf,
    registry: Arc<ModelRegistry>,
    coord: Arc<dyn CoordStore>,
    shutdown: CancellationToken,
) {
    #[cfg(unix)]
    {
        let mut hangup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        {
            Ok(signal) => signal,
            Err(err) => {
                error!(%err, "cannot install SIGHUP handler, reload disabled");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                received = hangup.recv() => {
                    if received.is_none() {
                        return;
                    }
                }
            }
            info!("SIGHUP received, reloading configuration");
            match GatewayConfig::load(&path).and_then(|config| {
                RegistrySnapshot::from_config(&config)
            }) {
                Ok(snapshot) => {
                    registry.reload(snapshot);
                    let stamp = chrono::Utc::now().timestamp().to_string();
                    if let Err(err) = coord.publish("config:reload", &stamp).await {
                        warn!(%err, "reload notification not published");
                    }
                }
                Err(err) => error!(%err, "reload failed, keeping the previous registry"),
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (path, registry, coord);
        shutdown.cancelled().await;
    }
}

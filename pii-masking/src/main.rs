use std::{future::ready, sync::Arc};

use axum::{routing::get, Router};
use common_metrics::{serve, setup_metrics_routes};
use futures::{stream::FuturesUnordered, StreamExt};
use pii_masking::{app_context::AppContext, config::Config, worker::spawn_workers};
use tokio::{signal, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing() {
    let log_layer: tracing_subscriber::filter::Filtered<
        tracing_subscriber::fmt::Layer<tracing_subscriber::Registry>,
        EnvFilter,
        tracing_subscriber::Registry,
    > = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

pub async fn index() -> &'static str {
    "pii masking service"
}

fn start_health_liveness_server(
    config: &Config,
    context: Arc<AppContext>,
) -> Result<JoinHandle<()>, anyhow::Error> {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route(
            "/_liveness",
            get(move || ready(context.health_registry.get_status())),
        );
    let router = setup_metrics_routes(router)?;
    let bind = format!("{}:{}", config.host, config.port);
    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("failed to serve health and metrics on {}: {}", bind, e);
        }
    }))
}

async fn shutdown_on_signal(shutdown: CancellationToken) {
    let mut term = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!("failed to register SIGTERM handler: {}", e);
            return;
        }
    };

    tokio::select! {
        _ = term.recv() => {},
        _ = signal::ctrl_c() => {},
        // A worker failed and already asked everyone to stop
        _ = shutdown.cancelled() => return,
    };

    info!("Shutting down gracefully...");
    shutdown.cancel();
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    setup_tracing();
    info!("Starting up...");

    let config = match Config::init_with_defaults() {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {}", e);
            return Err(e.into());
        }
    };

    let context = Arc::new(AppContext::new(&config).await?);
    start_health_liveness_server(&config, context.clone())?;

    let shutdown = CancellationToken::new();
    let mut workers: FuturesUnordered<_> = spawn_workers(&config, &context, shutdown.clone())?
        .into_iter()
        .collect();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    let mut failed = 0;
    while let Some(joined) = workers.next().await {
        let result = match joined {
            Ok(result) => result,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            // The rest of the pool finishes its batches and exits too
            error!("worker failed, stopping: {}", e);
            failed += 1;
            shutdown.cancel();
        }
    }

    if failed > 0 {
        anyhow::bail!("{} workers failed", failed);
    }
    info!("all workers stopped");
    Ok(())
}

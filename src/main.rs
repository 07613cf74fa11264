mod config;

use clap::Parser as _;
use config::Config;
use spillway::{
    AppState, build_metrics_layer_and_handle, build_metrics_router, build_router,
    registry::{FileRegistry, WatchedFile},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{error, info, instrument};

#[tokio::main]
#[instrument]
pub async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse().validate()?;
    info!("Starting spillway with config: {:?}", config);

    let registry = FileRegistry::from_file(&config.servers)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load server registry: {}", e))?;

    if config.watch {
        registry
            .receive_updates(WatchedFile(config.servers.clone()))
            .await?;
    }

    let mut serves = JoinSet::new();

    let prometheus_layer = if config.metrics {
        let (prometheus_layer, prometheus_handle) =
            build_metrics_layer_and_handle(config.metrics_prefix.clone());
        let metrics_router = build_metrics_router(prometheus_handle);
        let bind_addr = format!("0.0.0.0:{}", config.metrics_port);
        let listener = TcpListener::bind(&bind_addr).await?;
        serves.spawn(axum::serve(listener, metrics_router).into_future());
        info!("Metrics endpoint enabled on {}", bind_addr);
        Some(prometheus_layer)
    } else {
        info!("Metrics endpoint disabled");
        None
    };

    let app_state = AppState::new(
        Arc::new(registry),
        config.dispatch_settings(),
        config.pool_settings(),
    );
    let mut router = build_router(app_state);
    if let Some(prometheus_layer) = prometheus_layer {
        router = router.layer(prometheus_layer);
    }

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    serves.spawn(axum::serve(listener, router).into_future());
    info!("spillway listening on {}", bind_addr);

    if let Some(result) = serves.join_next().await {
        result?.map_err(anyhow::Error::from)
    } else {
        error!("No server tasks were spawned");
        Err(anyhow::anyhow!("No server tasks were spawned"))
    }
}

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{Semaphore, watch};
use tracing::info;
use tracing_subscriber::EnvFilter;

use parkgrid::config::Config;
use parkgrid::context::Context;
use parkgrid::gateway::{Gateway, Port};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();
    parkgrid::observability::init(config.metrics_port);

    let ctx = Context::build(config.clone()).await?;
    ctx.spawn_background();

    let sensor_addr = format!("{}:{}", config.bind, config.sensor_port);
    let map_addr = format!("{}:{}", config.bind, config.map_port);
    let sensor_listener = TcpListener::bind(&sensor_addr).await?;
    let map_listener = TcpListener::bind(&map_addr).await?;
    info!("parkgrid sensors on {sensor_addr}, map on {map_addr}");
    info!(
        "  data_dir: {}",
        config
            .data_dir
            .as_ref()
            .map_or("ephemeral".to_string(), |d| d.display().to_string())
    );
    info!("  max_connections: {}", config.max_connections);
    info!("  redis: {}", config.redis_url.as_deref().unwrap_or("disabled"));
    info!("  push: {}", config.push_url.as_deref().unwrap_or("log only"));

    let semaphore = Arc::new(Semaphore::new(config.max_connections));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let gateway = Gateway::new(ctx.engine.clone(), ctx.grid_hub.clone(), ctx.sensor_hub.clone());
    let sensors = tokio::spawn(gateway.clone().serve(
        sensor_listener,
        Port::Sensor,
        semaphore.clone(),
        shutdown_rx.clone(),
    ));
    let map = tokio::spawn(gateway.serve(map_listener, Port::Map, semaphore.clone(), shutdown_rx));

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("shutdown signal received, stopping accept loops");
    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(sensors, map);

    // Wait for in-flight connections to finish (up to 10s)
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == config.max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = config.max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    info!("parkgrid stopped");
    Ok(())
}

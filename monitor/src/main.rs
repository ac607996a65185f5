use factory_monitor::config::Config;
use factory_monitor::readings::LatestReadings;
use factory_monitor::{metrics, rest, TelemetryListener, TelemetrySession};
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // Load configuration
    let config = Config::from_env()?;

    info!("Starting factory monitor");
    info!("Telemetry endpoint: {}", config.session.endpoint);
    info!("WebSocket: {}", config.session.ws_url);
    info!("HTTP server: {}", config.http_addr);
    info!("Units: {}", config.session.plant.units.len());

    // Initialize metrics
    metrics::init_metrics().map_err(|e| anyhow::anyhow!(e.to_string()))?;

    // Latest readings feed the status API
    let readings = Arc::new(LatestReadings::for_plant(&config.session.plant));
    let readings_listener: Arc<dyn TelemetryListener> = readings.clone();

    let mut session = TelemetrySession::new(config.session.clone());
    session.register_listener(&readings_listener);

    // Start HTTP server
    let app = rest::create_router(readings);
    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    });

    // Log in, open the stream and subscribe every unit
    let connected = session.connect().await;
    if !connected {
        warn!("Could not log in to the telemetry platform, serving status only");
    }

    // Run until the session gives up or shutdown is requested
    tokio::select! {
        _ = session.run(), if connected => {
            error!("Telemetry session stopped after exhausting reconnect attempts");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    session.disconnect().await;
    info!("Shutting down");
    Ok(())
}

mod auth;
mod feed;
mod telemetry;

use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use factory_monitor::plant::PlantConfig;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info};

/// Local stand-in for the telemetry platform: REST login plus a WebSocket
/// feed of random latest-telemetry frames.
#[derive(Debug, Parser)]
#[command(name = "simulator")]
struct Args {
    #[arg(long, env = "SIM_BIND", default_value = "127.0.0.1:8090")]
    bind: String,

    /// Interval between frames on each subscription
    #[arg(long, env = "SIM_RATE_MS", default_value_t = 1000)]
    rate_ms: u64,

    #[arg(long, env = "SIM_TOKEN_TTL_SECS", default_value_t = 9000)]
    token_ttl_secs: i64,

    /// Send a 401 error frame this long after each socket opens
    #[arg(long, env = "SIM_EXPIRE_AFTER_SECS")]
    expire_after_secs: Option<u64>,

    #[arg(long, env = "TB_USERNAME", default_value = "tenant@thingsboard.org")]
    username: String,

    #[arg(long, env = "TB_PASSWORD", default_value = "tenant")]
    password: String,

    /// Plant layout JSON; defaults to the built-in plant
    #[arg(long, env = "PLANT_CONFIG")]
    plant: Option<PathBuf>,
}

#[derive(Debug)]
pub struct Settings {
    pub username: String,
    pub password: String,
    pub token_ttl: chrono::Duration,
    pub rate: Duration,
    pub expire_after: Option<Duration>,
    pub plant: PlantConfig,
}

#[cfg(test)]
impl Settings {
    pub fn for_tests() -> Self {
        Self {
            username: "tenant@thingsboard.org".to_string(),
            password: "tenant".to_string(),
            token_ttl: chrono::Duration::hours(1),
            rate: Duration::from_millis(100),
            expire_after: None,
            plant: PlantConfig::builtin().unwrap(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub refresh_tokens: Arc<Mutex<HashSet<String>>>,
    pub published: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: Arc::new(settings),
            refresh_tokens: Arc::new(Mutex::new(HashSet::new())),
            published: Arc::new(AtomicU64::new(0)),
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let plant = match &args.plant {
        Some(path) => PlantConfig::load(path),
        None => PlantConfig::builtin(),
    };
    let plant = match plant {
        Ok(plant) => plant,
        Err(e) => {
            error!("Failed to load plant config: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting telemetry platform simulator");
    info!(
        "Bind: {}, Rate: {} ms, Units: {}, Token TTL: {} s",
        args.bind,
        args.rate_ms,
        plant.units.len(),
        args.token_ttl_secs
    );

    let state = AppState::new(Settings {
        username: args.username,
        password: args.password,
        token_ttl: chrono::Duration::seconds(args.token_ttl_secs),
        rate: Duration::from_millis(args.rate_ms.max(1)),
        expire_after: args.expire_after_secs.map(Duration::from_secs),
        plant,
    });

    let app = Router::new()
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/token", post(auth::refresh))
        .route("/api/ws", get(feed::ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", args.bind, e);
            std::process::exit(1);
        });
    info!("Simulator listening on {}", args.bind);

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    tokio::select! {
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }
}

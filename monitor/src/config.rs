use crate::auth::Credentials;
use crate::plant::PlantConfig;
use crate::session::{ReconnectPolicy, SessionConfig};
use anyhow::{anyhow, Context, Result};
use std::env;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
pub struct Config {
    pub session: SessionConfig,
    pub http_addr: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let endpoint = env_string("TB_URL", Some("http://127.0.0.1:8090".to_string()))?;
        let ws_url = match env_optional("TB_WS_URL") {
            Some(url) => url,
            None => derive_ws_url(&endpoint)?,
        };

        let credentials = Credentials {
            username: env_string("TB_USERNAME", None)?,
            password: env_string("TB_PASSWORD", None)?,
        };

        let plant = match env_optional("PLANT_CONFIG") {
            Some(path) => PlantConfig::load(&path)
                .with_context(|| format!("failed to load plant config from {}", path))?,
            None => PlantConfig::builtin().context("invalid built-in plant config")?,
        };

        let http_addr = env_string("HTTP_ADDR", Some("0.0.0.0:8080".to_string()))?;

        let mut session = SessionConfig::new(endpoint, ws_url, credentials, plant);
        let defaults = ReconnectPolicy::default();
        session.reconnect = ReconnectPolicy {
            max_attempts: env_u32("RECONNECT_MAX_ATTEMPTS", defaults.max_attempts)?,
            delay: Duration::from_millis(env_u64(
                "RECONNECT_DELAY_MS",
                defaults.delay.as_millis() as u64,
            )?),
        };
        session.auth_settle = Duration::from_millis(env_u64(
            "AUTH_SETTLE_MS",
            session.auth_settle.as_millis() as u64,
        )?);
        session.refresh_margin = refresh_margin(env_u64(
            "TOKEN_REFRESH_MARGIN_SECS",
            session.refresh_margin.num_seconds().unsigned_abs(),
        )?)?;

        Ok(Self { session, http_addr })
    }
}

/// `http(s)://host[:port]/...` to `ws(s)://host[:port]/api/ws`.
pub fn derive_ws_url(endpoint: &str) -> Result<String> {
    let mut url = Url::parse(endpoint).with_context(|| format!("invalid TB_URL {}", endpoint))?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => return Err(anyhow!("unsupported TB_URL scheme {}", other)),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("cannot switch {} to {}", endpoint, scheme))?;
    url.set_path("/api/ws");
    url.set_query(None);
    Ok(url.to_string())
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match env_optional(key) {
        Some(raw) => raw.parse().with_context(|| format!("invalid {key}")),
        None => Ok(default),
    }
}

fn env_u32(key: &str, default: u32) -> Result<u32> {
    let value = env_u64(key, u64::from(default))?;
    u32::try_from(value).with_context(|| format!("{key} out of range: {value}"))
}

fn refresh_margin(secs: u64) -> Result<chrono::Duration> {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .ok_or_else(|| anyhow!("TOKEN_REFRESH_MARGIN_SECS out of range: {secs}"))
}

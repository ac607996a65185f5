use crate::AppState;
use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use factory_monitor::auth::{decode_expiry, encode_unsigned_token};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    refresh_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    token: String,
    refresh_token: String,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<Value>)>;

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<TokenResponse> {
    if req.username != state.settings.username || req.password != state.settings.password {
        warn!("Rejected login for {}", req.username);
        return Err(unauthorized("Authentication failed"));
    }

    info!("Issued token for {}", req.username);
    Ok(Json(issue_pair(&state).await))
}

/// Refresh tokens are single-use.
pub async fn refresh(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> ApiResult<TokenResponse> {
    if !state.refresh_tokens.lock().await.remove(&req.refresh_token) {
        warn!("Rejected unknown refresh token");
        return Err(unauthorized("Invalid refresh token"));
    }

    info!("Refreshed token");
    Ok(Json(issue_pair(&state).await))
}

/// Whether a token presented on the WebSocket is still valid.
pub fn token_is_valid(token: &str) -> bool {
    decode_expiry(token).is_some_and(|expires_at| expires_at > Utc::now())
}

async fn issue_pair(state: &AppState) -> TokenResponse {
    let expires_at = Utc::now() + state.settings.token_ttl;
    let token = encode_unsigned_token(&state.settings.username, expires_at);
    let refresh_token = Uuid::new_v4().to_string();
    state
        .refresh_tokens
        .lock()
        .await
        .insert(refresh_token.clone());

    TokenResponse {
        token,
        refresh_token,
    }
}

fn unauthorized(message: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "status": 401, "message": message, "errorCode": 10 })),
    )
}

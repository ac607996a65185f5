use crate::errors::{Error, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Expiry assumed for tokens whose payload cannot be decoded.
pub const FALLBACK_TOKEN_TTL_SECS: i64 = 2 * 60 * 60;

#[derive(Clone, Serialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenPair {
    pub token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    token: String,
    refresh_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct Claims {
    exp: i64,
}

/// One-shot client for `/api/auth/login` and `/api/auth/token`.
#[derive(Debug, Clone)]
pub struct AuthClient {
    http: reqwest::Client,
    endpoint: String,
}

impl AuthClient {
    pub fn new(http: reqwest::Client, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        Self { http, endpoint }
    }

    pub async fn login(&self, credentials: &Credentials) -> Result<TokenPair> {
        let url = format!("{}/api/auth/login", self.endpoint);
        self.exchange(&url, credentials).await
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let url = format!("{}/api/auth/token", self.endpoint);
        self.exchange(&url, &RefreshRequest { refresh_token }).await
    }

    async fn exchange<B: Serialize + ?Sized>(&self, url: &str, body: &B) -> Result<TokenPair> {
        let response = self
            .http
            .post(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Auth(format!("{} - {}", status, text)));
        }

        let body: TokenResponse = response.json().await?;
        Ok(TokenPair {
            expires_at: token_expiry(&body.token),
            token: body.token,
            refresh_token: body.refresh_token,
        })
    }
}

/// Expiry from the JWT `exp` claim, or now + two hours when it cannot be read.
pub fn token_expiry(token: &str) -> DateTime<Utc> {
    decode_expiry(token).unwrap_or_else(|| Utc::now() + Duration::seconds(FALLBACK_TOKEN_TTL_SECS))
}

/// The JWT `exp` claim, if the payload can be decoded.
pub fn decode_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Claims = serde_json::from_slice(&bytes).ok()?;
    Utc.timestamp_opt(claims.exp, 0).single()
}

/// Build an unsigned JWT-shaped token carrying `exp`. Used by the simulator and tests.
pub fn encode_unsigned_token(subject: &str, expires_at: DateTime<Utc>) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let claims = serde_json::json!({ "sub": subject, "exp": expires_at.timestamp() });
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.", header, payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_from_claim() {
        let expires = Utc.timestamp_opt(4_000_000_000, 0).unwrap();
        let token = encode_unsigned_token("tenant@thingsboard.org", expires);

        assert_eq!(token_expiry(&token), expires);
    }

    #[test]
    fn test_padded_payload_still_decodes() {
        let expires = Utc.timestamp_opt(4_000_000_000, 0).unwrap();
        let token = encode_unsigned_token("a", expires);
        let mut parts: Vec<String> = token.split('.').map(str::to_string).collect();
        parts[1].push_str("==");

        assert_eq!(token_expiry(&parts.join(".")), expires);
    }

    #[test]
    fn test_undecodable_token_defaults_to_two_hours() {
        let ttl = Duration::seconds(FALLBACK_TOKEN_TTL_SECS);
        let before = Utc::now();
        let expiry = token_expiry("not-a-jwt");
        let after = Utc::now();

        assert!(expiry >= before + ttl);
        assert!(expiry <= after + ttl);
    }

    #[test]
    fn test_missing_exp_defaults() {
        let payload = URL_SAFE_NO_PAD.encode(br#"{"sub":"x"}"#);
        let expiry = token_expiry(&format!("h.{}.s", payload));

        assert!(expiry > Utc::now() + Duration::minutes(119));
    }
}

use crate::auth::{AuthClient, Credentials, TokenPair};
use crate::errors::{Error, Result};
use crate::listeners::{ListenerRegistry, TelemetryListener};
use crate::metrics::{
    AUTH_FAILURES_TOTAL, CONNECTED, DISPATCH_TOTAL, FRAMES_DROPPED_TOTAL, FRAMES_TOTAL,
    RECONNECT_ATTEMPTS_TOTAL, TOKEN_REFRESH_TOTAL,
};
use crate::model::{Category, Subscription, TelemetryFrame};
use crate::plant::PlantConfig;
use crate::protocol::{self, ClientMessage, ServerMessage, SubscribeCmd, ERROR_CODE_UNAUTHORIZED};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 3000;
const DEFAULT_AUTH_SETTLE_MS: u64 = 1000;
const DEFAULT_REFRESH_MARGIN_SECS: i64 = 5 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Disconnected,
    Authenticating,
    Subscribing,
    Streaming,
}

/// Fixed-delay, bounded reconnect policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base URL of the REST API, e.g. `https://tb.example.com`.
    pub endpoint: String,
    pub ws_url: String,
    pub credentials: Credentials,
    pub plant: PlantConfig,
    pub reconnect: ReconnectPolicy,
    /// Pause between the auth command and the first subscription.
    pub auth_settle: Duration,
    /// Tokens expiring within this margin are refreshed before reconnecting.
    pub refresh_margin: chrono::Duration,
}

impl SessionConfig {
    pub fn new(
        endpoint: impl Into<String>,
        ws_url: impl Into<String>,
        credentials: Credentials,
        plant: PlantConfig,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            ws_url: ws_url.into(),
            credentials,
            plant,
            reconnect: ReconnectPolicy::default(),
            auth_settle: Duration::from_millis(DEFAULT_AUTH_SETTLE_MS),
            refresh_margin: chrono::Duration::seconds(DEFAULT_REFRESH_MARGIN_SECS),
        }
    }
}

/// Authenticated WebSocket session to the telemetry platform.
///
/// All state lives behind `&mut self` and is driven from a single task.
/// Subscriptions are recorded before their command is sent, so any frame that
/// follows can be resolved to its unit.
pub struct TelemetrySession {
    config: SessionConfig,
    auth: AuthClient,
    tokens: Option<TokenPair>,
    socket: Option<WsStream>,
    connected: bool,
    state: SessionState,
    next_cmd_id: u64,
    subscriptions: HashMap<u64, Subscription>,
    reconnect_attempts: u32,
    listeners: ListenerRegistry,
}

impl TelemetrySession {
    pub fn new(config: SessionConfig) -> Self {
        Self::with_client(config, reqwest::Client::new())
    }

    pub fn with_client(config: SessionConfig, http: reqwest::Client) -> Self {
        let auth = AuthClient::new(http, config.endpoint.clone());
        Self {
            config,
            auth,
            tokens: None,
            socket: None,
            connected: false,
            state: SessionState::Disconnected,
            next_cmd_id: 0,
            subscriptions: HashMap::new(),
            reconnect_attempts: 0,
            listeners: ListenerRegistry::new(),
        }
    }

    pub fn register_listener(&mut self, listener: &Arc<dyn TelemetryListener>) {
        self.listeners.register(listener);
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.connected && self.socket.is_some()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn subscription(&self, cmd_id: u64) -> Option<&Subscription> {
        self.subscriptions.get(&cmd_id)
    }

    pub fn token_expiry(&self) -> Option<DateTime<Utc>> {
        self.tokens.as_ref().map(|t| t.expires_at)
    }

    /// Log in and open the stream.
    ///
    /// Returns false only when login fails. If the socket cannot be opened the
    /// session is left disconnected and `run` takes over with the reconnect
    /// budget.
    pub async fn connect(&mut self) -> bool {
        if self.is_connected() {
            info!("WebSocket already connected");
            return true;
        }

        self.set_state(SessionState::Authenticating);
        if !self.login().await {
            self.set_state(SessionState::Disconnected);
            return false;
        }

        self.reconnect_attempts = 0;
        if let Err(e) = self.open_socket().await {
            warn!("Failed to open WebSocket: {}", e);
            self.mark_disconnected();
        }
        true
    }

    /// Exchange the configured credentials for a fresh token pair.
    pub async fn login(&mut self) -> bool {
        info!(
            "Logging in to {} as {}",
            self.config.endpoint, self.config.credentials.username
        );

        match self.auth.login(&self.config.credentials).await {
            Ok(tokens) => {
                info!("Login successful, token expires at {}", tokens.expires_at);
                self.tokens = Some(tokens);
                true
            }
            Err(e) => {
                AUTH_FAILURES_TOTAL.inc();
                error!("Login error: {}", e);
                false
            }
        }
    }

    /// Refresh with the held refresh token, falling back to a full login.
    pub async fn refresh_access_token(&mut self) -> bool {
        let refresh_token = self
            .tokens
            .as_ref()
            .map(|t| t.refresh_token.clone())
            .filter(|t| !t.is_empty());

        let Some(refresh_token) = refresh_token else {
            return self.login().await;
        };

        match self.auth.refresh(&refresh_token).await {
            Ok(tokens) => {
                TOKEN_REFRESH_TOTAL.inc();
                info!("Token refreshed, expires at {}", tokens.expires_at);
                self.tokens = Some(tokens);
                true
            }
            Err(e) => {
                AUTH_FAILURES_TOTAL.inc();
                warn!("Token refresh error, falling back to login: {}", e);
                self.login().await
            }
        }
    }

    /// Reuse the current token unless it is missing or about to expire.
    pub async fn ensure_valid_token(&mut self) -> bool {
        let margin = self.config.refresh_margin;
        let fresh = self
            .tokens
            .as_ref()
            .and_then(|t| t.expires_at.checked_sub_signed(margin))
            .is_some_and(|deadline| Utc::now() < deadline);

        if fresh {
            return true;
        }

        debug!("Token missing or within {}s of expiry", margin.num_seconds());
        self.refresh_access_token().await
    }

    /// Subscribe the power meter and the vibration sensor of every unit.
    ///
    /// The subscription map is cleared first so reconnects don't accumulate
    /// stale entries. Returns the number of subscriptions issued.
    pub async fn subscribe_to_all_entities(&mut self) -> Result<usize> {
        if self.socket.is_none() {
            return Err(Error::NotConnected);
        }
        self.subscriptions.clear();

        let units: Vec<(u32, Uuid, Uuid)> = self
            .config
            .plant
            .units
            .iter()
            .map(|u| (u.id, u.power_meter_id, u.vibration_id))
            .collect();

        for (unit_id, power_meter_id, vibration_id) in &units {
            self.subscribe_to_device(*power_meter_id, Category::Power, Some(*unit_id))
                .await?;
            self.subscribe_to_device(*vibration_id, Category::Vibration, Some(*unit_id))
                .await?;
        }

        Ok(units.len() * 2)
    }

    pub async fn subscribe_to_device(
        &mut self,
        device_id: Uuid,
        category: Category,
        unit_id: Option<u32>,
    ) -> Result<u64> {
        if self.socket.is_none() {
            return Err(Error::NotConnected);
        }

        let cmd_id = self.next_cmd_id();
        self.subscriptions.insert(
            cmd_id,
            Subscription {
                cmd_id,
                device_id,
                category,
                unit_id,
            },
        );
        self.send(&ClientMessage::subscribe(SubscribeCmd::latest_telemetry(
            cmd_id, device_id,
        )))
        .await?;

        match unit_id {
            Some(unit) => info!("Subscribed to {} device {} (unit {})", category, device_id, unit),
            None => info!("Subscribed to {} device {}", category, device_id),
        }
        Ok(cmd_id)
    }

    /// Route one inbound text frame. Never fails: bad frames are logged and dropped.
    pub async fn handle_message(&mut self, raw: &str) {
        FRAMES_TOTAL.inc();
        debug!("WebSocket message received: {}", raw);

        let message: ServerMessage = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(e) => {
                FRAMES_DROPPED_TOTAL.inc();
                warn!("Error parsing WebSocket message: {}", e);
                return;
            }
        };

        if let (Some(subscription_id), Some(data)) = (message.subscription_id, &message.data) {
            self.process_subscription_data(subscription_id, data);
        }

        if let Some(code) = message.error() {
            error!(
                "WebSocket error {}: {}",
                code,
                message.error_msg.as_deref().unwrap_or_default()
            );
            if code == ERROR_CODE_UNAUTHORIZED {
                self.refresh_and_reconnect().await;
            }
        }
    }

    /// Dispatch a subscription update to every category its keys match.
    fn process_subscription_data(
        &mut self,
        subscription_id: u64,
        data: &BTreeMap<String, Value>,
    ) -> Vec<Category> {
        let frame: TelemetryFrame = protocol::to_frame(data);

        let unit = match self.subscriptions.get(&subscription_id) {
            Some(subscription) => subscription.unit_id,
            None => {
                debug!("No subscription recorded for id {}", subscription_id);
                None
            }
        };

        let categories = self.config.plant.keys.classify(&frame);
        for category in &categories {
            debug!("{} data for unit {:?}", category, unit);
            DISPATCH_TOTAL
                .with_label_values(&[category.to_string().as_str()])
                .inc();
            self.listeners.dispatch(*category, &frame, unit);
        }
        categories
    }

    /// Refresh the token and reopen the stream with a full resubscription.
    /// Does not consume reconnect attempts.
    pub async fn refresh_and_reconnect(&mut self) -> bool {
        self.set_state(SessionState::Authenticating);
        if !self.refresh_access_token().await {
            warn!("Token refresh failed, keeping current connection");
            let state = if self.is_connected() {
                SessionState::Streaming
            } else {
                SessionState::Disconnected
            };
            self.set_state(state);
            return false;
        }

        self.disconnect().await;
        match self.open_socket().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to reopen WebSocket after refresh: {}", e);
                self.mark_disconnected();
                false
            }
        }
    }

    /// Close the socket. Subscriptions are kept until the next resubscribe.
    pub async fn disconnect(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            if let Err(e) = socket.close(None).await {
                debug!("Error closing WebSocket: {}", e);
            }
        }
        self.mark_disconnected();
    }

    /// Drive the stream until the reconnect budget is exhausted.
    pub async fn run(&mut self) {
        if self.tokens.is_none() {
            warn!("Session has no token, call connect() first");
            return;
        }

        loop {
            // Wait for the next frame, or treat a missing socket as closed
            let next = match self.socket.as_mut() {
                Some(socket) => socket.next().await,
                None => None,
            };

            match next {
                Some(Ok(Message::Text(text))) => self.handle_message(text.as_str()).await,
                Some(Ok(Message::Close(frame))) => {
                    info!("WebSocket closed: {:?}", frame);
                    self.mark_disconnected();
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("WebSocket error: {}", e);
                    self.mark_disconnected();
                }
                None => self.mark_disconnected(),
            }

            // Socket gone: reconnect within the budget or give up
            if self.socket.is_none() && !self.reconnect().await {
                break;
            }
        }
    }

    async fn reconnect(&mut self) -> bool {
        let policy = self.config.reconnect;

        while self.reconnect_attempts < policy.max_attempts {
            self.reconnect_attempts += 1;
            RECONNECT_ATTEMPTS_TOTAL.inc();
            info!(
                "Attempting to reconnect ({}/{}) in {:?}",
                self.reconnect_attempts, policy.max_attempts, policy.delay
            );
            tokio::time::sleep(policy.delay).await;

            // A failed token check still consumes the attempt
            self.set_state(SessionState::Authenticating);
            if !self.ensure_valid_token().await {
                warn!("No valid token for reconnect attempt {}", self.reconnect_attempts);
                self.set_state(SessionState::Disconnected);
                continue;
            }

            match self.open_socket().await {
                Ok(()) => return true,
                Err(e) => {
                    warn!("Reconnect attempt {} failed: {}", self.reconnect_attempts, e);
                    self.mark_disconnected();
                }
            }
        }

        error!("Max reconnection attempts reached ({})", policy.max_attempts);
        self.set_state(SessionState::Disconnected);
        false
    }

    async fn open_socket(&mut self) -> Result<()> {
        let token = self
            .tokens
            .as_ref()
            .map(|t| t.token.clone())
            .ok_or_else(|| Error::Auth("no token available".to_string()))?;

        info!("Connecting to WebSocket at {}", self.config.ws_url);
        let (socket, _) = connect_async(self.config.ws_url.as_str()).await?;
        self.socket = Some(socket);
        self.connected = true;
        self.reconnect_attempts = 0;
        CONNECTED.set(1.0);
        self.listeners.connection_changed(true);
        info!("WebSocket connected");

        let cmd_id = self.next_cmd_id();
        self.send(&ClientMessage::auth(cmd_id, token)).await?;
        debug!("Auth command sent");

        if !self.config.auth_settle.is_zero() {
            tokio::time::sleep(self.config.auth_settle).await;
        }

        self.set_state(SessionState::Subscribing);
        let issued = self.subscribe_to_all_entities().await?;
        let server_monitor_id = self.config.plant.server_monitor_id;
        self.subscribe_to_device(server_monitor_id, Category::Server, None)
            .await?;
        self.set_state(SessionState::Streaming);

        info!("{} subscriptions sent, waiting for data", issued + 1);
        Ok(())
    }

    async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        let socket = self.socket.as_mut().ok_or(Error::NotConnected)?;
        let text = serde_json::to_string(message)?;
        socket.send(Message::text(text)).await?;
        Ok(())
    }

    fn mark_disconnected(&mut self) {
        self.socket = None;
        self.set_state(SessionState::Disconnected);
        if self.connected {
            self.connected = false;
            CONNECTED.set(0.0);
            self.listeners.connection_changed(false);
        }
    }

    fn next_cmd_id(&mut self) -> u64 {
        let id = self.next_cmd_id;
        self.next_cmd_id += 1;
        id
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!("Session state {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TelemetryPoint;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        power: Mutex<Vec<(TelemetryFrame, Option<u32>)>>,
        vibration: Mutex<Vec<(TelemetryFrame, Option<u32>)>>,
        server: Mutex<Vec<TelemetryFrame>>,
    }

    impl TelemetryListener for Recorder {
        fn on_vibration_data(&self, frame: &TelemetryFrame, unit: Option<u32>) {
            self.vibration.lock().push((frame.clone(), unit));
        }

        fn on_power_data(&self, frame: &TelemetryFrame, unit: Option<u32>) {
            self.power.lock().push((frame.clone(), unit));
        }

        fn on_server_data(&self, frame: &TelemetryFrame) {
            self.server.lock().push(frame.clone());
        }
    }

    fn unreachable_session() -> TelemetrySession {
        let plant = PlantConfig::builtin().unwrap();
        let credentials = Credentials {
            username: "tenant@thingsboard.org".to_string(),
            password: "secret".to_string(),
        };
        TelemetrySession::new(SessionConfig::new(
            "http://127.0.0.1:1",
            "ws://127.0.0.1:1/api/ws",
            credentials,
            plant,
        ))
    }

    fn with_recorder(session: &mut TelemetrySession) -> Arc<Recorder> {
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn TelemetryListener> = recorder.clone();
        session.register_listener(&listener);
        recorder
    }

    fn record(session: &mut TelemetrySession, cmd_id: u64, category: Category, unit_id: Option<u32>) {
        session.subscriptions.insert(
            cmd_id,
            Subscription {
                cmd_id,
                device_id: Uuid::new_v4(),
                category,
                unit_id,
            },
        );
    }

    #[test]
    fn test_power_frame_routed_to_unit() {
        let mut session = unreachable_session();
        let recorder = with_recorder(&mut session);
        record(&mut session, 7, Category::Power, Some(3));

        tokio_test::block_on(
            session.handle_message(r#"{"subscriptionId": 7, "data": {"voltage": [[1000, "230.5"]]}}"#),
        );

        let power = recorder.power.lock();
        assert_eq!(power.len(), 1);
        let (frame, unit) = &power[0];
        assert_eq!(*unit, Some(3));
        assert_eq!(
            frame.get("voltage").unwrap(),
            &[TelemetryPoint { ts: 1000, value: "230.5".to_string() }]
        );
        assert!(recorder.vibration.lock().is_empty());
    }

    #[test]
    fn test_overlapping_frame_dispatched_to_both_categories() {
        let mut session = unreachable_session();
        let recorder = with_recorder(&mut session);
        record(&mut session, 2, Category::Vibration, Some(1));

        tokio_test::block_on(session.handle_message(
            r#"{"subscriptionId": 2, "data": {"accel_x": [[1, "0.1"]], "voltage": [[1, "230"]]}}"#,
        ));

        assert_eq!(recorder.vibration.lock().len(), 1);
        assert_eq!(recorder.power.lock().len(), 1);
        assert_eq!(recorder.power.lock()[0].1, Some(1));
        assert!(recorder.server.lock().is_empty());
    }

    #[test]
    fn test_unknown_subscription_has_no_unit() {
        let mut session = unreachable_session();
        let recorder = with_recorder(&mut session);

        let data: BTreeMap<String, Value> =
            serde_json::from_str(r#"{"cpu_usage": [[5, 12.5]]}"#).unwrap();
        let categories = session.process_subscription_data(99, &data);

        assert_eq!(categories, vec![Category::Server]);
        assert_eq!(recorder.server.lock()[0].latest_f64("cpu_usage"), Some(12.5));
    }

    #[test]
    fn test_malformed_frames_are_dropped() {
        let mut session = unreachable_session();
        let recorder = with_recorder(&mut session);
        record(&mut session, 1, Category::Power, Some(1));

        tokio_test::block_on(async {
            session.handle_message("not json").await;
            session.handle_message(r#"{"subscriptionId": "x"}"#).await;
            session.handle_message(r#"{"subscriptionId": 1}"#).await;
            session.handle_message(r#"{"errorCode": 3, "errorMsg": "bad cmd"}"#).await;
        });

        assert!(recorder.power.lock().is_empty());
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_subscribe_requires_socket() {
        let mut session = unreachable_session();

        let result = session
            .subscribe_to_device(Uuid::new_v4(), Category::Power, Some(1))
            .await;

        assert!(matches!(result, Err(Error::NotConnected)));
        assert_eq!(session.next_cmd_id, 0);
        assert_eq!(session.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_fresh_token_is_reused() {
        let mut session = unreachable_session();
        let tokens = TokenPair {
            token: "t".to_string(),
            refresh_token: "r".to_string(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        };
        session.tokens = Some(tokens.clone());

        assert!(session.ensure_valid_token().await);
        assert_eq!(session.tokens, Some(tokens));
    }

    #[tokio::test]
    async fn test_expiring_token_refresh_fails_closed() {
        let mut session = unreachable_session();
        let tokens = TokenPair {
            token: "t".to_string(),
            refresh_token: "r".to_string(),
            expires_at: Utc::now() + chrono::Duration::minutes(2),
        };
        session.tokens = Some(tokens.clone());

        assert!(!session.ensure_valid_token().await);
        assert_eq!(session.tokens, Some(tokens));
    }

    #[tokio::test]
    async fn test_earliest_representable_expiry_needs_refresh() {
        let mut session = unreachable_session();
        let tokens = TokenPair {
            token: "t".to_string(),
            refresh_token: "r".to_string(),
            expires_at: DateTime::<Utc>::MIN_UTC,
        };
        session.tokens = Some(tokens.clone());

        assert!(!session.ensure_valid_token().await);
        assert_eq!(session.tokens, Some(tokens));
    }

    #[tokio::test]
    async fn test_connect_fails_closed_when_unreachable() {
        let mut session = unreachable_session();

        assert!(!session.connect().await);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.token_expiry().is_none());

        session.run().await;
        assert_eq!(session.reconnect_attempts(), 0);
    }
}

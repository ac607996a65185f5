#![allow(dead_code)]

use chrono::{Duration as ChronoDuration, Utc};
use factory_monitor::auth::{encode_unsigned_token, Credentials};
use factory_monitor::plant::PlantConfig;
use factory_monitor::session::ReconnectPolicy;
use factory_monitor::{SessionConfig, TelemetryFrame, TelemetryListener, TelemetrySession};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub const UNIT_1_POWER: &str = "477540a0-cbae-11f0-bef6-8f80a62bf6a0";
pub const UNIT_1_VIBRATION: &str = "477d08d0-cbae-11f0-bef6-8f80a62bf6a0";
pub const UNIT_2_POWER: &str = "47928ca0-cbae-11f0-bef6-8f80a62bf6a0";
pub const UNIT_2_VIBRATION: &str = "47921771-cbae-11f0-bef6-8f80a62bf6a0";
pub const SERVER_MONITOR: &str = "96212c00-c3a2-11f0-acc6-23bfa2fab24c";

pub fn two_unit_plant() -> PlantConfig {
    let raw = json!({
        "units": [
            {"id": 1, "power_meter_id": UNIT_1_POWER, "vibration_id": UNIT_1_VIBRATION},
            {"id": 2, "power_meter_id": UNIT_2_POWER, "vibration_id": UNIT_2_VIBRATION, "status": "warning"}
        ],
        "server_monitor_id": SERVER_MONITOR,
        "keys": {
            "vibration": ["accel_x", "velocity_x", "vib_temp"],
            "power_meter": ["current", "voltage", "active_power"],
            "server_monitor": ["cpu_usage", "cpu_temp"]
        }
    });
    PlantConfig::from_json(&raw.to_string()).unwrap()
}

pub fn token_valid_for(hours: i64) -> String {
    encode_unsigned_token("tenant@thingsboard.org", Utc::now() + ChronoDuration::hours(hours))
}

pub fn test_session(endpoint: &str, ws_url: &str) -> TelemetrySession {
    let credentials = Credentials {
        username: "tenant@thingsboard.org".to_string(),
        password: "tenant".to_string(),
    };
    let mut config = SessionConfig::new(endpoint, ws_url, credentials, two_unit_plant());
    config.auth_settle = Duration::ZERO;
    config.reconnect = ReconnectPolicy {
        max_attempts: 5,
        delay: Duration::from_millis(20),
    };
    TelemetrySession::new(config)
}

pub async fn mount_login(server: &MockServer, token: &str, refresh_token: &str, expected: u64) {
    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token": token,
            "refreshToken": refresh_token
        })))
        .expect(expected)
        .mount(server)
        .await;
}

pub async fn mount_refresh(server: &MockServer, token: &str, refresh_token: &str, expected: u64) {
    Mock::given(method("POST"))
        .and(path("/api/auth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token": token,
            "refreshToken": refresh_token
        })))
        .expect(expected)
        .mount(server)
        .await;
}

/// Listener that records everything it receives.
#[derive(Default)]
pub struct Recorder {
    pub power: Mutex<Vec<(TelemetryFrame, Option<u32>)>>,
    pub vibration: Mutex<Vec<(TelemetryFrame, Option<u32>)>>,
    pub server: Mutex<Vec<TelemetryFrame>>,
    pub connection: Mutex<Vec<bool>>,
}

impl Recorder {
    pub fn attach(session: &mut TelemetrySession) -> Arc<Recorder> {
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn TelemetryListener> = recorder.clone();
        session.register_listener(&listener);
        recorder
    }
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

    fn on_connection_change(&self, connected: bool) {
        self.connection.lock().push(connected);
    }
}

#[derive(Debug, Clone)]
enum Push {
    Text(String),
    Close,
}

/// In-process stand-in for the platform's WebSocket endpoint.
///
/// Accepts at most `max_connections` sockets, then stops listening so any
/// further connect is refused.
pub struct MockPlatform {
    pub ws_url: String,
    received: mpsc::UnboundedReceiver<(usize, Value)>,
    push: broadcast::Sender<Push>,
    connections: Arc<AtomicUsize>,
}

impl MockPlatform {
    pub async fn start(max_connections: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_url = format!("ws://{}/api/ws", listener.local_addr().unwrap());
        let (received_tx, received) = mpsc::unbounded_channel();
        let (push, _) = broadcast::channel(64);
        let connections = Arc::new(AtomicUsize::new(0));

        let push_tx = push.clone();
        let counter = connections.clone();
        tokio::spawn(async move {
            while counter.load(Ordering::SeqCst) < max_connections {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let index = counter.fetch_add(1, Ordering::SeqCst);
                let events = push_tx.subscribe();
                let received_tx = received_tx.clone();
                tokio::spawn(serve_connection(stream, index, events, received_tx));
            }
        });

        Self {
            ws_url,
            received,
            push,
            connections,
        }
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Send a text frame to every open connection.
    pub fn push(&self, frame: Value) {
        let _ = self.push.send(Push::Text(frame.to_string()));
    }

    pub fn close_all(&self) {
        let _ = self.push.send(Push::Close);
    }

    /// Next client frame as `(connection index, json)`.
    pub async fn next_message(&mut self) -> (usize, Value) {
        timeout(TIMEOUT, self.received.recv())
            .await
            .expect("timeout waiting for client frame")
            .expect("platform stopped")
    }

    pub async fn collect(&mut self, count: usize) -> Vec<(usize, Value)> {
        let mut messages = Vec::with_capacity(count);
        for _ in 0..count {
            messages.push(self.next_message().await);
        }
        messages
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    index: usize,
    mut events: broadcast::Receiver<Push>,
    received: mpsc::UnboundedSender<(usize, Value)>,
) {
    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };

    loop {
        tokio::select! {
            incoming = ws.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let value: Value = serde_json::from_str(text.as_str()).unwrap();
                    let _ = received.send((index, value));
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
            event = events.recv() => match event {
                Ok(Push::Text(text)) => {
                    if ws.send(Message::text(text)).await.is_err() {
                        break;
                    }
                }
                Ok(Push::Close) | Err(_) => {
                    let _ = ws.close(None).await;
                    break;
                }
            },
        }
    }
}

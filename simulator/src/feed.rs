use crate::auth::token_is_valid;
use crate::telemetry::generate_frame;
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use factory_monitor::protocol::{ClientMessage, ServerMessage, ERROR_CODE_UNAUTHORIZED};
use factory_monitor::Category;
use futures::{Sink, SinkExt};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::Ordering;
use std::fmt::Display;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Error code sent back for a subscription to an unknown device.
const ERROR_CODE_NOT_FOUND: i64 = 2;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

#[derive(Default)]
struct Connection {
    authenticated: bool,
    subscriptions: Vec<(u64, Category)>,
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    info!("WebSocket client connected");

    let mut conn = Connection::default();
    let mut rng = StdRng::from_entropy();
    let mut ticker = interval(state.settings.rate);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let expire_after = state.settings.expire_after;
    let expire = async move {
        match expire_after {
            Some(after) => sleep(after).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(expire);
    let mut expired = false;

    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let replies = handle_command(&mut conn, &text, &state);
                    if !send_all(&mut socket, &replies).await {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("WebSocket receive error: {}", e);
                    break;
                }
            },
            _ = ticker.tick(), if conn.authenticated && !expired => {
                let mut failed = false;
                for (cmd_id, category) in &conn.subscriptions {
                    let frame = generate_frame(&mut rng, *category, &state.settings.plant.keys);
                    if !send(&mut socket, &ServerMessage::update(*cmd_id, &frame)).await {
                        failed = true;
                        break;
                    }
                    let published = state.published.fetch_add(1, Ordering::Relaxed) + 1;
                    if published % 1000 == 0 {
                        info!("Published {} frames", published);
                    }
                }
                if failed {
                    break;
                }
            }
            _ = &mut expire, if !expired => {
                expired = true;
                info!("Expiring session token");
                let message = ServerMessage::with_error(ERROR_CODE_UNAUTHORIZED, "Token has expired");
                if !send(&mut socket, &message).await {
                    break;
                }
            }
        }
    }

    info!("WebSocket client disconnected");
}

/// Apply one client frame and return the frames to send back.
fn handle_command(conn: &mut Connection, text: &str, state: &AppState) -> Vec<ServerMessage> {
    let command: ClientMessage = match serde_json::from_str(text) {
        Ok(command) => command,
        Err(e) => {
            warn!("Ignoring malformed command: {}", e);
            return Vec::new();
        }
    };

    let mut replies = Vec::new();

    if let Some(auth) = command.auth_cmd {
        if token_is_valid(&auth.token) {
            debug!("Client authenticated with cmdId {}", auth.cmd_id);
            conn.authenticated = true;
        } else {
            warn!("Client sent an invalid or expired token");
            replies.push(ServerMessage::with_error(ERROR_CODE_UNAUTHORIZED, "Token has expired"));
            return replies;
        }
    }

    for cmd in command.cmds {
        if !conn.authenticated {
            replies.push(ServerMessage::with_error(ERROR_CODE_UNAUTHORIZED, "Not authenticated"));
            break;
        }

        match state.settings.plant.device(cmd.entity_id) {
            Some((category, unit)) => {
                debug!("Subscription {} -> {} device {} (unit {:?})", cmd.cmd_id, category, cmd.entity_id, unit);
                conn.subscriptions.push((cmd.cmd_id, category));
                let mut rng = StdRng::from_entropy();
                let frame = generate_frame(&mut rng, category, &state.settings.plant.keys);
                replies.push(ServerMessage::update(cmd.cmd_id, &frame));
            }
            None => {
                warn!("Subscription {} for unknown device {}", cmd.cmd_id, cmd.entity_id);
                let mut reply = ServerMessage::with_error(ERROR_CODE_NOT_FOUND, "Device not found");
                reply.subscription_id = Some(cmd.cmd_id);
                replies.push(reply);
            }
        }
    }

    replies
}

async fn send<S>(sink: &mut S, message: &ServerMessage) -> bool
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    send_all(sink, std::slice::from_ref(message)).await
}

/// Send frames in order, stopping at the first failure. Returns false if any
/// frame could not be sent.
async fn send_all<S>(sink: &mut S, messages: &[ServerMessage]) -> bool
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    for message in messages {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode frame: {}", e);
                return false;
            }
        };
        if let Err(e) = sink.send(Message::Text(text)).await {
            debug!("WebSocket send failed: {}", e);
            return false;
        }
    }
    true
}

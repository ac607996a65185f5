use crate::model::{TelemetryFrame, TelemetryPoint};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

pub const ENTITY_TYPE_DEVICE: &str = "DEVICE";
pub const SCOPE_LATEST_TELEMETRY: &str = "LATEST_TELEMETRY";
pub const CMD_TYPE_TIMESERIES: &str = "TIMESERIES";

/// Error code the platform uses for an expired or rejected token.
pub const ERROR_CODE_UNAUTHORIZED: i64 = 401;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthCmd {
    pub cmd_id: u64,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeCmd {
    pub entity_type: String,
    pub entity_id: Uuid,
    pub scope: String,
    pub cmd_id: u64,
    #[serde(rename = "type")]
    pub kind: String,
}

impl SubscribeCmd {
    pub fn latest_telemetry(cmd_id: u64, device_id: Uuid) -> Self {
        Self {
            entity_type: ENTITY_TYPE_DEVICE.to_string(),
            entity_id: device_id,
            scope: SCOPE_LATEST_TELEMETRY.to_string(),
            cmd_id,
            kind: CMD_TYPE_TIMESERIES.to_string(),
        }
    }
}

/// Client to platform frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_cmd: Option<AuthCmd>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cmds: Vec<SubscribeCmd>,
}

impl ClientMessage {
    pub fn auth(cmd_id: u64, token: impl Into<String>) -> Self {
        Self {
            auth_cmd: Some(AuthCmd {
                cmd_id,
                token: token.into(),
            }),
            cmds: Vec::new(),
        }
    }

    pub fn subscribe(cmd: SubscribeCmd) -> Self {
        Self {
            auth_cmd: None,
            cmds: vec![cmd],
        }
    }
}

/// Platform to client frame. Data frames may also carry `errorCode: 0`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<BTreeMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

impl ServerMessage {
    pub fn update(subscription_id: u64, frame: &TelemetryFrame) -> Self {
        let data = frame
            .keys()
            .map(|key| {
                let points = frame
                    .get(key)
                    .unwrap_or_default()
                    .iter()
                    .map(|p| Value::Array(vec![Value::from(p.ts), Value::from(p.value.clone())]))
                    .collect();
                (key.to_string(), Value::Array(points))
            })
            .collect();

        Self {
            subscription_id: Some(subscription_id),
            data: Some(data),
            error_code: Some(0),
            error_msg: None,
        }
    }

    pub fn with_error(code: i64, msg: impl Into<String>) -> Self {
        Self {
            error_code: Some(code),
            error_msg: Some(msg.into()),
            ..Self::default()
        }
    }

    /// Non-zero error code, if any.
    pub fn error(&self) -> Option<i64> {
        self.error_code.filter(|code| *code != 0)
    }
}

/// Convert raw `{metric: [[ts, value], ...]}` data into a frame.
///
/// Metrics that are not arrays, or have no well-formed points, are skipped.
pub fn to_frame(data: &BTreeMap<String, Value>) -> TelemetryFrame {
    let mut frame = TelemetryFrame::new();
    for (key, values) in data {
        let Some(values) = values.as_array() else {
            continue;
        };
        let points: Vec<TelemetryPoint> = values.iter().filter_map(to_point).collect();
        if !points.is_empty() {
            frame.insert(key.clone(), points);
        }
    }
    frame
}

fn to_point(raw: &Value) -> Option<TelemetryPoint> {
    let pair = raw.as_array()?;
    let ts = to_timestamp(pair.first()?)?;
    let value = match pair.get(1)? {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Some(TelemetryPoint { ts, value })
}

/// Millisecond timestamp; whole-number floats such as `1000.0` are accepted.
fn to_timestamp(raw: &Value) -> Option<i64> {
    if let Some(ts) = raw.as_i64() {
        return Some(ts);
    }
    let ts = raw.as_f64()?;
    let in_range = ts >= i64::MIN as f64 && ts < i64::MAX as f64;
    (ts.fract() == 0.0 && in_range).then_some(ts as i64)
}

//! Real-time factory telemetry client.
//!
//! [`session::TelemetrySession`] keeps an authenticated WebSocket connection to
//! a ThingsBoard-style platform, subscribes every configured unit and routes
//! frames to [`listeners::TelemetryListener`]s by category.

pub mod auth;
pub mod config;
pub mod errors;
pub mod listeners;
pub mod metrics;
pub mod model;
pub mod plant;
pub mod protocol;
pub mod readings;
pub mod rest;
pub mod session;

pub use errors::{Error, Result};
pub use listeners::TelemetryListener;
pub use model::{Category, Subscription, TelemetryFrame, TelemetryPoint};
pub use session::{SessionConfig, SessionState, TelemetrySession};

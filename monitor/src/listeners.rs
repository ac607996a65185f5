use crate::model::{Category, TelemetryFrame};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Consumer of categorized telemetry. All methods default to no-ops so a
/// listener only implements what it cares about.
pub trait TelemetryListener: Send + Sync {
    fn on_vibration_data(&self, _frame: &TelemetryFrame, _unit: Option<u32>) {}

    fn on_power_data(&self, _frame: &TelemetryFrame, _unit: Option<u32>) {}

    fn on_server_data(&self, _frame: &TelemetryFrame) {}

    fn on_connection_change(&self, _connected: bool) {}
}

/// Listeners are held weakly: the session never keeps a consumer alive.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Vec<Weak<dyn TelemetryListener>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, listener: &Arc<dyn TelemetryListener>) {
        self.listeners.push(Arc::downgrade(listener));
    }

    /// Number of listeners still alive.
    pub fn len(&self) -> usize {
        self.listeners.iter().filter(|l| l.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dispatch(&mut self, category: Category, frame: &TelemetryFrame, unit: Option<u32>) {
        self.for_each(|listener| match category {
            Category::Vibration => listener.on_vibration_data(frame, unit),
            Category::Power => listener.on_power_data(frame, unit),
            Category::Server => listener.on_server_data(frame),
        });
    }

    pub fn connection_changed(&mut self, connected: bool) {
        self.for_each(|listener| listener.on_connection_change(connected));
    }

    fn for_each(&mut self, mut f: impl FnMut(&dyn TelemetryListener)) {
        let before = self.listeners.len();
        self.listeners.retain(|weak| match weak.upgrade() {
            Some(listener) => {
                f(listener.as_ref());
                true
            }
            None => false,
        });

        let pruned = before - self.listeners.len();
        if pruned > 0 {
            debug!("Pruned {} dropped listener(s)", pruned);
        }
    }
}

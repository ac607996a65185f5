use crate::listeners::TelemetryListener;
use crate::model::TelemetryFrame;
use crate::plant::{PlantConfig, UnitStatus};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;

/// Latest frames of one unit, as served by the status API.
#[derive(Debug, Clone, Serialize)]
pub struct UnitSnapshot {
    pub unit_id: u32,
    pub status: UnitStatus,
    pub power: Option<TelemetryFrame>,
    pub vibration: Option<TelemetryFrame>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Inner {
    units: BTreeMap<u32, UnitSnapshot>,
    server: Option<TelemetryFrame>,
    connected: bool,
    last_update: Option<DateTime<Utc>>,
}

/// Listener keeping the most recent frame per unit and category.
#[derive(Debug, Default)]
pub struct LatestReadings {
    inner: RwLock<Inner>,
}

impl LatestReadings {
    /// Pre-populate one empty snapshot per configured unit.
    pub fn for_plant(plant: &PlantConfig) -> Self {
        let units = plant
            .units
            .iter()
            .map(|u| {
                (
                    u.id,
                    UnitSnapshot {
                        unit_id: u.id,
                        status: u.status,
                        power: None,
                        vibration: None,
                        updated_at: None,
                    },
                )
            })
            .collect();

        Self {
            inner: RwLock::new(Inner {
                units,
                ..Inner::default()
            }),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        let inner = self.inner.read();
        ConnectionStatus {
            connected: inner.connected,
            last_update: inner.last_update,
        }
    }

    pub fn unit(&self, id: u32) -> Option<UnitSnapshot> {
        self.inner.read().units.get(&id).cloned()
    }

    pub fn units(&self) -> Vec<UnitSnapshot> {
        self.inner.read().units.values().cloned().collect()
    }

    pub fn server(&self) -> Option<TelemetryFrame> {
        self.inner.read().server.clone()
    }

    fn store_unit(&self, unit: Option<u32>, frame: &TelemetryFrame, power: bool) {
        let Some(unit_id) = unit else {
            return;
        };

        let now = Utc::now();
        let mut inner = self.inner.write();
        let snapshot = inner.units.entry(unit_id).or_insert_with(|| UnitSnapshot {
            unit_id,
            status: UnitStatus::default(),
            power: None,
            vibration: None,
            updated_at: None,
        });

        if power {
            snapshot.power = Some(frame.clone());
        } else {
            snapshot.vibration = Some(frame.clone());
        }
        snapshot.updated_at = Some(now);
        inner.last_update = Some(now);
    }
}

impl TelemetryListener for LatestReadings {
    fn on_vibration_data(&self, frame: &TelemetryFrame, unit: Option<u32>) {
        self.store_unit(unit, frame, false);
    }

    fn on_power_data(&self, frame: &TelemetryFrame, unit: Option<u32>) {
        self.store_unit(unit, frame, true);
    }

    fn on_server_data(&self, frame: &TelemetryFrame) {
        let mut inner = self.inner.write();
        inner.server = Some(frame.clone());
        inner.last_update = Some(Utc::now());
    }

    fn on_connection_change(&self, connected: bool) {
        self.inner.write().connected = connected;
    }
}

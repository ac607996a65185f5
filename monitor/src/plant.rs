use crate::errors::{Error, Result};
use crate::model::{Category, TelemetryFrame};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use uuid::Uuid;

const DEFAULT_PLANT: &str = include_str!("../plant.json");

/// Display hint carried from configuration, not derived from telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    #[default]
    Normal,
    Warning,
    Abnormal,
}

/// A monitored motor and the two devices reporting for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalUnit {
    pub id: u32,
    pub power_meter_id: Uuid,
    pub vibration_id: Uuid,
    #[serde(default)]
    pub status: UnitStatus,
}

/// Metric names used to classify frames, which carry no type field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vocabularies {
    pub vibration: BTreeSet<String>,
    pub power_meter: BTreeSet<String>,
    pub server_monitor: BTreeSet<String>,
}

impl Vocabularies {
    /// Every category whose vocabulary shares at least one key with the frame.
    /// Order is vibration, power, server.
    pub fn classify(&self, frame: &TelemetryFrame) -> Vec<Category> {
        let matches = |vocabulary: &BTreeSet<String>| frame.keys().any(|k| vocabulary.contains(k));

        let mut categories = Vec::with_capacity(3);
        if matches(&self.vibration) {
            categories.push(Category::Vibration);
        }
        if matches(&self.power_meter) {
            categories.push(Category::Power);
        }
        if matches(&self.server_monitor) {
            categories.push(Category::Server);
        }
        categories
    }

    pub fn keys_for(&self, category: Category) -> &BTreeSet<String> {
        match category {
            Category::Vibration => &self.vibration,
            Category::Power => &self.power_meter,
            Category::Server => &self.server_monitor,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlantConfig {
    pub units: Vec<LogicalUnit>,
    pub server_monitor_id: Uuid,
    pub keys: Vocabularies,
}

impl PlantConfig {
    /// The plant layout shipped with the binary.
    pub fn builtin() -> Result<Self> {
        Self::from_json(DEFAULT_PLANT)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: PlantConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn unit(&self, id: u32) -> Option<&LogicalUnit> {
        self.units.iter().find(|u| u.id == id)
    }

    /// Resolve which category and unit a device reports for.
    pub fn device(&self, device_id: Uuid) -> Option<(Category, Option<u32>)> {
        if device_id == self.server_monitor_id {
            return Some((Category::Server, None));
        }
        self.units.iter().find_map(|u| {
            if u.power_meter_id == device_id {
                Some((Category::Power, Some(u.id)))
            } else if u.vibration_id == device_id {
                Some((Category::Vibration, Some(u.id)))
            } else {
                None
            }
        })
    }

    fn validate(&self) -> Result<()> {
        if self.units.is_empty() {
            return Err(Error::Config("plant has no units".to_string()));
        }

        let mut seen = HashSet::new();
        for unit in &self.units {
            if !seen.insert(unit.id) {
                return Err(Error::Config(format!("duplicate unit id {}", unit.id)));
            }
        }

        Ok(())
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Telemetry stream keys the interlock checks read.
pub mod streams {
    pub const EMERGENCY_STOP: &str = "emergency_stop";
    pub const DOOR_OPEN: &str = "door_open";
    pub const TANK_LEVEL_PERCENT: &str = "tank_level_percent";
    pub const EC_MS_CM: &str = "ec_ms_cm";
    pub const PH: &str = "ph";
    pub const CO2_LOCKOUT: &str = "co2_lockout";
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReading {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl TelemetryReading {
    pub fn new(value: f64, timestamp: DateTime<Utc>) -> Self {
        Self { value, timestamp }
    }

    /// Binary sensors report 1.0 when asserted.
    pub fn is_asserted(&self) -> bool {
        self.value >= 1.0
    }
}

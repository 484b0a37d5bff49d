pub mod co2_lockout;
pub mod door;
pub mod emergency_stop;
pub mod gate;
pub mod tank_level;
pub mod telemetry_freshness;
pub mod water_quality;

pub use gate::InterlockGate;

use crate::config::InterlockThresholds;
use crate::error::Result;
use crate::models::{InterlockType, InterlockVerdict};
use crate::repository::TelemetryQueryService;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// One safety precondition evaluated against live telemetry.
#[async_trait]
pub trait InterlockCheck: Send + Sync {
    fn interlock_type(&self) -> InterlockType;

    /// An `Err` means the sensor state is unknown; the gate treats that as a block.
    async fn evaluate(
        &self,
        site_id: &str,
        telemetry: &dyn TelemetryQueryService,
        now: DateTime<Utc>,
    ) -> Result<InterlockVerdict>;
}

/// The standard checks in pre-run order. The first block wins.
pub fn default_checks(thresholds: &InterlockThresholds) -> Vec<Box<dyn InterlockCheck>> {
    vec![
        Box::new(emergency_stop::EmergencyStopCheck),
        Box::new(door::DoorCheck),
        Box::new(tank_level::TankLevelCheck::new(
            thresholds.tank_level_min_percent,
            thresholds.tank_level_warn_percent,
        )),
        Box::new(water_quality::EcCheck::new(thresholds.ec_min, thresholds.ec_max)),
        Box::new(water_quality::PhCheck::new(thresholds.ph_min, thresholds.ph_max)),
        Box::new(co2_lockout::Co2LockoutCheck),
        Box::new(telemetry_freshness::TelemetryFreshnessCheck::new(
            chrono::Duration::minutes(thresholds.telemetry_max_age_minutes),
        )),
    ]
}

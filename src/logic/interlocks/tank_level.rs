use super::InterlockCheck;
use crate::error::Result;
use crate::models::{streams, InterlockType, InterlockVerdict};
use crate::repository::TelemetryQueryService;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Nutrient tank level check
///
/// - Below `min_percent`: blocked, pumps would run dry
/// - Below `warn_percent`: allowed with a refill warning
/// - No reading: allowed with a warning that the sensor is silent
pub struct TankLevelCheck {
    min_percent: f64,
    warn_percent: f64,
}

impl TankLevelCheck {
    pub fn new(min_percent: f64, warn_percent: f64) -> Self {
        Self {
            min_percent,
            warn_percent,
        }
    }
}

#[async_trait]
impl InterlockCheck for TankLevelCheck {
    fn interlock_type(&self) -> InterlockType {
        InterlockType::TankLevelLow
    }

    async fn evaluate(
        &self,
        site_id: &str,
        telemetry: &dyn TelemetryQueryService,
        _now: DateTime<Utc>,
    ) -> Result<InterlockVerdict> {
        let Some(reading) = telemetry
            .get_latest_value(site_id, streams::TANK_LEVEL_PERCENT)
            .await?
        else {
            return Ok(InterlockVerdict::warning(
                "Tank level sensor not reporting",
            ));
        };

        let level = reading.value;
        let verdict = if level < self.min_percent {
            InterlockVerdict::blocked(
                self.interlock_type(),
                format!(
                    "Tank level ({:.1}%) is below minimum ({}%)",
                    level, self.min_percent
                ),
            )
        } else if level < self.warn_percent {
            InterlockVerdict::warning(format!(
                "Tank level ({:.1}%) is low (below {}%) - refill soon",
                level, self.warn_percent
            ))
        } else {
            InterlockVerdict::Allowed
        };
        Ok(verdict)
    }
}

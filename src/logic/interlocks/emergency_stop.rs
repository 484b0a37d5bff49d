use super::InterlockCheck;
use crate::error::Result;
use crate::models::{streams, InterlockType, InterlockVerdict};
use crate::repository::TelemetryQueryService;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Blocks while the site emergency stop is latched (sensor reads 1.0).
/// A site without an e-stop sensor is not blocked by this check.
pub struct EmergencyStopCheck;

#[async_trait]
impl InterlockCheck for EmergencyStopCheck {
    fn interlock_type(&self) -> InterlockType {
        InterlockType::EmergencyStop
    }

    async fn evaluate(
        &self,
        site_id: &str,
        telemetry: &dyn TelemetryQueryService,
        _now: DateTime<Utc>,
    ) -> Result<InterlockVerdict> {
        let reading = telemetry
            .get_latest_value(site_id, streams::EMERGENCY_STOP)
            .await?;

        Ok(match reading {
            Some(r) if r.is_asserted() => {
                InterlockVerdict::blocked(self.interlock_type(), "Emergency stop is active")
            }
            _ => InterlockVerdict::Allowed,
        })
    }
}

use super::InterlockCheck;
use crate::error::Result;
use crate::models::{streams, InterlockType, InterlockVerdict};
use crate::repository::TelemetryQueryService;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Blocks while the room door sensor reports open.
pub struct DoorCheck;

#[async_trait]
impl InterlockCheck for DoorCheck {
    fn interlock_type(&self) -> InterlockType {
        InterlockType::DoorOpen
    }

    async fn evaluate(
        &self,
        site_id: &str,
        telemetry: &dyn TelemetryQueryService,
        _now: DateTime<Utc>,
    ) -> Result<InterlockVerdict> {
        let reading = telemetry.get_latest_value(site_id, streams::DOOR_OPEN).await?;

        Ok(match reading {
            Some(r) if r.is_asserted() => InterlockVerdict::blocked(
                self.interlock_type(),
                "Door is open - close the door before irrigating",
            ),
            _ => InterlockVerdict::Allowed,
        })
    }
}

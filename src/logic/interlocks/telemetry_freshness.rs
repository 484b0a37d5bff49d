use super::InterlockCheck;
use crate::error::Result;
use crate::models::{InterlockType, InterlockVerdict};
use crate::repository::TelemetryQueryService;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

/// Every other check is only as good as the data behind it. Blocks when the
/// site has never reported or its last reading is older than `max_age`.
pub struct TelemetryFreshnessCheck {
    max_age: Duration,
}

impl TelemetryFreshnessCheck {
    pub fn new(max_age: Duration) -> Self {
        Self { max_age }
    }
}

#[async_trait]
impl InterlockCheck for TelemetryFreshnessCheck {
    fn interlock_type(&self) -> InterlockType {
        InterlockType::TelemetryStale
    }

    async fn evaluate(
        &self,
        site_id: &str,
        telemetry: &dyn TelemetryQueryService,
        now: DateTime<Utc>,
    ) -> Result<InterlockVerdict> {
        let Some(last) = telemetry.get_last_reading_time(site_id).await? else {
            return Ok(InterlockVerdict::blocked(
                self.interlock_type(),
                "No telemetry readings received for site",
            ));
        };

        let age = now - last;
        if age > self.max_age {
            return Ok(InterlockVerdict::blocked(
                self.interlock_type(),
                format!(
                    "Telemetry is stale: last reading {} minutes ago (limit {} minutes)",
                    age.num_minutes(),
                    self.max_age.num_minutes()
                ),
            ));
        }
        Ok(InterlockVerdict::Allowed)
    }
}

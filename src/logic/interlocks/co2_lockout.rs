use super::InterlockCheck;
use crate::error::Result;
use crate::models::{streams, InterlockType, InterlockVerdict};
use crate::repository::TelemetryQueryService;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Irrigation would disturb a CO2-enriched room, so an active enrichment
/// lockout blocks runs.
pub struct Co2LockoutCheck;

#[async_trait]
impl InterlockCheck for Co2LockoutCheck {
    fn interlock_type(&self) -> InterlockType {
        InterlockType::Co2Lockout
    }

    async fn evaluate(
        &self,
        site_id: &str,
        telemetry: &dyn TelemetryQueryService,
        _now: DateTime<Utc>,
    ) -> Result<InterlockVerdict> {
        let reading = telemetry
            .get_latest_value(site_id, streams::CO2_LOCKOUT)
            .await?;

        Ok(match reading {
            Some(r) if r.is_asserted() => InterlockVerdict::blocked(
                self.interlock_type(),
                "CO2 enrichment lockout is active",
            ),
            _ => InterlockVerdict::Allowed,
        })
    }
}

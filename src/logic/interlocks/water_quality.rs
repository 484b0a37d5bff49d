use super::InterlockCheck;
use crate::error::Result;
use crate::models::{streams, InterlockType, InterlockVerdict};
use crate::repository::TelemetryQueryService;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Blocks when solution EC leaves `[min, max]` mS/cm.
pub struct EcCheck {
    min: f64,
    max: f64,
}

impl EcCheck {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }
}

#[async_trait]
impl InterlockCheck for EcCheck {
    fn interlock_type(&self) -> InterlockType {
        InterlockType::EcOutOfBounds
    }

    async fn evaluate(
        &self,
        site_id: &str,
        telemetry: &dyn TelemetryQueryService,
        _now: DateTime<Utc>,
    ) -> Result<InterlockVerdict> {
        let Some(reading) = telemetry.get_latest_value(site_id, streams::EC_MS_CM).await? else {
            return Ok(InterlockVerdict::warning("EC sensor not reporting"));
        };

        let ec = reading.value;
        if ec < self.min || ec > self.max {
            return Ok(InterlockVerdict::blocked(
                self.interlock_type(),
                format!(
                    "EC ({:.2} mS/cm) is out of bounds ({:.1}-{:.1} mS/cm)",
                    ec, self.min, self.max
                ),
            ));
        }
        Ok(InterlockVerdict::Allowed)
    }
}

/// Blocks when solution pH leaves `[min, max]`.
pub struct PhCheck {
    min: f64,
    max: f64,
}

impl PhCheck {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }
}

#[async_trait]
impl InterlockCheck for PhCheck {
    fn interlock_type(&self) -> InterlockType {
        InterlockType::PhOutOfBounds
    }

    async fn evaluate(
        &self,
        site_id: &str,
        telemetry: &dyn TelemetryQueryService,
        _now: DateTime<Utc>,
    ) -> Result<InterlockVerdict> {
        let Some(reading) = telemetry.get_latest_value(site_id, streams::PH).await? else {
            return Ok(InterlockVerdict::warning("pH sensor not reporting"));
        };

        let ph = reading.value;
        if ph < self.min || ph > self.max {
            return Ok(InterlockVerdict::blocked(
                self.interlock_type(),
                format!(
                    "pH ({:.2}) is out of bounds ({:.1}-{:.1})",
                    ph, self.min, self.max
                ),
            ));
        }
        Ok(InterlockVerdict::Allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ScriptedTelemetry;

    #[tokio::test]
    async fn high_ec_blocks_with_measured_value() {
        let telemetry = ScriptedTelemetry::new();
        telemetry.set("s1", streams::EC_MS_CM, 4.0, Utc::now()).unwrap();

        let verdict = EcCheck::new(0.5, 3.5)
            .evaluate("s1", &telemetry, Utc::now())
            .await
            .unwrap();
        match verdict {
            InterlockVerdict::Blocked {
                interlock_type,
                reason,
            } => {
                assert_eq!(interlock_type, InterlockType::EcOutOfBounds);
                assert!(reason.contains("4.00"));
                assert!(reason.contains("0.5-3.5"));
            }
            other => panic!("expected block, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn in_range_water_quality_passes() {
        let telemetry = ScriptedTelemetry::new();
        telemetry.set("s1", streams::EC_MS_CM, 2.0, Utc::now()).unwrap();
        telemetry.set("s1", streams::PH, 6.0, Utc::now()).unwrap();

        let ec = EcCheck::new(0.5, 3.5)
            .evaluate("s1", &telemetry, Utc::now())
            .await
            .unwrap();
        let ph = PhCheck::new(5.0, 7.0)
            .evaluate("s1", &telemetry, Utc::now())
            .await
            .unwrap();
        assert_eq!(ec, InterlockVerdict::Allowed);
        assert_eq!(ph, InterlockVerdict::Allowed);
    }

    #[tokio::test]
    async fn low_ph_blocks() {
        let telemetry = ScriptedTelemetry::new();
        telemetry.set("s1", streams::PH, 4.2, Utc::now()).unwrap();

        let verdict = PhCheck::new(5.0, 7.0)
            .evaluate("s1", &telemetry, Utc::now())
            .await
            .unwrap();
        assert!(verdict.is_blocked());
    }
}

use crate::error::{FlowGateError, Result};
use crate::models::InterlockType;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueStatus {
    Pending,
    Executed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "Pending",
            QueueStatus::Executed => "Executed",
            QueueStatus::Failed => "Failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(QueueStatus::Pending),
            "executed" => Some(QueueStatus::Executed),
            "failed" => Some(QueueStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, QueueStatus::Pending)
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A candidate irrigation run as handed in by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub site_id: String,
    pub program_id: String,
    pub schedule_id: Option<String>,
    pub zone_ids: Vec<String>,
    pub scheduled_time: DateTime<Utc>,
    /// Expected run length, used to give the active run a known end time.
    pub duration_minutes: Option<i64>,
}

impl RunRequest {
    pub fn new(
        site_id: impl Into<String>,
        program_id: impl Into<String>,
        zone_ids: Vec<String>,
        scheduled_time: DateTime<Utc>,
    ) -> Self {
        Self {
            site_id: site_id.into(),
            program_id: program_id.into(),
            schedule_id: None,
            zone_ids,
            scheduled_time,
            duration_minutes: None,
        }
    }

    pub fn with_schedule(mut self, schedule_id: impl Into<String>) -> Self {
        self.schedule_id = Some(schedule_id.into());
        self
    }

    pub fn with_duration_minutes(mut self, minutes: i64) -> Self {
        self.duration_minutes = Some(minutes);
        self
    }
}

/// A run deferred for lack of flow capacity.
///
/// Fields are only changed through the transition methods so that the
/// `Pending -> Executed | Failed` step happens at most once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedIrrigationEvent {
    pub event_id: Uuid,
    pub site_id: String,
    pub program_id: String,
    pub schedule_id: Option<String>,
    pub target_zone_ids: Vec<String>,
    pub original_scheduled_time: DateTime<Utc>,
    pub expected_execution_time: DateTime<Utc>,
    pub queue_reason: String,
    pub status: QueueStatus,
    pub duration_minutes: Option<i64>,
    pub run_id: Option<String>,
    pub error_message: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
}

impl QueuedIrrigationEvent {
    pub fn new(
        request: &RunRequest,
        expected_execution_time: DateTime<Utc>,
        queue_reason: impl Into<String>,
        queued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            site_id: request.site_id.clone(),
            program_id: request.program_id.clone(),
            schedule_id: request.schedule_id.clone(),
            target_zone_ids: request.zone_ids.clone(),
            original_scheduled_time: request.scheduled_time,
            expected_execution_time,
            queue_reason: queue_reason.into(),
            status: QueueStatus::Pending,
            duration_minutes: request.duration_minutes,
            run_id: None,
            error_message: None,
            queued_at,
            executed_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == QueueStatus::Pending
    }

    pub fn mark_executed(mut self, run_id: impl Into<String>, at: DateTime<Utc>) -> Result<Self> {
        self.ensure_pending("mark executed")?;
        self.status = QueueStatus::Executed;
        self.run_id = Some(run_id.into());
        self.executed_at = Some(at);
        Ok(self)
    }

    pub fn mark_failed(mut self, message: impl Into<String>, at: DateTime<Utc>) -> Result<Self> {
        self.ensure_pending("mark failed")?;
        self.status = QueueStatus::Failed;
        self.error_message = Some(message.into());
        self.executed_at = Some(at);
        Ok(self)
    }

    pub fn update_expected_time(mut self, expected: DateTime<Utc>) -> Result<Self> {
        self.ensure_pending("update expected time")?;
        self.expected_execution_time = expected;
        Ok(self)
    }

    /// Delay relative to the original schedule: actual when run, expected otherwise.
    pub fn delay(&self) -> Duration {
        let effective = self.executed_at.unwrap_or(self.expected_execution_time);
        (effective - self.original_scheduled_time).max(Duration::zero())
    }

    fn ensure_pending(&self, action: &str) -> Result<()> {
        if self.is_pending() {
            Ok(())
        } else {
            Err(FlowGateError::InvalidTransition(format!(
                "cannot {} queued event {} in status {}",
                action, self.event_id, self.status
            )))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AdmissionDecision {
    ExecuteImmediately {
        warnings: Vec<String>,
    },
    Queue {
        expected_execution_time: DateTime<Utc>,
        delay_minutes: i64,
        queue_position: usize,
        reason: String,
        excess: Option<f64>,
    },
    Blocked {
        interlock_type: InterlockType,
        reason: String,
    },
    /// The request alone exceeds the site's committable flow.
    Rejected {
        reason: String,
    },
}

impl AdmissionDecision {
    pub fn execute_immediately(&self) -> bool {
        matches!(self, AdmissionDecision::ExecuteImmediately { .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            AdmissionDecision::ExecuteImmediately { .. } => None,
            AdmissionDecision::Queue { reason, .. }
            | AdmissionDecision::Blocked { reason, .. }
            | AdmissionDecision::Rejected { reason } => Some(reason),
        }
    }
}

/// Result of a submit call once the decision has been committed.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Started {
        run_id: String,
        warnings: Vec<String>,
    },
    Queued(QueuedIrrigationEvent),
    Blocked {
        interlock_type: InterlockType,
        reason: String,
    },
    Rejected {
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourCount {
    pub hour: u32,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStatistics {
    pub total_queued: usize,
    pub executed: usize,
    pub failed: usize,
    pub pending: usize,
    pub average_delay_minutes: f64,
    pub max_delay_minutes: f64,
    /// Busiest hours of day (UTC), most congested first.
    pub peak_queue_hours: Vec<HourCount>,
    /// Queued event count per hour of day (UTC).
    pub hourly_counts: BTreeMap<u32, usize>,
}

impl QueueStatistics {
    pub fn count_at_hour(&self, hour: u32) -> usize {
        self.hourly_counts.get(&hour).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_event() -> QueuedIrrigationEvent {
        let scheduled = Utc.with_ymd_and_hms(2024, 6, 1, 6, 0, 0).unwrap();
        let request = RunRequest::new("site-1", "prog-1", vec!["z1".into()], scheduled);
        QueuedIrrigationEvent::new(
            &request,
            scheduled + Duration::minutes(10),
            "capacity",
            scheduled,
        )
    }

    #[test]
    fn pending_event_can_be_rescheduled() {
        let event = sample_event();
        let new_time = event.expected_execution_time + Duration::minutes(5);
        let event = event.update_expected_time(new_time).unwrap();
        assert_eq!(event.expected_execution_time, new_time);
        assert!(event.is_pending());
    }

    #[test]
    fn terminal_transition_happens_once() {
        let event = sample_event();
        let at = event.expected_execution_time;
        let executed = event.mark_executed("run-9", at).unwrap();
        assert_eq!(executed.status, QueueStatus::Executed);
        assert_eq!(executed.run_id.as_deref(), Some("run-9"));

        assert!(executed.clone().mark_executed("run-10", at).is_err());
        assert!(executed.clone().mark_failed("boom", at).is_err());
        assert!(matches!(
            executed.update_expected_time(at),
            Err(FlowGateError::InvalidTransition(_))
        ));
    }

    #[test]
    fn failed_event_keeps_message() {
        let event = sample_event();
        let at = event.expected_execution_time;
        let failed = event.mark_failed("valve controller offline", at).unwrap();
        assert_eq!(failed.status, QueueStatus::Failed);
        assert_eq!(
            failed.error_message.as_deref(),
            Some("valve controller offline")
        );
    }

    #[test]
    fn delay_prefers_actual_execution_time() {
        let event = sample_event();
        assert_eq!(event.delay(), Duration::minutes(10));
        let at = event.original_scheduled_time + Duration::minutes(25);
        let executed = event.mark_executed("run-1", at).unwrap();
        assert_eq!(executed.delay(), Duration::minutes(25));
    }

    #[test]
    fn queue_status_from_str() {
        assert_eq!(QueueStatus::from_str("Pending"), Some(QueueStatus::Pending));
        assert_eq!(QueueStatus::from_str("failed"), Some(QueueStatus::Failed));
        assert_eq!(QueueStatus::from_str("done"), None);
        assert!(QueueStatus::Executed.is_terminal());
        assert!(!QueueStatus::Pending.is_terminal());
    }
}

use super::{default_checks, InterlockCheck};
use crate::config::InterlockThresholds;
use crate::error::Result;
use crate::models::{InterlockEvent, InterlockType, InterlockVerdict};
use crate::repository::{Collaborators, InterlockEventRepository, TelemetryQueryService};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Identity recorded when an interlock clears itself.
pub const SYSTEM_CLEARER: &str = "system";

/// Runs the interlock checks in their fixed order and keeps the trip/clear
/// audit trail.
///
/// Per type: `Clear -> Tripped -> Clear` when the condition resolves, or
/// `Clear -> Tripped -> AwaitingAcknowledgment -> Clear` for types that need
/// an operator. Anything unknown blocks.
pub struct InterlockGate {
    checks: Vec<Box<dyn InterlockCheck>>,
    telemetry: Arc<dyn TelemetryQueryService>,
    events: Arc<dyn InterlockEventRepository>,
}

impl InterlockGate {
    pub fn new(collaborators: &Collaborators, thresholds: &InterlockThresholds) -> Self {
        Self::with_checks(collaborators, default_checks(thresholds))
    }

    pub fn with_checks(collaborators: &Collaborators, checks: Vec<Box<dyn InterlockCheck>>) -> Self {
        Self {
            checks,
            telemetry: Arc::clone(&collaborators.telemetry),
            events: Arc::clone(&collaborators.interlock_events),
        }
    }

    /// Current verdict for a single interlock type. Read-only.
    pub async fn check_interlock(&self, site_id: &str, interlock_type: InterlockType) -> InterlockVerdict {
        let active = match self.events.list_active(site_id).await {
            Ok(active) => active,
            Err(e) => return unknown_state(site_id, &e.to_string()),
        };

        if let Some(event) = active
            .iter()
            .find(|e| e.interlock_type == interlock_type && e.awaiting_acknowledgment())
        {
            return awaiting_ack(event);
        }

        match self.checks.iter().find(|c| c.interlock_type() == interlock_type) {
            Some(check) => self.run_check(check.as_ref(), site_id, Utc::now()).await,
            None => match active.iter().find(|e| e.interlock_type == interlock_type) {
                Some(event) => InterlockVerdict::blocked(interlock_type, event.details.clone()),
                None => InterlockVerdict::Allowed,
            },
        }
    }

    /// Full pre-run evaluation. The first block wins; warnings from the checks
    /// that passed before it are returned with a final allow.
    ///
    /// A block trips (and persists) an interlock unless one of that type is
    /// already active. A passing check clears any active self-clearing trip of
    /// its type.
    pub async fn evaluate_pre_run(&self, site_id: &str, group_id: Option<&str>) -> InterlockVerdict {
        self.pre_run(site_id, group_id, true).await
    }

    /// Same verdict as [`evaluate_pre_run`](Self::evaluate_pre_run), but trips
    /// are neither recorded nor self-cleared.
    pub async fn preview_pre_run(&self, site_id: &str) -> InterlockVerdict {
        self.pre_run(site_id, None, false).await
    }

    async fn pre_run(&self, site_id: &str, group_id: Option<&str>, record: bool) -> InterlockVerdict {
        let now = Utc::now();
        let active = match self.events.list_active(site_id).await {
            Ok(active) => active,
            Err(e) => return unknown_state(site_id, &e.to_string()),
        };

        let mut warnings = Vec::new();
        for check in &self.checks {
            let interlock_type = check.interlock_type();

            if let Some(event) = active
                .iter()
                .find(|e| e.interlock_type == interlock_type && e.awaiting_acknowledgment())
            {
                return awaiting_ack(event);
            }

            // Unknown sensor state blocks, but is not recorded as a trip
            let verdict = match check.evaluate(site_id, self.telemetry.as_ref(), now).await {
                Ok(verdict) => verdict,
                Err(e) => return check_failed(site_id, interlock_type, &e.to_string()),
            };
            match verdict {
                InterlockVerdict::Blocked { ref reason, .. } => {
                    if record && !active.iter().any(|e| e.interlock_type == interlock_type) {
                        if let Err(e) = self
                            .record_trip(site_id, interlock_type, reason, None, group_id)
                            .await
                        {
                            error!(site_id, %interlock_type, error = %e, "Failed to persist interlock trip");
                        }
                    }
                    return verdict;
                }
                InterlockVerdict::AllowedWithWarnings(w) => {
                    warnings.extend(w);
                    if record {
                        self.self_clear(site_id, interlock_type, &active, now).await;
                    }
                }
                InterlockVerdict::Allowed => {
                    if record {
                        self.self_clear(site_id, interlock_type, &active, now).await;
                    }
                }
            }
        }

        // Types tripped only from outside (e.g. flow anomaly) have no check to run
        if let Some(event) = active.iter().find(|e| {
            e.awaiting_acknowledgment()
                && !self.checks.iter().any(|c| c.interlock_type() == e.interlock_type)
        }) {
            return awaiting_ack(event);
        }

        if warnings.is_empty() {
            InterlockVerdict::Allowed
        } else {
            InterlockVerdict::AllowedWithWarnings(warnings)
        }
    }

    pub async fn record_trip(
        &self,
        site_id: &str,
        interlock_type: InterlockType,
        details: &str,
        run_id: Option<&str>,
        group_id: Option<&str>,
    ) -> Result<InterlockEvent> {
        let event = InterlockEvent::trip(site_id, interlock_type, details, Utc::now())
            .with_run(run_id.map(str::to_string))
            .with_group(group_id.map(str::to_string));
        self.events.create(&event).await?;

        warn!(
            site_id,
            %interlock_type,
            event_id = %event.event_id,
            requires_ack = event.requires_acknowledgment,
            "Interlock tripped: {}",
            details
        );
        Ok(event)
    }

    /// Clears an active interlock. Returns false when the event is unknown,
    /// already cleared, or needs an acknowledging user that was not given.
    pub async fn clear(&self, event_id: Uuid, user_id: Option<&str>, notes: Option<&str>) -> Result<bool> {
        let Some(event) = self.events.get(event_id).await? else {
            warn!(%event_id, "Clear requested for unknown interlock event");
            return Ok(false);
        };

        if !event.is_active {
            return Ok(false);
        }

        let user = user_id.map(str::trim).filter(|u| !u.is_empty());
        if event.requires_acknowledgment && user.is_none() {
            warn!(
                %event_id,
                interlock_type = %event.interlock_type,
                "Interlock requires an acknowledging user to clear"
            );
            return Ok(false);
        }

        let cleared_by = user.unwrap_or(SYSTEM_CLEARER);
        let cleared = event.clear(cleared_by, notes.map(str::to_string), Utc::now());
        self.events.update(&cleared).await?;

        info!(
            %event_id,
            site_id = %cleared.site_id,
            interlock_type = %cleared.interlock_type,
            cleared_by,
            "Interlock cleared"
        );
        Ok(true)
    }

    pub async fn active_interlocks(&self, site_id: &str) -> Result<Vec<InterlockEvent>> {
        let mut active = self.events.list_active(site_id).await?;
        active.sort_by_key(|e| e.trip_timestamp);
        Ok(active)
    }

    async fn run_check(&self, check: &dyn InterlockCheck, site_id: &str, now: DateTime<Utc>) -> InterlockVerdict {
        match check.evaluate(site_id, self.telemetry.as_ref(), now).await {
            Ok(verdict) => verdict,
            Err(e) => check_failed(site_id, check.interlock_type(), &e.to_string()),
        }
    }

    async fn self_clear(
        &self,
        site_id: &str,
        interlock_type: InterlockType,
        active: &[InterlockEvent],
        now: DateTime<Utc>,
    ) {
        for event in active
            .iter()
            .filter(|e| e.interlock_type == interlock_type && !e.requires_acknowledgment)
        {
            let cleared = event.clone().clear(SYSTEM_CLEARER, None, now);
            match self.events.update(&cleared).await {
                Ok(()) => info!(site_id, %interlock_type, event_id = %event.event_id, "Interlock self-cleared"),
                Err(e) => error!(site_id, %interlock_type, error = %e, "Failed to persist interlock clear"),
            }
        }
    }
}

fn awaiting_ack(event: &InterlockEvent) -> InterlockVerdict {
    InterlockVerdict::blocked(
        event.interlock_type,
        format!(
            "{} tripped at {} is awaiting acknowledgment: {}",
            event.interlock_type,
            event.trip_timestamp.format("%Y-%m-%d %H:%M UTC"),
            event.details
        ),
    )
}

fn check_failed(site_id: &str, interlock_type: InterlockType, error: &str) -> InterlockVerdict {
    warn!(site_id, %interlock_type, error, "Interlock check failed, blocking");
    InterlockVerdict::blocked(
        interlock_type,
        format!("{} check unavailable: {}", interlock_type, error),
    )
}

fn unknown_state(site_id: &str, error: &str) -> InterlockVerdict {
    warn!(site_id, error, "Interlock state unavailable, blocking");
    InterlockVerdict::blocked(
        InterlockType::TelemetryStale,
        format!("Interlock state unavailable: {}", error),
    )
}

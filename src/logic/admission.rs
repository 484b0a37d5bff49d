use crate::error::Result;
use crate::logic::flow_ledger::FLOW_EPSILON;
use crate::logic::{FlowLedger, InterlockGate};
use crate::models::{
    ActiveRun, AdmissionDecision, FlowCheck, HourCount, InterlockVerdict, QueueStatistics,
    QueueStatus, QueuedIrrigationEvent, RunRequest, SubmitOutcome,
};
use crate::repository::{
    ActiveRunRepository, Collaborators, IrrigationOrchestrator, IrrigationSettingsRepository,
    QueuedEventRepository,
};
use chrono::{DateTime, Duration, Timelike, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Identity passed to the orchestrator for runs started out of the queue.
pub const QUEUE_TRIGGER: &str = "flow-queue";
/// Identity passed to the orchestrator for runs admitted on arrival.
pub const SCHEDULER_TRIGGER: &str = "scheduler";

const PEAK_HOURS_REPORTED: usize = 5;
const RECORD_ATTEMPTS: u32 = 3;
const RECORD_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(50);

/// One async mutex per site. Cross-site calls never share a lock.
#[derive(Default)]
struct SiteLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SiteLocks {
    fn for_site(&self, site_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        // The map only ever gains entries, so a poisoned guard is still consistent
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(locks.entry(site_id.to_string()).or_default())
    }
}

/// Decides start / defer / block for run requests and drains the deferred
/// queue as capacity frees.
///
/// All reads and writes of a site's active-run set happen under that site's
/// lock, so two requests can never both claim the same headroom.
pub struct AdmissionQueue {
    ledger: Arc<FlowLedger>,
    gate: Arc<InterlockGate>,
    settings: Arc<dyn IrrigationSettingsRepository>,
    active_runs: Arc<dyn ActiveRunRepository>,
    queued_events: Arc<dyn QueuedEventRepository>,
    orchestrator: Arc<dyn IrrigationOrchestrator>,
    site_locks: SiteLocks,
    collision_spacing: Duration,
    /// Executed events the store has not accepted yet, by event id.
    unsaved: std::sync::Mutex<HashMap<Uuid, QueuedIrrigationEvent>>,
}

impl AdmissionQueue {
    pub fn new(
        collaborators: &Collaborators,
        ledger: Arc<FlowLedger>,
        gate: Arc<InterlockGate>,
        collision_spacing: Duration,
    ) -> Self {
        Self {
            ledger,
            gate,
            settings: Arc::clone(&collaborators.settings),
            active_runs: Arc::clone(&collaborators.active_runs),
            queued_events: Arc::clone(&collaborators.queued_events),
            orchestrator: Arc::clone(&collaborators.orchestrator),
            site_locks: SiteLocks::default(),
            collision_spacing,
            unsaved: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Admission decision without committing anything. Interlock trips are
    /// not recorded either.
    pub async fn evaluate(&self, request: &RunRequest) -> AdmissionDecision {
        let lock = self.site_locks.for_site(&request.site_id);
        let _guard = lock.lock().await;
        self.decide(request, Utc::now(), false).await
    }

    /// Decides and commits in one critical section: starts the run and records
    /// it as active, or persists it as a queued event.
    pub async fn submit(&self, request: &RunRequest) -> Result<SubmitOutcome> {
        let lock = self.site_locks.for_site(&request.site_id);
        let _guard = lock.lock().await;
        let now = Utc::now();
        self.flush_unrecorded(&request.site_id).await;

        match self.decide(request, now, true).await {
            AdmissionDecision::ExecuteImmediately { warnings } => {
                let run_id = self
                    .start_and_record(
                        &request.site_id,
                        &request.program_id,
                        request.schedule_id.as_deref(),
                        &request.zone_ids,
                        request.duration_minutes,
                        SCHEDULER_TRIGGER,
                        now,
                    )
                    .await?;
                Ok(SubmitOutcome::Started { run_id, warnings })
            }
            AdmissionDecision::Queue {
                expected_execution_time,
                reason,
                ..
            } => {
                let event = self.enqueue(request, expected_execution_time, &reason).await?;
                Ok(SubmitOutcome::Queued(event))
            }
            AdmissionDecision::Blocked {
                interlock_type,
                reason,
            } => Ok(SubmitOutcome::Blocked {
                interlock_type,
                reason,
            }),
            AdmissionDecision::Rejected { reason } => Ok(SubmitOutcome::Rejected { reason }),
        }
    }

    /// Persists a deferred run.
    pub async fn enqueue(
        &self,
        request: &RunRequest,
        expected_execution_time: DateTime<Utc>,
        reason: &str,
    ) -> Result<QueuedIrrigationEvent> {
        let event = QueuedIrrigationEvent::new(request, expected_execution_time, reason, Utc::now());
        self.queued_events.create(&event).await?;

        info!(
            site_id = %event.site_id,
            program_id = %event.program_id,
            event_id = %event.event_id,
            delay_minutes = event.delay().num_minutes(),
            expected = %event.expected_execution_time,
            "Irrigation run queued: {}",
            reason
        );
        Ok(event)
    }

    /// An externally started run joins the site's committed flow.
    pub async fn record_run_started(&self, run: &ActiveRun) -> Result<()> {
        let lock = self.site_locks.for_site(&run.site_id);
        let _guard = lock.lock().await;
        self.active_runs.insert(run).await?;
        debug!(site_id = %run.site_id, run_id = %run.run_id, "Active run recorded");
        Ok(())
    }

    /// Releases a finished or cancelled run's flow. False if it was not active.
    pub async fn record_run_ended(&self, site_id: &str, run_id: &str) -> Result<bool> {
        let lock = self.site_locks.for_site(site_id);
        let _guard = lock.lock().await;
        if self.ledger.release_unrecorded(site_id, run_id) {
            info!(site_id, run_id, "Held run ended before it could be recorded");
            return Ok(true);
        }
        let removed = self.active_runs.remove(site_id, run_id).await?;
        if removed {
            debug!(site_id, run_id, "Active run released");
        } else {
            warn!(site_id, run_id, "End reported for a run that was not active");
        }
        Ok(removed)
    }

    /// Pending events, leaving out any already started whose status is not
    /// saved yet.
    pub async fn pending_events(&self, site_id: &str) -> Result<Vec<QueuedIrrigationEvent>> {
        let unsaved = self.unsaved_ids(site_id);
        let mut pending = self.queued_events.list_pending(site_id).await?;
        pending.retain(|e| !unsaved.contains(&e.event_id));
        Ok(pending)
    }

    /// One reconciliation pass over a site's queue, earliest expected first.
    /// Returns how many events were started.
    ///
    /// A failing orchestrator call marks that event `Failed` and the pass moves
    /// on. Events that still do not fit only get a fresh expected time. If a
    /// started event cannot be saved as `Executed` the pass stops with that
    /// error and the event is kept out of the queue until the save succeeds.
    pub async fn reconcile(&self, site_id: &str) -> Result<usize> {
        let lock = self.site_locks.for_site(site_id);
        let _guard = lock.lock().await;
        let now = Utc::now();

        self.flush_unrecorded(site_id).await;
        self.flush_unsaved(site_id).await;

        let pending = self.pending_events(site_id).await?;
        if pending.is_empty() {
            return Ok(0);
        }

        if let InterlockVerdict::Blocked { reason, .. } = self.gate.evaluate_pre_run(site_id, None).await {
            info!(site_id, pending = pending.len(), "Queue held by interlock: {}", reason);
            return Ok(0);
        }

        let mut admitted = 0;
        let mut still_waiting: Vec<DateTime<Utc>> = Vec::new();

        for event in pending {
            let check = self.ledger.check(site_id, &event.target_zone_ids, now).await;

            if check.allowed {
                let started = self
                    .start_and_record(
                        site_id,
                        &event.program_id,
                        event.schedule_id.as_deref(),
                        &event.target_zone_ids,
                        event.duration_minutes,
                        QUEUE_TRIGGER,
                        now,
                    )
                    .await;
                let event_id = event.event_id;
                match started {
                    Ok(run_id) => {
                        info!(site_id, %event_id, %run_id, "Queued irrigation run started");
                        admitted += 1;
                        let executed = event.mark_executed(run_id, now)?;
                        if let Err(e) = self.queued_events.update(&executed).await {
                            error!(
                                site_id,
                                %event_id,
                                error = %e,
                                "Started run could not be saved as executed, stopping pass"
                            );
                            self.hold_unsaved(executed);
                            return Err(e);
                        }
                    }
                    Err(e) => {
                        error!(site_id, %event_id, error = %e, "Queued irrigation run failed to start");
                        self.persist(event.mark_failed(e.to_string(), now)).await;
                    }
                }
                continue;
            }

            if exceeds_site_capacity(&check) {
                let reason = over_capacity_reason(&check);
                warn!(site_id, event_id = %event.event_id, "{}", reason);
                self.persist(event.mark_failed(reason, now)).await;
                continue;
            }

            let estimate = check.estimated_available_at.unwrap_or(now);
            let expected = decollide(estimate, &still_waiting, self.collision_spacing);
            still_waiting.push(expected);
            if expected != event.expected_execution_time {
                debug!(site_id, event_id = %event.event_id, %expected, "Queued run re-estimated");
                self.persist(event.update_expected_time(expected)).await;
            }
        }

        if admitted > 0 {
            info!(site_id, admitted, waiting = still_waiting.len(), "Queue reconciled");
        }
        Ok(admitted)
    }

    /// Aggregates queue history for events queued within `[from, to]`.
    pub async fn statistics(
        &self,
        site_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<QueueStatistics> {
        let events = self.queued_events.list_between(site_id, from, to).await?;
        Ok(summarize(&events))
    }

    async fn decide(&self, request: &RunRequest, now: DateTime<Utc>, record_trips: bool) -> AdmissionDecision {
        let site_id = request.site_id.as_str();

        let verdict = if record_trips {
            self.gate.evaluate_pre_run(site_id, None).await
        } else {
            self.gate.preview_pre_run(site_id).await
        };
        let warnings = match verdict {
            InterlockVerdict::Blocked {
                interlock_type,
                reason,
            } => {
                info!(site_id, program_id = %request.program_id, %interlock_type, "Run blocked: {}", reason);
                return AdmissionDecision::Blocked {
                    interlock_type,
                    reason,
                };
            }
            InterlockVerdict::AllowedWithWarnings(warnings) => warnings,
            InterlockVerdict::Allowed => Vec::new(),
        };

        let queuing_enabled = match self.settings.get_by_site_id(site_id).await {
            Ok(Some(settings)) => settings.enable_flow_rate_queuing,
            Ok(None) => false,
            Err(e) => {
                warn!(site_id, error = %e, "Flow settings unavailable, admitting run");
                false
            }
        };
        if !queuing_enabled {
            return AdmissionDecision::ExecuteImmediately { warnings };
        }

        let check = self.ledger.check(site_id, &request.zone_ids, now).await;
        if check.allowed {
            return AdmissionDecision::ExecuteImmediately { warnings };
        }

        if exceeds_site_capacity(&check) {
            let reason = over_capacity_reason(&check);
            warn!(site_id, program_id = %request.program_id, "{}", reason);
            return AdmissionDecision::Rejected { reason };
        }

        let pending = match self.pending_events(site_id).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(site_id, error = %e, "Queued events unavailable, skipping de-collision");
                Vec::new()
            }
        };
        let taken: Vec<DateTime<Utc>> = pending.iter().map(|e| e.expected_execution_time).collect();
        let estimate = check.estimated_available_at.unwrap_or(now);
        let expected = decollide(estimate, &taken, self.collision_spacing);
        let queue_position = taken.iter().filter(|t| **t <= expected).count() + 1;
        let delay_minutes = (expected - request.scheduled_time).num_minutes().max(0);

        AdmissionDecision::Queue {
            expected_execution_time: expected,
            delay_minutes,
            queue_position,
            reason: capacity_reason(&check),
            excess: check.excess,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn start_and_record(
        &self,
        site_id: &str,
        program_id: &str,
        schedule_id: Option<&str>,
        zone_ids: &[String],
        duration_minutes: Option<i64>,
        triggered_by: &str,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let run_id = self
            .orchestrator
            .start_run(program_id, schedule_id, Some(triggered_by))
            .await?;

        let run = ActiveRun {
            run_id: run_id.clone(),
            program_id: program_id.to_string(),
            site_id: site_id.to_string(),
            active_zone_ids: zone_ids.to_vec(),
            started_at: now,
            expected_end_at: duration_minutes.map(|m| now + Duration::minutes(m)),
        };
        self.record_active(run).await;
        Ok(run_id)
    }

    /// The valve is already open, so a run the store keeps refusing is held
    /// by the ledger instead of being dropped.
    async fn record_active(&self, run: ActiveRun) {
        for attempt in 1..=RECORD_ATTEMPTS {
            match self.active_runs.insert(&run).await {
                Ok(()) => return,
                Err(e) if attempt < RECORD_ATTEMPTS => {
                    warn!(
                        site_id = %run.site_id,
                        run_id = %run.run_id,
                        attempt,
                        error = %e,
                        "Active run write failed, retrying"
                    );
                    tokio::time::sleep(RECORD_RETRY_DELAY * attempt).await;
                }
                Err(e) => {
                    error!(
                        site_id = %run.site_id,
                        run_id = %run.run_id,
                        error = %e,
                        "Run started but could not be recorded as active, holding it in memory"
                    );
                }
            }
        }
        self.ledger.hold_unrecorded(run);
    }

    async fn flush_unrecorded(&self, site_id: &str) {
        for run in self.ledger.unrecorded_runs(site_id) {
            match self.active_runs.insert(&run).await {
                Ok(()) => {
                    self.ledger.release_unrecorded(site_id, &run.run_id);
                    info!(site_id, run_id = %run.run_id, "Held run recorded as active");
                }
                Err(e) => debug!(site_id, run_id = %run.run_id, error = %e, "Held run still unrecorded"),
            }
        }
    }

    fn hold_unsaved(&self, event: QueuedIrrigationEvent) {
        let mut unsaved = self.unsaved.lock().unwrap_or_else(|p| p.into_inner());
        unsaved.insert(event.event_id, event);
    }

    fn unsaved_ids(&self, site_id: &str) -> HashSet<Uuid> {
        let unsaved = self.unsaved.lock().unwrap_or_else(|p| p.into_inner());
        unsaved
            .values()
            .filter(|e| e.site_id == site_id)
            .map(|e| e.event_id)
            .collect()
    }

    async fn flush_unsaved(&self, site_id: &str) {
        let events: Vec<QueuedIrrigationEvent> = {
            let unsaved = self.unsaved.lock().unwrap_or_else(|p| p.into_inner());
            unsaved.values().filter(|e| e.site_id == site_id).cloned().collect()
        };
        for event in events {
            match self.queued_events.update(&event).await {
                Ok(()) => {
                    let mut unsaved = self.unsaved.lock().unwrap_or_else(|p| p.into_inner());
                    unsaved.remove(&event.event_id);
                    info!(site_id, event_id = %event.event_id, "Executed status saved");
                }
                Err(e) => warn!(site_id, event_id = %event.event_id, error = %e, "Executed status still unsaved"),
            }
        }
    }

    async fn persist(&self, transitioned: Result<QueuedIrrigationEvent>) {
        let result = match transitioned {
            Ok(event) => self.queued_events.update(&event).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!(error = %e, "Failed to persist queued event");
        }
    }
}

fn exceeds_site_capacity(check: &FlowCheck) -> bool {
    check.projected_flow > check.effective_max + FLOW_EPSILON
}

fn over_capacity_reason(check: &FlowCheck) -> String {
    format!(
        "Requested flow ({:.1} L/min) exceeds the site's usable capacity ({:.1} L/min)",
        check.projected_flow, check.effective_max
    )
}

fn capacity_reason(check: &FlowCheck) -> String {
    format!(
        "Flow capacity exceeded: current {:.1} L/min + requested {:.1} L/min is over the {:.1} L/min limit by {:.1} L/min",
        check.current_flow,
        check.projected_flow,
        check.effective_max,
        check.excess.unwrap_or(0.0)
    )
}

/// Pushes `candidate` forward until it is at least `spacing` away from every
/// time in `taken`.
pub fn decollide(candidate: DateTime<Utc>, taken: &[DateTime<Utc>], spacing: Duration) -> DateTime<Utc> {
    let mut sorted = taken.to_vec();
    sorted.sort();

    let mut expected = candidate;
    for other in sorted {
        if (other - expected).abs() < spacing {
            expected = other + spacing;
        }
    }
    expected
}

fn summarize(events: &[QueuedIrrigationEvent]) -> QueueStatistics {
    if events.is_empty() {
        return QueueStatistics::default();
    }

    let delays: Vec<f64> = events
        .iter()
        .map(|e| e.delay().num_seconds() as f64 / 60.0)
        .collect();

    let mut hourly_counts: BTreeMap<u32, usize> = BTreeMap::new();
    for event in events {
        *hourly_counts
            .entry(event.original_scheduled_time.hour())
            .or_default() += 1;
    }

    let mut peak_queue_hours: Vec<HourCount> = hourly_counts
        .iter()
        .map(|(hour, count)| HourCount {
            hour: *hour,
            count: *count,
        })
        .collect();
    peak_queue_hours.sort_by(|a, b| b.count.cmp(&a.count).then(a.hour.cmp(&b.hour)));
    peak_queue_hours.truncate(PEAK_HOURS_REPORTED);

    QueueStatistics {
        total_queued: events.len(),
        executed: events
            .iter()
            .filter(|e| e.status == QueueStatus::Executed)
            .count(),
        failed: events
            .iter()
            .filter(|e| e.status == QueueStatus::Failed)
            .count(),
        pending: events.iter().filter(|e| e.is_pending()).count(),
        average_delay_minutes: delays.iter().sum::<f64>() / delays.len() as f64,
        max_delay_minutes: delays.iter().cloned().fold(0.0, f64::max),
        peak_queue_hours,
        hourly_counts,
    }
}

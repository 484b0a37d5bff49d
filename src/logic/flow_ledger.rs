use crate::error::Result;
use crate::models::{ActiveRun, FlowCheck, FlowRateSnapshot, ZoneFlow};
use crate::repository::{
    ActiveRunRepository, Collaborators, IrrigationSettingsRepository, ZoneEmitterRepository,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Float slack for the inclusive capacity boundary.
pub(crate) const FLOW_EPSILON: f64 = 1e-9;

/// How long past its expected end a run still counts, unless configured.
pub const DEFAULT_STALE_RUN_GRACE_MINUTES: i64 = 30;

/// Committed hydraulic flow per site, derived on every call from the live
/// active-run set.
///
/// Runs the store refused to record are held here until a later write
/// succeeds, so a started valve is never invisible to admission. Runs more
/// than the stale grace past their expected end stop counting.
pub struct FlowLedger {
    zones: Arc<dyn ZoneEmitterRepository>,
    settings: Arc<dyn IrrigationSettingsRepository>,
    active_runs: Arc<dyn ActiveRunRepository>,
    fallback_wait: Duration,
    stale_run_grace: Duration,
    unrecorded: Mutex<HashMap<String, Vec<ActiveRun>>>,
}

impl FlowLedger {
    pub fn new(collaborators: &Collaborators, fallback_wait: Duration) -> Self {
        Self {
            zones: Arc::clone(&collaborators.zones),
            settings: Arc::clone(&collaborators.settings),
            active_runs: Arc::clone(&collaborators.active_runs),
            fallback_wait,
            stale_run_grace: Duration::minutes(DEFAULT_STALE_RUN_GRACE_MINUTES),
            unrecorded: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_stale_run_grace(mut self, grace: Duration) -> Self {
        self.stale_run_grace = grace;
        self
    }

    /// Counts a started run that could not be written to the active-run store.
    pub fn hold_unrecorded(&self, run: ActiveRun) {
        let mut held = self.unrecorded.lock().unwrap_or_else(|p| p.into_inner());
        let runs = held.entry(run.site_id.clone()).or_default();
        runs.retain(|r| r.run_id != run.run_id);
        runs.push(run);
    }

    /// Stops holding a run. False if it was not held.
    pub fn release_unrecorded(&self, site_id: &str, run_id: &str) -> bool {
        let mut held = self.unrecorded.lock().unwrap_or_else(|p| p.into_inner());
        let Some(runs) = held.get_mut(site_id) else {
            return false;
        };
        let before = runs.len();
        runs.retain(|r| r.run_id != run_id);
        let released = runs.len() < before;
        if runs.is_empty() {
            held.remove(site_id);
        }
        released
    }

    pub fn unrecorded_runs(&self, site_id: &str) -> Vec<ActiveRun> {
        let held = self.unrecorded.lock().unwrap_or_else(|p| p.into_inner());
        held.get(site_id).cloned().unwrap_or_default()
    }

    pub async fn snapshot(&self, site_id: &str) -> Result<FlowRateSnapshot> {
        self.snapshot_at(site_id, Utc::now()).await
    }

    pub async fn snapshot_at(&self, site_id: &str, now: DateTime<Utc>) -> Result<FlowRateSnapshot> {
        let Some(settings) = self.settings.get_by_site_id(site_id).await? else {
            debug!(site_id, "No flow settings for site, capacity unlimited");
            return Ok(FlowRateSnapshot::unlimited(site_id));
        };

        let mut runs = self.active_runs.get_active_runs(site_id).await?;
        for held in self.unrecorded_runs(site_id) {
            if !runs.iter().any(|r| r.run_id == held.run_id) {
                runs.push(held);
            }
        }

        let mut active_zone_flows = Vec::new();
        for run in &runs {
            if is_stale(run, now, self.stale_run_grace) {
                warn!(
                    site_id,
                    run_id = %run.run_id,
                    expected_end_at = ?run.expected_end_at,
                    "Run is long past its expected end and no end was reported, not counting its flow"
                );
                continue;
            }
            for zone_id in &run.active_zone_ids {
                let flow = self.zone_flow(site_id, zone_id).await?;
                active_zone_flows.push(ZoneFlow {
                    zone_id: zone_id.clone(),
                    run_id: run.run_id.clone(),
                    flow_rate_l_per_min: flow,
                    expected_end_at: run.expected_end_at,
                });
            }
        }

        Ok(FlowRateSnapshot {
            site_id: site_id.to_string(),
            current_flow: active_zone_flows.iter().map(|z| z.flow_rate_l_per_min).sum(),
            max_flow: settings.max_system_flow_rate_l_per_min,
            effective_max_flow: settings.effective_max_flow_rate_l_per_min(),
            active_zone_flows,
        })
    }

    /// Flow the given zones would draw together. Repeated ids count once.
    pub async fn projected_flow(&self, site_id: &str, zone_ids: &[String]) -> Result<f64> {
        let mut seen = HashSet::new();
        let mut total = 0.0;
        for zone_id in zone_ids {
            if seen.insert(zone_id.as_str()) {
                total += self.zone_flow(site_id, zone_id).await?;
            }
        }
        Ok(total)
    }

    /// Capacity verdict for starting `zone_ids` now.
    ///
    /// Lookup failures degrade to an allowed verdict.
    pub async fn check(&self, site_id: &str, zone_ids: &[String], now: DateTime<Utc>) -> FlowCheck {
        let projected = match self.projected_flow(site_id, zone_ids).await {
            Ok(p) => p,
            Err(e) => {
                warn!(site_id, error = %e, "Projected flow unavailable, allowing run");
                return FlowCheck::permissive(0.0);
            }
        };

        let snapshot = match self.snapshot_at(site_id, now).await {
            Ok(s) => s,
            Err(e) => {
                warn!(site_id, error = %e, "Flow snapshot unavailable, allowing run");
                return FlowCheck::permissive(projected);
            }
        };

        evaluate_capacity(&snapshot, projected, now, self.fallback_wait)
    }

    async fn zone_flow(&self, site_id: &str, zone_id: &str) -> Result<f64> {
        match self.zones.get_by_zone_id(zone_id).await? {
            Some(profile) => Ok(profile.total_flow_rate_l_per_min()),
            None => {
                warn!(site_id, zone_id, "Zone has no emitter configuration, counting 0 L/min");
                Ok(0.0)
            }
        }
    }
}

/// Open-ended runs never go stale.
fn is_stale(run: &ActiveRun, now: DateTime<Utc>, grace: Duration) -> bool {
    run.expected_end_at.is_some_and(|end| end + grace < now)
}

/// Pure capacity arithmetic. The boundary is inclusive.
pub fn evaluate_capacity(
    snapshot: &FlowRateSnapshot,
    projected: f64,
    now: DateTime<Utc>,
    fallback_wait: Duration,
) -> FlowCheck {
    let total = snapshot.current_flow + projected;
    let allowed = snapshot.is_unlimited() || total <= snapshot.effective_max_flow + FLOW_EPSILON;

    if allowed {
        return FlowCheck {
            allowed,
            current_flow: snapshot.current_flow,
            projected_flow: projected,
            effective_max: snapshot.effective_max_flow,
            excess: None,
            estimated_available_at: None,
        };
    }

    let needed = projected - snapshot.available_flow();
    FlowCheck {
        allowed,
        current_flow: snapshot.current_flow,
        projected_flow: projected,
        effective_max: snapshot.effective_max_flow,
        excess: Some(total - snapshot.effective_max_flow),
        estimated_available_at: Some(estimate_available_at(
            &snapshot.active_zone_flows,
            needed,
            now,
            fallback_wait,
        )),
    }
}

/// When `needed` L/min is expected to be free, walking active zones in order
/// of their expected end. Zones without an end time cannot be counted on.
///
/// With no known end times this is `now + fallback_wait`. If every known end
/// still leaves too little, the fallback is added past the last known end.
pub fn estimate_available_at(
    active: &[ZoneFlow],
    needed: f64,
    now: DateTime<Utc>,
    fallback_wait: Duration,
) -> DateTime<Utc> {
    let mut ending: Vec<(DateTime<Utc>, f64)> = active
        .iter()
        .filter_map(|z| z.expected_end_at.map(|end| (end, z.flow_rate_l_per_min)))
        .collect();

    if ending.is_empty() {
        return now + fallback_wait;
    }

    ending.sort_by_key(|(end, _)| *end);

    let mut freed = 0.0;
    for (end, flow) in &ending {
        freed += flow;
        if freed + FLOW_EPSILON >= needed {
            return (*end).max(now);
        }
    }

    let last_end = ending.last().map(|(end, _)| *end).unwrap_or(now);
    last_end.max(now) + fallback_wait
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryStore, ScriptedOrchestrator, ScriptedTelemetry};
    use crate::error::FlowGateError;
    use crate::models::{SiteFlowSettings, ZoneFlowProfile};
    use async_trait::async_trait;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 6, 0, 0).unwrap()
    }

    fn zone_flow(zone: &str, flow: f64, end_in: Option<i64>) -> ZoneFlow {
        ZoneFlow {
            zone_id: zone.into(),
            run_id: format!("run-{}", zone),
            flow_rate_l_per_min: flow,
            expected_end_at: end_in.map(|m| now() + Duration::minutes(m)),
        }
    }

    fn ledger(store: &MemoryStore) -> FlowLedger {
        let collaborators =
            Collaborators::in_memory(store, &ScriptedTelemetry::new(), &ScriptedOrchestrator::new());
        FlowLedger::new(&collaborators, Duration::minutes(5))
    }

    async fn site_with_active_run(max: f64, active_flow: f64) -> MemoryStore {
        let store = MemoryStore::new();
        store.set_settings(SiteFlowSettings::new("s1", max)).unwrap();
        store.add_zone(ZoneFlowProfile::new("busy", 1, active_flow)).unwrap();
        store.add_zone(ZoneFlowProfile::new("new-15", 30, 0.5)).unwrap();
        store.add_zone(ZoneFlowProfile::new("new-10", 10, 1.0)).unwrap();
        ActiveRunRepository::insert(
            &store,
            &ActiveRun {
                run_id: "run-a".into(),
                program_id: "p".into(),
                site_id: "s1".into(),
                active_zone_ids: vec!["busy".into()],
                started_at: now(),
                expected_end_at: Some(now() + Duration::minutes(12)),
            },
        )
        .await
        .unwrap();
        store
    }

    #[tokio::test]
    async fn snapshot_without_settings_is_unlimited() {
        let store = MemoryStore::new();
        let snapshot = ledger(&store).snapshot("nowhere").await.unwrap();
        assert!(snapshot.is_unlimited());
        assert_eq!(snapshot.current_flow, 0.0);
    }

    #[tokio::test]
    async fn snapshot_sums_active_zone_flows() {
        let store = site_with_active_run(50.0, 40.0).await;
        let snapshot = ledger(&store).snapshot_at("s1", now()).await.unwrap();
        assert!((snapshot.current_flow - 40.0).abs() < 1e-9);
        assert_eq!(snapshot.active_zone_flows.len(), 1);
        assert!((snapshot.effective_max_flow - 50.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn unconfigured_zone_contributes_nothing() {
        let store = site_with_active_run(50.0, 40.0).await;
        let projected = ledger(&store)
            .projected_flow("s1", &["new-10".into(), "ghost".into(), "new-10".into()])
            .await
            .unwrap();
        assert!((projected - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn exact_remaining_capacity_is_allowed() {
        let store = site_with_active_run(50.0, 40.0).await;
        let check = ledger(&store).check("s1", &["new-10".into()], now()).await;
        assert!(check.allowed);
        assert!(check.excess.is_none());
    }

    #[tokio::test]
    async fn over_capacity_reports_excess_and_wait() {
        let store = site_with_active_run(50.0, 40.0).await;
        let check = ledger(&store).check("s1", &["new-15".into()], now()).await;
        assert!(!check.allowed);
        assert!((check.excess.unwrap() - 5.0).abs() < 1e-9);
        assert_eq!(
            check.estimated_available_at,
            Some(now() + Duration::minutes(12))
        );
    }

    #[tokio::test]
    async fn overdue_run_stops_counting_after_grace() {
        let store = site_with_active_run(50.0, 40.0).await;
        let ledger = ledger(&store).with_stale_run_grace(Duration::minutes(30));

        // Expected end is 06:12, so it still counts at 06:40
        let late = now() + Duration::minutes(40);
        let snapshot = ledger.snapshot_at("s1", late).await.unwrap();
        assert!((snapshot.current_flow - 40.0).abs() < 1e-9);
        assert!(!ledger.check("s1", &["new-15".into()], late).await.allowed);

        let abandoned = now() + Duration::minutes(43);
        let snapshot = ledger.snapshot_at("s1", abandoned).await.unwrap();
        assert_eq!(snapshot.current_flow, 0.0);
        assert!(snapshot.active_zone_flows.is_empty());
        assert!(ledger.check("s1", &["new-15".into()], abandoned).await.allowed);
    }

    #[tokio::test]
    async fn open_ended_runs_never_go_stale() {
        let store = site_with_active_run(50.0, 40.0).await;
        store.add_zone(ZoneFlowProfile::new("drip", 1, 5.0)).unwrap();
        ActiveRunRepository::insert(
            &store,
            &ActiveRun {
                run_id: "run-open".into(),
                program_id: "p".into(),
                site_id: "s1".into(),
                active_zone_ids: vec!["drip".into()],
                started_at: now(),
                expected_end_at: None,
            },
        )
        .await
        .unwrap();

        let snapshot = ledger(&store)
            .snapshot_at("s1", now() + Duration::days(2))
            .await
            .unwrap();
        assert!((snapshot.current_flow - 5.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn held_runs_count_until_released() {
        let store = site_with_active_run(50.0, 40.0).await;
        let ledger = ledger(&store);
        let held = ActiveRun {
            run_id: "run-held".into(),
            program_id: "p".into(),
            site_id: "s1".into(),
            active_zone_ids: vec!["new-10".into()],
            started_at: now(),
            expected_end_at: None,
        };
        ledger.hold_unrecorded(held.clone());
        ledger.hold_unrecorded(held);

        let snapshot = ledger.snapshot_at("s1", now()).await.unwrap();
        assert!((snapshot.current_flow - 50.0).abs() < 1e-9);
        assert!(!ledger.check("s1", &["new-10".into()], now()).await.allowed);

        assert!(ledger.release_unrecorded("s1", "run-held"));
        assert!(!ledger.release_unrecorded("s1", "run-held"));
        assert!(ledger.unrecorded_runs("s1").is_empty());
        assert!(ledger.check("s1", &["new-10".into()], now()).await.allowed);
    }

    #[test]
    fn wait_estimate_walks_earliest_ends_first() {
        let flows = vec![
            zone_flow("late", 30.0, Some(40)),
            zone_flow("early", 5.0, Some(10)),
            zone_flow("mid", 10.0, Some(20)),
        ];
        let fallback = Duration::minutes(5);
        assert_eq!(
            estimate_available_at(&flows, 4.0, now(), fallback),
            now() + Duration::minutes(10)
        );
        assert_eq!(
            estimate_available_at(&flows, 15.0, now(), fallback),
            now() + Duration::minutes(20)
        );
        assert_eq!(
            estimate_available_at(&flows, 16.0, now(), fallback),
            now() + Duration::minutes(40)
        );
    }

    #[test]
    fn wait_estimate_uses_fallback_without_end_times() {
        let flows = vec![zone_flow("open-ended", 30.0, None)];
        let fallback = Duration::minutes(7);
        assert_eq!(
            estimate_available_at(&flows, 10.0, now(), fallback),
            now() + fallback
        );
    }

    #[test]
    fn wait_estimate_is_never_in_the_past() {
        let flows = vec![zone_flow("overdue", 30.0, Some(-15))];
        assert_eq!(
            estimate_available_at(&flows, 10.0, now(), Duration::minutes(5)),
            now()
        );
    }

    struct BrokenRuns;

    #[async_trait]
    impl ActiveRunRepository for BrokenRuns {
        async fn get_active_runs(&self, _site_id: &str) -> Result<Vec<ActiveRun>> {
            Err(FlowGateError::DataSourceUnavailable("run store offline".into()))
        }

        async fn insert(&self, _run: &ActiveRun) -> Result<()> {
            Ok(())
        }

        async fn remove(&self, _site_id: &str, _run_id: &str) -> Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn ledger_failure_degrades_to_allowed() {
        let store = site_with_active_run(50.0, 40.0).await;
        let mut collaborators =
            Collaborators::in_memory(&store, &ScriptedTelemetry::new(), &ScriptedOrchestrator::new());
        collaborators.active_runs = Arc::new(BrokenRuns);
        let ledger = FlowLedger::new(&collaborators, Duration::minutes(5));

        let check = ledger.check("s1", &["new-15".into()], now()).await;
        assert!(check.allowed);
        assert!((check.projected_flow - 15.0).abs() < 1e-9);
    }
}

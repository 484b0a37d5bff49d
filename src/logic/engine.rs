use crate::config::{Config, EngineConfig};
use crate::error::Result;
use crate::logic::{AdmissionQueue, FlowLedger, InterlockGate, Reconciler, SuggestionAnalyzer};
use crate::models::{
    ActiveRun, AdmissionDecision, FlowCheck, FlowRateSnapshot, InterlockEvent, InterlockType,
    InterlockVerdict, QueueStatistics, QueuedIrrigationEvent, RunRequest, SubmitOutcome,
    Suggestion,
};
use crate::repository::Collaborators;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Entry point for schedulers and API layers. Wires the flow ledger,
/// interlock gate, admission queue and suggestion analyzer over one set of
/// collaborators.
pub struct IrrigationEngine {
    ledger: Arc<FlowLedger>,
    gate: Arc<InterlockGate>,
    queue: Arc<AdmissionQueue>,
    suggestions: SuggestionAnalyzer,
    engine_config: EngineConfig,
}

impl IrrigationEngine {
    pub fn new(collaborators: &Collaborators, config: &Config) -> Self {
        let ledger = Arc::new(
            FlowLedger::new(
                collaborators,
                Duration::minutes(config.engine.fallback_wait_minutes),
            )
            .with_stale_run_grace(Duration::minutes(config.engine.stale_run_grace_minutes)),
        );
        let gate = Arc::new(InterlockGate::new(collaborators, &config.interlocks));
        let queue = Arc::new(AdmissionQueue::new(
            collaborators,
            Arc::clone(&ledger),
            Arc::clone(&gate),
            Duration::minutes(config.engine.collision_spacing_minutes),
        ));
        let suggestions =
            SuggestionAnalyzer::new(Arc::clone(&queue), Arc::clone(&collaborators.settings));

        Self {
            ledger,
            gate,
            queue,
            suggestions,
            engine_config: config.engine.clone(),
        }
    }

    /// Background reconciliation over this engine's queue.
    pub fn reconciler(&self) -> Reconciler {
        Reconciler::from_config(Arc::clone(&self.queue), &self.engine_config)
    }

    // Admission

    pub async fn evaluate_run(
        &self,
        site_id: &str,
        program_id: &str,
        zone_ids: &[String],
        scheduled_time: DateTime<Utc>,
    ) -> AdmissionDecision {
        let request = RunRequest::new(site_id, program_id, zone_ids.to_vec(), scheduled_time);
        self.queue.evaluate(&request).await
    }

    pub async fn submit_run(&self, request: &RunRequest) -> Result<SubmitOutcome> {
        self.queue.submit(request).await
    }

    pub async fn record_run_started(&self, run: &ActiveRun) -> Result<()> {
        self.queue.record_run_started(run).await
    }

    pub async fn record_run_ended(&self, site_id: &str, run_id: &str) -> Result<bool> {
        self.queue.record_run_ended(site_id, run_id).await
    }

    pub async fn get_queued_events(&self, site_id: &str) -> Result<Vec<QueuedIrrigationEvent>> {
        self.queue.pending_events(site_id).await
    }

    pub async fn process_queue(&self, site_id: &str) -> Result<usize> {
        self.queue.reconcile(site_id).await
    }

    pub async fn get_queue_statistics(
        &self,
        site_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<QueueStatistics> {
        self.queue.statistics(site_id, from, to).await
    }

    // Flow

    pub async fn flow_snapshot(&self, site_id: &str) -> Result<FlowRateSnapshot> {
        self.ledger.snapshot(site_id).await
    }

    pub async fn check_flow(&self, site_id: &str, zone_ids: &[String]) -> FlowCheck {
        self.ledger.check(site_id, zone_ids, Utc::now()).await
    }

    // Interlocks

    pub async fn check_interlock(&self, site_id: &str, interlock_type: InterlockType) -> InterlockVerdict {
        self.gate.check_interlock(site_id, interlock_type).await
    }

    pub async fn evaluate_pre_run_interlocks(
        &self,
        site_id: &str,
        group_id: Option<&str>,
    ) -> InterlockVerdict {
        self.gate.evaluate_pre_run(site_id, group_id).await
    }

    /// Pre-run verdict that records no trips and clears nothing.
    pub async fn preview_pre_run_interlocks(&self, site_id: &str) -> InterlockVerdict {
        self.gate.preview_pre_run(site_id).await
    }

    pub async fn record_interlock_trip(
        &self,
        site_id: &str,
        interlock_type: InterlockType,
        details: &str,
        run_id: Option<&str>,
        group_id: Option<&str>,
    ) -> Result<InterlockEvent> {
        self.gate
            .record_trip(site_id, interlock_type, details, run_id, group_id)
            .await
    }

    pub async fn clear_interlock(
        &self,
        event_id: Uuid,
        user_id: Option<&str>,
        notes: Option<&str>,
    ) -> Result<bool> {
        self.gate.clear(event_id, user_id, notes).await
    }

    pub async fn list_active_interlocks(&self, site_id: &str) -> Result<Vec<InterlockEvent>> {
        self.gate.active_interlocks(site_id).await
    }

    // Suggestions

    pub async fn generate_suggestions(&self, site_id: &str) -> Result<Vec<Suggestion>> {
        self.suggestions.generate(site_id).await
    }

    pub async fn should_show_suggestions(&self, site_id: &str) -> Result<bool> {
        self.suggestions.should_show(site_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryStore, ScriptedOrchestrator, ScriptedTelemetry};
    use crate::models::{streams, SiteFlowSettings, SuggestionType, ZoneFlowProfile};
    use crate::repository::QueuedEventRepository;

    struct Fixture {
        store: MemoryStore,
        telemetry: ScriptedTelemetry,
        engine: IrrigationEngine,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new();
        store
            .set_settings(SiteFlowSettings::new("s1", 100.0).with_safety_margin(0.5))
            .unwrap();
        store.add_zone(ZoneFlowProfile::new("bed-1", 20, 2.0)).unwrap();
        store.add_zone(ZoneFlowProfile::new("bed-2", 15, 1.0)).unwrap();
        let telemetry = ScriptedTelemetry::new();
        let now = Utc::now();
        telemetry.set("s1", streams::TANK_LEVEL_PERCENT, 60.0, now).unwrap();
        telemetry.set("s1", streams::EC_MS_CM, 2.0, now).unwrap();
        telemetry.set("s1", streams::PH, 6.0, now).unwrap();
        let orchestrator = ScriptedOrchestrator::new();

        let collaborators = Collaborators::in_memory(&store, &telemetry, &orchestrator);
        let engine = IrrigationEngine::new(&collaborators, &Config::default());
        Fixture {
            store,
            telemetry,
            engine,
        }
    }

    fn zones(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|z| z.to_string()).collect()
    }

    #[tokio::test]
    async fn safety_margin_shrinks_usable_capacity() {
        let f = fixture();
        let outcome = f
            .engine
            .submit_run(&RunRequest::new("s1", "p1", zones(&["bed-1"]), Utc::now()))
            .await
            .unwrap();
        assert!(matches!(outcome, SubmitOutcome::Started { .. }));

        // 40 of an effective 50 is committed, bed-2 adds 15
        let decision = f
            .engine
            .evaluate_run("s1", "p2", &zones(&["bed-2"]), Utc::now())
            .await;
        assert!(matches!(decision, AdmissionDecision::Queue { .. }));

        let snapshot = f.engine.flow_snapshot("s1").await.unwrap();
        assert!((snapshot.current_flow - 40.0).abs() < 1e-9);
        assert!((snapshot.effective_max_flow - 50.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn water_quality_block_and_recovery() {
        let f = fixture();
        f.telemetry.set("s1", streams::EC_MS_CM, 4.0, Utc::now()).unwrap();

        match f.engine.evaluate_pre_run_interlocks("s1", Some("g1")).await {
            InterlockVerdict::Blocked { reason, .. } => {
                assert!(reason.contains("4.00"));
                assert!(reason.contains("0.5-3.5"));
            }
            other => panic!("expected block, got {:?}", other),
        }

        f.telemetry.set("s1", streams::EC_MS_CM, 2.0, Utc::now()).unwrap();
        // EC trips need an operator before irrigation resumes
        assert!(f.engine.evaluate_pre_run_interlocks("s1", None).await.is_blocked());

        let active = f.engine.list_active_interlocks("s1").await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].group_id.as_deref(), Some("g1"));
        assert!(!f.engine.clear_interlock(active[0].event_id, None, None).await.unwrap());
        assert!(f
            .engine
            .clear_interlock(active[0].event_id, Some("op-7"), Some("sensor recalibrated"))
            .await
            .unwrap());
        assert!(f.engine.evaluate_pre_run_interlocks("s1", None).await.is_allowed());
    }

    #[tokio::test]
    async fn busy_week_produces_one_capacity_suggestion() {
        let f = fixture();
        let now = Utc::now();
        for i in 0..25 {
            let scheduled = now - Duration::hours(i * 6);
            let request = RunRequest::new("s1", format!("p{}", i), zones(&["bed-1"]), scheduled);
            let delay = if i == 0 { 40 } else { 10 };
            let event = QueuedIrrigationEvent::new(
                &request,
                scheduled + Duration::minutes(delay),
                "capacity",
                scheduled,
            );
            QueuedEventRepository::create(&f.store, &event).await.unwrap();
        }

        let suggestions = f.engine.generate_suggestions("s1").await.unwrap();
        let capacity = suggestions
            .iter()
            .filter(|s| s.suggestion_type == SuggestionType::SystemCapacity)
            .count();
        assert_eq!(capacity, 1);
        assert!(suggestions.len() <= 5);
        assert!(f.engine.should_show_suggestions("s1").await.unwrap());

        let stats = f
            .engine
            .get_queue_statistics("s1", now - Duration::days(7), now)
            .await
            .unwrap();
        assert_eq!(stats.total_queued, 25);
        assert!((stats.max_delay_minutes - 40.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn suggestions_hidden_below_threshold_or_when_disabled() {
        let f = fixture();
        assert!(!f.engine.should_show_suggestions("s1").await.unwrap());
        assert!(!f.engine.should_show_suggestions("unknown").await.unwrap());

        let mut settings = SiteFlowSettings::new("s1", 100.0);
        settings.enable_smart_suggestions = false;
        settings.suggestion_threshold_count = 0;
        f.store.set_settings(settings).unwrap();
        assert!(!f.engine.should_show_suggestions("s1").await.unwrap());
    }

    #[tokio::test]
    async fn queue_drains_after_run_ends() {
        let f = fixture();
        let SubmitOutcome::Started { run_id, .. } = f
            .engine
            .submit_run(&RunRequest::new("s1", "p1", zones(&["bed-1"]), Utc::now()))
            .await
            .unwrap()
        else {
            panic!("expected start");
        };
        f.engine
            .submit_run(&RunRequest::new("s1", "p2", zones(&["bed-2"]), Utc::now()))
            .await
            .unwrap();
        assert_eq!(f.engine.get_queued_events("s1").await.unwrap().len(), 1);

        assert!(f.engine.record_run_ended("s1", &run_id).await.unwrap());
        assert_eq!(f.engine.process_queue("s1").await.unwrap(), 1);
        assert!(f.engine.get_queued_events("s1").await.unwrap().is_empty());
        assert!(!f.engine.check_flow("s1", &zones(&["bed-1"])).await.allowed);
    }
}

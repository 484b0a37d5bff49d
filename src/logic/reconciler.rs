use crate::config::EngineConfig;
use crate::logic::AdmissionQueue;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Periodically drains each site's queue. One task per site, so a slow or
/// failing site never holds up the others.
///
/// A pass that outlives its timeout is left to finish in the background. It
/// may be between opening a valve and recording that, so it is never
/// cancelled, and no new pass starts for the site until it is done.
#[derive(Clone)]
pub struct Reconciler {
    queue: Arc<AdmissionQueue>,
    interval: Duration,
    pass_timeout: Duration,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

/// Marks a site's pass as running until dropped, including on panic.
struct InFlight {
    sites: Arc<Mutex<HashSet<String>>>,
    site_id: String,
}

impl InFlight {
    fn claim(sites: &Arc<Mutex<HashSet<String>>>, site_id: &str) -> Option<Self> {
        let mut running = sites.lock().unwrap_or_else(|p| p.into_inner());
        running.insert(site_id.to_string()).then(|| Self {
            sites: Arc::clone(sites),
            site_id: site_id.to_string(),
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut running = self.sites.lock().unwrap_or_else(|p| p.into_inner());
        running.remove(&self.site_id);
    }
}

/// Running reconciliation tasks.
pub struct ReconcilerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ReconcilerHandle {
    /// Signals every site task and waits for them to finish their current pass.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Reconciliation task ended abnormally");
            }
        }
        info!("Queue reconciliation stopped");
    }
}

impl Reconciler {
    pub fn new(queue: Arc<AdmissionQueue>, interval: Duration, pass_timeout: Duration) -> Self {
        Self {
            queue,
            interval,
            pass_timeout,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn from_config(queue: Arc<AdmissionQueue>, config: &EngineConfig) -> Self {
        Self::new(
            queue,
            Duration::from_secs(config.reconcile_interval_secs.max(1)),
            Duration::from_secs(config.reconcile_timeout_secs.max(1)),
        )
    }

    pub fn spawn(&self, site_ids: Vec<String>) -> ReconcilerHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let tasks = site_ids
            .into_iter()
            .map(|site_id| {
                let reconciler = self.clone();
                let rx = shutdown_rx.clone();
                tokio::spawn(async move { reconciler.run_site(site_id, rx).await })
            })
            .collect::<Vec<_>>();

        info!(
            sites = tasks.len(),
            interval_secs = self.interval.as_secs(),
            "Queue reconciliation started"
        );
        ReconcilerHandle { shutdown, tasks }
    }

    /// One pass, waited on for at most the pass timeout. Returns the number of
    /// runs started, or None when the pass failed, is still running, or the
    /// previous pass for the site has not finished.
    pub async fn run_once(&self, site_id: &str) -> Option<usize> {
        let Some(in_flight) = InFlight::claim(&self.in_flight, site_id) else {
            debug!(site_id, "Previous reconciliation pass still running, skipping");
            return None;
        };

        let queue = Arc::clone(&self.queue);
        let site = site_id.to_string();
        let mut pass = tokio::spawn(async move {
            let _in_flight = in_flight;
            queue.reconcile(&site).await
        });

        match tokio::time::timeout(self.pass_timeout, &mut pass).await {
            Ok(Ok(Ok(started))) => Some(started),
            Ok(Ok(Err(e))) => {
                warn!(site_id, error = %e, "Queue reconciliation failed, retrying next tick");
                None
            }
            Ok(Err(e)) => {
                error!(site_id, error = %e, "Queue reconciliation pass ended abnormally");
                None
            }
            Err(_) => {
                warn!(
                    site_id,
                    timeout_ms = self.pass_timeout.as_millis() as u64,
                    "Queue reconciliation pass is slow, letting it finish in the background"
                );
                None
            }
        }
    }

    async fn run_site(&self, site_id: String, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(started) = self.run_once(&site_id).await {
                        debug!(site_id = %site_id, started, "Reconciliation pass complete");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(site_id = %site_id, "Reconciliation task stopping");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InterlockThresholds;
    use crate::db::{MemoryStore, ScriptedOrchestrator, ScriptedTelemetry};
    use crate::error::Result;
    use crate::logic::{FlowLedger, InterlockGate};
    use crate::models::{
        streams, ActiveRun, QueueStatus, RunRequest, SiteFlowSettings, SubmitOutcome,
        ZoneFlowProfile,
    };
    use crate::repository::{ActiveRunRepository, Collaborators, IrrigationOrchestrator};
    use async_trait::async_trait;
    use chrono::Utc;

    /// Accepts the start right away but takes `delay` to answer.
    struct SlowOrchestrator {
        inner: ScriptedOrchestrator,
        delay: Duration,
    }

    #[async_trait]
    impl IrrigationOrchestrator for SlowOrchestrator {
        async fn start_run(
            &self,
            program_id: &str,
            schedule_id: Option<&str>,
            triggered_by: Option<&str>,
        ) -> Result<String> {
            let run_id = self.inner.start_run(program_id, schedule_id, triggered_by).await?;
            tokio::time::sleep(self.delay).await;
            Ok(run_id)
        }
    }

    fn setup() -> (Arc<AdmissionQueue>, ScriptedOrchestrator) {
        let (queue, _, orchestrator) = setup_with(|_| {});
        (queue, orchestrator)
    }

    /// Site `s1` with a 30 L/min budget and two 20 L/min zones.
    fn setup_with(
        adjust: impl FnOnce(&mut Collaborators),
    ) -> (Arc<AdmissionQueue>, MemoryStore, ScriptedOrchestrator) {
        let store = MemoryStore::new();
        store.set_settings(SiteFlowSettings::new("s1", 30.0)).unwrap();
        store.add_zone(ZoneFlowProfile::new("a", 10, 2.0)).unwrap();
        store.add_zone(ZoneFlowProfile::new("b", 10, 2.0)).unwrap();
        let telemetry = ScriptedTelemetry::new();
        let now = Utc::now();
        telemetry.set("s1", streams::TANK_LEVEL_PERCENT, 80.0, now).unwrap();
        telemetry.set("s1", streams::EC_MS_CM, 1.5, now).unwrap();
        telemetry.set("s1", streams::PH, 6.0, now).unwrap();
        let orchestrator = ScriptedOrchestrator::new();

        let mut collaborators = Collaborators::in_memory(&store, &telemetry, &orchestrator);
        adjust(&mut collaborators);
        let ledger = Arc::new(FlowLedger::new(&collaborators, chrono::Duration::minutes(5)));
        let gate = Arc::new(InterlockGate::new(&collaborators, &InterlockThresholds::default()));
        let queue = Arc::new(AdmissionQueue::new(
            &collaborators,
            ledger,
            gate,
            chrono::Duration::minutes(2),
        ));
        (queue, store, orchestrator)
    }

    #[tokio::test]
    async fn background_task_drains_queue_and_stops() {
        let (queue, orchestrator) = setup();
        let outcome = queue
            .submit(&RunRequest::new("s1", "first", vec!["a".into()], Utc::now()))
            .await
            .unwrap();
        let SubmitOutcome::Started { run_id, .. } = outcome else {
            panic!("expected first run to start");
        };
        assert!(matches!(
            queue
                .submit(&RunRequest::new("s1", "second", vec!["b".into()], Utc::now()))
                .await
                .unwrap(),
            SubmitOutcome::Queued(_)
        ));

        let reconciler = Reconciler::new(
            Arc::clone(&queue),
            Duration::from_millis(20),
            Duration::from_secs(1),
        );
        let handle = reconciler.spawn(vec!["s1".to_string()]);

        queue.record_run_ended("s1", &run_id).await.unwrap();
        for _ in 0..50 {
            if queue.pending_events("s1").await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.shutdown().await;

        assert!(queue.pending_events("s1").await.unwrap().is_empty());
        assert_eq!(orchestrator.started_programs().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn idle_site_pass_starts_nothing() {
        let (queue, orchestrator) = setup();
        let reconciler = Reconciler::new(queue, Duration::from_secs(1), Duration::from_secs(1));
        assert_eq!(reconciler.run_once("s1").await, Some(0));
        assert_eq!(reconciler.run_once("unknown-site").await, Some(0));
        assert!(orchestrator.started_programs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn slow_start_is_not_cancelled_or_repeated() {
        let controller = ScriptedOrchestrator::new();
        let inner = controller.clone();
        let (queue, store, _) = setup_with(move |collaborators| {
            collaborators.orchestrator = Arc::new(SlowOrchestrator {
                inner,
                delay: Duration::from_millis(300),
            });
        });

        let now = Utc::now();
        queue
            .record_run_started(&ActiveRun {
                run_id: "ext-a".into(),
                program_id: "external".into(),
                site_id: "s1".into(),
                active_zone_ids: vec!["a".into()],
                started_at: now,
                expected_end_at: None,
            })
            .await
            .unwrap();
        let SubmitOutcome::Queued(event) = queue
            .submit(&RunRequest::new("s1", "queued", vec!["b".into()], now))
            .await
            .unwrap()
        else {
            panic!("expected the second run to queue");
        };
        queue.record_run_ended("s1", "ext-a").await.unwrap();

        let reconciler = Reconciler::new(
            Arc::clone(&queue),
            Duration::from_secs(1),
            Duration::from_millis(100),
        );
        assert_eq!(reconciler.run_once("s1").await, None);
        assert_eq!(reconciler.run_once("s1").await, None);

        for _ in 0..50 {
            if queue.pending_events("s1").await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(controller.started_programs().unwrap(), vec!["queued"]);
        let stored = store.all_queued_events().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].event_id, event.event_id);
        assert_eq!(stored[0].status, QueueStatus::Executed);
        let active = ActiveRunRepository::get_active_runs(&store, "s1").await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].active_zone_ids, vec!["b".to_string()]);

        // The finished pass released the site
        assert_eq!(reconciler.run_once("s1").await, Some(0));
    }
}

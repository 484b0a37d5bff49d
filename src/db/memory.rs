//! In-memory implementations of every collaborator port.
//!
//! Used by the test suite and for dry runs without a telemetry feed or an
//! orchestrator. State lives behind a single mutex per store.

use crate::error::{FlowGateError, Result};
use crate::models::{
    ActiveRun, InterlockEvent, QueuedIrrigationEvent, SiteFlowSettings, TelemetryReading,
    ZoneFlowProfile,
};
use crate::repository::{
    ActiveRunRepository, Collaborators, InterlockEventRepository, IrrigationOrchestrator,
    IrrigationSettingsRepository, QueuedEventRepository, TelemetryQueryService,
    ZoneEmitterRepository,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| FlowGateError::InvalidData("in-memory store lock poisoned".into()))
}

#[derive(Default)]
struct StoreData {
    zones: HashMap<String, ZoneFlowProfile>,
    settings: HashMap<String, SiteFlowSettings>,
    active_runs: Vec<ActiveRun>,
    queued_events: Vec<QueuedIrrigationEvent>,
    interlock_events: Vec<InterlockEvent>,
}

/// Configuration and audit repositories held in memory.
#[derive(Clone, Default)]
pub struct MemoryStore {
    data: Arc<Mutex<StoreData>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_zone(&self, zone: ZoneFlowProfile) -> Result<()> {
        lock(&self.data)?.zones.insert(zone.zone_id.clone(), zone);
        Ok(())
    }

    pub fn set_settings(&self, settings: SiteFlowSettings) -> Result<()> {
        lock(&self.data)?
            .settings
            .insert(settings.site_id.clone(), settings);
        Ok(())
    }

    pub fn all_queued_events(&self) -> Result<Vec<QueuedIrrigationEvent>> {
        Ok(lock(&self.data)?.queued_events.clone())
    }

    pub fn all_interlock_events(&self) -> Result<Vec<InterlockEvent>> {
        Ok(lock(&self.data)?.interlock_events.clone())
    }
}

#[async_trait]
impl ZoneEmitterRepository for MemoryStore {
    async fn get_by_zone_id(&self, zone_id: &str) -> Result<Option<ZoneFlowProfile>> {
        Ok(lock(&self.data)?.zones.get(zone_id).cloned())
    }
}

#[async_trait]
impl IrrigationSettingsRepository for MemoryStore {
    async fn get_by_site_id(&self, site_id: &str) -> Result<Option<SiteFlowSettings>> {
        Ok(lock(&self.data)?.settings.get(site_id).cloned())
    }
}

#[async_trait]
impl ActiveRunRepository for MemoryStore {
    async fn get_active_runs(&self, site_id: &str) -> Result<Vec<ActiveRun>> {
        Ok(lock(&self.data)?
            .active_runs
            .iter()
            .filter(|r| r.site_id == site_id)
            .cloned()
            .collect())
    }

    async fn insert(&self, run: &ActiveRun) -> Result<()> {
        let mut data = lock(&self.data)?;
        if data.active_runs.iter().any(|r| r.run_id == run.run_id) {
            return Err(FlowGateError::InvalidData(format!(
                "run {} is already active",
                run.run_id
            )));
        }
        data.active_runs.push(run.clone());
        Ok(())
    }

    async fn remove(&self, site_id: &str, run_id: &str) -> Result<bool> {
        let mut data = lock(&self.data)?;
        let before = data.active_runs.len();
        data.active_runs
            .retain(|r| !(r.site_id == site_id && r.run_id == run_id));
        Ok(data.active_runs.len() < before)
    }
}

#[async_trait]
impl QueuedEventRepository for MemoryStore {
    async fn create(&self, event: &QueuedIrrigationEvent) -> Result<()> {
        lock(&self.data)?.queued_events.push(event.clone());
        Ok(())
    }

    async fn update(&self, event: &QueuedIrrigationEvent) -> Result<()> {
        let mut data = lock(&self.data)?;
        let slot = data
            .queued_events
            .iter_mut()
            .find(|e| e.event_id == event.event_id)
            .ok_or_else(|| FlowGateError::NotFound(format!("queued event {}", event.event_id)))?;
        *slot = event.clone();
        Ok(())
    }

    async fn get(&self, event_id: Uuid) -> Result<Option<QueuedIrrigationEvent>> {
        Ok(lock(&self.data)?
            .queued_events
            .iter()
            .find(|e| e.event_id == event_id)
            .cloned())
    }

    async fn list_pending(&self, site_id: &str) -> Result<Vec<QueuedIrrigationEvent>> {
        let mut pending: Vec<_> = lock(&self.data)?
            .queued_events
            .iter()
            .filter(|e| e.site_id == site_id && e.is_pending())
            .cloned()
            .collect();
        pending.sort_by_key(|e| (e.expected_execution_time, e.queued_at));
        Ok(pending)
    }

    async fn list_between(
        &self,
        site_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<QueuedIrrigationEvent>> {
        Ok(lock(&self.data)?
            .queued_events
            .iter()
            .filter(|e| e.site_id == site_id && e.queued_at >= from && e.queued_at <= to)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl InterlockEventRepository for MemoryStore {
    async fn create(&self, event: &InterlockEvent) -> Result<()> {
        lock(&self.data)?.interlock_events.push(event.clone());
        Ok(())
    }

    async fn update(&self, event: &InterlockEvent) -> Result<()> {
        let mut data = lock(&self.data)?;
        let slot = data
            .interlock_events
            .iter_mut()
            .find(|e| e.event_id == event.event_id)
            .ok_or_else(|| FlowGateError::NotFound(format!("interlock event {}", event.event_id)))?;
        *slot = event.clone();
        Ok(())
    }

    async fn get(&self, event_id: Uuid) -> Result<Option<InterlockEvent>> {
        Ok(lock(&self.data)?
            .interlock_events
            .iter()
            .find(|e| e.event_id == event_id)
            .cloned())
    }

    async fn list_active(&self, site_id: &str) -> Result<Vec<InterlockEvent>> {
        Ok(lock(&self.data)?
            .interlock_events
            .iter()
            .filter(|e| e.site_id == site_id && e.is_active)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
struct TelemetryData {
    values: HashMap<(String, String), TelemetryReading>,
    last_reading: HashMap<String, DateTime<Utc>>,
    unreachable: bool,
}

/// Telemetry feed whose readings are set by hand.
#[derive(Clone, Default)]
pub struct ScriptedTelemetry {
    data: Arc<Mutex<TelemetryData>>,
}

impl ScriptedTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a stream value and bumps the site's last-reading time.
    pub fn set(&self, site_id: &str, stream_key: &str, value: f64, at: DateTime<Utc>) -> Result<()> {
        let mut data = lock(&self.data)?;
        data.values.insert(
            (site_id.to_string(), stream_key.to_string()),
            TelemetryReading::new(value, at),
        );
        let last = data.last_reading.entry(site_id.to_string()).or_insert(at);
        if at > *last {
            *last = at;
        }
        Ok(())
    }

    pub fn clear_stream(&self, site_id: &str, stream_key: &str) -> Result<()> {
        lock(&self.data)?
            .values
            .remove(&(site_id.to_string(), stream_key.to_string()));
        Ok(())
    }

    pub fn set_last_reading(&self, site_id: &str, at: Option<DateTime<Utc>>) -> Result<()> {
        let mut data = lock(&self.data)?;
        match at {
            Some(at) => data.last_reading.insert(site_id.to_string(), at),
            None => data.last_reading.remove(site_id),
        };
        Ok(())
    }

    /// Makes every query fail as if the telemetry service were down.
    pub fn set_unreachable(&self, unreachable: bool) -> Result<()> {
        lock(&self.data)?.unreachable = unreachable;
        Ok(())
    }
}

#[async_trait]
impl TelemetryQueryService for ScriptedTelemetry {
    async fn get_latest_value(
        &self,
        site_id: &str,
        stream_key: &str,
    ) -> Result<Option<TelemetryReading>> {
        let data = lock(&self.data)?;
        if data.unreachable {
            return Err(FlowGateError::DataSourceUnavailable(
                "telemetry service unreachable".into(),
            ));
        }
        Ok(data
            .values
            .get(&(site_id.to_string(), stream_key.to_string()))
            .copied())
    }

    async fn get_last_reading_time(&self, site_id: &str) -> Result<Option<DateTime<Utc>>> {
        let data = lock(&self.data)?;
        if data.unreachable {
            return Err(FlowGateError::DataSourceUnavailable(
                "telemetry service unreachable".into(),
            ));
        }
        Ok(data.last_reading.get(site_id).copied())
    }
}

#[derive(Default)]
struct OrchestratorData {
    next_id: u64,
    started: Vec<String>,
    failing_programs: HashSet<String>,
}

/// Orchestrator that hands out sequential run ids and records every call.
#[derive(Clone, Default)]
pub struct ScriptedOrchestrator {
    data: Arc<Mutex<OrchestratorData>>,
}

impl ScriptedOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_program(&self, program_id: &str) -> Result<()> {
        lock(&self.data)?
            .failing_programs
            .insert(program_id.to_string());
        Ok(())
    }

    /// Program ids passed to successful `start_run` calls, in order.
    pub fn started_programs(&self) -> Result<Vec<String>> {
        Ok(lock(&self.data)?.started.clone())
    }
}

#[async_trait]
impl IrrigationOrchestrator for ScriptedOrchestrator {
    async fn start_run(
        &self,
        program_id: &str,
        _schedule_id: Option<&str>,
        _triggered_by: Option<&str>,
    ) -> Result<String> {
        let mut data = lock(&self.data)?;
        if data.failing_programs.contains(program_id) {
            return Err(FlowGateError::Downstream(format!(
                "controller rejected program {}",
                program_id
            )));
        }
        data.next_id += 1;
        data.started.push(program_id.to_string());
        Ok(format!("run-{}", data.next_id))
    }
}

impl Collaborators {
    /// Wires every port to in-memory doubles sharing one store.
    pub fn in_memory(
        store: &MemoryStore,
        telemetry: &ScriptedTelemetry,
        orchestrator: &ScriptedOrchestrator,
    ) -> Self {
        Self {
            zones: Arc::new(store.clone()),
            settings: Arc::new(store.clone()),
            active_runs: Arc::new(store.clone()),
            queued_events: Arc::new(store.clone()),
            interlock_events: Arc::new(store.clone()),
            telemetry: Arc::new(telemetry.clone()),
            orchestrator: Arc::new(orchestrator.clone()),
        }
    }
}

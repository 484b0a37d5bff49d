//! Ports to the collaborators the engine reads from and writes to.
//!
//! Zone and site configuration, live telemetry and the valve orchestrator are
//! owned elsewhere. The engine only sees them through these traits, which keeps
//! the admission logic testable against in-memory doubles.

use crate::error::Result;
use crate::models::{
    ActiveRun, InterlockEvent, QueuedIrrigationEvent, SiteFlowSettings, TelemetryReading,
    ZoneFlowProfile,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

#[async_trait]
pub trait ZoneEmitterRepository: Send + Sync {
    async fn get_by_zone_id(&self, zone_id: &str) -> Result<Option<ZoneFlowProfile>>;
}

#[async_trait]
pub trait IrrigationSettingsRepository: Send + Sync {
    async fn get_by_site_id(&self, site_id: &str) -> Result<Option<SiteFlowSettings>>;
}

#[async_trait]
pub trait ActiveRunRepository: Send + Sync {
    async fn get_active_runs(&self, site_id: &str) -> Result<Vec<ActiveRun>>;

    async fn insert(&self, run: &ActiveRun) -> Result<()>;

    /// Returns false when no such run was active.
    async fn remove(&self, site_id: &str, run_id: &str) -> Result<bool>;
}

#[async_trait]
pub trait QueuedEventRepository: Send + Sync {
    async fn create(&self, event: &QueuedIrrigationEvent) -> Result<()>;

    async fn update(&self, event: &QueuedIrrigationEvent) -> Result<()>;

    async fn get(&self, event_id: Uuid) -> Result<Option<QueuedIrrigationEvent>>;

    /// Pending events for a site, earliest expected execution first.
    async fn list_pending(&self, site_id: &str) -> Result<Vec<QueuedIrrigationEvent>>;

    /// Every event queued within `[from, to]`, any status.
    async fn list_between(
        &self,
        site_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<QueuedIrrigationEvent>>;
}

#[async_trait]
pub trait InterlockEventRepository: Send + Sync {
    async fn create(&self, event: &InterlockEvent) -> Result<()>;

    async fn update(&self, event: &InterlockEvent) -> Result<()>;

    async fn get(&self, event_id: Uuid) -> Result<Option<InterlockEvent>>;

    async fn list_active(&self, site_id: &str) -> Result<Vec<InterlockEvent>>;
}

#[async_trait]
pub trait TelemetryQueryService: Send + Sync {
    async fn get_latest_value(
        &self,
        site_id: &str,
        stream_key: &str,
    ) -> Result<Option<TelemetryReading>>;

    async fn get_last_reading_time(&self, site_id: &str) -> Result<Option<DateTime<Utc>>>;
}

/// Opens valves. Every call has a hardware side effect.
#[async_trait]
pub trait IrrigationOrchestrator: Send + Sync {
    async fn start_run(
        &self,
        program_id: &str,
        schedule_id: Option<&str>,
        triggered_by: Option<&str>,
    ) -> Result<String>;
}

/// Everything the engine needs wired in one place.
#[derive(Clone)]
pub struct Collaborators {
    pub zones: Arc<dyn ZoneEmitterRepository>,
    pub settings: Arc<dyn IrrigationSettingsRepository>,
    pub active_runs: Arc<dyn ActiveRunRepository>,
    pub queued_events: Arc<dyn QueuedEventRepository>,
    pub interlock_events: Arc<dyn InterlockEventRepository>,
    pub telemetry: Arc<dyn TelemetryQueryService>,
    pub orchestrator: Arc<dyn IrrigationOrchestrator>,
}

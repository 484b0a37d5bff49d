use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Emitter layout of a single zone. Owned by the equipment configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneFlowProfile {
    pub zone_id: String,
    pub emitter_count: u32,
    pub emitter_flow_rate_l_per_min: f64,
}

impl ZoneFlowProfile {
    pub fn new(zone_id: impl Into<String>, emitter_count: u32, emitter_flow_rate: f64) -> Self {
        Self {
            zone_id: zone_id.into(),
            emitter_count,
            emitter_flow_rate_l_per_min: emitter_flow_rate,
        }
    }

    pub fn total_flow_rate_l_per_min(&self) -> f64 {
        self.emitter_count as f64 * self.emitter_flow_rate_l_per_min
    }
}

/// Per-site hydraulic budget and queuing switches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteFlowSettings {
    #[serde(default)]
    pub site_id: String,
    pub max_system_flow_rate_l_per_min: f64,
    /// Fraction of the system maximum that may actually be committed.
    #[serde(default)]
    pub safety_margin: Option<f64>,
    #[serde(default = "default_true")]
    pub enable_flow_rate_queuing: bool,
    #[serde(default = "default_true")]
    pub enable_smart_suggestions: bool,
    #[serde(default = "default_suggestion_threshold")]
    pub suggestion_threshold_count: u32,
}

fn default_true() -> bool {
    true
}

fn default_suggestion_threshold() -> u32 {
    5
}

impl SiteFlowSettings {
    pub fn new(site_id: impl Into<String>, max_flow: f64) -> Self {
        Self {
            site_id: site_id.into(),
            max_system_flow_rate_l_per_min: max_flow,
            safety_margin: None,
            enable_flow_rate_queuing: default_true(),
            enable_smart_suggestions: default_true(),
            suggestion_threshold_count: default_suggestion_threshold(),
        }
    }

    pub fn with_safety_margin(mut self, margin: f64) -> Self {
        self.safety_margin = Some(margin);
        self
    }

    pub fn with_queuing(mut self, enabled: bool) -> Self {
        self.enable_flow_rate_queuing = enabled;
        self
    }

    /// Committable flow after the safety margin. Never exceeds the system maximum.
    pub fn effective_max_flow_rate_l_per_min(&self) -> f64 {
        let margin = self
            .safety_margin
            .filter(|m| m.is_finite() && *m > 0.0)
            .map(|m| m.min(1.0))
            .unwrap_or(1.0);
        self.max_system_flow_rate_l_per_min * margin
    }
}

/// A run the orchestrator has started and not yet finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveRun {
    pub run_id: String,
    pub program_id: String,
    pub site_id: String,
    pub active_zone_ids: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub expected_end_at: Option<DateTime<Utc>>,
}

/// Flow drawn by one zone of one active run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneFlow {
    pub zone_id: String,
    pub run_id: String,
    pub flow_rate_l_per_min: f64,
    pub expected_end_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRateSnapshot {
    pub site_id: String,
    pub current_flow: f64,
    pub max_flow: f64,
    pub effective_max_flow: f64,
    pub active_zone_flows: Vec<ZoneFlow>,
}

impl FlowRateSnapshot {
    /// Snapshot for a site with no flow settings: nothing counted, nothing limited.
    pub fn unlimited(site_id: impl Into<String>) -> Self {
        Self {
            site_id: site_id.into(),
            current_flow: 0.0,
            max_flow: f64::INFINITY,
            effective_max_flow: f64::INFINITY,
            active_zone_flows: Vec::new(),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.effective_max_flow.is_infinite()
    }

    pub fn available_flow(&self) -> f64 {
        (self.effective_max_flow - self.current_flow).max(0.0)
    }
}

/// Capacity verdict for a candidate set of zones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowCheck {
    pub allowed: bool,
    pub current_flow: f64,
    pub projected_flow: f64,
    pub effective_max: f64,
    /// Litres per minute over budget when not allowed.
    pub excess: Option<f64>,
    /// When enough capacity is expected to be free.
    pub estimated_available_at: Option<DateTime<Utc>>,
}

impl FlowCheck {
    pub fn permissive(projected_flow: f64) -> Self {
        Self {
            allowed: true,
            current_flow: 0.0,
            projected_flow,
            effective_max: f64::INFINITY,
            excess: None,
            estimated_available_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_total_flow_is_emitters_times_rate() {
        let zone = ZoneFlowProfile::new("z1", 40, 0.5);
        assert!((zone.total_flow_rate_l_per_min() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn effective_max_applies_margin() {
        let settings = SiteFlowSettings::new("s1", 100.0).with_safety_margin(0.8);
        assert!((settings.effective_max_flow_rate_l_per_min() - 80.0).abs() < 1e-9);
    }

    #[test]
    fn effective_max_never_exceeds_system_max() {
        let settings = SiteFlowSettings::new("s1", 100.0).with_safety_margin(1.5);
        assert!((settings.effective_max_flow_rate_l_per_min() - 100.0).abs() < 1e-9);

        let settings = SiteFlowSettings::new("s1", 100.0).with_safety_margin(-2.0);
        assert!((settings.effective_max_flow_rate_l_per_min() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn unlimited_snapshot_has_full_headroom() {
        let snapshot = FlowRateSnapshot::unlimited("s1");
        assert!(snapshot.is_unlimited());
        assert_eq!(snapshot.current_flow, 0.0);
        assert!(snapshot.available_flow().is_infinite());
    }

    #[test]
    fn settings_defaults_from_yaml() {
        let settings: SiteFlowSettings =
            serde_yaml::from_str("site_id: s1\nmax_system_flow_rate_l_per_min: 60\n").unwrap();
        assert!(settings.enable_flow_rate_queuing);
        assert!(settings.enable_smart_suggestions);
        assert_eq!(settings.suggestion_threshold_count, 5);
        assert_eq!(settings.safety_margin, None);
    }
}

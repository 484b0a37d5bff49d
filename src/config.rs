use crate::error::{FlowGateError, Result};
use crate::logic::flow_ledger::DEFAULT_STALE_RUN_GRACE_MINUTES;
use crate::models::{SiteFlowSettings, ZoneFlowProfile};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub interlocks: InterlockThresholds,
    pub telemetry: Option<TelemetryConfig>,
    pub orchestrator: Option<OrchestratorConfig>,
    #[serde(default)]
    pub sites: Vec<SiteConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_reconcile_timeout")]
    pub reconcile_timeout_secs: u64,
    /// Wait estimate used when no active run has a known end time.
    #[serde(default = "default_fallback_wait")]
    pub fallback_wait_minutes: i64,
    /// Minimum spacing between expected execution times of queued events.
    #[serde(default = "default_collision_spacing")]
    pub collision_spacing_minutes: i64,
    /// A run this long past its expected end with no end reported stops
    /// holding flow.
    #[serde(default = "default_stale_run_grace")]
    pub stale_run_grace_minutes: i64,
}

fn default_reconcile_interval() -> u64 {
    20
}

fn default_reconcile_timeout() -> u64 {
    10
}

fn default_fallback_wait() -> i64 {
    5
}

fn default_collision_spacing() -> i64 {
    2
}

fn default_stale_run_grace() -> i64 {
    DEFAULT_STALE_RUN_GRACE_MINUTES
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_reconcile_interval(),
            reconcile_timeout_secs: default_reconcile_timeout(),
            fallback_wait_minutes: default_fallback_wait(),
            collision_spacing_minutes: default_collision_spacing(),
            stale_run_grace_minutes: default_stale_run_grace(),
        }
    }
}

pub const DEFAULT_TANK_LEVEL_MIN_PERCENT: f64 = 10.0;
pub const DEFAULT_TANK_LEVEL_WARN_PERCENT: f64 = 20.0;
pub const DEFAULT_EC_MIN: f64 = 0.5;
pub const DEFAULT_EC_MAX: f64 = 3.5;
pub const DEFAULT_PH_MIN: f64 = 5.0;
pub const DEFAULT_PH_MAX: f64 = 7.0;
pub const DEFAULT_TELEMETRY_MAX_AGE_MINUTES: i64 = 5;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct InterlockThresholds {
    pub tank_level_min_percent: f64,
    pub tank_level_warn_percent: f64,
    pub ec_min: f64,
    pub ec_max: f64,
    pub ph_min: f64,
    pub ph_max: f64,
    pub telemetry_max_age_minutes: i64,
}

impl Default for InterlockThresholds {
    fn default() -> Self {
        Self {
            tank_level_min_percent: DEFAULT_TANK_LEVEL_MIN_PERCENT,
            tank_level_warn_percent: DEFAULT_TANK_LEVEL_WARN_PERCENT,
            ec_min: DEFAULT_EC_MIN,
            ec_max: DEFAULT_EC_MAX,
            ph_min: DEFAULT_PH_MIN,
            ph_max: DEFAULT_PH_MAX,
            telemetry_max_age_minutes: DEFAULT_TELEMETRY_MAX_AGE_MINUTES,
        }
    }
}

#[derive(Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    pub url: String,
    #[serde(default)]
    pub token: String,
}

impl std::fmt::Debug for TelemetryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryConfig")
            .field("url", &self.url)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Clone, Deserialize, Serialize)]
pub struct OrchestratorConfig {
    pub url: String,
    #[serde(default)]
    pub token: String,
}

impl std::fmt::Debug for OrchestratorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorConfig")
            .field("url", &self.url)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SiteConfig {
    pub id: String,
    /// Flow budget. `site_id` is taken from `id` and may be left out.
    pub flow: Option<SiteFlowSettings>,
    #[serde(default)]
    pub zones: Vec<ZoneConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ZoneConfig {
    pub id: String,
    pub emitter_count: u32,
    pub emitter_flow_rate_l_per_min: f64,
}

impl SiteConfig {
    pub fn flow_settings(&self) -> Option<SiteFlowSettings> {
        self.flow.as_ref().map(|flow| SiteFlowSettings {
            site_id: self.id.clone(),
            ..flow.clone()
        })
    }

    pub fn zone_profiles(&self) -> Vec<ZoneFlowProfile> {
        self.zones
            .iter()
            .map(|z| ZoneFlowProfile::new(z.id.clone(), z.emitter_count, z.emitter_flow_rate_l_per_min))
            .collect()
    }
}

impl Config {
    pub fn load(config_override: Option<PathBuf>) -> Result<Self> {
        let config_path = match config_override {
            Some(p) => p,
            None => Self::find_config_path()?,
        };

        if !config_path.exists() {
            return Err(FlowGateError::Config(format!(
                "Config file not found at {:?}",
                config_path
            )));
        }

        let config_str = std::fs::read_to_string(&config_path)
            .map_err(|e| FlowGateError::Config(format!("Failed to read config: {}", e)))?;

        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        // Substitute environment variables
        let content = Self::substitute_env_vars(content)?;

        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| FlowGateError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let t = &self.interlocks;
        if t.tank_level_min_percent > t.tank_level_warn_percent {
            return Err(FlowGateError::Config(
                "interlocks.tank_level_min_percent must not exceed tank_level_warn_percent".into(),
            ));
        }
        if t.ec_min >= t.ec_max || t.ph_min >= t.ph_max {
            return Err(FlowGateError::Config(
                "interlock EC/pH bounds must have min < max".into(),
            ));
        }
        for site in &self.sites {
            if let Some(flow) = &site.flow {
                if flow.max_system_flow_rate_l_per_min <= 0.0 {
                    return Err(FlowGateError::Config(format!(
                        "site {} has non-positive max_system_flow_rate_l_per_min",
                        site.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Search for config.yaml in standard locations.
    /// Returns the path of the first found config, or the XDG default path if none found.
    fn find_config_path() -> Result<PathBuf> {
        let local_config = PathBuf::from("config/config.yaml");
        if local_config.exists() {
            return Ok(local_config);
        }

        let default_path = dirs::config_dir()
            .ok_or_else(|| FlowGateError::Config("Cannot determine config directory".into()))?
            .join("flowgate")
            .join("config.yaml");
        Ok(default_path)
    }

    fn substitute_env_vars(content: &str) -> Result<String> {
        let mut result = content.to_string();

        let re = regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")
            .map_err(|e| FlowGateError::Config(format!("Invalid substitution pattern: {}", e)))?;

        for cap in re.captures_iter(content) {
            let var_name = &cap[1];
            let placeholder = &cap[0];
            if let Ok(value) = std::env::var(var_name) {
                result = result.replace(placeholder, &value);
            }
        }

        Ok(result)
    }

    pub fn site(&self, site_id: &str) -> Option<&SiteConfig> {
        self.sites.iter().find(|s| s.id == site_id)
    }

    pub fn data_dir(data_dir_override: Option<&PathBuf>) -> Result<PathBuf> {
        // CLI override takes priority
        if let Some(dir) = data_dir_override {
            std::fs::create_dir_all(dir)?;
            return Ok(dir.clone());
        }

        if let Ok(dir) = std::env::var("FLOWGATE_DATA_DIR") {
            let p = PathBuf::from(dir);
            std::fs::create_dir_all(&p)?;
            return Ok(p);
        }

        let data_dir = dirs::data_dir()
            .ok_or_else(|| FlowGateError::Config("Cannot determine data directory".into()))?
            .join("flowgate");

        std::fs::create_dir_all(&data_dir)?;
        Ok(data_dir)
    }

    pub fn db_path(data_dir_override: Option<&PathBuf>) -> Result<PathBuf> {
        Ok(Self::data_dir(data_dir_override)?.join("flowgate.db"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
engine:
  reconcile_interval_secs: 15
interlocks:
  ec_max: 3.0
telemetry:
  url: http://telemetry.local
  token: secret
sites:
  - id: greenhouse-a
    flow:
      max_system_flow_rate_l_per_min: 120
      safety_margin: 0.9
    zones:
      - id: bench-1
        emitter_count: 48
        emitter_flow_rate_l_per_min: 0.5
"#;

    #[test]
    fn parses_sites_and_defaults() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.engine.reconcile_interval_secs, 15);
        assert_eq!(config.engine.fallback_wait_minutes, 5);
        assert_eq!(config.engine.collision_spacing_minutes, 2);
        assert_eq!(config.engine.stale_run_grace_minutes, 30);
        assert_eq!(config.interlocks.ec_max, 3.0);
        assert_eq!(config.interlocks.ec_min, DEFAULT_EC_MIN);

        let site = config.site("greenhouse-a").unwrap();
        let settings = site.flow_settings().unwrap();
        assert!((settings.effective_max_flow_rate_l_per_min() - 108.0).abs() < 1e-9);
        assert!(settings.enable_flow_rate_queuing);

        let zones = site.zone_profiles();
        assert_eq!(zones.len(), 1);
        assert!((zones[0].total_flow_rate_l_per_min() - 24.0).abs() < 1e-9);
    }

    #[test]
    fn omitted_flow_fields_match_settings_defaults() {
        let yaml = "sites:\n  - id: bay-2\n    flow:\n      max_system_flow_rate_l_per_min: 80\n";
        let config = Config::from_yaml(yaml).unwrap();
        let settings = config.site("bay-2").unwrap().flow_settings().unwrap();
        assert_eq!(settings, SiteFlowSettings::new("bay-2", 80.0));
    }

    #[test]
    fn token_is_redacted_in_debug() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        let debug = format!("{:?}", config.telemetry.unwrap());
        assert!(!debug.contains("secret"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn rejects_inverted_bounds() {
        let yaml = "interlocks:\n  ph_min: 7.5\n  ph_max: 6.0\n";
        assert!(matches!(
            Config::from_yaml(yaml),
            Err(FlowGateError::Config(_))
        ));
    }

    #[test]
    fn substitutes_environment_variables() {
        std::env::set_var("FLOWGATE_TEST_TOKEN", "from-env");
        let yaml = "orchestrator:\n  url: http://orch\n  token: ${FLOWGATE_TEST_TOKEN}\n";
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.orchestrator.unwrap().token, "from-env");
    }
}

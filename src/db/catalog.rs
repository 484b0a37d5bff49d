use crate::config::Config;
use crate::error::Result;
use crate::models::{SiteFlowSettings, ZoneFlowProfile};
use crate::repository::{IrrigationSettingsRepository, ZoneEmitterRepository};
use async_trait::async_trait;
use std::collections::HashMap;

/// Read-only zone and site configuration loaded from the config file.
#[derive(Debug, Clone, Default)]
pub struct SiteCatalog {
    zones: HashMap<String, ZoneFlowProfile>,
    settings: HashMap<String, SiteFlowSettings>,
}

impl SiteCatalog {
    pub fn from_config(config: &Config) -> Self {
        let mut catalog = Self::default();
        for site in &config.sites {
            if let Some(settings) = site.flow_settings() {
                catalog.settings.insert(site.id.clone(), settings);
            }
            for zone in site.zone_profiles() {
                if catalog.zones.contains_key(&zone.zone_id) {
                    tracing::warn!(
                        zone_id = %zone.zone_id,
                        site_id = %site.id,
                        "Duplicate zone id in config, later definition wins"
                    );
                }
                catalog.zones.insert(zone.zone_id.clone(), zone);
            }
        }
        catalog
    }

    pub fn site_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.settings.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl ZoneEmitterRepository for SiteCatalog {
    async fn get_by_zone_id(&self, zone_id: &str) -> Result<Option<ZoneFlowProfile>> {
        Ok(self.zones.get(zone_id).cloned())
    }
}

#[async_trait]
impl IrrigationSettingsRepository for SiteCatalog {
    async fn get_by_site_id(&self, site_id: &str) -> Result<Option<SiteFlowSettings>> {
        Ok(self.settings.get(site_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn catalog_serves_configured_sites() {
        let config = Config::from_yaml(
            r#"
sites:
  - id: north
    flow:
      max_system_flow_rate_l_per_min: 80
    zones:
      - id: n1
        emitter_count: 10
        emitter_flow_rate_l_per_min: 2.0
  - id: south
    zones:
      - id: s1
        emitter_count: 4
        emitter_flow_rate_l_per_min: 1.0
"#,
        )
        .unwrap();
        let catalog = SiteCatalog::from_config(&config);

        let zone = catalog.get_by_zone_id("n1").await.unwrap().unwrap();
        assert!((zone.total_flow_rate_l_per_min() - 20.0).abs() < 1e-9);
        assert!(catalog.get_by_zone_id("missing").await.unwrap().is_none());

        assert!(catalog.get_by_site_id("north").await.unwrap().is_some());
        // No flow section means no settings, which the ledger treats as unlimited
        assert!(catalog.get_by_site_id("south").await.unwrap().is_none());
        assert_eq!(catalog.site_ids(), vec!["north".to_string()]);
    }
}

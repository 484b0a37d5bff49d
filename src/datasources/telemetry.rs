use crate::config::TelemetryConfig;
use crate::error::{FlowGateError, Result};
use crate::models::TelemetryReading;
use crate::repository::TelemetryQueryService;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

/// Reads live sensor values from the site telemetry service.
#[derive(Clone)]
pub struct HttpTelemetryClient {
    client: reqwest::Client,
    config: TelemetryConfig,
}

#[derive(Debug, Deserialize)]
struct StreamValue {
    value: f64,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct LastReading {
    timestamp: Option<DateTime<Utc>>,
}

impl HttpTelemetryClient {
    pub fn new(config: TelemetryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { client, config })
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<Option<T>> {
        let url = format!("{}{}", self.config.url.trim_end_matches('/'), path);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.config.token)
            .send()
            .await
            .map_err(|e| FlowGateError::DataSourceUnavailable(format!("Telemetry: {}", e)))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !response.status().is_success() {
            return Err(FlowGateError::DataSourceUnavailable(format!(
                "Telemetry returned {}",
                response.status()
            )));
        }

        let body = response.json::<T>().await.map_err(|e| {
            FlowGateError::DataSourceUnavailable(format!(
                "Failed to parse telemetry response: {}",
                e
            ))
        })?;

        Ok(Some(body))
    }

    pub async fn test_connection(&self) -> Result<bool> {
        let url = format!("{}/api/health", self.config.url.trim_end_matches('/'));

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.config.token)
            .send()
            .await
            .map_err(|e| FlowGateError::DataSourceUnavailable(format!("Telemetry: {}", e)))?;

        Ok(response.status().is_success())
    }
}

#[async_trait]
impl TelemetryQueryService for HttpTelemetryClient {
    async fn get_latest_value(
        &self,
        site_id: &str,
        stream_key: &str,
    ) -> Result<Option<TelemetryReading>> {
        let path = format!("/api/sites/{}/streams/{}/latest", site_id, stream_key);
        let value: Option<StreamValue> = self.get_json(&path).await?;
        Ok(value.map(|v| TelemetryReading::new(v.value, v.timestamp)))
    }

    async fn get_last_reading_time(&self, site_id: &str) -> Result<Option<DateTime<Utc>>> {
        let path = format!("/api/sites/{}/last-reading", site_id);
        let last: Option<LastReading> = self.get_json(&path).await?;
        Ok(last.and_then(|l| l.timestamp))
    }
}

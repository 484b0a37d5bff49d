use crate::config::OrchestratorConfig;
use crate::error::{FlowGateError, Result};
use crate::repository::IrrigationOrchestrator;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Asks the valve orchestrator to start irrigation programs.
pub struct HttpOrchestratorClient {
    client: reqwest::Client,
    config: OrchestratorConfig,
}

#[derive(Debug, Serialize)]
struct StartRunRequest<'a> {
    program_id: &'a str,
    schedule_id: Option<&'a str>,
    triggered_by: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct StartRunResponse {
    run_id: String,
}

impl HttpOrchestratorClient {
    pub fn new(config: OrchestratorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl IrrigationOrchestrator for HttpOrchestratorClient {
    async fn start_run(
        &self,
        program_id: &str,
        schedule_id: Option<&str>,
        triggered_by: Option<&str>,
    ) -> Result<String> {
        let url = format!("{}/api/runs", self.config.url.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.token)
            .json(&StartRunRequest {
                program_id,
                schedule_id,
                triggered_by,
            })
            .send()
            .await
            .map_err(|e| FlowGateError::Downstream(format!("Orchestrator: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(FlowGateError::Downstream(format!(
                "Orchestrator returned {}: {}",
                status, body
            )));
        }

        let started: StartRunResponse = response.json().await.map_err(|e| {
            FlowGateError::Downstream(format!("Failed to parse orchestrator response: {}", e))
        })?;

        tracing::debug!(program_id, run_id = %started.run_id, "Orchestrator started run");
        Ok(started.run_id)
    }
}

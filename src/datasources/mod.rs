pub mod orchestrator;
pub mod telemetry;

pub use orchestrator::HttpOrchestratorClient;
pub use telemetry::HttpTelemetryClient;

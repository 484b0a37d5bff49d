use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowGateError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Data source unavailable: {0}")]
    DataSourceUnavailable(String),

    #[error("Orchestrator failure: {0}")]
    Downstream(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, FlowGateError>;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("MQTT error: {0}")]
    Mqtt(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Rejections of an inbound configuration payload. None of these are fatal;
/// the current flow rate is kept when one is returned.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("empty payload")]
    Empty,
    #[error("payload is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("payload has no gpm field")]
    MissingFlowRate,
    #[error("gpm is not numeric: {0}")]
    NonNumericFlowRate(String),
}

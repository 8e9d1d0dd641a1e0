/// Centralized error types for the market data pipeline
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    // Transport Errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Feed disconnected: {0}")]
    Disconnected(String),

    // Data Errors
    #[error("Malformed payload: {0}")]
    Parse(String),

    #[error("Tick validation failed: {0}")]
    Validation(String),

    #[error("Deserialization failed: {0}")]
    Deserialization(#[from] serde_json::Error),

    // Storage Errors
    #[error("Persistence failed: {0}")]
    Persistence(String),

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Alerting Errors
    #[error("Rule '{rule}' evaluation failed: {reason}")]
    RuleEvaluation { rule: String, reason: String },

    #[error("Rule not found: {0}")]
    RuleNotFound(String),

    #[error("Alert not found: {0}")]
    AlertNotFound(String),

    // Configuration Errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, FlowError>;

impl FlowError {
    /// Errors the pipeline logs and moves past without stopping anything
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FlowError::Transport(_)
                | FlowError::Disconnected(_)
                | FlowError::Parse(_)
                | FlowError::Validation(_)
                | FlowError::Deserialization(_)
                | FlowError::Persistence(_)
                | FlowError::RuleEvaluation { .. }
        )
    }

    /// Get error code for logging/monitoring
    pub fn error_code(&self) -> &str {
        match self {
            FlowError::Transport(_) => "NET_001",
            FlowError::Disconnected(_) => "NET_002",
            FlowError::Parse(_) => "DATA_001",
            FlowError::Validation(_) => "DATA_002",
            FlowError::Deserialization(_) => "DATA_003",
            FlowError::Persistence(_) => "STORE_001",
            FlowError::Io(_) => "STORE_002",
            FlowError::RuleEvaluation { .. } => "RULE_001",
            FlowError::RuleNotFound(_) => "RULE_002",
            FlowError::AlertNotFound(_) => "ALERT_001",
            FlowError::Config(_) => "CFG_001",
            FlowError::InvalidParameter(_) => "CFG_002",
            FlowError::Internal(_) => "INT_001",
        }
    }
}

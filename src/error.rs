use thiserror::Error;

/// Convenience type alias for Results with GatewayError
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Main error type for the Agent Gateway
///
/// This enum represents all possible errors that can occur within
/// the gateway runtime, providing detailed error context for
/// debugging and error handling.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Runner HTTP error: {0}")]
    RunnerHttp(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Runner error: {message}")]
    Runner { message: String },

    #[error("Task execution error: {task_id} - {message}")]
    TaskExecution { task_id: String, message: String },

    #[error("Memory store error: {message}")]
    Storage { message: String },

    #[error("Memory error: {message}")]
    Memory { message: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Timeout error: {message}")]
    Timeout { message: String },

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<rusqlite::Error> for GatewayError {
    fn from(e: rusqlite::Error) -> Self {
        GatewayError::Storage {
            message: e.to_string(),
        }
    }
}

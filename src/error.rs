//! Error types for labrune

use thiserror::Error;

/// Result type for labrune operations
pub type Result<T> = std::result::Result<T, LabError>;

/// labrune error types
#[derive(Error, Debug)]
pub enum LabError {
    #[error("Container runtime not available")]
    RuntimeUnavailable,

    #[error("Lab not found: {0}")]
    LabNotFound(i64),

    #[error("User not found: {0}")]
    UserNotFound(i64),

    #[error("Lab instance not found: {0}")]
    InstanceNotFound(i64),

    #[error("Failed to create lab instance: {0}")]
    InstanceCreationFailed(String),

    #[error("Failed to tear down container {container}: {message}")]
    TeardownFailed { container: String, message: String },

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("SQLite error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("Compose definition error: {0}")]
    Compose(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Lock error: {0}")]
    Lock(String),
}

impl LabError {
    /// Whether the error names a missing lab, user or instance
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            LabError::LabNotFound(_) | LabError::UserNotFound(_) | LabError::InstanceNotFound(_)
        )
    }

    /// Whether a caller may reasonably retry the operation later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LabError::RuntimeUnavailable | LabError::InstanceCreationFailed(_)
        )
    }
}

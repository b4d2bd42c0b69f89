use thiserror::Error;

/// Main error type for the Warden supervisor
#[derive(Debug, Error)]
pub enum WardenError {
    // Process lifecycle errors
    #[error("Failed to launch process {0}: {1}")]
    Launch(String, String),

    #[error("Process {0} could not be confirmed dead after SIGKILL")]
    ForceKill(String),

    #[error("Failed to stop process {0}: {1}")]
    StopError(String, String),

    #[error("Process not found: {0}")]
    NotFound(String),

    #[error("Process already exists: {0}")]
    DuplicateName(String),

    #[error("Process {0} is in invalid state for this operation: {1}")]
    InvalidState(String, String),

    #[error("Supervisor is shutting down")]
    ShuttingDown,

    #[error("Process monitor is not running")]
    MonitorDown,

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid configuration file: {0}")]
    InvalidConfig(String),

    #[error("Missing required configuration field: {0}")]
    MissingConfigField(String),

    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    #[error("Signal error: {0}")]
    SignalError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WardenError {
    /// True for failures that leave an OS process in an unknown state
    pub fn is_leak(&self) -> bool {
        matches!(self, WardenError::ForceKill(_))
    }
}

/// Result type alias for Warden operations
pub type Result<T> = std::result::Result<T, WardenError>;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, KeelError>;

#[derive(Error, Debug)]
pub enum KeelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Range not satisfiable: {0}")]
    InvalidRange(String),

    #[error("Insufficient replicas: need {required}, found {found}")]
    InsufficientReplicas { required: usize, found: usize },

    #[error("Peer unavailable: {0}")]
    Unavailable(String),

    #[error("Content hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Update conflict on {key} after {attempts} attempts")]
    Conflict { key: String, attempts: usize },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl KeelError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, KeelError::NotFound(_))
    }

    /// Errors that a later periodic cycle may succeed on.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KeelError::Unavailable(_)
                | KeelError::Timeout(_)
                | KeelError::Conflict { .. }
                | KeelError::Http(_)
                | KeelError::HashMismatch { .. }
                | KeelError::NotFound(_)
        )
    }
}

impl From<reqwest::Error> for KeelError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            KeelError::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() {
            KeelError::Unavailable(err.to_string())
        } else {
            KeelError::Http(err.to_string())
        }
    }
}

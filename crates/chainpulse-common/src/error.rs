use thiserror::Error;

#[derive(Error, Debug)]
pub enum PulseError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Malformed data: {0}")]
    Malformed(String),

    #[error("Temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PulseError {
    pub fn status_code(&self) -> u16 {
        match self {
            PulseError::NotFound(_) => 404,
            PulseError::InvalidInput(_) => 400,
            PulseError::Unavailable(_) => 503,
            PulseError::Rpc(_) | PulseError::Malformed(_) => 502,
            PulseError::Database(_) | PulseError::Internal(_) | PulseError::Config(_) => 500,
        }
    }
}

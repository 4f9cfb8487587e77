use chainpulse_common::PulseError;
use thiserror::Error;

/// Errors returned by a chain client.
#[derive(Debug, Error)]
pub enum ChainError {
    /// The node answered `null`: the entity does not exist (yet).
    #[error("not found: {0}")]
    NotFound(String),

    /// Timeout, connection failure, or an overloaded node. Retried by the client.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("RPC retries exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    /// JSON-RPC error object returned by the node.
    #[error("node returned error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ChainError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ChainError::NotFound(_))
    }
}

impl From<ChainError> for PulseError {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::NotFound(what) => PulseError::NotFound(what),
            ChainError::Transport(_) | ChainError::RetryExhausted { .. } => {
                PulseError::Unavailable(err.to_string())
            }
            ChainError::Rpc { .. } => PulseError::Rpc(err.to_string()),
            ChainError::Malformed(msg) => PulseError::Malformed(msg),
        }
    }
}

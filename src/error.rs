use thiserror::Error;

use crate::session::CallStatus;

/// Hard ceiling on an encoded push payload, in bytes. This is the minimum
/// payload size guaranteed across push delivery providers.
pub const MAX_PUSH_PAYLOAD_BYTES: usize = 4078;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("invalid request: {0}")]
    Validation(&'static str),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("cannot call yourself")]
    InvalidSelfCall,

    /// The state machine rejected the requested move. Benign under races:
    /// the call was already resolved by a competing transition.
    #[error("call {call_id} is already {status}")]
    InvalidTransition { call_id: String, status: CallStatus },

    #[error("call {0} has expired")]
    Expired(String),

    #[error("payload is {size} bytes, push channel ceiling is {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl SignalError {
    pub fn too_large(size: usize) -> Self {
        SignalError::TooLarge {
            size,
            limit: MAX_PUSH_PAYLOAD_BYTES,
        }
    }
}

use std::time::Duration;

use thiserror::Error;

use crate::{crypto::CryptoError, message::MessageError};

/// Crate level error, wrapping the per-module error types.
#[derive(Debug, Error)]
pub enum StaticAgentError {
    #[error("{0}")]
    Configuration(String),

    #[error("cannot deliver message: {message}")]
    Delivery {
        status: Option<u16>,
        message: String,
    },

    #[error("insufficient message trust: {0}")]
    InsufficientTrust(String),

    #[error("response received when no response was expected")]
    UnexpectedResponse,

    #[error("timed out after {0:?} waiting for a message")]
    Timeout(Duration),

    #[error("no handler registered for message type `{0}`")]
    NoRegisteredRoute(String),

    #[error("held message queue is closed")]
    HeldQueueClosed,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("error serializing message envelope")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to build blocking runtime")]
    Runtime(#[source] std::io::Error),
}

impl StaticAgentError {
    /// Delivery failure without a transport status code.
    pub fn delivery(message: impl Into<String>) -> Self {
        StaticAgentError::Delivery {
            status: None,
            message: message.into(),
        }
    }
}

pub type StaticAgentResult<T> = Result<T, StaticAgentError>;

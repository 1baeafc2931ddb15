use crate::engine::EngineError;
use lectern_protocol::{ErrorCode, ServerMessage};
use thiserror::Error;

/// Caller-visible failure taxonomy. Lifecycle-state races (pause/resume/close
/// against an already-absent resource) are recovered locally and logged, and
/// never reach this type.
#[derive(Error, Debug)]
pub enum SignalError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("stale producer: {0}")]
    Stale(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("incompatible capabilities: {0}")]
    IncompatibleCapabilities(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl SignalError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SignalError::NotFound(_) => ErrorCode::NotFound,
            SignalError::Stale(_) => ErrorCode::Stale,
            SignalError::Conflict(_) => ErrorCode::Conflict,
            SignalError::IncompatibleCapabilities(_) => ErrorCode::IncompatibleCapabilities,
            SignalError::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
            SignalError::TransientNetwork(_) => ErrorCode::TransientNetwork,
            SignalError::Forbidden(_) => ErrorCode::Forbidden,
            SignalError::BadRequest(_) => ErrorCode::BadRequest,
            SignalError::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn to_message(&self) -> ServerMessage {
        let message = match self {
            SignalError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                "internal server error".to_string()
            }
            other => other.to_string(),
        };
        ServerMessage::Error {
            code: self.code(),
            message,
        }
    }
}

impl From<EngineError> for SignalError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::SsrcInUse(ssrc) => {
                SignalError::Conflict(format!("ssrc {} is still registered", ssrc))
            }
            EngineError::Negotiation(msg) => SignalError::TransientNetwork(msg),
            EngineError::WorkerDown => {
                SignalError::TransientNetwork("engine worker is down".to_string())
            }
            EngineError::Closed => SignalError::NotFound("engine resource is closed".to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SignalError>;

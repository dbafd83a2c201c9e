//! Bridge errors and their C status codes

use thiserror::Error;

use crate::bridge::handle::HandleKind;
use crate::inference::engine::EngineError;

/// Errors returned by bridge operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Invalid {kind} handle")]
    InvalidHandle { kind: HandleKind },

    #[error("No model loaded")]
    ModelNotLoaded,

    #[error("Model is already loaded")]
    AlreadyLoaded,

    #[error("Cursor is bound to a live sampler")]
    CursorInUse,

    #[error("Cursor does not belong to this sampler")]
    CursorMismatch,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Bridge call timed out after {0} ms")]
    Timeout(u64),

    #[error("Worker thread error: {0}")]
    Worker(String),
}

impl BridgeError {
    pub(crate) fn invalid_cursor() -> Self {
        BridgeError::InvalidHandle {
            kind: HandleKind::Cursor,
        }
    }

    pub(crate) fn invalid_sampler() -> Self {
        BridgeError::InvalidHandle {
            kind: HandleKind::Sampler,
        }
    }

    /// Stable negative status code reported across the C boundary
    pub fn code(&self) -> i32 {
        match self {
            BridgeError::Engine(e) => match e {
                EngineError::BackendInit(_) => -1,
                EngineError::LoadFailure(_) => -2,
                EngineError::ContextCreationFailure(_) => -3,
                EngineError::Tokenization(_) => -4,
                EngineError::PromptTooLong { .. } => -5,
                EngineError::ForwardPassFailure(_) => -6,
                EngineError::DecodeFailure(_) => -7,
            },
            BridgeError::InvalidHandle { .. } => -10,
            BridgeError::ModelNotLoaded => -11,
            BridgeError::AlreadyLoaded => -12,
            BridgeError::CursorInUse => -13,
            BridgeError::CursorMismatch => -14,
            BridgeError::InvalidArgument(_) => -15,
            BridgeError::Config(_) => -16,
            BridgeError::Timeout(_) => -17,
            BridgeError::Worker(_) => -18,
        }
    }
}

//! Error type shared by every module of the core crate.

use crate::engine::EngineState;

/// Result alias that carries [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;

/// Everything that can go wrong inside the engine.
///
/// A tick that finds no pitch is not an error and never shows up here.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The input device could not be opened: permission denied, no device,
    /// device busy or no usable stream format. Only `initialize` reports it.
    #[error("capture unavailable: {0}")]
    CaptureUnavailable(String),

    /// A key, scale or configuration value outside what the engine accepts.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A lifecycle operation called from a state that does not allow it.
    #[error("cannot {operation} while the engine is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: EngineState,
    },

    /// The backend failed to resume or suspend an already acquired stream.
    #[error("audio stream error: {0}")]
    Stream(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub(crate) fn capture<T: std::fmt::Display>(err: T) -> Self {
        Self::CaptureUnavailable(err.to_string())
    }

    pub(crate) fn config<T: Into<String>>(msg: T) -> Self {
        Self::InvalidConfiguration(msg.into())
    }
}

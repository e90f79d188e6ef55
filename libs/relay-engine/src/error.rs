use relay_api::error::ServiceError;

use crate::manager::ManagerState;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),

    #[error("source already registered: {0}")]
    DuplicateSource(String),

    #[error("transport consumer not started")]
    NotStarted,

    #[error("cannot {op} while manager is {state:?}")]
    InvalidState {
        op: &'static str,
        state: ManagerState,
    },

    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("transport error: {0}")]
    Transport(#[from] ServiceError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Add context to the error.
    ///
    /// For `Transport` variant, context is added to the inner `ServiceError`.
    /// For message variants, context is prepended to the message.
    pub fn with_context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            EngineError::Transport(e) => EngineError::Transport(e.with_context(ctx)),
            EngineError::Config(msg) => EngineError::Config(format!("{ctx}: {msg}")),
            EngineError::Bootstrap(msg) => EngineError::Bootstrap(format!("{ctx}: {msg}")),
            other => other,
        }
    }
}

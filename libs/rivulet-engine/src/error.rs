use rivulet_api::error::SourceError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),

    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("agent '{0}' is already registered")]
    DuplicateAgent(String),

    #[error("invalid app state: {0}")]
    AppState(String),
}

impl EngineError {
    /// Add context to the error.
    ///
    /// For the `Source` variant, context is added to the inner error.
    /// For message-carrying variants, context is prepended to the message.
    pub fn with_context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            EngineError::Source(e) => EngineError::Source(e.with_context(ctx)),
            EngineError::Config(msg) => EngineError::Config(format!("{ctx}: {msg}")),
            EngineError::AppState(msg) => EngineError::AppState(format!("{ctx}: {msg}")),
            other => other,
        }
    }
}

//! Error types for the conversation pipeline.

/// Top-level error type for the conversation orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum ConversationError {
    /// Transcriber start/restart failure.
    #[error("transcriber error: {0}")]
    Transcriber(String),

    /// Agent start or steady-state failure.
    #[error("agent error: {0}")]
    Agent(String),

    /// Synthesizer request failure (HTTP 5xx, timeout, malformed response).
    #[error("synthesizer error: {0}")]
    Synthesizer(String),

    /// Output device error.
    #[error("output device error: {0}")]
    OutputDevice(String),

    /// Token → sentence collation error.
    #[error("collator error: {0}")]
    Collator(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// An invariant the pipeline depends on was violated; fatal to the conversation.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, ConversationError>;

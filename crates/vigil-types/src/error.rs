//! Error types shared across all vigil crates.

/// Errors that can occur across the vigil runtime.
///
/// Each variant corresponds to a different subsystem: configuration, the raw
/// terminal channel, injection strategies, the process locator, the decision
/// oracle, pseudo-terminal management, or a session actor that has shut down.
#[derive(Debug, thiserror::Error)]
pub enum VigilError {
    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("terminal channel error: {0}")]
    TerminalError(String),

    #[error("delivery error: {0}")]
    DeliveryError(String),

    #[error("process locator error: {0}")]
    LocatorError(String),

    #[error("decision oracle error: {0}")]
    OracleError(String),

    #[error("pty error: {0}")]
    PtyError(String),

    #[error("session {0} is no longer running")]
    SessionClosed(String),
}

use thiserror::Error;

/// Failures surfaced by context factories, the connection runtime, and page
/// handles.
#[derive(Clone, Debug, Error)]
pub enum ContextError {
    #[error("chrome executable not found; set PROMPTBRIDGE_CHROME to the full path of chrome/chromium")]
    ChromeNotFound,
    #[error("failed to launch browser: {0}")]
    Launch(String),
    #[error("cdp i/o failure: {0}")]
    CdpIo(String),
    #[error("command timed out: {0}")]
    CommandTimeout(String),
    #[error("navigation failed: {0}")]
    NavigationFailed(String),
    #[error("browser context closed")]
    ContextClosed,
    #[error("relay failure: {0}")]
    Relay(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ContextError {
    /// Whether this failure means the underlying context is gone, so a caller
    /// holding state derived from it should discard that state and
    /// re-initialize rather than retry the same operation.
    pub fn is_context_closed(&self) -> bool {
        matches!(self, ContextError::ContextClosed)
    }
}

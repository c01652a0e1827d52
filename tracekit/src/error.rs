use std::time::Duration;
use thiserror::Error;

/// Result type used by trace operations that can fail.
pub type TraceResult<T> = Result<T, TraceError>;

/// Errors returned by the tracing pipeline.
///
/// These never reach span-owning application code through `Span::end`;
/// they surface only from the explicit `force_flush`/`shutdown` barriers
/// and from exporter construction.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TraceError {
    /// Export failed with the wrapped transport or backend error.
    #[error("exporter error: {0}")]
    ExportFailed(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    /// Export or flush did not complete within the allowed time.
    ///
    /// A flush that ends this way is partial: spans accepted before the
    /// call may not have been handed to the transport yet.
    #[error("export timed out after {0:?}")]
    ExportTimedOut(Duration),

    /// The processor or exporter was already shut down.
    #[error("already shut down")]
    AlreadyShutdown,

    /// Invalid configuration detected while constructing a component.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Other types of failures not covered by the variants above.
    #[error("{0}")]
    Other(String),
}

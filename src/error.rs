//! Crate-level error types.
//!
//! [`KlaxonError`] unifies every error source (configuration, WebSocket,
//! HTTP, storage, JSON) behind a single enum so callers can match on the
//! variant they care about while still using the `?` operator for easy
//! propagation.

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, KlaxonError>;

/// Top-level error type returned by all public APIs.
#[derive(Debug, thiserror::Error)]
pub enum KlaxonError {
    /// A configuration value is missing or could not be parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// TLS configuration could not be built.
    #[error("tls error: {0}")]
    Tls(String),

    /// A WebSocket operation (connect, send, receive) failed.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// The market-data endpoint rejected the stream names themselves.
    #[error("invalid stream set: {0}")]
    InvalidStream(String),

    /// An HTTP request failed.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A message did not have the expected shape.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The fee oracle returned an unusable answer.
    #[error("fee oracle error: {0}")]
    Oracle(String),

    /// The storage collaborator failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A component was used outside of its lifecycle (e.g. started twice).
    #[error("lifecycle error: {0}")]
    Lifecycle(String),
}

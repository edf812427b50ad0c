//! Upstream link error types.

/// Errors that end one upstream connection. All of them lead to a reconnect.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("Invalid upstream URL: {0}")]
    InvalidUrl(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Connection closed by upstream")]
    Closed,
}

//! Client-visible failure taxonomy.
//!
//! The kind is the authoritative discriminator; numeric codes only appear
//! inside [`ClientError::Remote`], relayed verbatim from the response
//! envelope.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Operation attempted while the transport is not Connected.
    #[error("not connected to broker")]
    NotConnected,

    /// Local envelope encode/decode failure.
    #[error("envelope error: {0}")]
    Encode(#[from] yardproto::DecodeError),

    /// The transport refused the publish.
    #[error("publish failed: {0}")]
    Publish(String),

    /// Subscribe could not be issued or was rejected.
    #[error("subscribe failed: {0}")]
    Subscribe(String),

    /// The pending request expired. Distinct from a remote rejection.
    #[error("request timed out")]
    Timeout,

    /// The response envelope reported failure; code and message are
    /// relayed verbatim.
    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },

    /// Invalid configuration. Fatal at startup.
    #[error(transparent)]
    Config(#[from] yardconf::ConfigError),

    /// TLS material could not be loaded or assembled.
    #[error("tls setup failed: {0}")]
    Tls(String),

    /// The session's I/O loop was started twice.
    #[error("session already started")]
    AlreadyStarted,

    /// The background task serving this call has gone away.
    #[error("runtime internal error: {0}")]
    Internal(String),
}

//! Typed error surfaces for the synchronization layer.
//!
//! Three enums cover the three places a consumer can observe a failure:
//! - [`ConnectionErrorKind`] - push-channel lifecycle failures
//! - [`FrameError`] - inbound frames rejected at the parse boundary
//! - [`MutationError`] - optimistic mutations that were rolled back
//!
//! Plumbing (transport, config, CLI) keeps using `anyhow`.

// Rust guideline compliant 2026-02

use thiserror::Error;

/// Why the push channel is not (or no longer) connected.
///
/// Stored as the manager's `connection_error`; never thrown across an
/// async boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionErrorKind {
    /// No bearer credential is available, so no attempt was made.
    #[error("no credential available for the push channel")]
    MissingCredential,

    /// The configured service URL could not be turned into a push-channel URL.
    #[error("invalid push channel URL: {0}")]
    InvalidUrl(String),

    /// The server rejected the credential (handshake 401/403 or close 4001).
    #[error("push channel rejected the credential")]
    Unauthorized,

    /// The WebSocket handshake or socket I/O failed.
    #[error("push channel transport error: {0}")]
    Transport(String),

    /// The server closed the channel unexpectedly.
    #[error("push channel closed unexpectedly (code {code}): {reason}")]
    ClosedUnexpectedly {
        /// WebSocket close code.
        code: u16,
        /// Close reason sent by the peer, possibly empty.
        reason: String,
    },
}

impl ConnectionErrorKind {
    /// Whether retrying without outside intervention (new credential or
    /// corrected configuration) is pointless.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::MissingCredential | Self::Unauthorized | Self::InvalidUrl(_)
        )
    }
}

/// Inbound frame rejected by the decoder.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The frame is not valid JSON or lacks the `type` tag.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The tag is known but its `data` does not match the tag's schema.
    #[error("invalid payload for '{event_type}': {source}")]
    InvalidPayload {
        /// The event tag whose schema failed.
        event_type: String,
        /// Underlying decode failure.
        #[source]
        source: serde_json::Error,
    },
}

/// Why an optimistic mutation was rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MutationError {
    /// The remote call did not finish within the configured timeout.
    #[error("remote call timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The server answered with a non-2xx status.
    #[error("server rejected the mutation with status {status}")]
    Rejected {
        /// HTTP status code.
        status: u16,
    },

    /// The request never produced a response (DNS, connect, reset).
    #[error("network error: {0}")]
    Network(String),

    /// The entity is not on the board, so there is nothing to mutate.
    #[error("unknown entity {0}")]
    UnknownEntity(String),
}

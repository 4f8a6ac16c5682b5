//! Application-wide constants for case-sync.
//!
//! This module centralizes all magic numbers and protocol constants so the
//! connection, heartbeat and mutation layers agree on them. Constants are
//! grouped by domain with documentation explaining their purpose.
//!
//! # Categories
//!
//! - **Timeouts**: Network and mutation timeouts
//! - **Heartbeat & Reconnect**: Push-channel keep-alive and recovery
//! - **Protocol**: Close codes and URL paths

// Rust guideline compliant 2026-02

use std::time::Duration;

// ============================================================================
// Timeouts
// ============================================================================

/// HTTP client request timeout for API calls.
///
/// Applies to every REST call made by [`crate::api::ApiClient`].
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on the remote call behind an optimistic mutation.
///
/// When it elapses the mutation is treated as failed and rolled back.
pub const MUTATION_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Heartbeat & Reconnect
// ============================================================================

/// Interval between `ping` frames on an open push channel.
///
/// Intermediary proxies drop idle connections; 30 seconds stays well under
/// the common 60 second idle cutoff.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Delay before re-establishing an unexpectedly closed push channel.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Ceiling for the optional exponential reconnect backoff.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// How often the notification list is polled while the push channel is down.
pub const NOTIFICATION_POLL_INTERVAL: Duration = Duration::from_secs(10);

// ============================================================================
// Protocol
// ============================================================================

/// WebSocket close code for an intentional, normal closure.
pub const NORMAL_CLOSE_CODE: u16 = 1000;

/// WebSocket close code reported when the socket drops without a close frame.
pub const ABNORMAL_CLOSE_CODE: u16 = 1006;

/// Application close code sent by the server for an invalid or expired token.
///
/// A close with this code is never retried.
pub const UNAUTHORIZED_CLOSE_CODE: u16 = 4001;

/// Path of the notification push channel, relative to the service root.
pub const PUSH_CHANNEL_PATH: &str = "/api/ws/notifications";

/// Toast text shown when an optimistic kanban move is rolled back.
pub const MOVE_FAILED_MESSAGE: &str = "Erro ao mover processo";

/// Notifications kept by the inbox; older ones are evicted first.
pub const MAX_INBOX_ITEMS: usize = 200;

/// Buffered lifecycle events per broadcast subscriber before lagging.
pub const LIFECYCLE_CHANNEL_CAPACITY: usize = 64;

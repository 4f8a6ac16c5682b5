//! case-sync - real-time synchronization layer for the case-tracking client.
//!
//! Keeps the client in step with the server without a page reload: a push
//! channel delivers domain events, and kanban moves are applied optimistically
//! and reconciled with the server's answer.
//!
//! # Architecture
//!
//! - **Connection** - push channel lifecycle, one background task per attempt
//! - **Heartbeat** - periodic `ping` frames while the channel is open
//! - **Reconnect** - delayed re-establishment after unexpected closes
//! - **Dispatcher** - routes decoded events to isolated handlers
//! - **Optimistic** - local-first edits with confirm/rollback
//!
//! # Modules
//!
//! - [`connection`] - [`ConnectionManager`] and its state machine
//! - [`dispatcher`] - handler registry and [`Subscription`] guards
//! - [`protocol`] - wire envelope, event tags and outbound frames
//! - [`kanban`] - [`KanbanBoard`] over an [`optimistic::OptimisticStore`]
//! - [`notifications`] - push/poll merged [`NotificationInbox`]
//! - [`api`] - REST client
//! - [`config`] - Configuration loading/saving

// Rust guideline compliant 2026-02

// Library modules
pub mod api;
pub mod connection;
pub mod dispatcher;
pub mod heartbeat;
pub mod kanban;
pub mod notifications;
pub mod optimistic;
pub mod protocol;
pub mod reconnect;
pub mod ws;

pub mod config;
pub mod constants;
pub mod credentials;
pub mod error;

// Re-export commonly used types
pub use api::ApiClient;
pub use config::Config;
pub use connection::{ConnectionManager, ConnectionOptions, ConnectionState, LifecycleEvent};
pub use credentials::{CredentialProvider, SharedCredential, StaticCredential};
pub use dispatcher::{Dispatcher, Subscription};
pub use error::{ConnectionErrorKind, FrameError, MutationError};
pub use kanban::{BoardCard, KanbanBoard, MoveOutcome};
pub use notifications::NotificationInbox;
pub use protocol::{EntityId, Envelope, EventType, OutboundFrame};

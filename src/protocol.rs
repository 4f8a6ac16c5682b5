//! Wire protocol for the notification push channel.
//!
//! Inbound frames are `{"type": <tag>, "data": <payload>}` with an optional
//! server timestamp. The tag set is closed but extensible: unknown tags decode
//! to [`EventType::Unknown`] so the client stays forward-compatible with
//! server-added events.
//!
//! Decoding happens in two steps:
//!
//! 1. [`Envelope::decode`] - JSON shape and tag (done once per frame by the
//!    dispatcher)
//! 2. [`Envelope::event`] - per-tag payload schema, producing a typed
//!    [`Event`]; malformed payloads fail here, not inside a consumer
//!
//! Outbound control frames are modelled by [`OutboundFrame`].

// Rust guideline compliant 2026-02

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FrameError;

/// Identifier of a server entity (process, notification, user).
///
/// The backend is not consistent about numeric vs string ids, so both are
/// accepted and the original representation is kept when echoing it back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    /// Numeric id.
    Num(i64),
    /// String id (UUIDs, slugs).
    Text(String),
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Num(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for EntityId {
    fn from(n: i64) -> Self {
        Self::Num(n)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        s.parse::<i64>().map_or_else(|_| Self::Text(s.to_string()), Self::Num)
    }
}

/// Tag of an inbound push event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    /// A notification was created for the current user.
    NewNotification,
    /// One notification was marked read (possibly from another tab).
    NotificationRead,
    /// Every notification was marked read.
    AllNotificationsRead,
    /// A process (case) was created.
    ProcessCreated,
    /// Process fields changed.
    ProcessUpdated,
    /// A process moved to another kanban column.
    ProcessStatusChanged,
    /// A process was assigned to a user.
    ProcessAssigned,
    /// A document is close to its expiry date.
    DocumentExpiring,
    /// A document was attached to a process.
    DocumentUploaded,
    /// A deadline was created.
    DeadlineCreated,
    /// A deadline changed.
    DeadlineUpdated,
    /// A deadline is due soon.
    DeadlineReminder,
    /// Server acknowledgement of a client `ping`.
    Heartbeat,
    /// Server-side connection status report.
    ConnectionStatus,
    /// Another user came online.
    UserOnline,
    /// Another user went offline.
    UserOffline,
    /// Tag not known to this client version.
    Unknown(String),
}

impl EventType {
    /// Every tag this client understands, in wire order.
    pub const KNOWN: [EventType; 16] = [
        Self::NewNotification,
        Self::NotificationRead,
        Self::AllNotificationsRead,
        Self::ProcessCreated,
        Self::ProcessUpdated,
        Self::ProcessStatusChanged,
        Self::ProcessAssigned,
        Self::DocumentExpiring,
        Self::DocumentUploaded,
        Self::DeadlineCreated,
        Self::DeadlineUpdated,
        Self::DeadlineReminder,
        Self::Heartbeat,
        Self::ConnectionStatus,
        Self::UserOnline,
        Self::UserOffline,
    ];

    /// Wire name of the tag.
    pub fn as_str(&self) -> &str {
        match self {
            Self::NewNotification => "new_notification",
            Self::NotificationRead => "notification_read",
            Self::AllNotificationsRead => "all_notifications_read",
            Self::ProcessCreated => "process_created",
            Self::ProcessUpdated => "process_updated",
            Self::ProcessStatusChanged => "process_status_changed",
            Self::ProcessAssigned => "process_assigned",
            Self::DocumentExpiring => "document_expiring",
            Self::DocumentUploaded => "document_uploaded",
            Self::DeadlineCreated => "deadline_created",
            Self::DeadlineUpdated => "deadline_updated",
            Self::DeadlineReminder => "deadline_reminder",
            Self::Heartbeat => "heartbeat",
            Self::ConnectionStatus => "connection_status",
            Self::UserOnline => "user_online",
            Self::UserOffline => "user_offline",
            Self::Unknown(tag) => tag,
        }
    }

    /// Map a wire tag onto the enum, keeping unrecognized tags verbatim.
    pub fn from_tag(tag: &str) -> Self {
        Self::KNOWN
            .iter()
            .find(|known| known.as_str() == tag)
            .cloned()
            .unwrap_or_else(|| Self::Unknown(tag.to_string()))
    }

    /// Whether this client has a schema for the tag.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

impl FromStr for EventType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_tag(s))
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(Self::from_tag(&tag))
    }
}

/// One decoded inbound frame. Immutable once received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event tag.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Raw payload; `null` when the server sent none.
    #[serde(default)]
    pub data: Value,
    /// Server-side emission time, as sent.
    #[serde(
        default,
        alias = "timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub server_timestamp: Option<String>,
}

impl Envelope {
    /// Build an envelope locally (tests, replay).
    pub fn new(event_type: EventType, data: Value) -> Self {
        Self {
            event_type,
            data,
            server_timestamp: None,
        }
    }

    /// Decode one text frame.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Malformed`] if the text is not JSON or has no
    /// string `type` field.
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Parsed server timestamp, if present and RFC 3339.
    pub fn server_time(&self) -> Option<DateTime<Utc>> {
        self.server_timestamp
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc))
    }

    /// Decode the payload against the tag's schema.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InvalidPayload`] when `data` does not match.
    pub fn event(&self) -> Result<Event, FrameError> {
        Ok(match &self.event_type {
            EventType::NewNotification => Event::NewNotification(self.payload()?),
            EventType::NotificationRead => Event::NotificationRead(self.payload()?),
            EventType::AllNotificationsRead => Event::AllNotificationsRead,
            EventType::ProcessCreated => Event::ProcessCreated(self.payload()?),
            EventType::ProcessUpdated => Event::ProcessUpdated(self.payload()?),
            EventType::ProcessStatusChanged => Event::ProcessStatusChanged(self.payload()?),
            EventType::ProcessAssigned => Event::ProcessAssigned(self.payload()?),
            EventType::DocumentExpiring => Event::DocumentExpiring(self.payload()?),
            EventType::DocumentUploaded => Event::DocumentUploaded(self.payload()?),
            EventType::DeadlineCreated => Event::DeadlineCreated(self.payload()?),
            EventType::DeadlineUpdated => Event::DeadlineUpdated(self.payload()?),
            EventType::DeadlineReminder => Event::DeadlineReminder(self.payload()?),
            EventType::Heartbeat => Event::Heartbeat,
            EventType::ConnectionStatus => Event::ConnectionStatus(self.payload()?),
            EventType::UserOnline => Event::UserOnline(self.payload()?),
            EventType::UserOffline => Event::UserOffline(self.payload()?),
            EventType::Unknown(tag) => Event::Unknown {
                event_type: tag.clone(),
                data: self.data.clone(),
            },
        })
    }

    fn payload<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        T::deserialize(&self.data).map_err(|source| FrameError::InvalidPayload {
            event_type: self.event_type.to_string(),
            source,
        })
    }
}

/// A notification as pushed by the server or returned by the list endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    /// Notification id; absent on some legacy broadcast frames.
    #[serde(default)]
    pub id: Option<EntityId>,
    /// Short headline.
    #[serde(default)]
    pub title: Option<String>,
    /// Body text.
    #[serde(default)]
    pub message: String,
    /// Server classification (e.g. `deadline`, `status_change`).
    #[serde(default, rename = "type", alias = "notification_type")]
    pub kind: Option<String>,
    /// Process the notification refers to.
    #[serde(default)]
    pub process_id: Option<EntityId>,
    /// Whether the user has already read it.
    #[serde(default, alias = "is_read")]
    pub read: bool,
    /// Creation time; unparseable values are treated as absent.
    #[serde(default, deserialize_with = "lenient_time")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Accept RFC 3339 or a naive `YYYY-MM-DDTHH:MM:SS[.f]` (read as UTC).
fn lenient_time<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.and_then(|ts| {
        DateTime::parse_from_rfc3339(&ts)
            .map(|t| t.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                chrono::NaiveDateTime::parse_from_str(&ts, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|naive| naive.and_utc())
            })
    }))
}

/// Payload of `notification_read`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRead {
    /// The notification that was read.
    #[serde(alias = "id")]
    pub notification_id: EntityId,
}

/// Payload of process lifecycle events other than status changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessPayload {
    /// Process id.
    #[serde(alias = "process_id")]
    pub id: EntityId,
    /// Current kanban column, when included.
    #[serde(default)]
    pub status: Option<String>,
    /// Human-readable title.
    #[serde(default, alias = "titulo")]
    pub title: Option<String>,
    /// Assignee, for `process_assigned`.
    #[serde(default)]
    pub assigned_to: Option<EntityId>,
}

/// Payload of `process_status_changed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStatusChange {
    /// Process id.
    #[serde(alias = "id")]
    pub process_id: EntityId,
    /// Column before the change, when the server includes it.
    #[serde(default)]
    pub old_status: Option<String>,
    /// Column after the change.
    #[serde(alias = "status")]
    pub new_status: String,
}

/// Payload of document events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentPayload {
    /// Document id.
    #[serde(default, alias = "id")]
    pub document_id: Option<EntityId>,
    /// Owning process.
    #[serde(default)]
    pub process_id: Option<EntityId>,
    /// File or document-type name.
    #[serde(default)]
    pub name: Option<String>,
    /// Expiry date for `document_expiring`.
    #[serde(default)]
    pub expires_at: Option<String>,
}

/// Payload of deadline events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadlinePayload {
    /// Deadline id.
    #[serde(default, alias = "deadline_id")]
    pub id: Option<EntityId>,
    /// Owning process.
    #[serde(default)]
    pub process_id: Option<EntityId>,
    /// Description.
    #[serde(default)]
    pub title: Option<String>,
    /// Due date as sent by the server.
    #[serde(default)]
    pub due_date: Option<String>,
}

/// Payload of `connection_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// Status word (`connected`, `authenticated`, ...).
    pub status: String,
    /// Optional detail.
    #[serde(default)]
    pub message: Option<String>,
}

/// Payload of `user_online` / `user_offline`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPresence {
    /// The user whose presence changed.
    #[serde(alias = "id")]
    pub user_id: EntityId,
}

/// Typed inbound event, one variant per tag.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs, reason = "variants mirror EventType one-to-one")]
pub enum Event {
    NewNotification(NotificationPayload),
    NotificationRead(NotificationRead),
    AllNotificationsRead,
    ProcessCreated(ProcessPayload),
    ProcessUpdated(ProcessPayload),
    ProcessStatusChanged(ProcessStatusChange),
    ProcessAssigned(ProcessPayload),
    DocumentExpiring(DocumentPayload),
    DocumentUploaded(DocumentPayload),
    DeadlineCreated(DeadlinePayload),
    DeadlineUpdated(DeadlinePayload),
    DeadlineReminder(DeadlinePayload),
    Heartbeat,
    ConnectionStatus(ConnectionStatus),
    UserOnline(UserPresence),
    UserOffline(UserPresence),
    Unknown { event_type: String, data: Value },
}

/// Control frame sent from the client to the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// Keep-alive.
    Ping,
    /// Mark one notification read.
    MarkNotificationRead {
        /// Target notification.
        notification_id: EntityId,
    },
    /// Mark every notification read.
    MarkAllRead,
    /// Any other frame: `{"type": frame_type, ...data}`.
    #[serde(skip)]
    Custom {
        /// Value of the `type` field.
        frame_type: String,
        /// Fields spread next to `type`; non-objects contribute nothing.
        data: Value,
    },
}

impl OutboundFrame {
    /// Build a frame from a type tag and a field object.
    pub fn custom(frame_type: impl Into<String>, data: Value) -> Self {
        Self::Custom {
            frame_type: frame_type.into(),
            data,
        }
    }

    /// Wire name of the frame.
    pub fn frame_type(&self) -> &str {
        match self {
            Self::Ping => "ping",
            Self::MarkNotificationRead { .. } => "mark_notification_read",
            Self::MarkAllRead => "mark_all_read",
            Self::Custom { frame_type, .. } => frame_type,
        }
    }

    /// Serialize to the JSON text sent on the socket.
    ///
    /// # Errors
    ///
    /// Returns an error only if a field fails to serialize.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Custom { frame_type, data } => {
                let mut obj = serde_json::Map::new();
                obj.insert("type".to_string(), Value::String(frame_type.clone()));
                if let Value::Object(fields) = data {
                    for (k, v) in fields {
                        if k != "type" {
                            obj.insert(k.clone(), v.clone());
                        }
                    }
                }
                serde_json::to_string(&Value::Object(obj))
            }
            other => serde_json::to_string(other),
        }
    }
}

//! Notification inbox fed by both the push channel and the polling endpoint.
//!
//! The same notification can arrive twice (pushed, then listed by the next
//! poll). Entries are merged by id and a newer `created_at` wins. Read state
//! is sticky. A toast is announced at most once per stored id; the inbox keeps
//! the newest [`MAX_INBOX_ITEMS`] entries.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::api::ApiClient;
use crate::connection::ConnectionManager;
use crate::constants::MAX_INBOX_ITEMS;
use crate::dispatcher::Subscription;
use crate::protocol::{EntityId, Event, EventType, NotificationPayload, OutboundFrame};

/// Receives notifications that should be surfaced to the user.
pub trait Announcer: Send + Sync {
    /// Surface `notification` (e.g. as a toast).
    fn announce(&self, notification: &NotificationPayload);
}

/// Announcer that writes to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAnnouncer;

impl Announcer for LogAnnouncer {
    fn announce(&self, notification: &NotificationPayload) {
        match &notification.title {
            Some(title) => log::info!("[Notify] {}: {}", title, notification.message),
            None => log::info!("[Notify] {}", notification.message),
        }
    }
}

#[derive(Debug, Default)]
struct InboxState {
    items: HashMap<EntityId, NotificationPayload>,
}

impl InboxState {
    /// Drop the oldest entries beyond `limit`.
    fn evict_oldest(&mut self, limit: usize) {
        let excess = self.items.len().saturating_sub(limit);
        if excess == 0 {
            return;
        }
        let mut by_age: Vec<_> = self
            .items
            .iter()
            .map(|(id, n)| (n.created_at, id.clone()))
            .collect();
        by_age.sort();
        for (_, id) in by_age.into_iter().take(excess) {
            self.items.remove(&id);
        }
        log::debug!("[Notify] Evicted {} old notification(s)", excess);
    }

    fn merge(&mut self, incoming: NotificationPayload, id: EntityId) {
        match self.items.get_mut(&id) {
            Some(existing) => {
                let read = existing.read || incoming.read;
                let newer = match (existing.created_at, incoming.created_at) {
                    (Some(old), Some(new)) => new >= old,
                    _ => true,
                };
                if newer {
                    *existing = incoming;
                }
                existing.read = read;
            }
            None => {
                self.items.insert(id, incoming);
            }
        }
    }
}

/// Merged view of the user's notifications.
pub struct NotificationInbox {
    state: Mutex<InboxState>,
    announcer: Arc<dyn Announcer>,
    limit: usize,
}

impl std::fmt::Debug for NotificationInbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("NotificationInbox mutex poisoned");
        f.debug_struct("NotificationInbox")
            .field("items", &state.items.len())
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

impl NotificationInbox {
    /// Empty inbox announcing through `announcer`.
    pub fn new(announcer: Arc<dyn Announcer>) -> Self {
        Self {
            state: Mutex::new(InboxState::default()),
            announcer,
            limit: MAX_INBOX_ITEMS,
        }
    }

    /// Keep at most `limit` notifications (at least one).
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    /// Handle a pushed `new_notification`.
    ///
    /// Returns `true` if it was announced. Notifications without an id are
    /// announced but not stored, since they cannot be deduplicated or marked
    /// read.
    pub fn on_push(&self, notification: NotificationPayload) -> bool {
        let Some(id) = notification.id.clone() else {
            self.announcer.announce(&notification);
            return true;
        };

        let announce = {
            let mut state = self.state.lock().expect("NotificationInbox mutex poisoned");
            let first = !state.items.contains_key(&id);
            state.merge(notification.clone(), id);
            state.evict_oldest(self.limit);
            first && !notification.read
        };
        if announce {
            self.announcer.announce(&notification);
        } else {
            log::debug!("[Notify] Suppressed duplicate announcement");
        }
        announce
    }

    /// Merge a list returned by the polling endpoint.
    ///
    /// Polled entries are never announced; their ids count as seen so a late
    /// push of the same notification stays silent.
    pub fn merge_polled<I>(&self, notifications: I)
    where
        I: IntoIterator<Item = NotificationPayload>,
    {
        let mut state = self.state.lock().expect("NotificationInbox mutex poisoned");
        for notification in notifications {
            if let Some(id) = notification.id.clone() {
                state.merge(notification, id);
            }
        }
        state.evict_oldest(self.limit);
    }

    /// Handle a `notification_read` event (or a local read).
    pub fn on_read(&self, id: &EntityId) -> bool {
        let mut state = self.state.lock().expect("NotificationInbox mutex poisoned");
        match state.items.get_mut(id) {
            Some(item) if !item.read => {
                item.read = true;
                true
            }
            _ => false,
        }
    }

    /// Handle an `all_notifications_read` event.
    pub fn on_all_read(&self) {
        let mut state = self.state.lock().expect("NotificationInbox mutex poisoned");
        for item in state.items.values_mut() {
            item.read = true;
        }
    }

    /// Mark `id` read locally and tell the server.
    ///
    /// Returns whether the control frame was sent.
    pub fn mark_read(&self, manager: &ConnectionManager, id: &EntityId) -> bool {
        self.on_read(id);
        manager.send(&OutboundFrame::MarkNotificationRead {
            notification_id: id.clone(),
        })
    }

    /// Mark everything read locally and tell the server.
    ///
    /// Returns whether the control frame was sent.
    pub fn mark_all_read(&self, manager: &ConnectionManager) -> bool {
        self.on_all_read();
        manager.send(&OutboundFrame::MarkAllRead)
    }

    /// Number of unread notifications.
    pub fn unread_count(&self) -> usize {
        let state = self.state.lock().expect("NotificationInbox mutex poisoned");
        state.items.values().filter(|n| !n.read).count()
    }

    /// All notifications, newest first.
    pub fn items(&self) -> Vec<NotificationPayload> {
        let state = self.state.lock().expect("NotificationInbox mutex poisoned");
        let mut items: Vec<_> = state.items.values().cloned().collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        items
    }

    /// Fetch the notification list and merge it.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn poll(&self, api: &ApiClient) -> anyhow::Result<usize> {
        let notifications = api.fetch_notifications().await?;
        let count = notifications.len();
        self.merge_polled(notifications);
        log::debug!("[Notify] Polled {} notification(s)", count);
        Ok(count)
    }

    /// Feed notification events from `manager` into this inbox.
    ///
    /// The inbox is held weakly; keep the returned subscriptions for as long as
    /// updates are wanted.
    pub fn attach(self: &Arc<Self>, manager: &ConnectionManager) -> Vec<Subscription> {
        [
            EventType::NewNotification,
            EventType::NotificationRead,
            EventType::AllNotificationsRead,
        ]
        .into_iter()
        .map(|event_type| {
            let inbox: Weak<Self> = Arc::downgrade(self);
            manager.register(event_type, move |_, envelope| {
                let Some(inbox) = inbox.upgrade() else {
                    return Ok(());
                };
                match envelope.event()? {
                    Event::NewNotification(notification) => {
                        inbox.on_push(notification);
                    }
                    Event::NotificationRead(read) => {
                        inbox.on_read(&read.notification_id);
                    }
                    Event::AllNotificationsRead => inbox.on_all_read(),
                    _ => {}
                }
                Ok(())
            })
        })
        .collect()
    }
}

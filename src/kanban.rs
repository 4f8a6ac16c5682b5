//! Kanban board with optimistic moves.
//!
//! A move is shown immediately, sent to the server, and either kept or rolled
//! back when the server answers. Rollback shows the "move failed" toast through
//! the [`Notifier`] and, when a [`BoardSource`] is configured, refreshes the
//! board from the server.
//!
//! A move whose future is dropped before the server answers (task abort,
//! shutdown, a losing `select!` branch) is rolled back silently.

// Rust guideline compliant 2026-02

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::connection::ConnectionManager;
use crate::constants;
use crate::dispatcher::Subscription;
use crate::error::MutationError;
use crate::optimistic::{OptimisticEdit, OptimisticStore, RemoteUpdate, Resolution, Resolved};
use crate::protocol::{EntityId, Event, EventType, ProcessStatusChange};

/// One process card as the server reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardCard {
    /// Process id.
    pub id: EntityId,
    /// Kanban column the process sits in.
    pub status: String,
}

/// Server side of a kanban move.
#[async_trait]
pub trait MoveRemote: Send + Sync {
    /// Ask the server to move process `id` into `new_status`.
    async fn move_process(&self, id: &EntityId, new_status: &str) -> Result<(), MutationError>;
}

/// Full board snapshot, used to resynchronize after a failed move.
#[async_trait]
pub trait BoardSource: Send + Sync {
    /// Fetch every card on the board.
    async fn fetch_board(&self) -> anyhow::Result<Vec<BoardCard>>;
}

/// User-facing error notifications (toasts).
pub trait Notifier: Send + Sync {
    /// Show an error message.
    fn error(&self, message: &str);
}

/// Notifier that writes toasts to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn error(&self, message: &str) {
        log::error!("[Toast] {}", message);
    }
}

/// How a [`KanbanBoard::move_card`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveOutcome {
    /// The server accepted the move.
    Confirmed(OptimisticEdit<EntityId, String>),
    /// The move failed and its local effect was reverted.
    RolledBack {
        /// The edit, with status `RolledBack`.
        edit: OptimisticEdit<EntityId, String>,
        /// Why the server call failed.
        error: MutationError,
    },
    /// The card was already in the requested column; nothing was sent.
    Unchanged,
}

impl MoveOutcome {
    /// The failure behind a rollback, if any.
    pub fn error(&self) -> Option<&MutationError> {
        match self {
            Self::RolledBack { error, .. } => Some(error),
            Self::Confirmed(_) | Self::Unchanged => None,
        }
    }
}

type Store = Mutex<OptimisticStore<EntityId, String>>;

/// A move waiting for the server.
///
/// Dropped without [`Self::confirm`] or [`Self::rollback`] (the `move_card`
/// future was cancelled), it rolls the edit back.
struct InFlightMove<'a> {
    store: &'a Store,
    edit: OptimisticEdit<EntityId, String>,
    armed: bool,
}

impl InFlightMove<'_> {
    fn confirm(mut self) -> Resolved<EntityId, String> {
        self.armed = false;
        let mut store = self.store.lock().expect("KanbanBoard mutex poisoned");
        store.confirm(&self.edit)
    }

    fn rollback(mut self) -> Resolved<EntityId, String> {
        self.armed = false;
        let mut store = self.store.lock().expect("KanbanBoard mutex poisoned");
        store.rollback(&self.edit)
    }
}

impl Drop for InFlightMove<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Never panic in drop, even on a poisoned lock.
        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        let resolved = store.rollback(&self.edit);
        log::warn!(
            "[Kanban] Move of {} to {} abandoned before the server answered; rolled back: {:?}",
            self.edit.entity_id,
            self.edit.proposed_value,
            resolved.resolution
        );
    }
}

/// Kanban board state plus the optimistic move protocol.
pub struct KanbanBoard {
    store: Store,
    remote: Arc<dyn MoveRemote>,
    notifier: Arc<dyn Notifier>,
    source: Option<Arc<dyn BoardSource>>,
    timeout: Duration,
}

impl std::fmt::Debug for KanbanBoard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KanbanBoard")
            .field("has_source", &self.source.is_some())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl KanbanBoard {
    /// Empty board backed by `remote`, with the default mutation timeout.
    pub fn new(remote: Arc<dyn MoveRemote>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store: Mutex::new(OptimisticStore::new()),
            remote,
            notifier,
            source: None,
            timeout: constants::MUTATION_TIMEOUT,
        }
    }

    /// Resynchronize from `source` after every rolled-back move.
    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn BoardSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Override how long a move may wait for the server.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the board with a server snapshot.
    ///
    /// Cards with a move in flight keep their optimistic column.
    pub fn load<I>(&self, cards: I)
    where
        I: IntoIterator<Item = BoardCard>,
    {
        let mut store = self.store.lock().expect("KanbanBoard mutex poisoned");
        store.replace_all(cards.into_iter().map(|c| (c.id, c.status)));
        log::debug!("[Kanban] Loaded {} card(s)", store.len());
    }

    /// The column `id` is currently shown in.
    pub fn status_of(&self, id: &EntityId) -> Option<String> {
        let store = self.store.lock().expect("KanbanBoard mutex poisoned");
        store.visible(id).cloned()
    }

    /// Ids shown in column `status`, sorted.
    pub fn column(&self, status: &str) -> Vec<EntityId> {
        let store = self.store.lock().expect("KanbanBoard mutex poisoned");
        let mut ids: Vec<EntityId> = store
            .iter()
            .filter(|(_, s)| s.as_str() == status)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Every non-empty column with its sorted ids.
    pub fn columns(&self) -> BTreeMap<String, Vec<EntityId>> {
        let store = self.store.lock().expect("KanbanBoard mutex poisoned");
        let mut columns: BTreeMap<String, Vec<EntityId>> = BTreeMap::new();
        for (id, status) in store.iter() {
            columns.entry(status.clone()).or_default().push(id.clone());
        }
        for ids in columns.values_mut() {
            ids.sort();
        }
        columns
    }

    /// Whether a move of `id` is waiting for the server.
    pub fn is_pending(&self, id: &EntityId) -> bool {
        let store = self.store.lock().expect("KanbanBoard mutex poisoned");
        store.is_pending(id)
    }

    /// Move `id` into `new_status` optimistically.
    ///
    /// The card shows in the new column before the request is sent. On
    /// failure the move is rolled back and reported as
    /// [`MoveOutcome::RolledBack`]; the failure toast is shown and, if a
    /// [`BoardSource`] is configured, the board is refreshed. Neither happens
    /// when a newer move of the same card already settled it.
    ///
    /// Cancel-safe: dropping the future before the server answers rolls the
    /// move back.
    ///
    /// # Errors
    ///
    /// Returns [`MutationError::UnknownEntity`] if `id` is not on the board.
    pub async fn move_card(
        &self,
        id: &EntityId,
        new_status: &str,
    ) -> Result<MoveOutcome, MutationError> {
        let pending = {
            let mut store = self.store.lock().expect("KanbanBoard mutex poisoned");
            if store.visible(id).map(String::as_str) == Some(new_status) {
                log::debug!("[Kanban] {} already in {}", id, new_status);
                return Ok(MoveOutcome::Unchanged);
            }
            InFlightMove {
                store: &self.store,
                edit: store.initiate(id, new_status.to_string())?,
                armed: true,
            }
        };
        log::info!(
            "[Kanban] Moving {} from {} to {}",
            id,
            pending.edit.previous_value,
            new_status
        );

        let result = match tokio::time::timeout(
            self.timeout,
            self.remote.move_process(id, new_status),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(MutationError::Timeout(self.timeout)),
        };

        let error = match result {
            Ok(()) => {
                let resolved = pending.confirm();
                if resolved.resolution == Resolution::Superseded {
                    log::debug!("[Kanban] Move of {} confirmed behind a newer move", id);
                }
                return Ok(MoveOutcome::Confirmed(resolved.edit));
            }
            Err(error) => error,
        };

        let resolved = pending.rollback();
        if resolved.resolution == Resolution::Stale {
            log::info!(
                "[Kanban] Move of {} to {} failed ({}) after a newer move settled it",
                id,
                new_status,
                error
            );
        } else {
            log::warn!(
                "[Kanban] Move of {} to {} failed ({}); rolled back: {:?}",
                id,
                new_status,
                error,
                resolved.resolution
            );
            self.notifier.error(constants::MOVE_FAILED_MESSAGE);

            if self.source.is_some() {
                if let Err(err) = self.resync().await {
                    log::warn!("[Kanban] Resync after failed move failed: {:#}", err);
                }
            }
        }
        Ok(MoveOutcome::RolledBack {
            edit: resolved.edit,
            error,
        })
    }

    /// Apply a `process_status_changed` push.
    pub fn on_status_changed(&self, change: &ProcessStatusChange) -> RemoteUpdate {
        let mut store = self.store.lock().expect("KanbanBoard mutex poisoned");
        let update = store.apply_remote(change.process_id.clone(), change.new_status.clone());
        log::debug!(
            "[Kanban] Push: {} -> {} ({:?})",
            change.process_id,
            change.new_status,
            update
        );
        update
    }

    /// Fetch a fresh snapshot from the configured [`BoardSource`].
    ///
    /// # Errors
    ///
    /// Returns an error if no source is configured or the fetch fails.
    pub async fn resync(&self) -> anyhow::Result<()> {
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no board source configured"))?;
        let cards = source.fetch_board().await?;
        self.load(cards);
        Ok(())
    }

    /// Feed push events from `manager` into this board.
    ///
    /// Handles `process_status_changed`, plus `process_created` and
    /// `process_updated` when they carry a status. The board is held weakly;
    /// keep the returned subscriptions for as long as updates are wanted.
    pub fn attach(self: &Arc<Self>, manager: &ConnectionManager) -> Vec<Subscription> {
        [
            EventType::ProcessStatusChanged,
            EventType::ProcessCreated,
            EventType::ProcessUpdated,
        ]
        .into_iter()
        .map(|event_type| {
            let board: Weak<Self> = Arc::downgrade(self);
            manager.register(event_type, move |_, envelope| {
                let Some(board) = board.upgrade() else {
                    return Ok(());
                };
                match envelope.event()? {
                    Event::ProcessStatusChanged(change) => {
                        board.on_status_changed(&change);
                    }
                    Event::ProcessCreated(process) | Event::ProcessUpdated(process) => {
                        if let Some(status) = process.status {
                            board.on_status_changed(&ProcessStatusChange {
                                process_id: process.id,
                                old_status: None,
                                new_status: status,
                            });
                        }
                    }
                    _ => {}
                }
                Ok(())
            })
        })
        .collect()
    }
}

//! Optimistic mutation tracking.
//!
//! [`OptimisticStore`] holds the locally visible value of every entity and the
//! edits still waiting for the server. Each entity keeps:
//!
//! - a *base* value: the last value justified by the server (initial load,
//!   confirmed edit, or push event)
//! - the in-flight edits, ordered by a monotonic version
//!
//! The visible value is the newest in-flight edit's proposed value, or the base
//! when nothing is in flight. Resolving an edit removes it from tracking:
//!
//! - **confirm** moves the base to the edit's proposed value, unless a newer
//!   edit or push already set it, and retires any older in-flight edits
//! - **rollback** drops the edit; the visible value falls back to the next
//!   older in-flight edit or the base
//!
//! A late rollback of an old edit therefore never clobbers a newer optimistic
//! value, and a rollback of the newest edit never restores a value the server
//! rejected. The store is plain data; callers wrap it in a lock.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;

use uuid::Uuid;

use crate::error::MutationError;

/// Lifecycle of one optimistic edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditStatus {
    /// Applied locally, remote call in flight.
    Pending,
    /// Remote call succeeded.
    Confirmed,
    /// Remote call failed; local effect reverted.
    RolledBack,
}

/// One user-initiated mutation of one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimisticEdit<K, V> {
    /// The mutated entity.
    pub entity_id: K,
    /// Visible value when the edit began (possibly itself optimistic).
    pub previous_value: V,
    /// Value shown while the edit is pending.
    pub proposed_value: V,
    /// Current status.
    pub status: EditStatus,
    /// Monotonic per-store sequence number.
    pub version: u64,
    /// Correlation id for logs and server-side deduplication.
    pub mutation_id: Uuid,
}

/// What resolving an edit did to the visible value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<V> {
    /// The edit was current; the visible value is now `V`.
    Settled(V),
    /// A newer edit owns the visible value; only bookkeeping changed.
    Superseded,
    /// The edit was no longer tracked (already resolved, or entity removed).
    Stale,
}

/// An edit after [`OptimisticStore::confirm`] or [`OptimisticStore::rollback`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved<K, V> {
    /// The edit, stamped `Confirmed` or `RolledBack`.
    pub edit: OptimisticEdit<K, V>,
    /// What happened to the visible value.
    pub resolution: Resolution<V>,
}

/// Effect of a server-pushed value on the local view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteUpdate {
    /// The visible value already matched (e.g. echo of our own move).
    Unchanged,
    /// The visible value changed.
    Applied,
    /// A pending edit masks the value; it became the rollback target.
    Deferred,
}

#[derive(Debug, Clone)]
struct Entity<K, V> {
    base: V,
    /// Version of the last edit (or push) that set `base`.
    base_version: u64,
    in_flight: Vec<OptimisticEdit<K, V>>,
}

impl<K, V: Clone> Entity<K, V> {
    fn visible(&self) -> &V {
        self.in_flight
            .last()
            .map_or(&self.base, |edit| &edit.proposed_value)
    }
}

/// Visible values plus in-flight edits, keyed by entity id.
#[derive(Debug, Clone)]
pub struct OptimisticStore<K, V> {
    entities: HashMap<K, Entity<K, V>>,
    next_version: u64,
}

impl<K, V> Default for OptimisticStore<K, V> {
    fn default() -> Self {
        Self {
            entities: HashMap::new(),
            next_version: 1,
        }
    }
}

impl<K, V> OptimisticStore<K, V>
where
    K: Eq + Hash + Clone + Display,
    V: Clone + PartialEq,
{
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or overwrite an entity with a server-justified value.
    ///
    /// Equivalent to [`Self::apply_remote`]; kept for readability at load time.
    pub fn insert(&mut self, id: K, value: V) {
        self.apply_remote(id, value);
    }

    /// Locally visible value.
    pub fn visible(&self, id: &K) -> Option<&V> {
        self.entities.get(id).map(Entity::visible)
    }

    /// Every entity with its visible value.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entities.iter().map(|(k, e)| (k, e.visible()))
    }

    /// Number of entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether the store has no entities.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Whether any edit for `id` is still pending.
    pub fn is_pending(&self, id: &K) -> bool {
        self.entities
            .get(id)
            .is_some_and(|e| !e.in_flight.is_empty())
    }

    /// Total pending edits across all entities.
    pub fn pending_count(&self) -> usize {
        self.entities.values().map(|e| e.in_flight.len()).sum()
    }

    /// Begin an edit: apply `proposed` locally and track it as pending.
    ///
    /// The returned edit is the ticket to pass to [`Self::confirm`] or
    /// [`Self::rollback`].
    ///
    /// # Errors
    ///
    /// Returns [`MutationError::UnknownEntity`] if `id` is not in the store.
    pub fn initiate(&mut self, id: &K, proposed: V) -> Result<OptimisticEdit<K, V>, MutationError> {
        let version = self.next_version;
        let entity = self
            .entities
            .get_mut(id)
            .ok_or_else(|| MutationError::UnknownEntity(id.to_string()))?;
        self.next_version += 1;

        let edit = OptimisticEdit {
            entity_id: id.clone(),
            previous_value: entity.visible().clone(),
            proposed_value: proposed,
            status: EditStatus::Pending,
            version,
            mutation_id: Uuid::new_v4(),
        };
        if !entity.in_flight.is_empty() {
            log::debug!(
                "[Optimistic] Edit v{} on {} supersedes {} pending edit(s)",
                version,
                id,
                entity.in_flight.len()
            );
        }
        entity.in_flight.push(edit.clone());
        Ok(edit)
    }

    /// The server accepted `edit`.
    pub fn confirm(&mut self, edit: &OptimisticEdit<K, V>) -> Resolved<K, V> {
        let resolution = self.settle_confirmed(edit);
        Resolved {
            edit: OptimisticEdit {
                status: EditStatus::Confirmed,
                ..edit.clone()
            },
            resolution,
        }
    }

    /// The server rejected `edit` (or the call failed); revert its effect.
    pub fn rollback(&mut self, edit: &OptimisticEdit<K, V>) -> Resolved<K, V> {
        let resolution = self.settle_rolled_back(edit);
        Resolved {
            edit: OptimisticEdit {
                status: EditStatus::RolledBack,
                ..edit.clone()
            },
            resolution,
        }
    }

    fn settle_confirmed(&mut self, edit: &OptimisticEdit<K, V>) -> Resolution<V> {
        let Some((entity, idx)) = self.locate(edit) else {
            return Resolution::Stale;
        };
        let resolved = entity.in_flight.remove(idx);
        log::debug!(
            "[Optimistic] Confirmed v{} on {} ({})",
            resolved.version,
            resolved.entity_id,
            resolved.mutation_id
        );
        if resolved.version > entity.base_version {
            entity.base = resolved.proposed_value;
            entity.base_version = resolved.version;
        }
        // Older edits can no longer affect the visible value.
        if idx > 0 {
            log::debug!(
                "[Optimistic] Dropping {} older pending edit(s) on {}",
                idx,
                resolved.entity_id
            );
            entity.in_flight.drain(..idx);
        }
        if entity.in_flight.is_empty() {
            Resolution::Settled(entity.visible().clone())
        } else {
            Resolution::Superseded
        }
    }

    fn settle_rolled_back(&mut self, edit: &OptimisticEdit<K, V>) -> Resolution<V> {
        let Some((entity, idx)) = self.locate(edit) else {
            return Resolution::Stale;
        };
        let resolved = entity.in_flight.remove(idx);
        log::debug!(
            "[Optimistic] Rolled back v{} on {} ({})",
            resolved.version,
            resolved.entity_id,
            resolved.mutation_id
        );
        if idx == entity.in_flight.len() {
            Resolution::Settled(entity.visible().clone())
        } else {
            Resolution::Superseded
        }
    }

    /// Reconcile a value pushed by the server for `id`.
    ///
    /// Unknown entities are added.
    pub fn apply_remote(&mut self, id: K, value: V) -> RemoteUpdate {
        let version = self.next_version.saturating_sub(1);
        match self.entities.get_mut(&id) {
            Some(entity) => {
                let was = entity.visible().clone();
                entity.base = value;
                entity.base_version = entity.base_version.max(version);
                if *entity.visible() == was {
                    if entity.in_flight.is_empty() || entity.base == was {
                        RemoteUpdate::Unchanged
                    } else {
                        RemoteUpdate::Deferred
                    }
                } else {
                    RemoteUpdate::Applied
                }
            }
            None => {
                self.entities.insert(
                    id,
                    Entity {
                        base: value,
                        base_version: version,
                        in_flight: Vec::new(),
                    },
                );
                RemoteUpdate::Applied
            }
        }
    }

    /// Replace the server-justified state with a full snapshot.
    ///
    /// Entities missing from the snapshot are dropped unless an edit for them
    /// is still in flight.
    pub fn replace_all<I>(&mut self, snapshot: I)
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let mut seen = std::collections::HashSet::new();
        for (id, value) in snapshot {
            seen.insert(id.clone());
            self.apply_remote(id, value);
        }
        self.entities
            .retain(|id, entity| seen.contains(id) || !entity.in_flight.is_empty());
    }

    fn locate(&mut self, edit: &OptimisticEdit<K, V>) -> Option<(&mut Entity<K, V>, usize)> {
        let entity = self.entities.get_mut(&edit.entity_id)?;
        let idx = entity
            .in_flight
            .iter()
            .position(|e| e.version == edit.version)?;
        Some((entity, idx))
    }
}

impl<K, V> FromIterator<(K, V)> for OptimisticStore<K, V>
where
    K: Eq + Hash + Clone + Display,
    V: Clone + PartialEq,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut store = Self::new();
        for (id, value) in iter {
            store.insert(id, value);
        }
        store
    }
}

//! Active sessions by match id.
//!
//! Setting up a session takes a while (RCON round trips, config pushes), so a
//! match id is first [reserved](Registry::reserve) and only becomes visible to
//! lookups once the reservation is filled. A second setup for the same match
//! is refused for as long as the first one holds its reservation.

use crate::error::{Result, WardenError};
use parking_lot::{Mutex, RwLock};
use shared::MatchId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Thread-safe map from match id to its session.
///
/// Lock order is `entries` before `pending`.
pub struct Registry<S> {
    entries: RwLock<HashMap<MatchId, Arc<S>>>,
    pending: Mutex<HashSet<MatchId>>,
}

/// A match id held for a setup in progress.
///
/// Dropping it without calling [`Reservation::fill`] frees the id again, so a
/// failed or cancelled setup leaves nothing behind.
pub struct Reservation<'a, S> {
    registry: &'a Registry<S>,
    match_id: MatchId,
}

impl<S> Reservation<'_, S> {
    pub fn match_id(&self) -> MatchId {
        self.match_id
    }

    /// Publishes the session under the reserved id.
    pub fn fill(self, session: Arc<S>) {
        let mut entries = self.registry.entries.write();
        entries.insert(self.match_id, session);
        self.registry.pending.lock().remove(&self.match_id);
    }
}

impl<S> Drop for Reservation<'_, S> {
    fn drop(&mut self) {
        self.registry.pending.lock().remove(&self.match_id);
    }
}

impl<S> Registry<S> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
        }
    }

    /// Holds `match_id` for a setup. Fails if the match is active or another
    /// setup already holds it.
    pub fn reserve(&self, match_id: MatchId) -> Result<Reservation<'_, S>> {
        let entries = self.entries.read();
        let mut pending = self.pending.lock();
        if entries.contains_key(&match_id) || !pending.insert(match_id) {
            return Err(WardenError::SessionExists(match_id));
        }
        Ok(Reservation {
            registry: self,
            match_id,
        })
    }

    /// Whether a setup currently holds `match_id`.
    pub fn is_reserved(&self, match_id: MatchId) -> bool {
        self.pending.lock().contains(&match_id)
    }

    /// Looks up an active session.
    pub fn get(&self, match_id: MatchId) -> Result<Arc<S>> {
        self.entries
            .read()
            .get(&match_id)
            .cloned()
            .ok_or(WardenError::NoSuchSession(match_id))
    }

    /// Inserts unless the match already has an entry or is reserved.
    pub fn insert(&self, match_id: MatchId, session: Arc<S>) -> Result<()> {
        let mut entries = self.entries.write();
        if entries.contains_key(&match_id) || self.pending.lock().contains(&match_id) {
            return Err(WardenError::SessionExists(match_id));
        }
        entries.insert(match_id, session);
        Ok(())
    }

    /// Takes the session out, as `End` does.
    pub fn remove(&self, match_id: MatchId) -> Option<Arc<S>> {
        self.entries.write().remove(&match_id)
    }

    /// Removes the entry only if it is still `session`.
    pub fn remove_if_same(&self, match_id: MatchId, session: &Arc<S>) -> bool {
        let mut entries = self.entries.write();
        match entries.get(&match_id) {
            Some(current) if Arc::ptr_eq(current, session) => {
                entries.remove(&match_id);
                true
            }
            _ => false,
        }
    }

    /// Whether another session holds or is being set up under `match_id`.
    pub fn superseded(&self, match_id: MatchId, session: &Arc<S>) -> bool {
        let entries = self.entries.read();
        match entries.get(&match_id) {
            Some(current) => !Arc::ptr_eq(current, session),
            None => self.pending.lock().contains(&match_id),
        }
    }

    /// Whether a session is active. Reserved ids do not count.
    pub fn contains(&self, match_id: MatchId) -> bool {
        self.entries.read().contains_key(&match_id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Active match ids, ascending.
    pub fn ids(&self) -> Vec<MatchId> {
        let mut ids: Vec<_> = self.entries.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl<S> Default for Registry<S> {
    fn default() -> Self {
        Self::new()
    }
}

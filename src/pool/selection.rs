//! The account pool: an insertion-ordered entry list plus one selected slot.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::events::{EngineEvent, EventBus, PoolKind};

use super::store::{backup_path, AccountStore, JsonAccountStore};
use super::{AnyEntry, Eligibility, PoolEntry};

/// Rotating pool of mail or proxy accounts.
///
/// Invariant: an empty pool never has a selection, and a selected entry is
/// always enabled and unexpired at the moment it was selected.
pub struct AccountPool<T: PoolEntry> {
    kind: PoolKind,
    entries: Vec<T>,
    selected: Option<usize>,
    eligibility: Box<dyn Eligibility<T>>,
    store: Arc<dyn AccountStore<T>>,
    rng: fastrand::Rng,
    events: EventBus,
}

impl<T> AccountPool<T>
where
    T: PoolEntry + Serialize + DeserializeOwned,
{
    /// Empty pool backed by the JSON account store.
    pub fn new(kind: PoolKind, events: EventBus) -> Self {
        Self {
            kind,
            entries: Vec::new(),
            selected: None,
            eligibility: Box::new(AnyEntry),
            store: Arc::new(JsonAccountStore),
            rng: fastrand::Rng::new(),
            events,
        }
    }
}

impl<T: PoolEntry> AccountPool<T> {
    pub fn with_store(mut self, store: Arc<dyn AccountStore<T>>) -> Self {
        self.store = store;
        self
    }

    pub fn with_eligibility(mut self, eligibility: impl Eligibility<T> + 'static) -> Self {
        self.eligibility = Box::new(eligibility);
        self
    }

    /// Fix the random sequence (reproducible selection in tests).
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = fastrand::Rng::with_seed(seed);
        self
    }

    pub fn with_entries(mut self, entries: Vec<T>) -> Self {
        self.replace(entries);
        self
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[T] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.entries.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.entries.get_mut(index)
    }

    pub fn push(&mut self, entry: T) {
        self.entries.push(entry);
    }

    pub fn selected(&self) -> Option<&T> {
        self.selected.and_then(|i| self.entries.get(i))
    }

    pub fn selected_mut(&mut self) -> Option<&mut T> {
        self.selected.and_then(|i| self.entries.get_mut(i))
    }

    pub fn selected_index(&self) -> Option<usize> {
        self.selected
    }

    /// Pick a uniformly random eligible entry, optionally of one kind.
    pub fn select(&mut self, kind: Option<T::Kind>) -> Option<&T> {
        self.select_at(kind, Utc::now())
    }

    /// [`select`](Self::select) against an explicit clock.
    pub fn select_at(&mut self, kind: Option<T::Kind>, now: DateTime<Utc>) -> Option<&T> {
        let mut eligible = Vec::with_capacity(self.entries.len());

        for (i, entry) in self.entries.iter().enumerate() {
            if entry.is_expired(now) {
                debug!(id = entry.id(), "Skipping expired entry");
                self.events.publish(EngineEvent::DateExpired {
                    pool: self.kind,
                    id: entry.id().to_string(),
                });
                continue;
            }
            if !entry.is_enabled() {
                continue;
            }
            if kind.is_some_and(|k| entry.kind() != k) {
                continue;
            }
            if !self.eligibility.admits(entry) {
                continue;
            }
            eligible.push(i);
        }

        if eligible.is_empty() {
            self.selected = None;
            warn!(pool = ?self.kind, filter = ?kind, "No eligible entry to select");
            self.events.publish(EngineEvent::NotFound { pool: self.kind });
            return None;
        }

        let index = eligible[self.rng.usize(..eligible.len())];
        self.set_selected(Some(index));
        self.entries.get(index)
    }

    /// Select directly by position. Fails on out-of-range, disabled, or
    /// expired entries and leaves the selection unchanged.
    pub fn select_by_index(&mut self, index: usize) -> bool {
        let ok = self
            .entries
            .get(index)
            .is_some_and(|e| e.is_enabled() && !e.is_expired(Utc::now()));
        if ok {
            self.set_selected(Some(index));
        }
        ok
    }

    /// Select directly by id (case-insensitive).
    pub fn select_by_name(&mut self, name: &str) -> bool {
        match self
            .entries
            .iter()
            .position(|e| e.id().eq_ignore_ascii_case(name))
        {
            Some(index) => self.select_by_index(index),
            None => false,
        }
    }

    pub fn deselect(&mut self) {
        if self.selected.is_some() {
            self.set_selected(None);
        }
    }

    /// First enabled entry matching `identity` by login or derived address.
    pub fn find(&self, identity: &str) -> Option<&T> {
        let identity = identity.trim();
        self.entries.iter().find(|e| {
            e.is_enabled()
                && e.identities()
                    .iter()
                    .any(|id| id.eq_ignore_ascii_case(identity))
        })
    }

    /// Replace the entries from the durable store.
    ///
    /// An empty or failed load keeps the current entries and returns `false`.
    pub fn load(&mut self, path: &Path) -> bool {
        match self.store.load(path) {
            Ok(entries) if !entries.is_empty() => {
                info!(pool = ?self.kind, path = %path.display(), count = entries.len(), "Loaded pool");
                self.replace(entries);
                true
            }
            Ok(_) => {
                warn!(pool = ?self.kind, path = %path.display(), "Account store is empty; keeping current entries");
                false
            }
            Err(e) => {
                warn!(pool = ?self.kind, path = %path.display(), error = %e, "Failed to load pool");
                false
            }
        }
    }

    /// Persist the entries, plus a timestamped copy in `backup_dir` if given.
    pub fn save(&self, path: &Path, backup_dir: Option<&Path>) -> bool {
        if let Err(e) = self.store.save(path, &self.entries) {
            warn!(pool = ?self.kind, path = %path.display(), error = %e, "Failed to save pool");
            return false;
        }
        if let Some(dir) = backup_dir {
            let backup = backup_path(path, dir);
            if let Err(e) = self.store.save(&backup, &self.entries) {
                warn!(pool = ?self.kind, path = %backup.display(), error = %e, "Failed to write pool backup");
                return false;
            }
        }
        info!(pool = ?self.kind, path = %path.display(), count = self.entries.len(), "Saved pool");
        true
    }

    fn replace(&mut self, entries: Vec<T>) {
        self.entries = entries;
        self.selected = None;
    }

    fn set_selected(&mut self, index: Option<usize>) {
        self.selected = index;
        self.events.publish(EngineEvent::SelectionChanged {
            pool: self.kind,
            id: self.selected().map(|e| e.id().to_string()),
        });
    }
}

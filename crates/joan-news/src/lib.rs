//! `joan-news` – the shared blackboard of the JOAN stack.
//!
//! Every module publishes its latest [`SharedValues`] under its own
//! [`ModuleId`]; every other module reads them on its own tick.  There is no
//! history and no delivery guarantee: a reader sees whatever the owner wrote
//! last, possibly one tick old.
//!
//! # Locking
//!
//! The bus is two-level.  The key map sits behind one `RwLock` that is only
//! write-locked when a key is added or removed (module initialize / cleanup).
//! Each key owns its own [`Slot`], an `RwLock` around the published record.
//! A writer updating `HardwareManager` therefore never blocks a writer
//! updating `CarlaInterface`, and a reader of a key always observes a whole
//! record, never a half-written one.
//!
//! # Example
//!
//! ```
//! use joan_news::News;
//! use joan_types::{impl_shared_values, ModuleId, State};
//!
//! #[derive(Debug, serde::Serialize)]
//! struct Inputs { state: State, throttle: f64 }
//! impl_shared_values!(Inputs);
//!
//! let news = News::new();
//! assert!(news.read(ModuleId::HardwareManager).is_none());
//!
//! news.write(ModuleId::HardwareManager, Box::new(Inputs { state: State::Idle, throttle: 0.2 }));
//! let throttle = news.read_as(ModuleId::HardwareManager, |v: &Inputs| v.throttle);
//! assert_eq!(throttle, Some(0.2));
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use joan_types::{ModuleId, SharedValues};
use parking_lot::RwLock;
use tracing::debug;

/// One key's storage cell.  Shared between the bus and the owning module.
pub type Slot = Arc<RwLock<Box<dyn SharedValues>>>;

/// Process-scoped key → latest-value store.
///
/// Construct one per application and hand an `Arc<News>` to every module
/// manager.
#[derive(Default)]
pub struct News {
    entries: RwLock<HashMap<ModuleId, Slot>>,
}

impl News {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `values` under `id`, replacing whatever was there.
    ///
    /// When the key already exists its slot is reused and the record is
    /// swapped under the slot's own lock, so existing [`Slot`] handles observe
    /// the new record.  Returns the slot now holding `values`.
    pub fn write(&self, id: ModuleId, values: Box<dyn SharedValues>) -> Slot {
        if let Some(slot) = self.slot(id) {
            *slot.write() = values;
            debug!(module = %id, "news overwritten");
            return slot;
        }

        let mut entries = self.entries.write();
        // Another writer may have inserted between the two locks.
        if let Some(slot) = entries.get(&id) {
            *slot.write() = values;
            return Arc::clone(slot);
        }
        let slot: Slot = Arc::new(RwLock::new(values));
        entries.insert(id, Arc::clone(&slot));
        debug!(module = %id, "news published");
        slot
    }

    /// Return the slot published under `id`, or `None` when the module has
    /// not published (yet).
    pub fn read(&self, id: ModuleId) -> Option<Slot> {
        self.slot(id)
    }

    /// Delete the entry for `id`.  Returns the removed slot, if any.
    pub fn remove(&self, id: ModuleId) -> Option<Slot> {
        let removed = self.entries.write().remove(&id);
        if removed.is_some() {
            debug!(module = %id, "news removed");
        }
        removed
    }

    /// `true` when `id` currently has an entry.
    pub fn contains(&self, id: ModuleId) -> bool {
        self.entries.read().contains_key(&id)
    }

    /// Number of modules currently publishing.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lazily yield every identity that currently has an entry, in
    /// [`ModuleId::ALL`] order.
    ///
    /// Presence is checked as the iterator advances, not when it is created.
    /// Clone the iterator (or call this again) to walk the keys again.
    pub fn available_keys(&self) -> impl Iterator<Item = ModuleId> + Clone + '_ {
        ModuleId::ALL.into_iter().filter(move |id| self.contains(*id))
    }

    /// JSON view of the record under `id`.
    pub fn snapshot(&self, id: ModuleId) -> Option<serde_json::Value> {
        self.slot(id).map(|slot| slot.read().snapshot())
    }

    /// Run `f` against the record under `id` if it exists and is a `T`.
    pub fn read_as<T, R>(&self, id: ModuleId, f: impl FnOnce(&T) -> R) -> Option<R>
    where
        T: SharedValues,
    {
        let slot = self.slot(id)?;
        let guard = slot.read();
        guard.as_any().downcast_ref::<T>().map(f)
    }

    /// Run `f` against the record under `id` with write access if it exists
    /// and is a `T`.  Only the owning module should call this.
    pub fn update_as<T, R>(&self, id: ModuleId, f: impl FnOnce(&mut T) -> R) -> Option<R>
    where
        T: SharedValues,
    {
        let slot = self.slot(id)?;
        let mut guard = slot.write();
        guard.as_any_mut().downcast_mut::<T>().map(f)
    }

    fn slot(&self, id: ModuleId) -> Option<Slot> {
        self.entries.read().get(&id).cloned()
    }
}

impl std::fmt::Debug for News {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("News")
            .field("keys", &self.available_keys().collect::<Vec<_>>())
            .finish()
    }
}

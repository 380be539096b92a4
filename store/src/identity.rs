//! Identity map (component C, §4.C): at most one live object per
//! `(class, id)`. Each class owns one [`IdentityMap`] and only ever touches
//! it from its own owning task (§5), so a plain `std::sync::Mutex` suffices.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::entity::EntityId;

/// Whether the map pins every live instance (`Strong`) or lets them be
/// dropped once no other holder remains (`Weak`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    Weak,
    Strong,
}

enum Slot<T> {
    Weak(Weak<T>),
    Strong(Arc<T>),
}

impl<T> Slot<T> {
    fn upgrade(&self) -> Option<Arc<T>> {
        match self {
            Slot::Weak(w) => w.upgrade(),
            Slot::Strong(a) => Some(a.clone()),
        }
    }
}

pub struct IdentityMap<T> {
    retention: Retention,
    entries: Mutex<HashMap<EntityId, Slot<T>>>,
}

impl<T> IdentityMap<T> {
    pub fn new(retention: Retention) -> Self {
        Self { retention, entries: Mutex::new(HashMap::new()) }
    }

    /// Returns the canonical live instance for `id`, constructing one with
    /// `make` if none is currently live.
    pub fn get_or_insert_with(&self, id: EntityId, make: impl FnOnce() -> Arc<T>) -> Arc<T> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(slot) = entries.get(&id) {
            if let Some(existing) = slot.upgrade() {
                return existing;
            }
        }
        let fresh = make();
        let slot = match self.retention {
            Retention::Weak => Slot::Weak(Arc::downgrade(&fresh)),
            Retention::Strong => Slot::Strong(fresh.clone()),
        };
        entries.insert(id, slot);
        fresh
    }

    /// Returns the currently live instance for `id`, if any, without
    /// constructing one on a miss.
    pub fn peek(&self, id: &EntityId) -> Option<Arc<T>> {
        self.entries.lock().unwrap().get(id).and_then(Slot::upgrade)
    }

    pub fn delete(&self, id: &EntityId) {
        self.entries.lock().unwrap().remove(id);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

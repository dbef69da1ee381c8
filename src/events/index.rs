//! Identity index: (tier, kind, owner) → queued event.
//!
//! Only [`super::queue::EventQueue`] mutates this, in the same call that
//! mutates its time order, so every entry names an event present in that tier.

use std::collections::HashMap;

use crate::events::queue::EventHandle;
use crate::events::timed_event::{EventKind, IndexedKind, Priority};

#[derive(Debug, Default)]
pub(crate) struct EventIndex {
    maps: [[HashMap<u64, EventHandle>; 4]; 2],
}

impl EventIndex {
    /// Store `handle` under the kind's owner. Returns the handle it displaced.
    /// Unindexed kinds are ignored.
    pub(crate) fn insert(
        &mut self,
        priority: Priority,
        handle: EventHandle,
        kind: &EventKind,
    ) -> Option<EventHandle> {
        let (indexed, owner) = kind.indexed()?;
        self.maps[priority.slot()][indexed.slot()].insert(owner, handle)
    }

    pub(crate) fn find(
        &self,
        priority: Priority,
        kind: IndexedKind,
        owner: u64,
    ) -> Option<EventHandle> {
        self.maps[priority.slot()][kind.slot()].get(&owner).copied()
    }

    /// Remove the entry for `kind`'s owner if it still points at `handle`.
    pub(crate) fn erase(&mut self, priority: Priority, handle: EventHandle, kind: &EventKind) {
        let Some((indexed, owner)) = kind.indexed() else {
            return;
        };
        let map = &mut self.maps[priority.slot()][indexed.slot()];
        if map.get(&owner) == Some(&handle) {
            map.remove(&owner);
        }
    }

    pub(crate) fn clear(&mut self, priority: Priority) {
        for map in &mut self.maps[priority.slot()] {
            map.clear();
        }
    }

    pub(crate) fn clear_kind(&mut self, priority: Priority, kind: IndexedKind) {
        self.maps[priority.slot()][kind.slot()].clear();
    }

    pub(crate) fn len(&self, priority: Priority) -> usize {
        self.maps[priority.slot()].iter().map(HashMap::len).sum()
    }
}

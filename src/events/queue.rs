//! Two-tier timed event queue.
//!
//! Events live in a slab and are addressed by generation-checked
//! [`EventHandle`]s. Each tier orders handles by `(run_time, sequence)`, where
//! the sequence number is assigned on every insertion: an event added at the
//! same time as existing ones goes after them. The identity index is updated
//! in the same call as the ordering, so the two never drift apart.

use std::collections::BTreeSet;
use std::fmt;

use crate::core::clock::Timestamp;
use crate::events::index::EventIndex;
use crate::events::timed_event::{EventKind, IndexedKind, Priority, TimedEvent};
use crate::objects::ObjectRef;

/// Stable reference to a queued event. Stale handles resolve to nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventHandle {
    slot: usize,
    generation: u64,
}

impl EventHandle {
    #[cfg(test)]
    pub(crate) const fn from_raw(slot: usize, generation: u64) -> Self {
        Self { slot, generation }
    }
}

impl fmt::Display for EventHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ev{}.{}", self.slot, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey {
    run_time: Timestamp,
    seq: u64,
    slot: usize,
}

#[derive(Debug)]
struct Entry {
    event: TimedEvent,
    priority: Priority,
    seq: u64,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u64,
    entry: Option<Entry>,
}

/// Low and high priority event lists plus their identity index.
#[derive(Debug, Default)]
pub struct EventQueue {
    slots: Vec<Slot>,
    free: Vec<usize>,
    order: [BTreeSet<OrderKey>; 2],
    index: EventIndex,
    next_seq: u64,
}

impl EventQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an event. An indexed event (check or ack expiry) supersedes any
    /// event of the same kind already queued for the same owner in that tier.
    pub fn schedule(&mut self, event: TimedEvent, priority: Priority) -> EventHandle {
        if let Some((kind, owner)) = event.kind.indexed()
            && let Some(existing) = self.index.find(priority, kind, owner)
        {
            self.remove(existing);
        }

        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(Slot::default());
                self.slots.len() - 1
            }
        };
        let seq = self.bump_seq();
        let handle = EventHandle {
            slot,
            generation: self.slots[slot].generation,
        };
        self.order[priority.slot()].insert(OrderKey {
            run_time: event.run_time,
            seq,
            slot,
        });
        self.index.insert(priority, handle, &event.kind);
        self.slots[slot].entry = Some(Entry {
            event,
            priority,
            seq,
        });
        handle
    }

    /// Requeue a fired recurring event at its next run time.
    pub fn requeue(&mut self, mut event: TimedEvent, priority: Priority, now: Timestamp) -> EventHandle {
        event.run_time = event.next_run_time(now);
        self.schedule(event, priority)
    }

    /// Remove an event. Returns `None` for stale handles.
    pub fn remove(&mut self, handle: EventHandle) -> Option<TimedEvent> {
        let slot = self.slots.get_mut(handle.slot)?;
        if slot.generation != handle.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation += 1;
        self.free.push(handle.slot);
        self.order[entry.priority.slot()].remove(&OrderKey {
            run_time: entry.event.run_time,
            seq: entry.seq,
            slot: handle.slot,
        });
        self.index.erase(entry.priority, handle, &entry.event.kind);
        Some(entry.event)
    }

    /// Move an event to a new run time. It lands after events already queued
    /// at that time.
    pub fn reschedule(&mut self, handle: EventHandle, run_time: Timestamp) -> bool {
        let seq = self.bump_seq();
        let Some(entry) = self.entry_mut(handle) else {
            return false;
        };
        let old = OrderKey {
            run_time: entry.event.run_time,
            seq: entry.seq,
            slot: handle.slot,
        };
        entry.event.run_time = run_time;
        entry.seq = seq;
        let priority = entry.priority;
        let tier = &mut self.order[priority.slot()];
        tier.remove(&old);
        tier.insert(OrderKey {
            run_time,
            seq,
            slot: handle.slot,
        });
        true
    }

    /// Apply many run-time changes to one tier, then re-sort it once.
    /// Handles from the other tier or stale handles are skipped.
    pub fn retime(&mut self, priority: Priority, changes: &[(EventHandle, Timestamp)]) -> usize {
        let mut applied = 0;
        for &(handle, run_time) in changes {
            if let Some(entry) = self.entry_mut(handle)
                && entry.priority == priority
            {
                entry.event.run_time = run_time;
                applied += 1;
            }
        }
        if applied > 0 {
            self.resort(priority);
        }
        applied
    }

    /// Rebuild a tier's ordering and index from the stored events.
    ///
    /// Extract, sort, relink: O(n log n). Ties keep their previous relative
    /// order.
    pub fn resort(&mut self, priority: Priority) {
        self.index.clear(priority);
        let mut keys = Vec::with_capacity(self.order[priority.slot()].len());
        for (slot_no, slot) in self.slots.iter().enumerate() {
            if let Some(entry) = &slot.entry
                && entry.priority == priority
            {
                keys.push(OrderKey {
                    run_time: entry.event.run_time,
                    seq: entry.seq,
                    slot: slot_no,
                });
                self.index.insert(
                    priority,
                    EventHandle {
                        slot: slot_no,
                        generation: slot.generation,
                    },
                    &entry.event.kind,
                );
            }
        }
        self.order[priority.slot()] = keys.into_iter().collect();
    }

    #[must_use]
    pub fn get(&self, handle: EventHandle) -> Option<&TimedEvent> {
        self.entry(handle).map(|e| &e.event)
    }

    #[must_use]
    pub fn priority_of(&self, handle: EventHandle) -> Option<Priority> {
        self.entry(handle).map(|e| e.priority)
    }

    /// Look up an indexed event by owner.
    #[must_use]
    pub fn find(&self, priority: Priority, kind: IndexedKind, owner: u64) -> Option<EventHandle> {
        self.index.find(priority, kind, owner)
    }

    /// The queued check for an object, in either tier.
    #[must_use]
    pub fn find_check(&self, object: ObjectRef) -> Option<EventHandle> {
        let (kind, owner) = match object {
            ObjectRef::Host(id) => (IndexedKind::HostCheck, id.0),
            ObjectRef::Service(id) => (IndexedKind::ServiceCheck, id.0),
        };
        self.find(Priority::Low, kind, owner)
            .or_else(|| self.find(Priority::High, kind, owner))
    }

    /// Earliest event of a tier.
    #[must_use]
    pub fn peek(&self, priority: Priority) -> Option<(EventHandle, &TimedEvent)> {
        let key = self.order[priority.slot()].first()?;
        self.handle_for(key.slot)
            .and_then(|h| self.get(h).map(|ev| (h, ev)))
    }

    /// Remove and return the earliest event of a tier if it is due.
    pub fn pop_due(&mut self, priority: Priority, now: Timestamp) -> Option<TimedEvent> {
        let (handle, event) = self.peek(priority)?;
        if event.run_time > now {
            return None;
        }
        self.remove(handle)
    }

    /// Events of a tier in run order.
    pub fn iter(&self, priority: Priority) -> impl Iterator<Item = (EventHandle, &TimedEvent)> + '_ {
        self.order[priority.slot()].iter().filter_map(|key| {
            let handle = self.handle_for(key.slot)?;
            self.get(handle).map(|ev| (handle, ev))
        })
    }

    /// Cancel every event targeting `object` in both tiers.
    pub fn cancel_object(&mut self, object: ObjectRef) -> usize {
        let doomed: Vec<EventHandle> = Priority::ALL
            .iter()
            .flat_map(|p| self.iter(*p))
            .filter(|(_, ev)| ev.kind.target() == Some(object))
            .map(|(h, _)| h)
            .collect();
        doomed.into_iter().filter_map(|h| self.remove(h)).count()
    }

    /// Cancel every event of one indexed kind in a tier.
    pub fn cancel_kind(&mut self, priority: Priority, kind: IndexedKind) -> usize {
        let doomed: Vec<EventHandle> = self
            .iter(priority)
            .filter(|(_, ev)| ev.kind.indexed().is_some_and(|(k, _)| k == kind))
            .map(|(h, _)| h)
            .collect();
        let removed = doomed.into_iter().filter_map(|h| self.remove(h)).count();
        self.index.clear_kind(priority, kind);
        removed
    }

    /// Count of events of a given kind name in a tier.
    #[must_use]
    pub fn count_matching(&self, priority: Priority, pred: impl Fn(&EventKind) -> bool) -> usize {
        self.iter(priority).filter(|(_, ev)| pred(&ev.kind)).count()
    }

    #[must_use]
    pub fn len(&self, priority: Priority) -> usize {
        self.order[priority.slot()].len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.iter().all(BTreeSet::is_empty)
    }

    #[cfg(test)]
    pub(crate) fn index_len(&self, priority: Priority) -> usize {
        self.index.len(priority)
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn handle_for(&self, slot: usize) -> Option<EventHandle> {
        let s = self.slots.get(slot)?;
        s.entry.as_ref().map(|_| EventHandle {
            slot,
            generation: s.generation,
        })
    }

    fn entry(&self, handle: EventHandle) -> Option<&Entry> {
        let slot = self.slots.get(handle.slot)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    fn entry_mut(&mut self, handle: EventHandle) -> Option<&mut Entry> {
        let slot = self.slots.get_mut(handle.slot)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{HostId, ServiceId};
    use proptest::prelude::*;

    fn host_check(id: u64, at: Timestamp) -> TimedEvent {
        TimedEvent::once(EventKind::HostCheck { host: HostId(id) }, at)
    }

    fn service_check(id: u64, at: Timestamp) -> TimedEvent {
        TimedEvent::once(
            EventKind::ServiceCheck {
                service: ServiceId(id),
            },
            at,
        )
    }

    fn run_times(q: &EventQueue, p: Priority) -> Vec<Timestamp> {
        q.iter(p).map(|(_, ev)| ev.run_time).collect()
    }

    #[test]
    fn events_come_out_in_time_order() {
        let mut q = EventQueue::new();
        q.schedule(service_check(1, 30), Priority::Low);
        q.schedule(service_check(2, 10), Priority::Low);
        q.schedule(service_check(3, 20), Priority::Low);
        assert_eq!(run_times(&q, Priority::Low), vec![10, 20, 30]);
        assert_eq!(q.len(Priority::Low), 3);
        assert_eq!(q.len(Priority::High), 0);
    }

    #[test]
    fn equal_times_keep_insertion_order() {
        let mut q = EventQueue::new();
        let a = q.schedule(service_check(1, 10), Priority::Low);
        let b = q.schedule(service_check(2, 10), Priority::Low);
        let c = q.schedule(service_check(3, 10), Priority::Low);
        let order: Vec<EventHandle> = q.iter(Priority::Low).map(|(h, _)| h).collect();
        assert_eq!(order, vec![a, b, c]);

        // Rescheduling to the same time moves it behind its peers.
        assert!(q.reschedule(a, 10));
        let order: Vec<EventHandle> = q.iter(Priority::Low).map(|(h, _)| h).collect();
        assert_eq!(order, vec![b, c, a]);
    }

    #[test]
    fn tiers_are_independent() {
        let mut q = EventQueue::new();
        q.schedule(TimedEvent::every(EventKind::CheckReaper, 5, 10), Priority::High);
        q.schedule(host_check(1, 1), Priority::Low);
        assert_eq!(
            q.peek(Priority::High).map(|(_, e)| e.kind),
            Some(EventKind::CheckReaper)
        );
        assert_eq!(
            q.peek(Priority::Low).map(|(_, e)| e.kind),
            Some(EventKind::HostCheck { host: HostId(1) })
        );
    }

    #[test]
    fn remove_updates_index_and_stales_handle() {
        let mut q = EventQueue::new();
        let h = q.schedule(host_check(7, 100), Priority::Low);
        assert_eq!(q.find(Priority::Low, IndexedKind::HostCheck, 7), Some(h));
        let ev = q.remove(h).expect("removed");
        assert_eq!(ev.run_time, 100);
        assert_eq!(q.find(Priority::Low, IndexedKind::HostCheck, 7), None);
        assert!(q.remove(h).is_none());
        assert!(q.get(h).is_none());

        // Slot reuse does not resurrect the old handle.
        let h2 = q.schedule(host_check(8, 50), Priority::Low);
        assert_ne!(h, h2);
        assert!(q.get(h).is_none());
        assert!(q.is_empty() == false);
    }

    #[test]
    fn scheduling_same_owner_supersedes() {
        let mut q = EventQueue::new();
        let first = q.schedule(host_check(1, 100), Priority::Low);
        let second = q.schedule(host_check(1, 50), Priority::Low);
        assert!(q.get(first).is_none());
        assert_eq!(q.len(Priority::Low), 1);
        assert_eq!(q.find_check(ObjectRef::Host(HostId(1))), Some(second));

        // A different kind for the same owner is a separate slot.
        q.schedule(
            TimedEvent::once(EventKind::ExpireHostAck { host: HostId(1) }, 70),
            Priority::Low,
        );
        assert_eq!(q.len(Priority::Low), 2);
        assert_eq!(q.find_check(ObjectRef::Host(HostId(1))), Some(second));
    }

    #[test]
    fn pop_due_respects_now() {
        let mut q = EventQueue::new();
        q.schedule(service_check(1, 10), Priority::Low);
        q.schedule(service_check(2, 20), Priority::Low);
        assert!(q.pop_due(Priority::Low, 5).is_none());
        let ev = q.pop_due(Priority::Low, 15).expect("due");
        assert_eq!(ev.run_time, 10);
        assert!(q.pop_due(Priority::Low, 15).is_none());
        assert_eq!(q.len(Priority::Low), 1);
        assert_eq!(q.index_len(Priority::Low), 1);
    }

    #[test]
    fn retime_resorts_tier() {
        let mut q = EventQueue::new();
        let a = q.schedule(service_check(1, 10), Priority::Low);
        let b = q.schedule(service_check(2, 20), Priority::Low);
        let c = q.schedule(service_check(3, 30), Priority::Low);
        let applied = q.retime(Priority::Low, &[(a, 40), (c, 5)]);
        assert_eq!(applied, 2);
        let order: Vec<EventHandle> = q.iter(Priority::Low).map(|(h, _)| h).collect();
        assert_eq!(order, vec![c, b, a]);
        assert_eq!(q.find(Priority::Low, IndexedKind::ServiceCheck, 3), Some(c));
    }

    #[test]
    fn requeue_recurring_event() {
        let mut q = EventQueue::new();
        q.schedule(TimedEvent::every(EventKind::CheckReaper, 100, 10), Priority::High);
        let ev = q.pop_due(Priority::High, 100).expect("due");
        q.requeue(ev, Priority::High, 100);
        assert_eq!(run_times(&q, Priority::High), vec![110]);
    }

    #[test]
    fn cancel_object_and_kind() {
        let mut q = EventQueue::new();
        q.schedule(host_check(1, 10), Priority::Low);
        q.schedule(
            TimedEvent::once(EventKind::ExpireHostAck { host: HostId(1) }, 20),
            Priority::High,
        );
        q.schedule(service_check(1, 30), Priority::Low);
        q.schedule(service_check(2, 40), Priority::Low);
        assert_eq!(q.cancel_object(ObjectRef::Host(HostId(1))), 2);
        assert_eq!(q.len(Priority::High), 0);
        assert_eq!(q.cancel_kind(Priority::Low, IndexedKind::ServiceCheck), 2);
        assert!(q.is_empty());
        assert_eq!(q.index_len(Priority::Low), 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(u8, u64, Timestamp, bool),
        Reschedule(usize, Timestamp),
        Remove(usize),
        Retime(usize, Timestamp),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..3, 1u64..8, 0i64..100, any::<bool>()).prop_map(|(k, o, t, h)| Op::Add(k, o, t, h)),
            (0usize..64, 0i64..100).prop_map(|(i, t)| Op::Reschedule(i, t)),
            (0usize..64).prop_map(Op::Remove),
            (0usize..64, 0i64..100).prop_map(|(i, t)| Op::Retime(i, t)),
        ]
    }

    fn kind_for(k: u8, owner: u64) -> EventKind {
        match k {
            0 => EventKind::HostCheck {
                host: HostId(owner),
            },
            1 => EventKind::ServiceCheck {
                service: ServiceId(owner),
            },
            _ => EventKind::CheckReaper,
        }
    }

    fn assert_consistent(q: &EventQueue) -> Result<(), TestCaseError> {
        for p in Priority::ALL {
            let mut last: Option<Timestamp> = None;
            let mut indexed = 0;
            for (handle, ev) in q.iter(p) {
                if let Some(prev) = last {
                    prop_assert!(prev <= ev.run_time, "tier {p:?} out of order");
                }
                last = Some(ev.run_time);
                if let Some((kind, owner)) = ev.kind.indexed() {
                    indexed += 1;
                    prop_assert_eq!(q.find(p, kind, owner), Some(handle));
                }
            }
            prop_assert_eq!(q.index_len(p), indexed);
        }
        Ok(())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn ordering_and_index_survive_any_mutation(ops in prop::collection::vec(op_strategy(), 1..120)) {
            let mut q = EventQueue::new();
            let mut handles: Vec<EventHandle> = Vec::new();
            for op in ops {
                match op {
                    Op::Add(k, owner, at, high) => {
                        let p = if high { Priority::High } else { Priority::Low };
                        handles.push(q.schedule(TimedEvent::once(kind_for(k, owner), at), p));
                    }
                    Op::Reschedule(i, at) => {
                        if let Some(h) = handles.get(i) {
                            q.reschedule(*h, at);
                        }
                    }
                    Op::Remove(i) => {
                        if let Some(h) = handles.get(i) {
                            q.remove(*h);
                        }
                    }
                    Op::Retime(i, at) => {
                        if let Some(h) = handles.get(i).copied()
                            && let Some(p) = q.priority_of(h)
                        {
                            q.retime(p, &[(h, at)]);
                        }
                    }
                }
                assert_consistent(&q)?;
            }
            for p in Priority::ALL {
                q.resort(p);
            }
            assert_consistent(&q)?;
        }
    }
}

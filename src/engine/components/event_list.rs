use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use super::cursor::{Cursor, TimeBase};

/// Lane-scoped identity of a single event. Relational links between events
/// (note on/off pairing) and edits by identity go through these instead of
/// references into the list.
pub type EventId = u64;

/// Anything that sits on a lane timeline.
pub trait Timed {
    fn cursor(&self) -> Cursor;
    fn id(&self) -> EventId;
}

/// Ordered event container with a dual view: the engine mutates the live
/// `Vec`, UI threads read the last published snapshot.
///
/// Single mutations publish on return. Related mutations that must become
/// visible together go through [`EventList::begin`] / [`EventList::commit`];
/// the snapshot is replaced once, at the outermost commit, so a reader never
/// observes a half-applied batch. Readers clone the snapshot pointer and
/// then iterate without holding anything.
///
/// Order is maintained under the [`TimeBase`] passed to the search and
/// insert operations; ties keep insertion order.
#[derive(Debug)]
pub struct EventList<E> {
    events: Vec<E>,
    published: Arc<Mutex<Arc<[E]>>>,
    batch_depth: u32,
    version: u64,
}

impl<E: Timed + Clone> EventList<E> {
    pub fn new() -> Self {
        EventList {
            events: Vec::new(),
            published: Arc::new(Mutex::new(Arc::from(Vec::<E>::new()))),
            batch_depth: 0,
            version: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
    pub fn get(&self, index: usize) -> Option<&E> {
        self.events.get(index)
    }
    pub fn first(&self) -> Option<&E> {
        self.events.first()
    }
    pub fn last(&self) -> Option<&E> {
        self.events.last()
    }
    pub fn events(&self) -> &[E] {
        &self.events
    }
    pub fn iter(&self) -> std::slice::Iter<'_, E> {
        self.events.iter()
    }

    /// Bumped every time a snapshot is published.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn find(&self, id: EventId) -> Option<usize> {
        self.events.iter().position(|e| e.id() == id)
    }

    /// Lowest index whose event is strictly after `cursor`. Appending a new
    /// event here keeps equal-cursor events in arrival order.
    pub fn insert_index(&self, op: TimeBase, cursor: Cursor) -> usize {
        self.events
            .partition_point(|e| op.is_before_or_equal(e.cursor(), cursor))
    }

    /// Lowest index whose event is at or after `cursor`.
    pub fn play_index(&self, op: TimeBase, cursor: Cursor) -> usize {
        self.events
            .partition_point(|e| op.is_before(e.cursor(), cursor))
    }

    /// Opens a batch. Nested batches are allowed; publication happens at the
    /// outermost [`EventList::commit`].
    pub fn begin(&mut self) {
        self.batch_depth += 1;
    }

    pub fn commit(&mut self) {
        debug_assert!(self.batch_depth > 0, "commit without begin");
        self.batch_depth = self.batch_depth.saturating_sub(1);
        if self.batch_depth == 0 {
            self.publish();
        }
    }

    fn publish(&mut self) {
        if self.batch_depth > 0 {
            return;
        }
        *self.published.lock().unwrap() = Arc::from(self.events.clone());
        self.version += 1;
    }

    pub fn insert(&mut self, index: usize, event: E) {
        self.events.insert(index, event);
        self.publish();
    }

    /// Appends without ordering checks; for load paths that insert
    /// already-sorted data.
    pub fn add(&mut self, event: E) {
        self.events.push(event);
        self.publish();
    }

    /// Inserts at the position keeping the list sorted, returning the index.
    pub fn insert_sorted(&mut self, op: TimeBase, event: E) -> usize {
        let index = self.insert_index(op, event.cursor());
        self.insert(index, event);
        index
    }

    pub fn remove(&mut self, id: EventId) -> Option<E> {
        let index = self.find(id)?;
        Some(self.remove_at(index))
    }

    pub fn remove_at(&mut self, index: usize) -> E {
        let event = self.events.remove(index);
        self.publish();
        event
    }

    pub fn remove_all(&mut self, ids: &[EventId]) -> Vec<E> {
        let mut removed = Vec::with_capacity(ids.len());
        self.events.retain(|e| {
            if ids.contains(&e.id()) {
                removed.push(e.clone());
                false
            } else {
                true
            }
        });
        self.publish();
        removed
    }

    /// Removes and returns events in `[lo, hi]`, or `[lo, hi)` when not
    /// `inclusive` of the upper bound.
    pub fn remove_range(&mut self, op: TimeBase, lo: Cursor, hi: Cursor, inclusive: bool) -> Vec<E> {
        let start = self.play_index(op, lo);
        let end = if inclusive {
            self.insert_index(op, hi)
        } else {
            self.play_index(op, hi)
        };
        if start >= end {
            return Vec::new();
        }
        let removed: Vec<E> = self.events.drain(start..end).collect();
        self.publish();
        removed
    }

    /// Replaces the whole list.
    pub fn set(&mut self, events: Vec<E>) {
        self.events = events;
        self.publish();
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut E> {
        self.events.get_mut(index)
    }

    /// Mutates in place and republishes. The caller is responsible for
    /// keeping the order intact (or re-sorting via [`EventList::set`]).
    pub fn update<R>(&mut self, f: impl FnOnce(&mut Vec<E>) -> R) -> R {
        let result = f(&mut self.events);
        self.publish();
        result
    }

    /// Reader handle for a concurrent UI thread.
    pub fn view(&self) -> EventListView<E> {
        EventListView {
            published: Arc::clone(&self.published),
        }
    }
}

impl<E: Timed + Clone> Default for EventList<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable handle onto the published side of an [`EventList`].
///
/// `snapshot` clones the current pointer out of the cell; the returned slice
/// is immutable and stays valid however the engine mutates the list
/// afterwards.
#[derive(Debug)]
pub struct EventListView<E> {
    published: Arc<Mutex<Arc<[E]>>>,
}

impl<E> EventListView<E> {
    pub fn snapshot(&self) -> Arc<[E]> {
        Arc::clone(&self.published.lock().unwrap())
    }
}

impl<E> Clone for EventListView<E> {
    fn clone(&self) -> Self {
        EventListView {
            published: Arc::clone(&self.published),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BPM: f64 = 120.0;
    const OP: TimeBase = TimeBase::Absolute;

    #[derive(Debug, Clone, PartialEq)]
    struct TestEvent {
        id: EventId,
        cursor: Cursor,
        value: f64,
    }
    impl Timed for TestEvent {
        fn cursor(&self) -> Cursor {
            self.cursor
        }
        fn id(&self) -> EventId {
            self.id
        }
    }

    fn event(id: EventId, millis: f64) -> TestEvent {
        TestEvent {
            id,
            cursor: Cursor::from_millis(millis, BPM).unwrap(),
            value: 0.0,
        }
    }

    fn list_of(millis: &[f64]) -> EventList<TestEvent> {
        let mut list = EventList::new();
        for (i, &ms) in millis.iter().enumerate() {
            list.insert_sorted(OP, event(i as EventId, ms));
        }
        list
    }

    #[test]
    fn insert_sorted_keeps_order() {
        let mut list = EventList::new();
        list.insert_sorted(OP, event(0, 200.0));
        list.insert_sorted(OP, event(1, 100.0));
        list.insert_sorted(OP, event(2, 300.0));
        let millis: Vec<f64> = list.iter().map(|e| e.cursor.millis()).collect();
        assert_eq!(millis, vec![100.0, 200.0, 300.0]);
    }

    #[test]
    fn equal_cursors_keep_arrival_order() {
        let mut list = EventList::new();
        list.insert_sorted(OP, event(0, 100.0));
        list.insert_sorted(OP, event(1, 100.0));
        list.insert_sorted(OP, event(2, 100.0));
        let ids: Vec<EventId> = list.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn search_indices() {
        let list = list_of(&[100.0, 200.0, 300.0]);
        let at = |ms: f64| Cursor::from_millis(ms, BPM).unwrap();

        assert_eq!(list.play_index(OP, at(200.0)), 1);
        assert_eq!(list.insert_index(OP, at(200.0)), 2);
        assert_eq!(list.play_index(OP, at(150.0)), 1);
        assert_eq!(list.insert_index(OP, at(150.0)), 1);
        assert_eq!(list.play_index(OP, at(0.0)), 0);
        assert_eq!(list.insert_index(OP, at(999.0)), 3);
    }

    #[test]
    fn remove_range_inclusive() {
        let mut list = list_of(&[100.0, 200.0, 300.0, 400.0]);
        let at = |ms: f64| Cursor::from_millis(ms, BPM).unwrap();

        let removed = list.remove_range(OP, at(200.0), at(300.0), true);
        assert_eq!(removed.len(), 2);
        let millis: Vec<f64> = list.iter().map(|e| e.cursor.millis()).collect();
        assert_eq!(millis, vec![100.0, 400.0]);
    }

    #[test]
    fn remove_range_exclusive_keeps_upper_bound() {
        let mut list = list_of(&[100.0, 200.0, 300.0]);
        let at = |ms: f64| Cursor::from_millis(ms, BPM).unwrap();

        let removed = list.remove_range(OP, at(100.0), at(300.0), false);
        assert_eq!(removed.len(), 2);
        assert_eq!(list.len(), 1);
        assert_eq!(list.get(0).unwrap().cursor.millis(), 300.0);
    }

    #[test]
    fn snapshot_reflects_published_state() {
        let mut list = list_of(&[100.0]);
        let view = list.view();
        assert_eq!(view.snapshot().len(), 1);

        list.insert_sorted(OP, event(9, 50.0));
        assert_eq!(view.snapshot().len(), 2);
    }

    #[test]
    fn batch_publishes_once_at_outer_commit() {
        let mut list = list_of(&[100.0, 200.0]);
        let view = list.view();
        let version_before = list.version();

        list.begin();
        list.remove_at(0);
        assert_eq!(view.snapshot().len(), 2, "mid-batch state must not leak");
        list.begin();
        list.insert_sorted(OP, event(7, 50.0));
        list.commit();
        assert_eq!(view.snapshot().len(), 2);
        list.commit();

        assert_eq!(view.snapshot().len(), 2 - 1 + 1);
        assert_eq!(list.version(), version_before + 1);
    }

    #[test]
    fn remove_by_id() {
        let mut list = list_of(&[100.0, 200.0]);
        assert!(list.remove(1).is_some());
        assert!(list.remove(1).is_none());
        assert_eq!(list.len(), 1);
    }
}

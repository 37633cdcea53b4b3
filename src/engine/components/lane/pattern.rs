use std::collections::VecDeque;

use super::{EditOperation, LaneEdit};
use crate::engine::components::cursor::{Cursor, TimeBase};
use crate::engine::components::event_list::{EventId, EventList, EventListView, Timed};
use crate::engine::traits::PatternSelector;

/// A pattern selection, held until the next one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PatternEvent {
    pub id: EventId,
    pub cursor: Cursor,
    pub pattern: usize,
}

impl Timed for PatternEvent {
    fn cursor(&self) -> Cursor {
        self.cursor
    }
    fn id(&self) -> EventId {
        self.id
    }
}

/// Stepped lane driving the bus's pattern selector.
#[derive(Debug)]
pub struct PatternLane {
    events: EventList<PatternEvent>,
    record_queue: VecDeque<PatternEvent>,
    overdub_active: bool,
    /// Selection active when recording armed; the floor an otherwise empty
    /// lane stitches back to.
    initial_pattern: usize,
    ui_height: u32,
    id_seq: EventId,
}

impl PatternLane {
    pub fn new() -> Self {
        PatternLane {
            events: EventList::new(),
            record_queue: VecDeque::new(),
            overdub_active: false,
            initial_pattern: 0,
            ui_height: 0,
            id_seq: 0,
        }
    }

    pub fn events(&self) -> &[PatternEvent] {
        self.events.events()
    }
    pub fn view(&self) -> EventListView<PatternEvent> {
        self.events.view()
    }
    pub fn version(&self) -> u64 {
        self.events.version()
    }
    pub fn ui_height(&self) -> u32 {
        self.ui_height
    }
    pub fn set_ui_height(&mut self, height: u32) {
        self.ui_height = height;
    }

    pub fn last_cursor(&self, op: TimeBase) -> Option<Cursor> {
        let committed = self.events.last().map(|e| e.cursor);
        let queued = self
            .record_queue
            .iter()
            .map(|e| e.cursor)
            .reduce(|a, b| op.max(a, b));
        match (committed, queued) {
            (Some(a), Some(b)) => Some(op.max(a, b)),
            (a, b) => a.or(b),
        }
    }

    fn next_id(&mut self) -> EventId {
        let id = self.id_seq;
        self.id_seq += 1;
        id
    }

    fn make_event(&mut self, cursor: Cursor, pattern: usize) -> PatternEvent {
        PatternEvent {
            id: self.next_id(),
            cursor,
            pattern,
        }
    }

    pub(crate) fn arm_recording(&mut self, active: Option<usize>) {
        if let Some(pattern) = active {
            self.initial_pattern = pattern;
        }
    }

    /// Queues a selection change observed at `at`.
    pub(crate) fn record_select(&mut self, op: TimeBase, at: Cursor, pattern: usize) {
        if self.events.insert_index(op, at) == 0 {
            // Pin what was selected here before the new material.
            let floor = match self.events.first() {
                Some(ahead) => ahead.pattern,
                None => self.initial_pattern,
            };
            let stitch = self.make_event(at, floor);
            self.record_queue.push_back(stitch);
        }
        let event = self.make_event(at, pattern);
        self.record_queue.push_back(event);
        self.overdub_active = true;
    }

    pub(crate) fn commit_record_queue(&mut self, op: TimeBase, notify: bool) {
        if self.record_queue.is_empty() {
            return;
        }
        if notify {
            self.events.begin();
        }
        while let Some(event) = self.record_queue.pop_front() {
            self.events.insert_sorted(op, event);
        }
        if notify {
            self.events.commit();
        }
    }

    /// Replaces the lane contents from persisted data in one publish.
    pub(crate) fn load_events(&mut self, op: TimeBase, items: impl IntoIterator<Item = (Cursor, usize)>) {
        let mut events: Vec<PatternEvent> = items
            .into_iter()
            .map(|(cursor, pattern)| {
                let id = self.next_id();
                PatternEvent {
                    id,
                    cursor,
                    pattern,
                }
            })
            .collect();
        events.sort_by(|a, b| op.cmp(a.cursor, b.cursor));
        self.events.set(events);
    }

    pub fn insert_select(&mut self, op: TimeBase, at: Cursor, pattern: usize) -> EventId {
        let event = self.make_event(at, pattern);
        let id = event.id;
        self.events.insert_sorted(op, event);
        id
    }

    pub fn remove_event(&mut self, id: EventId) -> bool {
        self.events.remove(id).is_some()
    }

    /// Steers the selector to the selection the lane holds at `to`.
    pub(crate) fn play_cursor(
        &mut self,
        op: TimeBase,
        from: Cursor,
        to: Cursor,
        _inclusive: bool,
        selector: Option<&mut dyn PatternSelector>,
    ) {
        let Some(selector) = selector else {
            return;
        };
        if self.events.is_empty() {
            return;
        }
        let next_index = self.events.play_index(op, to).min(self.events.len() - 1);
        let next = self.events.events()[next_index];
        let prior = if next_index > 0 {
            Some(self.events.events()[next_index - 1])
        } else {
            None
        };

        let desired = if op.is_after(from, next.cursor) {
            return;
        } else if prior.is_none() || op.is_after(to, next.cursor) {
            next.pattern
        } else {
            prior.expect("prior checked above").pattern
        };
        go_pattern(selector, desired);
    }

    pub(crate) fn overdub_cursor(
        &mut self,
        op: TimeBase,
        from: Cursor,
        to: Cursor,
        inclusive: bool,
        length: Cursor,
        selector: Option<&mut dyn PatternSelector>,
    ) {
        if !self.overdub_active && self.record_queue.is_empty() {
            self.play_cursor(op, from, to, inclusive, selector);
            return;
        }

        self.events.begin();

        let outer = if op.is_before(to, length) {
            held_at(op, self.events.events(), to)
        } else {
            None
        };

        if self.overdub_active {
            self.events.remove_range(op, from, to, inclusive);
        }
        self.commit_record_queue(op, false);

        let inner = held_before(op, self.events.events(), to);

        self.play_cursor(op, from, to, inclusive, selector);

        if let Some(pattern) = inner {
            self.apply_stitch(op, to, pattern);
        }
        if let Some(pattern) = outer {
            self.apply_stitch(op, to, pattern);
        }

        self.events.commit();
    }

    pub(crate) fn on_stop_recording(&mut self) {
        self.overdub_active = false;
    }

    /// Primes the selector with the selection held at `at`.
    pub(crate) fn initialize_cursor_playback(
        &mut self,
        op: TimeBase,
        at: Cursor,
        selector: Option<&mut dyn PatternSelector>,
    ) {
        let Some(selector) = selector else {
            return;
        };
        let held = held_at(op, self.events.events(), at)
            .or_else(|| self.events.first().map(|e| e.pattern));
        if let Some(pattern) = held {
            go_pattern(selector, pattern);
        }
    }

    pub(crate) fn jump_cursor(
        &mut self,
        op: TimeBase,
        to: Cursor,
        selector: Option<&mut dyn PatternSelector>,
    ) {
        self.initialize_cursor_playback(op, to, selector);
    }

    fn apply_stitch(&mut self, op: TimeBase, at: Cursor, pattern: usize) {
        if stitch_redundant(op, self.events.events(), at, pattern) {
            log::debug!("dropping redundant pattern stitch at {:?}", at);
            return;
        }
        let event = self.make_event(at, pattern);
        self.events.insert_sorted(op, event);
    }

    /// Applies a range edit; held-selection semantics follow the stepped
    /// parameter rules, including the value shift on reverse.
    pub fn set_events_cursors(&mut self, op: TimeBase, edit: &LaneEdit) {
        self.events.begin();

        self.events.update(|events| {
            for event in events.iter_mut() {
                if let Some(origin) = edit.originals.get(&event.id) {
                    event.cursor = origin.cursor;
                    event.pattern = origin.value.round().max(0.0) as usize;
                }
            }
            events.sort_by(|a, b| op.cmp(a.cursor, b.cursor));
        });

        if edit.operation == EditOperation::None {
            self.events.commit();
            return;
        }

        let original: Vec<PatternEvent> = self.events.events().to_vec();
        let stitching = !edit.operation.is_reverse();

        let outer_min_at = op.min(edit.from_min, edit.to_min);
        let outer_min = stitching
            .then(|| held_before(op, &original, outer_min_at))
            .flatten();

        let range_removed = self.events.remove_range(op, edit.to_min, edit.to_max, true);
        let ids: Vec<EventId> = edit.targets.keys().copied().collect();
        let mut moved = self.events.remove_all(&ids);
        moved.extend(
            range_removed
                .iter()
                .filter(|e| edit.targets.contains_key(&e.id))
                .copied(),
        );

        for event in &mut moved {
            if let Some(&target) = edit.targets.get(&event.id) {
                event.cursor = op.bound(target, edit.to_min, edit.to_max);
            }
        }
        moved.sort_by(|a, b| op.cmp(a.cursor, b.cursor));

        if edit.operation.is_reverse() {
            for index in 0..moved.len().saturating_sub(1) {
                moved[index].pattern = moved[index + 1].pattern;
            }
        }

        for event in moved {
            self.events.insert_sorted(op, event);
        }

        if stitching {
            if let Some(pattern) = outer_min {
                self.apply_stitch(op, outer_min_at, pattern);
            }
            if let Some(pattern) = held_before(op, self.events.events(), edit.to_max) {
                self.apply_stitch(op, edit.to_max, pattern);
            }
        }

        self.events.commit();
    }
}

impl Default for PatternLane {
    fn default() -> Self {
        Self::new()
    }
}

fn go_pattern(selector: &mut dyn PatternSelector, pattern: usize) {
    if selector.target_pattern() == pattern {
        return;
    }
    if !selector.go_pattern(pattern) {
        log::warn!("pattern {} is not available on this selector", pattern);
    }
}

/// Selection held at `at`, including an event sitting exactly there.
fn held_at(op: TimeBase, events: &[PatternEvent], at: Cursor) -> Option<usize> {
    let index = events.partition_point(|e| op.is_before_or_equal(e.cursor, at));
    index.checked_sub(1).map(|i| events[i].pattern)
}

/// Selection held by the last event strictly before `at`.
fn held_before(op: TimeBase, events: &[PatternEvent], at: Cursor) -> Option<usize> {
    let index = events.partition_point(|e| op.is_before(e.cursor, at));
    index.checked_sub(1).map(|i| events[i].pattern)
}

fn stitch_redundant(op: TimeBase, events: &[PatternEvent], at: Cursor, pattern: usize) -> bool {
    let index = events.partition_point(|e| op.is_before_or_equal(e.cursor, at));
    let prior = index.checked_sub(1).and_then(|i| events.get(i));
    let next = events.get(index);
    if let Some(prior) = prior {
        if prior.pattern == pattern {
            return true;
        }
    }
    if let Some(next) = next {
        if next.pattern == pattern && op.is_equal(at, next.cursor) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    const BPM: f64 = 120.0;
    const OP: TimeBase = TimeBase::Absolute;

    #[derive(Debug)]
    struct TestSelector {
        count: usize,
        active: usize,
        target: usize,
        calls: Vec<usize>,
    }
    impl TestSelector {
        fn new(count: usize) -> Self {
            TestSelector {
                count,
                active: 0,
                target: 0,
                calls: Vec::new(),
            }
        }
    }
    impl PatternSelector for TestSelector {
        fn pattern_count(&self) -> usize {
            self.count
        }
        fn active_pattern(&self) -> usize {
            self.active
        }
        fn target_pattern(&self) -> usize {
            self.target
        }
        fn go_pattern(&mut self, index: usize) -> bool {
            if index >= self.count {
                return false;
            }
            self.calls.push(index);
            self.target = index;
            self.active = index;
            true
        }
    }

    fn at(millis: f64) -> Cursor {
        Cursor::from_millis(millis, BPM).unwrap()
    }

    #[test]
    fn recording_pins_the_previous_selection() {
        let mut lane = PatternLane::new();
        lane.arm_recording(Some(2));
        lane.record_select(OP, at(400.0), 5);
        lane.commit_record_queue(OP, true);

        let patterns: Vec<(f64, usize)> = lane
            .events()
            .iter()
            .map(|e| (e.cursor.millis(), e.pattern))
            .collect();
        assert_eq!(patterns, vec![(400.0, 2), (400.0, 5)]);
    }

    #[test]
    fn playback_holds_the_prior_selection() {
        let mut lane = PatternLane::new();
        lane.insert_select(OP, at(0.0), 1);
        lane.insert_select(OP, at(500.0), 3);

        let mut selector = TestSelector::new(8);
        lane.play_cursor(OP, at(100.0), at(200.0), false, Some(&mut selector));
        assert_eq!(selector.calls, vec![1]);

        lane.play_cursor(OP, at(200.0), at(600.0), false, Some(&mut selector));
        assert_eq!(selector.calls, vec![1, 3]);
    }

    #[test]
    fn repeated_selection_is_not_resent() {
        let mut lane = PatternLane::new();
        lane.insert_select(OP, at(0.0), 4);

        let mut selector = TestSelector::new(8);
        lane.play_cursor(OP, at(0.0), at(100.0), false, Some(&mut selector));
        lane.play_cursor(OP, at(100.0), at(200.0), false, Some(&mut selector));
        assert_eq!(selector.calls, vec![4]);
    }

    #[test]
    fn missing_pattern_is_skipped() {
        let mut lane = PatternLane::new();
        lane.insert_select(OP, at(0.0), 12);

        let mut selector = TestSelector::new(4);
        lane.play_cursor(OP, at(0.0), at(100.0), false, Some(&mut selector));
        assert!(selector.calls.is_empty());
    }

    #[test]
    fn initialize_primes_the_selector() {
        let mut lane = PatternLane::new();
        lane.insert_select(OP, at(0.0), 1);
        lane.insert_select(OP, at(500.0), 3);

        let mut selector = TestSelector::new(8);
        lane.initialize_cursor_playback(OP, at(700.0), Some(&mut selector));
        assert_eq!(selector.calls, vec![3]);
    }

    #[test]
    fn reverse_shifts_held_selections() {
        let mut lane = PatternLane::new();
        let a = lane.insert_select(OP, at(100.0), 1);
        let b = lane.insert_select(OP, at(200.0), 2);
        let c = lane.insert_select(OP, at(300.0), 3);

        let edit = LaneEdit {
            operation: EditOperation::ReverseRightToLeft,
            from_min: at(100.0),
            from_max: at(300.0),
            to_min: at(100.0),
            to_max: at(300.0),
            targets: std::collections::HashMap::from([
                (a, at(300.0)),
                (b, at(200.0)),
                (c, at(100.0)),
            ]),
            originals: std::collections::HashMap::from([
                (a, super::super::EditOrigin { cursor: at(100.0), value: 1.0 }),
                (b, super::super::EditOrigin { cursor: at(200.0), value: 2.0 }),
                (c, super::super::EditOrigin { cursor: at(300.0), value: 3.0 }),
            ]),
        };
        lane.set_events_cursors(OP, &edit);

        let patterns: Vec<(f64, usize)> = lane
            .events()
            .iter()
            .map(|e| (e.cursor.millis(), e.pattern))
            .collect();
        assert_eq!(patterns, vec![(100.0, 2), (200.0, 1), (300.0, 1)]);
    }
}

use std::collections::VecDeque;
use std::sync::Arc;

use super::{EditOperation, LaneEdit};
use crate::engine::components::cursor::{Cursor, TimeBase};
use crate::engine::components::event_list::{EventId, EventList, EventListView, Timed};
use crate::engine::traits::{ParameterTarget, TargetKind};

/// Recorded changes further than this from the previous event get a
/// smoothing stitch, so a knob held still does not smear into a long ramp.
const SMOOTHING_THRESHOLD_MS: f64 = 250.0;

/// Above this a trigger input counts as firing.
const TRIGGER_THRESHOLD: f64 = 0.5;

/// One point of a parameter envelope.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamEvent {
    pub id: EventId,
    pub cursor: Cursor,
    /// Normalized value in `[0, 1]`.
    pub value: f64,
}

impl Timed for ParamEvent {
    fn cursor(&self) -> Cursor {
        self.cursor
    }
    fn id(&self) -> EventId {
        self.id
    }
}

/// Envelope behavior of a parameter lane, selected by the target's declared
/// kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamLaneKind {
    /// Continuous envelope, interpolated between points.
    Normalized,
    /// On/off value held until the next event.
    SteppedBool,
    /// Discrete selection held until the next event.
    Discrete,
    /// Fires when traversed, never interpolated.
    Trigger,
}

impl ParamLaneKind {
    pub fn from_target(kind: TargetKind) -> Self {
        match kind {
            TargetKind::Normalized => ParamLaneKind::Normalized,
            TargetKind::Bool => ParamLaneKind::SteppedBool,
            TargetKind::Discrete => ParamLaneKind::Discrete,
            TargetKind::Trigger => ParamLaneKind::Trigger,
        }
    }

    pub fn interpolates(&self) -> bool {
        matches!(self, ParamLaneKind::Normalized)
    }

    /// Whether edits on this lane synthesize continuity events.
    pub fn stitches(&self) -> bool {
        !matches!(self, ParamLaneKind::Trigger)
    }
}

/// Automation lane driving one normalized parameter.
#[derive(Debug)]
pub struct ParameterLane {
    target: Arc<dyn ParameterTarget>,
    kind: ParamLaneKind,
    events: EventList<ParamEvent>,
    record_queue: VecDeque<ParamEvent>,
    overdub_active: bool,
    /// The target's value when recording was armed; the floor an otherwise
    /// empty lane stitches back to.
    initial_value: f64,
    last_input: f64,
    /// Guards against the parameter's feedback notification re-entering the
    /// recording path while this lane is writing to it.
    playing_back: bool,
    ui_height: u32,
    id_seq: EventId,
}

impl ParameterLane {
    pub fn new(target: Arc<dyn ParameterTarget>) -> Self {
        let kind = ParamLaneKind::from_target(target.kind());
        let initial_value = target.base_normalized();
        ParameterLane {
            target,
            kind,
            events: EventList::new(),
            record_queue: VecDeque::new(),
            overdub_active: false,
            initial_value,
            last_input: initial_value,
            playing_back: false,
            ui_height: 0,
            id_seq: 0,
        }
    }

    pub fn kind(&self) -> ParamLaneKind {
        self.kind
    }
    pub fn events(&self) -> &[ParamEvent] {
        self.events.events()
    }
    pub fn view(&self) -> EventListView<ParamEvent> {
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
    pub(crate) fn is_playing_back(&self) -> bool {
        self.playing_back
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

    fn make_event(&mut self, cursor: Cursor, value: f64) -> ParamEvent {
        ParamEvent {
            id: self.next_id(),
            cursor,
            value,
        }
    }

    pub(crate) fn arm_recording(&mut self) {
        self.initial_value = self.target.base_normalized();
        self.last_input = self.initial_value;
    }

    /// Queues a change observed on the target at `at`. Stitch events that
    /// preserve the pre-record shape are queued ahead of the change itself;
    /// the smoothing stitch only makes sense over existing material, so it
    /// is limited to overdub passes.
    pub(crate) fn record_change(&mut self, op: TimeBase, at: Cursor, value: f64, is_overdub: bool) {
        if self.kind == ParamLaneKind::Trigger {
            let rising = value > TRIGGER_THRESHOLD && self.last_input <= TRIGGER_THRESHOLD;
            self.last_input = value;
            if rising {
                let event = self.make_event(at, value.clamp(0.0, 1.0));
                self.record_queue.push_back(event);
                self.overdub_active = true;
            }
            return;
        }

        self.last_input = value;
        if let Some(stitch) = self.record_stitch(op, at, is_overdub) {
            self.record_queue.push_back(stitch);
        }
        let event = self.make_event(at, value.clamp(0.0, 1.0));
        self.record_queue.push_back(event);
        self.overdub_active = true;
    }

    fn record_stitch(&mut self, op: TimeBase, at: Cursor, is_overdub: bool) -> Option<ParamEvent> {
        let index = self.events.insert_index(op, at);
        if index == 0 {
            // Nothing recorded before this point yet. Pin the value the
            // envelope had here, so the new material does not ramp out of
            // whatever comes later (or out of the captured floor).
            let value = match self.events.first() {
                Some(ahead) => ahead.value,
                None => self.initial_value,
            };
            return Some(self.make_event(at, value));
        }

        let prev = *self.events.get(index - 1)?;
        if is_overdub
            && self.kind.interpolates()
            && at.millis() - prev.cursor.millis() > SMOOTHING_THRESHOLD_MS
        {
            let value = match self.events.get(index) {
                Some(next) => {
                    let t = op.lerp_factor(at, prev.cursor, next.cursor);
                    prev.value + (next.value - prev.value) * t
                }
                None => prev.value,
            };
            return Some(self.make_event(at, value));
        }
        None
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

    pub fn insert_event(&mut self, op: TimeBase, at: Cursor, value: f64) -> EventId {
        let event = self.make_event(at, value.clamp(0.0, 1.0));
        let id = event.id;
        self.events.insert_sorted(op, event);
        id
    }

    /// Moves an event, clamped between its neighbors so the order holds.
    /// Returns whether anything changed.
    pub fn move_event(&mut self, op: TimeBase, id: EventId, to: Cursor) -> bool {
        let Some(index) = self.events.find(id) else {
            return false;
        };
        let lo = if index > 0 {
            self.events.events()[index - 1].cursor
        } else {
            Cursor::ZERO
        };
        let mut clamped = op.max(to, lo);
        if let Some(next) = self.events.get(index + 1) {
            clamped = op.min(clamped, next.cursor);
        }
        let current = self.events.events()[index].cursor;
        if clamped == current {
            return false;
        }
        self.events.update(|events| events[index].cursor = clamped);
        true
    }

    pub fn remove_event(&mut self, id: EventId) -> bool {
        self.events.remove(id).is_some()
    }

    pub fn remove_range(&mut self, op: TimeBase, lo: Cursor, hi: Cursor) {
        self.events.remove_range(op, lo, hi, true);
    }

    /// Replaces the lane contents from persisted data in one publish.
    pub(crate) fn load_events(&mut self, op: TimeBase, items: impl IntoIterator<Item = (Cursor, f64)>) {
        let mut events: Vec<ParamEvent> = items
            .into_iter()
            .map(|(cursor, value)| {
                let id = self.next_id();
                ParamEvent {
                    id,
                    cursor,
                    value: value.clamp(0.0, 1.0),
                }
            })
            .collect();
        events.sort_by(|a, b| op.cmp(a.cursor, b.cursor));
        self.events.set(events);
    }

    /// Events starting at the play index of `from`, shifted by `offset`.
    pub fn events_from(
        &self,
        op: TimeBase,
        from: Cursor,
        offset: isize,
    ) -> impl Iterator<Item = &ParamEvent> {
        let start = (self.events.play_index(op, from) as isize + offset)
            .clamp(0, self.events.len() as isize) as usize;
        self.events.events()[start..].iter()
    }

    /// Reflects the envelope at `at` onto the target before playback sweeps
    /// start arriving.
    pub(crate) fn initialize_cursor_playback(&mut self, op: TimeBase, at: Cursor) {
        if self.kind == ParamLaneKind::Trigger || self.events.is_empty() {
            return;
        }
        self.playing_back = true;
        let value = envelope_at(self.kind, op, self.events.events(), at, self.initial_value);
        self.target.set_normalized(value);
        self.playing_back = false;
    }

    pub(crate) fn jump_cursor(&mut self, op: TimeBase, to: Cursor) {
        self.initialize_cursor_playback(op, to);
    }

    /// Applies the envelope over `(from, to]` (or `(from, to)` when not
    /// inclusive) to the target.
    pub(crate) fn play_cursor(&mut self, op: TimeBase, from: Cursor, to: Cursor, inclusive: bool) {
        self.playing_back = true;
        if self.kind == ParamLaneKind::Trigger {
            let start = self.events.insert_index(op, from);
            let end = if inclusive {
                self.events.insert_index(op, to)
            } else {
                self.events.play_index(op, to)
            };
            for index in start..end {
                let value = self.events.events()[index].value;
                self.target.set_normalized(value);
            }
        } else if !self.events.is_empty() {
            let next_index = self.events.play_index(op, to).min(self.events.len() - 1);
            let next = self.events.events()[next_index];
            let prior = if next_index > 0 {
                Some(self.events.events()[next_index - 1])
            } else {
                None
            };

            if op.is_after(from, next.cursor) {
                // Past every event on the lane.
            } else if prior.is_none() || op.is_after(to, next.cursor) {
                self.target.set_normalized(next.value);
            } else if self.kind.interpolates() {
                let prior = prior.expect("prior checked above");
                let t = op.lerp_factor(to, prior.cursor, next.cursor);
                self.target
                    .set_normalized(prior.value + (next.value - prior.value) * t);
            } else {
                self.target.set_normalized(prior.expect("prior checked above").value);
            }
        }
        self.playing_back = false;
    }

    /// One atomic overdub step: erase the swept range, land the queued
    /// events, stitch both ends and reflect the result on the target.
    pub(crate) fn overdub_cursor(
        &mut self,
        op: TimeBase,
        from: Cursor,
        to: Cursor,
        inclusive: bool,
        length: Cursor,
    ) {
        // Armed but with nothing recorded yet, an overdub step is plain
        // playback; boundary stitches would only litter the envelope.
        if !self.overdub_active && self.record_queue.is_empty() {
            self.play_cursor(op, from, to, inclusive);
            return;
        }

        self.events.begin();

        let outer = if self.kind.stitches() && op.is_before(to, length) {
            Some(envelope_at(
                self.kind,
                op,
                self.events.events(),
                to,
                self.initial_value,
            ))
        } else {
            None
        };

        if self.overdub_active {
            self.events.remove_range(op, from, to, inclusive);
        }
        self.commit_record_queue(op, false);

        let inner = self.kind.stitches().then(|| {
            held_value_before(op, self.events.events(), to, self.initial_value)
        });

        self.play_cursor(op, from, to, inclusive);

        if let Some(value) = inner {
            self.apply_stitch(op, to, value);
        }
        if let Some(value) = outer {
            self.apply_stitch(op, to, value);
        }

        self.events.commit();
    }

    pub(crate) fn on_stop_recording(&mut self) {
        self.overdub_active = false;
    }

    fn apply_stitch(&mut self, op: TimeBase, at: Cursor, value: f64) {
        if stitch_redundant(
            op,
            self.events.events(),
            at,
            value,
            self.kind.interpolates(),
        ) {
            log::debug!("dropping redundant stitch at {:?}", at);
            return;
        }
        let event = self.make_event(at, value);
        self.events.insert_sorted(op, event);
    }

    /// Applies a range edit. See [`LaneEdit`] for the contract.
    pub fn set_events_cursors(&mut self, op: TimeBase, edit: &LaneEdit) {
        self.events.begin();

        self.events.update(|events| {
            for event in events.iter_mut() {
                if let Some(origin) = edit.originals.get(&event.id) {
                    event.cursor = origin.cursor;
                    event.value = origin.value;
                }
            }
            events.sort_by(|a, b| op.cmp(a.cursor, b.cursor));
        });

        if edit.operation == EditOperation::None {
            self.events.commit();
            return;
        }

        let original: Vec<ParamEvent> = self.events.events().to_vec();
        let stitching = self.kind.stitches() && !edit.operation.is_reverse();

        // Clearing wants the range's influence gone, so only relocations
        // restate the envelope's continuation past the range.
        let relocates = matches!(
            edit.operation,
            EditOperation::StretchLeft
                | EditOperation::StretchRight
                | EditOperation::MoveLeft
                | EditOperation::MoveRight
                | EditOperation::ShortenLeft
                | EditOperation::ShortenRight
        );
        let outer_min_at = op.min(edit.from_min, edit.to_min);
        let outer_max_at = op.max(edit.from_max, edit.to_max);
        let outer_min = stitching
            .then(|| held_value_before(op, &original, outer_min_at, self.initial_value));
        let outer_max = (stitching && relocates)
            .then(|| envelope_at(self.kind, op, &original, outer_max_at, self.initial_value));

        // Clobber the destination range; anything not being repositioned is
        // gone for good.
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

        if edit.operation.is_reverse() && !self.kind.interpolates() {
            shift_held_values(&mut moved);
        }

        for event in moved {
            self.events.insert_sorted(op, event);
        }

        if stitching {
            if let Some(value) = outer_min {
                self.apply_stitch(op, outer_min_at, value);
            }
            let inner_min =
                envelope_at(self.kind, op, self.events.events(), edit.to_min, self.initial_value);
            self.apply_stitch(op, edit.to_min, inner_min);
            let inner_max =
                held_value_before(op, self.events.events(), edit.to_max, self.initial_value);
            self.apply_stitch(op, edit.to_max, inner_max);
            if let Some(value) = outer_max {
                self.apply_stitch(op, outer_max_at, value);
            }
        }

        self.events.commit();
    }
}

/// Reversing a window of held values by position alone shifts the pattern by
/// one step; taking over the successor's value restores the mirror.
pub(super) fn shift_held_values(events: &mut [ParamEvent]) {
    for index in 0..events.len().saturating_sub(1) {
        events[index].value = events[index + 1].value;
    }
}

/// Envelope value at `at`: interpolated between the surrounding points for
/// continuous lanes, the previous point's value otherwise. Before the first
/// event the envelope reads as the first event's value; on an empty lane as
/// `fallback`.
pub(super) fn envelope_at(
    kind: ParamLaneKind,
    op: TimeBase,
    events: &[ParamEvent],
    at: Cursor,
    fallback: f64,
) -> f64 {
    let index = events.partition_point(|e| op.is_before_or_equal(e.cursor, at));
    if index == 0 {
        return events.first().map(|e| e.value).unwrap_or(fallback);
    }
    let prev = events[index - 1];
    if !kind.interpolates() || op.is_equal(prev.cursor, at) {
        return prev.value;
    }
    match events.get(index) {
        Some(next) => {
            let t = op.lerp_factor(at, prev.cursor, next.cursor);
            prev.value + (next.value - prev.value) * t
        }
        None => prev.value,
    }
}

/// Value held by the last event strictly before `at`, or `fallback`.
pub(super) fn held_value_before(
    op: TimeBase,
    events: &[ParamEvent],
    at: Cursor,
    fallback: f64,
) -> f64 {
    let index = events.partition_point(|e| op.is_before(e.cursor, at));
    if index == 0 {
        return fallback;
    }
    events[index - 1].value
}

/// A stitch is pointless when its neighbors already pin the same value.
pub(super) fn stitch_redundant(
    op: TimeBase,
    events: &[ParamEvent],
    at: Cursor,
    value: f64,
    interpolates: bool,
) -> bool {
    let index = events.partition_point(|e| op.is_before_or_equal(e.cursor, at));
    let prior = index.checked_sub(1).and_then(|i| events.get(i));
    let next = events.get(index);

    if let (Some(prior), Some(next)) = (prior, next) {
        if prior.value == value && next.value == value {
            return true;
        }
    }
    if let Some(prior) = prior {
        if prior.value == value && (!interpolates || op.is_equal(at, prior.cursor)) {
            return true;
        }
    }
    if let Some(next) = next {
        if next.value == value && op.is_equal(at, next.cursor) {
            return true;
        }
    }
    false
}

use std::collections::VecDeque;

use super::{EditOperation, LaneEdit};
use crate::engine::components::cursor::{Cursor, TimeBase};
use crate::engine::components::event_list::{EventId, EventList, EventListView, Timed};
use crate::engine::traits::{
    ChannelId, InvalidNoteMessageError, Level, MidiSink, NoteCommand, NoteMessage, Pitch,
};

pub const PITCH_COUNT: usize = 128;

/// One endpoint of a note. Ons and offs are separate events linked through
/// `partner`; the pair is edited, removed and persisted as a unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoteEvent {
    pub id: EventId,
    pub cursor: Cursor,
    pub channel: ChannelId,
    pub command: NoteCommand,
    pub pitch: Pitch,
    pub velocity: Level,
    pub partner: Option<EventId>,
}

impl Timed for NoteEvent {
    fn cursor(&self) -> Cursor {
        self.cursor
    }
    fn id(&self) -> EventId {
        self.id
    }
}

#[derive(Debug, Clone, Copy)]
struct HeldNote {
    id: EventId,
    channel: ChannelId,
}

impl HeldNote {
    fn of(event: &NoteEvent) -> Self {
        HeldNote {
            id: event.id,
            channel: event.channel,
        }
    }
}

/// The clip's MIDI note lane.
///
/// Three per-pitch stacks track what is sounding and what is being written:
/// `playback_stack` holds the note-on last dispatched by playback,
/// `record_stack` the last on observed on the timeline before the cursor
/// (played or not), and `record_input_stack` the input-originated on
/// currently being recorded.
#[derive(Debug)]
pub struct NoteLane {
    events: EventList<NoteEvent>,
    record_queue: VecDeque<NoteEvent>,
    playback_stack: [Option<HeldNote>; PITCH_COUNT],
    record_stack: [Option<HeldNote>; PITCH_COUNT],
    record_input_stack: [Option<HeldNote>; PITCH_COUNT],
    overdub_active: bool,
    /// Events with an id at or above this were recorded in the current
    /// overdub pass and are safe from the pass's own erase sweeps. Reset at
    /// arm time and on every loop wrap, so the next pass can overwrite them.
    overdub_pass_floor: EventId,
    ui_height: u32,
    id_seq: EventId,
}

impl NoteLane {
    pub fn new() -> Self {
        NoteLane {
            events: EventList::new(),
            record_queue: VecDeque::new(),
            playback_stack: [None; PITCH_COUNT],
            record_stack: [None; PITCH_COUNT],
            record_input_stack: [None; PITCH_COUNT],
            overdub_active: false,
            overdub_pass_floor: EventId::MAX,
            ui_height: 0,
            id_seq: 0,
        }
    }

    pub(crate) fn arm_recording(&mut self) {
        self.overdub_pass_floor = self.id_seq;
    }

    pub fn events(&self) -> &[NoteEvent] {
        self.events.events()
    }
    pub fn view(&self) -> EventListView<NoteEvent> {
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

    fn make_event(
        &mut self,
        cursor: Cursor,
        channel: ChannelId,
        command: NoteCommand,
        pitch: Pitch,
        velocity: Level,
        partner: Option<EventId>,
    ) -> NoteEvent {
        NoteEvent {
            id: self.next_id(),
            cursor,
            channel,
            command,
            pitch,
            velocity,
            partner,
        }
    }

    /// Removes the off currently paired with `on_id`, wherever it sits.
    fn displace_partner(&mut self, on_id: EventId) {
        let old_partner = match self.events.find(on_id) {
            Some(index) => self.events.events()[index].partner,
            None => self
                .record_queue
                .iter()
                .find(|e| e.id == on_id)
                .and_then(|e| e.partner),
        };
        if let Some(old_off) = old_partner {
            if self.events.remove(old_off).is_none() {
                self.record_queue.retain(|e| e.id != old_off);
            }
        }
    }

    /// Points the already-queued or committed event `id` at its partner.
    fn link_partner(&mut self, id: EventId, partner: EventId) {
        if let Some(event) = self.record_queue.iter_mut().find(|e| e.id == id) {
            event.partner = Some(partner);
            return;
        }
        if let Some(index) = self.events.find(id) {
            self.events.update(|events| events[index].partner = Some(partner));
        }
    }

    /// Queues a note input at `at`.
    ///
    /// A second on at a pitch that is still open first closes the held note
    /// at the same cursor. An off without an open note is dropped; an off at
    /// an open pitch is forced onto the held note's channel.
    pub(crate) fn record_note(&mut self, at: Cursor, message: NoteMessage) {
        let pitch = message.pitch() as usize;
        match message.command() {
            NoteCommand::NoteOn => {
                if let Some(held) = self.record_stack[pitch] {
                    // The held note now ends here; whatever off it pointed
                    // at is obsolete and must go with it, or the pairing
                    // invariant breaks.
                    self.displace_partner(held.id);
                    let off = self.make_event(
                        at,
                        held.channel,
                        NoteCommand::NoteOff,
                        message.pitch(),
                        0,
                        Some(held.id),
                    );
                    self.link_partner(held.id, off.id);
                    self.record_queue.push_back(off);
                }
                let on = self.make_event(
                    at,
                    message.channel(),
                    NoteCommand::NoteOn,
                    message.pitch(),
                    message.velocity(),
                    None,
                );
                self.record_stack[pitch] = Some(HeldNote::of(&on));
                self.record_input_stack[pitch] = Some(HeldNote::of(&on));
                self.record_queue.push_back(on);
                self.overdub_active = true;
            }
            NoteCommand::NoteOff => {
                let Some(held) = self.record_stack[pitch] else {
                    return;
                };
                let off = self.make_event(
                    at,
                    held.channel,
                    NoteCommand::NoteOff,
                    message.pitch(),
                    message.velocity(),
                    Some(held.id),
                );
                self.link_partner(held.id, off.id);
                self.record_queue.push_back(off);
                self.record_stack[pitch] = None;
                self.record_input_stack[pitch] = None;
                self.overdub_active = true;
            }
        }
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

    /// Dispatches the events in `(from, to]` (or `(from, to)`).
    pub(crate) fn play_cursor(
        &mut self,
        op: TimeBase,
        from: Cursor,
        to: Cursor,
        inclusive: bool,
        midi: &mut dyn MidiSink,
    ) {
        let start = self.events.insert_index(op, from);
        let end = if inclusive {
            self.events.insert_index(op, to)
        } else {
            self.events.play_index(op, to)
        };
        for index in start..end {
            let event = self.events.events()[index];
            self.dispatch(event, midi);
        }
    }

    fn dispatch(&mut self, event: NoteEvent, midi: &mut dyn MidiSink) {
        let pitch = event.pitch as usize;
        match event.command {
            NoteCommand::NoteOn => {
                if let Some(held) = self.playback_stack[pitch].take() {
                    send_off(midi, held.channel, event.pitch);
                }
                match NoteMessage::new(
                    event.channel,
                    NoteCommand::NoteOn,
                    event.pitch,
                    event.velocity,
                ) {
                    Ok(message) => midi.send(message),
                    Err(error) => {
                        log::warn!("dropping unplayable note event: {}", error);
                        return;
                    }
                }
                self.playback_stack[pitch] = Some(HeldNote::of(&event));
                self.record_stack[pitch] = Some(HeldNote::of(&event));
            }
            NoteCommand::NoteOff => {
                self.record_stack[pitch] = None;
                if self.playback_stack[pitch].take().is_some() {
                    send_off(midi, event.channel, event.pitch);
                }
            }
        }
    }

    /// One atomic overdub step: notes whose span touches the swept range are
    /// erased as pairs, then the queued input lands and plays.
    pub(crate) fn overdub_cursor(
        &mut self,
        op: TimeBase,
        from: Cursor,
        to: Cursor,
        inclusive: bool,
        midi: &mut dyn MidiSink,
    ) {
        self.events.begin();
        if self.overdub_active {
            self.remove_intersecting_pairs(op, from, to, inclusive, self.overdub_pass_floor);
        }
        self.commit_record_queue(op, false);
        self.play_cursor(op, from, to, inclusive, midi);
        self.events.commit();
    }

    /// Removes every pair whose span `[on, off]` intersects `[from, to]`,
    /// skipping notes that are mid-recording and anything at or above
    /// `floor`. Orphaned offs inside the range go too.
    fn remove_intersecting_pairs(
        &mut self,
        op: TimeBase,
        from: Cursor,
        to: Cursor,
        inclusive: bool,
        floor: EventId,
    ) {
        let mut doomed: Vec<EventId> = Vec::new();
        for event in self.events.iter() {
            if event.id >= floor {
                continue;
            }
            match event.command {
                NoteCommand::NoteOn => {
                    if self.is_recording_input(event.id) {
                        continue;
                    }
                    let off_cursor = event.partner.and_then(|id| {
                        self.events
                            .find(id)
                            .map(|index| self.events.events()[index].cursor)
                            .or_else(|| {
                                self.record_queue
                                    .iter()
                                    .find(|e| e.id == id)
                                    .map(|e| e.cursor)
                            })
                    });
                    let starts_before_end = if inclusive {
                        op.is_before_or_equal(event.cursor, to)
                    } else {
                        op.is_before(event.cursor, to)
                    };
                    // A pair that never closes is treated as sounding forever.
                    let ends_after_start = off_cursor
                        .map(|c| op.is_after_or_equal(c, from))
                        .unwrap_or(true);
                    if starts_before_end && ends_after_start {
                        doomed.push(event.id);
                        if let Some(partner) = event.partner {
                            doomed.push(partner);
                        }
                    }
                }
                NoteCommand::NoteOff => {
                    if event.partner.is_none() && op.is_in_range(event.cursor, from, to) {
                        doomed.push(event.id);
                    }
                }
            }
        }
        if !doomed.is_empty() {
            self.events.remove_all(&doomed);
            // A doomed pair's off may still be sitting in the queue.
            self.record_queue.retain(|e| !doomed.contains(&e.id));
        }
    }

    fn is_recording_input(&self, id: EventId) -> bool {
        self.record_input_stack
            .iter()
            .flatten()
            .any(|held| held.id == id)
    }

    /// Silences everything playback is holding.
    pub(crate) fn on_stop_playback(&mut self, midi: &mut dyn MidiSink) {
        for pitch in 0..PITCH_COUNT {
            if let Some(held) = self.playback_stack[pitch].take() {
                send_off(midi, held.channel, pitch as Pitch);
            }
        }
    }

    /// Closes every note still being recorded with an off at the stop cursor.
    pub(crate) fn on_stop_recording(&mut self, _op: TimeBase, at: Cursor) {
        for pitch in 0..PITCH_COUNT {
            if let Some(held) = self.record_input_stack[pitch].take() {
                let off = self.make_event(
                    at,
                    held.channel,
                    NoteCommand::NoteOff,
                    pitch as Pitch,
                    0,
                    Some(held.id),
                );
                self.link_partner(held.id, off.id);
                self.record_queue.push_back(off);
                self.record_stack[pitch] = None;
            }
        }
        self.overdub_active = false;
    }

    /// Non-contiguous cursor move: stop what is sounding and rebuild the
    /// timeline stack for the destination.
    pub(crate) fn jump_cursor(
        &mut self,
        op: TimeBase,
        _from: Cursor,
        to: Cursor,
        midi: &mut dyn MidiSink,
    ) {
        self.on_stop_playback(midi);
        self.prime_record_stack(op, to);
        // A wrap starts a fresh overdub pass over the previous one.
        self.overdub_pass_floor = self.id_seq;
    }

    pub(crate) fn initialize_cursor_playback(&mut self, op: TimeBase, at: Cursor) {
        self.playback_stack = [None; PITCH_COUNT];
        self.prime_record_stack(op, at);
    }

    fn prime_record_stack(&mut self, op: TimeBase, to: Cursor) {
        self.record_stack = [None; PITCH_COUNT];
        let end = self.events.play_index(op, to);
        for index in 0..end {
            let event = self.events.events()[index];
            let pitch = event.pitch as usize;
            match event.command {
                NoteCommand::NoteOn => self.record_stack[pitch] = Some(HeldNote::of(&event)),
                NoteCommand::NoteOff => self.record_stack[pitch] = None,
            }
        }
    }

    /// Inserts a complete pair. Zero-length notes are allowed; the on always
    /// precedes its off in the order.
    pub fn insert_note(
        &mut self,
        op: TimeBase,
        on_at: Cursor,
        off_at: Cursor,
        channel: ChannelId,
        pitch: Pitch,
        velocity: Level,
    ) -> Result<(EventId, EventId), InvalidNoteMessageError> {
        NoteMessage::new(channel, NoteCommand::NoteOn, pitch, velocity)?;
        let (on_at, off_at) = if op.is_before_or_equal(on_at, off_at) {
            (on_at, off_at)
        } else {
            (off_at, on_at)
        };
        let mut on = self.make_event(on_at, channel, NoteCommand::NoteOn, pitch, velocity, None);
        let off = self.make_event(off_at, channel, NoteCommand::NoteOff, pitch, 0, Some(on.id));
        on.partner = Some(off.id);
        let (on_id, off_id) = (on.id, off.id);

        self.events.begin();
        self.events.insert_sorted(op, on);
        self.events.insert_sorted(op, off);
        self.events.commit();
        Ok((on_id, off_id))
    }

    /// Removes the pair `id` belongs to. Returns whether anything was removed.
    pub fn remove_note(&mut self, id: EventId) -> bool {
        let Some(index) = self.events.find(id) else {
            return false;
        };
        let partner = self.events.events()[index].partner;
        self.events.begin();
        self.events.remove(id);
        if let Some(partner) = partner {
            self.events.remove(partner);
        }
        self.events.commit();
        true
    }

    /// Repositions a pair (given either endpoint) and optionally rewrites
    /// its velocity, in one batch.
    pub fn edit_note(
        &mut self,
        op: TimeBase,
        id: EventId,
        on_at: Cursor,
        off_at: Cursor,
        velocity: Option<Level>,
    ) -> bool {
        let Some(index) = self.events.find(id) else {
            return false;
        };
        let event = self.events.events()[index];
        let (on_id, off_id) = match event.command {
            NoteCommand::NoteOn => (event.id, event.partner),
            NoteCommand::NoteOff => match event.partner {
                Some(partner) => (partner, Some(event.id)),
                None => return false,
            },
        };

        let (on_at, off_at) = if op.is_before_or_equal(on_at, off_at) {
            (on_at, off_at)
        } else {
            (off_at, on_at)
        };

        self.events.begin();
        let Some(mut on) = self.events.remove(on_id) else {
            self.events.commit();
            return false;
        };
        let off = off_id.and_then(|id| self.events.remove(id));
        on.cursor = on_at;
        if let Some(velocity) = velocity {
            on.velocity = velocity;
        }
        self.events.insert_sorted(op, on);
        if let Some(mut off) = off {
            off.cursor = off_at;
            self.events.insert_sorted(op, off);
        }
        self.events.commit();
        true
    }

    /// Removes every pair intersecting `[lo, hi]` in one batch.
    pub fn remove_range(&mut self, op: TimeBase, lo: Cursor, hi: Cursor) {
        self.events.begin();
        self.remove_intersecting_pairs(op, lo, hi, true, EventId::MAX);
        self.events.commit();
    }

    /// Applies a range edit. Notes have no stitches; pairs are repositioned
    /// as units and re-normalized so every on precedes its off.
    pub fn set_events_cursors(&mut self, op: TimeBase, edit: &LaneEdit) {
        self.events.begin();

        self.events.update(|events| {
            for event in events.iter_mut() {
                if let Some(origin) = edit.originals.get(&event.id) {
                    event.cursor = origin.cursor;
                }
            }
            events.sort_by(|a, b| op.cmp(a.cursor, b.cursor));
        });

        if edit.operation == EditOperation::None {
            self.events.commit();
            return;
        }

        // Clobber untouched pairs in the destination range.
        let mut doomed: Vec<EventId> = Vec::new();
        for event in self.events.iter() {
            if edit.targets.contains_key(&event.id) {
                continue;
            }
            if event
                .partner
                .map(|p| edit.targets.contains_key(&p))
                .unwrap_or(false)
            {
                continue;
            }
            if op.is_in_range(event.cursor, edit.to_min, edit.to_max) {
                doomed.push(event.id);
                if let Some(partner) = event.partner {
                    doomed.push(partner);
                }
            }
        }
        if !doomed.is_empty() {
            self.events.remove_all(&doomed);
        }

        let ids: Vec<EventId> = edit.targets.keys().copied().collect();
        let mut moved = self.events.remove_all(&ids);
        for event in &mut moved {
            if let Some(&target) = edit.targets.get(&event.id) {
                event.cursor = op.bound(target, edit.to_min, edit.to_max);
            }
        }

        // Re-normalize pairs where both endpoints moved: a mirror can leave
        // the off ahead of its on.
        for index in 0..moved.len() {
            let event = moved[index];
            if event.command != NoteCommand::NoteOn {
                continue;
            }
            let Some(partner) = event.partner else {
                continue;
            };
            if let Some(off_index) = moved.iter().position(|e| e.id == partner) {
                if op.is_after(moved[index].cursor, moved[off_index].cursor) {
                    let on_cursor = moved[index].cursor;
                    moved[index].cursor = moved[off_index].cursor;
                    moved[off_index].cursor = on_cursor;
                }
            }
        }

        moved.sort_by(|a, b| match op.cmp(a.cursor, b.cursor) {
            // Zero-length pairs keep the on ahead of the off.
            std::cmp::Ordering::Equal => match (a.command, b.command) {
                (NoteCommand::NoteOn, NoteCommand::NoteOff) => std::cmp::Ordering::Less,
                (NoteCommand::NoteOff, NoteCommand::NoteOn) => std::cmp::Ordering::Greater,
                _ => std::cmp::Ordering::Equal,
            },
            other => other,
        });
        for event in moved {
            self.events.insert_sorted(op, event);
        }

        self.events.commit();
    }

    /// Replaces the lane contents from persisted data, relinking pairs, in
    /// one publish.
    pub(crate) fn load_events(
        &mut self,
        op: TimeBase,
        items: impl IntoIterator<Item = (Cursor, ChannelId, NoteCommand, Pitch, Level)>,
    ) {
        let mut events: Vec<NoteEvent> = items
            .into_iter()
            .map(|(cursor, channel, command, pitch, velocity)| {
                let id = self.next_id();
                NoteEvent {
                    id,
                    cursor,
                    channel,
                    command,
                    pitch,
                    velocity,
                    partner: None,
                }
            })
            .collect();
        events.sort_by(|a, b| op.cmp(a.cursor, b.cursor));
        self.events.begin();
        self.events.set(events);
        self.repair_pairs();
        self.events.commit();
    }

    /// Relinks on/off partners after a load, scanning per pitch. Offs with
    /// no preceding open on are left unlinked and reported.
    pub(crate) fn repair_pairs(&mut self) {
        self.events.update(|events| {
            let mut open: [Option<usize>; PITCH_COUNT] = [None; PITCH_COUNT];
            for index in 0..events.len() {
                let pitch = events[index].pitch as usize;
                match events[index].command {
                    NoteCommand::NoteOn => {
                        events[index].partner = None;
                        open[pitch] = Some(index);
                    }
                    NoteCommand::NoteOff => match open[pitch].take() {
                        Some(on_index) => {
                            let (on_id, off_id) = (events[on_index].id, events[index].id);
                            events[index].partner = Some(on_id);
                            events[index].channel = events[on_index].channel;
                            events[on_index].partner = Some(off_id);
                        }
                        None => {
                            events[index].partner = None;
                            log::warn!(
                                "note off without a matching on at {:?}",
                                events[index].cursor
                            );
                        }
                    },
                }
            }
        });
    }
}

impl Default for NoteLane {
    fn default() -> Self {
        Self::new()
    }
}

/// A note-off that cannot be built is logged and dropped; the tick never
/// fails over a bad message.
fn send_off(midi: &mut dyn MidiSink, channel: ChannelId, pitch: Pitch) {
    match NoteMessage::new(channel, NoteCommand::NoteOff, pitch, 0) {
        Ok(message) => midi.send(message),
        Err(error) => log::warn!("dropping invalid synthesized note off: {}", error),
    }
}

mod note;
mod parameter;
mod pattern;

use std::collections::HashMap;

pub use note::{NoteEvent, NoteLane};
pub use parameter::{ParamEvent, ParamLaneKind, ParameterLane};
pub use pattern::{PatternEvent, PatternLane};

use crate::engine::components::cursor::{Cursor, TimeBase};
use crate::engine::components::event_list::EventId;
use crate::engine::traits::{MidiSink, PatternSelector};

/// Collaborators a lane may need while dispatching side effects. Parameter
/// lanes carry their own target handle; note and pattern lanes borrow these.
pub struct LaneContext<'a, 'b> {
    pub midi: &'a mut dyn MidiSink,
    pub selector: Option<&'b mut dyn PatternSelector>,
}

impl<'a, 'b> LaneContext<'a, 'b> {
    /// Fresh borrow of the same collaborators, scoped to this call. Needed
    /// whenever a context is handed to a lane more than once (e.g. once per
    /// loop iteration), since the lane methods tie their context's lifetime
    /// to the selector's.
    pub(crate) fn reborrow(&mut self) -> LaneContext<'_, '_> {
        LaneContext {
            midi: &mut *self.midi,
            selector: match &mut self.selector {
                Some(s) => Some(&mut **s),
                None => None,
            },
        }
    }
}

/// What a range edit does to the events between its bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOperation {
    None,
    StretchLeft,
    StretchRight,
    MoveLeft,
    MoveRight,
    ShortenLeft,
    ShortenRight,
    ClearLeft,
    ClearRight,
    ReverseLeftToRight,
    ReverseRightToLeft,
}

impl EditOperation {
    pub fn is_reverse(&self) -> bool {
        matches!(
            self,
            EditOperation::ReverseLeftToRight | EditOperation::ReverseRightToLeft
        )
    }
}

/// Pre-edit position and value of one edited event, used to rebase the edit
/// onto a known-good arrangement before applying it.
#[derive(Debug, Clone, Copy)]
pub struct EditOrigin {
    pub cursor: Cursor,
    /// Normalized value for parameter lanes, pattern index (as a float) for
    /// pattern lanes; ignored by note lanes.
    pub value: f64,
}

/// A range edit over a lane: stretch, move, shorten, clear or reverse the
/// events of `[from_min, from_max]` into `[to_min, to_max]`.
///
/// `targets` holds the destination cursor per edited event; `originals`
/// holds each edited event's pre-edit cursor and value. Applying an edit
/// always starts by restoring originals, so a sequence of in-progress edits
/// (a drag) can be replayed against the same base arrangement.
#[derive(Debug, Clone)]
pub struct LaneEdit {
    pub operation: EditOperation,
    pub from_min: Cursor,
    pub from_max: Cursor,
    pub to_min: Cursor,
    pub to_max: Cursor,
    pub targets: HashMap<EventId, Cursor>,
    pub originals: HashMap<EventId, EditOrigin>,
}

/// One automation lane of a clip.
#[derive(Debug)]
pub enum Lane {
    Parameter(ParameterLane),
    Note(NoteLane),
    Pattern(PatternLane),
}

impl Lane {
    pub fn ui_height(&self) -> u32 {
        match self {
            Lane::Parameter(lane) => lane.ui_height(),
            Lane::Note(lane) => lane.ui_height(),
            Lane::Pattern(lane) => lane.ui_height(),
        }
    }

    pub fn set_ui_height(&mut self, height: u32) {
        match self {
            Lane::Parameter(lane) => lane.set_ui_height(height),
            Lane::Note(lane) => lane.set_ui_height(height),
            Lane::Pattern(lane) => lane.set_ui_height(height),
        }
    }

    pub fn event_count(&self) -> usize {
        match self {
            Lane::Parameter(lane) => lane.events().len(),
            Lane::Note(lane) => lane.events().len(),
            Lane::Pattern(lane) => lane.events().len(),
        }
    }

    /// Cursor of the last event on the lane, committed or still queued.
    pub fn last_cursor(&self, op: TimeBase) -> Option<Cursor> {
        match self {
            Lane::Parameter(lane) => lane.last_cursor(op),
            Lane::Note(lane) => lane.last_cursor(op),
            Lane::Pattern(lane) => lane.last_cursor(op),
        }
    }

    pub(crate) fn arm_recording(&mut self, cx: &mut LaneContext) {
        match self {
            Lane::Parameter(lane) => lane.arm_recording(),
            Lane::Note(lane) => lane.arm_recording(),
            Lane::Pattern(lane) => {
                let active = cx.selector.as_deref().map(|s| s.active_pattern());
                lane.arm_recording(active);
            }
        }
    }

    pub(crate) fn initialize_cursor_playback<'a>(
        &mut self,
        op: TimeBase,
        at: Cursor,
        cx: &'a mut LaneContext<'a, 'a>,
    ) {
        match self {
            Lane::Parameter(lane) => lane.initialize_cursor_playback(op, at),
            Lane::Note(lane) => lane.initialize_cursor_playback(op, at),
            Lane::Pattern(lane) => {
                lane.initialize_cursor_playback(op, at, cx.selector.as_deref_mut())
            }
        }
    }

    pub(crate) fn commit_record_queue(&mut self, op: TimeBase, notify: bool) {
        match self {
            Lane::Parameter(lane) => lane.commit_record_queue(op, notify),
            Lane::Note(lane) => lane.commit_record_queue(op, notify),
            Lane::Pattern(lane) => lane.commit_record_queue(op, notify),
        }
    }

    pub(crate) fn play_cursor<'a>(
        &mut self,
        op: TimeBase,
        from: Cursor,
        to: Cursor,
        inclusive: bool,
        cx: &'a mut LaneContext<'a, 'a>,
    ) {
        match self {
            Lane::Parameter(lane) => lane.play_cursor(op, from, to, inclusive),
            Lane::Note(lane) => lane.play_cursor(op, from, to, inclusive, cx.midi),
            Lane::Pattern(lane) => {
                lane.play_cursor(op, from, to, inclusive, cx.selector.as_deref_mut())
            }
        }
    }

    pub(crate) fn overdub_cursor<'a>(
        &mut self,
        op: TimeBase,
        from: Cursor,
        to: Cursor,
        inclusive: bool,
        length: Cursor,
        cx: &'a mut LaneContext<'a, 'a>,
    ) {
        match self {
            Lane::Parameter(lane) => lane.overdub_cursor(op, from, to, inclusive, length),
            Lane::Note(lane) => lane.overdub_cursor(op, from, to, inclusive, cx.midi),
            Lane::Pattern(lane) => {
                lane.overdub_cursor(op, from, to, inclusive, length, cx.selector.as_deref_mut())
            }
        }
    }

    pub(crate) fn loop_cursor(&mut self, op: TimeBase, from: Cursor, to: Cursor, cx: &mut LaneContext) {
        match self {
            Lane::Parameter(_) => {}
            Lane::Note(lane) => lane.jump_cursor(op, from, to, cx.midi),
            Lane::Pattern(_) => {}
        }
    }

    pub(crate) fn jump_cursor<'a>(&mut self, op: TimeBase, from: Cursor, to: Cursor, cx: &'a mut LaneContext<'a, 'a>) {
        match self {
            Lane::Parameter(lane) => lane.jump_cursor(op, to),
            Lane::Note(lane) => lane.jump_cursor(op, from, to, cx.midi),
            Lane::Pattern(lane) => lane.jump_cursor(op, to, cx.selector.as_deref_mut()),
        }
    }

    pub(crate) fn on_stop_playback(&mut self, cx: &mut LaneContext) {
        match self {
            Lane::Parameter(_) => {}
            Lane::Note(lane) => lane.on_stop_playback(cx.midi),
            Lane::Pattern(_) => {}
        }
    }

    pub(crate) fn on_stop_recording(&mut self, op: TimeBase, at: Cursor) {
        match self {
            Lane::Parameter(lane) => lane.on_stop_recording(),
            Lane::Note(lane) => lane.on_stop_recording(op, at),
            Lane::Pattern(lane) => lane.on_stop_recording(),
        }
    }

    pub fn set_events_cursors(&mut self, op: TimeBase, edit: &LaneEdit) {
        match self {
            Lane::Parameter(lane) => lane.set_events_cursors(op, edit),
            Lane::Note(lane) => lane.set_events_cursors(op, edit),
            Lane::Pattern(lane) => lane.set_events_cursors(op, edit),
        }
    }

    pub fn as_parameter(&self) -> Option<&ParameterLane> {
        match self {
            Lane::Parameter(lane) => Some(lane),
            _ => None,
        }
    }
    pub fn as_parameter_mut(&mut self) -> Option<&mut ParameterLane> {
        match self {
            Lane::Parameter(lane) => Some(lane),
            _ => None,
        }
    }
}

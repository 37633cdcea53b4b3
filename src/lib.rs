#![allow(clippy::inconsistent_digit_grouping)]

mod engine;

pub use engine::error;
pub use engine::{
    BusKey, BusState, ChannelId, Clip, ClipAddress, ClipBus, ClipEngine, ClipPhase, ClipSnapshot,
    ClipState, Cursor, CursorState, Division, EditOperation, EditOrigin, EngineState, EventId,
    EventListView, Key, Lane, LaneEdit, LaneState, Level, MidiSink, NoteCommand, NoteEvent,
    NoteEventState, NoteLane, NoteLaneState, NoteMessage, ParamEvent, ParamEventState,
    ParamLaneKind, ParameterLane, ParameterLaneState, ParameterTarget, PatternEvent,
    PatternEventState, PatternLane, PatternLaneState, PatternSelector, Pitch, Schedule, TargetKey,
    TargetKind, TimeBase, Timed, Transport, NOTE_OFF, NOTE_ON,
};

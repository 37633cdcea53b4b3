#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use reprise::{
    ClipState, Cursor, CursorState, Division, LaneState, MidiSink, NoteEventState, NoteLaneState,
    NoteMessage, ParamEventState, ParameterLaneState, ParameterTarget, PatternSelector,
    TargetKind, TimeBase, Transport,
};

pub const BPM: f64 = 120.0;

fn millis_per_beat(bpm: f64) -> f64 {
    60_000.0 / bpm
}

#[derive(Debug)]
pub struct TransportState {
    pub now_ms: f64,
    pub bpm: f64,
    pub beats: f64,
    pub quantization: Option<Division>,
}

/// Test tempo source shared between the engine (boxed) and the test body.
#[derive(Debug, Clone)]
pub struct TransportHandle(Arc<Mutex<TransportState>>);

impl TransportHandle {
    pub fn new(bpm: f64) -> Self {
        TransportHandle(Arc::new(Mutex::new(TransportState {
            now_ms: 0.0,
            bpm,
            beats: 0.0,
            quantization: None,
        })))
    }

    pub fn boxed(&self) -> Box<dyn Transport> {
        Box::new(TransportHandle(Arc::clone(&self.0)))
    }

    pub fn advance_ms(&self, delta: f64) {
        let mut state = self.0.lock().unwrap();
        state.now_ms += delta;
        state.beats += delta / millis_per_beat(state.bpm);
    }

    pub fn set_quantization(&self, quantization: Option<Division>) {
        self.0.lock().unwrap().quantization = quantization;
    }

    pub fn rewind_to(&self, now_ms: f64, beats: f64) {
        let mut state = self.0.lock().unwrap();
        state.now_ms = now_ms;
        state.beats = beats;
    }
}

impl Transport for TransportHandle {
    fn now_ms(&self) -> f64 {
        self.0.lock().unwrap().now_ms
    }
    fn bpm(&self) -> f64 {
        self.0.lock().unwrap().bpm
    }
    fn beat_count(&self) -> u32 {
        self.0.lock().unwrap().beats as u32
    }
    fn beat_basis(&self) -> f64 {
        self.0.lock().unwrap().beats.fract()
    }
    fn launch_quantization(&self) -> Option<Division> {
        self.0.lock().unwrap().quantization
    }
}

/// MIDI sink shared between the engine (boxed) and the test body.
#[derive(Debug, Clone, Default)]
pub struct SinkHandle(Arc<Mutex<Vec<NoteMessage>>>);

impl SinkHandle {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn boxed(&self) -> Box<dyn MidiSink> {
        Box::new(SinkHandle(Arc::clone(&self.0)))
    }
    pub fn messages(&self) -> Vec<NoteMessage> {
        self.0.lock().unwrap().clone()
    }
    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

impl MidiSink for SinkHandle {
    fn send(&mut self, message: NoteMessage) {
        self.0.lock().unwrap().push(message);
    }
}

/// Parameter target recording every value the engine writes to it.
#[derive(Debug)]
pub struct TestTarget {
    kind: TargetKind,
    base: f64,
    seen: Mutex<Vec<f64>>,
}

impl TestTarget {
    pub fn new(kind: TargetKind, base: f64) -> Arc<Self> {
        Arc::new(TestTarget {
            kind,
            base,
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn values(&self) -> Vec<f64> {
        self.seen.lock().unwrap().clone()
    }
    pub fn last(&self) -> Option<f64> {
        self.seen.lock().unwrap().last().copied()
    }
}

impl ParameterTarget for TestTarget {
    fn kind(&self) -> TargetKind {
        self.kind
    }
    fn base_normalized(&self) -> f64 {
        self.base
    }
    fn set_normalized(&self, value: f64) {
        self.seen.lock().unwrap().push(value);
    }
}

pub fn at(millis: f64) -> Cursor {
    Cursor::from_millis(millis, BPM).unwrap()
}

/// A bare clip state with the given bounds and no lanes.
pub fn clip_state(index: u32, time_base: TimeBase, length: f64, loop_length: f64, looping: bool) -> ClipState {
    ClipState {
        index,
        reference_bpm: BPM,
        time_base,
        length: CursorState::of(at(length)),
        loop_start: CursorState::of(Cursor::ZERO),
        loop_length: CursorState::of(at(loop_length)),
        play_start: CursorState::of(Cursor::ZERO),
        play_end: CursorState::of(at(length)),
        looping,
        snapshot_enabled: false,
        snapshot_transition_enabled: true,
        automation_enabled: true,
        custom_snapshot_transition: false,
        lanes: vec![LaneState::MidiNote(NoteLaneState {
            ui_height: 0,
            events: Vec::new(),
        })],
    }
}

pub fn param_lane_state(path: &str, events: &[(f64, f64)]) -> LaneState {
    LaneState::Parameter(ParameterLaneState {
        path: path.to_string(),
        ui_height: 0,
        events: events
            .iter()
            .map(|&(millis, normalized)| ParamEventState {
                cursor: CursorState::of(at(millis)),
                normalized,
            })
            .collect(),
    })
}

pub fn note_lane_state(events: &[(f64, u8, u8, u8, u8)]) -> LaneState {
    LaneState::MidiNote(NoteLaneState {
        ui_height: 0,
        events: events
            .iter()
            .map(|&(millis, channel, command, data1, data2)| NoteEventState {
                cursor: CursorState::of(at(millis)),
                channel,
                command,
                data1,
                data2,
            })
            .collect(),
    })
}

#[derive(Debug)]
pub struct SelectorState {
    pub count: usize,
    pub active: usize,
    pub target: usize,
    pub calls: Vec<usize>,
}

/// Pattern selector shared between the engine (boxed) and the test body.
#[derive(Debug, Clone)]
pub struct SelectorHandle(Arc<Mutex<SelectorState>>);

impl SelectorHandle {
    pub fn new(count: usize) -> Self {
        SelectorHandle(Arc::new(Mutex::new(SelectorState {
            count,
            active: 0,
            target: 0,
            calls: Vec::new(),
        })))
    }
    pub fn boxed(&self) -> Box<dyn PatternSelector> {
        Box::new(SelectorHandle(Arc::clone(&self.0)))
    }
    pub fn calls(&self) -> Vec<usize> {
        self.0.lock().unwrap().calls.clone()
    }
}

impl PatternSelector for SelectorHandle {
    fn pattern_count(&self) -> usize {
        self.0.lock().unwrap().count
    }
    fn active_pattern(&self) -> usize {
        self.0.lock().unwrap().active
    }
    fn target_pattern(&self) -> usize {
        self.0.lock().unwrap().target
    }
    fn go_pattern(&mut self, index: usize) -> bool {
        let mut state = self.0.lock().unwrap();
        if index >= state.count {
            return false;
        }
        state.calls.push(index);
        state.target = index;
        state.active = index;
        true
    }
}

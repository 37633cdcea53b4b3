use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::components::clip::Clip;
use super::components::cursor::{Cursor, TimeBase};
use super::components::lane::Lane;
use super::traits::{NoteCommand, PatternSelector};
use super::{ClipBus, ClipEngine, InvalidBusError, RegisteredTarget, TargetKey};

/// Persisted cursor. The current form carries both projections; the legacy
/// form is a bare milliseconds value whose beat fields are recomputed from
/// the owning clip's reference BPM at load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CursorState {
    Full {
        millis: f64,
        #[serde(rename = "beatCount")]
        beat_count: u32,
        #[serde(rename = "beatBasis")]
        beat_basis: f64,
    },
    Legacy(f64),
}

impl CursorState {
    pub fn of(cursor: Cursor) -> Self {
        CursorState::Full {
            millis: cursor.millis(),
            beat_count: cursor.beat_count(),
            beat_basis: cursor.beat_basis(),
        }
    }

    pub fn to_cursor(&self, reference_bpm: f64) -> Cursor {
        match *self {
            CursorState::Full {
                millis,
                beat_count,
                beat_basis,
            } => match Cursor::new(millis, beat_count, beat_basis) {
                Ok(cursor) => cursor,
                Err(error) => {
                    log::warn!("clamping invalid persisted cursor: {}", error);
                    Cursor::compose(millis.max(0.0), beat_count as f64 + beat_basis.max(0.0))
                }
            },
            CursorState::Legacy(millis) => {
                Cursor::compose(millis.max(0.0), millis.max(0.0) * reference_bpm / 60_000.0)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamEventState {
    pub cursor: CursorState,
    pub normalized: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternEventState {
    pub cursor: CursorState,
    pub pattern: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteEventState {
    pub cursor: CursorState,
    pub channel: u8,
    pub command: u8,
    pub data1: u8,
    pub data2: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterLaneState {
    pub path: String,
    pub ui_height: u32,
    pub events: Vec<ParamEventState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternLaneState {
    pub ui_height: u32,
    pub events: Vec<PatternEventState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteLaneState {
    pub ui_height: u32,
    pub events: Vec<NoteEventState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "laneType")]
pub enum LaneState {
    #[serde(rename = "parameter")]
    Parameter(ParameterLaneState),
    #[serde(rename = "pattern")]
    Pattern(PatternLaneState),
    #[serde(rename = "midiNote")]
    MidiNote(NoteLaneState),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipState {
    pub index: u32,
    pub reference_bpm: f64,
    pub time_base: TimeBase,
    pub length: CursorState,
    pub loop_start: CursorState,
    pub loop_length: CursorState,
    pub play_start: CursorState,
    pub play_end: CursorState,
    #[serde(rename = "loop")]
    pub looping: bool,
    pub snapshot_enabled: bool,
    pub snapshot_transition_enabled: bool,
    pub automation_enabled: bool,
    pub custom_snapshot_transition: bool,
    pub lanes: Vec<LaneState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusState {
    pub armed: bool,
    pub clips: Vec<ClipState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineState {
    pub buses: Vec<BusState>,
}

impl ClipEngine {
    pub fn state(&self) -> EngineState {
        EngineState {
            buses: self.buses.iter().map(bus_state).collect(),
        }
    }

    pub fn bus_state(&self, key: super::BusKey) -> Result<BusState, InvalidBusError> {
        self.bus(key).map(bus_state)
    }

    /// Loads clip contents into already-built buses, matched by position.
    /// Targets and selectors must be registered before loading; anything a
    /// lane refers to that is missing is skipped, never fatal.
    pub fn load_state(&mut self, state: &EngineState) {
        if state.buses.len() > self.buses.len() {
            log::warn!(
                "state has {} buses but only {} exist; extra buses are skipped",
                state.buses.len(),
                self.buses.len()
            );
        }
        for (bus, bus_state) in self.buses.iter_mut().zip(&state.buses) {
            load_bus(bus, bus_state);
        }
    }

    pub fn load_bus_state(
        &mut self,
        key: super::BusKey,
        state: &BusState,
    ) -> Result<(), InvalidBusError> {
        let bus = self
            .buses
            .iter_mut()
            .find(|bus| bus.key() == key)
            .ok_or(InvalidBusError { key })?;
        load_bus(bus, state);
        Ok(())
    }
}

fn bus_state(bus: &ClipBus) -> BusState {
    BusState {
        armed: bus.is_armed(),
        clips: bus.clips().iter().map(|clip| clip_state(clip, bus)).collect(),
    }
}

fn clip_state(clip: &Clip, bus: &ClipBus) -> ClipState {
    let mut keyed = clip.parameter_lanes().into_iter();
    let lanes = clip
        .lanes()
        .iter()
        .filter_map(|lane| match lane {
            Lane::Parameter(_) => {
                let (key, lane) = keyed.next()?;
                let Some(path) = bus.target_path(key) else {
                    log::warn!("parameter lane without a registered target; not persisted");
                    return None;
                };
                Some(LaneState::Parameter(ParameterLaneState {
                    path: path.to_string(),
                    ui_height: lane.ui_height(),
                    events: lane
                        .events()
                        .iter()
                        .map(|e| ParamEventState {
                            cursor: CursorState::of(e.cursor),
                            normalized: e.value,
                        })
                        .collect(),
                }))
            }
            Lane::Pattern(lane) => Some(LaneState::Pattern(PatternLaneState {
                ui_height: lane.ui_height(),
                events: lane
                    .events()
                    .iter()
                    .map(|e| PatternEventState {
                        cursor: CursorState::of(e.cursor),
                        pattern: e.pattern,
                    })
                    .collect(),
            })),
            Lane::Note(lane) => Some(LaneState::MidiNote(NoteLaneState {
                ui_height: lane.ui_height(),
                events: lane
                    .events()
                    .iter()
                    .map(|e| NoteEventState {
                        cursor: CursorState::of(e.cursor),
                        channel: e.channel,
                        command: e.command.status(),
                        data1: e.pitch,
                        data2: e.velocity,
                    })
                    .collect(),
            })),
        })
        .collect();

    ClipState {
        index: clip.index(),
        reference_bpm: clip.reference_bpm(),
        time_base: clip.cursor_op(),
        length: CursorState::of(clip.length()),
        loop_start: CursorState::of(clip.loop_start()),
        loop_length: CursorState::of(clip.loop_length()),
        play_start: CursorState::of(clip.play_start()),
        play_end: CursorState::of(clip.play_end()),
        looping: clip.is_looping(),
        snapshot_enabled: clip.snapshot_enabled(),
        snapshot_transition_enabled: clip.snapshot_transition_enabled(),
        automation_enabled: clip.automation_enabled(),
        custom_snapshot_transition: clip.custom_snapshot_transition(),
        lanes,
    }
}

fn load_bus(bus: &mut ClipBus, state: &BusState) {
    bus.armed = state.armed;
    let mut clips = Vec::with_capacity(state.clips.len());
    for clip_state in &state.clips {
        clips.push(clip_from_state(
            clip_state,
            &bus.targets,
            bus.selector.as_deref(),
        ));
    }
    bus.clips = clips;
    bus.clip_index_seq = state
        .clips
        .iter()
        .map(|c| c.index + 1)
        .max()
        .unwrap_or(bus.clip_index_seq);
}

fn clip_from_state(
    state: &ClipState,
    targets: &HashMap<TargetKey, RegisteredTarget>,
    selector: Option<&dyn PatternSelector>,
) -> Clip {
    let bpm = state.reference_bpm;
    let op = state.time_base;
    let mut clip = Clip::new(state.index, op, bpm, selector.is_some());
    clip.set_bounds_from_state(
        state.length.to_cursor(bpm),
        state.loop_start.to_cursor(bpm),
        state.loop_length.to_cursor(bpm),
        state.play_start.to_cursor(bpm),
        state.play_end.to_cursor(bpm),
        state.looping,
    );
    clip.set_snapshot_enabled(state.snapshot_enabled);
    clip.set_snapshot_transition_enabled(state.snapshot_transition_enabled);
    clip.set_automation_enabled(state.automation_enabled);
    clip.set_custom_snapshot_transition(state.custom_snapshot_transition);

    for lane_state in &state.lanes {
        match lane_state {
            LaneState::Parameter(lane_state) => {
                let found = targets
                    .iter()
                    .find(|(_, registered)| registered.path == lane_state.path);
                let Some((&key, registered)) = found else {
                    log::warn!(
                        "skipping parameter lane for unknown target {:?}",
                        lane_state.path
                    );
                    continue;
                };
                let target = Arc::clone(&registered.target);
                let lane = clip.ensure_parameter_lane(key, &target);
                lane.set_ui_height(lane_state.ui_height);
                lane.load_events(
                    op,
                    lane_state
                        .events
                        .iter()
                        .map(|e| (e.cursor.to_cursor(bpm), e.normalized)),
                );
            }
            LaneState::Pattern(lane_state) => {
                let pattern_count = selector.map(|s| s.pattern_count()).unwrap_or(0);
                let Some(lane) = clip.pattern_lane_mut() else {
                    log::warn!("skipping pattern lane on a bus without a selector");
                    continue;
                };
                lane.set_ui_height(lane_state.ui_height);
                let events: Vec<(Cursor, usize)> = lane_state
                    .events
                    .iter()
                    .filter_map(|e| {
                        if e.pattern >= pattern_count {
                            log::warn!("skipping event for missing pattern {}", e.pattern);
                            return None;
                        }
                        Some((e.cursor.to_cursor(bpm), e.pattern))
                    })
                    .collect();
                lane.load_events(op, events);
            }
            LaneState::MidiNote(lane_state) => {
                let events: Vec<_> = lane_state
                    .events
                    .iter()
                    .filter_map(|e| {
                        let Some(command) = NoteCommand::from_status(e.command) else {
                            log::warn!("skipping note event with command {:#x}", e.command);
                            return None;
                        };
                        if e.channel >= 16 || e.data1 >= 128 || e.data2 >= 128 {
                            log::warn!("skipping out-of-range note event");
                            return None;
                        }
                        Some((e.cursor.to_cursor(bpm), e.channel, command, e.data1, e.data2))
                    })
                    .collect();
                let lane = clip.note_lane_mut();
                lane.set_ui_height(lane_state.ui_height);
                lane.load_events(op, events);
            }
        }
    }
    clip
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_cursor_is_recomputed_from_the_reference_bpm() {
        let state: ParamEventState =
            serde_json::from_str(r#"{ "cursor": 500.0, "normalized": 0.25 }"#).unwrap();
        let cursor = state.cursor.to_cursor(120.0);
        assert_eq!(cursor.millis(), 500.0);
        assert_eq!(cursor.total_beats(), 1.0);
    }

    #[test]
    fn full_cursor_form_roundtrips() {
        let cursor = Cursor::new(750.0, 1, 0.5).unwrap();
        let json = serde_json::to_string(&CursorState::of(cursor)).unwrap();
        let parsed: CursorState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.to_cursor(120.0), cursor);
    }

    #[test]
    fn lane_type_tags() {
        let json = r#"{ "laneType": "midiNote", "uiHeight": 40, "events": [] }"#;
        let state: LaneState = serde_json::from_str(json).unwrap();
        assert!(matches!(state, LaneState::MidiNote(_)));

        let json = r#"{ "laneType": "parameter", "path": "mixer/level", "uiHeight": 0, "events": [] }"#;
        let state: LaneState = serde_json::from_str(json).unwrap();
        assert!(matches!(state, LaneState::Parameter(_)));
    }
}

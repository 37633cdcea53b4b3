use std::collections::HashMap;
use std::error::Error;
use std::fmt::Display;
use std::sync::Arc;

mod components;
mod persist;
mod traits;
mod utils;

pub mod error;

pub use components::clip::{Clip, ClipPhase, InvalidClipBoundsError, PlayFromError};
pub use components::cursor::{Cursor, InvalidCursorError, InvalidScaleError, TimeBase};
pub use components::event_list::{EventId, EventListView, Timed};
pub use components::lane::{
    EditOperation, EditOrigin, Lane, LaneEdit, NoteEvent, NoteLane, ParamEvent, ParamLaneKind,
    ParameterLane, PatternEvent, PatternLane,
};
pub use persist::{
    BusState, ClipState, CursorState, EngineState, LaneState, NoteEventState, NoteLaneState,
    ParamEventState, ParameterLaneState, PatternEventState, PatternLaneState,
};
pub use traits::{
    ChannelId, ClipSnapshot, Division, InvalidNoteMessageError, Level, MidiSink, NoteCommand,
    NoteMessage, ParameterTarget, PatternSelector, Pitch, Schedule, TargetKind, Transport,
    NOTE_OFF, NOTE_ON,
};
pub use utils::{InvalidKeyError, Key, KeyCollisionError, KeyOverflowError};

use components::lane::LaneContext;
use utils::{key_type, KeyGenerator};

key_type!(BusKey, u32);
key_type!(TargetKey, u32);

/// Weak reference to a clip: a bus key and the clip's creation index.
/// Resolution fails quietly once either side is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClipAddress {
    pub bus: BusKey,
    pub clip: u32,
}

#[derive(Debug)]
struct RegisteredTarget {
    path: String,
    target: Arc<dyn ParameterTarget>,
}

/// One channel of clips sharing an arm flag, a registered-target table and
/// (optionally) a pattern selector. Launching a clip stops its siblings.
#[derive(Debug)]
pub struct ClipBus {
    key: BusKey,
    armed: bool,
    clips: Vec<Clip>,
    clip_index_seq: u32,
    targets: HashMap<TargetKey, RegisteredTarget>,
    target_keys: KeyGenerator<TargetKey>,
    selector: Option<Box<dyn PatternSelector>>,
}

impl ClipBus {
    fn new(key: BusKey, selector: Option<Box<dyn PatternSelector>>) -> Self {
        ClipBus {
            key,
            armed: false,
            clips: Vec::new(),
            clip_index_seq: 0,
            targets: HashMap::new(),
            target_keys: KeyGenerator::new(),
            selector,
        }
    }

    pub fn key(&self) -> BusKey {
        self.key
    }
    pub fn is_armed(&self) -> bool {
        self.armed
    }
    pub fn clips(&self) -> &[Clip] {
        &self.clips
    }
    pub fn has_selector(&self) -> bool {
        self.selector.is_some()
    }

    fn clip_position(&self, index: u32) -> Option<usize> {
        self.clips.iter().position(|clip| clip.index() == index)
    }

    pub(crate) fn target_path(&self, key: TargetKey) -> Option<&str> {
        self.targets.get(&key).map(|t| t.path.as_str())
    }
}

/// The engine facade: owns the buses, routes host input, drives the tick
/// and tracks the single globally focused clip.
#[derive(Debug)]
pub struct ClipEngine {
    transport: Box<dyn Transport>,
    midi: Box<dyn MidiSink>,
    buses: Vec<ClipBus>,
    bus_keys: KeyGenerator<BusKey>,
    focused: Option<ClipAddress>,
    focus_generation: u64,
}

impl ClipEngine {
    pub fn new(transport: Box<dyn Transport>, midi: Box<dyn MidiSink>) -> Self {
        ClipEngine {
            transport,
            midi,
            buses: Vec::new(),
            bus_keys: KeyGenerator::new(),
            focused: None,
            focus_generation: 0,
        }
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn add_bus(
        &mut self,
        selector: Option<Box<dyn PatternSelector>>,
    ) -> Result<BusKey, KeyOverflowError> {
        let key = self.bus_keys.next()?;
        self.buses.push(ClipBus::new(key, selector));
        Ok(key)
    }

    pub fn buses(&self) -> impl Iterator<Item = &ClipBus> {
        self.buses.iter()
    }

    pub fn bus(&self, key: BusKey) -> Result<&ClipBus, InvalidBusError> {
        self.buses
            .iter()
            .find(|bus| bus.key == key)
            .ok_or(InvalidBusError { key })
    }

    fn bus_mut(&mut self, key: BusKey) -> Result<&mut ClipBus, InvalidBusError> {
        self.buses
            .iter_mut()
            .find(|bus| bus.key == key)
            .ok_or(InvalidBusError { key })
    }

    /// Creates a clip on the bus with the next monotonic index. Buses with a
    /// selector get their permanent pattern lane alongside the note lane.
    pub fn add_clip(&mut self, bus: BusKey, time_base: TimeBase) -> Result<ClipAddress, InvalidBusError> {
        let bpm = self.transport.bpm();
        let bus = self.bus_mut(bus)?;
        let index = bus.clip_index_seq;
        bus.clip_index_seq += 1;
        let with_pattern_lane = bus.selector.is_some();
        bus.clips
            .push(Clip::new(index, time_base, bpm, with_pattern_lane));
        Ok(ClipAddress {
            bus: bus.key,
            clip: index,
        })
    }

    pub fn remove_clip(&mut self, address: ClipAddress) -> Result<(), InvalidClipError> {
        if self.focused == Some(address) {
            self.set_focused_clip(None);
        }
        let bus = self
            .bus_mut(address.bus)
            .map_err(|_| InvalidClipError { address })?;
        let position = bus
            .clip_position(address.clip)
            .ok_or(InvalidClipError { address })?;
        bus.clips.remove(position);
        Ok(())
    }

    pub fn clip(&self, address: ClipAddress) -> Result<&Clip, InvalidClipError> {
        let bus = self
            .bus(address.bus)
            .map_err(|_| InvalidClipError { address })?;
        let position = bus
            .clip_position(address.clip)
            .ok_or(InvalidClipError { address })?;
        Ok(&bus.clips[position])
    }

    pub fn clip_mut(&mut self, address: ClipAddress) -> Result<&mut Clip, InvalidClipError> {
        let bus = self
            .bus_mut(address.bus)
            .map_err(|_| InvalidClipError { address })?;
        let position = bus
            .clip_position(address.clip)
            .ok_or(InvalidClipError { address })?;
        Ok(&mut bus.clips[position])
    }

    pub fn set_armed(&mut self, bus: BusKey, armed: bool) -> Result<(), InvalidBusError> {
        self.bus_mut(bus)?.armed = armed;
        Ok(())
    }

    /// Registers a listenable target under a host path. The path doubles as
    /// the persistence identity of the target's lanes.
    pub fn register_target(
        &mut self,
        bus: BusKey,
        path: &str,
        target: Arc<dyn ParameterTarget>,
    ) -> Result<TargetKey, RegisterTargetError> {
        let bus = self.bus_mut(bus).map_err(RegisterTargetError::InvalidBus)?;
        let key = bus
            .target_keys
            .next()
            .map_err(RegisterTargetError::Overflow)?;
        bus.targets.insert(
            key,
            RegisteredTarget {
                path: path.to_string(),
                target,
            },
        );
        Ok(key)
    }

    /// Unregisters a target and drops its lanes from every clip on the bus.
    pub fn unregister_target(&mut self, bus: BusKey, key: TargetKey) -> Result<(), InvalidBusError> {
        let bus = self.bus_mut(bus)?;
        if bus.targets.remove(&key).is_some() {
            bus.target_keys
                .free(key)
                .expect("registered target key must be a live key");
            for clip in &mut bus.clips {
                clip.remove_parameter_lanes(&[key]);
            }
        }
        Ok(())
    }

    /// Tears down every target whose path sits under `component_path`,
    /// dropping their lanes along the way.
    pub fn unregister_component(
        &mut self,
        bus: BusKey,
        component_path: &str,
    ) -> Result<(), InvalidBusError> {
        let bus = self.bus_mut(bus)?;
        let doomed: Vec<TargetKey> = bus
            .targets
            .iter()
            .filter(|(_, registered)| registered.path.starts_with(component_path))
            .map(|(&key, _)| key)
            .collect();
        for &key in &doomed {
            bus.targets.remove(&key);
            bus.target_keys
                .free(key)
                .expect("registered target key must be a live key");
        }
        if !doomed.is_empty() {
            for clip in &mut bus.clips {
                clip.remove_parameter_lanes(&doomed);
            }
        }
        Ok(())
    }

    /// Host-side notification of a parameter change. Recording clips write
    /// it down, creating the lane on first touch; a change fed back by a
    /// lane's own playback is ignored.
    pub fn parameter_changed(&mut self, bus: BusKey, key: TargetKey, value: f64) {
        let Ok(bus) = self.bus_mut(bus) else {
            return;
        };
        if !bus.armed {
            return;
        }
        let Some(registered) = bus.targets.get(&key) else {
            log::warn!("parameter change for an unregistered target; dropping");
            return;
        };
        let target = Arc::clone(&registered.target);
        for clip in &mut bus.clips {
            let is_overdub = match clip.phase() {
                ClipPhase::RecordingFirst => false,
                ClipPhase::Overdubbing => true,
                _ => continue,
            };
            if clip
                .parameter_lane(key)
                .map(|lane| lane.is_playing_back())
                .unwrap_or(false)
            {
                continue;
            }
            let op = clip.cursor_op();
            let cursor = clip.cursor();
            let lane = clip.ensure_parameter_lane(key, &target);
            lane.record_change(op, cursor, value, is_overdub);
        }
    }

    /// Host-side note input, recorded by whichever clip on the bus is
    /// recording.
    pub fn note_input(&mut self, bus: BusKey, message: NoteMessage) {
        let Ok(bus) = self.bus_mut(bus) else {
            return;
        };
        if !bus.armed {
            return;
        }
        for clip in &mut bus.clips {
            match clip.phase() {
                ClipPhase::RecordingFirst | ClipPhase::Overdubbing => {
                    let cursor = clip.cursor();
                    clip.note_lane_mut().record_note(cursor, message);
                }
                _ => {}
            }
        }
    }

    /// Host-side pattern selection change, recorded onto pattern lanes.
    pub fn pattern_changed(&mut self, bus: BusKey, pattern: usize) {
        let Ok(bus) = self.bus_mut(bus) else {
            return;
        };
        if !bus.armed {
            return;
        }
        for clip in &mut bus.clips {
            match clip.phase() {
                ClipPhase::RecordingFirst | ClipPhase::Overdubbing => {
                    let op = clip.cursor_op();
                    let cursor = clip.cursor();
                    if let Some(lane) = clip.pattern_lane_mut() {
                        lane.record_select(op, cursor, pattern);
                    }
                }
                _ => {}
            }
        }
    }

    /// Splits the borrow so a clip can be driven while the transport is read.
    fn clip_with_transport(
        &mut self,
        address: ClipAddress,
    ) -> Result<(&dyn Transport, &mut Clip), InvalidClipError> {
        let ClipEngine {
            transport, buses, ..
        } = self;
        let bus = buses
            .iter_mut()
            .find(|bus| bus.key == address.bus)
            .ok_or(InvalidClipError { address })?;
        let position = bus
            .clip_position(address.clip)
            .ok_or(InvalidClipError { address })?;
        Ok((transport.as_ref(), &mut bus.clips[position]))
    }

    pub fn launch_clip(&mut self, address: ClipAddress) -> Result<(), InvalidClipError> {
        let (transport, clip) = self.clip_with_transport(address)?;
        clip.launch(transport);
        Ok(())
    }

    pub fn launch_clip_automation_from(
        &mut self,
        address: ClipAddress,
        from: Cursor,
    ) -> Result<(), InvalidClipError> {
        let (transport, clip) = self.clip_with_transport(address)?;
        clip.launch_automation_from(from, transport);
        Ok(())
    }

    pub fn play_clip_from(
        &mut self,
        address: ClipAddress,
        from: Cursor,
    ) -> Result<(), LaunchClipError> {
        let (transport, clip) = self
            .clip_with_transport(address)
            .map_err(LaunchClipError::InvalidClip)?;
        clip.play_from(from, transport)
            .map_err(LaunchClipError::PlayFrom)
    }

    /// Moves a running clip's cursor without traversing the gap.
    pub fn seek_clip(&mut self, address: ClipAddress, to: Cursor) -> Result<(), InvalidClipError> {
        let ClipEngine {
            transport,
            buses,
            midi,
            ..
        } = self;
        let bus = buses
            .iter_mut()
            .find(|bus| bus.key == address.bus)
            .ok_or(InvalidClipError { address })?;
        let position = bus
            .clip_position(address.clip)
            .ok_or(InvalidClipError { address })?;
        let mut cx = LaneContext {
            midi: midi.as_mut(),
            selector: bus.selector.as_deref_mut(),
        };
        bus.clips[position].jump_to(to, transport.as_ref(), &mut cx);
        Ok(())
    }

    /// Stops a clip. Immediate stops land before the next tick; quantized
    /// stops wait for the boundary.
    pub fn stop_clip(
        &mut self,
        address: ClipAddress,
        schedule: Schedule,
    ) -> Result<(), InvalidClipError> {
        let ClipEngine {
            transport,
            buses,
            midi,
            ..
        } = self;
        let bus = buses
            .iter_mut()
            .find(|bus| bus.key == address.bus)
            .ok_or(InvalidClipError { address })?;
        let position = bus
            .clip_position(address.clip)
            .ok_or(InvalidClipError { address })?;

        let deferred = bus.clips[position].request_stop(schedule, transport.as_ref());
        if !deferred {
            let mut cx = LaneContext {
                midi: midi.as_mut(),
                selector: bus.selector.as_deref_mut(),
            };
            bus.clips[position].on_stop(transport.as_ref(), &mut cx);
            if bus.clips[position].take_disarm_request() {
                bus.armed = false;
            }
        }
        Ok(())
    }

    /// The globally focused clip, if it still exists.
    pub fn focused_clip(&self) -> Option<ClipAddress> {
        let address = self.focused?;
        self.clip(address).ok().map(|_| address)
    }

    /// Moves focus. The change signal fires exactly once per actual change.
    pub fn set_focused_clip(&mut self, address: Option<ClipAddress>) -> bool {
        if self.focused == address {
            return false;
        }
        self.focused = address;
        self.focus_generation += 1;
        true
    }

    /// Bumped on every focus change; cheap for hosts to poll.
    pub fn focus_generation(&self) -> u64 {
        self.focus_generation
    }

    /// One engine tick: resolves due launches (stopping siblings first),
    /// then advances every running clip.
    pub fn tick(&mut self, delta_ms: f64) {
        let ClipEngine {
            transport,
            midi,
            buses,
            ..
        } = self;
        for bus in buses.iter_mut() {
            let ClipBus {
                clips,
                selector,
                armed,
                ..
            } = bus;

            let due: Vec<(usize, Cursor)> = clips
                .iter()
                .enumerate()
                .filter_map(|(position, clip)| {
                    clip.pending_launch_ready(transport.as_ref())
                        .map(|start| (position, start))
                })
                .collect();
            for (position, start_ref) in due {
                for (other, clip) in clips.iter_mut().enumerate() {
                    if other != position && clip.is_running() {
                        let mut cx = LaneContext {
                            midi: midi.as_mut(),
                            selector: selector.as_deref_mut(),
                        };
                        clip.on_stop(transport.as_ref(), &mut cx);
                        if clip.take_disarm_request() {
                            *armed = false;
                        }
                    }
                }
                let armed_now = *armed;
                let mut cx = LaneContext {
                    midi: midi.as_mut(),
                    selector: selector.as_deref_mut(),
                };
                clips[position].on_start(armed_now, start_ref, &mut cx);
            }

            for clip in clips.iter_mut() {
                let mut cx = LaneContext {
                    midi: midi.as_mut(),
                    selector: selector.as_deref_mut(),
                };
                clip.run(delta_ms, *armed, transport.as_ref(), &mut cx);
                if clip.take_disarm_request() {
                    *armed = false;
                }
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct InvalidBusError {
    pub key: BusKey,
}
impl Display for InvalidBusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "No bus with key {:?}", self.key)
    }
}
impl Error for InvalidBusError {}

#[derive(Debug, PartialEq, Eq)]
pub struct InvalidClipError {
    pub address: ClipAddress,
}
impl Display for InvalidClipError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "No clip at {:?}", self.address)
    }
}
impl Error for InvalidClipError {}

#[derive(Debug, PartialEq, Eq)]
pub enum RegisterTargetError {
    InvalidBus(InvalidBusError),
    Overflow(KeyOverflowError),
}
impl Display for RegisterTargetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegisterTargetError::InvalidBus(e) => e.fmt(f),
            RegisterTargetError::Overflow(e) => e.fmt(f),
        }
    }
}
impl Error for RegisterTargetError {}

#[derive(Debug, PartialEq, Eq)]
pub enum LaunchClipError {
    InvalidClip(InvalidClipError),
    PlayFrom(PlayFromError),
}
impl Display for LaunchClipError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchClipError::InvalidClip(e) => e.fmt(f),
            LaunchClipError::PlayFrom(e) => e.fmt(f),
        }
    }
}
impl Error for LaunchClipError {}

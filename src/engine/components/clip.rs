use std::collections::HashMap;
use std::error::Error;
use std::fmt::Display;
use std::sync::Arc;

use super::cursor::{millis_per_beat, Cursor, TimeBase};
use super::lane::{Lane, LaneContext, NoteLane, ParameterLane, PatternLane};
use crate::engine::traits::{ClipSnapshot, ParameterTarget, Schedule, Transport};
use crate::engine::TargetKey;

/// Where a clip is in its lifecycle. Recording from scratch and overdubbing
/// over an existing timeline are distinct states; which one arming leads to
/// depends on whether the clip has a timeline yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipPhase {
    Idle,
    Playing,
    RecordingFirst,
    Overdubbing,
}

#[derive(Debug, Clone, Copy)]
struct PendingLaunch {
    /// `None` launches on the next tick; a boundary waits for the transport
    /// to reach it.
    boundary: Option<Cursor>,
}

/// A recordable, playable, loopable timeline of lanes, bound to a bus.
///
/// The note lane is permanent at index 0; a pattern lane (for buses with a
/// selector) is permanent behind it; parameter lanes come and go with their
/// targets. All cursor comparison goes through the clip's time base, never
/// raw fields.
#[derive(Debug)]
pub struct Clip {
    index: u32,
    phase: ClipPhase,
    cursor: Cursor,
    launch_from: Cursor,
    start_transport_ref: Cursor,
    start_cursor_ref: Cursor,
    length: Cursor,
    loop_start: Cursor,
    loop_length: Cursor,
    play_start: Cursor,
    play_end: Cursor,
    looping: bool,
    automation_enabled: bool,
    snapshot_enabled: bool,
    snapshot_transition_enabled: bool,
    custom_snapshot_transition: bool,
    time_base: TimeBase,
    reference_bpm: f64,
    has_timeline: bool,
    overdub_extension: bool,
    quantized_launch: bool,
    pending_launch: Option<PendingLaunch>,
    /// Transport-basis boundary of a deferred stop.
    pending_stop: Option<Cursor>,
    disarm_requested: bool,
    lanes: Vec<Lane>,
    param_lane_indices: HashMap<TargetKey, usize>,
    snapshot: Option<Box<dyn ClipSnapshot>>,
}

impl Clip {
    pub(crate) fn new(
        index: u32,
        time_base: TimeBase,
        reference_bpm: f64,
        with_pattern_lane: bool,
    ) -> Self {
        let mut lanes = vec![Lane::Note(NoteLane::new())];
        if with_pattern_lane {
            lanes.push(Lane::Pattern(PatternLane::new()));
        }
        Clip {
            index,
            phase: ClipPhase::Idle,
            cursor: Cursor::ZERO,
            launch_from: Cursor::ZERO,
            start_transport_ref: Cursor::ZERO,
            start_cursor_ref: Cursor::ZERO,
            length: Cursor::ZERO,
            loop_start: Cursor::ZERO,
            loop_length: Cursor::ZERO,
            play_start: Cursor::ZERO,
            play_end: Cursor::ZERO,
            looping: false,
            automation_enabled: true,
            snapshot_enabled: false,
            snapshot_transition_enabled: true,
            custom_snapshot_transition: false,
            time_base,
            reference_bpm,
            has_timeline: false,
            overdub_extension: false,
            quantized_launch: false,
            pending_launch: None,
            pending_stop: None,
            disarm_requested: false,
            lanes,
            param_lane_indices: HashMap::new(),
            snapshot: None,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }
    pub fn phase(&self) -> ClipPhase {
        self.phase
    }
    pub fn is_running(&self) -> bool {
        self.phase != ClipPhase::Idle
    }
    pub fn cursor(&self) -> Cursor {
        self.cursor
    }
    pub fn length(&self) -> Cursor {
        self.length
    }
    pub fn loop_start(&self) -> Cursor {
        self.loop_start
    }
    pub fn loop_length(&self) -> Cursor {
        self.loop_length
    }
    pub fn loop_end(&self) -> Cursor {
        self.loop_start.add(self.loop_length)
    }
    pub fn play_start(&self) -> Cursor {
        self.play_start
    }
    pub fn play_end(&self) -> Cursor {
        self.play_end
    }
    pub fn is_looping(&self) -> bool {
        self.looping
    }
    pub fn has_timeline(&self) -> bool {
        self.has_timeline
    }
    pub fn reference_bpm(&self) -> f64 {
        self.reference_bpm
    }
    pub fn is_quantized_launch(&self) -> bool {
        self.quantized_launch
    }
    pub fn automation_enabled(&self) -> bool {
        self.automation_enabled
    }
    pub fn set_automation_enabled(&mut self, enabled: bool) {
        self.automation_enabled = enabled;
    }
    pub fn snapshot_enabled(&self) -> bool {
        self.snapshot_enabled
    }
    pub fn set_snapshot_enabled(&mut self, enabled: bool) {
        self.snapshot_enabled = enabled;
    }
    pub fn snapshot_transition_enabled(&self) -> bool {
        self.snapshot_transition_enabled
    }
    pub fn set_snapshot_transition_enabled(&mut self, enabled: bool) {
        self.snapshot_transition_enabled = enabled;
    }
    pub fn custom_snapshot_transition(&self) -> bool {
        self.custom_snapshot_transition
    }
    pub fn set_custom_snapshot_transition(&mut self, custom: bool) {
        self.custom_snapshot_transition = custom;
    }
    pub fn set_snapshot(&mut self, snapshot: Option<Box<dyn ClipSnapshot>>) {
        self.snapshot = snapshot;
    }

    /// The operator every cursor comparison for this clip routes through.
    pub fn cursor_op(&self) -> TimeBase {
        self.time_base
    }

    pub fn lanes(&self) -> &[Lane] {
        &self.lanes
    }
    pub fn lanes_mut(&mut self) -> &mut [Lane] {
        &mut self.lanes
    }

    pub fn note_lane(&self) -> &NoteLane {
        match &self.lanes[0] {
            Lane::Note(lane) => lane,
            _ => unreachable!("note lane is fixed at index 0"),
        }
    }
    pub fn note_lane_mut(&mut self) -> &mut NoteLane {
        match &mut self.lanes[0] {
            Lane::Note(lane) => lane,
            _ => unreachable!("note lane is fixed at index 0"),
        }
    }

    pub fn pattern_lane(&self) -> Option<&PatternLane> {
        self.lanes.iter().find_map(|lane| match lane {
            Lane::Pattern(lane) => Some(lane),
            _ => None,
        })
    }
    pub fn pattern_lane_mut(&mut self) -> Option<&mut PatternLane> {
        self.lanes.iter_mut().find_map(|lane| match lane {
            Lane::Pattern(lane) => Some(lane),
            _ => None,
        })
    }

    pub fn parameter_lane(&self, key: TargetKey) -> Option<&ParameterLane> {
        let index = *self.param_lane_indices.get(&key)?;
        self.lanes[index].as_parameter()
    }
    pub fn parameter_lane_mut(&mut self, key: TargetKey) -> Option<&mut ParameterLane> {
        let index = *self.param_lane_indices.get(&key)?;
        self.lanes[index].as_parameter_mut()
    }

    /// The lane for `key`, created on first use.
    pub(crate) fn ensure_parameter_lane(
        &mut self,
        key: TargetKey,
        target: &Arc<dyn ParameterTarget>,
    ) -> &mut ParameterLane {
        if !self.param_lane_indices.contains_key(&key) {
            self.lanes.push(Lane::Parameter(ParameterLane::new(Arc::clone(target))));
            self.param_lane_indices.insert(key, self.lanes.len() - 1);
        }
        let index = self.param_lane_indices[&key];
        self.lanes[index]
            .as_parameter_mut()
            .expect("parameter lane index points at a parameter lane")
    }

    /// Drops the lanes of unregistered targets. The note and pattern lanes
    /// are permanent and unaffected.
    pub(crate) fn remove_parameter_lanes(&mut self, keys: &[TargetKey]) {
        let doomed: Vec<usize> = keys
            .iter()
            .filter_map(|key| self.param_lane_indices.remove(key))
            .collect();
        if doomed.is_empty() {
            return;
        }
        let mut index = 0;
        self.lanes.retain(|_| {
            let keep = !doomed.contains(&index);
            index += 1;
            keep
        });
        // Reindex the survivors.
        let mut remaining: Vec<TargetKey> = self.param_lane_indices.keys().copied().collect();
        remaining.sort_by_key(|key| self.param_lane_indices[key]);
        let mut lane_index = 0;
        let mut new_indices = HashMap::new();
        for (position, lane) in self.lanes.iter().enumerate() {
            if matches!(lane, Lane::Parameter(_)) {
                new_indices.insert(remaining[lane_index], position);
                lane_index += 1;
            }
        }
        self.param_lane_indices = new_indices;
    }

    /// Parameter lanes with their target keys, in lane order.
    pub fn parameter_lanes(&self) -> Vec<(TargetKey, &ParameterLane)> {
        let mut keyed: Vec<(TargetKey, usize)> = self
            .param_lane_indices
            .iter()
            .map(|(&key, &index)| (key, index))
            .collect();
        keyed.sort_by_key(|&(_, index)| index);
        keyed
            .into_iter()
            .filter_map(|(key, index)| self.lanes[index].as_parameter().map(|lane| (key, lane)))
            .collect()
    }

    pub(crate) fn set_bounds_from_state(
        &mut self,
        length: Cursor,
        loop_start: Cursor,
        loop_length: Cursor,
        play_start: Cursor,
        play_end: Cursor,
        looping: bool,
    ) {
        self.length = length;
        self.loop_start = loop_start;
        self.loop_length = loop_length;
        self.play_start = play_start;
        self.play_end = play_end;
        self.looping = looping;
        self.has_timeline = !self.time_base.is_zero(length);
    }

    /// Rewrites the loop region, holding the clip invariants.
    pub fn set_loop_region(&mut self, start: Cursor, length: Cursor) -> Result<(), InvalidClipBoundsError> {
        let op = self.time_base;
        if self.has_timeline && op.is_before(length, Cursor::MIN_LOOP) {
            return Err(InvalidClipBoundsError);
        }
        if op.is_after(start.add(length), self.length) {
            return Err(InvalidClipBoundsError);
        }
        self.loop_start = start;
        self.loop_length = length;
        Ok(())
    }

    pub fn set_play_bounds(&mut self, start: Cursor, end: Cursor) -> Result<(), InvalidClipBoundsError> {
        let op = self.time_base;
        if op.is_after(start.add(Cursor::MIN_LOOP), end) || op.is_after(end, self.length) {
            return Err(InvalidClipBoundsError);
        }
        self.play_start = start;
        self.play_end = end;
        Ok(())
    }

    pub fn set_length(&mut self, length: Cursor) -> Result<(), InvalidClipBoundsError> {
        let op = self.time_base;
        if op.is_after(self.loop_end(), length) || op.is_after(self.play_end, length) {
            return Err(InvalidClipBoundsError);
        }
        self.length = length;
        op.constrain(&mut self.cursor, Cursor::ZERO, self.length);
        Ok(())
    }

    pub fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    /// Schedules a launch: quantized when the clip is tempo-synced and the
    /// transport carries a quantization grid, immediate otherwise.
    pub fn launch(&mut self, transport: &dyn Transport) {
        let schedule = match (self.time_base, transport.launch_quantization()) {
            (TimeBase::Tempo, Some(division)) => Schedule::Quantized(division),
            _ => Schedule::Immediate,
        };
        self.schedule_launch(schedule, transport);
    }

    /// Sets the launch cursor, then schedules like [`Clip::launch`].
    pub fn launch_automation_from(&mut self, from: Cursor, transport: &dyn Transport) {
        let upper = if self.has_timeline {
            self.length
        } else {
            Cursor::ZERO
        };
        self.launch_from = self.time_base.bound(from, Cursor::ZERO, upper);
        self.launch(transport);
    }

    /// Starts playback at `from` on the next tick, bypassing quantization.
    pub fn play_from(&mut self, from: Cursor, _transport: &dyn Transport) -> Result<(), PlayFromError> {
        if self.is_running() {
            return Err(PlayFromError::AlreadyRunning);
        }
        if !self.has_timeline {
            return Err(PlayFromError::NoTimeline);
        }
        self.launch_from = self.time_base.bound(from, Cursor::ZERO, self.length);
        self.quantized_launch = false;
        self.pending_launch = Some(PendingLaunch { boundary: None });
        Ok(())
    }

    fn schedule_launch(&mut self, schedule: Schedule, transport: &dyn Transport) {
        match schedule {
            Schedule::Immediate => {
                self.quantized_launch = false;
                self.pending_launch = Some(PendingLaunch { boundary: None });
            }
            Schedule::Quantized(division) => {
                let boundary = division.next_boundary(transport.cursor(), transport.bpm());
                self.quantized_launch = true;
                self.pending_launch = Some(PendingLaunch {
                    boundary: Some(boundary),
                });
            }
        }
    }

    /// Registers a stop. Returns true when it was deferred to a boundary;
    /// an immediate stop is the caller's job (it needs the lane context).
    pub(crate) fn request_stop(&mut self, schedule: Schedule, transport: &dyn Transport) -> bool {
        if let (Schedule::Quantized(division), TimeBase::Tempo) = (schedule, self.time_base) {
            self.pending_stop = Some(division.next_boundary(transport.cursor(), transport.bpm()));
            return true;
        }
        false
    }

    /// When a scheduled launch is due, returns the transport reference to
    /// start from.
    pub(crate) fn pending_launch_ready(&self, transport: &dyn Transport) -> Option<Cursor> {
        match self.pending_launch? {
            PendingLaunch { boundary: None } => Some(transport.cursor()),
            PendingLaunch {
                boundary: Some(boundary),
            } => {
                if TimeBase::Tempo.is_after_or_equal(transport.cursor(), boundary) {
                    Some(boundary)
                } else {
                    None
                }
            }
        }
    }

    pub(crate) fn take_disarm_request(&mut self) -> bool {
        std::mem::take(&mut self.disarm_requested)
    }

    /// Moves a running clip's cursor without traversing the gap. Held notes
    /// are silenced and per-pitch state reprimed for the destination.
    pub(crate) fn jump_to(&mut self, to: Cursor, transport: &dyn Transport, cx: &mut LaneContext) {
        if !self.is_running() {
            return;
        }
        let op = self.time_base;
        let from = self.cursor;
        let target = op.bound(to, Cursor::ZERO, self.length);
        for lane in &mut self.lanes {
            lane.jump_cursor(op, from, target, &mut cx.reborrow());
        }
        self.cursor = target;
        self.start_cursor_ref = target;
        self.start_transport_ref = transport.cursor();
    }

    /// Starts the clip. Sibling exclusivity on the bus is the caller's job.
    pub(crate) fn on_start(&mut self, armed: bool, start_ref: Cursor, cx: &mut LaneContext) {
        let op = self.time_base;
        let upper = if self.has_timeline {
            self.length
        } else {
            Cursor::ZERO
        };
        self.cursor = op.bound(self.launch_from, Cursor::ZERO, upper);
        self.start_transport_ref = start_ref;
        self.start_cursor_ref = self.cursor;
        self.pending_launch = None;
        self.pending_stop = None;
        self.overdub_extension = false;

        let cursor = self.cursor;
        for lane in &mut self.lanes {
            lane.initialize_cursor_playback(op, cursor, &mut cx.reborrow());
        }
        if self.snapshot_enabled {
            if let Some(snapshot) = self.snapshot.as_mut() {
                snapshot.recall();
            }
        }

        self.phase = if armed {
            for lane in &mut self.lanes {
                lane.arm_recording(cx);
            }
            if self.has_timeline {
                ClipPhase::Overdubbing
            } else {
                ClipPhase::RecordingFirst
            }
        } else {
            ClipPhase::Playing
        };
    }

    /// Stops the clip immediately, finishing whatever its phase requires.
    pub(crate) fn on_stop(&mut self, transport: &dyn Transport, cx: &mut LaneContext) {
        match self.phase {
            ClipPhase::Idle => return,
            ClipPhase::RecordingFirst => {
                self.disarm_requested = true;
                self.stop_first_recording(transport);
            }
            ClipPhase::Overdubbing => {
                self.disarm_requested = true;
                self.stop_overdub_recording();
                for lane in &mut self.lanes {
                    lane.on_stop_playback(cx);
                }
            }
            ClipPhase::Playing => {
                for lane in &mut self.lanes {
                    lane.on_stop_playback(cx);
                }
            }
        }
        if let Some(snapshot) = self.snapshot.as_mut() {
            snapshot.stop_transition();
        }
        self.phase = ClipPhase::Idle;
        self.pending_stop = None;
        self.pending_launch = None;
        self.quantized_launch = false;
    }

    fn stop_first_recording(&mut self, transport: &dyn Transport) {
        let op = self.time_base;
        let at = self.cursor;
        for lane in &mut self.lanes {
            lane.on_stop_recording(op, at);
        }
        for lane in &mut self.lanes {
            lane.commit_record_queue(op, true);
        }

        let mut length = self.cursor;
        let quantized = self.time_base == TimeBase::Tempo && transport.launch_quantization().is_some();
        if let (TimeBase::Tempo, Some(division)) = (self.time_base, transport.launch_quantization()) {
            let grid = division.grid_cursor(self.reference_bpm);
            let snapped = op.snap(length, grid, self.reference_bpm);
            let truncates = self.lanes.iter().any(|lane| {
                lane.last_cursor(op)
                    .map(|c| op.is_after(c, snapped))
                    .unwrap_or(false)
            });
            length = if truncates {
                op.snap_ceiling(length, grid, self.reference_bpm)
            } else {
                snapped
            };
        }
        if op.is_before(length, Cursor::MIN_LOOP) {
            length = Cursor::MIN_LOOP;
        }

        self.length = length;
        self.loop_start = Cursor::ZERO;
        self.loop_length = length;
        self.play_start = Cursor::ZERO;
        self.play_end = length;
        if quantized {
            self.looping = true;
        }
        self.has_timeline = true;
    }

    fn stop_overdub_recording(&mut self) {
        let op = self.time_base;
        let at = self.cursor;
        for lane in &mut self.lanes {
            lane.on_stop_recording(op, at);
        }
        for lane in &mut self.lanes {
            lane.commit_record_queue(op, true);
        }
        // Hot stops can leave the cursor past the end after an extension.
        while op.is_after(self.cursor, self.length) && !op.is_zero(self.length) {
            self.cursor = self.cursor.saturating_sub(self.length);
        }
        self.overdub_extension = false;
    }

    /// Switches between overdubbing and plain playing without stopping,
    /// within the current tick.
    fn apply_hot_arm(&mut self, armed: bool, cx: &mut LaneContext) {
        match (self.phase, armed) {
            (ClipPhase::Playing, true) if self.has_timeline => {
                for lane in &mut self.lanes {
                    lane.arm_recording(cx);
                }
                self.phase = ClipPhase::Overdubbing;
            }
            (ClipPhase::Overdubbing, false) => {
                self.stop_overdub_recording();
                self.phase = ClipPhase::Playing;
            }
            _ => {}
        }
    }

    /// One engine tick.
    pub(crate) fn run(
        &mut self,
        delta_ms: f64,
        armed: bool,
        transport: &dyn Transport,
        cx: &mut LaneContext,
    ) {
        if self.phase == ClipPhase::Idle {
            return;
        }
        self.apply_hot_arm(armed, cx);

        let next_cursor = match self.time_base {
            TimeBase::Absolute => {
                let delta = Cursor::compose(delta_ms, delta_ms / millis_per_beat(self.reference_bpm));
                self.cursor.add(delta)
            }
            TimeBase::Tempo => {
                let mut transport_cursor = transport.cursor();
                if TimeBase::Tempo.is_before(transport_cursor, self.start_transport_ref) {
                    log::warn!(
                        "transport rewound behind clip {}; re-anchoring",
                        self.index
                    );
                    self.start_transport_ref = transport_cursor;
                    self.start_cursor_ref = self.cursor;
                    return;
                }
                // A pending quantized stop pins this frame at its boundary.
                if let Some(boundary) = self.pending_stop {
                    transport_cursor = TimeBase::Tempo.min(transport_cursor, boundary);
                }
                let elapsed = transport_cursor.saturating_sub(self.start_transport_ref);
                self.start_cursor_ref.add(elapsed)
            }
        };

        let stop_due = match (self.time_base, self.pending_stop) {
            (TimeBase::Tempo, Some(boundary)) => {
                TimeBase::Tempo.is_after_or_equal(transport.cursor(), boundary)
            }
            _ => false,
        };

        match self.phase {
            ClipPhase::Idle => {}
            ClipPhase::RecordingFirst => self.run_first_recording(next_cursor),
            ClipPhase::Overdubbing => {
                self.run_automation(next_cursor, true, transport, cx);
            }
            ClipPhase::Playing => {
                let automation_running = if self.automation_enabled {
                    self.run_automation(next_cursor, false, transport, cx)
                } else {
                    true
                };
                if self.snapshot_enabled && self.snapshot_transition_enabled {
                    if let Some(snapshot) = self.snapshot.as_mut() {
                        snapshot.run(delta_ms);
                    }
                }
                let in_transition = self
                    .snapshot
                    .as_ref()
                    .map(|s| s.is_in_transition())
                    .unwrap_or(false);
                if !automation_running && !in_transition {
                    self.on_stop(transport, cx);
                    return;
                }
            }
        }

        if stop_due {
            self.on_stop(transport, cx);
        }
    }

    fn run_first_recording(&mut self, next_cursor: Cursor) {
        let op = self.time_base;
        for lane in &mut self.lanes {
            lane.commit_record_queue(op, true);
        }
        self.length = next_cursor;
        self.loop_length = next_cursor;
        self.play_end = next_cursor;
        self.cursor = next_cursor;
    }

    /// Advances automation from the current cursor to `next_cursor`,
    /// handling loop wraparound. Returns false when automation has run off
    /// the end and the clip should stop.
    fn run_automation(
        &mut self,
        next_cursor: Cursor,
        is_overdub: bool,
        transport: &dyn Transport,
        cx: &mut LaneContext,
    ) -> bool {
        let op = self.time_base;
        let loop_end = self.loop_end();

        let mut looping = self.looping;
        let mut end_cursor = if looping {
            loop_end
        } else if is_overdub && op.is_after(self.cursor, self.play_end) {
            self.length
        } else {
            self.play_end
        };
        // Launched past the end: fall through to the full length, unlooped.
        if op.is_after(self.cursor, end_cursor) {
            end_cursor = self.length;
            looping = false;
        }

        if is_overdub && !looping && op.is_after(next_cursor, end_cursor) {
            end_cursor = next_cursor;
            self.overdub_extension = true;
        }

        if op.is_before(next_cursor, end_cursor) {
            self.sweep(is_overdub, self.cursor, next_cursor, false, cx);
            self.cursor = next_cursor;
            return true;
        }

        self.sweep(is_overdub, self.cursor, end_cursor, true, cx);
        if self.overdub_extension {
            self.length = op.max(self.length, end_cursor);
            self.play_end = op.max(self.play_end, end_cursor);
        }

        if op.is_zero(self.length) || !looping {
            self.cursor = end_cursor;
            return false;
        }
        if op.is_zero(self.loop_length) {
            log::warn!("clip {} has a zero loop length; stopping", self.index);
            self.cursor = end_cursor;
            return false;
        }

        let loop_start = self.loop_start;
        let mut next = next_cursor;
        while op.is_after_or_equal(next, loop_end) {
            next = next.saturating_sub(self.loop_length);
            for lane in &mut self.lanes {
                lane.loop_cursor(op, loop_end, loop_start, cx);
            }
            if op.is_before(next, loop_end) {
                self.sweep(is_overdub, loop_start, next, false, cx);
            } else {
                self.sweep(is_overdub, loop_start, loop_end, true, cx);
            }
        }
        self.cursor = next;

        if self.time_base == TimeBase::Tempo {
            // Keep the transport reference in step with the wrapped cursor.
            self.start_cursor_ref = loop_start;
            let offset = next.saturating_sub(loop_start);
            match transport.cursor().checked_sub(offset) {
                Some(anchored) => self.start_transport_ref = anchored,
                None => {
                    self.start_transport_ref = transport.cursor();
                    self.start_cursor_ref = next;
                }
            }
        }
        true
    }

    fn sweep(&mut self, is_overdub: bool, from: Cursor, to: Cursor, inclusive: bool, cx: &mut LaneContext) {
        let op = self.time_base;
        let length = self.length;
        for lane in &mut self.lanes {
            if is_overdub {
                lane.overdub_cursor(op, from, to, inclusive, length, &mut cx.reborrow());
            } else {
                lane.play_cursor(op, from, to, inclusive, &mut cx.reborrow());
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PlayFromError {
    AlreadyRunning,
    NoTimeline,
}
impl Display for PlayFromError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlayFromError::AlreadyRunning => write!(f, "Clip is already running"),
            PlayFromError::NoTimeline => write!(f, "Clip has no timeline to play"),
        }
    }
}
impl Error for PlayFromError {}

#[derive(Debug, PartialEq, Eq)]
pub struct InvalidClipBoundsError;
impl Display for InvalidClipBoundsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Clip bounds would violate the loop and play invariants")
    }
}
impl Error for InvalidClipBoundsError {}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::engine::components::cursor::TimeBase;
    use crate::engine::traits::{Division, MidiSink, NoteMessage, TargetKind};
    use crate::engine::utils::Key;

    const BPM: f64 = 120.0;

    fn at(millis: f64) -> Cursor {
        Cursor::from_millis(millis, BPM).unwrap()
    }

    #[derive(Debug, Default)]
    struct TestSink {
        sent: Vec<NoteMessage>,
    }
    impl MidiSink for TestSink {
        fn send(&mut self, message: NoteMessage) {
            self.sent.push(message);
        }
    }

    #[derive(Debug)]
    struct TestTransport {
        now_ms: f64,
        bpm: f64,
        beats: f64,
        quantization: Option<Division>,
    }
    impl TestTransport {
        fn new() -> Self {
            TestTransport {
                now_ms: 0.0,
                bpm: BPM,
                beats: 0.0,
                quantization: None,
            }
        }
        fn advance_ms(&mut self, delta: f64) {
            self.now_ms += delta;
            self.beats += delta / millis_per_beat(self.bpm);
        }
    }
    impl Transport for TestTransport {
        fn now_ms(&self) -> f64 {
            self.now_ms
        }
        fn bpm(&self) -> f64 {
            self.bpm
        }
        fn beat_count(&self) -> u32 {
            self.beats as u32
        }
        fn beat_basis(&self) -> f64 {
            self.beats.fract()
        }
        fn launch_quantization(&self) -> Option<Division> {
            self.quantization
        }
    }

    #[derive(Debug)]
    struct TestTarget {
        kind: TargetKind,
        seen: Mutex<Vec<f64>>,
    }
    impl TestTarget {
        fn new() -> Arc<Self> {
            Self::with_kind(TargetKind::Normalized)
        }
        fn with_kind(kind: TargetKind) -> Arc<Self> {
            Arc::new(TestTarget {
                kind,
                seen: Mutex::new(Vec::new()),
            })
        }
    }
    impl ParameterTarget for TestTarget {
        fn kind(&self) -> TargetKind {
            self.kind
        }
        fn base_normalized(&self) -> f64 {
            0.0
        }
        fn set_normalized(&self, value: f64) {
            self.seen.lock().unwrap().push(value);
        }
    }

    fn context(sink: &mut TestSink) -> LaneContext<'_> {
        LaneContext {
            midi: sink,
            selector: None,
        }
    }

    #[test]
    fn first_recording_builds_the_timeline() {
        let transport = TestTransport::new();
        let mut sink = TestSink::default();
        let mut clip = Clip::new(0, TimeBase::Absolute, BPM, false);
        let target = TestTarget::new();
        let key = TargetKey::new(1);

        clip.launch(&transport);
        let start = clip.pending_launch_ready(&transport).unwrap();
        clip.on_start(true, start, &mut context(&mut sink));
        assert_eq!(clip.phase(), ClipPhase::RecordingFirst);

        {
            let op = clip.cursor_op();
            let cursor = clip.cursor();
            let lane = clip.ensure_parameter_lane(key, &(target.clone() as Arc<dyn ParameterTarget>));
            lane.record_change(op, cursor, 0.5, false);
        }
        clip.run(500.0, true, &transport, &mut context(&mut sink));
        {
            let op = clip.cursor_op();
            let cursor = clip.cursor();
            let lane = clip.parameter_lane_mut(key).unwrap();
            lane.record_change(op, cursor, 1.0, false);
        }
        clip.run(500.0, true, &transport, &mut context(&mut sink));

        clip.on_stop(&transport, &mut context(&mut sink));

        assert_eq!(clip.phase(), ClipPhase::Idle);
        assert!(clip.has_timeline());
        assert_eq!(clip.length().millis(), 1000.0);
        assert_eq!(clip.loop_length().millis(), 1000.0);
        assert_eq!(clip.play_end().millis(), 1000.0);
        assert!(clip.take_disarm_request());

        let lane = clip.parameter_lane(key).unwrap();
        let events: Vec<(f64, f64)> = lane
            .events()
            .iter()
            .map(|e| (e.cursor.millis(), e.value))
            .collect();
        assert_eq!(events, vec![(0.0, 0.0), (0.0, 0.5), (500.0, 1.0)]);
    }

    #[test]
    fn small_loop_wraps_multiple_times_in_one_tick() {
        let transport = TestTransport::new();
        let mut sink = TestSink::default();
        let mut clip = Clip::new(0, TimeBase::Absolute, BPM, false);
        clip.set_bounds_from_state(at(1000.0), at(0.0), at(100.0), at(0.0), at(1000.0), true);

        let target = TestTarget::with_kind(TargetKind::Trigger);
        let key = TargetKey::new(1);
        {
            let lane = clip.ensure_parameter_lane(key, &(target.clone() as Arc<dyn ParameterTarget>));
            lane.insert_event(TimeBase::Absolute, at(50.0), 1.0);
        }

        clip.launch(&transport);
        let start = clip.pending_launch_ready(&transport).unwrap();
        clip.on_start(false, start, &mut context(&mut sink));
        clip.run(350.0, false, &transport, &mut context(&mut sink));

        assert_eq!(clip.cursor().millis(), 50.0);
        // Three full traversals of the loop; the trailing 50 ms stops short
        // of the trigger.
        assert_eq!(target.seen.lock().unwrap().len(), 3);
        assert_eq!(clip.phase(), ClipPhase::Playing);
    }

    #[test]
    fn unlooped_playback_stops_at_play_end() {
        let transport = TestTransport::new();
        let mut sink = TestSink::default();
        let mut clip = Clip::new(0, TimeBase::Absolute, BPM, false);
        clip.set_bounds_from_state(at(1000.0), at(0.0), at(1000.0), at(0.0), at(1000.0), false);

        clip.launch(&transport);
        let start = clip.pending_launch_ready(&transport).unwrap();
        clip.on_start(false, start, &mut context(&mut sink));

        clip.run(600.0, false, &transport, &mut context(&mut sink));
        assert_eq!(clip.phase(), ClipPhase::Playing);
        assert_eq!(clip.cursor().millis(), 600.0);

        clip.run(600.0, false, &transport, &mut context(&mut sink));
        assert_eq!(clip.phase(), ClipPhase::Idle);
        assert_eq!(clip.cursor().millis(), 1000.0);
    }

    #[test]
    fn transport_rewind_reanchors_without_negative_arithmetic() {
        let mut transport = TestTransport::new();
        transport.advance_ms(5000.0);
        let mut sink = TestSink::default();
        let mut clip = Clip::new(0, TimeBase::Tempo, BPM, false);
        clip.set_bounds_from_state(at(4000.0), at(0.0), at(4000.0), at(0.0), at(4000.0), true);

        clip.launch(&transport);
        let start = clip.pending_launch_ready(&transport).unwrap();
        clip.on_start(false, start, &mut context(&mut sink));
        assert_eq!(clip.start_transport_ref.total_beats(), 10.0);

        // The tempo source rewinds to beat 2.
        transport.now_ms = 1000.0;
        transport.beats = 2.0;
        let cursor_before = clip.cursor();
        clip.run(0.0, false, &transport, &mut context(&mut sink));

        assert_eq!(clip.start_transport_ref.total_beats(), 2.0);
        assert_eq!(clip.start_cursor_ref, cursor_before);
        assert_eq!(clip.cursor(), cursor_before);
        assert_eq!(clip.phase(), ClipPhase::Playing);
    }

    #[test]
    fn quantized_stop_waits_for_the_boundary() {
        let mut transport = TestTransport::new();
        transport.quantization = Some(Division::new(4.0));
        let mut sink = TestSink::default();
        let mut clip = Clip::new(0, TimeBase::Tempo, BPM, false);
        clip.set_bounds_from_state(at(8000.0), at(0.0), at(8000.0), at(0.0), at(8000.0), true);

        clip.launch(&transport);
        let start = clip.pending_launch_ready(&transport).unwrap();
        clip.on_start(false, start, &mut context(&mut sink));

        transport.advance_ms(500.0);
        clip.run(500.0, false, &transport, &mut context(&mut sink));
        assert!(clip.request_stop(
            Schedule::Quantized(Division::new(4.0)),
            &transport
        ));
        assert_eq!(clip.phase(), ClipPhase::Playing);

        // Not yet at the two-second bar boundary.
        transport.advance_ms(1000.0);
        clip.run(1000.0, false, &transport, &mut context(&mut sink));
        assert_eq!(clip.phase(), ClipPhase::Playing);

        transport.advance_ms(600.0);
        clip.run(600.0, false, &transport, &mut context(&mut sink));
        assert_eq!(clip.phase(), ClipPhase::Idle);
        // The frame was pinned at the boundary, not at the raw transport.
        assert_eq!(clip.cursor().millis(), 2000.0);
    }

    #[test]
    fn hot_disarm_returns_to_playing() {
        let transport = TestTransport::new();
        let mut sink = TestSink::default();
        let mut clip = Clip::new(0, TimeBase::Absolute, BPM, false);
        clip.set_bounds_from_state(at(1000.0), at(0.0), at(1000.0), at(0.0), at(1000.0), true);

        clip.launch(&transport);
        let start = clip.pending_launch_ready(&transport).unwrap();
        clip.on_start(true, start, &mut context(&mut sink));
        assert_eq!(clip.phase(), ClipPhase::Overdubbing);

        clip.run(100.0, true, &transport, &mut context(&mut sink));
        assert_eq!(clip.phase(), ClipPhase::Overdubbing);

        clip.run(100.0, false, &transport, &mut context(&mut sink));
        assert_eq!(clip.phase(), ClipPhase::Playing);
    }

    #[test]
    fn quantized_launch_defers_until_the_boundary() {
        let mut transport = TestTransport::new();
        transport.quantization = Some(Division::new(4.0));
        transport.advance_ms(500.0);
        let mut clip = Clip::new(0, TimeBase::Tempo, BPM, false);
        clip.set_bounds_from_state(at(4000.0), at(0.0), at(4000.0), at(0.0), at(4000.0), true);

        clip.launch(&transport);
        assert!(clip.is_quantized_launch());
        assert!(clip.pending_launch_ready(&transport).is_none());

        transport.advance_ms(1500.0);
        let start = clip.pending_launch_ready(&transport).unwrap();
        assert_eq!(start.total_beats(), 4.0);
    }

    #[test]
    fn permanent_lanes_survive_target_removal() {
        let mut clip = Clip::new(0, TimeBase::Absolute, BPM, true);
        let target = TestTarget::new();
        let key = TargetKey::new(7);
        clip.ensure_parameter_lane(key, &(target as Arc<dyn ParameterTarget>));
        assert_eq!(clip.lanes().len(), 3);

        clip.remove_parameter_lanes(&[key]);
        assert_eq!(clip.lanes().len(), 2);
        assert!(clip.pattern_lane().is_some());
        clip.note_lane();
    }
}

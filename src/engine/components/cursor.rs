use std::cmp::Ordering;
use std::error::Error;
use std::fmt::Display;

use serde::{Deserialize, Serialize};

const MS_PER_MINUTE: f64 = 60_000.0;

/// How close (in grid units) a value must be to a grid marker to be treated
/// as already on the grid by [`TimeBase::snap_up`] and [`TimeBase::snap_down`].
const GRID_PROXIMITY: f64 = 0.01;

pub fn millis_per_beat(bpm: f64) -> f64 {
    MS_PER_MINUTE / bpm
}

/// A point in time carried under both bases at once: wall-clock milliseconds
/// and a beat count with a fractional basis in `[0, 1)`.
///
/// Which projection is authoritative for comparison, snapping and
/// interpolation is decided by the [`TimeBase`] the operation goes through;
/// the other projection is kept approximately in sync via the reference BPM
/// so both survive persistence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cursor {
    millis: f64,
    beat_count: u32,
    beat_basis: f64,
}

impl Cursor {
    pub const ZERO: Cursor = Cursor {
        millis: 0.0,
        beat_count: 0,
        beat_basis: 0.0,
    };

    /// The smallest loop a clip may carry: 125 ms, an 1/32nd note.
    /// Both projections describe the same duration at the constant reference tempo.
    pub const MIN_LOOP: Cursor = Cursor {
        millis: 125.0,
        beat_count: 0,
        beat_basis: 0.125,
    };

    /// Builds a cursor from explicit components.
    ///
    /// A `beat_basis` of 1 or more carries into `beat_count`. Negative
    /// `millis` or `beat_basis` are rejected.
    pub fn new(millis: f64, beat_count: u32, beat_basis: f64) -> Result<Self, InvalidCursorError> {
        if millis < 0.0 || beat_basis < 0.0 || !millis.is_finite() || !beat_basis.is_finite() {
            return Err(InvalidCursorError { millis, beat_basis });
        }
        let carry = beat_basis.floor();
        Ok(Cursor {
            millis,
            beat_count: beat_count + carry as u32,
            beat_basis: beat_basis - carry,
        })
    }

    /// Builds a cursor from a wall-clock time, deriving the beat fields at `bpm`.
    pub fn from_millis(millis: f64, bpm: f64) -> Result<Self, InvalidCursorError> {
        if millis < 0.0 || !millis.is_finite() {
            return Err(InvalidCursorError {
                millis,
                beat_basis: 0.0,
            });
        }
        Ok(Self::compose(millis, millis / millis_per_beat(bpm)))
    }

    /// Builds a cursor from a beat position, deriving the wall-clock field at `bpm`.
    pub fn from_beats(total_beats: f64, bpm: f64) -> Result<Self, InvalidCursorError> {
        if total_beats < 0.0 || !total_beats.is_finite() {
            return Err(InvalidCursorError {
                millis: 0.0,
                beat_basis: total_beats,
            });
        }
        Ok(Self::compose(total_beats * millis_per_beat(bpm), total_beats))
    }

    /// Both projections given directly, each clamped at zero.
    pub(crate) fn compose(millis: f64, total_beats: f64) -> Cursor {
        let millis = millis.max(0.0);
        let total_beats = total_beats.max(0.0);
        let beat_count = total_beats.floor();
        Cursor {
            millis,
            beat_count: beat_count as u32,
            beat_basis: total_beats - beat_count,
        }
    }

    pub fn millis(&self) -> f64 {
        self.millis
    }
    pub fn beat_count(&self) -> u32 {
        self.beat_count
    }
    pub fn beat_basis(&self) -> f64 {
        self.beat_basis
    }
    /// Combined beat sum, `beat_count + beat_basis`.
    pub fn total_beats(&self) -> f64 {
        self.beat_count as f64 + self.beat_basis
    }

    pub fn add(self, rhs: Cursor) -> Cursor {
        Self::compose(
            self.millis + rhs.millis,
            self.total_beats() + rhs.total_beats(),
        )
    }

    /// `None` when either projection would go negative.
    pub fn checked_sub(self, rhs: Cursor) -> Option<Cursor> {
        if rhs.millis > self.millis || rhs.total_beats() > self.total_beats() {
            return None;
        }
        Some(Self::compose(
            self.millis - rhs.millis,
            self.total_beats() - rhs.total_beats(),
        ))
    }

    /// Like [`Cursor::checked_sub`], but clamps negative fields to zero
    /// instead of failing. The clamp is logged, since it means a caller fed
    /// in a range the timeline cannot represent.
    pub fn saturating_sub(self, rhs: Cursor) -> Cursor {
        self.checked_sub(rhs).unwrap_or_else(|| {
            log::warn!(
                "cursor subtraction clamped to zero: {:?} - {:?}",
                self,
                rhs
            );
            Self::compose(
                self.millis - rhs.millis,
                self.total_beats() - rhs.total_beats(),
            )
        })
    }

    /// Scales both projections. Negative factors are rejected.
    pub fn scale(self, factor: f64) -> Result<Cursor, InvalidScaleError> {
        if factor < 0.0 || !factor.is_finite() {
            return Err(InvalidScaleError { factor });
        }
        Ok(Self::compose(
            self.millis * factor,
            self.total_beats() * factor,
        ))
    }

    /// Linear interpolation of each field; the beat fields are recombined
    /// from the interpolated beat sum.
    pub fn lerp(a: Cursor, b: Cursor, t: f64) -> Cursor {
        Self::compose(
            a.millis + (b.millis - a.millis) * t,
            a.total_beats() + (b.total_beats() - a.total_beats()) * t,
        )
    }

    /// Re-derives the inactive projection from the active one at `bpm`.
    pub fn reprojected(self, time_base: TimeBase, bpm: f64) -> Cursor {
        match time_base {
            TimeBase::Absolute => Self::compose(self.millis, self.millis / millis_per_beat(bpm)),
            TimeBase::Tempo => {
                Self::compose(self.total_beats() * millis_per_beat(bpm), self.total_beats())
            }
        }
    }
}

/// Which projection of a [`Cursor`] is authoritative.
///
/// All cursor comparison, snapping and interpolation in the engine routes
/// through one of these; raw field comparison would conflate the bases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeBase {
    #[serde(rename = "ABSOLUTE")]
    Absolute,
    #[serde(rename = "TEMPO")]
    Tempo,
}

impl TimeBase {
    /// The authoritative scalar for this base.
    pub fn projection(self, c: Cursor) -> f64 {
        match self {
            TimeBase::Absolute => c.millis,
            TimeBase::Tempo => c.total_beats(),
        }
    }

    fn rebuild(self, value: f64, reference_bpm: f64) -> Cursor {
        match self {
            TimeBase::Absolute => {
                Cursor::compose(value.max(0.0), value.max(0.0) / millis_per_beat(reference_bpm))
            }
            TimeBase::Tempo => Cursor::compose(
                value.max(0.0) * millis_per_beat(reference_bpm),
                value.max(0.0),
            ),
        }
    }

    pub fn cmp(self, a: Cursor, b: Cursor) -> Ordering {
        self.projection(a).total_cmp(&self.projection(b))
    }

    pub fn is_before(self, a: Cursor, b: Cursor) -> bool {
        self.cmp(a, b) == Ordering::Less
    }
    pub fn is_before_or_equal(self, a: Cursor, b: Cursor) -> bool {
        self.cmp(a, b) != Ordering::Greater
    }
    pub fn is_after(self, a: Cursor, b: Cursor) -> bool {
        self.cmp(a, b) == Ordering::Greater
    }
    pub fn is_after_or_equal(self, a: Cursor, b: Cursor) -> bool {
        self.cmp(a, b) != Ordering::Less
    }
    pub fn is_equal(self, a: Cursor, b: Cursor) -> bool {
        self.cmp(a, b) == Ordering::Equal
    }

    /// Inclusive on both ends.
    pub fn is_in_range(self, c: Cursor, lo: Cursor, hi: Cursor) -> bool {
        self.is_after_or_equal(c, lo) && self.is_before_or_equal(c, hi)
    }

    pub fn is_zero(self, c: Cursor) -> bool {
        self.projection(c) == 0.0
    }

    /// `c` as a fraction of `other`; zero when `other` projects to zero.
    pub fn ratio(self, c: Cursor, other: Cursor) -> f64 {
        let denominator = self.projection(other);
        if denominator == 0.0 {
            return 0.0;
        }
        self.projection(c) / denominator
    }

    /// Where `c` sits between `lo` and `hi`, as a factor in `[0, 1]` when
    /// `c` is inside the range. Zero when the range is empty.
    pub fn lerp_factor(self, c: Cursor, lo: Cursor, hi: Cursor) -> f64 {
        let span = self.projection(hi) - self.projection(lo);
        if span == 0.0 {
            return 0.0;
        }
        (self.projection(c) - self.projection(lo)) / span
    }

    /// Cursor at fraction `t` between `a` and `b`.
    pub fn lerp(self, a: Cursor, b: Cursor, t: f64) -> Cursor {
        Cursor::lerp(a, b, t)
    }

    pub fn min(self, a: Cursor, b: Cursor) -> Cursor {
        if self.is_before_or_equal(a, b) {
            a
        } else {
            b
        }
    }
    pub fn max(self, a: Cursor, b: Cursor) -> Cursor {
        if self.is_after_or_equal(a, b) {
            a
        } else {
            b
        }
    }

    /// Non-destructive clamp of `c` into `[lo, hi]`.
    pub fn bound(self, c: Cursor, lo: Cursor, hi: Cursor) -> Cursor {
        if self.is_before(c, lo) {
            lo
        } else if self.is_after(c, hi) {
            hi
        } else {
            c
        }
    }

    /// Destructive form of [`TimeBase::bound`].
    pub fn constrain(self, c: &mut Cursor, lo: Cursor, hi: Cursor) {
        *c = self.bound(*c, lo, hi);
    }

    fn grid_units(self, c: Cursor, grid: Cursor) -> Option<f64> {
        let step = self.projection(grid);
        if step <= 0.0 {
            return None;
        }
        Some(self.projection(c) / step)
    }

    fn from_grid_units(self, units: f64, grid: Cursor, reference_bpm: f64) -> Cursor {
        self.rebuild(units * self.projection(grid), reference_bpm)
    }

    /// Nearest grid marker.
    pub fn snap(self, c: Cursor, grid: Cursor, reference_bpm: f64) -> Cursor {
        match self.grid_units(c, grid) {
            Some(u) => self.from_grid_units(u.round(), grid, reference_bpm),
            None => c,
        }
    }

    pub fn snap_floor(self, c: Cursor, grid: Cursor, reference_bpm: f64) -> Cursor {
        match self.grid_units(c, grid) {
            Some(u) => self.from_grid_units(u.floor(), grid, reference_bpm),
            None => c,
        }
    }

    pub fn snap_ceiling(self, c: Cursor, grid: Cursor, reference_bpm: f64) -> Cursor {
        match self.grid_units(c, grid) {
            Some(u) => self.from_grid_units(u.ceil(), grid, reference_bpm),
            None => c,
        }
    }

    /// Next grid marker strictly above `c`. A value within the proximity
    /// threshold of a marker counts as on it and steps a full unit.
    pub fn snap_up(self, c: Cursor, grid: Cursor, reference_bpm: f64) -> Cursor {
        match self.grid_units(c, grid) {
            Some(u) if (u - u.round()).abs() <= GRID_PROXIMITY => {
                self.from_grid_units(u.round() + 1.0, grid, reference_bpm)
            }
            Some(u) => self.from_grid_units(u.ceil(), grid, reference_bpm),
            None => c,
        }
    }

    /// Previous grid marker strictly below `c`. On-grid values step back one
    /// full unit, which is what manual nudging expects.
    pub fn snap_down(self, c: Cursor, grid: Cursor, reference_bpm: f64) -> Cursor {
        match self.grid_units(c, grid) {
            Some(u) if (u - u.round()).abs() <= GRID_PROXIMITY => {
                self.from_grid_units(u.round() - 1.0, grid, reference_bpm)
            }
            Some(u) => self.from_grid_units(u.floor(), grid, reference_bpm),
            None => c,
        }
    }

    /// Human-readable position label, `m:ss.mmm` or `bar.beat.%`.
    pub fn format_label(self, c: Cursor, beats_per_bar: u32) -> String {
        match self {
            TimeBase::Absolute => {
                let total_ms = c.millis.round() as u64;
                let minutes = total_ms / 60_000;
                let seconds = (total_ms / 1000) % 60;
                let millis = total_ms % 1000;
                format!("{}:{:02}.{:03}", minutes, seconds, millis)
            }
            TimeBase::Tempo => {
                let beats_per_bar = beats_per_bar.max(1);
                let bar = c.beat_count / beats_per_bar + 1;
                let beat = c.beat_count % beats_per_bar + 1;
                format!("{}.{}.{:02}", bar, beat, (c.beat_basis * 100.0) as u32)
            }
        }
    }
}

#[derive(Debug, PartialEq)]
pub struct InvalidCursorError {
    pub millis: f64,
    pub beat_basis: f64,
}
impl Display for InvalidCursorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Cursor fields must be non-negative and finite: millis = {}, beat basis = {}",
            self.millis, self.beat_basis
        )
    }
}
impl Error for InvalidCursorError {}

#[derive(Debug, PartialEq)]
pub struct InvalidScaleError {
    pub factor: f64,
}
impl Display for InvalidScaleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Cursor scale factor must be non-negative and finite: {}",
            self.factor
        )
    }
}
impl Error for InvalidScaleError {}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const BPM: f64 = 120.0;

    /// Tempo at which the dual projections of the constants agree.
    const CONSTANT_REFERENCE_BPM: f64 = 60.0;

    fn cursor(millis: f64) -> Cursor {
        Cursor::from_millis(millis, BPM).unwrap()
    }

    #[test]
    fn zero() {
        assert_eq!(Cursor::ZERO.millis(), 0.0);
        assert_eq!(Cursor::ZERO.beat_count(), 0);
        assert_eq!(Cursor::ZERO.beat_basis(), 0.0);
    }

    #[test]
    fn min_loop_projections_agree_at_reference() {
        let from_millis =
            Cursor::from_millis(Cursor::MIN_LOOP.millis(), CONSTANT_REFERENCE_BPM).unwrap();
        assert_eq!(from_millis, Cursor::MIN_LOOP);
    }

    #[test]
    fn new_carries_basis() {
        let c = Cursor::new(0.0, 2, 1.5).unwrap();
        assert_eq!(c.beat_count(), 3);
        assert_eq!(c.beat_basis(), 0.5);
    }

    #[test]
    fn new_rejects_negative() {
        assert!(Cursor::new(-1.0, 0, 0.0).is_err());
        assert!(Cursor::new(0.0, 0, -0.25).is_err());
    }

    #[test]
    fn from_millis_derives_beats() {
        // Half a second at 120 BPM is one beat.
        let c = cursor(500.0);
        assert_eq!(c.beat_count(), 1);
        assert_eq!(c.beat_basis(), 0.0);
    }

    #[test]
    fn add_carries_basis() {
        let a = Cursor::new(250.0, 0, 0.5).unwrap();
        let b = Cursor::new(250.0, 0, 0.75).unwrap();
        let sum = a.add(b);
        assert_eq!(sum.millis(), 500.0);
        assert_eq!(sum.beat_count(), 1);
        assert_eq!(sum.beat_basis(), 0.25);
    }

    #[test]
    fn sub_clamps_to_zero() {
        let a = cursor(100.0);
        let b = cursor(250.0);
        assert_eq!(a.checked_sub(b), None);
        assert_eq!(a.saturating_sub(b), Cursor::ZERO);
    }

    #[test]
    fn scale_rejects_negative_factor() {
        assert_eq!(
            cursor(100.0).scale(-2.0),
            Err(InvalidScaleError { factor: -2.0 })
        );
    }

    #[test]
    fn scale_doubles_both_projections() {
        let c = cursor(500.0).scale(2.0).unwrap();
        assert_eq!(c.millis(), 1000.0);
        assert_eq!(c.total_beats(), 2.0);
    }

    #[test]
    fn ordering_follows_the_active_base() {
        // Same wall-clock time, different beat positions.
        let a = Cursor::new(500.0, 1, 0.0).unwrap();
        let b = Cursor::new(500.0, 2, 0.0).unwrap();
        assert!(TimeBase::Absolute.is_equal(a, b));
        assert!(TimeBase::Tempo.is_before(a, b));
    }

    #[test]
    fn bound_clamps_both_sides() {
        let op = TimeBase::Absolute;
        let lo = cursor(100.0);
        let hi = cursor(200.0);
        assert_eq!(op.bound(cursor(50.0), lo, hi), lo);
        assert_eq!(op.bound(cursor(250.0), lo, hi), hi);
        assert_eq!(op.bound(cursor(150.0), lo, hi), cursor(150.0));
    }

    #[test]
    fn lerp_factor_inverts_lerp() {
        let op = TimeBase::Absolute;
        let a = cursor(100.0);
        let b = cursor(500.0);
        let mid = op.lerp(a, b, 0.25);
        assert!((op.lerp_factor(mid, a, b) - 0.25).abs() < 1e-9);
    }

    #[test]
    fn snap_rounds_to_nearest() {
        let op = TimeBase::Absolute;
        let grid = cursor(100.0);
        assert_eq!(op.snap(cursor(149.0), grid, BPM), cursor(100.0));
        assert_eq!(op.snap(cursor(151.0), grid, BPM), cursor(200.0));
        assert_eq!(op.snap_floor(cursor(199.0), grid, BPM), cursor(100.0));
        assert_eq!(op.snap_ceiling(cursor(101.0), grid, BPM), cursor(200.0));
    }

    #[test]
    fn snap_up_steps_off_a_marker() {
        let op = TimeBase::Absolute;
        let grid = cursor(100.0);
        assert_eq!(op.snap_up(cursor(150.0), grid, BPM), cursor(200.0));
        // Already on the grid (within proximity) steps a whole unit.
        assert_eq!(op.snap_up(cursor(200.0), grid, BPM), cursor(300.0));
        assert_eq!(op.snap_up(cursor(200.5), grid, BPM), cursor(300.0));
    }

    #[test]
    fn snap_down_steps_back_off_a_marker() {
        let op = TimeBase::Absolute;
        let grid = cursor(100.0);
        assert_eq!(op.snap_down(cursor(150.0), grid, BPM), cursor(100.0));
        assert_eq!(op.snap_down(cursor(200.0), grid, BPM), cursor(100.0));
        // Below the first marker clamps at zero.
        assert_eq!(op.snap_down(cursor(0.0), grid, BPM), Cursor::ZERO);
    }

    #[test]
    fn tempo_snap_recomputes_millis() {
        let op = TimeBase::Tempo;
        let grid = Cursor::from_beats(1.0, BPM).unwrap();
        let c = Cursor::from_beats(1.4, BPM).unwrap();
        let snapped = op.snap(c, grid, BPM);
        assert_eq!(snapped.total_beats(), 1.0);
        assert_eq!(snapped.millis(), 500.0);
    }

    #[test]
    fn labels() {
        let c = Cursor::new(61_500.0, 5, 0.25).unwrap();
        assert_eq!(TimeBase::Absolute.format_label(c, 4), "1:01.500");
        assert_eq!(TimeBase::Tempo.format_label(c, 4), "2.2.25");
    }

    proptest! {
        #[test]
        fn bound_is_idempotent(c in 0.0..1e6f64, lo in 0.0..1e6f64, hi in 0.0..1e6f64) {
            prop_assume!(lo <= hi);
            let op = TimeBase::Absolute;
            let (c, lo, hi) = (cursor(c), cursor(lo), cursor(hi));
            let once = op.bound(c, lo, hi);
            prop_assert_eq!(op.bound(once, lo, hi), once);
        }

        #[test]
        fn snap_is_idempotent(c in 0.0..1e6f64, grid in 1.0..1e4f64) {
            let op = TimeBase::Absolute;
            let (c, grid) = (cursor(c), cursor(grid));
            let once = op.snap(c, grid, BPM);
            prop_assert_eq!(op.snap(once, grid, BPM), once);
        }

        #[test]
        fn add_then_sub_roundtrips(a in 0.0..1e6f64, b in 0.0..1e6f64) {
            let (a, b) = (cursor(a), cursor(b));
            let back = a.add(b).checked_sub(b).unwrap();
            prop_assert!((back.millis() - a.millis()).abs() < 1e-6);
            prop_assert!((back.total_beats() - a.total_beats()).abs() < 1e-9);
        }

        #[test]
        fn lerp_factor_recovers_t(a in 0.0..1e6f64, b in 0.0..1e6f64, t in 0.0..1.0f64) {
            prop_assume!((a - b).abs() > 1e-3);
            let op = TimeBase::Absolute;
            let (a, b) = (cursor(a), cursor(b));
            let c = op.lerp(a, b, t);
            prop_assert!((op.lerp_factor(c, a, b) - t).abs() < 1e-6);
        }
    }
}

//! Transport sources for step generators.
//!
//! A step generator advances either from its own tempo ([`InternalClock`]) or
//! from rising edges on a patched clock input ([`PulseDetector`]). Both are
//! plain value types owned by the real-time side; nothing here allocates.

/// Level above which a pulse sample counts as high.
pub const PULSE_THRESHOLD: f32 = 0.5;

/// Lowest and highest tempo accepted by the internal clock (BPM).
pub const MIN_TEMPO: f64 = 20.0;
pub const MAX_TEMPO: f64 = 300.0;
pub const DEFAULT_TEMPO: f64 = 120.0;

/// Clamp a tempo into the accepted range. Non-finite tempos fall back to
/// [`DEFAULT_TEMPO`].
#[inline]
pub fn clamp_tempo(tempo: f64) -> f64 {
    if tempo.is_finite() {
        tempo.clamp(MIN_TEMPO, MAX_TEMPO)
    } else {
        DEFAULT_TEMPO
    }
}

/// Duration of one step in seconds.
#[inline]
pub fn step_duration(tempo: f64, subdivision: f64) -> f64 {
    60.0 / clamp_tempo(tempo) / subdivision.max(1.0)
}

/// Drift-free internal step timing.
///
/// Due times are computed as `anchor + ticks * duration` rather than by
/// repeatedly adding to the current time, so the Nth step of a constant tempo
/// lands exactly on its grid position. Changing the duration re-anchors at the
/// step that is currently due.
#[derive(Debug, Clone, Copy)]
pub struct InternalClock {
    anchor: f64,
    ticks: u64,
    duration: f64,
}

impl InternalClock {
    pub fn new(duration: f64) -> Self {
        Self {
            anchor: 0.0,
            ticks: 0,
            duration,
        }
    }

    /// Restart the grid so the next step is due at `now`.
    pub fn arm(&mut self, now: f64) {
        self.anchor = now;
        self.ticks = 0;
    }

    #[inline]
    pub fn next_due(&self) -> f64 {
        self.anchor + self.ticks as f64 * self.duration
    }

    #[inline]
    pub fn advance(&mut self) {
        self.ticks += 1;
    }

    #[inline]
    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn set_duration(&mut self, duration: f64) {
        if duration == self.duration {
            return;
        }
        self.anchor = self.next_due();
        self.ticks = 0;
        self.duration = duration;
    }
}

/// Rising-edge detector for an external clock signal.
///
/// Also measures the interval between the last two edges, which stands in
/// for the step duration while externally clocked.
#[derive(Debug, Clone, Copy, Default)]
pub struct PulseDetector {
    last: f32,
    last_edge: Option<f64>,
    period: Option<f64>,
}

impl PulseDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one sample taken at `time`. Returns true on a rising edge.
    #[inline]
    pub fn observe(&mut self, sample: f32, time: f64) -> bool {
        let rising = self.last <= PULSE_THRESHOLD && sample > PULSE_THRESHOLD;
        self.last = sample;
        if rising {
            if let Some(prev) = self.last_edge {
                let period = time - prev;
                if period > 0.0 {
                    self.period = Some(period);
                }
            }
            self.last_edge = Some(time);
        }
        rising
    }

    /// Interval between the two most recent rising edges
    pub fn period(&self) -> Option<f64> {
        self.period
    }

    /// Forget edge timing, keeping the last sample level.
    pub fn forget_timing(&mut self) {
        self.last_edge = None;
        self.period = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_step_duration() {
        assert_abs_diff_eq!(step_duration(120.0, 4.0), 0.125);
        assert_abs_diff_eq!(step_duration(60.0, 1.0), 1.0);
        // Out-of-range tempo is clamped
        assert_abs_diff_eq!(step_duration(0.0, 1.0), 3.0);
    }

    #[test]
    fn test_non_finite_tempo_uses_default() {
        assert_eq!(clamp_tempo(f64::NAN), DEFAULT_TEMPO);
        assert_eq!(clamp_tempo(f64::INFINITY), DEFAULT_TEMPO);
        assert_eq!(clamp_tempo(1000.0), MAX_TEMPO);
        assert_abs_diff_eq!(step_duration(f64::NAN, 4.0), 0.125);
        assert_abs_diff_eq!(step_duration(120.0, f64::NAN), 0.5);
    }

    #[test]
    fn test_internal_clock_grid() {
        let mut clock = InternalClock::new(0.125);
        clock.arm(2.0);
        for n in 0..1000u64 {
            assert_eq!(clock.next_due(), 2.0 + n as f64 * 0.125);
            clock.advance();
        }
    }

    #[test]
    fn test_internal_clock_reanchors_on_duration_change() {
        let mut clock = InternalClock::new(0.5);
        clock.arm(0.0);
        clock.advance();
        clock.advance();
        clock.set_duration(0.25);
        assert_abs_diff_eq!(clock.next_due(), 1.0);
        clock.advance();
        assert_abs_diff_eq!(clock.next_due(), 1.25);
    }

    #[test]
    fn test_pulse_detector_rising_edges_only() {
        let mut det = PulseDetector::new();
        let signal = [0.0, 1.0, 1.0, 0.0, 0.6, 0.4, 0.5, 0.51];
        let edges: Vec<bool> = signal
            .iter()
            .enumerate()
            .map(|(i, &s)| det.observe(s, i as f64))
            .collect();
        assert_eq!(
            edges,
            vec![false, true, false, false, true, false, false, true]
        );
    }

    #[test]
    fn test_pulse_detector_period() {
        let mut det = PulseDetector::new();
        assert!(det.observe(1.0, 0.0));
        assert!(det.period().is_none());
        det.observe(0.0, 0.1);
        assert!(det.observe(1.0, 0.25));
        assert_abs_diff_eq!(det.period().unwrap(), 0.25);
        det.forget_timing();
        assert!(det.period().is_none());
    }
}

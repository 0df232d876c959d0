//! Time <-> segment index mapping.

pub type SegmentIndex = u64;

/// Fixed-duration slicing of a video timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentClock {
    seconds: f64,
}

impl SegmentClock {
    /// `seconds` must be finite and positive; callers go through `PreviewConfig`.
    pub fn new(seconds: f64) -> Self {
        Self { seconds }
    }

    pub fn segment_seconds(&self) -> f64 {
        self.seconds
    }

    /// Negative and NaN times map to segment 0. Times past the last
    /// representable segment, `+inf` included, saturate to `SegmentIndex::MAX`.
    pub fn to_index(&self, time: f64) -> SegmentIndex {
        if time.is_nan() || time <= 0.0 {
            return 0;
        }
        // Float-to-int `as` saturates.
        (time / self.seconds).floor() as SegmentIndex
    }

    pub fn to_time(&self, index: SegmentIndex) -> f64 {
        index as f64 * self.seconds
    }

    /// Index difference between the segments containing `a` and `b`.
    pub fn distance(&self, a: f64, b: f64) -> u64 {
        self.to_index(a).abs_diff(self.to_index(b))
    }
}

impl Default for SegmentClock {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_SEGMENT_SECONDS)
    }
}

#[cfg(test)]
mod tests {
    use super::{SegmentClock, SegmentIndex};

    #[test]
    fn times_in_same_segment_share_an_index() {
        let clock = SegmentClock::new(4.0);
        assert_eq!(clock.to_index(0.0), 0);
        assert_eq!(clock.to_index(3.999), 0);
        assert_eq!(clock.to_index(4.0), 1);
        assert_eq!(clock.to_index(12.5), 3);
    }

    #[test]
    fn inverse_returns_segment_start() {
        let clock = SegmentClock::new(4.0);
        assert_eq!(clock.to_time(3), 12.0);
        assert_eq!(clock.to_index(clock.to_time(17)), 17);
    }

    #[test]
    fn invalid_times_clamp_to_first_segment() {
        let clock = SegmentClock::new(4.0);
        assert_eq!(clock.to_index(-3.0), 0);
        assert_eq!(clock.to_index(f64::NAN), 0);
        assert_eq!(clock.to_index(f64::NEG_INFINITY), 0);
    }

    #[test]
    fn infinite_time_saturates_to_last_index() {
        let clock = SegmentClock::new(4.0);
        assert_eq!(clock.to_index(f64::INFINITY), SegmentIndex::MAX);
        assert_eq!(clock.to_index(f64::MAX), SegmentIndex::MAX);
    }

    #[test]
    fn distance_is_symmetric() {
        let clock = SegmentClock::new(4.0);
        assert_eq!(clock.distance(1.0, 21.0), 5);
        assert_eq!(clock.distance(21.0, 1.0), 5);
        assert_eq!(clock.distance(4.1, 7.9), 0);
    }
}

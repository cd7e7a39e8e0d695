//! Button edge tracking for controllers.

use sweeptrack_types::{ButtonSample, ControllerState};

/// Derives per-report change masks from raw button bitmasks.
///
/// A pressed button always counts as touched.
#[derive(Debug, Default)]
pub struct ButtonTracker {
    previous: ButtonSample,
    packet: u32,
}

impl ButtonTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, sample: ButtonSample) -> ControllerState {
        let current = ButtonSample {
            pressed: sample.pressed,
            touched: sample.touched | sample.pressed,
        };
        self.packet = self.packet.wrapping_add(1);
        let state = ControllerState {
            pressed: current.pressed,
            touched: current.touched,
            changed_pressed: self.previous.pressed ^ current.pressed,
            changed_touched: self.previous.touched ^ current.touched,
            packet: self.packet,
        };
        self.previous = current;
        state
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(pressed: u64, touched: u64) -> ButtonSample {
        ButtonSample { pressed, touched }
    }

    #[test]
    fn first_report_changes_everything_set() {
        let mut tracker = ButtonTracker::new();
        let s = tracker.update(sample(0b01, 0b10));
        assert_eq!(s.pressed, 0b01);
        assert_eq!(s.touched, 0b11);
        assert_eq!(s.changed_pressed, 0b01);
        assert_eq!(s.changed_touched, 0b11);
        assert_eq!(s.packet, 1);
    }

    #[test]
    fn unchanged_report_has_no_edges() {
        let mut tracker = ButtonTracker::new();
        tracker.update(sample(0b101, 0));
        let s = tracker.update(sample(0b101, 0));
        assert_eq!(s.changed_pressed, 0);
        assert_eq!(s.changed_touched, 0);
        assert_eq!(s.packet, 2);
    }

    #[test]
    fn release_is_reported_as_change() {
        let mut tracker = ButtonTracker::new();
        tracker.update(sample(0b11, 0));
        let s = tracker.update(sample(0b01, 0));
        assert_eq!(s.changed_pressed, 0b10);
        assert_eq!(s.changed_touched, 0b10);
    }

    #[test]
    fn reset_starts_a_new_packet_sequence() {
        let mut tracker = ButtonTracker::new();
        tracker.update(sample(1, 0));
        tracker.reset();
        let s = tracker.update(sample(1, 0));
        assert_eq!(s.packet, 1);
        assert_eq!(s.changed_pressed, 1);
    }
}

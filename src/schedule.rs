//! Daily time-of-day window evaluation.

use crate::models::Schedule;

pub const SECONDS_PER_DAY: i32 = 86_400;

impl Schedule {
    /// Whether this window covers the given local seconds-of-day. Callers
    /// compute `sec_of_day` from wall time shifted by the configured UTC
    /// offset (see `garden::local_seconds_of_day`); this is the only public
    /// entry point so there is exactly one path that can get local-vs-UTC
    /// wrong.
    pub fn applies_at(&self, sec_of_day: i32) -> bool {
        if !self.active {
            return false;
        }
        let start = self.schedule_start;
        let end = self.schedule_end;

        if start == end {
            return false;
        }

        if start < end {
            sec_of_day >= start && sec_of_day < end
        } else {
            sec_of_day >= start || sec_of_day < end
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn schedule(start: i32, end: i32) -> Schedule {
        Schedule {
            uuid: Uuid::new_v4(),
            active: true,
            schedule_start: start,
            schedule_end: end,
        }
    }

    #[test]
    fn start_equals_end_never_applies() {
        let s = schedule(3600, 3600);
        assert!(!s.applies_at(0));
        assert!(!s.applies_at(3600));
        assert!(!s.applies_at(80_000));
    }

    #[test]
    fn normal_window_is_half_open() {
        let s = schedule(3600, 7200);
        assert!(!s.applies_at(3599));
        assert!(s.applies_at(3600));
        assert!(s.applies_at(7199));
        assert!(!s.applies_at(7200));
    }

    #[test]
    fn wraparound_window_applies_across_midnight() {
        // 22:00 -> 06:00
        let s = schedule(79_200, 21_600);
        assert!(s.applies_at(23 * 3600)); // 23:00
        assert!(s.applies_at(5 * 3600)); // 05:00
        assert!(!s.applies_at(7 * 3600)); // 07:00
        assert!(!s.applies_at(12 * 3600)); // noon
    }

    #[test]
    fn inactive_schedule_never_applies() {
        let mut s = schedule(0, 3600);
        s.active = false;
        assert!(!s.applies_at(1800));
    }
}

use std::time::Duration;

use crate::options::Stage;

/// The piecewise-linear VU envelope over the configured stages, expressed as
/// a demand-driven function of elapsed run time rather than a precomputed
/// timeline, so live config changes take effect on the next read.
#[derive(Debug, Clone)]
pub struct StageSchedule {
    start: u64,
    stages: Vec<Stage>,
    cumulative_ends: Vec<Duration>,
}

impl StageSchedule {
    pub fn new(start: u64, stages: Vec<Stage>) -> Self {
        let mut cumulative_ends = Vec::with_capacity(stages.len());
        let mut acc = Duration::ZERO;
        for s in &stages {
            acc = acc.saturating_add(s.duration);
            cumulative_ends.push(acc);
        }

        Self {
            start,
            stages,
            cumulative_ends,
        }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn total_duration(&self) -> Duration {
        self.cumulative_ends
            .last()
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    pub fn is_done(&self, elapsed: Duration) -> bool {
        elapsed >= self.total_duration()
    }

    /// Target VU count at `elapsed`. Interpolated linearly within the active
    /// stage and rounded to the nearest integer; ties round in the direction
    /// the envelope is moving so fractional crossings never plateau.
    pub fn target_at(&self, elapsed: Duration) -> u64 {
        if self.stages.is_empty() || elapsed == Duration::ZERO {
            return self.start;
        }

        let total = self.total_duration();
        if elapsed >= total {
            return self.stages.last().map(|s| s.target).unwrap_or(self.start);
        }

        let idx = match self
            .cumulative_ends
            .binary_search_by(|end| end.cmp(&elapsed))
        {
            Ok(i) => i,
            Err(i) => i,
        };

        let stage_end = self.cumulative_ends[idx];
        let stage_start = if idx == 0 {
            Duration::ZERO
        } else {
            self.cumulative_ends[idx - 1]
        };

        let stage_duration = stage_end.saturating_sub(stage_start);
        let stage_elapsed = elapsed.saturating_sub(stage_start);

        let start_target = if idx == 0 {
            self.start
        } else {
            self.stages[idx - 1].target
        };
        let end_target = self.stages[idx].target;

        if stage_duration.is_zero() || start_target == end_target {
            return end_target;
        }

        let den = stage_duration.as_nanos();
        let num = stage_elapsed
            .as_nanos()
            .saturating_mul(start_target.abs_diff(end_target) as u128);

        let mut moved = (num / den) as u64;
        let rem = num % den;
        if rem.saturating_mul(2) >= den {
            moved += 1;
        }

        if end_target >= start_target {
            start_target.saturating_add(moved)
        } else {
            start_target.saturating_sub(moved)
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(secs: u64, target: u64) -> Stage {
        Stage {
            duration: Duration::from_secs(secs),
            target,
        }
    }

    #[test]
    fn empty_schedule_holds_start() {
        let sched = StageSchedule::new(7, Vec::new());
        assert_eq!(sched.target_at(Duration::from_secs(100)), 7);
        assert_eq!(sched.total_duration(), Duration::ZERO);
    }

    #[test]
    fn ramp_up_hold_ramp_down() {
        // 0 -> 100 over 10s, hold 60s, 100 -> 0 over 10s.
        let sched = StageSchedule::new(0, vec![stage(10, 100), stage(60, 100), stage(10, 0)]);

        assert_eq!(sched.target_at(Duration::ZERO), 0);
        assert_eq!(sched.target_at(Duration::from_secs(5)), 50);
        assert_eq!(sched.target_at(Duration::from_secs(10)), 100);
        assert_eq!(sched.target_at(Duration::from_secs(40)), 100);
        assert_eq!(sched.target_at(Duration::from_secs(70)), 100);
        assert_eq!(sched.target_at(Duration::from_secs(75)), 50);
        assert_eq!(sched.target_at(Duration::from_secs(80)), 0);
        assert_eq!(sched.target_at(Duration::from_secs(200)), 0);
    }

    #[test]
    fn ties_round_with_the_ramp_direction() {
        // 0 -> 5 over 10s: at t=1s the exact value is 0.5, which must round
        // up while ramping up.
        let up = StageSchedule::new(0, vec![stage(10, 5)]);
        assert_eq!(up.target_at(Duration::from_secs(1)), 1);
        assert_eq!(up.target_at(Duration::from_secs(3)), 2); // 1.5 -> 2

        // 5 -> 0 over 10s: at t=1s the exact value is 4.5, which must round
        // down while ramping down.
        let down = StageSchedule::new(5, vec![stage(10, 0)]);
        assert_eq!(down.target_at(Duration::from_secs(1)), 4);
        assert_eq!(down.target_at(Duration::from_secs(3)), 3); // 3.5 -> 3
    }

    #[test]
    fn nearest_rounding_within_a_stage() {
        // 0 -> 10 over 3s: t=1s is 3.33 (rounds to 3), t=2s is 6.67 (rounds
        // to 7).
        let sched = StageSchedule::new(0, vec![stage(3, 10)]);
        assert_eq!(sched.target_at(Duration::from_secs(1)), 3);
        assert_eq!(sched.target_at(Duration::from_secs(2)), 7);
    }

    #[test]
    fn holds_final_target_after_the_envelope() {
        let sched = StageSchedule::new(0, vec![stage(10, 40)]);
        assert!(sched.is_done(Duration::from_secs(10)));
        assert_eq!(sched.target_at(Duration::from_secs(11)), 40);
    }
}

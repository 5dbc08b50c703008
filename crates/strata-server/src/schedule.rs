//! Fixed-rate tick accounting for the server loop.

/// Turns elapsed wall time into whole simulation ticks.
#[derive(Debug, Clone)]
pub struct TickSchedule {
    accumulator_secs: f64,
    tick_duration_secs: f64,
    total_ticks: u64,
}

impl TickSchedule {
    /// Schedule at `hz` ticks per second. A rate of zero is treated as one.
    pub fn with_tick_rate(hz: u32) -> Self {
        Self {
            accumulator_secs: 0.0,
            tick_duration_secs: 1.0 / f64::from(hz.max(1)),
            total_ticks: 0,
        }
    }

    /// Adds `dt_secs` of elapsed time and returns how many ticks are due.
    pub fn accumulate(&mut self, dt_secs: f64) -> u32 {
        self.accumulator_secs += dt_secs;
        let mut ticks = 0u32;
        while self.accumulator_secs >= self.tick_duration_secs {
            self.accumulator_secs -= self.tick_duration_secs;
            self.total_ticks += 1;
            ticks += 1;
        }
        ticks
    }

    /// Ticks produced since creation.
    pub fn total_ticks(&self) -> u64 {
        self.total_ticks
    }

    /// Length of one tick in milliseconds.
    pub fn tick_ms(&self) -> i64 {
        (self.tick_duration_secs * 1000.0).round() as i64
    }

    /// Length of one tick in seconds.
    pub fn tick_duration_secs(&self) -> f64 {
        self.tick_duration_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulates_whole_ticks() {
        let mut schedule = TickSchedule::with_tick_rate(20);
        assert_eq!(schedule.accumulate(0.04), 0);
        assert_eq!(schedule.accumulate(0.02), 1);
        assert_eq!(schedule.accumulate(0.2), 4);
        assert_eq!(schedule.total_ticks(), 5);
        assert_eq!(schedule.tick_ms(), 50);
    }

    #[test]
    fn test_zero_rate_clamped() {
        let schedule = TickSchedule::with_tick_rate(0);
        assert_eq!(schedule.tick_duration_secs(), 1.0);
    }
}

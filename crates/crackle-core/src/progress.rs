use std::time::{Duration, Instant};

/// Minimum advance, in percentage points, between two reports.
pub const PROGRESS_HYSTERESIS: f32 = 0.5;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProgressReport {
    pub percent: f32,
    /// Extrapolated from how long the first reported step took.
    pub eta: Option<Duration>,
}

/// Tracks completed tasks and decides when a progress report is due.
pub struct ProgressTracker {
    total: u64,
    done: u64,
    last: f32,
    started: Instant,
    first: Option<(Duration, f32)>,
}

impl ProgressTracker {
    pub fn new(total: u64) -> Self {
        Self { total, done: 0, last: 0.0, started: Instant::now(), first: None }
    }

    pub fn done(&self) -> u64 {
        self.done
    }

    pub fn advance(&mut self, tasks: u64) -> Option<ProgressReport> {
        self.done = self.done.saturating_add(tasks).min(self.total);
        self.report_at(self.started.elapsed())
    }

    fn report_at(&mut self, elapsed: Duration) -> Option<ProgressReport> {
        if self.total == 0 {
            return None;
        }
        let percent = (self.done as f64 * 100.0 / self.total as f64) as f32;
        let finished = self.done == self.total && self.last < 100.0;
        if percent - self.last <= PROGRESS_HYSTERESIS && !finished {
            return None;
        }
        self.last = percent;
        let (t0, p0) = *self.first.get_or_insert((elapsed, percent));
        let eta = if p0 > 0.0 {
            let per_point = t0.as_secs_f64() / f64::from(p0);
            Some(Duration::from_secs_f64(per_point * f64::from(100.0 - percent).max(0.0)))
        } else {
            None
        };
        Some(ProgressReport { percent, eta })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_steps_are_suppressed() {
        let mut p = ProgressTracker::new(1000);
        assert!(p.report_at_done(4, 1).is_none());
        let r = p.report_at_done(6, 2).unwrap();
        assert!((r.percent - 1.0).abs() < 1e-6);
        assert!(p.report_at_done(3, 3).is_none());
        assert!(p.report_at_done(3, 3).is_some());
    }

    #[test]
    fn eta_extrapolates_from_first_report() {
        let mut p = ProgressTracker::new(100);
        let r = p.report_at_done(10, 5).unwrap();
        assert_eq!(r.eta, Some(Duration::from_secs(45)));
        let r = p.report_at_done(40, 50).unwrap();
        assert_eq!(r.eta, Some(Duration::from_secs(25)));
    }

    #[test]
    fn completion_always_reported_once() {
        let mut p = ProgressTracker::new(1000);
        assert!(p.advance(998).is_some());
        let r = p.advance(5).unwrap();
        assert_eq!(r.percent, 100.0);
        assert_eq!(p.done(), 1000);
        assert!(p.advance(1).is_none());
    }

    impl ProgressTracker {
        fn report_at_done(&mut self, tasks: u64, secs: u64) -> Option<ProgressReport> {
            self.done += tasks;
            self.report_at(Duration::from_secs(secs))
        }
    }
}

use std::time::Instant;

use log::info;

/// Job counter shared by both schedulers. Lives behind the scheduler's
/// notification mutex; emits at most one progress line per wall-clock
/// second.
pub(crate) struct ProgressMeter {
    started: Instant,
    total: usize,
    finished: usize,
    last_tick: u64,
}

impl ProgressMeter {
    pub fn new(total: usize) -> ProgressMeter {
        ProgressMeter {
            started: Instant::now(),
            total,
            finished: 0,
            last_tick: 0,
        }
    }

    #[inline]
    pub fn elapsed(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Count one more finished job and, when a new wall-clock second
    /// has started, log progress with the remaining-time estimate.
    pub fn job_finished(&mut self, workers: usize) {
        self.finished += 1;
        let elapsed = self.elapsed();
        let tick = elapsed as u64;
        if tick == self.last_tick {
            return;
        }
        self.last_tick = tick;
        if self.finished < self.total {
            let remaining = Self::estimate(self.total, self.finished, workers, elapsed);
            info!(
                "({}/{}) Elapsed time: {:.1}s, estimated remaining time: {:.1}s",
                self.finished, self.total, elapsed, remaining
            );
        }
    }

    /// Remaining-time estimate `elapsed * (total - p) / p` where `p`
    /// credits jobs currently in flight at one third of a finished job.
    fn estimate(total: usize, finished: usize, workers: usize, elapsed: f64) -> f64 {
        let in_flight = workers.min(total - finished) as f64 / 3.0;
        let p = finished as f64 + in_flight;
        elapsed * (total as f64 - p) / p
    }
}

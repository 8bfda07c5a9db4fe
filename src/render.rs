use std::cmp::Ordering;
use std::sync::Mutex;
use std::thread;

use log::{error, info, warn};
use rand::prelude::*;

use crate::channel::ChannelBuffer;
use crate::collection::ChannelCollection;
use crate::error::{Error, Result};
use crate::orbit::{OrbitRenderer, OrbitSpec, Viewport};
use crate::progress::ProgressMeter;
use crate::UnsafeThreadWrapper;

/// Parallel job planner and dispatcher over orbit accumulation
/// channels.
///
/// Channels are registered with `add` and rendered together by
/// `execute`, which plans a job queue per channel, drives them across
/// a fixed worker pool, and returns the accumulated counters as a
/// `ChannelCollection`. Workers accumulate into private buffers and
/// merge into the shared destinations only when switching channels, so
/// the inner orbit loop never takes a lock.
pub struct OrbitScheduler {
    viewport: Viewport,
    width: usize,
    height: usize,
    num_threads: usize,
    rng_seed: Option<u64>,
    channels: Vec<(String, OrbitSpec)>,
}

impl OrbitScheduler {
    pub fn new(viewport: Viewport, width: usize, height: usize, num_threads: usize) -> OrbitScheduler {
        OrbitScheduler {
            viewport,
            width,
            height,
            num_threads: num_threads.max(1),
            rng_seed: None,
            channels: Vec::new(),
        }
    }

    /// Fix the seed stream so repeated runs draw the same candidate
    /// seeds. Worker identity still influences which seeds land in
    /// which channel.
    pub fn set_rng_seed(&mut self, seed: u64) {
        self.rng_seed = Some(seed);
    }

    /// Register a channel. Names must be unique; a duplicate is
    /// refused and the scheduler is left unchanged.
    pub fn add(&mut self, name: &str, spec: OrbitSpec) -> Result<()> {
        if self.channels.iter().any(|(existing, _)| existing == name) {
            let err = Error::NameConflict(name.to_string());
            warn!("Error while adding iteration channel: {}", err);
            return Err(err);
        }
        self.channels.push((name.to_string(), spec));
        Ok(())
    }

    /// Render every accepted channel and return the populated
    /// collection. The exclusive borrow serialises invocations.
    pub fn execute(&mut self) -> ChannelCollection {
        let mut result = ChannelCollection::new(self.width, self.height);
        if self.channels.is_empty() {
            return result;
        }

        // Plan: drop unrenderable channels, then cheapest first so the
        // steal walk reaches expensive channels last.
        let mut accepted: Vec<(&String, &OrbitSpec, f64)> = Vec::new();
        for (name, spec) in &self.channels {
            if spec.inner_iterations < 2 {
                warn!("{}", Error::InsufficientIterations(name.clone()));
                continue;
            }
            accepted.push((name, spec, spec.cost()));
        }
        if accepted.is_empty() {
            info!("No channels to render");
            return result;
        }
        accepted.sort_by(|a, b| {
            a.2.partial_cmp(&b.2)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });

        let total_cost: f64 = accepted.iter().map(|(_, _, cost)| *cost).sum();
        let approx_jobs = 3 * self.num_threads
            + if total_cost > 1.0 { total_cost.log2() as usize } else { 0 };

        let mut channels = Vec::with_capacity(accepted.len());
        let mut queues = Vec::with_capacity(accepted.len());
        let mut jobs_total = 0;
        for (name, spec, cost) in accepted {
            let share = if total_cost > 0.0 { cost / total_cost } else { 0.0 };
            let job_count = ((share * approx_jobs as f64).round() as usize).max(1);
            let queue = partition_jobs(spec.orbit_count, job_count);
            jobs_total += queue.len();
            queues.push(queue);
            channels.push(RunChannel {
                name: name.clone(),
                spec: *spec,
                dest: Mutex::new(ChannelBuffer::new(self.width, self.height)),
            });
        }

        let count = channels.len();
        let mut threads_on = vec![0usize; count];
        for i in 0..self.num_threads {
            threads_on[initial_channel(count, i)] += 1;
        }
        let unfinished: Vec<usize> = queues.iter().map(|q| q.len()).collect();

        let names: Vec<&str> = channels.iter().map(|ch| ch.name.as_str()).collect();
        info!("Computing fractal ({})", names.join(", "));

        let run = OrbitRun {
            viewport: self.viewport,
            width: self.width,
            height: self.height,
            num_threads: self.num_threads,
            rng_seed: self.rng_seed,
            channels,
            queues: Mutex::new(queues),
            ledger: Mutex::new(Ledger { threads_on, unfinished }),
            progress: Mutex::new(ProgressMeter::new(jobs_total)),
        };

        // The wrapped pointer is only valid until `run` drops; every
        // worker joins below, before that can happen.
        let ptr = UnsafeThreadWrapper(&run as *const OrbitRun);
        let mut workers = Vec::with_capacity(self.num_threads - 1);
        for i in 1..self.num_threads {
            workers.push(thread::spawn(move || {
                let run: &OrbitRun = unsafe { &*ptr.0 };
                run.worker(i)
            }));
        }

        // The main thread works too.
        run.worker(0);
        for handle in workers {
            handle.join().unwrap();
        }

        info!("Computing ended in {:.3}s", run.progress.lock().unwrap().elapsed());

        for ch in run.channels {
            let buf = match ch.dest.into_inner() {
                Ok(buf) => buf,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Err(e) = result.insert(ch.name, buf) {
                // Destinations are allocated with the result's shape.
                error!("channel buffer rejected by result collection: {}", e);
            }
        }
        result
    }
}

/// One accepted channel for the duration of a run. The destination is
/// shared across workers and locked only for merges and the final
/// maximum scan.
struct RunChannel {
    name: String,
    spec: OrbitSpec,
    dest: Mutex<ChannelBuffer>,
}

/// Attachment and completion counters, all guarded by one mutex so the
/// retirement decision reads a coherent pair.
struct Ledger {
    threads_on: Vec<usize>,
    unfinished: Vec<usize>,
}

#[derive(Clone, Copy)]
struct Job {
    channel: usize,
    orbits: u64,
}

/// Shared state of one `execute` call.
struct OrbitRun {
    viewport: Viewport,
    width: usize,
    height: usize,
    num_threads: usize,
    rng_seed: Option<u64>,
    channels: Vec<RunChannel>,
    queues: Mutex<Vec<Vec<u64>>>,
    ledger: Mutex<Ledger>,
    progress: Mutex<ProgressMeter>,
}

impl OrbitRun {
    fn worker(&self, thread_num: usize) {
        let count = self.channels.len();
        let mut attached = initial_channel(count, thread_num);
        let mut rng = self.worker_rng(thread_num);
        let mut private = ChannelBuffer::new(self.width, self.height);
        let mut renderer: Option<OrbitRenderer> = None;

        loop {
            let job = match self.get_job(attached) {
                Some(job) => job,
                None => {
                    self.leave(attached, None, &private);
                    return;
                }
            };

            if job.channel != attached {
                self.leave(attached, Some(job.channel), &private);
                private.clear();
                attached = job.channel;
                renderer = None;
            }

            if renderer.is_none() {
                let spec = &self.channels[attached].spec;
                let mut fresh = OrbitRenderer::new(
                    self.width,
                    self.height,
                    self.viewport,
                    spec.inner_iterations,
                    spec.func,
                    SmallRng::from_rng(&mut rng).unwrap(),
                );
                if let Err(e) = fresh.prepare_initial_points() {
                    error!(
                        "thread {} terminating on channel {}: {}",
                        thread_num, self.channels[attached].name, e
                    );
                    // The popped job is lost but still accounted, so
                    // the channel can retire and the run drains.
                    self.notify(job.channel);
                    self.leave(attached, None, &private);
                    return;
                }
                renderer = Some(fresh);
            }

            if let Some(renderer) = renderer.as_mut() {
                renderer.accumulate(job.orbits, private.data_mut());
                private.add_completed(job.orbits);
            }
            self.notify(job.channel);
        }
    }

    fn worker_rng(&self, thread_num: usize) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed.wrapping_add(thread_num as u64)),
            None => SmallRng::from_rng(thread_rng()).unwrap(),
        }
    }

    /// Pop the tail of the first non-empty queue found walking
    /// channels in decreasing index order, starting at `preferred`.
    /// Staying on the preferred channel amortises seed preparation;
    /// otherwise the steal lands on a nearby channel in the cost sort.
    fn get_job(&self, preferred: usize) -> Option<Job> {
        let mut queues = self.queues.lock().unwrap();
        let count = queues.len();
        let mut idx = preferred;
        for _ in 0..count {
            if let Some(orbits) = queues[idx].pop() {
                return Some(Job { channel: idx, orbits });
            }
            idx = if idx == 0 { count - 1 } else { idx - 1 };
        }
        None
    }

    /// Merge the worker's private counters into `prev`'s destination
    /// and move the attachment bookkeeping from `prev` to `next`. The
    /// worker whose departure leaves a drained channel with no
    /// attachments finalizes that channel's maximum, after every merge
    /// into it has landed.
    fn leave(&self, prev: usize, next: Option<usize>, private: &ChannelBuffer) {
        {
            let mut dest = self.channels[prev].dest.lock().unwrap();
            if let Err(e) = dest.merge_from(private) {
                // All buffers in a run share one resolution.
                error!("merging into channel {} failed: {}", self.channels[prev].name, e);
            }
        }
        let retire = {
            let mut ledger = self.ledger.lock().unwrap();
            if let Some(next) = next {
                ledger.threads_on[next] += 1;
            }
            ledger.threads_on[prev] -= 1;
            ledger.threads_on[prev] == 0 && ledger.unfinished[prev] == 0
        };
        if retire {
            self.channels[prev].dest.lock().unwrap().update_max_value();
        }
    }

    fn notify(&self, channel: usize) {
        {
            let mut ledger = self.ledger.lock().unwrap();
            ledger.unfinished[channel] -= 1;
        }
        self.progress.lock().unwrap().job_finished(self.num_threads);
    }
}

/// Initial attachment for worker `i`: spread workers from the most
/// expensive channel downward so early parallelism covers distinct
/// channels.
fn initial_channel(count: usize, worker: usize) -> usize {
    count - 1 - (worker % count)
}

/// Split `total` orbits into `jobs` queue entries whose sizes differ
/// by at most one and sum exactly to `total`.
fn partition_jobs(total: u64, jobs: usize) -> Vec<u64> {
    let jobs = jobs.max(1);
    let base = total / jobs as u64;
    let rem = (total % jobs as u64) as usize;
    (0..jobs)
        .map(|i| if i < rem { base + 1 } else { base })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use num_complex::Complex64;

    fn mandelbrot(z: Complex64, c: Complex64) -> Complex64 {
        z * z + c
    }

    fn trapped(_z: Complex64, _c: Complex64) -> Complex64 {
        Complex64::new(0.0, 0.0)
    }

    fn seeded_scheduler(width: usize, height: usize, threads: usize) -> OrbitScheduler {
        let mut scheduler = OrbitScheduler::new(Viewport::default(), width, height, threads);
        scheduler.set_rng_seed(42);
        scheduler
    }

    #[test]
    fn jobs_sum_to_the_requested_orbits() {
        for &(total, jobs) in &[(0u64, 1usize), (10, 3), (1000, 7), (5, 9), (1, 1)] {
            let queue = partition_jobs(total, jobs);
            assert_eq!(queue.len(), jobs);
            assert_eq!(queue.iter().sum::<u64>(), total);
            let min = queue.iter().min().unwrap();
            let max = queue.iter().max().unwrap();
            assert!(max - min <= 1);
        }
    }

    #[test]
    fn initial_attachments_spread_from_the_top() {
        assert_eq!(initial_channel(3, 0), 2);
        assert_eq!(initial_channel(3, 1), 1);
        assert_eq!(initial_channel(3, 2), 0);
        assert_eq!(initial_channel(3, 3), 2);
        assert_eq!(initial_channel(1, 5), 0);
    }

    #[test]
    fn duplicate_names_are_refused() {
        let mut scheduler = seeded_scheduler(4, 4, 1);
        scheduler.add("a", OrbitSpec::new(8, 10, mandelbrot)).unwrap();
        match scheduler.add("a", OrbitSpec::new(16, 10, mandelbrot)) {
            Err(Error::NameConflict(name)) => assert_eq!(name, "a"),
            other => panic!("expected NameConflict, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn empty_channel_renders_to_zeros() {
        let mut scheduler = seeded_scheduler(4, 4, 2);
        scheduler.add("a", OrbitSpec::new(2, 0, mandelbrot)).unwrap();
        let collection = scheduler.execute();

        let a = collection.get("a").expect("channel a exists");
        assert!(a.data().iter().all(|&v| v == 0));
        assert_eq!(a.max_value(), 0);
        assert_eq!(a.completed_iterations(), 0);
    }

    #[test]
    fn shallow_channels_are_dropped_deep_ones_survive() {
        let mut scheduler = seeded_scheduler(8, 8, 2);
        scheduler.add("bad", OrbitSpec::new(1, 100, mandelbrot)).unwrap();
        scheduler.add("good", OrbitSpec::new(8, 100, mandelbrot)).unwrap();
        let collection = scheduler.execute();

        assert!(collection.get("bad").is_none());
        assert!(collection.get("good").is_some());
    }

    #[test]
    fn orbit_totals_are_exact_for_any_thread_count() {
        for &threads in &[1usize, 8] {
            let mut scheduler = seeded_scheduler(16, 16, threads);
            scheduler.add("a", OrbitSpec::new(24, 3000, mandelbrot)).unwrap();
            let collection = scheduler.execute();

            let a = collection.get("a").unwrap();
            assert_eq!(a.completed_iterations(), 3000);
            assert!(a.data().iter().any(|&v| v > 0));
        }
    }

    #[test]
    fn every_channel_retires_with_a_fresh_maximum() {
        let mut scheduler = seeded_scheduler(12, 8, 4);
        scheduler.add("shallow", OrbitSpec::new(8, 500, mandelbrot)).unwrap();
        scheduler.add("mid", OrbitSpec::new(24, 500, mandelbrot)).unwrap();
        scheduler.add("deep", OrbitSpec::new(64, 500, mandelbrot)).unwrap();
        let collection = scheduler.execute();

        assert_eq!(collection.len(), 3);
        for (_, buf) in collection.iter() {
            assert_eq!(buf.completed_iterations(), 500);
            let actual_max = buf.data().iter().cloned().max().unwrap();
            assert_eq!(buf.max_value(), actual_max);
        }
    }

    #[test]
    fn seed_exhaustion_loses_work_but_not_the_run() {
        let mut scheduler = seeded_scheduler(8, 8, 2);
        scheduler.add("stuck", OrbitSpec::new(4, 100, trapped)).unwrap();
        scheduler.add("fine", OrbitSpec::new(16, 200, mandelbrot)).unwrap();
        let collection = scheduler.execute();

        // The trapped channel exists but accumulated nothing.
        let stuck = collection.get("stuck").unwrap();
        assert!(stuck.data().iter().all(|&v| v == 0));
        // The healthy channel still rendered in full.
        let fine = collection.get("fine").unwrap();
        assert_eq!(fine.completed_iterations(), 200);
    }
}

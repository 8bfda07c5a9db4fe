use std::cmp::Ordering;
use std::sync::Mutex;
use std::thread;

use log::{error, info, warn};

use crate::collection::ChannelCollection;
use crate::error::{Error, Result};
use crate::img::{ImageBuffer, Pixel};
use crate::progress::ProgressMeter;
use crate::UnsafeThreadWrapper;

/// Called once per pixel with one normalised value per input channel.
pub type PixelKernel = fn(&[f64]) -> Pixel;

/// Called once per image with the raw counters and maximum of every
/// input channel, writing the whole output range.
pub type WholeImageKernel = fn(&[&[u32]], &[u32], &mut [Pixel]);

#[derive(Clone, Copy)]
pub enum Kernel {
    PerPixel(PixelKernel),
    WholeImage(WholeImageKernel),
}

impl Kernel {
    #[inline]
    fn is_whole(&self) -> bool {
        match self {
            Kernel::WholeImage(_) => true,
            Kernel::PerPixel(_) => false,
        }
    }
}

/// How one output image is composited from named density channels.
///
/// `desired_max` is either empty, meaning every channel is normalised
/// to unity, or carries one target per input channel; entries at or
/// below zero disable normalisation for that channel.
#[derive(Clone)]
pub struct ImageSpec {
    pub kernel: Kernel,
    pub channels: Vec<String>,
    pub desired_max: Vec<f64>,
    pub cost_weight: f64,
}

impl ImageSpec {
    pub fn new(kernel: Kernel, channels: &[&str]) -> ImageSpec {
        ImageSpec {
            kernel,
            channels: channels.iter().map(|name| name.to_string()).collect(),
            desired_max: Vec::new(),
            cost_weight: 1.0,
        }
    }

    pub fn desired_max(mut self, desired_max: Vec<f64>) -> ImageSpec {
        self.desired_max = desired_max;
        self
    }

    pub fn cost_weight(mut self, weight: f64) -> ImageSpec {
        self.cost_weight = weight;
        self
    }
}

/// Parallel compositing dispatcher over output images.
///
/// Mirrors the orbit scheduler: per-image pixel-range job queues, a
/// worker pool that prefers to stay on its current image, and progress
/// through the shared meter. Each finished image is written as
/// `<filename>.png` by whichever worker completes its last job.
pub struct ImageScheduler<'c> {
    collection: &'c ChannelCollection,
    num_threads: usize,
    images: Vec<(String, ImageSpec)>,
}

impl<'c> ImageScheduler<'c> {
    pub fn new(collection: &'c ChannelCollection, num_threads: usize) -> ImageScheduler<'c> {
        ImageScheduler {
            collection,
            num_threads: num_threads.max(1),
            images: Vec::new(),
        }
    }

    /// Register an output image. Filenames must be unique; a duplicate
    /// is refused and the scheduler is left unchanged.
    pub fn add(&mut self, filename: &str, spec: ImageSpec) -> Result<()> {
        if self.images.iter().any(|(existing, _)| existing == filename) {
            let err = Error::NameConflict(filename.to_string());
            warn!("Error while adding image: {}", err);
            return Err(err);
        }
        self.images.push((filename.to_string(), spec));
        Ok(())
    }

    /// Composite and write every registered image. Failed images are
    /// skipped without a file; the rest complete normally.
    pub fn execute(&mut self) {
        if self.images.is_empty() {
            return;
        }
        info!("Saving images");

        let area = self.collection.width() * self.collection.height();

        // Per-pixel images by cost ascending, whole-image ones at the
        // top of the sort where workers start, so their single
        // indivisible jobs do not delay the drain.
        let mut plan: Vec<(&String, &ImageSpec, f64)> = self
            .images
            .iter()
            .map(|(name, spec)| (name, spec, area as f64 * spec.cost_weight))
            .collect();
        plan.sort_by(|a, b| {
            let rank = |spec: &ImageSpec| if spec.kernel.is_whole() { 1 } else { 0 };
            rank(a.1)
                .cmp(&rank(b.1))
                .then(a.2.partial_cmp(&b.2).unwrap_or(Ordering::Equal))
                .then_with(|| a.0.cmp(b.0))
        });

        let total_cost: f64 = plan.iter().map(|(_, _, cost)| *cost).sum();
        let approx_jobs = 3 * self.num_threads
            + if total_cost > 1.0 { total_cost.log2() as usize } else { 0 };

        let mut images = Vec::with_capacity(plan.len());
        let mut queues = Vec::with_capacity(plan.len());
        let mut jobs_total = 0;
        for (name, spec, cost) in plan {
            let queue = if spec.kernel.is_whole() {
                vec![(0, area)]
            } else {
                let share = if total_cost > 0.0 { cost / total_cost } else { 0.0 };
                let job_count = ((share * approx_jobs as f64).round() as usize).max(1);
                partition_ranges(area, job_count)
            };
            jobs_total += queue.len();
            queues.push(queue);

            let mut buf = ImageBuffer::new(self.collection.width(), self.collection.height());
            let pixels = buf.pixels_mut().as_mut_ptr();
            images.push(RunImage {
                filename: name.clone(),
                spec: spec.clone(),
                buf,
                pixels,
            });
        }

        let count = images.len();
        let unfinished: Vec<usize> = queues.iter().map(|q| q.len()).collect();
        let run = ImageRun {
            collection: self.collection,
            num_threads: self.num_threads,
            images,
            queues: Mutex::new(queues),
            ledger: Mutex::new(ImageLedger {
                unfinished,
                failed: vec![false; count],
            }),
            progress: Mutex::new(ProgressMeter::new(jobs_total)),
        };

        // The wrapped pointer is only valid until `run` drops, and the
        // erased collection borrow only until `execute` returns; every
        // worker joins below, before either can happen.
        let ptr = UnsafeThreadWrapper(unsafe {
            std::mem::transmute::<&ImageRun<'_>, &ImageRun<'static>>(&run)
        } as *const ImageRun<'static>);
        let mut workers = Vec::with_capacity(self.num_threads - 1);
        for i in 1..self.num_threads {
            workers.push(thread::spawn(move || {
                let run: &ImageRun = unsafe { &*ptr.0 };
                run.worker(i)
            }));
        }

        // The main thread works too.
        run.worker(0);
        for handle in workers {
            handle.join().unwrap();
        }

        info!("Saving images ended in {:.3}s", run.progress.lock().unwrap().elapsed());
    }
}

/// One registered image for the duration of a run. `pixels` aliases
/// the buffer's storage so jobs covering disjoint ranges can fill it
/// concurrently; the buffer itself is only read again once its last
/// job has completed.
struct RunImage {
    filename: String,
    spec: ImageSpec,
    buf: ImageBuffer,
    pixels: *mut Pixel,
}

struct ImageLedger {
    unfinished: Vec<usize>,
    failed: Vec<bool>,
}

#[derive(Clone, Copy)]
struct Job {
    image: usize,
    start: usize,
    end: usize,
}

/// Shared state of one `execute` call.
struct ImageRun<'c> {
    collection: &'c ChannelCollection,
    num_threads: usize,
    images: Vec<RunImage>,
    queues: Mutex<Vec<Vec<(usize, usize)>>>,
    ledger: Mutex<ImageLedger>,
    progress: Mutex<ProgressMeter>,
}

impl<'c> ImageRun<'c> {
    fn worker(&self, thread_num: usize) {
        let count = self.images.len();
        let mut preferred = initial_image(count, thread_num);
        while let Some(job) = self.get_job(preferred) {
            preferred = job.image;
            self.do_job(job);
            self.notify(job.image);
        }
    }

    /// Pop the tail of the first non-empty queue found walking images
    /// in decreasing index order, starting at `preferred`.
    fn get_job(&self, preferred: usize) -> Option<Job> {
        let mut queues = self.queues.lock().unwrap();
        let count = queues.len();
        let mut idx = preferred;
        for _ in 0..count {
            if let Some((start, end)) = queues[idx].pop() {
                return Some(Job { image: idx, start, end });
            }
            idx = if idx == 0 { count - 1 } else { idx - 1 };
        }
        None
    }

    fn do_job(&self, job: Job) {
        let img = &self.images[job.image];
        let spec = &img.spec;
        let n = spec.channels.len();

        if !spec.desired_max.is_empty() && spec.desired_max.len() != n {
            self.fail_image(job.image, &Error::DesiredMaxArity {
                want: n,
                got: spec.desired_max.len(),
            });
            return;
        }

        let mut inputs: Vec<&[u32]> = Vec::with_capacity(n);
        let mut maxima: Vec<u32> = Vec::with_capacity(n);
        let mut completed: Vec<f64> = Vec::with_capacity(n);
        for name in &spec.channels {
            match self.collection.get(name) {
                Some(ch) => {
                    inputs.push(ch.data());
                    maxima.push(ch.max_value());
                    completed.push(ch.completed_iterations() as f64);
                }
                None => {
                    self.fail_image(job.image, &Error::MissingChannel(name.clone()));
                    return;
                }
            }
        }

        // Jobs partition the image disjointly; this is the only live
        // view of this range.
        let out: &mut [Pixel] = unsafe {
            std::slice::from_raw_parts_mut(img.pixels.add(job.start), job.end - job.start)
        };

        match spec.kernel {
            Kernel::WholeImage(func) => {
                let views: Vec<&[u32]> = inputs.iter().map(|data| &data[job.start..job.end]).collect();
                func(&views, &maxima, out);
            }
            Kernel::PerPixel(func) => {
                let mut multipliers = vec![1.0; n];
                for j in 0..n {
                    let desired = spec.desired_max.get(j).cloned().unwrap_or(0.0);
                    if desired > 0.0 {
                        multipliers[j] = desired * completed[j] / maxima[j] as f64;
                    }
                }
                let mut values = vec![0.0; n];
                for (i, pixel) in out.iter_mut().enumerate() {
                    for j in 0..n {
                        values[j] = multipliers[j] * inputs[j][job.start + i] as f64 / maxima[j] as f64;
                    }
                    *pixel = func(&values);
                }
            }
        }
    }

    /// Mark an image failed, drop its pending jobs and log the cause
    /// once. Holds both the job-dispatch and completion locks so no
    /// worker can pick up or finish a job of this image in between.
    fn fail_image(&self, image: usize, cause: &Error) {
        let mut queues = self.queues.lock().unwrap();
        let mut ledger = self.ledger.lock().unwrap();
        if !ledger.failed[image] {
            ledger.failed[image] = true;
            error!("Error while saving image {}: {}", self.images[image].filename, cause);
        }
        queues[image].clear();
    }

    fn notify(&self, image: usize) {
        let done = {
            let mut ledger = self.ledger.lock().unwrap();
            ledger.unfinished[image] -= 1;
            ledger.unfinished[image] == 0 && !ledger.failed[image]
        };
        self.progress.lock().unwrap().job_finished(self.num_threads);
        if done {
            let img = &self.images[image];
            if let Err(e) = img.buf.save_file(&img.filename) {
                error!("Failed to save image {}: {}", img.filename, e);
            }
        }
    }
}

/// Initial preference for worker `i`, mirroring the orbit side: spread
/// workers from the top of the sort, where the whole-image jobs sit.
fn initial_image(count: usize, worker: usize) -> usize {
    count - 1 - (worker % count)
}

/// Split `[0, total)` into `jobs` contiguous ranges whose lengths
/// differ by at most one and cover every index exactly once.
fn partition_ranges(total: usize, jobs: usize) -> Vec<(usize, usize)> {
    let jobs = jobs.max(1);
    let base = total / jobs;
    let rem = total % jobs;
    let mut ranges = Vec::with_capacity(jobs);
    let mut start = 0;
    for i in 0..jobs {
        let len = if i < rem { base + 1 } else { base };
        ranges.push((start, start + len));
        start += len;
    }
    ranges
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::channel::ChannelBuffer;
    use std::path::{Path, PathBuf};

    fn monochrome_whole(channels: &[&[u32]], maxima: &[u32], out: &mut [Pixel]) {
        for (i, pixel) in out.iter_mut().enumerate() {
            let v = (255.0 * channels[0][i] as f64 / maxima[0] as f64) as u8;
            *pixel = [v, v, v, 255];
        }
    }

    fn gray(values: &[f64]) -> Pixel {
        let v = (255.0 * values[0].max(0.0).min(1.0)) as u8;
        [v, v, v, 255]
    }

    fn scale100(values: &[f64]) -> Pixel {
        let v = (values[0] * 100.0) as u8;
        [v, v, v, 255]
    }

    /// 2x1 collection with one channel `c` holding counters {3, 6}.
    fn tiny_collection() -> ChannelCollection {
        let mut buf = ChannelBuffer::new(2, 1);
        buf.data_mut()[0] = 3;
        buf.data_mut()[1] = 6;
        buf.add_completed(10);
        buf.update_max_value();
        let mut collection = ChannelCollection::new(2, 1);
        collection.insert("c".to_string(), buf).unwrap();
        collection
    }

    fn temp_stem(tag: &str) -> (PathBuf, String) {
        let dir = std::env::temp_dir().join(format!("nebulagen_cmp_{}_{}", std::process::id(), tag));
        std::fs::create_dir_all(&dir).unwrap();
        let stem = dir.join(tag).to_str().unwrap().to_string();
        (dir, stem)
    }

    fn read_pixels(stem: &str) -> Vec<[u8; 4]> {
        let img = image::open(format!("{}.png", stem)).unwrap().to_rgba();
        img.pixels().map(|p| p.0).collect()
    }

    #[test]
    fn ranges_cover_everything_exactly_once() {
        for &(total, jobs) in &[(8usize, 3usize), (100, 7), (5, 9), (1, 1), (0, 2)] {
            let ranges = partition_ranges(total, jobs);
            let mut expected_start = 0;
            for &(start, end) in &ranges {
                assert_eq!(start, expected_start);
                assert!(end >= start);
                expected_start = end;
            }
            assert_eq!(expected_start, total);
        }
    }

    #[test]
    fn whole_image_kernel_writes_scaled_grays() {
        let collection = tiny_collection();
        let (dir, stem) = temp_stem("whole");

        let mut scheduler = ImageScheduler::new(&collection, 2);
        scheduler.add(&stem, ImageSpec::new(Kernel::WholeImage(monochrome_whole), &["c"])).unwrap();
        scheduler.execute();

        let pixels = read_pixels(&stem);
        assert_eq!(pixels, vec![[127, 127, 127, 255], [255, 255, 255, 255]]);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn per_pixel_kernel_gets_unity_normalised_values() {
        let collection = tiny_collection();
        let (dir, stem) = temp_stem("unity");

        let mut scheduler = ImageScheduler::new(&collection, 2);
        scheduler.add(&stem, ImageSpec::new(Kernel::PerPixel(gray), &["c"])).unwrap();
        scheduler.execute();

        // values are raw/max: 0.5 and 1.0.
        let pixels = read_pixels(&stem);
        assert_eq!(pixels, vec![[127, 127, 127, 255], [255, 255, 255, 255]]);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn desired_max_scales_the_multiplier() {
        let collection = tiny_collection();
        let (dir, stem) = temp_stem("desired");

        let mut scheduler = ImageScheduler::new(&collection, 1);
        let spec = ImageSpec::new(Kernel::PerPixel(scale100), &["c"]).desired_max(vec![2.0]);
        scheduler.add(&stem, spec).unwrap();
        scheduler.execute();

        // multiplier = 2 * 10 / 6; value = multiplier * raw / 6.
        let pixels = read_pixels(&stem);
        assert_eq!(pixels[0][0], ((2.0 * 10.0 / 6.0) * 3.0 / 6.0 * 100.0) as u8);
        assert_eq!(pixels[1][0], 255); // saturated cast
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_channel_fails_only_that_image() {
        let collection = tiny_collection();
        let (dir, good_stem) = temp_stem("good");
        let bad_stem = format!("{}_bad", good_stem);

        let mut scheduler = ImageScheduler::new(&collection, 2);
        scheduler.add(&bad_stem, ImageSpec::new(Kernel::PerPixel(gray), &["nope"])).unwrap();
        scheduler.add(&good_stem, ImageSpec::new(Kernel::PerPixel(gray), &["c"])).unwrap();
        scheduler.execute();

        assert!(!Path::new(&format!("{}.png", bad_stem)).exists());
        assert!(Path::new(&format!("{}.png", good_stem)).exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn wrong_desired_max_arity_fails_the_image() {
        let collection = tiny_collection();
        let (dir, stem) = temp_stem("arity");

        let mut scheduler = ImageScheduler::new(&collection, 1);
        let spec = ImageSpec::new(Kernel::PerPixel(gray), &["c"]).desired_max(vec![1.0, 2.0]);
        scheduler.add(&stem, spec).unwrap();
        scheduler.execute();

        assert!(!Path::new(&format!("{}.png", stem)).exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn compositing_is_deterministic_across_thread_counts() {
        let mut buf = ChannelBuffer::new(8, 4);
        for (i, v) in buf.data_mut().iter_mut().enumerate() {
            *v = (i as u32 * 13) % 29;
        }
        buf.add_completed(1000);
        buf.update_max_value();
        let mut collection = ChannelCollection::new(8, 4);
        collection.insert("c".to_string(), buf).unwrap();

        let (dir, one) = temp_stem("det_one");
        let many = format!("{}_many", one);

        let mut single = ImageScheduler::new(&collection, 1);
        single.add(&one, ImageSpec::new(Kernel::PerPixel(gray), &["c"])).unwrap();
        single.execute();

        let mut pooled = ImageScheduler::new(&collection, 8);
        pooled.add(&many, ImageSpec::new(Kernel::PerPixel(gray), &["c"])).unwrap();
        pooled.execute();

        assert_eq!(read_pixels(&one), read_pixels(&many));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn duplicate_filenames_are_refused() {
        let collection = tiny_collection();
        let mut scheduler = ImageScheduler::new(&collection, 1);
        scheduler.add("x", ImageSpec::new(Kernel::PerPixel(gray), &["c"])).unwrap();
        assert!(scheduler.add("x", ImageSpec::new(Kernel::PerPixel(gray), &["c"])).is_err());
    }
}

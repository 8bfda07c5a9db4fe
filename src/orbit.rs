use num_complex::Complex64;
use rand::prelude::*;

use crate::error::{Error, Result};

/// Caller-supplied inner iteration step `(z, c) -> z'`. Must be pure
/// and allocation-free; it runs on every orbit step of every worker.
pub type InnerFn = fn(Complex64, Complex64) -> Complex64;

/// Iteration configuration for one density channel.
#[derive(Clone, Copy)]
pub struct OrbitSpec {
    /// Maximum orbit length before a seed is declared trapped.
    pub inner_iterations: u32,
    /// Number of candidate seeds to process.
    pub orbit_count: u64,
    pub func: InnerFn,
    /// Relative weight of one application of `func`, for job planning.
    pub cost_weight: f64,
}

impl OrbitSpec {
    pub fn new(inner_iterations: u32, orbit_count: u64, func: InnerFn) -> OrbitSpec {
        OrbitSpec {
            inner_iterations,
            orbit_count,
            func,
            cost_weight: 1.0,
        }
    }

    pub fn cost_weight(mut self, weight: f64) -> OrbitSpec {
        self.cost_weight = weight;
        self
    }

    /// Planning heuristic: linear in orbit length, with a super-linear
    /// term for the better sample yield of deep orbits.
    pub(crate) fn cost(&self) -> f64 {
        let inner = self.inner_iterations as f64;
        self.cost_weight * self.orbit_count as f64 * (inner + 128.0 * (inner / 1024.0).exp2())
    }
}

/// Viewport center and extent in the complex plane, together with the
/// orbit sampling parameters. The vertical extent follows from the
/// output aspect ratio.
#[derive(Clone, Copy, Debug)]
pub struct Viewport {
    pub xmid: f64,
    pub ymid: f64,
    /// Horizontal extent.
    pub size: f64,
    /// Radius of the disc around the origin that seeds are drawn from.
    pub random_radius: f64,
    /// Orbit-escape threshold magnitude.
    pub norm_limit: f64,
}

impl Default for Viewport {
    fn default() -> Viewport {
        Viewport {
            xmid: 0.0,
            ymid: 0.0,
            size: 8.0,
            random_radius: 4.0,
            norm_limit: 256.0,
        }
    }
}

/// How many escaping seeds a renderer gathers before it starts
/// replaying orbits, and how many candidate draws it is willing to
/// spend finding them.
const SEED_POOL_TARGET: usize = 1 << 14;
const SEED_ATTEMPT_FACTOR: usize = 64;

/// Single-threaded Monte-Carlo orbit sampler for one (function, depth,
/// viewport) configuration. Workers construct one per channel
/// attachment and drive it for many jobs.
pub struct OrbitRenderer {
    width: usize,
    height: usize,
    inner_iterations: u32,
    func: InnerFn,
    xmin: f64,
    ymin: f64,
    scale: f64,
    random_radius: f64,
    norm_limit_sqr: f64,
    seeds: Vec<Complex64>,
    rng: SmallRng,
}

impl OrbitRenderer {
    pub fn new(
        width: usize,
        height: usize,
        viewport: Viewport,
        inner_iterations: u32,
        func: InnerFn,
        rng: SmallRng,
    ) -> OrbitRenderer {
        let ysize = viewport.size * height as f64 / width as f64;
        OrbitRenderer {
            width,
            height,
            inner_iterations,
            func,
            xmin: viewport.xmid - viewport.size / 2.0,
            ymin: viewport.ymid - ysize / 2.0,
            scale: width as f64 / viewport.size,
            random_radius: viewport.random_radius,
            norm_limit_sqr: viewport.norm_limit * viewport.norm_limit,
            seeds: Vec::new(),
            rng,
        }
    }

    /// Gather the candidate seed pool: points in the sampling disc
    /// whose orbit escapes within the configured depth. Seeds that
    /// never escape contribute nothing and are rejected here, once,
    /// instead of on every replay.
    pub fn prepare_initial_points(&mut self) -> Result<()> {
        self.seeds.clear();
        self.seeds.reserve(SEED_POOL_TARGET);
        let budget = SEED_POOL_TARGET * SEED_ATTEMPT_FACTOR;
        for _ in 0..budget {
            if self.seeds.len() == SEED_POOL_TARGET {
                break;
            }
            let c = self.random_in_disc();
            if self.escapes(c) {
                self.seeds.push(c);
            }
        }
        if self.seeds.is_empty() {
            return Err(Error::SeedExhaustion);
        }
        Ok(())
    }

    /// Replay `orbit_count` orbits from the seed pool, incrementing the
    /// counter of every pixel an orbit passes through. `data` must be
    /// a `width * height` row-major grid.
    pub fn accumulate(&mut self, orbit_count: u64, data: &mut [u32]) {
        debug_assert!(!self.seeds.is_empty() || orbit_count == 0);
        debug_assert_eq!(data.len(), self.width * self.height);
        for _ in 0..orbit_count {
            let pick = self.rng.gen_range(0, self.seeds.len());
            let c = self.seeds[pick];
            let mut z = Complex64::new(0.0, 0.0);
            for _ in 0..self.inner_iterations {
                z = (self.func)(z, c);
                if z.norm_sqr() > self.norm_limit_sqr {
                    break;
                }
                self.plot(z, data);
            }
        }
    }

    #[inline]
    fn plot(&self, z: Complex64, data: &mut [u32]) {
        let x = (z.re - self.xmin) * self.scale;
        let y = (z.im - self.ymin) * self.scale;
        if x < 0.0 || y < 0.0 {
            return;
        }
        let (x, y) = (x as usize, y as usize);
        if x >= self.width || y >= self.height {
            return;
        }
        data[y * self.width + x] += 1;
    }

    fn random_in_disc(&mut self) -> Complex64 {
        let r = self.random_radius * self.rng.gen::<f64>().sqrt();
        let theta = 2.0 * std::f64::consts::PI * self.rng.gen::<f64>();
        Complex64::new(r * theta.cos(), r * theta.sin())
    }

    fn escapes(&self, c: Complex64) -> bool {
        let mut z = Complex64::new(0.0, 0.0);
        for _ in 0..self.inner_iterations {
            z = (self.func)(z, c);
            if z.norm_sqr() > self.norm_limit_sqr {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn mandelbrot(z: Complex64, c: Complex64) -> Complex64 {
        z * z + c
    }

    fn trapped(_z: Complex64, _c: Complex64) -> Complex64 {
        Complex64::new(0.0, 0.0)
    }

    fn renderer(inner: u32, func: InnerFn) -> OrbitRenderer {
        OrbitRenderer::new(8, 8, Viewport::default(), inner, func, SmallRng::seed_from_u64(7))
    }

    #[test]
    fn escaping_seed_is_detected() {
        let r = renderer(8, mandelbrot);
        // c = 3 leaves the escape radius on the second step.
        assert!(r.escapes(Complex64::new(3.0, 0.0)));
        // c = 0 never moves.
        assert!(!r.escapes(Complex64::new(0.0, 0.0)));
    }

    #[test]
    fn preparation_fails_when_nothing_escapes() {
        let mut r = renderer(4, trapped);
        match r.prepare_initial_points() {
            Err(Error::SeedExhaustion) => (),
            other => panic!("expected SeedExhaustion, got {:?}", other),
        }
    }

    #[test]
    fn accumulation_plots_only_inside_the_viewport() {
        let mut r = renderer(16, mandelbrot);
        r.prepare_initial_points().unwrap();
        let mut data = vec![0u32; 8 * 8];
        r.accumulate(500, &mut data);
        // Orbits of escaping seeds cross the viewport around the origin.
        assert!(data.iter().any(|&v| v > 0));
    }

    #[test]
    fn seeds_stay_inside_the_sampling_disc() {
        let mut r = renderer(8, mandelbrot);
        let radius_sqr = r.random_radius * r.random_radius;
        for _ in 0..1000 {
            let c = r.random_in_disc();
            assert!(c.norm_sqr() <= radius_sqr + 1e-9);
        }
    }

    #[test]
    fn deep_channels_cost_more() {
        let shallow = OrbitSpec::new(32, 1000, mandelbrot);
        let deep = OrbitSpec::new(2048, 1000, mandelbrot);
        assert!(deep.cost() > shallow.cost());
        // The weight scales the whole estimate linearly.
        let weighted = OrbitSpec::new(32, 1000, mandelbrot).cost_weight(2.0);
        assert!((weighted.cost() - 2.0 * shallow.cost()).abs() < 1e-6);
    }
}

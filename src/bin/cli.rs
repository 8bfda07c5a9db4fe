use std::path::Path;

use log::error;
use num_complex::Complex64;

use nebulagen::{
    ChannelCollection, ImageScheduler, ImageSpec, Kernel, OrbitScheduler, OrbitSpec, Pixel,
    Viewport,
};

const WIDTH: usize = 1920;
const HEIGHT: usize = 1080;
const ORBITS_PER_CHANNEL: u64 = 1_000_000;
const RAW_RESULTS: &str = "raw";

/// Channel names and their orbit depths, shallowest to deepest.
const CHANNELS: [(&str, u32); 7] = [
    ("i1", 32),
    ("i2", 45),
    ("i3", 64),
    ("i4", 91),
    ("i5", 128),
    ("i6", 181),
    ("i7", 256),
];

fn func(z: Complex64, c: Complex64) -> Complex64 {
    z * c + c
}

fn limit(value: f64) -> f64 {
    value.max(0.0).min(1.0)
}

/// Blend all seven depth channels into one colour image: deep orbits
/// drive red, mid depths green, shallow ones blue.
fn img_func(values: &[f64]) -> Pixel {
    let r = values[3] * 0.375
        + (values[4] * 0.375).sqrt()
        + values[5].sqrt() * 0.5
        + values[6].sqrt() * 0.675;
    let g = values[1] * 0.375
        + values[2].sqrt() * 0.375
        + values[3].sqrt() * 0.5
        + values[4].sqrt() * 0.375
        + values[5] * 0.375;
    let b = values[0].sqrt() * 0.625
        + values[1].sqrt() * 0.5
        + values[2].sqrt() * 0.375
        + values[3] * 0.375;
    [
        (255.0 * limit(r)) as u8,
        (255.0 * limit(g)) as u8,
        (255.0 * limit(b)) as u8,
        0xff,
    ]
}

fn img_monochrome(values: &[f64]) -> Pixel {
    let v = (255.0 * values[0].sqrt()) as u8;
    [v, v, v, 0xff]
}

fn img_linear(channels: &[&[u32]], maxima: &[u32], out: &mut [Pixel]) {
    for (i, pixel) in out.iter_mut().enumerate() {
        let v = (255.0 * channels[0][i] as f64 / maxima[0] as f64) as u8;
        *pixel = [v, v, v, 0xff];
    }
}

fn main() {
    env_logger::init();

    let threads = nebulagen::max_threads();
    let viewport = Viewport {
        xmid: 0.0,
        ymid: 0.0,
        size: 8.0,
        random_radius: 4.0,
        norm_limit: 256.0,
    };

    let mut manager = OrbitScheduler::new(viewport, WIDTH, HEIGHT, threads);
    for &(name, depth) in CHANNELS.iter() {
        manager
            .add(name, OrbitSpec::new(depth, ORBITS_PER_CHANNEL, func))
            .expect("channel names are distinct");
    }
    let mut collection = manager.execute();

    // Fold in the counters of any previous run, then persist the
    // accumulated state for the next one.
    if Path::new(RAW_RESULTS).exists() {
        let mut previous = ChannelCollection::new(WIDTH, HEIGHT);
        if previous.load_file(RAW_RESULTS).is_ok() {
            collection.merge(previous).expect("raw results share the run resolution");
        }
    }
    if let Err(e) = collection.save_file(RAW_RESULTS) {
        error!("Failed to save raw results: {}", e);
    }

    let names: Vec<&str> = CHANNELS.iter().map(|&(name, _)| name).collect();
    let mut images = ImageScheduler::new(&collection, threads);
    images
        .add("iall", ImageSpec::new(Kernel::PerPixel(img_func), &names))
        .expect("image filenames are distinct");
    for &name in names.iter() {
        images
            .add(name, ImageSpec::new(Kernel::PerPixel(img_monochrome), &[name]))
            .expect("image filenames are distinct");
    }
    images
        .add("i1_linear", ImageSpec::new(Kernel::WholeImage(img_linear), &["i1"]))
        .expect("image filenames are distinct");
    images.execute();
}

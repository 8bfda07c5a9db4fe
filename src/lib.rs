pub(crate) mod channel;
pub(crate) mod collection;
pub(crate) mod composite;
pub(crate) mod error;
pub(crate) mod img;
pub(crate) mod orbit;
pub(crate) mod progress;
pub(crate) mod render;

pub use crate::channel::ChannelBuffer;
pub use crate::collection::ChannelCollection;
pub use crate::composite::{ImageScheduler, ImageSpec, Kernel, PixelKernel, WholeImageKernel};
pub use crate::error::{Error, Result};
pub use crate::img::{ImageBuffer, Pixel};
pub use crate::orbit::{InnerFn, OrbitRenderer, OrbitSpec, Viewport};
pub use crate::render::OrbitScheduler;

/// Worker count to use when the caller does not care: one per logical
/// CPU.
pub fn max_threads() -> usize { num_cpus::get() }

// Funky pointer container that lets per-run state cross thread
// boundaries. Only sound because every worker joins before the pointee
// drops; both schedulers guarantee that.
pub(crate) struct UnsafeThreadWrapper<T>(pub(crate) *const T);
unsafe impl<T> std::marker::Send for UnsafeThreadWrapper<T> {}
impl<T> Copy for UnsafeThreadWrapper<T> {}
impl<T> Clone for UnsafeThreadWrapper<T> {
    fn clone(&self) -> Self { *self }
}

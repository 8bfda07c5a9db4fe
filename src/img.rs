use std::io;
use std::path::Path;

use log::info;

use crate::error::{Error, Result};

/// RGBA pixel representation, with A being the alpha channel.
/// Each item has a color value between 0 and 255.
pub type Pixel = [u8; 4];

/// Owned store of pixels arranged in row-major order that eventually
/// gets written out as a PNG.
pub struct ImageBuffer {
    width: usize,
    height: usize,
    data: Vec<Pixel>,
}

impl ImageBuffer {
    /// A new image with every pixel initialized to transparent black.
    pub fn new(width: usize, height: usize) -> ImageBuffer {
        ImageBuffer {
            width,
            height,
            data: vec![[0, 0, 0, 0]; width * height],
        }
    }

    #[inline]
    pub fn width(&self) -> usize { self.width }

    #[inline]
    pub fn height(&self) -> usize { self.height }

    #[inline]
    pub fn pixels(&self) -> &[Pixel] { &self.data }

    #[inline]
    pub fn pixels_mut(&mut self) -> &mut [Pixel] { &mut self.data }

    fn as_bytes(&self) -> &[u8] {
        // A Pixel is four plain bytes; reinterpret the backing storage.
        unsafe {
            std::slice::from_raw_parts(self.data.as_ptr() as *const u8, self.data.len() * 4)
        }
    }

    /// Encode as `<filename>.png`, appending underscores to the stem
    /// until the path does not collide with an existing file.
    pub fn save_file(&self, filename: &str) -> Result<()> {
        let mut stem = filename.to_string();
        while Path::new(&format!("{}.png", stem)).exists() {
            stem.push('_');
        }
        let path = format!("{}.png", stem);
        image::save_buffer(
            &path,
            self.as_bytes(),
            self.width as u32,
            self.height as u32,
            image::ColorType::RGBA(8),
        )
        .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))?;
        info!("Saved image {}", path);
        Ok(())
    }
}

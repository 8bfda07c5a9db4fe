use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

/// Dense row-major grid of 32-bit visit counters for one density
/// channel, together with a cached maximum and the number of orbits
/// that have been accumulated into it.
///
/// The cached `max_value` is only meaningful right after a call to
/// `update_max_value`; any merge leaves it stale until refreshed.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelBuffer {
    width: usize,
    height: usize,
    data: Vec<u32>,
    max_value: u32,
    completed_iterations: u64,
}

impl ChannelBuffer {
    /// A zeroed buffer of the given dimensions.
    pub fn new(width: usize, height: usize) -> ChannelBuffer {
        ChannelBuffer {
            width,
            height,
            data: vec![0; width * height],
            max_value: 0,
            completed_iterations: 0,
        }
    }

    #[inline]
    pub fn width(&self) -> usize { self.width }

    #[inline]
    pub fn height(&self) -> usize { self.height }

    /// Row-major counters, `width * height` of them.
    #[inline]
    pub fn data(&self) -> &[u32] { &self.data }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [u32] { &mut self.data }

    #[inline]
    pub fn max_value(&self) -> u32 { self.max_value }

    #[inline]
    pub fn completed_iterations(&self) -> u64 { self.completed_iterations }

    /// Record that `orbits` more orbits have been accumulated into the
    /// counters.
    #[inline]
    pub fn add_completed(&mut self, orbits: u64) {
        self.completed_iterations += orbits;
    }

    /// Zero the counters and the orbit count, making the buffer ready
    /// for reuse. Leaves `max_value` stale.
    pub fn clear(&mut self) {
        for v in self.data.iter_mut() {
            *v = 0;
        }
        self.completed_iterations = 0;
    }

    /// Add `other`'s counters and orbit count into this buffer
    /// elementwise. Does not touch `max_value`; callers refresh it once
    /// all merges into this buffer are done.
    pub fn merge_from(&mut self, other: &ChannelBuffer) -> Result<()> {
        if self.data.len() != other.data.len() {
            return Err(Error::DimensionMismatch);
        }
        for (dst, src) in self.data.iter_mut().zip(other.data.iter()) {
            *dst += *src;
        }
        self.completed_iterations += other.completed_iterations;
        Ok(())
    }

    /// Rescan the counters and cache the maximum. Callers must ensure
    /// no concurrent writers.
    pub fn update_max_value(&mut self) {
        self.max_value = self.data.iter().cloned().max().unwrap_or(0);
    }

    /// Write the orbit count, maximum and counters in the raw results
    /// layout: u64 then u32 then `width * height` u32s, all
    /// little-endian.
    pub fn to_stream<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u64::<LittleEndian>(self.completed_iterations)?;
        w.write_u32::<LittleEndian>(self.max_value)?;
        for &v in self.data.iter() {
            w.write_u32::<LittleEndian>(v)?;
        }
        Ok(())
    }

    /// Counterpart of `to_stream`. The buffer keeps its dimensions; a
    /// short read is reported as `CorruptInput` and leaves the buffer
    /// contents unspecified.
    pub fn from_stream<R: Read>(&mut self, r: &mut R) -> Result<()> {
        self.completed_iterations = r.read_u64::<LittleEndian>().map_err(|_| Error::CorruptInput)?;
        self.max_value = r.read_u32::<LittleEndian>().map_err(|_| Error::CorruptInput)?;
        r.read_u32_into::<LittleEndian>(&mut self.data)
            .map_err(|_| Error::CorruptInput)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    fn patterned(width: usize, height: usize, offset: u32) -> ChannelBuffer {
        let mut buf = ChannelBuffer::new(width, height);
        for (i, v) in buf.data_mut().iter_mut().enumerate() {
            *v = offset + i as u32;
        }
        buf
    }

    #[test]
    fn merge_is_additive() {
        let mut a = patterned(4, 2, 1);
        a.add_completed(10);
        let mut b = patterned(4, 2, 100);
        b.add_completed(3);

        let before: Vec<u32> = a.data().to_vec();
        a.merge_from(&b).unwrap();

        for i in 0..a.data().len() {
            assert_eq!(a.data()[i], before[i] + b.data()[i]);
        }
        assert_eq!(a.completed_iterations(), 13);
    }

    #[test]
    fn merge_refuses_mismatched_shapes() {
        let mut a = ChannelBuffer::new(4, 4);
        let b = ChannelBuffer::new(4, 5);
        assert!(a.merge_from(&b).is_err());
    }

    #[test]
    fn max_value_covers_every_counter() {
        let mut buf = patterned(3, 3, 7);
        buf.update_max_value();
        assert_eq!(buf.max_value(), 15);
        for &v in buf.data() {
            assert!(buf.max_value() >= v);
        }
    }

    #[test]
    fn clear_resets_counters_and_orbit_count() {
        let mut buf = patterned(2, 2, 5);
        buf.add_completed(42);
        buf.clear();
        assert!(buf.data().iter().all(|&v| v == 0));
        assert_eq!(buf.completed_iterations(), 0);
    }

    #[test]
    fn stream_round_trip() {
        let mut buf = patterned(3, 2, 11);
        buf.add_completed(99);
        buf.update_max_value();

        let mut bytes = Vec::new();
        buf.to_stream(&mut bytes).unwrap();
        // u64 count + u32 max + six u32 counters
        assert_eq!(bytes.len(), 8 + 4 + 6 * 4);

        let mut restored = ChannelBuffer::new(3, 2);
        restored.from_stream(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(restored, buf);
    }

    #[test]
    fn truncated_stream_is_corrupt() {
        let buf = patterned(3, 2, 1);
        let mut bytes = Vec::new();
        buf.to_stream(&mut bytes).unwrap();
        bytes.truncate(bytes.len() - 3);

        let mut restored = ChannelBuffer::new(3, 2);
        match restored.from_stream(&mut Cursor::new(bytes)) {
            Err(Error::CorruptInput) => (),
            other => panic!("expected CorruptInput, got {:?}", other),
        }
    }
}

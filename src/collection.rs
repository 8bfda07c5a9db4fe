use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{error, info, warn};

use crate::channel::ChannelBuffer;
use crate::error::{Error, Result};

/// Upper bound on a persisted channel name. Anything larger is a
/// corrupted length field, not a name.
const MAX_NAME_LEN: u64 = 1 << 20;

/// Named density channels sharing one resolution, with raw-results
/// persistence.
///
/// The file layout is little-endian throughout: a `u64` width and
/// height header, then one record per channel holding a `u64` name
/// length, the UTF-8 name bytes, and the channel payload (`u64` orbit
/// count, `u32` maximum, `width * height` `u32` counters).
#[derive(Debug, PartialEq)]
pub struct ChannelCollection {
    width: usize,
    height: usize,
    channels: BTreeMap<String, ChannelBuffer>,
}

impl ChannelCollection {
    pub fn new(width: usize, height: usize) -> ChannelCollection {
        ChannelCollection {
            width,
            height,
            channels: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn width(&self) -> usize { self.width }

    #[inline]
    pub fn height(&self) -> usize { self.height }

    #[inline]
    pub fn len(&self) -> usize { self.channels.len() }

    #[inline]
    pub fn is_empty(&self) -> bool { self.channels.is_empty() }

    #[inline]
    pub fn get(&self, name: &str) -> Option<&ChannelBuffer> {
        self.channels.get(name)
    }

    /// Channels in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ChannelBuffer)> {
        self.channels.iter().map(|(name, buf)| (name.as_str(), buf))
    }

    /// Insert a buffer under `name`, replacing any previous holder of
    /// that name. The buffer must match the collection's resolution.
    pub fn insert(&mut self, name: String, buf: ChannelBuffer) -> Result<()> {
        if buf.width() != self.width || buf.height() != self.height {
            return Err(Error::DimensionMismatch);
        }
        self.channels.insert(name, buf);
        Ok(())
    }

    /// Fold another collection into this one: new names are moved in,
    /// existing names are merged elementwise and their maxima
    /// refreshed.
    pub fn merge(&mut self, other: ChannelCollection) -> Result<()> {
        if other.width != self.width || other.height != self.height {
            return Err(Error::DimensionMismatch);
        }
        let mut merged = Vec::with_capacity(other.channels.len());
        for (name, buf) in other.channels {
            match self.channels.entry(name) {
                Entry::Vacant(slot) => {
                    merged.push(slot.key().clone());
                    slot.insert(buf);
                }
                Entry::Occupied(mut slot) => {
                    merged.push(format!("{}(merged)", slot.key()));
                    if let Err(e) = slot.get_mut().merge_from(&buf) {
                        // Both sides carry this collection's resolution.
                        error!("merging channel {} failed: {}", slot.key(), e);
                    } else {
                        slot.get_mut().update_max_value();
                    }
                }
            }
        }
        info!("Merged channel collection: {}", merged.join(", "));
        Ok(())
    }

    /// Read raw results from `filename` into this collection. Channels
    /// already present under the same name are merged (and their
    /// maxima refreshed) rather than replaced. A resolution mismatch
    /// aborts before any record is consumed; a short read inside a
    /// record aborts the file but keeps the records read so far.
    pub fn load_file(&mut self, filename: &str) -> Result<()> {
        let file = match File::open(filename) {
            Ok(f) => f,
            Err(e) => {
                warn!("Unable to open raw results file: {}", filename);
                return Err(e.into());
            }
        };
        let mut r = BufReader::new(file);

        let found_width = r.read_u64::<LittleEndian>()? as usize;
        let found_height = r.read_u64::<LittleEndian>()? as usize;
        if found_width != self.width || found_height != self.height {
            return Err(Error::HeaderMismatch {
                width: self.width,
                height: self.height,
                found_width,
                found_height,
            });
        }

        let mut loaded = Vec::new();
        while let Some(name_len) = read_record_len(&mut r)? {
            if name_len >= 1024 {
                warn!("channel name is {} bytes long", name_len);
            }
            if name_len > MAX_NAME_LEN {
                return Err(Error::CorruptInput);
            }
            let mut name_bytes = vec![0u8; name_len as usize];
            r.read_exact(&mut name_bytes).map_err(|_| Error::CorruptInput)?;
            let name = String::from_utf8(name_bytes).map_err(|_| Error::CorruptInput)?;

            let mut buf = ChannelBuffer::new(self.width, self.height);
            buf.from_stream(&mut r)?;

            match self.channels.entry(name) {
                Entry::Vacant(slot) => {
                    loaded.push(slot.key().clone());
                    slot.insert(buf);
                }
                Entry::Occupied(mut slot) => {
                    loaded.push(format!("{}(merged)", slot.key()));
                    if let Err(e) = slot.get_mut().merge_from(&buf) {
                        error!("merging channel {} while loading failed: {}", slot.key(), e);
                    } else {
                        slot.get_mut().update_max_value();
                    }
                }
            }
        }
        info!("Loaded raw results file: {}, channels: {}", filename, loaded.join(", "));
        Ok(())
    }

    /// Write the header and every channel record in name order.
    pub fn save_file(&self, filename: &str) -> Result<()> {
        let mut w = BufWriter::new(File::create(filename)?);
        w.write_u64::<LittleEndian>(self.width as u64)?;
        w.write_u64::<LittleEndian>(self.height as u64)?;
        for (name, buf) in &self.channels {
            w.write_u64::<LittleEndian>(name.len() as u64)?;
            w.write_all(name.as_bytes())?;
            buf.to_stream(&mut w)?;
        }
        w.flush()?;
        let names: Vec<&str> = self.channels.keys().map(|n| n.as_str()).collect();
        info!("Saved raw results file: {}, channels: {}", filename, names.join(", "));
        Ok(())
    }
}

/// Read the length field that opens a record, distinguishing a clean
/// end of file (no bytes left, `None`) from a truncated field
/// (`CorruptInput`).
fn read_record_len<R: Read>(r: &mut R) -> Result<Option<u64>> {
    let mut buf = [0u8; 8];
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled == 0 {
        return Ok(None);
    }
    if filled < buf.len() {
        return Err(Error::CorruptInput);
    }
    Ok(Some(u64::from_le_bytes(buf)))
}

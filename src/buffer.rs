use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};

use crate::error::{Error, Result};

/// Largest span a single mapping region covers. Files beyond this are split
/// into several regions mapped independently.
pub const DEFAULT_REGION_SIZE: u64 = i32::MAX as u64;

/// Backing files are never smaller than this, even when the requested size is.
pub const MIN_FILE_SIZE: u64 = 1 << 20;

/// A byte-addressable cursor over a file that may exceed a single mappable
/// region. The file is carved into `max_region`-sized regions, each mapped on
/// its own; reads and writes that cross a region boundary are stitched
/// together so callers see one contiguous buffer.
///
/// A `SegmentedBuffer` is single-threaded; the map engine serializes access
/// through its shard locks.
pub struct SegmentedBuffer {
    regions: Vec<MmapMut>,
    region_size: u64,
    capacity: u64,
    position: u64,
    path: Option<PathBuf>,
}

impl SegmentedBuffer {
    /// Open (or create) a persistent buffer at `path`, keeping whatever bytes
    /// the file already holds. The mapped size is the larger of `target_size`,
    /// the current file size and the 1 MiB floor.
    pub fn open<P: AsRef<Path>>(path: P, target_size: u64, max_region: u64) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Self::map(file, target_size, max_region, Some(path.to_path_buf()))
    }

    /// Create a persistent buffer at `path`, discarding any previous content.
    pub fn create<P: AsRef<Path>>(path: P, target_size: u64, max_region: u64) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Self::map(file, target_size, max_region, Some(path.to_path_buf()))
    }

    /// Create an ephemeral buffer over an anonymous temp file. The file is
    /// already unlinked, so it disappears when the buffer is dropped.
    pub fn ephemeral(target_size: u64, max_region: u64) -> Result<Self> {
        let file = tempfile::tempfile()?;
        Self::map(file, target_size, max_region, None)
    }

    fn map(file: File, target_size: u64, max_region: u64, path: Option<PathBuf>) -> Result<Self> {
        let current = file.metadata()?.len();
        let capacity = target_size.max(MIN_FILE_SIZE).max(current);
        file.set_len(capacity)?;

        let region_count = capacity.div_ceil(max_region);
        let mut regions = Vec::with_capacity(region_count as usize);
        for k in 0..region_count {
            let offset = k * max_region;
            let len = max_region.min(capacity - offset);
            let mmap = unsafe {
                MmapOptions::new()
                    .offset(offset)
                    .len(len as usize)
                    .map_mut(&file)?
            };
            regions.push(mmap);
        }
        // The handle can go; the mappings keep the file contents reachable.
        drop(file);

        Ok(Self {
            regions,
            region_size: max_region,
            capacity,
            position: 0,
            path,
        })
    }

    /// Total mapped size, the sum of all region capacities.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Next append position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Move the cursor. Accesses past `capacity()` fail at read/write time.
    pub fn set_position(&mut self, position: u64) {
        self.position = position;
    }

    pub(crate) fn region_size(&self) -> u64 {
        self.region_size
    }

    /// Path of the backing file; `None` for ephemeral buffers.
    pub(crate) fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        let end = offset + len as u64;
        if end > self.capacity {
            return Err(Error::OutOfBounds {
                position: end,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Read `dst.len()` bytes starting at `offset`, leaving the cursor alone.
    /// A read spanning a region boundary assembles the pieces contiguously
    /// into `dst`.
    pub fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        self.check_range(offset, dst.len())?;
        let mut at = offset;
        let mut filled = 0;
        while filled < dst.len() {
            let region = (at / self.region_size) as usize;
            let local = (at % self.region_size) as usize;
            let n = (self.regions[region].len() - local).min(dst.len() - filled);
            dst[filled..filled + n].copy_from_slice(&self.regions[region][local..local + n]);
            at += n as u64;
            filled += n;
        }
        Ok(())
    }

    /// Write `data` starting at `offset`, leaving the cursor alone. Writes
    /// spanning a region boundary are split across the touched regions.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        let mut at = offset;
        let mut written = 0;
        while written < data.len() {
            let region = (at / self.region_size) as usize;
            let local = (at % self.region_size) as usize;
            let n = (self.regions[region].len() - local).min(data.len() - written);
            self.regions[region][local..local + n].copy_from_slice(&data[written..written + n]);
            at += n as u64;
            written += n;
        }
        Ok(())
    }

    /// Read at the cursor, advancing it by `dst.len()`.
    pub fn read(&mut self, dst: &mut [u8]) -> Result<()> {
        self.read_at(self.position, dst)?;
        self.position += dst.len() as u64;
        Ok(())
    }

    /// Write at the cursor, advancing it by `data.len()`.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.write_at(self.position, data)?;
        self.position += data.len() as u64;
        Ok(())
    }

    pub fn read_u32_at(&self, offset: u64) -> Result<u32> {
        let mut word = [0u8; 4];
        self.read_at(offset, &mut word)?;
        Ok(u32::from_be_bytes(word))
    }

    pub fn write_u32_at(&mut self, offset: u64, value: u32) -> Result<()> {
        self.write_at(offset, &value.to_be_bytes())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let value = self.read_u32_at(self.position)?;
        self.position += 4;
        Ok(value)
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        let position = self.position;
        self.write_u32_at(position, value)?;
        self.position += 4;
        Ok(())
    }

    /// Flush every region's mapping to disk.
    pub fn flush(&self) -> Result<()> {
        for region in &self.regions {
            region.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    #[test]
    fn write_and_read_within_one_region() {
        let mut buf = SegmentedBuffer::ephemeral(0, DEFAULT_REGION_SIZE).unwrap();
        assert_eq!(buf.capacity(), MIN_FILE_SIZE);

        buf.write(b"hello world").unwrap();
        assert_eq!(buf.position(), 11);

        buf.set_position(0);
        let mut back = [0u8; 11];
        buf.read(&mut back).unwrap();
        assert_eq!(&back, b"hello world");
        assert_eq!(buf.position(), 11);
    }

    #[test]
    fn region_boundary_round_trip() {
        // Three region-sized chunks written back to back with a 1 KiB region
        // size; each must read back intact at the offset it was written to.
        let mut buf = SegmentedBuffer::ephemeral(3072, 1024).unwrap();

        let chunks: Vec<Vec<u8>> = (0u8..3).map(|i| vec![b'a' + i; 1024]).collect();
        for chunk in &chunks {
            buf.write(chunk).unwrap();
        }

        for (i, chunk) in chunks.iter().enumerate() {
            let mut back = vec![0u8; 1024];
            buf.read_at(i as u64 * 1024, &mut back).unwrap();
            assert_eq!(&back, chunk);
        }
    }

    #[test]
    fn unaligned_write_spans_regions() {
        let mut buf = SegmentedBuffer::ephemeral(4096, 1024).unwrap();

        // 600 bytes at position 700 straddles the first region boundary.
        buf.set_position(700);
        let data: Vec<u8> = (0..600).map(|i| (i % 251) as u8).collect();
        buf.write(&data).unwrap();
        assert_eq!(buf.position(), 1300);

        let mut back = vec![0u8; 600];
        buf.read_at(700, &mut back).unwrap();
        assert_eq!(back, data);

        // A read covering three regions also stitches correctly.
        buf.set_position(100);
        buf.write(&vec![0xabu8; 2500]).unwrap();
        let mut wide = vec![0u8; 2500];
        buf.read_at(100, &mut wide).unwrap();
        assert!(wide.iter().all(|&b| b == 0xab));
    }

    #[test]
    fn out_of_bounds_is_an_error() {
        let mut buf = SegmentedBuffer::ephemeral(0, DEFAULT_REGION_SIZE).unwrap();
        buf.set_position(buf.capacity() - 2);
        let err = buf.write(b"overflow").unwrap_err();
        assert!(matches!(err, Error::OutOfBounds { .. }));

        let mut dst = [0u8; 8];
        let err = buf.read_at(buf.capacity() - 2, &mut dst).unwrap_err();
        assert!(matches!(err, Error::OutOfBounds { .. }));
    }

    #[test]
    fn u32_helpers_are_big_endian() {
        let mut buf = SegmentedBuffer::ephemeral(0, DEFAULT_REGION_SIZE).unwrap();
        buf.write_u32(0x0102_0304).unwrap();

        let mut raw = [0u8; 4];
        buf.read_at(0, &mut raw).unwrap();
        assert_eq!(raw, [1, 2, 3, 4]);
        assert_eq!(buf.read_u32_at(0).unwrap(), 0x0102_0304);
    }

    #[test]
    fn persistent_reopen_sees_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("buf.hdg");

        {
            let mut buf = SegmentedBuffer::open(&path, 0, DEFAULT_REGION_SIZE).unwrap();
            buf.write(b"persist me").unwrap();
            buf.flush().unwrap();
        }

        let buf = SegmentedBuffer::open(&path, 0, DEFAULT_REGION_SIZE).unwrap();
        let mut back = [0u8; 10];
        buf.read_at(0, &mut back).unwrap();
        assert_eq!(&back, b"persist me");
    }

    #[test]
    fn open_keeps_larger_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("buf.hdg");

        {
            let buf = SegmentedBuffer::open(&path, 4 * MIN_FILE_SIZE, DEFAULT_REGION_SIZE).unwrap();
            assert_eq!(buf.capacity(), 4 * MIN_FILE_SIZE);
        }

        // Re-opening with a smaller target keeps the existing size.
        let buf = SegmentedBuffer::open(&path, 0, DEFAULT_REGION_SIZE).unwrap();
        assert_eq!(buf.capacity(), 4 * MIN_FILE_SIZE);
    }

    #[test]
    fn create_discards_existing_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("buf.hdg");

        {
            let mut buf = SegmentedBuffer::open(&path, 0, DEFAULT_REGION_SIZE).unwrap();
            buf.write(b"old bytes").unwrap();
            buf.flush().unwrap();
        }

        let buf = SegmentedBuffer::create(&path, 0, DEFAULT_REGION_SIZE).unwrap();
        let mut back = [0u8; 9];
        buf.read_at(0, &mut back).unwrap();
        assert_eq!(back, [0u8; 9]);
    }

    proptest! {
        #[test]
        fn chunked_round_trip(
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..300), 1..40),
            region in 64u64..2048,
        ) {
            let total: usize = chunks.iter().map(Vec::len).sum();
            let mut buf = SegmentedBuffer::ephemeral(total as u64, region).unwrap();

            let mut offsets = Vec::with_capacity(chunks.len());
            for chunk in &chunks {
                offsets.push(buf.position());
                buf.write(chunk).unwrap();
            }

            for (offset, chunk) in offsets.iter().zip(&chunks) {
                let mut back = vec![0u8; chunk.len()];
                buf.read_at(*offset, &mut back).unwrap();
                prop_assert_eq!(&back, chunk);
            }
        }
    }
}

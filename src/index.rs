use std::hash::BuildHasher;
use std::marker::PhantomData;
use std::path::Path;

use rustc_hash::FxBuildHasher;

use crate::buffer::SegmentedBuffer;
use crate::codec::BytesEncode;
use crate::error::{Error, Result};

/// Smallest slot-array capacity; requested capacities below this are raised.
pub const DEFAULT_CAPACITY: u32 = 1024;

/// Slot sentinel for a removed entry. Distinct from 0 (empty) and from every
/// valid record offset, which are guarded to stay below it. Probes skip it so
/// chains built before a removal keep resolving.
const TOMBSTONE: u32 = u32::MAX;

const HEADER_BYTES: u64 = 4;
const SLOT_BYTES: u64 = 4;
/// Fixed tail of every key-record payload: value offset (8) + value length (4).
const RECORD_SUFFIX: usize = 12;

/// Persistent open-addressed hash table from encoded keys to
/// `(value_offset, value_len)` pairs in the companion data file.
///
/// On-disk layout, all integers big-endian:
///
/// ```text
/// [0..4)               capacity
/// [4..4+capacity*4)    slots; 0 = empty, u32::MAX = tombstone,
///                      anything else = byte offset of a key record
/// [slots end..)        key records: [u32 payload_len][key][u64 off][u32 len]
/// ```
///
/// The file is self-describing: the append cursor is recovered on open as the
/// highest live slot offset plus that record's length prefix, so no separate
/// cursor header exists.
pub struct IndexStore<K, S = FxBuildHasher> {
    buf: SegmentedBuffer,
    capacity: u32,
    len: usize,
    initial_capacity: u32,
    hasher: S,
    _marker: PhantomData<K>,
}

struct Record {
    key: Vec<u8>,
    value_offset: u64,
    value_len: u32,
}

enum Probe {
    Found {
        slot: u32,
        value_offset: u64,
        value_len: u32,
    },
    Absent {
        insert_at: u32,
    },
}

impl<K, S> IndexStore<K, S>
where
    K: BytesEncode,
    S: BuildHasher + Clone + Default,
{
    /// Open (or create) a persistent index at `path` with the default hasher.
    pub fn open<P: AsRef<Path>>(
        path: P,
        initial_capacity: u32,
        initial_file_size: u64,
        max_region: u64,
    ) -> Result<Self> {
        Self::open_with_hasher(path, initial_capacity, initial_file_size, max_region, S::default())
    }

    /// Create an ephemeral index over an anonymous temp file.
    pub fn ephemeral(
        initial_capacity: u32,
        initial_file_size: u64,
        max_region: u64,
    ) -> Result<Self> {
        Self::ephemeral_with_hasher(initial_capacity, initial_file_size, max_region, S::default())
    }
}

impl<K, S> IndexStore<K, S>
where
    K: BytesEncode,
    S: BuildHasher + Clone,
{
    /// Open (or create) a persistent index at `path`. A zero capacity header
    /// initializes a fresh table; anything else restores the existing one.
    pub fn open_with_hasher<P: AsRef<Path>>(
        path: P,
        initial_capacity: u32,
        initial_file_size: u64,
        max_region: u64,
        hasher: S,
    ) -> Result<Self> {
        let buf = SegmentedBuffer::open(path, initial_file_size, max_region)?;
        Self::from_buffer(buf, initial_capacity, hasher)
    }

    pub fn ephemeral_with_hasher(
        initial_capacity: u32,
        initial_file_size: u64,
        max_region: u64,
        hasher: S,
    ) -> Result<Self> {
        let buf = SegmentedBuffer::ephemeral(initial_file_size, max_region)?;
        Self::from_buffer(buf, initial_capacity, hasher)
    }

    fn from_buffer(buf: SegmentedBuffer, initial_capacity: u32, hasher: S) -> Result<Self> {
        let header = buf.read_u32_at(0)?;
        let mut store = Self {
            buf,
            capacity: 0,
            len: 0,
            initial_capacity,
            hasher,
            _marker: PhantomData,
        };
        if header == 0 {
            store.initialize(initial_capacity.max(DEFAULT_CAPACITY))?;
        } else {
            store.restore(header)?;
        }
        Ok(store)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Slot-array capacity.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Size of the backing file.
    pub fn file_capacity(&self) -> u64 {
        self.buf.capacity()
    }

    pub fn flush(&self) -> Result<()> {
        self.buf.flush()
    }

    fn slots_end(capacity: u32) -> u64 {
        HEADER_BYTES + capacity as u64 * SLOT_BYTES
    }

    fn slot_offset(slot: u32) -> u64 {
        HEADER_BYTES + slot as u64 * SLOT_BYTES
    }

    fn read_slot(&self, slot: u32) -> Result<u32> {
        self.buf.read_u32_at(Self::slot_offset(slot))
    }

    fn write_slot(&mut self, slot: u32, value: u32) -> Result<()> {
        self.buf.write_u32_at(Self::slot_offset(slot), value)
    }

    /// Rewrite the header, zero the slot array and park the append cursor just
    /// past it. The file itself keeps its size.
    fn initialize(&mut self, capacity: u32) -> Result<()> {
        let slots_end = Self::slots_end(capacity);
        if slots_end > self.buf.capacity() {
            return Err(Error::OutOfBounds {
                position: slots_end,
                capacity: self.buf.capacity(),
            });
        }
        self.capacity = capacity;
        self.len = 0;
        self.buf.set_position(0);
        self.buf.write_u32(capacity)?;
        let zeros = [0u8; 16 * 1024];
        let mut remaining = capacity as u64 * SLOT_BYTES;
        while remaining > 0 {
            let n = (zeros.len() as u64).min(remaining) as usize;
            self.buf.write(&zeros[..n])?;
            remaining -= n as u64;
        }
        Ok(())
    }

    /// Rebuild in-memory state from an existing file: scan the slots for the
    /// live count and the highest record offset, then recompute the append
    /// cursor from that record's length prefix.
    fn restore(&mut self, capacity: u32) -> Result<()> {
        let slots_end = Self::slots_end(capacity);
        if slots_end > self.buf.capacity() {
            return Err(Error::Corrupt(format!(
                "capacity header of {capacity} slots does not fit a {} byte file",
                self.buf.capacity()
            )));
        }
        self.capacity = capacity;

        let mut live = 0usize;
        let mut max_pos = 0u32;
        for slot in 0..capacity {
            let stored = self.read_slot(slot)?;
            if stored != 0 && stored != TOMBSTONE {
                live += 1;
                max_pos = max_pos.max(stored);
            }
        }
        self.len = live;

        if max_pos == 0 {
            self.buf.set_position(slots_end);
        } else {
            let payload_len = self.buf.read_u32_at(max_pos as u64)?;
            self.buf
                .set_position(max_pos as u64 + HEADER_BYTES + payload_len as u64);
        }
        Ok(())
    }

    fn read_record(&self, at: u32) -> Result<Record> {
        let payload_len = self.buf.read_u32_at(at as u64)? as usize;
        if payload_len < RECORD_SUFFIX {
            return Err(Error::Corrupt(format!(
                "key record at {at} is shorter than its fixed suffix"
            )));
        }
        let mut payload = vec![0u8; payload_len];
        self.buf.read_at(at as u64 + HEADER_BYTES, &mut payload)?;

        let key_len = payload_len - RECORD_SUFFIX;
        let mut offset = [0u8; 8];
        offset.copy_from_slice(&payload[key_len..key_len + 8]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&payload[key_len + 8..]);
        payload.truncate(key_len);

        Ok(Record {
            key: payload,
            value_offset: u64::from_be_bytes(offset),
            value_len: u32::from_be_bytes(len),
        })
    }

    /// Linear probe from the key's home slot. Stops at the first empty slot,
    /// skipping tombstones (the first one seen becomes the insertion point for
    /// an absent key).
    fn probe(&self, key_bytes: &[u8]) -> Result<Probe> {
        let capacity = self.capacity as u64;
        let home = self.hasher.hash_one(key_bytes) % capacity;
        let mut reuse = None;

        for step in 0..capacity {
            let slot = ((home + step) % capacity) as u32;
            let stored = self.read_slot(slot)?;
            if stored == 0 {
                return Ok(Probe::Absent {
                    insert_at: reuse.unwrap_or(slot),
                });
            }
            if stored == TOMBSTONE {
                if reuse.is_none() {
                    reuse = Some(slot);
                }
                continue;
            }
            let record = self.read_record(stored)?;
            if K::eq_bytes(&record.key, key_bytes) {
                return Ok(Probe::Found {
                    slot,
                    value_offset: record.value_offset,
                    value_len: record.value_len,
                });
            }
        }

        if let Some(slot) = reuse {
            return Ok(Probe::Absent { insert_at: slot });
        }
        Err(Error::IndexFull {
            probed: self.capacity as usize + 1,
        })
    }

    /// Look up the value location recorded for an encoded key.
    pub fn get(&self, key_bytes: &[u8]) -> Result<Option<(u64, u32)>> {
        match self.probe(key_bytes)? {
            Probe::Found {
                value_offset,
                value_len,
                ..
            } => Ok(Some((value_offset, value_len))),
            Probe::Absent { .. } => Ok(None),
        }
    }

    pub fn contains(&self, key_bytes: &[u8]) -> Result<bool> {
        Ok(matches!(self.probe(key_bytes)?, Probe::Found { .. }))
    }

    /// Record `(value_offset, value_len)` under a key, appending a fresh key
    /// record and pointing the key's slot at it. Grows the slot array past 50%
    /// occupancy and the file when the record does not fit the append area.
    pub fn put(&mut self, key_bytes: &[u8], value_offset: u64, value_len: u32) -> Result<()> {
        if self.len as u64 > self.capacity as u64 / 2 {
            let file_size = self.buf.capacity();
            self.grow(self.capacity.saturating_mul(3), file_size)?;
        }

        let record_bytes = (HEADER_BYTES as usize + key_bytes.len() + RECORD_SUFFIX) as u64;
        if self.buf.position() + record_bytes > self.buf.capacity() {
            let file_size = self.buf.capacity();
            self.grow(self.capacity, (file_size + record_bytes).max(file_size * 3))?;
        }

        let write_pos = self.buf.position();
        if write_pos + record_bytes > TOMBSTONE as u64 {
            return Err(Error::Corrupt(
                "index file exceeds the 4 GiB slot-offset limit".to_string(),
            ));
        }
        let payload_len = u32::try_from(key_bytes.len() + RECORD_SUFFIX)
            .map_err(|_| Error::Encoding("key record exceeds 4 GiB".to_string()))?;

        let mut payload = Vec::with_capacity(payload_len as usize);
        payload.extend_from_slice(key_bytes);
        payload.extend_from_slice(&value_offset.to_be_bytes());
        payload.extend_from_slice(&value_len.to_be_bytes());
        self.buf.write_u32(payload_len)?;
        self.buf.write(&payload)?;

        match self.probe(key_bytes)? {
            Probe::Found { slot, .. } => self.write_slot(slot, write_pos as u32)?,
            Probe::Absent { insert_at } => {
                self.write_slot(insert_at, write_pos as u32)?;
                self.len += 1;
            }
        }
        Ok(())
    }

    /// Drop a key by tombstoning its slot. The key record stays behind as
    /// garbage until the next grow or compact.
    pub fn remove(&mut self, key_bytes: &[u8]) -> Result<bool> {
        match self.probe(key_bytes)? {
            Probe::Found { slot, .. } => {
                self.write_slot(slot, TOMBSTONE)?;
                self.len -= 1;
                Ok(true)
            }
            Probe::Absent { .. } => Ok(false),
        }
    }

    /// Iterate the live entries in slot order as
    /// `(encoded key, value_offset, value_len)`.
    pub fn entries(&self) -> Entries<'_, K, S> {
        Entries {
            store: self,
            slot: 0,
        }
    }

    /// Reset to an empty table at the initial capacity. The file keeps its
    /// size; only the header and slot array are rewritten.
    pub fn clear(&mut self) -> Result<()> {
        self.initialize(self.initial_capacity.max(DEFAULT_CAPACITY))
    }

    /// Rebuild the table at `new_capacity` slots in a file of at least
    /// `new_file_size` bytes, dropping tombstones and dead records.
    ///
    /// The target file is the one currently backing `self`, so the live set
    /// is staged through an ephemeral store first; remapping the same file at
    /// a new size would invalidate the source mid-copy.
    pub fn grow(&mut self, new_capacity: u32, new_file_size: u64) -> Result<()> {
        let record_bytes = self.live_record_bytes()?;
        let new_file_size = new_file_size.max(Self::file_size_for(new_capacity, record_bytes));

        let mut temp = self.ephemeral_like(new_capacity, new_file_size)?;
        for entry in self.entries() {
            let (key, value_offset, value_len) = entry?;
            temp.put(&key, value_offset, value_len)?;
        }
        self.refill_from(&temp, new_capacity, new_file_size)
    }

    /// Shrink to the smallest table and file that hold the live set.
    pub fn compact(&mut self) -> Result<()> {
        let record_bytes = self.live_record_bytes()?;
        let capacity = Self::capacity_for(self.len, self.initial_capacity);
        self.grow(capacity, Self::file_size_for(capacity, record_bytes))
    }

    /// Replace this table's contents with the live set of `source`, sized
    /// minimally. Used by map compaction, where `source` carries the post-move
    /// value offsets.
    pub(crate) fn rebuild_from(&mut self, source: &Self) -> Result<()> {
        let mut record_bytes = 0u64;
        for entry in source.entries() {
            let (key, _, _) = entry?;
            record_bytes += (HEADER_BYTES as usize + key.len() + RECORD_SUFFIX) as u64;
        }
        let capacity = Self::capacity_for(source.len(), self.initial_capacity);
        self.refill_from(source, capacity, Self::file_size_for(capacity, record_bytes))
    }

    /// Re-create the backing file and reinsert every entry of `source`.
    fn refill_from(&mut self, source: &Self, capacity: u32, file_size: u64) -> Result<()> {
        let region = self.buf.region_size();
        self.buf = match self.buf.path() {
            Some(path) => {
                let path = path.to_path_buf();
                SegmentedBuffer::create(path, file_size, region)?
            }
            None => SegmentedBuffer::ephemeral(file_size, region)?,
        };
        self.initialize(capacity)?;
        for entry in source.entries() {
            let (key, value_offset, value_len) = entry?;
            self.put(&key, value_offset, value_len)?;
        }
        Ok(())
    }

    /// Ephemeral store sized for this store's live set. Map compaction fills
    /// it with post-move value offsets before calling [`rebuild_from`].
    ///
    /// [`rebuild_from`]: IndexStore::rebuild_from
    pub(crate) fn staging(&self) -> Result<Self> {
        self.ephemeral_like(
            Self::capacity_for(self.len, self.initial_capacity),
            self.buf.capacity(),
        )
    }

    fn ephemeral_like(&self, capacity: u32, file_size: u64) -> Result<Self> {
        Self::ephemeral_with_hasher(
            capacity,
            file_size,
            self.buf.region_size(),
            self.hasher.clone(),
        )
    }

    fn live_record_bytes(&self) -> Result<u64> {
        let mut total = 0u64;
        for entry in self.entries() {
            let (key, _, _) = entry?;
            total += (HEADER_BYTES as usize + key.len() + RECORD_SUFFIX) as u64;
        }
        Ok(total)
    }

    fn file_size_for(capacity: u32, record_bytes: u64) -> u64 {
        Self::slots_end(capacity) + record_bytes
    }

    /// Smallest capacity that keeps `live` entries at or under 50% occupancy,
    /// following the 3x growth ladder.
    pub(crate) fn capacity_for(live: usize, initial_capacity: u32) -> u32 {
        let mut capacity = initial_capacity.max(DEFAULT_CAPACITY);
        while live as u64 > capacity as u64 / 2 {
            capacity = capacity.saturating_mul(3);
        }
        capacity
    }
}

/// Iterator over live index entries in slot order.
pub struct Entries<'a, K, S> {
    store: &'a IndexStore<K, S>,
    slot: u32,
}

impl<K, S> Iterator for Entries<'_, K, S>
where
    K: BytesEncode,
    S: BuildHasher + Clone,
{
    type Item = Result<(Vec<u8>, u64, u32)>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.slot < self.store.capacity {
            let slot = self.slot;
            self.slot += 1;
            let stored = match self.store.read_slot(slot) {
                Ok(value) => value,
                Err(e) => return Some(Err(e)),
            };
            if stored == 0 || stored == TOMBSTONE {
                continue;
            }
            return Some(
                self.store
                    .read_record(stored)
                    .map(|r| (r.key, r.value_offset, r.value_len)),
            );
        }
        None
    }
}

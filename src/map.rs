use std::hash::BuildHasher;
use std::io;
use std::marker::PhantomData;
use std::path::Path;

use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxBuildHasher;

use crate::buffer::{SegmentedBuffer, DEFAULT_REGION_SIZE};
use crate::codec::{BytesDecode, BytesEncode, Plain, Utf8};
use crate::error::{Error, Result};
use crate::index::IndexStore;

/// String-to-string map with the default hasher.
pub type StringMap = DiskMap<Utf8, Utf8>;
/// String-to-u64 map with the default hasher.
pub type StringU64Map = DiskMap<Utf8, Plain<u64>>;

fn data_file_name(name: &str, shard: usize) -> String {
    if shard == 0 {
        format!("map-{name}.hdg")
    } else {
        format!("map-{name}-{shard}.hdg")
    }
}

fn index_file_name(name: &str, shard: usize) -> String {
    if shard == 0 {
        format!("idx-{name}.hdg")
    } else {
        format!("idx-{name}-{shard}.hdg")
    }
}

/// Construction options for a [`DiskMap`].
#[derive(Debug, Clone)]
pub struct Options {
    initial_file_size: u64,
    shards: usize,
    max_region_size: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}

impl Options {
    pub fn new() -> Self {
        Self {
            initial_file_size: 0,
            shards: 1,
            max_region_size: DEFAULT_REGION_SIZE,
        }
    }

    /// Lower bound on the initial mapped size of every backing file.
    pub fn initial_file_size(mut self, bytes: u64) -> Self {
        self.initial_file_size = bytes;
        self
    }

    /// Number of shards; single-key operations only contend within a shard.
    pub fn shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    /// Largest span one mapping region covers. Exposed for tests; production
    /// maps keep the default.
    pub fn max_region_size(mut self, bytes: u64) -> Self {
        self.max_region_size = bytes;
        self
    }

    /// Open (or create) a persistent map named `name` inside `dir`.
    pub fn open_persistent<K, V, P>(self, dir: P, name: &str) -> Result<DiskMap<K, V>>
    where
        K: BytesEncode,
        P: AsRef<Path>,
    {
        self.open_persistent_with_hasher(dir, name, FxBuildHasher::default())
    }

    /// Open an ephemeral map; its files disappear when the map is dropped.
    pub fn open_ephemeral<K, V>(self) -> Result<DiskMap<K, V>>
    where
        K: BytesEncode,
    {
        self.open_ephemeral_with_hasher(FxBuildHasher::default())
    }

    pub fn open_persistent_with_hasher<K, V, S, P>(
        self,
        dir: P,
        name: &str,
        hasher: S,
    ) -> Result<DiskMap<K, V, S>>
    where
        K: BytesEncode,
        S: BuildHasher + Clone,
        P: AsRef<Path>,
    {
        DiskMap::open_shards(&self, Some((dir.as_ref(), name)), hasher)
    }

    pub fn open_ephemeral_with_hasher<K, V, S>(self, hasher: S) -> Result<DiskMap<K, V, S>>
    where
        K: BytesEncode,
        S: BuildHasher + Clone,
    {
        DiskMap::open_shards(&self, None, hasher)
    }
}

/// One partition of the map: an index store plus its companion data buffer.
/// All access goes through the owning mutex, which also guards the append
/// cursors inside both buffers.
struct Shard<K, S> {
    index: IndexStore<K, S>,
    data: SegmentedBuffer,
}

impl<K, S> Shard<K, S>
where
    K: BytesEncode,
    S: BuildHasher + Clone,
{
    /// Read the value blob currently recorded for an encoded key.
    fn lookup(&self, key_bytes: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.index.get(key_bytes)? {
            Some((offset, len)) => {
                let mut blob = vec![0u8; len as usize];
                self.data.read_at(offset, &mut blob)?;
                Ok(Some(blob))
            }
            None => Ok(None),
        }
    }

    /// Append a value blob and point the index at it. Overwrites orphan the
    /// previous blob; compaction reclaims it.
    fn append(&mut self, key_bytes: &[u8], value_bytes: &[u8]) -> Result<()> {
        let len = u32::try_from(value_bytes.len())
            .map_err(|_| Error::Encoding("value exceeds 4 GiB".to_string()))?;
        if self.data.position() + value_bytes.len() as u64 > self.data.capacity() {
            let capacity = self.data.capacity();
            self.grow_data((capacity + value_bytes.len() as u64).max(capacity * 2))?;
        }
        let write_pos = self.data.position();
        self.data.write(value_bytes)?;
        self.index.put(key_bytes, write_pos, len)
    }

    fn insert(&mut self, key_bytes: &[u8], value_bytes: &[u8]) -> Result<Option<Vec<u8>>> {
        let prior = self.lookup(key_bytes)?;
        self.append(key_bytes, value_bytes)?;
        Ok(prior)
    }

    fn take(&mut self, key_bytes: &[u8]) -> Result<Option<Vec<u8>>> {
        let prior = self.lookup(key_bytes)?;
        if prior.is_some() {
            self.index.remove(key_bytes)?;
        }
        Ok(prior)
    }

    /// Swap the data buffer for one of `new_size` bytes, keeping every live
    /// blob at its recorded offset and the cursor where it was.
    fn grow_data(&mut self, new_size: u64) -> Result<()> {
        let write_pos = self.data.position();
        let region = self.data.region_size();
        let fresh = match self.data.path() {
            Some(path) => {
                // Same file backs both mappings; flush so the extended view
                // starts from the bytes the old one wrote.
                self.data.flush()?;
                let path = path.to_path_buf();
                SegmentedBuffer::open(path, new_size, region)?
            }
            None => {
                // An anonymous temp file cannot be reopened; copy each live
                // blob into a fresh buffer at its old offset so the index
                // needs no rewrite.
                let mut fresh = SegmentedBuffer::ephemeral(new_size, region)?;
                for entry in self.index.entries() {
                    let (_, offset, len) = entry?;
                    let mut blob = vec![0u8; len as usize];
                    self.data.read_at(offset, &mut blob)?;
                    fresh.write_at(offset, &blob)?;
                }
                fresh
            }
        };
        self.data = fresh;
        self.data.set_position(write_pos);
        Ok(())
    }

    /// Rewrite this shard's files to hold exactly the live set.
    fn compact(&mut self) -> Result<()> {
        let region = self.data.region_size();
        let mut live_bytes = 0u64;
        for entry in self.index.entries() {
            let (_, _, len) = entry?;
            live_bytes += len as u64;
        }

        // Stage the live blobs contiguously in an ephemeral pair; the staging
        // index carries the post-move offsets.
        let mut temp_data = SegmentedBuffer::ephemeral(live_bytes, region)?;
        let mut temp_index = self.index.staging()?;
        for entry in self.index.entries() {
            let (key, offset, len) = entry?;
            let mut blob = vec![0u8; len as usize];
            self.data.read_at(offset, &mut blob)?;
            let new_offset = temp_data.position();
            temp_data.write(&blob)?;
            temp_index.put(&key, new_offset, len)?;
        }

        // Re-create the data file at the compacted size and copy the staged
        // blobs back at unchanged offsets.
        let mut fresh = match self.data.path() {
            Some(path) => {
                let path = path.to_path_buf();
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                SegmentedBuffer::create(path, live_bytes, region)?
            }
            None => SegmentedBuffer::ephemeral(live_bytes, region)?,
        };
        for entry in temp_index.entries() {
            let (_, offset, len) = entry?;
            let mut blob = vec![0u8; len as usize];
            temp_data.read_at(offset, &mut blob)?;
            fresh.write_at(offset, &blob)?;
        }
        fresh.set_position(temp_data.position());
        self.data = fresh;

        self.index.rebuild_from(&temp_index)
    }
}

/// A sharded, disk-backed map from `K`-encoded keys to `V`-encoded values.
///
/// Each shard owns a data file of appended value blobs and an index file
/// mapping keys to `(offset, length)` pairs, both memory-mapped. Single-key
/// operations lock only the owning shard; whole-map operations lock every
/// shard in ascending order and release in descending order, so concurrent
/// callers cannot deadlock against each other.
pub struct DiskMap<K, V, S = FxBuildHasher> {
    shards: Box<[Mutex<Shard<K, S>>]>,
    hasher: S,
    _marker: PhantomData<(K, V)>,
}

impl<K, V> DiskMap<K, V>
where
    K: BytesEncode,
{
    /// Persistent map with default options; see [`Options`].
    pub fn persistent<P: AsRef<Path>>(dir: P, name: &str) -> Result<Self> {
        Options::new().open_persistent(dir, name)
    }

    /// Ephemeral map with default options; see [`Options`].
    pub fn ephemeral() -> Result<Self> {
        Options::new().open_ephemeral()
    }
}

impl<K, V, S> DiskMap<K, V, S>
where
    K: BytesEncode,
    S: BuildHasher + Clone,
{
    fn open_shards(options: &Options, location: Option<(&Path, &str)>, hasher: S) -> Result<Self> {
        if options.shards == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "a map needs at least one shard",
            )));
        }
        if let Some((dir, _)) = location {
            std::fs::create_dir_all(dir)?;
        }
        let mut shards = Vec::with_capacity(options.shards);
        for k in 0..options.shards {
            let (index, mut data) = match location {
                Some((dir, name)) => {
                    let index = IndexStore::open_with_hasher(
                        dir.join(index_file_name(name, k)),
                        0,
                        options.initial_file_size,
                        options.max_region_size,
                        hasher.clone(),
                    )?;
                    let data = SegmentedBuffer::open(
                        dir.join(data_file_name(name, k)),
                        options.initial_file_size,
                        options.max_region_size,
                    )?;
                    (index, data)
                }
                None => {
                    let index = IndexStore::ephemeral_with_hasher(
                        0,
                        options.initial_file_size,
                        options.max_region_size,
                        hasher.clone(),
                    )?;
                    let data =
                        SegmentedBuffer::ephemeral(options.initial_file_size, options.max_region_size)?;
                    (index, data)
                }
            };
            if !index.is_empty() {
                // Restored shard: park the append cursor just past the last
                // live blob.
                let mut end = 0u64;
                for entry in index.entries() {
                    let (_, offset, len) = entry?;
                    end = end.max(offset + len as u64);
                }
                data.set_position(end);
            }
            shards.push(Mutex::new(Shard { index, data }));
        }
        Ok(Self {
            shards: shards.into_boxed_slice(),
            hasher,
            _marker: PhantomData,
        })
    }

    fn shard_for(&self, key_bytes: &[u8]) -> &Mutex<Shard<K, S>> {
        let hash = self.hasher.hash_one(key_bytes);
        &self.shards[(hash % self.shards.len() as u64) as usize]
    }

    /// Guards for every shard, taken in ascending shard order.
    fn lock_all(&self) -> Vec<MutexGuard<'_, Shard<K, S>>> {
        self.shards.iter().map(|shard| shard.lock()).collect()
    }

    /// Release guards in descending shard order.
    fn unlock_all(mut guards: Vec<MutexGuard<'_, Shard<K, S>>>) {
        while let Some(guard) = guards.pop() {
            drop(guard);
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Number of entries across all shards.
    pub fn len(&self) -> usize {
        let guards = self.lock_all();
        let total = guards.iter().map(|shard| shard.index.len()).sum();
        Self::unlock_all(guards);
        total
    }

    pub fn is_empty(&self) -> bool {
        let guards = self.lock_all();
        let empty = guards.iter().all(|shard| shard.index.is_empty());
        Self::unlock_all(guards);
        empty
    }

    /// Drop every entry and rewind the data cursors. File sizes are kept;
    /// compaction shrinks them.
    pub fn clear(&self) -> Result<()> {
        let mut guards = self.lock_all();
        for shard in guards.iter_mut() {
            shard.index.clear()?;
            shard.data.set_position(0);
        }
        Self::unlock_all(guards);
        Ok(())
    }

    /// Rewrite every shard's files to hold exactly the live entries,
    /// reclaiming the space of overwritten and removed values.
    pub fn compact(&self) -> Result<()> {
        let mut guards = self.lock_all();
        for shard in guards.iter_mut() {
            shard.compact()?;
        }
        Self::unlock_all(guards);
        Ok(())
    }

    /// Flush every mapping of every shard to disk. Durability is exactly
    /// what the platform grants a completed msync; there is no write-ahead
    /// log, and writes since the last flush may be lost on a crash.
    pub fn flush(&self) -> Result<()> {
        let guards = self.lock_all();
        for shard in guards.iter() {
            shard.index.flush()?;
            shard.data.flush()?;
        }
        Self::unlock_all(guards);
        Ok(())
    }
}

impl<K, V, S> DiskMap<K, V, S>
where
    K: BytesEncode,
    V: BytesEncode + BytesDecode,
    S: BuildHasher + Clone,
{
    /// Insert a key-value pair, returning the previously stored value.
    pub fn insert(&self, key: &K::EItem, value: &V::EItem) -> Result<Option<V::DItem>> {
        let key_bytes = K::bytes_encode(key)?;
        let value_bytes = V::bytes_encode(value)?;
        let mut shard = self.shard_for(&key_bytes).lock();
        let prior = shard.insert(&key_bytes, &value_bytes)?;
        prior.map(|bytes| V::bytes_decode(&bytes)).transpose()
    }

    pub fn get(&self, key: &K::EItem) -> Result<Option<V::DItem>> {
        let key_bytes = K::bytes_encode(key)?;
        let shard = self.shard_for(&key_bytes).lock();
        let found = shard.lookup(&key_bytes)?;
        found.map(|bytes| V::bytes_decode(&bytes)).transpose()
    }

    /// Remove a key, returning the value it mapped to.
    pub fn remove(&self, key: &K::EItem) -> Result<Option<V::DItem>> {
        let key_bytes = K::bytes_encode(key)?;
        let mut shard = self.shard_for(&key_bytes).lock();
        let prior = shard.take(&key_bytes)?;
        prior.map(|bytes| V::bytes_decode(&bytes)).transpose()
    }

    pub fn contains_key(&self, key: &K::EItem) -> Result<bool> {
        let key_bytes = K::bytes_encode(key)?;
        let shard = self.shard_for(&key_bytes).lock();
        shard.index.contains(&key_bytes)
    }

    /// Insert only if the key is absent; returns the existing value otherwise.
    pub fn insert_if_absent(&self, key: &K::EItem, value: &V::EItem) -> Result<Option<V::DItem>> {
        let key_bytes = K::bytes_encode(key)?;
        let value_bytes = V::bytes_encode(value)?;
        let mut shard = self.shard_for(&key_bytes).lock();
        if let Some(existing) = shard.lookup(&key_bytes)? {
            return V::bytes_decode(&existing).map(Some);
        }
        shard.append(&key_bytes, &value_bytes)?;
        Ok(None)
    }

    /// Overwrite only if the key is present; returns the replaced value.
    pub fn replace(&self, key: &K::EItem, value: &V::EItem) -> Result<Option<V::DItem>> {
        let key_bytes = K::bytes_encode(key)?;
        let value_bytes = V::bytes_encode(value)?;
        let mut shard = self.shard_for(&key_bytes).lock();
        match shard.lookup(&key_bytes)? {
            Some(prior) => {
                shard.append(&key_bytes, &value_bytes)?;
                V::bytes_decode(&prior).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Overwrite only if the stored value equals `expected` (compared over
    /// encoded bytes). Returns whether the swap happened.
    pub fn replace_if(
        &self,
        key: &K::EItem,
        expected: &V::EItem,
        value: &V::EItem,
    ) -> Result<bool> {
        let key_bytes = K::bytes_encode(key)?;
        let expected_bytes = V::bytes_encode(expected)?;
        let value_bytes = V::bytes_encode(value)?;
        let mut shard = self.shard_for(&key_bytes).lock();
        match shard.lookup(&key_bytes)? {
            Some(current) if V::eq_bytes(&current, &expected_bytes) => {
                shard.append(&key_bytes, &value_bytes)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Remove only if the stored value equals `expected`.
    pub fn remove_if(&self, key: &K::EItem, expected: &V::EItem) -> Result<bool> {
        let key_bytes = K::bytes_encode(key)?;
        let expected_bytes = V::bytes_encode(expected)?;
        let mut shard = self.shard_for(&key_bytes).lock();
        match shard.lookup(&key_bytes)? {
            Some(current) if V::eq_bytes(&current, &expected_bytes) => {
                shard.index.remove(&key_bytes)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// True if any entry's value equals `value` (compared over encoded bytes).
    pub fn contains_value(&self, value: &V::EItem) -> Result<bool> {
        let value_bytes = V::bytes_encode(value)?;
        let guards = self.lock_all();
        let mut found = false;
        'shards: for shard in &guards {
            for entry in shard.index.entries() {
                let (_, offset, len) = entry?;
                let mut blob = vec![0u8; len as usize];
                shard.data.read_at(offset, &mut blob)?;
                if V::eq_bytes(&blob, &value_bytes) {
                    found = true;
                    break 'shards;
                }
            }
        }
        Self::unlock_all(guards);
        Ok(found)
    }

    /// Snapshot of every key. No ordering is guaranteed.
    pub fn keys(&self) -> Result<Vec<K::DItem>>
    where
        K: BytesDecode,
    {
        let guards = self.lock_all();
        let mut keys = Vec::new();
        for shard in &guards {
            for entry in shard.index.entries() {
                let (key_bytes, _, _) = entry?;
                keys.push(<K as BytesDecode>::bytes_decode(&key_bytes)?);
            }
        }
        Self::unlock_all(guards);
        Ok(keys)
    }

    /// Snapshot of every value. No ordering is guaranteed.
    pub fn values(&self) -> Result<Vec<V::DItem>> {
        let guards = self.lock_all();
        let mut values = Vec::new();
        for shard in &guards {
            for entry in shard.index.entries() {
                let (_, offset, len) = entry?;
                let mut blob = vec![0u8; len as usize];
                shard.data.read_at(offset, &mut blob)?;
                values.push(V::bytes_decode(&blob)?);
            }
        }
        Self::unlock_all(guards);
        Ok(values)
    }

    /// Snapshot of every entry. No ordering is guaranteed.
    pub fn entries(&self) -> Result<Vec<(K::DItem, V::DItem)>>
    where
        K: BytesDecode,
    {
        let guards = self.lock_all();
        let mut entries = Vec::new();
        for shard in &guards {
            for entry in shard.index.entries() {
                let (key_bytes, offset, len) = entry?;
                let mut blob = vec![0u8; len as usize];
                shard.data.read_at(offset, &mut blob)?;
                entries.push((
                    <K as BytesDecode>::bytes_decode(&key_bytes)?,
                    V::bytes_decode(&blob)?,
                ));
            }
        }
        Self::unlock_all(guards);
        Ok(entries)
    }
}

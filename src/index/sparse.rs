//! Sparse index back-ends: only the ids actually seen take space.

use std::collections::BTreeMap;
use std::fs::File;

use ahash::AHashMap;
use byteorder::{ByteOrder, LittleEndian};
use memmap2::MmapMut;

use super::LocationIndex;
use crate::error::Result;
use crate::location::Location;

fn sort_entries(data: &mut Vec<(u64, Location)>) {
    data.sort_by_key(|entry| entry.0);
    // last write wins: copy the later entry over the earlier one before the
    // stable dedup drops it
    data.dedup_by(|later, earlier| {
        if later.0 == earlier.0 {
            *earlier = *later;
            true
        } else {
            false
        }
    });
}

/// Append-only vector of `(id, location)` pairs.
///
/// `set` just appends; lookups binary-search and therefore require a
/// [`LocationIndex::sort`] once all entries are in. Smallest possible
/// memory footprint for sparse id spaces.
#[derive(Debug, Default)]
pub struct SparseMemArray {
    data: Vec<(u64, Location)>,
}

impl SparseMemArray {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn entries(&self) -> &[(u64, Location)] {
        &self.data
    }
}

impl LocationIndex for SparseMemArray {
    fn reserve(&mut self, capacity: usize) {
        self.data.reserve(capacity.saturating_sub(self.data.len()));
    }

    fn set(&mut self, id: u64, location: Location) -> Result<()> {
        self.data.push((id, location));
        Ok(())
    }

    fn get_noexcept(&self, id: u64) -> Location {
        match self.data.binary_search_by_key(&id, |entry| entry.0) {
            Ok(idx) => self.data[idx].1,
            Err(_) => Location::undefined(),
        }
    }

    fn sort(&mut self) {
        sort_entries(&mut self.data);
    }

    fn clear(&mut self) {
        self.data.clear();
    }

    fn size(&self) -> usize {
        self.data.len()
    }

    fn used_memory(&self) -> usize {
        self.data.capacity() * std::mem::size_of::<(u64, Location)>()
    }
}

/// Like [`SparseMemArray`] but with ids and locations in two parallel
/// vectors, so the binary search only touches the id array.
#[derive(Debug, Default)]
pub struct SparseMemCompactArray {
    ids: Vec<u64>,
    locations: Vec<Location>,
}

impl SparseMemCompactArray {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocationIndex for SparseMemCompactArray {
    fn reserve(&mut self, capacity: usize) {
        self.ids.reserve(capacity.saturating_sub(self.ids.len()));
        self.locations
            .reserve(capacity.saturating_sub(self.locations.len()));
    }

    fn set(&mut self, id: u64, location: Location) -> Result<()> {
        self.ids.push(id);
        self.locations.push(location);
        Ok(())
    }

    fn get_noexcept(&self, id: u64) -> Location {
        match self.ids.binary_search(&id) {
            Ok(idx) => self.locations[idx],
            Err(_) => Location::undefined(),
        }
    }

    fn sort(&mut self) {
        let mut entries: Vec<(u64, Location)> = self
            .ids
            .iter()
            .copied()
            .zip(self.locations.iter().copied())
            .collect();
        sort_entries(&mut entries);
        self.ids.clear();
        self.locations.clear();
        for (id, location) in entries {
            self.ids.push(id);
            self.locations.push(location);
        }
    }

    fn clear(&mut self) {
        self.ids.clear();
        self.locations.clear();
    }

    fn size(&self) -> usize {
        self.ids.len()
    }

    fn used_memory(&self) -> usize {
        self.ids.capacity() * std::mem::size_of::<u64>()
            + self.locations.capacity() * std::mem::size_of::<Location>()
    }
}

/// Ordered map back-end; log-time operations, deterministic iteration.
#[derive(Debug, Default)]
pub struct SparseMemMap {
    map: BTreeMap<u64, Location>,
}

impl SparseMemMap {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocationIndex for SparseMemMap {
    fn set(&mut self, id: u64, location: Location) -> Result<()> {
        self.map.insert(id, location);
        Ok(())
    }

    fn get_noexcept(&self, id: u64) -> Location {
        self.map
            .get(&id)
            .copied()
            .unwrap_or_else(Location::undefined)
    }

    fn clear(&mut self) {
        self.map.clear();
    }

    fn size(&self) -> usize {
        self.map.len()
    }

    fn used_memory(&self) -> usize {
        // entry plus rough tree node overhead
        self.map.len()
            * (std::mem::size_of::<(u64, Location)>() + 3 * std::mem::size_of::<usize>())
    }
}

/// Hash map back-end; amortized constant-time operations at roughly twice
/// the memory of the entries themselves.
#[derive(Debug, Default)]
pub struct SparseHashMap {
    map: AHashMap<u64, Location>,
}

impl SparseHashMap {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocationIndex for SparseHashMap {
    fn reserve(&mut self, capacity: usize) {
        let additional = capacity.saturating_sub(self.map.len());
        self.map.reserve(additional);
    }

    fn set(&mut self, id: u64, location: Location) -> Result<()> {
        self.map.insert(id, location);
        Ok(())
    }

    fn get_noexcept(&self, id: u64) -> Location {
        self.map
            .get(&id)
            .copied()
            .unwrap_or_else(Location::undefined)
    }

    fn clear(&mut self) {
        self.map.clear();
    }

    fn size(&self) -> usize {
        self.map.len()
    }

    fn used_memory(&self) -> usize {
        self.map.capacity() * std::mem::size_of::<(u64, Location)>() * 2
    }
}

/// Bytes of one record in [`SparseMmapArray`]: id, x, y and padding.
const RECORD_SIZE: usize = 20;
const INITIAL_RECORDS: usize = 64;

/// Sparse array in a file-backed memory mapping.
///
/// Records are packed 20-byte `(id: u64, x: i32, y: i32, pad: u32)` entries
/// in little-endian order, sorted by id after [`LocationIndex::sort`]. An
/// index written by a previous run can be picked up again with
/// [`SparseMmapArray::with_file`].
#[derive(Debug)]
pub struct SparseMmapArray {
    file: File,
    mmap: Option<MmapMut>,
    len: usize,
}

fn read_record(buf: &[u8]) -> (u64, Location) {
    (
        LittleEndian::read_u64(&buf[0..8]),
        Location::new(
            LittleEndian::read_i32(&buf[8..12]),
            LittleEndian::read_i32(&buf[12..16]),
        ),
    )
}

fn write_record(buf: &mut [u8], id: u64, location: Location) {
    LittleEndian::write_u64(&mut buf[0..8], id);
    LittleEndian::write_i32(&mut buf[8..12], location.x());
    LittleEndian::write_i32(&mut buf[12..16], location.y());
    LittleEndian::write_u32(&mut buf[16..20], 0);
}

impl SparseMmapArray {
    /// Creates the index over a fresh anonymous temporary file.
    pub fn new() -> Result<Self> {
        Self::with_file(tempfile::tempfile()?)
    }

    /// Opens the index over an existing file; records already present are
    /// kept and searchable.
    pub fn with_file(file: File) -> Result<Self> {
        let len = (file.metadata()?.len() as usize) / RECORD_SIZE;
        let mmap = if len > 0 {
            Some(unsafe { MmapMut::map_mut(&file)? })
        } else {
            None
        };
        Ok(Self { file, mmap, len })
    }

    fn capacity(&self) -> usize {
        self.mmap.as_ref().map_or(0, |m| m.len() / RECORD_SIZE)
    }

    fn grow(&mut self, records: usize) -> Result<()> {
        let new_capacity = records.max(self.capacity() * 2).max(INITIAL_RECORDS);
        self.file.set_len((new_capacity * RECORD_SIZE) as u64)?;
        self.mmap = Some(unsafe { MmapMut::map_mut(&self.file)? });
        Ok(())
    }

    fn record(&self, idx: usize) -> (u64, Location) {
        match self.mmap.as_ref() {
            Some(mmap) => read_record(&mmap[idx * RECORD_SIZE..(idx + 1) * RECORD_SIZE]),
            None => (u64::MAX, Location::undefined()),
        }
    }
}

impl LocationIndex for SparseMmapArray {
    fn reserve(&mut self, capacity: usize) {
        if capacity > self.capacity() {
            let _ = self.grow(capacity);
        }
    }

    fn set(&mut self, id: u64, location: Location) -> Result<()> {
        if self.len == self.capacity() {
            self.grow(self.len + 1)?;
        }
        if let Some(mmap) = self.mmap.as_mut() {
            write_record(
                &mut mmap[self.len * RECORD_SIZE..(self.len + 1) * RECORD_SIZE],
                id,
                location,
            );
            self.len += 1;
        }
        Ok(())
    }

    fn get_noexcept(&self, id: u64) -> Location {
        let mut lo = 0;
        let mut hi = self.len;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let (record_id, location) = self.record(mid);
            match record_id.cmp(&id) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return location,
            }
        }
        Location::undefined()
    }

    fn sort(&mut self) {
        let mut entries: Vec<(u64, Location)> = (0..self.len).map(|i| self.record(i)).collect();
        sort_entries(&mut entries);
        if let Some(mmap) = self.mmap.as_mut() {
            for (idx, (id, location)) in entries.iter().enumerate() {
                write_record(
                    &mut mmap[idx * RECORD_SIZE..(idx + 1) * RECORD_SIZE],
                    *id,
                    *location,
                );
            }
        }
        self.len = entries.len();
        // leave only the packed records behind so the file can be reopened
        self.mmap = None;
        if self.file.set_len((self.len * RECORD_SIZE) as u64).is_ok() && self.len > 0 {
            self.mmap = unsafe { MmapMut::map_mut(&self.file).ok() };
        }
    }

    fn clear(&mut self) {
        self.len = 0;
    }

    fn size(&self) -> usize {
        self.len
    }

    fn used_memory(&self) -> usize {
        self.capacity() * RECORD_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{test_limits, test_real, test_small};
    use super::*;
    use proptest::prelude::*;

    proptest! {
        // Reference model: last write wins, everything else misses.
        #[test]
        fn sorted_array_matches_map_semantics(
            entries in prop::collection::vec((0u64..500, -1000i32..1000), 1..200)
        ) {
            let mut index = SparseMemArray::new();
            let mut model = std::collections::HashMap::new();
            for &(id, c) in &entries {
                index.set(id, Location::new(c, -c)).unwrap();
                model.insert(id, Location::new(c, -c));
            }
            index.sort();
            prop_assert_eq!(index.size(), model.len());
            for id in 0u64..500 {
                match model.get(&id) {
                    Some(loc) => prop_assert_eq!(index.get_noexcept(id), *loc),
                    None => prop_assert!(index.get_noexcept(id).is_undefined()),
                }
            }
        }
    }

    #[test]
    fn sparse_mem_array() {
        let mut index = SparseMemArray::new();
        assert_eq!(index.size(), 0);
        assert_eq!(index.used_memory(), 0);
        test_small(&mut index);
        assert_eq!(index.size(), 2);

        let mut index = SparseMemArray::new();
        test_real(&mut index);

        let mut index = SparseMemArray::new();
        test_limits(&mut index);
    }

    #[test]
    fn sparse_mem_array_last_write_wins() {
        let mut index = SparseMemArray::new();
        index.set(7, Location::new(1, 1)).unwrap();
        index.set(3, Location::new(2, 2)).unwrap();
        index.set(7, Location::new(9, 9)).unwrap();
        index.sort();
        assert_eq!(index.size(), 2);
        assert_eq!(index.get(7).unwrap(), Location::new(9, 9));
        assert_eq!(index.get(3).unwrap(), Location::new(2, 2));
    }

    #[test]
    fn sparse_mem_compact_array() {
        let mut index = SparseMemCompactArray::new();
        assert_eq!(index.size(), 0);
        assert_eq!(index.used_memory(), 0);
        test_small(&mut index);
        assert_eq!(index.size(), 2);

        let mut index = SparseMemCompactArray::new();
        test_real(&mut index);

        let mut index = SparseMemCompactArray::new();
        test_limits(&mut index);
    }

    #[test]
    fn sparse_mem_map() {
        let mut index = SparseMemMap::new();
        test_small(&mut index);

        let mut index = SparseMemMap::new();
        test_real(&mut index);

        let mut index = SparseMemMap::new();
        test_limits(&mut index);
    }

    #[test]
    fn sparse_hash_map() {
        let mut index = SparseHashMap::new();
        test_small(&mut index);

        let mut index = SparseHashMap::new();
        test_real(&mut index);

        let mut index = SparseHashMap::new();
        test_limits(&mut index);
    }

    #[test]
    fn sparse_mmap_array() {
        let mut index = SparseMmapArray::new().unwrap();
        test_small(&mut index);

        let mut index = SparseMmapArray::new().unwrap();
        test_real(&mut index);

        let mut index = SparseMmapArray::new().unwrap();
        test_limits(&mut index);
    }

    #[test]
    fn sparse_mmap_array_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparse.idx");

        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();
        let mut index = SparseMmapArray::with_file(file).unwrap();
        index.set(42, Location::new(4, 2)).unwrap();
        index.set(7, Location::new(0, 7)).unwrap();
        index.sort();
        drop(index);

        let file = File::options().read(true).write(true).open(&path).unwrap();
        let index = SparseMmapArray::with_file(file).unwrap();
        assert_eq!(index.get(42).unwrap(), Location::new(4, 2));
        assert_eq!(index.get(7).unwrap(), Location::new(0, 7));
        assert!(index.get(8).is_err());
    }
}

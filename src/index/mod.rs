//! ID to location maps used during geometry assembly.
//!
//! All back-ends implement the [`LocationIndex`] trait and can be picked at
//! runtime by name through [`create_map`]. Which one is right depends on the
//! id distribution: dense arrays win for full-planet extracts, sparse
//! variants for small regions, the mmap/file variants when the index must
//! not live in anonymous memory.

mod dense;
mod flex;
mod sparse;

pub use dense::{DenseFileArray, DenseMemArray, DenseMmapArray};
pub use flex::FlexIndex;
pub use sparse::{
    SparseHashMap, SparseMemArray, SparseMemCompactArray, SparseMemMap, SparseMmapArray,
};

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::location::Location;

/// Bytes of one location cell in the file and mmap back-ends.
pub(crate) const LOCATION_SIZE: usize = 8;

pub(crate) fn read_location(buf: &[u8]) -> Location {
    Location::new(
        LittleEndian::read_i32(&buf[0..4]),
        LittleEndian::read_i32(&buf[4..8]),
    )
}

pub(crate) fn write_location(buf: &mut [u8], location: Location) {
    LittleEndian::write_i32(&mut buf[0..4], location.x());
    LittleEndian::write_i32(&mut buf[4..8], location.y());
}

/// A partial map from OSM object id to [`Location`].
pub trait LocationIndex: std::fmt::Debug {
    /// Requests room for at least `capacity` entries. Back-ends that can not
    /// make use of the hint ignore it.
    fn reserve(&mut self, capacity: usize) {
        let _ = capacity;
    }

    /// Stores a location under an id, overwriting semantics depend on the
    /// back-end: dense variants overwrite in place, sparse arrays append and
    /// resolve duplicates in [`LocationIndex::sort`].
    fn set(&mut self, id: u64, location: Location) -> Result<()>;

    /// Looks an id up, failing with [`Error::NotFound`] when it is absent.
    fn get(&self, id: u64) -> Result<Location> {
        let location = self.get_noexcept(id);
        if location.is_undefined() {
            Err(Error::NotFound(id))
        } else {
            Ok(location)
        }
    }

    /// Looks an id up, returning the undefined location when it is absent.
    fn get_noexcept(&self, id: u64) -> Location;

    /// Prepares the index for lookups. Required for the sparse array
    /// variants, which sort by id keeping the last value stored for
    /// duplicate ids; a no-op everywhere else.
    fn sort(&mut self) {}

    /// Removes all entries but keeps reserved storage where possible.
    fn clear(&mut self);

    /// Number of entries (for dense variants: one past the largest id seen).
    fn size(&self) -> usize;

    /// Rough number of bytes the index currently occupies in memory.
    fn used_memory(&self) -> usize;
}

/// Null object: ignores all writes, every lookup misses.
#[derive(Debug, Default)]
pub struct DummyIndex;

impl LocationIndex for DummyIndex {
    fn set(&mut self, _id: u64, _location: Location) -> Result<()> {
        Ok(())
    }

    fn get_noexcept(&self, _id: u64) -> Location {
        Location::undefined()
    }

    fn clear(&mut self) {}

    fn size(&self) -> usize {
        0
    }

    fn used_memory(&self) -> usize {
        0
    }
}

const MAP_TYPE_NAMES: &[&str] = &[
    "dense_file_array",
    "dense_mem_array",
    "dense_mmap_array",
    "dummy",
    "flex_mem",
    "sparse_hash_map",
    "sparse_mem_array",
    "sparse_mem_compact_array",
    "sparse_mem_map",
    "sparse_mmap_array",
];

/// Names accepted by [`create_map`].
pub fn map_types() -> &'static [&'static str] {
    MAP_TYPE_NAMES
}

/// Creates an index back-end by name.
///
/// The file and mmap backed variants are created over anonymous temporary
/// files; use the back-end types directly to control file placement.
pub fn create_map(name: &str) -> Result<Box<dyn LocationIndex>> {
    if name.is_empty() {
        return Err(Error::MapFactory("Need non-empty map type name".into()));
    }
    match name {
        "dense_file_array" => Ok(Box::new(DenseFileArray::new()?)),
        "dense_mem_array" => Ok(Box::new(DenseMemArray::new())),
        "dense_mmap_array" => Ok(Box::new(DenseMmapArray::new()?)),
        "dummy" => Ok(Box::new(DummyIndex)),
        "flex_mem" => Ok(Box::new(FlexIndex::new())),
        "sparse_hash_map" => Ok(Box::new(SparseHashMap::new())),
        "sparse_mem_array" => Ok(Box::new(SparseMemArray::new())),
        "sparse_mem_compact_array" => Ok(Box::new(SparseMemCompactArray::new())),
        "sparse_mem_map" => Ok(Box::new(SparseMemMap::new())),
        "sparse_mmap_array" => Ok(Box::new(SparseMmapArray::new()?)),
        _ => Err(Error::MapFactory(format!(
            "Support for map type '{name}' not compiled into this binary"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The generic exercises below mirror how the index is used during
    // assembly: bulk population followed by a single sort and random
    // lookups.

    pub(super) fn test_small(index: &mut dyn LocationIndex) {
        let loc1 = Location::from_degrees(1.2, 4.5).unwrap();
        let loc2 = Location::from_degrees(3.5, -7.2).unwrap();

        assert!(matches!(index.get(12), Err(Error::NotFound(12))));

        index.set(12, loc1).unwrap();
        index.set(3, loc2).unwrap();

        index.sort();

        for missing in [0, 1, 5, 100] {
            assert!(matches!(index.get(missing), Err(Error::NotFound(_))));
            assert!(index.get_noexcept(missing).is_undefined());
        }
        assert_eq!(index.get(0).unwrap_err().to_string(), "id 0 not found");
    }

    fn location_matching_id(id: u64) -> Location {
        Location::new(id as i32, id as i32)
    }

    fn check_ids(index: &dyn LocationIndex, set_ids: &[bool]) {
        for (id, set) in set_ids.iter().enumerate() {
            let id = id as u64;
            if *set {
                assert_eq!(index.get(id).unwrap(), location_matching_id(id));
                assert_eq!(index.get_noexcept(id), location_matching_id(id));
            } else {
                assert!(matches!(index.get(id), Err(Error::NotFound(_))));
                assert!(index.get_noexcept(id).is_undefined());
            }
        }
    }

    pub(super) fn test_real(index: &mut dyn LocationIndex) {
        let ordered_ids = [0u64, 1, 2, 3, 10, 11, 12, 20, 30, 31];
        let unordered_ids = [40u64, 13, 6, 7, 8, 39, 25];

        let mut set_ids = vec![false; 50];
        check_ids(index, &set_ids);

        for &id in &ordered_ids {
            index.set(id, location_matching_id(id)).unwrap();
            set_ids[id as usize] = true;
        }
        index.sort();
        check_ids(index, &set_ids);

        for &id in &unordered_ids {
            index.set(id, location_matching_id(id)).unwrap();
            set_ids[id as usize] = true;
        }
        index.sort();
        check_ids(index, &set_ids);

        index.clear();
        set_ids = vec![false; 50];
        assert_eq!(index.size(), 0);
        check_ids(index, &set_ids);
    }

    // Ids near the top of the u64 range; only for back-ends that do not
    // allocate proportionally to the largest id.
    pub(super) fn test_limits(index: &mut dyn LocationIndex) {
        let max_id = u64::MAX;
        let ids = [0, max_id - 5, max_id / 2];
        let locs = [
            Location::from_degrees(1.2, 4.5).unwrap(),
            Location::from_degrees(3.5, -7.2).unwrap(),
            Location::from_degrees(42.0, -12.3).unwrap(),
        ];

        for (&id, &loc) in ids.iter().zip(locs.iter()) {
            index.set(id, loc).unwrap();
        }
        index.sort();

        for (&id, &loc) in ids.iter().zip(locs.iter()) {
            assert_eq!(index.get(id).unwrap(), loc);
            assert_eq!(index.get_noexcept(id), loc);
        }
        for missing in [1, 5, 100, max_id - 1] {
            assert!(matches!(index.get(missing), Err(Error::NotFound(_))));
            assert!(index.get_noexcept(missing).is_undefined());
        }

        index.clear();
        for id in ids.iter().copied().chain([1, 5, 100, max_id - 1]) {
            assert!(matches!(index.get(id), Err(Error::NotFound(_))));
            assert!(index.get_noexcept(id).is_undefined());
        }
    }

    #[test]
    fn dummy_discards_everything() {
        let mut index = DummyIndex;
        assert_eq!(index.size(), 0);
        assert_eq!(index.used_memory(), 0);
        test_small(&mut index);
        assert_eq!(index.size(), 0);
    }

    #[test]
    fn factory_rejects_bad_names() {
        let err = create_map("").unwrap_err();
        assert_eq!(err.to_string(), "Need non-empty map type name");

        let err = create_map("does not exist").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Support for map type 'does not exist' not compiled into this binary"
        );
    }

    #[test]
    fn factory_products_work() {
        assert!(map_types().len() >= 6);
        for name in map_types() {
            if *name == "dummy" {
                continue;
            }
            let mut index = create_map(name).unwrap();
            index.reserve(1000);
            test_small(index.as_mut());

            let mut index = create_map(name).unwrap();
            index.reserve(1000);
            test_real(index.as_mut());
        }
    }
}

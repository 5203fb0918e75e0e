//! Dense index back-ends: a location cell per id.
//!
//! All three variants share the layout `cell[id] = (x, y)` with absent ids
//! holding the undefined location. Memory is 8 bytes per id up to the
//! largest id seen, which is the right trade-off for full-planet node
//! files where nearly every id is present.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use memmap2::MmapMut;

use super::{read_location, write_location, LocationIndex, LOCATION_SIZE};
use crate::error::{Error, Result};
use crate::location::Location;

/// Dense index in a plain `Vec`.
#[derive(Debug, Default)]
pub struct DenseMemArray {
    data: Vec<Location>,
}

impl DenseMemArray {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocationIndex for DenseMemArray {
    fn reserve(&mut self, capacity: usize) {
        self.data.reserve(capacity.saturating_sub(self.data.len()));
    }

    fn set(&mut self, id: u64, location: Location) -> Result<()> {
        let idx = id as usize;
        if idx >= self.data.len() {
            self.data.resize(idx + 1, Location::undefined());
        }
        self.data[idx] = location;
        Ok(())
    }

    fn get_noexcept(&self, id: u64) -> Location {
        self.data
            .get(id as usize)
            .copied()
            .unwrap_or_else(Location::undefined)
    }

    fn clear(&mut self) {
        self.data.clear();
    }

    fn size(&self) -> usize {
        self.data.len()
    }

    fn used_memory(&self) -> usize {
        self.data.capacity() * std::mem::size_of::<Location>()
    }
}

const INITIAL_MMAP_CELLS: usize = 1024;

/// Dense index over an anonymous memory mapping.
///
/// Same layout as [`DenseMemArray`]; the mapping is grown by remapping and
/// copying, and unset cells are explicitly initialized to the undefined
/// location.
#[derive(Debug)]
pub struct DenseMmapArray {
    mmap: MmapMut,
    used: usize,
}

fn map_cells(cells: usize) -> Result<MmapMut> {
    let mut mmap = MmapMut::map_anon(cells * LOCATION_SIZE)?;
    fill_undefined(&mut mmap[..]);
    Ok(mmap)
}

fn fill_undefined(buf: &mut [u8]) {
    for cell in buf.chunks_exact_mut(LOCATION_SIZE) {
        write_location(cell, Location::undefined());
    }
}

impl DenseMmapArray {
    pub fn new() -> Result<Self> {
        Ok(Self {
            mmap: map_cells(INITIAL_MMAP_CELLS)?,
            used: 0,
        })
    }

    fn capacity(&self) -> usize {
        self.mmap.len() / LOCATION_SIZE
    }

    fn grow(&mut self, cells: usize) -> Result<()> {
        let new_cells = cells.max(self.capacity() * 2);
        let mut new_mmap = map_cells(new_cells)?;
        let used_bytes = self.used * LOCATION_SIZE;
        new_mmap[..used_bytes].copy_from_slice(&self.mmap[..used_bytes]);
        self.mmap = new_mmap;
        Ok(())
    }
}

impl LocationIndex for DenseMmapArray {
    fn reserve(&mut self, capacity: usize) {
        if capacity > self.capacity() {
            // growth failure surfaces on the next set()
            let _ = self.grow(capacity);
        }
    }

    fn set(&mut self, id: u64, location: Location) -> Result<()> {
        let idx = id as usize;
        if idx >= self.capacity() {
            self.grow(idx + 1)?;
        }
        write_location(
            &mut self.mmap[idx * LOCATION_SIZE..(idx + 1) * LOCATION_SIZE],
            location,
        );
        self.used = self.used.max(idx + 1);
        Ok(())
    }

    fn get_noexcept(&self, id: u64) -> Location {
        let idx = id as usize;
        if idx >= self.used {
            return Location::undefined();
        }
        read_location(&self.mmap[idx * LOCATION_SIZE..(idx + 1) * LOCATION_SIZE])
    }

    fn clear(&mut self) {
        let used_bytes = self.used * LOCATION_SIZE;
        fill_undefined(&mut self.mmap[..used_bytes]);
        self.used = 0;
    }

    fn size(&self) -> usize {
        self.used
    }

    fn used_memory(&self) -> usize {
        self.mmap.len()
    }
}

/// Dense index backed by a seekable file.
///
/// The file holds little-endian `(x: i32, y: i32)` cells at offset
/// `id * 8`; growing pads the gap with undefined cells so the format can be
/// reopened later with [`DenseFileArray::with_file`].
#[derive(Debug)]
pub struct DenseFileArray {
    file: File,
    cells: u64,
}

impl DenseFileArray {
    /// Creates the index over a fresh anonymous temporary file.
    pub fn new() -> Result<Self> {
        Ok(Self {
            file: tempfile::tempfile()?,
            cells: 0,
        })
    }

    /// Opens the index over an existing file, e.g. one written by a
    /// previous run.
    pub fn with_file(file: File) -> Result<Self> {
        let cells = file.metadata()?.len() / LOCATION_SIZE as u64;
        Ok(Self { file, cells })
    }
}

impl LocationIndex for DenseFileArray {
    fn set(&mut self, id: u64, location: Location) -> Result<()> {
        let mut cell = [0u8; LOCATION_SIZE];
        if id >= self.cells {
            // pad the gap with undefined cells
            self.file
                .seek(SeekFrom::Start(self.cells * LOCATION_SIZE as u64))?;
            write_location(&mut cell, Location::undefined());
            for _ in self.cells..id {
                self.file.write_all(&cell)?;
            }
            self.cells = id + 1;
        } else {
            self.file.seek(SeekFrom::Start(id * LOCATION_SIZE as u64))?;
        }
        write_location(&mut cell, location);
        self.file.write_all(&cell)?;
        Ok(())
    }

    fn get(&self, id: u64) -> Result<Location> {
        if id >= self.cells {
            return Err(Error::NotFound(id));
        }
        let mut cell = [0u8; LOCATION_SIZE];
        let mut file = &self.file;
        file.seek(SeekFrom::Start(id * LOCATION_SIZE as u64))?;
        file.read_exact(&mut cell)?;
        let location = read_location(&cell);
        if location.is_undefined() {
            Err(Error::NotFound(id))
        } else {
            Ok(location)
        }
    }

    fn get_noexcept(&self, id: u64) -> Location {
        if id >= self.cells {
            return Location::undefined();
        }
        let mut cell = [0u8; LOCATION_SIZE];
        let mut file = &self.file;
        if file.seek(SeekFrom::Start(id * LOCATION_SIZE as u64)).is_err()
            || file.read_exact(&mut cell).is_err()
        {
            return Location::undefined();
        }
        read_location(&cell)
    }

    fn clear(&mut self) {
        let _ = self.file.set_len(0);
        self.cells = 0;
    }

    fn size(&self) -> usize {
        self.cells as usize
    }

    fn used_memory(&self) -> usize {
        // data lives on disk
        0
    }
}

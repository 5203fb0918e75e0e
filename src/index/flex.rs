//! Index that starts sparse and can be switched to a dense layout once the
//! id distribution is known.

use super::dense::DenseMmapArray;
use super::sparse::SparseMemArray;
use super::LocationIndex;
use crate::error::Result;
use crate::location::Location;

#[derive(Debug)]
enum FlexInner {
    Sparse(SparseMemArray),
    Dense(DenseMmapArray),
}

/// Polymorphic index holding either a sparse in-memory array or a dense
/// mmap array. The transition is one-way: [`FlexIndex::switch_to_dense`]
/// consumes the sparse state.
#[derive(Debug)]
pub struct FlexIndex {
    inner: FlexInner,
}

impl Default for FlexIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl FlexIndex {
    /// Creates the index in sparse mode.
    pub fn new() -> Self {
        Self {
            inner: FlexInner::Sparse(SparseMemArray::new()),
        }
    }

    /// Creates the index in dense mode right away.
    pub fn new_dense() -> Result<Self> {
        Ok(Self {
            inner: FlexInner::Dense(DenseMmapArray::new()?),
        })
    }

    pub fn is_dense(&self) -> bool {
        matches!(self.inner, FlexInner::Dense(_))
    }

    /// Re-packs all entries into a dense array sized to the largest id seen
    /// and releases the sparse storage. A no-op if already dense.
    pub fn switch_to_dense(&mut self) -> Result<()> {
        let mut sparse = match &mut self.inner {
            FlexInner::Dense(_) => return Ok(()),
            FlexInner::Sparse(sparse) => std::mem::take(sparse),
        };
        sparse.sort();

        let mut dense = DenseMmapArray::new()?;
        if let Some(&(max_id, _)) = sparse.entries().last() {
            dense.reserve(max_id as usize + 1);
        }
        for &(id, location) in sparse.entries() {
            dense.set(id, location)?;
        }
        self.inner = FlexInner::Dense(dense);
        Ok(())
    }

    fn delegate(&self) -> &dyn LocationIndex {
        match &self.inner {
            FlexInner::Sparse(index) => index,
            FlexInner::Dense(index) => index,
        }
    }

    fn delegate_mut(&mut self) -> &mut dyn LocationIndex {
        match &mut self.inner {
            FlexInner::Sparse(index) => index,
            FlexInner::Dense(index) => index,
        }
    }
}

impl LocationIndex for FlexIndex {
    fn reserve(&mut self, capacity: usize) {
        self.delegate_mut().reserve(capacity);
    }

    fn set(&mut self, id: u64, location: Location) -> Result<()> {
        self.delegate_mut().set(id, location)
    }

    fn get_noexcept(&self, id: u64) -> Location {
        self.delegate().get_noexcept(id)
    }

    fn sort(&mut self) {
        self.delegate_mut().sort();
    }

    fn clear(&mut self) {
        self.delegate_mut().clear();
    }

    fn size(&self) -> usize {
        self.delegate().size()
    }

    fn used_memory(&self) -> usize {
        self.delegate().used_memory()
    }
}

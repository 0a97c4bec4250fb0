//! The index store: separator positions with three ownership modes.
//!
//! Workers write byte positions of field separators into disjoint slabs of
//! one backing buffer. Readers see the same surface (`thread_data`,
//! `field_span`, `total_separators`) regardless of whether the store owns
//! its arrays on the heap, borrows them from a memory-mapped cache file, or
//! is shared behind a reference count ([`IndexStore::into_shared`]).
//!
//! Field `k`'s byte span is `[sep(k-1) + 1, sep(k))` with `sep(-1) = -1`,
//! so span lookups are O(1) once a flat file-order view exists and
//! O(n_threads) before that.

use rayon::prelude::*;

use crate::error::ErrorCode;

/// Slots of padding appended to every worker slab.
///
/// Absorbs the block scan's habit of writing a speculative position or two
/// past the last valid separator before the lane-mask check.
pub const SLAB_PADDING: usize = 8;

/// Byte span of one field, end-exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpan {
    pub start: usize,
    pub end: usize,
}

impl FieldSpan {
    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Failed index allocation: the requested geometry overflows `usize`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("index allocation would overflow: {detail}")]
pub struct AllocOverflow {
    detail: String,
}

impl AllocOverflow {
    pub(crate) fn code(&self) -> ErrorCode {
        ErrorCode::IndexAllocationOverflow
    }
}

/// How worker slabs are laid out inside the backing buffer.
#[derive(Debug, Clone)]
enum SlabLayout {
    /// Every worker owns a stride of `region_size` slots.
    Uniform { region_size: usize },
    /// Worker `t` owns `[offsets[t], offsets[t] + capacity)`; capacities are
    /// the gaps between consecutive offsets.
    Offsets(Vec<usize>),
}

#[derive(Debug)]
struct OwnedBacking {
    n_indexes: Vec<u64>,
    chunk_starts: Vec<u64>,
    indexes: Vec<u64>,
    layout: SlabLayout,
    /// File-order concatenation of all slabs, built by `compact`.
    flat: Option<Vec<u64>>,
    /// Column-major transpose; mutually exclusive with keeping `flat`.
    col_major: Option<Vec<u64>>,
}

#[derive(Debug)]
struct MmapBacking {
    map: memmap2::Mmap,
    /// Byte offset of the per-worker count array inside the map.
    counts_offset: usize,
    /// Byte offset of the flat position array inside the map.
    positions_offset: usize,
    total: u64,
    n_threads: u16,
}

impl MmapBacking {
    fn counts(&self) -> &[u64] {
        let bytes =
            &self.map[self.counts_offset..self.counts_offset + 8 * usize::from(self.n_threads)];
        bytemuck::cast_slice(bytes)
    }

    fn positions(&self) -> &[u64] {
        let start = self.positions_offset;
        let bytes = &self.map[start..start + 8 * self.total as usize];
        bytemuck::cast_slice(bytes)
    }
}

#[derive(Debug)]
enum Backing {
    Owned(OwnedBacking),
    Mmap(MmapBacking),
}

/// Separator-position index for one parsed buffer.
#[derive(Debug)]
pub struct IndexStore {
    columns: u64,
    n_threads: u16,
    backing: Backing,
}

/// A reference-counted, read-only handle to an [`IndexStore`].
pub type SharedIndex = std::sync::Arc<IndexStore>;

impl IndexStore {
    // ------------------------------------------------------------------
    // Allocators
    // ------------------------------------------------------------------

    /// Uniform slabs for the conservative path, where per-chunk counts are
    /// unknown: every worker gets `max_separators + SLAB_PADDING` slots.
    pub fn with_uniform_slabs(max_separators: usize, n_threads: usize) -> Result<Self, AllocOverflow> {
        let n_threads = n_threads.max(1);
        let region_size = max_separators
            .checked_add(SLAB_PADDING)
            .ok_or_else(|| overflow(max_separators, n_threads))?;
        let slots = region_size
            .checked_mul(n_threads)
            .filter(|s| s.checked_mul(8).is_some())
            .ok_or_else(|| overflow(max_separators, n_threads))?;
        Ok(Self::owned(n_threads, slots, SlabLayout::Uniform { region_size }))
    }

    /// Uniform slabs sized from a first-pass separator count.
    ///
    /// When the first pass saw quotes, the count may undercount what the
    /// error-recovering scan emits, so the slab size is bounded below by the
    /// buffer length.
    pub fn with_counted_slabs(
        total_separators: u64,
        n_threads: usize,
        n_quotes: u64,
        len: usize,
    ) -> Result<Self, AllocOverflow> {
        let safe = if n_quotes > 0 {
            total_separators.max(len as u64)
        } else {
            total_separators
        };
        Self::with_uniform_slabs(safe as usize, n_threads)
    }

    /// Right-sized slabs from per-chunk separator counts (the fast-path
    /// allocator): one contiguous buffer, each worker's slab holding exactly
    /// `counts[t] + SLAB_PADDING` slots located by an offset table.
    pub fn with_per_thread_slabs(counts: &[u64]) -> Result<Self, AllocOverflow> {
        let n_threads = counts.len().max(1);
        let mut offsets = Vec::with_capacity(n_threads);
        let mut total = 0usize;
        for &count in counts {
            offsets.push(total);
            let padded = usize::try_from(count)
                .ok()
                .and_then(|c| c.checked_add(SLAB_PADDING))
                .ok_or_else(|| overflow(count as usize, n_threads))?;
            total = total
                .checked_add(padded)
                .filter(|t| t.checked_mul(8).is_some())
                .ok_or_else(|| overflow(count as usize, n_threads))?;
        }
        if counts.is_empty() {
            offsets.push(0);
            total = SLAB_PADDING;
        }
        Ok(Self::owned(n_threads, total, SlabLayout::Offsets(offsets)))
    }

    /// An empty single-worker store, used as the placeholder in failed
    /// parse outcomes.
    pub(crate) fn empty() -> Self {
        Self::owned(
            1,
            SLAB_PADDING,
            SlabLayout::Uniform {
                region_size: SLAB_PADDING,
            },
        )
    }

    fn owned(n_threads: usize, slots: usize, layout: SlabLayout) -> Self {
        Self {
            columns: 0,
            n_threads: n_threads as u16,
            backing: Backing::Owned(OwnedBacking {
                n_indexes: vec![0; n_threads],
                chunk_starts: vec![0; n_threads],
                indexes: vec![0; slots],
                layout,
                flat: None,
                col_major: None,
            }),
        }
    }

    /// Wrap a validated cache mapping. The positions are already flat and
    /// file-ordered, so compaction is a no-op on the result.
    pub(crate) fn from_mmap(
        map: memmap2::Mmap,
        columns: u64,
        n_threads: u16,
        counts_offset: usize,
        positions_offset: usize,
        total: u64,
    ) -> Self {
        Self {
            columns,
            n_threads,
            backing: Backing::Mmap(MmapBacking {
                map,
                counts_offset,
                positions_offset,
                total,
                n_threads,
            }),
        }
    }

    /// Convert to a reference-counted shared handle.
    pub fn into_shared(self) -> SharedIndex {
        std::sync::Arc::new(self)
    }

    // ------------------------------------------------------------------
    // Reader surface
    // ------------------------------------------------------------------

    #[inline]
    pub fn columns(&self) -> u64 {
        self.columns
    }

    #[inline]
    pub fn n_threads(&self) -> u16 {
        self.n_threads
    }

    pub fn is_mmap_backed(&self) -> bool {
        matches!(self.backing, Backing::Mmap(_))
    }

    /// Number of separators recorded by worker `t`.
    pub fn count(&self, t: usize) -> u64 {
        match &self.backing {
            Backing::Owned(o) => o.n_indexes[t],
            Backing::Mmap(m) => m.counts()[t],
        }
    }

    pub fn total_separators(&self) -> u64 {
        match &self.backing {
            Backing::Owned(o) => o.n_indexes.iter().sum(),
            Backing::Mmap(m) => m.total,
        }
    }

    /// Byte offsets in the source where each worker began parsing.
    /// Not persisted in the cache, so absent for mmap-backed stores.
    pub fn chunk_starts(&self) -> Option<&[u64]> {
        match &self.backing {
            Backing::Owned(o) => Some(&o.chunk_starts),
            Backing::Mmap(_) => None,
        }
    }

    /// Worker `t`'s recorded positions, ascending.
    pub fn thread_data(&self, t: usize) -> &[u64] {
        match &self.backing {
            Backing::Owned(o) => {
                let count = o.n_indexes[t] as usize;
                let base = match &o.layout {
                    SlabLayout::Uniform { region_size } => t * region_size,
                    SlabLayout::Offsets(offsets) => offsets[t],
                };
                &o.indexes[base..base + count]
            }
            Backing::Mmap(m) => {
                let counts = m.counts();
                let start: u64 = counts[..t].iter().sum();
                let positions = m.positions();
                &positions[start as usize..(start + counts[t]) as usize]
            }
        }
    }

    /// The flat file-order view, if it exists.
    pub fn flat(&self) -> Option<&[u64]> {
        match &self.backing {
            Backing::Owned(o) => o.flat.as_deref(),
            Backing::Mmap(m) => Some(m.positions()),
        }
    }

    /// The column-major view, if it exists.
    pub fn col_major(&self) -> Option<&[u64]> {
        match &self.backing {
            Backing::Owned(o) => o.col_major.as_deref(),
            Backing::Mmap(_) => None,
        }
    }

    /// Position of the `k`-th separator in file order.
    ///
    /// O(1) with a flat or column-major view, O(n_threads) otherwise.
    pub fn separator(&self, k: u64) -> Option<u64> {
        if k >= self.total_separators() {
            return None;
        }
        if let Some(flat) = self.flat() {
            return Some(flat[k as usize]);
        }
        if let (Some(col), true) = (self.col_major(), self.columns > 0) {
            let nrows = self.total_separators() / self.columns;
            let (r, c) = (k / self.columns, k % self.columns);
            if r < nrows {
                return Some(col[(c * nrows + r) as usize]);
            }
        }
        // Workers are ordered by chunk start, so a prefix walk finds the
        // owning slab.
        let mut remaining = k;
        for t in 0..usize::from(self.n_threads) {
            let count = self.count(t);
            if remaining < count {
                return Some(self.thread_data(t)[remaining as usize]);
            }
            remaining -= count;
        }
        None
    }

    /// Byte span of field `k` in file order.
    pub fn field_span(&self, k: u64) -> Option<FieldSpan> {
        let end = self.separator(k)? as usize;
        let start = if k == 0 {
            0
        } else {
            self.separator(k - 1)? as usize + 1
        };
        Some(FieldSpan { start, end })
    }

    // ------------------------------------------------------------------
    // Writer surface (owned stores only)
    // ------------------------------------------------------------------

    /// Set the column count directly, for callers that determined it by
    /// post-hoc inspection.
    pub fn set_columns(&mut self, columns: u64) {
        self.columns = columns;
    }

    /// Derive `columns` from the first row terminator among the recorded
    /// separators.
    pub(crate) fn derive_columns(&mut self, data: &[u8]) {
        let total = self.total_separators();
        for k in 0..total {
            let pos = match self.separator(k) {
                Some(p) => p as usize,
                None => break,
            };
            if pos < data.len() && (data[pos] == b'\n' || data[pos] == b'\r') {
                self.columns = k + 1;
                return;
            }
        }
        // No row terminator was indexed; the column count is unknowable.
        self.columns = 0;
    }

    pub(crate) fn set_count(&mut self, t: usize, count: u64) {
        match &mut self.backing {
            Backing::Owned(o) => o.n_indexes[t] = count,
            Backing::Mmap(_) => unreachable!("mmap-backed index is read-only"),
        }
    }

    pub(crate) fn set_chunk_start(&mut self, t: usize, pos: u64) {
        match &mut self.backing {
            Backing::Owned(o) => o.chunk_starts[t] = pos,
            Backing::Mmap(_) => unreachable!("mmap-backed index is read-only"),
        }
    }

    /// Borrow every worker's full slab mutably at once. The slabs are
    /// disjoint slices of the one backing buffer, so workers can fill them
    /// in parallel.
    pub(crate) fn slabs_mut(&mut self) -> Vec<&mut [u64]> {
        let n = usize::from(self.n_threads);
        match &mut self.backing {
            Backing::Owned(o) => match &o.layout {
                SlabLayout::Uniform { region_size } => {
                    o.indexes.chunks_mut(*region_size).take(n).collect()
                }
                SlabLayout::Offsets(offsets) => {
                    let mut slabs = Vec::with_capacity(n);
                    let mut rest = o.indexes.as_mut_slice();
                    for t in 0..n {
                        let cap = if t + 1 < n {
                            offsets[t + 1] - offsets[t]
                        } else {
                            rest.len()
                        };
                        let (slab, tail) = rest.split_at_mut(cap);
                        slabs.push(slab);
                        rest = tail;
                    }
                    slabs
                }
            },
            Backing::Mmap(_) => unreachable!("mmap-backed index is read-only"),
        }
    }

    // ------------------------------------------------------------------
    // Compaction
    // ------------------------------------------------------------------

    /// Build the flat file-order view. Idempotent; no-op for mmap-backed
    /// stores, which are flat by construction.
    pub fn compact(&mut self) {
        let total = self.total_separators() as usize;
        let n = usize::from(self.n_threads);
        let Backing::Owned(o) = &self.backing else {
            return;
        };
        if o.flat.is_some() || o.col_major.is_some() || total == 0 {
            return;
        }

        // Workers are already ordered by chunk start; the sort is a
        // tie-break for empty slabs.
        let mut order: Vec<usize> = (0..n).filter(|&t| self.count(t) > 0).collect();
        order.sort_by_key(|&t| self.thread_data(t)[0]);

        let mut flat = Vec::with_capacity(total);
        for t in order {
            flat.extend_from_slice(self.thread_data(t));
        }

        match &mut self.backing {
            Backing::Owned(o) => o.flat = Some(flat),
            Backing::Mmap(_) => {}
        }
    }

    /// Transpose to column-major: `col[c * nrows + r]` is the separator at
    /// `(r, c)`. Frees the flat view afterwards to keep memory at 1x.
    /// Ragged trailing rows are truncated. No-op when already column-major
    /// or when the store is mmap-backed.
    pub fn compact_column_major(&mut self) {
        if self.columns == 0 || self.is_mmap_backed() {
            return;
        }
        if let Backing::Owned(o) = &self.backing {
            if o.col_major.is_some() {
                return;
            }
        }
        self.compact();
        let columns = self.columns as usize;
        let nrows = self.total_separators() as usize / columns;
        if nrows == 0 {
            return;
        }

        let col_major = {
            let Some(flat) = self.flat() else { return };
            let mut col = vec![0u64; nrows * columns];
            col.par_chunks_mut(nrows).enumerate().for_each(|(c, chunk)| {
                for (r, slot) in chunk.iter_mut().enumerate() {
                    *slot = flat[r * columns + c];
                }
            });
            col
        };

        if let Backing::Owned(o) = &mut self.backing {
            o.col_major = Some(col_major);
            o.flat = None;
        }
    }
}

fn overflow(count: usize, n_threads: usize) -> AllocOverflow {
    AllocOverflow {
        detail: format!("count={count}, n_threads={n_threads}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a two-worker store by hand: worker 0 owns positions from the
    /// first chunk, worker 1 from the second.
    fn sample_store() -> IndexStore {
        let mut store = IndexStore::with_per_thread_slabs(&[3, 3]).unwrap();
        {
            let mut slabs = store.slabs_mut();
            slabs[0][..3].copy_from_slice(&[1, 3, 5]);
            slabs[1][..3].copy_from_slice(&[7, 9, 11]);
        }
        store.set_count(0, 3);
        store.set_count(1, 3);
        store.set_chunk_start(1, 6);
        store.set_columns(3);
        store
    }

    #[test]
    fn test_thread_data() {
        let store = sample_store();
        assert_eq!(store.thread_data(0), &[1, 3, 5]);
        assert_eq!(store.thread_data(1), &[7, 9, 11]);
        assert_eq!(store.total_separators(), 6);
    }

    #[test]
    fn test_separator_without_flat() {
        let store = sample_store();
        assert_eq!(store.separator(0), Some(1));
        assert_eq!(store.separator(3), Some(7));
        assert_eq!(store.separator(5), Some(11));
        assert_eq!(store.separator(6), None);
    }

    #[test]
    fn test_field_span() {
        let mut store = sample_store();
        assert_eq!(store.field_span(0), Some(FieldSpan { start: 0, end: 1 }));
        assert_eq!(store.field_span(1), Some(FieldSpan { start: 2, end: 3 }));
        store.compact();
        assert_eq!(store.field_span(4), Some(FieldSpan { start: 8, end: 9 }));
        assert_eq!(store.field_span(6), None);
    }

    #[test]
    fn test_compact_is_idempotent() {
        let mut store = sample_store();
        store.compact();
        let first: Vec<u64> = store.flat().unwrap().to_vec();
        store.compact();
        assert_eq!(store.flat().unwrap(), first.as_slice());
        assert_eq!(first, vec![1, 3, 5, 7, 9, 11]);
    }

    #[test]
    fn test_column_major_transpose() {
        let mut store = sample_store();
        store.compact_column_major();
        assert!(store.flat().is_none());
        // 2 rows x 3 columns; col c holds rows' separators contiguously.
        assert_eq!(store.col_major().unwrap(), &[1, 7, 3, 9, 5, 11]);
        // Separator lookup still works through the transpose.
        assert_eq!(store.separator(4), Some(9));
        assert_eq!(store.field_span(1), Some(FieldSpan { start: 2, end: 3 }));
    }

    #[test]
    fn test_uniform_slabs() {
        let mut store = IndexStore::with_uniform_slabs(10, 4).unwrap();
        let slabs = store.slabs_mut();
        assert_eq!(slabs.len(), 4);
        for slab in &slabs {
            assert_eq!(slab.len(), 10 + SLAB_PADDING);
        }
    }

    #[test]
    fn test_counted_quote_margin() {
        // With quotes present the slab is bounded below by the buffer size.
        let store = IndexStore::with_counted_slabs(4, 1, 2, 1000).unwrap();
        let mut store = store;
        assert!(store.slabs_mut()[0].len() >= 1000);
        // Without quotes the count wins.
        let mut store = IndexStore::with_counted_slabs(4, 1, 0, 1000).unwrap();
        assert_eq!(store.slabs_mut()[0].len(), 4 + SLAB_PADDING);
    }

    #[test]
    fn test_alloc_overflow_refused() {
        let err = IndexStore::with_uniform_slabs(usize::MAX - 4, 2);
        assert!(err.is_err());
        let err = IndexStore::with_per_thread_slabs(&[u64::MAX, 1]);
        assert!(err.is_err());
    }

    #[test]
    fn test_shared_handle() {
        let store = sample_store().into_shared();
        let other = store.clone();
        assert_eq!(other.total_separators(), 6);
        drop(store);
        assert_eq!(other.separator(0), Some(1));
    }
}

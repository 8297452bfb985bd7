//! Byte-range bookkeeping for the shared buffers.
//!
//! A [`BufChunk`] names a contiguous range inside one buffer slot. Each slot keeps a [`FreeList`]
//! of the ranges nobody owns; the list is bounded, sorted by offset and always coalesced.

use thiserror::Error;

/// Maximum number of buffer slots (one index buffer plus vertex buffers).
pub const MAX_VBIDX_CNT: usize = 16;
/// Capacity of a single slot's free list.
pub const MAX_CHUNK_CNT: usize = 32;
/// Offsets and sizes are limited to 28 bits.
pub const MAX_CHUNK_EXTENT: u32 = (1 << 28) - 1;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkError {
    #[error("chunk at {ofs} of size {sz} does not fit in 28 bits")]
    OutOfRange { ofs: u32, sz: u32 },
    #[error("buffer index {0} is out of range")]
    BadBufferIndex(u8),
}

/// A byte range within one shared buffer. A chunk of size 0 is the null chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BufChunk {
    ofs: u32,
    sz: u32,
    vb_idx: u8,
}

impl BufChunk {
    pub fn new(ofs: u32, sz: u32, vb_idx: u8) -> Result<Self, ChunkError> {
        if ofs > MAX_CHUNK_EXTENT || sz > MAX_CHUNK_EXTENT || ofs + sz > MAX_CHUNK_EXTENT {
            return Err(ChunkError::OutOfRange { ofs, sz });
        }
        if vb_idx as usize >= MAX_VBIDX_CNT {
            return Err(ChunkError::BadBufferIndex(vb_idx));
        }
        Ok(BufChunk { ofs, sz, vb_idx })
    }

    /// Builds a chunk from values the pool already keeps within range.
    pub(crate) fn new_checked(ofs: u32, sz: u32, vb_idx: usize) -> Self {
        Self::new(ofs, sz, vb_idx as u8).unwrap_or_else(|e| panic!("[BufChunk]: {e}"))
    }

    pub const fn null() -> Self {
        BufChunk {
            ofs: 0,
            sz: 0,
            vb_idx: 0,
        }
    }

    pub fn ofs(&self) -> u32 {
        self.ofs
    }

    pub fn sz(&self) -> u32 {
        self.sz
    }

    pub fn vb_idx(&self) -> usize {
        self.vb_idx as usize
    }

    pub fn end(&self) -> u32 {
        self.ofs + self.sz
    }

    pub fn is_null(&self) -> bool {
        self.sz == 0
    }

    /// Splits the chunk `at` bytes from its start. Either half may come out null.
    pub fn split_at(&self, at: u32) -> (BufChunk, BufChunk) {
        let at = at.min(self.sz);
        let head = BufChunk {
            sz: at,
            ..*self
        };
        let tail = BufChunk {
            ofs: self.ofs + at,
            sz: self.sz - at,
            vb_idx: self.vb_idx,
        };
        (head, tail)
    }
}

/// The free list was at capacity and the released chunk could not be merged into any entry.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("free list is full, dropped {0:?}")]
pub struct FreeListFull(pub BufChunk);

/// Sorted, coalesced list of the unused ranges of one buffer. Holds at most [`MAX_CHUNK_CNT`]
/// entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreeList {
    chunks: Vec<BufChunk>,
}

impl FreeList {
    pub fn new() -> Self {
        FreeList {
            chunks: Vec::with_capacity(MAX_CHUNK_CNT),
        }
    }

    pub fn as_slice(&self) -> &[BufChunk] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    pub fn total_size(&self) -> u64 {
        self.chunks.iter().map(|c| c.sz as u64).sum()
    }

    pub fn largest(&self) -> u32 {
        self.chunks.iter().map(|c| c.sz).max().unwrap_or(0)
    }

    /// Inserts `new_chunk`, merging it with the entries that touch it on either side.
    pub fn add_chunk(&mut self, new_chunk: BufChunk) -> Result<(), FreeListFull> {
        if new_chunk.is_null() {
            return Ok(());
        }
        let pos = self.chunks.partition_point(|c| c.ofs < new_chunk.ofs);
        debug_assert!(
            pos == 0 || self.chunks[pos - 1].end() <= new_chunk.ofs,
            "{new_chunk:?} overlaps {:?}",
            self.chunks[pos - 1]
        );
        debug_assert!(
            pos == self.chunks.len() || new_chunk.end() <= self.chunks[pos].ofs,
            "{new_chunk:?} overlaps {:?}",
            self.chunks[pos]
        );

        let merge_left = pos > 0 && self.chunks[pos - 1].end() == new_chunk.ofs;
        let merge_right = pos < self.chunks.len() && new_chunk.end() == self.chunks[pos].ofs;

        match (merge_left, merge_right) {
            (true, true) => {
                let right = self.chunks.remove(pos);
                self.chunks[pos - 1].sz += new_chunk.sz + right.sz;
            }
            (true, false) => self.chunks[pos - 1].sz += new_chunk.sz,
            (false, true) => {
                let right = &mut self.chunks[pos];
                right.ofs = new_chunk.ofs;
                right.sz += new_chunk.sz;
            }
            (false, false) => {
                if self.chunks.len() >= MAX_CHUNK_CNT {
                    return Err(FreeListFull(new_chunk));
                }
                self.chunks.insert(pos, new_chunk);
            }
        }
        Ok(())
    }

    /// Returns the entry touching the end of a buffer of `buf_size` bytes.
    pub fn find_top_chunk(&self, buf_size: u32) -> Option<usize> {
        self.chunks
            .last()
            .filter(|c| c.end() == buf_size)
            .map(|_| self.chunks.len() - 1)
    }

    /// Best fit: the smallest entry that holds `req_sz` bytes, the lowest offset on ties.
    pub fn find_chunk(&self, req_sz: u32) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, c) in self.chunks.iter().enumerate() {
            if c.sz < req_sz {
                continue;
            }
            match best {
                Some(b) if self.chunks[b].sz <= c.sz => {}
                _ => best = Some(i),
            }
        }
        best
    }

    /// Takes `req_sz` bytes from the start of entry `idx`. If fewer than `min_gap` bytes would
    /// remain, the whole entry is handed out instead.
    pub fn cut_chunk(&mut self, idx: usize, req_sz: u32, min_gap: u32) -> BufChunk {
        let entry = self.chunks[idx];
        assert!(
            entry.sz >= req_sz,
            "[FreeList]: cannot cut {req_sz} bytes from {entry:?}"
        );
        let rest = entry.sz - req_sz;
        if rest == 0 || rest < min_gap {
            return self.chunks.remove(idx);
        }
        let (taken, remainder) = entry.split_at(req_sz);
        self.chunks[idx] = remainder;
        taken
    }
}

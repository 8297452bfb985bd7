//! The set of shared GPU buffers and their free lists.
//!
//! Slot [`IDX_IB`] holds the index buffer; every other slot holds a vertex buffer dedicated to one
//! vertex stride, so that a chunk offset is always a whole number of vertices. Multi-step
//! free-list updates happen under a single mutex, while the per-slot [`PoolSize`] counters can be
//! read from any thread without taking it.

use std::{
    fmt::Write,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use anyhow::anyhow;

use crate::{
    chunk::{BufChunk, FreeList, FreeListFull, MAX_CHUNK_CNT, MAX_CHUNK_EXTENT, MAX_VBIDX_CNT},
    config::{BufConfig, DEFAULT_MAX_VB_SIZE},
    device::{BufferDesc, BufferDevice, BufferHandle, BufferUsage},
    vdata::{align_down, align_up, unique_vdata, MeshVdata, VdataBytes, VdataLocation, VertexData, IB_ALIGN},
};

pub const IDX_IB: usize = 0;
pub const IDX_VB_START: usize = 1;

/// Smallest index buffer fragment worth keeping in a free list.
const IB_MIN_GAP: u32 = 64;
/// Smallest vertex buffer fragment worth keeping, in vertices.
const VB_MIN_GAP_VERTICES: u32 = 16;

/// Used and total bytes of one slot.
#[derive(Debug, Default)]
pub struct PoolSize {
    used: AtomicU32,
    size: AtomicU32,
}

impl PoolSize {
    pub fn get_used(&self) -> u32 {
        self.used.load(Ordering::Acquire)
    }

    pub fn get_size(&self) -> u32 {
        self.size.load(Ordering::Acquire)
    }

    pub fn set_used(&self, used: u32) {
        self.used.store(used, Ordering::Release)
    }

    pub fn set_size(&self, size: u32) {
        self.size.store(size, Ordering::Release)
    }

    pub fn inc_used(&self, bytes: u32) {
        self.used.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn dec_used(&self, bytes: u32) {
        self.used.fetch_sub(bytes, Ordering::AcqRel);
    }
}

/// Bytes that could not be granted, split by buffer kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Shortage {
    pub vb: u32,
    pub ib: u32,
}

impl Shortage {
    pub fn is_empty(&self) -> bool {
        self.vb == 0 && self.ib == 0
    }
}

#[derive(Debug)]
struct Slot {
    buf: Option<BufferHandle>,
    /// 0 for the index buffer.
    stride: u32,
    free: FreeList,
}

impl Slot {
    fn new(stride: u32) -> Self {
        Slot {
            buf: None,
            stride,
            free: FreeList::new(),
        }
    }

    fn alignment(&self) -> u32 {
        if self.stride == 0 {
            IB_ALIGN
        } else {
            self.stride
        }
    }

    fn min_gap(&self) -> u32 {
        if self.stride == 0 {
            IB_MIN_GAP
        } else {
            self.stride * VB_MIN_GAP_VERTICES
        }
    }
}

struct PoolState {
    slots: Vec<Slot>,
}

impl PoolState {
    /// Finds the vertex slot for `stride`, registering a new one if there is room.
    fn slot_for_stride(&mut self, stride: u32) -> Option<usize> {
        if let Some(idx) = self.slots[IDX_VB_START..]
            .iter()
            .position(|s| s.stride == stride)
        {
            return Some(idx + IDX_VB_START);
        }
        if self.slots.len() >= MAX_VBIDX_CNT {
            return None;
        }
        self.slots.push(Slot::new(stride));
        Some(self.slots.len() - 1)
    }
}

pub struct BufPool {
    name: String,
    device: Arc<dyn BufferDevice>,
    pool: [PoolSize; MAX_VBIDX_CNT],
    /// Guards slot buffers and free lists.
    state: Mutex<PoolState>,
    max_vb_size: AtomicU32,
    allow_rebuild: AtomicBool,
    allow_del_res: AtomicBool,
    lost_chunks: AtomicU32,
    lost_bytes: AtomicU64,
}

impl BufPool {
    pub fn new(name: &str, device: Arc<dyn BufferDevice>) -> Self {
        BufPool {
            name: name.to_owned(),
            device,
            pool: Default::default(),
            state: Mutex::new(PoolState {
                slots: vec![Slot::new(0)],
            }),
            max_vb_size: AtomicU32::new(DEFAULT_MAX_VB_SIZE),
            allow_rebuild: AtomicBool::new(true),
            allow_del_res: AtomicBool::new(false),
            lost_chunks: AtomicU32::new(0),
            lost_bytes: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<PoolState> {
        self.state.lock().unwrap()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_vb_size(&self) -> u32 {
        self.max_vb_size.load(Ordering::Acquire)
    }

    pub fn set_max_vb_size(&self, max_sz: u32) {
        self.max_vb_size
            .store(max_sz.min(MAX_CHUNK_EXTENT), Ordering::Release)
    }

    pub fn allow_rebuild(&self) -> bool {
        self.allow_rebuild.load(Ordering::Acquire)
    }

    pub fn set_allow_rebuild(&self, allow: bool) {
        self.allow_rebuild.store(allow, Ordering::Release)
    }

    pub fn allow_del_res(&self) -> bool {
        self.allow_del_res.load(Ordering::Acquire)
    }

    pub fn set_allow_del_res(&self, allow: bool) {
        self.allow_del_res.store(allow, Ordering::Release)
    }

    pub fn pool_size(&self, idx: usize) -> &PoolSize {
        &self.pool[idx]
    }

    /// Number of released chunks dropped because a free list was full.
    pub fn lost_chunks(&self) -> u32 {
        self.lost_chunks.load(Ordering::Acquire)
    }

    pub fn lost_bytes(&self) -> u64 {
        self.lost_bytes.load(Ordering::Acquire)
    }

    pub fn vb_count(&self) -> usize {
        self.lock().slots.len() - IDX_VB_START
    }

    pub fn ib(&self) -> Option<BufferHandle> {
        self.lock().slots[IDX_IB].buf
    }

    pub fn vb(&self, idx: usize) -> Option<BufferHandle> {
        if idx < IDX_VB_START {
            return None;
        }
        self.lock().slots.get(idx).and_then(|s| s.buf)
    }

    pub fn slot_stride(&self, idx: usize) -> Option<u32> {
        self.lock().slots.get(idx).map(|s| s.stride)
    }

    pub fn free_chunks(&self, idx: usize) -> Vec<BufChunk> {
        self.lock()
            .slots
            .get(idx)
            .map(|s| s.free.as_slice().to_vec())
            .unwrap_or_default()
    }

    pub fn ib_used(&self) -> u64 {
        self.pool[IDX_IB].get_used() as u64
    }

    pub fn vb_used(&self) -> u64 {
        self.pool[IDX_VB_START..]
            .iter()
            .map(|p| p.get_used() as u64)
            .sum()
    }

    fn buffer_name(&self, idx: usize) -> String {
        if idx == IDX_IB {
            format!("{}_ib", self.name)
        } else {
            format!("{}_vb{}", self.name, idx - IDX_VB_START)
        }
    }

    fn add_free(&self, free: &mut FreeList, chunk: BufChunk) {
        if let Err(FreeListFull(lost)) = free.add_chunk(chunk) {
            self.lost_chunks.fetch_add(1, Ordering::AcqRel);
            self.lost_bytes.fetch_add(lost.sz() as u64, Ordering::AcqRel);
            log::warn!(
                "{}: free list of slot {} is full, {} bytes at {} are lost until the next rebuild",
                self.name,
                lost.vb_idx(),
                lost.sz(),
                lost.ofs()
            );
        }
    }

    /// Grants a chunk of `req_avail_sz` bytes from the vertex slot for `stride`, growing the
    /// buffer within the configured limits. Returns the null chunk on failure.
    pub fn alloc_chunk_for_stride(&self, stride: u32, req_avail_sz: u32, hints: &BufConfig) -> BufChunk {
        let mut st = self.lock();
        match st.slot_for_stride(stride) {
            Some(idx) => self
                .alloc_in(&mut st, idx, req_avail_sz, hints, false)
                .unwrap_or_default(),
            None => BufChunk::null(),
        }
    }

    /// Index buffer counterpart of [`BufPool::alloc_chunk_for_stride`].
    pub fn alloc_ib_chunk(&self, req_avail_sz: u32, hints: &BufConfig) -> BufChunk {
        let mut st = self.lock();
        self.alloc_in(&mut st, IDX_IB, req_avail_sz, hints, false)
            .unwrap_or_default()
    }

    /// On failure returns how many bytes were missing.
    ///
    /// Forced allocations (tight rebuilds) keep every remainder in the free list, so buffers
    /// sized to the exact total fit every request.
    fn alloc_in(
        &self,
        st: &mut PoolState,
        idx: usize,
        req_sz: u32,
        hints: &BufConfig,
        force: bool,
    ) -> Result<BufChunk, u32> {
        let align = st.slots[idx].alignment();
        let min_gap = if force { 0 } else { st.slots[idx].min_gap() };
        let req = align_up(req_sz, align);
        if req == 0 {
            return Ok(BufChunk::null());
        }
        let hard_max = align_down(MAX_CHUNK_EXTENT, align);
        if req > hard_max {
            return Err(req - hard_max);
        }

        for _ in 0..2 {
            let free = &mut st.slots[idx].free;
            if let Some(i) = free.find_chunk(req) {
                let chunk = free.cut_chunk(i, req, min_gap);
                self.pool[idx].inc_used(chunk.sz());
                return Ok(chunk);
            }

            let size = self.pool[idx].get_size();
            let top = free.find_top_chunk(size);
            let top_free = top.map(|i| free.as_slice()[i].sz()).unwrap_or(0);
            // a new tail that can neither merge nor be inserted is handed out directly
            let list_full = top.is_none() && free.len() >= MAX_CHUNK_CNT;
            let need = req - top_free;
            let mut new_size = if size == 0 {
                hints.sizes[idx].max(req)
            } else if list_full {
                size + req
            } else {
                size.saturating_add(hints.growth_step(idx == IDX_IB, size).max(need))
            };
            new_size = align_up(new_size, align);

            let max = align_down(self.max_vb_size(), align);
            if new_size > max && !force {
                if size + need > max {
                    return Err(size + need - max);
                }
                new_size = max;
            }
            if new_size > hard_max {
                if size + need > hard_max {
                    return Err(size + need - hard_max);
                }
                new_size = hard_max;
            }
            if size > 0 && !force && !self.allow_rebuild() {
                return Err(need);
            }
            let tail = match self.resize_in(st, idx, new_size) {
                Ok(tail) => tail,
                Err(e) => {
                    log::error!("{}: failed to grow to {new_size} bytes: {e:#}", self.buffer_name(idx));
                    return Err(need);
                }
            };
            if list_full && tail.sz() >= req {
                let (taken, rest) = tail.split_at(req);
                self.add_free(&mut st.slots[idx].free, rest);
                self.pool[idx].inc_used(taken.sz());
                return Ok(taken);
            }
            self.add_free(&mut st.slots[idx].free, tail);
        }
        Err(req)
    }

    /// Replaces the slot's buffer with a bigger one, carrying the old contents over. Returns the
    /// added tail, which is not in the free list yet.
    fn resize_in(&self, st: &mut PoolState, idx: usize, new_size: u32) -> anyhow::Result<BufChunk> {
        let size = self.pool[idx].get_size();
        let name = self.buffer_name(idx);
        let new_buf = self.device.create_buffer(&BufferDesc {
            size: new_size,
            usage: usage(idx),
            name: &name,
        })?;

        let slot = &mut st.slots[idx];
        if let Some(old) = slot.buf.take() {
            let keep = size.min(new_size);
            if keep > 0 {
                if let Err(e) = self.device.copy_buffer(old, 0, new_buf, 0, keep) {
                    self.device.destroy_buffer(new_buf);
                    slot.buf = Some(old);
                    return Err(e);
                }
            }
            self.device.destroy_buffer(old);
        }
        slot.buf = Some(new_buf);
        self.pool[idx].set_size(new_size);
        log::debug!("{name}: resized {size} -> {new_size}");
        Ok(BufChunk::new_checked(size, new_size.saturating_sub(size), idx))
    }

    /// Bytes needed per stride and for the index buffer by every vertex data object in the list.
    fn requirements(smvd_list: &[Arc<MeshVdata>]) -> (Vec<(u32, u32)>, u32) {
        let mut vb: Vec<(u32, u32)> = vec![];
        let mut ib: u32 = 0;
        for vd in unique_vdata(smvd_list) {
            match vb.iter_mut().find(|(stride, _)| *stride == vd.stride()) {
                Some((_, bytes)) => *bytes = bytes.saturating_add(vd.vb_size()),
                None => vb.push((vd.stride(), vd.vb_size())),
            }
            ib = ib.saturating_add(vd.ib_footprint());
        }
        (vb, ib)
    }

    /// Grants one chunk per stride bucket plus one index chunk covering every vertex data object
    /// in `smvd_list`.
    ///
    /// With `can_fail` the configured size limits hold and on shortage nothing is committed.
    /// Without it the buffers are grown as far as needed.
    pub fn arrange_vdata(
        &self,
        smvd_list: &[Arc<MeshVdata>],
        can_fail: bool,
        hints: &BufConfig,
    ) -> Result<Vec<BufChunk>, Shortage> {
        let (vb_req, ib_req) = Self::requirements(smvd_list);
        let mut st = self.lock();
        let mut out = Vec::with_capacity(vb_req.len() + 1);
        let mut shortage = Shortage::default();

        for (stride, bytes) in vb_req {
            let idx = match st.slot_for_stride(stride) {
                Some(idx) => idx,
                None => {
                    log::warn!("{}: no vertex buffer slot left for stride {stride}", self.name);
                    shortage.vb += bytes;
                    continue;
                }
            };
            match self.alloc_in(&mut st, idx, bytes, hints, !can_fail) {
                Ok(chunk) => out.push(chunk),
                Err(missing) => shortage.vb += missing,
            }
        }
        match self.alloc_in(&mut st, IDX_IB, ib_req, hints, !can_fail) {
            Ok(chunk) if !chunk.is_null() => out.push(chunk),
            Ok(_) => {}
            Err(missing) => shortage.ib += missing,
        }

        if !shortage.is_empty() {
            self.release_in(&mut st, &out, true);
            log::debug!(
                "{}: arrange failed, short by {} vb / {} ib bytes",
                self.name,
                shortage.vb,
                shortage.ib
            );
            return Err(shortage);
        }
        Ok(out)
    }

    /// Where each vertex data object of `smvd_list` goes inside `chunks`, as granted by
    /// [`BufPool::arrange_vdata`] for the same list.
    pub fn layout_vdata(
        &self,
        smvd_list: &[Arc<MeshVdata>],
        chunks: &[BufChunk],
    ) -> anyhow::Result<Vec<(Arc<VertexData>, VdataLocation)>> {
        let strides: Vec<u32> = self.lock().slots.iter().map(|s| s.stride).collect();
        let mut cursor: [Option<(u32, u32)>; MAX_VBIDX_CNT] = Default::default();
        for c in chunks.iter().filter(|c| !c.is_null()) {
            cursor[c.vb_idx()] = Some((c.ofs(), c.end()));
        }

        let mut take = |idx: usize, bytes: u32| -> anyhow::Result<u32> {
            let (pos, end) = cursor[idx]
                .as_mut()
                .ok_or_else(|| anyhow!("no chunk granted for slot {idx}"))?;
            let ofs = *pos;
            match ofs.checked_add(bytes) {
                Some(next) if next <= *end => *pos = next,
                _ => return Err(anyhow!("{bytes} bytes at {ofs} overflow the chunk of slot {idx}")),
            }
            Ok(ofs)
        };

        unique_vdata(smvd_list)
            .into_iter()
            .map(|vd| {
                let vb_idx = (IDX_VB_START..strides.len())
                    .find(|&i| strides[i] == vd.stride())
                    .ok_or_else(|| anyhow!("no vertex slot for stride {}", vd.stride()))?;
                let vb_ofs = take(vb_idx, vd.vb_size())?;
                let ib_ofs = match vd.ib_footprint() {
                    0 => 0,
                    bytes => take(IDX_IB, bytes)?,
                };
                let loc = VdataLocation {
                    vb_idx: vb_idx as u8,
                    vb_ofs,
                    ib_ofs,
                };
                Ok::<_, anyhow::Error>((vd, loc))
            })
            .collect()
    }

    pub fn reset_vdata_buf_pointers(smvd_list: &[Arc<MeshVdata>]) {
        for vd in unique_vdata(smvd_list) {
            vd.set_location(None);
        }
    }

    /// Splits a chunk tab granted for `smvd_list` (laid out in LOD order) into the part used by
    /// LODs before `first_lod` and the rest.
    pub fn get_separate_chunks(
        &self,
        smvd_list: &[Arc<MeshVdata>],
        first_lod: usize,
        chunks: &[BufChunk],
    ) -> (Vec<BufChunk>, Vec<BufChunk>) {
        let strides: Vec<u32> = self.lock().slots.iter().map(|s| s.stride).collect();
        let head = unique_vdata(&smvd_list[..first_lod.min(smvd_list.len())]);
        let mut c1 = vec![];
        let mut c2 = vec![];
        for c in chunks {
            let head_bytes: u32 = if c.vb_idx() == IDX_IB {
                head.iter()
                    .fold(0u32, |sum, vd| sum.saturating_add(vd.ib_footprint()))
            } else {
                head.iter()
                    .filter(|vd| strides.get(c.vb_idx()) == Some(&vd.stride()))
                    .fold(0u32, |sum, vd| sum.saturating_add(vd.vb_size()))
            };
            let (a, b) = c.split_at(head_bytes);
            if !a.is_null() {
                c1.push(a);
            }
            if !b.is_null() {
                c2.push(b);
            }
        }
        (c1, c2)
    }

    /// Returns the bytes of `chunks` that `smvd_list` leaves unfilled to the free lists. Yields
    /// the filled part.
    pub fn release_slack(&self, smvd_list: &[Arc<MeshVdata>], chunks: &[BufChunk]) -> Vec<BufChunk> {
        let (filled, slack) = self.get_separate_chunks(smvd_list, smvd_list.len(), chunks);
        if !slack.is_empty() {
            self.release_buf_chunk(&slack, true);
        }
        filled
    }

    /// Returns chunks to their free lists.
    pub fn release_buf_chunk(&self, chunks: &[BufChunk], update_used: bool) {
        let mut st = self.lock();
        self.release_in(&mut st, chunks, update_used);
    }

    fn release_in(&self, st: &mut PoolState, chunks: &[BufChunk], update_used: bool) {
        for &c in chunks.iter().filter(|c| !c.is_null()) {
            let idx = c.vb_idx();
            if idx >= st.slots.len() || c.end() > self.pool[idx].get_size() {
                log::warn!("{}: ignoring release of stale chunk {c:?}", self.name);
                continue;
            }
            if update_used {
                self.pool[idx].dec_used(c.sz());
            }
            self.add_free(&mut st.slots[idx].free, c);
        }
    }

    /// Per-slot byte totals `smvd_list` needs, registering slots for unseen strides.
    pub fn required_sizes(&self, smvd_list: &[Arc<MeshVdata>]) -> [u32; MAX_VBIDX_CNT] {
        let (vb_req, ib_req) = Self::requirements(smvd_list);
        let mut st = self.lock();
        let mut sizes = [0; MAX_VBIDX_CNT];
        sizes[IDX_IB] = ib_req;
        for (stride, bytes) in vb_req {
            if let Some(idx) = st.slot_for_stride(stride) {
                sizes[idx] = sizes[idx].saturating_add(bytes);
            }
        }
        sizes
    }

    /// Creates the slot's buffer with the given size; the old one is destroyed without copying.
    pub fn allocate_buffer(&self, idx: usize, size: u32, name: &str) -> bool {
        let mut st = self.lock();
        if idx >= st.slots.len() {
            return false;
        }
        match self.allocate_buffer_in(&mut st, idx, size, name) {
            Ok(()) => true,
            Err(e) => {
                log::error!("{name}: failed to allocate {size} bytes: {e:#}");
                false
            }
        }
    }

    fn allocate_buffer_in(
        &self,
        st: &mut PoolState,
        idx: usize,
        size: u32,
        name: &str,
    ) -> anyhow::Result<()> {
        let buf = self.device.create_buffer(&BufferDesc {
            size,
            usage: usage(idx),
            name,
        })?;
        if let Some(old) = st.slots[idx].buf.replace(buf) {
            self.device.destroy_buffer(old);
        }
        self.pool[idx].set_size(size);
        Ok(())
    }

    /// Recreates the slot's buffer empty, with at least `hint_sz` bytes.
    pub fn allocate_pool(&self, idx: usize, hint_sz: u32) -> bool {
        let mut st = self.lock();
        if idx >= st.slots.len() {
            return false;
        }
        match self.allocate_pool_in(&mut st, idx, hint_sz) {
            Ok(()) => true,
            Err(e) => {
                log::error!("{}: {e:#}", self.buffer_name(idx));
                false
            }
        }
    }

    fn allocate_pool_in(&self, st: &mut PoolState, idx: usize, hint_sz: u32) -> anyhow::Result<()> {
        let align = st.slots[idx].alignment();
        let size = align_up(hint_sz, align).min(align_down(MAX_CHUNK_EXTENT, align));
        let name = self.buffer_name(idx);
        self.allocate_buffer_in(st, idx, size, &name)?;
        let free = &mut st.slots[idx].free;
        free.clear();
        self.add_free(free, BufChunk::new_checked(0, size, idx));
        self.pool[idx].set_used(0);
        Ok(())
    }

    /// Creates the buffers of every registered slot from the hinted sizes. `tight` uses the sizes
    /// as they are; otherwise one growth step of headroom is added.
    pub fn create_sbuffers(&self, hints: &BufConfig, tight: bool) -> bool {
        let mut st = self.lock();
        let mut ok = true;
        for idx in 0..st.slots.len() {
            let mut size = hints.sizes[idx];
            if size == 0 {
                continue;
            }
            if !tight {
                size = (size + hints.growth_step(idx == IDX_IB, size)).min(self.max_vb_size().max(size));
            }
            if let Err(e) = self.allocate_pool_in(&mut st, idx, size) {
                log::error!("{}: failed to create buffer: {e:#}", self.buffer_name(idx));
                ok = false;
            }
        }
        ok
    }

    /// Destroys every buffer and forgets all chunks. Slot strides are kept, so slot indices stay
    /// stable across device resets.
    pub fn clear(&self) {
        let mut st = self.lock();
        for (idx, slot) in st.slots.iter_mut().enumerate() {
            if let Some(buf) = slot.buf.take() {
                self.device.destroy_buffer(buf);
            }
            slot.free.clear();
            self.pool[idx].set_used(0);
            self.pool[idx].set_size(0);
        }
    }

    pub fn write_vdata(&self, vd: &VertexData, loc: VdataLocation, bytes: &VdataBytes) -> anyhow::Result<()> {
        bytes.check(vd)?;
        let st = self.lock();
        let vb = st
            .slots
            .get(loc.vb_idx as usize)
            .and_then(|s| s.buf)
            .ok_or_else(|| anyhow!("vertex buffer {} is not allocated", loc.vb_idx))?;
        self.device.write_buffer(vb, loc.vb_ofs, &bytes.vertices)?;
        if !bytes.indices.is_empty() {
            let ib = st.slots[IDX_IB]
                .buf
                .ok_or_else(|| anyhow!("index buffer is not allocated"))?;
            self.device.write_buffer(ib, loc.ib_ofs, &bytes.indices)?;
        }
        Ok(())
    }

    /// Reads back the current contents of a placed vertex data object.
    pub fn read_vdata(&self, vd: &VertexData) -> anyhow::Result<VdataBytes> {
        let loc = vd
            .location()
            .ok_or_else(|| anyhow!("vertex data is not placed"))?;
        let st = self.lock();
        let vb = st
            .slots
            .get(loc.vb_idx as usize)
            .and_then(|s| s.buf)
            .ok_or_else(|| anyhow!("vertex buffer {} is not allocated", loc.vb_idx))?;
        let vertices = self.device.read_buffer(vb, loc.vb_ofs, vd.vb_size())?;
        let indices = match (vd.ib_size(), st.slots[IDX_IB].buf) {
            (0, _) => vec![],
            (len, Some(ib)) => self.device.read_buffer(ib, loc.ib_ofs, len)?,
            (_, None) => return Err(anyhow!("index buffer is not allocated")),
        };
        Ok(VdataBytes { vertices, indices })
    }

    pub fn calc_used_size_str(chunks: &[BufChunk]) -> String {
        let mut per_slot = [0u64; MAX_VBIDX_CNT];
        for c in chunks {
            per_slot[c.vb_idx()] += c.sz() as u64;
        }
        let mut out = String::new();
        for (idx, bytes) in per_slot.iter().enumerate().filter(|(_, b)| **b > 0) {
            if !out.is_empty() {
                out.push(' ');
            }
            if idx == IDX_IB {
                let _ = write!(out, "ib {}", fmt_size(*bytes));
            } else {
                let _ = write!(out, "vb{} {}", idx - IDX_VB_START, fmt_size(*bytes));
            }
        }
        out
    }

    pub fn stat_str(&self) -> String {
        let st = self.lock();
        let mut out = String::new();
        for (idx, slot) in st.slots.iter().enumerate() {
            let p = &self.pool[idx];
            let _ = writeln!(
                out,
                "{}: stride {} used {} of {}, {} free chunks (largest {}){}",
                self.buffer_name(idx),
                slot.stride,
                fmt_size(p.get_used() as u64),
                fmt_size(p.get_size() as u64),
                slot.free.len(),
                fmt_size(slot.free.largest() as u64),
                if slot.buf.is_some() { "" } else { ", no buffer" }
            );
        }
        if self.lost_chunks() > 0 {
            let _ = writeln!(
                out,
                "{} chunks ({}) lost to free list overflow",
                self.lost_chunks(),
                fmt_size(self.lost_bytes())
            );
        }
        out
    }
}

fn usage(idx: usize) -> BufferUsage {
    let kind = if idx == IDX_IB {
        BufferUsage::INDEX
    } else {
        BufferUsage::VERTEX
    };
    kind | BufferUsage::COPY_SRC | BufferUsage::COPY_DST
}

pub(crate) fn fmt_size(bytes: u64) -> String {
    if bytes >= 1 << 20 {
        format!("{:.2}M", bytes as f64 / (1 << 20) as f64)
    } else if bytes >= 1 << 10 {
        format!("{:.1}K", bytes as f64 / (1 << 10) as f64)
    } else {
        format!("{bytes}B")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        device::HostBufferDevice,
        vdata::{IndexFormat, VertexData},
    };
    use nonzero_ext::nonzero;
    use std::num::NonZeroU32;

    fn mesh(stride: NonZeroU32, vertices: u32, indices: u32) -> Arc<MeshVdata> {
        Arc::new(MeshVdata::new(vec![Arc::new(VertexData::new(
            stride,
            vertices,
            indices,
            IndexFormat::U16,
        ))]))
    }

    fn small_pool(max: u32) -> (Arc<HostBufferDevice>, BufPool, BufConfig) {
        let device = Arc::new(HostBufferDevice::new());
        let pool = BufPool::new("test", device.clone());
        pool.set_max_vb_size(max);
        let mut hints = BufConfig::default();
        hints.sizes = [max; MAX_VBIDX_CNT];
        hints.vb_min_add = 64;
        hints.ib_min_add = 64;
        (device, pool, hints)
    }

    #[test]
    fn shortage_reported_when_full() {
        let (_device, pool, hints) = small_pool(1024);
        let first = pool.arrange_vdata(&[mesh(nonzero!(4u32), 175, 0)], true, &hints);
        assert_eq!(first.unwrap(), vec![BufChunk::new(0, 700, 1).unwrap()]);
        assert_eq!(pool.pool_size(1).get_size(), 1024);

        let second = pool.arrange_vdata(&[mesh(nonzero!(4u32), 100, 0)], true, &hints);
        assert_eq!(second, Err(Shortage { vb: 76, ib: 0 }));
        assert_eq!(pool.pool_size(1).get_used(), 700);
        assert!(pool.alloc_chunk_for_stride(4, 400, &hints).is_null());
    }

    #[test]
    fn failed_arrange_commits_nothing() {
        let (_device, pool, hints) = small_pool(1024);
        pool.arrange_vdata(&[mesh(nonzero!(4u32), 16, 400)], true, &hints)
            .unwrap();
        let vb_free = pool.free_chunks(1);
        let ib_free = pool.free_chunks(IDX_IB);
        let used = (pool.pool_size(1).get_used(), pool.pool_size(IDX_IB).get_used());

        // the vertex part fits, the index part does not
        let res = pool.arrange_vdata(&[mesh(nonzero!(4u32), 16, 200)], true, &hints);
        assert_eq!(res, Err(Shortage { vb: 0, ib: 176 }));
        assert_eq!(pool.free_chunks(1), vb_free);
        assert_eq!(pool.free_chunks(IDX_IB), ib_free);
        assert_eq!(
            (pool.pool_size(1).get_used(), pool.pool_size(IDX_IB).get_used()),
            used
        );
    }

    #[test]
    fn alloc_release_round_trip() {
        let (_device, pool, hints) = small_pool(4096);
        let keep = pool.alloc_chunk_for_stride(8, 512, &hints);
        assert!(!keep.is_null());
        let before = pool.free_chunks(1);
        let used = pool.pool_size(1).get_used();

        let c = pool.alloc_chunk_for_stride(8, 800, &hints);
        assert_eq!(c.ofs(), 512);
        pool.release_buf_chunk(&[c], true);
        assert_eq!(pool.free_chunks(1), before);
        assert_eq!(pool.pool_size(1).get_used(), used);
    }

    #[test]
    fn released_neighbours_coalesce() {
        let (_device, pool, hints) = small_pool(4096);
        let a = pool.alloc_chunk_for_stride(2, 100, &hints);
        let b = pool.alloc_chunk_for_stride(2, 150, &hints);
        let _tail = pool.alloc_chunk_for_stride(2, 3000, &hints);
        assert_eq!((a.ofs(), a.end(), b.end()), (0, 100, 250));
        pool.release_buf_chunk(&[a], true);
        pool.release_buf_chunk(&[b], true);
        assert_eq!(pool.free_chunks(1)[0], BufChunk::new(0, 250, 1).unwrap());
    }

    #[test]
    fn growth_keeps_contents() {
        let (device, pool, mut hints) = small_pool(1 << 20);
        hints.sizes = [256; MAX_VBIDX_CNT];
        let lod = mesh(nonzero!(4u32), 32, 0);
        let chunks = pool.arrange_vdata(&[lod.clone()], true, &hints).unwrap();
        let placed = pool.layout_vdata(&[lod.clone()], &chunks).unwrap();
        let (vd, loc) = &placed[0];
        vd.set_location(Some(*loc));
        let bytes = VdataBytes {
            vertices: (0..128).map(|i| i as u8).collect(),
            indices: vec![],
        };
        pool.write_vdata(vd, *loc, &bytes).unwrap();
        let old_vb = pool.vb(1).unwrap();

        pool.arrange_vdata(&[mesh(nonzero!(4u32), 200, 0)], true, &hints)
            .unwrap();
        assert!(pool.pool_size(1).get_size() > 256);
        assert_ne!(pool.vb(1).unwrap(), old_vb);
        assert_eq!(pool.read_vdata(vd).unwrap(), bytes);
        // the old buffer is gone, only the new vb remains
        assert_eq!(device.buffer_count(), 1);
    }

    #[test]
    fn forced_arrange_ignores_max() {
        let (_device, pool, hints) = small_pool(1024);
        assert!(pool
            .arrange_vdata(&[mesh(nonzero!(4u32), 1000, 0)], true, &hints)
            .is_err());
        let chunks = pool
            .arrange_vdata(&[mesh(nonzero!(4u32), 1000, 0)], false, &hints)
            .unwrap();
        assert_eq!(chunks[0].sz(), 4000);
        assert!(pool.pool_size(1).get_size() >= 4000);
    }

    #[test]
    fn no_growth_without_rebuild() {
        let (_device, pool, mut hints) = small_pool(1 << 20);
        hints.sizes = [256; MAX_VBIDX_CNT];
        pool.set_allow_rebuild(false);
        assert!(!pool.alloc_chunk_for_stride(4, 200, &hints).is_null());
        assert!(pool.alloc_chunk_for_stride(4, 200, &hints).is_null());
    }

    #[test]
    fn strides_get_own_slots() {
        let (_device, pool, hints) = small_pool(1 << 16);
        let lods = [
            mesh(nonzero!(12u32), 10, 6),
            mesh(nonzero!(16u32), 10, 6),
            mesh(nonzero!(12u32), 5, 3),
        ];
        let chunks = pool.arrange_vdata(&lods, true, &hints).unwrap();
        assert_eq!(pool.vb_count(), 2);
        assert_eq!(chunks.len(), 3);
        let placed = pool.layout_vdata(&lods, &chunks).unwrap();
        let locs: Vec<_> = placed.iter().map(|(_, l)| *l).collect();
        assert_eq!(
            locs,
            vec![
                VdataLocation { vb_idx: 1, vb_ofs: 0, ib_ofs: 0 },
                VdataLocation { vb_idx: 2, vb_ofs: 0, ib_ofs: 12 },
                VdataLocation { vb_idx: 1, vb_ofs: 120, ib_ofs: 24 },
            ]
        );
    }

    #[test]
    fn separate_chunks_by_lod() {
        let (_device, pool, hints) = small_pool(1 << 16);
        let lods = [mesh(nonzero!(8u32), 100, 30), mesh(nonzero!(8u32), 20, 6)];
        let chunks = pool.arrange_vdata(&lods, true, &hints).unwrap();
        let (c1, c2) = pool.get_separate_chunks(&lods, 1, &chunks);
        assert_eq!(
            c1,
            vec![
                BufChunk::new(0, 800, 1).unwrap(),
                BufChunk::new(0, 60, 0).unwrap()
            ]
        );
        assert_eq!(c2[0].ofs(), 800);
        assert_eq!(c2[1].ofs(), 60);
        let total: u32 = c1.iter().chain(&c2).map(|c| c.sz()).sum();
        assert_eq!(total, chunks.iter().map(|c| c.sz()).sum::<u32>());
    }

    #[test]
    fn free_list_overflow_is_counted() {
        let (_device, pool, hints) = small_pool(4096);
        let chunks: Vec<_> = (0..70)
            .map(|_| pool.alloc_chunk_for_stride(4, 16, &hints))
            .collect();
        let every_other: Vec<_> = chunks.iter().step_by(2).take(32).copied().collect();
        pool.release_buf_chunk(&every_other, true);
        assert_eq!(pool.lost_chunks(), 1);
        assert_eq!(pool.lost_bytes(), 16);
        assert!(pool.stat_str().contains("lost"));
    }

    #[test]
    fn clear_keeps_slot_layout() {
        let (device, pool, hints) = small_pool(1 << 16);
        pool.arrange_vdata(&[mesh(nonzero!(12u32), 10, 6), mesh(nonzero!(32u32), 4, 0)], true, &hints)
            .unwrap();
        pool.clear();
        assert_eq!(device.buffer_count(), 0);
        assert_eq!(pool.slot_stride(2), Some(32));
        assert_eq!(pool.pool_size(1).get_size(), 0);

        let mut tight = hints;
        tight.sizes = [0; MAX_VBIDX_CNT];
        tight.sizes[2] = 128;
        assert!(pool.create_sbuffers(&tight, true));
        assert_eq!(pool.pool_size(2).get_size(), 128);
        assert_eq!(device.buffer_count(), 1);
    }

    #[test]
    fn used_size_str() {
        let chunks = [
            BufChunk::new(0, 2048, 0).unwrap(),
            BufChunk::new(0, 100, 2).unwrap(),
        ];
        assert_eq!(BufPool::calc_used_size_str(&chunks), "ib 2.0K vb1 100B");
    }

    #[test]
    fn growth_with_full_free_list_keeps_tail() {
        let (_device, pool, mut hints) = small_pool(1 << 16);
        hints.sizes = [4096; MAX_VBIDX_CNT];
        let chunks: Vec<_> = (0..253)
            .map(|_| pool.alloc_chunk_for_stride(4, 16, &hints))
            .collect();
        assert_eq!(pool.pool_size(1).get_size(), 4096);
        let holes: Vec<_> = chunks.iter().step_by(2).take(MAX_CHUNK_CNT).copied().collect();
        pool.release_buf_chunk(&holes, true);
        assert_eq!(pool.free_chunks(1).len(), MAX_CHUNK_CNT);
        let used = pool.pool_size(1).get_used();

        let big = pool.alloc_chunk_for_stride(4, 1000, &hints);
        assert_eq!(big, BufChunk::new(4096, 1000, 1).unwrap());
        assert_eq!(pool.pool_size(1).get_size(), 5096);
        assert_eq!(pool.pool_size(1).get_used(), used + 1000);
        assert_eq!(pool.lost_chunks(), 0);

        let forced = pool.arrange_vdata(&[mesh(nonzero!(4u32), 100, 0)], false, &hints).unwrap();
        assert_eq!(forced, vec![BufChunk::new(5096, 400, 1).unwrap()]);
        assert_eq!(pool.lost_bytes(), 0);
    }

    #[test]
    fn forced_arrange_keeps_small_remainders() {
        let (_device, pool, hints) = small_pool(1 << 16);
        let mut tight = hints;
        tight.sizes = [0; MAX_VBIDX_CNT];
        tight.sizes[1] = 880;
        pool.required_sizes(&[mesh(nonzero!(8u32), 1, 0)]);
        assert!(pool.create_sbuffers(&tight, true));

        let a = pool.arrange_vdata(&[mesh(nonzero!(8u32), 100, 0)], false, &tight).unwrap();
        let b = pool.arrange_vdata(&[mesh(nonzero!(8u32), 10, 0)], false, &tight).unwrap();
        assert_eq!(a, vec![BufChunk::new(0, 800, 1).unwrap()]);
        assert_eq!(b, vec![BufChunk::new(800, 80, 1).unwrap()]);
        assert_eq!(pool.pool_size(1).get_size(), 880);
    }

    #[test]
    fn slack_goes_back_to_free_list() {
        let (_device, pool, mut hints) = small_pool(1 << 16);
        hints.sizes = [944; MAX_VBIDX_CNT];
        let lod = mesh(nonzero!(8u32), 110, 0);
        let chunks = pool.arrange_vdata(&[lod.clone()], true, &hints).unwrap();
        assert_eq!(chunks, vec![BufChunk::new(0, 944, 1).unwrap()]);

        let filled = pool.release_slack(&[lod], &chunks);
        assert_eq!(filled, vec![BufChunk::new(0, 880, 1).unwrap()]);
        assert_eq!(pool.pool_size(1).get_used(), 880);
        assert_eq!(pool.free_chunks(1), vec![BufChunk::new(880, 64, 1).unwrap()]);
    }

    #[test]
    fn oversized_request_is_a_shortage() {
        let (_device, pool, hints) = small_pool(1 << 16);
        let huge = mesh(nonzero!(64u32), 1 << 27, 0);
        assert_eq!(huge.data()[0].vb_size(), u32::MAX);
        match pool.arrange_vdata(&[huge.clone()], false, &hints) {
            Err(short) => assert!(short.vb > 0),
            Ok(chunks) => panic!("granted {chunks:?}"),
        }
        assert!(pool.alloc_chunk_for_stride(4, u32::MAX, &hints).is_null());
        assert_eq!(pool.required_sizes(&[huge, mesh(nonzero!(64u32), 1, 0)])[1], u32::MAX);
        assert_eq!(pool.pool_size(1).get_used(), 0);
    }
}

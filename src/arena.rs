//! The resource arena: which resources are packed into the shared buffers, and keeping their
//! published locations valid through eviction, reloads, rebuilds and device resets.
//!
//! Lock order is always arena state first, then the pool. The pool never calls back into the
//! arena, and relem update notifications are fired only after the arena lock is released.

mod rebuild;
mod reload;

use std::{
    fmt::Write,
    ops::Range,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Condvar, Mutex, MutexGuard,
    },
};

use ahash::{AHashMap, AHashSet};
use anyhow::{anyhow, bail};
use thiserror::Error;

use crate::{
    chunk::BufChunk,
    config::BufConfig,
    device::{BufferDevice, BufferHandle},
    event::MulticastEvent,
    jobs::JobQueue,
    pool::{fmt_size, BufPool, Shortage, IDX_IB},
    resource::UnitedResource,
    vdata::{unique_vdata, MeshVdata, VdataBytes, VertexData},
};

use reload::ReloadJob;

/// Discard attempts in a row that freed nothing before discarding stops trying.
const MAX_USELESS_DISCARD_ATTEMPTS: u32 = 4;

#[derive(Error, Debug)]
pub enum ArenaError {
    #[error("shared buffers are full: {} vertex and {} index bytes short", .0.vb, .0.ib)]
    OutOfSpace(Shortage),
    #[error("resource deletion is not enabled")]
    DelResNotAllowed,
    #[error("resource is not registered")]
    NotRegistered,
    #[error("failed to load vertex data: {0:#}")]
    Load(anyhow::Error),
    #[error("device failure: {0:#}")]
    Device(anyhow::Error),
}

/// Vertex data objects with their contents, each object once.
type Staged = Vec<(Arc<VertexData>, VdataBytes)>;

type BytesByVdata<'a> = AHashMap<*const VertexData, &'a VdataBytes>;

struct ResEntry<R> {
    res: Arc<R>,
    /// Granted chunks per LOD. Only kept while resource deletion is allowed.
    chunks: Vec<Vec<BufChunk>>,
}

/// A resource about to be (re)placed, with the bytes of its LODs `first..`.
struct Pending<R> {
    res: Arc<R>,
    first: usize,
    staged: Staged,
}

impl<R: UnitedResource> Pending<R> {
    fn lods(&self) -> &[Arc<MeshVdata>] {
        &self.res.lods()[self.first..]
    }
}

struct ArenaState<R> {
    entries: Vec<ResEntry<R>>,
    failed_reload: Vec<Arc<R>>,
    useless_discard_attempts: u32,
    max_vb_used: u64,
    max_ib_used: u64,
    /// Set between the two halves of a device reset.
    in_reset: bool,
}

impl<R> ArenaState<R> {
    fn position(&self, res: &Arc<R>) -> Option<usize> {
        self.entries.iter().position(|e| Arc::ptr_eq(&e.res, res))
    }
}

pub struct UnitedVdata<R: UnitedResource> {
    name: String,
    pool: BufPool,
    jobs: Arc<dyn JobQueue>,
    /// The append lock.
    state: Mutex<ArenaState<R>>,
    reset_done: Condvar,
    hints: Mutex<BufConfig>,
    allow_sep_tight: AtomicBool,
    pending_reload: AtomicU32,
    pending_rebuild: AtomicU32,
    vb_size_to_free: AtomicU32,
    ib_size_to_free: AtomicU32,
    on_mesh_relems_updated: MulticastEvent<R>,
}

impl<R: UnitedResource> UnitedVdata<R> {
    pub fn new(name: &str, device: Arc<dyn BufferDevice>, jobs: Arc<dyn JobQueue>) -> Arc<Self> {
        Arc::new(UnitedVdata {
            name: name.to_owned(),
            pool: BufPool::new(name, device),
            jobs,
            state: Mutex::new(ArenaState {
                entries: vec![],
                failed_reload: vec![],
                useless_discard_attempts: 0,
                max_vb_used: 0,
                max_ib_used: 0,
                in_reset: false,
            }),
            reset_done: Condvar::new(),
            hints: Mutex::new(BufConfig::default()),
            allow_sep_tight: AtomicBool::new(false),
            pending_reload: AtomicU32::new(0),
            pending_rebuild: AtomicU32::new(0),
            vb_size_to_free: AtomicU32::new(0),
            ib_size_to_free: AtomicU32::new(0),
            on_mesh_relems_updated: MulticastEvent::new(),
        })
    }

    /// Takes the append lock once no device reset is in progress.
    fn lock_append(&self) -> MutexGuard<'_, ArenaState<R>> {
        self.reset_done
            .wait_while(self.state.lock().unwrap(), |st| st.in_reset)
            .unwrap()
    }

    fn tracking(&self) -> bool {
        self.pool.allow_del_res()
    }

    fn notify(&self, updated: &[Arc<R>]) {
        let mut seen = AHashSet::new();
        for res in updated.iter().filter(|r| seen.insert(Arc::as_ptr(*r))) {
            self.on_mesh_relems_updated.fire(res);
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &BufPool {
        &self.pool
    }

    /// Fired for every resource whose render elements were rebased.
    pub fn on_mesh_relems_updated(&self) -> &MulticastEvent<R> {
        &self.on_mesh_relems_updated
    }

    pub fn hints(&self) -> BufConfig {
        *self.hints.lock().unwrap()
    }

    pub fn set_hints(&self, hints: BufConfig) {
        *self.hints.lock().unwrap() = hints;
    }

    pub fn set_max_vb_size(&self, max_sz: u32) {
        self.pool.set_max_vb_size(max_sz)
    }

    pub fn set_rebuild_allowed(&self, allow: bool) {
        self.pool.set_allow_rebuild(allow)
    }

    /// Lets rebuilds give every resource its own chunks instead of one shared run.
    pub fn set_sep_tight_vdata_allowed(&self, allow: bool) {
        self.allow_sep_tight.store(allow, Ordering::Release)
    }

    /// Enables per-resource chunk tracking, which [`UnitedVdata::del_res`] needs. Can only be
    /// changed while no resources are registered.
    pub fn set_del_res_allowed(&self, allow: bool) -> bool {
        let st = self.lock_append();
        if !st.entries.is_empty() && allow != self.tracking() {
            log::warn!(
                "{}: cannot change deletion support with {} resources registered",
                self.name,
                st.entries.len()
            );
            return false;
        }
        self.pool.set_allow_del_res(allow);
        true
    }

    /// Asks the next discard to free at least this many bytes.
    pub fn request_mem_to_free(&self, vb: u32, ib: u32) {
        self.vb_size_to_free.fetch_max(vb, Ordering::AcqRel);
        self.ib_size_to_free.fetch_max(ib, Ordering::AcqRel);
    }

    pub fn res_count(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn is_registered(&self, res: &Arc<R>) -> bool {
        self.state.lock().unwrap().position(res).is_some()
    }

    pub fn pending_reload_res_count(&self) -> u32 {
        self.pending_reload.load(Ordering::Acquire)
    }

    pub fn pending_rebuild_count(&self) -> u32 {
        self.pending_rebuild.load(Ordering::Acquire)
    }

    pub fn failed_reload_res_count(&self) -> usize {
        self.state.lock().unwrap().failed_reload.len()
    }

    pub fn useless_discard_attempts(&self) -> u32 {
        self.state.lock().unwrap().useless_discard_attempts
    }

    pub fn ib(&self) -> Option<BufferHandle> {
        self.pool.ib()
    }

    pub fn vb(&self, idx: usize) -> Option<BufferHandle> {
        self.pool.vb(idx)
    }

    /// Highest vertex and index bytes in use seen so far.
    pub fn max_used(&self) -> (u64, u64) {
        let st = self.state.lock().unwrap();
        (st.max_vb_used, st.max_ib_used)
    }

    pub fn update_local_maximum(&self) {
        let mut st = self.state.lock().unwrap();
        self.update_local_maximum_locked(&mut st);
    }

    fn update_local_maximum_locked(&self, st: &mut ArenaState<R>) {
        let vb = self.pool.vb_used();
        let ib = self.pool.ib_used();
        if vb > st.max_vb_used || ib > st.max_ib_used {
            st.max_vb_used = st.max_vb_used.max(vb);
            st.max_ib_used = st.max_ib_used.max(ib);
            log::debug!(
                "{}: new peak usage vb {} ib {}",
                self.name,
                fmt_size(st.max_vb_used),
                fmt_size(st.max_ib_used)
            );
        }
    }

    /// Places every LOD from `requested_lod()` down of each resource and registers them.
    ///
    /// Runs a discard and then a rebuild when space is short. Either all resources of the batch
    /// end up registered or none do.
    pub fn add_res(self: &Arc<Self>, res: &[Arc<R>]) -> Result<(), ArenaError> {
        let mut batch = Vec::with_capacity(res.len());
        for r in res {
            let lods = r.lods().len();
            let first = r.requested_lod().min(lods.saturating_sub(1));
            let staged = load_lods(&**r, first..lods).map_err(ArenaError::Load)?;
            batch.push(Pending {
                res: r.clone(),
                first,
                staged,
            });
        }

        let mut updated = vec![];
        let result = {
            let mut st = self.lock_append();
            batch.retain(|p| {
                let registered = st.position(&p.res).is_some();
                if registered {
                    log::warn!("{}: resource is already registered", self.name);
                }
                !registered
            });
            self.add_locked(&mut st, batch, &mut updated)
        };
        self.notify(&updated);
        result
    }

    fn add_locked(
        self: &Arc<Self>,
        st: &mut ArenaState<R>,
        batch: Vec<Pending<R>>,
        updated: &mut Vec<Arc<R>>,
    ) -> Result<(), ArenaError> {
        if batch.is_empty() {
            return Ok(());
        }
        let per_res = self.tracking();
        let mut tabs = self.arrange_batch(&batch, per_res, true);
        if let Err(short) = tabs {
            log::debug!(
                "{}: {} vb / {} ib bytes short, discarding unused lods",
                self.name,
                short.vb,
                short.ib
            );
            self.request_mem_to_free(short.vb, short.ib);
            self.discard_locked(st, updated);
            tabs = self.arrange_batch(&batch, per_res, true);
        }
        if tabs.is_err() && self.pool.allow_rebuild() {
            log::debug!("{}: rebuilding to reclaim fragmented space", self.name);
            if let Err(e) = self.rebuild_locked(st, false, updated) {
                log::error!("{}: {e}", self.name);
            }
            tabs = self.arrange_batch(&batch, per_res, true);
        }
        let tabs = tabs.map_err(|short| {
            log::warn!(
                "{}: cannot add {} resources, {} vb / {} ib bytes short",
                self.name,
                batch.len(),
                short.vb,
                short.ib
            );
            ArenaError::OutOfSpace(short)
        })?;

        let entries = self
            .commit(batch, tabs, per_res, updated)
            .map_err(ArenaError::Device)?;
        log::debug!("{}: added {} resources", self.name, entries.len());
        st.entries.extend(entries);
        st.useless_discard_attempts = 0;
        self.update_local_maximum_locked(st);
        Ok(())
    }

    /// Grants chunks for every pending item, one tab per item when `per_res` and a single shared
    /// tab otherwise. Nothing stays committed on failure.
    fn arrange_batch(
        &self,
        batch: &[Pending<R>],
        per_res: bool,
        can_fail: bool,
    ) -> Result<Vec<Vec<BufChunk>>, Shortage> {
        let hints = self.hints();
        if !per_res {
            let list: Vec<_> = batch.iter().flat_map(|p| p.lods().iter().cloned()).collect();
            return self
                .pool
                .arrange_vdata(&list, can_fail, &hints)
                .map(|tab| vec![tab]);
        }
        let mut tabs = Vec::with_capacity(batch.len());
        for p in batch {
            match self.pool.arrange_vdata(p.lods(), can_fail, &hints) {
                Ok(tab) => tabs.push(tab),
                Err(short) => {
                    for tab in &tabs {
                        self.pool.release_buf_chunk(tab, true);
                    }
                    return Err(short);
                }
            }
        }
        Ok(tabs)
    }

    /// Uploads and publishes a batch whose chunks were granted by [`Self::arrange_batch`].
    /// Releases the chunks on failure.
    fn commit(
        &self,
        batch: Vec<Pending<R>>,
        tabs: Vec<Vec<BufChunk>>,
        per_res: bool,
        updated: &mut Vec<Arc<R>>,
    ) -> anyhow::Result<Vec<ResEntry<R>>> {
        let bytes: BytesByVdata = batch
            .iter()
            .flat_map(|p| p.staged.iter())
            .map(|(vd, b)| (Arc::as_ptr(vd), b))
            .collect();
        let shared_list: Vec<Arc<MeshVdata>>;
        let groups: Vec<(&[Arc<MeshVdata>], &[BufChunk])> = if per_res {
            batch
                .iter()
                .zip(&tabs)
                .map(|(p, tab)| (p.lods(), tab.as_slice()))
                .collect()
        } else {
            shared_list = batch.iter().flat_map(|p| p.lods().iter().cloned()).collect();
            tabs.iter()
                .map(|tab| (shared_list.as_slice(), tab.as_slice()))
                .collect()
        };
        if let Err(e) = self.place(&groups, &bytes) {
            for tab in &tabs {
                self.pool.release_buf_chunk(tab, true);
            }
            return Err(e);
        }

        let track = per_res && self.tracking();
        if !track {
            for (list, tab) in &groups {
                self.pool.release_slack(list, tab);
            }
        }
        let mut tabs = tabs.into_iter();
        let mut entries = Vec::with_capacity(batch.len());
        for p in batch {
            let chunks = if track {
                self.split_per_lod(p.res.lods(), p.first, tabs.next().unwrap_or_default())
            } else {
                vec![]
            };
            p.res.set_first_avail_lod(p.first);
            p.res.rebase_elems();
            updated.push(p.res.clone());
            entries.push(ResEntry { res: p.res, chunks });
        }
        Ok(entries)
    }

    /// Lays each list out in its chunk tab, uploads the bytes and publishes the new locations.
    /// Nothing is published on failure.
    fn place(
        &self,
        groups: &[(&[Arc<MeshVdata>], &[BufChunk])],
        bytes: &BytesByVdata,
    ) -> anyhow::Result<()> {
        let mut placed = vec![];
        for (list, tab) in groups {
            for (vd, loc) in self.pool.layout_vdata(list, tab)? {
                let b = bytes
                    .get(&Arc::as_ptr(&vd))
                    .ok_or_else(|| anyhow!("no data staged for a vertex data object"))?;
                self.pool.write_vdata(&vd, loc, b)?;
                placed.push((vd, loc));
            }
        }
        for (vd, loc) in placed {
            vd.set_location(Some(loc));
        }
        Ok(())
    }

    /// Splits a resource's chunk tab into one tab per LOD. LODs before `first` get none and the
    /// last LOD also owns any slack.
    fn split_per_lod(
        &self,
        lods: &[Arc<MeshVdata>],
        first: usize,
        tab: Vec<BufChunk>,
    ) -> Vec<Vec<BufChunk>> {
        let mut per_lod = vec![vec![]; lods.len()];
        let mut rest = tab;
        for lod in first..lods.len().saturating_sub(1) {
            let (head, tail) = self.pool.get_separate_chunks(&lods[lod..], 1, &rest);
            per_lod[lod] = head;
            rest = tail;
        }
        if let Some(last) = per_lod.last_mut() {
            *last = rest;
        }
        per_lod
    }

    /// Removes a resource and returns its chunks to the pool.
    pub fn del_res(&self, res: &Arc<R>) -> Result<(), ArenaError> {
        if !self.tracking() {
            return Err(ArenaError::DelResNotAllowed);
        }
        let mut st = self.lock_append();
        let idx = st.position(res).ok_or(ArenaError::NotRegistered)?;
        let entry = st.entries.remove(idx);
        let chunks: Vec<_> = entry.chunks.into_iter().flatten().collect();
        self.pool.release_buf_chunk(&chunks, true);
        unplace(&**res);
        st.failed_reload.retain(|r| !Arc::ptr_eq(r, res));
        log::debug!(
            "{}: deleted resource, released {}",
            self.name,
            BufPool::calc_used_size_str(&chunks)
        );
        Ok(())
    }

    /// Drops the LODs finer than `upper_lod`. Returns the number of bytes freed.
    pub fn downgrade_res(&self, res: &Arc<R>, upper_lod: usize) -> Result<u64, ArenaError> {
        let freed = {
            let mut st = self.lock_append();
            let idx = st.position(res).ok_or(ArenaError::NotRegistered)?;
            let (vb, ib) = self.drop_lods(&mut st, idx, upper_lod);
            vb + ib
        };
        if freed > 0 {
            self.notify(&[res.clone()]);
        }
        Ok(freed)
    }

    /// Releases LODs finer than `upper_lod` of entry `idx`, always keeping the coarsest one.
    /// Returns the freed vertex and index bytes.
    fn drop_lods(&self, st: &mut ArenaState<R>, idx: usize, upper_lod: usize) -> (u64, u64) {
        let entry = &mut st.entries[idx];
        let res = entry.res.clone();
        let lods = res.lods();
        let first = res.first_avail_lod();
        let upper = upper_lod.min(lods.len().saturating_sub(1));
        if upper <= first || res.is_loading() {
            return (0, 0);
        }

        let chunks: Vec<BufChunk> = if entry.chunks.len() == lods.len() {
            entry.chunks[first..upper]
                .iter_mut()
                .flat_map(std::mem::take)
                .collect()
        } else {
            chunks_of(&lods[first..upper])
        };
        let (vb, ib) = chunks.iter().fold((0u64, 0u64), |(vb, ib), c| {
            if c.vb_idx() == IDX_IB {
                (vb, ib + c.sz() as u64)
            } else {
                (vb + c.sz() as u64, ib)
            }
        });
        self.pool.release_buf_chunk(&chunks, true);
        BufPool::reset_vdata_buf_pointers(&lods[first..upper]);
        res.set_first_avail_lod(upper);
        res.rebase_elems();
        log::debug!(
            "{}: dropped lods {first}..{upper}, freed vb {} ib {}",
            self.name,
            fmt_size(vb),
            fmt_size(ib)
        );
        (vb, ib)
    }

    /// Frees memory by dropping the finest LODs of resources that are neither in use nor
    /// loading, least recently used first. Stops once the amount asked for with
    /// [`Self::request_mem_to_free`] is freed; with no request every such LOD goes.
    ///
    /// Failed reloads are rescheduled first. Returns the number of bytes freed.
    pub fn discard_unused_res_to_free_req_mem(self: &Arc<Self>) -> u64 {
        let mut updated = vec![];
        let freed = {
            let mut st = self.lock_append();
            self.discard_locked(&mut st, &mut updated)
        };
        self.notify(&updated);
        freed
    }

    fn discard_locked(self: &Arc<Self>, st: &mut ArenaState<R>, updated: &mut Vec<Arc<R>>) -> u64 {
        let failed = std::mem::take(&mut st.failed_reload);
        if !failed.is_empty() {
            log::debug!("{}: retrying {} failed reloads", self.name, failed.len());
        }
        for res in failed {
            self.submit_reload(res);
        }

        let need_vb = self.vb_size_to_free.swap(0, Ordering::AcqRel) as u64;
        let need_ib = self.ib_size_to_free.swap(0, Ordering::AcqRel) as u64;
        if st.useless_discard_attempts >= MAX_USELESS_DISCARD_ATTEMPTS {
            let evictable = st.entries.iter().any(|e| {
                let res = &e.res;
                !res.is_in_use()
                    && !res.is_loading()
                    && res.first_avail_lod() + 1 < res.lods().len()
            });
            if !evictable {
                log::debug!(
                    "{}: skipping discard after {} useless attempts",
                    self.name,
                    st.useless_discard_attempts
                );
                return 0;
            }
            st.useless_discard_attempts = 0;
        }
        let unlimited = need_vb == 0 && need_ib == 0;
        let satisfied = |vb: u64, ib: u64| !unlimited && vb >= need_vb && ib >= need_ib;

        let mut order: Vec<usize> = (0..st.entries.len())
            .filter(|&i| {
                let res = &st.entries[i].res;
                !res.is_in_use() && !res.is_loading()
            })
            .collect();
        order.sort_by_key(|&i| st.entries[i].res.last_used());

        let (mut freed_vb, mut freed_ib) = (0, 0);
        'passes: loop {
            let mut progressed = false;
            for &i in &order {
                if satisfied(freed_vb, freed_ib) {
                    break 'passes;
                }
                let res = st.entries[i].res.clone();
                let (vb, ib) = self.drop_lods(st, i, res.first_avail_lod() + 1);
                if vb + ib > 0 {
                    progressed = true;
                    freed_vb += vb;
                    freed_ib += ib;
                    updated.push(res);
                }
            }
            if !progressed {
                break;
            }
        }

        let freed = freed_vb + freed_ib;
        if freed == 0 {
            st.useless_discard_attempts += 1;
            log::debug!(
                "{}: discard freed nothing ({} attempts in a row)",
                self.name,
                st.useless_discard_attempts
            );
        } else {
            st.useless_discard_attempts = 0;
            log::debug!(
                "{}: discard freed vb {} ib {}",
                self.name,
                fmt_size(freed_vb),
                fmt_size(freed_ib)
            );
        }
        freed
    }

    /// Queues a background reload of the resource from its source. Returns false if it is not
    /// registered or already loading.
    pub fn reload_res(self: &Arc<Self>, res: &Arc<R>) -> bool {
        let st = self.state.lock().unwrap();
        st.position(res).is_some() && self.submit_reload(res.clone())
    }

    fn submit_reload(self: &Arc<Self>, res: Arc<R>) -> bool {
        if res.is_loading() {
            return false;
        }
        res.set_loading(true);
        self.pending_reload.fetch_add(1, Ordering::AcqRel);
        self.jobs.submit(Box::new(ReloadJob::new(self, res)));
        true
    }

    /// Unregisters every resource and destroys the buffers. Must not be called during a device
    /// reset.
    pub fn clear(&self) {
        self.jobs.stop_pending_jobs();
        let mut st = self.lock_append();
        for entry in st.entries.drain(..) {
            unplace(&*entry.res);
        }
        st.failed_reload.clear();
        st.useless_discard_attempts = 0;
        self.pool.clear();
        log::debug!("{}: cleared", self.name);
    }

    /// Destroys the buffers if no resource is registered.
    pub fn release_unused_buffers(&self) -> bool {
        let st = self.lock_append();
        if !st.entries.is_empty() {
            return false;
        }
        self.pool.clear();
        true
    }

    /// Stops background jobs and closes the append lock until [`Self::on_after_d3d_reset`].
    ///
    /// Only for an arena that owns its job queue. Arenas sharing a queue are reset through
    /// [`crate::context::UnitedVdataContext`]: stopping the shared queue after another arena's
    /// gate has closed waits on jobs parked at that gate forever.
    pub fn on_before_d3d_reset(&self) {
        self.jobs.stop_pending_jobs();
        self.begin_reset();
    }

    pub(crate) fn begin_reset(&self) {
        let mut st = self.state.lock().unwrap();
        st.in_reset = true;
        log::debug!(
            "{}: device reset, {} resources to restore",
            self.name,
            st.entries.len()
        );
    }

    /// Recreates the buffers from the resources' sources and reopens the append lock.
    pub fn on_after_d3d_reset(&self) {
        let mut updated = vec![];
        {
            let mut st = self.state.lock().unwrap();
            if !st.in_reset {
                log::warn!("{}: device reset finished without having started", self.name);
            }
            if let Err(e) = self.rebuild_locked(&mut st, true, &mut updated) {
                log::error!("{}: {e}", self.name);
            }
            st.in_reset = false;
        }
        self.reset_done.notify_all();
        self.notify(&updated);
    }

    pub fn build_status_str(&self, full_res_list: bool, resolve_name: impl Fn(&R) -> String) -> String {
        let st = self.state.lock().unwrap();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{}: {} resources, {} reloads pending, {} failed, {} rebuilds pending, {} useless discard attempts",
            self.name,
            st.entries.len(),
            self.pending_reload_res_count(),
            st.failed_reload.len(),
            self.pending_rebuild_count(),
            st.useless_discard_attempts
        );
        let _ = writeln!(
            out,
            "peak usage: vb {} ib {}",
            fmt_size(st.max_vb_used),
            fmt_size(st.max_ib_used)
        );
        out.push_str(&self.pool.stat_str());
        if full_res_list {
            for entry in &st.entries {
                let res = &entry.res;
                let lods = res.lods();
                let first = res.first_avail_lod().min(lods.len());
                let placed = &lods[first..];
                let _ = writeln!(
                    out,
                    "  {}: lods {first}..{}{}{} vb {} ib {}",
                    resolve_name(&**res),
                    lods.len(),
                    if res.is_loading() { " loading" } else { "" },
                    if res.is_in_use() { " in use" } else { "" },
                    fmt_size(placed.iter().map(|l| l.vb_bytes()).sum()),
                    fmt_size(placed.iter().map(|l| l.ib_bytes()).sum())
                );
            }
        }
        out
    }

    /// Free ranges of every buffer slot.
    pub fn dump_mem_blocks(&self) -> String {
        let mut out = String::new();
        for idx in 0..=self.pool.vb_count() {
            let size = self.pool.pool_size(idx);
            let _ = write!(
                out,
                "slot {idx}: used {} of {}, free",
                size.get_used(),
                size.get_size()
            );
            for c in self.pool.free_chunks(idx) {
                let _ = write!(out, " [{}, {})", c.ofs(), c.end());
            }
            out.push('\n');
        }
        out
    }
}

/// Chunks occupied by the vertex data of `lods`, derived from the published locations.
fn chunks_of(lods: &[Arc<MeshVdata>]) -> Vec<BufChunk> {
    let mut out = vec![];
    for vd in unique_vdata(lods) {
        if let Some(loc) = vd.location() {
            out.push(BufChunk::new_checked(loc.vb_ofs, vd.vb_size(), loc.vb_idx as usize));
            if vd.ib_footprint() > 0 {
                out.push(BufChunk::new_checked(loc.ib_ofs, vd.ib_footprint(), IDX_IB));
            }
        }
    }
    out
}

/// Forgets where the resource's vertex data lived.
fn unplace<R: UnitedResource>(res: &R) {
    BufPool::reset_vdata_buf_pointers(res.lods());
    res.set_first_avail_lod(res.lods().len());
    res.rebase_elems();
}

fn load_lods<R: UnitedResource>(res: &R, lods: Range<usize>) -> anyhow::Result<Staged> {
    let all = res.lods();
    let mut seen = AHashSet::new();
    let mut out = vec![];
    for lod in lods {
        let bytes = res.load_lod_data(lod)?;
        let data = all[lod].data();
        if bytes.len() != data.len() {
            bail!(
                "lod {lod} loaded {} streams, expected {}",
                bytes.len(),
                data.len()
            );
        }
        for (vd, b) in data.iter().zip(bytes) {
            if seen.insert(Arc::as_ptr(vd)) {
                b.check(vd)?;
                out.push((vd.clone(), b));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        device::HostBufferDevice,
        jobs::{ManualJobQueue, WorkerPool},
        resource::LodsResource,
        vdata::IndexFormat,
    };
    use nonzero_ext::nonzero;
    use std::{
        sync::atomic::AtomicUsize,
        thread,
        time::Duration,
    };

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    /// One 8-byte-stride stream per LOD.
    fn make_res(name: &str, vertex_counts: &[u32], indices: u32) -> Arc<LodsResource> {
        let lods = vertex_counts
            .iter()
            .enumerate()
            .map(|(lod, &vc)| {
                let vd = Arc::new(VertexData::new(nonzero!(8u32), vc, indices, IndexFormat::U16));
                let bytes = VdataBytes {
                    vertices: (0..vc * 8)
                        .map(|i| (i as u8) ^ (lod as u8).wrapping_mul(31) ^ name.len() as u8)
                        .collect(),
                    indices: (0..indices as u16).flat_map(|i| i.to_le_bytes()).collect(),
                };
                vec![(vd, bytes)]
            })
            .collect();
        Arc::new(LodsResource::new(name, lods).unwrap())
    }

    fn arena() -> (
        Arc<HostBufferDevice>,
        Arc<ManualJobQueue>,
        Arc<UnitedVdata<LodsResource>>,
    ) {
        init_log();
        let device = Arc::new(HostBufferDevice::new());
        let jobs = Arc::new(ManualJobQueue::new("test_jobs"));
        let arena = UnitedVdata::new("test", device.clone(), jobs.clone());
        (device, jobs, arena)
    }

    fn assert_contents(arena: &UnitedVdata<LodsResource>, res: &LodsResource) {
        for lod in res.first_avail_lod()..res.lods().len() {
            let expected = res.load_lod_data(lod).unwrap();
            let vd = &res.lods()[lod].data()[0];
            assert_eq!(arena.pool().read_vdata(vd).unwrap(), expected[0], "lod {lod}");
        }
    }

    fn counter(arena: &UnitedVdata<LodsResource>) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        arena.on_mesh_relems_updated().subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[test]
    fn add_places_all_lods() {
        let (_device, _jobs, arena) = arena();
        let fired = counter(&arena);
        let res = make_res("rock", &[100, 40, 10], 30);
        arena.add_res(&[res.clone()]).unwrap();

        assert_eq!(arena.res_count(), 1);
        assert_eq!(res.first_avail_lod(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_contents(&arena, &res);
        assert_eq!(res.relems(1)[0].base_vertex, 100);
        assert_eq!(res.relems(2)[0].start_index, 60);
        assert_eq!(arena.pool().pool_size(1).get_used(), 150 * 8);
        assert_eq!(arena.max_used(), (1200, 180));

        // adding it again changes nothing
        arena.add_res(&[res.clone()]).unwrap();
        assert_eq!(arena.res_count(), 1);
        assert_eq!(arena.pool().pool_size(1).get_used(), 150 * 8);
    }

    #[test]
    fn failed_add_commits_nothing() {
        let (_device, _jobs, arena) = arena();
        arena.set_max_vb_size(1024);
        arena.set_rebuild_allowed(false);
        let big = make_res("big", &[100], 0);
        big.set_in_use(true);
        arena.add_res(&[big.clone()]).unwrap();

        let a = make_res("a", &[10], 0);
        let b = make_res("b", &[40], 0);
        match arena.add_res(&[a.clone(), b.clone()]) {
            Err(ArenaError::OutOfSpace(short)) => assert_eq!(short, Shortage { vb: 176, ib: 0 }),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(arena.res_count(), 1);
        assert!(!arena.is_registered(&a));
        for res in [&a, &b] {
            assert_eq!(res.first_avail_lod(), 1);
            assert!(res.lods()[0].data()[0].location().is_none());
        }
        assert_eq!(arena.pool().pool_size(1).get_used(), 800);
        assert_eq!(arena.useless_discard_attempts(), 1);
    }

    #[test]
    fn repeated_discard_backs_off() {
        let (_device, _jobs, arena) = arena();
        let idle = make_res("idle", &[100, 50, 20], 0);
        let busy = make_res("busy", &[10, 5], 0);
        busy.set_in_use(true);
        arena.add_res(&[idle.clone()]).unwrap();
        arena.add_res(&[busy.clone()]).unwrap();

        assert_eq!(arena.discard_unused_res_to_free_req_mem(), 150 * 8);
        assert_eq!(idle.first_avail_lod(), 2);
        assert_eq!(busy.first_avail_lod(), 0);
        assert_eq!(arena.useless_discard_attempts(), 0);
        assert_contents(&arena, &idle);

        let free = arena.pool().free_chunks(1);
        let used = arena.pool().pool_size(1).get_used();
        assert_eq!(arena.discard_unused_res_to_free_req_mem(), 0);
        assert_eq!(arena.useless_discard_attempts(), 1);
        assert_eq!(arena.discard_unused_res_to_free_req_mem(), 0);
        assert_eq!(arena.useless_discard_attempts(), 2);
        assert_eq!(arena.pool().free_chunks(1), free);
        assert_eq!(arena.pool().pool_size(1).get_used(), used);
    }

    #[test]
    fn backoff_ends_once_something_is_evictable() {
        let (_device, _jobs, arena) = arena();
        let res = make_res("busy", &[10, 5], 0);
        res.set_in_use(true);
        arena.add_res(&[res.clone()]).unwrap();

        for _ in 0..MAX_USELESS_DISCARD_ATTEMPTS + 1 {
            assert_eq!(arena.discard_unused_res_to_free_req_mem(), 0);
        }
        assert_eq!(arena.useless_discard_attempts(), MAX_USELESS_DISCARD_ATTEMPTS);

        res.set_in_use(false);
        assert_eq!(arena.discard_unused_res_to_free_req_mem(), 80);
        assert_eq!(res.first_avail_lod(), 1);
        assert_eq!(arena.useless_discard_attempts(), 0);
    }

    #[test]
    fn untracked_downgrade_returns_slack() {
        let (_device, _jobs, arena) = arena();
        let mut hints = BufConfig::default();
        hints.sizes[1] = 944;
        arena.set_hints(hints);
        let res = make_res("rock", &[100, 10], 0);
        arena.add_res(&[res.clone()]).unwrap();
        assert_eq!(arena.pool().pool_size(1).get_size(), 944);
        assert_eq!(arena.pool().pool_size(1).get_used(), 880);

        assert_eq!(arena.downgrade_res(&res, 1).unwrap(), 800);
        assert_eq!(
            arena.pool().pool_size(1).get_used() as u64,
            res.lods()[1].vb_bytes()
        );
        assert_eq!(
            arena.pool().free_chunks(1),
            vec![
                BufChunk::new(0, 800, 1).unwrap(),
                BufChunk::new(880, 64, 1).unwrap()
            ]
        );
        assert_contents(&arena, &res);
    }

    #[test]
    fn reload_to_coarser_lod_forgets_dropped_lods() {
        let (_device, jobs, arena) = arena();
        let res = make_res("rock", &[100, 40, 10], 0);
        arena.add_res(&[res.clone()]).unwrap();

        res.set_requested_lod(2);
        assert!(arena.reload_res(&res));
        assert_eq!(jobs.run_pending(), 1);
        assert_eq!(res.first_avail_lod(), 2);
        for lod in 0..2 {
            assert!(res.lods()[lod].data()[0].location().is_none(), "lod {lod}");
            assert!(res.relems(lod).is_empty());
        }
        assert!(res.lods()[2].is_placed());
        assert_eq!(arena.pool().pool_size(1).get_used(), 10 * 8);
        assert_contents(&arena, &res);
    }

    #[test]
    fn discard_stops_when_request_met() {
        let (_device, _jobs, arena) = arena();
        let old = make_res("old", &[100, 10], 0);
        let recent = make_res("recent", &[100, 10], 0);
        old.touch(1);
        recent.touch(5);
        arena.add_res(&[old.clone(), recent.clone()]).unwrap();

        arena.request_mem_to_free(400, 0);
        assert_eq!(arena.discard_unused_res_to_free_req_mem(), 800);
        assert_eq!(old.first_avail_lod(), 1);
        assert_eq!(recent.first_avail_lod(), 0);
    }

    #[test]
    fn downgrade_reload_delete() {
        let (_device, jobs, arena) = arena();
        assert!(arena.set_del_res_allowed(true));
        let fired = counter(&arena);
        let res = make_res("tree", &[64, 32, 16], 12);
        arena.add_res(&[res.clone()]).unwrap();
        assert!(!arena.set_del_res_allowed(false));

        assert_eq!(arena.downgrade_res(&res, 2).unwrap(), 96 * 8 + 2 * 24);
        assert_eq!(res.first_avail_lod(), 2);
        assert!(res.relems(0).is_empty());
        assert!(res.lods()[1].data()[0].location().is_none());
        assert_eq!(arena.pool().pool_size(1).get_used(), 16 * 8);

        assert!(arena.reload_res(&res));
        assert!(!arena.reload_res(&res));
        assert_eq!(arena.pending_reload_res_count(), 1);
        assert_eq!(jobs.run_pending(), 1);
        assert_eq!(arena.pending_reload_res_count(), 0);
        assert!(!res.is_loading());
        assert_eq!(res.first_avail_lod(), 0);
        assert_contents(&arena, &res);
        assert_eq!(fired.load(Ordering::SeqCst), 3);

        arena.del_res(&res).unwrap();
        assert!(matches!(arena.del_res(&res), Err(ArenaError::NotRegistered)));
        for idx in 0..=arena.pool().vb_count() {
            let size = arena.pool().pool_size(idx);
            assert_eq!(size.get_used(), 0);
            assert_eq!(
                arena.pool().free_chunks(idx),
                vec![BufChunk::new(0, size.get_size(), idx as u8).unwrap()]
            );
        }
        assert!(arena.release_unused_buffers());
    }

    #[test]
    fn delete_needs_tracking() {
        let (_device, _jobs, arena) = arena();
        let res = make_res("rock", &[10], 0);
        arena.add_res(&[res.clone()]).unwrap();
        assert!(matches!(arena.del_res(&res), Err(ArenaError::DelResNotAllowed)));
        assert!(!arena.release_unused_buffers());
    }

    #[test]
    fn failed_reload_retried_on_discard() {
        let (_device, jobs, arena) = arena();
        let res = make_res("rock", &[50, 10], 0);
        arena.add_res(&[res.clone()]).unwrap();
        arena.downgrade_res(&res, 1).unwrap();

        res.set_source_available(0, false);
        assert!(arena.reload_res(&res));
        jobs.run_pending();
        assert_eq!(arena.failed_reload_res_count(), 1);
        assert!(!res.is_loading());
        assert_eq!(res.first_avail_lod(), 1);
        assert_contents(&arena, &res);

        res.set_source_available(0, true);
        arena.discard_unused_res_to_free_req_mem();
        assert_eq!(arena.failed_reload_res_count(), 0);
        assert_eq!(jobs.run_pending(), 1);
        assert_eq!(res.first_avail_lod(), 0);
        assert_contents(&arena, &res);
    }

    #[test]
    fn rebuild_packs_tightly() {
        let (device, jobs, arena) = arena();
        let fired = counter(&arena);
        let a = make_res("a", &[100], 6);
        let b = make_res("bb", &[30], 6);
        arena.add_res(&[a.clone()]).unwrap();
        arena.add_res(&[b.clone()]).unwrap();
        fired.store(0, Ordering::SeqCst);

        arena.schedule_rebuild();
        assert_eq!(arena.pending_rebuild_count(), 1);
        jobs.run_pending();
        assert_eq!(arena.pending_rebuild_count(), 0);

        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(arena.pool().pool_size(1).get_size(), 130 * 8);
        assert_eq!(arena.pool().pool_size(0).get_size(), 24);
        assert_eq!(device.total_bytes(), 130 * 8 + 24);
        assert_contents(&arena, &a);
        assert_contents(&arena, &b);
        assert!(arena.build_status_str(true, |r| r.name().to_owned()).contains("bb: lods 0..1"));
    }

    #[test]
    fn tracked_rebuild_is_tight() {
        let (_device, _jobs, arena) = arena();
        assert!(arena.set_del_res_allowed(true));
        let a = make_res("a", &[100], 0);
        let b = make_res("bb", &[10], 0);
        arena.add_res(&[a.clone()]).unwrap();
        arena.add_res(&[b.clone()]).unwrap();
        assert!(arena.pool().pool_size(1).get_size() > 880);

        arena.rebuild_united_vdata().unwrap();
        assert_eq!(arena.pool().pool_size(1).get_size(), 880);
        assert_eq!(arena.pool().pool_size(1).get_used(), 880);
        assert_contents(&arena, &a);
        assert_contents(&arena, &b);

        arena.del_res(&a).unwrap();
        assert_eq!(arena.pool().pool_size(1).get_used(), 80);
    }

    #[test]
    fn reload_waits_for_device_reset() {
        init_log();
        let device = Arc::new(HostBufferDevice::new());
        let jobs = Arc::new(WorkerPool::new("reset_jobs", 2).unwrap());
        let arena = UnitedVdata::<LodsResource>::new("test", device.clone(), jobs.clone());
        let res = make_res("rock", &[64, 32, 16], 12);
        arena.add_res(&[res.clone()]).unwrap();
        arena.downgrade_res(&res, 2).unwrap();

        arena.on_before_d3d_reset();
        device.lose_device();
        assert!(arena.reload_res(&res));
        thread::sleep(Duration::from_millis(50));
        // the job is parked on the reset gate and has touched nothing
        assert!(res.is_loading());
        assert_eq!(res.first_avail_lod(), 2);
        assert_eq!(device.buffer_count(), 0);

        arena.on_after_d3d_reset();
        jobs.wait_idle();
        assert!(!res.is_loading());
        assert_eq!(arena.pending_reload_res_count(), 0);
        assert_eq!(res.first_avail_lod(), 0);
        assert_contents(&arena, &res);
    }

    #[test]
    fn unrestorable_resource_parked_after_reset() {
        let (device, jobs, arena) = arena();
        let res = make_res("rock", &[20], 0);
        let other = make_res("other", &[10], 0);
        arena.add_res(&[res.clone(), other.clone()]).unwrap();

        arena.on_before_d3d_reset();
        device.lose_device();
        res.set_source_available(0, false);
        arena.on_after_d3d_reset();
        assert_eq!(arena.failed_reload_res_count(), 1);
        assert_eq!(res.first_avail_lod(), 1);
        assert_eq!(other.first_avail_lod(), 0);
        assert_contents(&arena, &other);

        res.set_source_available(0, true);
        arena.discard_unused_res_to_free_req_mem();
        jobs.run_pending();
        assert_eq!(res.first_avail_lod(), 0);
        assert_contents(&arena, &res);
        assert_contents(&arena, &other);
    }
}

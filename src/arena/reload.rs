use std::sync::{atomic::Ordering, Arc, Weak};

use crate::{
    jobs::Job,
    pool::BufPool,
    resource::UnitedResource,
};

use super::{chunks_of, load_lods, ArenaError, ArenaState, BytesByVdata, Staged, UnitedVdata};

/// Reloads one resource from its source into fresh chunks.
pub(super) struct ReloadJob<R: UnitedResource> {
    arena: Weak<UnitedVdata<R>>,
    res: Arc<R>,
}

impl<R: UnitedResource> ReloadJob<R> {
    pub(super) fn new(arena: &Arc<UnitedVdata<R>>, res: Arc<R>) -> Self {
        ReloadJob {
            arena: Arc::downgrade(arena),
            res,
        }
    }
}

impl<R: UnitedResource> Job for ReloadJob<R> {
    fn run(self: Box<Self>) {
        match self.arena.upgrade() {
            Some(arena) => arena.run_reload(&self.res),
            None => self.res.set_loading(false),
        }
    }

    fn cancel(self: Box<Self>) {
        self.res.set_loading(false);
        if let Some(arena) = self.arena.upgrade() {
            arena.pending_reload.fetch_sub(1, Ordering::AcqRel);
            log::debug!("{}: reload cancelled", arena.name);
        }
    }
}

impl<R: UnitedResource> UnitedVdata<R> {
    fn run_reload(self: &Arc<Self>, res: &Arc<R>) {
        let lods = res.lods().len();
        let first = res.requested_lod().min(lods.saturating_sub(1));
        // the source is read before taking the append lock
        let staged = load_lods(&**res, first..lods);

        let mut updated = vec![];
        {
            let mut st = self.lock_append();
            let result = staged.and_then(|staged| self.reload_locked(&mut st, res, first, staged, &mut updated));
            match result {
                Ok(true) => log::debug!("{}: reloaded lods {first}..{lods}", self.name),
                Ok(false) => log::debug!("{}: reloaded resource is no longer registered", self.name),
                Err(e) => {
                    log::warn!("{}: reload failed: {e:#}", self.name);
                    if st.position(res).is_some() && !st.failed_reload.iter().any(|r| Arc::ptr_eq(r, res)) {
                        st.failed_reload.push(res.clone());
                    }
                }
            }
            res.set_loading(false);
            self.pending_reload.fetch_sub(1, Ordering::AcqRel);
        }
        self.notify(&updated);
    }

    /// Places LODs `first..` of a registered resource in new chunks and releases the old ones.
    /// Returns false if the resource is not registered.
    fn reload_locked(
        self: &Arc<Self>,
        st: &mut ArenaState<R>,
        res: &Arc<R>,
        first: usize,
        staged: Staged,
        updated: &mut Vec<Arc<R>>,
    ) -> anyhow::Result<bool> {
        let idx = match st.position(res) {
            Some(idx) => idx,
            None => return Ok(false),
        };
        let hints = self.hints();
        let lods = res.lods();
        let list = &lods[first..];

        // old and new data coexist until the swap
        let mut tab = self.pool.arrange_vdata(list, true, &hints);
        if let Err(short) = tab {
            self.request_mem_to_free(short.vb, short.ib);
            self.discard_locked(st, updated);
            tab = self.pool.arrange_vdata(list, true, &hints);
        }
        let tab = tab.map_err(ArenaError::OutOfSpace)?;

        let old_first = res.first_avail_lod().min(lods.len());
        let old_chunks = match &st.entries[idx].chunks {
            chunks if chunks.len() == lods.len() => chunks.iter().flatten().copied().collect(),
            _ => chunks_of(&lods[old_first..]),
        };

        let bytes: BytesByVdata = staged.iter().map(|(vd, b)| (Arc::as_ptr(vd), b)).collect();
        if let Err(e) = self.place(&[(list, tab.as_slice())], &bytes) {
            self.pool.release_buf_chunk(&tab, true);
            return Err(e);
        }
        log::debug!(
            "{}: swapping {} for {}",
            self.name,
            BufPool::calc_used_size_str(&old_chunks),
            BufPool::calc_used_size_str(&tab)
        );
        self.pool.release_buf_chunk(&old_chunks, true);
        if first > old_first {
            BufPool::reset_vdata_buf_pointers(&lods[old_first..first]);
        }

        st.entries[idx].chunks = if self.tracking() {
            self.split_per_lod(lods, first, tab)
        } else {
            self.pool.release_slack(list, &tab);
            vec![]
        };
        res.set_first_avail_lod(first);
        res.rebase_elems();
        updated.push(res.clone());
        self.update_local_maximum_locked(st);
        Ok(true)
    }
}

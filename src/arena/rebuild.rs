use std::sync::{atomic::Ordering, Arc, Weak};

use anyhow::anyhow;

use crate::{
    jobs::Job,
    resource::UnitedResource,
    vdata::{unique_vdata, MeshVdata},
};

use super::{load_lods, unplace, ArenaError, ArenaState, Pending, ResEntry, Staged, UnitedVdata};

/// A deferred [`UnitedVdata::rebuild_united_vdata`].
struct RebuildJob<R: UnitedResource> {
    arena: Weak<UnitedVdata<R>>,
}

impl<R: UnitedResource> Job for RebuildJob<R> {
    fn run(self: Box<Self>) {
        if let Some(arena) = self.arena.upgrade() {
            if let Err(e) = arena.rebuild_united_vdata() {
                log::error!("{}: scheduled rebuild failed: {e}", arena.name);
            }
            arena.pending_rebuild.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn cancel(self: Box<Self>) {
        if let Some(arena) = self.arena.upgrade() {
            arena.pending_rebuild.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl<R: UnitedResource> UnitedVdata<R> {
    /// Repacks every registered resource into new, tightly sized buffers.
    pub fn rebuild_united_vdata(&self) -> Result<(), ArenaError> {
        let mut updated = vec![];
        let result = {
            let mut st = self.lock_append();
            self.rebuild_locked(&mut st, false, &mut updated)
        };
        self.notify(&updated);
        result
    }

    /// Queues a rebuild on the job queue.
    pub fn schedule_rebuild(self: &Arc<Self>) {
        self.pending_rebuild.fetch_add(1, Ordering::AcqRel);
        self.jobs.submit(Box::new(RebuildJob {
            arena: Arc::downgrade(self),
        }));
    }

    fn read_back(&self, lods: &[Arc<MeshVdata>]) -> anyhow::Result<Staged> {
        unique_vdata(lods)
            .into_iter()
            .map(|vd| self.pool.read_vdata(&vd).map(|bytes| (vd, bytes)))
            .collect()
    }

    /// Stages the data of every registered resource, recreates the buffers at the exact sizes
    /// needed and places everything again.
    ///
    /// After a device reset the old buffers are gone, so data is loaded from the resources'
    /// sources, starting from their requested LOD. Resources that cannot be restored stay
    /// registered with nothing placed and are parked for a later reload.
    pub(super) fn rebuild_locked(
        &self,
        st: &mut ArenaState<R>,
        in_reset: bool,
        updated: &mut Vec<Arc<R>>,
    ) -> Result<(), ArenaError> {
        let mut batch = Vec::with_capacity(st.entries.len());
        let mut lost = vec![];
        for entry in std::mem::take(&mut st.entries) {
            let res = entry.res;
            let lods = res.lods().len();
            let staged = if in_reset {
                let first = res.requested_lod().min(lods.saturating_sub(1));
                load_lods(&*res, first..lods).map(|staged| (first, staged))
            } else {
                let first = res.first_avail_lod().min(lods);
                self.read_back(&res.lods()[first..])
                    .or_else(|_| load_lods(&*res, first..lods))
                    .map(|staged| (first, staged))
            };
            match staged {
                Ok((first, staged)) => batch.push(Pending { res, first, staged }),
                Err(e) => {
                    log::warn!("{}: cannot restore resource data: {e:#}", self.name);
                    lost.push(res);
                }
            }
        }

        let all: Vec<Arc<R>> = batch.iter().map(|p| p.res.clone()).collect();
        let list: Vec<Arc<MeshVdata>> = batch.iter().flat_map(|p| p.lods().iter().cloned()).collect();
        let mut tight = self.hints();
        tight.sizes = self.pool.required_sizes(&list);
        let per_res = self.tracking() || self.allow_sep_tight.load(Ordering::Acquire);

        self.pool.clear();
        let result = if self.pool.create_sbuffers(&tight, true) {
            self.arrange_batch(&batch, per_res, false)
                .map_err(|short| anyhow!(ArenaError::OutOfSpace(short)))
                .and_then(|tabs| self.commit(batch, tabs, per_res, updated))
        } else {
            Err(anyhow!("failed to create buffers"))
        };

        let result = match result {
            Ok(entries) => {
                log::debug!(
                    "{}: rebuilt {} resources{}",
                    self.name,
                    entries.len(),
                    if in_reset { " after device reset" } else { "" }
                );
                st.entries = entries;
                Ok(())
            }
            Err(e) => {
                lost.extend(all);
                Err(ArenaError::Device(e))
            }
        };

        for res in lost {
            unplace(&*res);
            if !st.failed_reload.iter().any(|r| Arc::ptr_eq(r, &res)) {
                st.failed_reload.push(res.clone());
            }
            updated.push(res.clone());
            st.entries.push(ResEntry { res, chunks: vec![] });
        }
        self.update_local_maximum_locked(st);
        result
    }
}

use std::sync::Arc;

use crate::{
    arena::UnitedVdata, device::BufferDevice, jobs::JobQueue, resource::UnitedResource,
};

/// Receives the two halves of a device reset. Buffers are invalid between the calls.
///
/// A single arena's implementation stops the arena's job queue itself, so it must not be used
/// on arenas that share a queue. Reset those through their [`UnitedVdataContext`].
pub trait DeviceResetHandler: Send + Sync {
    fn on_before_reset(&self);
    fn on_after_reset(&self);
}

impl<R: UnitedResource> DeviceResetHandler for UnitedVdata<R> {
    fn on_before_reset(&self) {
        self.on_before_d3d_reset()
    }

    fn on_after_reset(&self) {
        self.on_after_d3d_reset()
    }
}

/// Owns the arena of dynamic models and the arena of rendInst resources for the lifetime of the
/// application. Both share one device and one job queue.
pub struct UnitedVdataContext<Dm: UnitedResource, Ri: UnitedResource> {
    pub dm: Arc<UnitedVdata<Dm>>,
    pub ri: Arc<UnitedVdata<Ri>>,
    jobs: Arc<dyn JobQueue>,
}

impl<Dm: UnitedResource, Ri: UnitedResource> UnitedVdataContext<Dm, Ri> {
    pub fn new(device: Arc<dyn BufferDevice>, jobs: Arc<dyn JobQueue>) -> Self {
        UnitedVdataContext {
            dm: UnitedVdata::new("dm_united_vdata", device.clone(), jobs.clone()),
            ri: UnitedVdata::new("ri_united_vdata", device, jobs.clone()),
            jobs,
        }
    }

    pub fn jobs(&self) -> &Arc<dyn JobQueue> {
        &self.jobs
    }

    pub fn clear(&self) {
        self.dm.clear();
        self.ri.clear();
    }

    pub fn stat_str(&self) -> String {
        format!(
            "{}{}",
            self.dm.build_status_str(false, |_| String::new()),
            self.ri.build_status_str(false, |_| String::new())
        )
    }
}

impl<Dm: UnitedResource, Ri: UnitedResource> DeviceResetHandler for UnitedVdataContext<Dm, Ri> {
    /// The shared queue is stopped once, before either arena closes its gate, so no job is left
    /// waiting on a closed gate while the queue drains.
    fn on_before_reset(&self) {
        self.jobs.stop_pending_jobs();
        self.dm.begin_reset();
        self.ri.begin_reset();
    }

    fn on_after_reset(&self) {
        self.dm.on_after_d3d_reset();
        self.ri.on_after_d3d_reset();
    }
}

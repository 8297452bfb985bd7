//! Packs the vertex and index data of many mesh resources into a few large shared GPU buffers.
//!
//! [`BufPool`] owns the buffers and hands out [`BufChunk`]s from per-buffer free lists.
//! [`UnitedVdata`] decides what gets packed, evicts LODs under memory pressure, reloads and
//! rebuilds in the background and survives device resets.

pub mod arena;
pub mod chunk;
pub mod config;
pub mod context;
pub mod device;
pub mod event;
pub mod jobs;
pub mod pool;
pub mod resource;
pub mod vdata;

pub use arena::{ArenaError, UnitedVdata};
pub use chunk::{BufChunk, ChunkError, FreeList, FreeListFull};
pub use config::{BufConfig, HintsBlock};
pub use context::{DeviceResetHandler, UnitedVdataContext};
pub use device::{BufferDevice, BufferHandle, BufferUsage, HostBufferDevice};
pub use jobs::{Job, JobQueue, ManualJobQueue, WorkerPool};
pub use pool::{BufPool, PoolSize, Shortage};
pub use resource::{LodsResource, UnitedResource};
pub use vdata::{IndexFormat, MeshVdata, VdataBytes, VdataLocation, VertexData};

pub type Result<T> = anyhow::Result<T>;

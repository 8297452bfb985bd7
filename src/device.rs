//! The buffer-creation side of the graphics driver, as seen by the buffer pool.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};

use ahash::AHashMap;
use anyhow::anyhow;
use bitflags::bitflags;

bitflags! {
    pub struct BufferUsage: u32 {
        const INDEX = 1 << 0;
        const VERTEX = 1 << 1;
        const COPY_SRC = 1 << 2;
        const COPY_DST = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferHandle(u64);

impl BufferHandle {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub size: u32,
    pub usage: BufferUsage,
    pub name: &'a str,
}

/// Creates, destroys and transfers into GPU buffers. The pool never talks to the graphics API
/// through anything else.
pub trait BufferDevice: Send + Sync {
    fn create_buffer(&self, desc: &BufferDesc) -> anyhow::Result<BufferHandle>;

    /// Destroying a handle the device no longer knows about (e.g. after a device loss) is a
    /// no-op.
    fn destroy_buffer(&self, handle: BufferHandle);

    fn write_buffer(&self, handle: BufferHandle, offset: u32, data: &[u8]) -> anyhow::Result<()>;

    fn read_buffer(&self, handle: BufferHandle, offset: u32, len: u32) -> anyhow::Result<Vec<u8>>;

    fn copy_buffer(
        &self,
        src: BufferHandle,
        src_offset: u32,
        dst: BufferHandle,
        dst_offset: u32,
        len: u32,
    ) -> anyhow::Result<()>;
}

struct HostBuffer {
    name: String,
    usage: BufferUsage,
    data: Vec<u8>,
}

/// Keeps buffers in system memory. Used by tools, tests and headless runs.
pub struct HostBufferDevice {
    buffers: Mutex<AHashMap<u64, HostBuffer>>,
    next_id: AtomicU64,
    /// Maximum total bytes across all live buffers.
    budget: Option<u64>,
}

impl Default for HostBufferDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBufferDevice {
    pub fn new() -> Self {
        HostBufferDevice {
            buffers: Default::default(),
            next_id: AtomicU64::new(1),
            budget: None,
        }
    }

    pub fn with_budget(budget: u64) -> Self {
        HostBufferDevice {
            budget: Some(budget),
            ..Self::new()
        }
    }

    /// Forgets every buffer, the way a lost device takes all of its resources with it.
    pub fn lose_device(&self) {
        let mut buffers = self.buffers.lock().unwrap();
        log::debug!("host device lost {} buffers", buffers.len());
        buffers.clear();
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.buffers
            .lock()
            .unwrap()
            .values()
            .map(|b| b.data.len() as u64)
            .sum()
    }

    pub fn buffer_info(&self, handle: BufferHandle) -> Option<(String, BufferUsage, u32)> {
        self.buffers
            .lock()
            .unwrap()
            .get(&handle.0)
            .map(|b| (b.name.clone(), b.usage, b.data.len() as u32))
    }
}

fn range(len: usize, offset: u32, size: usize) -> anyhow::Result<std::ops::Range<usize>> {
    let start = offset as usize;
    let end = start + size;
    if end > len {
        return Err(anyhow!(
            "range {start}..{end} is out of bounds of a {len} byte buffer"
        ));
    }
    Ok(start..end)
}

impl BufferDevice for HostBufferDevice {
    fn create_buffer(&self, desc: &BufferDesc) -> anyhow::Result<BufferHandle> {
        let mut buffers = self.buffers.lock().unwrap();
        if let Some(budget) = self.budget {
            let live: u64 = buffers.values().map(|b| b.data.len() as u64).sum();
            if live + desc.size as u64 > budget {
                return Err(anyhow!(
                    "cannot create {} ({} bytes): {} of {} budget bytes in use",
                    desc.name,
                    desc.size,
                    live,
                    budget
                ));
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        buffers.insert(
            id,
            HostBuffer {
                name: desc.name.to_owned(),
                usage: desc.usage,
                data: vec![0; desc.size as usize],
            },
        );
        Ok(BufferHandle(id))
    }

    fn destroy_buffer(&self, handle: BufferHandle) {
        if self.buffers.lock().unwrap().remove(&handle.0).is_none() {
            log::debug!("destroying unknown buffer {:?}", handle);
        }
    }

    fn write_buffer(&self, handle: BufferHandle, offset: u32, data: &[u8]) -> anyhow::Result<()> {
        let mut buffers = self.buffers.lock().unwrap();
        let buf = buffers
            .get_mut(&handle.0)
            .ok_or_else(|| anyhow!("write to unknown buffer {:?}", handle))?;
        let r = range(buf.data.len(), offset, data.len())?;
        buf.data[r].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, handle: BufferHandle, offset: u32, len: u32) -> anyhow::Result<Vec<u8>> {
        let buffers = self.buffers.lock().unwrap();
        let buf = buffers
            .get(&handle.0)
            .ok_or_else(|| anyhow!("read from unknown buffer {:?}", handle))?;
        let r = range(buf.data.len(), offset, len as usize)?;
        Ok(buf.data[r].to_vec())
    }

    fn copy_buffer(
        &self,
        src: BufferHandle,
        src_offset: u32,
        dst: BufferHandle,
        dst_offset: u32,
        len: u32,
    ) -> anyhow::Result<()> {
        let bytes = self.read_buffer(src, src_offset, len)?;
        self.write_buffer(dst, dst_offset, &bytes)
    }
}

//! Vertex data objects and where they currently live inside the shared buffers.

use std::{
    num::NonZeroU32,
    sync::{Arc, RwLock},
};

use anyhow::anyhow;

/// Index buffer chunks are aligned to this, so 16- and 32-bit indices both start on an index
/// boundary.
pub const IB_ALIGN: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    U16,
    U32,
}

impl IndexFormat {
    pub fn bytes(self) -> u32 {
        match self {
            IndexFormat::U16 => 2,
            IndexFormat::U32 => 4,
        }
    }
}

/// Position of one [`VertexData`] inside the shared buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VdataLocation {
    pub vb_idx: u8,
    pub vb_ofs: u32,
    pub ib_ofs: u32,
}

/// One vertex stream plus its index stream.
#[derive(Debug)]
pub struct VertexData {
    stride: NonZeroU32,
    vertex_count: u32,
    index_count: u32,
    index_format: IndexFormat,
    location: RwLock<Option<VdataLocation>>,
}

impl VertexData {
    pub fn new(
        stride: NonZeroU32,
        vertex_count: u32,
        index_count: u32,
        index_format: IndexFormat,
    ) -> Self {
        assert!(vertex_count > 0, "[VertexData]: empty vertex stream");
        VertexData {
            stride,
            vertex_count,
            index_count,
            index_format,
            location: RwLock::new(None),
        }
    }

    pub fn stride(&self) -> u32 {
        self.stride.get()
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    pub fn index_format(&self) -> IndexFormat {
        self.index_format
    }

    pub fn vb_size(&self) -> u32 {
        self.vertex_count.saturating_mul(self.stride.get())
    }

    pub fn ib_size(&self) -> u32 {
        self.index_count.saturating_mul(self.index_format.bytes())
    }

    /// Index bytes this object occupies in the shared index buffer.
    pub fn ib_footprint(&self) -> u32 {
        align_up(self.ib_size(), IB_ALIGN)
    }

    pub fn location(&self) -> Option<VdataLocation> {
        *self.location.read().unwrap()
    }

    pub(crate) fn set_location(&self, location: Option<VdataLocation>) {
        *self.location.write().unwrap() = location;
    }

    /// First vertex of this object in its vertex buffer, if it is placed.
    pub fn base_vertex(&self) -> Option<u32> {
        self.location().map(|l| l.vb_ofs / self.stride.get())
    }

    /// First index of this object in the shared index buffer, if it is placed.
    pub fn start_index(&self) -> Option<u32> {
        self.location()
            .map(|l| l.ib_ofs / self.index_format.bytes())
    }
}

/// The vertex data objects of one LOD.
#[derive(Debug, Default)]
pub struct MeshVdata {
    data: Vec<Arc<VertexData>>,
}

impl MeshVdata {
    pub fn new(data: Vec<Arc<VertexData>>) -> Self {
        MeshVdata { data }
    }

    pub fn data(&self) -> &[Arc<VertexData>] {
        &self.data
    }

    pub fn vb_bytes(&self) -> u64 {
        self.data.iter().map(|vd| vd.vb_size() as u64).sum()
    }

    pub fn ib_bytes(&self) -> u64 {
        self.data.iter().map(|vd| vd.ib_footprint() as u64).sum()
    }

    pub fn is_placed(&self) -> bool {
        self.data.iter().all(|vd| vd.location().is_some())
    }
}

/// Raw contents of one [`VertexData`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VdataBytes {
    pub vertices: Vec<u8>,
    pub indices: Vec<u8>,
}

impl VdataBytes {
    pub fn check(&self, vd: &VertexData) -> anyhow::Result<()> {
        if self.vertices.len() != vd.vb_size() as usize || self.indices.len() != vd.ib_size() as usize
        {
            return Err(anyhow!(
                "vertex data holds {}/{} vertex/index bytes, expected {}/{}",
                self.vertices.len(),
                self.indices.len(),
                vd.vb_size(),
                vd.ib_size()
            ));
        }
        Ok(())
    }
}

pub fn align_up(size: u32, alignment: u32) -> u32 {
    size.saturating_add(alignment - 1) / alignment * alignment
}

pub fn align_down(size: u32, alignment: u32) -> u32 {
    size / alignment * alignment
}

/// Every distinct vertex data object referenced by `lods`, in first-seen order.
pub fn unique_vdata(lods: &[Arc<MeshVdata>]) -> Vec<Arc<VertexData>> {
    let mut seen = ahash::AHashSet::new();
    lods.iter()
        .flat_map(|lod| lod.data())
        .filter(|vd| seen.insert(Arc::as_ptr(vd)))
        .cloned()
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use nonzero_ext::nonzero;

    #[test]
    fn sizes_and_alignment() {
        let vd = VertexData::new(nonzero!(12u32), 10, 3, IndexFormat::U16);
        assert_eq!(vd.vb_size(), 120);
        assert_eq!(vd.ib_size(), 6);
        assert_eq!(vd.ib_footprint(), 8);
        assert_eq!(align_up(0, 4), 0);
        assert_eq!(align_down(1023, 12), 1020);
    }

    #[test]
    fn base_vertex_and_start_index() {
        let vd = VertexData::new(nonzero!(16u32), 4, 6, IndexFormat::U16);
        assert_eq!(vd.base_vertex(), None);
        vd.set_location(Some(VdataLocation {
            vb_idx: 1,
            vb_ofs: 64,
            ib_ofs: 12,
        }));
        assert_eq!(vd.base_vertex(), Some(4));
        assert_eq!(vd.start_index(), Some(6));
    }

    #[test]
    fn unique_skips_shared_objects() {
        let shared = Arc::new(VertexData::new(nonzero!(8u32), 1, 0, IndexFormat::U16));
        let other = Arc::new(VertexData::new(nonzero!(8u32), 2, 0, IndexFormat::U16));
        let lods = vec![
            Arc::new(MeshVdata::new(vec![shared.clone(), other.clone()])),
            Arc::new(MeshVdata::new(vec![shared.clone()])),
        ];
        let unique = unique_vdata(&lods);
        assert_eq!(unique.len(), 2);
        assert!(Arc::ptr_eq(&unique[0], &shared));
        assert!(Arc::ptr_eq(&unique[1], &other));
    }

    #[test]
    fn byte_check() {
        let vd = VertexData::new(nonzero!(4u32), 2, 2, IndexFormat::U32);
        let ok = VdataBytes {
            vertices: vec![0; 8],
            indices: vec![0; 8],
        };
        assert!(ok.check(&vd).is_ok());
        let short = VdataBytes {
            vertices: vec![0; 4],
            indices: vec![0; 8],
        };
        assert!(short.check(&vd).is_err());
    }
}

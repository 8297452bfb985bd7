//! What the arena needs from a mesh resource, and a ready-made in-memory resource.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc, RwLock,
};

use anyhow::{anyhow, bail};

use crate::vdata::{MeshVdata, VdataBytes, VertexData};

/// A mesh resource whose LODs live in the shared buffers.
///
/// LOD 0 is the finest. A resource has LODs `first_avail_lod()..` placed; a value equal to the LOD
/// count means nothing is placed.
pub trait UnitedResource: Send + Sync + 'static {
    fn lods(&self) -> &[Arc<MeshVdata>];

    fn first_avail_lod(&self) -> usize;
    fn set_first_avail_lod(&self, lod: usize);

    /// Finest LOD the resource wants placed; reloads restore LODs down to this one.
    fn requested_lod(&self) -> usize {
        0
    }

    /// Returns one [`VdataBytes`] per entry of `lods()[lod].data()`.
    fn load_lod_data(&self, lod: usize) -> anyhow::Result<Vec<VdataBytes>>;

    /// Recomputes render elements from the vertex data locations.
    fn rebase_elems(&self);

    fn is_loading(&self) -> bool;
    fn set_loading(&self, loading: bool);

    fn is_in_use(&self) -> bool {
        false
    }

    /// Larger is more recent.
    fn last_used(&self) -> u64 {
        0
    }
}

/// Where a render element finds its geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelemPlacement {
    pub vb_idx: u8,
    pub base_vertex: u32,
    pub start_index: u32,
    pub num_vertices: u32,
    pub num_indices: u32,
}

/// A resource keeping the source bytes of every LOD in memory.
pub struct LodsResource {
    name: String,
    lods: Vec<Arc<MeshVdata>>,
    sources: Vec<Vec<VdataBytes>>,
    source_ok: Vec<AtomicBool>,
    first_avail_lod: AtomicUsize,
    requested_lod: AtomicUsize,
    loading: AtomicBool,
    in_use: AtomicBool,
    last_used: AtomicU64,
    relems: RwLock<Vec<Vec<RelemPlacement>>>,
}

impl LodsResource {
    /// Each LOD is a list of vertex data objects with their contents.
    pub fn new(name: &str, lods: Vec<Vec<(Arc<VertexData>, VdataBytes)>>) -> anyhow::Result<Self> {
        let mut meshes = Vec::with_capacity(lods.len());
        let mut sources = Vec::with_capacity(lods.len());
        for (i, lod) in lods.into_iter().enumerate() {
            let mut data = Vec::with_capacity(lod.len());
            let mut bytes = Vec::with_capacity(lod.len());
            for (vd, b) in lod {
                b.check(&vd)
                    .map_err(|e| anyhow!("{name} lod {i}: {e}"))?;
                data.push(vd);
                bytes.push(b);
            }
            meshes.push(Arc::new(MeshVdata::new(data)));
            sources.push(bytes);
        }
        let lod_count = meshes.len();
        Ok(LodsResource {
            name: name.to_owned(),
            lods: meshes,
            sources,
            source_ok: (0..lod_count).map(|_| AtomicBool::new(true)).collect(),
            first_avail_lod: AtomicUsize::new(lod_count),
            requested_lod: AtomicUsize::new(0),
            loading: AtomicBool::new(false),
            in_use: AtomicBool::new(false),
            last_used: AtomicU64::new(0),
            relems: RwLock::new(vec![vec![]; lod_count]),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_requested_lod(&self, lod: usize) {
        self.requested_lod.store(lod, Ordering::Release)
    }

    pub fn set_in_use(&self, in_use: bool) {
        self.in_use.store(in_use, Ordering::Release)
    }

    /// Marks the resource as used at `frame`.
    pub fn touch(&self, frame: u64) {
        self.last_used.fetch_max(frame, Ordering::AcqRel);
    }

    /// Makes loading of `lod` fail, as a missing or corrupt source file would.
    pub fn set_source_available(&self, lod: usize, ok: bool) {
        self.source_ok[lod].store(ok, Ordering::Release)
    }

    /// Render elements of `lod`, empty if the LOD is not placed.
    pub fn relems(&self, lod: usize) -> Vec<RelemPlacement> {
        self.relems
            .read()
            .unwrap()
            .get(lod)
            .cloned()
            .unwrap_or_default()
    }
}

impl UnitedResource for LodsResource {
    fn lods(&self) -> &[Arc<MeshVdata>] {
        &self.lods
    }

    fn first_avail_lod(&self) -> usize {
        self.first_avail_lod.load(Ordering::Acquire)
    }

    fn set_first_avail_lod(&self, lod: usize) {
        self.first_avail_lod.store(lod, Ordering::Release)
    }

    fn requested_lod(&self) -> usize {
        self.requested_lod.load(Ordering::Acquire)
    }

    fn load_lod_data(&self, lod: usize) -> anyhow::Result<Vec<VdataBytes>> {
        match (self.sources.get(lod), self.source_ok.get(lod)) {
            (Some(bytes), Some(ok)) if ok.load(Ordering::Acquire) => Ok(bytes.clone()),
            (Some(_), _) => bail!("{}: source of lod {lod} is unavailable", self.name),
            _ => bail!("{}: no lod {lod}", self.name),
        }
    }

    fn rebase_elems(&self) {
        let first = self.first_avail_lod();
        let mut relems = self.relems.write().unwrap();
        for (lod, (mesh, out)) in self.lods.iter().zip(relems.iter_mut()).enumerate() {
            out.clear();
            if lod < first {
                continue;
            }
            out.extend(mesh.data().iter().filter_map(|vd| {
                let loc = vd.location()?;
                Some(RelemPlacement {
                    vb_idx: loc.vb_idx,
                    base_vertex: vd.base_vertex()?,
                    start_index: vd.start_index()?,
                    num_vertices: vd.vertex_count(),
                    num_indices: vd.index_count(),
                })
            }));
        }
    }

    fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Acquire)
    }

    fn set_loading(&self, loading: bool) {
        self.loading.store(loading, Ordering::Release)
    }

    fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    fn last_used(&self) -> u64 {
        self.last_used.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vdata::{IndexFormat, VdataLocation};
    use nonzero_ext::nonzero;

    fn lod(vertices: u32, fill: u8) -> Vec<(Arc<VertexData>, VdataBytes)> {
        let vd = Arc::new(VertexData::new(nonzero!(8u32), vertices, 3, IndexFormat::U16));
        let bytes = VdataBytes {
            vertices: vec![fill; vertices as usize * 8],
            indices: vec![0, 0, 1, 0, 2, 0],
        };
        vec![(vd, bytes)]
    }

    #[test]
    fn load_and_missing_source() {
        let res = LodsResource::new("rock", vec![lod(10, 1), lod(4, 2)]).unwrap();
        assert_eq!(res.first_avail_lod(), 2);
        assert_eq!(res.load_lod_data(1).unwrap()[0].vertices[0], 2);
        res.set_source_available(1, false);
        assert!(res.load_lod_data(1).is_err());
        assert!(res.load_lod_data(7).is_err());
    }

    #[test]
    fn rejects_mismatched_bytes() {
        let vd = Arc::new(VertexData::new(nonzero!(8u32), 2, 0, IndexFormat::U16));
        let bytes = VdataBytes {
            vertices: vec![0; 15],
            indices: vec![],
        };
        assert!(LodsResource::new("bad", vec![vec![(vd, bytes)]]).is_err());
    }

    #[test]
    fn rebase_follows_locations() {
        let res = LodsResource::new("rock", vec![lod(10, 1), lod(4, 2)]).unwrap();
        res.lods()[1].data()[0].set_location(Some(VdataLocation {
            vb_idx: 1,
            vb_ofs: 80,
            ib_ofs: 8,
        }));
        res.set_first_avail_lod(1);
        res.rebase_elems();
        assert!(res.relems(0).is_empty());
        assert_eq!(
            res.relems(1),
            vec![RelemPlacement {
                vb_idx: 1,
                base_vertex: 10,
                start_index: 4,
                num_vertices: 4,
                num_indices: 3,
            }]
        );
    }
}

use std::{
    fs,
    num::NonZeroU32,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use anyhow::Context;
use nonzero_ext::nonzero;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use unitedvdata::{
    config::DEFAULT_MAX_VB_SIZE, ArenaError, BufConfig, DeviceResetHandler, HostBufferDevice,
    IndexFormat, LodsResource, UnitedResource, UnitedVdata, UnitedVdataContext, VdataBytes,
    VertexData, WorkerPool,
};

const FRAMES: u64 = 120;
const LOD_COUNT: usize = 3;
const RESET_FRAME: u64 = 60;

type Cx = UnitedVdataContext<LodsResource, LodsResource>;

fn make_res(rng: &mut StdRng, name: String, stride: NonZeroU32) -> anyhow::Result<Arc<LodsResource>> {
    let mut vertex_count: u32 = rng.gen_range(200..3000);
    let mut lods = Vec::with_capacity(LOD_COUNT);
    for _ in 0..LOD_COUNT {
        let index_count = vertex_count * 3;
        let vd = Arc::new(VertexData::new(stride, vertex_count, index_count, IndexFormat::U16));
        let mut vertices = vec![0; vd.vb_size() as usize];
        rng.fill(vertices.as_mut_slice());
        let indices = (0..index_count)
            .flat_map(|i| ((i % vertex_count) as u16).to_le_bytes())
            .collect();
        lods.push(vec![(vd, VdataBytes { vertices, indices })]);
        vertex_count = (vertex_count / 3).max(8);
    }
    LodsResource::new(&name, lods).map(Arc::new)
}

fn add_batch(arena: &Arc<UnitedVdata<LodsResource>>, batch: &[Arc<LodsResource>]) -> anyhow::Result<()> {
    match arena.add_res(batch) {
        Ok(()) => Ok(()),
        Err(ArenaError::OutOfSpace(short)) => {
            log::warn!(
                "{}: skipped {} resources, {} vb / {} ib bytes short",
                arena.name(),
                batch.len(),
                short.vb,
                short.ib
            );
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn simulate_frame(cx: &Cx, rng: &mut StdRng, frame: u64, ri: &[Arc<LodsResource>], dm: &[Arc<LodsResource>]) {
    for res in ri.iter().chain(dm) {
        let visible = rng.gen_bool(0.3);
        res.set_in_use(visible);
        if visible {
            res.touch(frame);
        }
    }

    if frame % 10 == 0 {
        for res in ri.choose_multiple(rng, 4) {
            let _ = cx.ri.downgrade_res(res, rng.gen_range(1..LOD_COUNT));
        }
        for res in ri.choose_multiple(rng, 4) {
            res.set_requested_lod(0);
            cx.ri.reload_res(res);
        }
    }
    if frame % 40 == 0 {
        cx.ri.schedule_rebuild();
    }
    if frame % 25 == 0 {
        let freed = cx.ri.discard_unused_res_to_free_req_mem();
        log::debug!("frame {frame}: discard freed {freed} bytes");
    }
}

pub fn run(hints_path: Option<&str>) -> anyhow::Result<()> {
    let hints = match hints_path {
        Some(path) => {
            let json = fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
            BufConfig::from_json(&json, DEFAULT_MAX_VB_SIZE)?
        }
        None => BufConfig::default(),
    };

    let device = Arc::new(HostBufferDevice::with_budget(256 << 20));
    let jobs = Arc::new(WorkerPool::new("united_vdata_jobs", 2)?);
    let cx = Cx::new(device.clone(), jobs.clone());
    cx.dm.set_hints(hints);
    cx.ri.set_hints(hints);
    cx.ri.set_max_vb_size(4 << 20);
    cx.dm.set_del_res_allowed(true);

    let relem_updates = Arc::new(AtomicUsize::new(0));
    for arena in [&cx.dm, &cx.ri] {
        let updates = relem_updates.clone();
        arena.on_mesh_relems_updated().subscribe(move |_| {
            updates.fetch_add(1, Ordering::Relaxed);
        });
    }

    let mut rng = StdRng::seed_from_u64(7);
    let strides = [nonzero!(12u32), nonzero!(20u32), nonzero!(32u32)];
    let ri = (0..64)
        .map(|i| {
            let stride = strides[i % strides.len()];
            make_res(&mut rng, format!("ri_{i}"), stride)
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    let dm = (0..16)
        .map(|i| make_res(&mut rng, format!("dm_{i}"), nonzero!(48u32)))
        .collect::<anyhow::Result<Vec<_>>>()?;

    for batch in ri.chunks(8) {
        add_batch(&cx.ri, batch)?;
    }
    for batch in dm.chunks(4) {
        add_batch(&cx.dm, batch)?;
    }
    log::info!("{} ri and {} dm resources registered", cx.ri.res_count(), cx.dm.res_count());

    for frame in 1..=FRAMES {
        simulate_frame(&cx, &mut rng, frame, &ri, &dm);

        if frame == RESET_FRAME {
            log::info!("frame {frame}: simulating device reset");
            cx.on_before_reset();
            device.lose_device();
            cx.on_after_reset();
        }
        if frame == FRAMES - 20 {
            for res in dm.iter().step_by(2) {
                if let Err(e) = cx.dm.del_res(res) {
                    log::warn!("{}: {e}", res.name());
                }
            }
        }
    }
    jobs.wait_idle();
    cx.ri.update_local_maximum();
    cx.dm.update_local_maximum();

    let name = |r: &LodsResource| r.name().to_owned();
    println!("{}", cx.ri.build_status_str(true, name));
    println!("{}", cx.dm.build_status_str(true, name));
    print!("{}", cx.ri.dump_mem_blocks());
    println!(
        "{} relem updates, {} device buffers, {} bytes",
        relem_updates.load(Ordering::Relaxed),
        device.buffer_count(),
        device.total_bytes()
    );
    for res in ri.iter().chain(&dm).filter(|r| r.first_avail_lod() < r.lods().len()) {
        let lod = res.first_avail_lod();
        let arena = if res.name().starts_with("ri_") { &cx.ri } else { &cx.dm };
        let vd = &res.lods()[lod].data()[0];
        if arena.pool().read_vdata(vd)? != res.load_lod_data(lod)?[0] {
            anyhow::bail!("{}: lod {lod} contents differ from source", res.name());
        }
    }
    Ok(())
}

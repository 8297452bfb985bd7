//! Growth policy of the shared buffers.

use serde::{Deserialize, Serialize};

use crate::chunk::MAX_VBIDX_CNT;

/// Default cap on the size of a single shared buffer. 64 MiB
pub const DEFAULT_MAX_VB_SIZE: u32 = 64 << 20;

/// Initial sizes and growth increments of the shared buffers.
///
/// `sizes[0]` is the index buffer, the rest are the vertex buffer slots in slot order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufConfig {
    pub sizes: [u32; MAX_VBIDX_CNT],
    pub ib_min_add: u32,
    pub vb_min_add: u32,
    pub ib_max_add: u32,
    pub vb_max_add: u32,
    pub ib_add_promille: u32,
    pub vb_add_promille: u32,
}

impl Default for BufConfig {
    fn default() -> Self {
        BufConfig {
            sizes: [0; MAX_VBIDX_CNT],
            ib_min_add: 64 << 10,
            vb_min_add: 256 << 10,
            ib_max_add: 4 << 20,
            vb_max_add: 8 << 20,
            ib_add_promille: 250,
            vb_add_promille: 250,
        }
    }
}

/// Vertex buffer sizes as written in a hints block: one value for every slot, or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VbSizes {
    All(u32),
    PerSlot(Vec<u32>),
}

/// Raw hints block. Missing keys keep the [`BufConfig`] defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HintsBlock {
    pub ib_sz: Option<u32>,
    pub vb_sz: Option<VbSizes>,
    pub ib_min_add: Option<u32>,
    pub vb_min_add: Option<u32>,
    pub ib_max_add: Option<u32>,
    pub vb_max_add: Option<u32>,
    pub ib_add_promille: Option<u32>,
    pub vb_add_promille: Option<u32>,
}

impl BufConfig {
    pub fn from_hints(hints: &HintsBlock, max_vb_size: u32) -> Self {
        let mut cfg = BufConfig::default();
        if let Some(sz) = hints.ib_sz {
            cfg.sizes[0] = sz;
        }
        match &hints.vb_sz {
            Some(VbSizes::All(sz)) => cfg.sizes[1..].fill(*sz),
            Some(VbSizes::PerSlot(list)) => {
                if list.len() > MAX_VBIDX_CNT - 1 {
                    log::warn!(
                        "vbSz lists {} slots, only {} are used",
                        list.len(),
                        MAX_VBIDX_CNT - 1
                    );
                }
                for (dst, src) in cfg.sizes[1..].iter_mut().zip(list) {
                    *dst = *src;
                }
            }
            None => {}
        }
        for sz in &mut cfg.sizes {
            *sz = (*sz).min(max_vb_size);
        }

        let pick = |v: Option<u32>, d: u32| v.unwrap_or(d);
        cfg.ib_min_add = pick(hints.ib_min_add, cfg.ib_min_add);
        cfg.vb_min_add = pick(hints.vb_min_add, cfg.vb_min_add);
        cfg.ib_max_add = pick(hints.ib_max_add, cfg.ib_max_add);
        cfg.vb_max_add = pick(hints.vb_max_add, cfg.vb_max_add);
        cfg.ib_add_promille = pick(hints.ib_add_promille, cfg.ib_add_promille);
        cfg.vb_add_promille = pick(hints.vb_add_promille, cfg.vb_add_promille);
        cfg
    }

    pub fn from_json(json: &str, max_vb_size: u32) -> anyhow::Result<Self> {
        let hints: HintsBlock = serde_json::from_str(json)?;
        Ok(Self::from_hints(&hints, max_vb_size))
    }

    pub fn ib_sz(&self) -> u32 {
        self.sizes[0]
    }

    /// Bytes to add to a buffer currently holding `cur_size` bytes.
    pub fn growth_step(&self, ib: bool, cur_size: u32) -> u32 {
        let (min_add, max_add, promille) = if ib {
            (self.ib_min_add, self.ib_max_add, self.ib_add_promille)
        } else {
            (self.vb_min_add, self.vb_max_add, self.vb_add_promille)
        };
        let step = (cur_size as u64 * promille as u64 / 1000) as u32;
        step.min(max_add).max(min_add)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_from_empty_block() {
        let cfg = BufConfig::from_json("{}", DEFAULT_MAX_VB_SIZE).unwrap();
        assert_eq!(cfg, BufConfig::default());
    }

    #[test]
    fn parse_hints() {
        let cfg = BufConfig::from_json(
            r#"{
                "ibSz": 1048576,
                "vbSz": [2097152, 4096],
                "ibMinAdd": 1024,
                "vbMaxAdd": 65536,
                "vbAddPromille": 100
            }"#,
            DEFAULT_MAX_VB_SIZE,
        )
        .unwrap();
        assert_eq!(cfg.ib_sz(), 1 << 20);
        assert_eq!(cfg.sizes[1], 2 << 20);
        assert_eq!(cfg.sizes[2], 4096);
        assert_eq!(cfg.sizes[3], 0);
        assert_eq!(cfg.ib_min_add, 1024);
        assert_eq!(cfg.vb_max_add, 65536);
        assert_eq!(cfg.vb_add_promille, 100);
        assert_eq!(cfg.ib_add_promille, BufConfig::default().ib_add_promille);
    }

    #[test]
    fn single_vb_size_applies_to_all_slots() {
        let cfg = BufConfig::from_json(r#"{"vbSz": 8192}"#, 4096).unwrap();
        assert_eq!(cfg.ib_sz(), 0);
        assert!(cfg.sizes[1..].iter().all(|&sz| sz == 4096));
    }

    #[test]
    fn growth_is_clamped() {
        let cfg = BufConfig {
            vb_min_add: 100,
            vb_max_add: 1000,
            vb_add_promille: 500,
            ..Default::default()
        };
        assert_eq!(cfg.growth_step(false, 0), 100);
        assert_eq!(cfg.growth_step(false, 1000), 500);
        assert_eq!(cfg.growth_step(false, 10000), 1000);
    }

    #[test]
    fn rejects_garbage() {
        assert!(BufConfig::from_json(r#"{"ibSz": "big"}"#, DEFAULT_MAX_VB_SIZE).is_err());
    }
}

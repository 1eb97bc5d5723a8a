//! IDENTIFY response data (spec §4.8 `[SUPPLEMENT]`). Grounded in
//! `original_source/myssd_sdk/src/hostif/nvme_identify.c`'s
//! `nvme_identify_namespace`/`nvme_identify_controller`: which fields get
//! populated from FTL namespace state versus fixed controller-identity
//! constants. Exposed as typed structs with an `encode()` into the fixed
//! 4 KiB wire buffer, rather than raw offset pokes, since nothing else in
//! this crate needs byte-exact NVMe spec compliance beyond the fields
//! spec §8 scenario 5 actually checks (`nsze`/`ncap`/`nuse`/`lbaf[0].ds`).

use crate::config::DeviceConfig;
use crate::ftl::namespace::Namespace;

pub const IDENTIFY_DATA_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Lbaf {
    pub ms: u16,
    pub ds: u8,
    pub rp: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IdentifyNamespace {
    pub nsze: u64,
    pub ncap: u64,
    pub nuse: u64,
    pub lbaf0: Lbaf,
}

impl IdentifyNamespace {
    /// `None` namespace (unallocated / `NSID_ALL`) zeroes `nsze`/`ncap`/
    /// `nuse` but still reports `lbaf[0]`, matching the original's
    /// `nvme_identify_namespace` behavior for an inactive namespace.
    pub fn for_namespace(cfg: &DeviceConfig, ns: Option<&Namespace>) -> Self {
        let (nsze, ncap, nuse) = match ns {
            Some(ns) if ns.allocated => (ns.size_blocks, ns.capacity_blocks, ns.util_blocks),
            _ => (0, 0, 0),
        };
        IdentifyNamespace {
            nsze,
            ncap,
            nuse,
            lbaf0: Lbaf { ms: 0, ds: cfg.sector_size.trailing_zeros() as u8, rp: 2 },
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; IDENTIFY_DATA_SIZE];
        buf[0..8].copy_from_slice(&self.nsze.to_le_bytes());
        buf[8..16].copy_from_slice(&self.ncap.to_le_bytes());
        buf[16..24].copy_from_slice(&self.nuse.to_le_bytes());
        buf[128..130].copy_from_slice(&self.lbaf0.ms.to_le_bytes());
        buf[130] = self.lbaf0.ds;
        buf[131] = self.lbaf0.rp;
        buf
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentifyController {
    pub vid: u16,
    pub ssvid: u16,
    pub nn: u32,
    /// Supports the Write Zeroes command (original's `NVME_CTRL_ONCS_WRITE_ZEROES`).
    pub supports_write_zeroes: bool,
    /// Supports NVMe namespace management (original's `NVME_CTRL_OACS_NS_MNGT_SUPP`).
    pub supports_namespace_management: bool,
}

impl IdentifyController {
    pub fn new(namespace_max: usize) -> Self {
        IdentifyController {
            vid: 0x9038,
            ssvid: 0x0007,
            nn: namespace_max as u32,
            supports_write_zeroes: true,
            supports_namespace_management: true,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; IDENTIFY_DATA_SIZE];
        buf[0..2].copy_from_slice(&self.vid.to_le_bytes());
        buf[2..4].copy_from_slice(&self.ssvid.to_le_bytes());
        buf[516..520].copy_from_slice(&self.nn.to_le_bytes());
        buf[520] = self.supports_namespace_management as u8;
        buf[521] = self.supports_write_zeroes as u8;
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_identify_reports_size_capacity_and_util() {
        let cfg = DeviceConfig::tiny();
        let ns = Namespace { nsid: 1, allocated: true, active: true, size_blocks: 1000, capacity_blocks: 1000, util_blocks: 7 };
        let id = IdentifyNamespace::for_namespace(&cfg, Some(&ns));
        assert_eq!(id.nsze, 1000);
        assert_eq!(id.ncap, 1000);
        assert_eq!(id.nuse, 7);
        assert_eq!(id.lbaf0.ds, cfg.sector_size.trailing_zeros() as u8);

        let encoded = id.encode();
        assert_eq!(u64::from_le_bytes(encoded[0..8].try_into().unwrap()), 1000);
        assert_eq!(encoded[130], id.lbaf0.ds);
    }

    #[test]
    fn unallocated_namespace_identifies_as_zero_size() {
        let cfg = DeviceConfig::tiny();
        let id = IdentifyNamespace::for_namespace(&cfg, None);
        assert_eq!(id.nsze, 0);
        assert_eq!(id.ncap, 0);
    }

    #[test]
    fn controller_identify_reports_namespace_count() {
        let id = IdentifyController::new(32);
        assert_eq!(id.nn, 32);
        let encoded = id.encode();
        assert_eq!(u32::from_le_bytes(encoded[516..520].try_into().unwrap()), 32);
    }
}

//! NAND array abstraction standing in for real flash hardware
//! (spec §4.7 `[SUPPLEMENT]`) — the register-level IP-core programming
//! spec.md excludes (§1) lives below this trait, never inside it.

use crate::address::{FlashAddress, Ppn};
use crate::config::DeviceConfig;
use crate::fil::ecc::ErrBitmap;
use std::collections::HashMap;
use std::sync::Mutex;

/// One physical page's payload plus out-of-band parity, as the pipeline's
/// data-out phase hands it to the ECC engine.
#[derive(Debug, Clone)]
pub struct PageData {
    pub data: Vec<u8>,
    pub parity: Vec<u8>,
}

/// Backend a `NandPipeline` issues commands against. Polymorphic over
/// `{software, hardware}` per spec §9; this crate only ships the software
/// (simulated) backend since there is no register-level IP core to drive.
pub trait NandArray: Send + Sync {
    fn program_page(&self, ppn: Ppn, data: &[u8], parity: &[u8]);
    fn read_page(&self, ppn: Ppn) -> Option<PageData>;
    /// Erases every page of `addr`'s block. Takes the caller's own
    /// `DeviceConfig` rather than assuming one, since `encode_ppn` depends
    /// on geometry that differs between callers under test (`tiny()`) and
    /// any caller running under the default geometry.
    fn erase_block(&self, cfg: &DeviceConfig, addr: FlashAddress);
    /// Inject a fault for testing the bad-block scan / ECC failure paths.
    fn inject_err_bitmap(&self, ppn: Ppn, bitmap: ErrBitmap);
    fn err_bitmap_for(&self, ppn: Ppn) -> ErrBitmap;
}

/// In-memory simulated NAND array. Blocks that have never been erased read
/// as all-zero, matching the erased-NAND convention the block manager's
/// shallow bad-block scan relies on (spare-area byte of an unwritten page
/// reads as `0xFF` on real NAND; here we model "never written" rather than
/// the manufacturer bad-block mark directly, see `ftl::block_manager`).
#[derive(Default)]
pub struct SimNandArray {
    pages: Mutex<HashMap<Ppn, PageData>>,
    injected_errors: Mutex<HashMap<Ppn, ErrBitmap>>,
}

impl SimNandArray {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NandArray for SimNandArray {
    fn program_page(&self, ppn: Ppn, data: &[u8], parity: &[u8]) {
        self.pages.lock().unwrap().insert(
            ppn,
            PageData { data: data.to_vec(), parity: parity.to_vec() },
        );
    }

    fn read_page(&self, ppn: Ppn) -> Option<PageData> {
        self.pages.lock().unwrap().get(&ppn).cloned()
    }

    fn erase_block(&self, cfg: &DeviceConfig, addr: FlashAddress) {
        let mut pages = self.pages.lock().unwrap();
        for page in 0..cfg.pages_per_block as u32 {
            let mut a = addr;
            a.page = page;
            pages.remove(&cfg.encode_ppn(a));
        }
    }

    fn inject_err_bitmap(&self, ppn: Ppn, bitmap: ErrBitmap) {
        self.injected_errors.lock().unwrap().insert(ppn, bitmap);
    }

    fn err_bitmap_for(&self, ppn: Ppn) -> ErrBitmap {
        self.injected_errors.lock().unwrap().get(&ppn).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_then_read_round_trips() {
        let nand = SimNandArray::new();
        nand.program_page(42, &[1, 2, 3], &[9]);
        let page = nand.read_page(42).unwrap();
        assert_eq!(page.data, vec![1, 2, 3]);
        assert_eq!(page.parity, vec![9]);
    }

    #[test]
    fn unwritten_page_reads_as_none() {
        let nand = SimNandArray::new();
        assert!(nand.read_page(7).is_none());
    }

    #[test]
    fn injected_error_bitmap_is_observable() {
        let nand = SimNandArray::new();
        nand.inject_err_bitmap(1, 0b101);
        assert_eq!(nand.err_bitmap_for(1), 0b101);
        assert_eq!(nand.err_bitmap_for(2), 0);
    }

    #[test]
    fn erase_under_tiny_geometry_clears_every_page_of_the_block() {
        let cfg = DeviceConfig::tiny();
        let nand = SimNandArray::new();
        let addr = FlashAddress::default();
        for page in 0..cfg.pages_per_block as u32 {
            let mut a = addr;
            a.page = page;
            nand.program_page(cfg.encode_ppn(a), &[1, 2, 3], &[]);
        }
        nand.erase_block(&cfg, addr);
        for page in 0..cfg.pages_per_block as u32 {
            let mut a = addr;
            a.page = page;
            assert!(nand.read_page(cfg.encode_ppn(a)).is_none());
        }
    }

    #[test]
    fn erasing_with_a_different_geometry_than_it_was_programmed_under_misses_the_page() {
        // Demonstrates why `erase_block` must take the caller's own
        // config rather than assume one: `encode_ppn` packs fields by
        // each geometry's own bit widths, so a page programmed under one
        // config's PPN space isn't reachable by iterating another's.
        let tiny = DeviceConfig::tiny();
        let default_cfg = DeviceConfig::default();
        let addr = FlashAddress::default();
        let nand = SimNandArray::new();
        nand.program_page(tiny.encode_ppn(addr), &[9], &[]);
        nand.erase_block(&default_cfg, addr);
        assert!(nand.read_page(tiny.encode_ppn(addr)).is_some());
    }
}

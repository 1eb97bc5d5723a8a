//! Geometry and tuning constants for the controller core.
//!
//! Defaults mirror a representative 512 GiB array: 8 channels, 2 chips per
//! channel, 2 dies per chip, 2 planes per die, 1048 blocks per plane, 512
//! pages per block, 16 KiB flash pages over 4 KiB sectors.

/// Sector size in bytes. Must be a power of two, >= 512.
pub const SECTOR_SIZE: usize = 4096;
pub const SECTOR_SHIFT: u32 = 12;

/// Flash page size in bytes. Must be a power-of-two multiple of `SECTOR_SIZE`.
pub const FLASH_PAGE_SIZE: usize = 16384;
pub const SECTORS_PER_FLASH_PAGE: usize = FLASH_PAGE_SIZE / SECTOR_SIZE;

pub const NR_CHANNELS: usize = 8;
pub const CHIPS_PER_CHANNEL: usize = 2;
pub const DIES_PER_CHIP: usize = 2;
pub const PLANES_PER_DIE: usize = 2;
pub const BLOCKS_PER_PLANE: usize = 1048;
pub const PAGES_PER_BLOCK: usize = 512;

pub const NR_PLANES: usize = NR_CHANNELS * CHIPS_PER_CHANNEL * DIES_PER_CHIP * PLANES_PER_DIE;

/// One mapping entry is a 4-byte PPN on disk; a translation page holds as
/// many entries as fit in one flash page.
pub const ENTRIES_PER_XLATE_PAGE: usize = FLASH_PAGE_SIZE / 4;

/// Sentinel PPN meaning "unmapped" / "no backing physical page".
pub const PPN_SENTINEL: u32 = 0xFFFF_FFFF;

pub const NAMESPACE_MAX: usize = 32;

pub const NR_WORKER_THREADS: usize = 16;
pub const NR_FLUSHERS: usize = 8;

/// Bounded translation-page cache capacity, in pages.
pub const XLATE_CACHE_CAPACITY_PAGES: usize = 256;

/// Bounded data-cache capacity, in flash-page-sized entries.
pub const DATA_CACHE_CAPACITY_PAGES: usize = 4096;

/// Simulated NAND timing, microseconds. Used by the software NAND backend
/// to model command-phase vs. array-execution latency.
pub const FLASH_READ_LATENCY_US: u64 = 50;
pub const FLASH_PROGRAM_LATENCY_US: u64 = 300;
pub const FLASH_ERASE_LATENCY_US: u64 = 1200;

/// Per-die batch size cap for multi-plane commands.
pub const PLANES_PER_DIE_BATCH: usize = PLANES_PER_DIE;

/// Number of ECC codewords covering one flash page (used to size
/// `err_bitmap`s in flash transactions).
pub const ECC_BLOCKS_PER_PAGE: usize = 8;

/// Runtime-adjustable device configuration. Defaults match the constants
/// above; tests shrink these to keep cases fast while preserving ratios.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub sector_size: usize,
    pub flash_page_size: usize,
    pub nr_channels: usize,
    pub chips_per_channel: usize,
    pub dies_per_chip: usize,
    pub planes_per_die: usize,
    pub blocks_per_plane: usize,
    pub pages_per_block: usize,
    pub nr_worker_threads: usize,
    pub nr_flushers: usize,
    pub xlate_cache_capacity_pages: usize,
    pub data_cache_capacity_pages: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            sector_size: SECTOR_SIZE,
            flash_page_size: FLASH_PAGE_SIZE,
            nr_channels: NR_CHANNELS,
            chips_per_channel: CHIPS_PER_CHANNEL,
            dies_per_chip: DIES_PER_CHIP,
            planes_per_die: PLANES_PER_DIE,
            blocks_per_plane: BLOCKS_PER_PLANE,
            pages_per_block: PAGES_PER_BLOCK,
            nr_worker_threads: NR_WORKER_THREADS,
            nr_flushers: NR_FLUSHERS,
            xlate_cache_capacity_pages: XLATE_CACHE_CAPACITY_PAGES,
            data_cache_capacity_pages: DATA_CACHE_CAPACITY_PAGES,
        }
    }
}

impl DeviceConfig {
    pub fn sectors_per_flash_page(&self) -> usize {
        self.flash_page_size / self.sector_size
    }

    pub fn nr_planes(&self) -> usize {
        self.nr_channels * self.chips_per_channel * self.dies_per_chip * self.planes_per_die
    }

    pub fn entries_per_xlate_page(&self) -> usize {
        self.flash_page_size / 4
    }

    /// A small configuration suitable for fast, deterministic unit tests:
    /// one channel/chip/die/plane pair, a handful of blocks, tiny caches.
    pub fn tiny() -> Self {
        DeviceConfig {
            sector_size: 4096,
            flash_page_size: 16384,
            nr_channels: 1,
            chips_per_channel: 1,
            dies_per_chip: 1,
            planes_per_die: 1,
            blocks_per_plane: 8,
            pages_per_block: 16,
            nr_worker_threads: 4,
            nr_flushers: 2,
            xlate_cache_capacity_pages: 4,
            data_cache_capacity_pages: 8,
        }
    }
}

//! Shared data model (spec §3): user requests and flash transactions that
//! flow between the FTL and FIL subsystems over the ring queue.

use crate::address::{FlashAddress, Lba, Lpa, Ppn};
use crate::fil::ecc::ErrBitmap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnType {
    Read,
    Write,
    Erase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnSource {
    User,
    Mapping,
    Gc,
}

/// A flash transaction: one page-granular unit of NAND work. Created by
/// either the FTL pipeline or the mapping unit, owned end-to-end by the
/// originating worker.
#[derive(Debug, Clone)]
pub struct FlashTransaction {
    pub ty: TxnType,
    pub source: TxnSource,
    pub nsid: u32,
    pub lpa: Lpa,
    pub ppn: Ppn,
    pub addr: FlashAddress,
    pub buffer: Vec<u8>,
    pub offset: usize,
    pub length: usize,
    /// Sector-granular bitmap of which sectors within the page this
    /// transaction touches.
    pub sector_bitmap: u64,
    pub code_buffer: Vec<u8>,
    pub code_length: usize,
    pub err_bitmap: ErrBitmap,
    pub stats: TxnStats,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TxnStats {
    pub enqueued_at_us: u64,
    pub completed_at_us: u64,
}

impl FlashTransaction {
    pub fn new(ty: TxnType, source: TxnSource, nsid: u32, lpa: Lpa) -> Self {
        FlashTransaction {
            ty,
            source,
            nsid,
            lpa,
            ppn: crate::config::PPN_SENTINEL,
            addr: FlashAddress::default(),
            buffer: Vec::new(),
            offset: 0,
            length: 0,
            sector_bitmap: 0,
            code_buffer: Vec::new(),
            code_length: 0,
            err_bitmap: 0,
            stats: TxnStats::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserRequestType {
    Read,
    Write,
    WriteZeroes,
    Flush,
    FlushData,
    Sync,
}

/// Per-request statistics (spec §4.5), accumulated into histograms at
/// completion.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestStats {
    pub total_flash_read_txns: u64,
    pub total_flash_write_txns: u64,
    pub total_flash_read_bytes: u64,
    pub total_flash_write_bytes: u64,
    pub flash_read_transfer_us: u64,
    pub flash_write_transfer_us: u64,
    pub flash_read_command_us: u64,
    pub flash_write_command_us: u64,
    pub ecc_error_blocks: u64,
}

/// A user I/O request, created on NVMe-command arrival and destroyed
/// after the completion entry is posted.
#[derive(Debug, Clone)]
pub struct UserRequest {
    pub ty: UserRequestType,
    pub nsid: u32,
    pub start_lba: Lba,
    pub sector_count: u64,
    pub host_buffer: Vec<u8>,
    pub txn_list: Vec<FlashTransaction>,
    pub stats: RequestStats,
}

impl UserRequest {
    pub fn new(ty: UserRequestType, nsid: u32, start_lba: Lba, sector_count: u64) -> Self {
        UserRequest {
            ty,
            nsid,
            start_lba,
            sector_count,
            host_buffer: Vec::new(),
            txn_list: Vec::new(),
            stats: RequestStats::default(),
        }
    }
}

/// A fixed-layout record copied bit-exact through the ring queue, carrying
/// a flash transaction's scheduling metadata plus a handle back to the
/// worker that issued it.
#[derive(Debug, Clone, Copy)]
pub struct FilTaskDescriptor {
    pub source: TxnSource,
    pub status: FilTaskStatus,
    pub completed: bool,
    pub issued_at_us: u64,
    pub finished_at_us: u64,
    /// Opaque handle identifying the originating worker; the ring slot
    /// itself only carries an index into a transaction table (spec §9
    /// "atomic-free ring SPSC"), this is the payload that table stores.
    pub worker_handle: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilTaskStatus {
    Pending,
    Success,
    Error,
}

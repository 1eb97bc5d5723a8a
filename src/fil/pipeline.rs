//! FIL NAND pipeline (spec §4.7): per-channel/chip/die command state
//! machine, driven as a discrete-event simulation over a virtual clock
//! rather than real time — this is a host-testable firmware-logic crate
//! (spec.md §1 explicitly excludes register-level IP-core programming),
//! so "array execution takes 300us" is modeled by advancing a counter,
//! not by sleeping. Grounded in `drivers/ahci/mod.rs`'s command-slot /
//! completion-polling idiom for the Rust shape of a command state machine
//! and `original_source/myssd_sdk/r5poll/fil/nfc.c`/`tsu.c` for the phase
//! sequencing and time-ordered execution index.

use crate::config::{
    DeviceConfig, FLASH_ERASE_LATENCY_US, FLASH_PROGRAM_LATENCY_US, FLASH_READ_LATENCY_US,
};
use crate::fil::ecc::EccEngine;
use crate::fil::nand::NandArray;
use crate::fil::scheduler::{ChannelCursor, ChipQueues, DieActivity};
use crate::txn::{FlashTransaction, TxnType};
use crate::worker::sync::{blocked_during, BlockReason};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipState {
    Idle,
    CmdDataIn,
    WaitForDataOut,
    DataOut,
    Reading,
    Writing,
    Erasing,
}

struct InFlight {
    finish_us: u64,
    channel: usize,
    chip: usize,
    die: usize,
    kind: TxnType,
    batch: Vec<FlashTransaction>,
}

struct Chip {
    queues: ChipQueues,
    die_activity: Vec<DieActivity>,
    state: ChipState,
}

struct Channel {
    chips: Vec<Chip>,
    cursor: ChannelCursor,
    state: ChannelState,
}

/// Per-channel busy bitmap and per-die "has an active command" bitmap, for
/// the read-only `sample()` profiling hook (spec §4.7).
#[derive(Debug, Clone, Default)]
pub struct PipelineSample {
    pub channel_busy: Vec<bool>,
    pub die_active: Vec<Vec<Vec<bool>>>,
}

pub struct NandPipeline {
    cfg: DeviceConfig,
    channels: Vec<Channel>,
    nand: Arc<dyn NandArray>,
    ecc: Arc<dyn EccEngine>,
    now_us: u64,
    in_flight: BinaryHeap<Reverse<OrderedFinish>>,
    pending: HashMap<usize, InFlight>,
    next_handle: usize,
}

/// `(finish_us, admission handle)` — ordering by finish time, handle as a
/// tiebreaker so two commands finishing in the same microsecond still have
/// a total order for the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct OrderedFinish(u64, usize);

impl NandPipeline {
    /// Current virtual-clock reading, in microseconds, for callers that
    /// accumulate per-request latency histograms around `enqueue`/`drain`.
    pub fn now_us(&self) -> u64 {
        self.now_us
    }

    pub fn new(cfg: DeviceConfig, nand: Arc<dyn NandArray>, ecc: Arc<dyn EccEngine>) -> Self {
        let channels = (0..cfg.nr_channels)
            .map(|_| Channel {
                chips: (0..cfg.chips_per_channel)
                    .map(|_| Chip {
                        queues: ChipQueues::new(),
                        die_activity: vec![DieActivity::Idle; cfg.dies_per_chip],
                        state: ChipState::Idle,
                    })
                    .collect(),
                cursor: ChannelCursor::new(),
                state: ChannelState::Idle,
            })
            .collect();
        NandPipeline {
            cfg,
            channels,
            nand,
            ecc,
            now_us: 0,
            in_flight: BinaryHeap::new(),
            pending: HashMap::new(),
            next_handle: 0,
        }
    }

    pub fn enqueue(&mut self, txn: FlashTransaction) {
        let channel = txn.addr.channel as usize;
        let chip = txn.addr.chip as usize;
        self.channels[channel].chips[chip].queues.enqueue(txn);
    }

    /// Run the pipeline until every enqueued transaction has completed,
    /// returning them with `err_bitmap`/`buffer` populated for reads.
    /// A synchronous "drain" is the right granularity for a firmware-logic
    /// library driven by a cooperative worker that awaits ring completion
    /// (spec §9): the caller doesn't care how many internal ticks this
    /// took, only that the batch it handed off has all come back.
    pub fn drain(&mut self) -> Vec<FlashTransaction> {
        let mut completed = Vec::new();
        loop {
            let admitted_any = self.dispatch_round();
            if !admitted_any && self.in_flight.is_empty() {
                break;
            }
            if !admitted_any {
                self.advance_to_next_finish(&mut completed);
            } else {
                self.drain_due_events(&mut completed);
            }
        }
        completed
    }

    fn dispatch_round(&mut self) -> bool {
        let mut admitted_any = false;
        let nr_channels = self.channels.len();
        for ch_idx in 0..nr_channels {
            if self.channels[ch_idx].state == ChannelState::Busy {
                continue;
            }
            let nr_chips = self.channels[ch_idx].chips.len();
            if nr_chips == 0 {
                continue;
            }
            let start = self.channels[ch_idx].cursor.advance(nr_chips);
            for offset in 0..nr_chips {
                let chip_idx = (start + offset) % nr_chips;
                if self.try_dispatch_chip(ch_idx, chip_idx) {
                    admitted_any = true;
                    break;
                }
            }
        }
        admitted_any
    }

    fn try_dispatch_chip(&mut self, ch_idx: usize, chip_idx: usize) -> bool {
        let planes_per_die = self.cfg.planes_per_die;
        let chip = &mut self.channels[ch_idx].chips[chip_idx];
        let Some(plan) = chip.queues.select_dispatch(&chip.die_activity, planes_per_die) else {
            return false;
        };

        let kind = plan.kind;
        if kind == TxnType::Write {
            self.channels[ch_idx].state = ChannelState::Busy;
        }
        self.channels[ch_idx].chips[chip_idx].state = match kind {
            TxnType::Read => ChipState::Reading,
            TxnType::Write => ChipState::Writing,
            TxnType::Erase => ChipState::Erasing,
        };

        for batch in plan.batches {
            let latency = match kind {
                TxnType::Read => FLASH_READ_LATENCY_US,
                TxnType::Write => FLASH_PROGRAM_LATENCY_US,
                TxnType::Erase => FLASH_ERASE_LATENCY_US,
            };
            self.channels[ch_idx].chips[chip_idx].die_activity[batch.die] =
                DieActivity::CmdPhase(kind);

            let executed = self.execute_command_phase(kind, batch.txns);

            let finish_us = self.now_us + latency;
            let handle = self.next_handle;
            self.next_handle += 1;
            self.in_flight.push(Reverse(OrderedFinish(finish_us, handle)));
            self.pending.insert(
                handle,
                InFlight { finish_us, channel: ch_idx, chip: chip_idx, die: batch.die, kind, batch: executed },
            );
        }
        true
    }

    /// Perform the NAND-array side-effect immediately (writes/erases
    /// commit during the command/data-transfer phase; reads are staged
    /// and their data/ECC correction happens at data-out, once array
    /// execution finishes — see `finish_in_flight`).
    fn execute_command_phase(&self, kind: TxnType, mut batch: Vec<FlashTransaction>) -> Vec<FlashTransaction> {
        for txn in &mut batch {
            let ppn = self.cfg.encode_ppn(txn.addr);
            match kind {
                TxnType::Write => {
                    let parity = blocked_during(BlockReason::Ecc, || self.ecc.encode(&txn.buffer));
                    self.nand.program_page(ppn, &txn.buffer, &parity);
                }
                TxnType::Erase => {
                    self.nand.erase_block(&self.cfg, txn.addr);
                }
                TxnType::Read => {
                    txn.ppn = ppn;
                }
            }
        }
        batch
    }

    fn drain_due_events(&mut self, completed: &mut Vec<FlashTransaction>) {
        while let Some(Reverse(OrderedFinish(finish_us, handle))) = self.in_flight.peek().copied() {
            if finish_us > self.now_us {
                break;
            }
            self.in_flight.pop();
            self.finish_in_flight(handle, completed);
        }
    }

    fn advance_to_next_finish(&mut self, completed: &mut Vec<FlashTransaction>) {
        if let Some(Reverse(OrderedFinish(finish_us, _))) = self.in_flight.peek().copied() {
            self.now_us = finish_us;
        }
        self.drain_due_events(completed);
    }

    fn finish_in_flight(&mut self, handle: usize, completed: &mut Vec<FlashTransaction>) {
        let Some(flight) = self.pending.remove(&handle) else { return };
        let InFlight { channel, chip, die, kind, mut batch, .. } = flight;

        for txn in &mut batch {
            if kind == TxnType::Read {
                let ppn = txn.ppn;
                if let Some(page) = self.nand.read_page(ppn) {
                    txn.buffer = page.data;
                    txn.code_buffer = page.parity.clone();
                    let err_bitmap = self.nand.err_bitmap_for(ppn);
                    txn.err_bitmap = err_bitmap;
                    let corrected = blocked_during(BlockReason::Ecc, || {
                        self.ecc.correct(&mut txn.buffer, &page.parity, err_bitmap)
                    });
                    if corrected.is_err() {
                        txn.err_bitmap = err_bitmap | 0x8000_0000;
                    }
                } else {
                    txn.buffer = vec![0u8; self.cfg.flash_page_size];
                }
            }
        }

        self.channels[channel].chips[chip].die_activity[die] = DieActivity::Idle;
        let chip_idle = self.channels[channel]
            .chips
            .iter()
            .all(|c| c.die_activity.iter().all(|a| *a == DieActivity::Idle));
        if chip_idle {
            self.channels[channel].chips[chip].state = ChipState::Idle;
        }
        if kind == TxnType::Write {
            self.channels[channel].state = ChannelState::Idle;
        }

        completed.extend(batch);
    }

    /// Read-only profiling hook (spec §4.7).
    pub fn sample(&self) -> PipelineSample {
        PipelineSample {
            channel_busy: self.channels.iter().map(|c| c.state == ChannelState::Busy).collect(),
            die_active: self
                .channels
                .iter()
                .map(|c| {
                    c.chips
                        .iter()
                        .map(|chip| chip.die_activity.iter().map(|a| *a != DieActivity::Idle).collect())
                        .collect()
                })
                .collect(),
        }
    }
}

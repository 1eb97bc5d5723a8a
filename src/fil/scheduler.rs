//! FIL transaction scheduler (spec §4.6): per-chip seven-queue admission
//! and multi-plane batch packing. Grounded in
//! `original_source/myssd_sdk/r5poll/fil/fil.c`'s queue-selection cascade,
//! restated as pure data-structure logic so it is exercisable without a
//! NAND pipeline driving real time; `fil::pipeline` supplies the live die
//! state this module's legality check consumes, the way
//! `task/scheduler.rs`'s ready-queue cursor is driven by an external tick.

use crate::txn::{FlashTransaction, TxnSource, TxnType};
use std::collections::VecDeque;

/// The seven per-chip queues a transaction lands on based on `(type, source)`.
#[derive(Default)]
pub struct ChipQueues {
    pub user_read: VecDeque<FlashTransaction>,
    pub user_write: VecDeque<FlashTransaction>,
    pub mapping_read: VecDeque<FlashTransaction>,
    pub mapping_write: VecDeque<FlashTransaction>,
    pub gc_read: VecDeque<FlashTransaction>,
    pub gc_write: VecDeque<FlashTransaction>,
    pub gc_erase: VecDeque<FlashTransaction>,
}

impl ChipQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, txn: FlashTransaction) {
        let queue = match (txn.ty, txn.source) {
            (TxnType::Read, TxnSource::User) => &mut self.user_read,
            (TxnType::Read, TxnSource::Mapping) => &mut self.mapping_read,
            (TxnType::Read, TxnSource::Gc) => &mut self.gc_read,
            (TxnType::Write, TxnSource::User) => &mut self.user_write,
            (TxnType::Write, TxnSource::Mapping) => &mut self.mapping_write,
            (TxnType::Write, TxnSource::Gc) => &mut self.gc_write,
            (TxnType::Erase, _) => &mut self.gc_erase,
        };
        queue.push_back(txn);
    }

    fn any_reads_pending(&self) -> bool {
        !self.user_read.is_empty() || !self.mapping_read.is_empty() || !self.gc_read.is_empty()
    }

    fn any_writes_pending(&self) -> bool {
        !self.user_write.is_empty() || !self.mapping_write.is_empty() || !self.gc_write.is_empty()
    }
}

/// One die's current activity on a chip, as tracked by `fil::pipeline`,
/// needed to enforce multi-LUN legality when admitting a new batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DieActivity {
    Idle,
    /// A command of this type is in the command/data-transfer phase.
    CmdPhase(TxnType),
    /// A program has left the command phase and is executing in the array;
    /// no longer conflicts with new reads per spec §4.6.
    ProgramExecuting,
}

/// Whether `incoming` may be admitted on `die` given the whole chip's live
/// die activity: the target die must itself be idle, and no other die may
/// hold a conflicting category under the multi-LUN rule (spec §4.6) — a
/// PROGRAM in its command phase excludes READs and further PROGRAMs on
/// other dies of the same chip until it reaches array execution.
fn conflicts(die_activity: &[DieActivity], die: usize, incoming: TxnType) -> bool {
    if die_activity[die] != DieActivity::Idle {
        return true;
    }
    die_activity.iter().enumerate().any(|(i, &activity)| {
        if i == die {
            return false;
        }
        matches!(
            (activity, incoming),
            (DieActivity::CmdPhase(TxnType::Write), TxnType::Read)
                | (DieActivity::CmdPhase(TxnType::Read), TxnType::Write)
                | (DieActivity::CmdPhase(TxnType::Write), TxnType::Write)
        )
    })
}

/// Transactions chosen for one die in a dispatch round: at most one per
/// plane of that die, all sharing the same page number.
pub struct DieBatch {
    pub die: usize,
    pub page: u32,
    pub txns: Vec<FlashTransaction>,
}

pub struct DispatchPlan {
    pub kind: TxnType,
    pub batches: Vec<DieBatch>,
}

impl ChipQueues {
    /// Select the next dispatch for this chip, given live per-die activity
    /// (indexed by die) and the number of planes per die (packing limit).
    /// Returns `None` if there is nothing admissible right now.
    pub fn select_dispatch(
        &mut self,
        die_activity: &[DieActivity],
        planes_per_die: usize,
    ) -> Option<DispatchPlan> {
        if self.any_reads_pending() {
            if let Some(plan) = self.select_reads(die_activity, planes_per_die) {
                return Some(plan);
            }
        }

        if self.any_writes_pending() {
            if let Some(plan) = self.select_writes(die_activity, planes_per_die) {
                return Some(plan);
            }
        }

        self.select_erase(die_activity, planes_per_die)
    }

    fn select_reads(
        &mut self,
        die_activity: &[DieActivity],
        planes_per_die: usize,
    ) -> Option<DispatchPlan> {
        // Cascade per spec §4.6: mapping_read primary (packing from
        // user_read/gc_read), else user_read primary (packing gc_read),
        // else gc_read alone.
        let mut admitted_dies = vec![false; die_activity.len()];
        let mut batches = Vec::new();

        let drain_one = |queue: &mut VecDeque<FlashTransaction>,
                          admitted_dies: &mut Vec<bool>,
                          batches: &mut Vec<DieBatch>| {
            let mut remaining = VecDeque::new();
            while let Some(txn) = queue.pop_front() {
                let die = txn.addr.die as usize;
                if die >= admitted_dies.len()
                    || admitted_dies[die]
                    || conflicts(die_activity, die, TxnType::Read)
                {
                    remaining.push_back(txn);
                    continue;
                }
                admitted_dies[die] = true;
                let page = txn.addr.page;
                let mut group = vec![txn];
                pack_same_die_page(queue, &mut remaining, die, page, planes_per_die, &mut group);
                batches.push(DieBatch { die, page, txns: group });
            }
            *queue = remaining;
        };

        if !self.mapping_read.is_empty() {
            drain_one(&mut self.mapping_read, &mut admitted_dies, &mut batches);
            drain_one(&mut self.user_read, &mut admitted_dies, &mut batches);
            drain_one(&mut self.gc_read, &mut admitted_dies, &mut batches);
        } else if !self.user_read.is_empty() {
            drain_one(&mut self.user_read, &mut admitted_dies, &mut batches);
            drain_one(&mut self.gc_read, &mut admitted_dies, &mut batches);
        } else if !self.user_write.is_empty() {
            // No mapping/user reads pending and a user write is waiting:
            // don't let gc_read starve it by dispatching a read this
            // round, so select_dispatch falls through to select_writes.
            return None;
        } else {
            drain_one(&mut self.gc_read, &mut admitted_dies, &mut batches);
        }

        if batches.is_empty() {
            None
        } else {
            Some(DispatchPlan { kind: TxnType::Read, batches })
        }
    }

    fn select_writes(
        &mut self,
        die_activity: &[DieActivity],
        planes_per_die: usize,
    ) -> Option<DispatchPlan> {
        let primary: &mut VecDeque<FlashTransaction> = if !self.mapping_write.is_empty() {
            &mut self.mapping_write
        } else if !self.user_write.is_empty() {
            &mut self.user_write
        } else {
            &mut self.gc_write
        };

        let mut remaining = VecDeque::new();
        let mut chosen: Option<DieBatch> = None;
        while let Some(txn) = primary.pop_front() {
            if chosen.is_some() {
                remaining.push_back(txn);
                continue;
            }
            let die = txn.addr.die as usize;
            if die >= die_activity.len() || conflicts(die_activity, die, TxnType::Write) {
                remaining.push_back(txn);
                continue;
            }
            let page = txn.addr.page;
            let mut group = vec![txn];
            pack_same_die_page(primary, &mut remaining, die, page, planes_per_die, &mut group);
            chosen = Some(DieBatch { die, page, txns: group });
            // Admitting a WRITE makes the channel immediately busy; stop
            // scanning thereafter (spec §4.6).
        }
        *primary = remaining;

        chosen.map(|b| DispatchPlan { kind: TxnType::Write, batches: vec![b] })
    }

    fn select_erase(
        &mut self,
        die_activity: &[DieActivity],
        planes_per_die: usize,
    ) -> Option<DispatchPlan> {
        if self.gc_erase.is_empty() {
            return None;
        }
        let mut remaining = VecDeque::new();
        let mut admitted_dies = vec![false; die_activity.len()];
        let mut batches = Vec::new();
        while let Some(txn) = self.gc_erase.pop_front() {
            let die = txn.addr.die as usize;
            if die >= admitted_dies.len()
                || admitted_dies[die]
                || die_activity[die] != DieActivity::Idle
            {
                remaining.push_back(txn);
                continue;
            }
            admitted_dies[die] = true;
            let page = txn.addr.page;
            let mut group = vec![txn];
            pack_same_die_page(
                &mut self.gc_erase,
                &mut remaining,
                die,
                page,
                planes_per_die,
                &mut group,
            );
            batches.push(DieBatch { die, page, txns: group });
        }
        self.gc_erase = remaining;
        if batches.is_empty() {
            None
        } else {
            Some(DispatchPlan { kind: TxnType::Erase, batches })
        }
    }
}

/// Pull additional transactions out of `queue` that target the same die,
/// a different plane of that die, and the same page number as the chosen
/// candidate, up to `planes_per_die` total — forming a multi-plane command
/// (spec §4.6). Anything not matching is pushed to `remaining` to
/// preserve order for transactions left behind.
fn pack_same_die_page(
    queue: &mut VecDeque<FlashTransaction>,
    remaining: &mut VecDeque<FlashTransaction>,
    die: usize,
    page: u32,
    planes_per_die: usize,
    group: &mut Vec<FlashTransaction>,
) {
    let mut seen_planes: Vec<u32> = group.iter().map(|t| t.addr.plane).collect();
    while group.len() < planes_per_die {
        let Some(txn) = queue.pop_front() else { break };
        if txn.addr.die as usize == die
            && txn.addr.page == page
            && !seen_planes.contains(&txn.addr.plane)
        {
            seen_planes.push(txn.addr.plane);
            group.push(txn);
        } else {
            remaining.push_back(txn);
        }
    }
}

/// Per-channel round-robin cursor across the chips sharing that channel's
/// bus, for dispatch fairness (spec §4.6 "Round-robin fairness").
pub struct ChannelCursor {
    next_chip: usize,
}

impl ChannelCursor {
    pub fn new() -> Self {
        ChannelCursor { next_chip: 0 }
    }

    /// Return the next chip index to service, cycling over `nr_chips`.
    pub fn advance(&mut self, nr_chips: usize) -> usize {
        let chip = self.next_chip % nr_chips;
        self.next_chip = (self.next_chip + 1) % nr_chips;
        chip
    }
}

impl Default for ChannelCursor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::FlashAddress;

    fn txn(ty: TxnType, source: TxnSource, die: u32, plane: u32, page: u32) -> FlashTransaction {
        let mut t = FlashTransaction::new(ty, source, 1, 0);
        t.addr = FlashAddress { channel: 0, chip: 0, die, plane, block: 0, page };
        t
    }

    #[test]
    fn mapping_read_preempts_user_read() {
        let mut q = ChipQueues::new();
        q.enqueue(txn(TxnType::Read, TxnSource::User, 0, 0, 1));
        q.enqueue(txn(TxnType::Read, TxnSource::Mapping, 1, 0, 2));
        let activity = vec![DieActivity::Idle; 2];
        let plan = q.select_dispatch(&activity, 2).unwrap();
        assert_eq!(plan.kind, TxnType::Read);
        // Both dies admitted in one round since reads don't stop scanning.
        assert_eq!(plan.batches.len(), 2);
    }

    #[test]
    fn multi_plane_batch_shares_page_and_distinct_planes() {
        let mut q = ChipQueues::new();
        q.enqueue(txn(TxnType::Write, TxnSource::User, 0, 0, 7));
        q.enqueue(txn(TxnType::Write, TxnSource::User, 0, 1, 7));
        q.enqueue(txn(TxnType::Write, TxnSource::User, 0, 0, 8)); // different page, same plane as first
        let activity = vec![DieActivity::Idle; 1];
        let plan = q.select_dispatch(&activity, 2).unwrap();
        assert_eq!(plan.batches.len(), 1);
        let batch = &plan.batches[0];
        assert_eq!(batch.txns.len(), 2);
        let planes: Vec<u32> = batch.txns.iter().map(|t| t.addr.plane).collect();
        assert_ne!(planes[0], planes[1]);
        assert!(batch.txns.iter().all(|t| t.addr.page == batch.page));
    }

    #[test]
    fn write_admission_stops_after_one_die() {
        let mut q = ChipQueues::new();
        q.enqueue(txn(TxnType::Write, TxnSource::User, 0, 0, 1));
        q.enqueue(txn(TxnType::Write, TxnSource::User, 1, 0, 1));
        let activity = vec![DieActivity::Idle; 2];
        let plan = q.select_dispatch(&activity, 2).unwrap();
        assert_eq!(plan.kind, TxnType::Write);
        assert_eq!(plan.batches.len(), 1);
        // The second die's write is still queued.
        assert_eq!(q.user_write.len(), 1);
    }

    #[test]
    fn program_in_cmd_phase_blocks_read_on_other_die() {
        let mut q = ChipQueues::new();
        q.enqueue(txn(TxnType::Read, TxnSource::User, 1, 0, 1));
        let activity = vec![DieActivity::CmdPhase(TxnType::Write), DieActivity::Idle];
        let plan = q.select_dispatch(&activity, 2);
        assert!(plan.is_none());
    }

    #[test]
    fn program_executing_no_longer_blocks_reads() {
        let mut q = ChipQueues::new();
        q.enqueue(txn(TxnType::Read, TxnSource::User, 1, 0, 1));
        let activity = vec![DieActivity::ProgramExecuting, DieActivity::Idle];
        let plan = q.select_dispatch(&activity, 2);
        assert!(plan.is_some());
    }

    #[test]
    fn gc_read_does_not_starve_a_waiting_user_write() {
        let mut q = ChipQueues::new();
        q.enqueue(txn(TxnType::Read, TxnSource::Gc, 0, 0, 1));
        q.enqueue(txn(TxnType::Write, TxnSource::User, 1, 0, 1));
        let activity = vec![DieActivity::Idle; 2];
        let plan = q.select_dispatch(&activity, 2).unwrap();
        assert_eq!(plan.kind, TxnType::Write);
        assert_eq!(q.gc_read.len(), 1, "gc_read must stay queued, not dispatched ahead of the write");
    }

    #[test]
    fn gc_read_dispatches_once_no_write_is_waiting() {
        let mut q = ChipQueues::new();
        q.enqueue(txn(TxnType::Read, TxnSource::Gc, 0, 0, 1));
        let activity = vec![DieActivity::Idle; 1];
        let plan = q.select_dispatch(&activity, 2).unwrap();
        assert_eq!(plan.kind, TxnType::Read);
    }

    #[test]
    fn channel_cursor_round_robins() {
        let mut cursor = ChannelCursor::new();
        assert_eq!(cursor.advance(3), 0);
        assert_eq!(cursor.advance(3), 1);
        assert_eq!(cursor.advance(3), 2);
        assert_eq!(cursor.advance(3), 0);
    }
}

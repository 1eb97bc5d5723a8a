//! Cooperative-style synchronization primitives for worker threads (spec
//! §4.9). Grounded in `task/workqueue.rs`'s `Work` Idle/Pending/Running
//! state tracking and `task/kthread.rs`'s `park`/`unpark`, restated on
//! `std::sync::{Mutex, Condvar}` since workers here are real OS threads
//! parked by the scheduler rather than cooperative stacks multiplexed by a
//! single-core run loop — the suspension *semantics* spec §4.9 asks for
//! (a worker records why it's blocked, a timed wait reports timeout) carry
//! over even though the context-switch mechanism doesn't.

use std::cell::Cell;
use std::sync::{Condvar, MutexGuard};
use std::time::Duration;

/// Why a worker is currently blocked (spec §4.9's `BLOCKED_ON(reason)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    PcieRx,
    PcieTx,
    NvmeSq,
    Fil,
    Ecc,
    Cond,
    Lock,
    Zdma,
    Storpu,
    Flush,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    BlockedOn(BlockReason),
}

thread_local! {
    static WORKER_STATE: Cell<WorkerState> = Cell::new(WorkerState::Running);
}

/// Records this thread's current state, for introspection (e.g. by a
/// diagnostics command or test) the way the teacher's scheduler exposes
/// `Thread::state`.
pub fn set_state(state: WorkerState) {
    WORKER_STATE.with(|s| s.set(state));
}

pub fn current_state() -> WorkerState {
    WORKER_STATE.with(|s| s.get())
}

/// Brackets a call that may contend on something the worker has no wait
/// queue of its own for (a plain lock acquisition, a synchronous
/// hardware-engine call) with the matching `BLOCKED_ON` reason, the same
/// bookkeeping `CondVar::wait` does around an actual park. Restores
/// whatever state was current before the call rather than unconditionally
/// `Running`, so a nested `blocked_during` (e.g. a FLUSH outer reason
/// wrapping a per-page FIL dispatch) leaves the outer reason in place once
/// the inner call returns.
pub fn blocked_during<T>(reason: BlockReason, f: impl FnOnce() -> T) -> T {
    let previous = current_state();
    set_state(WorkerState::BlockedOn(reason));
    let result = f();
    set_state(previous);
    result
}

/// A condition variable whose `wait`/`wait_timeout` record the calling
/// worker's `BLOCKED_ON` reason for the duration of the wait, matching
/// spec §4.9's "acquiring a contended mutex/condvar suspends the current
/// worker onto its wait queue" without reimplementing a wait queue by
/// hand — `std::sync::Condvar` already is one.
#[derive(Default)]
pub struct CondVar {
    inner: Condvar,
}

impl CondVar {
    pub fn new() -> Self {
        CondVar { inner: Condvar::new() }
    }

    pub fn wait<'a, T>(&self, reason: BlockReason, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        set_state(WorkerState::BlockedOn(reason));
        let guard = self.inner.wait(guard).unwrap();
        set_state(WorkerState::Running);
        guard
    }

    /// Times out after `ms` milliseconds, returning `(guard, timed_out)`
    /// per spec §4.9's `wait_timeout(reason, ms)` / `ETIMEDOUT` contract.
    pub fn wait_timeout<'a, T>(
        &self,
        reason: BlockReason,
        guard: MutexGuard<'a, T>,
        ms: u64,
    ) -> (MutexGuard<'a, T>, bool) {
        set_state(WorkerState::BlockedOn(reason));
        let (guard, result) = self.inner.wait_timeout(guard, Duration::from_millis(ms)).unwrap();
        set_state(WorkerState::Running);
        (guard, result.timed_out())
    }

    pub fn notify_one(&self) {
        self.inner.notify_one();
    }

    pub fn notify_all(&self) {
        self.inner.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_running_and_blocked() {
        assert_eq!(current_state(), WorkerState::Running);
        set_state(WorkerState::BlockedOn(BlockReason::Lock));
        assert_eq!(current_state(), WorkerState::BlockedOn(BlockReason::Lock));
        set_state(WorkerState::Running);
        assert_eq!(current_state(), WorkerState::Running);
    }

    #[test]
    fn blocked_during_restores_running_state_after_the_call() {
        let result = blocked_during(BlockReason::Fil, || {
            assert_eq!(current_state(), WorkerState::BlockedOn(BlockReason::Fil));
            42
        });
        assert_eq!(result, 42);
        assert_eq!(current_state(), WorkerState::Running);
    }

    #[test]
    fn condvar_wait_timeout_reports_timed_out() {
        let mutex = std::sync::Mutex::new(());
        let cv = CondVar::new();
        let guard = mutex.lock().unwrap();
        let (_guard, timed_out) = cv.wait_timeout(BlockReason::Cond, guard, 10);
        assert!(timed_out);
        assert_eq!(current_state(), WorkerState::Running);
    }
}

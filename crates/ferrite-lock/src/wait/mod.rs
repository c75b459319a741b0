//! Waiter suspension and granting.
//!
//! A blocked requester suspends on its own condition variable, paired with
//! the single wait mutex. The wait mutex protects `wait_lock`, `wait_trx`,
//! and the victim and kill flags for every transaction; it is taken after
//! the lock-system mutex, never before.
//!
//! A waiter wakes for one of four reasons: its lock was granted, it was
//! chosen as a deadlock victim, the wait timed out, or the session was
//! killed. The waker clears the wait state and signals; the waiter
//! observes the outcome on wakeup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Condvar;
use tracing::debug;

use ferrite_common::types::TxnId;

use crate::mode::{LockMode, TypeMode};
use crate::object::{LockId, LockPayload};
use crate::sys::{LockStatus, LockSys, LockSysInner};

/// Per-transaction wait state, guarded by the wait mutex.
pub(crate) struct WaitState {
    /// The lock this transaction is blocked on, if any.
    pub wait_lock: Option<LockId>,
    /// The transaction it is waiting for; the waits-for graph edge.
    pub wait_trx: Option<TxnId>,
    /// Set when the deadlock detector picked this transaction to abort.
    pub chosen_as_victim: bool,
    /// Set when the session was killed while waiting.
    pub interrupted: bool,
    /// When the current wait was suspended, for the wait-time counters.
    pub suspended_at: Option<Instant>,
    /// The transaction's condition variable, paired with the wait mutex.
    pub cond: Arc<Condvar>,
}

impl WaitState {
    fn new() -> Self {
        Self {
            wait_lock: None,
            wait_trx: None,
            chosen_as_victim: false,
            interrupted: false,
            suspended_at: None,
            cond: Arc::new(Condvar::new()),
        }
    }
}

/// The waiter state machine for all registered transactions.
pub(crate) struct WaitTable {
    map: HashMap<TxnId, WaitState>,
}

impl WaitTable {
    /// Creates an empty wait table.
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Adds a transaction.
    pub fn register(&mut self, trx: TxnId) {
        self.map.insert(trx, WaitState::new());
    }

    /// Removes a transaction.
    pub fn unregister(&mut self, trx: TxnId) {
        self.map.remove(&trx);
    }

    /// Returns the wait state for a transaction.
    pub fn state(&self, trx: TxnId) -> Option<&WaitState> {
        self.map.get(&trx)
    }

    /// Returns the mutable wait state for a transaction.
    pub fn state_mut(&mut self, trx: TxnId) -> Option<&mut WaitState> {
        self.map.get_mut(&trx)
    }

    /// The waits-for edge out of `trx`, if it is blocked.
    pub fn wait_trx_of(&self, trx: TxnId) -> Option<TxnId> {
        self.map.get(&trx).and_then(|s| s.wait_trx)
    }

    /// Installs the wait state for a freshly enqueued waiting lock.
    ///
    /// The waits-for edge is set only once per wait: when a lock is
    /// re-issued during a page event the edge to the original conflicting
    /// transaction is kept.
    pub fn set_wait(&mut self, trx: TxnId, lock: LockId, conflict: Option<TxnId>) {
        let state = self.map.get_mut(&trx).expect("waiting txn not registered");
        if state.wait_trx.is_none() {
            debug_assert!(conflict.is_some());
            state.wait_trx = conflict;
        }
        state.wait_lock = Some(lock);
    }

    /// Clears the wait state of a lock's owner.
    pub fn reset_wait(&mut self, trx: TxnId) {
        if let Some(state) = self.map.get_mut(&trx) {
            state.wait_lock = None;
            state.wait_trx = None;
        }
    }
}

impl LockSys {
    /// Clears the wait flag of `lock_id` and the owner's wait state.
    pub(crate) fn reset_lock_and_trx_wait(
        &self,
        inner: &mut LockSysInner,
        waits: &mut WaitTable,
        lock_id: LockId,
    ) {
        let lock = inner.pool.lock_mut(lock_id);
        debug_assert!(lock.is_waiting());
        lock.type_mode = lock.type_mode.without(TypeMode::WAIT);
        let trx = lock.trx;
        waits.reset_wait(trx);
    }

    /// Grants a waiting lock and releases the waiting transaction.
    pub(crate) fn lock_grant(
        &self,
        inner: &mut LockSysInner,
        waits: &mut WaitTable,
        lock_id: LockId,
    ) {
        self.reset_lock_and_trx_wait(inner, waits, lock_id);

        let lock = inner.pool.lock(lock_id);
        let trx = lock.trx;
        let autoinc_table = match (&lock.payload, lock.mode()) {
            (LockPayload::Table(t), LockMode::AutoInc) => Some(t.table),
            _ => None,
        };
        if let Some(table) = autoinc_table {
            let state = inner.table_state(table);
            debug_assert!(state.autoinc_trx.is_none());
            state.autoinc_trx = Some(trx);
            if let Some(desc) = inner.txn_mut(trx) {
                desc.autoinc_locks.push(lock_id);
            }
        }

        debug!(trx = trx.as_u64(), "lock wait ends");
        self.signal_wait_end(waits, trx);
    }

    /// Wakes a transaction whose wait has been resolved.
    pub(crate) fn signal_wait_end(&self, waits: &mut WaitTable, trx: TxnId) {
        if let Some(state) = waits.state_mut(trx) {
            state.cond.notify_one();
        }
    }

    /// Cancels a waiting lock request and releases the waiting
    /// transaction. Waiters behind the canceled request are granted if the
    /// cancellation unblocks them.
    pub(crate) fn cancel_waiting_and_release(
        &self,
        inner: &mut LockSysInner,
        waits: &mut WaitTable,
        lock_id: LockId,
    ) {
        let (is_table, trx) = {
            let lock = inner.pool.lock(lock_id);
            (lock.is_table(), lock.trx)
        };

        if is_table {
            // A statement abandoning a table wait also gives up the
            // AUTO_INC locks it piled up, in reverse order.
            self.release_autoinc_locks(inner, waits, trx);
            self.table_dequeue(inner, waits, lock_id);
        } else {
            self.rec_dequeue_from_page(inner, waits, lock_id);
        }

        self.signal_wait_end(waits, trx);
    }

    /// Delivers a session-kill signal to a waiting transaction.
    ///
    /// The waiter observes the interrupt on wakeup, cancels its waiting
    /// lock, and returns [`LockStatus::Interrupted`].
    pub fn kill(&self, trx: TxnId) {
        let mut waits = self.waits.lock();
        if let Some(state) = waits.state_mut(trx) {
            state.interrupted = true;
            state.cond.notify_one();
        }
    }

    /// Blocks the calling thread until the transaction's pending lock
    /// request is resolved.
    ///
    /// Returns the terminal outcome of the wait:
    /// - [`LockStatus::Success`] once the lock was granted,
    /// - [`LockStatus::Deadlock`] if the transaction was chosen as a
    ///   deadlock victim,
    /// - [`LockStatus::Timeout`] if the configured wait timeout elapsed,
    /// - [`LockStatus::Interrupted`] if the session was killed.
    ///
    /// Must be called by the thread serving the transaction, after a
    /// request returned [`LockStatus::LockWait`].
    pub fn wait(&self, trx: TxnId) -> LockStatus {
        let deadline = Instant::now().checked_add(self.config.lock_wait_timeout);

        let mut waits = self.waits.lock();
        let Some(state) = waits.state_mut(trx) else {
            return LockStatus::Success;
        };

        // A kill delivered while the transaction was not waiting is a
        // no-op; only a kill observed during this wait interrupts it.
        state.interrupted = false;

        if state.wait_lock.is_none() {
            // Granted, or victimized, before we got here.
            if std::mem::take(&mut state.chosen_as_victim) {
                return LockStatus::Deadlock;
            }
            return LockStatus::Success;
        }

        state.suspended_at = Some(Instant::now());
        let cond = state.cond.clone();
        self.stats.record_wait_start();
        debug!(trx = trx.as_u64(), "lock wait begins");

        let mut timed_out = false;
        let mut interrupted = false;
        loop {
            let state = waits.state_mut(trx).expect("waiter unregistered mid-wait");
            if state.wait_lock.is_none() {
                break;
            }
            if std::mem::take(&mut state.interrupted) {
                interrupted = true;
                break;
            }
            match deadline {
                Some(deadline) => {
                    if cond.wait_until(&mut waits, deadline).timed_out() {
                        let state = waits.state_mut(trx).expect("waiter unregistered mid-wait");
                        if state.wait_lock.is_some() {
                            timed_out = true;
                        }
                        break;
                    }
                }
                None => cond.wait(&mut waits),
            }
        }

        if let Some(suspended_at) = waits
            .state_mut(trx)
            .and_then(|s| s.suspended_at.take())
        {
            self.stats.record_wait_resume(suspended_at.elapsed());
        }
        let victim = waits
            .state_mut(trx)
            .map(|s| std::mem::take(&mut s.chosen_as_victim))
            .unwrap_or(false);
        drop(waits);

        if victim {
            return LockStatus::Deadlock;
        }
        if !timed_out && !interrupted {
            return LockStatus::Success;
        }

        // Timeout or kill: cancel the still-pending request under both
        // mutexes, then re-check the outcome in case it was resolved at
        // the wire.
        let mut inner = self.inner.lock();
        let mut waits = self.waits.lock();
        let pending = waits.state(trx).and_then(|s| s.wait_lock);
        if let Some(lock_id) = pending {
            self.cancel_waiting_and_release(&mut inner, &mut waits, lock_id);
        }
        let victim = waits
            .state_mut(trx)
            .map(|s| std::mem::take(&mut s.chosen_as_victim))
            .unwrap_or(false);
        drop(waits);
        drop(inner);

        if victim {
            LockStatus::Deadlock
        } else if interrupted {
            LockStatus::Interrupted
        } else if pending.is_none() {
            // Granted between timing out and reacquiring the mutexes.
            LockStatus::Success
        } else {
            self.stats.record_timeout();
            LockStatus::Timeout
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrite_common::types::IsolationLevel;

    #[test]
    fn test_wait_without_pending_lock_is_success() {
        let sys = LockSys::new();
        let t1 = TxnId::new(1);
        sys.register_txn(t1, IsolationLevel::RepeatableRead);
        assert_eq!(sys.wait(t1), LockStatus::Success);
    }

    #[test]
    fn test_wait_unknown_txn_is_success() {
        let sys = LockSys::new();
        assert_eq!(sys.wait(TxnId::new(99)), LockStatus::Success);
    }

    #[test]
    fn test_victim_flag_consumed_without_wait_lock() {
        let sys = LockSys::new();
        let t1 = TxnId::new(1);
        sys.register_txn(t1, IsolationLevel::RepeatableRead);
        sys.waits.lock().state_mut(t1).unwrap().chosen_as_victim = true;
        assert_eq!(sys.wait(t1), LockStatus::Deadlock);
        // Consumed: a second wait succeeds.
        assert_eq!(sys.wait(t1), LockStatus::Success);
    }

    #[test]
    fn test_wait_times_out_and_cancels() {
        use crate::mode::GapMode;
        use crate::object::{IndexRef, PageRef};
        use ferrite_common::types::{HeapNo, IndexId, PageId, TableId};
        use std::sync::atomic::Ordering as AtomicOrdering;
        use std::time::Duration;

        let mut config = crate::sys::LockSysConfig::default();
        config.lock_wait_timeout = Duration::from_millis(30);
        let sys = LockSys::with_config(config);
        let t1 = TxnId::new(1);
        let t2 = TxnId::new(2);
        sys.register_txn(t1, IsolationLevel::RepeatableRead);
        sys.register_txn(t2, IsolationLevel::RepeatableRead);

        let page = PageRef::new(PageId::new(7), 16);
        let index = IndexRef::clustered(IndexId::new(1), TableId::new(1));
        let h3 = HeapNo::new(3);

        sys.request_record_lock(
            t1,
            crate::mode::LockMode::Exclusive,
            GapMode::RecNotGap,
            page,
            h3,
            index,
            false,
        );
        sys.request_record_lock(
            t2,
            crate::mode::LockMode::Shared,
            GapMode::Ordinary,
            page,
            h3,
            index,
            false,
        );

        assert_eq!(sys.wait(t2), LockStatus::Timeout);
        // The waiting lock was canceled along with the wait.
        assert_eq!(sys.rec_lock_count(), 1);
        assert!(sys.stats().timeouts.load(AtomicOrdering::Relaxed) >= 1);
        let waits = sys.waits.lock();
        assert!(waits.state(t2).unwrap().wait_lock.is_none());
    }

    #[test]
    fn test_kill_interrupts_waiter() {
        use crate::mode::GapMode;
        use crate::object::{IndexRef, PageRef};
        use ferrite_common::types::{HeapNo, IndexId, PageId, TableId};
        use std::sync::{mpsc, Arc};

        let sys = Arc::new(LockSys::new());
        let t1 = TxnId::new(1);
        let t2 = TxnId::new(2);
        sys.register_txn(t1, IsolationLevel::RepeatableRead);
        sys.register_txn(t2, IsolationLevel::RepeatableRead);

        let page = PageRef::new(PageId::new(7), 16);
        let index = IndexRef::clustered(IndexId::new(1), TableId::new(1));
        let h3 = HeapNo::new(3);

        sys.request_record_lock(
            t1,
            crate::mode::LockMode::Exclusive,
            GapMode::RecNotGap,
            page,
            h3,
            index,
            false,
        );
        sys.request_record_lock(
            t2,
            crate::mode::LockMode::Shared,
            GapMode::Ordinary,
            page,
            h3,
            index,
            false,
        );

        let (tx, rx) = mpsc::channel();
        let sys2 = Arc::clone(&sys);
        let waiter = std::thread::spawn(move || {
            tx.send(sys2.wait(t2)).unwrap();
        });

        // Let the waiter suspend, then kill its session.
        while sys
            .stats()
            .wait_pending
            .load(std::sync::atomic::Ordering::Relaxed)
            == 0
        {
            std::thread::yield_now();
        }
        sys.kill(t2);

        assert_eq!(rx.recv().unwrap(), LockStatus::Interrupted);
        waiter.join().unwrap();
        assert_eq!(sys.rec_lock_count(), 1);
    }

    #[test]
    fn test_kill_before_wait_without_lock() {
        let sys = LockSys::new();
        let t1 = TxnId::new(1);
        sys.register_txn(t1, IsolationLevel::RepeatableRead);
        sys.kill(t1);
        // No pending lock: the interrupt flag is irrelevant, the wait
        // resolves immediately.
        assert_eq!(sys.wait(t1), LockStatus::Success);
    }
}

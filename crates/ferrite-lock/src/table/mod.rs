//! Table-level locking.
//!
//! Each table carries a doubly linked queue of table locks plus counters.
//! IS and IX requests take a fast path that skips the queue scan while no
//! S or X lock is granted or waiting. AUTO_INC locks are additionally
//! tracked in a per-transaction stack so that statement end releases them
//! in reverse acquisition order.

use tracing::{debug, error};

use ferrite_common::error::{FerriteError, FerriteResult};
use ferrite_common::types::{TableId, TxnId};

use crate::mode::{LockMode, TypeMode};
use crate::object::{LockId, LockPayload};
use crate::record::lock_has_to_wait;
use crate::sys::{LockStatus, LockSys, LockSysInner};
use crate::wait::WaitTable;

impl LockSysInner {
    /// Checks if `trx` holds a granted table lock dominating `mode`.
    pub(crate) fn table_has(&self, trx: TxnId, table: TableId, mode: LockMode) -> bool {
        let Some(desc) = self.txn(trx) else {
            return false;
        };
        desc.table_locks.iter().any(|&id| {
            let lock = self.pool.lock(id);
            match &lock.payload {
                LockPayload::Table(t) => {
                    t.table == table && !lock.is_waiting() && lock.mode().is_stronger_or_eq(mode)
                }
                LockPayload::Rec(_) => false,
            }
        })
    }

    /// Scans the table queue, newest first, for a lock of another
    /// transaction that is incompatible with `mode`.
    ///
    /// With `include_waiting` waiting requests also count, so that a new
    /// request queues fairly behind them. Intention requests short-circuit
    /// through the `n_lock_x_or_s` counter.
    pub(crate) fn table_other_has_incompatible(
        &self,
        trx: TxnId,
        include_waiting: bool,
        table: TableId,
        mode: LockMode,
    ) -> Option<LockId> {
        let state = self.tables.get(&table)?;
        if matches!(
            mode,
            LockMode::IntentionShared | LockMode::IntentionExclusive
        ) && state.n_lock_x_or_s == 0
        {
            return None;
        }

        state.queue.iter().rev().copied().find(|&id| {
            let lock = self.pool.lock(id);
            lock.trx != trx
                && !lock.mode().is_compatible_with(mode)
                && (include_waiting || !lock.is_waiting())
        })
    }

    /// Finds the lock a waiting table lock still has to wait for: an
    /// earlier lock in the queue that conflicts.
    pub(crate) fn table_has_to_wait_in_queue(&self, wait_id: LockId) -> Option<LockId> {
        let wait_lock = self.pool.lock(wait_id);
        debug_assert!(wait_lock.is_waiting() && wait_lock.is_table());
        let table = wait_lock.table_id();
        let state = self.tables.get(&table)?;

        if matches!(
            wait_lock.mode(),
            LockMode::IntentionShared | LockMode::IntentionExclusive
        ) && state.n_lock_x_or_s == 0
        {
            return None;
        }

        for &id in &state.queue {
            if id == wait_id {
                break;
            }
            if lock_has_to_wait(wait_lock, self.pool.lock(id)) {
                return Some(id);
            }
        }
        None
    }
}

impl LockSys {
    /// Creates a table lock and appends it at the tail of the table
    /// queue. Does not check for conflicts.
    pub(crate) fn table_create(
        &self,
        inner: &mut LockSysInner,
        waits: &mut WaitTable,
        table: TableId,
        type_mode: TypeMode,
        trx: TxnId,
        conflict: Option<TxnId>,
    ) -> LockId {
        debug_assert!(type_mode.is_table());

        let id = inner.pool.alloc_table(trx, type_mode, table);
        {
            let state = inner.table_state(table);
            match type_mode.mode() {
                LockMode::AutoInc => {
                    state.n_waiting_or_granted_auto_inc += 1;
                    if !type_mode.is_waiting() {
                        debug_assert!(state.autoinc_trx.is_none());
                        state.autoinc_trx = Some(trx);
                    }
                }
                LockMode::Shared | LockMode::Exclusive => state.n_lock_x_or_s += 1,
                _ => {}
            }
            state.queue.push(id);
        }

        if let Some(desc) = inner.txn_mut(trx) {
            desc.locks.push(id);
            desc.table_locks.push(id);
            if type_mode.mode() == LockMode::AutoInc && !type_mode.is_waiting() {
                desc.autoinc_locks.push(id);
            }
        }

        if type_mode.is_waiting() {
            waits.set_wait(trx, id, conflict);
        }
        id
    }

    /// Removes a table lock from the queue and the owner's lists without
    /// granting waiters.
    pub(crate) fn table_remove_low(&self, inner: &mut LockSysInner, lock_id: LockId) {
        let (table, mode, waiting, trx) = {
            let lock = inner.pool.lock(lock_id);
            (lock.table_id(), lock.mode(), lock.is_waiting(), lock.trx)
        };

        {
            let state = inner.table_state(table);
            match mode {
                LockMode::AutoInc => {
                    debug_assert_eq!(state.autoinc_trx == Some(trx), !waiting);
                    if state.autoinc_trx == Some(trx) {
                        state.autoinc_trx = None;
                    }
                    debug_assert!(state.n_waiting_or_granted_auto_inc > 0);
                    state.n_waiting_or_granted_auto_inc -= 1;
                }
                LockMode::Shared | LockMode::Exclusive => {
                    debug_assert!(state.n_lock_x_or_s > 0);
                    state.n_lock_x_or_s -= 1;
                }
                _ => {}
            }
            if let Some(pos) = state.queue.iter().position(|&l| l == lock_id) {
                state.queue.remove(pos);
            }
        }

        Self::detach_from_trx(inner, lock_id);
        inner.pool.free(lock_id);
    }

    /// Removes a table lock, waiting or granted, and grants eligible
    /// waiters behind it in queue order.
    pub(crate) fn table_dequeue(
        &self,
        inner: &mut LockSysInner,
        waits: &mut WaitTable,
        in_lock: LockId,
    ) {
        let (table, mode, waiting, owner) = {
            let lock = inner.pool.lock(in_lock);
            debug_assert!(lock.is_table());
            (lock.table_id(), lock.mode(), lock.is_waiting(), lock.trx)
        };
        let queue_pos = inner
            .tables
            .get(&table)
            .and_then(|s| s.queue.iter().position(|&l| l == in_lock))
            .unwrap_or(0);

        self.table_remove_low(inner, in_lock);
        if waiting {
            waits.reset_wait(owner);
        }

        // Releasing an intention lock cannot unblock anyone while no S or
        // X lock exists on the table.
        if matches!(
            mode,
            LockMode::IntentionShared | LockMode::IntentionExclusive
        ) && inner
            .tables
            .get(&table)
            .map(|s| s.n_lock_x_or_s == 0)
            .unwrap_or(true)
        {
            return;
        }

        let tail: Vec<LockId> = inner
            .tables
            .get(&table)
            .map(|s| s.queue[queue_pos.min(s.queue.len())..].to_vec())
            .unwrap_or_default();
        for id in tail {
            let Some(lock) = inner.pool.get(id) else {
                continue;
            };
            if !lock.is_waiting() {
                continue;
            }
            let waiter = lock.trx;
            match inner.table_has_to_wait_in_queue(id) {
                Some(c) => {
                    let c_trx = inner.pool.lock(c).trx;
                    if let Some(state) = waits.state_mut(waiter) {
                        state.wait_trx = Some(c_trx);
                    }
                }
                None => self.lock_grant(inner, waits, id),
            }
        }
    }

    /// Enqueues a waiting table-lock request and runs the deadlock check.
    fn table_enqueue_waiting(
        &self,
        inner: &mut LockSysInner,
        waits: &mut WaitTable,
        table: TableId,
        mode: LockMode,
        trx: TxnId,
        c_lock: LockId,
    ) -> LockStatus {
        if self.config.lock_wait_timeout.is_zero() {
            self.stats.record_timeout();
            return LockStatus::Timeout;
        }

        let c_trx = inner.pool.lock(c_lock).trx;
        if let Some(state) = waits.state_mut(trx) {
            state.chosen_as_victim = false;
        }
        let lock_id = self.table_create(
            inner,
            waits,
            table,
            TypeMode::table(mode).with(TypeMode::WAIT),
            trx,
            Some(c_trx),
        );
        debug!(
            trx = trx.as_u64(),
            table = table.as_u64(),
            %mode,
            "waiting for table lock"
        );

        if self.check_and_resolve(inner, waits, trx) {
            if waits.state(trx).and_then(|s| s.wait_lock).is_some() {
                self.cancel_waiting_and_release(inner, waits, lock_id);
            }
            return LockStatus::Deadlock;
        }
        LockStatus::LockWait
    }

    /// Locks a table in the given mode, enqueuing a waiting request when
    /// the mode conflicts with locks held by other transactions.
    pub fn lock_table(
        &self,
        trx: TxnId,
        table: TableId,
        mode: LockMode,
    ) -> FerriteResult<LockStatus> {
        let mut inner = self.inner.lock();
        let mut waits = self.waits.lock();
        if inner.txn(trx).is_none() {
            return Err(FerriteError::TransactionNotFound { txn_id: trx });
        }

        // An equal or stronger lock already held covers the request.
        if inner.table_has(trx, table, mode) {
            return Ok(LockStatus::Success);
        }

        match inner.table_other_has_incompatible(trx, true, table, mode) {
            Some(c_lock) => {
                Ok(self.table_enqueue_waiting(&mut inner, &mut waits, table, mode, trx, c_lock))
            }
            None => {
                self.table_create(&mut inner, &mut waits, table, TypeMode::table(mode), trx, None);
                Ok(LockStatus::Success)
            }
        }
    }

    /// Locks a table for a dictionary operation on behalf of `trx`.
    ///
    /// Restricted to S and X; the caller drives the wait itself.
    pub fn lock_table_for_trx(
        &self,
        trx: TxnId,
        table: TableId,
        mode: LockMode,
    ) -> FerriteResult<LockStatus> {
        debug_assert!(matches!(mode, LockMode::Shared | LockMode::Exclusive));
        self.lock_table(trx, table, mode)
    }

    /// Releases a granted X table lock, used when rolling back an insert
    /// into an empty table.
    pub fn table_x_unlock(&self, trx: TxnId, table: TableId) {
        let mut inner = self.inner.lock();
        let mut waits = self.waits.lock();

        let held = inner.txn(trx).and_then(|desc| {
            desc.table_locks.iter().copied().find(|&id| {
                let lock = inner.pool.lock(id);
                lock.table_id() == table
                    && lock.mode() == LockMode::Exclusive
                    && !lock.is_waiting()
            })
        });

        match held {
            Some(id) => self.table_dequeue(&mut inner, &mut waits, id),
            None => error!(
                trx = trx.as_u64(),
                table = table.as_u64(),
                "X unlock could not find a granted table lock"
            ),
        }
    }

    /// Releases every granted AUTO_INC lock of `trx` in reverse
    /// acquisition order.
    pub(crate) fn release_autoinc_locks(
        &self,
        inner: &mut LockSysInner,
        waits: &mut WaitTable,
        trx: TxnId,
    ) {
        while let Some(&last) = inner.txn(trx).and_then(|d| d.autoinc_locks.last()) {
            self.table_dequeue(inner, waits, last);
        }
    }

    /// Releases the AUTO_INC locks reserved by `trx`, called at statement
    /// end by the thread serving the transaction.
    pub fn unlock_table_autoinc(&self, trx: TxnId) {
        let mut inner = self.inner.lock();
        let holds = inner
            .txn(trx)
            .map(|d| !d.autoinc_locks.is_empty())
            .unwrap_or(false);
        if holds {
            let mut waits = self.waits.lock();
            self.release_autoinc_locks(&mut inner, &mut waits, trx);
        }
    }
}

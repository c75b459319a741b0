//! Record-lock acquisition and release.
//!
//! A record lock names a (page, heap slot) pair: all locks for a page live
//! in one hash chain whose order is the queue order, and each lock carries
//! a bitmap with one bit per heap slot. A request is granted by setting a
//! bit on a compatible existing lock of the same transaction, or by
//! appending a fresh lock; it waits when a conflicting granted or earlier
//! waiting lock covers the slot.
//!
//! The row-operation entry points (`insert_check`, `clust_rec_modify`,
//! `sec_rec_modify`, `clust_rec_read`, `sec_rec_read`) wrap the core
//! request with implicit-lock conversion and the insert-intention rules.

use tracing::{debug, error};

use ferrite_common::error::{FerriteError, FerriteResult};
use ferrite_common::types::{HeapNo, PageId, TxnId};

use crate::hash::HashKind;
use crate::mode::{rec_has_to_wait, GapMode, LockMode, TypeMode};
use crate::object::{IndexRef, Lock, LockId, PageRef};
use crate::sys::{LockStatus, LockSys, LockSysInner, RequestStatus};
use crate::wait::WaitTable;

/// Decides whether waiting lock `l1` still has to wait for `l2`, which
/// holds a bit on the same record (or sits in the same table queue).
pub(crate) fn lock_has_to_wait(l1: &Lock, l2: &Lock) -> bool {
    if l1.trx == l2.trx || l1.mode().is_compatible_with(l2.mode()) {
        return false;
    }

    if l1.is_table() {
        return true;
    }
    debug_assert!(!l2.is_table());

    if l1.type_mode.is_predicate() {
        // Mode conflict on the same predicate anchor; geometric overlap
        // filtering belongs to the spatial index layer.
        return true;
    }

    rec_has_to_wait(
        l1.trx,
        l1.type_mode,
        l2.trx,
        l2.type_mode,
        l1.rec().nth_bit(HeapNo::SUPREMUM),
    )
}

impl LockSysInner {
    /// Returns the locks covering (`page`, `heap_no`) in queue order.
    pub(crate) fn locks_on_heap(
        &self,
        kind: HashKind,
        page: PageId,
        heap_no: HeapNo,
    ) -> Vec<LockId> {
        self.hash_of(kind)
            .locks_on_page(&self.pool, page)
            .into_iter()
            .filter(|&id| self.pool.lock(id).rec().nth_bit(heap_no))
            .collect()
    }

    /// Checks if `trx` has a granted lock stronger than or equal to
    /// `precise_mode` on the record.
    ///
    /// For a supremum record any gap flavor dominates, since every lock
    /// there is a gap lock.
    pub(crate) fn rec_has_expl(
        &self,
        precise_mode: TypeMode,
        page: PageId,
        heap_no: HeapNo,
        trx: TxnId,
    ) -> Option<LockId> {
        debug_assert!(matches!(
            precise_mode.mode(),
            LockMode::Shared | LockMode::Exclusive
        ));
        debug_assert!(!precise_mode.is_insert_intention());

        self.locks_on_heap(HashKind::Rec, page, heap_no)
            .into_iter()
            .find(|&id| {
                let lock = self.pool.lock(id);
                lock.trx == trx
                    && !lock
                        .type_mode
                        .has(TypeMode::WAIT | TypeMode::INSERT_INTENTION)
                    && (!lock.type_mode.has(TypeMode::GAP | TypeMode::REC_NOT_GAP)
                        || heap_no.is_supremum()
                        || (lock.type_mode.is_gap() && precise_mode.is_gap())
                        || (lock.type_mode.is_record_not_gap()
                            && precise_mode.is_record_not_gap()))
                    && lock.mode().is_stronger_or_eq(precise_mode.mode())
            })
    }

    /// Finds the first lock of another transaction that conflicts with a
    /// request for `mode` on the record.
    pub(crate) fn rec_other_has_conflicting(
        &self,
        mode: TypeMode,
        page: PageId,
        heap_no: HeapNo,
        trx: TxnId,
    ) -> Option<LockId> {
        let is_supremum = heap_no.is_supremum();
        self.locks_on_heap(HashKind::Rec, page, heap_no)
            .into_iter()
            .find(|&id| {
                let lock = self.pool.lock(id);
                rec_has_to_wait(trx, mode, lock.trx, lock.type_mode, is_supremum)
            })
    }

    /// Looks for a record lock of the same transaction and `type_mode` on
    /// the page whose bitmap can take one more bit.
    pub(crate) fn rec_find_similar_on_page(
        &self,
        type_mode: TypeMode,
        heap_no: HeapNo,
        page: PageId,
        trx: TxnId,
    ) -> Option<LockId> {
        self.hash(type_mode)
            .locks_on_page(&self.pool, page)
            .into_iter()
            .find(|&id| {
                let lock = self.pool.lock(id);
                lock.trx == trx
                    && lock.type_mode == type_mode
                    && lock.rec().n_bits > heap_no.as_u32()
            })
    }

    /// Finds the lock a waiting record lock still has to wait for: a lock
    /// earlier in the page queue with a bit on the same slot that
    /// conflicts.
    pub(crate) fn rec_has_to_wait_in_queue(&self, wait_id: LockId) -> Option<LockId> {
        let wait_lock = self.pool.lock(wait_id);
        debug_assert!(wait_lock.is_waiting() && !wait_lock.is_table());
        let heap_no = wait_lock
            .rec()
            .find_set_bit()
            .expect("waiting record lock has a set bit");
        let page = wait_lock.rec().page_id;

        for id in self.hash(wait_lock.type_mode).locks_on_page(&self.pool, page) {
            if id == wait_id {
                break;
            }
            let lock = self.pool.lock(id);
            if lock.rec().nth_bit(heap_no) && lock_has_to_wait(wait_lock, lock) {
                return Some(id);
            }
        }
        None
    }
}

impl LockSys {
    /// Creates a record lock and appends it at the tail of the page queue.
    ///
    /// Does not check for conflicts. On the supremum the gap flavors are
    /// cleared, since every lock there is a gap lock. A predicate lock
    /// always anchors on the infimum.
    pub(crate) fn rec_create(
        &self,
        inner: &mut LockSysInner,
        waits: &mut WaitTable,
        mut type_mode: TypeMode,
        page: PageRef,
        heap_no: HeapNo,
        index: IndexRef,
        trx: TxnId,
        conflict: Option<TxnId>,
    ) -> LockId {
        let mut set_heap = heap_no;
        if heap_no.is_supremum() {
            debug_assert!(!type_mode.is_record_not_gap());
            type_mode = type_mode.without(TypeMode::GAP | TypeMode::REC_NOT_GAP);
        }

        let n_bits = if type_mode.is_predicate() {
            set_heap = HeapNo::INFIMUM;
            8
        } else {
            debug_assert!(heap_no.as_u32() < page.heap_count);
            (page.heap_count + 7) / 8 * 8
        };

        let id = inner
            .pool
            .alloc_rec(trx, type_mode, page.id, index, n_bits);
        inner.pool.lock_mut(id).rec_mut().set_nth_bit(set_heap);
        inner.hash_mut(type_mode).insert(page.id, id);
        inner.table_state(index.table).n_rec_locks += 1;
        if let Some(desc) = inner.txn_mut(trx) {
            desc.locks.push(id);
        }
        if type_mode.is_waiting() {
            waits.set_wait(trx, id, conflict);
        }
        id
    }

    /// Adds a record lock request to the page queue.
    ///
    /// A granted request reuses a suitable lock of the same transaction by
    /// setting one more bit, but only when no waiter on the slot sits in
    /// the queue; otherwise a fresh lock goes to the tail so that queue
    /// position keeps encoding grant order.
    pub(crate) fn rec_add_to_queue(
        &self,
        inner: &mut LockSysInner,
        waits: &mut WaitTable,
        mut type_mode: TypeMode,
        page: PageRef,
        heap_no: HeapNo,
        index: IndexRef,
        trx: TxnId,
    ) -> LockId {
        if heap_no.is_supremum() {
            type_mode = type_mode.without(TypeMode::GAP | TypeMode::REC_NOT_GAP);
        }

        if !type_mode.is_waiting() {
            let on_page = inner.hash(type_mode).locks_on_page(&inner.pool, page.id);
            if !on_page.is_empty() {
                let waiter_on_slot = on_page.iter().any(|&id| {
                    let lock = inner.pool.lock(id);
                    lock.is_waiting() && lock.rec().nth_bit(heap_no)
                });
                if !waiter_on_slot {
                    if let Some(similar) =
                        inner.rec_find_similar_on_page(type_mode, heap_no, page.id, trx)
                    {
                        inner.pool.lock_mut(similar).rec_mut().set_nth_bit(heap_no);
                        return similar;
                    }
                }
            }
        }

        self.rec_create(inner, waits, type_mode, page, heap_no, index, trx, None)
    }

    /// Enqueues a waiting record-lock request and runs the deadlock check.
    ///
    /// With a zero lock-wait timeout the request fails fast without
    /// enqueuing. If the cycle search picks the requester as the victim,
    /// the just-installed lock is removed again and the requester returns
    /// without ever sleeping.
    pub(crate) fn rec_enqueue_waiting(
        &self,
        inner: &mut LockSysInner,
        waits: &mut WaitTable,
        type_mode: TypeMode,
        page: PageRef,
        heap_no: HeapNo,
        index: IndexRef,
        trx: TxnId,
        c_lock: LockId,
    ) -> RequestStatus {
        if self.config.lock_wait_timeout.is_zero() {
            self.stats.record_timeout();
            return RequestStatus::Timeout;
        }

        let c_trx = inner.pool.lock(c_lock).trx;
        if let Some(state) = waits.state_mut(trx) {
            state.chosen_as_victim = false;
        }
        let lock_id = self.rec_create(
            inner,
            waits,
            type_mode.with(TypeMode::WAIT),
            page,
            heap_no,
            index,
            trx,
            Some(c_trx),
        );
        debug!(
            trx = trx.as_u64(),
            page = page.id.as_u64(),
            heap = heap_no.as_u32(),
            "waiting for record lock"
        );

        if self.check_and_resolve(inner, waits, trx) {
            if waits.state(trx).and_then(|s| s.wait_lock).is_some() {
                self.cancel_waiting_and_release(inner, waits, lock_id);
            }
            return RequestStatus::Deadlock;
        }
        RequestStatus::Waiting
    }

    /// The record-lock request core.
    ///
    /// With `implicit_only` the caller keeps ownership encoded in the row
    /// and no lock is materialized unless the request must wait.
    fn rec_lock(
        &self,
        inner: &mut LockSysInner,
        waits: &mut WaitTable,
        implicit_only: bool,
        type_mode: TypeMode,
        page: PageRef,
        heap_no: HeapNo,
        index: IndexRef,
        trx: TxnId,
    ) -> RequestStatus {
        debug_assert!(matches!(
            type_mode.mode(),
            LockMode::Shared | LockMode::Exclusive
        ));
        debug_assert!(!(type_mode.is_gap() && type_mode.is_record_not_gap()));

        // A table lock dominating the requested mode already covers the
        // record.
        if inner.table_has(trx, index.table, type_mode.mode()) {
            return RequestStatus::GrantedExisting;
        }

        let on_page = inner.rec_hash.locks_on_page(&inner.pool, page.id);
        if on_page.is_empty() {
            // First caller on the page: no queue to scan.
            if !implicit_only {
                self.rec_create(inner, waits, type_mode, page, heap_no, index, trx, None);
            }
            return RequestStatus::GrantedNew;
        }

        if on_page.len() == 1 {
            let only = on_page[0];
            let lock = inner.pool.lock(only);
            if lock.trx == trx
                && lock.type_mode == type_mode
                && lock.rec().n_bits > heap_no.as_u32()
            {
                if implicit_only {
                    return RequestStatus::GrantedExisting;
                }
                return if inner.pool.lock(only).rec().nth_bit(heap_no) {
                    RequestStatus::GrantedExisting
                } else {
                    inner.pool.lock_mut(only).rec_mut().set_nth_bit(heap_no);
                    RequestStatus::GrantedNew
                };
            }
        }

        if inner.rec_has_expl(type_mode, page.id, heap_no, trx).is_some() {
            return RequestStatus::GrantedExisting;
        }

        if let Some(c_lock) = inner.rec_other_has_conflicting(type_mode, page.id, heap_no, trx) {
            return self
                .rec_enqueue_waiting(inner, waits, type_mode, page, heap_no, index, trx, c_lock);
        }

        if implicit_only {
            RequestStatus::GrantedExisting
        } else {
            self.rec_add_to_queue(inner, waits, type_mode, page, heap_no, index, trx);
            RequestStatus::GrantedNew
        }
    }

    /// Requests a record lock of `mode` with the given gap flavor.
    ///
    /// The transaction must have been registered. On `Waiting` the caller
    /// suspends via [`LockSys::wait`]; on `Timeout` the configured wait
    /// timeout is zero and the request failed fast.
    pub fn request_record_lock(
        &self,
        trx: TxnId,
        mode: LockMode,
        gap: GapMode,
        page: PageRef,
        heap_no: HeapNo,
        index: IndexRef,
        implicit_only: bool,
    ) -> RequestStatus {
        let mut inner = self.inner.lock();
        let mut waits = self.waits.lock();
        debug_assert!(inner.txn(trx).is_some());
        self.rec_lock(
            &mut inner,
            &mut waits,
            implicit_only,
            TypeMode::rec_with_gap(mode, gap),
            page,
            heap_no,
            index,
            trx,
        )
    }

    /// Removes a record lock from the page queue and grants eligible
    /// waiters behind it.
    pub(crate) fn rec_dequeue_from_page(
        &self,
        inner: &mut LockSysInner,
        waits: &mut WaitTable,
        in_lock: LockId,
    ) {
        let (page, type_mode, table, owner) = {
            let lock = inner.pool.lock(in_lock);
            (
                lock.rec().page_id,
                lock.type_mode,
                lock.table_id(),
                lock.trx,
            )
        };

        inner.table_state(table).n_rec_locks -= 1;
        inner.hash_mut(type_mode).remove(page, in_lock);
        Self::detach_from_trx(inner, in_lock);
        if type_mode.is_waiting() {
            waits.reset_wait(owner);
        }
        inner.pool.free(in_lock);

        self.rec_grant_waiters_on_page(inner, waits, LockSysInner::hash_kind(type_mode), page);
    }

    /// Re-scans a page queue and grants every waiter no longer blocked;
    /// a still-blocked waiter gets its waits-for edge repointed at the
    /// first lock it still conflicts with.
    pub(crate) fn rec_grant_waiters_on_page(
        &self,
        inner: &mut LockSysInner,
        waits: &mut WaitTable,
        kind: HashKind,
        page: PageId,
    ) {
        for id in inner.hash_of(kind).locks_on_page(&inner.pool, page) {
            let Some(lock) = inner.pool.get(id) else {
                continue;
            };
            if !lock.is_waiting() {
                continue;
            }
            let owner = lock.trx;
            match inner.rec_has_to_wait_in_queue(id) {
                Some(c) => {
                    let c_trx = inner.pool.lock(c).trx;
                    if let Some(state) = waits.state_mut(owner) {
                        state.wait_trx = Some(c_trx);
                    }
                }
                None => self.lock_grant(inner, waits, id),
            }
        }
    }

    /// Removes a record lock without granting waiters; the discard path
    /// for a page that is going away.
    pub(crate) fn rec_discard(&self, inner: &mut LockSysInner, in_lock: LockId) {
        let (page, type_mode, table) = {
            let lock = inner.pool.lock(in_lock);
            (lock.rec().page_id, lock.type_mode, lock.table_id())
        };
        inner.table_state(table).n_rec_locks -= 1;
        inner.hash_mut(type_mode).remove(page, in_lock);
        Self::detach_from_trx(inner, in_lock);
        inner.pool.free(in_lock);
    }

    /// Cancels a waiting record lock: clears its single bit and releases
    /// the waiting transaction. The emptied lock stays in the queue until
    /// its owner releases. Waiters behind it are not re-scanned.
    pub(crate) fn rec_cancel(&self, inner: &mut LockSysInner, waits: &mut WaitTable, id: LockId) {
        let owner = {
            let lock = inner.pool.lock_mut(id);
            debug_assert!(!lock.is_table());
            let heap_no = lock
                .rec()
                .find_set_bit()
                .expect("waiting record lock has a set bit");
            lock.rec_mut().reset_nth_bit(heap_no);
            lock.trx
        };
        self.reset_lock_and_trx_wait(inner, waits, id);
        self.signal_wait_end(waits, owner);
    }

    /// Releases one record lock bit of a granted lock, used by READ
    /// COMMITTED semi-consistent reads that decide not to lock a row
    /// after all. Other bits of the lock are left untouched.
    pub fn rec_unlock(&self, trx: TxnId, page: PageId, heap_no: HeapNo, mode: LockMode) {
        let mut inner = self.inner.lock();
        let mut waits = self.waits.lock();

        let on_heap = inner.locks_on_heap(HashKind::Rec, page, heap_no);
        let Some(held) = on_heap.iter().copied().find(|&id| {
            let lock = inner.pool.lock(id);
            lock.trx == trx && lock.mode() == mode && !lock.is_waiting()
        }) else {
            error!(
                trx = trx.as_u64(),
                page = page.as_u64(),
                heap = heap_no.as_u32(),
                %mode,
                "unlock row could not find a granted lock of the expected mode"
            );
            return;
        };

        inner.pool.lock_mut(held).rec_mut().reset_nth_bit(heap_no);

        // Grant waiters on this slot that the released bit was blocking.
        for id in on_heap {
            let Some(lock) = inner.pool.get(id) else {
                continue;
            };
            if !lock.is_waiting() {
                continue;
            }
            let owner = lock.trx;
            match inner.rec_has_to_wait_in_queue(id) {
                Some(c) => {
                    let c_trx = inner.pool.lock(c).trx;
                    if let Some(state) = waits.state_mut(owner) {
                        state.wait_trx = Some(c_trx);
                    }
                }
                None => self.lock_grant(&mut inner, &mut waits, id),
            }
        }
    }

    fn ensure_registered(&self, inner: &LockSysInner, trx: TxnId) -> FerriteResult<()> {
        if inner.txn(trx).is_none() {
            return Err(FerriteError::TransactionNotFound { txn_id: trx });
        }
        Ok(())
    }

    /// Checks if locks of other transactions prevent an immediate insert
    /// before `heap_no` (the successor of the insertion point).
    ///
    /// The request is an insert-intention gap X lock, so it blocks only on
    /// non-insert-intention gap locks on the successor. Returns the lock
    /// status and whether the inserted record should inherit gap locks
    /// from the successor. Spatial indexes bypass gap protection and rely
    /// on predicate locks instead.
    pub fn insert_check(
        &self,
        trx: TxnId,
        page: PageRef,
        heap_no: HeapNo,
        index: IndexRef,
    ) -> FerriteResult<(LockStatus, bool)> {
        let mut inner = self.inner.lock();
        let mut waits = self.waits.lock();
        self.ensure_registered(&inner, trx)?;

        if inner.rec_hash.first_on_page(&inner.pool, page.id).is_none() {
            // No locks on the page: the common fast case.
            return Ok((LockStatus::Success, false));
        }

        if index.spatial {
            return Ok((LockStatus::Success, false));
        }

        let type_mode = TypeMode::rec(LockMode::Exclusive)
            .with(TypeMode::GAP | TypeMode::INSERT_INTENTION);
        let status = match inner.rec_other_has_conflicting(type_mode, page.id, heap_no, trx) {
            Some(c_lock) => self
                .rec_enqueue_waiting(
                    &mut inner, &mut waits, type_mode, page, heap_no, index, trx, c_lock,
                )
                .into_status(),
            None => LockStatus::Success,
        };
        Ok((status, true))
    }

    /// Checks for conflicts before a modify (update, delete mark, or
    /// delete unmark) of a clustered index record, materializing the
    /// previous modifier's implicit lock first.
    pub fn clust_rec_modify(
        &self,
        trx: TxnId,
        page: PageRef,
        heap_no: HeapNo,
        index: IndexRef,
        rec_modifier: TxnId,
    ) -> FerriteResult<LockStatus> {
        debug_assert!(index.clustered);
        debug_assert!(heap_no.is_user_rec());
        {
            let inner = self.inner.lock();
            self.ensure_registered(&inner, trx)?;
        }

        if self.convert_impl_to_expl(trx, page, heap_no, index, Some(rec_modifier))? {
            // We already hold an implicit exclusive lock.
            return Ok(LockStatus::Success);
        }

        let mut inner = self.inner.lock();
        let mut waits = self.waits.lock();
        let status = self
            .rec_lock(
                &mut inner,
                &mut waits,
                true,
                TypeMode::rec(LockMode::Exclusive).with(TypeMode::REC_NOT_GAP),
                page,
                heap_no,
                index,
                trx,
            )
            .into_status();
        Ok(collapse_locked_rec(status))
    }

    /// Checks for conflicts before a modify of a secondary index record.
    ///
    /// No other transaction can hold an implicit lock here: the clustered
    /// index record was modified first, which is impossible while another
    /// active transaction owns the row.
    pub fn sec_rec_modify(
        &self,
        trx: TxnId,
        page: PageRef,
        heap_no: HeapNo,
        index: IndexRef,
    ) -> FerriteResult<LockStatus> {
        debug_assert!(!index.clustered);
        let mut inner = self.inner.lock();
        let mut waits = self.waits.lock();
        self.ensure_registered(&inner, trx)?;
        let status = self
            .rec_lock(
                &mut inner,
                &mut waits,
                true,
                TypeMode::rec(LockMode::Exclusive).with(TypeMode::REC_NOT_GAP),
                page,
                heap_no,
                index,
                trx,
            )
            .into_status();
        Ok(collapse_locked_rec(status))
    }

    /// Sets a lock a read cursor requests on a clustered index record.
    ///
    /// `rec_modifier` is the row's last-modifier transaction id as read
    /// from the row header; pass `None` for the supremum.
    pub fn clust_rec_read(
        &self,
        trx: TxnId,
        page: PageRef,
        heap_no: HeapNo,
        index: IndexRef,
        mode: LockMode,
        gap: GapMode,
        rec_modifier: Option<TxnId>,
    ) -> FerriteResult<LockStatus> {
        debug_assert!(index.clustered);
        {
            let inner = self.inner.lock();
            self.ensure_registered(&inner, trx)?;
        }

        if !heap_no.is_supremum()
            && self.convert_impl_to_expl(trx, page, heap_no, index, rec_modifier)?
        {
            return Ok(LockStatus::Success);
        }

        let mut inner = self.inner.lock();
        let mut waits = self.waits.lock();
        Ok(self
            .rec_lock(
                &mut inner,
                &mut waits,
                false,
                TypeMode::rec_with_gap(mode, gap),
                page,
                heap_no,
                index,
                trx,
            )
            .into_status())
    }

    /// Sets a lock a read cursor requests on a secondary index record.
    ///
    /// `rec_modifier` is resolved by the caller through a version walk
    /// into the clustered index; false positives are permitted, the state
    /// of the named transaction is re-checked under the mutex.
    pub fn sec_rec_read(
        &self,
        trx: TxnId,
        page: PageRef,
        heap_no: HeapNo,
        index: IndexRef,
        mode: LockMode,
        gap: GapMode,
        rec_modifier: Option<TxnId>,
    ) -> FerriteResult<LockStatus> {
        debug_assert!(!index.clustered);
        {
            let inner = self.inner.lock();
            self.ensure_registered(&inner, trx)?;
        }

        if !heap_no.is_supremum()
            && self.convert_impl_to_expl(trx, page, heap_no, index, rec_modifier)?
        {
            return Ok(LockStatus::Success);
        }

        let mut inner = self.inner.lock();
        let mut waits = self.waits.lock();
        Ok(self
            .rec_lock(
                &mut inner,
                &mut waits,
                false,
                TypeMode::rec_with_gap(mode, gap),
                page,
                heap_no,
                index,
                trx,
            )
            .into_status())
    }
}

/// Modify entry points do not distinguish "locked just now" from
/// "already locked".
fn collapse_locked_rec(status: LockStatus) -> LockStatus {
    match status {
        LockStatus::SuccessLockedRec => LockStatus::Success,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrite_common::types::{IndexId, IsolationLevel, TableId};

    fn sys() -> LockSys {
        LockSys::new()
    }

    fn page() -> PageRef {
        PageRef::new(PageId::new(7), 16)
    }

    fn index() -> IndexRef {
        IndexRef::clustered(IndexId::new(1), TableId::new(1))
    }

    fn register(sys: &LockSys, id: u64) -> TxnId {
        let trx = TxnId::new(id);
        sys.register_txn(trx, IsolationLevel::RepeatableRead);
        trx
    }

    #[test]
    fn test_first_caller_fast_path() {
        let sys = sys();
        let t1 = register(&sys, 1);
        let h3 = HeapNo::new(3);

        let status = sys.request_record_lock(
            t1,
            LockMode::Exclusive,
            GapMode::RecNotGap,
            page(),
            h3,
            index(),
            false,
        );
        assert_eq!(status, RequestStatus::GrantedNew);
        assert_eq!(sys.rec_lock_count(), 1);
        assert_eq!(sys.table_rec_lock_count(TableId::new(1)), 1);
    }

    #[test]
    fn test_repeat_request_is_existing() {
        let sys = sys();
        let t1 = register(&sys, 1);
        let h3 = HeapNo::new(3);

        sys.request_record_lock(
            t1,
            LockMode::Exclusive,
            GapMode::RecNotGap,
            page(),
            h3,
            index(),
            false,
        );
        let again = sys.request_record_lock(
            t1,
            LockMode::Exclusive,
            GapMode::RecNotGap,
            page(),
            h3,
            index(),
            false,
        );
        assert_eq!(again, RequestStatus::GrantedExisting);
        assert_eq!(sys.rec_lock_count(), 1);
    }

    #[test]
    fn test_shared_locks_coexist() {
        let sys = sys();
        let t1 = register(&sys, 1);
        let t2 = register(&sys, 2);
        let h3 = HeapNo::new(3);

        assert_eq!(
            sys.request_record_lock(
                t1,
                LockMode::Shared,
                GapMode::Ordinary,
                page(),
                h3,
                index(),
                false
            ),
            RequestStatus::GrantedNew
        );
        assert_eq!(
            sys.request_record_lock(
                t2,
                LockMode::Shared,
                GapMode::Ordinary,
                page(),
                h3,
                index(),
                false
            ),
            RequestStatus::GrantedNew
        );
        assert_eq!(sys.rec_lock_count(), 2);
    }

    #[test]
    fn test_conflicting_request_waits() {
        let sys = sys();
        let t1 = register(&sys, 1);
        let t2 = register(&sys, 2);
        let h3 = HeapNo::new(3);

        sys.request_record_lock(
            t1,
            LockMode::Exclusive,
            GapMode::RecNotGap,
            page(),
            h3,
            index(),
            false,
        );
        let status = sys.request_record_lock(
            t2,
            LockMode::Shared,
            GapMode::Ordinary,
            page(),
            h3,
            index(),
            false,
        );
        assert_eq!(status, RequestStatus::Waiting);

        let waits = sys.waits.lock();
        let state = waits.state(t2).unwrap();
        assert!(state.wait_lock.is_some());
        assert_eq!(state.wait_trx, Some(t1));
    }

    #[test]
    fn test_zero_timeout_fails_fast() {
        let mut config = crate::sys::LockSysConfig::default();
        config.lock_wait_timeout = std::time::Duration::ZERO;
        let sys = LockSys::with_config(config);
        let t1 = register(&sys, 1);
        let t2 = register(&sys, 2);
        let h3 = HeapNo::new(3);

        sys.request_record_lock(
            t1,
            LockMode::Exclusive,
            GapMode::RecNotGap,
            page(),
            h3,
            index(),
            false,
        );
        let status = sys.request_record_lock(
            t2,
            LockMode::Exclusive,
            GapMode::RecNotGap,
            page(),
            h3,
            index(),
            false,
        );
        assert_eq!(status, RequestStatus::Timeout);
        // Nothing was enqueued.
        assert_eq!(sys.rec_lock_count(), 1);
    }

    #[test]
    fn test_supremum_clears_gap_flags() {
        let sys = sys();
        let t1 = register(&sys, 1);

        sys.request_record_lock(
            t1,
            LockMode::Shared,
            GapMode::Gap,
            page(),
            HeapNo::SUPREMUM,
            index(),
            false,
        );

        let inner = sys.inner.lock();
        let ids = inner.rec_hash.locks_on_page(&inner.pool, PageId::new(7));
        assert_eq!(ids.len(), 1);
        let lock = inner.pool.lock(ids[0]);
        assert!(!lock.type_mode.is_gap());
        assert!(!lock.type_mode.is_record_not_gap());
        assert!(lock.rec().nth_bit(HeapNo::SUPREMUM));
    }

    #[test]
    fn test_same_trx_reuses_lock_struct() {
        let sys = sys();
        let t1 = register(&sys, 1);

        sys.request_record_lock(
            t1,
            LockMode::Exclusive,
            GapMode::RecNotGap,
            page(),
            HeapNo::new(3),
            index(),
            false,
        );
        sys.request_record_lock(
            t1,
            LockMode::Exclusive,
            GapMode::RecNotGap,
            page(),
            HeapNo::new(4),
            index(),
            false,
        );

        // Both slots share one lock struct with two bits.
        assert_eq!(sys.rec_lock_count(), 1);
        let inner = sys.inner.lock();
        let ids = inner.rec_hash.locks_on_page(&inner.pool, PageId::new(7));
        assert_eq!(inner.pool.lock(ids[0]).rec().count_bits(), 2);
    }

    #[test]
    fn test_waiter_blocks_later_compatible_request() {
        // FIFO: t3's S request queues behind t2's waiting X even though it
        // is compatible with t1's granted S.
        let sys = sys();
        let t1 = register(&sys, 1);
        let t2 = register(&sys, 2);
        let t3 = register(&sys, 3);
        let h3 = HeapNo::new(3);

        sys.request_record_lock(
            t1,
            LockMode::Shared,
            GapMode::Ordinary,
            page(),
            h3,
            index(),
            false,
        );
        assert_eq!(
            sys.request_record_lock(
                t2,
                LockMode::Exclusive,
                GapMode::RecNotGap,
                page(),
                h3,
                index(),
                false
            ),
            RequestStatus::Waiting
        );
        assert_eq!(
            sys.request_record_lock(
                t3,
                LockMode::Shared,
                GapMode::Ordinary,
                page(),
                h3,
                index(),
                false
            ),
            RequestStatus::Waiting
        );
    }

    #[test]
    fn test_implicit_only_sets_no_lock() {
        let sys = sys();
        let t1 = register(&sys, 1);
        let status = sys.request_record_lock(
            t1,
            LockMode::Exclusive,
            GapMode::RecNotGap,
            page(),
            HeapNo::new(3),
            index(),
            true,
        );
        assert_eq!(status, RequestStatus::GrantedNew);
        assert_eq!(sys.rec_lock_count(), 0);
    }

    #[test]
    fn test_insert_check_empty_page() {
        let sys = sys();
        let t1 = register(&sys, 1);
        let (status, inherit) = sys
            .insert_check(t1, page(), HeapNo::new(3), index())
            .unwrap();
        assert_eq!(status, LockStatus::Success);
        assert!(!inherit);
    }

    #[test]
    fn test_insert_intention_blocks_on_gap_lock() {
        let sys = sys();
        let t1 = register(&sys, 1);
        let t2 = register(&sys, 2);
        let h5 = HeapNo::new(5);

        // T1 holds a gap S lock on the successor slot.
        sys.request_record_lock(
            t1,
            LockMode::Shared,
            GapMode::Gap,
            page(),
            h5,
            index(),
            false,
        );

        let (status, inherit) = sys.insert_check(t2, page(), h5, index()).unwrap();
        assert_eq!(status, LockStatus::LockWait);
        assert!(inherit);
    }

    #[test]
    fn test_insert_does_not_block_on_insert_intention() {
        let sys = sys();
        let t1 = register(&sys, 1);
        let t2 = register(&sys, 2);
        let t3 = register(&sys, 3);
        let h5 = HeapNo::new(5);

        // T1 waits with an insert intention behind T3's gap lock.
        sys.request_record_lock(
            t3,
            LockMode::Shared,
            GapMode::Gap,
            page(),
            h5,
            index(),
            false,
        );
        let (status, _) = sys.insert_check(t1, page(), h5, index()).unwrap();
        assert_eq!(status, LockStatus::LockWait);

        // T2's insert intention does not wait for T1's.
        sys.release(t3);
        let (status, _) = sys.insert_check(t2, page(), h5, index()).unwrap();
        assert_eq!(status, LockStatus::Success);
    }

    #[test]
    fn test_spatial_index_bypasses_gap_check() {
        let sys = sys();
        let t1 = register(&sys, 1);
        let t2 = register(&sys, 2);
        let spatial = IndexRef::spatial(IndexId::new(9), TableId::new(1));
        let h5 = HeapNo::new(5);

        sys.request_record_lock(
            t1,
            LockMode::Shared,
            GapMode::Gap,
            page(),
            h5,
            index(),
            false,
        );
        let (status, inherit) = sys.insert_check(t2, page(), h5, spatial).unwrap();
        assert_eq!(status, LockStatus::Success);
        assert!(!inherit);
    }

    #[test]
    fn test_unregistered_txn_is_an_error() {
        let sys = sys();
        let err = sys
            .insert_check(TxnId::new(42), page(), HeapNo::new(3), index())
            .unwrap_err();
        assert!(matches!(err, FerriteError::TransactionNotFound { .. }));
    }

    #[test]
    fn test_rec_unlock_grants_waiter() {
        let sys = sys();
        let t1 = register(&sys, 1);
        let t2 = register(&sys, 2);
        let h3 = HeapNo::new(3);

        sys.request_record_lock(
            t1,
            LockMode::Exclusive,
            GapMode::RecNotGap,
            page(),
            h3,
            index(),
            false,
        );
        assert_eq!(
            sys.request_record_lock(
                t2,
                LockMode::Shared,
                GapMode::Ordinary,
                page(),
                h3,
                index(),
                false
            ),
            RequestStatus::Waiting
        );

        sys.rec_unlock(t1, PageId::new(7), h3, LockMode::Exclusive);

        let waits = sys.waits.lock();
        assert!(waits.state(t2).unwrap().wait_lock.is_none());
    }

    #[test]
    fn test_rec_unlock_missing_lock_is_logged_noop() {
        let sys = sys();
        let t1 = register(&sys, 1);
        sys.rec_unlock(t1, PageId::new(7), HeapNo::new(3), LockMode::Exclusive);
        assert_eq!(sys.rec_lock_count(), 0);
    }

    #[test]
    fn test_simple_row_block() {
        // Scenario: T1 gets X on (P=7, H=3); T2 requests S on the same
        // record and waits; T1 commits; T2 is granted and returns
        // success.
        use std::sync::{mpsc, Arc};

        let sys = Arc::new(LockSys::new());
        let t1 = TxnId::new(1);
        let t2 = TxnId::new(2);
        sys.register_txn(t1, IsolationLevel::RepeatableRead);
        sys.register_txn(t2, IsolationLevel::RepeatableRead);
        let h3 = HeapNo::new(3);

        sys.request_record_lock(
            t1,
            LockMode::Exclusive,
            GapMode::RecNotGap,
            page(),
            h3,
            index(),
            false,
        );
        assert_eq!(
            sys.request_record_lock(
                t2,
                LockMode::Shared,
                GapMode::Ordinary,
                page(),
                h3,
                index(),
                false
            ),
            RequestStatus::Waiting
        );

        let (tx, rx) = mpsc::channel();
        let sys2 = Arc::clone(&sys);
        let waiter = std::thread::spawn(move || {
            tx.send(sys2.wait(t2)).unwrap();
        });

        sys.release(t1);
        assert_eq!(rx.recv().unwrap(), LockStatus::Success);
        waiter.join().unwrap();

        // T2 now holds its granted S lock.
        let inner = sys.inner.lock();
        let ids = inner.locks_on_heap(crate::hash::HashKind::Rec, PageId::new(7), h3);
        assert_eq!(ids.len(), 1);
        let lock = inner.pool.lock(ids[0]);
        assert_eq!(lock.trx, t2);
        assert!(!lock.is_waiting());
    }

    #[test]
    fn test_table_lock_dominates_record_request() {
        let sys = sys();
        let t1 = register(&sys, 1);
        sys.lock_table(t1, TableId::new(1), LockMode::Exclusive)
            .unwrap();
        let status = sys.request_record_lock(
            t1,
            LockMode::Exclusive,
            GapMode::RecNotGap,
            page(),
            HeapNo::new(3),
            index(),
            false,
        );
        assert_eq!(status, RequestStatus::GrantedExisting);
        assert_eq!(sys.rec_lock_count(), 0);
    }
}

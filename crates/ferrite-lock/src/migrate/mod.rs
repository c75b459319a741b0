//! Record-lock moving and inheritance at B-tree structural events.
//!
//! The index layer calls these operations when a page is split, merged,
//! reorganized, or discarded, and when records are inserted, deleted, or
//! relocated. Page internals stay on the index layer's side: a caller
//! passes the heap-slot correspondences it knows (`(old, new)` pairs),
//! and the lock system rewrites bitmaps and queues accordingly.
//!
//! "Inherit to gap" re-issues every non-insert-intention lock of a donor
//! slot as a gap-flavored granted lock on the heir slot. When a waiter's
//! single bit moves, its wait flag is cleared and the re-issued lock goes
//! through the normal queueing path, which grants it immediately if the
//! new queue position has no conflict.

use std::collections::{BTreeSet, HashMap};

use ferrite_common::types::{HeapNo, PageId, TxnId};

use crate::hash::HashKind;
use crate::mode::{LockMode, TypeMode};
use crate::object::{IndexRef, PageRef};
use crate::sys::{LockSys, LockSysInner};
use crate::wait::WaitTable;

impl LockSys {
    /// Resets the lock bits for one slot in one hash, canceling waiters.
    fn rec_reset_and_release_wait_kind(
        &self,
        inner: &mut LockSysInner,
        waits: &mut WaitTable,
        kind: HashKind,
        page: PageId,
        heap_no: HeapNo,
    ) {
        for id in inner.locks_on_heap(kind, page, heap_no) {
            if inner.pool.lock(id).is_waiting() {
                self.rec_cancel(inner, waits, id);
            } else {
                inner.pool.lock_mut(id).rec_mut().reset_nth_bit(heap_no);
            }
        }
    }

    /// Resets the lock bits for one record, releasing waiting
    /// transactions. Predicate locks for the page anchor on the infimum
    /// and are reset alongside.
    fn rec_reset_and_release_wait(
        &self,
        inner: &mut LockSysInner,
        waits: &mut WaitTable,
        page: PageId,
        heap_no: HeapNo,
    ) {
        self.rec_reset_and_release_wait_kind(inner, waits, HashKind::Rec, page, heap_no);
        self.rec_reset_and_release_wait_kind(
            inner,
            waits,
            HashKind::Predicate,
            page,
            HeapNo::INFIMUM,
        );
        self.rec_reset_and_release_wait_kind(
            inner,
            waits,
            HashKind::PredicatePage,
            page,
            HeapNo::INFIMUM,
        );
    }

    /// Makes the heir record inherit the locks of the donor record as gap
    /// type locks. The donor's bits are not reset, and waiting requests
    /// are inherited as granted gap locks.
    ///
    /// Gap inheritance of exclusive locks is skipped for holders at READ
    /// COMMITTED or weaker, which do not want UPDATE and DELETE locks to
    /// linger over gaps; shared locks taken by constraint checks are
    /// always inherited.
    fn rec_inherit_to_gap(
        &self,
        inner: &mut LockSysInner,
        waits: &mut WaitTable,
        heir: PageRef,
        donor_page: PageId,
        heir_heap: HeapNo,
        donor_heap: HeapNo,
    ) {
        for id in inner.locks_on_heap(HashKind::Rec, donor_page, donor_heap) {
            let lock = inner.pool.lock(id);
            if lock.type_mode.is_insert_intention() {
                continue;
            }
            let inherits = inner
                .txn(lock.trx)
                .map(|d| d.isolation.inherits_gap_locks())
                .unwrap_or(true);
            if !inherits && lock.mode() == LockMode::Exclusive {
                continue;
            }
            let (trx, mode, index) = (lock.trx, lock.mode(), lock.rec().index);
            self.rec_add_to_queue(
                inner,
                waits,
                TypeMode::rec(mode).with(TypeMode::GAP),
                heir,
                heir_heap,
                index,
                trx,
            );
        }
    }

    /// Makes the heir record inherit the gap-flavored locks of the donor
    /// record, used on insert. A holder with an exclusive table lock does
    /// not need gap inheritance on top.
    fn rec_inherit_to_gap_if_gap_lock(
        &self,
        inner: &mut LockSysInner,
        waits: &mut WaitTable,
        page: PageRef,
        heir_heap: HeapNo,
        donor_heap: HeapNo,
    ) {
        for id in inner.locks_on_heap(HashKind::Rec, page.id, donor_heap) {
            let lock = inner.pool.lock(id);
            if lock.type_mode.is_insert_intention() {
                continue;
            }
            if !donor_heap.is_supremum() && lock.type_mode.is_record_not_gap() {
                continue;
            }
            let (trx, mode, index) = (lock.trx, lock.mode(), lock.rec().index);
            if inner.table_has(trx, index.table, LockMode::Exclusive) {
                continue;
            }
            self.rec_add_to_queue(
                inner,
                waits,
                TypeMode::rec(mode).with(TypeMode::GAP),
                page,
                heir_heap,
                index,
                trx,
            );
        }
    }

    /// Moves the locks of one record to another record, resetting the
    /// donor's bits. Works also when donor and receiver are the same
    /// page: the bit is reset before the lock is re-issued.
    fn rec_move_low(
        &self,
        inner: &mut LockSysInner,
        waits: &mut WaitTable,
        kind: HashKind,
        receiver: PageRef,
        donor_page: PageId,
        receiver_heap: HeapNo,
        donor_heap: HeapNo,
    ) {
        for id in inner.locks_on_heap(kind, donor_page, donor_heap) {
            let (trx, type_mode, index) = {
                let lock = inner.pool.lock(id);
                (lock.trx, lock.type_mode, lock.rec().index)
            };
            {
                let lock = inner.pool.lock_mut(id);
                lock.rec_mut().reset_nth_bit(donor_heap);
                if type_mode.is_waiting() {
                    lock.type_mode = lock.type_mode.without(TypeMode::WAIT);
                }
            }
            self.rec_requeue(
                inner,
                waits,
                type_mode,
                receiver,
                receiver_heap,
                index,
                trx,
            );
        }
    }

    /// Re-issues a (possibly waiting) lock at a new position through the
    /// normal queueing path, and grants it on the spot when nothing in
    /// the new queue conflicts.
    fn rec_requeue(
        &self,
        inner: &mut LockSysInner,
        waits: &mut WaitTable,
        type_mode: TypeMode,
        page: PageRef,
        heap_no: HeapNo,
        index: IndexRef,
        trx: TxnId,
    ) {
        let new_id = self.rec_add_to_queue(inner, waits, type_mode, page, heap_no, index, trx);
        if type_mode.is_waiting() && inner.rec_has_to_wait_in_queue(new_id).is_none() {
            self.lock_grant(inner, waits, new_id);
        }
    }

    /// Moves ordinary record locks from one record to another.
    fn rec_move(
        &self,
        inner: &mut LockSysInner,
        waits: &mut WaitTable,
        receiver: PageRef,
        donor_page: PageId,
        receiver_heap: HeapNo,
        donor_heap: HeapNo,
    ) {
        self.rec_move_low(
            inner,
            waits,
            HashKind::Rec,
            receiver,
            donor_page,
            receiver_heap,
            donor_heap,
        );
    }

    /// Frees every lock for a discarded page in one hash. The bitmaps
    /// must already be reset.
    fn rec_free_all_kind(&self, inner: &mut LockSysInner, kind: HashKind, page: PageId) {
        for id in inner.hash_of(kind).locks_on_page(&inner.pool, page) {
            debug_assert!(inner.pool.lock(id).rec().find_set_bit().is_none());
            debug_assert!(!inner.pool.lock(id).is_waiting());
            self.rec_discard(inner, id);
        }
    }

    /// Updates the lock table after a page was reorganized in place.
    ///
    /// `mapping` pairs each old heap number with the slot now holding the
    /// same logical record; slots missing from the mapping kept their
    /// number. Granted locks are re-applied before waiting locks so that
    /// queue order keeps encoding grant order.
    pub fn move_reorganize_page(&self, page: PageRef, mapping: &[(HeapNo, HeapNo)]) {
        let mut inner = self.inner.lock();
        let mut waits = self.waits.lock();

        let ids = inner.rec_hash.locks_on_page(&inner.pool, page.id);
        if ids.is_empty() {
            return;
        }
        let map: HashMap<HeapNo, HeapNo> = mapping.iter().copied().collect();

        struct OldLock {
            trx: TxnId,
            type_mode: TypeMode,
            index: IndexRef,
            bits: Vec<HeapNo>,
        }

        let mut old: Vec<OldLock> = ids
            .iter()
            .map(|&id| {
                let lock = inner.pool.lock(id);
                let rec = lock.rec();
                let bits = (0..rec.n_bits)
                    .map(HeapNo::new)
                    .filter(|&h| rec.nth_bit(h))
                    .collect();
                OldLock {
                    trx: lock.trx,
                    type_mode: lock.type_mode,
                    index: rec.index,
                    bits,
                }
            })
            .collect();

        for &id in &ids {
            let lock = inner.pool.lock_mut(id);
            lock.rec_mut().reset_bitmap();
            if lock.is_waiting() {
                lock.type_mode = lock.type_mode.without(TypeMode::WAIT);
            }
        }

        // Granted locks first; the sort is stable, so order within each
        // class survives.
        old.sort_by_key(|o| o.type_mode.is_waiting());

        for o in old {
            for bit in o.bits {
                let new_heap = map.get(&bit).copied().unwrap_or(bit);
                self.rec_requeue(
                    &mut inner,
                    &mut waits,
                    o.type_mode,
                    page,
                    new_heap,
                    o.index,
                    o.trx,
                );
            }
        }
    }

    /// Moves the locks on moved records to their new page when a record
    /// list end or start is moved. `moved` pairs each moved slot on the
    /// old page with its slot on the new page.
    fn move_rec_list(&self, new_page: PageRef, page: PageId, moved: &[(HeapNo, HeapNo)]) {
        let mut inner = self.inner.lock();
        let mut waits = self.waits.lock();

        for id in inner.rec_hash.locks_on_page(&inner.pool, page) {
            for &(old_heap, new_heap) in moved {
                let (has_bit, trx, type_mode, index) = {
                    let lock = inner.pool.lock(id);
                    (
                        lock.rec().nth_bit(old_heap),
                        lock.trx,
                        lock.type_mode,
                        lock.rec().index,
                    )
                };
                if !has_bit {
                    continue;
                }
                {
                    let lock = inner.pool.lock_mut(id);
                    lock.rec_mut().reset_nth_bit(old_heap);
                    if type_mode.is_waiting() {
                        lock.type_mode = lock.type_mode.without(TypeMode::WAIT);
                    }
                }
                self.rec_requeue(
                    &mut inner, &mut waits, type_mode, new_page, new_heap, index, trx,
                );
            }
        }
    }

    /// Updates the lock table when the end of a record list is moved to
    /// another page.
    pub fn move_rec_list_end(&self, new_page: PageRef, page: PageId, moved: &[(HeapNo, HeapNo)]) {
        self.move_rec_list(new_page, page, moved);
    }

    /// Updates the lock table when the start of a record list is moved to
    /// another page.
    pub fn move_rec_list_start(&self, new_page: PageRef, page: PageId, moved: &[(HeapNo, HeapNo)]) {
        self.move_rec_list(new_page, page, moved);
    }

    /// Updates the lock table when a page is split to the right.
    ///
    /// `first_right_heap` is the first record on the right page after the
    /// split.
    pub fn update_split_right(&self, right: PageRef, left: PageRef, first_right_heap: HeapNo) {
        let mut inner = self.inner.lock();
        let mut waits = self.waits.lock();

        // Move the locks on the supremum of the left page to the
        // supremum of the right page.
        self.rec_move(
            &mut inner,
            &mut waits,
            right,
            left.id,
            HeapNo::SUPREMUM,
            HeapNo::SUPREMUM,
        );

        // Inherit to the supremum of the left page from the first record
        // on the right page.
        self.rec_inherit_to_gap(
            &mut inner,
            &mut waits,
            left,
            right.id,
            HeapNo::SUPREMUM,
            first_right_heap,
        );
    }

    /// Updates the lock table when a page is split to the left.
    pub fn update_split_left(&self, right: PageId, left: PageRef, first_right_heap: HeapNo) {
        let mut inner = self.inner.lock();
        let mut waits = self.waits.lock();
        self.rec_inherit_to_gap(
            &mut inner,
            &mut waits,
            left,
            right,
            HeapNo::SUPREMUM,
            first_right_heap,
        );
    }

    /// Updates the lock table when a page is merged to the right.
    ///
    /// `orig_succ_heap` is the original successor of the infimum on the
    /// right page before the merge. The left page is discarded.
    pub fn update_merge_right(&self, right: PageRef, orig_succ_heap: HeapNo, left: PageId) {
        let mut inner = self.inner.lock();
        let mut waits = self.waits.lock();

        // Inherit the locks from the supremum of the discarded left page
        // to the record the merge made its successor.
        self.rec_inherit_to_gap(
            &mut inner,
            &mut waits,
            right,
            left,
            orig_succ_heap,
            HeapNo::SUPREMUM,
        );

        // Reset the supremum locks of the left page, releasing waiters,
        // then free everything still attached to it.
        self.rec_reset_and_release_wait_kind(
            &mut inner,
            &mut waits,
            HashKind::Rec,
            left,
            HeapNo::SUPREMUM,
        );
        self.rec_free_all_from_discard_page(&mut inner, left);
    }

    /// Updates the lock table when a page is merged to the left.
    ///
    /// `left_next_heap` is the record that followed the original
    /// predecessor of the left supremum, or `None` when the supremum
    /// itself follows. The right page is discarded.
    pub fn update_merge_left(&self, left: PageRef, left_next_heap: Option<HeapNo>, right: PageId) {
        let mut inner = self.inner.lock();
        let mut waits = self.waits.lock();

        if let Some(next_heap) = left_next_heap {
            // Inherit the left-supremum locks to the first record moved
            // in from the right page.
            self.rec_inherit_to_gap(
                &mut inner,
                &mut waits,
                left,
                left.id,
                next_heap,
                HeapNo::SUPREMUM,
            );
            self.rec_reset_and_release_wait_kind(
                &mut inner,
                &mut waits,
                HashKind::Rec,
                left.id,
                HeapNo::SUPREMUM,
            );
        }

        // Move the right-supremum locks to the left supremum, then free
        // everything still attached to the discarded page.
        self.rec_move(
            &mut inner,
            &mut waits,
            left,
            right,
            HeapNo::SUPREMUM,
            HeapNo::SUPREMUM,
        );
        self.rec_free_all_from_discard_page(&mut inner, right);
    }

    /// Updates the lock table when a page is split and the result
    /// immediately merged back to the left.
    pub fn update_split_and_merge(
        &self,
        left: PageRef,
        left_next_heap: HeapNo,
        right: PageId,
        right_min_heap: HeapNo,
    ) {
        let mut inner = self.inner.lock();
        let mut waits = self.waits.lock();

        self.rec_inherit_to_gap(
            &mut inner,
            &mut waits,
            left,
            left.id,
            left_next_heap,
            HeapNo::SUPREMUM,
        );
        self.rec_reset_and_release_wait_kind(
            &mut inner,
            &mut waits,
            HashKind::Rec,
            left.id,
            HeapNo::SUPREMUM,
        );
        self.rec_inherit_to_gap(
            &mut inner,
            &mut waits,
            left,
            right,
            HeapNo::SUPREMUM,
            right_min_heap,
        );
    }

    /// Updates the lock table when the root page is copied to another
    /// during a root raise. Lock structs stay on the root: its infimum
    /// acts as a dummy carrier during pessimistic updates.
    pub fn update_root_raise(&self, block: PageRef, root: PageId) {
        let mut inner = self.inner.lock();
        let mut waits = self.waits.lock();
        self.rec_move(
            &mut inner,
            &mut waits,
            block,
            root,
            HeapNo::SUPREMUM,
            HeapNo::SUPREMUM,
        );
    }

    /// Updates the lock table when a page is copied wholesale to another
    /// and the old page discarded.
    pub fn update_copy_and_discard(&self, new_page: PageRef, old: PageId) {
        let mut inner = self.inner.lock();
        let mut waits = self.waits.lock();
        self.rec_move(
            &mut inner,
            &mut waits,
            new_page,
            old,
            HeapNo::SUPREMUM,
            HeapNo::SUPREMUM,
        );
        self.rec_free_all_from_discard_page(&mut inner, old);
    }

    /// Updates the lock table when a new user record is inserted:
    /// gap-flavored locks on the successor are inherited by the new
    /// record, in gap mode only.
    pub fn update_insert(&self, page: PageRef, rec_heap: HeapNo, succ_heap: HeapNo) {
        let mut inner = self.inner.lock();
        let mut waits = self.waits.lock();
        self.rec_inherit_to_gap_if_gap_lock(&mut inner, &mut waits, page, rec_heap, succ_heap);
    }

    /// Updates the lock table when a record is removed: its successor
    /// inherits its locks in gap mode, and waiters on the removed slot
    /// are released.
    pub fn update_delete(&self, page: PageRef, rec_heap: HeapNo, next_heap: HeapNo) {
        let mut inner = self.inner.lock();
        let mut waits = self.waits.lock();

        self.rec_inherit_to_gap(&mut inner, &mut waits, page, page.id, next_heap, rec_heap);
        self.rec_reset_and_release_wait(&mut inner, &mut waits, page.id, rec_heap);
    }

    /// Updates the lock table when a page is discarded: every occupied
    /// non-supremum slot donates its locks to the heir slot in gap mode,
    /// waiters are released, and all remaining locks for the page are
    /// freed from all three hash tables.
    pub fn update_discard(&self, heir: PageRef, heir_heap: HeapNo, page: PageId) {
        let mut inner = self.inner.lock();
        let mut waits = self.waits.lock();

        let ids = inner.rec_hash.locks_on_page(&inner.pool, page);
        if !ids.is_empty() {
            let mut heaps: BTreeSet<HeapNo> = BTreeSet::new();
            for &id in &ids {
                let rec = inner.pool.lock(id).rec();
                for i in 0..rec.n_bits {
                    let heap = HeapNo::new(i);
                    if rec.nth_bit(heap) {
                        heaps.insert(heap);
                    }
                }
            }
            for heap in heaps {
                if !heap.is_supremum() {
                    self.rec_inherit_to_gap(&mut inner, &mut waits, heir, page, heir_heap, heap);
                }
                self.rec_reset_and_release_wait_kind(
                    &mut inner,
                    &mut waits,
                    HashKind::Rec,
                    page,
                    heap,
                );
            }
            self.rec_free_all_kind(&mut inner, HashKind::Rec, page);
        } else {
            self.rec_free_all_kind(&mut inner, HashKind::Predicate, page);
            self.rec_free_all_kind(&mut inner, HashKind::PredicatePage, page);
        }
    }

    /// Frees every remaining lock for a discarded page from all three
    /// hash tables.
    pub(crate) fn rec_free_all_from_discard_page(&self, inner: &mut LockSysInner, page: PageId) {
        self.rec_free_all_kind(inner, HashKind::Rec, page);
        self.rec_free_all_kind(inner, HashKind::Predicate, page);
        self.rec_free_all_kind(inner, HashKind::PredicatePage, page);
    }

    /// Stores the explicit locks of a record on the page infimum, a
    /// scratch carrier used while an update relocates the record.
    pub fn store_on_infimum(&self, page: PageRef, rec_heap: HeapNo) {
        let mut inner = self.inner.lock();
        let mut waits = self.waits.lock();
        self.rec_move(
            &mut inner,
            &mut waits,
            page,
            page.id,
            HeapNo::INFIMUM,
            rec_heap,
        );
    }

    /// Restores the locks parked on `donator`'s infimum back onto the
    /// relocated record.
    pub fn restore_from_infimum(&self, page: PageRef, rec_heap: HeapNo, donator: PageId) {
        let mut inner = self.inner.lock();
        let mut waits = self.waits.lock();
        self.rec_move(&mut inner, &mut waits, page, donator, rec_heap, HeapNo::INFIMUM);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::GapMode;
    use crate::sys::RequestStatus;
    use ferrite_common::types::{IndexId, IsolationLevel, TableId, TxnId};

    const PAGE: u64 = 7;
    const OTHER: u64 = 8;

    fn page() -> PageRef {
        PageRef::new(PageId::new(PAGE), 16)
    }

    fn other_page() -> PageRef {
        PageRef::new(PageId::new(OTHER), 16)
    }

    fn index() -> IndexRef {
        IndexRef::clustered(IndexId::new(1), TableId::new(1))
    }

    fn register(sys: &LockSys, id: u64) -> TxnId {
        let trx = TxnId::new(id);
        sys.register_txn(trx, IsolationLevel::RepeatableRead);
        trx
    }

    /// Collects (trx, mode string, waiting) for the locks on a slot.
    fn slot_locks(sys: &LockSys, page: u64, heap: HeapNo) -> Vec<(TxnId, String, bool)> {
        let inner = sys.inner.lock();
        inner
            .locks_on_heap(HashKind::Rec, PageId::new(page), heap)
            .into_iter()
            .map(|id| {
                let lock = inner.pool.lock(id);
                (
                    lock.trx,
                    format!("{}", lock.type_mode.without(TypeMode::WAIT)),
                    lock.is_waiting(),
                )
            })
            .collect()
    }

    #[test]
    fn test_delete_inherits_as_gap() {
        let sys = LockSys::new();
        let t1 = register(&sys, 1);
        let h3 = HeapNo::new(3);
        let h4 = HeapNo::new(4);

        sys.request_record_lock(
            t1,
            LockMode::Exclusive,
            GapMode::Ordinary,
            page(),
            h3,
            index(),
            false,
        );
        sys.update_delete(page(), h3, h4);

        assert!(slot_locks(&sys, PAGE, h3).is_empty());
        let on_h4 = slot_locks(&sys, PAGE, h4);
        assert_eq!(on_h4, vec![(t1, "X|GAP".to_string(), false)]);
        sys.validate();
    }

    #[test]
    fn test_delete_releases_waiter() {
        let sys = LockSys::new();
        let t1 = register(&sys, 1);
        let t2 = register(&sys, 2);
        let h3 = HeapNo::new(3);
        let h4 = HeapNo::new(4);

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
                GapMode::RecNotGap,
                page(),
                h3,
                index(),
                false
            ),
            RequestStatus::Waiting
        );

        sys.update_delete(page(), h3, h4);

        let waits = sys.waits.lock();
        assert!(waits.state(t2).unwrap().wait_lock.is_none());
        drop(waits);
        sys.validate();
    }

    #[test]
    fn test_read_committed_x_not_inherited() {
        let sys = LockSys::new();
        let t1 = TxnId::new(1);
        sys.register_txn(t1, IsolationLevel::ReadCommitted);
        let t2 = TxnId::new(2);
        sys.register_txn(t2, IsolationLevel::ReadCommitted);
        let h3 = HeapNo::new(3);
        let h4 = HeapNo::new(4);

        sys.request_record_lock(
            t1,
            LockMode::Exclusive,
            GapMode::RecNotGap,
            page(),
            h3,
            index(),
            false,
        );
        sys.request_record_lock(
            t2,
            LockMode::Shared,
            GapMode::Gap,
            page(),
            h4,
            index(),
            false,
        );

        // A READ COMMITTED X lock dies with the record; an S lock taken
        // by a constraint check is inherited.
        sys.update_delete(page(), h3, h4);
        assert!(slot_locks(&sys, PAGE, h4)
            .iter()
            .all(|(trx, _, _)| *trx == t2));
    }

    #[test]
    fn test_insert_inherits_gap_locks_only() {
        let sys = LockSys::new();
        let t1 = register(&sys, 1);
        let t2 = register(&sys, 2);
        let h5 = HeapNo::new(5);
        let h3 = HeapNo::new(3);

        // A gap lock and a record-only lock on the successor.
        sys.request_record_lock(
            t1,
            LockMode::Shared,
            GapMode::Gap,
            page(),
            h5,
            index(),
            false,
        );
        sys.request_record_lock(
            t2,
            LockMode::Exclusive,
            GapMode::RecNotGap,
            page(),
            h5,
            index(),
            false,
        );

        sys.update_insert(page(), h3, h5);

        // Only the gap lock was inherited.
        let on_h3 = slot_locks(&sys, PAGE, h3);
        assert_eq!(on_h3, vec![(t1, "S|GAP".to_string(), false)]);
    }

    #[test]
    fn test_reorganize_identity_is_noop() {
        let sys = LockSys::new();
        let t1 = register(&sys, 1);
        let t2 = register(&sys, 2);
        let h3 = HeapNo::new(3);
        let h5 = HeapNo::new(5);

        sys.request_record_lock(
            t1,
            LockMode::Exclusive,
            GapMode::Ordinary,
            page(),
            h3,
            index(),
            false,
        );
        sys.request_record_lock(
            t1,
            LockMode::Exclusive,
            GapMode::Ordinary,
            page(),
            h5,
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

        sys.move_reorganize_page(page(), &[]);

        // Structurally the same: t1 granted on both slots, t2 waiting on
        // h3 with its waits-for edge intact.
        let on_h3 = slot_locks(&sys, PAGE, h3);
        assert_eq!(on_h3.len(), 2);
        assert_eq!(on_h3[0], (t1, "X".to_string(), false));
        assert_eq!(on_h3[1], (t2, "S".to_string(), true));
        assert_eq!(
            slot_locks(&sys, PAGE, h5),
            vec![(t1, "X".to_string(), false)]
        );

        let waits = sys.waits.lock();
        assert!(waits.state(t2).unwrap().wait_lock.is_some());
        assert_eq!(waits.state(t2).unwrap().wait_trx, Some(t1));
        drop(waits);
        sys.validate();
    }

    #[test]
    fn test_reorganize_remaps_slots() {
        let sys = LockSys::new();
        let t1 = register(&sys, 1);
        let h3 = HeapNo::new(3);
        let h9 = HeapNo::new(9);

        sys.request_record_lock(
            t1,
            LockMode::Exclusive,
            GapMode::Ordinary,
            page(),
            h3,
            index(),
            false,
        );
        sys.move_reorganize_page(page(), &[(h3, h9)]);

        assert!(slot_locks(&sys, PAGE, h3).is_empty());
        assert_eq!(
            slot_locks(&sys, PAGE, h9),
            vec![(t1, "X".to_string(), false)]
        );
    }

    #[test]
    fn test_move_rec_list_regrants_waiter_without_conflict() {
        let sys = LockSys::new();
        let t1 = register(&sys, 1);
        let t2 = register(&sys, 2);
        let h3 = HeapNo::new(3);
        let h4 = HeapNo::new(4);

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
                GapMode::RecNotGap,
                page(),
                h3,
                index(),
                false
            ),
            RequestStatus::Waiting
        );

        // Only the waiter's record moves: at the new position there is no
        // conflict, so the re-issued lock is granted on the spot.
        // (The holder's bit stays: its record did not move.)
        let inner = sys.inner.lock();
        let t2_lock = inner
            .locks_on_heap(HashKind::Rec, PageId::new(PAGE), h3)
            .into_iter()
            .find(|&id| inner.pool.lock(id).trx == t2)
            .unwrap();
        drop(inner);
        {
            let mut inner = sys.inner.lock();
            let mut waits = sys.waits.lock();
            // Simulate the index layer moving just this record.
            let lock = inner.pool.lock_mut(t2_lock);
            lock.rec_mut().reset_nth_bit(h3);
            lock.type_mode = lock.type_mode.without(TypeMode::WAIT);
            sys.rec_requeue(
                &mut inner,
                &mut waits,
                TypeMode::rec(LockMode::Shared)
                    .with(TypeMode::REC_NOT_GAP | TypeMode::WAIT),
                other_page(),
                h4,
                index(),
                t2,
            );
        }

        let waits = sys.waits.lock();
        assert!(waits.state(t2).unwrap().wait_lock.is_none());
        drop(waits);
        assert_eq!(
            slot_locks(&sys, OTHER, h4),
            vec![(t2, "S|REC_NOT_GAP".to_string(), false)]
        );
    }

    #[test]
    fn test_move_rec_list_end_moves_bits() {
        let sys = LockSys::new();
        let t1 = register(&sys, 1);
        let h3 = HeapNo::new(3);
        let h5 = HeapNo::new(5);
        let h2 = HeapNo::new(2);
        let h4 = HeapNo::new(4);

        sys.request_record_lock(
            t1,
            LockMode::Shared,
            GapMode::Ordinary,
            page(),
            h3,
            index(),
            false,
        );
        sys.request_record_lock(
            t1,
            LockMode::Shared,
            GapMode::Ordinary,
            page(),
            h5,
            index(),
            false,
        );

        sys.move_rec_list_end(other_page(), PageId::new(PAGE), &[(h3, h2), (h5, h4)]);

        assert!(slot_locks(&sys, PAGE, h3).is_empty());
        assert!(slot_locks(&sys, PAGE, h5).is_empty());
        assert_eq!(
            slot_locks(&sys, OTHER, h2),
            vec![(t1, "S".to_string(), false)]
        );
        assert_eq!(
            slot_locks(&sys, OTHER, h4),
            vec![(t1, "S".to_string(), false)]
        );
        sys.validate();
    }

    #[test]
    fn test_split_right_moves_supremum_and_inherits() {
        let sys = LockSys::new();
        let t1 = register(&sys, 1);
        let t2 = register(&sys, 2);
        let first_right = HeapNo::new(2);

        // T1 holds a (gap) lock on the left supremum; T2 holds an
        // ordinary lock on what becomes the first right record.
        sys.request_record_lock(
            t1,
            LockMode::Shared,
            GapMode::Gap,
            page(),
            HeapNo::SUPREMUM,
            index(),
            false,
        );
        sys.request_record_lock(
            t2,
            LockMode::Exclusive,
            GapMode::Ordinary,
            other_page(),
            first_right,
            index(),
            false,
        );

        sys.update_split_right(other_page(), page(), first_right);

        // T1's supremum lock moved to the right supremum.
        assert_eq!(
            slot_locks(&sys, OTHER, HeapNo::SUPREMUM),
            vec![(t1, "S".to_string(), false)]
        );
        // The left supremum inherited T2's lock as a gap lock (gap
        // flavor is implicit on the supremum).
        assert_eq!(
            slot_locks(&sys, PAGE, HeapNo::SUPREMUM),
            vec![(t2, "X".to_string(), false)]
        );
        sys.validate();
    }

    #[test]
    fn test_merge_right_discards_left_page() {
        let sys = LockSys::new();
        let t1 = register(&sys, 1);
        let succ = HeapNo::new(2);

        sys.request_record_lock(
            t1,
            LockMode::Shared,
            GapMode::Gap,
            page(),
            HeapNo::SUPREMUM,
            index(),
            false,
        );

        sys.update_merge_right(other_page(), succ, PageId::new(PAGE));

        assert!(slot_locks(&sys, PAGE, HeapNo::SUPREMUM).is_empty());
        assert_eq!(
            slot_locks(&sys, OTHER, succ),
            vec![(t1, "S|GAP".to_string(), false)]
        );
        // Nothing is left on the discarded page.
        let inner = sys.inner.lock();
        assert!(inner
            .rec_hash
            .locks_on_page(&inner.pool, PageId::new(PAGE))
            .is_empty());
    }

    #[test]
    fn test_merge_left_moves_right_supremum() {
        let sys = LockSys::new();
        let t1 = register(&sys, 1);

        sys.request_record_lock(
            t1,
            LockMode::Shared,
            GapMode::Gap,
            other_page(),
            HeapNo::SUPREMUM,
            index(),
            false,
        );

        sys.update_merge_left(page(), None, PageId::new(OTHER));

        assert_eq!(
            slot_locks(&sys, PAGE, HeapNo::SUPREMUM),
            vec![(t1, "S".to_string(), false)]
        );
        let inner = sys.inner.lock();
        assert!(inner
            .rec_hash
            .locks_on_page(&inner.pool, PageId::new(OTHER))
            .is_empty());
    }

    #[test]
    fn test_discard_inherits_and_frees() {
        let sys = LockSys::new();
        let t1 = register(&sys, 1);
        let t2 = register(&sys, 2);
        let h3 = HeapNo::new(3);
        let heir_heap = HeapNo::new(6);

        sys.request_record_lock(
            t1,
            LockMode::Exclusive,
            GapMode::Ordinary,
            page(),
            h3,
            index(),
            false,
        );
        assert_eq!(
            sys.request_record_lock(
                t2,
                LockMode::Shared,
                GapMode::RecNotGap,
                page(),
                h3,
                index(),
                false
            ),
            RequestStatus::Waiting
        );

        sys.update_discard(other_page(), heir_heap, PageId::new(PAGE));

        // The heir inherited both locks in gap mode (a waiting request is
        // inherited as a granted gap lock); the waiter was released; the
        // page is empty.
        assert_eq!(
            slot_locks(&sys, OTHER, heir_heap),
            vec![
                (t1, "X|GAP".to_string(), false),
                (t2, "S|GAP".to_string(), false)
            ]
        );
        let waits = sys.waits.lock();
        assert!(waits.state(t2).unwrap().wait_lock.is_none());
        drop(waits);
        let inner = sys.inner.lock();
        assert!(inner
            .rec_hash
            .locks_on_page(&inner.pool, PageId::new(PAGE))
            .is_empty());
        drop(inner);
        assert_eq!(sys.table_rec_lock_count(TableId::new(1)), 2);
    }

    #[test]
    fn test_store_and_restore_infimum_roundtrip() {
        let sys = LockSys::new();
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

        sys.store_on_infimum(page(), h3);
        assert!(slot_locks(&sys, PAGE, h3).is_empty());
        assert_eq!(
            slot_locks(&sys, PAGE, HeapNo::INFIMUM),
            vec![(t1, "X|REC_NOT_GAP".to_string(), false)]
        );

        sys.restore_from_infimum(page(), h3, PageId::new(PAGE));
        assert!(slot_locks(&sys, PAGE, HeapNo::INFIMUM).is_empty());
        assert_eq!(
            slot_locks(&sys, PAGE, h3),
            vec![(t1, "X|REC_NOT_GAP".to_string(), false)]
        );
        sys.validate();
    }

    #[test]
    fn test_copy_and_discard() {
        let sys = LockSys::new();
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
        sys.update_copy_and_discard(other_page(), PageId::new(PAGE));

        assert_eq!(
            slot_locks(&sys, OTHER, HeapNo::SUPREMUM),
            vec![(t1, "S".to_string(), false)]
        );
        assert_eq!(sys.rec_lock_count(), 1);
    }
}

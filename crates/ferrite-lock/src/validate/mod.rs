//! Consistency checking and diagnostics.
//!
//! [`LockSys::validate`] walks the whole lock table and asserts the
//! structural invariants; it is meant for debug builds and tests, not for
//! production paths. [`LockSys::dump`] renders every transaction's locks
//! the way the engine monitor prints them.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

use ferrite_common::types::{TableId, TxnId};

use crate::hash::HashKind;
use crate::object::{LockId, LockPayload};
use crate::record::lock_has_to_wait;
use crate::sys::{LockSys, LockSysInner};

/// Renders one lock in the monitor format.
pub(crate) fn render_lock(inner: &LockSysInner, id: LockId) -> String {
    let lock = inner.pool.lock(id);
    match &lock.payload {
        LockPayload::Table(t) => {
            let mut out = format!(
                "TABLE LOCK table {} trx id {} lock mode {}",
                t.table, lock.trx, lock.mode()
            );
            if lock.is_waiting() {
                out.push_str(" waiting");
            }
            out
        }
        LockPayload::Rec(r) => {
            let mut out = format!(
                "RECORD LOCKS page id {} n bits {} index {} of table {} trx id {} lock mode {}",
                r.page_id,
                r.n_bits,
                r.index.id,
                r.index.table,
                lock.trx,
                lock.mode()
            );
            if lock.type_mode.is_gap() {
                out.push_str(" locks gap before rec");
            }
            if lock.type_mode.is_record_not_gap() {
                out.push_str(" locks rec but not gap");
            }
            if lock.type_mode.is_insert_intention() {
                out.push_str(" insert intention");
            }
            if lock.type_mode.is_predicate() {
                out.push_str(" predicate");
            }
            if lock.is_waiting() {
                out.push_str(" waiting");
            }
            for i in 0..r.n_bits {
                let heap = ferrite_common::types::HeapNo::new(i);
                if r.nth_bit(heap) {
                    let _ = write!(out, "\nRecord lock, heap no {i}");
                }
            }
            out
        }
    }
}

impl LockSys {
    /// Renders every transaction's locks in a human-readable form.
    #[must_use]
    pub fn dump(&self) -> String {
        let inner = self.inner.lock();
        let waits = self.waits.lock();

        let mut txns: Vec<&TxnId> = inner.txns.keys().collect();
        txns.sort();

        let mut out = String::new();
        for &trx in txns {
            let desc = &inner.txns[&trx];
            let _ = writeln!(
                out,
                "---TRANSACTION {}, state {}, isolation {}, {} lock struct(s)",
                trx,
                desc.state,
                desc.isolation,
                desc.locks.len()
            );
            if let Some(wait_lock) = waits.state(trx).and_then(|s| s.wait_lock) {
                let _ = writeln!(out, "------- WAITING FOR THIS LOCK TO BE GRANTED:");
                let _ = writeln!(out, "{}", render_lock(&inner, wait_lock));
                let _ = writeln!(out, "------------------");
            }
            for &id in &desc.locks {
                let _ = writeln!(out, "{}", render_lock(&inner, id));
            }
        }
        out
    }

    /// Validates the whole lock table, asserting the structural
    /// invariants. Intended for debug builds and tests.
    ///
    /// # Panics
    ///
    /// Panics when an invariant does not hold.
    pub fn validate(&self) {
        let inner = self.inner.lock();
        let waits = self.waits.lock();

        let mut rec_locks_per_table: HashMap<TableId, u64> = HashMap::new();

        for kind in [HashKind::Rec, HashKind::Predicate, HashKind::PredicatePage] {
            for id in inner.hash_of(kind).all_locks() {
                let lock = inner.pool.lock(id);
                assert!(!lock.is_table(), "table lock in a record hash");
                *rec_locks_per_table.entry(lock.table_id()).or_default() += 1;

                if lock.is_waiting() {
                    // A waiter blocks on exactly one slot.
                    assert_eq!(
                        lock.rec().count_bits(),
                        1,
                        "waiting lock with {} bits",
                        lock.rec().count_bits()
                    );
                    let state = waits.state(lock.trx).expect("waiter not registered");
                    assert_eq!(state.wait_lock, Some(id), "wait_lock back-pointer broken");
                    assert!(state.wait_trx.is_some(), "waiter without waits-for edge");
                    // Position after conflicting locks: something earlier
                    // still conflicts, unless this is a gap-flavored
                    // request that a page event re-issued.
                    assert!(
                        lock.type_mode.is_gap()
                            || lock.type_mode.is_insert_intention()
                            || inner.rec_has_to_wait_in_queue(id).is_some(),
                        "waiting lock with nothing to wait for"
                    );
                } else {
                    // A granted lock never conflicts with a granted lock
                    // earlier in its queue.
                    let page = lock.rec().page_id;
                    for earlier in inner.hash_of(kind).locks_on_page(&inner.pool, page) {
                        if earlier == id {
                            break;
                        }
                        let other = inner.pool.lock(earlier);
                        if other.is_waiting() {
                            continue;
                        }
                        for i in 0..lock.rec().n_bits {
                            let heap = ferrite_common::types::HeapNo::new(i);
                            if lock.rec().nth_bit(heap) && other.rec().nth_bit(heap) {
                                assert!(
                                    !lock_has_to_wait(lock, other),
                                    "incompatible granted locks on page {page} heap {i}"
                                );
                            }
                        }
                    }
                }
            }
        }

        // Table lock queues.
        for (table, state) in &inner.tables {
            for &id in &state.queue {
                let lock = inner.pool.lock(id);
                assert!(lock.is_table());
                assert_eq!(lock.table_id(), *table);
                if lock.is_waiting() {
                    let wait_state = waits.state(lock.trx).expect("waiter not registered");
                    assert_eq!(wait_state.wait_lock, Some(id));
                    assert!(
                        inner.table_has_to_wait_in_queue(id).is_some(),
                        "waiting table lock with nothing to wait for"
                    );
                } else {
                    assert!(
                        inner
                            .table_other_has_incompatible(lock.trx, false, *table, lock.mode())
                            .is_none(),
                        "granted table lock coexists with an incompatible grant"
                    );
                }
            }

            // Counter invariant: n_rec_locks matches the hash contents.
            assert_eq!(
                state.n_rec_locks,
                rec_locks_per_table.get(table).copied().unwrap_or(0),
                "n_rec_locks out of sync for table {table}"
            );
        }

        // Every lock in a transaction's list is alive and owned by it.
        for (&trx, desc) in &inner.txns {
            for &id in &desc.locks {
                let lock = inner.pool.get(id).expect("freed lock in trx list");
                assert_eq!(lock.trx, trx);
            }
        }

        // Wait states point at live waiting locks.
        for (&trx, _) in &inner.txns {
            if let Some(state) = waits.state(trx) {
                if let Some(id) = state.wait_lock {
                    let lock = inner.pool.get(id).expect("wait_lock points at freed lock");
                    assert!(lock.is_waiting());
                    assert_eq!(lock.trx, trx);
                    assert!(state.wait_trx.is_some());
                }
            }
        }

        // The waits-for graph is acyclic outside a detector run.
        if self.config.deadlock_detect {
            for &trx in inner.txns.keys() {
                let mut seen = HashSet::new();
                let mut cur = trx;
                while let Some(next) = waits.wait_trx_of(cur) {
                    assert!(seen.insert(cur), "waits-for cycle left unresolved");
                    cur = next;
                }
            }
        }
    }
}

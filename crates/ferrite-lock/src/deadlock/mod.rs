//! Deadlock detection and resolution.
//!
//! The waits-for graph has one edge per blocked transaction: `wait_trx`
//! points at the transaction holding the conflicting lock. Cycle search
//! uses Brent's algorithm, which needs O(1) auxiliary state and
//! terminates under the wait mutex even on pathological graphs.
//!
//! When a cycle is confirmed, the walk picks the lowest-weight member,
//! where weight is the count of undo log records with a high bit set for
//! sessions that modified non-transactional tables (preferred survivors).
//! On a tie the requester itself is the victim. A non-requester victim
//! gets its wait canceled and is signaled so it wakes up and reports the
//! deadlock; the requester learns it is the victim from the return value
//! and never sleeps.

use tracing::warn;

use ferrite_common::types::TxnId;

use crate::sys::{DeadlockReport, LockSys, LockSysInner};
use crate::validate::render_lock;
use crate::wait::WaitTable;

/// Quickly detects a cycle reachable from `trx` along `wait_trx` edges
/// using Brent's algorithm.
///
/// Returns a transaction inside the cycle, or `None`. Normally `trx`
/// itself is part of any cycle found; if detection had been switched off
/// in the past, `trx` may instead be waiting on a pre-existing cycle it
/// is not part of, and the returned member differs from `trx`.
pub(crate) fn find_cycle(waits: &WaitTable, trx: TxnId) -> Option<TxnId> {
    let mut tortoise = trx;
    let mut hare = trx;
    let mut power: u64 = 1;
    let mut lam: u64 = 1;
    loop {
        hare = waits.wait_trx_of(hare)?;
        if tortoise == hare {
            return Some(hare);
        }
        if lam == power {
            power <<= 1;
            lam = 0;
            tortoise = hare;
        }
        lam += 1;
    }
}

impl LockSys {
    /// Checks whether the waiting request of `trx` completes a cycle and
    /// resolves the deadlock by victimizing one cycle member.
    ///
    /// Returns true when `trx` itself is the victim and must report the
    /// deadlock without sleeping. Called with both mutexes held, in
    /// lock-system then wait order, right after the waiting lock was
    /// enqueued.
    pub(crate) fn check_and_resolve(
        &self,
        inner: &mut LockSysInner,
        waits: &mut WaitTable,
        trx: TxnId,
    ) -> bool {
        let already_victim = waits
            .state(trx)
            .map(|s| s.chosen_as_victim)
            .unwrap_or(false);
        if !self.config.deadlock_detect {
            return already_victim;
        }

        let Some(entry) = find_cycle(waits, trx) else {
            return already_victim;
        };

        self.stats.record_deadlock();

        // Walk the cycle once, collecting its members in edge order.
        let mut cycle = Vec::new();
        let mut next = entry;
        loop {
            next = waits
                .wait_trx_of(next)
                .expect("cycle member is not waiting");
            cycle.push(next);
            if next == entry {
                break;
            }
        }

        let weight_of =
            |inner: &LockSysInner, t: TxnId| inner.txn(t).map(|d| d.weight()).unwrap_or(0);
        let mut victim = cycle[0];
        let mut victim_weight = weight_of(inner, victim);
        for &member in &cycle[1..] {
            let w = weight_of(inner, member);
            if w < victim_weight {
                victim = member;
                victim_weight = w;
            }
        }
        // Ties go against the requester: it is the one still off the CPU.
        if victim != trx && cycle.contains(&trx) && weight_of(inner, trx) == victim_weight {
            victim = trx;
        }

        if self.config.deadlock_report != DeadlockReport::Off {
            let report = self.render_deadlock(inner, waits, &cycle, victim);
            warn!(victim = victim.as_u64(), "deadlock detected\n{report}");
            *self.latest_deadlock.lock() = Some(report);
        }

        if victim != trx {
            if let Some(state) = waits.state_mut(victim) {
                state.chosen_as_victim = true;
            }
            if let Some(wait_lock) = waits.state(victim).and_then(|s| s.wait_lock) {
                self.cancel_waiting_and_release(inner, waits, wait_lock);
            }
            return false;
        }
        true
    }

    /// Renders the deadlock cycle at the configured verbosity.
    fn render_deadlock(
        &self,
        inner: &LockSysInner,
        waits: &WaitTable,
        cycle: &[TxnId],
        victim: TxnId,
    ) -> String {
        use std::fmt::Write as _;

        let mut out = String::new();
        for (i, &member) in cycle.iter().enumerate() {
            let _ = writeln!(out, "*** ({}) TRANSACTION:", i + 1);
            if let Some(desc) = inner.txn(member) {
                let _ = writeln!(
                    out,
                    "trx {} state {} undo entries {}",
                    member, desc.state, desc.undo_records
                );
            }
            let Some(wait_lock) = waits.state(member).and_then(|s| s.wait_lock) else {
                continue;
            };
            let _ = writeln!(out, "*** WAITING FOR THIS LOCK TO BE GRANTED:");
            let _ = writeln!(out, "{}", render_lock(inner, wait_lock));

            if self.config.deadlock_report == DeadlockReport::Full {
                let _ = writeln!(out, "*** CONFLICTING WITH:");
                let wl = inner.pool.lock(wait_lock);
                if wl.is_table() {
                    if let Some(state) = inner.tables.get(&wl.table_id()) {
                        for &id in &state.queue {
                            if id == wait_lock {
                                break;
                            }
                            if !inner.pool.lock(id).is_waiting() {
                                let _ = writeln!(out, "{}", render_lock(inner, id));
                            }
                        }
                    }
                } else if let Some(heap_no) = wl.rec().find_set_bit() {
                    let kind = LockSysInner::hash_kind(wl.type_mode);
                    for id in inner.locks_on_heap(kind, wl.rec().page_id, heap_no) {
                        if id == wait_lock {
                            break;
                        }
                        if !inner.pool.lock(id).is_waiting() {
                            let _ = writeln!(out, "{}", render_lock(inner, id));
                        }
                    }
                }
            }
        }
        let victim_pos = cycle.iter().position(|&t| t == victim).map(|p| p + 1);
        let _ = writeln!(
            out,
            "*** WE ROLL BACK TRANSACTION ({})",
            victim_pos.unwrap_or(0)
        );
        out
    }
}

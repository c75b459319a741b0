//! Implicit-to-explicit lock conversion.
//!
//! A clustered index row carries the id of the transaction that last
//! modified it. While that transaction is active it is treated as holding
//! an implicit exclusive record-not-gap lock on the row without any lock
//! object existing. Before another transaction may wait on or read-lock
//! the row, the implicit lock is materialized as an explicit one at the
//! tail of the queue.
//!
//! For secondary indexes the modifier is discovered by the caller through
//! a version walk into the clustered index; false positives are fine
//! because the named transaction's state is re-checked under the mutex,
//! false negatives are not.

use std::sync::atomic::Ordering as AtomicOrdering;

use tracing::error;

use ferrite_common::error::{FerriteError, FerriteResult};
use ferrite_common::types::{HeapNo, TxnId};

use crate::mode::{LockMode, TypeMode};
use crate::object::{IndexRef, PageRef};
use crate::sys::LockSys;

impl LockSys {
    /// Verifies that a row's last-modifier id is not in the future of the
    /// global assignment counter.
    ///
    /// An insane id means the page is corrupt; the condition is logged
    /// and surfaced as an error, and must not take down release paths.
    pub fn check_trx_id_sanity(&self, trx_id: TxnId) -> FerriteResult<()> {
        let max = self.max_txn_id.load(AtomicOrdering::SeqCst);
        if trx_id.as_u64() > max {
            error!(
                trx_id = trx_id.as_u64(),
                max_trx_id = max,
                "row transaction id is in the future"
            );
            return Err(FerriteError::corruption(format!(
                "transaction id {} associated with a record is larger than the \
                 global counter {}",
                trx_id, max
            )));
        }
        Ok(())
    }

    /// Materializes the row modifier's implicit exclusive lock, if one
    /// exists.
    ///
    /// Returns true when the *caller* already owns the row implicitly, in
    /// which case no explicit lock is needed at all. Otherwise, when the
    /// modifier is still active and has no strong enough explicit lock on
    /// the record, an explicit `X|REC_NOT_GAP` lock owned by it is
    /// appended to the queue.
    pub(crate) fn convert_impl_to_expl(
        &self,
        caller: TxnId,
        page: PageRef,
        heap_no: HeapNo,
        index: IndexRef,
        rec_modifier: Option<TxnId>,
    ) -> FerriteResult<bool> {
        debug_assert!(heap_no.is_user_rec());

        let Some(modifier) = rec_modifier else {
            return Ok(false);
        };
        if !modifier.is_valid() {
            return Ok(false);
        }

        self.check_trx_id_sanity(modifier)?;

        if modifier == caller {
            // The caller itself modified the row last; its implicit lock
            // stays implicit.
            return Ok(true);
        }

        let mut inner = self.inner.lock();
        let mut waits = self.waits.lock();

        // A version walk may name a transaction that has meanwhile
        // committed; reconfirm before materializing anything.
        let still_active = inner
            .txn(modifier)
            .map(|desc| desc.state.is_active())
            .unwrap_or(false);
        if !still_active {
            return Ok(false);
        }

        let precise = TypeMode::rec(LockMode::Exclusive).with(TypeMode::REC_NOT_GAP);
        if inner
            .rec_has_expl(precise, page.id, heap_no, modifier)
            .is_none()
        {
            self.rec_add_to_queue(&mut inner, &mut waits, precise, page, heap_no, index, modifier);
        }
        Ok(false)
    }
}

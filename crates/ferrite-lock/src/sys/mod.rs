//! The lock system.
//!
//! [`LockSys`] owns all lock state behind two mutexes:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          LockSys                             │
//! │                                                              │
//! │  lock-system mutex            wait mutex                     │
//! │  ┌────────────────────┐       ┌───────────────────────────┐  │
//! │  │ LockSysInner       │       │ WaitTable                 │  │
//! │  │  lock pool         │       │  wait_lock / wait_trx     │  │
//! │  │  rec hash          │       │  victim / kill flags      │  │
//! │  │  predicate hashes  │       │  per-txn condvars         │  │
//! │  │  table queues      │       └───────────────────────────┘  │
//! │  │  txn descriptors   │                                      │
//! │  └────────────────────┘                                      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The lock-system mutex protects the hash tables, every per-page and
//! per-table queue, the lock bitmaps, and the per-transaction lock lists.
//! The wait mutex protects the waiter state machine and pairs with every
//! transaction's condition variable. The two are always acquired in the
//! order lock-system, then wait; no operation suspends while holding
//! either.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use ferrite_common::types::{IsolationLevel, TableId, TxnId, TxnState};

use crate::hash::{HashKind, LockHash};
use crate::mode::TypeMode;
use crate::object::{LockId, LockPool};
use crate::wait::WaitTable;

/// Verbosity of deadlock diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlockReport {
    /// Pick a victim silently.
    Off,
    /// Record the transactions in the cycle and their waited-for locks.
    Basic,
    /// Also record the locks each waiter conflicts with.
    Full,
}

/// Outcome of a row or table entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockStatus {
    /// The request was satisfied without creating a new lock.
    Success,
    /// The request was satisfied and a lock was set on the record.
    SuccessLockedRec,
    /// A waiting lock was enqueued; the caller must call
    /// [`LockSys::wait`].
    LockWait,
    /// The requester was chosen as a deadlock victim and must roll back.
    Deadlock,
    /// The wait exceeded the configured timeout.
    Timeout,
    /// The wait was interrupted by a session kill.
    Interrupted,
}

impl LockStatus {
    /// Returns true if the request was granted.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, LockStatus::Success | LockStatus::SuccessLockedRec)
    }
}

/// Outcome of the low-level record-lock request operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// A granted lock already covered the request.
    GrantedExisting,
    /// The request was granted by setting a new bit or creating a lock.
    GrantedNew,
    /// A waiting lock was enqueued.
    Waiting,
    /// The requester was chosen as a deadlock victim while enqueuing.
    Deadlock,
    /// The per-session lock wait timeout is zero; fail fast.
    Timeout,
}

impl RequestStatus {
    /// Returns true if the request was granted.
    #[must_use]
    pub fn is_granted(&self) -> bool {
        matches!(self, RequestStatus::GrantedExisting | RequestStatus::GrantedNew)
    }

    /// Maps the request outcome onto the entry-point status, where a
    /// pre-existing grant is plain success and a new lock is
    /// `SuccessLockedRec`.
    #[must_use]
    pub fn into_status(self) -> LockStatus {
        match self {
            RequestStatus::GrantedExisting => LockStatus::Success,
            RequestStatus::GrantedNew => LockStatus::SuccessLockedRec,
            RequestStatus::Waiting => LockStatus::LockWait,
            RequestStatus::Deadlock => LockStatus::Deadlock,
            RequestStatus::Timeout => LockStatus::Timeout,
        }
    }
}

/// Configuration for the lock system.
#[derive(Debug, Clone)]
pub struct LockSysConfig {
    /// Whether to run the cycle search when a request must wait.
    pub deadlock_detect: bool,
    /// Verbosity of deadlock diagnostics.
    pub deadlock_report: DeadlockReport,
    /// Lock wait timeout. Zero means a conflicting request fails
    /// immediately instead of enqueuing.
    pub lock_wait_timeout: Duration,
    /// Cells in the ordinary record-lock hash, fixed at init.
    pub rec_hash_cells: usize,
    /// Cells in the predicate-lock hash, fixed at init.
    pub prdt_hash_cells: usize,
    /// Cells in the predicate-page-lock hash, fixed at init.
    pub prdt_page_hash_cells: usize,
}

impl Default for LockSysConfig {
    fn default() -> Self {
        Self {
            deadlock_detect: true,
            deadlock_report: DeadlockReport::Full,
            lock_wait_timeout: Duration::from_secs(50),
            rec_hash_cells: 2048,
            prdt_hash_cells: 256,
            prdt_page_hash_cells: 256,
        }
    }
}

/// Statistics about the lock system.
#[derive(Debug, Default)]
pub struct LockStats {
    /// Deadlock cycles found and broken.
    pub deadlocks: AtomicU64,
    /// Lock waits that timed out.
    pub timeouts: AtomicU64,
    /// Lock waits started.
    pub wait_count: AtomicU64,
    /// Lock waits currently suspended.
    pub wait_pending: AtomicU64,
    /// Total microseconds spent in lock waits.
    pub wait_time_sum: AtomicU64,
    /// Longest single lock wait in microseconds.
    pub wait_time_max: AtomicU64,
}

impl LockStats {
    /// Creates new stats.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a deadlock.
    pub fn record_deadlock(&self) {
        self.deadlocks.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Records a wait timeout.
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Records that a lock wait began.
    pub fn record_wait_start(&self) {
        self.wait_count.fetch_add(1, AtomicOrdering::Relaxed);
        self.wait_pending.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Records that a lock wait ended after `elapsed`.
    pub fn record_wait_resume(&self, elapsed: Duration) {
        self.wait_pending.fetch_sub(1, AtomicOrdering::Relaxed);
        let us = elapsed.as_micros() as u64;
        self.wait_time_sum.fetch_add(us, AtomicOrdering::Relaxed);
        self.wait_time_max.fetch_max(us, AtomicOrdering::Relaxed);
    }
}

/// Per-table lock state: the queue of table locks plus counters.
#[derive(Debug, Default)]
pub(crate) struct TableLockState {
    /// Table locks in queue order, oldest first.
    pub queue: Vec<LockId>,
    /// Granted or waiting S/X table locks.
    pub n_lock_x_or_s: u32,
    /// Granted or waiting AUTO_INC locks.
    pub n_waiting_or_granted_auto_inc: u32,
    /// Record locks whose index belongs to this table.
    pub n_rec_locks: u64,
    /// The transaction currently holding the AUTO_INC lock.
    pub autoinc_trx: Option<TxnId>,
}

/// Per-transaction descriptor held under the lock-system mutex.
#[derive(Debug)]
pub(crate) struct TxnDesc {
    /// Lifecycle state.
    pub state: TxnState,
    /// Isolation level, consulted for gap inheritance.
    pub isolation: IsolationLevel,
    /// Undo log records owned; the deadlock victim weight.
    pub undo_records: u64,
    /// Whether the session modified non-transactional tables; such
    /// transactions are preferred survivors.
    pub modified_non_transactional: bool,
    /// Every lock held, in acquisition order.
    pub locks: Vec<LockId>,
    /// Table locks held.
    pub table_locks: Vec<LockId>,
    /// Granted AUTO_INC locks, a stack released in reverse order.
    pub autoinc_locks: Vec<LockId>,
}

impl TxnDesc {
    fn new(isolation: IsolationLevel) -> Self {
        Self {
            state: TxnState::Active,
            isolation,
            undo_records: 0,
            modified_non_transactional: false,
            locks: Vec::new(),
            table_locks: Vec::new(),
            autoinc_locks: Vec::new(),
        }
    }

    /// Deadlock victim weight: undo record count, with the high bit set
    /// when non-transactional tables were modified so that such
    /// transactions are preferred survivors.
    pub fn weight(&self) -> u64 {
        self.undo_records | if self.modified_non_transactional { 1 << 63 } else { 0 }
    }
}

/// Everything protected by the lock-system mutex.
pub(crate) struct LockSysInner {
    /// Lock record allocator.
    pub pool: LockPool,
    /// Ordinary record-lock hash.
    pub rec_hash: LockHash,
    /// Predicate-lock hash.
    pub prdt_hash: LockHash,
    /// Predicate-page-lock hash.
    pub prdt_page_hash: LockHash,
    /// Per-table queues and counters.
    pub tables: HashMap<TableId, TableLockState>,
    /// Registered transactions.
    pub txns: HashMap<TxnId, TxnDesc>,
}

impl LockSysInner {
    fn new(config: &LockSysConfig) -> Self {
        Self {
            pool: LockPool::with_capacity(256),
            rec_hash: LockHash::new(config.rec_hash_cells),
            prdt_hash: LockHash::new(config.prdt_hash_cells),
            prdt_page_hash: LockHash::new(config.prdt_page_hash_cells),
            tables: HashMap::new(),
            txns: HashMap::new(),
        }
    }

    /// Returns the hash table a record lock with `type_mode` lives in.
    pub fn hash(&self, type_mode: TypeMode) -> &LockHash {
        match Self::hash_kind(type_mode) {
            HashKind::Rec => &self.rec_hash,
            HashKind::Predicate => &self.prdt_hash,
            HashKind::PredicatePage => &self.prdt_page_hash,
        }
    }

    /// Mutable variant of [`Self::hash`].
    pub fn hash_mut(&mut self, type_mode: TypeMode) -> &mut LockHash {
        match Self::hash_kind(type_mode) {
            HashKind::Rec => &mut self.rec_hash,
            HashKind::Predicate => &mut self.prdt_hash,
            HashKind::PredicatePage => &mut self.prdt_page_hash,
        }
    }

    /// Classifies a record lock's hash table by its flags.
    pub fn hash_kind(type_mode: TypeMode) -> HashKind {
        if type_mode.has(TypeMode::PREDICATE) {
            HashKind::Predicate
        } else if type_mode.has(TypeMode::PRDT_PAGE) {
            HashKind::PredicatePage
        } else {
            HashKind::Rec
        }
    }

    /// Returns the hash table for `kind`.
    pub fn hash_of(&self, kind: HashKind) -> &LockHash {
        match kind {
            HashKind::Rec => &self.rec_hash,
            HashKind::Predicate => &self.prdt_hash,
            HashKind::PredicatePage => &self.prdt_page_hash,
        }
    }

    /// Per-table state, created on first touch.
    pub fn table_state(&mut self, table: TableId) -> &mut TableLockState {
        self.tables.entry(table).or_default()
    }

    /// Looks up a transaction descriptor.
    pub fn txn(&self, trx: TxnId) -> Option<&TxnDesc> {
        self.txns.get(&trx)
    }

    /// Looks up a mutable transaction descriptor.
    pub fn txn_mut(&mut self, trx: TxnId) -> Option<&mut TxnDesc> {
        self.txns.get_mut(&trx)
    }
}

/// The transactional lock manager.
///
/// Arbitrates concurrent access to records, identified by a (page,
/// heap-slot) pair, and to whole tables. Enforces two-phase locking with
/// next-key semantics, detects deadlocks, and unblocks waiters as locks
/// are released.
pub struct LockSys {
    pub(crate) inner: Mutex<LockSysInner>,
    pub(crate) waits: Mutex<WaitTable>,
    pub(crate) config: LockSysConfig,
    pub(crate) stats: LockStats,
    pub(crate) latest_deadlock: Mutex<Option<String>>,
    /// Highest transaction id ever registered; a row claiming a modifier
    /// above this is corrupt.
    pub(crate) max_txn_id: AtomicU64,
}

impl LockSys {
    /// Creates a lock system with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(LockSysConfig::default())
    }

    /// Creates a lock system with custom configuration.
    #[must_use]
    pub fn with_config(config: LockSysConfig) -> Self {
        Self {
            inner: Mutex::new(LockSysInner::new(&config)),
            waits: Mutex::new(WaitTable::new()),
            config,
            stats: LockStats::new(),
            latest_deadlock: Mutex::new(None),
            max_txn_id: AtomicU64::new(0),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &LockSysConfig {
        &self.config
    }

    /// Returns the statistics counters.
    #[must_use]
    pub fn stats(&self) -> &LockStats {
        &self.stats
    }

    /// Returns the most recent rendered deadlock report, if any.
    #[must_use]
    pub fn latest_deadlock(&self) -> Option<String> {
        self.latest_deadlock.lock().clone()
    }

    /// Registers a transaction with the lock system.
    ///
    /// Must precede any lock request by the transaction. Re-registering an
    /// id replaces the previous descriptor.
    pub fn register_txn(&self, trx: TxnId, isolation: IsolationLevel) {
        self.max_txn_id.fetch_max(trx.as_u64(), AtomicOrdering::SeqCst);
        let mut inner = self.inner.lock();
        let mut waits = self.waits.lock();
        inner.txns.insert(trx, TxnDesc::new(isolation));
        waits.register(trx);
    }

    /// Removes a transaction that holds no locks.
    ///
    /// Use [`LockSys::release`] for a transaction that may hold locks.
    pub fn unregister_txn(&self, trx: TxnId) {
        let mut inner = self.inner.lock();
        let mut waits = self.waits.lock();
        if let Some(desc) = inner.txns.get(&trx) {
            debug_assert!(desc.locks.is_empty());
        }
        inner.txns.remove(&trx);
        waits.unregister(trx);
    }

    /// Updates a transaction's lifecycle state.
    pub fn set_txn_state(&self, trx: TxnId, state: TxnState) {
        let mut inner = self.inner.lock();
        if let Some(desc) = inner.txn_mut(trx) {
            desc.state = state;
        }
    }

    /// Updates the deadlock victim weight inputs for a transaction.
    pub fn update_txn_weight(
        &self,
        trx: TxnId,
        undo_records: u64,
        modified_non_transactional: bool,
    ) {
        let mut inner = self.inner.lock();
        if let Some(desc) = inner.txn_mut(trx) {
            desc.undo_records = undo_records;
            desc.modified_non_transactional = modified_non_transactional;
        }
    }

    /// Releases every lock of a committing or rolling-back transaction and
    /// destroys its lock set.
    ///
    /// Waiters made eligible by each released lock are granted in queue
    /// order. The global mutex is dropped every 1000 locks so that a huge
    /// commit cannot starve concurrent requesters.
    pub fn release(&self, trx: TxnId) {
        const RELEASE_BATCH: usize = 1000;

        {
            let mut inner = self.inner.lock();
            match inner.txn_mut(trx) {
                Some(desc) => desc.state = TxnState::Committed,
                None => return,
            }
        }

        loop {
            let mut inner = self.inner.lock();
            let mut waits = self.waits.lock();
            let mut count = 0;
            loop {
                let Some(&lock_id) = inner.txn(trx).and_then(|d| d.locks.last()) else {
                    inner.txns.remove(&trx);
                    waits.unregister(trx);
                    return;
                };
                if inner.pool.lock(lock_id).is_table() {
                    self.table_dequeue(&mut inner, &mut waits, lock_id);
                } else {
                    self.rec_dequeue_from_page(&mut inner, &mut waits, lock_id);
                }
                count += 1;
                if count == RELEASE_BATCH {
                    break;
                }
            }
            // Drop the mutexes for a moment so that we do not monopolize
            // them across a huge release.
            drop(waits);
            drop(inner);
        }
    }

    /// Resizes the three record-lock hash tables.
    pub fn resize_hashes(&self, rec_cells: usize, prdt_cells: usize, prdt_page_cells: usize) {
        let mut inner = self.inner.lock();
        let LockSysInner {
            pool,
            rec_hash,
            prdt_hash,
            prdt_page_hash,
            ..
        } = &mut *inner;
        rec_hash.resize(pool, rec_cells);
        prdt_hash.resize(pool, prdt_cells);
        prdt_page_hash.resize(pool, prdt_page_cells);
    }

    /// Number of record locks in the ordinary hash.
    #[must_use]
    pub fn rec_lock_count(&self) -> usize {
        self.inner.lock().rec_hash.len()
    }

    /// Number of table locks on `table`.
    #[must_use]
    pub fn table_lock_count(&self, table: TableId) -> usize {
        self.inner
            .lock()
            .tables
            .get(&table)
            .map(|t| t.queue.len())
            .unwrap_or(0)
    }

    /// Whether any table or record locks exist against `table`.
    #[must_use]
    pub fn table_has_locks(&self, table: TableId) -> bool {
        self.inner
            .lock()
            .tables
            .get(&table)
            .map(|t| !t.queue.is_empty() || t.n_rec_locks > 0)
            .unwrap_or(false)
    }

    /// Number of tables a transaction holds table locks on.
    #[must_use]
    pub fn locked_table_count(&self, trx: TxnId) -> usize {
        self.inner
            .lock()
            .txn(trx)
            .map(|d| d.table_locks.len())
            .unwrap_or(0)
    }

    /// Record locks registered against a table (invariant counter).
    #[must_use]
    pub fn table_rec_lock_count(&self, table: TableId) -> u64 {
        self.inner
            .lock()
            .tables
            .get(&table)
            .map(|t| t.n_rec_locks)
            .unwrap_or(0)
    }

    /// Removes a lock from its owner's lists. Shared by the record and
    /// table dequeue paths.
    pub(crate) fn detach_from_trx(inner: &mut LockSysInner, lock_id: LockId) {
        let trx = inner.pool.lock(lock_id).trx;
        if let Some(desc) = inner.txn_mut(trx) {
            if let Some(pos) = desc.locks.iter().position(|&l| l == lock_id) {
                desc.locks.remove(pos);
            }
            if let Some(pos) = desc.table_locks.iter().position(|&l| l == lock_id) {
                desc.table_locks.remove(pos);
            }
            if let Some(pos) = desc.autoinc_locks.iter().position(|&l| l == lock_id) {
                desc.autoinc_locks.remove(pos);
            }
        }
    }
}

impl Default for LockSys {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LockSys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("LockSys")
            .field("locks", &inner.pool.len())
            .field("txns", &inner.txns.len())
            .finish()
    }
}

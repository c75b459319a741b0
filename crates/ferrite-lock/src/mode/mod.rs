//! Lock mode algebra.
//!
//! Modes form the standard multi-granularity lattice:
//!
//! ```text
//!          │ IS │ IX │ S  │ X  │ AI │
//! ─────────┼────┼────┼────┼────┼────┤
//!     IS   │ ✓  │ ✓  │ ✓  │ ✗  │ ✓  │
//!     IX   │ ✓  │ ✓  │ ✗  │ ✗  │ ✓  │
//!     S    │ ✓  │ ✗  │ ✓  │ ✗  │ ✗  │
//!     X    │ ✗  │ ✗  │ ✗  │ ✗  │ ✗  │
//!     AI   │ ✓  │ ✓  │ ✗  │ ✗  │ ✗  │
//! ```
//!
//! Record locks combine S or X with orthogonal flags (gap, record-not-gap,
//! insert-intention, predicate), and the flag-aware wait rule in
//! [`rec_has_to_wait`] decides whether a request conflicts with an existing
//! lock on the same heap slot.

use std::fmt;

use serde::{Deserialize, Serialize};

use ferrite_common::types::TxnId;

/// Basic lock mode of a table or record lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum LockMode {
    /// Intention shared (table-level hint for row S locks).
    IntentionShared = 0,
    /// Intention exclusive (table-level hint for row X locks).
    IntentionExclusive = 1,
    /// Shared lock.
    Shared = 2,
    /// Exclusive lock.
    Exclusive = 3,
    /// Table-level AUTO_INC lock.
    AutoInc = 4,
}

/// Compatibility matrix indexed by `[requested][existing]`.
///
/// AUTO_INC is incompatible with itself so that a second inserter on the
/// same table queues behind the first.
const COMPATIBILITY: [[bool; 5]; 5] = [
    // IS     IX     S      X      AI
    [true, true, true, false, true],   // IS
    [true, true, false, false, true],  // IX
    [true, false, true, false, false], // S
    [false, false, false, false, false], // X
    [true, true, false, false, false], // AI
];

/// Strength matrix: `STRONGER_OR_EQ[a][b]` is true when holding `a`
/// dominates a request for `b`.
const STRONGER_OR_EQ: [[bool; 5]; 5] = [
    // IS     IX     S      X      AI
    [true, false, false, false, false], // IS
    [true, true, false, false, false],  // IX
    [true, false, true, false, false],  // S
    [true, true, true, true, false],    // X
    [false, false, false, false, true], // AI
];

impl LockMode {
    /// Checks if this mode is compatible with another per the lattice.
    #[inline]
    #[must_use]
    pub fn is_compatible_with(self, other: LockMode) -> bool {
        COMPATIBILITY[self as usize][other as usize]
    }

    /// Checks if this mode is stronger than or equal to another.
    #[inline]
    #[must_use]
    pub fn is_stronger_or_eq(self, other: LockMode) -> bool {
        STRONGER_OR_EQ[self as usize][other as usize]
    }

    fn from_bits(bits: u32) -> LockMode {
        match bits {
            0 => LockMode::IntentionShared,
            1 => LockMode::IntentionExclusive,
            2 => LockMode::Shared,
            3 => LockMode::Exclusive,
            _ => LockMode::AutoInc,
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::IntentionShared => write!(f, "IS"),
            LockMode::IntentionExclusive => write!(f, "IX"),
            LockMode::Shared => write!(f, "S"),
            LockMode::Exclusive => write!(f, "X"),
            LockMode::AutoInc => write!(f, "AUTO-INC"),
        }
    }
}

/// Gap flavor requested by a row-operation entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GapMode {
    /// Next-key lock: the record and the gap before it.
    Ordinary,
    /// Only the gap before the record.
    Gap,
    /// Only the record itself.
    RecNotGap,
}

/// Packed lock mode and flags, one word per lock.
///
/// The low bits carry the [`LockMode`]; the flag bits mark table locks,
/// waiting requests, and the record-lock variants.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeMode(u32);

impl TypeMode {
    const MODE_MASK: u32 = 0x7;

    /// Lock is a table lock rather than a record lock.
    pub const TABLE: u32 = 0x10;
    /// Lock request has not been granted yet.
    pub const WAIT: u32 = 0x100;
    /// Lock covers the gap before the record.
    pub const GAP: u32 = 0x200;
    /// Lock covers the record but not the gap.
    pub const REC_NOT_GAP: u32 = 0x400;
    /// Gap lock announcing an intent to insert.
    pub const INSERT_INTENTION: u32 = 0x800;
    /// Predicate lock on a spatial page.
    pub const PREDICATE: u32 = 0x1000;
    /// Page-level predicate lock.
    pub const PRDT_PAGE: u32 = 0x2000;

    /// Creates a record-lock type mode from a bare mode.
    #[inline]
    #[must_use]
    pub const fn rec(mode: LockMode) -> Self {
        Self(mode as u32)
    }

    /// Creates a table-lock type mode from a bare mode.
    #[inline]
    #[must_use]
    pub const fn table(mode: LockMode) -> Self {
        Self(mode as u32 | Self::TABLE)
    }

    /// Creates a record-lock type mode for the given gap flavor.
    #[must_use]
    pub const fn rec_with_gap(mode: LockMode, gap: GapMode) -> Self {
        match gap {
            GapMode::Ordinary => Self::rec(mode),
            GapMode::Gap => Self(mode as u32 | Self::GAP),
            GapMode::RecNotGap => Self(mode as u32 | Self::REC_NOT_GAP),
        }
    }

    /// Returns the basic mode.
    #[inline]
    #[must_use]
    pub fn mode(self) -> LockMode {
        LockMode::from_bits(self.0 & Self::MODE_MASK)
    }

    /// Returns a copy with the given flag bits set.
    #[inline]
    #[must_use]
    pub const fn with(self, flags: u32) -> Self {
        Self(self.0 | flags)
    }

    /// Returns a copy with the given flag bits cleared.
    #[inline]
    #[must_use]
    pub const fn without(self, flags: u32) -> Self {
        Self(self.0 & !flags)
    }

    /// Checks whether any of the given flag bits are set.
    #[inline]
    #[must_use]
    pub const fn has(self, flags: u32) -> bool {
        self.0 & flags != 0
    }

    /// Lock is a table lock.
    #[inline]
    #[must_use]
    pub const fn is_table(self) -> bool {
        self.has(Self::TABLE)
    }

    /// Lock request is waiting.
    #[inline]
    #[must_use]
    pub const fn is_waiting(self) -> bool {
        self.has(Self::WAIT)
    }

    /// Lock is gap-flavored.
    #[inline]
    #[must_use]
    pub const fn is_gap(self) -> bool {
        self.has(Self::GAP)
    }

    /// Lock is record-not-gap.
    #[inline]
    #[must_use]
    pub const fn is_record_not_gap(self) -> bool {
        self.has(Self::REC_NOT_GAP)
    }

    /// Lock is an insert-intention lock.
    #[inline]
    #[must_use]
    pub const fn is_insert_intention(self) -> bool {
        self.has(Self::INSERT_INTENTION)
    }

    /// Lock is a predicate or predicate-page lock.
    #[inline]
    #[must_use]
    pub const fn is_predicate(self) -> bool {
        self.has(Self::PREDICATE | Self::PRDT_PAGE)
    }
}

impl fmt::Debug for TypeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeMode({})", self)
    }
}

impl fmt::Display for TypeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mode())?;
        if self.is_gap() {
            write!(f, "|GAP")?;
        }
        if self.is_record_not_gap() {
            write!(f, "|REC_NOT_GAP")?;
        }
        if self.is_insert_intention() {
            write!(f, "|INSERT_INTENTION")?;
        }
        if self.has(Self::PREDICATE) {
            write!(f, "|PREDICATE")?;
        }
        if self.has(Self::PRDT_PAGE) {
            write!(f, "|PRDT_PAGE")?;
        }
        if self.is_waiting() {
            write!(f, "|WAIT")?;
        }
        Ok(())
    }
}

/// Decides whether a record-lock request must wait for an existing lock
/// on the same heap slot.
///
/// `is_supremum` marks a request on the supremum slot, which is always
/// really a gap request. The rules, in order:
///
/// 1. The same transaction never waits for itself.
/// 2. Compatible modes never wait.
/// 3. A gap (or supremum) request without insert intention never waits:
///    conflicting gap locks coexist.
/// 4. A non-insert-intention request never waits for a gap lock.
/// 5. A gap request never waits for a record-not-gap lock.
/// 6. Nothing waits for an insert-intention lock.
/// 7. Otherwise the request conflicts and must wait.
#[must_use]
pub fn rec_has_to_wait(
    trx: TxnId,
    type_mode: TypeMode,
    existing_trx: TxnId,
    existing: TypeMode,
    is_supremum: bool,
) -> bool {
    if trx == existing_trx || type_mode.mode().is_compatible_with(existing.mode()) {
        return false;
    }

    if (is_supremum || type_mode.is_gap()) && !type_mode.is_insert_intention() {
        // Gap type locks without insert intention do not need to wait
        // for anything: different users can hold conflicting lock modes
        // on gaps.
        return false;
    }

    if !type_mode.is_insert_intention() && existing.is_gap() {
        // An ordinary or record-not-gap request does not wait for a gap
        // type lock.
        return false;
    }

    if type_mode.is_gap() && existing.is_record_not_gap() {
        return false;
    }

    if existing.is_insert_intention() {
        // No request waits for an insert-intention lock to be removed.
        // Insert intentions do not disturb each other, and a next-key
        // lock waiting behind one would only manufacture deadlocks.
        return false;
    }

    true
}

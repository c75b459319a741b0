//! Hash-bucketed record-lock chains.
//!
//! Record locks with the same page id live in one chain, found through a
//! fixed-capacity bucket array keyed by the page-id fold. Chain order is
//! queue order for a page: locks created earlier come first, and waiting
//! locks sit after the granted locks that forced them to wait. The array
//! is sized at startup and may be resized only while the lock-system
//! mutex is held.

use ferrite_common::types::PageId;

use crate::object::{LockId, LockPool};

/// Which of the three record-lock hash tables a lock lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    /// Ordinary record locks.
    Rec,
    /// Predicate locks (spatial).
    Predicate,
    /// Page-level predicate locks.
    PredicatePage,
}

/// One open hash table of record-lock chains.
pub struct LockHash {
    cells: Vec<Vec<LockId>>,
}

impl LockHash {
    /// Creates a hash table with `n_cells` buckets.
    #[must_use]
    pub fn new(n_cells: usize) -> Self {
        Self {
            cells: (0..n_cells.max(1)).map(|_| Vec::new()).collect(),
        }
    }

    #[inline]
    fn cell_of(&self, page: PageId) -> usize {
        (page.fold() % self.cells.len() as u64) as usize
    }

    /// Number of buckets.
    #[must_use]
    pub fn n_cells(&self) -> usize {
        self.cells.len()
    }

    /// Appends a lock at the tail of its page chain.
    pub fn insert(&mut self, page: PageId, id: LockId) {
        let cell = self.cell_of(page);
        self.cells[cell].push(id);
    }

    /// Removes a lock from its page chain.
    pub fn remove(&mut self, page: PageId, id: LockId) {
        let cell = self.cell_of(page);
        if let Some(pos) = self.cells[cell].iter().position(|&l| l == id) {
            self.cells[cell].remove(pos);
        }
    }

    /// Returns the ids of all locks on `page` in queue order.
    #[must_use]
    pub fn locks_on_page(&self, pool: &LockPool, page: PageId) -> Vec<LockId> {
        let cell = self.cell_of(page);
        self.cells[cell]
            .iter()
            .copied()
            .filter(|&id| {
                pool.get(id)
                    .map(|l| !l.is_table() && l.rec().page_id == page)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Returns the first lock on `page`, if any.
    #[must_use]
    pub fn first_on_page(&self, pool: &LockPool, page: PageId) -> Option<LockId> {
        let cell = self.cell_of(page);
        self.cells[cell]
            .iter()
            .copied()
            .find(|&id| {
                pool.get(id)
                    .map(|l| !l.is_table() && l.rec().page_id == page)
                    .unwrap_or(false)
            })
    }

    /// Iterates all lock ids in the table, bucket by bucket.
    #[must_use]
    pub fn all_locks(&self) -> Vec<LockId> {
        self.cells.iter().flatten().copied().collect()
    }

    /// Total number of locks chained in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.iter().map(Vec::len).sum()
    }

    /// Whether the table holds no locks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.iter().all(Vec::is_empty)
    }

    /// Rebuilds the bucket array with `n_cells` buckets.
    ///
    /// Locks sharing a page id always hash to the same cell, and the old
    /// cells are drained in order, so per-page queue order survives.
    pub fn resize(&mut self, pool: &LockPool, n_cells: usize) {
        let old = std::mem::replace(
            &mut self.cells,
            (0..n_cells.max(1)).map(|_| Vec::new()).collect(),
        );
        for cell in old {
            for id in cell {
                if let Some(lock) = pool.get(id) {
                    let page = lock.rec().page_id;
                    let new_cell = self.cell_of(page);
                    self.cells[new_cell].push(id);
                }
            }
        }
    }
}

impl std::fmt::Debug for LockHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHash")
            .field("n_cells", &self.n_cells())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::{LockMode, TypeMode};
    use crate::object::IndexRef;
    use ferrite_common::types::{IndexId, TableId, TxnId};

    fn rec_lock(pool: &mut LockPool, trx: u64, page: u64) -> LockId {
        pool.alloc_rec(
            TxnId::new(trx),
            TypeMode::rec(LockMode::Shared),
            PageId::new(page),
            IndexRef::clustered(IndexId::new(1), TableId::new(1)),
            16,
        )
    }

    #[test]
    fn test_insert_preserves_queue_order() {
        let mut pool = LockPool::with_capacity(8);
        let mut hash = LockHash::new(4);

        let a = rec_lock(&mut pool, 1, 7);
        let b = rec_lock(&mut pool, 2, 7);
        let c = rec_lock(&mut pool, 3, 9);
        hash.insert(PageId::new(7), a);
        hash.insert(PageId::new(7), b);
        hash.insert(PageId::new(9), c);

        assert_eq!(hash.locks_on_page(&pool, PageId::new(7)), vec![a, b]);
        assert_eq!(hash.first_on_page(&pool, PageId::new(7)), Some(a));
        assert_eq!(hash.locks_on_page(&pool, PageId::new(9)), vec![c]);
        assert_eq!(hash.len(), 3);
    }

    #[test]
    fn test_remove() {
        let mut pool = LockPool::with_capacity(8);
        let mut hash = LockHash::new(4);

        let a = rec_lock(&mut pool, 1, 7);
        let b = rec_lock(&mut pool, 2, 7);
        hash.insert(PageId::new(7), a);
        hash.insert(PageId::new(7), b);

        hash.remove(PageId::new(7), a);
        assert_eq!(hash.locks_on_page(&pool, PageId::new(7)), vec![b]);
        assert_eq!(hash.first_on_page(&pool, PageId::new(7)), Some(b));
    }

    #[test]
    fn test_resize_preserves_page_order() {
        let mut pool = LockPool::with_capacity(8);
        let mut hash = LockHash::new(2);

        let locks: Vec<_> = (0..6).map(|i| rec_lock(&mut pool, i, 7)).collect();
        for &id in &locks {
            hash.insert(PageId::new(7), id);
        }

        hash.resize(&pool, 64);
        assert_eq!(hash.n_cells(), 64);
        assert_eq!(hash.locks_on_page(&pool, PageId::new(7)), locks);
    }
}

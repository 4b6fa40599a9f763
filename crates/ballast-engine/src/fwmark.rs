//! Firewall-mark allocator
//!
//! Marks come from a contiguous pool [base, base+size). Every vserver in
//! firewall-mark mode owns exactly one mark from creation to confirmed
//! kernel teardown; releases feed a freelist that is drained before the
//! monotonic cursor advances. Allocator misuse means engine state has
//! diverged from kernel state, which is unrecoverable.

use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MarkError {
    #[error("firewall-mark pool exhausted ({0} marks in use)")]
    Exhausted(usize),

    #[error("firewall-mark release for unknown owner {0}")]
    UnknownOwner(String),
}

/// Bounded allocator handing out one mark per owning vserver.
#[derive(Debug)]
pub struct MarkPool {
    base: u32,
    size: u32,
    next: u32,
    freelist: BTreeSet<u32>,
    owners: HashMap<String, u32>,
}

impl MarkPool {
    pub fn new(base: u32, size: u32) -> Self {
        Self {
            base,
            size,
            next: base,
            freelist: BTreeSet::new(),
            owners: HashMap::new(),
        }
    }

    /// Allocate a mark for `owner`. Repeated allocation by the same owner
    /// returns its existing mark.
    pub fn allocate(&mut self, owner: &str) -> Result<u32, MarkError> {
        if let Some(mark) = self.owners.get(owner) {
            return Ok(*mark);
        }
        let mark = if let Some(mark) = self.freelist.iter().next().copied() {
            self.freelist.remove(&mark);
            mark
        } else if self.next < self.base + self.size {
            let mark = self.next;
            self.next += 1;
            mark
        } else {
            return Err(MarkError::Exhausted(self.owners.len()));
        };
        self.owners.insert(owner.to_string(), mark);
        Ok(mark)
    }

    /// Return `owner`'s mark to the pool. Only call once the kernel state
    /// referencing the mark is confirmed removed.
    pub fn release(&mut self, owner: &str) -> Result<u32, MarkError> {
        let mark = self
            .owners
            .remove(owner)
            .ok_or_else(|| MarkError::UnknownOwner(owner.to_string()))?;
        self.freelist.insert(mark);
        Ok(mark)
    }

    pub fn mark_of(&self, owner: &str) -> Option<u32> {
        self.owners.get(owner).copied()
    }

    /// Owners currently holding marks.
    pub fn owners(&self) -> impl Iterator<Item = (&str, u32)> {
        self.owners.iter().map(|(name, mark)| (name.as_str(), *mark))
    }

    pub fn in_use(&self) -> usize {
        self.owners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_is_idempotent_per_owner() {
        let mut pool = MarkPool::new(3000, 4);
        let a = pool.allocate("vs-a").unwrap();
        assert_eq!(pool.allocate("vs-a").unwrap(), a);
        assert_eq!(pool.in_use(), 1);
    }

    #[test]
    fn test_released_marks_are_reused_lowest_first() {
        let mut pool = MarkPool::new(3000, 4);
        let a = pool.allocate("vs-a").unwrap();
        let _b = pool.allocate("vs-b").unwrap();
        pool.release("vs-a").unwrap();
        assert_eq!(pool.allocate("vs-c").unwrap(), a);
    }

    #[test]
    fn test_pool_exhaustion() {
        let mut pool = MarkPool::new(3000, 2);
        pool.allocate("vs-a").unwrap();
        pool.allocate("vs-b").unwrap();
        assert_eq!(pool.allocate("vs-c"), Err(MarkError::Exhausted(2)));
    }

    #[test]
    fn test_double_release_is_an_error() {
        let mut pool = MarkPool::new(3000, 2);
        pool.allocate("vs-a").unwrap();
        pool.release("vs-a").unwrap();
        assert_eq!(
            pool.release("vs-a"),
            Err(MarkError::UnknownOwner("vs-a".to_string()))
        );
    }

    #[test]
    fn test_allocated_set_tracks_owners() {
        let mut pool = MarkPool::new(10, 8);
        pool.allocate("vs-a").unwrap();
        pool.allocate("vs-b").unwrap();
        pool.release("vs-a").unwrap();
        let owners: Vec<&str> = pool.owners().map(|(name, _)| name).collect();
        assert_eq!(owners, vec!["vs-b"]);
    }
}

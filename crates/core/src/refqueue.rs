//! Cross-domain reference-count reconciliation (§4.3).
//!
//! A node crossing a domain boundary is never retained directly by the
//! foreign domain — Rust's `Arc` would make that safe but would defeat the
//! point: lifetime here is tracked *per owning domain*, not by a shared
//! atomic count, so that a domain's bookkeeping never depends on another
//! domain's behavior. `RefQueue` is the batched, mutex-guarded intake;
//! [`RefCountTable`] is the owning side's bookkeeping that a drain updates.
//! The table holds its own `Arc` clone for every outstanding increment, so
//! real memory safety is still `Arc`'s — a bug in this protocol can leak or
//! hold a node alive too long, never use one after it's freed.
//!
//! The original (`memhive/core/refqueue.c`) recycles unlinked list nodes
//! into a capped freelist to avoid malloc/free churn. `VecDeque` already
//! amortizes its own allocations, so there is nothing to port directly;
//! `reuse_cap` is instead honored by `shrink_to` after a drain, bounding how
//! much spare capacity a currently-idle queue is allowed to hold onto.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::domain::DomainId;

const DEFAULT_REUSE_CAP: usize = 100;

struct Inner<T> {
    pending_inc: VecDeque<Arc<T>>,
    pending_dec: VecDeque<Arc<T>>,
}

/// Batched intake of retain/release requests for objects owned by one
/// domain. Many domains may call `schedule_increment`/`schedule_decrement`
/// concurrently; only the owning domain calls `drain`.
pub struct RefQueue<T> {
    domain: DomainId,
    inner: Mutex<Inner<T>>,
    reuse_cap: usize,
}

/// How many increments/decrements a single `drain` applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub increments: usize,
    pub decrements: usize,
}

impl DrainReport {
    pub fn net_delta(&self) -> i64 {
        self.increments as i64 - self.decrements as i64
    }
}

impl<T> RefQueue<T> {
    pub fn new(domain: DomainId) -> Self {
        Self::with_reuse_cap(domain, DEFAULT_REUSE_CAP)
    }

    pub fn with_reuse_cap(domain: DomainId, reuse_cap: usize) -> Self {
        RefQueue {
            domain,
            inner: Mutex::new(Inner {
                pending_inc: VecDeque::new(),
                pending_dec: VecDeque::new(),
            }),
            reuse_cap,
        }
    }

    pub fn domain(&self) -> DomainId {
        self.domain
    }

    pub fn schedule_increment(&self, obj: Arc<T>) {
        self.inner.lock().pending_inc.push_back(obj);
    }

    pub fn schedule_decrement(&self, obj: Arc<T>) {
        self.inner.lock().pending_dec.push_back(obj);
    }

    pub fn pending_len(&self) -> usize {
        let g = self.inner.lock();
        g.pending_inc.len() + g.pending_dec.len()
    }

    /// Unlink the pending batch under the mutex, then apply it (increments
    /// before decrements) with the lock released.
    pub fn drain(&self, table: &RefCountTable<T>) -> DrainReport {
        let (inc, dec) = {
            let mut g = self.inner.lock();
            let inc = std::mem::take(&mut g.pending_inc);
            let dec = std::mem::take(&mut g.pending_dec);
            g.pending_inc.shrink_to(self.reuse_cap);
            g.pending_dec.shrink_to(self.reuse_cap);
            (inc, dec)
        };
        let report = DrainReport {
            increments: inc.len(),
            decrements: dec.len(),
        };
        for obj in inc {
            table.retain(obj);
        }
        for obj in dec {
            table.release(&obj);
        }
        report
    }
}

/// The owning domain's bookkeeping of outstanding foreign references.
/// Retaining clones the `Arc` into the table (extending its lifetime
/// regardless of what the foreign domain itself does); releasing drops that
/// clone once the count for that pointer reaches zero.
pub struct RefCountTable<T> {
    held: Mutex<HashMap<usize, (Arc<T>, u64)>>,
}

impl<T> Default for RefCountTable<T> {
    fn default() -> Self {
        RefCountTable {
            held: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> RefCountTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn identity(obj: &Arc<T>) -> usize {
        Arc::as_ptr(obj) as *const () as usize
    }

    pub fn retain(&self, obj: Arc<T>) {
        let id = Self::identity(&obj);
        let mut g = self.held.lock();
        let entry = g.entry(id).or_insert_with(|| (obj, 0));
        entry.1 += 1;
    }

    pub fn release(&self, obj: &Arc<T>) {
        let id = Self::identity(obj);
        let mut g = self.held.lock();
        if let Some(entry) = g.get_mut(&id) {
            entry.1 -= 1;
            if entry.1 == 0 {
                g.remove(&id);
            }
        }
    }

    /// Number of distinct pointers this table currently holds a reference
    /// to. Zero means every retain so far has had a matching release.
    pub fn outstanding(&self) -> usize {
        self.held.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_retain_release_drains_to_zero_outstanding() {
        let domain = DomainId::next();
        let queue: RefQueue<u64> = RefQueue::new(domain);
        let table = RefCountTable::new();
        let obj = Arc::new(42u64);

        queue.schedule_increment(Arc::clone(&obj));
        queue.schedule_increment(Arc::clone(&obj));
        queue.schedule_decrement(Arc::clone(&obj));

        let report = queue.drain(&table);
        assert_eq!(report.increments, 2);
        assert_eq!(report.decrements, 1);
        assert_eq!(table.outstanding(), 1);

        queue.schedule_decrement(Arc::clone(&obj));
        let report2 = queue.drain(&table);
        assert_eq!(report2.net_delta(), -1);
        assert_eq!(table.outstanding(), 0);
    }

    #[test]
    fn empty_drain_reports_zero_net_delta() {
        let domain = DomainId::next();
        let queue: RefQueue<u64> = RefQueue::new(domain);
        let table = RefCountTable::new();
        let report = queue.drain(&table);
        assert_eq!(report.net_delta(), 0);
    }

    #[test]
    fn reuse_cap_bounds_retained_capacity_after_drain() {
        let domain = DomainId::next();
        let queue: RefQueue<u64> = RefQueue::with_reuse_cap(domain, 4);
        let table = RefCountTable::new();
        for i in 0..50u64 {
            queue.schedule_increment(Arc::new(i));
        }
        queue.drain(&table);
        let g = queue.inner.lock();
        assert!(g.pending_inc.capacity() <= 4 + 8);
    }
}

//! Domain identity.
//!
//! Every long-lived entity in this crate — a HAMT node, a `Map`, a
//! `RefQueue` — records the id of the domain that created it. This is the
//! canonical test for "is this object local to me?" used throughout the
//! HAMT and the ref-queue protocol.
//!
//! Domain ids are assigned once, from a monotonic counter, and are never
//! reused — two domains never share an id even if one has since shut down.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_DOMAIN_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies the domain (isolated execution context) that owns an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainId(u64);

impl DomainId {
    /// Allocate a fresh domain id. Never returns the same value twice.
    pub fn next() -> Self {
        Self(NEXT_DOMAIN_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw integer backing this id, for logging and diagnostics.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for DomainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "domain#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_never_reused() {
        let a = DomainId::next();
        let b = DomainId::next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }
}

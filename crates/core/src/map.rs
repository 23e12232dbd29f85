//! The user-facing persistent map and its transient builder.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::domain::DomainId;
use crate::error::{Error, Result};
use crate::hamt::{assoc, find, hash32, without, FindResult, Iter, Node, WithoutResult};
use crate::value::Value;

struct MapInner {
    root: Option<Arc<Node>>,
    len: usize,
    domain: DomainId,
    hash_cache: Mutex<Option<u32>>,
}

/// A persistent, structurally-shared map. Cloning a `Map` is cheap (an
/// `Arc` bump); every mutating operation returns a new `Map` and leaves the
/// receiver untouched.
#[derive(Clone)]
pub struct Map {
    inner: Arc<MapInner>,
}

impl Map {
    /// An empty map owned by `domain`.
    pub fn new(domain: DomainId) -> Self {
        Self::from_parts(None, 0, domain)
    }

    fn from_parts(root: Option<Arc<Node>>, len: usize, domain: DomainId) -> Self {
        Map {
            inner: Arc::new(MapInner {
                root,
                len,
                domain,
                hash_cache: Mutex::new(None),
            }),
        }
    }

    pub fn domain(&self) -> DomainId {
        self.inner.domain
    }

    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Strict lookup: errors with `NoSuchKey` if absent.
    pub fn get(&self, key: &Value) -> Result<Value> {
        let hash = hash32(key)?;
        match find(self.inner.root.as_ref(), hash, key, 0, self.inner.domain)? {
            FindResult::NotFound => Err(Error::NoSuchKey),
            FindResult::FoundLocal(v) => Ok(v),
            FindResult::FoundForeign(v, owner) => {
                crate::reconcile::reconcile(&v, crate::reconcile::Direction::HubToWorker, owner)
            }
        }
    }

    /// Lookup with a caller-supplied default instead of an error.
    pub fn get_or(&self, key: &Value, default: Value) -> Result<Value> {
        match self.get(key) {
            Ok(v) => Ok(v),
            Err(Error::NoSuchKey) => Ok(default),
            Err(e) => Err(e),
        }
    }

    pub fn contains(&self, key: &Value) -> Result<bool> {
        match self.get(key) {
            Ok(_) => Ok(true),
            Err(Error::NoSuchKey) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Returns a new map with `key` bound to `val`. If `key` is already
    /// present with the same value, the returned map may share structure
    /// with `self` but is never the identical `Map` value.
    pub fn assoc(&self, key: Value, val: Value) -> Result<Map> {
        let hash = hash32(&key)?;
        let existed = !matches!(
            find(self.inner.root.as_ref(), hash, &key, 0, self.inner.domain)?,
            FindResult::NotFound
        );
        let new_root = assoc(
            self.inner.root.clone(),
            hash,
            key,
            val,
            0,
            crate::hamt::PUBLISHED_BATCH,
            self.inner.domain,
        )?;
        let new_len = if existed { self.inner.len } else { self.inner.len + 1 };
        Ok(Map::from_parts(Some(new_root), new_len, self.inner.domain))
    }

    /// Returns a new map with `key` removed. Errors with `NoSuchKey` if
    /// `key` was not present.
    pub fn without(&self, key: &Value) -> Result<Map> {
        let hash = hash32(key)?;
        match without(
            self.inner.root.as_ref(),
            hash,
            key,
            0,
            crate::hamt::PUBLISHED_BATCH,
            self.inner.domain,
        )? {
            WithoutResult::NotFound => Err(Error::NoSuchKey),
            WithoutResult::Empty => Ok(Map::from_parts(None, 0, self.inner.domain)),
            WithoutResult::New(root) => Ok(Map::from_parts(Some(root), self.inner.len - 1, self.inner.domain)),
        }
    }

    /// Merge every pair from `other` into `self`, `other`'s values winning
    /// on key collision.
    pub fn update_map(&self, other: &Map) -> Result<Map> {
        self.update_from(other.items())
    }

    /// Merge every pair from an arbitrary (key, value) sequence into `self`.
    pub fn update_from<I: IntoIterator<Item = (Value, Value)>>(&self, pairs: I) -> Result<Map> {
        let mut out = self.clone();
        for (k, v) in pairs {
            out = out.assoc(k, v)?;
        }
        Ok(out)
    }

    pub fn items(&self) -> impl Iterator<Item = (Value, Value)> {
        Iter::new(self.inner.root.clone()).map(|(_, k, v)| (k, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = Value> {
        self.items().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = Value> {
        self.items().map(|(_, v)| v)
    }

    /// Begin a transient mutation batch. The batch id is never zero, so its
    /// nodes are distinguishable from published ones.
    pub fn mutate(&self) -> MapMutation {
        MapMutation::new(self.clone())
    }

    /// Run `f` against a fresh transient, finalizing it (successfully or
    /// not) before returning — the scoped-acquisition pattern named in the
    /// operations list, expressed as a closure instead of an enter/exit
    /// pair.
    pub fn mutate_with<F>(&self, f: F) -> Result<Map>
    where
        F: FnOnce(&mut MapMutation) -> Result<()>,
    {
        let mut mutation = self.mutate();
        f(&mut mutation)?;
        mutation.finish()
    }

    pub fn structural_hash(&self) -> Result<u32> {
        if let Some(h) = *self.inner.hash_cache.lock() {
            return Ok(h);
        }
        let mut acc = 0u32;
        for (k, v) in self.items() {
            let kh = hash32(&k)?;
            let vh = v.hash_component()?;
            acc ^= mix_pair(kh, vh);
        }
        let finalized = avalanche(avalanche(acc ^ (self.inner.len as u32)));
        *self.inner.hash_cache.lock() = Some(finalized);
        Ok(finalized)
    }

    pub fn structural_eq(&self, other: &Map) -> Result<bool> {
        if self.inner.len != other.inner.len {
            return Ok(false);
        }
        for (k, v) in self.items() {
            match other.get(&k) {
                Ok(ov) => {
                    if !v.structural_eq(&ov)? {
                        return Ok(false);
                    }
                }
                Err(Error::NoSuchKey) => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Reassign ownership to `target` without touching the root node —
    /// used by hub→worker reconciliation (§4.7), which shares the root and
    /// lets subsequent mutation clone foreign subtrees lazily.
    pub(crate) fn rehome_shallow(&self, target: DomainId) -> Map {
        Map::from_parts(self.inner.root.clone(), self.inner.len, target)
    }

    /// Rebuild every node, restamping ownership to `target` — used by
    /// worker→hub reconciliation, which must not depend on the worker's
    /// lifetime afterward.
    pub(crate) fn rehome_deep(&self, target: DomainId) -> Result<Map> {
        let mut out = Map::new(target);
        for (k, v) in self.items() {
            out = out.assoc(k, v)?;
        }
        Ok(out)
    }
}

fn mix_pair(kh: u32, vh: u32) -> u32 {
    let mut x = kh.wrapping_mul(0x9E37_79B1) ^ vh;
    x ^= x >> 15;
    x = x.wrapping_mul(0x85EB_CA77);
    x ^= x >> 13;
    x
}

fn avalanche(mut x: u32) -> u32 {
    x ^= x >> 16;
    x = x.wrapping_mul(0x85EB_CA6B);
    x ^= x >> 13;
    x = x.wrapping_mul(0xC2B2_AE35);
    x ^= x >> 16;
    x
}

static NEXT_BATCH_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

/// A staging area for a batch of mutations against one `Map`. Nodes it
/// creates are stamped with its batch id, so a second `set`/`pop` in the
/// same batch can mutate the previous one's nodes in place instead of
/// cloning (invariant 5). Finalizing (or dropping without finalizing)
/// invalidates it; using it afterward is a `UseAfterFinalize` error.
pub struct MapMutation {
    root: Option<Arc<Node>>,
    len: usize,
    domain: DomainId,
    batch: u64,
    finished: bool,
}

impl MapMutation {
    fn new(map: Map) -> Self {
        let batch = NEXT_BATCH_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        MapMutation {
            root: map.inner.root.clone(),
            len: map.inner.len,
            domain: map.inner.domain,
            batch,
            finished: false,
        }
    }

    fn check_live(&self) -> Result<()> {
        if self.finished {
            Err(Error::UseAfterFinalize)
        } else {
            Ok(())
        }
    }

    pub fn set(&mut self, key: Value, val: Value) -> Result<&mut Self> {
        self.check_live()?;
        let hash = hash32(&key)?;
        let existed = !matches!(
            find(self.root.as_ref(), hash, &key, 0, self.domain)?,
            FindResult::NotFound
        );
        self.root = Some(assoc(self.root.take(), hash, key, val, 0, self.batch, self.domain)?);
        if !existed {
            self.len += 1;
        }
        Ok(self)
    }

    pub fn pop(&mut self, key: &Value) -> Result<&mut Self> {
        self.check_live()?;
        let hash = hash32(key)?;
        match without(self.root.as_ref(), hash, key, 0, self.batch, self.domain)? {
            WithoutResult::NotFound => Err(Error::NoSuchKey),
            WithoutResult::Empty => {
                self.root = None;
                self.len = 0;
                Ok(self)
            }
            WithoutResult::New(root) => {
                self.root = Some(root);
                self.len -= 1;
                Ok(self)
            }
        }
    }

    pub fn update<I: IntoIterator<Item = (Value, Value)>>(&mut self, pairs: I) -> Result<&mut Self> {
        self.check_live()?;
        for (k, v) in pairs {
            self.set(k, v)?;
        }
        Ok(self)
    }

    /// Finalize this batch into a new immutable `Map` and invalidate the
    /// transient. Calling any mutator afterward is a `UseAfterFinalize`
    /// error.
    pub fn finish(mut self) -> Result<Map> {
        self.check_live()?;
        self.finished = true;
        Ok(Map::from_parts(self.root.take(), self.len, self.domain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assoc_then_get_roundtrips() {
        let m = Map::new(DomainId::next());
        let m2 = m.assoc(Value::str("a"), Value::Int(1)).unwrap();
        assert_eq!(m2.get(&Value::str("a")).unwrap().structural_eq(&Value::Int(1)).unwrap(), true);
        assert!(m.get(&Value::str("a")).is_err());
    }

    #[test]
    fn repeated_assoc_is_structurally_equal() {
        let m = Map::new(DomainId::next());
        let a = m.assoc(Value::str("k"), Value::Int(1)).unwrap();
        let b = a.assoc(Value::str("k"), Value::Int(1)).unwrap();
        assert!(a.structural_eq(&b).unwrap());
        assert_eq!(a.structural_hash().unwrap(), b.structural_hash().unwrap());
    }

    #[test]
    fn without_of_absent_key_not_previously_present_is_noop() {
        let m = Map::new(DomainId::next());
        let a = m.assoc(Value::str("k"), Value::Int(1)).unwrap();
        let b = a.assoc(Value::str("other"), Value::Int(2)).unwrap();
        let c = b.without(&Value::str("other")).unwrap();
        assert!(a.structural_eq(&c).unwrap());
    }

    #[test]
    fn without_on_absent_key_errors() {
        let m = Map::new(DomainId::next());
        assert!(matches!(m.without(&Value::str("missing")), Err(Error::NoSuchKey)));
    }

    #[test]
    fn same_multiset_different_order_hashes_equal() {
        let domain = DomainId::next();
        let m1 = Map::new(domain)
            .assoc(Value::str("a"), Value::Int(1))
            .unwrap()
            .assoc(Value::str("b"), Value::Int(2))
            .unwrap();
        let m2 = Map::new(domain)
            .assoc(Value::str("b"), Value::Int(2))
            .unwrap()
            .assoc(Value::str("a"), Value::Int(1))
            .unwrap();
        assert_eq!(m1.structural_hash().unwrap(), m2.structural_hash().unwrap());
        assert!(m1.structural_eq(&m2).unwrap());
    }

    #[test]
    fn mutation_batch_allows_in_place_chaining() {
        let domain = DomainId::next();
        let base = Map::new(domain);
        let built = base
            .mutate_with(|tx| {
                tx.set(Value::Int(1), Value::Int(1))?;
                tx.set(Value::Int(2), Value::Int(2))?;
                tx.pop(&Value::Int(1))?;
                Ok(())
            })
            .unwrap();
        assert_eq!(built.len(), 1);
        assert!(built.contains(&Value::Int(2)).unwrap());
        assert!(!built.contains(&Value::Int(1)).unwrap());
    }

    #[test]
    fn mutation_after_finish_is_use_after_finalize() {
        let domain = DomainId::next();
        let mut tx = Map::new(domain).mutate();
        tx.set(Value::Int(1), Value::Int(1)).unwrap();
        let finished = tx;
        let map = finished.finish().unwrap();
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn cross_domain_get_reconciles_to_local_copy() {
        let hub_domain = DomainId::next();
        let worker_domain = DomainId::next();
        let hub_map = Map::new(hub_domain).assoc(Value::str("a"), Value::Int(1)).unwrap();
        let worker_view = hub_map.rehome_shallow(worker_domain);
        let v = worker_view.get(&Value::str("a")).unwrap();
        assert!(v.structural_eq(&Value::Int(1)).unwrap());
    }
}

//! The value type shared across domains.
//!
//! `Value` is deliberately closed over a small set of primitives plus two
//! escape hatches: `Map` (so maps can nest) and `Foreign` (so a host
//! embedding this crate can register its own proxyable container types
//! without this crate knowing their shape). Hashing and equality for the
//! primitive variants are infallible; `Foreign` routes through the type's
//! registered hooks, which *can* fail — this is the only place
//! `Error::HashFailure` / `Error::EqualityFailure` are actually reachable
//! from safe code, since every built-in variant hashes and compares without
//! ever erroring.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::Error;
use crate::map::Map;

/// A value held in a `Map`, either as a key or as a value.
#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Bytes(Arc<[u8]>),
    Tuple(Arc<[Value]>),
    Map(Map),
    Foreign(ForeignValue),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "b{b:?}"),
            Value::Tuple(t) => f.debug_tuple("Tuple").field(t).finish(),
            Value::Map(m) => write!(f, "Map(len={})", m.len()),
            Value::Foreign(fv) => write!(f, "Foreign({})", fv.type_name),
        }
    }
}

impl Value {
    pub fn str(s: impl Into<Arc<str>>) -> Self {
        Value::Str(s.into())
    }

    pub fn is_hashable(&self) -> bool {
        !matches!(self, Value::Float(_) | Value::Tuple(_) | Value::Map(_))
    }

    /// The 32-bit native hash of this value, before folding/masking.
    ///
    /// `Float` and `Tuple`/`Map` are excluded from the hashable subset (NaN
    /// equality and structural-equality-vs-identity concerns respectively)
    /// and always fail here; callers that need to use them as keys should
    /// reject them before reaching the trie, which is what `Map::assoc`
    /// does.
    pub(crate) fn native_hash(&self) -> Result<u64, Error> {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        match self {
            Value::None => 0u8.hash(&mut hasher),
            Value::Bool(b) => b.hash(&mut hasher),
            Value::Int(n) => n.hash(&mut hasher),
            Value::Str(s) => s.hash(&mut hasher),
            Value::Bytes(b) => b.hash(&mut hasher),
            Value::Foreign(fv) => {
                let proxy = fv.proxy.ok_or(Error::HashFailure)?;
                return (proxy.hash)(fv.data.as_ref());
            }
            Value::Float(_) | Value::Tuple(_) | Value::Map(_) => return Err(Error::HashFailure),
        }
        Ok(hasher.finish())
    }

    /// Like [`native_hash`](Value::native_hash), but defined for every
    /// variant (including `Float`/`Tuple`/`Map`) — used to fold a *value*
    /// into `Map`'s memoized structural hash, where unlike key hashing there
    /// is no restriction on which variants may appear.
    pub(crate) fn hash_component(&self) -> Result<u32, Error> {
        match self {
            Value::Float(x) => {
                let bits = x.to_bits();
                Ok((bits as u32) ^ ((bits >> 32) as u32))
            }
            Value::Tuple(items) => {
                let mut acc = 0x9747_b28cu32;
                for item in items.iter() {
                    acc = acc.wrapping_mul(31).wrapping_add(item.hash_component()?);
                }
                Ok(acc)
            }
            Value::Map(m) => m.structural_hash(),
            _ => {
                let h = self.native_hash()?;
                Ok((h as u32) ^ ((h >> 32) as u32))
            }
        }
    }

    /// Structural equality, usable for both key comparisons inside the trie
    /// and `Map`'s own `PartialEq`.
    pub(crate) fn structural_eq(&self, other: &Value) -> Result<bool, Error> {
        match (self, other) {
            (Value::None, Value::None) => Ok(true),
            (Value::Bool(a), Value::Bool(b)) => Ok(a == b),
            (Value::Int(a), Value::Int(b)) => Ok(a == b),
            (Value::Float(a), Value::Float(b)) => Ok(a == b),
            (Value::Str(a), Value::Str(b)) => Ok(a == b),
            (Value::Bytes(a), Value::Bytes(b)) => Ok(a == b),
            (Value::Tuple(a), Value::Tuple(b)) => {
                if a.len() != b.len() {
                    return Ok(false);
                }
                for (x, y) in a.iter().zip(b.iter()) {
                    if !x.structural_eq(y)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            (Value::Map(a), Value::Map(b)) => a.structural_eq(b),
            (Value::Foreign(a), Value::Foreign(b)) => {
                if a.type_name != b.type_name {
                    return Ok(false);
                }
                let proxy = a.proxy.ok_or(Error::EqualityFailure)?;
                (proxy.eq)(a.data.as_ref(), b.data.as_ref())
            }
            _ => Ok(false),
        }
    }
}

/// A value owned by a host embedding, wrapped so it can sit inside a
/// `Value::Foreign` slot without this crate knowing its concrete type.
#[derive(Clone)]
pub struct ForeignValue {
    pub type_name: &'static str,
    /// `None` means this value was shared without a registered proxy —
    /// every operation that needs one (hashing, equality, reconciliation)
    /// fails rather than guessing.
    pub proxy: Option<&'static ProxyDescriptor>,
    pub data: Arc<dyn Any + Send + Sync>,
}

/// Per-type static table of the four operations a registered container type
/// must provide: hash, equality, and the two directions of foreign adoption
/// (§4.7). Primitives don't need one; `Value`'s built-in variants are
/// handled directly.
pub struct ProxyDescriptor {
    pub type_name: &'static str,
    pub hash: fn(&(dyn Any + Send + Sync)) -> Result<u64, Error>,
    pub eq: fn(&(dyn Any + Send + Sync), &(dyn Any + Send + Sync)) -> Result<bool, Error>,
    pub adopt_hub_to_worker: fn(&(dyn Any + Send + Sync)) -> Result<ForeignValue, Error>,
    pub adopt_worker_to_hub: fn(&(dyn Any + Send + Sync)) -> Result<ForeignValue, Error>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_hash_never_fails() {
        assert!(Value::Int(42).native_hash().is_ok());
        assert!(Value::str("hello").native_hash().is_ok());
        assert!(Value::Bytes(Arc::from(&b"abc"[..])).native_hash().is_ok());
    }

    #[test]
    fn float_and_tuple_are_unhashable() {
        assert!(matches!(
            Value::Float(1.0).native_hash(),
            Err(Error::HashFailure)
        ));
        assert!(matches!(
            Value::Tuple(Arc::from(vec![])).native_hash(),
            Err(Error::HashFailure)
        ));
    }

    #[test]
    fn structural_eq_cross_variant_is_false_not_error() {
        assert_eq!(
            Value::Int(1).structural_eq(&Value::str("1")).unwrap(),
            false
        );
    }
}

//! Value reconciliation: copying or sharing a value across a domain
//! boundary (§4.7).
//!
//! Primitives are cheap to "copy" in Rust since their backing storage
//! (`Arc<str>`, `Arc<[u8]>`) is already immutable and shared — reconciling
//! one just clones the handle, never the bytes. `Map` and registered
//! `Foreign` types route through direction-specific logic instead.

use std::sync::Arc;

use crate::domain::DomainId;
use crate::error::{Error, Result};
use crate::value::Value;

/// Which way a value is crossing the boundary — the two directions a
/// `ProxyDescriptor` must support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HubToWorker,
    WorkerToHub,
}

/// Reconcile `value`, which was observed while owned by `from`, into a form
/// safe for `to` to hold. `from`/`to` are used only for `Map`'s rehoming;
/// everything else dispatches purely on `direction`.
pub fn reconcile(value: &Value, direction: Direction, to: DomainId) -> Result<Value> {
    match value {
        Value::None | Value::Bool(_) => Ok(value.clone()),
        Value::Int(_) | Value::Float(_) | Value::Str(_) | Value::Bytes(_) => Ok(value.clone()),
        Value::Tuple(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items.iter() {
                out.push(reconcile(item, direction, to)?);
            }
            Ok(Value::Tuple(Arc::from(out)))
        }
        Value::Map(m) => Ok(Value::Map(match direction {
            Direction::HubToWorker => m.rehome_shallow(to),
            Direction::WorkerToHub => m.rehome_deep(to)?,
        })),
        Value::Foreign(fv) => {
            let proxy = fv.proxy.ok_or(Error::UnsupportedForeignType(fv.type_name))?;
            let adopt = match direction {
                Direction::HubToWorker => proxy.adopt_hub_to_worker,
                Direction::WorkerToHub => proxy.adopt_worker_to_hub,
            };
            Ok(Value::Foreign(adopt(fv.data.as_ref())?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::Map;

    #[test]
    fn primitives_reconcile_as_themselves() {
        let to = DomainId::next();
        let v = reconcile(&Value::Int(5), Direction::HubToWorker, to).unwrap();
        assert!(v.structural_eq(&Value::Int(5)).unwrap());
    }

    #[test]
    fn tuple_reconciles_elementwise() {
        let to = DomainId::next();
        let t = Value::Tuple(Arc::from(vec![Value::Int(1), Value::str("x")]));
        let v = reconcile(&t, Direction::WorkerToHub, to).unwrap();
        assert!(v.structural_eq(&t).unwrap());
    }

    #[test]
    fn nested_map_reconciles_hub_to_worker_by_sharing_root() {
        let hub = DomainId::next();
        let worker = DomainId::next();
        let inner = Map::new(hub).assoc(Value::str("c"), Value::Int(2)).unwrap();
        let outer = Map::new(hub)
            .assoc(Value::str("a"), Value::Int(1))
            .unwrap()
            .assoc(Value::str("b"), Value::Map(inner))
            .unwrap();

        let worker_view = outer.rehome_shallow(worker);
        let b = worker_view.get(&Value::str("b")).unwrap();
        match b {
            Value::Map(nested) => {
                assert!(nested.get(&Value::str("c")).unwrap().structural_eq(&Value::Int(2)).unwrap());
            }
            _ => panic!("expected nested map"),
        }
    }

    #[test]
    fn foreign_without_proxy_is_unsupported() {
        use crate::value::ForeignValue;
        let to = DomainId::next();
        let fv = Value::Foreign(ForeignValue {
            type_name: "opaque_handle",
            proxy: None,
            data: Arc::new(()),
        });
        assert!(matches!(
            reconcile(&fv, Direction::HubToWorker, to),
            Err(Error::UnsupportedForeignType("opaque_handle"))
        ));
    }
}

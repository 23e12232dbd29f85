//! Persistent HAMT map, cross-domain reference reconciliation, and value
//! sharing for isolated execution domains.
//!
//! This crate has no notion of a message queue, a hub, or a worker thread —
//! see `hive-runtime` for that. What lives here is the part of the system
//! that is meaningful on its own: a `Map` that many domains can read
//! lock-free, and the bookkeeping that lets a foreign domain's reference to
//! one of its nodes be released safely.

mod domain;
mod error;
mod hamt;
mod map;
mod reconcile;
mod refqueue;
mod value;

pub use domain::DomainId;
pub use error::{Error, Result};
pub use map::{Map, MapMutation};
pub use reconcile::{reconcile, Direction};
pub use refqueue::{DrainReport, RefCountTable, RefQueue};
pub use value::{ForeignValue, ProxyDescriptor, Value};

//! Multi-channel hub/worker message queues, built on `hive-core`'s `Map`.
//!
//! `hive-core` knows nothing about threads, queues, or workers — it's the
//! persistent data structure and the cross-domain reference bookkeeping.
//! This crate is where those pieces become a live system: a [`Hub`] owning
//! a shared index, any number of [`Worker`]s each holding a reconciled view
//! of it, a [`MultiChannelQueue`] connecting them, and a wire format
//! ([`reflect`]) for carrying a worker's raised error back to the hub
//! without either side needing to know the other's exception types.

mod error;
mod hub;
mod queue;
mod reflect;
mod worker;

pub use error::{Error, Result};
pub use hub::{HealthEvent, Hub, Message};
pub use queue::{Item, ItemKind, MultiChannelQueue};
pub use reflect::{reflect, ErrorRecord, Frame, RaisedError, ReflectedError};
pub use worker::{Worker, WorkerMessage};

//! Error kinds originating below the messaging layer.
//!
//! These are the failure modes of the HAMT, `Map`/`MapMutation`, and value
//! reconciliation. Queue- and hub-level failures live in `hive_runtime::Error`
//! instead — this crate never sees a channel or a worker.

use thiserror::Error;

/// Failure modes surfaced by `hive-core`'s public API.
#[derive(Debug, Error)]
pub enum Error {
    /// `get`/`without`/`delete` against a key that isn't present and no
    /// default was supplied.
    #[error("no such key")]
    NoSuchKey,

    /// A `MapMutation` was used after `finish()` consumed it.
    #[error("use after finalize")]
    UseAfterFinalize,

    /// An attempt to mutate (directly or via a transient) a map owned by a
    /// domain other than the caller's.
    #[error("cross-domain mutation forbidden")]
    CrossDomainMutation,

    /// A key's native hash could not be computed (the sentinel hash -1 is
    /// remapped to -2 per the hashing rule; a foreign key's proxy hash hook
    /// returning an error surfaces here too).
    #[error("hash failure")]
    HashFailure,

    /// A key's equality check could not be computed — reachable only
    /// through a foreign key's proxy equality hook.
    #[error("equality failure")]
    EqualityFailure,

    /// Value reconciliation was asked to adopt a foreign value of a type
    /// with no proxy descriptor and no primitive copy rule.
    #[error("unsupported foreign type: {0}")]
    UnsupportedForeignType(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

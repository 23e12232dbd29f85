//! Error kinds originating at the messaging layer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// `add_channel` beyond the configured side-channel maximum.
    #[error("channel capacity exceeded")]
    CapacityExceeded,

    /// `put`/`listen`/`broadcast` against a closed queue.
    #[error("operation on a closed queue")]
    ClosedQueue,

    /// The error-reflection subsystem was handed a value it can't marshal.
    #[error("malformed error-reflection payload")]
    MarshalError,

    /// A failure from the underlying `Map`/HAMT layer (e.g. a bad index
    /// key, or a cross-domain write attempt) surfaced through the hub.
    #[error(transparent)]
    Core(#[from] hive_core::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

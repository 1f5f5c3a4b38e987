//! Error taxonomy for registry and entity operations

use thiserror::Error;

use crate::hotswap::HotSwapState;

#[derive(Debug, Error)]
pub enum EntityError {
    /// No live entity matches the requested key. Returned to the caller,
    /// never logged as an error.
    #[error("no entity matches the requested key")]
    NotFound,

    /// The handle's sequence number no longer matches the live entity;
    /// callers treat this like `NotFound`.
    #[error("handle is stale: the entity was destroyed and re-created")]
    StaleHandle,

    /// The entity lacks the capability the operation needs (not hot-swap
    /// capable, no power control, no FRU data). No side effects.
    #[error("entity does not support this operation")]
    Unsupported,

    /// A hot-swap action was requested in a state that does not accept it.
    #[error("operation not valid in hot-swap state {0}")]
    InvalidState(HotSwapState),

    /// The owning entity was destroyed while the operation was queued or in
    /// flight. Delivered exactly once per queued operation.
    #[error("entity was destroyed before the operation completed")]
    Canceled,

    /// A sensor/control/FRU/transport collaborator failed; the underlying
    /// error is surfaced verbatim and never retried here.
    #[error("collaborator operation failed: {0}")]
    Collaborator(#[from] anyhow::Error),
}

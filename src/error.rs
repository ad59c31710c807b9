//! Typed errors surfaced at the store boundary.
//!
//! Most functions return `anyhow::Error`; the variants below are the
//! ones callers are expected to react to, and can be recovered from an
//! error chain with `downcast_ref`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// A blob or key is absent from the object store.
    #[error("no such key '{0}'")]
    NotFound(String),

    /// Refusal to synchronize structurally different schemas.
    #[error("unable to sync collection '{0}' - incompatible meta-info")]
    IncompatibleSchema(String),

    /// Empty or malformed collection/series label.
    #[error("invalid label '{0}'")]
    InvalidLabel(String),

    /// Unknown mode flag.
    #[error("unexpected mode '{0}'")]
    UnexpectedMode(String),

    /// Frame or revision blob failed to encode/decode.
    #[error("codec error - {0}")]
    Codec(String),
}

/// Check whether an error chain bottoms out in [StoreError::NotFound].
pub fn is_not_found(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<StoreError>() {
        Some(StoreError::NotFound(_)) => true,
        _ => false,
    }
}

//! Error types.
//!
//! [`OptLockError`] is the internal control-flow signal the descent protocol
//! uses to trigger a restart from the root; it never reaches a caller.
//! [`ArtError`]/[`ArtResult`] are the public surface.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OptLockError {
    /// The version word changed underneath a reader.
    VersionMismatch,
    /// CAS to acquire the write lock lost a race.
    Locked,
    /// The node has been logically replaced (grown/shrunk/collapsed away).
    Obsolete,
}

pub(crate) type OptResult<T> = Result<T, OptLockError>;

#[derive(Debug, thiserror::Error)]
pub enum ArtError {
    #[error("allocation failed: {0}")]
    AllocationFailure(String),

    #[error("key must not be empty")]
    InvalidKey,
}

pub type ArtResult<T> = std::result::Result<T, ArtError>;

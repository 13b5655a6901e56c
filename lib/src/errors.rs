//! Typed failure kinds shared across the crate.
//!
//! Errors travel as [`anyhow::Error`] chains with per-layer context; the
//! kinds below are embedded in the chain so callers that care (e.g. treating
//! already-deployed as a no-op) can downcast for them.

use thiserror::Error;

/// Our generic catchall fatal error, expected to be converted
/// to a string to output to a terminal or logs.
pub type Result<T> = anyhow::Result<T>;

/// Classified failures surfaced by the store, registry and deployment layers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An addressed digest, ref, remote, or deployment does not exist.
    #[error("{0} not found")]
    NotFound(String),
    /// The commit is already deployed; an idempotence signal, not a bug.
    #[error("{0} is already deployed")]
    AlreadyDeployed(String),
    /// The commit is not deployed; an idempotence signal, not a bug.
    #[error("{0} is not deployed")]
    NotDeployed(String),
    /// Digest mismatch on read or write, or an object failing schema check.
    #[error("corrupted object: {0}")]
    Corrupted(String),
    /// No valid signature in the trusted keyring, or embedded metadata
    /// disagreeing with the deployed metadata.
    #[error("signature verification failed: {0}")]
    Untrusted(String),
    /// Unknown digest algorithm, unsupported layout version, non-Bearer
    /// auth, or a write attempted on a remote registry.
    #[error("not supported: {0}")]
    NotSupported(String),
    /// Malformed ref, URL, digest, or user-supplied value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A filesystem or namespace operation was refused.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The application declares a required engine version greater than ours.
    #[error("{id} requires engine version {required} (this is {current})")]
    NeedsNewerEngine {
        /// Application id making the demand.
        id: String,
        /// The version it asks for.
        required: String,
        /// The version we are.
        current: String,
    },
}

/// Return the typed kind embedded in an anyhow chain, if any.
pub fn error_kind(err: &anyhow::Error) -> Option<&Error> {
    err.downcast_ref::<Error>()
}

/// Whether this error is one of the two idempotence signals.
pub fn is_idempotence_signal(err: &anyhow::Error) -> bool {
    matches!(
        error_kind(err),
        Some(Error::AlreadyDeployed(_) | Error::NotDeployed(_))
    )
}

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong on a bus request.
///
/// An idempotent re-acquire is not an error; it is reported as
/// [`AcquireReply::AlreadyOwner`](crate::name_registry::AcquireReply).
/// Failures never leave partial state behind: an operation that returns an
/// `Error` has mutated neither the registry nor the notification log.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The name does not follow the well-known-name grammar.
    #[error("invalid well-known name `{0}`")]
    InvalidName(String),

    /// The connection already owns the maximum number of names.
    #[error("connection owns too many names")]
    TooManyNames,

    /// No entry exists for the name.
    #[error("name `{0}` has no owner")]
    NameNotFound(String),

    /// The name is owned, the owner does not allow replacement and the
    /// request did not ask to queue.
    #[error("name `{0}` already has an owner")]
    NameExists(String),

    /// The policy refused the request, or the caller has no standing to
    /// release the name.
    #[error("operation not permitted")]
    PermissionDenied,

    /// The target connection id could not be resolved.
    #[error("no connection with id {0}")]
    NoConn(u64),

    /// A pool or queue ran out of space.
    #[error("out of memory")]
    NoMem,
}

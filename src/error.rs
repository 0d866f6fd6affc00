//! Error handling for the runtime core.
//!
//! Every operation in this crate is ultimately initiated by a kubelet call to
//! one of the two CRI services, so errors always end up in one of two places:
//! as a status response to the kubelet, or in the runtime logs. The wire
//! adapter maps each [`Error`] variant to a CRI status code 1:1, which is why
//! the set of variants below is closed: a new failure mode must pick one of
//! these meanings rather than invent a near-duplicate.
//!
//! Fallible functions return [`Result`] and propagate with `?`. Idempotent
//! operations (remove of an absent container, stop of an exited one) swallow
//! the benign variant at the facade and report success; everything else
//! surfaces unchanged.

use std::io;

/// Shorthand for results produced anywhere in the runtime core.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure modes of the runtime core, mapped to CRI status codes at the
/// service boundary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// User-supplied configuration violates a precondition, e.g. a TTY
    /// request without stdin, or a command that is empty after all image
    /// fallbacks.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A pod, container, or image could not be located.
    #[error("{0} not found")]
    NotFound(String),

    /// An ID prefix matched more than one stored key.
    #[error("id prefix {0:?} is ambiguous")]
    Ambiguous(String),

    /// An add collided with an existing pod, container, or index key.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Image removal was attempted while containers still pin the image.
    #[error("image {0} is in use")]
    InUse(String),

    /// A state-machine rule was violated, e.g. starting a container that is
    /// not in the created state.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// A CNI plugin, the launcher, or a pull subprocess failed in a way that
    /// a retry might resolve.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Durable metadata on disk failed to decode.
    #[error("corrupt metadata: {0}")]
    Corrupt(String),

    /// The operation's deadline expired or the caller went away.
    #[error("operation canceled")]
    Canceled,

    /// An I/O error from the store, the per-pod tree, or a socket.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// A JSON encode/decode error outside the durable registry (those are
    /// reported as [`Error::Corrupt`]).
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True for the variant idempotent operations are allowed to swallow.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Shorthand for [`Error::NotFound`] from any displayable subject.
    pub fn not_found(what: impl ToString) -> Self {
        Error::NotFound(what.to_string())
    }

    /// Shorthand for [`Error::Transient`] wrapping a subprocess failure.
    pub fn transient(what: impl ToString) -> Self {
        Error::Transient(what.to_string())
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Error::Io(io::Error::from_raw_os_error(errno as i32))
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Canceled
    }
}

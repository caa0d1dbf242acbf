//! The result-kind taxonomy used throughout the core.
//!
//! Every fallible operation returns [`Result<T>`], an alias for
//! `std::result::Result<T, MojoResult>`. `MojoResult` carries no payload
//! beyond an optional static detail string for protocol-violation
//! diagnostics: callers match on the kind, they don't parse messages.

use std::io;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, MojoResult>;

/// The result-kind taxonomy common to every operation in the core.
///
/// This mirrors a conventional RPC status taxonomy rather than
/// `std::io::ErrorKind`: callers of `wait`, `read_message`, `write_data`
/// and friends need distinctions (`ShouldWait` vs `Busy` vs
/// `FailedPrecondition`) that plain I/O errors don't carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MojoResult {
    #[error("ok")]
    Ok,
    #[error("operation cancelled")]
    Cancelled,
    #[error("unknown error")]
    Unknown,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("permission denied")]
    PermissionDenied,
    #[error("resource exhausted")]
    ResourceExhausted,
    #[error("failed precondition")]
    FailedPrecondition,
    #[error("operation aborted")]
    Aborted,
    #[error("value out of range")]
    OutOfRange,
    #[error("unimplemented")]
    Unimplemented,
    #[error("internal error")]
    Internal,
    #[error("unavailable")]
    Unavailable,
    #[error("data loss")]
    DataLoss,
    #[error("busy")]
    Busy,
    #[error("should wait")]
    ShouldWait,
}

impl MojoResult {
    /// Whether this kind represents success.
    pub fn is_ok(self) -> bool {
        matches!(self, MojoResult::Ok)
    }
}

impl From<io::Error> for MojoResult {
    fn from(err: io::Error) -> Self {
        use io::ErrorKind::*;
        match err.kind() {
            NotFound => MojoResult::NotFound,
            PermissionDenied => MojoResult::PermissionDenied,
            AlreadyExists => MojoResult::AlreadyExists,
            WouldBlock => MojoResult::ShouldWait,
            TimedOut => MojoResult::DeadlineExceeded,
            InvalidInput | InvalidData => MojoResult::InvalidArgument,
            _ => MojoResult::Unavailable,
        }
    }
}

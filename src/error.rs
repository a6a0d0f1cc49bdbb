//! Top-level error type for the public API. Each component defines its own `snafu` error enum
//! alongside its code (`lock::LockError`, `txlog::CodecError`, `checkpoint::CheckpointError`,
//! `core::CoreError`) and rolls up into [`QueueError`] here, the way the teacher scopes each
//! ledger/writer/reader error type to its own module.

use snafu::Snafu;

use crate::core::CoreError;
use crate::lock::LockError;

/// Errors produced by the public [`crate::Session`] and [`crate::Queue`] APIs.
#[derive(Debug, Snafu)]
pub enum QueueError {
    #[snafu(display("{}", source))]
    Core { source: CoreError },

    #[snafu(display("invalid argument: {}", message))]
    InvalidArgument { message: String },

    #[snafu(display("queue directory is locked by another process; retry with wait_for"))]
    LockContention,
}

impl From<CoreError> for QueueError {
    fn from(source: CoreError) -> Self {
        match source {
            CoreError::Lock {
                source: LockError::AlreadyLockedByOtherProcess { .. },
            } => QueueError::LockContention,
            other => QueueError::Core { source: other },
        }
    }
}

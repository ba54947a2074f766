//! Error taxonomy for the remote slot-lease subsystem.
//!
//! Every fallible operation in this crate returns one of the variants
//! below. Four kinds of failure exist, all on a single base type:
//! host-level unreachability, lock contention, slot I/O failure, and
//! caller misuse (invalid arguments). See spec §7 for the propagation
//! policy each layer applies to these.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteHostError {
    /// SSH connect/exec failed after the retry budget was exhausted.
    #[error("{hostname}: host is not reachable: {source}")]
    HostUnreachable {
        hostname: String,
        #[source]
        source: anyhow::Error,
    },

    /// The remote `flock` reported a contended lock (or the lock protocol
    /// otherwise failed to establish, e.g. the SSH sessions could not be
    /// opened).
    #[error("{hostname}: failed to acquire lock on slot {slot_id}: {reason}")]
    LockContended {
        hostname: String,
        slot_id: u32,
        reason: String,
    },

    /// Reading the slot file failed (non-zero exit or SSH failure).
    #[error("{hostname}: cannot read content of slot {slot_id}: {reason}")]
    ReadError {
        hostname: String,
        slot_id: u32,
        reason: String,
    },

    /// Writing the slot file failed (non-zero exit or SSH failure).
    #[error("{hostname}: cannot write data to slot {slot_id}: {reason}")]
    WriteError {
        hostname: String,
        slot_id: u32,
        reason: String,
    },

    /// Caller-supplied argument (slot id, config value) was invalid.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },
}

pub type Result<T> = std::result::Result<T, RemoteHostError>;

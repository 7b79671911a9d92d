//! Error taxonomy for thrash-protect.
//!
//! Most of the daemon's fallible operations are *not* represented as
//! `Result` at all: a missing `/proc` entry is an ordinary outcome (the
//! process exited between the scan and the read) and is collapsed to
//! `None` by the caller rather than propagated. This enum exists for the
//! smaller set of failures that are worth naming and that a caller may
//! want to match on - registry/freezer failures, and the handful of
//! fatal conditions that abort the control loop.

use std::path::PathBuf;

/// Errors that can surface from the core daemon components.
#[derive(thiserror::Error, Debug)]
pub enum ThrashProtectError {
    #[error("process {pid} is gone")]
    ProcessGone { pid: i32 },

    #[error("probe unavailable: {probe}")]
    ProbeUnavailable { probe: &'static str },

    #[error("malformed data from {origin}: {detail}")]
    ParseMalformed {
        origin: &'static str,
        detail: String,
    },

    #[error("failed to write {}: {source}", path.display())]
    WriteLogFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("freeze failed: {detail}")]
    FreezeFailure { detail: String },

    #[error("refusing to suspend own pid {pid}")]
    SelfTarget { pid: i32 },

    #[error("mlockall failed with errno {errno}")]
    MlockallFailed { errno: i32 },

    #[error("fatal: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, ThrashProtectError>;

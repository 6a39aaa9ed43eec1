//! Error types.
//!
//! This is the shared error type for the whole crate, plus the value-level
//! error kinds reported by the scheduler in a `ScheduleStatus`.

use std::{error, fmt};

/// Errors returned by device, registry and shader database entry points.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// Handle generation mismatch, or the slot was freed.
    InvalidHandle,
    /// A validation rule was violated at create time.
    InvalidParameter(String),
    /// The backend returned a failure (memory, buffer or descriptor creation).
    InternalApiFailure(String),
    /// The external compiler returned diagnostics.
    ShaderCompileError(String),
    /// The main shader source file could not be read.
    ShaderIoError(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::InvalidHandle => write!(f, "invalid handle"),
            Error::InvalidParameter(msg) => write!(f, "invalid parameter: {}", msg),
            Error::InternalApiFailure(msg) => write!(f, "internal api failure: {}", msg),
            Error::ShaderCompileError(msg) => write!(f, "shader compile error: {}", msg),
            Error::ShaderIoError(msg) => write!(f, "shader io error: {}", msg),
        }
    }
}

impl error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Value-level outcome of a `schedule` call.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ScheduleErrorType {
    Ok,
    /// A command references a handle with a stale generation.
    InvalidHandle,
    /// A command references a resource missing from the global state map.
    ResourceStateNotFound,
    /// A command references a table that is not registered.
    BadTableInfo,
    /// The command stream contains an unknown tag.
    CorruptedCommandListSentinel,
    /// The final merge of per-schedule states into the global map failed.
    CommitResourceStateFail,
    /// The backend rejected the submission.
    InternalApiFailure,
}

impl ScheduleErrorType {
    pub fn is_ok(self) -> bool {
        self == ScheduleErrorType::Ok
    }
}

impl fmt::Display for ScheduleErrorType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ScheduleErrorType::Ok => "ok",
            ScheduleErrorType::InvalidHandle => "invalid handle",
            ScheduleErrorType::ResourceStateNotFound => "resource state not found",
            ScheduleErrorType::BadTableInfo => "bad table info",
            ScheduleErrorType::CorruptedCommandListSentinel => "corrupted command list sentinel",
            ScheduleErrorType::CommitResourceStateFail => "commit resource state fail",
            ScheduleErrorType::InternalApiFailure => "internal api failure",
        };
        f.write_str(s)
    }
}

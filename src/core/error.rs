//! Typed error taxonomy shared by every core component (spec §7). Adapters
//! match on `ErrorKind`, not on which component raised the failure.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NoEntry,
    Exists,
    NotEmpty,
    NoSpace,
    TooManyLinks,
    NameTooLong,
    InvalidArgument,
    Corrupted,
    IoFailure,
    NeedsFsck,
    ReadOnly,
    CapacityExceeded,
}

#[derive(Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct FsError {
    pub kind: ErrorKind,
    pub message: String,
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn no_entry(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoEntry, msg)
    }
    pub fn exists(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Exists, msg)
    }
    pub fn not_empty(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotEmpty, msg)
    }
    pub fn no_space(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoSpace, msg)
    }
    pub fn too_many_links(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::TooManyLinks, msg)
    }
    pub fn name_too_long(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NameTooLong, msg)
    }
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, msg)
    }
    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Corrupted, msg)
    }
    pub fn io_failure(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::IoFailure, msg)
    }
    pub fn needs_fsck(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NeedsFsck, msg)
    }
    pub fn read_only(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ReadOnly, msg)
    }
    pub fn capacity_exceeded(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::CapacityExceeded, msg)
    }
}

impl From<std::io::Error> for FsError {
    fn from(e: std::io::Error) -> Self {
        FsError::io_failure(e.to_string())
    }
}

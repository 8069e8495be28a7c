use thiserror::Error;

use crate::types::{FileKind, ObjectId};

pub type SealfsResult<T> = Result<T, SealfsError>;

#[derive(Debug, Error)]
pub enum SealfsError {
    /// Malformed security config, unsupported version, unknown KDF.
    #[error("config error: {0}")]
    Config(String),

    /// Neither key-derivation order authenticated the wrapped master key.
    #[error("invalid password or keyfile combination")]
    Authentication,

    /// Stored mode bits disagree with the declared kind (storage corruption).
    #[error("object {id} is declared as {declared} but its mode is {mode:#o}")]
    TypeConsistency {
        id: ObjectId,
        declared: FileKind,
        mode: u32,
    },

    /// Caller asked for a view of the wrong kind.
    #[error("object {id} is a {actual}, not a {expected}")]
    InvalidCast {
        id: ObjectId,
        expected: FileKind,
        actual: FileKind,
    },

    #[error("name too long: {0} bytes")]
    NameTooLong(usize),

    #[error("entry already exists: {0}")]
    EntryExists(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SealfsError {
    pub fn config(msg: impl Into<String>) -> Self {
        SealfsError::Config(msg.into())
    }

    pub fn crypto(msg: impl Into<String>) -> Self {
        SealfsError::Crypto(msg.into())
    }

    /// Build an `Io` error carrying a raw errno.
    pub fn from_errno(code: i32) -> Self {
        SealfsError::Io(std::io::Error::from_raw_os_error(code))
    }

    /// POSIX errno handed back to the filesystem-call dispatcher.
    ///
    /// OS-level failures keep their original code; corruption surfaces as EIO.
    pub fn errno(&self) -> i32 {
        match self {
            SealfsError::Config(_) => libc::EINVAL,
            SealfsError::Authentication => libc::EACCES,
            SealfsError::TypeConsistency { .. } => libc::EIO,
            SealfsError::InvalidCast { expected, .. } => match expected {
                FileKind::RegularFile => libc::EPERM,
                FileKind::Symlink => libc::EINVAL,
                FileKind::Directory => libc::ENOTDIR,
            },
            SealfsError::NameTooLong(_) => libc::ENAMETOOLONG,
            SealfsError::EntryExists(_) => libc::EEXIST,
            SealfsError::Crypto(_) => libc::EIO,
            SealfsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

use thiserror::Error;

use crate::EntryName;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a union filesystem operation.
pub type UnionResult<T> = Result<T, UnionError>;

/// An error that occurred during a union filesystem operation.
#[derive(pretty_error_debug::Debug, Error)]
pub enum UnionError {
    /// The name does not resolve in either layer
    #[error("entry not found: {0}")]
    NotFound(EntryName),

    /// The name is already visible in the merged view
    #[error("entry already exists: {0}")]
    AlreadyExists(EntryName),

    /// The node is not a directory
    #[error("not a directory")]
    NotADirectory,

    /// The node is not a regular file
    #[error("not a regular file")]
    NotAFile,

    /// The node is not a symbolic link
    #[error("not a symbolic link")]
    NotASymlink,

    /// The directory is not empty in the merged view
    #[error("directory not empty: {0}")]
    NotEmpty(EntryName),

    /// A mutating operation reached a node with no upper layer and no
    /// legal copy-up path
    #[error("filesystem is read-only")]
    ReadOnlyFilesystem,

    /// Removal of a referenced node while busy deletion is disallowed
    #[error("entry is busy: {0}")]
    Busy(EntryName),

    /// A layer required by the mount configuration is missing
    #[error("mount is missing its {0} layer")]
    LayerMissing(&'static str),

    /// Insufficient permissions for the operation
    #[error("permission denied")]
    PermissionDenied,

    /// The layer ran out of space
    #[error("no space left on layer")]
    NoSpace,

    /// Invalid offset for a read or write
    #[error("invalid offset {offset}")]
    InvalidOffset {
        /// The offset that is invalid
        offset: u64,
    },

    /// A handle was presented to a layer that did not create it
    #[error("handle does not belong to this layer")]
    ForeignHandle,

    /// The operation is not supported by the engine or the active layer
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// Empty entry name
    #[error("empty entry name")]
    EmptyEntryName,

    /// Invalid entry name (separator, NUL, `.` or `..`)
    #[error("invalid entry name: {0}")]
    InvalidEntryName(String),

    /// IO error reported by a layer
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Custom error.
    #[error(transparent)]
    Custom(#[from] AnyError),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl UnionError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> UnionError {
        UnionError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Returns `true` for the not-found class of results, which drive the
    /// merge policy rather than aborting it.
    pub fn is_absence(&self) -> bool {
        matches!(self, UnionError::NotFound(_))
    }

    /// Maps the error to the closest POSIX errno value.
    pub fn to_errno(&self) -> i32 {
        match self {
            UnionError::NotFound(_) => libc::ENOENT,
            UnionError::AlreadyExists(_) => libc::EEXIST,
            UnionError::NotADirectory => libc::ENOTDIR,
            UnionError::NotAFile => libc::EINVAL,
            UnionError::NotASymlink => libc::EINVAL,
            UnionError::NotEmpty(_) => libc::ENOTEMPTY,
            UnionError::ReadOnlyFilesystem => libc::EROFS,
            UnionError::Busy(_) => libc::EBUSY,
            UnionError::LayerMissing(_) => libc::ENODEV,
            UnionError::PermissionDenied => libc::EACCES,
            UnionError::NoSpace => libc::ENOSPC,
            UnionError::InvalidOffset { .. } => libc::EINVAL,
            UnionError::ForeignHandle => libc::EXDEV,
            UnionError::Unsupported(_) => libc::ENOTSUP,
            UnionError::EmptyEntryName => libc::EINVAL,
            UnionError::InvalidEntryName(_) => libc::EINVAL,
            UnionError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            UnionError::Custom(_) => libc::EIO,
        }
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `UnionResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> UnionResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

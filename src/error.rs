//! Kernel error values
//!
//! Every recoverable failure in the core is one of these. They map one to one
//! onto POSIX errno values so the syscall layer can hand them to userspace.

use thiserror::Error;

/// Errors returned by kernel operations
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    #[error("out of memory")]
    OutOfMemory,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("operation not permitted")]
    PermissionDenied,

    #[error("permission denied")]
    AccessDenied,

    #[error("no such process")]
    NoSuchProcess,

    #[error("no child process")]
    NoChild,

    #[error("bad file descriptor")]
    BadFileDescriptor,

    #[error("too many open files")]
    TooManyOpenFiles,

    #[error("operation not supported")]
    NotSupported,

    #[error("no such file or directory")]
    NotFound,

    #[error("exec format error")]
    ExecFormat,

    #[error("bad address")]
    Fault,

    #[error("broken pipe")]
    BrokenPipe,

    #[error("interrupted system call")]
    Interrupted,
}

impl KernelError {
    /// POSIX errno value for this error
    pub const fn errno(self) -> i32 {
        match self {
            KernelError::PermissionDenied => 1,
            KernelError::NotFound => 2,
            KernelError::NoSuchProcess => 3,
            KernelError::Interrupted => 4,
            KernelError::ExecFormat => 8,
            KernelError::BadFileDescriptor => 9,
            KernelError::NoChild => 10,
            KernelError::OutOfMemory => 12,
            KernelError::AccessDenied => 13,
            KernelError::Fault => 14,
            KernelError::InvalidArgument => 22,
            KernelError::TooManyOpenFiles => 24,
            KernelError::BrokenPipe => 32,
            KernelError::NotSupported => 95,
        }
    }
}

impl From<alloc::collections::TryReserveError> for KernelError {
    fn from(_: alloc::collections::TryReserveError) -> Self {
        KernelError::OutOfMemory
    }
}

/// Result alias used throughout the kernel
pub type KernResult<T> = Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;
    use alloc::vec::Vec;

    #[test]
    fn test_errno_values() {
        assert_eq!(KernelError::OutOfMemory.errno(), 12);
        assert_eq!(KernelError::NoChild.errno(), 10);
        assert_eq!(KernelError::NoSuchProcess.errno(), 3);
        assert_eq!(KernelError::InvalidArgument.errno(), 22);
    }

    #[test]
    fn test_display() {
        assert_eq!(KernelError::NoChild.to_string(), "no child process");
    }

    #[test]
    fn test_try_reserve_maps_to_oom() {
        let mut v: Vec<u8> = Vec::new();
        let err = v.try_reserve(usize::MAX).unwrap_err();
        assert_eq!(KernelError::from(err), KernelError::OutOfMemory);
    }
}

// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Guest error codes and host error translation
//!
//! Every host failure crosses into the guest through [`Errno::from_host`].
//! Discriminants are the i386 Linux errno values the guest expects.

use std::io;

/// Guest-visible error code
#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Errno {
    #[error("operation not permitted")]
    NotPermitted = 1,
    #[error("no such file or directory")]
    NotFound = 2,
    #[error("no such process")]
    NoSuchProcess = 3,
    #[error("interrupted system call")]
    Interrupted = 4,
    #[error("i/o error")]
    Io = 5,
    #[error("no such device or address")]
    NoSuchDeviceOrAddress = 6,
    #[error("exec format error")]
    ExecFormat = 8,
    #[error("bad file descriptor")]
    BadDescriptor = 9,
    #[error("no child processes")]
    NoChild = 10,
    #[error("resource temporarily unavailable")]
    WouldBlock = 11,
    #[error("out of memory")]
    OutOfMemory = 12,
    #[error("permission denied")]
    AccessDenied = 13,
    #[error("bad address")]
    Fault = 14,
    #[error("device or resource busy")]
    Busy = 16,
    #[error("file exists")]
    AlreadyExists = 17,
    #[error("invalid cross-device link")]
    CrossDevice = 18,
    #[error("no such device")]
    NoDevice = 19,
    #[error("not a directory")]
    NotADirectory = 20,
    #[error("is a directory")]
    IsADirectory = 21,
    #[error("too many open files in system")]
    TooManyFilesInSystem = 23,
    #[error("too many open files")]
    TooManyOpenFiles = 24,
    #[error("inappropriate ioctl for device")]
    NotATerminal = 25,
    #[error("file too large")]
    FileTooLarge = 27,
    #[error("no space left on device")]
    NoSpace = 28,
    #[error("illegal seek")]
    IllegalSeek = 29,
    #[error("read-only file system")]
    ReadOnlyFilesystem = 30,
    #[error("broken pipe")]
    BrokenPipe = 32,
    #[error("file name too long")]
    NameTooLong = 36,
    #[error("no locks available")]
    NoLocks = 37,
    #[error("function not implemented")]
    NotImplemented = 38,
    #[error("directory not empty")]
    DirectoryNotEmpty = 39,
}

pub type FsResult<T> = Result<T, Errno>;

impl Errno {
    /// Guest errno value
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Negated value for the signed syscall return convention
    pub fn as_neg(self) -> i32 {
        -(self as i32)
    }

    /// Translate a host errno into the guest code. Unmapped codes become `Io`.
    pub fn from_host(code: i32) -> Self {
        match code {
            libc::EPERM => Errno::NotPermitted,
            libc::ENOENT => Errno::NotFound,
            libc::ESRCH => Errno::NoSuchProcess,
            libc::EINTR => Errno::Interrupted,
            libc::EIO => Errno::Io,
            libc::ENXIO => Errno::NoSuchDeviceOrAddress,
            libc::ENOEXEC => Errno::ExecFormat,
            libc::EBADF => Errno::BadDescriptor,
            libc::ECHILD => Errno::NoChild,
            libc::EAGAIN => Errno::WouldBlock,
            libc::ENOMEM => Errno::OutOfMemory,
            libc::EACCES => Errno::AccessDenied,
            libc::EFAULT => Errno::Fault,
            libc::EBUSY => Errno::Busy,
            libc::EEXIST => Errno::AlreadyExists,
            libc::EXDEV => Errno::CrossDevice,
            libc::ENODEV => Errno::NoDevice,
            libc::ENOTDIR => Errno::NotADirectory,
            libc::EISDIR => Errno::IsADirectory,
            libc::ENFILE => Errno::TooManyFilesInSystem,
            libc::EMFILE => Errno::TooManyOpenFiles,
            libc::ENOTTY => Errno::NotATerminal,
            libc::EFBIG => Errno::FileTooLarge,
            libc::ENOSPC => Errno::NoSpace,
            libc::ESPIPE => Errno::IllegalSeek,
            libc::EROFS => Errno::ReadOnlyFilesystem,
            libc::EPIPE => Errno::BrokenPipe,
            libc::ENAMETOOLONG => Errno::NameTooLong,
            libc::ENOLCK => Errno::NoLocks,
            libc::ENOSYS => Errno::NotImplemented,
            libc::ENOTEMPTY => Errno::DirectoryNotEmpty,
            _ => Errno::Io,
        }
    }
}

impl From<io::Error> for Errno {
    fn from(err: io::Error) -> Self {
        Errno::from(&err)
    }
}

impl From<&io::Error> for Errno {
    fn from(err: &io::Error) -> Self {
        if let Some(code) = err.raw_os_error() {
            return Errno::from_host(code);
        }
        // Synthetic errors (no OS code) still carry a kind worth keeping
        match err.kind() {
            io::ErrorKind::NotFound => Errno::NotFound,
            io::ErrorKind::PermissionDenied => Errno::AccessDenied,
            io::ErrorKind::AlreadyExists => Errno::AlreadyExists,
            io::ErrorKind::WouldBlock => Errno::WouldBlock,
            io::ErrorKind::Interrupted => Errno::Interrupted,
            io::ErrorKind::BrokenPipe => Errno::BrokenPipe,
            io::ErrorKind::OutOfMemory => Errno::OutOfMemory,
            io::ErrorKind::Unsupported => Errno::NotImplemented,
            _ => Errno::Io,
        }
    }
}

/// Internal scheduler signal returned as a raw syscall value; distinct from every errno
pub const K_WAIT: i32 = 0x0FFF_FFFF;

/// Outcome of a call that may have to be re-invoked by the scheduler
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress<T> {
    Complete(T),
    /// The calling thread is parked; re-run the identical call on its next slice
    Retry,
}

impl<T> Progress<T> {
    pub fn is_retry(&self) -> bool {
        matches!(self, Progress::Retry)
    }
}

/// Encode a multiplexer result in the signed syscall convention
pub fn to_syscall_return(result: FsResult<Progress<u32>>) -> i32 {
    match result {
        Ok(Progress::Complete(count)) => count as i32,
        Ok(Progress::Retry) => -K_WAIT,
        Err(errno) => errno.as_neg(),
    }
}

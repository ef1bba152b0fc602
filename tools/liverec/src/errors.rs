use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reason an attach to the current process failed.
///
/// The numeric codes are shared with consumers of saved recordings and must
/// not be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachErrorKind {
    /// ptrace attach refused by the kernel's ptrace scope policy.
    PermissionDenied = 1,
    CannotAttach = 2,
    /// Dynamic libraries used by the process could not be resolved.
    LibrarySearchFailed = 3,
    /// Miscellaneous failure without a more specific code.
    CannotRecord = 4,
    NoThreadInfo = 5,
    /// Memory protection keys are in use, which recording does not support.
    ProtectionKeysInUse = 6,
}

impl AttachErrorKind {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::PermissionDenied),
            2 => Some(Self::CannotAttach),
            3 => Some(Self::LibrarySearchFailed),
            4 => Some(Self::CannotRecord),
            5 => Some(Self::NoThreadInfo),
            6 => Some(Self::ProtectionKeysInUse),
            _ => None,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::PermissionDenied => {
                "failed to attach to the process due to /proc/sys/kernel/yama/ptrace_scope"
            }
            Self::CannotAttach => "failed to attach to the process",
            Self::LibrarySearchFailed => "failed to find dynamic libraries used by the process",
            Self::CannotRecord => "recording error",
            Self::NoThreadInfo => "unable to find information about threads",
            Self::ProtectionKeysInUse => "use of memory protection keys was detected",
        }
    }
}

/// Describes a numeric attach error code; `0` means no error.
pub fn error_string(code: i32) -> &'static str {
    if code == 0 {
        return "no error";
    }
    AttachErrorKind::from_code(code)
        .map(AttachErrorKind::describe)
        .unwrap_or("<unknown error>")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecorderError {
    #[error("not recording")]
    NotRecording,
    #[error("already recording")]
    AlreadyRecording,
    #[error("attach failed: {}", .0.describe())]
    Attach(AttachErrorKind),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("operation already in progress")]
    AlreadyInProgress,
    #[error("invalid or discarded handle")]
    InvalidHandle,
    #[error("saving not yet started")]
    SaveNotStarted,
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("recorder detached; recording cannot be restarted")]
    Detached,
    #[error("io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cli error: {0}")]
    Cli(String),
}

impl RecorderError {
    /// The errno the equivalent C entry point would leave behind.
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotRecording => libc::ENOTSUP,
            Self::AlreadyRecording => libc::EBUSY,
            Self::Attach(AttachErrorKind::PermissionDenied) => libc::EPERM,
            Self::Attach(_) => libc::EIO,
            Self::InvalidArgument(_) | Self::InvalidConfig(_) | Self::ConfigParse(_) => {
                libc::EINVAL
            }
            Self::AlreadyInProgress => libc::EBUSY,
            Self::InvalidHandle => libc::EBADF,
            Self::SaveNotStarted => libc::EINVAL,
            Self::NotSupported(_) => libc::ENOTSUP,
            Self::Detached => libc::EPERM,
            Self::Io(_) => libc::EIO,
            Self::Cli(_) => libc::EINVAL,
        }
    }
}

pub(crate) fn io_err(error: std::io::Error) -> RecorderError {
    RecorderError::Io(error.to_string())
}

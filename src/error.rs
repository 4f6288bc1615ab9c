use nix::errno::Errno;

/// Any error this library might encounter.
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum Error {
    #[error("no target is attached to the session")]
    NotAttached,
    #[error("interacting with the traced process via ptrace failed")]
    Ptrace(#[from] pete::Error),
    #[error("couldn't read the procfs filesystem (`/proc`)")]
    ProcFs(#[from] procfs::ProcError),
    #[error("couldn't access {len} bytes of target memory at {addr:#x}")]
    Memory { addr: u64, len: usize },
    #[error("the target exited while it was being traced")]
    TargetExited,
    #[error("{0} could not be located in the target")]
    Missing(&'static str),
    #[error("the target's syscall failed with {errno}")]
    ChildError { errno: Errno },
}

/// A type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// The class of the last error a session ran into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ErrorCode {
    /// The last operation succeeded.
    #[default]
    None,
    /// The operation needed an attached target.
    NotAttached,
    /// A trace, register or memory operation failed.
    Syscall,
    /// An expected structure, tag or table was absent.
    Needed,
    /// The target's own syscall reported failure.
    ChildError,
}

impl Error {
    /// Classify this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NotAttached => ErrorCode::NotAttached,
            Self::Ptrace(_) | Self::ProcFs(_) | Self::Memory { .. } | Self::TargetExited => {
                ErrorCode::Syscall
            }
            Self::Missing(_) => ErrorCode::Needed,
            Self::ChildError { .. } => ErrorCode::ChildError,
        }
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Self::ChildError { errno }
    }
}

//! Error types shared across the channels, workers and the server.

use {
    std::{io, path::PathBuf, process::ExitStatus},
    thiserror::Error,
};

/// Failures of the length-prefixed client stream.
///
/// Any of these means the connection is dead and must be torn down.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Peer closed the stream before a complete frame arrived.
    #[error("peer closed the connection")]
    Closed,

    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// Failures of the kernel IPC primitives (semaphores, queues, mailbox segment).
#[derive(Error, Debug)]
pub enum IpcError {
    #[error("cannot prepare key file {path}: {source}")]
    KeyFile { path: PathBuf, source: io::Error },

    #[error("cannot create {what}: {source}")]
    Create { what: &'static str, source: io::Error },

    #[error("cannot attach to {what}: {source}")]
    Attach { what: &'static str, source: io::Error },

    /// The resource was deleted while a caller was waiting on it.
    #[error("IPC resource was removed")]
    Removed,

    /// The caller's shutdown token fired during a wait.
    #[error("wait cancelled by shutdown")]
    Cancelled,

    #[error("message of {size} bytes does not fit in {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    #[error("{op} failed: {source}")]
    Os { op: &'static str, source: io::Error },
}

impl IpcError {
    /// Classify the current `errno` of a failed SysV call.
    ///
    /// The kernel answers EINVAL both for bad arguments and for an id that
    /// no longer exists, so EINVAL means removal only when `exists` says the
    /// resource is gone.
    pub(crate) fn last_os(op: &'static str, exists: impl FnOnce() -> bool) -> Self {
        let source = io::Error::last_os_error();
        match source.raw_os_error() {
            Some(libc::EIDRM) => IpcError::Removed,
            Some(libc::EINVAL) if !exists() => IpcError::Removed,
            _ => IpcError::Os { op, source },
        }
    }

    /// `true` when a worker loop should stop quietly rather than report failure.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, IpcError::Removed | IpcError::Cancelled)
    }
}

#[derive(Error, Debug)]
pub enum CompileError {
    #[error("cannot run compiler `{program}`: {source}")]
    Spawn { program: String, source: io::Error },

    #[error("compiler exited with {status}")]
    Failed { status: ExitStatus, diagnostics: String },
}

/// Messages that do not have the shape the protocol expects.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown game opcode {0:?}")]
    UnknownOpcode(String),

    #[error("malformed game message {0:?}")]
    Malformed(String),

    #[error("move {0:?} is not an integer")]
    InvalidMove(String),

    #[error("chunk count {0:?} is not a non-negative integer")]
    InvalidChunkCount(String),

    #[error("chunk of {size} bytes exceeds the {max} byte limit")]
    ChunkTooLarge { size: usize, max: usize },

    #[error("session key must be positive, got {0}")]
    InvalidSessionKey(i64),
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

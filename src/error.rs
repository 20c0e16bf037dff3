//! The single error type surfaced at every public boundary of the crate.

use thiserror::Error;

/// Result alias used throughout `netfs`.
pub type Result<T> = std::result::Result<T, NetfsError>;

/// Errors surfaced by any `netfs` subsystem. Each variant carries the
/// structured data a caller needs to react, rather than being compared by
/// identity against a sentinel value.
#[derive(Debug, Error)]
pub enum NetfsError {
    /// No RFC1918 address is bound to any local interface.
    #[error("no local RFC1918 address found")]
    LocalIpNotFound,

    /// A transport factory was asked for a protocol it doesn't implement.
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// A peer responded with a non-success status.
    #[error("status code is [{status}], message is [{body}]")]
    UnexpectedAnswer { status: u16, body: String },

    /// A peer did not respond within the configured timeout.
    #[error("request to peer timed out")]
    Timeout,

    /// No volume matches the requested virtual path's `<name>` prefix.
    #[error("volume not found: {0}")]
    VolumeNotFound(String),

    /// No file metadata row matches the requested virtual path.
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// The volume's permission bitset does not include `Read`.
    #[error("read operation is not permitted on volume {0}")]
    ReadNotPermitted(String),

    /// The volume's permission bitset does not include `Write`.
    #[error("write operation is not permitted on volume {0}")]
    WriteNotPermitted(String),

    /// A task row was decoded with a `type` tag this build doesn't know.
    #[error("unknown task type: {0}")]
    UnknownTaskType(u8),

    /// The task id was not found in the task table.
    #[error("task not found: {0}")]
    TaskNotFound(u64),

    /// A virtual path is missing the mandatory `<volume>:` prefix.
    #[error("malformed virtual path: {0}")]
    MalformedVirtualPath(String),

    /// `server/stop` was requested by a non-local peer.
    #[error("stop request did not originate from the local host")]
    Forbidden,

    /// One or more subsystems failed to start; never partial.
    #[error("server startup failed: {0:?}")]
    Startup(Vec<String>),

    /// Local file-system I/O failure, propagated verbatim.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON encode/decode failure, propagated verbatim.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Peer transport failure below the HTTP status layer (connect, DNS, ...).
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

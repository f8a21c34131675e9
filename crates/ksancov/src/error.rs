//! Error taxonomy for the coverage client.
//!
//! Every failure reported by the device carries the original
//! [`io::Error`], so the platform error code reaches the caller
//! unmodified (see [`KsancovError::os_error`]).  Nothing in this crate
//! retries on its own.

use crate::session::SessionState;
use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = KsancovError> = std::result::Result<T, E>;

/// Operations issued against the device control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceOp {
    SetTraceMode,
    SetCountersMode,
    MapDataBuffer,
    MapEdgeMap,
    BindThread,
    EdgeCount,
    Unmap,
    Close,
}

impl fmt::Display for DeviceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceOp::SetTraceMode => "set-trace-mode",
            DeviceOp::SetCountersMode => "set-counters-mode",
            DeviceOp::MapDataBuffer => "map-data-buffer",
            DeviceOp::MapEdgeMap => "map-edgemap-buffer",
            DeviceOp::BindThread => "bind-current-thread",
            DeviceOp::EdgeCount => "get-edge-count",
            DeviceOp::Unmap => "unmap",
            DeviceOp::Close => "close",
        };
        f.write_str(name)
    }
}

/// Which shared buffer an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Data,
    EdgeMap,
}

impl fmt::Display for BufferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferKind::Data => f.write_str("data buffer"),
            BufferKind::EdgeMap => f.write_str("edge map"),
        }
    }
}

/// How a mapped buffer disagrees with what the client negotiated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutMismatch {
    #[error("magic {found:#010x}, expected {expected:#010x}")]
    Magic { expected: u32, found: u32 },

    #[error("capacity {found}, expected {expected}")]
    Capacity { expected: usize, found: usize },

    #[error("edge count {found}, expected {expected}")]
    EdgeCount { expected: usize, found: usize },

    #[error("mapping is {mapped} bytes, layout needs {required}")]
    TooShort { required: usize, mapped: usize },

    #[error("base address {addr:#x} is not {align}-byte aligned")]
    Misaligned { addr: usize, align: usize },
}

/// Errors from the coverage client.
#[derive(Error, Debug)]
pub enum KsancovError {
    /// The device node could not be opened (missing, or no permission).
    #[error("Coverage device {} unavailable: {source}", path.display())]
    DeviceUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A control operation was rejected by the device.
    #[error("Control operation {op} failed: {source}")]
    Config {
        op: DeviceOp,
        #[source]
        source: io::Error,
    },

    /// The operation is not legal in the session's current state.
    #[error("{op} not allowed while the session is {state}")]
    InvalidState { op: &'static str, state: SessionState },

    /// The calling execution context never bound itself to the session.
    #[error("{op} called from an execution context that is not bound to the session")]
    UnboundContext { op: &'static str },

    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The device refused to map a buffer.
    #[error("Failed to map {buffer}: {source}")]
    Map {
        buffer: BufferKind,
        #[source]
        source: io::Error,
    },

    /// The mapped buffer does not have the negotiated layout.
    #[error("Layout mismatch in {buffer}: {mismatch}")]
    Layout {
        buffer: BufferKind,
        mismatch: LayoutMismatch,
    },

    #[error("Failed to bind current thread: {0}")]
    Bind(#[source] io::Error),

    #[error("Failed to unmap {buffer}: {source}")]
    Unmap {
        buffer: BufferKind,
        #[source]
        source: io::Error,
    },

    #[error("Failed to close device: {0}")]
    Close(#[source] io::Error),
}

impl KsancovError {
    /// The platform error code reported by the device, untouched.
    pub fn os_error(&self) -> Option<i32> {
        match self {
            KsancovError::DeviceUnavailable { source, .. }
            | KsancovError::Config { source, .. }
            | KsancovError::Map { source, .. }
            | KsancovError::Unmap { source, .. } => source.raw_os_error(),
            KsancovError::Bind(source) | KsancovError::Close(source) => source.raw_os_error(),
            _ => None,
        }
    }

    /// Whether retrying (with corrected parameters or a fresh session)
    /// can possibly succeed.  Layout mismatches signal client/kernel
    /// version skew and never go away.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, KsancovError::Layout { .. })
    }

    /// Caller misuse: wrong state, wrong context, or a bad argument.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            KsancovError::InvalidState { .. }
                | KsancovError::UnboundContext { .. }
                | KsancovError::InvalidArgument(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_error_is_preserved() {
        let err = KsancovError::Config {
            op: DeviceOp::SetTraceMode,
            source: io::Error::from_raw_os_error(libc::EBUSY),
        };
        assert_eq!(err.os_error(), Some(libc::EBUSY));

        let err = KsancovError::Bind(io::Error::from_raw_os_error(libc::EPERM));
        assert_eq!(err.os_error(), Some(libc::EPERM));
    }

    #[test]
    fn usage_errors_have_no_os_code() {
        let err = KsancovError::InvalidArgument("max_entries must be positive");
        assert_eq!(err.os_error(), None);
        assert!(err.is_usage_error());
    }

    #[test]
    fn layout_errors_are_not_retryable() {
        let err = KsancovError::Layout {
            buffer: BufferKind::Data,
            mismatch: LayoutMismatch::Capacity {
                expected: 16,
                found: 32,
            },
        };
        assert!(!err.is_retryable());
        assert!(!err.is_usage_error());

        let err = KsancovError::Map {
            buffer: BufferKind::Data,
            source: io::Error::from_raw_os_error(libc::ENOMEM),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn messages_name_the_operation() {
        let err = KsancovError::InvalidState {
            op: "start",
            state: SessionState::Configured,
        };
        assert_eq!(
            err.to_string(),
            "start not allowed while the session is configured"
        );

        let mismatch = LayoutMismatch::Magic {
            expected: 0x5AD1_7F5B,
            found: 0,
        };
        assert_eq!(mismatch.to_string(), "magic 0x00000000, expected 0x5ad17f5b");
    }
}

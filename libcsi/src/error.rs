//! CSI error types.
//!
//! All errors in the `libcsi` crate are represented by the [`CsiError`] enum,
//! which derives [`thiserror::Error`] for ergonomic error handling and also
//! implements [`Serialize`]/[`Deserialize`] so errors can travel across the
//! QUIC transport layer.  Every variant maps onto a gRPC-style
//! [`StatusCode`] through [`CsiError::code`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse error class reported to the caller, mirroring the CSI status codes
/// a container orchestrator reacts to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StatusCode {
    /// The request itself is wrong or conflicts with existing state.
    InvalidArgument,
    /// The referenced volume is unknown on this node.
    NotFound,
    /// The request is well formed but the node is not in the required state.
    FailedPrecondition,
    /// A host-side operation or hook failed.
    Internal,
    /// The transport could not deliver the request.
    Unavailable,
}

/// Unified error type for CSI operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone)]
pub enum CsiError {
    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The request conflicts with a volume that is already staged.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The requested volume was not found.
    #[error("volume {0} not found")]
    VolumeNotFound(String),

    /// The node is not in the state required by the request.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// A mount operation failed.
    #[error("mount failed at {path}: {reason}")]
    MountFailed {
        /// Filesystem path where the mount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An unmount operation failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed {
        /// Filesystem path where the unmount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// A stage or unstage hook could not be called or answered non-2xx.
    #[error("hook {url} failed: {reason}")]
    Hook {
        /// The hook endpoint.
        url: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// The durable state file could not be read or written.
    #[error("state file error: {0}")]
    State(String),

    /// A QUIC / transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    /// Create a [`CsiError::TransportError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::TransportError(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Create a [`CsiError::State`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn state<E: std::fmt::Display>(e: E) -> Self {
        Self::State(e.to_string())
    }

    /// Shorthand for [`CsiError::InvalidArgument`].
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// The status class reported to the caller.
    ///
    /// Conflicts are surfaced as invalid arguments, matching what CSI
    /// sidecars expect from a node plugin that rejects a second staging path.
    pub fn code(&self) -> StatusCode {
        match self {
            Self::InvalidArgument(_) | Self::Conflict(_) => StatusCode::InvalidArgument,
            Self::VolumeNotFound(_) => StatusCode::NotFound,
            Self::FailedPrecondition(_) => StatusCode::FailedPrecondition,
            Self::MountFailed { .. }
            | Self::UnmountFailed { .. }
            | Self::Hook { .. }
            | Self::State(_)
            | Self::Internal(_) => StatusCode::Internal,
            Self::TransportError(_) => StatusCode::Unavailable,
        }
    }
}

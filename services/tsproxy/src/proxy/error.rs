//! Error types for the proxy core.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use super::mapping::OwnerKey;

/// Errors that reject a whole `apply` call.
///
/// Both variants are raised before any listener is touched, so a failed
/// apply leaves every group exactly as it was.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// A mapping is malformed (port out of range, empty service name,
    /// duplicate exposed port).
    #[error("validation_failed: {owner}: {reason}")]
    Validation { owner: OwnerKey, reason: String },

    /// An exposed port is held by a different owner.
    #[error("port_conflict: exposed port {port} is already in use by {owner}")]
    PortConflict { port: u16, owner: OwnerKey },
}

impl ApplyError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ApplyError::Validation { .. } => "validation_failed",
            ApplyError::PortConflict { .. } => "port_conflict",
        }
    }
}

/// Errors local to a single listener.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The listening socket could not be bound.
    #[error("bind_failed: {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

impl ListenerError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ListenerError::Bind { .. } => "bind_failed",
        }
    }
}

/// An owner key string that is not `namespace/name`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("owner key must be 'namespace/name', got '{0}'")]
pub struct OwnerKeyError(pub String);

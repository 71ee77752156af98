/// Unified error handling for clusterguard
///
/// This module provides the error types shared by the topology, monitoring
/// and failover components, plus the SQLSTATE-carrying error surfaced by the
/// wire-protocol client.

use std::fmt;
use thiserror::Error;

pub use crate::config::ConfigError;

/// SQLSTATE reported when failover could not re-establish a connection
pub const SQLSTATE_CONNECTION_LOST: &str = "08S01";
/// SQLSTATE reported when failover succeeded and the connection changed
pub const SQLSTATE_CONNECTION_CHANGED: &str = "08S02";
/// SQLSTATE reported when failover succeeded but a transaction was open
pub const SQLSTATE_TRANSACTION_RESOLUTION_UNKNOWN: &str = "08007";
/// SQLSTATE used when no connection could be opened at all
pub const SQLSTATE_UNABLE_TO_CONNECT: &str = "08001";

/// Main error type for clusterguard operations
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Errors reported by the wire-protocol client
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    /// Programming errors such as an empty node-key set
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Outcome of a failover attempt that the caller must see as an error
    #[error("Failover [{sqlstate}]: {message}")]
    Failover { sqlstate: String, message: String },

    /// Custom endpoint lookup errors
    #[error("Custom endpoint error: {message}")]
    CustomEndpoint { message: String },

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },
}

/// Error raised by a `ConnectionProxy`, carrying the server SQLSTATE
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[{sqlstate}] {message}")]
pub struct DriverError {
    pub sqlstate: String,
    pub message: String,
}

impl DriverError {
    pub fn new<S: Into<String>, M: Into<String>>(sqlstate: S, message: M) -> Self {
        Self {
            sqlstate: sqlstate.into(),
            message: message.into(),
        }
    }

    /// Communication link failure
    pub fn connection_lost<M: Into<String>>(message: M) -> Self {
        Self::new(SQLSTATE_CONNECTION_LOST, message)
    }

    /// SQLSTATE class "08" is the only class that triggers failover
    pub fn is_connection_exception(&self) -> bool {
        is_connection_exception(&self.sqlstate)
    }
}

/// Check whether a SQLSTATE belongs to the connection exception class
pub fn is_connection_exception(sqlstate: &str) -> bool {
    sqlstate.starts_with("08")
}

/// Result type alias for clusterguard operations
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Result type alias for wire-protocol client calls
pub type DriverResult<T> = Result<T, DriverError>;

/// Convenience methods for creating specific error types
impl ClusterError {
    /// Create an invalid argument error
    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        ClusterError::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a configuration validation error
    pub fn config<S: Into<String>>(message: S) -> Self {
        ClusterError::Config(ConfigError::ValidationError(message.into()))
    }

    /// Create a failover error
    pub fn failover<S: Into<String>, M: Into<String>>(sqlstate: S, message: M) -> Self {
        ClusterError::Failover {
            sqlstate: sqlstate.into(),
            message: message.into(),
        }
    }

    /// Create a custom endpoint error
    pub fn custom_endpoint<S: Into<String>>(message: S) -> Self {
        ClusterError::CustomEndpoint {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        ClusterError::Timeout {
            operation: operation.into(),
        }
    }

    /// SQLSTATE carried by this error, if any
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            ClusterError::Driver(e) => Some(&e.sqlstate),
            ClusterError::Failover { sqlstate, .. } => Some(sqlstate),
            _ => None,
        }
    }

    /// Check if this error is recoverable (can retry)
    pub fn is_recoverable(&self) -> bool {
        match self {
            ClusterError::Driver(e) => e.is_connection_exception(),
            ClusterError::Failover { sqlstate, .. } => sqlstate == SQLSTATE_CONNECTION_CHANGED,
            ClusterError::CustomEndpoint { .. } => true,
            ClusterError::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ClusterError::Config(_) => ErrorSeverity::Critical,
            ClusterError::InvalidArgument { .. } => ErrorSeverity::Critical,
            ClusterError::Failover { sqlstate, .. } if sqlstate == SQLSTATE_CONNECTION_CHANGED => {
                ErrorSeverity::Info
            }
            ClusterError::Driver(_) => ErrorSeverity::Warning,
            ClusterError::CustomEndpoint { .. } => ErrorSeverity::Warning,
            ClusterError::Timeout { .. } => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}

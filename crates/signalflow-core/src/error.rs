// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for signalflow-core.
//!
//! Every fallible engine and store operation returns [`SyncError`]. Errors raised on
//! background tasks (listeners, checkpoint timers) are handed to the engine's
//! [`FailureHook`](crate::engine::FailureHook) instead of a caller.

use std::fmt;

/// Result type using SyncError
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors produced by the synchronization engine and its stores.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum SyncError {
    /// No node with this id is declared in the graph.
    NodeNotFound {
        /// The node id that was not found.
        node_id: String,
    },

    /// A node with this id (or relation) is already active.
    DuplicateNode {
        /// The node id that already exists.
        node_id: String,
    },

    /// The node has no upstream bound under the given role.
    UnknownUpstream {
        /// The node whose upstream was addressed.
        node_id: String,
        /// The role name that is not bound.
        role: String,
    },

    /// The node has no column with this name.
    UnknownColumn {
        /// The node id.
        node_id: String,
        /// The column that was addressed.
        column: String,
    },

    /// A different switch-over is still draining on this node.
    SwitchInProgress {
        /// The node id.
        node_id: String,
        /// The upstream the pending switch is moving to.
        pending: String,
    },

    /// Connecting the upstream would create a cycle.
    CycleDetected {
        /// The downstream node.
        node_id: String,
        /// The upstream that would close the cycle.
        upstream: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Publishing or subscribing on the notification channel failed.
    TransportError {
        /// The topic involved.
        topic: String,
        /// Error details.
        details: String,
    },
}

impl SyncError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NodeNotFound { .. } => "NODE_NOT_FOUND",
            Self::DuplicateNode { .. } => "DUPLICATE_NODE",
            Self::UnknownUpstream { .. } => "UNKNOWN_UPSTREAM",
            Self::UnknownColumn { .. } => "UNKNOWN_COLUMN",
            Self::SwitchInProgress { .. } => "SWITCH_IN_PROGRESS",
            Self::CycleDetected { .. } => "CYCLE_DETECTED",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
            Self::TransportError { .. } => "TRANSPORT_ERROR",
        }
    }

    /// Whether the error comes from the store or the notification channel.
    ///
    /// Transient errors are abandoned for the current tick; the next notification or
    /// timer tick acts as the retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::DatabaseError { .. } | Self::TransportError { .. }
        )
    }

    pub(crate) fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }

    pub(crate) fn database(operation: impl Into<String>, details: impl fmt::Display) -> Self {
        Self::DatabaseError {
            operation: operation.into(),
            details: details.to_string(),
        }
    }

    pub(crate) fn transport(topic: impl Into<String>, details: impl fmt::Display) -> Self {
        Self::TransportError {
            topic: topic.into(),
            details: details.to_string(),
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeNotFound { node_id } => {
                write!(f, "Node '{}' not found", node_id)
            }
            Self::DuplicateNode { node_id } => {
                write!(f, "Node '{}' is already active", node_id)
            }
            Self::UnknownUpstream { node_id, role } => {
                write!(f, "Node '{}' has no upstream bound as '{}'", node_id, role)
            }
            Self::UnknownColumn { node_id, column } => {
                write!(f, "Node '{}' has no column '{}'", node_id, column)
            }
            Self::SwitchInProgress { node_id, pending } => {
                write!(
                    f,
                    "Node '{}' is still switching to upstream '{}'",
                    node_id, pending
                )
            }
            Self::CycleDetected { node_id, upstream } => {
                write!(
                    f,
                    "Binding '{}' as upstream of '{}' would create a cycle",
                    upstream, node_id
                )
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error on '{}': {}", field, message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
            Self::TransportError { topic, details } => {
                write!(f, "Notification error on '{}': {}", topic, details)
            }
        }
    }
}

impl std::error::Error for SyncError {}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        Self::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for SyncError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::DatabaseError {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::DatabaseError {
            operation: "serialization".to_string(),
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = SyncError::NodeNotFound {
            node_id: "temp".to_string(),
        };
        assert_eq!(err.error_code(), "NODE_NOT_FOUND");

        let err = SyncError::SwitchInProgress {
            node_id: "avg".to_string(),
            pending: "sensor_b".to_string(),
        };
        assert_eq!(err.error_code(), "SWITCH_IN_PROGRESS");
        assert!(!err.is_transient());
    }

    #[test]
    fn test_display_messages() {
        let err = SyncError::UnknownUpstream {
            node_id: "avg".to_string(),
            role: "left".to_string(),
        };
        assert_eq!(err.to_string(), "Node 'avg' has no upstream bound as 'left'");

        let err = SyncError::CycleDetected {
            node_id: "a".to_string(),
            upstream: "c".to_string(),
        };
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_database_errors_are_transient() {
        let err = SyncError::database("insert_row", "connection reset");
        assert!(err.is_transient());
        assert_eq!(err.error_code(), "DATABASE_ERROR");
        assert!(err.to_string().contains("insert_row"));

        let err = SyncError::transport("a_channel", "closed");
        assert!(err.is_transient());
    }

    #[test]
    fn test_from_serde_error() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{oops");
        let err: SyncError = parse.unwrap_err().into();
        assert!(matches!(
            err,
            SyncError::DatabaseError { ref operation, .. } if operation == "serialization"
        ));
    }
}

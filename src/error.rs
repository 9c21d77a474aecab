//! Device-plugin error types.
//!
//! All errors in the `libsriovdp` crate are represented by the [`DpError`]
//! enum, which derives [`thiserror::Error`] for ergonomic error handling and
//! also implements [`Serialize`]/[`Deserialize`] so errors can travel across
//! the socket transport layer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for device-plugin operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone)]
pub enum DpError {
    /// Host device enumeration failed outright (unreadable device tree).
    /// Fatal to the owning pool's `Init`.
    #[error("discovery error: {0}")]
    Discovery(String),

    /// An allocation request named a device that cannot be handed out,
    /// either because it is not in the pool's inventory or because it is
    /// currently unhealthy.
    #[error("device {id} unusable: {reason}")]
    DeviceUnusable {
        /// PCI address of the offending device.
        id: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// The legacy claim path was asked about a pod with no allocation record.
    #[error("no device allocation found for pod {0}")]
    UnknownPod(String),

    /// The legacy claim path ran out of unclaimed (or claimed) entries.
    #[error("claim error for pod {pod_uid}: {reason}")]
    ClaimExhausted {
        /// Pod whose entries were exhausted.
        pod_uid: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// Reading or writing the allocation checkpoint failed.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// A socket / transport-level error.
    #[error("transport error: {0}")]
    Transport(String),

    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DpError {
    /// Create a [`DpError::Discovery`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn discovery<E: std::fmt::Display>(e: E) -> Self {
        Self::Discovery(e.to_string())
    }

    /// Create a [`DpError::Transport`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::Transport(e.to_string())
    }

    /// Create a [`DpError::Checkpoint`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn checkpoint<E: std::fmt::Display>(e: E) -> Self {
        Self::Checkpoint(e.to_string())
    }

    /// Create a [`DpError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Create a [`DpError::DeviceUnusable`] for a device missing from the
    /// pool inventory.
    pub fn unknown_device(id: impl Into<String>) -> Self {
        Self::DeviceUnusable {
            id: id.into(),
            reason: "not present in pool inventory".to_owned(),
        }
    }

    /// Create a [`DpError::DeviceUnusable`] for an unhealthy device.
    pub fn unhealthy_device(id: impl Into<String>) -> Self {
        Self::DeviceUnusable {
            id: id.into(),
            reason: "device is unhealthy".to_owned(),
        }
    }
}

//! Error types for NPU host operations

use thiserror::Error;

/// Result type alias for NPU host operations
pub type Result<T> = std::result::Result<T, NpuError>;

/// Failures of the IPC transport itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IpcError {
    /// The ring has no room for the framed message
    #[error("IPC queue full")]
    QueueFull,

    /// The coprocessor link is down
    #[error("IPC link to subsystem is down")]
    SubsystemNotReady,

    /// The message can never fit in a ring of this size
    #[error("IPC message of {words} words exceeds queue capacity")]
    MessageTooLarge {
        /// Payload length in words
        words: usize,
    },
}

/// Errors that can occur during NPU host operations
#[derive(Debug, Error)]
pub enum NpuError {
    /// All network slots are occupied
    #[error("Network table full ({capacity} networks loaded)")]
    TableFull {
        /// Table capacity
        capacity: usize,
    },

    /// No live network with this id
    #[error("Network {id} not found")]
    NetworkNotFound {
        /// Requested network id
        id: u64,
    },

    /// Network is mid-load or mid-unload
    #[error("Network {id} is busy")]
    NetworkBusy {
        /// Requested network id
        id: u64,
    },

    /// A previous unload of this network timed out
    #[error("Network {id} is stale after an unload timeout")]
    NetworkStale {
        /// Requested network id
        id: u64,
    },

    /// An entry with this id is already live
    #[error("Network {id} already present in table")]
    DuplicateNetwork {
        /// Conflicting id
        id: u64,
    },

    /// Command could not be written to the IPC channel
    #[error("IPC send failed: {source}")]
    IpcSendFailed {
        /// Transport failure
        #[source]
        source: IpcError,
    },

    /// Host context is not ready (not initialized, deinitializing, or link down)
    #[error("NPU subsystem not ready")]
    SubsystemNotReady,

    /// Firmware rejected a load command
    #[error("Firmware rejected load (code {code:#x})")]
    LoadRejected {
        /// Firmware status code
        code: u32,
    },

    /// Firmware rejected an exec command
    #[error("Firmware rejected exec (code {code:#x})")]
    ExecRejected {
        /// Firmware status code
        code: u32,
    },

    /// Firmware rejected an unload command
    #[error("Firmware rejected unload (code {code:#x})")]
    UnloadRejected {
        /// Firmware status code
        code: u32,
    },

    /// No load response within the deadline
    #[error("Load timeout after {duration_ms}ms")]
    LoadTimeout {
        /// Timeout in milliseconds
        duration_ms: u64,
    },

    /// No exec response within the deadline
    #[error("Exec timeout after {duration_ms}ms")]
    ExecTimeout {
        /// Timeout in milliseconds
        duration_ms: u64,
    },

    /// No unload response within the deadline
    #[error("Unload timeout after {duration_ms}ms")]
    UnloadTimeout {
        /// Timeout in milliseconds
        duration_ms: u64,
    },

    /// Buffer handle or memory range is not usable
    #[error("Invalid buffer: {reason}")]
    InvalidBuffer {
        /// Reason for rejection
        reason: String,
    },

    /// Buffer is referenced by a loaded network
    #[error("Buffer {handle} still referenced by a loaded network")]
    BufferInUse {
        /// Buffer handle
        handle: i32,
    },

    /// Operation not allowed in the current lifecycle state
    #[error("Host in invalid state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },

    /// Malformed IPC packet
    #[error("Protocol error: {reason}")]
    Protocol {
        /// Reason for failure
        reason: String,
    },

    /// Firmware bring-up or shutdown failed
    #[error("Firmware error: {reason}")]
    Firmware {
        /// Reason for failure
        reason: String,
    },

    /// Power controller refused to enable the rail
    #[error("Power error: {reason}")]
    Power {
        /// Reason for failure
        reason: String,
    },
}

impl NpuError {
    /// Create an invalid buffer error
    pub fn invalid_buffer(reason: impl Into<String>) -> Self {
        Self::InvalidBuffer {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    /// Create a firmware error
    pub fn firmware(reason: impl Into<String>) -> Self {
        Self::Firmware {
            reason: reason.into(),
        }
    }

    /// Create a power error
    pub fn power(reason: impl Into<String>) -> Self {
        Self::Power {
            reason: reason.into(),
        }
    }

    /// Whether this error is one of the three wait timeouts
    pub const fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::LoadTimeout { .. } | Self::ExecTimeout { .. } | Self::UnloadTimeout { .. }
        )
    }
}

impl From<IpcError> for NpuError {
    fn from(source: IpcError) -> Self {
        match source {
            IpcError::SubsystemNotReady => Self::SubsystemNotReady,
            other => Self::IpcSendFailed { source: other },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_down_maps_to_not_ready() {
        let err: NpuError = IpcError::SubsystemNotReady.into();
        assert!(matches!(err, NpuError::SubsystemNotReady));

        let err: NpuError = IpcError::QueueFull.into();
        assert!(matches!(
            err,
            NpuError::IpcSendFailed {
                source: IpcError::QueueFull
            }
        ));
    }

    #[test]
    fn test_timeout_classification() {
        assert!(NpuError::ExecTimeout { duration_ms: 1 }.is_timeout());
        assert!(!NpuError::TableFull { capacity: 32 }.is_timeout());
    }
}

//! Error types for accelerator runtime operations

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, DlaError>;

/// Errors that can occur while driving the accelerator
#[derive(Debug, Error)]
pub enum DlaError {
    /// Device node or sysfs entry not found
    #[error("Device not found: {path}")]
    DeviceNotFound {
        /// Path that was checked
        path: PathBuf,
    },

    /// Interrupt-mask probing found no accelerator instance
    #[error("No accelerator instances found (interrupt mask readback failed on every instance)")]
    NoInstancesFound,

    /// Instance index out of range
    #[error("Instance {instance} out of range (have {count} instances)")]
    InvalidInstance {
        /// Requested instance
        instance: usize,
        /// Number of discovered instances
        count: usize,
    },

    /// License flag register holds an unknown code
    #[error("Unrecognized license flag {value:#x}")]
    UnrecognizedLicense {
        /// Raw register value
        value: u32,
    },

    /// Graph was compiled for a different architecture
    #[error(
        "Architecture mismatch: graph built for {expected_name} (hash {expected_hash}), \
         hardware is {found_name} (hash {found_hash}); set DLA_DISABLE_ARCH_CHECK=1 to override"
    )]
    ArchitectureMismatch {
        /// Hash the graph expects, as hex words
        expected_hash: String,
        /// Hash read from the identity ROM, as hex words
        found_hash: String,
        /// Architecture name the graph expects
        expected_name: String,
        /// Architecture name read from the identity ROM
        found_name: String,
    },

    /// Graph was compiled by a different IP build
    #[error(
        "Build version mismatch: graph built for {expected}, hardware is {found}; \
         set DLA_DISABLE_VERSION_CHECK=1 to override"
    )]
    BuildVersionMismatch {
        /// Version the graph expects
        expected: String,
        /// Version read from the identity ROM
        found: String,
    },

    /// External-memory placement failed
    #[error("Allocation failed: {reason}")]
    AllocationFailed {
        /// Reason for failure
        reason: String,
    },

    /// A buffer size is not a whole number of hardware words
    #[error("{what} size {size} is not a multiple of the {word}-byte hardware word")]
    MisalignedBuffer {
        /// Which buffer
        what: &'static str,
        /// Size in bytes
        size: u64,
        /// Required word size in bytes
        word: u64,
    },

    /// Caller buffer shorter than the transfer
    #[error("{what} buffer too small: need {needed} bytes, got {actual}")]
    BufferTooSmall {
        /// Which buffer
        what: &'static str,
        /// Bytes required
        needed: usize,
        /// Bytes supplied
        actual: usize,
    },

    /// Register or memory access outside what the hardware exposes
    #[error("Invalid access: {reason}")]
    InvalidAccess {
        /// Reason for failure
        reason: String,
    },

    /// I/O error during device communication
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Data transfer failed
    #[error("Transfer failed: {reason}")]
    TransferFailed {
        /// Reason for failure
        reason: String,
    },

    /// Completion wait expired
    #[error(
        "Inference on instance {instance} did not complete within {timeout_ms}ms \
         ({mode} wait): jobs finished {jobs_finished}, jobs waited {jobs_waited}"
    )]
    Timeout {
        /// Completion mode in effect
        mode: crate::CompletionMode,
        /// Instance waited on
        instance: usize,
        /// Jobs the hardware reported finished
        jobs_finished: u64,
        /// Jobs the host had already waited on
        jobs_waited: u64,
        /// Configured timeout in milliseconds
        timeout_ms: u64,
    },

    /// Hardware stopped because the licensed inference budget ran out
    #[error(
        "Instance {instance} exited with a license error: out of licensed inferences \
         (jobs finished {jobs_finished}, jobs waited {jobs_waited}); renew the IP license"
    )]
    OutOfLicensedInferences {
        /// Instance waited on
        instance: usize,
        /// Jobs the hardware reported finished
        jobs_finished: u64,
        /// Jobs the host had already waited on
        jobs_waited: u64,
    },

    /// Debug network walk found an inconsistent register list
    #[error("Debug network: {reason}")]
    DebugNetwork {
        /// Reason for failure
        reason: String,
    },

    /// Transport cannot deliver interrupts
    #[error("Transport does not support interrupts")]
    InterruptsUnsupported,

    /// Stream-controller mailbox failure
    #[error("Stream controller: {reason}")]
    StreamController {
        /// Reason for failure
        reason: String,
    },

    /// Object is in an invalid state
    #[error("Invalid state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },
}

impl DlaError {
    /// Create a device not found error
    pub fn device_not_found(path: impl Into<PathBuf>) -> Self {
        Self::DeviceNotFound { path: path.into() }
    }

    /// Create an allocation failed error
    pub fn allocation_failed(reason: impl Into<String>) -> Self {
        Self::AllocationFailed {
            reason: reason.into(),
        }
    }

    /// Create an invalid access error
    pub fn invalid_access(reason: impl Into<String>) -> Self {
        Self::InvalidAccess {
            reason: reason.into(),
        }
    }

    /// Create a transfer failed error
    pub fn transfer_failed(reason: impl Into<String>) -> Self {
        Self::TransferFailed {
            reason: reason.into(),
        }
    }

    /// Create a debug network error
    pub fn debug_network(reason: impl Into<String>) -> Self {
        Self::DebugNetwork {
            reason: reason.into(),
        }
    }

    /// Create a stream controller error
    pub fn stream_controller(reason: impl Into<String>) -> Self {
        Self::StreamController {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }

    /// Whether this error is one of the identity-ROM mismatches
    pub fn is_identity_mismatch(&self) -> bool {
        matches!(
            self,
            Self::ArchitectureMismatch { .. } | Self::BuildVersionMismatch { .. }
        )
    }
}

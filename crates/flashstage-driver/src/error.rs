//! Error types for flash staging and inference operations

use flashstage_chip::layout;
use std::fmt;
use thiserror::Error;

/// Result type alias for staging operations
pub type Result<T> = std::result::Result<T, StageError>;

/// Errors that can occur while staging assets or driving the engine
#[derive(Debug, Error)]
pub enum StageError {
    /// The controller never left the busy state within the poll budget
    #[error("Bus timeout after {polls} polls waiting for {waiting_for}")]
    BusTimeout {
        /// Condition that was being waited for
        waiting_for: String,
        /// Number of status polls spent
        polls: u32,
    },

    /// Decoded header length is zero or exceeds the destination capacity
    #[error("Invalid header at {offset:#010x}: length {length} (capacity {capacity})")]
    InvalidHeader {
        /// Flash offset of the header, or of the blob when staging
        offset: u32,
        /// Decoded length
        length: u32,
        /// Capacity of the destination buffer or region
        capacity: usize,
    },

    /// The inference engine rejected the model
    #[error("Engine init failed: {reason}")]
    EngineInitFailed {
        /// Reason reported by the engine
        reason: String,
    },

    /// The inference engine failed during invoke
    #[error("Invoke failed: {reason}")]
    InvokeFailed {
        /// Reason reported by the engine
        reason: String,
    },

    /// The engine returned no buffer for the requested index
    #[error("Engine returned no {direction} buffer for index {index}")]
    NullBuffer {
        /// `input` or `output`
        direction: &'static str,
        /// Requested tensor index
        index: usize,
    },

    /// A destination buffer or tensor is smaller than the data it must hold
    #[error("Size mismatch: need {needed} bytes/elements, have {available}")]
    SizeMismatch {
        /// Required size
        needed: usize,
        /// Available size
        available: usize,
    },

    /// Address range falls outside the configured flash size
    #[error("Address range {address:#010x}+{length} outside flash of {limit} bytes")]
    AddressOutOfRange {
        /// Start address
        address: u32,
        /// Transfer length
        length: usize,
        /// Addressable bytes
        limit: u64,
    },

    /// The controller raised its transfer-error flag
    #[error("Transfer error: {reason}")]
    TransferError {
        /// Failing transfer description
        reason: String,
    },

    /// A memory-mapped view was used after the controller left that mapping
    #[error("Stale mapping: view from epoch {view_epoch}, controller at epoch {current_epoch}")]
    StaleMapping {
        /// Epoch the view was created in
        view_epoch: u64,
        /// Current controller epoch
        current_epoch: u64,
    },

    /// Operation not valid in the current controller or driver state
    #[error("Invalid state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },

    /// I/O error on the transport, an image file or a device node
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

/// Fieldless error classification, reported over the transport on failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`StageError::BusTimeout`]
    BusTimeout,
    /// See [`StageError::InvalidHeader`]
    InvalidHeader,
    /// See [`StageError::EngineInitFailed`]
    EngineInitFailed,
    /// See [`StageError::InvokeFailed`]
    InvokeFailed,
    /// See [`StageError::NullBuffer`]
    NullBuffer,
    /// See [`StageError::SizeMismatch`]
    SizeMismatch,
    /// See [`StageError::AddressOutOfRange`]
    AddressOutOfRange,
    /// See [`StageError::TransferError`]
    TransferError,
    /// See [`StageError::StaleMapping`]
    StaleMapping,
    /// See [`StageError::InvalidState`]
    InvalidState,
    /// See [`StageError::Io`]
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BusTimeout => "BusTimeout",
            Self::InvalidHeader => "InvalidHeader",
            Self::EngineInitFailed => "EngineInitFailed",
            Self::InvokeFailed => "InvokeFailed",
            Self::NullBuffer => "NullBuffer",
            Self::SizeMismatch => "SizeMismatch",
            Self::AddressOutOfRange => "AddressOutOfRange",
            Self::TransferError => "TransferError",
            Self::StaleMapping => "StaleMapping",
            Self::InvalidState => "InvalidState",
            Self::Io => "Io",
        };
        f.write_str(name)
    }
}

impl StageError {
    /// Classify this error
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::BusTimeout { .. } => ErrorKind::BusTimeout,
            Self::InvalidHeader { .. } => ErrorKind::InvalidHeader,
            Self::EngineInitFailed { .. } => ErrorKind::EngineInitFailed,
            Self::InvokeFailed { .. } => ErrorKind::InvokeFailed,
            Self::NullBuffer { .. } => ErrorKind::NullBuffer,
            Self::SizeMismatch { .. } => ErrorKind::SizeMismatch,
            Self::AddressOutOfRange { .. } => ErrorKind::AddressOutOfRange,
            Self::TransferError { .. } => ErrorKind::TransferError,
            Self::StaleMapping { .. } => ErrorKind::StaleMapping,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::Io { .. } => ErrorKind::Io,
        }
    }

    /// Create a bus timeout error
    pub fn bus_timeout(waiting_for: impl Into<String>, polls: u32) -> Self {
        Self::BusTimeout {
            waiting_for: waiting_for.into(),
            polls,
        }
    }

    /// Create an engine init failed error
    pub fn engine_init_failed(reason: impl Into<String>) -> Self {
        Self::EngineInitFailed {
            reason: reason.into(),
        }
    }

    /// Create an invoke failed error
    pub fn invoke_failed(reason: impl Into<String>) -> Self {
        Self::InvokeFailed {
            reason: reason.into(),
        }
    }

    /// Create a transfer error
    pub fn transfer_error(reason: impl Into<String>) -> Self {
        Self::TransferError {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }

    /// Create a size mismatch error
    pub const fn size_mismatch(needed: usize, available: usize) -> Self {
        Self::SizeMismatch { needed, available }
    }

    /// Header at `offset` leaves no room for a blob below 4 GiB
    pub(crate) const fn header_past_address_space(offset: u32) -> Self {
        Self::AddressOutOfRange {
            address: offset,
            length: layout::HEADER_LEN,
            limit: 1 << 32,
        }
    }
}

//! Protocol errors

use thiserror::Error;

/// Errors that can occur while talking to the radio coordinator
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The link to the coordinator could not be opened or broke
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// A write did not complete in time
    #[error("Operation timed out")]
    Timeout,

    /// The OS refused access to the device
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Interrupted through the cancellation token
    #[error("Operation cancelled")]
    Cancelled,

    /// Bytes that do not form a usable frame
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Text that is not a 16 digit hex address
    #[error("Invalid address '{0}': expected 16 hex digits")]
    InvalidAddress(String),

    /// Trailing checksum byte does not match the frame contents
    #[error("Checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch {
        /// Checksum computed over the frame
        expected: u8,
        /// Checksum byte that arrived
        actual: u8,
    },

    /// Baud rate requested before the UART was enabled
    #[error("Bridge UART is not enabled")]
    BridgeNotReady,

    /// Baud rate with no 16-bit divisor
    #[error("Invalid baud rate: {0}")]
    InvalidBaudRate(u32),

    /// Frame data does not fit the 16-bit length field
    #[error("Frame too large: {0} data bytes")]
    FrameTooLarge(usize),

    /// Control request the transport cannot carry out
    #[error("Unsupported control request {request:#04x} (value {value:#06x})")]
    UnsupportedRequest {
        /// bRequest
        request: u8,
        /// wValue
        value: u16,
    },

    /// Config file could not be read, parsed or validated
    #[error("Configuration error: {0}")]
    Config(String),

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ProtocolError {
    /// True for failures that mean the transport itself is gone or unusable
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            ProtocolError::TransportUnavailable(_)
                | ProtocolError::PermissionDenied(_)
                | ProtocolError::IoError(_)
        )
    }
}

//! Transport abstraction
//!
//! The protocol layer only needs three things from the link to the
//! coordinator: vendor control requests for the bridge, and blocking bulk
//! reads and writes. Which concrete link is used is decided once when the
//! session is built.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{ProtocolError, SerialBridge, UsbBridge};
use crate::config::{SessionConfig, TransportSelection};

/// A vendor control request addressed to the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// Data stage, empty for the bridge setup requests
    pub data: Vec<u8>,
}

/// Link to the radio coordinator
///
/// Implementations are single-owner handles. Reads that see no data before
/// the timeout return `Ok(0)`; errors are reserved for a broken link.
pub trait Transport: Send {
    /// Deliver a control request to the bridge
    fn configure(&mut self, request: &ControlRequest, timeout: Duration)
        -> Result<(), ProtocolError>;

    /// Write bytes, returning how many were accepted
    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<usize, ProtocolError>;

    /// Read up to `buf.len()` bytes
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ProtocolError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn configure(
        &mut self,
        request: &ControlRequest,
        timeout: Duration,
    ) -> Result<(), ProtocolError> {
        (**self).configure(request, timeout)
    }

    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<usize, ProtocolError> {
        (**self).write(data, timeout)
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ProtocolError> {
        (**self).read(buf, timeout)
    }
}

/// Open the transport selected by the configuration
///
/// `cancel` aborts the wait for USB access; it is unused for serial ports.
pub fn open_transport(
    config: &SessionConfig,
    cancel: &CancellationToken,
) -> Result<Box<dyn Transport>, ProtocolError> {
    match &config.transport {
        TransportSelection::Usb(options) => {
            let bridge = UsbBridge::open(options, &config.access_wait, cancel)?;
            Ok(Box::new(bridge))
        }
        TransportSelection::Serial { port } => {
            let bridge = SerialBridge::open(port, config.baud_rate)?;
            Ok(Box::new(bridge))
        }
    }
}

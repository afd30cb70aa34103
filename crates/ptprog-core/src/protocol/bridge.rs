//! CP210x bridge line configuration
//!
//! Before the coordinator can be reached the USB-to-serial bridge must be
//! switched into UART mode and given a baud rate divisor. Both are vendor
//! control requests with no data stage, and the order matters: the divisor
//! is only honoured once the UART is enabled.

use std::time::Duration;

use tracing::{debug, info};

use super::{ControlRequest, ProtocolError, Transport};

/// bmRequestType for vendor requests to the interface, host to device
pub const REQTYPE_HOST_TO_INTERFACE: u8 = 0x41;

/// Enable/disable the UART
pub const CP210X_IFC_ENABLE: u8 = 0x00;

/// Set the baud rate divisor
pub const CP210X_SET_BAUDDIV: u8 = 0x01;

/// IFC_ENABLE value that turns the UART on
pub const UART_ENABLE: u16 = 0x0001;
/// IFC_ENABLE value that turns the UART off
pub const UART_DISABLE: u16 = 0x0000;

/// Baud rate generator clock
pub const BAUD_RATE_GEN_FREQ: u32 = 0x384000;

/// Line speed the coordinator radios ship with
pub const DEFAULT_BAUD_RATE: u32 = 38400;

/// Timeout for each control request
pub const DEFAULT_CONTROL_TIMEOUT_MS: u64 = 5000;

/// Divisor programmed for `baud`: `BAUD_RATE_GEN_FREQ / baud`, truncated
pub fn baud_divisor(baud: u32) -> Result<u16, ProtocolError> {
    if baud == 0 {
        return Err(ProtocolError::InvalidBaudRate(baud));
    }
    match BAUD_RATE_GEN_FREQ / baud {
        0 => Err(ProtocolError::InvalidBaudRate(baud)),
        d => u16::try_from(d).map_err(|_| ProtocolError::InvalidBaudRate(baud)),
    }
}

/// Where the bridge is in its setup sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Nothing sent yet
    Disabled,
    /// UART enabled, line speed untouched
    UartEnabled,
    /// UART enabled and divisor programmed
    Configured {
        /// Requested line speed
        baud_rate: u32,
        /// Divisor sent for it
        divisor: u16,
    },
}

/// Issues the bridge setup requests in order
#[derive(Debug, Clone)]
pub struct BridgeConfigurator {
    state: BridgeState,
    timeout: Duration,
}

impl BridgeConfigurator {
    /// Create a configurator; `timeout` bounds each request
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: BridgeState::Disabled,
            timeout,
        }
    }

    /// How far setup has got
    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// Switch the bridge into UART mode
    pub fn enable_uart<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
    ) -> Result<(), ProtocolError> {
        let request = ControlRequest {
            request_type: REQTYPE_HOST_TO_INTERFACE,
            request: CP210X_IFC_ENABLE,
            value: UART_ENABLE,
            index: 0,
            data: Vec::new(),
        };

        debug!("enable_uart: sending {:?}", request);
        transport
            .configure(&request, self.timeout)
            .map_err(|e| undeliverable("UART enable", e))?;

        self.state = BridgeState::UartEnabled;
        Ok(())
    }

    /// Program the divisor for `baud_rate`. Requires [`Self::enable_uart`] first.
    ///
    /// Returns the divisor that was sent.
    pub fn set_baud_rate<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        baud_rate: u32,
    ) -> Result<u16, ProtocolError> {
        if self.state == BridgeState::Disabled {
            return Err(ProtocolError::BridgeNotReady);
        }

        let divisor = baud_divisor(baud_rate)?;
        let request = ControlRequest {
            request_type: REQTYPE_HOST_TO_INTERFACE,
            request: CP210X_SET_BAUDDIV,
            value: divisor,
            index: 0,
            data: Vec::new(),
        };

        debug!(
            "set_baud_rate: {} baud -> divisor {} ({:#06x})",
            baud_rate, divisor, divisor
        );
        transport
            .configure(&request, self.timeout)
            .map_err(|e| undeliverable("baud divisor", e))?;

        self.state = BridgeState::Configured { baud_rate, divisor };
        info!("Bridge configured for {} baud", baud_rate);
        Ok(divisor)
    }
}

impl Default for BridgeConfigurator {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_CONTROL_TIMEOUT_MS))
    }
}

fn undeliverable(what: &str, err: ProtocolError) -> ProtocolError {
    match err {
        ProtocolError::TransportUnavailable(_) => err,
        other => ProtocolError::TransportUnavailable(format!("{what} request failed: {other}")),
    }
}

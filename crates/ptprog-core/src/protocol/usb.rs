//! CP210x bridge over raw USB
//!
//! Used where no kernel driver owns the bridge. Setup requests go out as
//! vendor control transfers on interface 0 and frames travel over the bulk
//! endpoints. nusb transfers are futures, so every transfer runs on a small
//! current-thread runtime and is bounded with a timer; dropping a timed-out
//! transfer cancels it.

use std::time::{Duration, Instant};

use nusb::transfer::{
    Control, ControlType, Direction, EndpointType, Recipient, RequestBuffer, TransferError,
};
use serde::{Deserialize, Serialize};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ControlRequest, ProtocolError, Transport};
use crate::config::AccessWait;

/// Silicon Labs vendor id
pub const CP210X_VENDOR_ID: u16 = 0x10C4;

/// CP2102/CP2104 product id
pub const CP210X_PRODUCT_ID: u16 = 0xEA60;

/// Which USB device to use
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbOptions {
    /// Vendor id to match
    pub vendor_id: u16,
    /// Product id to match
    pub product_id: u16,
    /// Pick a specific bridge when several are attached
    pub serial_number: Option<String>,
    /// Interface carrying the UART
    pub interface: u8,
}

impl Default for UsbOptions {
    fn default() -> Self {
        Self {
            vendor_id: CP210X_VENDOR_ID,
            product_id: CP210X_PRODUCT_ID,
            serial_number: None,
            interface: 0,
        }
    }
}

/// An attached bridge, as reported by enumeration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsbBridgeInfo {
    /// USB bus number
    pub bus_number: u8,
    /// Address on that bus
    pub device_address: u8,
    /// Serial number string, if the device reports one
    pub serial_number: Option<String>,
    /// Product string
    pub product: Option<String>,
}

fn matches_options(info: &nusb::DeviceInfo, options: &UsbOptions) -> bool {
    info.vendor_id() == options.vendor_id
        && info.product_id() == options.product_id
        && match &options.serial_number {
            Some(wanted) => info.serial_number() == Some(wanted.as_str()),
            None => true,
        }
}

/// List attached bridges matching `options`
pub fn list_bridges(options: &UsbOptions) -> Result<Vec<UsbBridgeInfo>, ProtocolError> {
    let devices = nusb::list_devices()
        .map_err(|e| ProtocolError::TransportUnavailable(format!("USB enumeration failed: {e}")))?;

    Ok(devices
        .filter(|d| matches_options(d, options))
        .map(|d| UsbBridgeInfo {
            bus_number: d.bus_number(),
            device_address: d.device_address(),
            serial_number: d.serial_number().map(String::from),
            product: d.product_string().map(String::from),
        })
        .collect())
}

/// Retry `attempt` while it fails with a permission error
///
/// Waits with exponential backoff between attempts, bounded by
/// `wait.timeout()`. Any other error ends the wait immediately. Cancelling
/// `cancel` interrupts a backoff sleep.
pub fn wait_for_access<T>(
    runtime: &Runtime,
    wait: &AccessWait,
    cancel: &CancellationToken,
    mut attempt: impl FnMut() -> std::io::Result<T>,
) -> Result<T, ProtocolError> {
    let deadline = Instant::now() + wait.timeout();
    let mut backoff = wait.initial_backoff();
    let mut attempts = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(ProtocolError::Cancelled);
        }

        attempts += 1;
        let denied = match attempt() {
            Ok(value) => return Ok(value),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => e,
            Err(e) => return Err(ProtocolError::TransportUnavailable(e.to_string())),
        };

        let now = Instant::now();
        if now >= deadline {
            return Err(ProtocolError::PermissionDenied(format!(
                "{} after {} attempts",
                denied, attempts
            )));
        }

        let sleep = backoff.min(deadline - now);
        debug!(
            "wait_for_access: attempt {} denied, retrying in {}ms",
            attempts,
            sleep.as_millis()
        );
        let cancelled = runtime.block_on(async {
            tokio::select! {
                _ = cancel.cancelled() => true,
                _ = tokio::time::sleep(sleep) => false,
            }
        });
        if cancelled {
            return Err(ProtocolError::Cancelled);
        }

        backoff = (backoff * 2).min(wait.max_backoff());
    }
}

/// Map a bmRequestType onto nusb's control type and recipient.
/// Only host-to-device requests are accepted.
fn decode_request_type(request_type: u8) -> Option<(ControlType, Recipient)> {
    if request_type & 0x80 != 0 {
        return None;
    }
    let control_type = match (request_type >> 5) & 0x03 {
        0 => ControlType::Standard,
        1 => ControlType::Class,
        2 => ControlType::Vendor,
        _ => return None,
    };
    let recipient = match request_type & 0x1F {
        0 => Recipient::Device,
        1 => Recipient::Interface,
        2 => Recipient::Endpoint,
        3 => Recipient::Other,
        _ => return None,
    };
    Some((control_type, recipient))
}

fn transfer_error(e: TransferError) -> ProtocolError {
    match e {
        TransferError::Disconnected => {
            ProtocolError::TransportUnavailable("device disconnected".to_string())
        }
        TransferError::Cancelled => ProtocolError::Cancelled,
        other => ProtocolError::TransportUnavailable(other.to_string()),
    }
}

/// Full-speed bulk packet size, used when the descriptor gives nothing usable
const FALLBACK_PACKET_SIZE: usize = 64;

fn packet_size_or_default(detected: Option<usize>) -> usize {
    match detected {
        Some(size) if size > 0 => size,
        _ => {
            warn!(
                "Unable to detect max packet size, assuming {}",
                FALLBACK_PACKET_SIZE
            );
            FALLBACK_PACKET_SIZE
        }
    }
}

/// CP210x bridge driven directly through USB transfers
pub struct UsbBridge {
    interface: nusb::Interface,
    ep_in: u8,
    ep_out: u8,
    max_packet_size: usize,
    /// Bytes received beyond what the last read asked for
    pending: Vec<u8>,
    runtime: Runtime,
}

impl UsbBridge {
    /// Find, open and claim the bridge described by `options`
    pub fn open(
        options: &UsbOptions,
        wait: &AccessWait,
        cancel: &CancellationToken,
    ) -> Result<Self, ProtocolError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;

        let mut devices = nusb::list_devices().map_err(|e| {
            ProtocolError::TransportUnavailable(format!("USB enumeration failed: {e}"))
        })?;
        let Some(info) = devices.find(|d| matches_options(d, options)) else {
            return Err(ProtocolError::TransportUnavailable(format!(
                "no USB device {:04x}:{:04x} attached",
                options.vendor_id, options.product_id
            )));
        };

        let device = wait_for_access(&runtime, wait, cancel, || info.open())?;
        let interface = device
            .claim_interface(options.interface)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::PermissionDenied => {
                    ProtocolError::PermissionDenied(e.to_string())
                }
                _ => ProtocolError::TransportUnavailable(format!(
                    "failed claiming interface {}: {e}",
                    options.interface
                )),
            })?;

        let mut max_packet_size: Option<usize> = None;
        let mut ep_in: Option<u8> = None;
        let mut ep_out: Option<u8> = None;
        for alt in interface.descriptors() {
            for ep in alt
                .endpoints()
                .filter(|e| e.transfer_type() == EndpointType::Bulk)
            {
                match ep.direction() {
                    Direction::Out => {
                        ep_out = Some(ep.address());
                        max_packet_size = Some(ep.max_packet_size());
                    }
                    Direction::In => ep_in = Some(ep.address()),
                }
            }
        }

        let (Some(ep_in), Some(ep_out)) = (ep_in, ep_out) else {
            return Err(ProtocolError::TransportUnavailable(
                "bridge has no bulk IN/OUT endpoint pair".to_string(),
            ));
        };
        let max_packet_size = packet_size_or_default(max_packet_size);

        info!(
            "Opened USB bridge {:04x}:{:04x} (IN {:#04x}, OUT {:#04x}, mps {})",
            options.vendor_id, options.product_id, ep_in, ep_out, max_packet_size
        );

        Ok(Self {
            interface,
            ep_in,
            ep_out,
            max_packet_size,
            pending: Vec::new(),
            runtime,
        })
    }

    fn take_pending(&mut self, buf: &mut [u8]) -> usize {
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        n
    }
}

impl Transport for UsbBridge {
    fn configure(
        &mut self,
        request: &ControlRequest,
        timeout: Duration,
    ) -> Result<(), ProtocolError> {
        let (control_type, recipient) =
            decode_request_type(request.request_type).ok_or(ProtocolError::UnsupportedRequest {
                request: request.request,
                value: request.value,
            })?;

        let control = Control {
            control_type,
            recipient,
            request: request.request,
            value: request.value,
            index: request.index,
        };
        self.interface
            .control_out_blocking(control, &request.data, timeout)
            .map_err(transfer_error)?;
        Ok(())
    }

    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<usize, ProtocolError> {
        let transfer = self.interface.bulk_out(self.ep_out, data.to_vec());
        let completion = self
            .runtime
            .block_on(async { tokio::time::timeout(timeout, transfer).await })
            .map_err(|_| ProtocolError::Timeout)?;

        let response = completion.into_result().map_err(transfer_error)?;
        Ok(response.actual_length())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ProtocolError> {
        if !self.pending.is_empty() {
            return Ok(self.take_pending(buf));
        }
        if buf.is_empty() {
            return Ok(0);
        }

        // Bulk IN requests must be a whole number of packets
        let request_len = buf.len().div_ceil(self.max_packet_size) * self.max_packet_size;
        let transfer = self
            .interface
            .bulk_in(self.ep_in, RequestBuffer::new(request_len));

        let completion = match self
            .runtime
            .block_on(async { tokio::time::timeout(timeout, transfer).await })
        {
            Ok(completion) => completion,
            Err(_) => return Ok(0),
        };

        let data = completion.into_result().map_err(transfer_error)?;
        self.pending.extend_from_slice(&data);
        Ok(self.take_pending(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io;

    fn runtime() -> Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap()
    }

    fn quick_wait() -> AccessWait {
        AccessWait {
            timeout_ms: 200,
            initial_backoff_ms: 5,
            max_backoff_ms: 20,
        }
    }

    #[test]
    fn test_decode_request_type() {
        assert!(matches!(
            decode_request_type(0x41),
            Some((ControlType::Vendor, Recipient::Interface))
        ));
        assert!(matches!(
            decode_request_type(0x40),
            Some((ControlType::Vendor, Recipient::Device))
        ));
        // Device-to-host is not a configuration request
        assert!(decode_request_type(0xC1).is_none());
        assert!(decode_request_type(0x61).is_none());
    }

    #[test]
    fn test_packet_size_falls_back_when_unusable() {
        assert_eq!(packet_size_or_default(Some(512)), 512);
        assert_eq!(packet_size_or_default(Some(0)), FALLBACK_PACKET_SIZE);
        assert_eq!(packet_size_or_default(None), FALLBACK_PACKET_SIZE);
    }

    #[test]
    fn test_wait_for_access_retries_until_granted() {
        let rt = runtime();
        let calls = Cell::new(0);
        let result = wait_for_access(&rt, &quick_wait(), &CancellationToken::new(), || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(io::Error::from(io::ErrorKind::PermissionDenied))
            } else {
                Ok("device")
            }
        });
        assert_eq!(result.unwrap(), "device");
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_wait_for_access_is_bounded() {
        let rt = runtime();
        let start = Instant::now();
        let cancel = CancellationToken::new();
        let result: Result<(), _> = wait_for_access(&rt, &quick_wait(), &cancel, || {
            Err(io::Error::from(io::ErrorKind::PermissionDenied))
        });
        assert!(matches!(result, Err(ProtocolError::PermissionDenied(_))));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_wait_for_access_other_errors_fail_fast() {
        let rt = runtime();
        let calls = Cell::new(0);
        let cancel = CancellationToken::new();
        let result: Result<(), _> = wait_for_access(&rt, &quick_wait(), &cancel, || {
            calls.set(calls.get() + 1);
            Err(io::Error::from(io::ErrorKind::NotFound))
        });
        assert!(matches!(result, Err(ProtocolError::TransportUnavailable(_))));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_wait_for_access_cancelled() {
        let rt = runtime();
        let cancel = CancellationToken::new();
        let calls = Cell::new(0);
        let result: Result<(), _> = wait_for_access(&rt, &quick_wait(), &cancel, || {
            calls.set(calls.get() + 1);
            cancel.cancel();
            Err(io::Error::from(io::ErrorKind::PermissionDenied))
        });
        assert!(matches!(result, Err(ProtocolError::Cancelled)));
        assert_eq!(calls.get(), 1);
    }
}

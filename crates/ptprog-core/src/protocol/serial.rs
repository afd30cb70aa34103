//! Serial port handling
//!
//! On hosts where the operating system already drives the CP210x, the bridge
//! shows up as a serial port. The two bridge setup requests are then
//! translated into the equivalent driver calls.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, info};

use super::bridge::{
    BAUD_RATE_GEN_FREQ, CP210X_IFC_ENABLE, CP210X_SET_BAUDDIV, DEFAULT_BAUD_RATE,
    REQTYPE_HOST_TO_INTERFACE, UART_ENABLE,
};
use super::usb::{CP210X_PRODUCT_ID, CP210X_VENDOR_ID};
use super::{ControlRequest, ProtocolError, Transport};

/// A serial port the coordinator might be attached to
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// OS device path or COM name
    pub name: String,
    /// USB vendor id, when the port sits on a USB device
    pub vid: Option<u16>,
    /// USB product id
    pub pid: Option<u16>,
    /// USB manufacturer string
    pub manufacturer: Option<String>,
    /// USB product string
    pub product: Option<String>,
    /// USB serial number
    pub serial_number: Option<String>,
}

impl PortInfo {
    fn bare(name: String) -> Self {
        Self {
            name,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        }
    }

    /// True when the port is backed by a CP210x bridge
    pub fn is_cp210x(&self) -> bool {
        self.vid == Some(CP210X_VENDOR_ID) && self.pid == Some(CP210X_PRODUCT_ID)
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let SerialPortType::UsbPort(usb) = info.port_type else {
            return Self::bare(info.port_name);
        };
        Self {
            name: info.port_name,
            vid: Some(usb.vid),
            pid: Some(usb.pid),
            manufacturer: usb.manufacturer,
            product: usb.product,
            serial_number: usb.serial_number,
        }
    }
}

/// Sort key placing bridges first:
///  - ttyUSB* ports (sorted numerically by suffix), where CP210x bridges appear
///  - then ttyACM* ports (sorted numerically)
///  - then other ports (sorted by name)
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// Device nodes that look like USB serial adapters, for hosts where
/// enumeration misses them (containers without udev)
#[cfg(target_os = "linux")]
fn dev_fallback_ports() -> Vec<String> {
    let Ok(entries) = fs::read_dir("/dev") else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.starts_with("ttyUSB") || name.starts_with("ttyACM"))
        .map(|name| format!("/dev/{name}"))
        .collect()
}

#[cfg(not(target_os = "linux"))]
fn dev_fallback_ports() -> Vec<String> {
    Vec::new()
}

/// Available serial ports, bridges first, in a stable order
pub fn list_ports() -> Vec<PortInfo> {
    let mut by_name: HashMap<String, PortInfo> = HashMap::new();
    for port in serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
        .map(PortInfo::from)
    {
        by_name.entry(port.name.clone()).or_insert(port);
    }
    for name in dev_fallback_ports() {
        by_name
            .entry(name.clone())
            .or_insert_with(|| PortInfo::bare(name));
    }

    let mut ports: Vec<PortInfo> = by_name.into_values().collect();
    ports.sort_by_key(|p| port_sort_key(&p.name));
    debug!("list_ports: {} candidate(s)", ports.len());
    ports
}

fn serial_error(e: serialport::Error) -> ProtocolError {
    match e.kind() {
        serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
            ProtocolError::PermissionDenied(e.to_string())
        }
        _ => ProtocolError::TransportUnavailable(e.to_string()),
    }
}

/// Open a serial port, 8N1 without flow control
pub fn open_port(name: &str, baud_rate: Option<u32>) -> Result<Box<dyn SerialPort>, ProtocolError> {
    let baud = baud_rate.unwrap_or(DEFAULT_BAUD_RATE);

    serialport::new(name, baud)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .timeout(Duration::from_millis(100))
        .open()
        .map_err(serial_error)
}

/// Drop anything queued in either direction
pub fn clear_buffers(port: &mut dyn SerialPort) -> Result<(), ProtocolError> {
    port.clear(serialport::ClearBuffer::All).map_err(serial_error)
}

/// Line speed the bridge runs at for a programmed divisor
fn baud_for_divisor(divisor: u16) -> u32 {
    BAUD_RATE_GEN_FREQ / u32::from(divisor)
}

/// CP210x reached through the operating system's serial driver
pub struct SerialBridge {
    port: Box<dyn SerialPort>,
    name: String,
}

impl SerialBridge {
    /// Open `name` at `baud_rate`
    pub fn open(name: &str, baud_rate: u32) -> Result<Self, ProtocolError> {
        let port = open_port(name, Some(baud_rate))?;
        info!("Opened serial bridge {} at {} baud", name, baud_rate);
        Ok(Self::from_port(port))
    }

    /// Wrap an already opened port
    pub fn from_port(port: Box<dyn SerialPort>) -> Self {
        let name = port.name().unwrap_or_default();
        Self { port, name }
    }

    /// Port the bridge was opened on
    pub fn name(&self) -> &str {
        &self.name
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), ProtocolError> {
        self.port.set_timeout(timeout).map_err(serial_error)
    }
}

impl Transport for SerialBridge {
    fn configure(
        &mut self,
        request: &ControlRequest,
        _timeout: Duration,
    ) -> Result<(), ProtocolError> {
        let unsupported = ProtocolError::UnsupportedRequest {
            request: request.request,
            value: request.value,
        };
        if request.request_type != REQTYPE_HOST_TO_INTERFACE {
            return Err(unsupported);
        }

        match request.request {
            CP210X_IFC_ENABLE => {
                // The driver enabled the UART when the port was opened
                if request.value == UART_ENABLE {
                    debug!("{}: UART enable, clearing buffers", self.name);
                    clear_buffers(self.port.as_mut())?;
                }
                Ok(())
            }
            CP210X_SET_BAUDDIV if request.value > 0 => {
                let baud = baud_for_divisor(request.value);
                debug!("{}: divisor {} -> {} baud", self.name, request.value, baud);
                self.port.set_baud_rate(baud).map_err(serial_error)
            }
            _ => Err(unsupported),
        }
    }

    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<usize, ProtocolError> {
        self.set_timeout(timeout)?;
        match self.port.write_all(data).and_then(|_| self.port.flush()) {
            Ok(()) => Ok(data.len()),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Err(ProtocolError::Timeout),
            Err(e) => Err(ProtocolError::TransportUnavailable(e.to_string())),
        }
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, ProtocolError> {
        self.set_timeout(timeout)?;
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Ok(0)
            }
            Err(e) => Err(ProtocolError::TransportUnavailable(e.to_string())),
        }
    }
}

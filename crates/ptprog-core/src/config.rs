//! Session configuration
//!
//! Stored as JSON. Every field has a default, so a config file only needs to
//! mention what it changes.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::protocol::{
    bridge::{baud_divisor, DEFAULT_BAUD_RATE, DEFAULT_CONTROL_TIMEOUT_MS},
    Escaping, ProtocolError, UsbOptions,
};

/// Default timeout for bulk reads and writes in milliseconds
pub const DEFAULT_IO_TIMEOUT_MS: u64 = 5000;

/// Default receive buffer size for one read
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Largest receive buffer accepted
pub const MAX_BUFFER_CAPACITY: usize = 64 * 1024;

/// How the coordinator is reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportSelection {
    /// Raw USB transfers to the bridge
    Usb(UsbOptions),
    /// The bridge's serial port, driven by the OS
    Serial {
        /// Device path or COM name
        port: String,
    },
}

impl Default for TransportSelection {
    fn default() -> Self {
        TransportSelection::Usb(UsbOptions::default())
    }
}

/// Bounds on waiting for permission to open the USB device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessWait {
    /// Give up after this long
    pub timeout_ms: u64,
    /// First delay between attempts
    pub initial_backoff_ms: u64,
    /// Delays double up to this value
    pub max_backoff_ms: u64,
}

impl AccessWait {
    /// Total time to keep retrying
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Delay after the first refusal
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Longest delay between attempts
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl Default for AccessWait {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
        }
    }
}

/// Everything a [`crate::protocol::Session`] needs to know
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Transport used to reach the coordinator
    pub transport: TransportSelection,

    /// Line speed programmed into the bridge
    pub baud_rate: u32,

    /// Timeout for each bridge control request in milliseconds
    pub control_timeout_ms: u64,

    /// Timeout for one read in milliseconds
    pub read_timeout_ms: u64,

    /// Timeout for one write in milliseconds
    pub write_timeout_ms: u64,

    /// Bytes requested per read
    pub buffer_capacity: usize,

    /// Escaping used by the coordinator's API mode
    pub escaping: Escaping,

    /// Drop discovery responses whose checksum does not match
    pub verify_checksums: bool,

    /// USB permission wait
    pub access_wait: AccessWait,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            transport: TransportSelection::default(),
            baud_rate: DEFAULT_BAUD_RATE,
            control_timeout_ms: DEFAULT_CONTROL_TIMEOUT_MS,
            read_timeout_ms: DEFAULT_IO_TIMEOUT_MS,
            write_timeout_ms: DEFAULT_IO_TIMEOUT_MS,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            escaping: Escaping::None,
            verify_checksums: true,
            access_wait: AccessWait::default(),
        }
    }
}

impl SessionConfig {
    /// Load and validate a JSON config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ProtocolError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProtocolError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| ProtocolError::Config(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Save as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ProtocolError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ProtocolError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Reject values the hardware cannot work with
    pub fn validate(&self) -> Result<(), ProtocolError> {
        baud_divisor(self.baud_rate)
            .map_err(|e| ProtocolError::Config(format!("baud_rate: {e}")))?;

        if self.buffer_capacity == 0 || self.buffer_capacity > MAX_BUFFER_CAPACITY {
            return Err(ProtocolError::Config(format!(
                "buffer_capacity must be between 1 and {MAX_BUFFER_CAPACITY}, got {}",
                self.buffer_capacity
            )));
        }

        for (name, value) in [
            ("control_timeout_ms", self.control_timeout_ms),
            ("read_timeout_ms", self.read_timeout_ms),
            ("write_timeout_ms", self.write_timeout_ms),
            ("access_wait.timeout_ms", self.access_wait.timeout_ms),
        ] {
            if value == 0 {
                return Err(ProtocolError::Config(format!("{name} must be non-zero")));
            }
        }

        if self.access_wait.initial_backoff_ms == 0
            || self.access_wait.initial_backoff_ms > self.access_wait.max_backoff_ms
        {
            return Err(ProtocolError::Config(
                "access_wait backoff must satisfy 0 < initial_backoff_ms <= max_backoff_ms"
                    .to_string(),
            ));
        }

        if let TransportSelection::Serial { port } = &self.transport {
            if port.is_empty() {
                return Err(ProtocolError::Config("serial port name is empty".to_string()));
            }
        }

        Ok(())
    }

    /// Timeout for each bridge control request
    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }

    /// Timeout for one read
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Timeout for one write
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

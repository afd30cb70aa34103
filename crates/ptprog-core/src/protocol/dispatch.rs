//! Directed configuration commands
//!
//! Receivers are configured with a single-byte command code followed by its
//! parameters as ASCII digits, carried in a transmit request addressed to the
//! receiver's hardware address. Replies are handed back untouched.

use std::time::Duration;

use tracing::debug;

use super::frame::split_frames;
use super::{DeviceRecord, FrameCodec, FrameSplitter, ProtocolError, Transport};

/// Bytes received in reply to a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrameBuffer {
    data: Vec<u8>,
    len: usize,
}

impl RawFrameBuffer {
    /// Wrap a read buffer of which only `len` bytes were filled
    pub fn new(data: Vec<u8>, len: usize) -> Self {
        let len = len.min(data.len());
        Self { data, len }
    }

    /// The bytes actually received
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Number of bytes received
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when nothing came back
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the underlying read buffer
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Candidate frames in the reply, for callers that want to interpret it
    pub fn frames(&self) -> FrameSplitter<'_> {
        split_frames(&self.data, self.len)
    }
}

/// Render a numeric parameter the way receivers expect it
pub fn ascii_param(value: u32) -> Vec<u8> {
    value.to_string().into_bytes()
}

/// Builds, sends and collects replies for directed commands
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandDispatcher {
    codec: FrameCodec,
}

impl CommandDispatcher {
    /// Create a dispatcher encoding with `codec`
    pub fn new(codec: FrameCodec) -> Self {
        Self { codec }
    }

    /// Frame a command for one discovered device
    pub fn build_directed_command(
        &self,
        record: &DeviceRecord,
        command_code: u8,
        params: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        self.codec
            .encode_transmit_request(record.address(), command_code, params)
    }

    /// Write a complete frame
    pub fn send<T: Transport + ?Sized>(
        &self,
        transport: &mut T,
        frame: &[u8],
        timeout: Duration,
    ) -> Result<(), ProtocolError> {
        debug!("send: {} bytes: {:02x?}", frame.len(), frame);
        let written = transport.write(frame, timeout).map_err(|e| match e {
            ProtocolError::TransportUnavailable(_) => e,
            other => ProtocolError::TransportUnavailable(other.to_string()),
        })?;

        if written != frame.len() {
            return Err(ProtocolError::TransportUnavailable(format!(
                "short write: {} of {} bytes",
                written,
                frame.len()
            )));
        }
        Ok(())
    }

    /// One blocking read; zero bytes is a valid answer
    pub fn await_reply<T: Transport + ?Sized>(
        &self,
        transport: &mut T,
        timeout: Duration,
        buffer_capacity: usize,
    ) -> Result<RawFrameBuffer, ProtocolError> {
        let mut data = vec![0u8; buffer_capacity];
        let n = transport.read(&mut data, timeout)?.min(data.len());
        debug!("await_reply: {} bytes: {:02x?}", n, &data[..n]);
        Ok(RawFrameBuffer::new(data, n))
    }
}

//! Coordinator Protocol Communication
//!
//! Implements the API frame protocol spoken by the XBee coordinator, and the
//! CP210x bridge setup needed before any frame can be exchanged.
//!
//! Frames are sent unescaped by default; see [`Escaping`] for radios running
//! the escaped API mode.

mod address;
pub mod bridge;
pub mod checksum;
mod discovery;
mod dispatch;
mod error;
pub mod frame;
mod record;
pub mod serial;
mod session;
mod transport;
pub mod usb;

pub use address::Address;
pub use bridge::{BridgeConfigurator, BridgeState};
pub use discovery::{DiscoveryProtocol, DiscoveryState, DiscoveryStats};
pub use dispatch::{ascii_param, CommandDispatcher, RawFrameBuffer};
pub use error::ProtocolError;
pub use frame::{
    parse_node_identification, split_frames, Escaping, FrameBuilder, FrameCodec, FrameSplitter,
};
pub use record::DeviceRecord;
pub use serial::{list_ports, PortInfo, SerialBridge};
pub use session::{Session, SessionCounters};
pub use transport::{open_transport, ControlRequest, Transport};
pub use usb::{list_bridges, UsbBridge, UsbBridgeInfo, UsbOptions};

//! # ptprog Core Library
//!
//! Wire protocol core for discovering and configuring ProtoThrottle receivers.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - API frame encoding, splitting and checksum validation
//! - 64-bit radio address handling
//! - CP210x USB-to-serial bridge setup (raw USB or OS serial port)
//! - Node discovery and directed configuration commands
//!
//! ## Example
//!
//! ```rust,ignore
//! use ptprog_core::{config::SessionConfig, protocol::Session};
//! use tokio_util::sync::CancellationToken;
//!
//! let mut session = Session::connect(SessionConfig::default(), &CancellationToken::new())?;
//!
//! for device in session.discover()? {
//!     println!("{} {}", device.mac(), device.node_name());
//! }
//! ```

pub mod config;
pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{SessionConfig, TransportSelection};
    pub use crate::protocol::{
        Address, DeviceRecord, ProtocolError, RawFrameBuffer, Session, Transport,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

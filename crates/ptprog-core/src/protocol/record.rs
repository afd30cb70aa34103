//! Discovered device records

use serde::Serialize;

use super::Address;

/// A radio that answered a discovery broadcast
///
/// Records are only produced by parsing node identification responses. They
/// are plain values: cloning one never ties it to the session that found it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceRecord {
    address: Address,
    /// Textual form of `address`, kept for correlating with what the operator sees
    mac: String,
    node_name: String,
    network_address: u16,
    signal_strength: u8,
}

impl DeviceRecord {
    pub(crate) fn new(
        address: Address,
        node_name: String,
        network_address: u16,
        signal_strength: u8,
    ) -> Self {
        Self {
            mac: address.format(),
            address,
            node_name,
            network_address,
            signal_strength,
        }
    }

    /// Hardware address used to direct commands at this device
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Hardware address as 16 uppercase hex digits
    pub fn mac(&self) -> &str {
        &self.mac
    }

    /// Node identifier string configured on the radio
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// 16-bit network address reported alongside the identity
    pub fn network_address(&self) -> u16 {
        self.network_address
    }

    /// Byte preceding the node name. On 802.15.4 firmware this is the
    /// received signal strength in -dBm.
    pub fn signal_strength(&self) -> u8 {
        self.signal_strength
    }

    /// Records with no address or no name are noise
    pub fn is_empty(&self) -> bool {
        self.mac.is_empty() || self.node_name.is_empty()
    }
}

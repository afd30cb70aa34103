//! 64-bit radio addresses
//!
//! Devices are identified by their 8-byte hardware address, shown to the
//! operator as 16 uppercase hex digits (most significant byte first).

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use super::ProtocolError;

/// An 8-byte hardware address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; 8]);

impl Address {
    /// Length of the textual form
    pub const HEX_LEN: usize = 16;

    /// Address every radio on the network accepts
    pub const BROADCAST: Address = Address([0, 0, 0, 0, 0, 0, 0xFF, 0xFF]);

    /// Wrap raw address bytes
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Raw address bytes, most significant first
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Parse a 16 character hex string
    pub fn parse(hex: &str) -> Result<Self, ProtocolError> {
        let raw = hex.as_bytes();
        if raw.len() != Self::HEX_LEN {
            return Err(ProtocolError::InvalidAddress(hex.to_string()));
        }

        let mut bytes = [0u8; 8];
        for (i, pair) in raw.chunks_exact(2).enumerate() {
            let hi = hex_value(pair[0]);
            let lo = hex_value(pair[1]);
            match (hi, lo) {
                (Some(hi), Some(lo)) => bytes[i] = (hi << 4) | lo,
                _ => return Err(ProtocolError::InvalidAddress(hex.to_string())),
            }
        }
        Ok(Self(bytes))
    }

    /// Render as 16 uppercase hex digits
    pub fn format(&self) -> String {
        self.to_string()
    }

    /// Read an address out of a byte slice, if enough bytes are present
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
        Some(Self(arr))
    }
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

impl FromStr for Address {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.format())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Address::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_format() {
        let addr = Address::parse("0013a20040a1b2c3").unwrap();
        assert_eq!(
            addr.as_bytes(),
            &[0x00, 0x13, 0xA2, 0x00, 0x40, 0xA1, 0xB2, 0xC3]
        );
        assert_eq!(addr.format(), "0013A20040A1B2C3");
    }

    #[test]
    fn test_format_is_left_inverse() {
        for s in ["0000000000000000", "FFFFFFFFFFFFFFFF", "0123456789abcdef", "DeadBeef00C0FFEE"] {
            assert_eq!(Address::parse(s).unwrap().format(), s.to_uppercase());
        }
    }

    #[test]
    fn test_rejects_non_hex() {
        assert!(matches!(
            Address::parse("ZZZZZZZZZZZZZZZZ"),
            Err(ProtocolError::InvalidAddress(_))
        ));
        assert!(Address::parse("0013A20040A1B2G3").is_err());
    }

    #[test]
    fn test_rejects_wrong_length() {
        assert!(Address::parse("").is_err());
        assert!(Address::parse("0013A20040A1B2C").is_err());
        assert!(Address::parse("0013A20040A1B2C3F").is_err());
        // Multibyte characters must not be sliced mid-codepoint
        assert!(Address::parse("0013A20040A1B2é").is_err());
    }

    #[test]
    fn test_broadcast() {
        assert_eq!(Address::BROADCAST.to_string(), "000000000000FFFF");
    }

    #[test]
    fn test_from_str() {
        let addr: Address = "0013A20040A1B2C3".parse().unwrap();
        assert_eq!(addr.as_bytes()[7], 0xC3);
    }

    #[test]
    fn test_serde_as_hex_string() {
        let addr = Address::parse("0013A20040A1B2C3").unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"0013A20040A1B2C3\"");
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
        assert!(serde_json::from_str::<Address>("\"nothex\"").is_err());
    }
}

//! Transport-agnostic device identity primitives.

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// A 6-byte Bluetooth device address, stored most-significant byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceAddress(pub [u8; 6]);

impl DeviceAddress {
    /// Interpret the address as a 48-bit integer.
    pub fn to_u48(self) -> u64 {
        self.0.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
    }

    /// Build an address from the low 48 bits of an integer.
    pub fn from_u48(value: u64) -> Self {
        let mut bytes = [0u8; 6];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = ((value >> (8 * (5 - i))) & 0xFF) as u8;
        }
        Self(bytes)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl FromStr for DeviceAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(Error::Protocol(format!("invalid device address: {s}")));
        }
        let mut bytes = [0u8; 6];
        for (byte, part) in bytes.iter_mut().zip(&parts) {
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| Error::Protocol(format!("invalid device address: {s}")))?;
        }
        Ok(Self(bytes))
    }
}

/// Which address-mutation scheme the device applies when it reboots into
/// update mode.
///
/// The accessory advertises under a derived address after reboot; the scheme
/// is reported by the device during capability exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RebootScheme {
    /// Low 24 bits of the address are incremented by one; high 24 bits keep.
    New,
    /// Low 8 bits of the address are incremented by two; high 40 bits keep.
    #[default]
    Old,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display_roundtrip() {
        let addr = DeviceAddress([0x11, 0x22, 0x33, 0xAA, 0xBB, 0xCC]);
        let text = addr.to_string();
        assert_eq!(text, "11:22:33:AA:BB:CC");
        assert_eq!(text.parse::<DeviceAddress>().unwrap(), addr);
    }

    #[test]
    fn test_address_parse_rejects_garbage() {
        assert!("11:22:33".parse::<DeviceAddress>().is_err());
        assert!("11:22:33:44:55:GG".parse::<DeviceAddress>().is_err());
        assert!("".parse::<DeviceAddress>().is_err());
    }

    #[test]
    fn test_u48_roundtrip() {
        let addr = DeviceAddress([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        assert_eq!(addr.to_u48(), 0x010203040506);
        assert_eq!(DeviceAddress::from_u48(0x010203040506), addr);
    }
}

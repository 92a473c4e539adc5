//! PCI device addressing.

use crate::error::PassthruError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Matches `dddd:bb:ss.f` and the short `bb:ss.f` form.
static PCI_ADDRESS_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:([0-9a-fA-F]{4,8}):)?([0-9a-fA-F]{2}):([0-9a-fA-F]{2})\.([0-7])$")
        .expect("Invalid PCI address regex")
});

/// Highest valid slot number (5 bits).
pub const MAX_SLOT: u8 = 0x1f;
/// Highest valid function number (3 bits).
pub const MAX_FUNCTION: u8 = 0x7;

/// Canonical address of one PCI function: `domain:bus:slot.function`.
///
/// Ordering follows the numeric fields, so sorted lists read like `lspci`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PciAddress {
    domain: u32,
    bus: u8,
    slot: u8,
    function: u8,
}

impl PciAddress {
    /// Build an address, rejecting out-of-range slot or function numbers.
    pub fn new(domain: u32, bus: u8, slot: u8, function: u8) -> Result<Self, PassthruError> {
        if slot > MAX_SLOT || function > MAX_FUNCTION {
            return Err(PassthruError::InvalidAddress {
                input: format!("{:04x}:{:02x}:{:02x}.{:x}", domain, bus, slot, function),
            });
        }
        Ok(Self { domain, bus, slot, function })
    }

    pub fn domain(&self) -> u32 {
        self.domain
    }

    pub fn bus(&self) -> u8 {
        self.bus
    }

    pub fn slot(&self) -> u8 {
        self.slot
    }

    pub fn function(&self) -> u8 {
        self.function
    }

    /// Whether both addresses sit on the same domain and bus.
    pub fn shares_bus_with(&self, other: &PciAddress) -> bool {
        self.domain == other.domain && self.bus == other.bus
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:02x}:{:02x}.{:x}", self.domain, self.bus, self.slot, self.function)
    }
}

impl FromStr for PciAddress {
    type Err = PassthruError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PassthruError::InvalidAddress { input: s.to_string() };
        let caps = PCI_ADDRESS_REGEX.captures(s.trim()).ok_or_else(invalid)?;

        let domain = match caps.get(1) {
            Some(m) => u32::from_str_radix(m.as_str(), 16).map_err(|_| invalid())?,
            None => 0,
        };
        let bus = u8::from_str_radix(&caps[2], 16).map_err(|_| invalid())?;
        let slot = u8::from_str_radix(&caps[3], 16).map_err(|_| invalid())?;
        let function = u8::from_str_radix(&caps[4], 16).map_err(|_| invalid())?;

        if slot > MAX_SLOT {
            return Err(invalid());
        }
        Ok(Self { domain, bus, slot, function })
    }
}

impl TryFrom<String> for PciAddress {
    type Error = PassthruError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PciAddress> for String {
    fn from(addr: PciAddress) -> Self {
        addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_name() {
        let addr = PciAddress::new(0, 0, 0, 0).unwrap();
        assert_eq!(addr.to_string(), "0000:00:00.0");

        let addr = PciAddress::new(0xffff, 0xff, 0x1f, 7).unwrap();
        assert_eq!(addr.to_string(), "ffff:ff:1f.7");
    }

    #[test]
    fn test_parse() {
        let addr: PciAddress = "0000:01:00.1".parse().unwrap();
        assert_eq!((addr.domain(), addr.bus(), addr.slot(), addr.function()), (0, 1, 0, 1));

        let short: PciAddress = "01:00.1".parse().unwrap();
        assert_eq!(short, addr);

        let upper: PciAddress = "ABCD:12:1F.5".parse().unwrap();
        assert_eq!(upper.to_string(), "abcd:12:1f.5");

        let wide: PciAddress = "10000:00:02.0".parse().unwrap();
        assert_eq!(wide.domain(), 0x10000);
        assert_eq!(wide.to_string(), "10000:00:02.0");
    }

    #[test]
    fn test_parse_rejects_invalid() {
        for input in ["0000:01:00", "0000:01:00.8", "0000:01:20.0", "invalid", "", "0:1:2.3"] {
            assert!(
                matches!(input.parse::<PciAddress>(), Err(PassthruError::InvalidAddress { .. })),
                "{input} should be rejected"
            );
        }
    }

    #[test]
    fn test_new_rejects_out_of_range() {
        assert!(PciAddress::new(0, 0, 0x20, 0).is_err());
        assert!(PciAddress::new(0, 0, 0, 8).is_err());
    }

    #[test]
    fn test_equality_and_ordering() {
        let a = PciAddress::new(0, 0, 1, 0).unwrap();
        let b: PciAddress = "0000:00:01.0".parse().unwrap();
        let c = PciAddress::new(0, 0, 3, 0).unwrap();
        assert_eq!(a, b);
        assert!(a < c);
        assert!(a.shares_bus_with(&c));
        assert!(!a.shares_bus_with(&PciAddress::new(0, 1, 1, 0).unwrap()));
    }

    #[test]
    fn test_serde_as_string() {
        let addr = PciAddress::new(0, 0x3, 0x1, 2).unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"0000:03:01.2\"");
        let back: PciAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
        assert!(serde_json::from_str::<PciAddress>("\"bogus\"").is_err());
    }
}

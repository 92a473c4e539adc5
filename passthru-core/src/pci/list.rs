//! Ordered device lists and the active/inactive ledger.

use crate::error::{PassthruError, Result};
use crate::pci::address::PciAddress;
use crate::pci::device::PciDevice;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Which of the two ledger lists a device lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListKind {
    /// Assigned to a guest.
    Active,
    /// Detached from the host, waiting for a guest.
    Inactive,
}

impl fmt::Display for ListKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListKind::Active => f.write_str("active"),
            ListKind::Inactive => f.write_str("inactive"),
        }
    }
}

/// Devices in insertion order, at most one per address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciDeviceList {
    kind: ListKind,
    devices: Vec<PciDevice>,
}

impl PciDeviceList {
    pub fn new(kind: ListKind) -> Self {
        Self { kind, devices: Vec::new() }
    }

    pub fn kind(&self) -> ListKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn contains(&self, address: &PciAddress) -> bool {
        self.position(address).is_some()
    }

    pub fn get(&self, address: &PciAddress) -> Option<&PciDevice> {
        self.devices.iter().find(|d| d.address() == address)
    }

    pub fn get_mut(&mut self, address: &PciAddress) -> Option<&mut PciDevice> {
        self.devices.iter_mut().find(|d| d.address() == address)
    }

    /// Append a device. Fails, leaving the list untouched, if the address is
    /// already present.
    pub fn add(&mut self, device: PciDevice) -> Result<()> {
        if self.contains(device.address()) {
            return Err(PassthruError::ConsistencyViolation {
                reason: format!("device {} already in {} list", device.address(), self.kind),
            });
        }
        self.devices.push(device);
        Ok(())
    }

    /// Remove and return the device, keeping the order of the rest.
    pub fn take(&mut self, address: &PciAddress) -> Option<PciDevice> {
        self.position(address).map(|idx| self.devices.remove(idx))
    }

    pub fn addresses(&self) -> Vec<PciAddress> {
        self.devices.iter().map(|d| *d.address()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PciDevice> {
        self.devices.iter()
    }

    fn position(&self, address: &PciAddress) -> Option<usize> {
        self.devices.iter().position(|d| d.address() == address)
    }
}

/// The active and inactive lists plus the addresses handed back to the host.
///
/// Both lists live behind one lock because "in at most one list" spans both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTables {
    pub active: PciDeviceList,
    pub inactive: PciDeviceList,
    /// Addresses reattached to the host; lets a repeated reattach succeed.
    #[serde(default)]
    pub released: BTreeSet<PciAddress>,
    /// Devices whose stub bind is in flight, with their original driver
    /// already recorded. Only non-empty inside a detach.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending: Vec<PciDevice>,
}

impl Default for DeviceTables {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceTables {
    pub fn new() -> Self {
        Self {
            active: PciDeviceList::new(ListKind::Active),
            inactive: PciDeviceList::new(ListKind::Inactive),
            released: BTreeSet::new(),
            pending: Vec::new(),
        }
    }

    pub fn list(&self, kind: ListKind) -> &PciDeviceList {
        match kind {
            ListKind::Active => &self.active,
            ListKind::Inactive => &self.inactive,
        }
    }

    pub fn list_mut(&mut self, kind: ListKind) -> &mut PciDeviceList {
        match kind {
            ListKind::Active => &mut self.active,
            ListKind::Inactive => &mut self.inactive,
        }
    }

    /// Which list holds `address`, if any.
    ///
    /// An address found in both lists is reported, never repaired.
    pub fn locate(&self, address: &PciAddress) -> Result<Option<ListKind>> {
        match (self.inactive.contains(address), self.active.contains(address)) {
            (true, true) => Err(PassthruError::ConsistencyViolation {
                reason: format!("device {} is in both active and inactive lists", address),
            }),
            (true, false) => Ok(Some(ListKind::Inactive)),
            (false, true) => Ok(Some(ListKind::Active)),
            (false, false) => Ok(None),
        }
    }

    pub fn device(&self, address: &PciAddress) -> Option<&PciDevice> {
        self.inactive.get(address).or_else(|| self.active.get(address))
    }

    /// Check that no address appears in both lists.
    pub fn check_consistency(&self) -> Result<()> {
        for address in self.active.addresses() {
            if self.inactive.contains(&address) {
                return Err(PassthruError::ConsistencyViolation {
                    reason: format!("device {} is in both active and inactive lists", address),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pci::fake::{FakeDevice, FakeSysfs};

    fn device(s: &str) -> PciDevice {
        let addr: PciAddress = s.parse().unwrap();
        let fake = FakeSysfs::new().with_device(FakeDevice::new(addr));
        PciDevice::probe(&fake, &addr).unwrap()
    }

    #[test]
    fn test_new_list_is_empty() {
        let list = PciDeviceList::new(ListKind::Inactive);
        assert_eq!(list.len(), 0);
        assert!(list.is_empty());
        assert_eq!(list.kind(), ListKind::Inactive);
    }

    #[test]
    fn test_add_rejects_duplicate() {
        let mut list = PciDeviceList::new(ListKind::Inactive);
        list.add(device("0000:00:01.0")).unwrap();
        let err = list.add(device("0000:00:01.0")).unwrap_err();
        assert!(matches!(err, PassthruError::ConsistencyViolation { .. }));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_insertion_order_preserved() {
        let mut list = PciDeviceList::new(ListKind::Active);
        for addr in ["0000:00:03.0", "0000:00:01.0", "0000:00:02.0"] {
            list.add(device(addr)).unwrap();
        }
        let taken = list.take(&"0000:00:01.0".parse().unwrap()).unwrap();
        assert_eq!(taken.address().to_string(), "0000:00:01.0");

        let names: Vec<String> = list.addresses().iter().map(|a| a.to_string()).collect();
        assert_eq!(names, vec!["0000:00:03.0", "0000:00:02.0"]);
        assert!(list.take(&"0000:00:01.0".parse().unwrap()).is_none());
    }

    #[test]
    fn test_locate_detects_double_membership() {
        let mut tables = DeviceTables::new();
        let addr: PciAddress = "0000:00:01.0".parse().unwrap();
        assert_eq!(tables.locate(&addr).unwrap(), None);

        tables.inactive.add(device("0000:00:01.0")).unwrap();
        assert_eq!(tables.locate(&addr).unwrap(), Some(ListKind::Inactive));
        assert!(tables.check_consistency().is_ok());

        tables.active.add(device("0000:00:01.0")).unwrap();
        assert!(matches!(
            tables.locate(&addr),
            Err(PassthruError::ConsistencyViolation { .. })
        ));
        assert!(tables.check_consistency().is_err());
    }
}

//! In-memory record of one managed PCI function.

use crate::error::Result;
use crate::pci::address::PciAddress;
use crate::pci::stub::StubDriver;
use crate::pci::sysfs::{DeviceInfo, SysfsGateway};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// When to issue a function-level reset around a hand-over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResetPolicy {
    Always,
    Never,
    /// Skip the reset if other devices sit on the same bus; a reset can
    /// disturb them.
    #[default]
    AvoidIfSharedBus,
}

impl fmt::Display for ResetPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResetPolicy::Always => "always",
            ResetPolicy::Never => "never",
            ResetPolicy::AvoidIfSharedBus => "avoid-if-shared-bus",
        };
        f.write_str(name)
    }
}

impl FromStr for ResetPolicy {
    type Err = crate::error::PassthruError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "always" => Ok(ResetPolicy::Always),
            "never" => Ok(ResetPolicy::Never),
            "avoid-if-shared-bus" => Ok(ResetPolicy::AvoidIfSharedBus),
            other => Err(crate::error::PassthruError::InvalidConfig {
                reason: format!("Unknown reset policy: {}", other),
            }),
        }
    }
}

/// One physical function and the state this host keeps about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciDevice {
    address: PciAddress,
    vendor_id: String,
    device_id: String,
    class: String,
    #[serde(default)]
    iommu_group: Option<u32>,
    #[serde(default)]
    is_boot_vga: bool,
    /// Driver bound before the first detach. Only meaningful once
    /// `original_recorded` is set; `None` then means "started driverless".
    original_driver: Option<String>,
    original_recorded: bool,
    stub_driver: Option<StubDriver>,
    managed: bool,
    reset_policy: ResetPolicy,
    used_by: Option<String>,
    #[serde(default)]
    pending_reattach: bool,
}

impl PciDevice {
    /// Look the device up through the gateway. Fails with `NotFound` when the
    /// address has no device behind it.
    pub fn probe(gateway: &dyn SysfsGateway, address: &PciAddress) -> Result<Self> {
        Ok(Self::from_info(gateway.probe(address)?))
    }

    pub fn from_info(info: DeviceInfo) -> Self {
        Self {
            address: info.address,
            vendor_id: info.vendor_id,
            device_id: info.device_id,
            class: info.class,
            iommu_group: info.iommu_group,
            is_boot_vga: info.is_boot_vga,
            original_driver: None,
            original_recorded: false,
            stub_driver: None,
            managed: false,
            reset_policy: ResetPolicy::default(),
            used_by: None,
            pending_reattach: false,
        }
    }

    pub fn address(&self) -> &PciAddress {
        &self.address
    }

    pub fn vendor_id(&self) -> &str {
        &self.vendor_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn iommu_group(&self) -> Option<u32> {
        self.iommu_group
    }

    pub fn is_boot_vga(&self) -> bool {
        self.is_boot_vga
    }

    pub fn original_driver(&self) -> Option<&str> {
        self.original_driver.as_deref()
    }

    pub fn original_recorded(&self) -> bool {
        self.original_recorded
    }

    pub fn stub_driver(&self) -> Option<StubDriver> {
        self.stub_driver
    }

    pub fn is_managed(&self) -> bool {
        self.managed
    }

    pub fn reset_policy(&self) -> ResetPolicy {
        self.reset_policy
    }

    pub fn used_by(&self) -> Option<&str> {
        self.used_by.as_deref()
    }

    pub fn is_pending_reattach(&self) -> bool {
        self.pending_reattach
    }

    pub fn set_reset_policy(&mut self, policy: ResetPolicy) {
        self.reset_policy = policy;
    }

    pub(crate) fn record_original_driver(&mut self, driver: Option<String>) {
        self.original_driver = driver;
        self.original_recorded = true;
    }

    pub(crate) fn set_stub_driver(&mut self, stub: Option<StubDriver>) {
        self.stub_driver = stub;
    }

    pub(crate) fn set_managed(&mut self, managed: bool) {
        self.managed = managed;
    }

    pub(crate) fn set_used_by(&mut self, consumer: Option<String>) {
        self.used_by = consumer;
    }

    pub(crate) fn set_pending_reattach(&mut self, pending: bool) {
        self.pending_reattach = pending;
    }

    /// Drop all ownership state once the device is back with the host.
    pub(crate) fn clear_management(&mut self) {
        self.managed = false;
        self.used_by = None;
        self.pending_reattach = false;
        self.stub_driver = None;
    }

    /// Human-readable `vendor:device` pair.
    pub fn display_name(&self) -> String {
        format!("[{}:{}]", self.vendor_id, self.device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PassthruError;
    use crate::pci::fake::{FakeDevice, FakeSysfs};

    #[test]
    fn test_probe_new_device() {
        let addr: PciAddress = "0000:00:00.0".parse().unwrap();
        let fake = FakeSysfs::new().with_device(FakeDevice::new(addr).driver("e1000e"));

        let device = PciDevice::probe(&fake, &addr).unwrap();
        assert_eq!(device.address().to_string(), "0000:00:00.0");
        assert!(!device.is_managed());
        assert!(!device.original_recorded());
        assert_eq!(device.used_by(), None);
        assert_eq!(device.reset_policy(), ResetPolicy::AvoidIfSharedBus);
    }

    #[test]
    fn test_probe_missing_device() {
        let addr: PciAddress = "ffff:ff:1f.7".parse().unwrap();
        let err = PciDevice::probe(&FakeSysfs::new(), &addr).unwrap_err();
        assert!(matches!(err, PassthruError::NotFound { .. }));
    }

    #[test]
    fn test_clear_management() {
        let addr: PciAddress = "0000:00:01.0".parse().unwrap();
        let fake = FakeSysfs::new().with_device(FakeDevice::new(addr));
        let mut device = PciDevice::probe(&fake, &addr).unwrap();

        device.set_managed(true);
        device.set_used_by(Some("guest".into()));
        device.set_pending_reattach(true);
        device.set_stub_driver(Some(StubDriver::PciStub));
        device.clear_management();

        assert!(!device.is_managed());
        assert_eq!(device.used_by(), None);
        assert!(!device.is_pending_reattach());
        assert_eq!(device.stub_driver(), None);
    }

    #[test]
    fn test_reset_policy_names() {
        for policy in [ResetPolicy::Always, ResetPolicy::Never, ResetPolicy::AvoidIfSharedBus] {
            assert_eq!(policy.to_string().parse::<ResetPolicy>().unwrap(), policy);
        }
        let json = serde_json::to_string(&ResetPolicy::AvoidIfSharedBus).unwrap();
        assert_eq!(json, "\"avoid-if-shared-bus\"");
    }
}

//! Stub driver binding.
//!
//! A stub driver claims a device without driving it so the host stops using
//! it. Two implementations are supported:
//!
//! - `pci-stub` (legacy): the device ID is registered through `new_id`,
//!   the device is bound, then the ID is removed again so the stub does not
//!   grab other devices of the same model.
//! - `vfio-pci` (modern): `driver_override` pins the device to the stub
//!   before binding.

use crate::error::{PassthruError, Result};
use crate::pci::address::PciAddress;
use crate::pci::device::PciDevice;
use crate::pci::sysfs::SysfsGateway;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Driver names recognized as stubs.
pub const KNOWN_STUB_DRIVERS: &[&str] = &["pci-stub", "vfio-pci"];

/// Whether `driver` is one of the stub drivers.
pub fn is_stub_driver(driver: &str) -> bool {
    KNOWN_STUB_DRIVERS.contains(&driver)
}

/// Stub driver implementation used to claim devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StubDriver {
    #[serde(rename = "pci-stub")]
    PciStub,
    #[default]
    #[serde(rename = "vfio-pci")]
    VfioPci,
}

impl StubDriver {
    /// Kernel driver name.
    pub fn name(&self) -> &'static str {
        match self {
            StubDriver::PciStub => "pci-stub",
            StubDriver::VfioPci => "vfio-pci",
        }
    }

    fn uses_driver_override(&self) -> bool {
        matches!(self, StubDriver::VfioPci)
    }
}

impl fmt::Display for StubDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StubDriver {
    type Err = PassthruError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "pci-stub" => Ok(StubDriver::PciStub),
            "vfio-pci" | "vfio" => Ok(StubDriver::VfioPci),
            other => Err(PassthruError::InvalidConfig {
                reason: format!("Unknown stub driver: {} (expected pci-stub or vfio-pci)", other),
            }),
        }
    }
}

/// Moves devices between their host driver and the configured stub.
#[derive(Debug, Clone)]
pub struct StubBinder {
    gateway: Arc<dyn SysfsGateway>,
    stub: StubDriver,
}

impl StubBinder {
    pub fn new(gateway: Arc<dyn SysfsGateway>, stub: StubDriver) -> Self {
        Self { gateway, stub }
    }

    pub fn stub(&self) -> StubDriver {
        self.stub
    }

    /// Whether the device is currently bound to any stub driver.
    pub fn is_stub_bound(&self, address: &PciAddress) -> Result<bool> {
        Ok(self.gateway.current_driver(address)?.as_deref().is_some_and(is_stub_driver))
    }

    /// Bind the device to the stub driver.
    ///
    /// Records the pre-existing driver on first use. A device already bound to
    /// the configured stub is left alone. On failure the previous binding is
    /// restored as far as possible and the device record is unchanged.
    pub fn ensure_stub(&self, device: &mut PciDevice) -> Result<()> {
        let address = *device.address();
        let current = self.gateway.current_driver(&address)?;

        if current.as_deref() == Some(self.stub.name()) {
            debug!(address = %address, stub = %self.stub, "Device already bound to stub");
            note_original(device, current);
            device.set_stub_driver(Some(self.stub));
            return Ok(());
        }

        if let Err(e) = self.bind_to_stub(&address, current.as_deref()) {
            warn!(address = %address, stub = %self.stub, error = %e, "Stub bind failed, restoring");
            self.undo_failed_bind(&address, current.as_deref());
            return Err(e);
        }

        note_original(device, current);
        device.set_stub_driver(Some(self.stub));

        info!(
            address = %address,
            stub = %self.stub,
            original = ?device.original_driver(),
            "Device bound to stub driver"
        );
        Ok(())
    }

    /// Record the driver to restore on reattach without touching the binding.
    ///
    /// Does nothing once a driver is recorded.
    pub fn record_original(&self, device: &mut PciDevice) -> Result<()> {
        if device.original_recorded() {
            return Ok(());
        }
        let current = self.gateway.current_driver(device.address())?;
        note_original(device, current);
        Ok(())
    }

    /// Unbind the stub and rebind the recorded original driver.
    pub fn release_stub(&self, device: &mut PciDevice) -> Result<()> {
        self.unbind_stub(device)?;
        self.restore_original(device)
    }

    /// First half of [`release_stub`](Self::release_stub): leave the device
    /// driverless. Does nothing if the device already has its original driver.
    pub fn unbind_stub(&self, device: &mut PciDevice) -> Result<()> {
        let address = *device.address();
        let current = self.gateway.current_driver(&address)?;

        if current.as_deref() == device.original_driver() {
            debug!(address = %address, driver = ?current, "Device already has its original driver");
            return Ok(());
        }

        if let Some(driver) = current.as_deref() {
            if !is_stub_driver(driver) {
                return Err(PassthruError::UnbindFailed {
                    address,
                    driver: driver.to_string(),
                    reason: "device is bound to a non-stub driver it was not detached from"
                        .to_string(),
                });
            }
            self.gateway.unbind(&address).map_err(|e| unbind_failed(&address, driver, e))?;
        }

        // Clearing the override lets the original driver claim the device.
        if self.stub.uses_driver_override() || current.as_deref() == Some("vfio-pci") {
            self.gateway
                .set_driver_override(&address, None)
                .map_err(|e| unbind_failed(&address, "driver_override", e))?;
        }

        device.set_stub_driver(None);
        Ok(())
    }

    /// Second half of [`release_stub`](Self::release_stub): bind the driver
    /// recorded before the first detach, or leave the device driverless.
    pub fn restore_original(&self, device: &mut PciDevice) -> Result<()> {
        let address = *device.address();
        let original = device.original_driver().map(str::to_string);

        self.restore(&address, original.as_deref())?;
        device.set_stub_driver(None);

        info!(address = %address, driver = ?original, "Device returned to host driver");
        Ok(())
    }

    fn bind_to_stub(&self, address: &PciAddress, current: Option<&str>) -> Result<()> {
        let stub = self.stub.name();

        if !self.gateway.driver_exists(stub) {
            return Err(PassthruError::BindFailed {
                address: *address,
                driver: stub.to_string(),
                reason: format!("{} driver not loaded (try: modprobe {})", stub, stub),
            });
        }

        if let Some(driver) = current {
            self.gateway.unbind(address).map_err(|e| unbind_failed(address, driver, e))?;
        }

        match self.stub {
            StubDriver::VfioPci => {
                self.gateway
                    .set_driver_override(address, Some(stub))
                    .map_err(|e| bind_failed(address, stub, e))?;
                if let Err(e) = self.gateway.bind(address, stub) {
                    debug!(address = %address, error = %e, "Direct bind failed, probing");
                    self.gateway.drivers_probe(address).map_err(|e| bind_failed(address, stub, e))?;
                }
            }
            StubDriver::PciStub => {
                self.gateway
                    .add_dynamic_id(address, stub)
                    .map_err(|e| bind_failed(address, stub, e))?;
                let bound = self.gateway.bind(address, stub);
                if let Err(e) = self.gateway.remove_dynamic_id(address, stub) {
                    warn!(address = %address, error = %e, "Failed to remove device ID from pci-stub");
                }
                bound.map_err(|e| bind_failed(address, stub, e))?;
            }
        }

        self.verify_driver(address, Some(stub))
            .map_err(|reason| PassthruError::BindFailed {
                address: *address,
                driver: stub.to_string(),
                reason,
            })
    }

    /// Put the device back the way it was before a failed stub bind.
    fn undo_failed_bind(&self, address: &PciAddress, previous: Option<&str>) {
        // The override outlives the failed bind and would hand the device to
        // the stub on the next probe.
        if self.stub.uses_driver_override() {
            if let Err(e) = self.gateway.set_driver_override(address, None) {
                warn!(address = %address, error = %e, "Could not clear driver_override");
            }
        }
        if let Err(e) = self.restore(address, previous) {
            warn!(address = %address, error = %e, "Could not restore previous driver");
        }
    }

    /// Bring the device back to `driver`, or leave it unbound for `None`.
    fn restore(&self, address: &PciAddress, driver: Option<&str>) -> Result<()> {
        let current = self.gateway.current_driver(address)?;
        if current.as_deref() == driver {
            return Ok(());
        }

        if let Some(bound) = current.as_deref() {
            self.gateway.unbind(address).map_err(|e| unbind_failed(address, bound, e))?;
        }

        let Some(driver) = driver else {
            return Ok(());
        };

        // A leftover override would steer the probe back to the stub.
        if self.stub.uses_driver_override() && !is_stub_driver(driver) {
            if let Err(e) = self.gateway.set_driver_override(address, None) {
                debug!(address = %address, error = %e, "Could not clear driver_override");
            }
        }

        if let Err(e) = self.gateway.bind(address, driver) {
            debug!(address = %address, driver = %driver, error = %e, "Rebind failed, probing");
            self.gateway.drivers_probe(address).map_err(|e| unbind_failed(address, driver, e))?;
        }

        self.verify_driver(address, Some(driver)).map_err(|reason| {
            PassthruError::UnbindFailed { address: *address, driver: driver.to_string(), reason }
        })
    }

    fn verify_driver(&self, address: &PciAddress, expected: Option<&str>) -> std::result::Result<(), String> {
        match self.gateway.current_driver(address) {
            Ok(current) if current.as_deref() == expected => Ok(()),
            Ok(current) => Err(format!(
                "expected driver {:?}, device is bound to {:?}",
                expected, current
            )),
            Err(e) => Err(e.to_string()),
        }
    }
}

/// Record `current` as the original driver unless one is recorded already.
///
/// A device sitting on a stub with no record has lost its history, so it is
/// treated as driverless rather than pinned to the stub on reattach.
fn note_original(device: &mut PciDevice, current: Option<String>) {
    if device.original_recorded() {
        return;
    }
    match current {
        Some(driver) if is_stub_driver(&driver) => {
            warn!(
                address = %device.address(),
                driver = %driver,
                "Device already on a stub driver without a record, original driver unknown"
            );
            device.record_original_driver(None);
        }
        other => device.record_original_driver(other),
    }
}

/// Keep `Busy` and `NotFound` as they are; wrap everything else.
fn bind_failed(address: &PciAddress, driver: &str, err: PassthruError) -> PassthruError {
    match err {
        PassthruError::Busy { .. } | PassthruError::NotFound { .. } => err,
        other => PassthruError::BindFailed {
            address: *address,
            driver: driver.to_string(),
            reason: other.to_string(),
        },
    }
}

fn unbind_failed(address: &PciAddress, driver: &str, err: PassthruError) -> PassthruError {
    match err {
        PassthruError::Busy { .. } | PassthruError::NotFound { .. } => err,
        other => PassthruError::UnbindFailed {
            address: *address,
            driver: driver.to_string(),
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pci::fake::{FailKind, FakeDevice, FakeSysfs};
    use crate::error::SysfsOp;

    fn addr(s: &str) -> PciAddress {
        s.parse().unwrap()
    }

    fn setup(stub: StubDriver) -> (Arc<FakeSysfs>, StubBinder) {
        let fake = Arc::new(
            FakeSysfs::new()
                .with_device(FakeDevice::new(addr("0000:00:01.0")).driver("e1000e"))
                .with_device(FakeDevice::new(addr("0000:00:03.0"))),
        );
        let binder = StubBinder::new(fake.clone(), stub);
        (fake, binder)
    }

    #[test]
    fn test_stub_driver_parse() {
        assert_eq!("pci-stub".parse::<StubDriver>().unwrap(), StubDriver::PciStub);
        assert_eq!("vfio-pci".parse::<StubDriver>().unwrap(), StubDriver::VfioPci);
        assert!("nouveau".parse::<StubDriver>().is_err());
        assert_eq!(StubDriver::default(), StubDriver::VfioPci);
        assert!(is_stub_driver("pci-stub"));
        assert!(!is_stub_driver("e1000e"));
    }

    #[test]
    fn test_ensure_and_release_vfio() {
        let (fake, binder) = setup(StubDriver::VfioPci);
        let mut device = PciDevice::probe(fake.as_ref(), &addr("0000:00:01.0")).unwrap();

        binder.ensure_stub(&mut device).unwrap();
        assert_eq!(fake.driver_of(device.address()).as_deref(), Some("vfio-pci"));
        assert_eq!(device.original_driver(), Some("e1000e"));
        assert_eq!(device.stub_driver(), Some(StubDriver::VfioPci));

        binder.release_stub(&mut device).unwrap();
        assert_eq!(fake.driver_of(device.address()).as_deref(), Some("e1000e"));
        assert_eq!(fake.driver_override_of(device.address()), None);
        assert_eq!(device.stub_driver(), None);
    }

    #[test]
    fn test_ensure_and_release_pci_stub_driverless() {
        let (fake, binder) = setup(StubDriver::PciStub);
        let mut device = PciDevice::probe(fake.as_ref(), &addr("0000:00:03.0")).unwrap();

        binder.ensure_stub(&mut device).unwrap();
        assert_eq!(fake.driver_of(device.address()).as_deref(), Some("pci-stub"));
        assert!(device.original_recorded());
        assert_eq!(device.original_driver(), None);
        // The dynamic ID is removed right after binding.
        assert!(!fake.has_dynamic_id("pci-stub", device.address()));

        binder.release_stub(&mut device).unwrap();
        assert_eq!(fake.driver_of(device.address()), None);
    }

    #[test]
    fn test_ensure_is_noop_when_already_stub() {
        let (fake, binder) = setup(StubDriver::VfioPci);
        let mut device = PciDevice::probe(fake.as_ref(), &addr("0000:00:01.0")).unwrap();

        binder.ensure_stub(&mut device).unwrap();
        let writes = fake.write_count();
        binder.ensure_stub(&mut device).unwrap();
        assert_eq!(fake.write_count(), writes);
        assert_eq!(device.original_driver(), Some("e1000e"));
    }

    #[test]
    fn test_failed_bind_restores_original() {
        let (fake, binder) = setup(StubDriver::VfioPci);
        let address = addr("0000:00:01.0");
        fake.inject_failure(address, SysfsOp::DriverOverride, FailKind::Io, Some(1));
        let mut device = PciDevice::probe(fake.as_ref(), &address).unwrap();

        let err = binder.ensure_stub(&mut device).unwrap_err();
        assert!(matches!(err, PassthruError::BindFailed { .. }));
        assert_eq!(fake.driver_of(&address).as_deref(), Some("e1000e"));
        assert!(!device.original_recorded());
        assert_eq!(device.stub_driver(), None);
    }

    #[test]
    fn test_failed_bind_of_driverless_device_clears_override() {
        let (fake, binder) = setup(StubDriver::VfioPci);
        let address = addr("0000:00:03.0");
        fake.inject_failure(address, SysfsOp::Bind, FailKind::Io, None);
        fake.inject_failure(address, SysfsOp::DriversProbe, FailKind::Io, None);
        let mut device = PciDevice::probe(fake.as_ref(), &address).unwrap();

        let err = binder.ensure_stub(&mut device).unwrap_err();
        assert!(matches!(err, PassthruError::BindFailed { .. }));
        assert_eq!(fake.driver_of(&address), None);
        assert_eq!(fake.driver_override_of(&address), None);
    }

    #[test]
    fn test_stub_bound_device_without_record_is_treated_as_driverless() {
        let (fake, binder) = setup(StubDriver::VfioPci);
        let address = addr("0000:00:01.0");
        fake.force_driver(&address, Some("vfio-pci"));
        let mut device = PciDevice::probe(fake.as_ref(), &address).unwrap();

        binder.record_original(&mut device).unwrap();
        assert!(device.original_recorded());
        assert_eq!(device.original_driver(), None);

        binder.ensure_stub(&mut device).unwrap();
        binder.release_stub(&mut device).unwrap();
        assert_eq!(fake.driver_of(&address), None);
    }

    #[test]
    fn test_missing_stub_module() {
        let fake = Arc::new(
            FakeSysfs::bare().with_device(FakeDevice::new(addr("0000:00:01.0")).driver("e1000e")),
        );
        let binder = StubBinder::new(fake.clone(), StubDriver::VfioPci);
        let mut device = PciDevice::probe(fake.as_ref(), &addr("0000:00:01.0")).unwrap();

        let err = binder.ensure_stub(&mut device).unwrap_err();
        assert!(matches!(err, PassthruError::BindFailed { .. }));
        assert_eq!(fake.driver_of(&addr("0000:00:01.0")).as_deref(), Some("e1000e"));
    }

    #[test]
    fn test_busy_is_passed_through() {
        let (fake, binder) = setup(StubDriver::VfioPci);
        let address = addr("0000:00:01.0");
        fake.inject_failure(address, SysfsOp::Unbind, FailKind::Busy, Some(1));
        let mut device = PciDevice::probe(fake.as_ref(), &address).unwrap();

        let err = binder.ensure_stub(&mut device).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_release_refuses_foreign_driver() {
        let (fake, binder) = setup(StubDriver::VfioPci);
        let address = addr("0000:00:03.0");
        let mut device = PciDevice::probe(fake.as_ref(), &address).unwrap();
        binder.ensure_stub(&mut device).unwrap();

        // Someone else moved the device to a regular driver.
        fake.force_driver(&address, Some("e1000e"));
        let err = binder.release_stub(&mut device).unwrap_err();
        assert!(matches!(err, PassthruError::UnbindFailed { .. }));
    }

    #[test]
    fn test_release_is_idempotent() {
        let (fake, binder) = setup(StubDriver::VfioPci);
        let mut device = PciDevice::probe(fake.as_ref(), &addr("0000:00:01.0")).unwrap();
        binder.ensure_stub(&mut device).unwrap();

        binder.release_stub(&mut device).unwrap();
        binder.release_stub(&mut device).unwrap();
        assert_eq!(fake.driver_of(device.address()).as_deref(), Some("e1000e"));
    }
}

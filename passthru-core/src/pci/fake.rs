//! In-memory sysfs used by tests.
//!
//! Emulates the parts of the kernel's driver core the binder relies on:
//! `driver_override` restricts which driver may bind, stub drivers only accept
//! devices whose ID was registered through `new_id` (or that are pinned by
//! an override), `new_id` auto-binds matching unbound devices, and
//! `drivers_probe` falls back to the device's native driver.

use crate::error::{PassthruError, Result, SysfsOp};
use crate::pci::address::PciAddress;
use crate::pci::stub::is_stub_driver;
use crate::pci::sysfs::{DeviceInfo, SysfsGateway};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

/// Kind of failure to inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailKind {
    /// Plain I/O error (EIO).
    Io,
    /// Device busy; surfaces as `PassthruError::Busy`.
    Busy,
}

#[derive(Debug, Clone)]
struct Injected {
    address: PciAddress,
    operation: SysfsOp,
    kind: FailKind,
    /// `None` fails forever.
    remaining: Option<u32>,
}

/// A device in the fake tree.
#[derive(Debug, Clone)]
pub struct FakeDevice {
    address: PciAddress,
    vendor_id: String,
    device_id: String,
    class: String,
    driver: Option<String>,
    /// Driver the kernel would pick on a probe.
    native_driver: Option<String>,
    driver_override: Option<String>,
    iommu_group: Option<u32>,
    is_boot_vga: bool,
    physfn: Option<PciAddress>,
    virtfns: Vec<PciAddress>,
    reset_supported: bool,
}

impl FakeDevice {
    pub fn new(address: PciAddress) -> Self {
        Self {
            address,
            vendor_id: "8086".to_string(),
            device_id: "10d3".to_string(),
            class: "0x020000".to_string(),
            driver: None,
            native_driver: None,
            driver_override: None,
            iommu_group: None,
            is_boot_vga: false,
            physfn: None,
            virtfns: Vec::new(),
            reset_supported: true,
        }
    }

    /// Bind to `driver`, which is also what a probe would pick.
    pub fn driver(mut self, driver: &str) -> Self {
        self.driver = Some(driver.to_string());
        self.native_driver = Some(driver.to_string());
        self
    }

    pub fn ids(mut self, vendor: &str, device: &str) -> Self {
        self.vendor_id = vendor.to_string();
        self.device_id = device.to_string();
        self
    }

    pub fn class(mut self, class: &str) -> Self {
        self.class = class.to_string();
        self
    }

    pub fn iommu_group(mut self, group: u32) -> Self {
        self.iommu_group = Some(group);
        self
    }

    pub fn boot_vga(mut self) -> Self {
        self.is_boot_vga = true;
        self
    }

    pub fn physfn(mut self, pf: PciAddress) -> Self {
        self.physfn = Some(pf);
        self
    }

    pub fn virtfn(mut self, vf: PciAddress) -> Self {
        self.virtfns.push(vf);
        self
    }

    pub fn without_reset(mut self) -> Self {
        self.reset_supported = false;
        self
    }
}

#[derive(Debug, Default)]
struct FakeState {
    devices: BTreeMap<PciAddress, FakeDevice>,
    /// Registered drivers and their dynamic (vendor, device) IDs.
    drivers: BTreeMap<String, BTreeSet<(String, String)>>,
    failures: Vec<Injected>,
    writes: usize,
    resets: BTreeMap<PciAddress, u32>,
}

impl FakeState {
    fn device(&self, address: &PciAddress) -> Result<&FakeDevice> {
        self.devices.get(address).ok_or(PassthruError::NotFound { address: *address })
    }

    fn device_mut(&mut self, address: &PciAddress) -> Result<&mut FakeDevice> {
        self.devices.get_mut(address).ok_or(PassthruError::NotFound { address: *address })
    }

    fn check_failure(&mut self, address: &PciAddress, operation: SysfsOp) -> Result<()> {
        let Some(pos) = self
            .failures
            .iter()
            .position(|f| f.address == *address && f.operation == operation)
        else {
            return Ok(());
        };

        let entry = &mut self.failures[pos];
        let kind = entry.kind;
        let exhausted = match entry.remaining.as_mut() {
            Some(remaining) => {
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
            None => false,
        };
        if exhausted {
            self.failures.remove(pos);
        }

        Err(match kind {
            FailKind::Busy => PassthruError::Busy { address: *address, operation },
            FailKind::Io => os_error(address, operation, libc::EIO),
        })
    }
}

fn os_error(address: &PciAddress, operation: SysfsOp, errno: i32) -> PassthruError {
    PassthruError::Sysfs {
        address: *address,
        operation,
        path: PathBuf::from("/fake/sys/bus/pci/devices").join(address.to_string()),
        source: io::Error::from_raw_os_error(errno),
    }
}

/// In-memory [`SysfsGateway`].
#[derive(Debug)]
pub struct FakeSysfs {
    state: Mutex<FakeState>,
}

impl Default for FakeSysfs {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSysfs {
    /// A tree with both stub drivers loaded.
    pub fn new() -> Self {
        Self::bare().with_driver("pci-stub").with_driver("vfio-pci")
    }

    /// A tree without any drivers.
    pub fn bare() -> Self {
        Self { state: Mutex::new(FakeState::default()) }
    }

    pub fn with_driver(self, driver: &str) -> Self {
        self.state().drivers.entry(driver.to_string()).or_default();
        self
    }

    pub fn with_device(self, device: FakeDevice) -> Self {
        self.add_device(device);
        self
    }

    /// Hot-plug a device.
    pub fn add_device(&self, device: FakeDevice) {
        let mut state = self.state();
        if let Some(driver) = &device.native_driver {
            state.drivers.entry(driver.clone()).or_default();
        }
        state.devices.insert(device.address, device);
    }

    /// Hot-unplug a device.
    pub fn remove_device(&self, address: &PciAddress) {
        self.state().devices.remove(address);
    }

    /// Fail `operation` on `address`, `times` times or forever.
    pub fn inject_failure(
        &self,
        address: PciAddress,
        operation: SysfsOp,
        kind: FailKind,
        times: Option<u32>,
    ) {
        self.state().failures.push(Injected { address, operation, kind, remaining: times });
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    /// Rebind a device behind the manager's back.
    pub fn force_driver(&self, address: &PciAddress, driver: Option<&str>) {
        if let Some(device) = self.state().devices.get_mut(address) {
            device.driver = driver.map(str::to_string);
        }
    }

    pub fn driver_of(&self, address: &PciAddress) -> Option<String> {
        self.state().devices.get(address).and_then(|d| d.driver.clone())
    }

    pub fn driver_override_of(&self, address: &PciAddress) -> Option<String> {
        self.state().devices.get(address).and_then(|d| d.driver_override.clone())
    }

    pub fn has_dynamic_id(&self, driver: &str, address: &PciAddress) -> bool {
        let state = self.state();
        let Some(device) = state.devices.get(address) else {
            return false;
        };
        state
            .drivers
            .get(driver)
            .is_some_and(|ids| ids.contains(&(device.vendor_id.clone(), device.device_id.clone())))
    }

    /// Number of state-changing control file writes so far.
    pub fn write_count(&self) -> usize {
        self.state().writes
    }

    pub fn reset_count(&self, address: &PciAddress) -> u32 {
        self.state().resets.get(address).copied().unwrap_or(0)
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SysfsGateway for FakeSysfs {
    fn probe(&self, address: &PciAddress) -> Result<DeviceInfo> {
        let mut state = self.state();
        state.check_failure(address, SysfsOp::Probe)?;
        let device = state.device(address)?;

        Ok(DeviceInfo {
            address: *address,
            vendor_id: device.vendor_id.clone(),
            device_id: device.device_id.clone(),
            class: device.class.clone(),
            driver: device.driver.clone(),
            iommu_group: device.iommu_group,
            numa_node: -1,
            is_boot_vga: device.is_boot_vga,
            physfn: device.physfn,
            virtfns: device.virtfns.clone(),
        })
    }

    fn current_driver(&self, address: &PciAddress) -> Result<Option<String>> {
        let mut state = self.state();
        state.check_failure(address, SysfsOp::ReadDriver)?;
        Ok(state.device(address)?.driver.clone())
    }

    fn unbind(&self, address: &PciAddress) -> Result<()> {
        let mut state = self.state();
        state.check_failure(address, SysfsOp::Unbind)?;
        let device = state.device_mut(address)?;
        if device.driver.take().is_some() {
            state.writes += 1;
        }
        Ok(())
    }

    fn bind(&self, address: &PciAddress, driver: &str) -> Result<()> {
        let mut state = self.state();
        state.check_failure(address, SysfsOp::Bind)?;

        let ids = state
            .drivers
            .get(driver)
            .cloned()
            .ok_or_else(|| os_error(address, SysfsOp::Bind, libc::ENOENT))?;
        let device = state.device_mut(address)?;

        if device.driver.as_deref() == Some(driver) {
            return Ok(());
        }
        if device.driver.is_some() {
            return Err(os_error(address, SysfsOp::Bind, libc::ENODEV));
        }

        let overridden = device.driver_override.as_deref();
        if overridden.is_some_and(|o| o != driver) {
            return Err(os_error(address, SysfsOp::Bind, libc::ENODEV));
        }
        let id = (device.vendor_id.clone(), device.device_id.clone());
        if is_stub_driver(driver) && overridden != Some(driver) && !ids.contains(&id) {
            return Err(os_error(address, SysfsOp::Bind, libc::ENODEV));
        }

        device.driver = Some(driver.to_string());
        state.writes += 1;
        Ok(())
    }

    fn set_driver_override(&self, address: &PciAddress, driver: Option<&str>) -> Result<()> {
        let mut state = self.state();
        state.check_failure(address, SysfsOp::DriverOverride)?;
        state.device_mut(address)?.driver_override = driver.map(str::to_string);
        state.writes += 1;
        Ok(())
    }

    fn drivers_probe(&self, address: &PciAddress) -> Result<()> {
        let mut state = self.state();
        state.check_failure(address, SysfsOp::DriversProbe)?;

        let device = state.device(address)?;
        if device.driver.is_some() {
            return Ok(());
        }
        let candidate = device.driver_override.clone().or_else(|| device.native_driver.clone());

        if let Some(driver) = candidate.filter(|d| state.drivers.contains_key(d)) {
            state.device_mut(address)?.driver = Some(driver);
        }
        state.writes += 1;
        Ok(())
    }

    fn add_dynamic_id(&self, address: &PciAddress, driver: &str) -> Result<()> {
        let mut state = self.state();
        state.check_failure(address, SysfsOp::NewId)?;

        let device = state.device(address)?;
        let id = (device.vendor_id.clone(), device.device_id.clone());
        state
            .drivers
            .get_mut(driver)
            .ok_or_else(|| os_error(address, SysfsOp::NewId, libc::ENOENT))?
            .insert(id.clone());

        // The kernel probes unbound devices matching the new ID right away.
        for device in state.devices.values_mut() {
            let matches = (device.vendor_id.clone(), device.device_id.clone()) == id;
            let allowed = device.driver_override.as_deref().map_or(true, |o| o == driver);
            if matches && allowed && device.driver.is_none() {
                device.driver = Some(driver.to_string());
            }
        }
        state.writes += 1;
        Ok(())
    }

    fn remove_dynamic_id(&self, address: &PciAddress, driver: &str) -> Result<()> {
        let mut state = self.state();
        state.check_failure(address, SysfsOp::RemoveId)?;

        let device = state.device(address)?;
        let id = (device.vendor_id.clone(), device.device_id.clone());
        if let Some(ids) = state.drivers.get_mut(driver) {
            ids.remove(&id);
        }
        state.writes += 1;
        Ok(())
    }

    fn reset(&self, address: &PciAddress) -> Result<()> {
        let mut state = self.state();
        state.check_failure(address, SysfsOp::Reset)?;

        if !state.device(address)?.reset_supported {
            return Err(PassthruError::ResetFailed {
                address: *address,
                reason: "device does not support function-level reset".to_string(),
            });
        }
        *state.resets.entry(*address).or_default() += 1;
        Ok(())
    }

    fn iommu_group_members(&self, address: &PciAddress) -> Result<BTreeSet<PciAddress>> {
        let mut state = self.state();
        state.check_failure(address, SysfsOp::IommuGroup)?;

        let Some(group) = state.device(address)?.iommu_group else {
            return Ok(BTreeSet::from([*address]));
        };
        Ok(state
            .devices
            .values()
            .filter(|d| d.iommu_group == Some(group))
            .map(|d| d.address)
            .collect())
    }

    fn list_devices(&self) -> Result<Vec<PciAddress>> {
        Ok(self.state().devices.keys().copied().collect())
    }

    fn driver_exists(&self, driver: &str) -> bool {
        self.state().drivers.contains_key(driver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> PciAddress {
        s.parse().unwrap()
    }

    #[test]
    fn test_stub_requires_id_or_override() {
        let a = addr("0000:00:03.0");
        let fake = FakeSysfs::new().with_device(FakeDevice::new(a));

        assert!(fake.bind(&a, "pci-stub").is_err());
        fake.set_driver_override(&a, Some("pci-stub")).unwrap();
        fake.bind(&a, "pci-stub").unwrap();
        assert_eq!(fake.driver_of(&a).as_deref(), Some("pci-stub"));
    }

    #[test]
    fn test_new_id_autobinds_unbound_devices() {
        let a = addr("0000:00:03.0");
        let b = addr("0000:00:04.0");
        let fake = FakeSysfs::new()
            .with_device(FakeDevice::new(a))
            .with_device(FakeDevice::new(b).driver("e1000e"));

        fake.add_dynamic_id(&a, "pci-stub").unwrap();
        assert_eq!(fake.driver_of(&a).as_deref(), Some("pci-stub"));
        assert_eq!(fake.driver_of(&b).as_deref(), Some("e1000e"));
    }

    #[test]
    fn test_drivers_probe_picks_native_driver() {
        let a = addr("0000:00:01.0");
        let fake = FakeSysfs::new().with_device(FakeDevice::new(a).driver("e1000e"));

        fake.unbind(&a).unwrap();
        assert_eq!(fake.driver_of(&a), None);
        fake.drivers_probe(&a).unwrap();
        assert_eq!(fake.driver_of(&a).as_deref(), Some("e1000e"));
    }

    #[test]
    fn test_injected_failure_expires() {
        let a = addr("0000:00:01.0");
        let fake = FakeSysfs::new().with_device(FakeDevice::new(a).driver("e1000e"));
        fake.inject_failure(a, SysfsOp::Unbind, FailKind::Busy, Some(2));

        assert!(fake.unbind(&a).unwrap_err().is_retryable());
        assert!(fake.unbind(&a).is_err());
        assert!(fake.unbind(&a).is_ok());
    }

    #[test]
    fn test_iommu_group() {
        let fake = FakeSysfs::new()
            .with_device(FakeDevice::new(addr("0000:01:00.0")).iommu_group(4))
            .with_device(FakeDevice::new(addr("0000:01:00.1")).iommu_group(4))
            .with_device(FakeDevice::new(addr("0000:02:00.0")));

        assert_eq!(fake.iommu_group_members(&addr("0000:01:00.1")).unwrap().len(), 2);
        assert_eq!(fake.iommu_group_members(&addr("0000:02:00.0")).unwrap().len(), 1);
    }
}

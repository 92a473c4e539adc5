//! Access to the kernel's PCI device tree.
//!
//! [`SysfsGateway`] is the only place where device state is read from or
//! written to the host. [`FsGateway`] talks to a real (or synthetic) sysfs
//! tree under a configurable root; tests can swap in `FakeSysfs` from
//! `pci::fake` (`test-mock` feature).

use crate::error::{PassthruError, Result, SysfsOp};
use crate::pci::address::PciAddress;
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Default mount point of sysfs.
pub const DEFAULT_SYSFS_ROOT: &str = "/sys";

/// PCI class code prefix of PCI-to-PCI bridges.
const CLASS_PCI_BRIDGE: &str = "0x0604";

/// Static metadata read from a device directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub address: PciAddress,
    /// Vendor ID without `0x` prefix (e.g., "8086")
    pub vendor_id: String,
    /// Device ID without `0x` prefix
    pub device_id: String,
    /// Device class (e.g., "0x020000")
    pub class: String,
    /// Currently bound driver (None if unbound)
    pub driver: Option<String>,
    pub iommu_group: Option<u32>,
    /// NUMA node (-1 if not applicable)
    pub numa_node: i32,
    pub is_boot_vga: bool,
    /// Parent physical function, for SR-IOV virtual functions
    pub physfn: Option<PciAddress>,
    /// Virtual functions, for SR-IOV physical functions
    pub virtfns: Vec<PciAddress>,
}

impl DeviceInfo {
    /// PCI-to-PCI bridges can stay with the host even when the rest of their
    /// IOMMU group is handed out.
    pub fn is_bridge(&self) -> bool {
        self.class.starts_with(CLASS_PCI_BRIDGE)
    }

    pub fn is_virtual_function(&self) -> bool {
        self.physfn.is_some()
    }
}

/// Operations on the host PCI tree.
///
/// `unbind` and `bind` are idempotent: unbinding a driverless device, or
/// binding a device to the driver it already has, succeeds.
pub trait SysfsGateway: Send + Sync + fmt::Debug {
    /// Read device metadata. Fails with `NotFound` if the device is absent.
    fn probe(&self, address: &PciAddress) -> Result<DeviceInfo>;

    /// Name of the driver the device is bound to, if any.
    fn current_driver(&self, address: &PciAddress) -> Result<Option<String>>;

    /// Detach the device from whatever driver it has.
    fn unbind(&self, address: &PciAddress) -> Result<()>;

    /// Attach the device to `driver`.
    fn bind(&self, address: &PciAddress, driver: &str) -> Result<()>;

    /// Set or clear (`None`) the device's `driver_override`.
    fn set_driver_override(&self, address: &PciAddress, driver: Option<&str>) -> Result<()>;

    /// Ask the kernel to pick a driver for an unbound device.
    fn drivers_probe(&self, address: &PciAddress) -> Result<()>;

    /// Register the device's vendor/device pair with `driver`.
    fn add_dynamic_id(&self, address: &PciAddress, driver: &str) -> Result<()>;

    /// Remove a pair registered with [`add_dynamic_id`](Self::add_dynamic_id).
    fn remove_dynamic_id(&self, address: &PciAddress, driver: &str) -> Result<()>;

    /// Issue a function-level reset.
    fn reset(&self, address: &PciAddress) -> Result<()>;

    /// Every device sharing the IOMMU group of `address`, `address` included.
    /// Devices without an IOMMU group form a group of one.
    fn iommu_group_members(&self, address: &PciAddress) -> Result<BTreeSet<PciAddress>>;

    /// All PCI devices present on the host, sorted.
    fn list_devices(&self) -> Result<Vec<PciAddress>>;

    /// Whether `driver` is registered with the PCI bus.
    fn driver_exists(&self, driver: &str) -> bool;
}

/// Retry policy for writes answered with `EBUSY`.
#[derive(Debug, Clone, Copy)]
pub struct BusyPolicy {
    pub retries: u32,
    pub delay: Duration,
}

impl Default for BusyPolicy {
    fn default() -> Self {
        Self { retries: 3, delay: Duration::from_millis(100) }
    }
}

/// Sysfs gateway backed by the filesystem.
#[derive(Debug, Clone)]
pub struct FsGateway {
    root: PathBuf,
    busy: BusyPolicy,
}

impl Default for FsGateway {
    fn default() -> Self {
        Self::new(DEFAULT_SYSFS_ROOT)
    }
}

impl FsGateway {
    /// Create a gateway rooted at `root` (normally `/sys`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), busy: BusyPolicy::default() }
    }

    pub fn with_busy_policy(mut self, busy: BusyPolicy) -> Self {
        self.busy = busy;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn devices_dir(&self) -> PathBuf {
        self.root.join("bus/pci/devices")
    }

    fn device_dir(&self, address: &PciAddress) -> PathBuf {
        self.devices_dir().join(address.to_string())
    }

    fn driver_dir(&self, driver: &str) -> PathBuf {
        self.root.join("bus/pci/drivers").join(driver)
    }

    /// Device directory, or `NotFound` if the device does not exist.
    fn existing_device_dir(&self, address: &PciAddress) -> Result<PathBuf> {
        let path = self.device_dir(address);
        if !path.exists() {
            return Err(PassthruError::NotFound { address: *address });
        }
        Ok(path)
    }

    /// Write a control file, retrying while the kernel reports `EBUSY`.
    fn write_control(
        &self,
        address: &PciAddress,
        operation: SysfsOp,
        path: &Path,
        value: &str,
    ) -> Result<()> {
        let mut attempt = 0;
        loop {
            match fs::write(path, value) {
                Ok(()) => return Ok(()),
                Err(e) if is_busy(&e) => {
                    if attempt >= self.busy.retries {
                        warn!(
                            address = %address,
                            operation = %operation,
                            attempts = attempt + 1,
                            "Device still busy, giving up"
                        );
                        return Err(PassthruError::Busy { address: *address, operation });
                    }
                    attempt += 1;
                    debug!(address = %address, operation = %operation, attempt, "Device busy, retrying");
                    thread::sleep(self.busy.delay);
                }
                Err(e) => {
                    return Err(PassthruError::Sysfs {
                        address: *address,
                        operation,
                        path: path.to_path_buf(),
                        source: e,
                    })
                }
            }
        }
    }

    fn read_attr(&self, address: &PciAddress, path: &Path) -> Result<String> {
        fs::read_to_string(path).map(|s| s.trim().to_string()).map_err(|e| PassthruError::Sysfs {
            address: *address,
            operation: SysfsOp::Probe,
            path: path.to_path_buf(),
            source: e,
        })
    }

    fn read_id_pair(&self, address: &PciAddress) -> Result<(String, String)> {
        let dir = self.existing_device_dir(address)?;
        let vendor = self.read_attr(address, &dir.join("vendor"))?;
        let device = self.read_attr(address, &dir.join("device"))?;
        Ok((normalize_id(&vendor), normalize_id(&device)))
    }
}

impl SysfsGateway for FsGateway {
    fn probe(&self, address: &PciAddress) -> Result<DeviceInfo> {
        let dir = self.existing_device_dir(address)?;

        let (vendor_id, device_id) = self.read_id_pair(address)?;
        let class = self.read_attr(address, &dir.join("class"))?;

        let driver = read_link_name(&dir.join("driver"));
        let iommu_group = read_link_name(&dir.join("iommu_group")).and_then(|g| g.parse().ok());
        let numa_node = fs::read_to_string(dir.join("numa_node"))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(-1);
        let is_boot_vga =
            fs::read_to_string(dir.join("boot_vga")).ok().is_some_and(|s| s.trim() == "1");
        let physfn = read_link_name(&dir.join("physfn")).and_then(|n| n.parse().ok());
        let virtfns = read_virtfns(&dir);

        debug!(
            address = %address,
            vendor = %vendor_id,
            device = %device_id,
            driver = ?driver,
            iommu_group = ?iommu_group,
            "Read PCI device info"
        );

        Ok(DeviceInfo {
            address: *address,
            vendor_id,
            device_id,
            class,
            driver,
            iommu_group,
            numa_node,
            is_boot_vga,
            physfn,
            virtfns,
        })
    }

    fn current_driver(&self, address: &PciAddress) -> Result<Option<String>> {
        let dir = self.existing_device_dir(address)?;
        Ok(read_link_name(&dir.join("driver")))
    }

    fn unbind(&self, address: &PciAddress) -> Result<()> {
        let Some(driver) = self.current_driver(address)? else {
            debug!(address = %address, "Device has no driver, nothing to unbind");
            return Ok(());
        };

        let unbind_path = self.driver_dir(&driver).join("unbind");
        debug!(address = %address, driver = %driver, "Unbinding from driver");
        self.write_control(address, SysfsOp::Unbind, &unbind_path, &address.to_string())
    }

    fn bind(&self, address: &PciAddress, driver: &str) -> Result<()> {
        let current = self.current_driver(address)?;
        if current.as_deref() == Some(driver) {
            debug!(address = %address, driver = %driver, "Device already bound");
            return Ok(());
        }

        let bind_path = self.driver_dir(driver).join("bind");
        debug!(address = %address, driver = %driver, "Binding to driver");

        match self.write_control(address, SysfsOp::Bind, &bind_path, &address.to_string()) {
            Ok(()) => Ok(()),
            Err(e) => {
                // The kernel may have bound the device on its own after new_id
                // or driver_override; the write then fails although the goal is met.
                if self.current_driver(address)?.as_deref() == Some(driver) {
                    debug!(address = %address, driver = %driver, error = %e, "Device auto-bound");
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    fn set_driver_override(&self, address: &PciAddress, driver: Option<&str>) -> Result<()> {
        let path = self.existing_device_dir(address)?.join("driver_override");
        // An empty write clears the override.
        let value = driver.unwrap_or("\n");
        debug!(address = %address, driver = ?driver, "Setting driver_override");
        self.write_control(address, SysfsOp::DriverOverride, &path, value)
    }

    fn drivers_probe(&self, address: &PciAddress) -> Result<()> {
        let path = self.root.join("bus/pci/drivers_probe");
        debug!(address = %address, "Triggering driver probe");
        self.write_control(address, SysfsOp::DriversProbe, &path, &address.to_string())
    }

    fn add_dynamic_id(&self, address: &PciAddress, driver: &str) -> Result<()> {
        let (vendor, device) = self.read_id_pair(address)?;
        let path = self.driver_dir(driver).join("new_id");
        let id_string = format!("{} {}", vendor, device);

        debug!(address = %address, driver = %driver, id = %id_string, "Registering device ID");

        match self.write_control(address, SysfsOp::NewId, &path, &id_string) {
            // EEXIST: the ID is already registered.
            Err(PassthruError::Sysfs { source, .. })
                if source.raw_os_error() == Some(libc::EEXIST) =>
            {
                debug!(driver = %driver, "Device ID already registered");
                Ok(())
            }
            other => other,
        }
    }

    fn remove_dynamic_id(&self, address: &PciAddress, driver: &str) -> Result<()> {
        let (vendor, device) = self.read_id_pair(address)?;
        let path = self.driver_dir(driver).join("remove_id");
        let id_string = format!("{} {}", vendor, device);

        debug!(address = %address, driver = %driver, id = %id_string, "Removing device ID");

        match self.write_control(address, SysfsOp::RemoveId, &path, &id_string) {
            // ENODEV: the ID was never registered.
            Err(PassthruError::Sysfs { source, .. })
                if source.raw_os_error() == Some(libc::ENODEV) =>
            {
                Ok(())
            }
            other => other,
        }
    }

    fn reset(&self, address: &PciAddress) -> Result<()> {
        let path = self.existing_device_dir(address)?.join("reset");
        if !path.exists() {
            return Err(PassthruError::ResetFailed {
                address: *address,
                reason: "device does not support function-level reset".to_string(),
            });
        }
        debug!(address = %address, "Resetting device");
        self.write_control(address, SysfsOp::Reset, &path, "1")
    }

    fn iommu_group_members(&self, address: &PciAddress) -> Result<BTreeSet<PciAddress>> {
        let dir = self.existing_device_dir(address)?;
        let group_devices = dir.join("iommu_group/devices");

        let mut members = BTreeSet::new();
        members.insert(*address);

        if !group_devices.exists() {
            return Ok(members);
        }

        let entries = fs::read_dir(&group_devices).map_err(|e| PassthruError::Sysfs {
            address: *address,
            operation: SysfsOp::IommuGroup,
            path: group_devices.clone(),
            source: e,
        })?;

        for entry in entries.flatten() {
            if let Some(member) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                members.insert(member);
            }
        }

        debug!(address = %address, members = ?members, "Read IOMMU group");
        Ok(members)
    }

    fn list_devices(&self) -> Result<Vec<PciAddress>> {
        let dir = self.devices_dir();
        let entries = fs::read_dir(&dir)
            .map_err(|e| PassthruError::IoError { path: dir.clone(), source: e })?;

        let mut devices: Vec<PciAddress> = entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_str().and_then(|n| n.parse().ok()))
            .collect();
        devices.sort();
        Ok(devices)
    }

    fn driver_exists(&self, driver: &str) -> bool {
        self.driver_dir(driver).exists()
    }
}

fn is_busy(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EBUSY)
}

/// "0x8086\n" -> "8086"
fn normalize_id(raw: &str) -> String {
    raw.trim().trim_start_matches("0x").to_lowercase()
}

/// Final path component of a symlink target, e.g. the driver name.
fn read_link_name(link: &Path) -> Option<String> {
    fs::read_link(link)
        .ok()
        .and_then(|target| target.file_name().map(|n| n.to_string_lossy().to_string()))
}

fn read_virtfns(device_dir: &Path) -> Vec<PciAddress> {
    let Ok(entries) = fs::read_dir(device_dir) else {
        return Vec::new();
    };

    let mut virtfns: Vec<PciAddress> = entries
        .flatten()
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("virtfn"))
        .filter_map(|entry| read_link_name(&entry.path()).and_then(|n| n.parse().ok()))
        .collect();
    virtfns.sort();
    virtfns
}

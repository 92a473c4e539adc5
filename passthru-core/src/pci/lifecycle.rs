//! Detach and reattach of PCI devices.
//!
//! All operations take the [`DeviceTables`] explicitly; callers are expected
//! to hold the tables' lock for the whole call (see
//! [`DeviceManager`](super::manager::DeviceManager)).
//!
//! # Flow
//!
//! ```text
//!   host driver ──detach──▶ inactive ──assign──▶ active
//!        ▲                     │  ◀──release──     │
//!        └──────reattach───────┴───────────────────┘
//! ```

use crate::error::{PassthruError, Result};
use crate::observability::metrics;
use crate::pci::address::PciAddress;
use crate::pci::device::{PciDevice, ResetPolicy};
use crate::pci::list::{DeviceTables, ListKind};
use crate::pci::stub::{StubBinder, StubDriver};
use crate::pci::sysfs::SysfsGateway;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Host-wide lifecycle settings.
#[derive(Debug, Clone, Default)]
pub struct LifecycleOptions {
    pub stub: StubDriver,
    /// Detach every member of the IOMMU group together.
    pub group_detach: bool,
    /// Reset policy given to newly detached devices.
    pub reset_policy: ResetPolicy,
}

/// Per-request detach options.
#[derive(Debug, Clone, Default)]
pub struct DetachOptions {
    /// Allow detaching the boot VGA device (dangerous - can hang the host)
    pub force_boot_vga: bool,
}

/// Drives devices between the host, the inactive list and the active list.
#[derive(Debug, Clone)]
pub struct LifecycleManager {
    gateway: Arc<dyn SysfsGateway>,
    binder: StubBinder,
    options: LifecycleOptions,
}

impl LifecycleManager {
    pub fn new(gateway: Arc<dyn SysfsGateway>, options: LifecycleOptions) -> Self {
        let binder = StubBinder::new(gateway.clone(), options.stub);
        Self { gateway, binder, options }
    }

    pub fn options(&self) -> &LifecycleOptions {
        &self.options
    }

    pub fn binder(&self) -> &StubBinder {
        &self.binder
    }

    /// Take a device away from the host and park it in the inactive list.
    ///
    /// Repeating the call for a device already in the inactive list is a
    /// no-op. With group detach enabled, the whole IOMMU group is bound to the
    /// stub or none of it is.
    pub fn detach(
        &self,
        address: &PciAddress,
        tables: &mut DeviceTables,
        opts: &DetachOptions,
    ) -> Result<()> {
        self.detach_journaled(address, tables, opts, |_| Ok(()))
    }

    /// [`detach`](Self::detach) with a write-ahead step.
    ///
    /// Before the first sysfs write the devices about to move are placed in
    /// `tables.pending` with their original driver recorded, and `journal`
    /// is called with the tables. If `journal` fails nothing is touched.
    /// `pending` is empty again when this returns.
    #[instrument(skip(self, tables, opts, journal), fields(address = %address))]
    pub fn detach_journaled(
        &self,
        address: &PciAddress,
        tables: &mut DeviceTables,
        opts: &DetachOptions,
        journal: impl FnOnce(&DeviceTables) -> Result<()>,
    ) -> Result<()> {
        match tables.locate(address)? {
            Some(ListKind::Active) => {
                let used_by = tables.active.get(address).and_then(|d| d.used_by().map(String::from));
                return Err(PassthruError::AlreadyAssigned { address: *address, used_by });
            }
            Some(ListKind::Inactive) => {
                if tables.inactive.get(address).is_some_and(PciDevice::is_managed) {
                    debug!("Device already detached");
                    return Ok(());
                }
                return Err(PassthruError::ConsistencyViolation {
                    reason: format!("device {} is in the inactive list but not managed", address),
                });
            }
            None => {}
        }

        let mut targets = self.detach_targets(address, tables, opts)?;
        for device in &mut targets {
            self.binder.record_original(device)?;
            device.set_reset_policy(self.options.reset_policy);
        }

        tables.pending = targets.clone();
        if let Err(e) = journal(&*tables) {
            tables.pending.clear();
            warn!(error = %e, "Could not record detach intent, leaving device with the host");
            return Err(e);
        }

        let result = self.bind_targets(address, targets, tables);
        tables.pending.clear();
        result
    }

    fn bind_targets(
        &self,
        address: &PciAddress,
        targets: Vec<PciDevice>,
        tables: &mut DeviceTables,
    ) -> Result<()> {
        let grouped = targets.len() > 1;

        let mut bound: Vec<PciDevice> = Vec::with_capacity(targets.len());
        for mut device in targets {
            if let Err(e) = self.binder.ensure_stub(&mut device) {
                self.rollback(&mut bound);
                if !grouped {
                    return Err(e);
                }
                return Err(PassthruError::GroupPartialFailure {
                    address: *address,
                    member: *device.address(),
                    reason: e.to_string(),
                });
            }
            bound.push(device);
        }

        for mut device in bound {
            device.set_managed(true);
            tables.released.remove(device.address());
            info!(
                address = %device.address(),
                original = ?device.original_driver(),
                stub = %self.options.stub,
                "Device detached from host"
            );
            tables.inactive.add(device)?;
        }

        metrics::record_detach(self.options.stub.name());
        Ok(())
    }

    /// Return devices detached by the last call to their original drivers
    /// and drop them from the inactive list, newest first.
    ///
    /// A device that cannot be returned stays in the inactive list so it is
    /// not lost.
    pub fn undo_detach(&self, addresses: &[PciAddress], tables: &mut DeviceTables) {
        for address in addresses.iter().rev() {
            let Some(mut device) = tables.inactive.take(address) else {
                continue;
            };
            match self.binder.release_stub(&mut device) {
                Ok(()) => info!(address = %address, "Detach undone"),
                Err(e) => {
                    error!(
                        address = %address,
                        error = %e,
                        "Could not undo detach, device stays on stub"
                    );
                    device.set_stub_driver(Some(self.options.stub));
                    if let Err(e) = tables.inactive.add(device) {
                        error!(address = %address, error = %e, "Lost track of device");
                    }
                }
            }
        }
    }

    /// Give a device back to the host driver it had before its first detach.
    ///
    /// On a binder failure the device stays where it was, flagged as pending
    /// reattach, and the call can be retried. Repeating a completed reattach
    /// succeeds as long as the device is no longer stub-bound.
    #[instrument(skip(self, tables), fields(address = %address))]
    pub fn reattach(&self, address: &PciAddress, tables: &mut DeviceTables) -> Result<()> {
        let Some(kind) = tables.locate(address)? else {
            if tables.released.contains(address) && !self.binder.is_stub_bound(address)? {
                debug!("Device already reattached");
                return Ok(());
            }
            return Err(PassthruError::NotManaged { address: *address });
        };

        let device = tables.list_mut(kind).get_mut(address).ok_or_else(|| {
            PassthruError::Internal(format!("device {} vanished from {} list", address, kind))
        })?;

        if device.is_managed() {
            device.set_pending_reattach(true);
            self.binder.unbind_stub(device)?;
            self.apply_reset(device);
            self.binder.restore_original(device)?;
        } else {
            debug!(list = %kind, "Device was never bound to a stub, dropping it");
        }

        let mut device = tables.list_mut(kind).take(address).ok_or_else(|| {
            PassthruError::Internal(format!("device {} vanished from {} list", address, kind))
        })?;
        device.clear_management();
        tables.released.insert(*address);

        info!(list = %kind, driver = ?device.original_driver(), "Device reattached to host");
        metrics::record_reattach();
        Ok(())
    }

    /// Hand an inactive device to `consumer`, moving it to the active list.
    #[instrument(skip(self, tables), fields(address = %address))]
    pub fn assign(&self, address: &PciAddress, consumer: &str, tables: &mut DeviceTables) -> Result<()> {
        match tables.locate(address)? {
            None => return Err(PassthruError::NotManaged { address: *address }),
            Some(ListKind::Active) => {
                let used_by = tables
                    .active
                    .get(address)
                    .and_then(|d| d.used_by().map(String::from))
                    .unwrap_or_else(|| "another guest".to_string());
                return Err(PassthruError::InUse { address: *address, used_by });
            }
            Some(ListKind::Inactive) => {}
        }

        let device = tables.inactive.get(address).ok_or_else(|| {
            PassthruError::Internal(format!("device {} vanished from inactive list", address))
        })?;
        if let Some(used_by) = device.used_by() {
            return Err(PassthruError::InUse { address: *address, used_by: used_by.to_string() });
        }
        if !device.is_managed() {
            return Err(PassthruError::NotManaged { address: *address });
        }
        self.apply_reset(device);

        let mut device = tables.inactive.take(address).ok_or_else(|| {
            PassthruError::Internal(format!("device {} vanished from inactive list", address))
        })?;
        device.set_used_by(Some(consumer.to_string()));
        tables.active.add(device)?;

        info!(consumer = %consumer, "Device assigned");
        Ok(())
    }

    /// Take a device back from its guest into the inactive list.
    #[instrument(skip(self, tables), fields(address = %address))]
    pub fn release(&self, address: &PciAddress, tables: &mut DeviceTables) -> Result<()> {
        match tables.locate(address)? {
            None => return Err(PassthruError::NotManaged { address: *address }),
            Some(ListKind::Inactive) => {
                debug!("Device already released");
                return Ok(());
            }
            Some(ListKind::Active) => {}
        }

        let mut device = tables.active.take(address).ok_or_else(|| {
            PassthruError::Internal(format!("device {} vanished from active list", address))
        })?;
        let consumer = device.used_by().map(String::from);
        device.set_used_by(None);
        tables.inactive.add(device)?;

        info!(consumer = ?consumer, "Device released");
        Ok(())
    }

    /// The requested device first, then group siblings that still belong to
    /// the host.
    fn detach_targets(
        &self,
        address: &PciAddress,
        tables: &DeviceTables,
        opts: &DetachOptions,
    ) -> Result<Vec<PciDevice>> {
        let requested = PciDevice::probe(self.gateway.as_ref(), address)?;
        check_boot_vga(&requested, opts)?;

        let mut targets = vec![requested];
        if !self.options.group_detach {
            return Ok(targets);
        }

        let members = self.gateway.iommu_group_members(address)?;
        for member in members.into_iter().filter(|m| m != address) {
            match tables.locate(&member)? {
                Some(ListKind::Active) => {
                    return Err(PassthruError::GroupPartialFailure {
                        address: *address,
                        member,
                        reason: "group member is assigned to a guest".to_string(),
                    });
                }
                Some(ListKind::Inactive) => continue,
                None => {}
            }

            let info = self.gateway.probe(&member).map_err(|e| {
                PassthruError::GroupPartialFailure {
                    address: *address,
                    member,
                    reason: e.to_string(),
                }
            })?;
            if info.is_bridge() {
                debug!(member = %member, "Leaving PCI bridge with the host");
                continue;
            }

            let device = PciDevice::from_info(info);
            check_boot_vga(&device, opts)?;
            targets.push(device);
        }

        debug!(targets = targets.len(), "Detaching IOMMU group");
        Ok(targets)
    }

    /// Return already bound group members to their drivers, newest first.
    fn rollback(&self, bound: &mut Vec<PciDevice>) {
        while let Some(mut device) = bound.pop() {
            match self.binder.release_stub(&mut device) {
                Ok(()) => debug!(address = %device.address(), "Rolled back stub binding"),
                Err(e) => error!(
                    address = %device.address(),
                    error = %e,
                    "Rollback failed, device left on stub driver"
                ),
            }
        }
    }

    /// Best-effort reset according to the device's policy.
    fn apply_reset(&self, device: &PciDevice) -> bool {
        let address = device.address();
        let wanted = match device.reset_policy() {
            ResetPolicy::Always => true,
            ResetPolicy::Never => false,
            ResetPolicy::AvoidIfSharedBus => match self.gateway.list_devices() {
                Ok(all) => !all.iter().any(|other| other != address && other.shares_bus_with(address)),
                Err(e) => {
                    warn!(address = %address, error = %e, "Cannot list bus, skipping reset");
                    false
                }
            },
        };

        if !wanted {
            debug!(address = %address, policy = %device.reset_policy(), "Skipping reset");
            return false;
        }

        match self.gateway.reset(address) {
            Ok(()) => {
                debug!(address = %address, "Device reset");
                true
            }
            Err(e) => {
                warn!(address = %address, error = %e, "Device reset failed, continuing");
                metrics::record_reset_failure();
                false
            }
        }
    }
}

fn check_boot_vga(device: &PciDevice, opts: &DetachOptions) -> Result<()> {
    if device.is_boot_vga() && !opts.force_boot_vga {
        return Err(PassthruError::BindFailed {
            address: *device.address(),
            driver: "stub".to_string(),
            reason: "device is the boot VGA device driving the host display; \
                     use --force to detach it anyway"
                .to_string(),
        });
    }
    Ok(())
}

//! Caller-facing entry point.
//!
//! Owns the active/inactive tables behind a single lock, so every operation
//! is serialized against every other one, and writes the ledger after each
//! change. Detach also writes its intent before touching sysfs.

use crate::config::PassthruConfig;
use crate::error::{PassthruError, Result};
use crate::observability::metrics;
use crate::pci::address::PciAddress;
use crate::pci::device::PciDevice;
use crate::pci::lifecycle::{DetachOptions, LifecycleManager, LifecycleOptions};
use crate::pci::list::{DeviceTables, ListKind};
use crate::pci::sysfs::{DeviceInfo, FsGateway, SysfsGateway};
use crate::state::{self, RescanReport, StateStore};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Thread-safe device manager.
#[derive(Debug)]
pub struct DeviceManager {
    lifecycle: LifecycleManager,
    gateway: Arc<dyn SysfsGateway>,
    tables: Mutex<DeviceTables>,
    store: Option<StateStore>,
    /// What reconciliation changed when the ledger was loaded.
    startup_report: RescanReport,
}

impl DeviceManager {
    /// Manager with empty tables and no ledger file.
    pub fn new(gateway: Arc<dyn SysfsGateway>, options: LifecycleOptions) -> Self {
        Self {
            lifecycle: LifecycleManager::new(gateway.clone(), options),
            gateway,
            tables: Mutex::new(DeviceTables::new()),
            store: None,
            startup_report: RescanReport::default(),
        }
    }

    /// Persist the tables to `store` after every change.
    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Open the manager described by `config` against the real sysfs tree.
    pub fn open(config: &PassthruConfig) -> Result<Self> {
        let gateway = FsGateway::new(&config.sysfs_root).with_busy_policy(config.busy_policy());
        let store = config.persist_state.then(|| StateStore::new(&config.state_file));
        Self::open_with_gateway(Arc::new(gateway), config.lifecycle_options(), store)
    }

    /// Open with an explicit gateway, restoring the ledger in `store` when
    /// there is one and reconciling it with sysfs.
    pub fn open_with_gateway(
        gateway: Arc<dyn SysfsGateway>,
        options: LifecycleOptions,
        store: Option<StateStore>,
    ) -> Result<Self> {
        let stub = options.stub;
        if !gateway.driver_exists(stub.name()) {
            warn!(stub = %stub, "Stub driver is not loaded; detach will fail until it is");
        }

        let mut tables = match &store {
            Some(store) => store.load()?.unwrap_or_default(),
            None => DeviceTables::new(),
        };
        // Runs without a ledger too, so stub-bound strays are still reported.
        let report = state::reconcile(&mut tables, gateway.as_ref())?;
        if !report.is_clean() {
            info!(
                missing = report.missing.len(),
                returned = report.returned.len(),
                orphaned = report.orphaned.len(),
                recovered = report.recovered.len(),
                "Ledger differed from host"
            );
        }

        let mut manager = Self::new(gateway, options);
        manager.tables = Mutex::new(tables);
        manager.startup_report = report;
        manager.store = store;

        let tables = manager.tables();
        if manager.write_ledger(&tables).is_err() {
            warn!("Device ledger is not writable; detach requests will be refused");
        }
        update_gauges(&tables);
        drop(tables);
        Ok(manager)
    }

    pub fn startup_report(&self) -> &RescanReport {
        &self.startup_report
    }

    pub fn gateway(&self) -> &Arc<dyn SysfsGateway> {
        &self.gateway
    }

    pub fn options(&self) -> &LifecycleOptions {
        self.lifecycle.options()
    }

    /// Detach a device from the host.
    pub fn request_detach(&self, address: &PciAddress) -> Result<()> {
        self.request_detach_with(address, &DetachOptions::default())
    }

    /// Detach with per-request options.
    ///
    /// The ledger is written before the first sysfs write and again once the
    /// device is on the stub. If either write fails the device is left with,
    /// or returned to, its host driver and the error is returned.
    pub fn request_detach_with(&self, address: &PciAddress, opts: &DetachOptions) -> Result<()> {
        self.run("detach", OnLedgerFailure::UndoDetach, |tables| {
            let mut journaled = false;
            let result = self.lifecycle.detach_journaled(address, tables, opts, |intent| {
                self.write_ledger(intent)?;
                journaled = true;
                Ok(())
            });
            if result.is_err() && journaled {
                // Drop the intent of the failed attempt from disk.
                let _ = self.write_ledger(tables);
            }
            result
        })
    }

    /// Return a device to its original host driver.
    pub fn request_reattach(&self, address: &PciAddress) -> Result<()> {
        self.run("reattach", OnLedgerFailure::Keep, |tables| {
            self.lifecycle.reattach(address, tables)
        })
    }

    /// Assign an inactive device to `consumer`.
    pub fn assign(&self, address: &PciAddress, consumer: &str) -> Result<()> {
        self.run("assign", OnLedgerFailure::Revert, |tables| {
            self.lifecycle.assign(address, consumer, tables)
        })
    }

    /// Take a device back from its consumer.
    pub fn release(&self, address: &PciAddress) -> Result<()> {
        self.run("release", OnLedgerFailure::Revert, |tables| {
            self.lifecycle.release(address, tables)
        })
    }

    /// Reconcile the tables with what sysfs currently reports.
    pub fn rescan(&self) -> Result<RescanReport> {
        self.run("rescan", OnLedgerFailure::Keep, |tables| {
            state::reconcile(tables, self.gateway.as_ref())
        })
    }

    /// Addresses assigned to guests, in assignment order.
    pub fn list_active(&self) -> Vec<PciAddress> {
        self.tables().active.addresses()
    }

    /// Addresses detached but unassigned, in detach order.
    pub fn list_inactive(&self) -> Vec<PciAddress> {
        self.tables().inactive.addresses()
    }

    /// Managed device records of one list.
    pub fn devices(&self, kind: ListKind) -> Vec<PciDevice> {
        self.tables().list(kind).iter().cloned().collect()
    }

    /// The managed record for `address`, if it is in either list.
    pub fn device(&self, address: &PciAddress) -> Option<PciDevice> {
        self.tables().device(address).cloned()
    }

    pub fn snapshot(&self) -> DeviceTables {
        self.tables().clone()
    }

    /// Live sysfs view of one device.
    pub fn info(&self, address: &PciAddress) -> Result<DeviceInfo> {
        self.gateway.probe(address)
    }

    /// Live sysfs view of every PCI device on the host.
    pub fn host_devices(&self) -> Result<Vec<DeviceInfo>> {
        self.gateway
            .list_devices()?
            .iter()
            .map(|address| self.gateway.probe(address))
            .collect()
    }

    fn run<T>(
        &self,
        operation: &'static str,
        on_ledger_failure: OnLedgerFailure,
        f: impl FnOnce(&mut DeviceTables) -> Result<T>,
    ) -> Result<T> {
        let mut tables = self.tables();
        let before = tables.clone();
        let mut result = f(&mut tables);

        if *tables != before {
            if let Err(e) = self.write_ledger(&tables) {
                match on_ledger_failure {
                    OnLedgerFailure::Keep => {
                        warn!(operation, "Change applied but not recorded; a rescan repairs the ledger");
                    }
                    OnLedgerFailure::Revert => {
                        *tables = before;
                        result = Err(e);
                    }
                    OnLedgerFailure::UndoDetach => {
                        self.undo_detach(&before, &mut tables);
                        result = Err(e);
                    }
                }
            }
            update_gauges(&tables);
        }

        if let Err(e) = &result {
            debug!(operation, kind = e.kind(), error = %e, "Operation failed");
            metrics::record_failure(operation, e.kind());
            if matches!(e, PassthruError::ConsistencyViolation { .. }) {
                error!(operation, error = %e, "Device tables are inconsistent");
            }
        }
        result
    }

    /// Hand devices added to the inactive list since `before` back to the
    /// host. The intent already on disk covers any device that stays behind.
    fn undo_detach(&self, before: &DeviceTables, tables: &mut DeviceTables) {
        let added: Vec<PciAddress> = tables
            .inactive
            .addresses()
            .into_iter()
            .filter(|a| !before.inactive.contains(a))
            .collect();
        self.lifecycle.undo_detach(&added, tables);

        for address in &added {
            if !tables.inactive.contains(address) && before.released.contains(address) {
                tables.released.insert(*address);
            }
        }
    }

    /// Write the tables to the ledger, if there is one.
    fn write_ledger(&self, tables: &DeviceTables) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        store.save(tables).map_err(|e| {
            error!(path = %store.path().display(), error = %e, "Failed to write device ledger");
            metrics::record_persist_failure();
            e
        })
    }

    // Every lifecycle error path leaves the tables valid, so a poisoned lock
    // still guards usable data.
    fn tables(&self) -> MutexGuard<'_, DeviceTables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// What to do when the ledger cannot be written after a change.
#[derive(Debug, Clone, Copy)]
enum OnLedgerFailure {
    /// Keep the change; reconciling against sysfs reproduces it.
    Keep,
    /// Undo the change in memory and fail. Only for changes with no host
    /// side effects.
    Revert,
    /// Return freshly detached devices to their host drivers and fail.
    UndoDetach,
}

fn update_gauges(tables: &DeviceTables) {
    metrics::set_device_count("active", tables.active.len());
    metrics::set_device_count("inactive", tables.inactive.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pci::fake::{FakeDevice, FakeSysfs};
    use std::thread;
    use tempfile::TempDir;

    fn addr(s: &str) -> PciAddress {
        s.parse().unwrap()
    }

    fn host() -> Arc<FakeSysfs> {
        Arc::new(
            FakeSysfs::new()
                .with_device(FakeDevice::new(addr("0000:00:00.1")).driver("e1000e"))
                .with_device(FakeDevice::new(addr("0000:00:00.3")).driver("ahci")),
        )
    }

    #[test]
    fn test_list_order() {
        let manager = DeviceManager::new(host(), LifecycleOptions::default());
        manager.request_detach(&addr("0000:00:00.3")).unwrap();
        manager.request_detach(&addr("0000:00:00.1")).unwrap();

        assert_eq!(manager.list_inactive(), vec![addr("0000:00:00.3"), addr("0000:00:00.1")]);
        assert!(manager.list_active().is_empty());

        manager.assign(&addr("0000:00:00.1"), "vm-1").unwrap();
        assert_eq!(manager.list_active(), vec![addr("0000:00:00.1")]);
        assert_eq!(manager.device(&addr("0000:00:00.1")).unwrap().used_by(), Some("vm-1"));
    }

    #[test]
    fn test_concurrent_requests_keep_tables_consistent() {
        let fake = host();
        let manager = Arc::new(DeviceManager::new(fake.clone(), LifecycleOptions::default()));
        let a = addr("0000:00:00.1");

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let manager = manager.clone();
                thread::spawn(move || {
                    for _ in 0..20 {
                        if i % 2 == 0 {
                            let _ = manager.request_detach(&a);
                        } else {
                            let _ = manager.request_reattach(&a);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let tables = manager.snapshot();
        tables.check_consistency().unwrap();
        match tables.locate(&a).unwrap() {
            Some(ListKind::Inactive) => assert_eq!(fake.driver_of(&a).as_deref(), Some("vfio-pci")),
            None => assert_eq!(fake.driver_of(&a).as_deref(), Some("e1000e")),
            Some(ListKind::Active) => panic!("nothing assigns in this test"),
        }
    }

    #[test]
    fn test_ledger_survives_restart() {
        let fake = host();
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("devices.json");
        let a = addr("0000:00:00.1");

        let manager = DeviceManager::open_with_gateway(
            fake.clone(),
            LifecycleOptions::default(),
            Some(StateStore::new(&path)),
        )
        .unwrap();
        manager.request_detach(&a).unwrap();
        drop(manager);

        let manager = DeviceManager::open_with_gateway(
            fake.clone(),
            LifecycleOptions::default(),
            Some(StateStore::new(&path)),
        )
        .unwrap();
        assert_eq!(manager.list_inactive(), vec![a]);
        assert_eq!(manager.device(&a).unwrap().original_driver(), Some("e1000e"));

        manager.request_reattach(&a).unwrap();
        assert_eq!(fake.driver_of(&a).as_deref(), Some("e1000e"));
    }

    #[test]
    fn test_startup_report() {
        let fake = host();
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("devices.json");
        let a = addr("0000:00:00.3");

        let manager = DeviceManager::new(fake.clone(), LifecycleOptions::default())
            .with_store(StateStore::new(&path));
        manager.request_detach(&a).unwrap();
        drop(manager);
        fake.remove_device(&a);

        let manager = DeviceManager::open_with_gateway(
            fake.clone(),
            LifecycleOptions::default(),
            Some(StateStore::new(&path)),
        )
        .unwrap();
        assert_eq!(manager.startup_report().missing, vec![a]);
        assert!(manager.list_inactive().is_empty());
    }

    #[test]
    fn test_failed_operation_leaves_ledger_alone() {
        let fake = host();
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("devices.json");
        let manager = DeviceManager::new(fake, LifecycleOptions::default())
            .with_store(StateStore::new(&path));

        let err = manager.request_reattach(&addr("0000:00:00.1")).unwrap_err();
        assert!(matches!(err, PassthruError::NotManaged { .. }));
        assert!(!path.exists());
    }

    /// A ledger path below a regular file, so every write fails.
    fn unwritable_store(temp: &TempDir) -> StateStore {
        let blocker = temp.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();
        StateStore::new(blocker.join("devices.json"))
    }

    #[test]
    fn test_detach_refused_without_ledger() {
        let fake = host();
        let temp = TempDir::new().unwrap();
        let a = addr("0000:00:00.1");
        let manager = DeviceManager::open_with_gateway(
            fake.clone(),
            LifecycleOptions::default(),
            Some(unwritable_store(&temp)),
        )
        .unwrap();

        let err = manager.request_detach(&a).unwrap_err();
        assert!(matches!(err, PassthruError::IoError { .. }));
        assert!(manager.list_inactive().is_empty());
        assert_eq!(fake.driver_of(&a).as_deref(), Some("e1000e"));
        assert_eq!(fake.driver_override_of(&a), None);
    }

    #[test]
    fn test_unrecorded_detach_is_undone() {
        let fake = host();
        let temp = TempDir::new().unwrap();
        let a = addr("0000:00:00.1");
        let manager = DeviceManager::new(fake.clone(), LifecycleOptions::default())
            .with_store(unwritable_store(&temp));

        // Binding succeeds but the ledger write after it does not.
        let err = manager
            .run("detach", OnLedgerFailure::UndoDetach, |tables| {
                manager.lifecycle.detach(&a, tables, &DetachOptions::default())
            })
            .unwrap_err();
        assert!(matches!(err, PassthruError::IoError { .. }));
        assert!(manager.list_inactive().is_empty());
        assert_eq!(fake.driver_of(&a).as_deref(), Some("e1000e"));
    }

    #[test]
    fn test_unrecorded_assignment_is_reverted() {
        let fake = host();
        let temp = TempDir::new().unwrap();
        let a = addr("0000:00:00.1");
        let mut manager = DeviceManager::new(fake, LifecycleOptions::default());
        manager.request_detach(&a).unwrap();

        manager.store = Some(unwritable_store(&temp));
        assert!(manager.assign(&a, "vm-1").is_err());
        assert_eq!(manager.list_inactive(), vec![a]);
        assert_eq!(manager.device(&a).unwrap().used_by(), None);
    }

    #[test]
    fn test_first_start_reports_stub_bound_devices() {
        let fake = host();
        let temp = TempDir::new().unwrap();
        let a = addr("0000:00:00.3");
        fake.force_driver(&a, Some("vfio-pci"));

        let manager = DeviceManager::open_with_gateway(
            fake.clone(),
            LifecycleOptions::default(),
            Some(StateStore::new(temp.path().join("devices.json"))),
        )
        .unwrap();
        assert_eq!(manager.startup_report().orphaned, vec![a]);
        assert!(manager.list_inactive().is_empty());

        let manager = DeviceManager::open_with_gateway(fake, LifecycleOptions::default(), None)
            .unwrap();
        assert_eq!(manager.startup_report().orphaned, vec![a]);
    }

    #[test]
    fn test_rescan_drops_vanished_device() {
        let fake = host();
        let manager = DeviceManager::new(fake.clone(), LifecycleOptions::default());
        let a = addr("0000:00:00.1");
        manager.request_detach(&a).unwrap();

        fake.remove_device(&a);
        let report = manager.rescan().unwrap();
        assert_eq!(report.missing, vec![a]);
        assert!(manager.list_inactive().is_empty());
    }

    #[test]
    fn test_host_devices() {
        let manager = DeviceManager::new(host(), LifecycleOptions::default());
        let devices = manager.host_devices().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].driver.as_deref(), Some("e1000e"));
    }
}

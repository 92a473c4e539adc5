use super::*;
use crate::pci::fake::{FakeDevice, FakeSysfs};
use crate::pci::{DetachOptions, LifecycleManager, LifecycleOptions, PciDevice};
use std::sync::Arc;
use tempfile::TempDir;

fn addr(s: &str) -> PciAddress {
    s.parse().unwrap()
}

fn detached(fake: &Arc<FakeSysfs>, addresses: &[PciAddress]) -> DeviceTables {
    let lm = LifecycleManager::new(fake.clone(), LifecycleOptions::default());
    let mut tables = DeviceTables::new();
    for address in addresses {
        lm.detach(address, &mut tables, &DetachOptions::default()).unwrap();
    }
    tables
}

#[test]
fn test_load_missing_ledger() {
    let temp = TempDir::new().unwrap();
    let store = StateStore::new(temp.path().join("devices.json"));
    assert!(store.load().unwrap().is_none());
}

#[test]
fn test_save_and_load() {
    let a = addr("0000:00:01.0");
    let fake = Arc::new(FakeSysfs::new().with_device(FakeDevice::new(a).driver("e1000e")));
    let tables = detached(&fake, &[a]);

    let temp = TempDir::new().unwrap();
    let store = StateStore::new(temp.path().join("nested/dir/devices.json"));
    store.save(&tables).unwrap();

    let loaded = store.load().unwrap().unwrap();
    assert_eq!(loaded, tables);
    assert_eq!(loaded.inactive.get(&a).unwrap().original_driver(), Some("e1000e"));
    assert!(!store.path().with_extension("json.tmp").exists());
}

#[test]
fn test_ledger_records_version() {
    let temp = TempDir::new().unwrap();
    let store = StateStore::new(temp.path().join("devices.json"));
    store.save(&DeviceTables::new()).unwrap();

    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
    assert_eq!(raw["version"], LEDGER_VERSION);
}

#[test]
fn test_rejects_newer_ledger() {
    let temp = TempDir::new().unwrap();
    let store = StateStore::new(temp.path().join("devices.json"));
    store.save(&DeviceTables::new()).unwrap();

    let mut raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
    raw["version"] = serde_json::json!(LEDGER_VERSION + 1);
    std::fs::write(store.path(), raw.to_string()).unwrap();

    assert!(store.load().is_err());
}

#[test]
fn test_rejects_corrupt_ledger() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("devices.json");
    std::fs::write(&path, "{ half a ledger").unwrap();

    assert!(StateStore::new(path).load().is_err());
}

#[test]
fn test_reconcile_keeps_stub_bound_devices() {
    let a = addr("0000:00:01.0");
    let fake = Arc::new(FakeSysfs::new().with_device(FakeDevice::new(a).driver("e1000e")));
    let mut tables = detached(&fake, &[a]);

    let report = reconcile(&mut tables, fake.as_ref()).unwrap();
    assert!(report.is_clean());
    assert_eq!(report.kept, vec![a]);
    assert!(tables.inactive.contains(&a));
}

#[test]
fn test_reconcile_drops_missing_device() {
    let a = addr("0000:00:01.0");
    let b = addr("0000:00:02.0");
    let fake = Arc::new(
        FakeSysfs::new()
            .with_device(FakeDevice::new(a).driver("e1000e"))
            .with_device(FakeDevice::new(b).driver("igb")),
    );
    let mut tables = detached(&fake, &[a, b]);
    fake.remove_device(&a);

    let report = reconcile(&mut tables, fake.as_ref()).unwrap();
    assert_eq!(report.missing, vec![a]);
    assert_eq!(tables.inactive.addresses(), vec![b]);
}

#[test]
fn test_reconcile_notices_device_returned_to_host() {
    let a = addr("0000:00:01.0");
    let fake = Arc::new(FakeSysfs::new().with_device(FakeDevice::new(a).driver("e1000e")));
    let mut tables = detached(&fake, &[a]);
    fake.force_driver(&a, Some("e1000e"));

    let report = reconcile(&mut tables, fake.as_ref()).unwrap();
    assert_eq!(report.returned, vec![a]);
    assert!(tables.inactive.is_empty());
    assert!(tables.released.contains(&a));
}

#[test]
fn test_reconcile_reports_orphans() {
    let a = addr("0000:00:01.0");
    let fake = Arc::new(FakeSysfs::new().with_device(FakeDevice::new(a).driver("e1000e")));
    fake.force_driver(&a, Some("vfio-pci"));
    let mut tables = DeviceTables::new();

    let report = reconcile(&mut tables, fake.as_ref()).unwrap();
    assert_eq!(report.orphaned, vec![a]);
    assert!(tables.inactive.is_empty());
}

#[test]
fn test_reconcile_refuses_inconsistent_tables() {
    let a = addr("0000:00:01.0");
    let fake = Arc::new(FakeSysfs::new().with_device(FakeDevice::new(a).driver("e1000e")));
    let mut tables = detached(&fake, &[a]);
    let device = tables.inactive.get(&a).unwrap().clone();
    tables.active.add(device).unwrap();

    assert!(matches!(
        reconcile(&mut tables, fake.as_ref()),
        Err(PassthruError::ConsistencyViolation { .. })
    ));
    assert_eq!(tables.inactive.len(), 1);
    assert_eq!(tables.active.len(), 1);
}

#[test]
fn test_reconcile_adopts_interrupted_detach() {
    let a = addr("0000:00:01.0");
    let b = addr("0000:00:02.0");
    let fake = Arc::new(
        FakeSysfs::new()
            .with_device(FakeDevice::new(a).driver("e1000e"))
            .with_device(FakeDevice::new(b).driver("igb")),
    );
    let lm = LifecycleManager::new(fake.clone(), LifecycleOptions::default());

    // The intent as it stood on disk when the process died mid-detach.
    let mut journaled = None;
    let mut tables = DeviceTables::new();
    lm.detach_journaled(&a, &mut tables, &DetachOptions::default(), |intent| {
        journaled = Some(intent.clone());
        Ok(())
    })
    .unwrap();
    let mut on_disk = journaled.unwrap();
    let mut never_bound = PciDevice::probe(fake.as_ref(), &b).unwrap();
    never_bound.record_original_driver(Some("igb".to_string()));
    on_disk.pending.push(never_bound);

    let report = reconcile(&mut on_disk, fake.as_ref()).unwrap();
    assert_eq!(report.recovered, vec![a]);
    assert!(on_disk.pending.is_empty());
    assert_eq!(on_disk.inactive.addresses(), vec![a]);

    let device = on_disk.inactive.get(&a).unwrap();
    assert!(device.is_managed());
    assert_eq!(device.original_driver(), Some("e1000e"));
}

#[test]
fn test_reconcile_prunes_released_addresses() {
    let a = addr("0000:00:01.0");
    let b = addr("0000:00:02.0");
    let c = addr("0000:00:03.0");
    let fake = Arc::new(
        FakeSysfs::new()
            .with_device(FakeDevice::new(a).driver("e1000e"))
            .with_device(FakeDevice::new(b).driver("igb"))
            .with_device(FakeDevice::new(c).driver("ahci")),
    );
    let mut tables = DeviceTables::new();
    tables.released.extend([a, b, c]);

    fake.remove_device(&b);
    fake.force_driver(&c, Some("pci-stub"));

    let report = reconcile(&mut tables, fake.as_ref()).unwrap();
    assert_eq!(tables.released.iter().copied().collect::<Vec<_>>(), vec![a]);
    assert_eq!(report.orphaned, vec![c]);
}

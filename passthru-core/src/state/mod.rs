//! Device ledger persistence.
//!
//! The active/inactive tables are written to a JSON file after every change
//! so a restarted manager still knows which driver each detached device
//! must go back to. On load the ledger is reconciled against sysfs, since
//! the host may have changed while nobody was watching.

use crate::error::{PassthruError, Result};
use crate::pci::{is_stub_driver, DeviceTables, ListKind, PciAddress, StubDriver, SysfsGateway};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
mod tests;

/// Current on-disk ledger format.
pub const LEDGER_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Ledger {
    version: u32,
    #[serde(flatten)]
    tables: DeviceTables,
}

/// Outcome of reconciling the ledger with sysfs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RescanReport {
    /// Entries still held by a stub driver (or never managed).
    pub kept: Vec<PciAddress>,
    /// Entries whose device disappeared from the host.
    pub missing: Vec<PciAddress>,
    /// Entries found back on a regular host driver.
    pub returned: Vec<PciAddress>,
    /// Stub-bound devices the ledger does not know about.
    pub orphaned: Vec<PciAddress>,
    /// Devices of an interrupted detach found on the stub and adopted.
    pub recovered: Vec<PciAddress>,
}

impl RescanReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty()
            && self.returned.is_empty()
            && self.orphaned.is_empty()
            && self.recovered.is_empty()
    }
}

/// JSON file holding the device ledger.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the ledger. A missing file means nothing was ever detached.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub fn load(&self) -> Result<Option<DeviceTables>> {
        if !self.path.exists() {
            debug!("No device ledger found");
            return Ok(None);
        }

        let content = fs::read_to_string(&self.path)
            .map_err(|e| PassthruError::IoError { path: self.path.clone(), source: e })?;
        let ledger: Ledger = serde_json::from_str(&content).map_err(|e| {
            PassthruError::Internal(format!(
                "Failed to parse device ledger {}: {}",
                self.path.display(),
                e
            ))
        })?;

        if ledger.version > LEDGER_VERSION {
            return Err(PassthruError::Internal(format!(
                "Device ledger {} has version {}, newer than supported {}",
                self.path.display(),
                ledger.version,
                LEDGER_VERSION
            )));
        }

        ledger.tables.check_consistency()?;
        debug!(
            active = ledger.tables.active.len(),
            inactive = ledger.tables.inactive.len(),
            "Loaded device ledger"
        );
        Ok(Some(ledger.tables))
    }

    /// Write the ledger atomically (temp file + rename).
    pub fn save(&self, tables: &DeviceTables) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| PassthruError::IoError { path: parent.to_path_buf(), source: e })?;
        }

        let ledger = Ledger { version: LEDGER_VERSION, tables: tables.clone() };
        let content = serde_json::to_string_pretty(&ledger).map_err(PassthruError::internal)?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(|e| PassthruError::IoError { path: tmp.clone(), source: e })?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| PassthruError::IoError { path: self.path.clone(), source: e })
    }
}

/// Bring the tables in line with what sysfs reports.
///
/// Managed entries whose device vanished, or that are back on a non-stub
/// driver, are dropped. Pending entries left by an interrupted detach are
/// adopted if the device made it onto a stub and discarded otherwise. A
/// device found in both lists is an error and is left alone.
#[instrument(skip_all)]
pub fn reconcile(tables: &mut DeviceTables, gateway: &dyn SysfsGateway) -> Result<RescanReport> {
    tables.check_consistency()?;
    let mut report = RescanReport::default();

    for mut device in std::mem::take(&mut tables.pending) {
        let address = *device.address();
        if tables.locate(&address)?.is_some() {
            continue;
        }
        match gateway.current_driver(&address) {
            Ok(Some(driver)) if is_stub_driver(&driver) => {
                warn!(
                    address = %address,
                    original = ?device.original_driver(),
                    "Detach was interrupted after binding the stub, adopting device"
                );
                device.set_stub_driver(driver.parse::<StubDriver>().ok());
                device.set_managed(true);
                tables.inactive.add(device)?;
                report.recovered.push(address);
            }
            Ok(_) | Err(PassthruError::NotFound { .. }) => {
                debug!(address = %address, "Interrupted detach never reached the stub");
            }
            Err(e) => return Err(e),
        }
    }

    for kind in [ListKind::Inactive, ListKind::Active] {
        for address in tables.list(kind).addresses() {
            let managed = tables.list(kind).get(&address).is_some_and(|d| d.is_managed());
            if !managed {
                report.kept.push(address);
                continue;
            }

            match gateway.current_driver(&address) {
                Err(PassthruError::NotFound { .. }) => {
                    warn!(address = %address, list = %kind, "Managed device disappeared from host");
                    tables.list_mut(kind).take(&address);
                    report.missing.push(address);
                }
                Err(e) => return Err(e),
                Ok(Some(driver)) if !is_stub_driver(&driver) => {
                    warn!(
                        address = %address,
                        list = %kind,
                        driver = %driver,
                        "Managed device was returned to the host outside this manager"
                    );
                    tables.list_mut(kind).take(&address);
                    tables.released.insert(address);
                    report.returned.push(address);
                }
                Ok(_) => report.kept.push(address),
            }
        }
    }

    // Keep only addresses that are still present and off the stubs.
    let mut stale = Vec::new();
    for address in &tables.released {
        match gateway.current_driver(address) {
            Err(PassthruError::NotFound { .. }) => stale.push(*address),
            Err(e) => return Err(e),
            Ok(Some(driver)) if is_stub_driver(&driver) => stale.push(*address),
            Ok(_) => {}
        }
    }
    for address in &stale {
        tables.released.remove(address);
    }
    if !stale.is_empty() {
        debug!(pruned = stale.len(), "Pruned released addresses");
    }

    for address in gateway.list_devices()? {
        if tables.locate(&address)?.is_some() {
            continue;
        }
        if gateway.current_driver(&address)?.as_deref().is_some_and(is_stub_driver) {
            debug!(address = %address, "Stub-bound device not in ledger");
            report.orphaned.push(address);
        }
    }

    if !report.orphaned.is_empty() {
        warn!(
            orphaned = ?report.orphaned,
            "Devices bound to a stub driver without a ledger entry; original drivers unknown"
        );
    }

    info!(
        kept = report.kept.len(),
        missing = report.missing.len(),
        returned = report.returned.len(),
        orphaned = report.orphaned.len(),
        recovered = report.recovered.len(),
        "Device ledger reconciled"
    );
    Ok(report)
}

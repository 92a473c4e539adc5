//! `passthru list|info|detach|reattach|assign|release|rescan` commands

use anyhow::{Context, Result};
use colored::Colorize;
use passthru_core::{
    DetachOptions, DeviceInfo, DeviceManager, ListKind, PassthruConfig, PciAddress, PciDevice,
};
use tabled::{settings::Style, Table, Tabled};

#[derive(Tabled)]
struct DeviceRow {
    #[tabled(rename = "ADDRESS")]
    address: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "CLASS")]
    class: String,
    #[tabled(rename = "DRIVER")]
    driver: String,
    #[tabled(rename = "IOMMU")]
    iommu: String,
    #[tabled(rename = "STATE")]
    state: String,
}

fn open(config: &PassthruConfig) -> Result<DeviceManager> {
    DeviceManager::open(config).with_context(|| {
        format!("Failed to open device manager (sysfs at {})", config.sysfs_root.display())
    })
}

fn parse(address: &str) -> Result<PciAddress> {
    Ok(address.parse::<PciAddress>()?)
}

/// List every host PCI device
pub fn list(config: &PassthruConfig) -> Result<()> {
    let manager = open(config)?;
    let devices = manager.host_devices()?;

    if devices.is_empty() {
        println!("No PCI devices found under {}", config.sysfs_root.display());
        return Ok(());
    }

    let rows: Vec<DeviceRow> = devices
        .iter()
        .map(|info| DeviceRow {
            address: info.address.to_string(),
            id: format!("{}:{}", info.vendor_id, info.device_id),
            class: info.class.clone(),
            driver: info.driver.clone().unwrap_or_else(|| "-".to_string()),
            iommu: info.iommu_group.map(|g| g.to_string()).unwrap_or_else(|| "-".to_string()),
            state: state_label(info, manager.device(&info.address).as_ref()),
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::modern());
    println!("{}", table);

    let active = manager.list_active().len();
    let inactive = manager.list_inactive().len();
    println!();
    println!("Total: {} device(s), {} detached, {} assigned", devices.len(), inactive, active);

    let boot_vga = devices.iter().filter(|d| d.is_boot_vga).count();
    if boot_vga > 0 {
        println!("Note: {} boot-vga device(s) (cannot detach without --force)", boot_vga);
    }

    Ok(())
}

fn state_label(info: &DeviceInfo, managed: Option<&PciDevice>) -> String {
    match managed {
        Some(device) if device.is_pending_reattach() => "reattach pending".red().to_string(),
        Some(device) => match device.used_by() {
            Some(guest) => format!("assigned to {}", guest).cyan().to_string(),
            None => "detached".green().to_string(),
        },
        None if info.is_boot_vga => "boot-vga".yellow().to_string(),
        None => "host".to_string(),
    }
}

/// Show details of one device
pub fn info(config: &PassthruConfig, address: &str) -> Result<()> {
    let address = parse(address)?;
    let manager = open(config)?;
    let info = manager.info(&address)?;

    println!("Address:      {}", info.address.to_string().bold());
    println!("Vendor:       {}", info.vendor_id);
    println!("Device:       {}", info.device_id);
    println!("Class:        {}", info.class);
    println!("Driver:       {}", info.driver.as_deref().unwrap_or("-"));
    println!(
        "IOMMU group:  {}",
        info.iommu_group.map(|g| g.to_string()).unwrap_or_else(|| "-".to_string())
    );
    if info.numa_node >= 0 {
        println!("NUMA node:    {}", info.numa_node);
    }
    if info.is_boot_vga {
        println!("Boot VGA:     {}", "yes".yellow());
    }
    if let Some(pf) = info.physfn {
        println!("Physical fn:  {}", pf);
    }
    if !info.virtfns.is_empty() {
        let vfs: Vec<String> = info.virtfns.iter().map(ToString::to_string).collect();
        println!("Virtual fns:  {}", vfs.join(", "));
    }

    match manager.device(&address) {
        Some(device) => {
            let list = if manager.list_active().contains(&address) {
                ListKind::Active
            } else {
                ListKind::Inactive
            };
            println!("Managed:      {} ({} list)", "yes".green(), list);
            println!("Original:     {}", device.original_driver().unwrap_or("(none)"));
            println!("Reset policy: {}", device.reset_policy());
            if let Some(guest) = device.used_by() {
                println!("Used by:      {}", guest);
            }
        }
        None => println!("Managed:      no"),
    }

    Ok(())
}

/// Detach a device onto the stub driver
pub fn detach(config: &PassthruConfig, address: &str, force: bool) -> Result<()> {
    let address = parse(address)?;
    let manager = open(config)?;

    manager.request_detach_with(&address, &DetachOptions { force_boot_vga: force })?;

    let device = manager.device(&address);
    let name = device.as_ref().map(PciDevice::display_name).unwrap_or_default();
    let original = device
        .as_ref()
        .and_then(|d| d.original_driver().map(String::from))
        .unwrap_or_else(|| "no driver".to_string());
    println!(
        "{} Detached {} {} from {} (now on {})",
        "✓".green().bold(),
        address.to_string().bold(),
        name,
        original,
        config.stub_driver
    );
    Ok(())
}

/// Give a device back to the host
pub fn reattach(config: &PassthruConfig, address: &str) -> Result<()> {
    let address = parse(address)?;
    let manager = open(config)?;
    let original = manager.device(&address).and_then(|d| d.original_driver().map(String::from));

    if let Err(e) = manager.request_reattach(&address) {
        if e.is_retryable() {
            println!("{} Device {} is busy, try again", "✗".red().bold(), address);
        }
        return Err(e.into());
    }

    match original {
        Some(driver) => println!(
            "{} Reattached {} to {}",
            "✓".green().bold(),
            address.to_string().bold(),
            driver
        ),
        None => println!("{} Reattached {}", "✓".green().bold(), address.to_string().bold()),
    }
    Ok(())
}

/// Assign a detached device to a guest
pub fn assign(config: &PassthruConfig, address: &str, guest: &str) -> Result<()> {
    let address = parse(address)?;
    let manager = open(config)?;
    manager.assign(&address, guest)?;
    println!("{} Assigned {} to {}", "✓".green().bold(), address.to_string().bold(), guest);
    Ok(())
}

/// Take a device back from its guest
pub fn release(config: &PassthruConfig, address: &str) -> Result<()> {
    let address = parse(address)?;
    let manager = open(config)?;
    manager.release(&address)?;
    println!("{} Released {}", "✓".green().bold(), address.to_string().bold());
    Ok(())
}

/// Reconcile the ledger with sysfs
pub fn rescan(config: &PassthruConfig) -> Result<()> {
    let manager = open(config)?;
    let mut report = manager.rescan()?;

    // Opening the manager already reconciled once; show those changes too.
    let startup = manager.startup_report();
    report.missing.extend(startup.missing.iter().copied());
    report.returned.extend(startup.returned.iter().copied());
    report.recovered.extend(startup.recovered.iter().copied());

    if report.is_clean() {
        println!("{} Ledger matches host ({} device(s))", "✓".green().bold(), report.kept.len());
        return Ok(());
    }

    for address in &report.missing {
        println!("{} {} disappeared from host, dropped", "✗".red().bold(), address);
    }
    for address in &report.returned {
        println!("{} {} already back on a host driver, dropped", "✗".yellow().bold(), address);
    }
    for address in &report.recovered {
        println!(
            "{} {} was left on the stub by an interrupted detach, now managed",
            "✓".green().bold(),
            address
        );
    }
    for address in &report.orphaned {
        println!(
            "{} {} is on a stub driver but not in the ledger (original driver unknown)",
            "✗".yellow().bold(),
            address
        );
    }
    println!("Kept {} device(s)", report.kept.len());
    Ok(())
}

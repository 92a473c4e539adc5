use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use passthru_core::{PassthruConfig, StubDriver};
use std::path::PathBuf;

mod commands;

#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Profiling compiled in but sampling off until `passthru profile active on`.
/// `_RJEM_MALLOC_CONF` in the environment still overrides it.
#[cfg(feature = "jemalloc")]
#[allow(non_upper_case_globals)]
#[export_name = "_rjem_malloc_conf"]
pub static malloc_conf: &u8 = &b"prof:true,prof_active:false\0"[0];

#[derive(Parser)]
#[command(name = "passthru")]
#[command(about = "Host-side PCI passthrough device manager", long_about = None)]
struct Cli {
    /// Root of the sysfs tree (for synthetic test trees)
    #[arg(long, global = true)]
    sysfs_root: Option<PathBuf>,

    /// Stub driver to bind detached devices to (vfio-pci or pci-stub)
    #[arg(long, global = true)]
    stub_driver: Option<StubDriver>,

    /// Log level when RUST_LOG is not set
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List host PCI devices and their passthrough state
    List,

    /// Show details of one device
    Info {
        /// PCI address (e.g., "0000:01:00.0")
        address: String,
    },

    /// Detach a device from its host driver
    Detach {
        /// PCI address
        address: String,

        /// Allow detaching the boot VGA device
        #[arg(short, long)]
        force: bool,
    },

    /// Return a device to its original host driver
    Reattach {
        /// PCI address
        address: String,
    },

    /// Assign a detached device to a guest
    Assign {
        /// PCI address
        address: String,

        /// Guest name
        #[arg(long)]
        to: String,
    },

    /// Take a device back from its guest
    Release {
        /// PCI address
        address: String,
    },

    /// Reconcile the device ledger with sysfs
    Rescan,

    /// Native heap profiling
    #[command(subcommand)]
    Profile(ProfileCommands),
}

#[derive(Subcommand)]
enum ProfileCommands {
    /// Write a heap profile
    Dump {
        /// Destination file
        path: PathBuf,
    },

    /// Start or stop allocation sampling
    Active {
        /// "on" or "off"
        #[arg(value_parser = parse_switch, action = clap::ArgAction::Set)]
        state: bool,
    },
}

fn parse_switch(value: &str) -> Result<bool, String> {
    match value {
        "on" => Ok(true),
        "off" => Ok(false),
        other => Err(format!("expected on or off, got {}", other)),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = PassthruConfig::load().context("Failed to load configuration")?;
    if let Some(root) = cli.sysfs_root {
        config.sysfs_root = root;
    }
    if let Some(stub) = cli.stub_driver {
        config.stub_driver = stub;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    passthru_core::init_observability(&config.log_level)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;
    tracing::debug!(
        sysfs_root = %config.sysfs_root.display(),
        stub = %config.stub_driver,
        state_file = %config.state_file.display(),
        "Configuration loaded"
    );

    match cli.command {
        Commands::List => commands::device::list(&config)?,
        Commands::Info { address } => commands::device::info(&config, &address)?,
        Commands::Detach { address, force } => commands::device::detach(&config, &address, force)?,
        Commands::Reattach { address } => commands::device::reattach(&config, &address)?,
        Commands::Assign { address, to } => commands::device::assign(&config, &address, &to)?,
        Commands::Release { address } => commands::device::release(&config, &address)?,
        Commands::Rescan => commands::device::rescan(&config)?,
        Commands::Profile(profile_cmd) => match profile_cmd {
            ProfileCommands::Dump { path } => commands::profile::dump(&path)?,
            ProfileCommands::Active { state } => commands::profile::active(state)?,
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "passthru",
            "detach",
            "0000:01:00.0",
            "--force",
            "--stub-driver",
            "pci-stub",
        ])
        .unwrap();
        assert_eq!(cli.stub_driver, Some(StubDriver::PciStub));
        assert!(matches!(cli.command, Commands::Detach { force: true, .. }));
    }

    #[cfg(feature = "jemalloc")]
    #[test]
    fn test_jemalloc_profiling_available() {
        let profiler = passthru_core::default_profiler();
        assert!(profiler.is_enabled());
        profiler.set_active(false).unwrap();
    }

    #[test]
    fn test_profile_switch() {
        let cli = Cli::try_parse_from(["passthru", "profile", "active", "on"]).unwrap();
        assert!(matches!(cli.command, Commands::Profile(ProfileCommands::Active { state: true })));
        assert!(Cli::try_parse_from(["passthru", "profile", "active", "maybe"]).is_err());
    }
}

//! Passthru Core Library
//!
//! Host-side PCI passthrough: detaches devices from their host drivers onto a
//! stub driver, tracks them while guests use them, and gives them back.

pub mod config;
pub mod error;
pub mod observability;
pub mod paths;
pub mod pci;
pub mod profiling;
pub mod state;

// Re-export commonly used items
pub use config::PassthruConfig;
pub use error::{PassthruError, Result, SysfsOp};
pub use observability::init as init_observability;
pub use pci::{
    DetachOptions, DeviceInfo, DeviceManager, DeviceTables, FsGateway, LifecycleOptions, ListKind,
    PciAddress, PciDevice, ResetPolicy, StubDriver, SysfsGateway,
};
pub use profiling::{default_profiler, HeapProfiler, NoopProfiler};
pub use state::{RescanReport, StateStore};

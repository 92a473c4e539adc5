//! PCI device passthrough on the host side.
//!
//! Takes PCI devices away from their host drivers, parks them on a stub
//! driver so a guest can own them, and hands them back to the original
//! driver when the guest is done.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    PCI Passthrough                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  DeviceManager                                              │
//! │  ├── request_detach()   - host driver -> stub, inactive     │
//! │  ├── assign()/release() - inactive <-> active               │
//! │  ├── request_reattach() - stub -> original driver           │
//! │  └── rescan()           - reconcile ledger with sysfs       │
//! │                                                             │
//! │  LifecycleManager  (list bookkeeping, groups, resets)       │
//! │  StubBinder        (pci-stub / vfio-pci binding protocols)  │
//! │  SysfsGateway      (the only code touching sysfs)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Safety
//!
//! - **Boot VGA Protection**: Detaching the device driving the host display
//!   is refused unless forced.
//!
//! - **IOMMU Groups**: With group detach enabled every group member moves to
//!   the stub together, or none does.
//!
//! # Usage
//!
//! ```rust,ignore
//! use passthru_core::pci::{DeviceManager, FsGateway, LifecycleOptions};
//! use std::sync::Arc;
//!
//! let manager = DeviceManager::new(Arc::new(FsGateway::new("/sys")), LifecycleOptions::default());
//! let gpu = "0000:01:00.0".parse()?;
//!
//! manager.request_detach(&gpu)?;
//! manager.assign(&gpu, "vm-1")?;
//! // ... guest runs ...
//! manager.release(&gpu)?;
//! manager.request_reattach(&gpu)?;
//! ```

mod address;
mod device;
#[cfg(any(test, feature = "test-mock"))]
pub mod fake;
mod lifecycle;
mod list;
mod manager;
mod stub;
mod sysfs;

pub use address::PciAddress;
pub use device::{PciDevice, ResetPolicy};
pub use lifecycle::{DetachOptions, LifecycleManager, LifecycleOptions};
pub use list::{DeviceTables, ListKind, PciDeviceList};
pub use manager::DeviceManager;
pub use stub::{is_stub_driver, StubBinder, StubDriver, KNOWN_STUB_DRIVERS};
pub use sysfs::{BusyPolicy, DeviceInfo, FsGateway, SysfsGateway, DEFAULT_SYSFS_ROOT};

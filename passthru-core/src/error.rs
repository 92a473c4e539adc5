//! Error types for the passthrough device manager.
//!
//! All errors use `thiserror`. Errors raised by sysfs I/O carry the offending
//! device address and the operation that failed.

use crate::pci::PciAddress;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for passthrough operations.
pub type Result<T> = std::result::Result<T, PassthruError>;

/// Sysfs operation that produced an I/O error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysfsOp {
    Probe,
    ReadDriver,
    Unbind,
    Bind,
    DriverOverride,
    DriversProbe,
    NewId,
    RemoveId,
    Reset,
    IommuGroup,
    Scan,
}

impl fmt::Display for SysfsOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SysfsOp::Probe => "probe",
            SysfsOp::ReadDriver => "read driver",
            SysfsOp::Unbind => "unbind",
            SysfsOp::Bind => "bind",
            SysfsOp::DriverOverride => "driver_override",
            SysfsOp::DriversProbe => "drivers_probe",
            SysfsOp::NewId => "new_id",
            SysfsOp::RemoveId => "remove_id",
            SysfsOp::Reset => "reset",
            SysfsOp::IommuGroup => "iommu group",
            SysfsOp::Scan => "scan",
        };
        f.write_str(name)
    }
}

/// Main error type.
#[derive(Error, Debug)]
pub enum PassthruError {
    // Device lookup errors
    #[error("PCI device not found: {address}")]
    NotFound { address: PciAddress },

    #[error("Invalid PCI address: {input} (expected: 0000:01:00.0)")]
    InvalidAddress { input: String },

    // Lifecycle errors
    #[error("PCI device {address} is assigned to a guest{}", fmt_consumer(.used_by))]
    AlreadyAssigned { address: PciAddress, used_by: Option<String> },

    #[error("PCI device {address} is already in use by {used_by}")]
    InUse { address: PciAddress, used_by: String },

    #[error("PCI device {address} is not managed by this host")]
    NotManaged { address: PciAddress },

    #[error("Failed to bind {address} to {driver}: {reason}")]
    BindFailed { address: PciAddress, driver: String, reason: String },

    #[error("Failed to unbind {address} from {driver}: {reason}")]
    UnbindFailed { address: PciAddress, driver: String, reason: String },

    #[error("PCI device {address} busy during {operation}")]
    Busy { address: PciAddress, operation: SysfsOp },

    #[error("Detach of IOMMU group of {address} failed at member {member}: {reason}")]
    GroupPartialFailure { address: PciAddress, member: PciAddress, reason: String },

    #[error("Device table consistency violation: {reason}")]
    ConsistencyViolation { reason: String },

    #[error("Reset of {address} failed: {reason}")]
    ResetFailed { address: PciAddress, reason: String },

    // Sysfs I/O errors
    #[error("Sysfs {operation} failed for {address} at {path:?}: {source}")]
    Sysfs {
        address: PciAddress,
        operation: SysfsOp,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // Profiling errors
    #[error("Heap profiling not available: {reason}")]
    ProfilingUnavailable { reason: String },

    #[error("Heap profiling request failed: {reason}")]
    ProfilingFailed { reason: String },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn fmt_consumer(used_by: &Option<String>) -> String {
    match used_by {
        Some(consumer) => format!(" ({})", consumer),
        None => String::new(),
    }
}

impl PassthruError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// Whether the caller may retry the operation automatically.
    ///
    /// Only `Busy` qualifies; everything else needs operator intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }

    /// Stable label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::InvalidAddress { .. } => "invalid_address",
            Self::AlreadyAssigned { .. } => "already_assigned",
            Self::InUse { .. } => "in_use",
            Self::NotManaged { .. } => "not_managed",
            Self::BindFailed { .. } => "bind_failed",
            Self::UnbindFailed { .. } => "unbind_failed",
            Self::Busy { .. } => "busy",
            Self::GroupPartialFailure { .. } => "group_partial_failure",
            Self::ConsistencyViolation { .. } => "consistency_violation",
            Self::ResetFailed { .. } => "reset_failed",
            Self::Sysfs { .. } => "sysfs",
            Self::IoError { .. } => "io",
            Self::InvalidConfig { .. } => "invalid_config",
            Self::ProfilingUnavailable { .. } => "profiling_unavailable",
            Self::ProfilingFailed { .. } => "profiling_failed",
            Self::Internal(_) => "internal",
            Self::Other(_) => "other",
        }
    }
}

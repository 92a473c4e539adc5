//! Native heap profiling.
//!
//! Unrelated to the device lifecycle; exposed so an administrative surface
//! can ask the allocator for a heap dump. Only builds that enable the
//! `jemalloc` feature, install `tikv_jemallocator::Jemalloc` as the global
//! allocator and start it with `prof:true` can actually profile.

use crate::error::{PassthruError, Result};
use std::path::Path;

/// Allocator heap profiler.
pub trait HeapProfiler: Send + Sync + std::fmt::Debug {
    /// Whether the allocator was started with profiling support.
    fn is_enabled(&self) -> bool;

    /// Start or stop sampling allocations.
    fn set_active(&self, active: bool) -> Result<()>;

    /// Write a heap profile to `path`.
    fn dump(&self, path: &Path) -> Result<()>;
}

/// Profiler used when no profiling allocator is compiled in.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProfiler;

impl HeapProfiler for NoopProfiler {
    fn is_enabled(&self) -> bool {
        false
    }

    fn set_active(&self, _active: bool) -> Result<()> {
        Err(unavailable())
    }

    fn dump(&self, _path: &Path) -> Result<()> {
        Err(unavailable())
    }
}

fn unavailable() -> PassthruError {
    PassthruError::ProfilingUnavailable {
        reason: "built without the jemalloc feature".to_string(),
    }
}

/// The best profiler this build offers.
pub fn default_profiler() -> Box<dyn HeapProfiler> {
    #[cfg(feature = "jemalloc")]
    {
        Box::new(jemalloc::JemallocProfiler)
    }
    #[cfg(not(feature = "jemalloc"))]
    {
        Box::new(NoopProfiler)
    }
}

#[cfg(feature = "jemalloc")]
pub use jemalloc::JemallocProfiler;

#[cfg(feature = "jemalloc")]
mod jemalloc {
    use super::HeapProfiler;
    use crate::error::{PassthruError, Result};
    use std::ffi::{c_char, CString};
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;
    use tracing::info;

    const OPT_PROF: &[u8] = b"opt.prof\0";
    const PROF_ACTIVE: &[u8] = b"prof.active\0";
    const PROF_DUMP: &[u8] = b"prof.dump\0";

    /// Profiler driving jemalloc's `prof.*` mallctl interface.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct JemallocProfiler;

    impl JemallocProfiler {
        fn require_enabled(&self) -> Result<()> {
            if self.is_enabled() {
                return Ok(());
            }
            Err(PassthruError::ProfilingUnavailable {
                reason: "jemalloc was not started with prof:true (set _RJEM_MALLOC_CONF)"
                    .to_string(),
            })
        }
    }

    impl HeapProfiler for JemallocProfiler {
        fn is_enabled(&self) -> bool {
            // SAFETY: opt.prof is a bool-valued mallctl.
            unsafe { tikv_jemalloc_ctl::raw::read::<bool>(OPT_PROF) }.unwrap_or(false)
        }

        fn set_active(&self, active: bool) -> Result<()> {
            self.require_enabled()?;
            // SAFETY: prof.active is a bool-valued mallctl.
            unsafe { tikv_jemalloc_ctl::raw::write(PROF_ACTIVE, active) }.map_err(|e| {
                PassthruError::ProfilingFailed { reason: format!("prof.active: {}", e) }
            })?;
            info!(active, "Heap profiling toggled");
            Ok(())
        }

        fn dump(&self, path: &Path) -> Result<()> {
            self.require_enabled()?;
            let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
                PassthruError::ProfilingFailed {
                    reason: format!("path {} contains a NUL byte", path.display()),
                }
            })?;
            // SAFETY: prof.dump takes a NUL-terminated path that outlives the call.
            unsafe { tikv_jemalloc_ctl::raw::write(PROF_DUMP, c_path.as_ptr() as *const c_char) }
                .map_err(|e| PassthruError::ProfilingFailed {
                    reason: format!("prof.dump to {}: {}", path.display(), e),
                })?;
            info!(path = %path.display(), "Heap profile written");
            Ok(())
        }
    }
}

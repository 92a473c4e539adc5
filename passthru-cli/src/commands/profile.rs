//! `passthru profile` commands

use anyhow::Result;
use colored::Colorize;
use passthru_core::default_profiler;
use std::path::Path;

/// Write a heap profile to `path`
pub fn dump(path: &Path) -> Result<()> {
    default_profiler().dump(path)?;
    println!("{} Heap profile written to {}", "✓".green().bold(), path.display());
    Ok(())
}

/// Turn allocation sampling on or off
pub fn active(on: bool) -> Result<()> {
    default_profiler().set_active(on)?;
    let state = if on { "on".green() } else { "off".yellow() };
    println!("{} Heap profiling {}", "✓".green().bold(), state);
    Ok(())
}

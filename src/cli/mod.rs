//! CLI command implementations.
//!
//! Each subcommand is a clap `Args` struct with a `run(self)` method.

pub mod list;
pub mod rm;
pub mod run;
pub mod ssh;
pub mod stop;

use crate::cache::{ImageCache, ImageId};
use crate::config::Dirs;
use crate::error::Result;
use crate::vm::VmInstance;
use std::path::Path;

/// Open the cache against the process-wide directories.
fn open_cache() -> Result<(Dirs, ImageCache)> {
    let dirs = Dirs::new()?;
    dirs.ensure()?;
    let cache = ImageCache::open(&dirs)?;
    Ok((dirs, cache))
}

/// The VM named after a cache entry.
fn vm_for(id: &ImageId, entry_dir: &Path) -> VmInstance {
    VmInstance::new(id.as_str(), entry_dir)
}

//! `stop`: shut a running VM down, keeping its cache entry.

use super::{open_cache, vm_for};
use crate::error::{Error, Result};
use clap::Args;

/// Stop a running VM
#[derive(Args, Debug)]
pub struct StopCmd {
    /// VM id (any unambiguous prefix)
    pub id: String,
}

impl StopCmd {
    pub fn run(self) -> Result<()> {
        let (dirs, cache) = open_cache()?;
        let id = cache.resolve_prefix(&self.id)?;

        let guard = cache
            .get_exclusive(&id)?
            .ok_or_else(|| Error::entry_not_found(id.as_str()))?;
        let instance = vm_for(&id, guard.entry_dir()?);

        let backend = crate::vm::create_backend(&dirs);
        backend.shutdown(&instance)?;

        println!("{}", id.short());
        Ok(())
    }
}

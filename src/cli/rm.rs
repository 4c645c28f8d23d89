//! `rm`: delete cached VMs, definitions and disks included.

use super::{open_cache, vm_for};
use crate::cache::{ImageCache, ImageId};
use crate::error::{Error, Result};
use crate::vm::VmBackend;
use clap::Args;

/// Remove a cached VM
#[derive(Args, Debug)]
pub struct RmCmd {
    /// VM id (any unambiguous prefix)
    #[arg(required_unless_present = "all", conflicts_with = "all")]
    pub id: Option<String>,

    /// Remove every cached VM
    #[arg(long)]
    pub all: bool,

    /// Shut the VM down first if it is still running
    #[arg(short, long)]
    pub force: bool,
}

impl RmCmd {
    pub fn run(self) -> Result<()> {
        let (dirs, cache) = open_cache()?;
        let backend = crate::vm::create_backend(&dirs);

        if self.all {
            let mut first_err = None;
            for id in cache.list()? {
                if let Err(e) = remove_one(&cache, backend.as_ref(), &id, self.force) {
                    // Keep going; report the first failure at the end.
                    tracing::warn!(id = %id.short(), error = %e, "remove failed");
                    first_err.get_or_insert(e);
                }
            }
            return match first_err {
                Some(e) => Err(e),
                None => Ok(()),
            };
        }

        // clap guarantees id is present when --all is absent.
        let prefix = self
            .id
            .as_deref()
            .ok_or_else(|| Error::entry_not_found(""))?;
        let id = cache.resolve_prefix(prefix)?;
        remove_one(&cache, backend.as_ref(), &id, self.force)?;
        println!("{}", id.short());
        Ok(())
    }
}

fn remove_one(
    cache: &ImageCache,
    backend: &dyn VmBackend,
    id: &ImageId,
    force: bool,
) -> Result<()> {
    let guard = cache
        .get_exclusive(id)?
        .ok_or_else(|| Error::entry_not_found(id.as_str()))?;
    let instance = vm_for(id, guard.entry_dir()?);

    if backend.is_running(&instance)? {
        if !force {
            return Err(Error::invalid_state("stopped", "running"));
        }
        backend.force_delete(&instance)?;
    } else {
        backend.delete(&instance)?;
    }

    guard.remove()
}

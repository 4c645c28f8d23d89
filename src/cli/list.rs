//! `list`: show cached VMs and their state.

use super::{open_cache, vm_for};
use crate::error::Result;
use crate::vm;
use clap::Args;

/// List cached VMs
#[derive(Args, Debug)]
pub struct ListCmd {}

impl ListCmd {
    pub fn run(self) -> Result<()> {
        let (dirs, cache) = open_cache()?;
        let backend = vm::create_backend(&dirs);

        println!(
            "{:<14} {:<40} {:<10} {:<8}",
            "ID", "IMAGE", "STATE", "SSH PORT"
        );
        for id in cache.list()? {
            // Skip entries another process is rebuilding right now.
            let guard = match cache.get(&id) {
                Ok(Some(guard)) => guard,
                Ok(None) => continue,
                Err(e) if e.is_busy() => {
                    println!("{:<14} {:<40} {:<10} {:<8}", id.short(), "-", "busy", "-");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let instance = vm_for(&id, guard.entry_dir()?);
            let state = if backend.is_running(&instance)? {
                "running"
            } else if backend.exists(&instance)? {
                "stopped"
            } else {
                "cached"
            };

            let run_state = instance.read_run_state()?;
            let (image, port) = match &run_state {
                Some(rs) => (
                    format!("{}:{}", rs.repository, rs.tag),
                    rs.ssh_port.to_string(),
                ),
                None => ("-".to_string(), "-".to_string()),
            };

            println!("{:<14} {:<40} {:<10} {:<8}", id.short(), image, state, port);
        }
        Ok(())
    }
}

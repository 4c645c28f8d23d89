//! `ssh`: open a session against a running VM.

use super::{open_cache, vm_for};
use crate::error::{Error, Result};
use crate::vm::RunState;
use clap::Args;

/// SSH into a running VM
#[derive(Args, Debug)]
pub struct SshCmd {
    /// VM id (any unambiguous prefix)
    pub id: String,

    /// Command to run (empty for an interactive shell)
    #[arg(trailing_var_arg = true)]
    pub command: Vec<String>,

    /// Guest user (defaults to the user the VM was provisioned with)
    #[arg(short, long)]
    pub user: Option<String>,
}

impl SshCmd {
    pub fn run(self) -> Result<()> {
        let (dirs, cache) = open_cache()?;
        let id = cache.resolve_prefix(&self.id)?;

        let mut guard = cache
            .get(&id)?
            .ok_or_else(|| Error::entry_not_found(id.as_str()))?;
        let instance = vm_for(&id, guard.entry_dir()?);

        let backend = crate::vm::create_backend(&dirs);
        if !backend.is_running(&instance)? {
            return Err(Error::invalid_state("running", "stopped"));
        }

        let state = instance
            .read_run_state()?
            .ok_or_else(|| Error::entry_not_found(id.as_str()))?;
        let user = effective_user(self.user.as_deref(), &state).to_string();
        let identity = state
            .ssh_identity
            .ok_or_else(|| Error::invalid_state("a VM provisioned with an ssh key", "none"))?;

        // ssh may block for the whole session; don't hold the entry.
        guard.release();

        let code = backend.run_ssh(&identity, state.ssh_port, &user, &self.command)?;
        if code != 0 {
            std::process::exit(code);
        }
        Ok(())
    }
}

/// An explicit --user wins; otherwise connect as whoever the VM was
/// provisioned for.
fn effective_user<'a>(requested: Option<&'a str>, state: &'a RunState) -> &'a str {
    requested.unwrap_or(&state.user)
}

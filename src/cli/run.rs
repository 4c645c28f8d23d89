//! `run`: pull an image, materialize its disk, boot it, open a session.

use super::{open_cache, vm_for};
use crate::disk::{self, PodmanBootcInstaller};
use crate::error::{Error, Result};
use crate::images::{ImageResolver, PodmanResolver, ResolvedImage};
use crate::ssh;
use crate::vm::{self, RunParams, RunState};
use clap::Args;
use std::path::PathBuf;

/// Boot a bootc image as a VM
#[derive(Args, Debug)]
pub struct RunCmd {
    /// Image reference (e.g. quay.io/fedora/fedora-bootc:42)
    pub image: String,

    /// Command to run over SSH (empty for an interactive shell)
    #[arg(trailing_var_arg = true)]
    pub command: Vec<String>,

    /// Guest user to provision and connect as
    #[arg(short, long, default_value = "root")]
    pub user: String,

    /// SSH private key; its .pub sibling is injected into the guest.
    /// Without a key no credential is injected and the VM runs in the
    /// background.
    #[arg(long)]
    pub identity: Option<PathBuf>,

    /// Directory with cloud-init NoCloud files to attach as a seed ISO
    #[arg(long)]
    pub cloud_init: Option<PathBuf>,

    /// Start the VM and return without opening a session
    #[arg(long)]
    pub background: bool,

    /// Remove the VM and its cache entry when the session ends
    #[arg(long)]
    pub rm: bool,

    /// Guest vCPU count
    #[arg(long, default_value_t = 2)]
    pub cpus: u32,

    /// Guest memory in MiB
    #[arg(long, default_value_t = 2048)]
    pub memory: u32,
}

impl RunCmd {
    pub fn run(self) -> Result<()> {
        let (dirs, cache) = open_cache()?;

        let resolver = PodmanResolver;
        let resolved = resolver.resolve(&self.image)?;

        let identity = match self.identity.clone() {
            Some(path) => Some(path),
            None => default_identity(),
        };
        // No key means nothing to authenticate a session with.
        let background = self.background || identity.is_none();
        if self.rm && background {
            return Err(Error::invalid_state(
                "a foreground session for --rm",
                "background mode",
            ));
        }

        let mut guard = cache.get_exclusive_or_add(&resolved.id)?;
        let entry_dir = guard.entry_dir()?.to_path_buf();

        let installer = installer_for(&resolved);
        let outcome = disk::ensure_disk(&entry_dir, &resolved.id, &installer)?;
        tracing::info!(id = %resolved.id.short(), ?outcome, "disk ready");

        let port = ssh::allocate_port()?;
        let params = RunParams {
            user: self.user.clone(),
            ssh_identity: identity.clone(),
            ssh_port: port,
            cloud_init_dir: self.cloud_init.clone(),
            command: self.command.clone(),
            remove_on_exit: self.rm,
            background,
            cpus: self.cpus,
            memory_mib: self.memory,
        };

        let backend = vm::create_backend(&dirs);
        let instance = vm_for(&resolved.id, &entry_dir);
        backend.run(&instance, &params)?;
        backend.write_run_state(
            &instance,
            &RunState {
                ssh_port: port,
                ssh_identity: identity.clone(),
                user: self.user.clone(),
                repository: resolved.repository.clone(),
                tag: resolved.tag.clone(),
            },
        )?;

        // The session may outlive any reasonable lock hold time; other
        // invocations (stop, rm) must be able to reach this entry.
        guard.release();

        if background {
            println!("{}", resolved.id.short());
            return Ok(());
        }

        backend.wait_for_ssh_ready(port)?;
        let identity = identity.ok_or_else(|| {
            Error::invalid_state("an ssh identity for a foreground session", "none")
        })?;
        let code = backend.run_ssh(&identity, port, &self.user, &self.command)?;

        if self.rm {
            backend.force_delete(&instance)?;
            match cache.get_exclusive(&resolved.id)? {
                Some(guard) => guard.remove()?,
                None => tracing::warn!(id = %resolved.id.short(), "entry vanished before removal"),
            }
        }

        if code != 0 {
            std::process::exit(code);
        }
        Ok(())
    }
}

/// Conventional key locations, first one that exists with a .pub sibling.
fn default_identity() -> Option<PathBuf> {
    let ssh_dir = dirs::home_dir()?.join(".ssh");
    for name in ["id_ed25519", "id_rsa"] {
        let key = ssh_dir.join(name);
        if key.exists() && key.with_extension("pub").exists() {
            return Some(key);
        }
    }
    None
}

/// Installer pinned to the resolved digest. Tags can move between pull
/// and install; the provenance stamped on the disk must match what the
/// install actually read.
fn installer_for(resolved: &ResolvedImage) -> PodmanBootcInstaller {
    PodmanBootcInstaller::new(resolved.id.as_str())
}

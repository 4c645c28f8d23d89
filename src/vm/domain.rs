//! Hypervisor-domain backend.
//!
//! Drives a libvirt-style domain API through the `virsh` CLI. The
//! [`Hypervisor`] trait is the seam: production uses [`VirshHypervisor`],
//! tests substitute an in-memory fake so the state machine is exercised
//! without a hypervisor present.

use super::{RunParams, VmBackend, VmInstance, DEFAULT_BOOT_TIMEOUT};
use crate::cloudinit;
use crate::error::{Error, Result};
use crate::ssh;
use std::io::Write;
use std::process::Command;
use std::time::{Duration, Instant};

const BOOT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Observable domain state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    Running,
    Stopped,
    Absent,
}

/// Minimal domain API surface the backend needs.
pub trait Hypervisor {
    /// Register a persistent domain from its XML descriptor.
    fn define(&self, xml: &str) -> Result<()>;
    /// Remove a persistent domain definition.
    fn undefine(&self, name: &str) -> Result<()>;
    /// Start a defined domain.
    fn create(&self, name: &str) -> Result<()>;
    /// Forcibly stop a running domain.
    fn destroy(&self, name: &str) -> Result<()>;
    /// Query domain state. Unknown domains report Absent, not an error.
    fn state(&self, name: &str) -> Result<DomainState>;
}

/// Hypervisor implementation shelling out to `virsh`.
#[derive(Debug, Default)]
pub struct VirshHypervisor;

impl VirshHypervisor {
    fn virsh(&self, operation: &str, args: &[&str]) -> Result<String> {
        let output = Command::new("virsh")
            .arg(operation)
            .args(args)
            .output()
            .map_err(|e| Error::hypervisor(operation, e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::hypervisor(operation, stderr.trim().to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Hypervisor for VirshHypervisor {
    fn define(&self, xml: &str) -> Result<()> {
        // virsh only defines from a file path.
        let mut file = tempfile::Builder::new()
            .prefix(".domain-")
            .suffix(".xml")
            .tempfile()
            .map_err(|e| Error::hypervisor("define", e.to_string()))?;
        file.write_all(xml.as_bytes())
            .map_err(|e| Error::hypervisor("define", e.to_string()))?;
        let path = file.path().to_string_lossy().into_owned();
        self.virsh("define", &[&path])?;
        Ok(())
    }

    fn undefine(&self, name: &str) -> Result<()> {
        self.virsh("undefine", &[name])?;
        Ok(())
    }

    fn create(&self, name: &str) -> Result<()> {
        self.virsh("start", &[name])?;
        Ok(())
    }

    fn destroy(&self, name: &str) -> Result<()> {
        self.virsh("destroy", &[name])?;
        Ok(())
    }

    fn state(&self, name: &str) -> Result<DomainState> {
        match self.virsh("domstate", &[name]) {
            Ok(out) => match out.trim() {
                "running" | "paused" => Ok(DomainState::Running),
                _ => Ok(DomainState::Stopped),
            },
            // virsh reports unknown domains on stderr; treat any
            // domstate failure as the domain not being defined.
            Err(_) => Ok(DomainState::Absent),
        }
    }
}

/// Backend that maps VM lifecycle onto hypervisor domains.
pub struct DomainBackend<H: Hypervisor> {
    hypervisor: H,
    boot_timeout: Duration,
}

impl<H: Hypervisor> DomainBackend<H> {
    pub fn new(hypervisor: H) -> Self {
        Self {
            hypervisor,
            boot_timeout: DEFAULT_BOOT_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_boot_timeout(hypervisor: H, boot_timeout: Duration) -> Self {
        Self {
            hypervisor,
            boot_timeout,
        }
    }

    fn wait_for_running(&self, name: &str) -> Result<()> {
        let deadline = Instant::now() + self.boot_timeout;
        loop {
            if self.hypervisor.state(name)? == DomainState::Running {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::BootTimeout {
                    name: name.to_string(),
                    seconds: self.boot_timeout.as_secs(),
                });
            }
            std::thread::sleep(BOOT_POLL_INTERVAL);
        }
    }
}

impl<H: Hypervisor> VmBackend for DomainBackend<H> {
    fn name(&self) -> &'static str {
        "domain"
    }

    fn run(&self, vm: &VmInstance, params: &RunParams) -> Result<()> {
        if self.hypervisor.state(&vm.name)? == DomainState::Running {
            return Err(Error::invalid_state("stopped or absent", "running"));
        }

        let credential = match &params.ssh_identity {
            Some(identity) => {
                let pubkey = identity.with_extension("pub");
                Some(ssh::build_credential_payload(&params.user, &pubkey)?)
            }
            None => None,
        };

        let cidata = match &params.cloud_init_dir {
            Some(dir) => {
                let iso = vm.cidata_path();
                cloudinit::create_iso(dir, &iso)?;
                Some(iso)
            }
            None => None,
        };

        let xml = build_domain_xml(vm, params, credential.as_deref(), cidata.as_deref());
        self.hypervisor.define(&xml)?;

        if let Err(e) = self.hypervisor.create(&vm.name) {
            // Start failed; take the definition back out so a retry
            // starts from Absent. The start error is the one reported.
            if let Err(undef) = self.hypervisor.undefine(&vm.name) {
                tracing::warn!(name = %vm.name, error = %undef, "undefine after failed start");
            }
            return Err(e);
        }

        tracing::debug!(name = %vm.name, "domain started, waiting for running state");
        self.wait_for_running(&vm.name)
    }

    fn shutdown(&self, vm: &VmInstance) -> Result<()> {
        match self.hypervisor.state(&vm.name)? {
            DomainState::Running => self.hypervisor.destroy(&vm.name),
            DomainState::Stopped | DomainState::Absent => Ok(()),
        }
    }

    fn delete(&self, vm: &VmInstance) -> Result<()> {
        match self.hypervisor.state(&vm.name)? {
            DomainState::Running => Err(Error::invalid_state("stopped", "running")),
            DomainState::Stopped => self.hypervisor.undefine(&vm.name),
            DomainState::Absent => Ok(()),
        }
    }

    fn is_running(&self, vm: &VmInstance) -> Result<bool> {
        Ok(self.hypervisor.state(&vm.name)? == DomainState::Running)
    }

    fn exists(&self, vm: &VmInstance) -> Result<bool> {
        Ok(self.hypervisor.state(&vm.name)? != DomainState::Absent)
    }
}

/// Render the domain descriptor.
///
/// Networking is user-mode with a single hostfwd mapping the reserved
/// host port to guest port 22. The credential payload rides an SMBIOS
/// type 11 string, which systemd-based guests pick up as a boot
/// credential during early provisioning.
fn build_domain_xml(
    vm: &VmInstance,
    params: &RunParams,
    credential: Option<&str>,
    cidata: Option<&std::path::Path>,
) -> String {
    let mut xml = String::new();
    xml.push_str("<domain type='kvm' xmlns:qemu='http://libvirt.org/schemas/domain/qemu/1.0'>\n");
    xml.push_str(&format!("  <name>{}</name>\n", vm.name));
    xml.push_str(&format!(
        "  <memory unit='MiB'>{}</memory>\n",
        params.memory_mib
    ));
    xml.push_str(&format!("  <vcpu>{}</vcpu>\n", params.cpus));
    xml.push_str("  <os>\n    <type arch='x86_64'>hvm</type>\n    <boot dev='hd'/>\n  </os>\n");
    xml.push_str("  <devices>\n");
    xml.push_str(&format!(
        "    <disk type='file' device='disk'>\n      <driver name='qemu' type='raw'/>\n      <source file='{}'/>\n      <target dev='vda' bus='virtio'/>\n    </disk>\n",
        vm.disk_path().display()
    ));
    if let Some(iso) = cidata {
        xml.push_str(&format!(
            "    <disk type='file' device='cdrom'>\n      <driver name='qemu' type='raw'/>\n      <source file='{}'/>\n      <target dev='sda' bus='sata'/>\n      <readonly/>\n    </disk>\n",
            iso.display()
        ));
    }
    xml.push_str("    <console type='pty'/>\n");
    xml.push_str("  </devices>\n");
    xml.push_str("  <qemu:commandline>\n");
    xml.push_str("    <qemu:arg value='-netdev'/>\n");
    xml.push_str(&format!(
        "    <qemu:arg value='user,id=usernet,hostfwd=tcp:127.0.0.1:{}-:22'/>\n",
        params.ssh_port
    ));
    xml.push_str("    <qemu:arg value='-device'/>\n");
    xml.push_str("    <qemu:arg value='virtio-net-pci,netdev=usernet'/>\n");
    if let Some(payload) = credential {
        xml.push_str("    <qemu:arg value='-smbios'/>\n");
        xml.push_str(&format!(
            "    <qemu:arg value='type=11,value=io.systemd.credential.binary:bootvm.provision={}'/>\n",
            payload
        ));
    }
    xml.push_str("  </qemu:commandline>\n");
    xml.push_str("</domain>\n");
    xml
}

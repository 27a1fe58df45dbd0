//! Project SSH keys and host-port allocation.
//!
//! Each project carries one ED25519 keypair injected into every guest.
//! User-mode VMs reach SSH through a forwarded localhost port persisted
//! in `ports.json`; a recorded port is reused for the VM's lifetime as
//! long as it stays free.

use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::VmConfig;
use crate::exec;
use crate::project::Project;

pub const PORT_RANGE_START: u16 = 2222;
pub const PORT_RANGE_END: u16 = 2322;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMetadata {
    pub ssh: u16,
}

pub fn private_key_path(project: &Project) -> Result<PathBuf> {
    Ok(project.ssh_dir()?.join("id_ed25519"))
}

/// Read the project public key, generating the keypair on first use.
/// If generation loses a race to a concurrent creator, the existing
/// public key is read instead.
pub async fn ensure_public_key(project: &Project) -> Result<String> {
    let ssh_dir = project.ssh_dir()?;
    let private_key = ssh_dir.join("id_ed25519");
    let public_key = ssh_dir.join("id_ed25519.pub");

    if public_key.exists() {
        debug!(path = %public_key.display(), "using existing project SSH key");
        let data = std::fs::read_to_string(&public_key)
            .with_context(|| format!("failed to read SSH public key: {}", public_key.display()))?;
        return Ok(data.trim().to_string());
    }

    info!(dir = %ssh_dir.display(), "generating project SSH keypair");
    std::fs::create_dir_all(&ssh_dir)
        .with_context(|| format!("creating SSH directory: {}", ssh_dir.display()))?;
    std::fs::set_permissions(&ssh_dir, std::fs::Permissions::from_mode(0o700))
        .context("setting SSH directory permissions")?;

    let keygen = exec::run(
        "ssh-keygen",
        &[
            "-t",
            "ed25519",
            "-f",
            &private_key.to_string_lossy(),
            "-N",
            "",
            "-C",
            "qemu-compose",
        ],
    )
    .await;

    if let Err(e) = keygen {
        // A concurrent creator may have won; the pubkey settles it.
        if public_key.exists() {
            debug!("SSH keypair appeared concurrently");
        } else {
            return Err(e).context("failed to generate SSH key");
        }
    }

    std::fs::set_permissions(&private_key, std::fs::Permissions::from_mode(0o600))
        .context("setting private key permissions")?;

    let data = std::fs::read_to_string(&public_key)
        .with_context(|| format!("failed to read generated SSH public key: {}", public_key.display()))?;
    println!("  ✓ Generated SSH key pair in .qemu-compose/ssh/");
    Ok(data.trim().to_string())
}

fn ports_json_path(project: &Project, vm_name: &str) -> Result<PathBuf> {
    Ok(project.instance_dir(vm_name)?.join("ports.json"))
}

pub fn load_port_metadata(project: &Project, vm_name: &str) -> Result<Option<PortMetadata>> {
    let path = ports_json_path(project, vm_name)?;
    let data = match std::fs::read_to_string(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
    };
    let metadata = serde_json::from_str(&data)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(metadata))
}

pub fn save_port_metadata(project: &Project, vm_name: &str, metadata: &PortMetadata) -> Result<()> {
    let path = ports_json_path(project, vm_name)?;
    let data = serde_json::to_string_pretty(metadata).context("serializing port metadata")?;
    std::fs::write(&path, data)
        .with_context(|| format!("failed to write {}", path.display()))?;
    debug!(path = %path.display(), "saved port metadata");
    Ok(())
}

/// Whether a localhost TCP port can currently be bound.
fn port_is_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Every port already recorded by some VM of this project.
fn allocated_ports(project: &Project) -> Vec<(u16, String)> {
    let Ok(workspace) = project.workspace() else {
        return Vec::new();
    };
    let Ok(entries) = std::fs::read_dir(&workspace) else {
        return Vec::new();
    };

    let mut ports = Vec::new();
    for entry in entries.flatten() {
        if !entry.path().is_dir() {
            continue;
        }
        let vm_name = entry.file_name().to_string_lossy().into_owned();
        if vm_name == "ssh" || vm_name == "volumes" {
            continue;
        }
        if let Ok(Some(metadata)) = load_port_metadata(project, &vm_name) {
            ports.push((metadata.ssh, vm_name));
        }
    }
    ports
}

/// Allocate the SSH host port for a VM: a pinned port is verified, a
/// recorded port is reused if still free, otherwise the first free port
/// in the range not owned by a sibling VM is chosen and persisted.
pub fn allocate_ssh_port(project: &Project, vm_name: &str, vm: &VmConfig) -> Result<u16> {
    if let Some(ssh) = &vm.ssh {
        if ssh.port > 0 {
            debug!(vm = vm_name, port = ssh.port, "using pinned SSH port");
            if !port_is_free(ssh.port) {
                bail!("specified SSH port {} is already in use", ssh.port);
            }
            return Ok(ssh.port);
        }
    }

    match load_port_metadata(project, vm_name) {
        Ok(Some(metadata)) if metadata.ssh > 0 => {
            if port_is_free(metadata.ssh) {
                debug!(vm = vm_name, port = metadata.ssh, "reusing recorded SSH port");
                return Ok(metadata.ssh);
            }
            warn!(
                vm = vm_name,
                port = metadata.ssh,
                "recorded SSH port no longer available"
            );
        }
        Ok(_) => {}
        Err(e) => warn!(vm = vm_name, error = %e, "could not load port metadata"),
    }

    let taken = allocated_ports(project);

    for port in PORT_RANGE_START..=PORT_RANGE_END {
        if let Some((_, owner)) = taken.iter().find(|(p, owner)| *p == port && owner != vm_name) {
            debug!(port, owner = %owner, "port already allocated to sibling VM");
            continue;
        }
        if !port_is_free(port) {
            continue;
        }

        info!(vm = vm_name, port, "allocated SSH port");
        if let Err(e) = save_port_metadata(project, vm_name, &PortMetadata { ssh: port }) {
            warn!(vm = vm_name, error = %e, "could not save port metadata");
        }
        return Ok(port);
    }

    bail!("no available ports in range {PORT_RANGE_START}-{PORT_RANGE_END}")
}

/// The persisted SSH port of a VM.
pub fn ssh_port(project: &Project, vm_name: &str) -> Result<u16> {
    match load_port_metadata(project, vm_name)? {
        Some(metadata) if metadata.ssh > 0 => Ok(metadata.ssh),
        _ => bail!("no SSH port allocated for VM: {vm_name}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_project() -> (tempfile::TempDir, Project) {
        let tmp = tempfile::TempDir::new().unwrap();
        let compose = tmp.path().join("qemu-compose.yaml");
        std::fs::write(&compose, "vms: {}\n").unwrap();
        let project = Project::from_compose_path(compose.canonicalize().unwrap()).unwrap();
        (tmp, project)
    }

    fn vm_config(pinned_port: Option<u16>) -> VmConfig {
        VmConfig {
            image: "https://x/i.img".into(),
            cpu: 1,
            memory: 512,
            networks: vec![],
            ports: vec![],
            depends_on: vec![],
            volumes: vec![],
            environment: vec![],
            provision: vec![],
            disk: None,
            healthcheck: None,
            ssh: pinned_port.map(|port| crate::config::SshConfig { port }),
        }
    }

    #[test]
    fn port_metadata_round_trips() {
        let (_tmp, project) = test_project();
        assert!(load_port_metadata(&project, "vm1").unwrap().is_none());

        save_port_metadata(&project, "vm1", &PortMetadata { ssh: 2222 }).unwrap();
        assert_eq!(load_port_metadata(&project, "vm1").unwrap().unwrap().ssh, 2222);
        assert_eq!(ssh_port(&project, "vm1").unwrap(), 2222);
    }

    #[test]
    fn allocation_prefers_recorded_port() {
        let (_tmp, project) = test_project();
        save_port_metadata(&project, "vm1", &PortMetadata { ssh: 2250 }).unwrap();

        let port = allocate_ssh_port(&project, "vm1", &vm_config(None)).unwrap();
        assert_eq!(port, 2250);
    }

    #[test]
    fn allocation_skips_sibling_ports() {
        let (_tmp, project) = test_project();
        save_port_metadata(&project, "other", &PortMetadata { ssh: PORT_RANGE_START }).unwrap();

        let port = allocate_ssh_port(&project, "vm1", &vm_config(None)).unwrap();
        assert_ne!(port, PORT_RANGE_START);
        assert!((PORT_RANGE_START..=PORT_RANGE_END).contains(&port));

        // The choice is persisted for next time.
        assert_eq!(ssh_port(&project, "vm1").unwrap(), port);
    }

    #[test]
    fn pinned_port_in_use_is_an_error() {
        let (_tmp, project) = test_project();
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let busy = listener.local_addr().unwrap().port();

        let err = allocate_ssh_port(&project, "vm1", &vm_config(Some(busy))).unwrap_err();
        assert!(err.to_string().contains("already in use"));
    }

    #[test]
    fn missing_port_is_an_error() {
        let (_tmp, project) = test_project();
        assert!(ssh_port(&project, "vm1").is_err());
    }
}

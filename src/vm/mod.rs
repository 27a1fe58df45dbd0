//! VM lifecycle controller.
//!
//! Composes the image cache, disk manager, volume manager, network
//! fabric, seed builder, port allocator and supervisor into idempotent
//! per-VM operations. Set operations collect per-VM failures instead of
//! aborting the whole run.

pub mod qemu;

use std::fmt;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::cloudinit;
use crate::config::{ComposeConfig, VmConfig};
use crate::image;
use crate::network::{self, Netlink, NetworkStore};
use crate::project::Project;
use crate::sshkeys;
use crate::storage;
use crate::systemd::{self, Scope};

pub use qemu::{build_qemu_command, mac_table, QemuSpec};

/// Observable VM state, per the status decision table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmStatus {
    /// No overlay disk exists yet.
    NotCreated,
    /// Overlay present, supervisor unit not active.
    Stopped,
    /// Unit active but the SSH probe does not succeed yet.
    Starting,
    /// Unit active and SSH answers.
    Ready,
    /// Unit active, probe skipped (no port or key material).
    Active,
    /// Status query failed.
    Unknown,
    /// Any other supervisor state (activating, failed, ...).
    Other(String),
}

impl VmStatus {
    pub fn is_up(&self) -> bool {
        matches!(self, VmStatus::Ready | VmStatus::Active | VmStatus::Starting)
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmStatus::NotCreated => write!(f, "not-created"),
            VmStatus::Stopped => write!(f, "stopped"),
            VmStatus::Starting => write!(f, "starting"),
            VmStatus::Ready => write!(f, "ready"),
            VmStatus::Active => write!(f, "active"),
            VmStatus::Unknown => write!(f, "unknown"),
            VmStatus::Other(state) => write!(f, "{state}"),
        }
    }
}

/// Whether the overlay disk has been materialized.
pub fn instance_exists(project: &Project, vm_name: &str) -> bool {
    project
        .instance_disk_path(vm_name)
        .map(|p| p.exists())
        .unwrap_or(false)
}

pub async fn is_running(project: &Project, vm_name: &str) -> bool {
    let unit = systemd::vm_unit_name(&project.name, vm_name);
    systemd::is_active(Scope::User, &unit).await.unwrap_or(false)
}

/// SSH readiness probe: key-based batch-mode login with a 2 second
/// connect budget.
pub async fn probe_ssh_ready(project: &Project, vm_name: &str, image_url: &str) -> Option<bool> {
    let port = sshkeys::ssh_port(project, vm_name).ok()?;
    let key = sshkeys::private_key_path(project).ok()?;
    if !key.exists() {
        return None;
    }

    let user = cloudinit::default_user_for_image(image_url);
    let result = crate::exec::run(
        "ssh",
        &[
            "-i",
            &key.to_string_lossy(),
            "-p",
            &port.to_string(),
            "-o",
            "ConnectTimeout=2",
            "-o",
            "BatchMode=yes",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            &format!("{user}@localhost"),
            "exit",
        ],
    )
    .await;

    Some(result.is_ok())
}

/// The status decision table.
pub async fn vm_status(project: &Project, vm_name: &str, image_url: &str) -> VmStatus {
    if !instance_exists(project, vm_name) {
        return VmStatus::NotCreated;
    }

    let unit = systemd::vm_unit_name(&project.name, vm_name);
    let state = match systemd::active_state(Scope::User, &unit).await {
        Ok(state) => state,
        Err(e) => {
            debug!(vm = vm_name, error = %e, "active-state query failed");
            return VmStatus::Unknown;
        }
    };

    match state.as_str() {
        "inactive" | "dead" | "" => VmStatus::Stopped,
        "active" => match probe_ssh_ready(project, vm_name, image_url).await {
            Some(true) => VmStatus::Ready,
            Some(false) => VmStatus::Starting,
            None => VmStatus::Active,
        },
        other => VmStatus::Other(other.to_string()),
    }
}

/// Bring one VM up. Skips already-running VMs; otherwise walks the full
/// sequence: image, overlay, fabric, volumes, port, seed, supervisor.
pub async fn up_vm(
    project: &Project,
    netlink: &Netlink,
    config: &ComposeConfig,
    vm_name: &str,
    vm: &VmConfig,
) -> Result<()> {
    if is_running(project, vm_name).await {
        println!("  ⚠ VM is already running");
        return Ok(());
    }

    let base_image = image::base_image_path(&vm.image)?;
    debug!(vm = vm_name, base = %base_image.display(), "base image resolved");

    let instance_disk =
        storage::ensure_instance_disk(project, vm_name, &base_image, vm.disk_size()).await?;

    if !vm.networks.is_empty() {
        let mut store = NetworkStore::load(project)?;
        for net_name in &vm.networks {
            network::ensure_network(project, netlink, &mut store, net_name, config)
                .await
                .with_context(|| format!("failed to set up network {net_name}"))?;
        }
        network::attach_vm(project, netlink, vm_name, vm)
            .await
            .context("failed to set up networks")?;
    }

    let plan = storage::plan_mounts(project, vm_name, vm, config)
        .await
        .context("failed to parse volumes")?;

    // Every VM gets a user-mode SSH NIC, bridged or not, so the host can
    // always reach port 22 on localhost.
    let ssh_port = sshkeys::allocate_ssh_port(project, vm_name, vm)
        .context("failed to allocate SSH port")?;

    let public_key = match sshkeys::ensure_public_key(project).await {
        Ok(key) => key,
        Err(e) => {
            warn!(vm = vm_name, error = %e, "could not get SSH public key");
            String::new()
        }
    };

    let macs = mac_table(&project.name, vm_name, vm, Some(ssh_port));

    let seed_iso = match cloudinit::generate_seed_iso(
        project,
        vm_name,
        &vm.image,
        &public_key,
        &macs,
        &plan,
    )
    .await
    {
        Ok(path) => Some(path),
        Err(e) => {
            warn!(vm = vm_name, error = %e, "failed to generate cloud-init ISO, continuing without seed");
            None
        }
    };

    let console_socket = project.console_socket_path(vm_name)?;
    let command = build_qemu_command(&QemuSpec {
        project_name: &project.name,
        vm_name,
        vm,
        instance_disk: &instance_disk,
        seed_iso: seed_iso.as_deref(),
        console_socket: &console_socket,
        ssh_port: Some(ssh_port),
        plan: &plan,
    });

    let unit = systemd::vm_unit_name(&project.name, vm_name);
    systemd::start(
        Scope::User,
        &unit,
        &format!("qemu-compose VM: {vm_name}"),
        &command,
    )
    .await
    .context("failed to start VM")?;

    info!(vm = vm_name, unit, "VM started");
    Ok(())
}

/// Stop a VM's unit and delete its TAP devices. Bridges, DHCP, NAT and
/// volumes stay in place.
pub async fn stop_vm(
    project: &Project,
    netlink: &Netlink,
    vm_name: &str,
    vm: &VmConfig,
) -> Result<()> {
    let unit = systemd::vm_unit_name(&project.name, vm_name);
    systemd::stop(Scope::User, &unit)
        .await
        .context("failed to stop VM")?;

    if !vm.networks.is_empty() {
        network::detach_vm(project, netlink, vm_name, vm).await;
    }

    info!(vm = vm_name, "VM stopped");
    Ok(())
}

/// Destroy a VM: stop it if needed, delete TAPs, remove the per-VM
/// workspace directory. Named volumes are preserved.
pub async fn destroy_vm(
    project: &Project,
    netlink: &Netlink,
    vm_name: &str,
    vm: &VmConfig,
) -> Result<()> {
    if is_running(project, vm_name).await {
        stop_vm(project, netlink, vm_name, vm).await?;
        println!("  ✓ Stopped");
    } else {
        println!("  ⚠ VM was not running");
        // TAPs may be left over from a crashed run.
        network::detach_vm(project, netlink, vm_name, vm).await;
    }

    storage::remove_instance_dir(project, vm_name)?;
    info!(vm = vm_name, "VM destroyed");
    Ok(())
}

/// Aggregate everything `inspect` shows about one VM.
pub async fn inspect_vm(
    project: &Project,
    netlink: &Netlink,
    config: &ComposeConfig,
    vm_name: &str,
    vm: &VmConfig,
) -> serde_json::Value {
    let os_type = cloudinit::detect_os_from_image(&vm.image);
    let status = vm_status(project, vm_name, &vm.image).await;

    let mut data = json!({
        "name": vm_name,
        "project": project.name,
        "cpu": vm.cpu,
        "memory": vm.memory,
        "image": vm.image,
        "os_type": os_type,
        "default_user": cloudinit::default_user_for_os(os_type),
        "status": status.to_string(),
    });
    let map = data.as_object_mut().expect("inspect data is an object");

    if status != VmStatus::NotCreated {
        map.insert(
            "systemd_unit".into(),
            json!(systemd::vm_unit_name(&project.name, vm_name)),
        );

        if let Ok(Some(disk)) = storage::disk::load_disk_metadata(project, vm_name) {
            map.insert("disk_size".into(), json!(disk.size));
        }
        if let Ok(disk_path) = project.instance_disk_path(vm_name) {
            if disk_path.exists() {
                map.insert("disk_path".into(), json!(disk_path));
            }
            let iso = disk_path.with_file_name("cloud-init.iso");
            if iso.exists() {
                map.insert("cloud_init_iso".into(), json!(iso));
            }
        }
        if let Ok(socket) = project.console_socket_path(vm_name) {
            map.insert("console_socket".into(), json!(socket));
        }
    }

    if vm.has_url_image() {
        if let Ok(base) = image::base_image_path(&vm.image) {
            map.insert("base_image_path".into(), json!(base));
        }
    }

    if vm.networks.is_empty() {
        map.insert("networking_mode".into(), json!("user-mode"));
        if status != VmStatus::NotCreated {
            if let Ok(port) = sshkeys::ssh_port(project, vm_name) {
                map.insert("ssh_port".into(), json!(port));
            }
        }
    } else {
        let store = NetworkStore::load(project).unwrap_or_default();
        let mut networks = Vec::new();

        for (index, net_name) in vm.networks.iter().enumerate() {
            let bridge = network::bridge_name(&project.name, net_name);
            let tap = network::tap_name(&project.name, vm_name, index);

            let mut info = json!({
                "name": net_name,
                "index": index,
                "bridge": bridge,
                "tap_device": tap,
                "mac": network::mac_address(&project.name, vm_name, index),
                "tap_exists": netlink.link_exists(&tap).await.unwrap_or(false),
            });
            let entry = info.as_object_mut().expect("network info is an object");

            if let Some(net_config) = config.networks.get(net_name) {
                entry.insert("driver".into(), json!(net_config.driver_or_default()));
            }
            if let Some(record) = store.get(net_name) {
                entry.insert("subnet".into(), json!(record.subnet));
                if !record.dnsmasq_unit.is_empty() {
                    entry.insert("dhcp_enabled".into(), json!(true));
                    entry.insert(
                        "dhcp_running".into(),
                        json!(network::dnsmasq::is_running(project, net_name).await),
                    );
                }
            }

            networks.push(info);
        }
        map.insert("networks".into(), json!(networks));

        if status.is_up() {
            if let Some(ip) = network::vm_ip_address(project, netlink, vm_name, vm).await {
                map.insert("ip_address".into(), json!(ip));
            }
        }
        if let Ok(port) = sshkeys::ssh_port(project, vm_name) {
            map.insert("ssh_port".into(), json!(port));
        }
    }

    if !vm.ports.is_empty() {
        map.insert("ports".into(), json!(vm.ports));
    }
    if !vm.environment.is_empty() {
        map.insert("environment".into(), json!(vm.environment));
    }
    if !vm.depends_on.is_empty() {
        map.insert("depends_on".into(), json!(vm.depends_on));
    }
    if !vm.provision.is_empty() {
        let provision: Vec<_> = vm
            .provision
            .iter()
            .map(|p| json!({"type": p.kind, "inline": p.inline}))
            .collect();
        map.insert("provision".into(), json!(provision));
    }

    if !vm.volumes.is_empty() {
        let volume_metadata = storage::volume::load_volume_metadata(project).unwrap_or_default();
        let mut volumes = Vec::new();

        for mount in &vm.volumes {
            let mut info = json!({
                "source": mount.source,
                "target": mount.target,
                "read_only": mount.read_only,
                "automount": mount.automount_or_default(),
            });
            let entry = info.as_object_mut().expect("volume info is an object");

            if !mount.mount_options.is_empty() {
                entry.insert("mount_options".into(), json!(mount.mount_options));
            }

            if mount.is_bind_mount() {
                entry.insert("type".into(), json!("bind"));
                if let Ok(host) =
                    storage::volume::resolve_bind_mount_path(&mount.source, &project.compose_path)
                {
                    entry.insert("host_path".into(), json!(host));
                }
            } else {
                entry.insert("type".into(), json!("volume"));
                if let Some(meta) = volume_metadata.get(&mount.source) {
                    entry.insert("volume_size".into(), json!(meta.size));
                    entry.insert("volume_disk_path".into(), json!(meta.disk_path));
                    entry.insert("volume_created".into(), json!(meta.created));
                }
            }

            volumes.push(info);
        }
        map.insert("volumes".into(), json!(volumes));
    }

    data
}

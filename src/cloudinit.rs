//! NoCloud seed generation.
//!
//! Renders `user-data`, `meta-data` and `network-config` for a VM and
//! packs them into `cloud-init.iso` (volume label `cidata`). The output
//! is a pure function of the VM name, image URL, MAC table and mount
//! plan, so re-running `up` regenerates byte-identical seeds.

use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use crate::exec::{self, ExecError};
use crate::project::Project;
use crate::storage::volume::{MountPlan, ResolvedMount};

/// Guess the guest OS family from the image URL.
pub fn detect_os_from_image(image_url: &str) -> &'static str {
    let url = image_url.to_lowercase();
    if url.contains("fedora") {
        "fedora"
    } else if url.contains("ubuntu") {
        "ubuntu"
    } else if url.contains("debian") {
        "debian"
    } else if url.contains("centos") {
        "centos"
    } else if url.contains("rhel") {
        "rhel"
    } else {
        "ubuntu"
    }
}

/// Default cloud-image login user per OS family.
pub fn default_user_for_os(os: &str) -> &'static str {
    match os {
        "fedora" => "fedora",
        "ubuntu" => "ubuntu",
        "debian" => "debian",
        "centos" => "centos",
        "rhel" => "cloud-user",
        _ => "ubuntu",
    }
}

pub fn default_user_for_image(image_url: &str) -> &'static str {
    default_user_for_os(detect_os_from_image(image_url))
}

/// Render the `#cloud-config` user-data document.
pub fn render_user_data(
    os_user: &str,
    ssh_public_key: &str,
    mac_addresses: &[String],
    plan: &MountPlan,
) -> String {
    let mut out = String::new();

    out.push_str("#cloud-config\n");
    out.push_str("growpart:\n");
    out.push_str("  mode: auto\n");
    out.push_str("  devices: ['/']\n");
    out.push_str("  ignore_growroot_disabled: false\n");
    out.push_str("resizefs: true\n");

    out.push_str("users:\n");
    let _ = writeln!(out, "  - name: {os_user}");
    out.push_str("    sudo: ALL=(ALL) NOPASSWD:ALL\n");
    out.push_str("    shell: /bin/bash\n");
    out.push_str("    lock_passwd: false\n");
    if !ssh_public_key.is_empty() {
        out.push_str("    ssh_authorized_keys:\n");
        let _ = writeln!(out, "      - {ssh_public_key}");
    }

    out.push_str("chpasswd:\n");
    out.push_str("  expire: false\n");
    out.push_str("  list: |\n");
    let _ = writeln!(out, "    {os_user}:password");
    out.push_str("ssh_pwauth: true\n");

    if !mac_addresses.is_empty() {
        out.push_str(&render_network_block(mac_addresses));
    }

    if !plan.is_empty() {
        if plan.has_bind_mounts() {
            out.push_str("packages:\n  - 9base\n");
        }

        out.push_str("bootcmd:\n");
        for mount in &plan.mounts {
            let _ = writeln!(out, "  - mkdir -p {}", mount.target());
        }
        if plan.has_bind_mounts() {
            out.push_str("  - modprobe 9p\n");
            out.push_str("  - modprobe 9pnet_virtio\n");
        }

        out.push_str("mounts:\n");
        for mount in &plan.mounts {
            match mount {
                ResolvedMount::Named {
                    guest_device,
                    target,
                    read_only,
                    ..
                } => {
                    let options = if *read_only { "ro" } else { "defaults" };
                    let _ = writeln!(
                        out,
                        "  - [{guest_device}, {target}, ext4, \"{options}\", \"0\", \"2\"]"
                    );
                }
                ResolvedMount::Bind {
                    tag,
                    target,
                    read_only,
                    automount,
                    mount_options,
                    ..
                } => {
                    if !automount {
                        continue;
                    }
                    let options = if mount_options.is_empty() {
                        if *read_only {
                            "trans=virtio,version=9p2000.L,ro".to_string()
                        } else {
                            "trans=virtio,version=9p2000.L".to_string()
                        }
                    } else {
                        mount_options.clone()
                    };
                    let _ = writeln!(
                        out,
                        "  - [{tag}, {target}, 9p, \"{options}\", \"0\", \"0\"]"
                    );
                }
            }
        }
    }

    out
}

/// Version-2 ethernet block keyed by MAC, shared between user-data and
/// the standalone network-config file.
fn render_network_block(mac_addresses: &[String]) -> String {
    let mut out = String::new();
    out.push_str("network:\n  version: 2\n  ethernets:\n");
    for (i, mac) in mac_addresses.iter().enumerate() {
        let _ = writeln!(out, "    net{i}:");
        out.push_str("      match:\n");
        let _ = writeln!(out, "        macaddress: \"{mac}\"");
        out.push_str("      dhcp4: true\n");
        let _ = writeln!(out, "      set-name: net{i}");
    }
    out
}

pub fn render_meta_data(vm_name: &str) -> String {
    format!("instance-id: {vm_name}\nlocal-hostname: {vm_name}\n")
}

pub fn render_network_config(mac_addresses: &[String]) -> String {
    render_network_block(mac_addresses)
}

/// Write the seed files and mint `cloud-init.iso` with the `cidata`
/// volume label.
pub async fn generate_seed_iso(
    project: &Project,
    vm_name: &str,
    image_url: &str,
    ssh_public_key: &str,
    mac_addresses: &[String],
    plan: &MountPlan,
) -> Result<PathBuf> {
    debug!(vm = vm_name, "generating cloud-init seed");

    let instance_dir = project.instance_dir(vm_name)?;
    let seed_dir = instance_dir.join("cloud-init");
    std::fs::create_dir_all(&seed_dir)
        .with_context(|| format!("creating cloud-init directory: {}", seed_dir.display()))?;

    let os_user = default_user_for_image(image_url);
    debug!(vm = vm_name, os_user, "detected guest user");

    let user_data_path = seed_dir.join("user-data");
    std::fs::write(
        &user_data_path,
        render_user_data(os_user, ssh_public_key, mac_addresses, plan),
    )
    .context("writing user-data")?;

    let meta_data_path = seed_dir.join("meta-data");
    std::fs::write(&meta_data_path, render_meta_data(vm_name)).context("writing meta-data")?;

    let mut iso_inputs = vec![user_data_path, meta_data_path];

    if !mac_addresses.is_empty() {
        let network_config_path = seed_dir.join("network-config");
        std::fs::write(&network_config_path, render_network_config(mac_addresses))
            .context("writing network-config")?;
        iso_inputs.push(network_config_path);
    }

    let iso_path = instance_dir.join("cloud-init.iso");
    mint_iso(&iso_path, &iso_inputs).await?;

    info!(vm = vm_name, iso = %iso_path.display(), "cloud-init seed ready");
    Ok(iso_path)
}

/// Pack seed files into an ISO via genisoimage, falling back to mkisofs.
async fn mint_iso(iso_path: &std::path::Path, inputs: &[PathBuf]) -> Result<()> {
    let mut args: Vec<String> = vec![
        "-output".to_string(),
        iso_path.to_string_lossy().into_owned(),
        "-volid".to_string(),
        "cidata".to_string(),
        "-joliet".to_string(),
        "-rock".to_string(),
    ];
    args.extend(inputs.iter().map(|p| p.to_string_lossy().into_owned()));

    match exec::run("genisoimage", &args).await {
        Ok(_) => return Ok(()),
        Err(ExecError::Missing { .. }) => {}
        Err(e) => return Err(e).context("failed to create cloud-init ISO"),
    }

    match exec::run("mkisofs", &args).await {
        Ok(_) => Ok(()),
        Err(ExecError::Missing { .. }) => {
            bail!("neither genisoimage nor mkisofs found (install genisoimage)")
        }
        Err(e) => Err(e).context("failed to create cloud-init ISO"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::volume::{MountPlan, ResolvedMount};

    fn named(device: &str, target: &str, read_only: bool) -> ResolvedMount {
        ResolvedMount::Named {
            volume: "data".into(),
            disk_path: PathBuf::from("/w/volumes/data/volume.qcow2"),
            target: target.into(),
            read_only,
            guest_device: device.into(),
        }
    }

    fn bind(tag: &str, target: &str, automount: bool, options: &str) -> ResolvedMount {
        ResolvedMount::Bind {
            host_path: PathBuf::from("/host/dir"),
            target: target.into(),
            read_only: false,
            automount,
            mount_options: options.into(),
            tag: tag.into(),
        }
    }

    #[test]
    fn os_detection_heuristics() {
        assert_eq!(detect_os_from_image("https://x/Fedora-Cloud-39.qcow2"), "fedora");
        assert_eq!(
            detect_os_from_image("https://cloud-images.ubuntu.com/jammy.img"),
            "ubuntu"
        );
        assert_eq!(detect_os_from_image("https://x/debian-12.qcow2"), "debian");
        assert_eq!(detect_os_from_image("https://x/rhel-9.qcow2"), "rhel");
        assert_eq!(detect_os_from_image("https://x/mystery.img"), "ubuntu");

        assert_eq!(default_user_for_os("rhel"), "cloud-user");
        assert_eq!(default_user_for_os("somethingelse"), "ubuntu");
    }

    #[test]
    fn user_data_has_core_directives() {
        let data = render_user_data("ubuntu", "ssh-ed25519 AAAA test", &[], &MountPlan::default());

        assert!(data.starts_with("#cloud-config\n"));
        assert!(data.contains("growpart:"));
        assert!(data.contains("resizefs: true"));
        assert!(data.contains("- name: ubuntu"));
        assert!(data.contains("sudo: ALL=(ALL) NOPASSWD:ALL"));
        assert!(data.contains("- ssh-ed25519 AAAA test"));
        assert!(data.contains("ubuntu:password"));
        assert!(data.contains("ssh_pwauth: true"));
        assert!(!data.contains("mounts:"));
        assert!(!data.contains("network:"));
    }

    #[test]
    fn user_data_mount_lines_follow_declaration_order() {
        let plan = MountPlan {
            mounts: vec![
                named("/dev/vdb", "/var/lib/db", false),
                bind("mount0", "/etc/app", true, ""),
                named("/dev/vdc", "/var/log/app", true),
            ],
        };
        let data = render_user_data("ubuntu", "", &[], &plan);

        assert!(data.contains("packages:\n  - 9base"));
        assert!(data.contains("- mkdir -p /var/lib/db"));
        assert!(data.contains("- modprobe 9p\n"));
        assert!(data.contains("- modprobe 9pnet_virtio"));

        let vdb = data.find("- [/dev/vdb, /var/lib/db, ext4, \"defaults\", \"0\", \"2\"]").unwrap();
        let p9 = data
            .find("- [mount0, /etc/app, 9p, \"trans=virtio,version=9p2000.L\", \"0\", \"0\"]")
            .unwrap();
        let vdc = data.find("- [/dev/vdc, /var/log/app, ext4, \"ro\", \"0\", \"2\"]").unwrap();
        assert!(vdb < p9 && p9 < vdc, "mounts out of order");
    }

    #[test]
    fn non_automount_bind_is_omitted_but_dir_still_created() {
        let plan = MountPlan {
            mounts: vec![bind("mount0", "/manual", false, "")],
        };
        let data = render_user_data("ubuntu", "", &[], &plan);

        assert!(data.contains("- mkdir -p /manual"));
        assert!(!data.contains("- [mount0"));
    }

    #[test]
    fn custom_mount_options_override_the_default() {
        let plan = MountPlan {
            mounts: vec![bind("mount0", "/fast", true, "trans=virtio,msize=104857600")],
        };
        let data = render_user_data("ubuntu", "", &[], &plan);
        assert!(data.contains("- [mount0, /fast, 9p, \"trans=virtio,msize=104857600\", \"0\", \"0\"]"));
    }

    #[test]
    fn network_config_lists_each_mac() {
        let macs = vec!["52:54:00:aa:bb:cc".to_string(), "52:54:00:11:22:33".to_string()];
        let config = render_network_config(&macs);

        assert!(config.contains("version: 2"));
        assert!(config.contains("net0:"));
        assert!(config.contains("macaddress: \"52:54:00:aa:bb:cc\""));
        assert!(config.contains("net1:"));
        assert!(config.contains("set-name: net1"));
    }

    #[test]
    fn meta_data_names_the_instance() {
        assert_eq!(
            render_meta_data("web"),
            "instance-id: web\nlocal-hostname: web\n"
        );
    }

    #[test]
    fn rendering_is_deterministic() {
        let plan = MountPlan {
            mounts: vec![named("/dev/vdb", "/data", false), bind("mount0", "/cfg", true, "")],
        };
        let macs = vec!["52:54:00:aa:bb:cc".to_string()];
        let a = render_user_data("fedora", "key", &macs, &plan);
        let b = render_user_data("fedora", "key", &macs, &plan);
        assert_eq!(a, b);
    }
}

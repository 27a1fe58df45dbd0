//! QEMU command-line construction.
//!
//! A pure function of the VM's resolved inputs so the supervisor unit,
//! the seed ISO and the host-side fabric always agree on device order
//! and MAC addresses.

use std::path::Path;

use crate::config::VmConfig;
use crate::network::names;
use crate::storage::volume::{MountPlan, ResolvedMount};

pub struct QemuSpec<'a> {
    pub project_name: &'a str,
    pub vm_name: &'a str,
    pub vm: &'a VmConfig,
    pub instance_disk: &'a Path,
    pub seed_iso: Option<&'a Path>,
    pub console_socket: &'a Path,
    pub ssh_port: Option<u16>,
    pub plan: &'a MountPlan,
}

/// Build the argv (including the program) for one VM.
///
/// Order matters: fixed machine arguments, then volumes in declaration
/// order, then L2 NICs in network order, then the user-mode SSH NIC,
/// then the seed cdrom.
pub fn build_qemu_command(spec: &QemuSpec<'_>) -> Vec<String> {
    let mut args = vec![
        "qemu-system-x86_64".to_string(),
        "-name".to_string(),
        spec.vm_name.to_string(),
        "-m".to_string(),
        spec.vm.memory.to_string(),
        "-smp".to_string(),
        spec.vm.cpu.to_string(),
        "-drive".to_string(),
        format!(
            "file={},format=qcow2,if=virtio",
            spec.instance_disk.display()
        ),
        "-nographic".to_string(),
        "-serial".to_string(),
        format!("unix:{},server,nowait", spec.console_socket.display()),
    ];

    for mount in &spec.plan.mounts {
        match mount {
            ResolvedMount::Bind { host_path, tag, .. } => {
                // The virtfs device is attached even when automount is
                // off; the guest can then mount it by hand.
                args.push("-virtfs".to_string());
                args.push(format!(
                    "local,path={},mount_tag={tag},security_model=passthrough,id={tag}",
                    host_path.display()
                ));
            }
            ResolvedMount::Named { disk_path, .. } => {
                args.push("-drive".to_string());
                args.push(format!(
                    "file={},format=qcow2,if=virtio",
                    disk_path.display()
                ));
            }
        }
    }

    for (index, _network) in spec.vm.networks.iter().enumerate() {
        let tap = names::tap_name(spec.project_name, spec.vm_name, index);
        let mac = names::mac_address(spec.project_name, spec.vm_name, index);
        args.push("-netdev".to_string());
        args.push(format!(
            "tap,id=net{index},ifname={tap},script=no,downscript=no"
        ));
        args.push("-device".to_string());
        args.push(format!("virtio-net-pci,netdev=net{index},mac={mac}"));
    }

    if let Some(port) = spec.ssh_port {
        let index = spec.vm.networks.len();
        let mac = names::mac_address(spec.project_name, spec.vm_name, index);
        args.push("-netdev".to_string());
        args.push(format!(
            "user,id=net{index},hostfwd=tcp:127.0.0.1:{port}-:22"
        ));
        args.push("-device".to_string());
        args.push(format!("virtio-net-pci,netdev=net{index},mac={mac}"));
    }

    if let Some(seed_iso) = spec.seed_iso {
        args.push("-drive".to_string());
        args.push(format!(
            "file={},format=raw,if=virtio,media=cdrom",
            seed_iso.display()
        ));
    }

    args
}

/// MAC table for a VM: one entry per declared L2 interface plus one for
/// the user-mode SSH NIC when a port is allocated. Shared by the argv
/// builder above and the cloud-init seed.
pub fn mac_table(project_name: &str, vm_name: &str, vm: &VmConfig, ssh_port: Option<u16>) -> Vec<String> {
    let mut macs: Vec<String> = (0..vm.networks.len())
        .map(|index| names::mac_address(project_name, vm_name, index))
        .collect();

    if ssh_port.is_some() {
        macs.push(names::mac_address(project_name, vm_name, vm.networks.len()));
    }

    macs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn vm(networks: Vec<String>) -> VmConfig {
        VmConfig {
            image: "https://x/cloud.img".into(),
            cpu: 2,
            memory: 2048,
            networks,
            ports: vec![],
            depends_on: vec![],
            volumes: vec![],
            environment: vec![],
            provision: vec![],
            disk: None,
            healthcheck: None,
            ssh: None,
        }
    }

    #[test]
    fn user_mode_vm_argv() {
        let vm = vm(vec![]);
        let plan = MountPlan::default();
        let args = build_qemu_command(&QemuSpec {
            project_name: "proj",
            vm_name: "vm1",
            vm: &vm,
            instance_disk: Path::new("/w/vm1/disk.qcow2"),
            seed_iso: Some(Path::new("/w/vm1/cloud-init.iso")),
            console_socket: Path::new("/w/vm1/console.sock"),
            ssh_port: Some(2222),
            plan: &plan,
        });

        assert_eq!(args[0], "qemu-system-x86_64");
        let joined = args.join(" ");
        assert!(joined.contains("-name vm1"));
        assert!(joined.contains("-m 2048"));
        assert!(joined.contains("-smp 2"));
        assert!(joined.contains("-drive file=/w/vm1/disk.qcow2,format=qcow2,if=virtio"));
        assert!(joined.contains("-serial unix:/w/vm1/console.sock,server,nowait"));
        assert!(joined.contains("-netdev user,id=net0,hostfwd=tcp:127.0.0.1:2222-:22"));
        assert!(joined.contains("file=/w/vm1/cloud-init.iso,format=raw,if=virtio,media=cdrom"));

        let mac = names::mac_address("proj", "vm1", 0);
        assert!(joined.contains(&format!("virtio-net-pci,netdev=net0,mac={mac}")));
    }

    #[test]
    fn bridged_vm_gets_tap_nics_and_a_user_nic() {
        let vm = vm(vec!["frontend".into(), "backend".into()]);
        let plan = MountPlan::default();
        let args = build_qemu_command(&QemuSpec {
            project_name: "proj",
            vm_name: "web",
            vm: &vm,
            instance_disk: Path::new("/w/web/disk.qcow2"),
            seed_iso: None,
            console_socket: Path::new("/w/web/console.sock"),
            ssh_port: Some(2223),
            plan: &plan,
        });
        let joined = args.join(" ");

        let tap0 = names::tap_name("proj", "web", 0);
        let tap1 = names::tap_name("proj", "web", 1);
        assert!(joined.contains(&format!("tap,id=net0,ifname={tap0},script=no,downscript=no")));
        assert!(joined.contains(&format!("tap,id=net1,ifname={tap1},script=no,downscript=no")));

        // The SSH NIC takes the next sequential index.
        assert!(joined.contains("user,id=net2,hostfwd=tcp:127.0.0.1:2223-:22"));
    }

    #[test]
    fn volume_devices_follow_declaration_order() {
        let vm = vm(vec![]);
        let plan = MountPlan {
            mounts: vec![
                ResolvedMount::Named {
                    volume: "data".into(),
                    disk_path: PathBuf::from("/w/volumes/data/volume.qcow2"),
                    target: "/data".into(),
                    read_only: false,
                    guest_device: "/dev/vdb".into(),
                },
                ResolvedMount::Bind {
                    host_path: PathBuf::from("/srv/cfg"),
                    target: "/cfg".into(),
                    read_only: false,
                    automount: false,
                    mount_options: String::new(),
                    tag: "mount0".into(),
                },
            ],
        };
        let args = build_qemu_command(&QemuSpec {
            project_name: "proj",
            vm_name: "db",
            vm: &vm,
            instance_disk: Path::new("/w/db/disk.qcow2"),
            seed_iso: None,
            console_socket: Path::new("/w/db/console.sock"),
            ssh_port: None,
            plan: &plan,
        });
        let joined = args.join(" ");

        // virtfs is attached even with automount off.
        assert!(joined
            .contains("local,path=/srv/cfg,mount_tag=mount0,security_model=passthrough,id=mount0"));

        let volume_pos = joined.find("/w/volumes/data/volume.qcow2").unwrap();
        let virtfs_pos = joined.find("mount_tag=mount0").unwrap();
        assert!(volume_pos < virtfs_pos, "volume args must follow declaration order");

        // No networks, no port: no NICs at all.
        assert!(!joined.contains("-netdev"));
    }

    #[test]
    fn mac_table_covers_l2_and_ssh_nics() {
        let bridged = vm(vec!["frontend".into()]);
        let macs = mac_table("proj", "web", &bridged, Some(2222));
        assert_eq!(macs.len(), 2);
        assert_eq!(macs[0], names::mac_address("proj", "web", 0));
        assert_eq!(macs[1], names::mac_address("proj", "web", 1));

        let user_only = vm(vec![]);
        assert_eq!(mac_table("proj", "vm1", &user_only, Some(2222)).len(), 1);
        assert_eq!(mac_table("proj", "vm1", &user_only, None).len(), 0);
    }
}

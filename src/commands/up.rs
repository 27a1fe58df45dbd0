use std::path::Path;

use anyhow::Result;

use crate::cli::VmSelectionArgs;
use crate::cloudinit;
use crate::commands::common::{self, CommandContext};
use crate::config;
use crate::network::Netlink;
use crate::sshkeys;
use crate::systemd;
use crate::vm;

pub async fn cmd_up(file_flag: Option<&Path>, args: VmSelectionArgs) -> Result<()> {
    let ctx: CommandContext = common::load_context(file_flag)?;
    let _lock = ctx.project.lock()?;

    let vms = config::filter_vms(&ctx.config, &args.vms)?;
    let netlink = Netlink::connect()?;

    common::print_header(&ctx);
    if args.vms.is_empty() {
        println!("Starting {} VM(s)...\n", vms.len());
    } else {
        println!("Starting {} VM(s): {}\n", vms.len(), args.vms.join(", "));
    }

    let mut has_error = false;
    for (vm_name, vm_config) in &vms {
        println!("VM: {vm_name}");

        if !vm_config.has_url_image() {
            println!("  ⚠ Skipping: image is not a URL\n");
            continue;
        }

        if let Err(e) = vm::up_vm(&ctx.project, &netlink, &ctx.config, vm_name, vm_config).await {
            eprintln!("  ✗ Error: {e:#}\n");
            has_error = true;
            continue;
        }

        println!(
            "  ✓ Started (unit: {})",
            systemd::vm_unit_name(&ctx.project.name, vm_name)
        );

        if vm_config.networks.is_empty() {
            if let Ok(port) = sshkeys::ssh_port(&ctx.project, vm_name) {
                let user = cloudinit::default_user_for_image(&vm_config.image);
                println!("  SSH: ssh -i .qemu-compose/ssh/id_ed25519 -p {port} {user}@localhost");
            }
        } else {
            println!(
                "  Networking: bridge mode (networks: {})",
                vm_config.networks.join(", ")
            );
            println!("  Note: VM will obtain IP via DHCP on the bridge network");
        }

        println!(
            "  View logs: journalctl --user -u {} -f",
            systemd::vm_unit_name(&ctx.project.name, vm_name)
        );
        println!("  Attach to console: qemu-compose console {vm_name}\n");
    }

    if has_error {
        anyhow::bail!("some VMs failed to start");
    }

    println!("✓ All VMs started successfully");
    Ok(())
}

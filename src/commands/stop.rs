use std::path::Path;

use anyhow::Result;

use crate::cli::VmSelectionArgs;
use crate::commands::common;
use crate::config;
use crate::network::Netlink;
use crate::vm;

pub async fn cmd_stop(file_flag: Option<&Path>, args: VmSelectionArgs) -> Result<()> {
    let ctx = common::load_context(file_flag)?;
    let _lock = ctx.project.lock()?;

    let vms = config::filter_vms(&ctx.config, &args.vms)?;
    let netlink = Netlink::connect()?;

    common::print_header(&ctx);
    if args.vms.is_empty() {
        println!("Stopping {} VM(s)...\n", vms.len());
    } else {
        println!("Stopping {} VM(s): {}\n", vms.len(), args.vms.join(", "));
    }

    let mut has_error = false;
    for (vm_name, vm_config) in &vms {
        println!("VM: {vm_name}");

        if !vm::is_running(&ctx.project, vm_name).await {
            println!("  ⚠ VM is not running\n");
            continue;
        }

        if let Err(e) = vm::stop_vm(&ctx.project, &netlink, vm_name, vm_config).await {
            eprintln!("  ✗ Error stopping VM: {e:#}\n");
            has_error = true;
            continue;
        }

        println!("  ✓ Stopped\n");
    }

    if has_error {
        anyhow::bail!("some VMs failed to stop");
    }

    println!("✓ All VMs stopped successfully");
    Ok(())
}

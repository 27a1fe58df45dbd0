use std::path::Path;

use anyhow::Result;
use tracing::warn;

use crate::cli::VmSelectionArgs;
use crate::commands::common;
use crate::config;
use crate::network::{self, Netlink, NetworkStore};
use crate::vm;

pub async fn cmd_destroy(file_flag: Option<&Path>, args: VmSelectionArgs) -> Result<()> {
    let ctx = common::load_context(file_flag)?;
    let _lock = ctx.project.lock()?;

    let vms = config::filter_vms(&ctx.config, &args.vms)?;
    let netlink = Netlink::connect()?;

    common::print_header(&ctx);
    if args.vms.is_empty() {
        println!("Stopping and removing {} VM(s)...\n", vms.len());
    } else {
        println!(
            "Stopping and removing {} VM(s): {}\n",
            vms.len(),
            args.vms.join(", ")
        );
    }

    let mut has_error = false;
    for (vm_name, vm_config) in &vms {
        println!("VM: {vm_name}");

        if let Err(e) = vm::destroy_vm(&ctx.project, &netlink, vm_name, vm_config).await {
            eprintln!("  ✗ Error: {e:#}\n");
            has_error = true;
            continue;
        }

        println!("  ✓ Instance disk removed\n");
    }

    // Destroying the whole project also takes down bridges, DHCP and NAT.
    // Named volumes are always preserved.
    if args.vms.is_empty() && !ctx.config.networks.is_empty() {
        println!("Cleaning up project network infrastructure...");

        let mut store = NetworkStore::load(&ctx.project)?;
        for net_name in ctx.config.networks.keys() {
            match network::teardown_network(&ctx.project, &netlink, &mut store, net_name).await {
                Ok(()) => {
                    let bridge = network::bridge_name(&ctx.project.name, net_name);
                    println!("  ✓ Deleted bridge: {bridge} (network: {net_name})");
                }
                Err(e) => {
                    eprintln!("  ✗ Failed to tear down network {net_name}: {e:#}");
                    has_error = true;
                }
            }
        }

        // Drop records for networks no longer in the compose file too.
        let stale: Vec<String> = store.networks().keys().cloned().collect();
        for net_name in stale {
            if let Err(e) = network::teardown_network(&ctx.project, &netlink, &mut store, &net_name).await
            {
                warn!(network = %net_name, error = %e, "failed to tear down stale network");
            }
        }

        println!("  ✓ Removed network metadata\n");
    }

    if has_error {
        anyhow::bail!("some VMs failed to be destroyed");
    }

    println!("✓ All VMs stopped and removed successfully");
    Ok(())
}

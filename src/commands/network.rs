use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use anyhow::{bail, Result};

use crate::cli::NetworkDownArgs;
use crate::commands::common;
use crate::config::VmConfig;
use crate::network::{self, dnsmasq, subnet, Netlink, NetworkStore};
use crate::vm;

/// `network ls`: networks, bridges, DHCP servers, TAPs, capabilities.
pub async fn cmd_network_ls(file_flag: Option<&Path>) -> Result<()> {
    let ctx = common::load_context(file_flag)?;
    let netlink = Netlink::connect()?;
    let store = NetworkStore::load(&ctx.project)?;

    common::print_header(&ctx);
    println!();

    if ctx.config.networks.is_empty() {
        println!("No networks defined in compose file\n");
    } else {
        println!("=== Networks ===");
        println!(
            "{:<20} {:<10} {:<20} {:<15} {:<10} {}",
            "NAME", "DRIVER", "SUBNET", "BRIDGE", "DHCP", "DNSMASQ UNIT"
        );
        println!("{}", "-".repeat(110));

        for (net_name, net_config) in &ctx.config.networks {
            let bridge = network::bridge_name(&ctx.project.name, net_name);
            let mut subnet_text = "not allocated".to_string();
            let mut dhcp = "no".to_string();
            let mut unit = "-".to_string();

            if let Some(record) = store.get(net_name) {
                subnet_text = record.subnet.clone();
                if !record.dnsmasq_unit.is_empty() {
                    unit = record.dnsmasq_unit.clone();
                }
                if record.dnsmasq_active {
                    dhcp = if dnsmasq::is_running(&ctx.project, net_name).await {
                        "yes".to_string()
                    } else {
                        "stopped".to_string()
                    };
                }
            }

            println!(
                "{:<20} {:<10} {:<20} {:<15} {:<10} {}",
                net_name,
                net_config.driver_or_default(),
                subnet_text,
                bridge,
                dhcp,
                unit
            );
        }
        println!();

        println!("=== Bridges ===");
        for net_name in ctx.config.networks.keys() {
            let bridge = network::bridge_name(&ctx.project.name, net_name);
            println!("Bridge: {bridge} (network: {net_name})");

            if !netlink.link_exists(&bridge).await.unwrap_or(false) {
                println!("  Status: not created\n");
                continue;
            }

            println!("  Status: active");
            if let Ok(Some(mtu)) = netlink.link_mtu(&bridge).await {
                println!("  MTU: {mtu}");
            }
            let up = netlink.link_is_up(&bridge).await.unwrap_or(false);
            println!("  State: {}", if up { "UP" } else { "DOWN" });
            println!();
        }
    }

    if !store.networks().is_empty() {
        println!("=== DHCP Servers (dnsmasq) ===");
        let mut any = false;
        for (net_name, record) in store.networks() {
            if record.dnsmasq_unit.is_empty() {
                continue;
            }
            any = true;

            let running = dnsmasq::is_running(&ctx.project, net_name).await;
            println!("Network: {net_name}");
            println!("  Unit: {}", record.dnsmasq_unit);
            println!("  Status: {}", if running { "running" } else { "stopped" });
            println!("  Subnet: {}", record.subnet);
            if running {
                if let Ok((start, end)) = subnet::dhcp_range(&record.subnet) {
                    println!("  DHCP Range: {start} - {end}");
                }
            }
            println!();
        }
        if !any {
            println!("No DHCP servers configured\n");
        }
    }

    println!("=== TAP Devices ===");
    let mut any_tap = false;
    for (vm_name, vm_config) in &ctx.config.vms {
        for (index, net_name) in vm_config.networks.iter().enumerate() {
            let tap = network::tap_name(&ctx.project.name, vm_name, index);
            if !netlink.link_exists(&tap).await.unwrap_or(false) {
                continue;
            }
            any_tap = true;

            println!("TAP: {tap} (VM: {vm_name}, network: {net_name})");
            if let Ok(Some(mtu)) = netlink.link_mtu(&tap).await {
                println!("  MTU: {mtu}");
            }
            let up = netlink.link_is_up(&tap).await.unwrap_or(false);
            println!("  State: {}", if up { "UP" } else { "DOWN" });
            if let Ok(Some(master)) = netlink.link_master(&tap).await {
                println!("  Attached to: {master}");
            }
            println!();
        }
    }
    if !any_tap {
        println!("No TAP devices found\n");
    }

    println!("=== Network Capabilities ===");
    if netlink.can_create_bridges().await {
        println!("✅ Can create bridges (sufficient privileges)");
    } else {
        println!("❌ Cannot create bridges");
        if let Ok(exe) = std::env::current_exe() {
            println!("   To grant: sudo setcap cap_net_admin+ep {}", exe.display());
        }
    }

    Ok(())
}

/// `network down`: stop affected VMs, delete their TAPs, then tear the
/// selected networks' fabric down.
pub async fn cmd_network_down(file_flag: Option<&Path>, args: NetworkDownArgs) -> Result<()> {
    let ctx = common::load_context(file_flag)?;
    let _lock = ctx.project.lock()?;
    let netlink = Netlink::connect()?;

    common::print_header(&ctx);
    println!();

    let selected: Vec<String> = if args.networks.is_empty() {
        ctx.config.networks.keys().cloned().collect()
    } else {
        for name in &args.networks {
            if !ctx.config.networks.contains_key(name) {
                bail!("network not found in compose file: {name}");
            }
        }
        args.networks.clone()
    };

    if selected.is_empty() {
        println!("No networks to destroy");
        return Ok(());
    }

    let affected: BTreeMap<&str, &VmConfig> = ctx
        .config
        .vms
        .iter()
        .filter(|(_, vm)| vm.networks.iter().any(|n| selected.contains(n)))
        .map(|(name, vm)| (name.as_str(), vm))
        .collect();

    if !affected.is_empty() && !args.force {
        println!("Warning: The following VMs are using these networks:");
        for (vm_name, vm_config) in &affected {
            println!("  - {vm_name} (networks: {})", vm_config.networks.join(", "));
        }
        println!();
        print!("These VMs will be stopped. Continue? [y/N]: ");
        std::io::stdout().flush()?;

        let mut response = String::new();
        std::io::stdin().read_line(&mut response)?;
        let response = response.trim().to_lowercase();
        if response != "y" && response != "yes" {
            println!("Aborted");
            return Ok(());
        }
        println!();
    }

    if !affected.is_empty() {
        println!("Stopping VMs...");
        for (vm_name, vm_config) in &affected {
            if vm::is_running(&ctx.project, vm_name).await {
                match vm::stop_vm(&ctx.project, &netlink, vm_name, vm_config).await {
                    Ok(()) => println!("  ✓ Stopped {vm_name}"),
                    Err(e) => eprintln!("  ✗ Failed to stop {vm_name}: {e:#}"),
                }
            } else {
                // stop_vm removes TAPs only for running VMs; sweep here.
                network::detach_vm(&ctx.project, &netlink, vm_name, vm_config).await;
            }
        }
        println!();
    }

    println!("Cleaning up network infrastructure...");
    let mut store = NetworkStore::load(&ctx.project)?;
    let mut has_error = false;
    for net_name in &selected {
        match network::teardown_network(&ctx.project, &netlink, &mut store, net_name).await {
            Ok(()) => {
                let bridge = network::bridge_name(&ctx.project.name, net_name);
                println!("  ✓ Deleted bridge: {bridge} (network: {net_name})");
            }
            Err(e) => {
                eprintln!("  ✗ Failed to delete bridge for network {net_name}: {e:#}");
                has_error = true;
            }
        }
    }
    println!("  ✓ Removed network metadata");

    if has_error {
        bail!("network cleanup finished with errors");
    }

    println!("\n✓ Network cleanup completed");
    Ok(())
}

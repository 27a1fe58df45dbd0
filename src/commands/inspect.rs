use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::Value;

use crate::cli::InspectArgs;
use crate::commands::common;
use crate::network::Netlink;
use crate::vm;

pub async fn cmd_inspect(file_flag: Option<&Path>, args: InspectArgs) -> Result<()> {
    let ctx = common::load_context(file_flag)?;

    let vm_config = ctx
        .config
        .vms
        .get(&args.vm)
        .with_context(|| format!("VM not found in compose file: {}", args.vm))?;

    let netlink = Netlink::connect()?;
    let data = vm::inspect_vm(&ctx.project, &netlink, &ctx.config, &args.vm, vm_config).await;

    match args.format.as_str() {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&data)?);
        }
        "text" => print_text(&args.vm, &data),
        other => bail!("unknown output format: {other} (expected text or json)"),
    }

    Ok(())
}

fn field<'a>(data: &'a Value, key: &str) -> Option<&'a str> {
    data.get(key).and_then(Value::as_str)
}

fn print_text(vm_name: &str, data: &Value) {
    println!("VM: {vm_name}");
    if let Some(project) = field(data, "project") {
        println!("Project: {project}");
    }
    println!("{}", "=".repeat(80));
    println!();

    println!("Status:");
    println!("  State: {}", field(data, "status").unwrap_or("unknown"));
    if let Some(unit) = field(data, "systemd_unit") {
        println!("  Systemd Unit: {unit}");
    }
    println!();

    println!("Configuration:");
    println!("  CPU: {}", data["cpu"]);
    println!("  Memory: {} MB", data["memory"]);
    println!("  Image: {}", field(data, "image").unwrap_or("-"));
    println!("  OS Type: {}", field(data, "os_type").unwrap_or("-"));
    println!("  Default User: {}", field(data, "default_user").unwrap_or("-"));
    println!();

    println!("Disk:");
    if let Some(size) = field(data, "disk_size") {
        println!("  Size: {size}");
    }
    if let Some(path) = field(data, "disk_path") {
        println!("  Instance Disk: {path}");
    }
    if let Some(path) = field(data, "base_image_path") {
        println!("  Base Image: {path}");
    }
    if let Some(path) = field(data, "cloud_init_iso") {
        println!("  Cloud-Init ISO: {path}");
    }
    println!();

    if let Some(networks) = data.get("networks").and_then(Value::as_array) {
        println!("Networks:");
        for net in networks {
            println!("  - {}:", field(net, "name").unwrap_or("-"));
            if let Some(driver) = field(net, "driver") {
                println!("      Driver: {driver}");
            }
            if let Some(bridge) = field(net, "bridge") {
                println!("      Bridge: {bridge}");
            }
            if let Some(tap) = field(net, "tap_device") {
                let exists = net
                    .get("tap_exists")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                println!("      TAP Device: {tap} ({})", if exists { "present" } else { "absent" });
            }
            if let Some(mac) = field(net, "mac") {
                println!("      MAC: {mac}");
            }
            if let Some(subnet) = field(net, "subnet") {
                println!("      Subnet: {subnet}");
            }
            if net.get("dhcp_enabled").and_then(Value::as_bool) == Some(true) {
                let running = net
                    .get("dhcp_running")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                println!("      DHCP: {}", if running { "running" } else { "stopped" });
            }
        }
        if let Some(ip) = field(data, "ip_address") {
            println!("  IP Address: {ip}");
        }
    } else {
        println!("Networking:");
        println!("  Mode: user-mode (NAT)");
    }
    if let Some(port) = data.get("ssh_port").and_then(Value::as_u64) {
        println!("  SSH Port: {port}");
        println!(
            "  SSH Command: ssh -i .qemu-compose/ssh/id_ed25519 -p {port} {}@localhost",
            field(data, "default_user").unwrap_or("ubuntu")
        );
    }
    println!();

    if let Some(ports) = data.get("ports").and_then(Value::as_array) {
        println!("Port Mappings:");
        for port in ports {
            println!("  - {}", port.as_str().unwrap_or("-"));
        }
        println!();
    }

    if let Some(volumes) = data.get("volumes").and_then(Value::as_array) {
        println!("Volumes:");
        for vol in volumes {
            println!(
                "  - {} -> {} ({})",
                field(vol, "source").unwrap_or("-"),
                field(vol, "target").unwrap_or("-"),
                field(vol, "type").unwrap_or("-"),
            );
            if let Some(host) = field(vol, "host_path") {
                println!("      Host Path: {host}");
            }
            if let Some(size) = field(vol, "volume_size") {
                println!("      Size: {size}");
            }
            if let Some(disk) = field(vol, "volume_disk_path") {
                println!("      Disk Path: {disk}");
            }
            if vol.get("read_only").and_then(Value::as_bool) == Some(true) {
                println!("      Read-Only: true");
            }
            if vol.get("automount").and_then(Value::as_bool) == Some(false) {
                println!("      Automount: false");
            }
            if let Some(opts) = field(vol, "mount_options") {
                println!("      Mount Options: {opts}");
            }
        }
        println!();
    }

    if let Some(env) = data.get("environment").and_then(Value::as_array) {
        println!("Environment Variables:");
        for entry in env {
            println!("  - {}", entry.as_str().unwrap_or("-"));
        }
        println!();
    }

    if let Some(deps) = data.get("depends_on").and_then(Value::as_array) {
        println!("Dependencies:");
        for dep in deps {
            println!("  - {}", dep.as_str().unwrap_or("-"));
        }
        println!();
    }

    if let Some(socket) = field(data, "console_socket") {
        println!("Console:");
        println!("  Socket: {socket}");
        println!("  Attach: qemu-compose console {vm_name}");
        println!();
    }

    if let Some(unit) = field(data, "systemd_unit") {
        println!("Logs:");
        println!("  View: journalctl --user -u {unit} -f");
    }
}

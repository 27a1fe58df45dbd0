use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::task::JoinSet;

use crate::cli::PsArgs;
use crate::commands::common::{self, CommandContext};
use crate::network::{self, Netlink};
use crate::project::Project;
use crate::storage;
use crate::systemd;
use crate::vm::{self, VmStatus};

const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const WAIT_TIMEOUT: Duration = Duration::from_secs(300);

struct VmRow {
    status: VmStatus,
    ip: String,
    disk_size: String,
}

pub async fn cmd_ps(file_flag: Option<&Path>, args: PsArgs) -> Result<()> {
    let ctx = common::load_context(file_flag)?;

    if args.wait {
        common::print_header(&ctx);
        println!("Waiting for all VMs to be ready...\n");
        wait_until_ready(&ctx).await?;
    }

    common::print_header(&ctx);
    println!();
    println!(
        "{:<20} {:<15} {:<15} {:<10} {:<10} {:<10} {}",
        "NAME", "STATUS", "IP ADDRESS", "CPU", "MEMORY", "DISK", "SYSTEMD UNIT"
    );
    println!("{}", "-".repeat(120));

    // Readiness probes block on SSH timeouts, so fan out one task per VM.
    let mut probes: JoinSet<(String, VmRow)> = JoinSet::new();
    for (vm_name, vm_config) in &ctx.config.vms {
        let project = ctx.project.clone();
        let vm_name = vm_name.clone();
        let vm_config = vm_config.clone();

        probes.spawn(async move {
            let row = query_vm(&project, &vm_name, &vm_config).await;
            (vm_name, row)
        });
    }

    let mut rows: BTreeMap<String, VmRow> = BTreeMap::new();
    while let Some(result) = probes.join_next().await {
        if let Ok((vm_name, row)) = result {
            rows.insert(vm_name, row);
        }
    }

    for (vm_name, vm_config) in &ctx.config.vms {
        let Some(row) = rows.get(vm_name) else {
            continue;
        };
        let unit = if row.status == VmStatus::NotCreated {
            "-".to_string()
        } else {
            systemd::vm_unit_name(&ctx.project.name, vm_name)
        };

        println!(
            "{:<20} {:<15} {:<15} {:<10} {:<10} {:<10} {}",
            vm_name,
            row.status.to_string(),
            row.ip,
            vm_config.cpu,
            vm_config.memory,
            row.disk_size,
            unit,
        );
    }

    Ok(())
}

async fn query_vm(project: &Project, vm_name: &str, vm_config: &crate::config::VmConfig) -> VmRow {
    let status = vm::vm_status(project, vm_name, &vm_config.image).await;

    let disk_size = if status == VmStatus::NotCreated {
        "-".to_string()
    } else {
        match storage::disk::load_disk_metadata(project, vm_name) {
            Ok(Some(metadata)) => metadata.size,
            _ => "unknown".to_string(),
        }
    };

    let mut ip = "-".to_string();
    if !vm_config.networks.is_empty() && status.is_up() {
        if let Ok(netlink) = Netlink::connect() {
            if let Some(addr) = network::vm_ip_address(project, &netlink, vm_name, vm_config).await
            {
                ip = addr;
            }
        }
    }

    VmRow {
        status,
        ip,
        disk_size,
    }
}

/// Poll every VM until all are ready or active, with a 5 minute budget.
async fn wait_until_ready(ctx: &CommandContext) -> Result<()> {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    let mut ticker = tokio::time::interval(WAIT_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let mut not_ready = Vec::new();
        for (vm_name, vm_config) in &ctx.config.vms {
            if !vm_config.has_url_image() {
                continue;
            }
            let status = vm::vm_status(&ctx.project, vm_name, &vm_config.image).await;
            if !matches!(status, VmStatus::Ready | VmStatus::Active) {
                not_ready.push(format!("{vm_name} ({status})"));
            }
        }

        if not_ready.is_empty() {
            println!("\n✓ All VMs are ready\n");
            return Ok(());
        }

        print!("\rWaiting for: {}", not_ready.join(", "));
        use std::io::Write;
        let _ = std::io::stdout().flush();

        if tokio::time::Instant::now() >= deadline {
            println!();
            bail!("timeout waiting for VMs to be ready");
        }
    }
}

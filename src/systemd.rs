//! Supervisor adapter.
//!
//! VMs and DHCP side-cars run as transient systemd units: VMs in the
//! user session, dnsmasq in the system session (it binds the DHCP port).
//! Units are `--collect` so the manager reaps them on stop, with
//! `KillMode=mixed` so QEMU gets the signal directly.

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::exec::{self, ExecError};

/// Which session manager owns a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// `systemd-run --user`; no privileges required.
    User,
    /// `systemd-run --system` through the elevation helper.
    System,
}

pub fn vm_unit_name(project: &str, vm_name: &str) -> String {
    format!(
        "qemu-compose-{}-{}",
        project.replace(' ', "-"),
        vm_name.replace(' ', "-")
    )
}

pub fn dnsmasq_unit_name(project: &str, network: &str) -> String {
    format!(
        "qemu-compose-dnsmasq-{}-{}",
        project.replace(' ', "-"),
        network.replace(' ', "-")
    )
}

/// Register `command` as a transient service unit and start it.
pub async fn start(scope: Scope, unit: &str, description: &str, command: &[String]) -> Result<()> {
    let unit_arg = format!("--unit={unit}");
    let desc_arg = format!("--description={description}");

    let mut args: Vec<&str> = vec![
        match scope {
            Scope::User => "--user",
            Scope::System => "--system",
        },
        &unit_arg,
        &desc_arg,
        "--collect",
        "--property=KillMode=mixed",
        "--property=Type=simple",
    ];
    args.extend(command.iter().map(String::as_str));

    debug!(unit, ?scope, "registering transient unit");
    match scope {
        Scope::User => exec::run("systemd-run", &args).await,
        Scope::System => exec::run_elevated("systemd-run", &args).await,
    }
    .with_context(|| format!("failed to start unit {unit}"))?;

    info!(unit, "unit started");
    Ok(())
}

/// Stop a unit. "Not loaded" is success so stop stays idempotent.
pub async fn stop(scope: Scope, unit: &str) -> Result<()> {
    let result = match scope {
        Scope::User => exec::run("systemctl", &["--user", "stop", unit]).await,
        Scope::System => exec::run_elevated("systemctl", &["stop", unit]).await,
    };

    match result {
        Ok(_) => {
            info!(unit, "unit stopped");
            Ok(())
        }
        Err(ExecError::Failed { ref stderr, .. })
            if stderr.contains("not loaded") || stderr.contains("not found") =>
        {
            debug!(unit, "unit was not loaded");
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("failed to stop unit {unit}")),
    }
}

/// Whether the unit's active-state is `active`.
pub async fn is_active(scope: Scope, unit: &str) -> Result<bool> {
    // `is-active` exits non-zero for anything but active; only spawn
    // failures are real errors here.
    let result = match scope {
        Scope::User => exec::run_raw("systemctl", &["--user", "is-active", unit]).await,
        Scope::System => exec::run_elevated_raw("systemctl", &["is-active", unit]).await,
    };

    let output = result.with_context(|| format!("failed to query unit {unit}"))?;
    let state = String::from_utf8_lossy(&output.stdout);
    Ok(state.trim() == "active")
}

/// The raw `ActiveState` property, for the status decision table.
pub async fn active_state(scope: Scope, unit: &str) -> Result<String> {
    let args_user = ["--user", "show", unit, "--property=ActiveState", "--value"];
    let args_system = ["show", unit, "--property=ActiveState", "--value"];

    let output = match scope {
        Scope::User => exec::run("systemctl", &args_user).await,
        Scope::System => exec::run_elevated("systemctl", &args_system).await,
    }
    .with_context(|| format!("failed to query unit {unit}"))?;

    Ok(output.trim().to_string())
}

/// Last `lines` journal lines of a unit.
pub async fn recent_logs(scope: Scope, unit: &str, lines: u32) -> Result<String> {
    let count = lines.to_string();
    match scope {
        Scope::User => {
            exec::run(
                "journalctl",
                &["--user", "-u", unit, "-n", &count, "--no-pager"],
            )
            .await
        }
        Scope::System => {
            exec::run_elevated("journalctl", &["-u", unit, "-n", &count, "--no-pager"]).await
        }
    }
    .with_context(|| format!("failed to read journal for unit {unit}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_names_are_deterministic() {
        assert_eq!(vm_unit_name("proj", "web"), "qemu-compose-proj-web");
        assert_eq!(
            dnsmasq_unit_name("proj", "frontend"),
            "qemu-compose-dnsmasq-proj-frontend"
        );
    }

    #[test]
    fn unit_names_sanitize_spaces() {
        assert_eq!(vm_unit_name("my proj", "a vm"), "qemu-compose-my-proj-a-vm");
    }
}

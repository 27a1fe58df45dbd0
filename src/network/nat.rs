//! NAT and forwarding rules.
//!
//! Rules live in shared iptables chains, so every append is preceded by
//! a `-C` probe and every delete tolerates an already-missing rule.
//! Failures here degrade guest egress but never abort a bring-up.

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::exec;

/// Enable forwarding and install MASQUERADE plus per-bridge FORWARD
/// accept rules for a network's subnet.
pub async fn setup_nat(bridge_name: &str, subnet: &str) -> Result<()> {
    debug!(bridge = bridge_name, subnet, "setting up NAT");

    exec::run_elevated("sysctl", &["-w", "net.ipv4.ip_forward=1"])
        .await
        .context("failed to enable IP forwarding")?;

    append_rule_if_missing(&["-t", "nat", "POSTROUTING", "-s", subnet, "-j", "MASQUERADE"])
        .await
        .context("failed to add NAT rule")?;

    append_rule_if_missing(&["FORWARD", "-i", bridge_name, "-j", "ACCEPT"])
        .await
        .context("failed to add forward rule (input)")?;

    append_rule_if_missing(&["FORWARD", "-o", bridge_name, "-j", "ACCEPT"])
        .await
        .context("failed to add forward rule (output)")?;

    info!(bridge = bridge_name, subnet, "NAT configured");
    Ok(())
}

/// Remove the rules `setup_nat` installed. Missing rules are warnings;
/// cleanup keeps going.
pub async fn cleanup_nat(bridge_name: &str, subnet: &str) {
    debug!(bridge = bridge_name, subnet, "cleaning up NAT");

    delete_rule_if_present(&["-t", "nat", "POSTROUTING", "-s", subnet, "-j", "MASQUERADE"]).await;
    delete_rule_if_present(&["FORWARD", "-i", bridge_name, "-j", "ACCEPT"]).await;
    delete_rule_if_present(&["FORWARD", "-o", bridge_name, "-j", "ACCEPT"]).await;
}

/// Probe with `-C`; append with `-A` only when the probe fails.
/// `rule` starts with an optional `-t <table>` pair followed by the
/// chain and match arguments.
async fn append_rule_if_missing(rule: &[&str]) -> Result<()> {
    if rule_exists(rule).await? {
        debug!(rule = rule.join(" "), "iptables rule already present");
        return Ok(());
    }

    let args = with_action(rule, "-A");
    exec::run_elevated("iptables", &args)
        .await
        .with_context(|| format!("iptables {}", args.join(" ")))?;
    debug!(rule = rule.join(" "), "iptables rule appended");
    Ok(())
}

async fn delete_rule_if_present(rule: &[&str]) {
    match rule_exists(rule).await {
        Ok(false) => {
            warn!(rule = rule.join(" "), "iptables rule already absent");
        }
        Ok(true) => {
            let args = with_action(rule, "-D");
            if let Err(e) = exec::run_elevated("iptables", &args).await {
                warn!(rule = rule.join(" "), error = %e, "failed to remove iptables rule");
            }
        }
        Err(e) => {
            warn!(rule = rule.join(" "), error = %e, "failed to probe iptables rule");
        }
    }
}

async fn rule_exists(rule: &[&str]) -> Result<bool> {
    let args = with_action(rule, "-C");
    let output = exec::run_elevated_raw("iptables", &args)
        .await
        .context("running iptables -C")?;
    Ok(output.status.success())
}

/// Splice the action flag in after the optional `-t <table>` prefix.
fn with_action<'a>(rule: &[&'a str], action: &'a str) -> Vec<&'a str> {
    let mut args: Vec<&str> = Vec::with_capacity(rule.len() + 1);
    let table_prefix = rule.first() == Some(&"-t");
    if table_prefix {
        args.extend_from_slice(&rule[..2]);
        args.push(action);
        args.extend_from_slice(&rule[2..]);
    } else {
        args.push(action);
        args.extend_from_slice(rule);
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_splices_after_table() {
        assert_eq!(
            with_action(&["-t", "nat", "POSTROUTING", "-s", "172.16.0.0/24"], "-A"),
            vec!["-t", "nat", "-A", "POSTROUTING", "-s", "172.16.0.0/24"]
        );
        assert_eq!(
            with_action(&["FORWARD", "-i", "qc-p-net", "-j", "ACCEPT"], "-D"),
            vec!["-D", "FORWARD", "-i", "qc-p-net", "-j", "ACCEPT"]
        );
    }
}

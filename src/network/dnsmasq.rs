//! Per-network DHCP side-car.
//!
//! One dnsmasq per bridge, registered as a system-session transient unit
//! (DHCP needs port 67). DNS answering is disabled; the process runs in
//! the foreground and logs every DHCP event to the journal, which later
//! serves as the lease database for IP introspection.

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::network::store::NetworkStore;
use crate::network::subnet;
use crate::project::Project;
use crate::systemd::{self, Scope};

/// Start dnsmasq for a network unless it is already running, and record
/// the unit in the store.
pub async fn start(
    project: &Project,
    store: &mut NetworkStore,
    network: &str,
    bridge_name: &str,
    net_subnet: &str,
) -> Result<()> {
    let unit = systemd::dnsmasq_unit_name(&project.name, network);

    if systemd::is_active(Scope::System, &unit).await.unwrap_or(false) {
        debug!(network, unit, "dnsmasq already running");
        return Ok(());
    }

    let (range_start, range_end) = subnet::dhcp_range(net_subnet)?;
    let gateway = subnet::gateway(net_subnet)?;
    let netmask = subnet::netmask(net_subnet)?;

    let command = vec![
        "dnsmasq".to_string(),
        format!("--interface={bridge_name}"),
        "--bind-interfaces".to_string(),
        format!("--dhcp-range={range_start},{range_end},12h"),
        format!("--dhcp-option=1,{netmask}"),
        format!("--dhcp-option=3,{gateway}"),
        format!("--dhcp-option=6,{gateway}"),
        "--port=0".to_string(),
        "--leasefile-ro".to_string(),
        "--no-daemon".to_string(),
        "--log-dhcp".to_string(),
        "--log-facility=-".to_string(),
    ];

    systemd::start(
        Scope::System,
        &unit,
        &format!("qemu-compose dnsmasq for network: {network}"),
        &command,
    )
    .await
    .with_context(|| format!("failed to start dnsmasq for network {network}"))?;

    if let Some(record) = store.get_mut(network) {
        record.dnsmasq_unit = unit.clone();
        record.dnsmasq_active = true;
        store.save(project)?;
    }

    info!(network, unit, "dnsmasq started");
    Ok(())
}

/// Stop a network's dnsmasq and clear the liveness flag.
pub async fn stop(project: &Project, store: &mut NetworkStore, network: &str) -> Result<()> {
    let unit = systemd::dnsmasq_unit_name(&project.name, network);

    if let Err(e) = systemd::stop(Scope::System, &unit).await {
        warn!(network, unit, error = %e, "failed to stop dnsmasq unit");
    }

    if let Some(record) = store.get_mut(network) {
        record.dnsmasq_active = false;
        store.save(project)?;
    }

    debug!(network, unit, "dnsmasq stopped");
    Ok(())
}

pub async fn is_running(project: &Project, network: &str) -> bool {
    let unit = systemd::dnsmasq_unit_name(&project.name, network);
    systemd::is_active(Scope::System, &unit).await.unwrap_or(false)
}

/// Latest DHCP lease for `mac` according to the unit's journal, scanning
/// newest lines first for `DHCPACK`/`DHCPREPLY` entries.
pub async fn lease_for_mac(project: &Project, network: &str, mac: &str) -> Option<String> {
    let unit = systemd::dnsmasq_unit_name(&project.name, network);

    let logs = match systemd::recent_logs(Scope::System, &unit, 100).await {
        Ok(logs) => logs,
        Err(e) => {
            debug!(network, error = %e, "could not read dnsmasq journal");
            return None;
        }
    };

    parse_lease(&logs, mac)
}

/// Scan journal output bottom-up for the most recent ack naming `mac`.
/// Lines look like `dnsmasq-dhcp[123]: DHCPACK(qc-p-net) 172.16.0.10
/// 52:54:00:12:34:56 hostname`.
fn parse_lease(logs: &str, mac: &str) -> Option<String> {
    let mac = mac.to_ascii_lowercase();

    for line in logs.lines().rev() {
        if !line.contains("DHCPACK") && !line.contains("DHCPREPLY") {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        for window in fields.windows(2) {
            let candidate_ip = window[0];
            let candidate_mac = window[1].to_ascii_lowercase();
            if candidate_ip.parse::<std::net::Ipv4Addr>().is_ok()
                && candidate_mac.contains(':')
                && candidate_mac == mac
            {
                return Some(candidate_ip.to_string());
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const JOURNAL: &str = "\
Jan 01 10:00:01 host dnsmasq-dhcp[42]: DHCPDISCOVER(qc-p-net) 52:54:00:aa:bb:cc
Jan 01 10:00:01 host dnsmasq-dhcp[42]: DHCPOFFER(qc-p-net) 172.16.0.10 52:54:00:aa:bb:cc
Jan 01 10:00:02 host dnsmasq-dhcp[42]: DHCPACK(qc-p-net) 172.16.0.10 52:54:00:aa:bb:cc web
Jan 01 10:05:00 host dnsmasq-dhcp[42]: DHCPACK(qc-p-net) 172.16.0.11 52:54:00:dd:ee:ff api
Jan 01 10:09:00 host dnsmasq-dhcp[42]: DHCPACK(qc-p-net) 172.16.0.42 52:54:00:aa:bb:cc web
";

    #[test]
    fn finds_latest_ack_for_mac() {
        assert_eq!(
            parse_lease(JOURNAL, "52:54:00:aa:bb:cc").as_deref(),
            Some("172.16.0.42")
        );
        assert_eq!(
            parse_lease(JOURNAL, "52:54:00:DD:EE:FF").as_deref(),
            Some("172.16.0.11")
        );
    }

    #[test]
    fn unknown_mac_has_no_lease() {
        assert!(parse_lease(JOURNAL, "52:54:00:00:00:00").is_none());
        assert!(parse_lease("", "52:54:00:aa:bb:cc").is_none());
    }

    #[test]
    fn offers_are_not_leases() {
        let offer_only = "dnsmasq-dhcp[1]: DHCPOFFER(br0) 172.16.0.9 52:54:00:aa:bb:cc";
        assert!(parse_lease(offer_only, "52:54:00:aa:bb:cc").is_none());
    }
}

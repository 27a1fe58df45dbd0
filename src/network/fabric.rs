//! Fabric orchestration.
//!
//! Composes bridges, subnets, TAPs, DHCP and NAT into idempotent
//! ensure/teardown operations. Kernel state survives crashes, so every
//! step tolerates finding its work already done; teardown logs and keeps
//! going instead of aborting.

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::{ComposeConfig, VmConfig};
use crate::network::link::Netlink;
use crate::network::store::{NetworkRecord, NetworkStore};
use crate::network::{dnsmasq, names, nat, subnet, tap};
use crate::project::Project;

/// Resolve a network's subnet: a pinned CIDR is used verbatim, `auto`
/// reuses the persisted allocation or takes the first free pool /24.
/// The result is persisted either way so teardown never needs the
/// compose file.
pub fn resolve_subnet(
    project: &Project,
    store: &mut NetworkStore,
    network: &str,
    config: &ComposeConfig,
) -> Result<String> {
    let net_config = config
        .networks
        .get(network)
        .with_context(|| format!("network not found in config: {network}"))?;

    if let Some(existing) = store.get(network) {
        debug!(network, subnet = %existing.subnet, "reusing persisted subnet");
        return Ok(existing.subnet.clone());
    }

    let chosen = if net_config.wants_auto_subnet() {
        subnet::allocate_subnet(store)?
    } else {
        net_config.subnet.clone()
    };

    store.insert(
        network.to_string(),
        NetworkRecord {
            subnet: chosen.clone(),
            driver: net_config.driver_or_default().to_string(),
            dnsmasq_unit: String::new(),
            dnsmasq_active: false,
        },
    );
    store.save(project)?;

    info!(network, subnet = %chosen, "subnet assigned");
    Ok(chosen)
}

/// Bring one network to the realized state: bridge up with its `.1`
/// address, DHCP side-car running, NAT installed. DHCP and NAT failures
/// degrade the network but do not fail the operation.
pub async fn ensure_network(
    project: &Project,
    netlink: &Netlink,
    store: &mut NetworkStore,
    network: &str,
    config: &ComposeConfig,
) -> Result<()> {
    let bridge = names::bridge_name(&project.name, network);
    debug!(network, bridge, "ensuring network fabric");

    let bridge_index = netlink
        .ensure_bridge(&bridge)
        .await
        .with_context(|| format!("failed to create bridge for network {network}"))?;

    let net_subnet = resolve_subnet(project, store, network, config)?;

    let address = subnet::bridge_address(&net_subnet)?;
    let (ip, prefix) = address
        .split_once('/')
        .context("malformed bridge address")?;
    netlink
        .ensure_address(
            bridge_index,
            ip.parse().context("parsing bridge address")?,
            prefix.parse().context("parsing bridge prefix")?,
        )
        .await
        .with_context(|| format!("failed to assign {address} to bridge {bridge}"))?;
    debug!(bridge, address, "bridge addressed");

    if let Err(e) = dnsmasq::start(project, store, network, &bridge, &net_subnet).await {
        warn!(network, error = %e, "failed to start dnsmasq, continuing without DHCP");
    }

    if let Err(e) = nat::setup_nat(&bridge, &net_subnet).await {
        warn!(network, error = %e, "failed to set up NAT, guest egress may be degraded");
    }

    info!(network, bridge, subnet = %net_subnet, "network fabric ready");
    Ok(())
}

/// Create and attach this VM's TAP devices, one per declared network, in
/// declaration order.
pub async fn attach_vm(
    project: &Project,
    netlink: &Netlink,
    vm_name: &str,
    vm: &VmConfig,
) -> Result<()> {
    for (index, network) in vm.networks.iter().enumerate() {
        let bridge = names::bridge_name(&project.name, network);
        let bridge_index = netlink
            .link_index(&bridge)
            .await?
            .with_context(|| format!("bridge {bridge} does not exist for network {network}"))?;

        let tap_name = names::tap_name(&project.name, vm_name, index);
        tap::ensure_tap(netlink, &tap_name, bridge_index)
            .await
            .with_context(|| format!("failed to create TAP device for network {network}"))?;
        debug!(vm = vm_name, tap = tap_name, bridge, "TAP attached");
    }

    Ok(())
}

/// Delete a VM's TAP devices. The bridges, DHCP and NAT stay; they
/// belong to the network, not the VM.
pub async fn detach_vm(project: &Project, netlink: &Netlink, vm_name: &str, vm: &VmConfig) {
    for index in 0..vm.networks.len() {
        let tap_name = names::tap_name(&project.name, vm_name, index);
        if let Err(e) = tap::delete_tap(netlink, &tap_name).await {
            warn!(vm = vm_name, tap = tap_name, error = %e, "failed to delete TAP device");
        }
    }
}

/// Tear one network down completely: DHCP stopped, NAT removed, bridge
/// deleted, metadata erased. Each step logs and continues on failure.
pub async fn teardown_network(
    project: &Project,
    netlink: &Netlink,
    store: &mut NetworkStore,
    network: &str,
) -> Result<()> {
    let bridge = names::bridge_name(&project.name, network);
    info!(network, bridge, "tearing down network fabric");

    if let Err(e) = dnsmasq::stop(project, store, network).await {
        warn!(network, error = %e, "failed to stop dnsmasq");
    }

    if let Some(record) = store.get(network) {
        let net_subnet = record.subnet.clone();
        nat::cleanup_nat(&bridge, &net_subnet).await;
    }

    if let Some(index) = netlink.link_index(&bridge).await? {
        if let Err(e) = netlink.set_down(index).await {
            warn!(bridge, error = %e, "failed to bring down bridge");
        }
        netlink
            .delete_link(&bridge)
            .await
            .with_context(|| format!("failed to delete bridge {bridge}"))?;
    } else {
        debug!(bridge, "bridge already absent");
    }

    store.remove(network);
    store.save(project)?;

    info!(network, "network fabric removed");
    Ok(())
}

/// IP a VM obtained over DHCP, according to the journal of its first
/// network's dnsmasq. The TAP's kernel-reported MAC is the join key.
pub async fn vm_ip_address(
    project: &Project,
    netlink: &Netlink,
    vm_name: &str,
    vm: &VmConfig,
) -> Option<String> {
    let network = vm.networks.first()?;

    if !dnsmasq::is_running(project, network).await {
        return None;
    }

    let tap_name = names::tap_name(&project.name, vm_name, 0);
    let mac = match netlink.link_mac(&tap_name).await {
        Ok(Some(mac)) => mac,
        _ => {
            debug!(vm = vm_name, tap = tap_name, "no TAP MAC available");
            return None;
        }
    };

    dnsmasq::lease_for_mac(project, network, &mac).await
}

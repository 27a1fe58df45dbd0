//! Subnet pool allocation.
//!
//! `172.16.0.0/12` is carved into 4096 contiguous /24s. Allocation scans
//! for the first CIDR absent from the persisted network metadata; a
//! subnet assigned to a network is reused until that network is
//! explicitly destroyed.

use std::net::Ipv4Addr;

use anyhow::{bail, Context, Result};
use tracing::debug;

use crate::network::store::NetworkStore;

const POOL_SIZE: usize = 4096;

/// The i-th /24 of the pool: `172.<16 + i/256>.<i%256>.0/24`.
pub fn pool_subnet(index: usize) -> String {
    format!("172.{}.{}.0/24", 16 + index / 256, index % 256)
}

/// First pool /24 not present in the store.
pub fn allocate_subnet(store: &NetworkStore) -> Result<String> {
    let taken: std::collections::HashSet<&str> = store
        .networks()
        .values()
        .map(|net| net.subnet.as_str())
        .collect();

    for index in 0..POOL_SIZE {
        let subnet = pool_subnet(index);
        if !taken.contains(subnet.as_str()) {
            debug!(subnet = %subnet, "allocated subnet");
            return Ok(subnet);
        }
    }

    bail!("no available subnets in pool (172.16.0.0/12)")
}

fn parse_cidr(subnet: &str) -> Result<(Ipv4Addr, u8)> {
    let (addr, prefix) = subnet
        .split_once('/')
        .with_context(|| format!("invalid subnet: {subnet}"))?;
    let addr: Ipv4Addr = addr
        .parse()
        .with_context(|| format!("invalid subnet address: {subnet}"))?;
    let prefix: u8 = prefix
        .parse()
        .with_context(|| format!("invalid subnet prefix: {subnet}"))?;
    if prefix > 32 {
        bail!("invalid subnet prefix: {subnet}");
    }
    Ok((addr, prefix))
}

fn with_last_octet(addr: Ipv4Addr, last: u8) -> Ipv4Addr {
    let o = addr.octets();
    Ipv4Addr::new(o[0], o[1], o[2], last)
}

/// The bridge's host address: the subnet's `.1` with the same prefix.
pub fn bridge_address(subnet: &str) -> Result<String> {
    let (addr, prefix) = parse_cidr(subnet)?;
    Ok(format!("{}/{prefix}", with_last_octet(addr, 1)))
}

/// Gateway advertised over DHCP (the bridge's `.1`).
pub fn gateway(subnet: &str) -> Result<Ipv4Addr> {
    let (addr, _) = parse_cidr(subnet)?;
    Ok(with_last_octet(addr, 1))
}

/// DHCP pool boundaries, `.10` through `.250`.
pub fn dhcp_range(subnet: &str) -> Result<(Ipv4Addr, Ipv4Addr)> {
    let (addr, _) = parse_cidr(subnet)?;
    Ok((with_last_octet(addr, 10), with_last_octet(addr, 250)))
}

/// Dotted netmask for the subnet's prefix length.
pub fn netmask(subnet: &str) -> Result<Ipv4Addr> {
    let (_, prefix) = parse_cidr(subnet)?;
    let mask = if prefix == 0 {
        0u32
    } else {
        u32::MAX << (32 - u32::from(prefix))
    };
    Ok(Ipv4Addr::from(mask))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::store::{NetworkRecord, NetworkStore};

    #[test]
    fn pool_covers_the_slash_twelve() {
        assert_eq!(pool_subnet(0), "172.16.0.0/24");
        assert_eq!(pool_subnet(255), "172.16.255.0/24");
        assert_eq!(pool_subnet(256), "172.17.0.0/24");
        assert_eq!(pool_subnet(4095), "172.31.255.0/24");
    }

    #[test]
    fn pool_is_injective_and_inside_range() {
        let mut seen = std::collections::HashSet::new();
        for i in 0..POOL_SIZE {
            let subnet = pool_subnet(i);
            let (addr, prefix) = parse_cidr(&subnet).unwrap();
            assert_eq!(prefix, 24);
            let o = addr.octets();
            assert_eq!(o[0], 172);
            assert!((16..=31).contains(&o[1]), "{subnet}");
            assert!(seen.insert(subnet));
        }
    }

    #[test]
    fn allocation_skips_taken_subnets() {
        let mut store = NetworkStore::default();
        assert_eq!(allocate_subnet(&store).unwrap(), "172.16.0.0/24");

        for subnet in ["172.16.0.0/24", "172.16.2.0/24"] {
            store.insert(
                subnet.to_string(),
                NetworkRecord {
                    subnet: subnet.to_string(),
                    driver: "bridge".into(),
                    dnsmasq_unit: String::new(),
                    dnsmasq_active: false,
                },
            );
        }
        assert_eq!(allocate_subnet(&store).unwrap(), "172.16.1.0/24");
    }

    #[test]
    fn derived_addresses() {
        assert_eq!(bridge_address("172.16.3.0/24").unwrap(), "172.16.3.1/24");
        assert_eq!(gateway("172.16.3.0/24").unwrap().to_string(), "172.16.3.1");

        let (start, end) = dhcp_range("172.16.3.0/24").unwrap();
        assert_eq!(start.to_string(), "172.16.3.10");
        assert_eq!(end.to_string(), "172.16.3.250");

        assert_eq!(netmask("172.16.3.0/24").unwrap().to_string(), "255.255.255.0");
        assert_eq!(netmask("10.0.0.0/16").unwrap().to_string(), "255.255.0.0");
    }

    #[test]
    fn rejects_malformed_cidrs() {
        assert!(parse_cidr("172.16.0.0").is_err());
        assert!(parse_cidr("bogus/24").is_err());
        assert!(parse_cidr("172.16.0.0/40").is_err());
    }
}

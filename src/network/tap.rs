//! TAP device lifecycle.
//!
//! TAPs are created persistent through the `/dev/net/tun` ioctl
//! interface, owned by the invoking uid/gid so an unprivileged QEMU can
//! open them, then enslaved to the network's bridge over netlink.

use std::fs::OpenOptions;
use std::os::fd::AsRawFd;

use anyhow::{bail, Context, Result};
use nix::unistd::{getgid, getuid};
use tracing::{debug, info};

use crate::network::link::Netlink;

const TUN_DEVICE: &str = "/dev/net/tun";

nix::ioctl_write_ptr_bad!(
    tun_set_iff,
    nix::request_code_write!(b'T', 202, std::mem::size_of::<libc::c_int>()),
    libc::ifreq
);
nix::ioctl_write_int_bad!(
    tun_set_persist,
    nix::request_code_write!(b'T', 203, std::mem::size_of::<libc::c_int>())
);
nix::ioctl_write_int_bad!(
    tun_set_owner,
    nix::request_code_write!(b'T', 204, std::mem::size_of::<libc::c_int>())
);
nix::ioctl_write_int_bad!(
    tun_set_group,
    nix::request_code_write!(b'T', 206, std::mem::size_of::<libc::c_int>())
);

fn ifreq_for(name: &str) -> Result<libc::ifreq> {
    let bytes = name.as_bytes();
    if bytes.len() >= libc::IFNAMSIZ {
        bail!("interface name too long: {name}");
    }

    let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in req.ifr_name.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    req.ifr_ifru.ifru_flags = (libc::IFF_TAP | libc::IFF_NO_PI) as libc::c_short;
    Ok(req)
}

/// Create a persistent TAP owned by the current user. The fd used for
/// setup is closed afterwards; the device stays because of TUNSETPERSIST.
fn create_tap(name: &str) -> Result<()> {
    let tun = OpenOptions::new()
        .read(true)
        .write(true)
        .open(TUN_DEVICE)
        .with_context(|| format!("opening {TUN_DEVICE}"))?;
    let fd = tun.as_raw_fd();

    let req = ifreq_for(name)?;
    unsafe {
        tun_set_iff(fd, &req).with_context(|| format!("TUNSETIFF for {name}"))?;
        tun_set_owner(fd, getuid().as_raw() as libc::c_int)
            .with_context(|| format!("TUNSETOWNER for {name}"))?;
        tun_set_group(fd, getgid().as_raw() as libc::c_int)
            .with_context(|| format!("TUNSETGROUP for {name}"))?;
        tun_set_persist(fd, 1).with_context(|| format!("TUNSETPERSIST for {name}"))?;
    }

    Ok(())
}

/// Ensure the TAP exists, is up, and is attached to the bridge. An
/// existing TAP with the same name is reused.
pub async fn ensure_tap(netlink: &Netlink, tap_name: &str, bridge_index: u32) -> Result<u32> {
    let index = match netlink.link_index(tap_name).await? {
        Some(index) => {
            debug!(tap = tap_name, "TAP device already exists");
            index
        }
        None => {
            create_tap(tap_name)?;
            let index = netlink
                .link_index(tap_name)
                .await?
                .with_context(|| format!("TAP {tap_name} missing after creation"))?;
            info!(
                tap = tap_name,
                uid = getuid().as_raw(),
                gid = getgid().as_raw(),
                "TAP device created"
            );
            index
        }
    };

    netlink.set_up(index).await?;
    netlink.set_master(index, bridge_index).await?;
    Ok(index)
}

/// Delete a TAP; already-absent devices are silent success.
pub async fn delete_tap(netlink: &Netlink, tap_name: &str) -> Result<()> {
    netlink.delete_link(tap_name).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ifreq_carries_name_and_tap_flags() {
        let req = ifreq_for("tap-abcd-web").unwrap();

        let name: Vec<u8> = req
            .ifr_name
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        assert_eq!(name, b"tap-abcd-web");

        let flags = unsafe { req.ifr_ifru.ifru_flags };
        assert_eq!(
            flags,
            (libc::IFF_TAP | libc::IFF_NO_PI) as libc::c_short
        );
    }

    #[test]
    fn overlong_name_is_rejected() {
        assert!(ifreq_for("an-interface-name-way-too-long").is_err());
    }
}

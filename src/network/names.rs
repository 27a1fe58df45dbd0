//! Interface and MAC naming.
//!
//! Names are derived, never stored: the bridge from project and network,
//! the TAP and MAC from (project, vm, interface-index). The seed builder
//! and the argv builder both call `mac_address` so the guest and host
//! sides can never disagree.

use md5::{Digest, Md5};

/// Kernel limit on interface names (IFNAMSIZ minus the NUL).
const MAX_IFNAME: usize = 15;

fn sanitize(name: &str) -> String {
    name.replace(' ', "-")
}

/// `qc-<project>-<network>`, truncated to fit in an interface name.
pub fn bridge_name(project: &str, network: &str) -> String {
    let mut name = format!("qc-{}-{}", sanitize(project), sanitize(network));
    name.truncate(MAX_IFNAME);
    name
}

/// `tap-<hash>-<vm>` where `<hash>` is the first 4 hex digits of
/// MD5("<project>-<vm>-<index>") and `<vm>` keeps at most 6 characters.
pub fn tap_name(project: &str, vm_name: &str, index: usize) -> String {
    let identifier = format!("{project}-{vm_name}-{index}");
    let digest = Md5::digest(identifier.as_bytes());
    let hash = format!("{:02x}{:02x}", digest[0], digest[1]);

    let mut vm = sanitize(vm_name);
    vm.truncate(6);

    format!("tap-{hash}-{vm}")
}

/// Deterministic MAC in QEMU's `52:54:00` range, trailing bytes from
/// MD5 over the same identifier the TAP name uses.
pub fn mac_address(project: &str, vm_name: &str, index: usize) -> String {
    let identifier = format!("{project}-{vm_name}-{index}");
    let digest = Md5::digest(identifier.as_bytes());
    format!("52:54:00:{:02x}:{:02x}:{:02x}", digest[0], digest[1], digest[2])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_name_fits_interface_limit() {
        assert_eq!(bridge_name("proj", "net"), "qc-proj-net");

        let long = bridge_name("very-long-project-name", "frontend-network");
        assert!(long.len() <= MAX_IFNAME);
        assert!(long.starts_with("qc-"));
    }

    #[test]
    fn tap_name_fits_interface_limit() {
        for (vm, index) in [("web", 0), ("a-rather-long-vm-name", 3)] {
            let tap = tap_name("project", vm, index);
            assert!(tap.len() <= MAX_IFNAME, "{tap}");
            assert!(tap.starts_with("tap-"));
        }
    }

    #[test]
    fn tap_name_is_stable_and_index_sensitive() {
        let a = tap_name("proj", "web", 0);
        assert_eq!(a, tap_name("proj", "web", 0));
        assert_ne!(a, tap_name("proj", "web", 1));
        assert_ne!(a, tap_name("proj", "api", 0));
    }

    #[test]
    fn mac_is_stable_and_in_qemu_range() {
        let mac = mac_address("proj", "web", 0);
        assert_eq!(mac, mac_address("proj", "web", 0));
        assert!(mac.starts_with("52:54:00:"));
        assert_eq!(mac.len(), 17);

        assert_ne!(mac, mac_address("proj", "web", 1));
        assert_ne!(mac, mac_address("other", "web", 0));
    }

    #[test]
    fn mac_matches_tap_hash_prefix() {
        // Both derive from the same MD5; the first two bytes agree.
        let mac = mac_address("p", "vm", 2);
        let tap = tap_name("p", "vm", 2);
        let mac_bytes = mac.split(':').collect::<Vec<_>>();
        assert_eq!(format!("{}{}", mac_bytes[3], mac_bytes[4]), tap[4..8]);
    }
}

pub mod dnsmasq;
pub mod fabric;
pub mod link;
pub mod names;
pub mod nat;
pub mod store;
pub mod subnet;
pub mod tap;

pub use fabric::{attach_vm, detach_vm, ensure_network, teardown_network, vm_ip_address};
pub use link::Netlink;
pub use names::{bridge_name, mac_address, tap_name};
pub use store::{NetworkRecord, NetworkStore};

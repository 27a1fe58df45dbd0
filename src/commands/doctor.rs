use anyhow::Result;

use crate::exec;
use crate::network::Netlink;

struct Check {
    binary: &'static str,
    hint: &'static str,
}

const REQUIRED_BINARIES: &[Check] = &[
    Check {
        binary: "systemctl",
        hint: "qemu-compose requires systemd",
    },
    Check {
        binary: "systemd-run",
        hint: "please install systemd",
    },
    Check {
        binary: "qemu-system-x86_64",
        hint: "please install qemu-system-x86_64",
    },
    Check {
        binary: "qemu-img",
        hint: "please install qemu-img",
    },
    Check {
        binary: "ssh-keygen",
        hint: "please install openssh-client for SSH key generation",
    },
    Check {
        binary: "dnsmasq",
        hint: "please install dnsmasq for DHCP support",
    },
];

/// Enumerate every precondition the orchestrator relies on.
pub async fn cmd_doctor() -> Result<()> {
    println!("Checking system dependencies...\n");

    let mut all_ok = true;

    if cfg!(target_os = "linux") {
        println!("✅ Operating System: Linux");
    } else {
        println!("❌ Operating System: qemu-compose requires Linux");
        all_ok = false;
    }

    for check in REQUIRED_BINARIES {
        match exec::lookup(check.binary) {
            Some(path) => println!("✅ {}: found at {}", check.binary, path.display()),
            None => {
                println!("❌ {}: not found ({})", check.binary, check.hint);
                all_ok = false;
            }
        }
    }

    // Either ISO tool satisfies the seed builder.
    match (exec::lookup("genisoimage"), exec::lookup("mkisofs")) {
        (Some(path), _) => println!("✅ genisoimage: found at {}", path.display()),
        (None, Some(path)) => println!("✅ mkisofs: found at {}", path.display()),
        (None, None) => {
            println!("❌ genisoimage/mkisofs: not found (install genisoimage for cloud-init support)");
            all_ok = false;
        }
    }

    // Live probe: can this process actually create bridges?
    let bridges_ok = match Netlink::connect() {
        Ok(netlink) => netlink.can_create_bridges().await,
        Err(_) => false,
    };
    if bridges_ok {
        println!("✅ CAP_NET_ADMIN: available (bridge networking will work)");
    } else {
        println!("⚠️  CAP_NET_ADMIN: not available (bridge networking will not work)");
        if let Ok(exe) = std::env::current_exe() {
            println!("    To grant capability: sudo setcap cap_net_admin+ep {}", exe.display());
        }
        println!("    Or run qemu-compose as root for bridge networking");
    }

    println!();
    if all_ok {
        println!("✅ All system dependencies are satisfied!");
        Ok(())
    } else {
        anyhow::bail!(
            "some system dependencies are missing; please install them before using qemu-compose"
        );
    }
}

use std::os::unix::process::CommandExt;
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::cli::NameArgs;
use crate::cloudinit;
use crate::commands::common;
use crate::sshkeys;
use crate::vm;

/// Replace this process with an interactive `ssh` into the VM.
pub async fn cmd_ssh(file_flag: Option<&Path>, args: NameArgs) -> Result<()> {
    let ctx = common::load_context(file_flag)?;

    let vm_config = ctx
        .config
        .vms
        .get(&args.vm)
        .with_context(|| format!("VM not found in compose file: {}", args.vm))?;

    if !vm::is_running(&ctx.project, &args.vm).await {
        bail!(
            "VM is not running: {}\nStart the VM with: qemu-compose up {}",
            args.vm,
            args.vm
        );
    }

    let port = sshkeys::ssh_port(&ctx.project, &args.vm).context("failed to get SSH port")?;

    let key = sshkeys::private_key_path(&ctx.project)?;
    if !key.exists() {
        bail!(
            "SSH key not found: {} (it should have been created when the VM was started)",
            key.display()
        );
    }

    let user = cloudinit::default_user_for_image(&vm_config.image);

    let err = std::process::Command::new("ssh")
        .arg("-i")
        .arg(&key)
        .arg("-p")
        .arg(port.to_string())
        .args(["-o", "StrictHostKeyChecking=no"])
        .args(["-o", "UserKnownHostsFile=/dev/null"])
        .arg(format!("{user}@localhost"))
        .exec();

    // exec only returns on failure.
    Err(err).context("failed to execute ssh")
}

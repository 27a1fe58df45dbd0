use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::cli::NameArgs;
use crate::commands::common;
use crate::console;
use crate::vm;

pub async fn cmd_console(file_flag: Option<&Path>, args: NameArgs) -> Result<()> {
    let ctx = common::load_context(file_flag)?;

    if !ctx.config.vms.contains_key(&args.vm) {
        bail!("VM not found in compose file: {}", args.vm);
    }

    if !vm::is_running(&ctx.project, &args.vm).await {
        bail!("VM is not running: {}", args.vm);
    }

    let socket = ctx.project.console_socket_path(&args.vm)?;

    // The byte proxy is blocking thread work, keep it off the runtime.
    let vm_name = args.vm.clone();
    tokio::task::spawn_blocking(move || console::attach(&vm_name, &socket))
        .await
        .context("console task failed")?
}

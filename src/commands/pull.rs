use std::path::Path;

use anyhow::Result;
use tracing::debug;

use crate::cli::PullArgs;
use crate::commands::common;
use crate::config;
use crate::image;
use crate::project;

pub async fn cmd_pull(file_flag: Option<&Path>, args: PullArgs) -> Result<()> {
    let ctx = common::load_context(file_flag)?;
    let cache_dir = project::image_cache_dir()?;

    let vms = config::filter_vms(&ctx.config, &args.vms)?;
    if vms.is_empty() {
        println!("No VMs defined in compose file");
        return Ok(());
    }

    // One download per distinct URL; several VMs may share an image.
    let mut to_pull: Vec<(&str, &str)> = Vec::new();
    for (vm_name, vm_config) in &vms {
        if vm_config.has_url_image() {
            if !to_pull.iter().any(|(_, url)| *url == vm_config.image) {
                to_pull.push((*vm_name, vm_config.image.as_str()));
            }
        } else {
            debug!(vm = vm_name, image = %vm_config.image, "skipping non-URL image");
        }
    }

    if to_pull.is_empty() {
        println!("No images to pull (all images must be HTTP/HTTPS URLs)");
        return Ok(());
    }

    if args.vms.is_empty() {
        println!(
            "Pulling {} image(s) from {}",
            to_pull.len(),
            ctx.project.compose_path.display()
        );
    } else {
        println!(
            "Pulling {} image(s) for VMs: {}",
            to_pull.len(),
            args.vms.join(", ")
        );
    }
    println!("Target directory: {}\n", cache_dir.display());

    let mut has_error = false;
    for (vm_name, image_url) in to_pull {
        if let Err(e) = image::download_image(image_url, vm_name, args.force).await {
            eprintln!("✗ {vm_name}: {e:#}");
            has_error = true;
        }
    }

    if has_error {
        anyhow::bail!("some images failed to download");
    }

    println!("\n✓ All images pulled successfully");
    Ok(())
}

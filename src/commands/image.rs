use anyhow::Result;

use crate::image;
use crate::project;

/// `image ls`: the cache listing.
pub fn cmd_image_ls() -> Result<()> {
    let cache_dir = project::image_cache_dir()?;
    let images = image::list_images()?;

    if images.is_empty() {
        println!("No images found in cache directory: {}", cache_dir.display());
        println!("\nTo download images, use: qemu-compose pull");
        return Ok(());
    }

    println!("Image cache directory: {}\n", cache_dir.display());
    println!("{:<50} {:<15} {}", "FILENAME", "SIZE", "PATH");
    println!("{}", "-".repeat(120));

    for entry in &images {
        println!(
            "{:<50} {:<15} {}",
            entry.filename,
            image::format_bytes(entry.size),
            entry.path.display()
        );
    }

    println!("\nTotal: {} image(s)", images.len());
    Ok(())
}

//! Global image cache.
//!
//! Base images are downloaded once per user, keyed by the URL's path
//! basename. Downloads stream to a `.tmp` sibling and are renamed into
//! place so a partial transfer never masquerades as a cached image.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;

use crate::project;

/// A cached image file.
#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub filename: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Extract the cache filename from an image URL.
pub fn image_filename(image_url: &str) -> Result<String> {
    let parsed = Url::parse(image_url)
        .with_context(|| format!("invalid image URL: {image_url}"))?;

    let filename = Path::new(parsed.path())
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .with_context(|| format!("cannot extract filename from URL: {image_url}"))?;

    Ok(filename.to_string())
}

/// Resolve an image URL to its cached file. Missing cache entries are a
/// recoverable error surfaced as "not pulled".
pub fn base_image_path(image_url: &str) -> Result<PathBuf> {
    let cache_dir = project::image_cache_dir()?;
    let filename = image_filename(image_url)?;
    let path = cache_dir.join(&filename);

    if !path.exists() {
        bail!("base image not pulled: {filename} (run 'qemu-compose pull' first)");
    }

    Ok(path)
}

/// Download an image into the cache. A present final file is a no-op
/// unless `force` is set.
pub async fn download_image(image_url: &str, vm_name: &str, force: bool) -> Result<()> {
    let cache_dir = project::image_cache_dir()?;
    let filename = image_filename(image_url)?;
    let dest = cache_dir.join(&filename);

    if dest.exists() && !force {
        info!(image = %filename, "image already cached");
        println!("✓ {vm_name}: image already exists");
        return Ok(());
    }

    debug!(url = %image_url, dest = %dest.display(), force, "downloading image");

    let response = reqwest::get(image_url)
        .await
        .with_context(|| format!("failed to download image: {image_url}"))?
        .error_for_status()
        .with_context(|| format!("failed to download image: {image_url}"))?;

    let total = response.content_length().unwrap_or(0);
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{msg:<20} [{bar:30}] {bytes:>10}/{total_bytes:<10} {bytes_per_sec}")
            .context("building progress bar template")?
            .progress_chars("=> "),
    );
    bar.set_message(vm_name.to_string());

    let tmp = dest.with_file_name(format!("{filename}.tmp"));

    let mut file = tokio::fs::File::create(&tmp)
        .await
        .with_context(|| format!("failed to create file: {}", tmp.display()))?;

    let mut response = response;
    let result: Result<()> = async {
        while let Some(chunk) = response.chunk().await.context("reading download stream")? {
            file.write_all(&chunk).await.context("writing image data")?;
            bar.inc(chunk.len() as u64);
        }
        file.flush().await.context("flushing image data")?;
        Ok(())
    }
    .await;

    if let Err(e) = result {
        bar.abandon();
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    bar.finish();

    tokio::fs::rename(&tmp, &dest)
        .await
        .with_context(|| format!("failed to save image: {}", dest.display()))?;

    info!(path = %dest.display(), "image downloaded");
    Ok(())
}

/// List cached images, skipping dot files and in-flight `.tmp` downloads.
pub fn list_images() -> Result<Vec<ImageInfo>> {
    let cache_dir = project::image_cache_dir()?;
    debug!(dir = %cache_dir.display(), "scanning image cache");

    let mut images = Vec::new();
    for entry in std::fs::read_dir(&cache_dir)
        .with_context(|| format!("failed to read cache directory: {}", cache_dir.display()))?
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || name.ends_with(".tmp") {
            continue;
        }
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        images.push(ImageInfo {
            filename: name,
            path: entry.path(),
            size: metadata.len(),
        });
    }

    images.sort_by(|a, b| a.filename.cmp(&b.filename));
    Ok(images)
}

/// SHA-256 of a cached image file.
pub fn image_checksum(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).context("hashing image")?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Render a byte count for tables.
pub fn format_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    format!("{:.1} {}B", bytes as f64 / div as f64, ['K', 'M', 'G', 'T', 'P', 'E'][exp])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_is_url_path_basename() {
        assert_eq!(
            image_filename("https://cloud-images.ubuntu.com/jammy/jammy-server-cloudimg-amd64.img")
                .unwrap(),
            "jammy-server-cloudimg-amd64.img"
        );
        assert_eq!(
            image_filename("https://example.com/a/b/cloud.qcow2?x=1").unwrap(),
            "cloud.qcow2"
        );
    }

    #[test]
    fn filename_rejects_bad_urls() {
        assert!(image_filename("not a url").is_err());
        assert!(image_filename("https://example.com/").is_err());
    }

    #[test]
    fn checksum_matches_known_value() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("img");
        std::fs::write(&path, b"hello").unwrap();
        assert_eq!(
            image_checksum(&path).unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn bytes_format() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.0 GB");
    }
}

//! Instance disk management.
//!
//! Every VM gets one qcow2 copy-on-write overlay backed by the cached
//! base image. The declared size is applied once at creation time and
//! recorded in `disk.metadata.json`; later size changes are reported but
//! never applied in place.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::exec;
use crate::project::Project;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskMetadata {
    pub size: String,
}

fn metadata_path(project: &Project, vm_name: &str) -> Result<PathBuf> {
    Ok(project.instance_dir(vm_name)?.join("disk.metadata.json"))
}

pub fn load_disk_metadata(project: &Project, vm_name: &str) -> Result<Option<DiskMetadata>> {
    let path = metadata_path(project, vm_name)?;
    let data = match std::fs::read_to_string(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read {}", path.display()));
        }
    };

    let metadata: DiskMetadata = serde_json::from_str(&data)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(metadata))
}

pub fn save_disk_metadata(
    project: &Project,
    vm_name: &str,
    metadata: &DiskMetadata,
) -> Result<()> {
    let path = metadata_path(project, vm_name)?;
    let data = serde_json::to_string_pretty(metadata).context("serializing disk metadata")?;
    std::fs::write(&path, data)
        .with_context(|| format!("failed to write {}", path.display()))?;
    debug!(path = %path.display(), "saved disk metadata");
    Ok(())
}

/// Ensure the VM's overlay disk exists, sized per the compose file on
/// first creation. On reuse, a declared-size drift produces a warning
/// with remediation text; the disk is left untouched.
pub async fn ensure_instance_disk(
    project: &Project,
    vm_name: &str,
    base_image: &Path,
    declared_size: &str,
) -> Result<PathBuf> {
    let disk_path = project.instance_disk_path(vm_name)?;

    if disk_path.exists() {
        debug!(disk = %disk_path.display(), "instance disk already exists");
        check_size_drift(project, vm_name, declared_size)?;
        return Ok(disk_path);
    }

    info!(
        base = %base_image.display(),
        disk = %disk_path.display(),
        "creating COW overlay"
    );

    exec::run(
        "qemu-img",
        &[
            "create",
            "-f",
            "qcow2",
            "-F",
            "qcow2",
            "-b",
            &base_image.to_string_lossy(),
            &disk_path.to_string_lossy(),
        ],
    )
    .await
    .context("failed to create instance disk")?;

    exec::run("qemu-img", &["resize", &disk_path.to_string_lossy(), declared_size])
        .await
        .context("failed to resize instance disk")?;
    println!("  ✓ Disk sized to {declared_size}");

    save_disk_metadata(
        project,
        vm_name,
        &DiskMetadata {
            size: declared_size.to_string(),
        },
    )?;

    Ok(disk_path)
}

/// Compare the declared size against recorded metadata for an existing
/// disk. Missing metadata is backfilled with the current declaration
/// (disks created before size tracking existed).
fn check_size_drift(project: &Project, vm_name: &str, declared_size: &str) -> Result<()> {
    match load_disk_metadata(project, vm_name) {
        Ok(Some(metadata)) => {
            if metadata.size != declared_size {
                warn!(
                    vm = vm_name,
                    declared = declared_size,
                    recorded = %metadata.size,
                    "disk size drift detected"
                );
                println!(
                    "  ⚠ Warning: disk.size is set to {declared_size} but the instance disk was created with size {}",
                    metadata.size
                );
                println!("  ⚠ Disk size changes after first creation are not applied automatically");
                println!(
                    "  ⚠ To resize, run 'qemu-compose destroy {vm_name}' and then 'qemu-compose up {vm_name}'"
                );
            }
        }
        Ok(None) => {
            debug!(vm = vm_name, "no disk metadata found, backfilling current size");
            save_disk_metadata(
                project,
                vm_name,
                &DiskMetadata {
                    size: declared_size.to_string(),
                },
            )?;
        }
        Err(e) => {
            warn!(vm = vm_name, error = %e, "could not load disk metadata");
            println!("  ⚠ Warning: could not verify disk size (metadata error)");
        }
    }
    Ok(())
}

/// Remove the whole per-VM state directory (overlay, seed, metadata).
/// Absent directories are fine; destroy stays idempotent.
pub fn remove_instance_dir(project: &Project, vm_name: &str) -> Result<()> {
    let dir = match project.workspace() {
        Ok(ws) => ws.join(vm_name),
        Err(e) => return Err(e),
    };

    if !dir.exists() {
        debug!(dir = %dir.display(), "instance directory already absent");
        return Ok(());
    }

    std::fs::remove_dir_all(&dir)
        .with_context(|| format!("failed to remove instance directory: {}", dir.display()))?;
    info!(dir = %dir.display(), "removed instance directory");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::Project;

    fn test_project() -> (tempfile::TempDir, Project) {
        let tmp = tempfile::TempDir::new().unwrap();
        let compose = tmp.path().join("qemu-compose.yaml");
        std::fs::write(&compose, "vms: {}\n").unwrap();
        let project = Project::from_compose_path(compose.canonicalize().unwrap()).unwrap();
        (tmp, project)
    }

    #[test]
    fn metadata_round_trips() {
        let (_tmp, project) = test_project();

        assert!(load_disk_metadata(&project, "vm1").unwrap().is_none());

        save_disk_metadata(&project, "vm1", &DiskMetadata { size: "5G".into() }).unwrap();
        let loaded = load_disk_metadata(&project, "vm1").unwrap().unwrap();
        assert_eq!(loaded.size, "5G");
    }

    #[test]
    fn drift_check_backfills_missing_metadata() {
        let (_tmp, project) = test_project();

        check_size_drift(&project, "vm1", "20G").unwrap();
        let loaded = load_disk_metadata(&project, "vm1").unwrap().unwrap();
        assert_eq!(loaded.size, "20G");
    }

    #[test]
    fn drift_check_leaves_recorded_size() {
        let (_tmp, project) = test_project();

        save_disk_metadata(&project, "vm1", &DiskMetadata { size: "5G".into() }).unwrap();
        check_size_drift(&project, "vm1", "20G").unwrap();

        // Drift is warned about, never applied.
        let loaded = load_disk_metadata(&project, "vm1").unwrap().unwrap();
        assert_eq!(loaded.size, "5G");
    }

    #[test]
    fn remove_is_idempotent() {
        let (_tmp, project) = test_project();

        remove_instance_dir(&project, "ghost").unwrap();

        let dir = project.instance_dir("vm1").unwrap();
        std::fs::write(dir.join("disk.qcow2"), b"x").unwrap();
        remove_instance_dir(&project, "vm1").unwrap();
        assert!(!dir.exists());
        remove_instance_dir(&project, "vm1").unwrap();
    }
}

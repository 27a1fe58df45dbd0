//! Named block volumes and bind-mount resolution.
//!
//! Named volumes are qcow2 disks formatted ext4 through a network block
//! device; they outlive VM destruction and are only removed by hand.
//! Bind mounts resolve relative to the compose file and travel to the
//! guest over 9p.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{ComposeConfig, VmConfig};
use crate::exec;
use crate::project::Project;

const NBD_DEVICE: &str = "/dev/nbd0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeMetadata {
    pub name: String,
    pub size: String,
    pub disk_path: PathBuf,
    pub created: String,
}

/// One entry of a VM's ordered mount plan, feeding both the QEMU argv
/// and the cloud-init `mounts` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedMount {
    Named {
        volume: String,
        disk_path: PathBuf,
        target: String,
        read_only: bool,
        /// Guest block device, `/dev/vdb` onward in declaration order.
        guest_device: String,
    },
    Bind {
        host_path: PathBuf,
        target: String,
        read_only: bool,
        automount: bool,
        mount_options: String,
        /// Sequential 9p tag, `mount0` onward in declaration order.
        tag: String,
    },
}

impl ResolvedMount {
    pub fn target(&self) -> &str {
        match self {
            ResolvedMount::Named { target, .. } => target,
            ResolvedMount::Bind { target, .. } => target,
        }
    }
}

/// The full ordered mount plan for one VM.
#[derive(Debug, Clone, Default)]
pub struct MountPlan {
    pub mounts: Vec<ResolvedMount>,
}

impl MountPlan {
    pub fn has_bind_mounts(&self) -> bool {
        self.mounts
            .iter()
            .any(|m| matches!(m, ResolvedMount::Bind { .. }))
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }
}

pub fn load_volume_metadata(project: &Project) -> Result<BTreeMap<String, VolumeMetadata>> {
    let path = project.volumes_json_path()?;
    let data = match std::fs::read_to_string(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
    };

    serde_json::from_str(&data).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn save_volume_metadata(
    project: &Project,
    metadata: &BTreeMap<String, VolumeMetadata>,
) -> Result<()> {
    let path = project.volumes_json_path()?;
    let data = serde_json::to_string_pretty(metadata).context("serializing volume metadata")?;
    std::fs::write(&path, data)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Resolve a bind-mount source to an absolute host path. Relative
/// sources resolve against the compose file's directory, never the
/// invocation cwd. A missing host path is a precondition error.
pub fn resolve_bind_mount_path(source: &str, compose_path: &Path) -> Result<PathBuf> {
    let path = if Path::new(source).is_absolute() {
        PathBuf::from(source)
    } else {
        compose_path
            .parent()
            .unwrap_or(Path::new("/"))
            .join(source)
    };

    if !path.exists() {
        bail!(
            "bind mount path does not exist: {source} (resolved to: {})",
            path.display()
        );
    }

    Ok(path)
}

/// Idempotently create and format a named volume, persisting its record
/// in `volumes.json`.
pub async fn ensure_volume_exists(
    project: &Project,
    name: &str,
    config: &ComposeConfig,
) -> Result<()> {
    let mut metadata = load_volume_metadata(project)?;
    if metadata.contains_key(name) {
        debug!(volume = name, "volume already exists");
        return Ok(());
    }

    let volume_config = config
        .volumes
        .get(name)
        .with_context(|| format!("volume not defined in compose file: {name}"))?;
    let size = volume_config.size_or_default();

    info!(volume = name, size, "creating named volume");

    let volume_dir = project.volumes_dir()?.join(name);
    std::fs::create_dir_all(&volume_dir)
        .with_context(|| format!("creating volume directory: {}", volume_dir.display()))?;

    let disk_path = volume_dir.join("volume.qcow2");
    exec::run(
        "qemu-img",
        &["create", "-f", "qcow2", &disk_path.to_string_lossy(), size],
    )
    .await
    .context("failed to create volume disk")?;

    format_volume_disk(&disk_path)
        .await
        .with_context(|| format!("failed to format volume {name}"))?;

    metadata.insert(
        name.to_string(),
        VolumeMetadata {
            name: name.to_string(),
            size: size.to_string(),
            disk_path,
            created: chrono::Utc::now().to_rfc3339(),
        },
    );
    save_volume_metadata(project, &metadata)?;

    info!(volume = name, "volume created");
    println!("  ✓ Created volume: {name} ({size}, ext4)");
    Ok(())
}

/// Format a qcow2 volume with ext4 by connecting it to an NBD device.
/// This is the one-time step that needs elevated privileges.
async fn format_volume_disk(disk_path: &Path) -> Result<()> {
    debug!(disk = %disk_path.display(), "formatting volume disk");

    if let Err(e) = exec::run_elevated("modprobe", &["nbd", "max_part=8"]).await {
        // The module may be built in or already loaded.
        warn!(error = %e, "modprobe nbd failed, continuing");
    }

    exec::run_elevated(
        "qemu-nbd",
        &["--connect", NBD_DEVICE, &disk_path.to_string_lossy()],
    )
    .await
    .context("failed to connect volume to nbd device (requires sudo)")?;

    let format_result = exec::run_elevated("mkfs.ext4", &["-F", NBD_DEVICE])
        .await
        .context("failed to format volume with ext4");

    // Always disconnect, even when mkfs failed.
    if let Err(e) = exec::run_elevated("qemu-nbd", &["--disconnect", NBD_DEVICE]).await {
        warn!(error = %e, "failed to disconnect nbd device");
    }

    format_result.map(|_| ())
}

/// Build a VM's ordered mount plan: validate targets, ensure named
/// volumes exist, resolve bind-mount paths, and assign guest devices
/// (`/dev/vdb`…) and 9p tags (`mount0`…) in declaration order.
pub async fn plan_mounts(
    project: &Project,
    vm_name: &str,
    vm: &VmConfig,
    config: &ComposeConfig,
) -> Result<MountPlan> {
    let mut mounts = Vec::new();
    let mut named_index = 0usize;
    let mut bind_index = 0usize;

    for mount in &vm.volumes {
        if !mount.target.starts_with('/') {
            bail!(
                "invalid mount path for VM {vm_name}: {} (must be absolute path)",
                mount.target
            );
        }

        if mount.is_bind_mount() {
            let host_path = resolve_bind_mount_path(&mount.source, &project.compose_path)?;
            let tag = format!("mount{bind_index}");
            bind_index += 1;

            debug!(
                vm = vm_name,
                host = %host_path.display(),
                target = %mount.target,
                tag,
                "planned bind mount"
            );

            mounts.push(ResolvedMount::Bind {
                host_path,
                target: mount.target.clone(),
                read_only: mount.read_only,
                automount: mount.automount_or_default(),
                mount_options: mount.mount_options.clone(),
                tag,
            });
        } else {
            ensure_volume_exists(project, &mount.source, config).await?;

            let metadata = load_volume_metadata(project)?;
            let record = metadata
                .get(&mount.source)
                .with_context(|| format!("volume not found: {}", mount.source))?;

            // b, c, d, ... after the root disk on vda.
            let letter = (b'b' + named_index as u8) as char;
            named_index += 1;

            debug!(
                vm = vm_name,
                volume = %mount.source,
                target = %mount.target,
                device = %format!("/dev/vd{letter}"),
                "planned named volume"
            );

            mounts.push(ResolvedMount::Named {
                volume: mount.source.clone(),
                disk_path: record.disk_path.clone(),
                target: mount.target.clone(),
                read_only: mount.read_only,
                guest_device: format!("/dev/vd{letter}"),
            });
        }
    }

    Ok(MountPlan { mounts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VolumeMount;

    fn test_project() -> (tempfile::TempDir, Project) {
        let tmp = tempfile::TempDir::new().unwrap();
        let compose = tmp.path().join("qemu-compose.yaml");
        std::fs::write(&compose, "vms: {}\n").unwrap();
        let project = Project::from_compose_path(compose.canonicalize().unwrap()).unwrap();
        (tmp, project)
    }

    #[test]
    fn bind_path_resolves_relative_to_compose_file() {
        let (tmp, project) = test_project();
        std::fs::create_dir(tmp.path().join("cfg")).unwrap();

        let resolved = resolve_bind_mount_path("./cfg", &project.compose_path).unwrap();
        assert_eq!(resolved, project.dir().join("./cfg"));

        let err = resolve_bind_mount_path("./missing", &project.compose_path).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn absolute_bind_path_is_used_verbatim() {
        let (tmp, project) = test_project();
        let dir = tmp.path().join("srv");
        std::fs::create_dir(&dir).unwrap();

        let resolved =
            resolve_bind_mount_path(&dir.to_string_lossy(), &project.compose_path).unwrap();
        assert_eq!(resolved, dir);
    }

    #[test]
    fn metadata_round_trips() {
        let (_tmp, project) = test_project();

        assert!(load_volume_metadata(&project).unwrap().is_empty());

        let mut metadata = BTreeMap::new();
        metadata.insert(
            "data".to_string(),
            VolumeMetadata {
                name: "data".into(),
                size: "5G".into(),
                disk_path: PathBuf::from("/tmp/x/volume.qcow2"),
                created: "2025-01-01T00:00:00Z".into(),
            },
        );
        save_volume_metadata(&project, &metadata).unwrap();

        let loaded = load_volume_metadata(&project).unwrap();
        assert_eq!(loaded["data"].size, "5G");
    }

    #[tokio::test]
    async fn plan_assigns_devices_and_tags_in_order() {
        let (tmp, project) = test_project();
        std::fs::create_dir(tmp.path().join("cfg")).unwrap();
        std::fs::create_dir(tmp.path().join("media")).unwrap();

        // Pre-seed volume records so planning needs no qemu-img/nbd.
        let mut metadata = BTreeMap::new();
        for name in ["data", "logs"] {
            metadata.insert(
                name.to_string(),
                VolumeMetadata {
                    name: name.into(),
                    size: "10G".into(),
                    disk_path: tmp.path().join(name).join("volume.qcow2"),
                    created: "2025-01-01T00:00:00Z".into(),
                },
            );
        }
        save_volume_metadata(&project, &metadata).unwrap();

        let config: ComposeConfig = serde_yaml::from_str(
            r#"
volumes:
  data: {size: 10G}
  logs: {size: 10G}
vms: {}
"#,
        )
        .unwrap();

        let vm = VmConfig {
            image: "https://x/i.img".into(),
            cpu: 1,
            memory: 512,
            networks: vec![],
            ports: vec![],
            depends_on: vec![],
            volumes: vec![
                VolumeMount::parse_short_form("data:/var/lib/db").unwrap(),
                VolumeMount::parse_short_form("./cfg:/etc/app:ro").unwrap(),
                VolumeMount::parse_short_form("logs:/var/log/app").unwrap(),
                VolumeMount::parse_short_form("./media:/media").unwrap(),
            ],
            environment: vec![],
            provision: vec![],
            disk: None,
            healthcheck: None,
            ssh: None,
        };

        let plan = plan_mounts(&project, "db", &vm, &config).await.unwrap();
        assert_eq!(plan.mounts.len(), 4);
        assert!(plan.has_bind_mounts());

        match &plan.mounts[0] {
            ResolvedMount::Named { guest_device, .. } => assert_eq!(guest_device, "/dev/vdb"),
            other => panic!("expected named volume, got {other:?}"),
        }
        match &plan.mounts[1] {
            ResolvedMount::Bind { tag, read_only, .. } => {
                assert_eq!(tag, "mount0");
                assert!(read_only);
            }
            other => panic!("expected bind mount, got {other:?}"),
        }
        match &plan.mounts[2] {
            ResolvedMount::Named { guest_device, .. } => assert_eq!(guest_device, "/dev/vdc"),
            other => panic!("expected named volume, got {other:?}"),
        }
        match &plan.mounts[3] {
            ResolvedMount::Bind { tag, .. } => assert_eq!(tag, "mount1"),
            other => panic!("expected bind mount, got {other:?}"),
        }
    }
}

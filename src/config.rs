//! Compose document model.
//!
//! Parses `qemu-compose.yaml` and validates it before any side effect:
//! malformed documents, unknown short-form volume flags, relative mount
//! targets and dangling named-volume references are all rejected at load
//! time.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
pub struct ComposeConfig {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub networks: BTreeMap<String, NetworkConfig>,
    #[serde(default)]
    pub volumes: BTreeMap<String, VolumeConfig>,
    pub vms: BTreeMap<String, VmConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub driver: String,
    #[serde(default)]
    pub subnet: String,
}

impl NetworkConfig {
    pub fn driver_or_default(&self) -> &str {
        if self.driver.is_empty() {
            "bridge"
        } else {
            &self.driver
        }
    }

    /// True when the subnet must come from the allocation pool.
    pub fn wants_auto_subnet(&self) -> bool {
        self.subnet.is_empty() || self.subnet == "auto"
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VolumeConfig {
    #[serde(default)]
    pub size: String,
}

impl VolumeConfig {
    pub fn size_or_default(&self) -> &str {
        if self.size.is_empty() {
            "10G"
        } else {
            &self.size
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VmConfig {
    pub image: String,
    pub cpu: u32,
    pub memory: u32,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    #[serde(default)]
    pub environment: Vec<String>,
    #[serde(default)]
    pub provision: Vec<Provision>,
    #[serde(default)]
    pub disk: Option<DiskConfig>,
    #[serde(default)]
    pub healthcheck: Option<Healthcheck>,
    #[serde(default)]
    pub ssh: Option<SshConfig>,
}

impl VmConfig {
    /// Only HTTP(S) image references participate in pull/up.
    pub fn has_url_image(&self) -> bool {
        self.image.starts_with("http://") || self.image.starts_with("https://")
    }

    pub fn disk_size(&self) -> &str {
        match &self.disk {
            Some(disk) if !disk.size.is_empty() => &disk.size,
            _ => "10G",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Provision {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub inline: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiskConfig {
    #[serde(default)]
    pub size: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Healthcheck {
    #[serde(default)]
    pub test: Vec<String>,
    #[serde(default)]
    pub interval: String,
    #[serde(default)]
    pub timeout: String,
    #[serde(default)]
    pub retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    #[serde(default)]
    pub port: u16,
}

/// A volume mount entry, accepted either as `"source:target[:flags]"` or
/// as a mapping with `source`/`target`/`read_only`/`automount`/
/// `mount_options` fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeMount {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
    /// None means "use the default" (mount automatically).
    #[serde(default)]
    pub automount: Option<bool>,
    #[serde(default)]
    pub mount_options: String,
}

impl VolumeMount {
    /// Parse the short form `source:target[:flag,...]`. `ro` is the only
    /// recognized flag.
    pub fn parse_short_form(spec: &str) -> Result<Self> {
        let parts: Vec<&str> = spec.split(':').collect();
        if parts.len() < 2 || parts[0].is_empty() || parts[1].is_empty() {
            bail!(
                "invalid volume spec: {spec} (expected format: source:target or source:target:flags)"
            );
        }

        let mut mount = VolumeMount {
            source: parts[0].to_string(),
            target: parts[1].to_string(),
            read_only: false,
            automount: None,
            mount_options: String::new(),
        };

        for flag in parts[2..].iter().flat_map(|p| p.split(',')) {
            match flag {
                "ro" => mount.read_only = true,
                other => bail!("unknown volume flag: {other}"),
            }
        }

        Ok(mount)
    }

    /// Render back to the short form where it is expressible (no
    /// automount override, no custom mount options).
    pub fn to_short_form(&self) -> Option<String> {
        if self.automount.is_some() || !self.mount_options.is_empty() {
            return None;
        }
        if self.read_only {
            Some(format!("{}:{}:ro", self.source, self.target))
        } else {
            Some(format!("{}:{}", self.source, self.target))
        }
    }

    /// A source containing a path separator or starting with `.` is a
    /// bind mount; anything else names a top-level volume.
    pub fn is_bind_mount(&self) -> bool {
        self.source.contains('/') || self.source.contains('\\') || self.source.starts_with('.')
    }

    pub fn automount_or_default(&self) -> bool {
        self.automount.unwrap_or(true)
    }
}

impl<'de> Deserialize<'de> for VolumeMount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Form {
            Short(String),
            Long {
                source: String,
                target: String,
                #[serde(default)]
                read_only: bool,
                #[serde(default)]
                automount: Option<bool>,
                #[serde(default)]
                mount_options: String,
            },
        }

        match Form::deserialize(deserializer)? {
            Form::Short(spec) => VolumeMount::parse_short_form(&spec).map_err(de::Error::custom),
            Form::Long {
                source,
                target,
                read_only,
                automount,
                mount_options,
            } => Ok(VolumeMount {
                source,
                target,
                read_only,
                automount,
                mount_options,
            }),
        }
    }
}

fn valid_vm_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// Load and validate a compose file.
pub fn load_compose_file(path: &Path) -> Result<ComposeConfig> {
    debug!(path = %path.display(), "loading compose file");

    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read compose file: {}", path.display()))?;

    let config: ComposeConfig =
        serde_yaml::from_str(&data).context("failed to parse compose file")?;

    validate(&config)?;

    debug!(
        version = %config.version,
        vms = config.vms.len(),
        "parsed compose file"
    );

    Ok(config)
}

fn validate(config: &ComposeConfig) -> Result<()> {
    for (vm_name, vm) in &config.vms {
        if !valid_vm_name(vm_name) {
            bail!("invalid VM name: {vm_name} (allowed: alphanumeric and dash)");
        }
        if vm.image.is_empty() {
            bail!("VM {vm_name}: missing required field 'image'");
        }
        if vm.cpu == 0 {
            bail!("VM {vm_name}: missing required field 'cpu'");
        }
        if vm.memory == 0 {
            bail!("VM {vm_name}: missing required field 'memory'");
        }

        for network in &vm.networks {
            let net = config
                .networks
                .get(network)
                .with_context(|| format!("VM {vm_name}: network not defined: {network}"))?;
            let driver = net.driver_or_default();
            if driver != "bridge" {
                bail!("network {network}: unsupported driver: {driver}");
            }
        }

        for mount in &vm.volumes {
            if !mount.target.starts_with('/') {
                bail!(
                    "invalid mount path for VM {vm_name}: {} (must be absolute path)",
                    mount.target
                );
            }
            if !mount.is_bind_mount() && !config.volumes.contains_key(&mount.source) {
                bail!("VM {vm_name}: volume not defined in compose file: {}", mount.source);
            }
        }
    }

    Ok(())
}

/// Restrict a VM map to the named subset, or return all of them when the
/// selection is empty.
pub fn filter_vms<'a>(
    config: &'a ComposeConfig,
    names: &[String],
) -> Result<BTreeMap<&'a str, &'a VmConfig>> {
    if names.is_empty() {
        return Ok(config
            .vms
            .iter()
            .map(|(name, vm)| (name.as_str(), vm))
            .collect());
    }

    let mut filtered = BTreeMap::new();
    for name in names {
        let (key, vm) = config
            .vms
            .get_key_value(name)
            .with_context(|| format!("VM not found in compose file: {name}"))?;
        filtered.insert(key.as_str(), vm);
    }
    Ok(filtered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Result<ComposeConfig> {
        let config: ComposeConfig = serde_yaml::from_str(yaml)?;
        validate(&config)?;
        Ok(config)
    }

    const MINIMAL: &str = r#"
version: "1"
vms:
  vm1:
    image: https://example.com/images/cloud.img
    cpu: 2
    memory: 2048
"#;

    #[test]
    fn parses_minimal_compose() {
        let config = parse(MINIMAL).unwrap();
        let vm = &config.vms["vm1"];
        assert_eq!(vm.cpu, 2);
        assert_eq!(vm.memory, 2048);
        assert!(vm.has_url_image());
        assert_eq!(vm.disk_size(), "10G");
    }

    #[test]
    fn parses_short_and_long_volume_forms() {
        let config = parse(
            r#"
vms:
  db:
    image: https://example.com/cloud.img
    cpu: 1
    memory: 512
    volumes:
      - data:/var/lib/db
      - ./cfg:/etc/app:ro
      - source: /srv/media
        target: /media
        read_only: true
        automount: false
        mount_options: "trans=virtio,version=9p2000.L,msize=104857600"
volumes:
  data:
    size: 5G
"#,
        )
        .unwrap();

        let mounts = &config.vms["db"].volumes;
        assert_eq!(mounts.len(), 3);

        assert!(!mounts[0].is_bind_mount());
        assert_eq!(mounts[0].target, "/var/lib/db");

        assert!(mounts[1].is_bind_mount());
        assert!(mounts[1].read_only);
        assert_eq!(mounts[1].automount, None);

        assert!(mounts[2].is_bind_mount());
        assert_eq!(mounts[2].automount, Some(false));
        assert!(mounts[2].mount_options.contains("msize"));
    }

    #[test]
    fn rejects_unknown_short_form_flag() {
        let err = parse(
            r#"
vms:
  vm1:
    image: https://example.com/cloud.img
    cpu: 1
    memory: 512
    volumes:
      - ./data:/data:rw
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown volume flag"), "{err}");
    }

    #[test]
    fn rejects_relative_target() {
        let err = parse(
            r#"
vms:
  vm1:
    image: https://example.com/cloud.img
    cpu: 1
    memory: 512
    volumes:
      - ./data:relative/path
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("must be absolute path"));
    }

    #[test]
    fn rejects_undeclared_named_volume() {
        let err = parse(
            r#"
vms:
  vm1:
    image: https://example.com/cloud.img
    cpu: 1
    memory: 512
    volumes:
      - data:/data
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("volume not defined"));
    }

    #[test]
    fn rejects_missing_required_fields() {
        assert!(parse("vms:\n  vm1:\n    image: https://x/i.img\n    cpu: 2\n").is_err());
        assert!(parse("vms:\n  vm1:\n    image: https://x/i.img\n    memory: 512\n").is_err());
    }

    #[test]
    fn rejects_invalid_vm_name() {
        let err = parse(
            "vms:\n  \"bad name\":\n    image: https://x/i.img\n    cpu: 1\n    memory: 512\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid VM name"));
    }

    #[test]
    fn rejects_non_bridge_driver() {
        let err = parse(
            r#"
networks:
  overlay0:
    driver: overlay
vms:
  vm1:
    image: https://x/i.img
    cpu: 1
    memory: 512
    networks: [overlay0]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unsupported driver"));
    }

    #[test]
    fn short_form_round_trips() {
        for spec in ["data:/var/lib/db", "./cfg:/etc/app:ro", "/abs/dir:/mnt"] {
            let mount = VolumeMount::parse_short_form(spec).unwrap();
            let rendered = mount.to_short_form().unwrap();
            let reparsed = VolumeMount::parse_short_form(&rendered).unwrap();
            assert_eq!(mount, reparsed, "round-trip of {spec}");
        }
    }

    #[test]
    fn filter_selects_subset() {
        let config = parse(
            r#"
vms:
  web:
    image: https://x/i.img
    cpu: 1
    memory: 512
  api:
    image: https://x/i.img
    cpu: 1
    memory: 512
"#,
        )
        .unwrap();

        let all = filter_vms(&config, &[]).unwrap();
        assert_eq!(all.len(), 2);

        let some = filter_vms(&config, &["api".to_string()]).unwrap();
        assert_eq!(some.len(), 1);
        assert!(some.contains_key("api"));

        assert!(filter_vms(&config, &["ghost".to_string()]).is_err());
    }
}

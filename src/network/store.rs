//! Persisted network metadata (`networks.json`).

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::project::Project;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkRecord {
    pub subnet: String,
    pub driver: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dnsmasq_unit: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dnsmasq_active: bool,
}

/// In-memory view of `networks.json`. The fabric manager is its sole
/// writer; load, mutate, save within one locked operation.
#[derive(Debug, Clone, Default)]
pub struct NetworkStore {
    networks: BTreeMap<String, NetworkRecord>,
}

impl NetworkStore {
    pub fn load(project: &Project) -> Result<Self> {
        let path = project.networks_json_path()?;
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()))
            }
        };

        let networks = serde_json::from_str(&data)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Self { networks })
    }

    pub fn save(&self, project: &Project) -> Result<()> {
        let path = project.networks_json_path()?;
        let data =
            serde_json::to_string_pretty(&self.networks).context("serializing network metadata")?;
        std::fs::write(&path, data)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn networks(&self) -> &BTreeMap<String, NetworkRecord> {
        &self.networks
    }

    pub fn get(&self, name: &str) -> Option<&NetworkRecord> {
        self.networks.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut NetworkRecord> {
        self.networks.get_mut(name)
    }

    pub fn insert(&mut self, name: String, record: NetworkRecord) {
        self.networks.insert(name, record);
    }

    pub fn remove(&mut self, name: &str) -> Option<NetworkRecord> {
        self.networks.remove(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_project() -> (tempfile::TempDir, Project) {
        let tmp = tempfile::TempDir::new().unwrap();
        let compose = tmp.path().join("qemu-compose.yaml");
        std::fs::write(&compose, "vms: {}\n").unwrap();
        let project = Project::from_compose_path(compose.canonicalize().unwrap()).unwrap();
        (tmp, project)
    }

    #[test]
    fn empty_store_when_file_absent() {
        let (_tmp, project) = test_project();
        let store = NetworkStore::load(&project).unwrap();
        assert!(store.networks().is_empty());
    }

    #[test]
    fn round_trips_records() {
        let (_tmp, project) = test_project();

        let mut store = NetworkStore::load(&project).unwrap();
        store.insert(
            "frontend".into(),
            NetworkRecord {
                subnet: "172.16.0.0/24".into(),
                driver: "bridge".into(),
                dnsmasq_unit: "qemu-compose-dnsmasq-p-frontend".into(),
                dnsmasq_active: true,
            },
        );
        store.save(&project).unwrap();

        let loaded = NetworkStore::load(&project).unwrap();
        let record = loaded.get("frontend").unwrap();
        assert_eq!(record.subnet, "172.16.0.0/24");
        assert!(record.dnsmasq_active);
    }

    #[test]
    fn remove_persists() {
        let (_tmp, project) = test_project();

        let mut store = NetworkStore::default();
        store.insert(
            "net".into(),
            NetworkRecord {
                subnet: "172.16.0.0/24".into(),
                driver: "bridge".into(),
                dnsmasq_unit: String::new(),
                dnsmasq_active: false,
            },
        );
        store.save(&project).unwrap();

        let mut loaded = NetworkStore::load(&project).unwrap();
        assert!(loaded.remove("net").is_some());
        loaded.save(&project).unwrap();

        assert!(NetworkStore::load(&project).unwrap().networks().is_empty());
    }
}

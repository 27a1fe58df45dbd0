//! Project location and workspace layout.
//!
//! A project is identified by the directory holding its compose file; all
//! mutable state lives in a `.qemu-compose/` workspace next to that file.
//! The global image cache is the only per-user location.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use nix::fcntl::{Flock, FlockArg};

/// File names probed in the current directory when neither `-f` nor
/// `QEMU_COMPOSE_FILE` selects a compose file.
const DEFAULT_FILES: [&str; 2] = ["qemu-compose.yaml", "qemu-compose.yml"];

pub const WORKSPACE_DIR: &str = ".qemu-compose";

/// Resolved project context, threaded explicitly through every component.
#[derive(Debug, Clone)]
pub struct Project {
    /// Absolute path of the compose file.
    pub compose_path: PathBuf,
    /// Basename of the compose file's directory.
    pub name: String,
}

impl Project {
    /// Resolve the compose file: `-f` flag, then `QEMU_COMPOSE_FILE`,
    /// then `qemu-compose.yaml` / `qemu-compose.yml` in the current
    /// directory.
    pub fn locate(file_flag: Option<&Path>) -> Result<Self> {
        let candidate = match file_flag {
            Some(path) => path.to_path_buf(),
            None => match std::env::var_os("QEMU_COMPOSE_FILE") {
                Some(env) => PathBuf::from(env),
                None => DEFAULT_FILES
                    .iter()
                    .map(PathBuf::from)
                    .find(|p| p.exists())
                    .context(
                        "no qemu-compose.yaml or qemu-compose.yml found in current directory",
                    )?,
            },
        };

        if !candidate.exists() {
            bail!("compose file not found: {}", candidate.display());
        }

        let compose_path = candidate
            .canonicalize()
            .with_context(|| format!("resolving compose file path: {}", candidate.display()))?;

        Self::from_compose_path(compose_path)
    }

    pub fn from_compose_path(compose_path: PathBuf) -> Result<Self> {
        let name = compose_path
            .parent()
            .and_then(|dir| dir.file_name())
            .and_then(|base| base.to_str())
            .map(|base| base.replace(' ', "-"))
            .unwrap_or_else(|| "default".to_string());

        Ok(Self { compose_path, name })
    }

    /// Directory containing the compose file; bind-mount sources resolve
    /// relative to it.
    pub fn dir(&self) -> &Path {
        self.compose_path.parent().unwrap_or(Path::new("/"))
    }

    /// Project workspace root, created on demand.
    pub fn workspace(&self) -> Result<PathBuf> {
        let dir = self.dir().join(WORKSPACE_DIR);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating workspace directory: {}", dir.display()))?;
        Ok(dir)
    }

    /// Per-VM state directory under the workspace, created on demand.
    pub fn instance_dir(&self, vm_name: &str) -> Result<PathBuf> {
        let dir = self.workspace()?.join(vm_name);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating instance directory: {}", dir.display()))?;
        Ok(dir)
    }

    pub fn instance_disk_path(&self, vm_name: &str) -> Result<PathBuf> {
        Ok(self.instance_dir(vm_name)?.join("disk.qcow2"))
    }

    pub fn console_socket_path(&self, vm_name: &str) -> Result<PathBuf> {
        Ok(self.instance_dir(vm_name)?.join("console.sock"))
    }

    pub fn networks_json_path(&self) -> Result<PathBuf> {
        Ok(self.workspace()?.join("networks.json"))
    }

    pub fn volumes_json_path(&self) -> Result<PathBuf> {
        Ok(self.workspace()?.join("volumes.json"))
    }

    pub fn volumes_dir(&self) -> Result<PathBuf> {
        let dir = self.workspace()?.join("volumes");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating volumes directory: {}", dir.display()))?;
        Ok(dir)
    }

    pub fn ssh_dir(&self) -> Result<PathBuf> {
        Ok(self.workspace()?.join("ssh"))
    }

    /// Take the exclusive workspace lock. Mutating operations hold this
    /// for their whole duration; concurrent invocations fail fast rather
    /// than corrupting read-modify-write state files.
    pub fn lock(&self) -> Result<WorkspaceLock> {
        let lock_path = self.workspace()?.join(".lock");
        let file = File::create(&lock_path)
            .with_context(|| format!("creating lock file: {}", lock_path.display()))?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => Ok(WorkspaceLock { _flock: flock }),
            Err((_, errno)) if errno == nix::errno::Errno::EWOULDBLOCK => bail!(
                "another qemu-compose operation is already running on project '{}'",
                self.name
            ),
            Err((_, errno)) => {
                Err(errno).with_context(|| format!("locking {}", lock_path.display()))
            }
        }
    }
}

/// Held for the duration of a mutating operation; the flock is released
/// when the guard drops.
#[derive(Debug)]
pub struct WorkspaceLock {
    _flock: Flock<File>,
}

/// Per-user image cache directory, shared across projects.
pub fn image_cache_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("", "", "qemu-compose")
        .context("could not determine user data directory")?;
    let cache = dirs.data_dir().join("images");
    std::fs::create_dir_all(&cache)
        .with_context(|| format!("creating image cache directory: {}", cache.display()))?;
    Ok(cache)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project_in(dir: &Path) -> Project {
        let compose = dir.join("qemu-compose.yaml");
        std::fs::write(&compose, "version: '1'\nvms: {}\n").unwrap();
        Project::from_compose_path(compose.canonicalize().unwrap()).unwrap()
    }

    #[test]
    fn project_name_is_directory_basename() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("shop-backend");
        std::fs::create_dir(&dir).unwrap();
        let project = project_in(&dir);
        assert_eq!(project.name, "shop-backend");
    }

    #[test]
    fn workspace_paths_are_project_local() {
        let tmp = tempfile::TempDir::new().unwrap();
        let project = project_in(tmp.path());

        let disk = project.instance_disk_path("web").unwrap();
        assert!(disk.ends_with(".qemu-compose/web/disk.qcow2"));
        assert!(disk.parent().unwrap().is_dir());

        let nets = project.networks_json_path().unwrap();
        assert!(nets.ends_with(".qemu-compose/networks.json"));
    }

    #[test]
    fn missing_flag_path_is_an_error() {
        let err = Project::locate(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
        assert!(err.to_string().contains("compose file not found"));
    }

    #[test]
    fn second_lock_fails_fast() {
        let tmp = tempfile::TempDir::new().unwrap();
        let project = project_in(tmp.path());

        let _held = project.lock().unwrap();
        let err = project.lock().unwrap_err();
        assert!(err.to_string().contains("already running"));
    }
}

//! Mount set for a sandboxed run: the project root read-only, a per-run
//! writable scratch directory, and any extra read-only mounts a scanner
//! needs (e.g. a rule-set cache). Grounded in the base's bash sandbox
//! mount set, corrected so the project root is never bound read-write —
//! an auditor must not be able to mutate the code it's scanning.

use std::path::{Path, PathBuf};

use deepaudit_core::Error;
use tempfile::TempDir;

/// Cap on the writable scratch area so a runaway scanner can't fill the
/// host's tmp filesystem.
pub const SCRATCH_SIZE_CAP_BYTES: u64 = 256 * 1024 * 1024;

pub struct MountPoint {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    pub writable: bool,
}

/// Owns the lifetime of a sandboxed run's scratch directory; dropping this
/// removes it, matching the "on any exit the container is removed" policy.
pub struct SandboxMounts {
    project_root: PathBuf,
    scratch: TempDir,
    extra: Vec<MountPoint>,
}

impl SandboxMounts {
    pub fn new(project_root: impl Into<PathBuf>) -> Result<Self, Error> {
        let scratch = TempDir::with_prefix("deepaudit-sandbox-")
            .map_err(|e| Error::tool("sandbox", format!("cannot create scratch directory: {e}")))?;
        Ok(Self {
            project_root: project_root.into(),
            scratch,
            extra: Vec::new(),
        })
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    /// Add a read-only bind mount beyond the project root, e.g. a cached
    /// scanner rule set fetched once and reused across runs.
    pub fn add_readonly(&mut self, host_path: impl Into<PathBuf>, container_path: impl Into<PathBuf>) {
        self.extra.push(MountPoint {
            host_path: host_path.into(),
            container_path: container_path.into(),
            writable: false,
        });
    }

    pub fn extra_mounts(&self) -> &[MountPoint] {
        &self.extra
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scratch_dir_is_created_and_separate_from_project_root() {
        let dir = tempfile::tempdir().unwrap();
        let mounts = SandboxMounts::new(dir.path()).unwrap();
        assert!(mounts.scratch_dir().exists());
        assert_ne!(mounts.scratch_dir(), dir.path());
    }

    #[test]
    fn test_add_readonly_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let mut mounts = SandboxMounts::new(dir.path()).unwrap();
        mounts.add_readonly("/opt/rules", "/rules");
        assert_eq!(mounts.extra_mounts().len(), 1);
        assert!(!mounts.extra_mounts()[0].writable);
    }
}

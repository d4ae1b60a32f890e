//! The sandbox substrate (C7): an ephemeral isolated process per run, with
//! a read-only project mount, writable tmpfs scratch, resource caps, and
//! network disabled unless a caller opts in. `executor` picks between
//! kernel-namespace isolation and a direct-exec fallback; `mounts` owns the
//! per-run scratch directory and extra read-only binds.

pub mod executor;
pub mod mounts;

pub use executor::{CommandResult, SandboxConfig, SandboxExecutor};
pub use mounts::SandboxMounts;

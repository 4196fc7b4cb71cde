//! Mount handling.
//!
//! Partition mounts acquired here are owning guards: `unmount()` consumes
//! the guard, and `Drop` is a best-effort backstop for paths that bail out
//! before the cleanup queue runs. Mount state queries go through
//! `findmnt`, which is also how we identify the partition backing the
//! booted root.

use std::process::{Command, Stdio};

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::Deserialize;

use abroot_utils::CommandRunExt;

#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("{0} is already mounted")]
    AlreadyMounted(Utf8PathBuf),
    #[error("{0} is not mounted")]
    NotMounted(Utf8PathBuf),
    #[error("{0} is busy")]
    Busy(Utf8PathBuf),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Output of `findmnt` for a single mounted filesystem.
#[derive(Debug, Deserialize)]
pub struct Filesystem {
    pub source: String,
    pub target: String,
    pub fstype: String,
    pub options: String,
    pub uuid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Findmnt {
    filesystems: Vec<Filesystem>,
}

/// Inspect the filesystem mounted at (or containing) `path`.
#[context("Inspecting filesystem {path}")]
pub fn inspect_filesystem(path: &Utf8Path) -> Result<Filesystem> {
    let o: Findmnt = Command::new("findmnt")
        .args(["-J", "-v", "--output=SOURCE,TARGET,FSTYPE,OPTIONS,UUID"])
        .arg(path)
        .log_debug()
        .run_and_parse_json()?;
    o.filesystems
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no filesystem found for {path}"))
}

/// Whether `path` is itself a mount point.
fn is_mountpoint(path: &Utf8Path) -> Result<bool> {
    let status = Command::new("findmnt")
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .context("spawning findmnt")?;
    Ok(status.success())
}

fn classify_mount_failure(target: &Utf8Path, err: anyhow::Error) -> MountError {
    let msg = format!("{err:#}").to_ascii_lowercase();
    if msg.contains("busy") {
        MountError::Busy(target.to_owned())
    } else if msg.contains("not mounted") {
        MountError::NotMounted(target.to_owned())
    } else {
        MountError::Io(err)
    }
}

/// An owned partition mount. The filesystem stays mounted until
/// [`PartitionMount::unmount`] is called (or, as a last resort, until the
/// guard is dropped).
#[derive(Debug)]
pub struct PartitionMount {
    source: Utf8PathBuf,
    // Taken exactly once, by unmount or drop.
    target: Option<Utf8PathBuf>,
}

impl PartitionMount {
    /// Mount the block device `source` at `target`, creating the target
    /// directory if absent.
    pub fn new(source: &Utf8Path, target: &Utf8Path) -> Result<Self, MountError> {
        if is_mountpoint(target)? {
            return Err(MountError::AlreadyMounted(target.to_owned()));
        }
        std::fs::create_dir_all(target)
            .with_context(|| format!("creating mount point {target}"))?;
        tracing::debug!("mounting {source} at {target}");
        Command::new("mount")
            .arg(source)
            .arg(target)
            .log_debug()
            .run()
            .map_err(|e| classify_mount_failure(target, e))?;
        Ok(Self {
            source: source.to_owned(),
            target: Some(target.to_owned()),
        })
    }

    /// The mount target, while mounted.
    pub fn target(&self) -> Option<&Utf8Path> {
        self.target.as_deref()
    }

    // Shared backend for our `unmount` and `drop` implementations.
    fn impl_unmount(&mut self) -> Result<(), MountError> {
        let Some(target) = self.target.take() else {
            tracing::trace!("{} already unmounted", self.source);
            return Ok(());
        };
        tracing::debug!("unmounting {target}");
        Command::new("umount")
            .arg(&target)
            .log_debug()
            .run()
            .map_err(|e| classify_mount_failure(&target, e))
    }

    /// Consume this mount, releasing it.
    pub fn unmount(mut self) -> Result<(), MountError> {
        self.impl_unmount()
    }
}

impl Drop for PartitionMount {
    fn drop(&mut self) {
        // Best effort if we're dropped without invoking `unmount`
        if let Err(e) = self.impl_unmount() {
            tracing::warn!("unmounting {}: {e}", self.source);
        }
    }
}

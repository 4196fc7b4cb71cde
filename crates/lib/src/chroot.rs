//! Chroot sessions for running host tooling inside a staged root.
//!
//! The bootloader generator in particular must believe the staged tree is
//! the live system, so a session binds the reserved kernel filesystems
//! under the target root before any command runs.

use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

use abroot_utils::CommandRunExt;

/// Kernel filesystems bound into the target root, in mount order.
/// Close unmounts them in reverse.
const RESERVED_MOUNTS: &[&str] = &["/dev", "/dev/pts", "/proc", "/run", "/sys"];

#[derive(Debug, thiserror::Error)]
pub enum ChrootError {
    #[error("chroot target {0} does not exist")]
    MissingRoot(Utf8PathBuf),
    #[error("command `{command}` in chroot failed: {status}")]
    CommandFailed {
        command: String,
        status: std::process::ExitStatus,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A chroot-ready environment rooted at a staged system tree.
///
/// The session owns every bind mount it established, the root self-bind
/// included; it must be closed exactly once, and `Drop` is only a
/// backstop. Nested sessions on overlapping roots are not supported.
#[derive(Debug)]
pub struct ChrootSession {
    root: Utf8PathBuf,
    // Bind targets in mount order; taken exactly once by close or drop.
    mounts: Option<Vec<Utf8PathBuf>>,
}

impl ChrootSession {
    /// Bind the reserved kernel filesystems under `root` and return a
    /// session ready to execute commands.
    pub fn open(root: &Utf8Path, root_uuid: &str, root_device: &Utf8Path) -> Result<Self, ChrootError> {
        tracing::debug!("opening chroot at {root} (uuid {root_uuid}, device {root_device})");
        if !root
            .try_exists()
            .with_context(|| format!("checking {root}"))?
        {
            return Err(ChrootError::MissingRoot(root.to_owned()));
        }

        let mut established: Vec<Utf8PathBuf> = Vec::new();

        // Workaround: grub-mkconfig cannot discover the backing device
        // from inside the chroot unless the target root is bind-mounted
        // onto itself. The original runs `mount --bind / /` through the
        // chroot; resolved against the host that is `root` onto `root`.
        Command::new("mount")
            .arg("--bind")
            .arg(root)
            .arg(root)
            .log_debug()
            .run()
            .with_context(|| format!("bind-mounting {root} onto itself"))?;
        established.push(root.to_owned());

        for mount in RESERVED_MOUNTS {
            let target = root.join(mount.trim_start_matches('/'));
            let r = std::fs::create_dir_all(&target)
                .with_context(|| format!("creating {target}"))
                .and_then(|()| {
                    Command::new("mount")
                        .arg("--bind")
                        .arg(mount)
                        .arg(&target)
                        .log_debug()
                        .run()
                        .with_context(|| format!("bind-mounting {mount}"))
                });
            if let Err(e) = r {
                // Unwind whatever we managed to establish so a failed open
                // owns nothing.
                for target in established.iter().rev() {
                    let _ = Command::new("umount").arg(target).run();
                }
                return Err(e.into());
            }
            established.push(target);
        }

        Ok(Self {
            root: root.to_owned(),
            mounts: Some(established),
        })
    }

    /// Run a command inside the chroot through `/bin/sh -c`, with the
    /// caller's standard streams. A non-zero exit status is an error.
    pub fn execute(&mut self, cmd: &str, args: &[&str]) -> Result<(), ChrootError> {
        let command = std::iter::once(cmd)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        tracing::debug!("chroot {}: {command}", self.root);
        let status = Command::new("chroot")
            .arg(&self.root)
            .args(["/bin/sh", "-c", command.as_str()])
            .status()
            .with_context(|| format!("spawning chroot for `{command}`"))?;
        if !status.success() {
            return Err(ChrootError::CommandFailed { command, status });
        }
        Ok(())
    }

    /// Run commands sequentially, stopping at the first failure.
    pub fn execute_all<'a>(
        &mut self,
        cmds: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), ChrootError> {
        for cmd in cmds {
            self.execute(cmd, &[])?;
        }
        Ok(())
    }

    // Shared backend for our `close` and `drop` implementations.
    fn impl_close(&mut self) -> Result<(), ChrootError> {
        let Some(mounts) = self.mounts.take() else {
            tracing::trace!("chroot at {} already closed", self.root);
            return Ok(());
        };
        let mut first_error = None;
        for target in mounts.iter().rev() {
            if let Err(e) = Command::new("umount").arg(target).log_debug().run() {
                // Keep unmounting the rest; report the first failure.
                tracing::warn!("unmounting {target}: {e:#}");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(ChrootError::Other(e)),
        }
    }

    /// Consume this session, unmounting everything it bound in reverse
    /// order. Every unmount is attempted even if an earlier one fails;
    /// the first error is reported.
    pub fn close(mut self) -> Result<(), ChrootError> {
        self.impl_close()
    }
}

impl Drop for ChrootSession {
    fn drop(&mut self) {
        // Best effort if we're dropped without invoking `close`
        if let Err(e) = self.impl_close() {
            tracing::warn!("closing chroot at {}: {e}", self.root);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_root() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(td.path().join("nonexistent")).unwrap();
        let e = ChrootSession::open(&root, "abc-123", Utf8Path::new("/dev/null")).unwrap_err();
        assert!(matches!(e, ChrootError::MissingRoot(_)), "{e}");
    }

    #[test]
    fn test_reserved_mount_order() {
        // /dev/pts must come after /dev, since it resolves inside the
        // bound /dev tree.
        let dev = RESERVED_MOUNTS.iter().position(|m| *m == "/dev").unwrap();
        let pts = RESERVED_MOUNTS
            .iter()
            .position(|m| *m == "/dev/pts")
            .unwrap();
        assert!(dev < pts);
    }
}

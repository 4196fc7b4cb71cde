//! Atomic exchange of two paths.
//!
//! This is the primitive every commit in the upgrade transaction is built
//! on: `renameat2(..., RENAME_EXCHANGE)` swaps two names on the same
//! filesystem with no intermediate observable state. A userspace
//! rename-aside/rename-back dance is not equivalent; a crash in the
//! middle of it leaves one name missing, which is exactly what this
//! module exists to rule out.

use camino::{Utf8Path, Utf8PathBuf};
use rustix::fs::{renameat_with, RenameFlags, CWD};
use rustix::io::Errno;

#[derive(Debug, thiserror::Error)]
pub enum SwapError {
    #[error("cannot exchange {a} and {b}: one of them does not exist")]
    NotFound { a: Utf8PathBuf, b: Utf8PathBuf },
    #[error("cannot exchange {a} and {b}: paths are on different filesystems")]
    CrossDevice { a: Utf8PathBuf, b: Utf8PathBuf },
    #[error("exchange rename is not supported here")]
    Unsupported(#[source] std::io::Error),
    #[error("exchanging {a} and {b}")]
    Io {
        a: Utf8PathBuf,
        b: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Atomically swap the inodes reachable at `a` and `b`. Both paths must
/// exist on the same mounted filesystem. On success every observer sees
/// either the old or the new state of each name, never an absent name.
///
/// The syscall takes the two paths directly; no file descriptors for the
/// operands are needed (or opened).
pub fn atomic_swap(a: &Utf8Path, b: &Utf8Path) -> Result<(), SwapError> {
    tracing::debug!("exchanging {a} <-> {b}");
    renameat_with(CWD, a.as_std_path(), CWD, b.as_std_path(), RenameFlags::EXCHANGE).map_err(
        |errno| {
            let (a, b) = (a.to_owned(), b.to_owned());
            if errno == Errno::NOENT {
                SwapError::NotFound { a, b }
            } else if errno == Errno::XDEV {
                SwapError::CrossDevice { a, b }
            } else if errno == Errno::INVAL || errno == Errno::NOSYS || errno == Errno::NOTSUP {
                SwapError::Unsupported(errno.into())
            } else {
                SwapError::Io {
                    a,
                    b,
                    source: errno.into(),
                }
            }
        },
    )
}

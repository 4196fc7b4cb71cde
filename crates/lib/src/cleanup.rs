//! The per-transaction cleanup queue.
//!
//! Resources acquired during staging (the future partition mount, the
//! chroot session, the boot partition mount) outlive the stage that
//! acquired them, so they are parked here and released in LIFO order once
//! the transaction finishes, successfully or not. Resources that stay
//! within one stage rely on their own guards instead.

use anyhow::{Context, Result};

use crate::chroot::ChrootSession;
use crate::mount::PartitionMount;

/// One queued compensating action, with its arguments bound.
pub(crate) enum CleanupEntry {
    UnmountPartition(PartitionMount),
    CloseChroot(ChrootSession),
    #[cfg(test)]
    Probe {
        id: usize,
        fail: bool,
        log: std::sync::Arc<std::sync::Mutex<Vec<usize>>>,
    },
}

impl CleanupEntry {
    fn describe(&self) -> String {
        match self {
            CleanupEntry::UnmountPartition(m) => match m.target() {
                Some(t) => format!("unmounting {t}"),
                None => "unmounting (already released)".to_string(),
            },
            CleanupEntry::CloseChroot(_) => "closing chroot session".to_string(),
            #[cfg(test)]
            CleanupEntry::Probe { id, .. } => format!("probe {id}"),
        }
    }

    fn run(self) -> Result<()> {
        match self {
            CleanupEntry::UnmountPartition(m) => m.unmount().map_err(anyhow::Error::new),
            CleanupEntry::CloseChroot(c) => c.close().map_err(anyhow::Error::new),
            #[cfg(test)]
            CleanupEntry::Probe { id, fail, log } => {
                log.lock().unwrap().push(id);
                if fail {
                    anyhow::bail!("probe {id} failed");
                }
                Ok(())
            }
        }
    }
}

/// LIFO queue of cleanup actions, owned by one transaction. Created fresh
/// per transaction; nothing here survives into the next one.
#[derive(Default)]
pub(crate) struct CleanupQueue {
    entries: Vec<CleanupEntry>,
}

impl CleanupQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, entry: CleanupEntry) {
        self.entries.push(entry);
    }

    /// Discard all entries without running them. Only meaningful at the
    /// very start of a transaction; discarding live entries hands their
    /// release over to the guards' drop backstops.
    pub(crate) fn reset(&mut self) {
        self.entries.clear();
    }

    /// Pop and run every entry, newest first. A failing entry never stops
    /// the drain; all errors are returned.
    pub(crate) fn drain(&mut self) -> Vec<anyhow::Error> {
        let mut errors = Vec::new();
        while let Some(entry) = self.entries.pop() {
            let what = entry.describe();
            tracing::debug!("cleanup: {what}");
            if let Err(e) = entry.run().with_context(|| what) {
                errors.push(e);
            }
        }
        errors
    }
}

//! The package manager hook.
//!
//! Users queue package operations against the *next* root; the queue
//! lives in small line-oriented lists under `/etc/abroot`. At transaction
//! time the whole queue collapses into one shell command that the image
//! recipe layers on top of the pulled base image.

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use fn_error_context::context;

/// Directory holding the queued package operations.
const PKG_STATE_DIR: &str = "/etc/abroot";

const ADD_LIST: &str = "packages.add";
const REMOVE_LIST: &str = "packages.remove";

pub(crate) struct PackageManager {
    state_dir: Utf8PathBuf,
}

impl PackageManager {
    pub(crate) fn new() -> Self {
        Self {
            state_dir: PKG_STATE_DIR.into(),
        }
    }

    #[cfg(test)]
    fn with_state_dir(state_dir: Utf8PathBuf) -> Self {
        Self { state_dir }
    }

    fn read_list(&self, name: &str) -> Result<Vec<String>> {
        let path = self.state_dir.join(name);
        let contents = match std::fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("reading {path}")),
        };
        Ok(contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(ToOwned::to_owned)
            .collect())
    }

    /// Render all queued operations as a single shell command, or the
    /// empty string when nothing is queued.
    #[context("Computing package manager final command")]
    pub(crate) fn final_command(&self) -> Result<String> {
        let adds = self.read_list(ADD_LIST)?;
        let removes = self.read_list(REMOVE_LIST)?;
        let mut parts = Vec::new();
        if !adds.is_empty() {
            parts.push(format!("apt-get install -y {}", adds.join(" ")));
        }
        if !removes.is_empty() {
            parts.push(format!("apt-get purge -y {}", removes.join(" ")));
        }
        Ok(parts.join(" && "))
    }
}

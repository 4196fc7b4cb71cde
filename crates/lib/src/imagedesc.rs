//! The on-disk image descriptor.
//!
//! Every root partition carries `abimage.abr` at its top level, recording
//! which image produced the `.system/` tree next to it. During a
//! transaction the future partition briefly holds a second descriptor,
//! `abimage-new.abr`, until the commit exchanges the two.

use std::io::Write;

use anyhow::{Context, Result};
use camino::Utf8Path;
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use chrono::{DateTime, Utc};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

/// File name of the canonical descriptor at a partition root.
pub const DESCRIPTOR_FILENAME: &str = "abimage.abr";

/// Descriptor file name for the given suffix; the empty suffix names the
/// canonical file.
pub fn descriptor_filename(suffix: &str) -> String {
    if suffix.is_empty() {
        DESCRIPTOR_FILENAME.to_string()
    } else {
        format!("abimage-{suffix}.abr")
    }
}

/// Records the content digest and origin of the root tree it sits next to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDescriptor {
    /// Content digest of the image, e.g. `sha256:…`. Opaque.
    pub digest: String,
    /// Origin reference: registry, name and tag.
    pub image: String,
    /// When this descriptor was written. Informational.
    pub timestamp: DateTime<Utc>,
}

impl ImageDescriptor {
    pub fn new(digest: String, image: String) -> Self {
        Self {
            digest,
            image,
            timestamp: Utc::now(),
        }
    }

    /// Read the canonical descriptor from a partition root.
    #[context("Reading image descriptor from {}", root)]
    pub fn from_root(root: &Utf8Path) -> Result<Self> {
        let path = root.join(DESCRIPTOR_FILENAME);
        let contents =
            std::fs::read(&path).with_context(|| format!("opening {path}"))?;
        serde_json::from_slice(&contents).with_context(|| format!("parsing {path}"))
    }

    /// Persist this descriptor under `mount_point`, replacing any previous
    /// file of the same name. The write goes through a temporary file and
    /// a rename, so a reader can never observe a torn descriptor.
    #[context("Writing image descriptor to {}", mount_point)]
    pub fn write_to(&self, mount_point: &Utf8Path, suffix: &str) -> Result<()> {
        let dir = Dir::open_ambient_dir(mount_point, cap_std::ambient_authority())
            .with_context(|| format!("opening {mount_point}"))?;
        dir.atomic_replace_with(descriptor_filename(suffix), |w| -> Result<()> {
            serde_json::to_writer_pretty(&mut *w, self)?;
            w.write_all(b"\n")?;
            Ok(())
        })?;
        Ok(())
    }
}

//! Host configuration.
//!
//! A single small JSON file names the image to track and the partition
//! labels of the A/B layout. A missing file means stock defaults; a
//! malformed file is an error, not a silent fallback.

use std::path::PathBuf;

use anyhow::{Context, Result};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

/// Default location of the configuration file.
pub const CONFIG_PATH: &str = "/etc/abroot/abroot.json";

/// Environment variable overriding the configuration file location.
pub const CONFIG_PATH_ENV: &str = "ABROOT_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    /// Registry hosting the system image.
    #[serde(default = "default_registry")]
    pub registry: String,
    /// Image name within the registry.
    #[serde(default = "default_name")]
    pub name: String,
    /// Image tag to track.
    #[serde(default = "default_tag")]
    pub tag: String,
    /// Filesystem label of the first root partition.
    #[serde(default = "default_part_label_a")]
    pub part_label_a: String,
    /// Filesystem label of the second root partition.
    #[serde(default = "default_part_label_b")]
    pub part_label_b: String,
    /// Filesystem label of the boot partition.
    #[serde(default = "default_part_label_boot")]
    pub part_label_boot: String,
}

fn default_registry() -> String {
    "ghcr.io/vanilla-os".to_string()
}
fn default_name() -> String {
    "desktop".to_string()
}
fn default_tag() -> String {
    "main".to_string()
}
fn default_part_label_a() -> String {
    "vos-a".to_string()
}
fn default_part_label_b() -> String {
    "vos-b".to_string()
}
fn default_part_label_boot() -> String {
    "vos-boot".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry: default_registry(),
            name: default_name(),
            tag: default_tag(),
            part_label_a: default_part_label_a(),
            part_label_b: default_part_label_b(),
            part_label_boot: default_part_label_boot(),
        }
    }
}

impl Config {
    /// Load the configuration, honoring the path override from the
    /// environment. A missing file yields the defaults.
    #[context("Loading configuration")]
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| CONFIG_PATH.into());
        match std::fs::read(&path) {
            Ok(contents) => serde_json::from_slice(&contents)
                .with_context(|| format!("parsing {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    /// The fully qualified image reference: `registry/name:tag`.
    pub fn full_image_name(&self) -> String {
        format!("{}/{}:{}", self.registry, self.name, self.tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.part_label_a, "vos-a");
        assert_eq!(c.part_label_b, "vos-b");
        assert_eq!(c.part_label_boot, "vos-boot");
        assert_eq!(c.full_image_name(), "ghcr.io/vanilla-os/desktop:main");
    }

    #[test]
    fn test_partial_config() {
        let c: Config = serde_json::from_str(r#"{"registry": "quay.io/example", "tag": "dev"}"#)
            .unwrap();
        assert_eq!(c.full_image_name(), "quay.io/example/desktop:dev");
        assert_eq!(c.part_label_a, "vos-a");
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(serde_json::from_str::<Config>(r#"{"unknown": 1}"#).is_err());
    }
}

use std::process::Command;

use anyhow::{anyhow, Result};
use camino::Utf8Path;
use fn_error_context::context;
use serde::Deserialize;

use abroot_utils::CommandRunExt;

#[derive(Debug, Deserialize)]
struct DevicesOutput {
    blockdevices: Vec<Device>,
}

/// A block device as reported by `lsblk`, together with the filesystem
/// properties role resolution cares about (label, UUID, mount state).
#[derive(Debug, Clone, Deserialize)]
pub struct Device {
    pub name: String,
    #[serde(rename = "type")]
    pub devtype: Option<String>,
    pub children: Option<Vec<Device>>,

    // Filesystem-related properties
    pub label: Option<String>,
    pub uuid: Option<String>,
    pub fstype: Option<String>,
    pub mountpoint: Option<String>,
    pub path: Option<String>,
}

impl Device {
    // Older lsblk doesn't have PATH, so we do it
    pub fn path(&self) -> String {
        self.path.clone().unwrap_or(format!("/dev/{}", &self.name))
    }

    pub fn has_children(&self) -> bool {
        self.children.as_ref().map_or(false, |v| !v.is_empty())
    }

    fn walk<'a>(&'a self, out: &mut Vec<&'a Device>) {
        out.push(self);
        for child in self.children.iter().flatten() {
            child.walk(out);
        }
    }
}

/// Flatten a device tree into all devices (disks and partitions alike),
/// depth first.
pub fn flattened(devices: &[Device]) -> Vec<&Device> {
    let mut out = Vec::new();
    for dev in devices {
        dev.walk(&mut out);
    }
    out
}

/// Flatten a device tree into just the partitions.
pub fn partitions(devices: &[Device]) -> Vec<&Device> {
    flattened(devices)
        .into_iter()
        .filter(|d| d.devtype.as_deref() == Some("part"))
        .collect()
}

fn list_impl(dev: Option<&Utf8Path>) -> Result<Vec<Device>> {
    let mut cmd = Command::new("lsblk");
    cmd.args(["-J", "-b", "-O"]);
    if let Some(dev) = dev {
        cmd.arg(dev);
    }
    let devs: DevicesOutput = cmd.log_debug().run_and_parse_json()?;
    Ok(devs.blockdevices)
}

/// List all block devices known to the kernel.
#[context("Listing block devices")]
pub fn list_all() -> Result<Vec<Device>> {
    list_impl(None)
}

#[context("Listing device {dev}")]
pub fn list_dev(dev: &Utf8Path) -> Result<Device> {
    list_impl(Some(dev))?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no device output from lsblk for {dev}"))
}

//! Resolution of the A/B partition roles.
//!
//! Exactly one root partition is *present* (currently booted) and one is
//! *future* (target of the next transaction); a third partition hosts the
//! bootloader configuration. Classification is driven by filesystem
//! labels from the configuration and by which device backs the live root.

use anyhow::{anyhow, bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::config::Config;
use crate::mount;
use abroot_blockdev as blockdev;

/// A partition of interest, identified by its stable UUID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub label: String,
    pub uuid: String,
    pub device: Utf8PathBuf,
}

/// One of the two root partitions, tagged with which A/B slot it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootPartition {
    pub partition: Partition,
    /// The configured label that matched, e.g. `vos-a`.
    pub identified_as: String,
}

/// The resolved layout: the booted root, the other root, and the
/// partition hosting the bootloader configuration.
#[derive(Debug, Clone)]
pub struct PartitionRoles {
    pub present: RootPartition,
    pub future: RootPartition,
    pub boot: Partition,
}

impl PartitionRoles {
    /// Inspect the system's block devices and classify the layout.
    #[context("Resolving partition roles")]
    pub fn resolve(config: &Config) -> Result<Self> {
        let devices = blockdev::list_all()?;
        let booted = mount::inspect_filesystem(Utf8Path::new("/"))
            .context("inspecting the booted root")?;
        classify(&devices, &booted.source, booted.uuid.as_deref(), config)
    }
}

fn to_partition(dev: &blockdev::Device, label: &str) -> Result<Partition> {
    let uuid = dev
        .uuid
        .clone()
        .ok_or_else(|| anyhow!("partition labeled {label} has no filesystem UUID"))?;
    Ok(Partition {
        label: label.to_string(),
        uuid,
        device: dev.path().into(),
    })
}

fn find_labeled<'d>(
    partitions: &[&'d blockdev::Device],
    label: &str,
) -> Result<&'d blockdev::Device> {
    let mut matches = partitions
        .iter()
        .filter(|d| d.label.as_deref() == Some(label));
    let found = matches
        .next()
        .ok_or_else(|| anyhow!("no partition labeled {label}"))?;
    if matches.next().is_some() {
        bail!("multiple partitions labeled {label}");
    }
    Ok(found)
}

/// Whether `partition` backs the currently booted root, per the findmnt
/// view of `/`: matched by source device, or by filesystem UUID when the
/// source is indirect.
fn is_booted(partition: &Partition, booted_source: &str, booted_uuid: Option<&str>) -> bool {
    partition.device == booted_source || booted_uuid == Some(partition.uuid.as_str())
}

/// Classify a device listing into partition roles. Pure; all host state
/// comes in through the arguments.
fn classify(
    devices: &[blockdev::Device],
    booted_source: &str,
    booted_uuid: Option<&str>,
    config: &Config,
) -> Result<PartitionRoles> {
    let parts = blockdev::partitions(devices);

    let a = to_partition(find_labeled(&parts, &config.part_label_a)?, &config.part_label_a)?;
    let b = to_partition(find_labeled(&parts, &config.part_label_b)?, &config.part_label_b)?;
    let boot = to_partition(
        find_labeled(&parts, &config.part_label_boot)?,
        &config.part_label_boot,
    )?;

    let a_booted = is_booted(&a, booted_source, booted_uuid);
    let b_booted = is_booted(&b, booted_source, booted_uuid);
    let (present, future) = match (a_booted, b_booted) {
        (true, false) => (a, b),
        (false, true) => (b, a),
        (true, true) => bail!("both root partitions appear to be booted"),
        (false, false) => bail!(
            "neither root partition matches the booted root (source {booted_source})"
        ),
    };

    Ok(PartitionRoles {
        present: RootPartition {
            identified_as: present.label.clone(),
            partition: present,
        },
        future: RootPartition {
            identified_as: future.label.clone(),
            partition: future,
        },
        boot,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(name: &str, label: Option<&str>, uuid: Option<&str>) -> blockdev::Device {
        blockdev::Device {
            name: name.to_string(),
            devtype: Some("part".to_string()),
            children: None,
            label: label.map(Into::into),
            uuid: uuid.map(Into::into),
            fstype: Some("ext4".to_string()),
            mountpoint: None,
            path: Some(format!("/dev/{name}")),
        }
    }

    fn disk(children: Vec<blockdev::Device>) -> blockdev::Device {
        blockdev::Device {
            name: "vda".to_string(),
            devtype: Some("disk".to_string()),
            children: Some(children),
            label: None,
            uuid: None,
            fstype: None,
            mountpoint: None,
            path: Some("/dev/vda".to_string()),
        }
    }

    fn fixture() -> Vec<blockdev::Device> {
        vec![disk(vec![
            dev("vda1", Some("vos-boot"), Some("77ef-9fc1")),
            dev("vda2", Some("vos-a"), Some("aaaa-1111")),
            dev("vda3", Some("vos-b"), Some("bbbb-2222")),
        ])]
    }

    #[test]
    fn test_classify_by_source() {
        let roles = classify(&fixture(), "/dev/vda2", None, &Config::default()).unwrap();
        assert_eq!(roles.present.identified_as, "vos-a");
        assert_eq!(roles.future.identified_as, "vos-b");
        assert_eq!(roles.future.partition.device, "/dev/vda3");
        assert_eq!(roles.boot.uuid, "77ef-9fc1");
    }

    #[test]
    fn test_classify_by_booted_uuid() {
        // The findmnt source is indirect; its UUID identifies the slot.
        let roles = classify(
            &fixture(),
            "/dev/mapper/root",
            Some("bbbb-2222"),
            &Config::default(),
        )
        .unwrap();
        assert_eq!(roles.present.identified_as, "vos-b");
        assert_eq!(roles.future.identified_as, "vos-a");
    }

    #[test]
    fn test_classify_missing_root_partition() {
        let devices = vec![disk(vec![
            dev("vda1", Some("vos-boot"), Some("77ef-9fc1")),
            dev("vda2", Some("vos-a"), Some("aaaa-1111")),
        ])];
        let e = classify(&devices, "/dev/vda2", None, &Config::default()).unwrap_err();
        assert!(format!("{e:#}").contains("vos-b"), "{e:#}");
    }

    #[test]
    fn test_classify_no_booted_match() {
        let e = classify(&fixture(), "overlay", None, &Config::default()).unwrap_err();
        assert!(format!("{e:#}").contains("neither root partition"), "{e:#}");
    }

    #[test]
    fn test_classify_missing_uuid() {
        let devices = vec![disk(vec![
            dev("vda1", Some("vos-boot"), Some("77ef-9fc1")),
            dev("vda2", Some("vos-a"), None),
            dev("vda3", Some("vos-b"), Some("bbbb-2222")),
        ])];
        let e = classify(&devices, "/dev/vda2", None, &Config::default()).unwrap_err();
        assert!(format!("{e:#}").contains("no filesystem UUID"), "{e:#}");
    }
}

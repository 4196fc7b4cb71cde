//! GRUB recipe generation for the staged root.
//!
//! The recipe is a `/etc/grub.d` drop-in declaring one menu entry for the
//! root it lives in. `grub-mkconfig` (run in a chroot over that root)
//! folds it into the real `grub.cfg`.

use std::cmp::Ordering;
use std::os::unix::fs::PermissionsExt;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

#[derive(Debug, thiserror::Error)]
pub(crate) enum BootloaderError {
    #[error("no kernel image matching boot/vmlinuz-* under {0}")]
    NoKernel(Utf8PathBuf),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

const KERNEL_PREFIX: &str = "vmlinuz-";

/// One run of a version string: either a number or a literal chunk.
#[derive(Debug, PartialEq, Eq)]
enum VersionSegment<'a> {
    Number(u64),
    Text(&'a str),
}

fn version_segments(s: &str) -> Vec<VersionSegment<'_>> {
    let mut out = Vec::new();
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        let split = if digits > 0 {
            digits
        } else {
            rest.chars()
                .take_while(|c| !c.is_ascii_digit())
                .map(|c| c.len_utf8())
                .sum()
        };
        let (chunk, tail) = rest.split_at(split);
        out.push(if digits > 0 {
            // Absurdly long digit runs fall back to literal comparison.
            chunk
                .parse::<u64>()
                .map(VersionSegment::Number)
                .unwrap_or(VersionSegment::Text(chunk))
        } else {
            VersionSegment::Text(chunk)
        });
        rest = tail;
    }
    out
}

/// Compare kernel version strings with numeric components ordered as
/// numbers, so that `6.10` sorts after `6.9`.
fn compare_versions(a: &str, b: &str) -> Ordering {
    let (a, b) = (version_segments(a), version_segments(b));
    let mut a = a.into_iter();
    let mut b = b.into_iter();
    loop {
        match (a.next(), b.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x, y) {
                    (VersionSegment::Number(n), VersionSegment::Number(m)) => n.cmp(&m),
                    (VersionSegment::Text(s), VersionSegment::Text(t)) => s.cmp(t),
                    // A numeric component sorts after a literal one.
                    (VersionSegment::Number(_), VersionSegment::Text(_)) => Ordering::Greater,
                    (VersionSegment::Text(_), VersionSegment::Number(_)) => Ordering::Less,
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// The newest kernel version installed under `root`, from the
/// `boot/vmlinuz-<version>` naming convention.
fn newest_kernel_version(root: &Utf8Path) -> Result<String, BootloaderError> {
    let boot = root.join("boot");
    let entries = std::fs::read_dir(&boot)
        .with_context(|| format!("reading {boot}"))
        .map_err(BootloaderError::Other)?;
    let mut newest: Option<String> = None;
    for entry in entries {
        let entry = entry.with_context(|| format!("reading {boot}"))?;
        let name = entry.file_name();
        let Some(version) = name
            .to_str()
            .and_then(|n| n.strip_prefix(KERNEL_PREFIX))
        else {
            continue;
        };
        match &newest {
            Some(cur) if compare_versions(version, cur) != Ordering::Greater => {}
            _ => newest = Some(version.to_string()),
        }
    }
    newest.ok_or(BootloaderError::NoKernel(root.to_owned()))
}

fn render_recipe(entry_name: &str, root_uuid: &str, kernel_version: &str) -> String {
    format!(
        r#"#!/bin/sh
exec tail -n +3 $0
# Boot entry for the freshly staged root. Generated; do not edit.

set menu_color_normal=white/black
set menu_color_highlight=black/light-gray

menuentry '{entry_name}' --class gnu-linux --class gnu --class os {{
	recordfail
	load_video
	insmod gzio
	insmod part_gpt
	insmod ext2
	search --no-floppy --fs-uuid --set=root {root_uuid}
	linux   /.system/boot/vmlinuz-{kernel_version} root=UUID={root_uuid} quiet splash bgrt_disable $vt_handoff
	initrd  /.system/boot/initrd.img-{kernel_version}
}}
"#
    )
}

/// Write the boot menu recipe for the root tree at `root`, describing the
/// partition `root_uuid` under the menu title `entry_name`. The kernel
/// version is detected from the tree.
pub(crate) fn generate_grub_recipe(
    root: &Utf8Path,
    root_uuid: &str,
    entry_name: &str,
) -> Result<(), BootloaderError> {
    tracing::debug!("generating grub recipe under {root} for {entry_name}");
    let kernel_version = newest_kernel_version(root)?;

    let grub_dir = root.join("etc/grub.d");
    std::fs::create_dir_all(&grub_dir).with_context(|| format!("creating {grub_dir}"))?;
    let recipe_path = grub_dir.join("10_abroot");
    std::fs::write(&recipe_path, render_recipe(entry_name, root_uuid, &kernel_version))
        .with_context(|| format!("writing {recipe_path}"))?;
    std::fs::set_permissions(&recipe_path, std::fs::Permissions::from_mode(0o644))
        .with_context(|| format!("setting mode on {recipe_path}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root_with_kernels(kernels: &[&str]) -> (tempfile::TempDir, Utf8PathBuf) {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(td.path().to_path_buf()).unwrap();
        std::fs::create_dir_all(root.join("boot")).unwrap();
        for k in kernels {
            std::fs::write(root.join("boot").join(format!("vmlinuz-{k}")), "").unwrap();
        }
        (td, root)
    }

    #[test]
    fn test_version_ordering() {
        assert_eq!(compare_versions("6.9", "6.10"), Ordering::Less);
        assert_eq!(compare_versions("6.10", "6.9"), Ordering::Greater);
        assert_eq!(compare_versions("6.5.0-1", "6.5.0-1"), Ordering::Equal);
        assert_eq!(compare_versions("6.5.0-2", "6.5.0-10"), Ordering::Less);
        assert_eq!(compare_versions("6.5.0", "6.5.0-1"), Ordering::Less);
        assert_eq!(
            compare_versions("6.5.0-1-generic", "6.5.0-1"),
            Ordering::Greater
        );
    }

    #[test]
    fn test_newest_kernel_numeric() {
        let (_td, root) = root_with_kernels(&["6.9.2", "6.10.0", "6.2.1"]);
        assert_eq!(newest_kernel_version(&root).unwrap(), "6.10.0");
    }

    #[test]
    fn test_no_kernel() {
        let (_td, root) = root_with_kernels(&[]);
        // An initrd alone does not count.
        std::fs::write(root.join("boot/initrd.img-6.5.0-1"), "").unwrap();
        let e = newest_kernel_version(&root).unwrap_err();
        assert!(matches!(e, BootloaderError::NoKernel(_)), "{e}");
    }

    #[test]
    fn test_recipe_is_deterministic() {
        let (_td, root) = root_with_kernels(&["6.5.0-1"]);
        generate_grub_recipe(&root, "abc-123", "Foo").unwrap();
        let recipe = std::fs::read_to_string(root.join("etc/grub.d/10_abroot")).unwrap();
        let expected = r#"#!/bin/sh
exec tail -n +3 $0
# Boot entry for the freshly staged root. Generated; do not edit.

set menu_color_normal=white/black
set menu_color_highlight=black/light-gray

menuentry 'Foo' --class gnu-linux --class gnu --class os {
	recordfail
	load_video
	insmod gzio
	insmod part_gpt
	insmod ext2
	search --no-floppy --fs-uuid --set=root abc-123
	linux   /.system/boot/vmlinuz-6.5.0-1 root=UUID=abc-123 quiet splash bgrt_disable $vt_handoff
	initrd  /.system/boot/initrd.img-6.5.0-1
}
"#;
        assert_eq!(recipe, expected);
    }

    #[test]
    fn test_recipe_mode_and_header() {
        let (_td, root) = root_with_kernels(&["6.5.0-1"]);
        generate_grub_recipe(&root, "abc-123", "Foo").unwrap();
        let path = root.join("etc/grub.d/10_abroot");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o644);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("#!/bin/sh\n"));
    }

    #[test]
    fn test_creates_grub_dir() {
        let (_td, root) = root_with_kernels(&["6.5.0-1"]);
        assert!(!root.join("etc").exists());
        generate_grub_recipe(&root, "abc-123", "Foo").unwrap();
        assert!(root.join("etc/grub.d/10_abroot").exists());
    }
}

//! Merging the mutable /etc overlay into a staged system tree.
//!
//! Account databases accumulate local changes (new users, password
//! updates) that a freshly extracted image does not know about. The
//! overlay under `/var/lib/abroot/etc/` is the user-writable source of
//! truth for those files; after every rootfs commit its contents are
//! folded into the staged `/etc`.

use std::collections::{HashMap, HashSet};
use std::io::Write;

use anyhow::{anyhow, Context, Result};
use camino::Utf8Path;
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;

/// The user-writable overlay holding locally modified account databases.
pub(crate) const ETC_OVERLAY_DIR: &str = "/var/lib/abroot/etc";

/// Files merged from the overlay, keyed on their first `:` field.
const MERGE_FILES: &[&str] = &["passwd", "group", "shells", "shadow", "subuid", "subgid"];

/// The record key of an account-database line. Files without `:` fields
/// (`shells`) degenerate to whole-line identity.
fn merge_key(line: &str) -> &str {
    line.split(':').next().unwrap_or(line)
}

/// Merge overlay content into destination content, line-oriented:
/// destination lines whose key also appears in the overlay are replaced
/// by the overlay's line, other destination lines are preserved, and
/// overlay lines with no destination counterpart are appended in overlay
/// order. Idempotent for unchanged inputs.
fn merge_lines(dest: &str, overlay: &str) -> String {
    let mut overlay_by_key: HashMap<&str, &str> = HashMap::new();
    let mut overlay_order: Vec<&str> = Vec::new();
    for line in overlay.lines() {
        let key = merge_key(line);
        // First occurrence wins; account databases do not repeat keys.
        if !overlay_by_key.contains_key(key) {
            overlay_by_key.insert(key, line);
            overlay_order.push(key);
        }
    }

    let mut out: Vec<&str> = Vec::new();
    let mut consumed: HashSet<&str> = HashSet::new();
    for line in dest.lines() {
        let key = merge_key(line);
        match overlay_by_key.get(key) {
            Some(replacement) => {
                out.push(replacement);
                consumed.insert(key);
            }
            None => out.push(line),
        }
    }
    for key in overlay_order {
        if !consumed.contains(key) {
            out.push(overlay_by_key[key]);
        }
    }

    if out.is_empty() {
        String::new()
    } else {
        let mut s = out.join("\n");
        s.push('\n');
        s
    }
}

#[context("Merging {} into {}", overlay_file, dest_file)]
fn merge_file(overlay_file: &Utf8Path, dest_file: &Utf8Path) -> Result<()> {
    let overlay = match std::fs::read_to_string(overlay_file) {
        Ok(s) => s,
        // Nothing locally modified for this database.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("reading {overlay_file}")),
    };
    let dest = match std::fs::read_to_string(dest_file) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e).with_context(|| format!("reading {dest_file}")),
    };

    let merged = merge_lines(&dest, &overlay);
    if merged == dest {
        tracing::trace!("{dest_file} already up to date");
        return Ok(());
    }

    let dest_dir = dest_file
        .parent()
        .ok_or_else(|| anyhow!("{dest_file} has no parent directory"))?;
    let name = dest_file
        .file_name()
        .ok_or_else(|| anyhow!("{dest_file} has no file name"))?;
    let dir = Dir::open_ambient_dir(dest_dir, cap_std::ambient_authority())
        .with_context(|| format!("opening {dest_dir}"))?;
    dir.atomic_replace_with(name, |w| -> Result<()> {
        w.write_all(merged.as_bytes())?;
        Ok(())
    })?;
    Ok(())
}

/// Apply the overlay under `overlay_dir` to the staged `system_etc`.
pub(crate) fn sync_etc_from(overlay_dir: &Utf8Path, system_etc: &Utf8Path) -> Result<()> {
    for file in MERGE_FILES {
        merge_file(&overlay_dir.join(file), &system_etc.join(file))?;
    }
    Ok(())
}

/// Apply the host overlay (`/var/lib/abroot/etc`) to the staged
/// `system_etc`.
#[context("Syncing /etc overlay into {}", system_etc)]
pub(crate) fn sync_etc(system_etc: &Utf8Path) -> Result<()> {
    sync_etc_from(Utf8Path::new(ETC_OVERLAY_DIR), system_etc)
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;

    #[test]
    fn test_merge_modifications_and_additions() {
        let dest = "root:x:0:0:root:/root:/bin/bash\ndaemon:x:1:1::/usr/sbin:/sbin/nologin\n";
        let overlay = "daemon:x:1:1::/usr/sbin:/bin/false\nalice:x:1000:1000::/home/alice:/bin/zsh\n";
        let merged = merge_lines(dest, overlay);
        assert_eq!(
            merged,
            "root:x:0:0:root:/root:/bin/bash\n\
             daemon:x:1:1::/usr/sbin:/bin/false\n\
             alice:x:1000:1000::/home/alice:/bin/zsh\n"
        );
    }

    #[test]
    fn test_merge_preserves_untouched_destination() {
        let dest = "a:1\nb:2\nc:3\n";
        let merged = merge_lines(dest, "b:20\n");
        assert_eq!(merged, "a:1\nb:20\nc:3\n");
    }

    #[test]
    fn test_merge_idempotent() {
        let dest = "a:1\nb:2\n";
        let overlay = "b:20\nd:4\n";
        let once = merge_lines(dest, overlay);
        let twice = merge_lines(&once, overlay);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_merge_whole_line_for_shells() {
        let dest = "/bin/sh\n/bin/bash\n";
        let merged = merge_lines(dest, "/bin/zsh\n");
        assert_eq!(merged, "/bin/sh\n/bin/bash\n/bin/zsh\n");
    }

    #[test]
    fn test_merge_empty_inputs() {
        assert_eq!(merge_lines("", ""), "");
        assert_eq!(merge_lines("a:1\n", ""), "a:1\n");
        assert_eq!(merge_lines("", "a:1\n"), "a:1\n");
    }

    fn tempdirs() -> (tempfile::TempDir, Utf8PathBuf, Utf8PathBuf) {
        let td = tempfile::tempdir().unwrap();
        let base = Utf8PathBuf::from_path_buf(td.path().to_path_buf()).unwrap();
        let overlay = base.join("overlay");
        let etc = base.join("etc");
        std::fs::create_dir_all(&overlay).unwrap();
        std::fs::create_dir_all(&etc).unwrap();
        (td, overlay, etc)
    }

    #[test]
    fn test_sync_merges_known_files_only() {
        let (_td, overlay, etc) = tempdirs();
        std::fs::write(overlay.join("passwd"), "alice:x:1000:\n").unwrap();
        std::fs::write(overlay.join("unrelated"), "ignored\n").unwrap();
        std::fs::write(etc.join("passwd"), "root:x:0:\n").unwrap();
        sync_etc_from(&overlay, &etc).unwrap();
        assert_eq!(
            std::fs::read_to_string(etc.join("passwd")).unwrap(),
            "root:x:0:\nalice:x:1000:\n"
        );
        assert!(!etc.join("unrelated").exists());
    }

    #[test]
    fn test_sync_missing_overlay_files_skipped() {
        let (_td, overlay, etc) = tempdirs();
        std::fs::write(etc.join("group"), "wheel:x:10:\n").unwrap();
        sync_etc_from(&overlay, &etc).unwrap();
        assert_eq!(
            std::fs::read_to_string(etc.join("group")).unwrap(),
            "wheel:x:10:\n"
        );
    }

    #[test]
    fn test_sync_creates_missing_destination() {
        let (_td, overlay, etc) = tempdirs();
        std::fs::write(overlay.join("subuid"), "alice:100000:65536\n").unwrap();
        sync_etc_from(&overlay, &etc).unwrap();
        assert_eq!(
            std::fs::read_to_string(etc.join("subuid")).unwrap(),
            "alice:100000:65536\n"
        );
    }
}

//! The upgrade transaction.
//!
//! Ten ordered stages take the future partition from "stale previous
//! root" to "fully staged next root", with exactly three user-visible
//! mutations, all of them kernel-level exchange renames: the rootfs
//! directory, the image descriptor, and finally the bootloader
//! configuration. Everything before the first exchange is free to fail;
//! the cleanup queue releases whatever was acquired, and the present
//! partition is never written to at all.

use std::os::unix::fs::DirBuilderExt;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use uuid::Uuid;

use crate::chroot::{ChrootError, ChrootSession};
use crate::cleanup::{CleanupEntry, CleanupQueue};
use crate::config::Config;
use crate::etcmerge;
use crate::grub::{self, BootloaderError};
use crate::imagedesc::{descriptor_filename, ImageDescriptor};
use crate::mount::{MountError, PartitionMount};
use crate::partitions::PartitionRoles;
use crate::pkgmanager::PackageManager;
use crate::podman::{BuildRecipe, ImageBackend, Podman};
use crate::swap::{atomic_swap, SwapError};

/// Stable scratch path the future partition is mounted at.
pub const PART_FUTURE_MOUNT: &str = "/part-future";

/// Directory holding the actual root tree on each root partition.
pub const SYSTEM_DIR: &str = ".system";
/// Staging sibling of [`SYSTEM_DIR`]; exchanged into place on commit.
pub const SYSTEM_NEW_DIR: &str = ".system.new";

/// Live bootloader configuration on the boot partition.
const GRUB_CFG: &str = "grub.cfg";
/// Staged bootloader configuration; exchanged into place on commit.
const GRUB_CFG_FUTURE: &str = "grub.cfg.future";

fn format_drain_errors(errors: &[anyhow::Error]) -> String {
    errors
        .iter()
        .map(|e| format!("{e:#}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Everything an upgrade transaction can fail with. Each stage fails
/// with exactly one of these kinds.
#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error("no update available")]
    NoUpdate,
    #[error("resolving partition layout: {0:#}")]
    Topology(anyhow::Error),
    #[error("mount failure: {0}")]
    Mount(#[from] MountError),
    #[error("pulling image: {0:#}")]
    ImagePull(anyhow::Error),
    #[error("building rootfs: {0:#}")]
    RootfsBuild(anyhow::Error),
    #[error("writing image descriptor: {0:#}")]
    DescriptorWrite(anyhow::Error),
    #[error("atomic exchange failed: {0}")]
    Swap(#[from] SwapError),
    #[error(
        "rootfs committed but descriptor exchange failed: {mount_point}/abimage.abr still \
         describes the previous image while {mount_point}/{SYSTEM_DIR} already holds \
         the new root: {source}"
    )]
    DescriptorMismatch {
        mount_point: Utf8PathBuf,
        source: SwapError,
    },
    #[error("chroot session: {0}")]
    Chroot(ChrootError),
    #[error("{0}")]
    CommandFailed(ChrootError),
    #[error("no kernel image found under {0}")]
    NoKernel(Utf8PathBuf),
    #[error("generating bootloader recipe: {0:#}")]
    Bootloader(anyhow::Error),
    #[error("merging /etc: {0:#}")]
    EtcMerge(anyhow::Error),
    #[error("cleanup failed after successful upgrade: {}", format_drain_errors(.0))]
    Cleanup(Vec<anyhow::Error>),
}

impl From<BootloaderError> for UpgradeError {
    fn from(e: BootloaderError) -> Self {
        match e {
            BootloaderError::NoKernel(root) => UpgradeError::NoKernel(root),
            BootloaderError::Other(e) => UpgradeError::Bootloader(e),
        }
    }
}

/// Commit the staged rootfs and descriptor on the future partition: two
/// ordered exchanges, rootfs first. If the rootfs exchange lands but the
/// descriptor exchange does not, the partition is left half-updated (new
/// root, old descriptor) and that state is reported explicitly; no
/// rollback is attempted.
pub(crate) fn commit_future(mount_point: &Utf8Path) -> Result<(), UpgradeError> {
    atomic_swap(
        &mount_point.join(SYSTEM_DIR),
        &mount_point.join(SYSTEM_NEW_DIR),
    )?;
    atomic_swap(
        &mount_point.join(descriptor_filename("")),
        &mount_point.join(descriptor_filename("new")),
    )
    .map_err(|source| UpgradeError::DescriptorMismatch {
        mount_point: mount_point.to_owned(),
        source,
    })
}

/// The transacting system: configuration, the image backend, and the
/// descriptor of the booted root.
pub struct AbSystem<B: ImageBackend = Podman> {
    config: Config,
    backend: B,
    current: ImageDescriptor,
}

impl AbSystem<Podman> {
    /// Construct from the live system: host configuration plus the
    /// descriptor of the booted root.
    pub fn new() -> Result<Self> {
        let config = Config::load()?;
        let current = ImageDescriptor::from_root(Utf8Path::new("/"))?;
        Ok(Self {
            config,
            backend: Podman,
            current,
        })
    }
}

impl<B: ImageBackend> AbSystem<B> {
    /// The descriptor of the booted root.
    pub fn current(&self) -> &ImageDescriptor {
        &self.current
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Ask the registry whether a digest different from the booted
    /// root's is published. Returns the new digest if so. This is the
    /// only registry round trip; the transaction reuses its result.
    pub fn check_update(&self) -> Result<Option<String>, UpgradeError> {
        let image = self.config.full_image_name();
        let remote = self
            .backend
            .remote_digest(&image)
            .map_err(UpgradeError::ImagePull)?;
        if remote == self.current.digest {
            Ok(None)
        } else {
            Ok(Some(remote))
        }
    }

    /// Run the full upgrade transaction. On return, every resource
    /// acquired during staging has been released, whatever happened; the
    /// first stage error wins, and cleanup failures never mask it.
    pub fn upgrade(&mut self) -> Result<(), UpgradeError> {
        let mut queue = CleanupQueue::new();
        queue.reset();
        let result = self.run_stages(&mut queue);
        let drain_errors = queue.drain();
        for e in &drain_errors {
            tracing::warn!("cleanup: {e:#}");
        }
        match result {
            Ok(()) if drain_errors.is_empty() => Ok(()),
            Ok(()) => Err(UpgradeError::Cleanup(drain_errors)),
            // Drain errors were reported above; the stage error wins.
            Err(e) => Err(e),
        }
    }

    fn run_stages(&mut self, queue: &mut CleanupQueue) -> Result<(), UpgradeError> {
        // Stage 0: is there anything to do?
        tracing::info!("[stage 0] checking for updates");
        let Some(new_digest) = self.check_update()? else {
            return Err(UpgradeError::NoUpdate);
        };
        tracing::info!("update available: {new_digest}");

        // Stage 1: resolve roles, mount the future partition.
        tracing::info!("[stage 1] mounting future partition");
        let roles = PartitionRoles::resolve(&self.config).map_err(UpgradeError::Topology)?;
        let future = roles.future;
        let boot = roles.boot;
        let future_mount = Utf8PathBuf::from(PART_FUTURE_MOUNT);
        let mount = PartitionMount::new(&future.partition.device, &future_mount)?;
        queue.push(CleanupEntry::UnmountPartition(mount));

        // Stage 2: pull the new base image.
        tracing::info!("[stage 2] pulling image");
        let image = self.config.full_image_name();
        let pulled = self
            .backend
            .pull(&image)
            .map_err(UpgradeError::ImagePull)?;

        // Stage 3: compose the user's package operations on top.
        tracing::info!("[stage 3] composing image recipe");
        let final_cmd = PackageManager::new()
            .final_command()
            .map_err(UpgradeError::RootfsBuild)?;
        let recipe = BuildRecipe::new(&image, &final_cmd);

        // Stage 4: materialise the rootfs alongside the live one.
        tracing::info!("[stage 4] generating rootfs");
        self.backend
            .generate_rootfs(
                &image,
                &recipe,
                &future_mount,
                &future_mount.join(SYSTEM_NEW_DIR),
            )
            .map_err(UpgradeError::RootfsBuild)?;

        // Stage 5: stage the new descriptor next to it.
        tracing::info!("[stage 5] writing image descriptor");
        ImageDescriptor::new(pulled.digest, image)
            .write_to(&future_mount, "new")
            .map_err(UpgradeError::DescriptorWrite)?;

        // Stage 6: commit rootfs and descriptor.
        tracing::info!("[stage 6] committing rootfs and descriptor");
        commit_future(&future_mount)?;

        // Stage 7: regenerate the bootloader configuration of the new
        // root, from inside it.
        tracing::info!("[stage 7] updating bootloader recipe");
        let system = future_mount.join(SYSTEM_DIR);
        grub::generate_grub_recipe(&system, &future.partition.uuid, &future.identified_as)?;
        let mut session =
            ChrootSession::open(&system, &future.partition.uuid, &future.partition.device)
                .map_err(UpgradeError::Chroot)?;
        let exec_result = session.execute_all(["grub-mkconfig -o /boot/grub/grub.cfg", "exit"]);
        // The session is queued before the result is inspected so a
        // failed command still gets its binds released.
        queue.push(CleanupEntry::CloseChroot(session));
        exec_result.map_err(|e| match e {
            e @ ChrootError::CommandFailed { .. } => UpgradeError::CommandFailed(e),
            other => UpgradeError::Chroot(other),
        })?;

        // Stage 8: fold local /etc state into the new root.
        tracing::info!("[stage 8] merging /etc overlay");
        etcmerge::sync_etc(&system.join("etc")).map_err(UpgradeError::EtcMerge)?;

        // Stage 9: mount the boot partition at a fresh transient path.
        tracing::info!("[stage 9] mounting boot partition");
        let boot_mount =
            Utf8PathBuf::from(format!("{}/{}", std::env::temp_dir().display(), Uuid::new_v4()));
        std::fs::DirBuilder::new()
            .mode(0o755)
            .create(&boot_mount)
            .map_err(|e| {
                UpgradeError::Mount(MountError::Io(anyhow::Error::new(e).context(format!(
                    "creating transient mount point {boot_mount}"
                ))))
            })?;
        let boot_partition_mount = PartitionMount::new(&boot.device, &boot_mount)?;
        queue.push(CleanupEntry::UnmountPartition(boot_partition_mount));

        // Stage 10: the visible commit. After this exchange the next
        // boot selects the new root.
        tracing::info!("[stage 10] committing bootloader configuration");
        atomic_swap(&boot_mount.join(GRUB_CFG), &boot_mount.join(GRUB_CFG_FUTURE))?;

        tracing::info!("upgrade staged; the roots swap on next boot");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockBackend {
        remote: String,
    }

    impl ImageBackend for MockBackend {
        fn remote_digest(&self, _image: &str) -> Result<String> {
            Ok(self.remote.clone())
        }
        fn pull(&self, _image: &str) -> Result<crate::podman::PulledImage> {
            anyhow::bail!("pull not expected in this test")
        }
        fn generate_rootfs(
            &self,
            _image: &str,
            _recipe: &BuildRecipe,
            _work_dir: &Utf8Path,
            _out_dir: &Utf8Path,
        ) -> Result<()> {
            anyhow::bail!("generate_rootfs not expected in this test")
        }
    }

    fn system(current_digest: &str, remote_digest: &str) -> AbSystem<MockBackend> {
        AbSystem {
            config: Config::default(),
            backend: MockBackend {
                remote: remote_digest.to_string(),
            },
            current: ImageDescriptor::new(
                current_digest.to_string(),
                "ghcr.io/vanilla-os/desktop:main".to_string(),
            ),
        }
    }

    #[test]
    fn test_check_update_no_change() {
        let s = system("sha256:a", "sha256:a");
        assert_eq!(s.check_update().unwrap(), None);
    }

    #[test]
    fn test_check_update_new_digest() {
        let s = system("sha256:a", "sha256:b");
        assert_eq!(s.check_update().unwrap().as_deref(), Some("sha256:b"));
    }

    fn future_partition_fixture() -> (tempfile::TempDir, Utf8PathBuf) {
        let td = tempfile::tempdir().unwrap();
        let mount = Utf8PathBuf::from_path_buf(td.path().to_path_buf()).unwrap();
        std::fs::create_dir(mount.join(SYSTEM_DIR)).unwrap();
        std::fs::create_dir(mount.join(SYSTEM_NEW_DIR)).unwrap();
        std::fs::write(mount.join(SYSTEM_DIR).join("marker"), "old").unwrap();
        std::fs::write(mount.join(SYSTEM_NEW_DIR).join("marker"), "new").unwrap();
        std::fs::write(mount.join("abimage.abr"), r#"{"old": true}"#).unwrap();
        (td, mount)
    }

    #[test]
    fn test_commit_future() {
        let (_td, mount) = future_partition_fixture();
        std::fs::write(mount.join("abimage-new.abr"), r#"{"new": true}"#).unwrap();
        commit_future(&mount).unwrap();
        assert_eq!(
            std::fs::read_to_string(mount.join(SYSTEM_DIR).join("marker")).unwrap(),
            "new"
        );
        assert_eq!(
            std::fs::read_to_string(mount.join("abimage.abr")).unwrap(),
            r#"{"new": true}"#
        );
        // The previous root and descriptor survive under the staging names.
        assert_eq!(
            std::fs::read_to_string(mount.join(SYSTEM_NEW_DIR).join("marker")).unwrap(),
            "old"
        );
        assert_eq!(
            std::fs::read_to_string(mount.join("abimage-new.abr")).unwrap(),
            r#"{"old": true}"#
        );
    }

    #[test]
    fn test_commit_future_descriptor_mismatch() {
        // No staged descriptor: the second exchange must fail, the first
        // must stand.
        let (_td, mount) = future_partition_fixture();
        let e = commit_future(&mount).unwrap_err();
        assert!(matches!(e, UpgradeError::DescriptorMismatch { .. }), "{e}");
        let msg = format!("{e}");
        assert!(msg.contains("abimage.abr"), "{msg}");
        assert!(msg.contains("previous image"), "{msg}");
        // Rootfs is committed; descriptor still the old one.
        assert_eq!(
            std::fs::read_to_string(mount.join(SYSTEM_DIR).join("marker")).unwrap(),
            "new"
        );
        assert_eq!(
            std::fs::read_to_string(mount.join("abimage.abr")).unwrap(),
            r#"{"old": true}"#
        );
    }

    #[test]
    fn test_commit_future_ordering() {
        // If the rootfs exchange itself fails, nothing moves: the
        // descriptor exchange must not have been attempted.
        let td = tempfile::tempdir().unwrap();
        let mount = Utf8PathBuf::from_path_buf(td.path().to_path_buf()).unwrap();
        std::fs::create_dir(mount.join(SYSTEM_DIR)).unwrap();
        std::fs::write(mount.join("abimage.abr"), "old").unwrap();
        std::fs::write(mount.join("abimage-new.abr"), "new").unwrap();
        let e = commit_future(&mount).unwrap_err();
        assert!(matches!(e, UpgradeError::Swap(SwapError::NotFound { .. })), "{e}");
        assert_eq!(std::fs::read_to_string(mount.join("abimage.abr")).unwrap(), "old");
    }
}

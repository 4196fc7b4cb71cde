//! The image backend.
//!
//! Everything registry- and OCI-shaped goes through here: digest checks,
//! pulls, and materialising a composed image as a plain root tree. The
//! transaction driver only sees the [`ImageBackend`] trait; `podman` (and
//! `skopeo` for remote inspection) are implementation detail.

use std::process::Command;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

use abroot_utils::CommandRunExt;

/// Name under which the composed transaction image is built locally.
const TRANSACTION_IMAGE: &str = "localhost/abroot-transaction:latest";
/// Name of the scratch container the rootfs is exported from.
const TRANSACTION_CONTAINER: &str = "abroot-transaction";

/// Result of pulling an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulledImage {
    /// Content digest of the pulled image, e.g. `sha256:…`.
    pub digest: String,
}

/// A Containerfile layering the user's package operations on top of a
/// base image. Rendering is deterministic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRecipe {
    base: String,
    run: String,
}

impl BuildRecipe {
    /// Compose `final_cmd` on top of `base_image`; an empty command
    /// becomes the no-op `true`.
    pub fn new(base_image: &str, final_cmd: &str) -> Self {
        let run = if final_cmd.is_empty() {
            "true".to_string()
        } else {
            final_cmd.to_string()
        };
        Self {
            base: base_image.to_string(),
            run,
        }
    }

    pub fn render(&self) -> String {
        format!(
            "FROM {}\nLABEL maintainer='Generated by ABRoot'\nRUN {}\n",
            self.base, self.run
        )
    }
}

/// The contract the transaction driver holds the image machinery to.
pub trait ImageBackend {
    /// The digest currently published for `image`, without pulling it.
    fn remote_digest(&self, image: &str) -> Result<String>;

    /// Pull `image` and report its digest.
    fn pull(&self, image: &str) -> Result<PulledImage>;

    /// Materialise `recipe` (layered on the already pulled `image`) as a
    /// complete root tree at `out_dir`, using `work_dir` for scratch
    /// files. On success `out_dir` is a self-contained root filesystem.
    fn generate_rootfs(
        &self,
        image: &str,
        recipe: &BuildRecipe,
        work_dir: &Utf8Path,
        out_dir: &Utf8Path,
    ) -> Result<()>;
}

/// The production backend, shelling out to podman.
#[derive(Debug, Default)]
pub struct Podman;

impl ImageBackend for Podman {
    #[context("Querying registry digest for {image}")]
    fn remote_digest(&self, image: &str) -> Result<String> {
        let digest = Command::new("skopeo")
            .args(["inspect", "--no-tags", "--format", "{{.Digest}}"])
            .arg(format!("docker://{image}"))
            .log_debug()
            .run_get_string()?;
        Ok(digest.trim().to_string())
    }

    #[context("Pulling {image}")]
    fn pull(&self, image: &str) -> Result<PulledImage> {
        Command::new("podman").arg("pull").arg(image).log_debug().run()?;
        let digest = Command::new("podman")
            .args(["image", "inspect", "--format", "{{.Digest}}"])
            .arg(image)
            .log_debug()
            .run_get_string()?;
        Ok(PulledImage {
            digest: digest.trim().to_string(),
        })
    }

    #[context("Generating rootfs at {}", out_dir)]
    fn generate_rootfs(
        &self,
        _image: &str,
        recipe: &BuildRecipe,
        work_dir: &Utf8Path,
        out_dir: &Utf8Path,
    ) -> Result<()> {
        let containerfile = work_dir.join("Containerfile");
        std::fs::write(&containerfile, recipe.render())
            .with_context(|| format!("writing {containerfile}"))?;
        Command::new("podman")
            .args(["build", "-t", TRANSACTION_IMAGE, "-f"])
            .arg(&containerfile)
            .arg(work_dir)
            .log_debug()
            .run()?;

        // A leftover container from an interrupted transaction is stale.
        Command::new("podman")
            .args(["rm", "--force", "--ignore", TRANSACTION_CONTAINER])
            .log_debug()
            .run()?;
        Command::new("podman")
            .args(["create", "--name", TRANSACTION_CONTAINER, TRANSACTION_IMAGE])
            .log_debug()
            .run()?;

        if out_dir.try_exists()? {
            std::fs::remove_dir_all(out_dir)
                .with_context(|| format!("removing stale {out_dir}"))?;
        }
        std::fs::create_dir_all(out_dir).with_context(|| format!("creating {out_dir}"))?;

        let tarball = work_dir.join("rootfs.tar");
        let r = Command::new("podman")
            .args(["export", "-o"])
            .arg(&tarball)
            .arg(TRANSACTION_CONTAINER)
            .log_debug()
            .run()
            .and_then(|()| {
                Command::new("tar")
                    .arg("-xf")
                    .arg(&tarball)
                    .arg("-C")
                    .arg(out_dir)
                    .log_debug()
                    .run()
            });

        // Scratch state goes away regardless of how extraction fared.
        let _ = std::fs::remove_file(&tarball);
        let _ = Command::new("podman")
            .args(["rm", "--force", "--ignore", TRANSACTION_CONTAINER])
            .run();
        r
    }
}

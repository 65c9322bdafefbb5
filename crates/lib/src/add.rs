//! # Adding an image to an installed system
//!
//! The artifact is fetched (and its signature checked when remote), mounted
//! read-only and verified against its checksum manifest. Its embedded root
//! filesystem is mounted only long enough to read the version label and
//! the image tooling version, which must not be older than ours. The new
//! image is staged next to the existing ones on the persistent storage and
//! registered last.
//!
//! A registry entry is never rolled back: if refreshing the boot
//! configuration fails after the entry was added, the entry stays.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::checksum::verify_manifest;
use crate::cleanup::Teardown;
use crate::config::{self, Layout, CONFIG_FILE, CONFIG_MARKER};
use crate::error::ImageError;
use crate::host::Host;
use crate::image::{image_version, tools_version};
use crate::install::ask_image_name;
use crate::prompt::Operator;
use crate::registry::{with_refresh, BootRegistry};
use crate::sigverify::validate_download;
use crate::utils::{chgrp_tree, copy_into, copy_tree, create_config_dir, group_id, remove_path};

const MSG_INPUT_SET_DEFAULT: &str =
    "Would you like to set the new image as the default one for boot?";
const MSG_INPUT_COPY_CONFIG: &str =
    "An active configuration was found. Would you like to copy it to the new image?";

/// The root filesystem image inside an artifact.
const ARTIFACT_ROOTFS: &str = "live/filesystem.squashfs";
/// Directory of the artifact holding the kernel and initramfs.
const ARTIFACT_LIVE_DIR: &str = "live";
/// Prefixes of the files staged from [`ARTIFACT_LIVE_DIR`].
const KERNEL_FILE_PREFIXES: &[&str] = &["vmlinuz", "initrd"];

fn is_remote(location: &str) -> bool {
    let Some((scheme, _)) = location.split_once("://") else {
        return false;
    };
    !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "+-.".contains(c))
}

/// Make the artifact available locally, returning its path.
fn fetch_artifact(
    host: &impl Host,
    operator: &impl Operator,
    layout: &Layout,
    location: &str,
) -> Result<Utf8PathBuf> {
    if !is_remote(location) {
        let path = Utf8PathBuf::from(location);
        if !path.is_file() {
            tracing::debug!("{path} is not a regular file");
            return Err(ImageError::FetchFailed(location.to_owned()).into());
        }
        return Ok(path);
    }
    operator.step(&format!("Downloading {location}"))?;
    let dest = &layout.download_path;
    if let Err(e) = host.download(location, dest) {
        tracing::debug!("{e:#}");
        return Err(ImageError::FetchFailed(location.to_owned()).into());
    }
    validate_download(host, operator, &layout.minisign_keys, location, dest)?;
    Ok(dest.clone())
}

/// What the artifact says about itself.
#[derive(Debug)]
struct ArtifactInfo {
    version: String,
    tools_version: u32,
}

/// Mount the artifact at the ISO mountpoint, verify it and read its metadata.
///
/// The artifact stays mounted; its embedded root filesystem does not.
fn inspect_artifact<H: Host>(
    teardown: &mut Teardown<'_, H>,
    operator: &impl Operator,
    layout: &Layout,
    artifact: &Utf8Path,
) -> Result<ArtifactInfo> {
    let iso = layout.iso_mount();
    let root_src = layout.root_src();
    for dir in [&iso, &root_src] {
        std::fs::create_dir_all(dir).with_context(|| format!("Creating {dir}"))?;
        teardown.remove_later(dir);
    }
    teardown.mount(artifact, &iso, Some("iso9660"), true)?;

    operator.step("Validating image checksums")?;
    verify_manifest(&iso)?;

    teardown.mount(&iso.join(ARTIFACT_ROOTFS), &root_src, Some("squashfs"), true)?;
    let info = tools_version(&root_src).and_then(|tools_version| {
        Ok(ArtifactInfo {
            version: image_version(&root_src)?,
            tools_version,
        })
    });
    teardown.unmount(&root_src)?;
    info
}

/// Seed the configuration directory of the new image.
#[context("Preparing configuration of {name}")]
fn seed_configuration(
    operator: &impl Operator,
    layout: &Layout,
    storage_root: &Utf8Path,
    name: &str,
) -> Result<()> {
    let active = layout.active_config();
    let target = layout.image_config_dir(storage_root, name);
    let group = layout.config_group.as_deref();
    create_config_dir(&target, group)?;
    if active.join(CONFIG_FILE).is_file() && operator.confirm(MSG_INPUT_COPY_CONFIG, true)? {
        operator.step("Copying configuration directory")?;
        copy_tree(&active, &target)?;
        if let Some(group) = group {
            chgrp_tree(&target, group_id(group)?)?;
        }
        // The copy may have replaced the directory mode
        create_config_dir(&target, group)?;
    } else {
        std::fs::write(target.join(CONFIG_MARKER), "")
            .with_context(|| format!("Writing {CONFIG_MARKER}"))?;
    }
    Ok(())
}

/// Copy the kernel, initramfs and root filesystem image out of the artifact.
#[context("Copying system image files")]
fn stage_files(artifact_root: &Utf8Path, image_dir: &Utf8Path, name: &str) -> Result<()> {
    std::fs::create_dir_all(image_dir)?;
    for entry in artifact_root.join(ARTIFACT_LIVE_DIR).read_dir_utf8()? {
        let entry = entry?;
        let fname = entry.file_name();
        if KERNEL_FILE_PREFIXES.iter().any(|p| fname.starts_with(p)) && entry.path().is_file() {
            copy_into(entry.path(), image_dir)?;
        }
    }
    let rootfs = artifact_root.join(ARTIFACT_ROOTFS);
    std::fs::copy(&rootfs, image_dir.join(format!("{name}.squashfs")))
        .with_context(|| format!("Copying {rootfs}"))?;
    Ok(())
}

/// A staged image waiting to be registered.
#[derive(Debug)]
struct StagedImage<R> {
    registry: R,
    name: String,
    set_default: bool,
}

fn stage_image<H: Host, R: BootRegistry>(
    host: &H,
    operator: &impl Operator,
    layout: &Layout,
    location: &str,
    teardown: &mut Teardown<'_, H>,
    open_registry: impl FnOnce(&Utf8Path) -> Result<R>,
) -> Result<StagedImage<R>> {
    let artifact = fetch_artifact(host, operator, layout, location)?;
    let info = inspect_artifact(teardown, operator, layout, &artifact)?;
    if info.tools_version < layout.system_cfg_ver {
        return Err(ImageError::Downgrade {
            found: info.tools_version,
            installed: layout.system_cfg_ver,
        }
        .into());
    }

    let name = ask_image_name(operator, Some(info.version.as_str()))?;
    let set_default = operator.confirm(MSG_INPUT_SET_DEFAULT, true)?;

    let storage_root = host
        .find_persistence()?
        .ok_or(ImageError::PersistenceNotFound)?;
    let registry = open_registry(&storage_root)?;
    let image_dir = config::image_dir(&storage_root, &name);
    if registry.contains(&name)? || image_dir.try_exists()? {
        return Err(ImageError::NameCollision(name).into());
    }

    let staged = seed_configuration(operator, layout, &storage_root, &name).and_then(|()| {
        operator.step("Copying system image files")?;
        stage_files(&layout.iso_mount(), &image_dir, &name)
    });
    if let Err(e) = staged {
        if let Err(rm) = remove_path(&image_dir) {
            tracing::warn!("{rm:#}");
        }
        return Err(e);
    }
    Ok(StagedImage {
        registry,
        name,
        set_default,
    })
}

/// Add the image at `location` (a local file or a URL) to the installed system.
///
/// `open_registry` opens the boot registry below the persistent storage root.
pub fn add_image<H: Host, R: BootRegistry>(
    host: &H,
    operator: &impl Operator,
    layout: &Layout,
    location: &str,
    open_registry: impl FnOnce(&Utf8Path) -> Result<R>,
) -> Result<()> {
    if host.is_live_boot()? {
        return Err(ImageError::NotInstalledEnvironment.into());
    }

    let mut teardown = Teardown::new(host, layout);
    let StagedImage {
        mut registry,
        name,
        set_default,
    } = stage_image(host, operator, layout, location, &mut teardown, open_registry)?;
    operator.message("Cleaning up");
    teardown.finish()?;

    with_refresh(&mut registry, |r| {
        r.add(&name)?;
        if set_default {
            r.set_default(&name)?;
        }
        Ok(())
    })?;
    operator.message(&format!("The image \"{name}\" was added"));
    Ok(())
}

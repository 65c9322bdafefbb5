//! Lifecycle of installed images: delete, set default, rename and list.
//!
//! Every precondition is checked before the operator is asked to confirm
//! anything. Each mutation goes through [`with_refresh`].

use anyhow::{Context, Result};
use camino::Utf8Path;

use crate::config;
use crate::error::ImageError;
use crate::prompt::Operator;
use crate::registry::{validate_name, with_refresh, BootRegistry};
use crate::utils::remove_path;

/// Use `name`, or let the operator pick one of the installed images.
fn resolve_name(
    registry: &dyn BootRegistry,
    operator: &impl Operator,
    name: Option<&str>,
    title: &str,
    prompt: &str,
) -> Result<String> {
    if let Some(name) = name {
        return Ok(name.to_owned());
    }
    let names = registry.list()?;
    anyhow::ensure!(!names.is_empty(), "No images are installed");
    let i = operator.select(title, prompt, &names)?;
    names
        .into_iter()
        .nth(i)
        .ok_or_else(|| anyhow::anyhow!("Invalid selection {i}"))
}

fn ensure_known(registry: &dyn BootRegistry, name: &str) -> Result<()> {
    if !registry.contains(name)? {
        return Err(ImageError::UnknownImage(name.to_owned()).into());
    }
    Ok(())
}

/// Delete an image and its files below `storage_root`.
///
/// The running and the default image cannot be deleted.
pub fn delete_image<R: BootRegistry>(
    registry: &mut R,
    operator: &impl Operator,
    storage_root: &Utf8Path,
    name: Option<&str>,
) -> Result<()> {
    let name = resolve_name(
        registry,
        operator,
        name,
        "The following images are installed:",
        "Select an image to delete:",
    )?;
    if registry.running_image() == Some(name.as_str()) {
        return Err(ImageError::RunningImageProtected("deleted").into());
    }
    if registry.default_image()?.as_deref() == Some(name.as_str()) {
        return Err(ImageError::DefaultImageProtected.into());
    }
    ensure_known(registry, &name)?;
    if !operator.confirm(&format!("Do you really want to delete the image {name}?"), false)? {
        return Err(ImageError::Aborted.into());
    }

    let image_dir = config::image_dir(storage_root, &name);
    with_refresh(registry, |r| {
        remove_path(&image_dir)?;
        r.remove(&name)
    })?;
    operator.message(&format!("The image \"{name}\" was successfully deleted"));
    Ok(())
}

/// Make an image the default boot entry.
pub fn set_default_image<R: BootRegistry>(
    registry: &mut R,
    operator: &impl Operator,
    name: Option<&str>,
) -> Result<()> {
    let name = resolve_name(
        registry,
        operator,
        name,
        "The following images are available:",
        "Select an image to set as default:",
    )?;
    if registry.default_image()?.as_deref() == Some(name.as_str()) {
        return Err(ImageError::AlreadyDefault(name).into());
    }
    ensure_known(registry, &name)?;
    with_refresh(registry, |r| r.set_default(&name))?;
    operator.message(&format!("The image \"{name}\" is now default boot image"));
    Ok(())
}

/// Rename an image, moving its files below `storage_root`.
pub fn rename_image<R: BootRegistry>(
    registry: &mut R,
    operator: &impl Operator,
    storage_root: &Utf8Path,
    old: &str,
    new: &str,
) -> Result<()> {
    if registry.running_image() == Some(old) {
        return Err(ImageError::RunningImageProtected("renamed").into());
    }
    ensure_known(registry, old)?;
    if registry.contains(new)? {
        return Err(ImageError::NameCollision(new.to_owned()).into());
    }
    if !validate_name(new) {
        return Err(ImageError::NameValidation(new.to_owned()).into());
    }
    if !operator.confirm(
        &format!("Do you really want to rename the image {old} to the {new}?"),
        false,
    )? {
        return Err(ImageError::Aborted.into());
    }

    let was_default = registry.default_image()?.as_deref() == Some(old);
    let src = config::image_dir(storage_root, old);
    let dst = config::image_dir(storage_root, new);
    with_refresh(registry, |r| {
        std::fs::rename(&src, &dst).with_context(|| format!("Renaming {src} to {dst}"))?;
        let registered = r.rename(old, new).and_then(|()| {
            if was_default {
                r.set_default(new)?;
            }
            Ok(())
        });
        if let Err(e) = registered {
            // Put the entry and its files back under the old name
            if let Err(undo) = r.rename(new, old) {
                tracing::warn!("{undo:#}");
            }
            if let Err(undo) = std::fs::rename(&dst, &src) {
                tracing::warn!("Renaming {dst} back to {src}: {undo}");
            }
            return Err(e);
        }
        Ok(())
    })?;
    operator.message(&format!("The image \"{old}\" was renamed to \"{new}\""));
    Ok(())
}

/// All installed images in registry order.
pub fn list_images(registry: &impl BootRegistry) -> Result<Vec<String>> {
    registry.list()
}

//! Filesystem helpers for staging images and writing boot configuration.

use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::{Dir, DirBuilder, DirBuilderExt as _, Permissions};
use cap_std_ext::prelude::CapStdExtDirExt;
use fn_error_context::context;

/// Mode of seeded configuration directories: group writable and setgid.
pub(crate) const CONFIG_DIR_MODE: u32 = 0o2775;

/// Open the parent of `path`, returning it with the final component.
fn open_parent(path: &Utf8Path) -> std::io::Result<(Dir, &str)> {
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        return Err(std::io::Error::new(
            ErrorKind::InvalidInput,
            format!("{path} has no parent directory"),
        ));
    };
    let parent = if parent.as_str().is_empty() {
        Utf8Path::new(".")
    } else {
        parent
    };
    let dir = Dir::open_ambient_dir(parent, cap_std::ambient_authority())?;
    Ok((dir, name))
}

fn copy_dir(src: &Dir, dst: &Dir) -> Result<()> {
    for entry in src.entries()? {
        let entry = entry?;
        let name = entry.file_name();
        let ty = entry.file_type()?;
        if ty.is_dir() {
            dst.ensure_dir_with(&name, &DirBuilder::new())?;
            copy_dir(&src.open_dir(&name)?, &dst.open_dir(&name)?)?;
            dst.set_permissions(&name, entry.metadata()?.permissions())?;
        } else if ty.is_symlink() {
            // Targets may be absolute, which the sandboxed readlink refuses
            let target = rustix::fs::readlinkat(src, name.as_os_str(), Vec::new())?;
            dst.remove_file_optional(&name)?;
            rustix::fs::symlinkat(target.as_c_str(), dst, name.as_os_str())?;
        } else {
            src.copy(&name, dst, &name)?;
        }
    }
    Ok(())
}

/// Recursively copy the contents of `src` into `dst`, creating `dst` if needed.
/// File modes are preserved, symbolic links are recreated rather than followed.
#[context("Copying {src} to {dst}")]
pub(crate) fn copy_tree(src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
    std::fs::create_dir_all(dst).with_context(|| format!("Creating {dst}"))?;
    let src = Dir::open_ambient_dir(src, cap_std::ambient_authority())?;
    let dst = Dir::open_ambient_dir(dst, cap_std::ambient_authority())?;
    copy_dir(&src, &dst)
}

/// Copy the regular file `src` into the directory `dir`, keeping its name.
pub(crate) fn copy_into(src: &Utf8Path, dir: &Utf8Path) -> Result<Utf8PathBuf> {
    let name = src
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("No file name in {src}"))?;
    let dst = dir.join(name);
    std::fs::copy(src, &dst).with_context(|| format!("Copying {src} to {dir}"))?;
    Ok(dst)
}

/// Remove a file or a whole directory tree. A missing path is not an error.
pub(crate) fn remove_path(path: &Utf8Path) -> Result<()> {
    let (dir, name) = match open_parent(path) {
        Ok(v) => v,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("Opening parent of {path}")),
    };
    let is_dir = match dir.symlink_metadata(name) {
        Ok(m) => m.is_dir(),
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("Querying {path}")),
    };
    let removed = if is_dir {
        dir.remove_all_optional(name)
    } else {
        dir.remove_file_optional(name)
    };
    removed.with_context(|| format!("Removing {path}"))?;
    Ok(())
}

/// Create a configuration directory owned by `group` with [`CONFIG_DIR_MODE`].
#[context("Creating configuration directory {path}")]
pub(crate) fn create_config_dir(path: &Utf8Path, group: Option<&str>) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let (dir, name) = open_parent(path)?;
    let mut db = DirBuilder::new();
    db.mode(CONFIG_DIR_MODE);
    dir.ensure_dir_with(name, &db)?;
    if let Some(group) = group {
        let gid = group_id(group)?;
        std::os::unix::fs::chown(path, None, Some(gid))
            .with_context(|| format!("Changing group of {path} to {group}"))?;
    }
    // Set after chown, which may clear setgid; the umask also masks the builder mode
    let mode = std::fs::Permissions::from_mode(CONFIG_DIR_MODE);
    dir.set_permissions(name, Permissions::from_std(mode))?;
    Ok(())
}

/// Look up a group by name.
pub(crate) fn group_id(group: &str) -> Result<u32> {
    uzers::get_group_by_name(group)
        .map(|g| g.gid())
        .ok_or_else(|| anyhow::anyhow!("Unknown group {group}"))
}

/// Change the group of `path` and everything below it. Symbolic links are
/// changed themselves, never followed.
pub(crate) fn chgrp_tree(path: &Utf8Path, gid: u32) -> Result<()> {
    std::os::unix::fs::lchown(path, None, Some(gid))
        .with_context(|| format!("Changing group of {path}"))?;
    if path.symlink_metadata()?.is_dir() {
        for entry in path.read_dir_utf8()? {
            chgrp_tree(entry?.path(), gid)?;
        }
    }
    Ok(())
}

/// Replace `path` with `contents` atomically, creating missing parents.
pub(crate) fn write_atomic(path: &Utf8Path, contents: impl AsRef<[u8]>) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("Creating {parent}"))?;
    }
    let (dir, name) = open_parent(path)?;
    dir.atomic_write(name, contents)
        .with_context(|| format!("Writing {path}"))
}

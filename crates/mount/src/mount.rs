//! Helpers for interacting with mountpoints

use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::Deserialize;

use sysimage_utils::CommandRunExt;

/// A single mounted filesystem as reported by `findmnt`.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Filesystem {
    /// The mount source (device, or the special name for pseudo filesystems)
    pub source: String,
    /// Mountpoint
    pub target: String,
    /// Filesystem type
    pub fstype: String,
    /// Mount options
    #[serde(default)]
    pub options: String,
}

/// The parsed output of `findmnt -J -l`.
#[derive(Deserialize, Debug, Default)]
pub struct Findmnt {
    /// All matching filesystems, in mount table order
    pub filesystems: Vec<Filesystem>,
}

fn parse_findmnt(s: &str) -> Result<Findmnt> {
    serde_json::from_str(s).context("Parsing findmnt output")
}

/// Run `findmnt` in flat JSON mode with the given extra arguments and optional path.
pub fn run_findmnt(args: &[&str], path: Option<&str>) -> Result<Findmnt> {
    let mut cmd = Command::new("findmnt");
    cmd.args(["-J", "-l", "-o", "SOURCE,TARGET,FSTYPE,OPTIONS"])
        .args(args)
        .args(path);
    let o = cmd.log_debug().run_get_string()?;
    // findmnt prints nothing at all when nothing matched
    if o.trim().is_empty() {
        return Ok(Findmnt::default());
    }
    parse_findmnt(&o)
}

/// Filter a mount table down to mounts at or below `prefix`, deepest first.
///
/// Matching is done on whole path components, so `/mnt/a` does not contain `/mnt/ab`.
fn filter_mounts_under(mounts: Vec<Filesystem>, prefix: &Utf8Path) -> Vec<Utf8PathBuf> {
    let mut r: Vec<Utf8PathBuf> = mounts
        .into_iter()
        .map(|fs| Utf8PathBuf::from(fs.target))
        .filter(|target| target.starts_with(prefix))
        .collect();
    r.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    r.dedup();
    r
}

/// All mountpoints at or below `prefix`, ordered so that unmounting in
/// sequence never hits a busy parent.
#[context("Finding mounts under {prefix}")]
pub fn mounts_under(prefix: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
    let all = run_findmnt(&[], None)?;
    Ok(filter_mounts_under(all.filesystems, prefix))
}

/// Mount `source` on `target`, creating the target directory if needed.
#[context("Mounting {source} at {target}")]
pub fn mount(
    source: &Utf8Path,
    target: &Utf8Path,
    fstype: Option<&str>,
    options: Option<&str>,
) -> Result<()> {
    std::fs::create_dir_all(target).with_context(|| format!("Creating {target}"))?;
    let mut cmd = Command::new("mount");
    if let Some(fstype) = fstype {
        cmd.args(["-t", fstype]);
    }
    if let Some(options) = options {
        cmd.args(["-o", options]);
    }
    cmd.arg(source)
        .arg(target)
        .log_debug()
        .run_capture_stderr()
}

/// Unmount `target`.
#[context("Unmounting {target}")]
pub fn unmount(target: &Utf8Path, lazy: bool) -> Result<()> {
    let mut cmd = Command::new("umount");
    if lazy {
        cmd.arg("-l");
    }
    cmd.arg(target).log_debug().run_capture_stderr()
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = indoc::indoc! { r#"
        {
           "filesystems": [
              {"source": "/dev/sda3", "target": "/", "fstype": "ext4", "options": "rw,relatime"},
              {"source": "/dev/sr0", "target": "/usr/lib/live/mount/medium", "fstype": "iso9660", "options": "ro"},
              {"source": "/dev/sdb3", "target": "/mnt/installation/disk_dst", "fstype": "ext4", "options": "rw"},
              {"source": "/dev/sdb2", "target": "/mnt/installation/disk_dst/boot/efi", "fstype": "vfat", "options": "rw"},
              {"source": "/dev/loop0", "target": "/mnt/installation/root_src", "fstype": "squashfs", "options": "ro"},
              {"source": "/dev/sdc1", "target": "/mnt/installation2", "fstype": "ext4", "options": "rw"}
           ]
        }
    "# };

    #[test]
    fn test_parse() {
        let m = parse_findmnt(FIXTURE).unwrap();
        assert_eq!(m.filesystems.len(), 6);
        assert_eq!(m.filesystems[0].source, "/dev/sda3");
        assert_eq!(m.filesystems[1].fstype, "iso9660");
    }

    #[test]
    fn test_mounts_under() {
        let m = parse_findmnt(FIXTURE).unwrap();
        let under = filter_mounts_under(m.filesystems, Utf8Path::new("/mnt/installation"));
        assert_eq!(under.len(), 3);
        // Deepest mount comes first
        assert_eq!(under[0], "/mnt/installation/disk_dst/boot/efi");
        assert!(!under.iter().any(|p| p == "/mnt/installation2"));
    }

    #[test]
    fn test_mounts_under_none() {
        let m = parse_findmnt(FIXTURE).unwrap();
        let under = filter_mounts_under(m.filesystems, Utf8Path::new("/srv"));
        assert!(under.is_empty());
    }
}

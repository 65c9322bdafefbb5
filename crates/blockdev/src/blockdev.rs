//! Block device discovery and the destructive disk operations used when
//! installing: wiping, partition table creation, filesystem creation
//! and RAID-1 assembly.

use std::collections::BTreeMap;
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::Deserialize;

use sysimage_utils::CommandRunExt;

/// Partition number of the BIOS boot partition.
pub const BIOS_PARTNO: u32 = 1;
/// Partition number of the EFI system partition.
pub const EFI_PARTNO: u32 = 2;
/// Partition number of the root partition.
pub const ROOT_PARTNO: u32 = 3;
/// Size of the BIOS boot partition in MiB.
pub const BIOS_SIZE_MIB: u64 = 1;
/// Size of the EFI system partition in MiB.
pub const EFI_SIZE_MIB: u64 = 256;
/// The filesystem label the running system uses to find its persistent root.
pub const ROOT_LABEL: &str = "persistence";

const BIOS_TYPECODE: &str = "EF02";
const EFI_TYPECODE: &str = "EF00";
const LINUX_TYPECODE: &str = "8300";

#[derive(Debug, Deserialize)]
struct DevicesOutput {
    blockdevices: Vec<Device>,
}

/// A block device as reported by `lsblk`.
#[derive(Debug, Deserialize)]
pub struct Device {
    /// Kernel name, e.g. `sda`
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Device type, e.g. `disk`, `part`, `raid1`, `loop`, `rom`
    #[serde(rename = "type")]
    pub devtype: String,
    /// Child devices (partitions, holders)
    pub children: Option<Vec<Device>>,
    /// Filesystem label, if any
    pub label: Option<String>,
    /// Filesystem type, if any
    pub fstype: Option<String>,
    /// Full device path; not available on older util-linux
    pub path: Option<String>,
}

impl Device {
    /// The device node path.
    // Older lsblk doesn't have PATH, so we do it
    pub fn path(&self) -> Utf8PathBuf {
        self.path
            .as_deref()
            .map(Utf8PathBuf::from)
            .unwrap_or_else(|| Utf8PathBuf::from(format!("/dev/{}", &self.name)))
    }

    /// Whether this device has partitions or other holders.
    pub fn has_children(&self) -> bool {
        self.children.as_ref().map_or(false, |v| !v.is_empty())
    }

    /// True for whole disks (not partitions, loop devices, optical drives).
    pub fn is_disk(&self) -> bool {
        self.devtype == "disk"
    }
}

const LSBLK_COLUMNS: &str = "NAME,PATH,SIZE,TYPE,FSTYPE,LABEL";

fn lsblk(dev: Option<&Utf8Path>) -> Result<Vec<Device>> {
    let mut cmd = Command::new("lsblk");
    cmd.args(["-J", "-b", "-o", LSBLK_COLUMNS]);
    if let Some(dev) = dev {
        cmd.arg(dev);
    }
    let devs: DevicesOutput = cmd.log_debug().run_and_parse_json()?;
    Ok(devs.blockdevices)
}

/// Enumerate all whole disks on the system, in the order the kernel reports them.
#[context("Listing disks")]
pub fn list_disks() -> Result<Vec<Device>> {
    Ok(lsblk(None)?.into_iter().filter(Device::is_disk).collect())
}

/// Query a single device (including its children).
#[context("Listing device {dev}")]
pub fn list_dev(dev: &Utf8Path) -> Result<Device> {
    lsblk(Some(dev))?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no device output from lsblk for {dev}"))
}

fn find_labelled<'a>(devs: &'a [Device], label: &str) -> Option<&'a Device> {
    devs.iter().find_map(|d| {
        if d.label.as_deref() == Some(label) {
            return Some(d);
        }
        find_labelled(d.children.as_deref().unwrap_or_default(), label)
    })
}

/// Find the device (partition, array, ...) carrying filesystem label `label`.
#[context("Finding device labelled {label}")]
pub fn find_by_label(label: &str) -> Result<Option<Device>> {
    let devs = lsblk(None)?;
    Ok(find_labelled(&devs, label).map(|d| Device {
        name: d.name.clone(),
        size: d.size,
        devtype: d.devtype.clone(),
        children: None,
        label: d.label.clone(),
        fstype: d.fstype.clone(),
        path: d.path.clone(),
    }))
}

/// Remove all filesystem, RAID and partition-table signatures from a device.
#[context("Wiping {dev}")]
pub fn wipefs(dev: &Utf8Path) -> Result<()> {
    Command::new("wipefs")
        .args(["-a", "-f"])
        .arg(dev)
        .log_debug()
        .run_capture_stderr()
}

/// Destroy everything on a disk: signatures on each partition, then the
/// GPT and MBR structures of the disk itself.
#[context("Cleaning up disk {dev}")]
pub fn wipe_disk(dev: &Utf8Path) -> Result<()> {
    let device = list_dev(dev)?;
    if device.has_children() {
        tracing::debug!("Wiping partitions of {dev}");
        for child in device.children.iter().flatten() {
            wipefs(&child.path())?;
        }
    }
    Command::new("sgdisk")
        .arg("-Z")
        .arg(dev)
        .log_debug()
        .run_capture_stderr()?;
    wipefs(dev)
}

/// The role of a partition created by [`create_partition_table`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PartitionRole {
    /// The EFI system partition
    Efi,
    /// The root (persistence) partition
    Root,
}

impl std::fmt::Display for PartitionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartitionRole::Efi => f.write_str("efi"),
            PartitionRole::Root => f.write_str("root"),
        }
    }
}

/// Mapping from partition role to partition device node.
pub type PartitionMap = BTreeMap<PartitionRole, Utf8PathBuf>;

/// Compute the device node of partition `partno` of `device`.
///
/// Devices whose name ends in a digit (`nvme0n1`, `mmcblk0`, `md0`) use a `p` separator.
pub fn partition_path(device: &Utf8Path, partno: u32) -> Utf8PathBuf {
    let dev = device.as_str();
    if dev.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{dev}p{partno}").into()
    } else {
        format!("{dev}{partno}").into()
    }
}

fn sgdisk_partition(args: &mut Vec<String>, n: u32, part: &str, name: &str, typecode: &str) {
    args.push("-n".into());
    args.push(format!("{n}:{part}"));
    args.push("-c".into());
    args.push(format!("{n}:{name}"));
    args.push("-t".into());
    args.push(format!("{n}:{typecode}"));
}

/// Arguments for `sgdisk` creating the BIOS, EFI and root partitions; the root
/// partition is `root_size_kib` kibibytes.
fn sgdisk_args(device: &Utf8Path, root_size_kib: u64) -> Vec<String> {
    let mut args = vec!["-a1".to_string()];
    sgdisk_partition(
        &mut args,
        BIOS_PARTNO,
        &format!("0:+{BIOS_SIZE_MIB}M"),
        "BIOS boot",
        BIOS_TYPECODE,
    );
    sgdisk_partition(
        &mut args,
        EFI_PARTNO,
        &format!("0:+{EFI_SIZE_MIB}M"),
        "EFI system",
        EFI_TYPECODE,
    );
    sgdisk_partition(
        &mut args,
        ROOT_PARTNO,
        &format!("0:+{root_size_kib}K"),
        "Linux filesystem",
        LINUX_TYPECODE,
    );
    args.push(device.to_string());
    args
}

/// Create a fresh GPT on `device` holding BIOS boot, EFI and root partitions.
///
/// The device must already have been wiped; see [`wipe_disk`].
#[context("Creating partition table on {device}")]
pub fn create_partition_table(device: &Utf8Path, root_size_kib: u64) -> Result<PartitionMap> {
    Command::new("sgdisk")
        .args(sgdisk_args(device, root_size_kib))
        .log_debug()
        .run_capture_stderr()?;
    udev_settle()?;
    Ok(PartitionMap::from([
        (PartitionRole::Efi, partition_path(device, EFI_PARTNO)),
        (PartitionRole::Root, partition_path(device, ROOT_PARTNO)),
    ]))
}

/// Wait until udev has processed pending events, so new partitions have nodes.
pub fn udev_settle() -> Result<()> {
    // There's a potential window after rereading the partition table where
    // udevd hasn't yet received updates from the kernel, settle will return
    // immediately, and lsblk won't pick up partition labels. Try to sleep
    // our way out of this.
    std::thread::sleep(std::time::Duration::from_millis(200));
    Command::new("udevadm")
        .arg("settle")
        .log_debug()
        .run_capture_stderr()
        .context("Running udevadm settle")
}

/// Filesystems we know how to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filesystem {
    /// FAT32 for the EFI system partition
    Efi,
    /// The journaling root filesystem
    Ext4,
}

impl std::fmt::Display for Filesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Filesystem::Efi => f.write_str("efi"),
            Filesystem::Ext4 => f.write_str("ext4"),
        }
    }
}

/// Create a filesystem of the given type on `dev`.
#[context("Creating {fs} filesystem on {dev}")]
pub fn mkfs(dev: &Utf8Path, fs: Filesystem) -> Result<()> {
    let mut cmd = match fs {
        Filesystem::Efi => {
            let mut c = Command::new("mkfs.vfat");
            c.args(["-F", "32", "-n", "EFI"]);
            c
        }
        Filesystem::Ext4 => {
            let mut c = Command::new("mkfs.ext4");
            c.args(["-q", "-F", "-L", ROOT_LABEL]);
            c
        }
    };
    cmd.arg(dev).log_debug().run_capture_stderr()
}

/// Find the first `mdN` name not present in `devdir`.
pub fn next_free_md(devdir: &Utf8Path) -> Result<Utf8PathBuf> {
    for n in 0..128u32 {
        let candidate = devdir.join(format!("md{n}"));
        if !candidate.try_exists()? {
            return Ok(candidate);
        }
    }
    anyhow::bail!("No free md device name in {devdir}")
}

/// Assemble a RAID-1 array over exactly two member partitions, returning the array device.
#[context("Creating RAID-1 array")]
pub fn create_raid1(members: &[Utf8PathBuf]) -> Result<Utf8PathBuf> {
    if members.len() != 2 {
        anyhow::bail!("RAID-1 requires exactly two members, found {}", members.len());
    }
    let array = next_free_md(Utf8Path::new("/dev"))?;
    Command::new("mdadm")
        .args(["--create", "--run", "--metadata=1.2", "--level=1", "--raid-devices=2"])
        .arg(&array)
        .args(members)
        .log_debug()
        .run_capture_stderr()?;
    udev_settle()?;
    tracing::debug!("Assembled {array} from {members:?}");
    Ok(array)
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse_lsblk(s: &str) -> Vec<Device> {
        serde_json::from_str::<DevicesOutput>(s).unwrap().blockdevices
    }

    #[test]
    fn test_parse_lsblk() {
        let fixture = include_str!("../tests/fixtures/lsblk.json");
        let devs = parse_lsblk(fixture);
        let disks: Vec<_> = devs.iter().filter(|d| d.is_disk()).collect();
        assert_eq!(disks.len(), 2);
        assert_eq!(disks[0].name, "sda");
        assert_eq!(disks[0].size, 3221225472);
        assert!(disks[0].has_children());
        let children = disks[0].children.as_deref().unwrap();
        assert_eq!(children[2].label.as_deref(), Some(ROOT_LABEL));
        assert_eq!(children[2].path(), "/dev/sda3");
        assert!(!disks[1].has_children());
        // The optical drive is not a disk
        assert!(devs.iter().any(|d| d.devtype == "rom"));
    }

    #[test]
    fn test_find_labelled() {
        let fixture = include_str!("../tests/fixtures/lsblk.json");
        let devs = parse_lsblk(fixture);
        let d = find_labelled(&devs, ROOT_LABEL).unwrap();
        assert_eq!(d.name, "sda3");
        assert_eq!(find_labelled(&devs, "EFI").unwrap().name, "sda2");
        assert!(find_labelled(&devs, "nope").is_none());
    }

    #[test]
    fn test_path_fallback() {
        let dev: Device = serde_json::from_value(serde_json::json!({
            "name": "vdb",
            "size": 1024,
            "type": "disk",
        }))
        .unwrap();
        assert_eq!(dev.path(), "/dev/vdb");
    }

    #[test]
    fn test_partition_path() {
        let cases = [
            ("/dev/sda", 3, "/dev/sda3"),
            ("/dev/vdb", 2, "/dev/vdb2"),
            ("/dev/nvme0n1", 2, "/dev/nvme0n1p2"),
            ("/dev/mmcblk0", 3, "/dev/mmcblk0p3"),
        ];
        for (dev, n, expected) in cases {
            assert_eq!(partition_path(Utf8Path::new(dev), n), expected);
        }
    }

    #[test]
    fn test_sgdisk_args() {
        let args = sgdisk_args(Utf8Path::new("/dev/sda"), 2880512);
        assert_eq!(args.first().unwrap(), "-a1");
        assert_eq!(args.last().unwrap(), "/dev/sda");
        assert!(args.contains(&"2:0:+256M".to_string()));
        assert!(args.contains(&"3:0:+2880512K".to_string()));
        assert!(args.contains(&"2:EF00".to_string()));
        assert!(args.contains(&"1:EF02".to_string()));
    }

    #[test]
    fn test_next_free_md() -> Result<()> {
        let td = tempfile::tempdir()?;
        let devdir = Utf8Path::from_path(td.path()).unwrap();
        assert_eq!(next_free_md(devdir)?, devdir.join("md0"));
        std::fs::write(devdir.join("md0"), b"")?;
        std::fs::write(devdir.join("md1"), b"")?;
        assert_eq!(next_free_md(devdir)?, devdir.join("md2"));
        Ok(())
    }

    #[test]
    fn test_create_raid1_requires_two() {
        let r = create_raid1(&[Utf8PathBuf::from("/dev/sda3")]);
        assert!(r.is_err());
    }
}

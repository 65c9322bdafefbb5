//! Partition size planning and single-disk partitioning.

use anyhow::{anyhow, Result};
use camino::Utf8PathBuf;

use sysimage_blockdev::{Filesystem, PartitionMap, PartitionRole};

use crate::disks::StorageDevice;
use crate::error::ImageError;
use crate::host::{Host, Operation, Outcome};
use crate::prompt::Operator;

/// The smallest root partition accepted: 1.5 GiB.
pub const MIN_ROOT_SIZE: u64 = 1610612736;
/// Space kept back for the partition table header (2 MiB), the BIOS boot
/// partition (1 MiB) and the EFI partition (256 MiB).
pub const RESERVED_SPACE: u64 = (2 + 1 + 256) * 1024 * 1024;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

pub(crate) const MSG_INPUT_ROOT_SIZE_ALL: &str =
    "Would you like to use all the free space on the drive?";
pub(crate) const MSG_INPUT_ROOT_SIZE_SET: &str =
    "Please specify the size (in GB) of the root partition (min is 1.5 GB)?";
const MSG_WARN_ROOT_SIZE_TOOBIG: &str = "The size is too big. Try again.";
const MSG_WARN_ROOT_SIZE_TOOSMALL: &str = "The size is too small. Try again";
const MSG_WARN_ROOT_SIZE_NAN: &str = "Please enter a number, e.g. 4 or 2.5";
pub(crate) const MSG_DISKS_LIST: &str = "The following disks were found:";
pub(crate) const MSG_DISK_SELECT: &str = "Which one should be used for installation?";
pub(crate) const MSG_DISK_CONFIRM: &str =
    "Installation will delete all data on the drive. Continue?";

/// How the root partition size is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootSize {
    /// Ask the operator
    Interactive,
    /// Everything that is not reserved
    AllAvailable,
}

/// The partitions created on one disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    /// Whole-disk device
    pub device: StorageDevice,
    /// Partitions by role
    pub partitions: PartitionMap,
    /// Size of the disk (or the size it is treated as) in bytes
    pub total_size: u64,
    /// Root partition size in KiB
    pub root_size_kib: u64,
}

impl PartitionPlan {
    /// The device for `role`.
    pub fn partition(&self, role: PartitionRole) -> Result<&Utf8PathBuf> {
        self.partitions
            .get(&role)
            .ok_or_else(|| anyhow!("No {role} partition on {}", self.device.path))
    }
}

/// Space left for the root partition of a disk of `total` bytes, in KiB.
pub fn available_kib(total: u64) -> u64 {
    total.saturating_sub(RESERVED_SPACE) / 1024
}

#[derive(Debug, PartialEq, Eq)]
enum RootSizeRejection {
    TooBig,
    TooSmall,
}

/// Accept `kib` iff it lies within `[MIN_ROOT_SIZE, available]`.
fn check_root_size(kib: u64, available_kib: u64) -> Result<u64, RootSizeRejection> {
    if kib > available_kib {
        Err(RootSizeRejection::TooBig)
    } else if kib < MIN_ROOT_SIZE / 1024 {
        Err(RootSizeRejection::TooSmall)
    } else {
        Ok(kib)
    }
}

/// GiB as typed by the operator, to KiB.
fn parse_gb_to_kib(s: &str) -> Option<u64> {
    let gb: f64 = s.trim().parse().ok()?;
    if !gb.is_finite() || gb < 0.0 {
        return None;
    }
    Some((gb * GIB) as u64 / 1024)
}

/// Ask for the root partition size in KiB, re-asking until the answer is valid.
pub fn ask_root_size(operator: &impl Operator, available_kib: u64) -> Result<u64> {
    if operator.confirm(MSG_INPUT_ROOT_SIZE_ALL, true)? {
        return Ok(available_kib);
    }
    loop {
        operator.checkpoint()?;
        let answer = operator.input(MSG_INPUT_ROOT_SIZE_SET, None)?;
        let Some(kib) = parse_gb_to_kib(&answer) else {
            operator.message(MSG_WARN_ROOT_SIZE_NAN);
            continue;
        };
        match check_root_size(kib, available_kib) {
            Ok(kib) => return Ok(kib),
            Err(RootSizeRejection::TooBig) => operator.message(MSG_WARN_ROOT_SIZE_TOOBIG),
            Err(RootSizeRejection::TooSmall) => operator.message(MSG_WARN_ROOT_SIZE_TOOSMALL),
        }
    }
}

/// Wipe `device` and create the partition table, treating the disk as
/// `total_size` bytes.
///
/// This destroys everything on the disk; the operator must already have agreed.
pub fn plan_partitions(
    host: &impl Host,
    operator: &impl Operator,
    device: &StorageDevice,
    total_size: u64,
    root: RootSize,
) -> Result<PartitionPlan> {
    let available = available_kib(total_size);
    let root_size_kib = match root {
        RootSize::Interactive => ask_root_size(operator, available)?,
        RootSize::AllAvailable => available,
    };
    operator.step("Creating partition table...")?;
    host.execute(&Operation::WipeDisk {
        device: device.path.clone(),
    })?;
    let outcome = host.execute(&Operation::CreatePartitionTable {
        device: device.path.clone(),
        root_size_kib,
    })?;
    let Outcome::Partitions(partitions) = outcome else {
        anyhow::bail!("Partitioning {} returned no partitions", device.path);
    };
    Ok(PartitionPlan {
        device: device.clone(),
        partitions,
        total_size,
        root_size_kib,
    })
}

/// Create a filesystem on the partition with `role`.
pub(crate) fn make_filesystem(
    host: &impl Host,
    plan: &PartitionPlan,
    role: PartitionRole,
    fstype: Filesystem,
) -> Result<()> {
    host.execute(&Operation::CreateFilesystem {
        device: plan.partition(role)?.clone(),
        fstype,
    })?;
    Ok(())
}

/// Let the operator pick one disk, confirm, partition it and create both filesystems.
pub fn install_single_disk(
    host: &impl Host,
    operator: &impl Operator,
    disks: &[StorageDevice],
) -> Result<PartitionPlan> {
    let first = disks.first().ok_or(ImageError::NoSuitableDisk)?;
    operator.message(MSG_DISKS_LIST);
    for d in disks {
        operator.message(&format!("Drive: {}", d.describe()));
    }
    let names: Vec<&str> = disks.iter().map(|d| d.name.as_str()).collect();
    let selected = operator.input_from(MSG_DISK_SELECT, &first.name, &names)?;
    let disk = disks
        .iter()
        .find(|d| d.name == selected)
        .ok_or_else(|| anyhow!("Unknown disk {selected}"))?;

    if !operator.confirm(MSG_DISK_CONFIRM, false)? {
        return Err(ImageError::Aborted.into());
    }

    let plan = plan_partitions(host, operator, disk, disk.size, RootSize::Interactive)?;
    make_filesystem(host, &plan, PartitionRole::Efi, Filesystem::Efi)?;
    make_filesystem(host, &plan, PartitionRole::Root, Filesystem::Ext4)?;
    Ok(plan)
}

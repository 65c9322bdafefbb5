//! RAID-1 mirroring across two disks.

use anyhow::Result;
use camino::Utf8PathBuf;

use sysimage_blockdev::{Filesystem, PartitionRole};

use crate::disks::{format_gb, StorageDevice};
use crate::error::ImageError;
use crate::host::{Host, Operation, Outcome};
use crate::partition::{self, PartitionPlan, RootSize, MSG_DISKS_LIST, RESERVED_SPACE};
use crate::prompt::Operator;

const MSG_RAID_CONFIGURE: &str = "Would you like to configure RAID-1 mirroring?";
const MSG_RAID_FOUND_DISKS: &str = "Would you like to configure RAID-1 mirroring on them?";
const MSG_RAID_CHOOSE_DISKS: &str = "Would you like to choose two disks for RAID-1 mirroring?";
const MSG_RAID_CONFIRM: &str = "Installation will delete all data on both drives. Continue?";

/// Kernel modules GRUB needs to boot from the array.
pub const RAID_MODULES: &[&str] = &["part_msdos", "part_gpt", "diskfilter", "ext2", "mdraid1x"];

/// An assembled mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaidArray {
    /// The array device, e.g. `/dev/md0`
    pub device: Utf8PathBuf,
    /// The two member disks, in the order they were chosen
    pub members: [PartitionPlan; 2],
}

impl RaidArray {
    /// Bytes usable for the root filesystem.
    pub fn usable_size(&self) -> u64 {
        let [a, b] = &self.members;
        a.total_size.min(b.total_size).saturating_sub(RESERVED_SPACE)
    }
}

fn describe_choice(d: &StorageDevice) -> String {
    format!("{}\t({} GB)", d.name, format_gb(d.size))
}

/// Ask which two disks to mirror. `None` if the operator does not want a mirror.
fn select_disks<'a>(
    operator: &impl Operator,
    disks: &'a [StorageDevice],
) -> Result<Option<[&'a StorageDevice; 2]>> {
    let [first, second, ..] = disks else {
        return Ok(None);
    };
    if !operator.confirm(MSG_RAID_CONFIGURE, true)? {
        return Ok(None);
    }
    operator.message(MSG_DISKS_LIST);
    for d in [first, second] {
        operator.message(&format!("\t{}", d.describe()));
    }
    if operator.confirm(MSG_RAID_FOUND_DISKS, true)? {
        return Ok(Some([first, second]));
    }
    if !operator.confirm(MSG_RAID_CHOOSE_DISKS, true)? {
        return Ok(None);
    }
    let items: Vec<String> = disks.iter().map(describe_choice).collect();
    let i = operator.select("Disks available:", "Select first disk:", &items)?;
    let disk0 = disks
        .get(i)
        .ok_or_else(|| anyhow::anyhow!("Invalid selection {i}"))?;
    let remaining: Vec<&StorageDevice> = disks.iter().filter(|d| d.name != disk0.name).collect();
    let items: Vec<String> = remaining.iter().map(|d| describe_choice(d)).collect();
    let i = operator.select("Remaining disks:", "Select second disk:", &items)?;
    let disk1 = remaining
        .get(i)
        .copied()
        .ok_or_else(|| anyhow::anyhow!("Invalid selection {i}"))?;
    Ok(Some([disk0, disk1]))
}

/// Offer to mirror two disks and, if accepted, build the array.
///
/// Both disks are partitioned as if they were the size of the smaller one,
/// each gets an EFI filesystem, and the root filesystem is created once on
/// the array. Returns `None` when fewer than two disks exist or the
/// operator declines.
pub fn assemble_raid(
    host: &impl Host,
    operator: &impl Operator,
    disks: &[StorageDevice],
) -> Result<Option<RaidArray>> {
    let Some(selected) = select_disks(operator, disks)? else {
        return Ok(None);
    };
    if !operator.confirm(MSG_RAID_CONFIRM, false)? {
        return Err(ImageError::Aborted.into());
    }
    let target_size = selected[0].size.min(selected[1].size);

    let mut plans = Vec::with_capacity(2);
    for disk in selected {
        operator.step(&format!("Creating partitions on {}", disk.name))?;
        let plan =
            partition::plan_partitions(host, operator, disk, target_size, RootSize::AllAvailable)?;
        partition::make_filesystem(host, &plan, PartitionRole::Efi, Filesystem::Efi)?;
        plans.push(plan);
    }

    operator.step("Creating RAID array")?;
    let members = plans
        .iter()
        .map(|p| p.partition(PartitionRole::Root).cloned())
        .collect::<Result<Vec<_>>>()?;
    let Outcome::Array(device) = host.execute(&Operation::CreateRaid1 { members })? else {
        anyhow::bail!("RAID creation returned no array device");
    };
    operator.step("Updating initramfs")?;
    host.execute(&Operation::UpdateInitramfs)?;
    operator.step("Creating filesystem on RAID array")?;
    host.execute(&Operation::CreateFilesystem {
        device: device.clone(),
        fstype: Filesystem::Ext4,
    })?;

    let members: [PartitionPlan; 2] = plans
        .try_into()
        .map_err(|_| anyhow::anyhow!("Expected exactly two RAID members"))?;
    Ok(Some(RaidArray { device, members }))
}

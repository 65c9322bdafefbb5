//! The boundary between orchestration and the machine.
//!
//! Every destructive step (partitioning, formatting, mounting, RAID creation,
//! bootloader installation) is an [`Operation`] handed to [`Host::execute`]
//! as a single atomic call. Nothing here retries; callers decide whether a
//! failure is fatal.

use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use sysimage_blockdev::{Filesystem, PartitionMap};
use sysimage_utils::CommandRunExt;

use crate::disks::StorageDevice;
use crate::kernel_cmdline::Cmdline;
use crate::task::Task;

/// A single external operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Remove all signatures and partition tables from a disk
    WipeDisk {
        /// Whole-disk device
        device: Utf8PathBuf,
    },
    /// Create BIOS boot, EFI and root partitions
    CreatePartitionTable {
        /// Whole-disk device
        device: Utf8PathBuf,
        /// Size of the root partition in KiB
        root_size_kib: u64,
    },
    /// Create a filesystem
    CreateFilesystem {
        /// Partition or array device
        device: Utf8PathBuf,
        /// Filesystem type
        fstype: Filesystem,
    },
    /// Mount a device or image file
    Mount {
        /// Device or image file
        source: Utf8PathBuf,
        /// Mountpoint; created if missing
        target: Utf8PathBuf,
        /// Filesystem type, when it cannot be detected
        fstype: Option<String>,
        /// Mount read-only
        read_only: bool,
    },
    /// Unmount a mountpoint
    Unmount {
        /// Mountpoint
        target: Utf8PathBuf,
    },
    /// Assemble a RAID-1 array over two partitions
    CreateRaid1 {
        /// Exactly two member partitions
        members: Vec<Utf8PathBuf>,
    },
    /// Regenerate the initramfs so it can assemble arrays at boot
    UpdateInitramfs,
    /// Record the array configuration in the new system
    RaidUpdateDefault {
        /// Writable overlay directory of the new image
        write_dir: Utf8PathBuf,
    },
    /// Install GRUB onto a disk
    InstallBootloader {
        /// Whole-disk device
        device: Utf8PathBuf,
        /// The `boot` directory of the target storage
        boot_dir: Utf8PathBuf,
        /// Where the EFI partition is mounted
        efi_dir: Utf8PathBuf,
        /// EFI boot entry id; `None` uses the default
        id: Option<String>,
    },
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::WipeDisk { device } => write!(f, "Cleaning up disk {device}"),
            Operation::CreatePartitionTable {
                device,
                root_size_kib,
            } => write!(f, "Partitioning {device} (root {root_size_kib} KiB)"),
            Operation::CreateFilesystem { device, fstype } => {
                write!(f, "Creating {fstype} filesystem on {device}")
            }
            Operation::Mount { source, target, .. } => write!(f, "Mounting {source} at {target}"),
            Operation::Unmount { target } => write!(f, "Unmounting {target}"),
            Operation::CreateRaid1 { members } => {
                let members: Vec<_> = members.iter().map(|m| m.as_str()).collect();
                write!(f, "Creating RAID-1 array from {}", members.join(", "))
            }
            Operation::UpdateInitramfs => f.write_str("Updating initramfs"),
            Operation::RaidUpdateDefault { write_dir } => {
                write!(f, "Writing RAID configuration into {write_dir}")
            }
            Operation::InstallBootloader { device, .. } => {
                write!(f, "Installing bootloader to {device}")
            }
        }
    }
}

/// The result of a successful [`Operation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing to report
    Done,
    /// Newly created partitions by role
    Partitions(PartitionMap),
    /// A newly assembled array device
    Array(Utf8PathBuf),
}

/// How a detached signature is checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureTool {
    /// `minisign` against one public key
    Minisign {
        /// Public key file
        public_key: Utf8PathBuf,
    },
    /// `gpg` against the ambient keyring
    Gpg,
}

/// The machine the installer runs on.
pub trait Host {
    /// Run one external operation to completion.
    fn execute(&self, op: &Operation) -> Result<Outcome>;

    /// All whole disks, in discovery order.
    fn list_disks(&self) -> Result<Vec<StorageDevice>>;

    /// Mountpoints at or below `prefix`, deepest first.
    fn mounts_under(&self, prefix: &Utf8Path) -> Result<Vec<Utf8PathBuf>>;

    /// Whether the system booted from live media.
    fn is_live_boot(&self) -> Result<bool>;

    /// The name of the image the system booted from, if it is installed.
    fn running_image(&self) -> Result<Option<String>>;

    /// Where the persistent root storage is mounted, if anywhere.
    fn find_persistence(&self) -> Result<Option<Utf8PathBuf>>;

    /// Download `url` to `dest`.
    fn download(&self, url: &str, dest: &Utf8Path) -> Result<()>;

    /// Check `signature` over `file`. A bad signature is `Ok(false)`.
    fn check_signature(
        &self,
        tool: &SignatureTool,
        file: &Utf8Path,
        signature: &Utf8Path,
    ) -> Result<bool>;

    /// Hash a password with SHA-512 crypt.
    fn hash_password(&self, plaintext: &str) -> Result<String>;
}

/// The real machine.
#[derive(Debug, Default)]
pub struct SystemHost;

/// The default GRUB EFI boot entry id.
const DEFAULT_BOOTLOADER_ID: &str = "VyOS";
const MDADM_CONF: &str = "etc/mdadm/mdadm.conf";

impl SystemHost {
    fn install_bootloader(
        &self,
        device: &Utf8Path,
        boot_dir: &Utf8Path,
        efi_dir: &Utf8Path,
        id: Option<&str>,
    ) -> Result<()> {
        let id = id.unwrap_or(DEFAULT_BOOTLOADER_ID);
        Task::new(format!("Installing GRUB (BIOS) to {device}"), "grub-install")
            .args(["--no-floppy", "--target=i386-pc", "--force"])
            .arg(format!("--boot-directory={boot_dir}"))
            .arg(device)
            .quiet_output()
            .run()?;
        Task::new(format!("Installing GRUB (UEFI) to {device}"), "grub-install")
            .args([
                "--no-floppy",
                "--recheck",
                "--target=x86_64-efi",
                "--force-extra-removable",
                "--no-uefi-secure-boot",
            ])
            .arg(format!("--boot-directory={boot_dir}"))
            .arg(format!("--efi-directory={efi_dir}"))
            .arg(format!("--bootloader-id={id}"))
            .arg(device)
            .quiet_output()
            .run()
    }

    #[context("Writing RAID configuration")]
    fn raid_update_default(&self, write_dir: &Utf8Path) -> Result<()> {
        let scan = Task::new("Scanning RAID arrays", "mdadm")
            .args(["--detail", "--scan"])
            .quiet()
            .read()?;
        // The live system needs it too, for the initramfs refresh
        for root in [Utf8Path::new("/"), write_dir] {
            let target = root.join(MDADM_CONF);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).with_context(|| format!("Creating {parent}"))?;
            }
            std::fs::write(&target, &scan).with_context(|| format!("Writing {target}"))?;
        }
        Ok(())
    }
}

impl Host for SystemHost {
    fn execute(&self, op: &Operation) -> Result<Outcome> {
        tracing::debug!("{op}");
        match op {
            Operation::WipeDisk { device } => sysimage_blockdev::wipe_disk(device)?,
            Operation::CreatePartitionTable {
                device,
                root_size_kib,
            } => {
                let parts = sysimage_blockdev::create_partition_table(device, *root_size_kib)?;
                return Ok(Outcome::Partitions(parts));
            }
            Operation::CreateFilesystem { device, fstype } => {
                sysimage_blockdev::mkfs(device, *fstype)?
            }
            Operation::Mount {
                source,
                target,
                fstype,
                read_only,
            } => {
                let options = read_only.then_some("ro,loop");
                sysimage_mount::mount(source, target, fstype.as_deref(), options)?
            }
            Operation::Unmount { target } => sysimage_mount::unmount(target, false)?,
            Operation::CreateRaid1 { members } => {
                let array = sysimage_blockdev::create_raid1(members)?;
                return Ok(Outcome::Array(array));
            }
            Operation::UpdateInitramfs => {
                Task::new_and_run("Updating initramfs", "update-initramfs", ["-u"])?
            }
            Operation::RaidUpdateDefault { write_dir } => self.raid_update_default(write_dir)?,
            Operation::InstallBootloader {
                device,
                boot_dir,
                efi_dir,
                id,
            } => self.install_bootloader(device, boot_dir, efi_dir, id.as_deref())?,
        }
        Ok(Outcome::Done)
    }

    fn list_disks(&self) -> Result<Vec<StorageDevice>> {
        let disks = sysimage_blockdev::list_disks()?;
        Ok(disks
            .into_iter()
            .map(|d| StorageDevice {
                path: d.path(),
                name: d.name,
                size: d.size,
            })
            .collect())
    }

    fn mounts_under(&self, prefix: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
        sysimage_mount::mounts_under(prefix)
    }

    fn is_live_boot(&self) -> Result<bool> {
        Ok(Cmdline::from_proc()?.is_live_boot())
    }

    fn running_image(&self) -> Result<Option<String>> {
        Ok(Cmdline::from_proc()?.running_image().map(ToOwned::to_owned))
    }

    #[context("Locating persistence storage")]
    fn find_persistence(&self) -> Result<Option<Utf8PathBuf>> {
        let Some(dev) = sysimage_blockdev::find_by_label(sysimage_blockdev::ROOT_LABEL)? else {
            return Ok(None);
        };
        let mounts = sysimage_mount::run_findmnt(&["-S", dev.path().as_str()], None)?;
        Ok(mounts
            .filesystems
            .into_iter()
            .next()
            .map(|fs| Utf8PathBuf::from(fs.target)))
    }

    #[context("Downloading {url}")]
    fn download(&self, url: &str, dest: &Utf8Path) -> Result<()> {
        Task::new(format!("Downloading {url}"), "curl")
            .args(["--fail", "--location", "--silent", "--show-error", "--output"])
            .arg(dest)
            .arg(url)
            .run()
    }

    fn check_signature(
        &self,
        tool: &SignatureTool,
        file: &Utf8Path,
        signature: &Utf8Path,
    ) -> Result<bool> {
        let mut cmd = match tool {
            SignatureTool::Minisign { public_key } => {
                let mut c = Command::new("minisign");
                c.args(["-V", "-q", "-p"])
                    .arg(public_key)
                    .arg("-m")
                    .arg(file)
                    .arg("-x")
                    .arg(signature);
                c
            }
            SignatureTool::Gpg => {
                let mut c = Command::new("gpg");
                c.arg("--verify").arg(signature).arg(file);
                c
            }
        };
        cmd.log_debug().run_succeeds()
    }

    #[context("Hashing password")]
    fn hash_password(&self, plaintext: &str) -> Result<String> {
        // The plaintext goes over stdin so it never shows up in the process table
        let out = Command::new("openssl")
            .args(["passwd", "-6", "-stdin"])
            .run_with_input(plaintext.as_bytes())?;
        let hashed = out.trim();
        anyhow::ensure!(hashed.starts_with("$6$"), "Unexpected output from openssl passwd");
        Ok(hashed.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_display() {
        let op = Operation::CreateRaid1 {
            members: vec!["/dev/sda3".into(), "/dev/sdb3".into()],
        };
        assert_eq!(op.to_string(), "Creating RAID-1 array from /dev/sda3, /dev/sdb3");
        let op = Operation::CreatePartitionTable {
            device: "/dev/sda".into(),
            root_size_kib: 2880512,
        };
        assert_eq!(op.to_string(), "Partitioning /dev/sda (root 2880512 KiB)");
    }
}

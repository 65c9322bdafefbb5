//! # Installing onto local storage from live media
//!
//! The install runs strictly in order: preflight, questions, disk
//! selection (RAID-1 first, single disk otherwise), then mounting,
//! seeding the configuration, staging the image files, writing the GRUB
//! configuration and installing GRUB. Everything mounted or created
//! below the staging root is released on every exit path by a
//! [`Teardown`] guard.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use sysimage_blockdev::PartitionRole;

use crate::bootloader::{setup_grub, BootVars, ConsoleType};
use crate::cleanup::Teardown;
use crate::config::{self, Layout, CONFIG_FILE, CONFIG_MARKER};
use crate::configtree;
use crate::disks::{list_candidate_disks, StorageDevice};
use crate::error::ImageError;
use crate::host::{Host, Operation};
use crate::image::image_version;
use crate::partition::{install_single_disk, PartitionPlan};
use crate::prompt::Operator;
use crate::raid::{assemble_raid, RaidArray, RAID_MODULES};
use crate::registry::{validate_name, with_refresh, BootRegistry};
use crate::utils::{copy_into, create_config_dir};

const MSG_INFO_INSTALL_WELCOME: &str = "Welcome to VyOS installation!\nThis command will install VyOS to your permanent storage.";
pub(crate) const MSG_INFO_INSTALL_EXIT: &str = "Exiting from installation";
const MSG_INFO_INSTALL_SUCCESS: &str = "The image installed successfully; please reboot now.";
const MSG_INPUT_CONTINUE: &str = "Would you like to continue?";
pub(crate) const MSG_INPUT_IMAGE_NAME: &str = "What would you like to name this image?";
const MSG_INPUT_PASSWORD: &str = "Please enter a password for the \"vyos\" user";
const MSG_INPUT_CONSOLE_TYPE: &str =
    "What console should be used by default? (K: KVM, S: Serial, U: USB-Serial)?";
pub(crate) const MSG_WARN_IMAGE_NAME_WRONG: &str = "The suggested name is unsupported!";

const DEFAULT_PASSWORD: &str = "vyos";
/// Overlay marker at the root of the persistent storage.
pub(crate) const PERSISTENCE_CONF: &str = "persistence.conf";
const PERSISTENCE_CONF_CONTENTS: &str = "/ union\n";

/// Ask for an image name until it satisfies the naming rule.
pub(crate) fn ask_image_name(operator: &impl Operator, default: Option<&str>) -> Result<String> {
    loop {
        operator.checkpoint()?;
        let name = operator.input(MSG_INPUT_IMAGE_NAME, default)?;
        if validate_name(&name) {
            return Ok(name);
        }
        operator.message(MSG_WARN_IMAGE_NAME_WRONG);
    }
}

/// Everything the operator decides before any disk is touched.
#[derive(Debug)]
struct InstallIntent {
    name: String,
    /// Only the hash is kept; the plaintext is dropped right after hashing
    password_hash: String,
    console: ConsoleType,
}

fn gather_intent(host: &impl Host, operator: &impl Operator, layout: &Layout) -> Result<InstallIntent> {
    let default_name = match image_version(&layout.system_root) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("{e:#}");
            None
        }
    };
    let name = ask_image_name(operator, default_name.as_deref())?;
    let password = operator.password(MSG_INPUT_PASSWORD, DEFAULT_PASSWORD)?;
    let password_hash = host.hash_password(&password)?;
    drop(password);
    let choice = operator.input_from(MSG_INPUT_CONSOLE_TYPE, "K", &ConsoleType::CHOICES)?;
    let console = ConsoleType::from_choice(&choice)
        .ok_or_else(|| anyhow::anyhow!("Unknown console type {choice}"))?;
    Ok(InstallIntent {
        name,
        password_hash,
        console,
    })
}

/// Where the new system goes.
#[derive(Debug)]
enum InstallTarget {
    Single(PartitionPlan),
    Raid(RaidArray),
}

impl InstallTarget {
    /// The device holding the root filesystem.
    fn root_device(&self) -> Result<Utf8PathBuf> {
        match self {
            Self::Single(plan) => plan.partition(PartitionRole::Root).cloned(),
            Self::Raid(array) => Ok(array.device.clone()),
        }
    }
}

fn select_target(
    host: &impl Host,
    operator: &impl Operator,
    disks: &[StorageDevice],
) -> Result<InstallTarget> {
    if let Some(array) = assemble_raid(host, operator, disks)? {
        return Ok(InstallTarget::Raid(array));
    }
    install_single_disk(host, operator, disks).map(InstallTarget::Single)
}

/// Copy the active configuration into the new image with the password hash set.
#[context("Creating a configuration file")]
fn seed_configuration(
    layout: &Layout,
    storage_root: &Utf8Path,
    intent: &InstallIntent,
) -> Result<()> {
    let target = layout.image_config_dir(storage_root, &intent.name);
    create_config_dir(&target, layout.config_group.as_deref())?;
    let copied = copy_into(&layout.active_config().join(CONFIG_FILE), &target)?;
    let config = std::fs::read_to_string(&copied).with_context(|| format!("Reading {copied}"))?;
    let config = configtree::set_encrypted_password(&config, &intent.password_hash);
    std::fs::write(&copied, config).with_context(|| format!("Writing {copied}"))?;
    std::fs::write(target.join(CONFIG_MARKER), "")?;
    Ok(())
}

/// Copy every file of the running kernel directory plus the root image.
#[context("Copying system image files")]
fn stage_files(layout: &Layout, image_dir: &Utf8Path, name: &str) -> Result<()> {
    std::fs::create_dir_all(image_dir)?;
    for entry in layout.kernel_dir.read_dir_utf8()? {
        let entry = entry?;
        // Follows symlinks, so `vmlinuz -> vmlinuz-<version>` is copied as a file
        if entry.path().is_file() {
            copy_into(entry.path(), image_dir)?;
        }
    }
    let squashfs = image_dir.join(format!("{name}.squashfs"));
    std::fs::copy(&layout.running_rootfs, &squashfs)
        .with_context(|| format!("Copying {}", layout.running_rootfs))?;
    Ok(())
}

fn install_to_target<H: Host, R: BootRegistry>(
    host: &H,
    operator: &impl Operator,
    layout: &Layout,
    intent: &InstallIntent,
    target: &InstallTarget,
    teardown: &mut Teardown<'_, H>,
    open_registry: impl FnOnce(&Utf8Path) -> Result<R>,
) -> Result<()> {
    operator.step("Creating temporary directories")?;
    for dir in [layout.root_src(), layout.root_dst(), layout.disk_dst()] {
        std::fs::create_dir_all(&dir).with_context(|| format!("Creating {dir}"))?;
        teardown.remove_later(&dir);
    }

    operator.step("Mounting new partitions")?;
    let storage_root = layout.disk_dst();
    let efi_dir = storage_root.join("boot/efi");
    teardown.mount(&target.root_device()?, &storage_root, None, false)?;
    std::fs::create_dir_all(&efi_dir)?;
    if let InstallTarget::Single(plan) = target {
        teardown.mount(plan.partition(PartitionRole::Efi)?, &efi_dir, None, false)?;
    }

    operator.step("Creating a configuration file")?;
    seed_configuration(layout, &storage_root, intent)?;
    std::fs::write(storage_root.join(PERSISTENCE_CONF), PERSISTENCE_CONF_CONTENTS)?;

    operator.step("Copying system image files")?;
    let image_dir = config::image_dir(&storage_root, &intent.name);
    stage_files(layout, &image_dir, &intent.name)?;

    if matches!(target, InstallTarget::Raid(_)) {
        host.execute(&Operation::RaidUpdateDefault {
            write_dir: image_dir.join("rw"),
        })?;
    }

    operator.step("Installing GRUB configuration files")?;
    let modules: &[&str] = match target {
        InstallTarget::Raid(_) => RAID_MODULES,
        InstallTarget::Single(_) => &[],
    };
    setup_grub(&storage_root, &BootVars::new(intent.console), modules)?;
    let mut registry = open_registry(&storage_root)?;
    with_refresh(&mut registry, |r| {
        r.add(&intent.name)?;
        r.set_default(&intent.name)
    })?;

    let boot_dir = storage_root.join("boot");
    match target {
        InstallTarget::Single(plan) => {
            operator.step("Installing GRUB to the drive")?;
            host.execute(&Operation::InstallBootloader {
                device: plan.device.path.clone(),
                boot_dir,
                efi_dir,
                id: None,
            })?;
        }
        InstallTarget::Raid(array) => {
            operator.step("Installing GRUB to the drives")?;
            for (i, member) in array.members.iter().enumerate() {
                operator.checkpoint()?;
                teardown.mount(member.partition(PartitionRole::Efi)?, &efi_dir, None, false)?;
                host.execute(&Operation::InstallBootloader {
                    device: member.device.path.clone(),
                    boot_dir: boot_dir.clone(),
                    efi_dir: efi_dir.clone(),
                    id: Some(format!("VyOS (RAID disk {})", i + 1)),
                })?;
                teardown.unmount(&efi_dir)?;
            }
        }
    }
    Ok(())
}

/// Install the running live system onto local storage.
///
/// `open_registry` opens the boot registry below the new storage root once
/// the GRUB configuration exists there.
pub fn install_image<H: Host, R: BootRegistry>(
    host: &H,
    operator: &impl Operator,
    layout: &Layout,
    open_registry: impl FnOnce(&Utf8Path) -> Result<R>,
) -> Result<()> {
    if !host.is_live_boot()? {
        return Err(ImageError::NotLiveEnvironment.into());
    }
    operator.message(MSG_INFO_INSTALL_WELCOME);
    if !operator.confirm(MSG_INPUT_CONTINUE, false)? {
        operator.message(MSG_INFO_INSTALL_EXIT);
        return Err(ImageError::Aborted.into());
    }

    let intent = gather_intent(host, operator, layout)?;
    let disks = list_candidate_disks(host, operator)?;

    let mut teardown = Teardown::new(host, layout);
    let r = select_target(host, operator, &disks).and_then(|target| {
        install_to_target(host, operator, layout, &intent, &target, &mut teardown, open_registry)
    });
    match r {
        Ok(()) => {
            operator.message("Cleaning up");
            teardown.finish()?;
            operator.message(MSG_INFO_INSTALL_SUCCESS);
            Ok(())
        }
        Err(e) if ImageError::is_aborted(&e) => {
            operator.message(MSG_INFO_INSTALL_EXIT);
            Err(e)
        }
        Err(e) => Err(e.context("Unable to install image")),
    }
}

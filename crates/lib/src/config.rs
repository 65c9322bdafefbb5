//! Runtime path layout, optionally overridden from a TOML file.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::Deserialize;

/// Default location of the configuration file.
pub(crate) const CONFIG_PATH: &str = "/etc/sysimage/config.toml";
/// Environment variable which overrides [`CONFIG_PATH`].
pub(crate) const CONFIG_ENV: &str = "SYSIMAGE_CONFIG";

/// Version of the image tooling carried by this build.
pub(crate) const SYSTEM_CFG_VER: u32 = 1;

/// Name of the active configuration file inside the configuration directory.
pub(crate) const CONFIG_FILE: &str = "config.boot";
/// Marker which flags a directory as a configuration root.
pub(crate) const CONFIG_MARKER: &str = ".vyatta_config";

/// Every filesystem location the installer touches.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct Layout {
    /// Root under which all installation-time mounts and temporary trees live
    pub staging_root: Utf8PathBuf,
    /// Root of the running system (the live medium's root during install)
    pub system_root: Utf8PathBuf,
    /// The active configuration directory
    pub active_config_dir: Utf8PathBuf,
    /// Directory holding the running kernel and initramfs
    pub kernel_dir: Utf8PathBuf,
    /// The compressed root filesystem of the running system
    pub running_rootfs: Utf8PathBuf,
    /// Where a remote artifact is downloaded to
    pub download_path: Utf8PathBuf,
    /// Trusted minisign public keys, tried in order
    pub minisign_keys: Vec<Utf8PathBuf>,
    /// Group owning seeded configuration directories; `None` leaves ownership alone
    pub config_group: Option<String>,
    /// Tooling version of the running system, for the downgrade gate
    pub system_cfg_ver: u32,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            staging_root: "/mnt/installation".into(),
            system_root: "/".into(),
            active_config_dir: "/opt/vyatta/etc/config".into(),
            kernel_dir: "/boot".into(),
            running_rootfs: "/usr/lib/live/mount/medium/live/filesystem.squashfs".into(),
            download_path: "/tmp/vyos_installation.iso".into(),
            minisign_keys: vec![
                "/usr/share/vyos/keys/vyos-release.minisign.pub".into(),
                "/usr/share/vyos/keys/vyos-backup.minisign.pub".into(),
            ],
            config_group: Some("vyattacfg".into()),
            system_cfg_ver: SYSTEM_CFG_VER,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    layout: Option<Layout>,
}

impl Layout {
    /// Where the embedded root filesystem of an artifact is mounted.
    pub fn root_src(&self) -> Utf8PathBuf {
        self.staging_root.join("root_src")
    }

    /// Scratch root for the new system.
    pub fn root_dst(&self) -> Utf8PathBuf {
        self.staging_root.join("root_dst")
    }

    /// Where an artifact is mounted.
    pub fn iso_mount(&self) -> Utf8PathBuf {
        self.staging_root.join("iso_src")
    }

    /// Where the target storage is mounted during install.
    pub fn disk_dst(&self) -> Utf8PathBuf {
        self.staging_root.join("disk_dst")
    }

    fn config_rel(&self) -> &Utf8Path {
        self.active_config_dir
            .strip_prefix("/")
            .unwrap_or(&self.active_config_dir)
    }

    /// The active configuration directory of the running system.
    pub fn active_config(&self) -> Utf8PathBuf {
        self.system_root.join(self.config_rel())
    }

    /// The per-image configuration directory below `storage_root`.
    pub fn image_config_dir(&self, storage_root: &Utf8Path, name: &str) -> Utf8PathBuf {
        image_dir(storage_root, name).join("rw").join(self.config_rel())
    }

    /// Parse a layout from TOML text. Missing keys keep their defaults.
    pub(crate) fn from_toml(s: &str) -> Result<Self> {
        let c: ConfigFile = toml::from_str(s)?;
        Ok(c.layout.unwrap_or_default())
    }

    /// Load the layout from the configuration file; a missing file yields the defaults.
    #[context("Loading configuration")]
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| CONFIG_PATH.to_owned());
        let s = match std::fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No configuration at {path}, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e).with_context(|| format!("Reading {path}")),
        };
        Self::from_toml(&s).with_context(|| format!("Parsing {path}"))
    }
}

/// The boot directory of image `name` below `storage_root`.
pub fn image_dir(storage_root: &Utf8Path, name: &str) -> Utf8PathBuf {
    storage_root.join("boot").join(name)
}

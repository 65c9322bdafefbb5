//! The persisted list of installed images and the default pointer.

use std::sync::OnceLock;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use regex::Regex;

use crate::bootloader::{self, BootVars, GRUB_CFG_VERSION, VERSIONS_FILE};
use crate::parsers::grub_menuconfig::parse_grub_menuentry_file;
use crate::utils::write_atomic;

/// Maximum image name length.
pub const MAX_NAME_LEN: usize = 32;

/// Whether `name` may be used for an image: 1 to 32 letters, digits,
/// spaces or any of `.+-_`.
pub fn validate_name(name: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(&format!(r"^[a-zA-Z0-9.+\-_ ]{{1,{MAX_NAME_LEN}}}$"))
            .expect("valid image name regex")
    });
    re.is_match(name)
}

/// Installed images plus the default pointer.
///
/// Mutations are idempotent: adding a present name, removing an absent one
/// or renaming a name that was already renamed changes nothing.
pub trait BootRegistry {
    /// All image names, in registry order.
    fn list(&self) -> Result<Vec<String>>;

    /// The image booted when nobody intervenes.
    fn default_image(&self) -> Result<Option<String>>;

    /// The image the system is running from, if installed.
    fn running_image(&self) -> Option<&str>;

    /// Register `name`.
    fn add(&mut self, name: &str) -> Result<()>;

    /// Unregister `name`.
    fn remove(&mut self, name: &str) -> Result<()>;

    /// Replace `old` by `new`, keeping its position.
    fn rename(&mut self, old: &str, new: &str) -> Result<()>;

    /// Point the default at `name`.
    fn set_default(&mut self, name: &str) -> Result<()>;

    /// Regenerate the boot configuration from the registry contents.
    fn refresh(&mut self) -> Result<()>;

    /// Whether `name` is registered.
    fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.list()?.iter().any(|n| n == name))
    }
}

/// Run the mutation `f` and then refresh the boot configuration.
///
/// The refresh runs whether or not `f` succeeded; if `f` failed its error
/// wins and a refresh failure is only logged.
pub fn with_refresh<R, T>(registry: &mut R, f: impl FnOnce(&mut R) -> Result<T>) -> Result<T>
where
    R: BootRegistry + ?Sized,
{
    let r = f(registry);
    let refreshed = registry.refresh().context("Refreshing boot configuration");
    match (r, refreshed) {
        (Ok(v), Ok(())) => Ok(v),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(refresh_err)) => {
            tracing::warn!("{refresh_err:#}");
            Err(e)
        }
    }
}

/// A [`BootRegistry`] stored as GRUB configuration below a storage root.
#[derive(Debug)]
pub struct GrubRegistry {
    root: Utf8PathBuf,
    running: Option<String>,
}

impl GrubRegistry {
    /// A registry below `root`; `running` names the booted image.
    pub fn new(root: &Utf8Path, running: Option<String>) -> Self {
        Self {
            root: root.to_owned(),
            running,
        }
    }

    /// The existing registry stored below `root`, checking its schema version.
    #[context("Opening boot registry in {root}")]
    pub fn open(root: &Utf8Path, running: Option<String>) -> Result<Self> {
        if let Some(v) = bootloader::read_cfg_version(root)? {
            anyhow::ensure!(
                v <= GRUB_CFG_VERSION,
                "Unsupported boot configuration version {v} (supported: {GRUB_CFG_VERSION})"
            );
        }
        Ok(Self::new(root, running))
    }

    fn versions_path(&self) -> Utf8PathBuf {
        bootloader::cfg_path(&self.root, VERSIONS_FILE)
    }

    fn read_names(&self) -> Result<Vec<String>> {
        let path = self.versions_path();
        let s = match std::fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("Reading {path}")),
        };
        let entries = parse_grub_menuentry_file(&s).with_context(|| format!("Parsing {path}"))?;
        Ok(entries.into_iter().map(|e| e.title).collect())
    }

    fn write_names(&self, names: &[String]) -> Result<()> {
        let vars = BootVars::read(&self.root)?;
        let s: String = names
            .iter()
            .map(|n| bootloader::render_entry(n, &vars))
            .collect::<Vec<_>>()
            .join("\n");
        write_atomic(&self.versions_path(), s)
    }
}

impl BootRegistry for GrubRegistry {
    fn list(&self) -> Result<Vec<String>> {
        self.read_names()
    }

    fn default_image(&self) -> Result<Option<String>> {
        let vars = BootVars::read(&self.root)?;
        Ok(vars
            .get("default")
            .filter(|v| !v.is_empty())
            .map(ToOwned::to_owned))
    }

    fn running_image(&self) -> Option<&str> {
        self.running.as_deref()
    }

    fn add(&mut self, name: &str) -> Result<()> {
        let mut names = self.read_names()?;
        if names.iter().any(|n| n == name) {
            return Ok(());
        }
        names.push(name.to_owned());
        self.write_names(&names)
    }

    fn remove(&mut self, name: &str) -> Result<()> {
        let mut names = self.read_names()?;
        let before = names.len();
        names.retain(|n| n != name);
        if names.len() == before {
            return Ok(());
        }
        self.write_names(&names)
    }

    fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        let mut names = self.read_names()?;
        let Some(i) = names.iter().position(|n| n == old) else {
            return Ok(());
        };
        if names.iter().any(|n| n == new) {
            names.remove(i);
        } else {
            names[i] = new.to_owned();
        }
        self.write_names(&names)
    }

    fn set_default(&mut self, name: &str) -> Result<()> {
        let mut vars = BootVars::read(&self.root)?;
        vars.set("default", name);
        vars.write(&self.root)
    }

    fn refresh(&mut self) -> Result<()> {
        let names = self.read_names()?;
        tracing::debug!("Refreshing {} boot entries", names.len());
        self.write_names(&names)
    }
}

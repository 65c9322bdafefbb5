//! GRUB configuration files kept on the persistent storage.
//!
//! The main `grub.cfg` is a fixed template which sources the fragments in
//! `grub.cfg.d/`: boot variables, extra modules, menu setup, one
//! `menuentry` per image and finally the options submenu.

use std::fmt::Write as _;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use indoc::indoc;

use crate::parsers::grub_menuconfig::{MenuEntry, MenuentryBody};
use crate::utils::write_atomic;

/// GRUB directory below the storage root.
pub(crate) const GRUB_DIR: &str = "boot/grub";
const CFG_DIR: &str = "grub.cfg.d";
const VARS_FILE: &str = "20-vars.cfg";
const MODULES_FILE: &str = "30-modules.cfg";
const MENU_FILE: &str = "40-menu.cfg";
pub(crate) const VERSIONS_FILE: &str = "versions.cfg";
const OPTIONS_FILE: &str = "50-options.cfg";
const CFG_VERSION_FILE: &str = "cfg-version";

/// On-disk schema version of the files written here.
pub(crate) const GRUB_CFG_VERSION: u32 = 1;

const TMPL_GRUB_MAIN: &str = indoc! { r#"
    # Generated by sysimage; do not edit
    load_env
    insmod regexp
    for f in 20-vars 30-modules 40-menu versions 50-options; do
        source "${config_directory}/grub.cfg.d/${f}.cfg"
    done
"# };

const TMPL_GRUB_MENU: &str = indoc! { r#"
    if [ "${console_type}" == "ttyS" -o "${console_type}" == "ttyUSB" ]; then
        serial --unit=${console_num} --speed=115200
        terminal_input serial console
        terminal_output serial console
    fi
    set gfxpayload=keep
"# };

const TMPL_GRUB_OPTS: &str = indoc! { r#"
    submenu "Boot options" {
        menuentry "Reset the password of the vyos user on next boot" {
            set bootmode="pw_reset"
            save_env bootmode
            configfile ${config_directory}/grub.cfg
        }
        menuentry "Return to normal boot" {
            set bootmode="normal"
            save_env bootmode
            configfile ${config_directory}/grub.cfg
        }
    }
"# };

/// Kernel argument added in password-reset boot mode.
const PW_RESET_INIT: &str = "init=/opt/vyatta/sbin/standalone_root_pw_reset";
/// Arguments shared by every image.
const BOOT_OPTS: &str = "boot=live rootdelay=5 noautologin net.ifnames=0 biosdevname=0";

/// The console the system uses by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleType {
    /// Keyboard and screen
    Tty,
    /// Serial port
    Serial,
    /// USB serial adapter
    UsbSerial,
}

impl ConsoleType {
    /// Choices offered to the operator, in prompt order.
    pub(crate) const CHOICES: [&'static str; 3] = ["K", "S", "U"];

    /// Map an operator choice (`K`, `S` or `U`).
    pub(crate) fn from_choice(s: &str) -> Option<Self> {
        match s {
            "K" => Some(Self::Tty),
            "S" => Some(Self::Serial),
            "U" => Some(Self::UsbSerial),
            _ => None,
        }
    }

    /// The device name prefix, as stored in `console_type`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tty => "tty",
            Self::Serial => "ttyS",
            Self::UsbSerial => "ttyUSB",
        }
    }

    fn kernel_arg(prefix: &str, num: &str) -> String {
        match prefix {
            "tty" => format!("console=tty{num}"),
            _ => format!("console={prefix}{num},115200"),
        }
    }
}

/// Ordered `set key="value"` assignments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootVars(Vec<(String, String)>);

impl BootVars {
    /// The defaults for a fresh install.
    pub fn new(console: ConsoleType) -> Self {
        let mut v = Self::default();
        v.set("timeout", "5");
        v.set("console_type", console.as_str());
        v.set("console_num", "0");
        v.set("bootmode", "normal");
        v
    }

    /// The value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Assign `key`, keeping its position if already present.
    pub fn set(&mut self, key: &str, value: &str) {
        match self.0.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_owned(),
            None => self.0.push((key.to_owned(), value.to_owned())),
        }
    }

    /// Parse `set key="value"` lines; anything else is ignored.
    pub(crate) fn parse(s: &str) -> Self {
        let mut v = Self::default();
        for line in s.lines() {
            let Some(rest) = line.trim().strip_prefix("set ") else {
                continue;
            };
            let Some((key, value)) = rest.split_once('=') else {
                continue;
            };
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            v.set(key.trim(), value);
        }
        v
    }

    fn render(&self) -> String {
        self.0.iter().fold(String::new(), |mut s, (k, v)| {
            let _ = writeln!(s, "set {k}=\"{v}\"");
            s
        })
    }

    /// Read the variables file below `root`; missing means empty.
    pub(crate) fn read(root: &Utf8Path) -> Result<Self> {
        let path = cfg_path(root, VARS_FILE);
        match std::fs::read_to_string(&path) {
            Ok(s) => Ok(Self::parse(&s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("Reading {path}")),
        }
    }

    /// Write the variables file below `root`.
    pub(crate) fn write(&self, root: &Utf8Path) -> Result<()> {
        write_atomic(&cfg_path(root, VARS_FILE), self.render())
    }
}

/// Path of a fragment in `grub.cfg.d` below `root`.
pub(crate) fn cfg_path(root: &Utf8Path, name: &str) -> Utf8PathBuf {
    root.join(GRUB_DIR).join(CFG_DIR).join(name)
}

/// Write the `insmod` list below `root`.
pub(crate) fn write_modules(root: &Utf8Path, modules: &[&str]) -> Result<()> {
    let s: String = modules.iter().map(|m| format!("insmod {m}\n")).collect();
    write_atomic(&cfg_path(root, MODULES_FILE), s)
}

/// The schema version tag below `root`, if any.
pub(crate) fn read_cfg_version(root: &Utf8Path) -> Result<Option<u32>> {
    let path = root.join(GRUB_DIR).join(CFG_VERSION_FILE);
    match std::fs::read_to_string(&path) {
        Ok(s) => Ok(Some(
            s.trim()
                .parse()
                .with_context(|| format!("Parsing {path}"))?,
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Reading {path}")),
    }
}

/// Render one image's menuentry.
pub(crate) fn render_entry(name: &str, vars: &BootVars) -> String {
    let dir = format!("/boot/{name}");
    // GRUB joins the words of `linux` with spaces, so escaped quotes keep a
    // name with spaces together on the kernel command line
    let union = if name.contains(' ') {
        format!("vyos-union=\\\"{dir}\\\"")
    } else {
        format!("vyos-union={dir}")
    };
    let console = ConsoleType::kernel_arg(
        vars.get("console_type").unwrap_or("tty"),
        vars.get("console_num").unwrap_or("0"),
    );
    let mut linux = format!("\"{dir}/vmlinuz\" {BOOT_OPTS} {union} {console}");
    if vars.get("bootmode") == Some("pw_reset") {
        linux.push(' ');
        linux.push_str(PW_RESET_INIT);
    }
    let initrd = format!("\"{dir}/initrd.img\"");
    MenuEntry {
        title: name.to_owned(),
        body: MenuentryBody {
            linux: &linux,
            initrd: &initrd,
            extra: Vec::new(),
        },
    }
    .to_string()
}

/// Write a fresh GRUB configuration below `root`.
///
/// The version list is created empty unless it already exists.
#[context("Installing GRUB configuration files")]
pub fn setup_grub(root: &Utf8Path, vars: &BootVars, modules: &[&str]) -> Result<()> {
    let grub = root.join(GRUB_DIR);
    write_atomic(&grub.join("grub.cfg"), TMPL_GRUB_MAIN)?;
    vars.write(root)?;
    write_modules(root, modules)?;
    write_atomic(&cfg_path(root, MENU_FILE), TMPL_GRUB_MENU)?;
    write_atomic(&cfg_path(root, OPTIONS_FILE), TMPL_GRUB_OPTS)?;
    let versions = cfg_path(root, VERSIONS_FILE);
    if !versions.exists() {
        write_atomic(&versions, "")?;
    }
    write_atomic(
        &grub.join(CFG_VERSION_FILE),
        format!("{GRUB_CFG_VERSION}\n"),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsers::grub_menuconfig::parse_grub_menuentry_file;

    #[test]
    fn test_vars() {
        let mut v = BootVars::new(ConsoleType::Serial);
        v.set("default", "1.4.0");
        v.set("timeout", "10");
        let s = v.render();
        similar_asserts::assert_eq!(
            s,
            indoc! { r#"
                set timeout="10"
                set console_type="ttyS"
                set console_num="0"
                set bootmode="normal"
                set default="1.4.0"
            "# }
        );
        assert_eq!(BootVars::parse(&s), v);
        let v = BootVars::parse("# comment\nset  default=plain\ninsmod ext2\n");
        assert_eq!(v.get("default"), Some("plain"));
        assert_eq!(v.get("timeout"), None);
    }

    #[test]
    fn test_console_choice() {
        assert_eq!(ConsoleType::from_choice("K"), Some(ConsoleType::Tty));
        assert_eq!(ConsoleType::from_choice("U").unwrap().as_str(), "ttyUSB");
        assert_eq!(ConsoleType::from_choice("k"), None);
    }

    #[test]
    fn test_render_entry() {
        let vars = BootVars::new(ConsoleType::Tty);
        similar_asserts::assert_eq!(
            render_entry("1.4.0", &vars),
            indoc! { r#"
                menuentry "1.4.0" {
                    linux "/boot/1.4.0/vmlinuz" boot=live rootdelay=5 noautologin net.ifnames=0 biosdevname=0 vyos-union=/boot/1.4.0 console=tty0
                    initrd "/boot/1.4.0/initrd.img"
                }
            "# }
        );
        let rendered = render_entry("1.4.0", &vars);
        let parsed = parse_grub_menuentry_file(&rendered)
            .unwrap()
            .remove(0);
        assert_eq!(parsed.title, "1.4.0");
        assert_eq!(parsed.body.initrd, "\"/boot/1.4.0/initrd.img\"");
        assert!(parsed.body.extra.is_empty());

        let mut vars = BootVars::new(ConsoleType::Serial);
        vars.set("bootmode", "pw_reset");
        let e = render_entry("my image", &vars);
        assert!(e.contains(r#"vyos-union=\"/boot/my image\" console=ttyS0,115200 init="#));
    }

    #[test]
    fn test_setup_grub() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        setup_grub(root, &BootVars::new(ConsoleType::Tty), &["part_gpt", "mdraid1x"]).unwrap();
        let grub = root.join(GRUB_DIR);
        assert!(grub.join("grub.cfg").exists());
        assert_eq!(read_cfg_version(root).unwrap(), Some(GRUB_CFG_VERSION));
        assert_eq!(
            std::fs::read_to_string(cfg_path(root, MODULES_FILE)).unwrap(),
            "insmod part_gpt\ninsmod mdraid1x\n"
        );
        assert_eq!(
            BootVars::read(root).unwrap().get("console_type"),
            Some("tty")
        );
        // Existing versions survive a rewrite
        std::fs::write(cfg_path(root, VERSIONS_FILE), "kept").unwrap();
        setup_grub(root, &BootVars::new(ConsoleType::Tty), &[]).unwrap();
        assert_eq!(
            std::fs::read_to_string(cfg_path(root, VERSIONS_FILE)).unwrap(),
            "kept"
        );
    }
}

//! # Command line interface
//!
//! `install` and `add` create images; `delete`, `set`, `rename` and `list`
//! manage the installed ones. Option names keep their historical
//! underscore spelling (`--image_path`, `--image_name`).

use std::ffi::OsString;
use std::sync::Arc;

use anyhow::{ensure, Result};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use crossterm::{cursor, execute};
use rustix::process::getuid;

use crate::add::add_image;
use crate::cleanup::cleanup;
use crate::config::Layout;
use crate::error::ImageError;
use crate::host::{Host, SystemHost};
use crate::install::install_image;
use crate::manage::{delete_image, list_images, rename_image, set_default_image};
use crate::prompt::{Interrupt, TerminalOperator};
use crate::registry::GrubRegistry;

/// Install and manage system images
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "sysimage", version)]
pub(crate) struct Opt {
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
enum Command {
    /// Install the running live system to permanent storage
    Install,
    /// Add an image to an installed system
    Add {
        /// Local path or URL of the image
        #[clap(long = "image_path")]
        image_path: String,
    },
    /// Delete an installed image
    Delete {
        /// Image to delete; asked for when omitted
        #[clap(long = "image_name")]
        image_name: Option<String>,
    },
    /// Set the image booted by default
    Set {
        /// Image to boot by default; asked for when omitted
        #[clap(long = "image_name")]
        image_name: Option<String>,
    },
    /// Rename an installed image
    Rename {
        /// Current name
        #[clap(long = "image_name")]
        image_name: String,
        /// New name
        #[clap(long = "image_new_name")]
        image_new_name: String,
    },
    /// List installed images
    List,
}

/// The storage root and the boot registry of the installed system.
fn open_installed(host: &impl Host) -> Result<(Utf8PathBuf, GrubRegistry)> {
    let root = host
        .find_persistence()?
        .ok_or(ImageError::PersistenceNotFound)?;
    let registry = GrubRegistry::open(&root, host.running_image()?)?;
    Ok((root, registry))
}

fn run_command(cmd: Command, operator: &TerminalOperator, layout: &Layout) -> Result<()> {
    let host = SystemHost;
    match cmd {
        Command::Install => install_image(&host, operator, layout, |root| {
            Ok(GrubRegistry::new(root, None))
        }),
        Command::Add { image_path } => add_image(&host, operator, layout, &image_path, |root| {
            GrubRegistry::open(root, host.running_image()?)
        }),
        Command::Delete { image_name } => {
            let (root, mut registry) = open_installed(&host)?;
            delete_image(&mut registry, operator, &root, image_name.as_deref())
        }
        Command::Set { image_name } => {
            let (_, mut registry) = open_installed(&host)?;
            set_default_image(&mut registry, operator, image_name.as_deref())
        }
        Command::Rename {
            image_name,
            image_new_name,
        } => {
            let (root, mut registry) = open_installed(&host)?;
            rename_image(&mut registry, operator, &root, &image_name, &image_new_name)
        }
        Command::List => {
            let (_, registry) = open_installed(&host)?;
            for name in list_images(&registry)? {
                println!("{name}");
            }
            Ok(())
        }
    }
}

/// Release whatever an interrupted command left behind.
fn release_interrupted(layout: &Layout) {
    // Prompts hide the cursor while active
    if let Err(e) = execute!(std::io::stdout(), cursor::Show) {
        tracing::warn!("Restoring cursor: {e}");
    }
    if let Err(e) = cleanup(&SystemHost, layout, &[], &[]) {
        tracing::warn!("{e}");
    }
}

/// Parse the provided arguments and execute.
///
/// The command runs on a blocking thread. Ctrl+C stops it at its next
/// question or step, after which it releases what it acquired; an
/// operator who chose to stop is not an error.
pub async fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    let opt = Opt::parse_from(args);
    ensure!(getuid().is_root(), "Must run as the root user");
    let layout = Layout::load()?;

    let interrupt = Arc::new(Interrupt::default());
    let operator = TerminalOperator::new(Arc::clone(&interrupt));
    let worker_layout = layout.clone();
    let mut work =
        tokio::task::spawn_blocking(move || run_command(opt.cmd, &operator, &worker_layout));
    let r = tokio::select! {
        r = &mut work => r?,
        r = tokio::signal::ctrl_c() => {
            r?;
            println!("\nStopped by Ctrl+C");
            if let Some(_held) = interrupt.request() {
                // The command is parked at a question until the process exits
                release_interrupted(&layout);
                std::process::exit(0)
            }
            work.await?
        }
    };
    match r {
        Err(e) if ImageError::is_aborted(&e) => {
            tracing::debug!("{e:#}");
            Ok(())
        }
        r => r,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootloader::{setup_grub, BootVars, ConsoleType};
    use crate::registry::BootRegistry;
    use crate::testutils::FakeHost;

    fn parse(args: &[&str]) -> Command {
        Opt::try_parse_from(std::iter::once("sysimage").chain(args.iter().copied()))
            .unwrap()
            .cmd
    }

    #[test]
    fn test_parse() {
        assert_eq!(parse(&["install"]), Command::Install);
        assert_eq!(
            parse(&["add", "--image_path", "https://example.com/vyos.iso"]),
            Command::Add {
                image_path: "https://example.com/vyos.iso".into()
            }
        );
        assert_eq!(
            parse(&["delete"]),
            Command::Delete { image_name: None }
        );
        assert_eq!(
            parse(&["set", "--image_name", "1.4"]),
            Command::Set {
                image_name: Some("1.4".into())
            }
        );
        assert_eq!(
            parse(&["rename", "--image_name", "1.4", "--image_new_name", "stable"]),
            Command::Rename {
                image_name: "1.4".into(),
                image_new_name: "stable".into()
            }
        );
        assert_eq!(parse(&["list"]), Command::List);
    }

    #[test]
    fn test_open_installed() {
        let host = FakeHost::new();
        let storage = host.path("storage");
        let host = host.installed("1.4.0", &storage);
        setup_grub(&storage, &BootVars::new(ConsoleType::Tty), &[]).unwrap();
        let (root, registry) = open_installed(&host).unwrap();
        assert_eq!(root, storage);
        assert_eq!(registry.running_image(), Some("1.4.0"));

        let e = open_installed(&FakeHost::new()).unwrap_err();
        assert!(matches!(
            ImageError::find(&e),
            Some(ImageError::PersistenceNotFound)
        ));
    }

    #[test]
    fn test_parse_rejects() {
        let bad: &[&[&str]] = &[
            &["add"],
            &["rename", "--image_name", "1.4"],
            &["install", "--image_path", "x"],
            &["upgrade"],
        ];
        for args in bad {
            let r = Opt::try_parse_from(std::iter::once("sysimage").chain(args.iter().copied()));
            assert!(r.is_err(), "{args:?}");
        }
    }
}

//! # System image installer and manager
//!
//! Installs a system from live media onto local storage (optionally
//! mirrored over two disks), adds further images to an installed system,
//! and manages the set of installed images and the default boot entry.
//!
//! Everything touching the machine goes through [`host::Host`] and every
//! question goes through [`prompt::Operator`], so the orchestration in
//! [`install`], [`add`] and [`manage`] can be exercised against fakes.

pub mod add;
mod bootloader;
mod checksum;
mod cleanup;
pub mod cli;
pub mod config;
mod configtree;
pub mod disks;
pub mod error;
pub mod host;
mod image;
pub mod install;
mod kernel_cmdline;
pub mod manage;
mod parsers;
pub mod partition;
pub mod prompt;
pub mod raid;
pub mod registry;
mod sigverify;
mod task;
mod utils;

#[cfg(test)]
mod testutils;

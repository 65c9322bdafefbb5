//! Parsers for configuration files written by other tools.

pub(crate) mod grub_menuconfig;

//! Kernel command line parsing utilities.
//!
//! The running image and the boot mode are both derived from the kernel
//! command line: live media boot with `boot=live`, installed images add
//! `vyos-union=/boot/<name>` pointing at their boot directory.

use std::borrow::Cow;

use anyhow::{Context, Result};

/// Names the boot directory of an installed image.
pub(crate) const UNION_ARG: &str = "vyos-union";
/// Set by the live-boot initramfs.
pub(crate) const BOOT_ARG: &str = "boot";

/// A parsed kernel command line.
#[derive(Debug)]
pub(crate) struct Cmdline<'a>(Cow<'a, str>);

impl<'a, T: AsRef<str> + ?Sized> From<&'a T> for Cmdline<'a> {
    fn from(input: &'a T) -> Self {
        Self(Cow::Borrowed(input.as_ref()))
    }
}

/// A single `key` or `key=value` parameter.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Parameter<'a> {
    /// The parameter key
    pub key: &'a str,
    /// The parameter value, if present
    pub value: Option<&'a str>,
}

impl<'a> Parameter<'a> {
    /// Splits on the first `=`; only the outermost pair of double quotes
    /// is stripped from the value.
    fn parse(input: &'a str) -> Self {
        match input.split_once('=') {
            None => Self {
                key: input,
                value: None,
            },
            Some((key, value)) => {
                let value = value
                    .strip_prefix('"')
                    .and_then(|v| v.strip_suffix('"'))
                    .unwrap_or(value);
                Self {
                    key,
                    value: Some(value),
                }
            }
        }
    }

    /// Keys compare with dashes and underscores treated as equivalent.
    fn key_matches(&self, key: &str) -> bool {
        let dedash = |c: char| if c == '-' { '_' } else { c };
        self.key.len() == key.len() && self.key.chars().map(dedash).eq(key.chars().map(dedash))
    }
}

impl<'a> Cmdline<'a> {
    /// Reads the kernel command line from `/proc/cmdline`.
    pub(crate) fn from_proc() -> Result<Self> {
        let s = std::fs::read_to_string("/proc/cmdline").context("Reading /proc/cmdline")?;
        Ok(Self(Cow::Owned(s)))
    }

    /// Iterate over parameters, splitting on whitespace outside double quotes.
    pub(crate) fn iter(&'a self) -> impl Iterator<Item = Parameter<'a>> + 'a {
        let mut in_quotes = false;
        self.0
            .split(move |c: char| {
                if c == '"' {
                    in_quotes = !in_quotes;
                }
                !in_quotes && c.is_ascii_whitespace()
            })
            .filter(|p| !p.is_empty())
            .map(Parameter::parse)
    }

    /// The value of the first parameter named `key`.
    pub(crate) fn value_of(&'a self, key: &str) -> Option<&'a str> {
        self.iter().find(|p| p.key_matches(key)).and_then(|p| p.value)
    }

    /// The image named by `vyos-union=/boot/<name>`, if any.
    pub(crate) fn running_image(&'a self) -> Option<&'a str> {
        let union = self.value_of(UNION_ARG)?;
        union
            .trim_end_matches('/')
            .rsplit_once('/')
            .map(|(_, name)| name)
            .filter(|name| !name.is_empty())
    }

    /// Live media boot: `boot=live` without an installed image union.
    pub(crate) fn is_live_boot(&'a self) -> bool {
        self.value_of(BOOT_ARG) == Some("live") && self.value_of(UNION_ARG).is_none()
    }
}

//! Enumerate disks which are large enough to install onto.

use anyhow::Result;
use camino::Utf8PathBuf;

use crate::error::ImageError;
use crate::host::Host;
use crate::prompt::Operator;

/// Disks smaller than this (2 GiB) are never offered.
pub const MIN_DISK_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// A whole disk found on the system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageDevice {
    /// Kernel name, e.g. `sda`
    pub name: String,
    /// Device node
    pub path: Utf8PathBuf,
    /// Size in bytes
    pub size: u64,
}

impl StorageDevice {
    /// A device named `name` under `/dev`.
    pub fn new(name: &str, size: u64) -> Self {
        Self {
            name: name.to_owned(),
            path: Utf8PathBuf::from(format!("/dev/{name}")),
            size,
        }
    }

    /// How the device is shown to the operator.
    pub(crate) fn describe(&self) -> String {
        format!("{} ({} GB)", self.name, format_gb(self.size))
    }
}

/// Bytes as GiB, rounded to one decimal.
pub(crate) fn format_gb(bytes: u64) -> String {
    format!("{:.1}", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
}

fn filter_candidates(disks: Vec<StorageDevice>) -> Vec<StorageDevice> {
    disks
        .into_iter()
        .filter(|d| {
            let r = d.size >= MIN_DISK_SIZE;
            if !r {
                tracing::debug!("Skipping {}: too small ({} bytes)", d.name, d.size);
            }
            r
        })
        .collect()
}

/// Return every disk of at least [`MIN_DISK_SIZE`], in discovery order.
///
/// An empty result is an error: there is nothing to install onto.
pub fn list_candidate_disks(host: &impl Host, operator: &impl Operator) -> Result<Vec<StorageDevice>> {
    operator.message("Probing disks");
    let disks = filter_candidates(host.list_disks()?);
    if disks.is_empty() {
        return Err(ImageError::NoSuitableDisk.into());
    }
    operator.message(&format!("{} disk(s) found", disks.len()));
    Ok(disks)
}

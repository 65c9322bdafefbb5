//! Error types raised by the install, add and lifecycle flows.

use camino::Utf8PathBuf;

/// Missing checksum manifest; either a corrupted artifact or one from an
/// older release line whose tooling we must not install.
pub(crate) const MSG_ERR_IMPROPER_IMAGE: &str = "Missing sha256sum.txt.\nEither this image is corrupted, or of era 1.2.x (md5sum) and would downgrade image tools;\ndisallowed in either case.";

/// Conditions that abort an image operation.
///
/// These are raised as [`anyhow::Error`] and classified by callers with
/// `downcast_ref::<ImageError>()`.
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    /// No disk meets the minimum size.
    #[error("No suitable disk was found. There must be at least one disk of 2GB or greater size.")]
    NoSuitableDisk,
    /// Install was requested from an installed system.
    #[error("The system is already installed. Please use \"add\" instead.")]
    NotLiveEnvironment,
    /// Add was requested from a live system.
    #[error("The system is in live-boot mode. Please use \"install\" instead.")]
    NotInstalledEnvironment,
    /// The artifact has no checksum manifest.
    #[error("{}", MSG_ERR_IMPROPER_IMAGE)]
    ImproperImage,
    /// A file listed in the checksum manifest does not match.
    #[error("Image checksum verification failed for {0}")]
    ChecksumMismatch(String),
    /// The artifact carries older image tooling than the running system.
    #[error("Adding image would downgrade image tools to v.{found} (installed v.{installed}); disallowed")]
    Downgrade {
        /// Tooling version inside the artifact
        found: u32,
        /// Tooling version of the running system
        installed: u32,
    },
    /// The name does not satisfy the naming rule.
    #[error("The image name \"{0}\" is not allowed")]
    NameValidation(String),
    /// The image is already the default.
    #[error("The image \"{0}\" already configured as default")]
    AlreadyDefault(String),
    /// The image is not in the registry.
    #[error("The image \"{0}\" cannot be found")]
    UnknownImage(String),
    /// The running image may not be deleted or renamed.
    #[error("Currently running image cannot be {0}; reboot into another image first")]
    RunningImageProtected(&'static str),
    /// The default image may not be deleted.
    #[error("Default image cannot be deleted; set another image as default first")]
    DefaultImageProtected,
    /// The name is already used by another image.
    #[error("The image \"{0}\" already exists")]
    NameCollision(String),
    /// The artifact could not be downloaded, or the local path is not a file.
    #[error("The image cannot be fetched from: {0}")]
    FetchFailed(String),
    /// The operator refused to continue with a missing or invalid signature.
    #[error("Refusing to continue with an unverified image")]
    UnverifiedImage,
    /// No persistent root storage is mounted.
    #[error("Persistence storage cannot be found")]
    PersistenceNotFound,
    /// The operator chose to stop. Not a failure.
    #[error("Operation cancelled by the operator")]
    Aborted,
}

impl ImageError {
    /// True if `err` is an [`ImageError::Aborted`] anywhere in its chain.
    pub fn is_aborted(err: &anyhow::Error) -> bool {
        err.chain().any(|e| {
            matches!(
                e.downcast_ref::<ImageError>(),
                Some(ImageError::Aborted)
            )
        })
    }

    /// Find an [`ImageError`] anywhere in the chain of `err`.
    pub fn find(err: &anyhow::Error) -> Option<&ImageError> {
        err.chain().find_map(|e| e.downcast_ref::<ImageError>())
    }
}

/// A single failed step of a cleanup pass.
#[derive(Debug)]
pub enum CleanupFailure {
    /// A mountpoint could not be unmounted.
    Unmount(Utf8PathBuf, String),
    /// A path could not be removed.
    Remove(Utf8PathBuf, String),
}

impl std::fmt::Display for CleanupFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CleanupFailure::Unmount(p, e) => write!(f, "unmounting {p}: {e}"),
            CleanupFailure::Remove(p, e) => write!(f, "removing {p}: {e}"),
        }
    }
}

/// Every step that failed during a best-effort cleanup pass.
#[derive(Debug, thiserror::Error)]
#[error("Cleanup failed: {}", .failures.iter().map(|f| f.to_string()).collect::<Vec<_>>().join("; "))]
pub struct CleanupError {
    /// The individual failures, in the order they happened
    pub failures: Vec<CleanupFailure>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_classify() {
        let e = anyhow::Error::from(ImageError::Aborted).context("Installing image");
        assert!(ImageError::is_aborted(&e));
        let e: anyhow::Error = Err::<(), _>(ImageError::DefaultImageProtected)
            .context("Deleting image")
            .unwrap_err();
        assert!(!ImageError::is_aborted(&e));
        assert!(matches!(
            ImageError::find(&e),
            Some(ImageError::DefaultImageProtected)
        ));
    }

    #[test]
    fn test_cleanup_error_display() {
        let e = CleanupError {
            failures: vec![
                CleanupFailure::Unmount("/mnt/installation/disk_dst".into(), "busy".into()),
                CleanupFailure::Remove("/mnt/installation".into(), "denied".into()),
            ],
        };
        assert_eq!(
            e.to_string(),
            "Cleanup failed: unmounting /mnt/installation/disk_dst: busy; removing /mnt/installation: denied"
        );
    }
}

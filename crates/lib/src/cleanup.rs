//! Best-effort release of mounts and temporary paths.

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};

use crate::config::Layout;
use crate::error::{CleanupError, CleanupFailure};
use crate::host::{Host, Operation};
use crate::utils::remove_path;

fn push_unique(v: &mut Vec<Utf8PathBuf>, p: &Utf8Path) {
    if !v.iter().any(|x| x == p) {
        v.push(p.to_owned());
    }
}

/// Unmount `mounts` and remove `remove`, plus everything mounted below the
/// staging root, the staging root itself and any downloaded artifact.
///
/// Every unmount is attempted before any removal, deepest mountpoint first.
/// A path is not removed while a mount below it could not be released.
/// Missing paths and mountpoints that are not mounted are skipped, so this
/// is safe to run repeatedly.
pub fn cleanup(
    host: &impl Host,
    layout: &Layout,
    mounts: &[Utf8PathBuf],
    remove: &[Utf8PathBuf],
) -> Result<(), CleanupError> {
    let mut failures = Vec::new();

    let mut targets = Vec::new();
    for root in mounts.iter().map(|p| p.as_path()).chain([layout.staging_root.as_path()]) {
        match host.mounts_under(root) {
            Ok(found) => found.iter().for_each(|m| push_unique(&mut targets, m)),
            Err(e) => failures.push(CleanupFailure::Unmount(root.to_owned(), format!("{e:#}"))),
        }
    }
    targets.sort_by_key(|p| std::cmp::Reverse(p.components().count()));

    let mut busy = Vec::new();
    for target in targets {
        tracing::debug!("Unmounting {target}");
        if let Err(e) = host.execute(&Operation::Unmount {
            target: target.clone(),
        }) {
            failures.push(CleanupFailure::Unmount(target.clone(), format!("{e:#}")));
            busy.push(target);
        }
    }

    let mut paths = Vec::new();
    for p in remove {
        push_unique(&mut paths, p);
    }
    push_unique(&mut paths, &layout.staging_root);
    push_unique(&mut paths, &layout.download_path);
    for path in paths {
        if let Some(m) = busy.iter().find(|m| m.starts_with(&path)) {
            failures.push(CleanupFailure::Remove(
                path.clone(),
                format!("{m} is still mounted"),
            ));
            continue;
        }
        tracing::debug!("Removing {path}");
        if let Err(e) = remove_path(&path) {
            failures.push(CleanupFailure::Remove(path, format!("{e:#}")));
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(CleanupError { failures })
    }
}

/// Tracks what an orchestration acquired so it is released on every exit path.
///
/// Dropping the guard runs [`cleanup`] and logs any failure; [`Teardown::finish`]
/// runs it and reports the failure instead.
#[derive(Debug)]
pub(crate) struct Teardown<'a, H: Host> {
    host: &'a H,
    layout: &'a Layout,
    mounts: Vec<Utf8PathBuf>,
    paths: Vec<Utf8PathBuf>,
    done: bool,
}

impl<'a, H: Host> Teardown<'a, H> {
    pub(crate) fn new(host: &'a H, layout: &'a Layout) -> Self {
        Self {
            host,
            layout,
            mounts: Vec::new(),
            paths: Vec::new(),
            done: false,
        }
    }

    /// Mount `source` on `target` and remember to unmount it.
    pub(crate) fn mount(
        &mut self,
        source: &Utf8Path,
        target: &Utf8Path,
        fstype: Option<&str>,
        read_only: bool,
    ) -> Result<()> {
        self.host.execute(&Operation::Mount {
            source: source.to_owned(),
            target: target.to_owned(),
            fstype: fstype.map(ToOwned::to_owned),
            read_only,
        })?;
        push_unique(&mut self.mounts, target);
        Ok(())
    }

    /// Unmount a mount made through [`Self::mount`] ahead of teardown.
    pub(crate) fn unmount(&mut self, target: &Utf8Path) -> Result<()> {
        self.host.execute(&Operation::Unmount {
            target: target.to_owned(),
        })?;
        self.mounts.retain(|m| m != target);
        Ok(())
    }

    /// Remove `path` at teardown.
    pub(crate) fn remove_later(&mut self, path: &Utf8Path) {
        push_unique(&mut self.paths, path);
    }

    fn run(&mut self) -> Result<(), CleanupError> {
        self.done = true;
        cleanup(self.host, self.layout, &self.mounts, &self.paths)
    }

    /// Release everything now.
    pub(crate) fn finish(mut self) -> Result<(), CleanupError> {
        self.run()
    }
}

impl<H: Host> Drop for Teardown<'_, H> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Err(e) = self.run() {
            tracing::warn!("{e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::FakeHost;

    #[test]
    fn test_cleanup_discovers_staging() {
        let host = FakeHost::new();
        let layout = host.layout();
        let disk = layout.disk_dst();
        let efi = disk.join("boot/efi");
        host.execute(&Operation::Mount {
            source: "/dev/sda3".into(),
            target: disk.clone(),
            fstype: None,
            read_only: false,
        })
        .unwrap();
        host.execute(&Operation::Mount {
            source: "/dev/sda2".into(),
            target: efi.clone(),
            fstype: None,
            read_only: false,
        })
        .unwrap();
        std::fs::write(&layout.download_path, "iso").unwrap();

        cleanup(&host, &layout, &[], &[]).unwrap();
        assert!(host.mounted().is_empty());
        assert!(!layout.staging_root.exists());
        assert!(!layout.download_path.exists());
        let unmounts: Vec<_> = host
            .operations()
            .into_iter()
            .filter_map(|o| match o {
                Operation::Unmount { target } => Some(target),
                _ => None,
            })
            .collect();
        assert_eq!(unmounts, [efi, disk]);

        // Nothing left to do the second time
        cleanup(&host, &layout, &[], &[]).unwrap();
    }

    #[test]
    fn test_busy_mount_blocks_removal() {
        let host = FakeHost::new();
        let layout = host.layout();
        let iso = layout.iso_mount();
        host.execute(&Operation::Mount {
            source: layout.download_path.clone(),
            target: iso.clone(),
            fstype: Some("iso9660".into()),
            read_only: true,
        })
        .unwrap();
        host.fail_when(|op| matches!(op, Operation::Unmount { .. }));
        let extra = host.path("other");
        std::fs::create_dir(&extra).unwrap();

        let e = cleanup(&host, &layout, &[], &[extra.clone()]).unwrap_err();
        assert_eq!(e.failures.len(), 2);
        assert!(matches!(&e.failures[0], CleanupFailure::Unmount(p, _) if *p == iso));
        assert!(
            matches!(&e.failures[1], CleanupFailure::Remove(p, _) if *p == layout.staging_root)
        );
        assert!(!extra.exists());
        assert!(iso.exists());
    }

    #[test]
    fn test_teardown_on_drop() {
        let host = FakeHost::new();
        let layout = host.layout();
        let scratch = host.path("scratch");
        {
            let mut t = Teardown::new(&host, &layout);
            t.mount(Utf8Path::new("/dev/sda3"), &layout.disk_dst(), None, false)
                .unwrap();
            std::fs::create_dir(&scratch).unwrap();
            t.remove_later(&scratch);
        }
        assert!(host.mounted().is_empty());
        assert!(!scratch.exists());
        assert!(!layout.staging_root.exists());
    }

    #[test]
    fn test_teardown_early_unmount() {
        let host = FakeHost::new();
        let layout = host.layout();
        let mut t = Teardown::new(&host, &layout);
        let target = layout.root_src();
        t.mount(Utf8Path::new("/images/fs.squashfs"), &target, Some("squashfs"), true)
            .unwrap();
        t.unmount(&target).unwrap();
        assert!(host.mounted().is_empty());
        t.finish().unwrap();
        let unmounts = host
            .operations()
            .iter()
            .filter(|o| matches!(o, Operation::Unmount { .. }))
            .count();
        assert_eq!(unmounts, 1);
    }
}

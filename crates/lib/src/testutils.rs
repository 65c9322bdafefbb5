//! In-memory stand-ins for the machine, the operator and the boot registry.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use anyhow::{bail, Result};
use camino::{Utf8Path, Utf8PathBuf};

use sysimage_blockdev::{partition_path, PartitionRole, EFI_PARTNO, ROOT_PARTNO};

use crate::config::Layout;
use crate::disks::StorageDevice;
use crate::host::{Host, Operation, Outcome, SignatureTool};
use crate::prompt::{Interrupt, Operator};
use crate::registry::BootRegistry;
use crate::utils::{copy_tree, remove_path};

/// What the fake hashes every password to.
pub(crate) const FAKE_HASH: &str = "$6$fakesalt$fakehash";

struct Mounted {
    source: Utf8PathBuf,
    target: Utf8PathBuf,
    read_only: bool,
}

/// A [`Host`] which records operations and simulates mounts with directories.
///
/// Every mount source is backed by a directory. Mounting copies it to the
/// target; unmounting a writable mount copies the target back and empties it.
pub(crate) struct FakeHost {
    _td: tempfile::TempDir,
    root: Utf8PathBuf,
    disks: Vec<StorageDevice>,
    ops: RefCell<Vec<Operation>>,
    mounts: RefCell<Vec<Mounted>>,
    live: Cell<bool>,
    running: RefCell<Option<String>>,
    persistence: RefCell<Option<Utf8PathBuf>>,
    downloads: RefCell<HashMap<String, Vec<u8>>>,
    trusted: RefCell<Vec<SignatureTool>>,
    checks: RefCell<Vec<SignatureTool>>,
    fail: RefCell<Option<Box<dyn Fn(&Operation) -> bool>>>,
}

impl FakeHost {
    pub(crate) fn new() -> Self {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(td.path().to_path_buf()).unwrap();
        Self {
            _td: td,
            root,
            disks: Vec::new(),
            ops: Default::default(),
            mounts: Default::default(),
            live: Cell::new(true),
            running: Default::default(),
            persistence: Default::default(),
            downloads: Default::default(),
            trusted: Default::default(),
            checks: Default::default(),
            fail: Default::default(),
        }
    }

    pub(crate) fn with_disks(mut self, disks: Vec<StorageDevice>) -> Self {
        self.disks = disks;
        self
    }

    /// An installed system running `image` with storage at `storage`.
    pub(crate) fn installed(self, image: &str, storage: &Utf8Path) -> Self {
        self.live.set(false);
        *self.running.borrow_mut() = Some(image.to_owned());
        *self.persistence.borrow_mut() = Some(storage.to_owned());
        self
    }

    /// A path inside the private temporary directory.
    pub(crate) fn path(&self, rel: &str) -> Utf8PathBuf {
        self.root.join(rel)
    }

    /// A layout with every location inside the private temporary directory.
    pub(crate) fn layout(&self) -> Layout {
        Layout {
            staging_root: self.path("installation"),
            system_root: self.path("system"),
            kernel_dir: self.path("system/boot"),
            running_rootfs: self.path("medium/live/filesystem.squashfs"),
            download_path: self.path("vyos_installation.iso"),
            minisign_keys: vec![self.path("keys/release.pub"), self.path("keys/backup.pub")],
            config_group: None,
            ..Default::default()
        }
    }

    /// The directory backing mount source `source`.
    pub(crate) fn device_dir(&self, source: &Utf8Path) -> Utf8PathBuf {
        let name = source.as_str().trim_start_matches('/').replace('/', "_");
        let dir = self.root.join("devices").join(name);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    pub(crate) fn add_download(&self, url: &str, contents: impl Into<Vec<u8>>) {
        self.downloads
            .borrow_mut()
            .insert(url.to_owned(), contents.into());
    }

    pub(crate) fn trust(&self, tool: SignatureTool) {
        self.trusted.borrow_mut().push(tool);
    }

    /// Make every operation matching `f` fail.
    pub(crate) fn fail_when(&self, f: impl Fn(&Operation) -> bool + 'static) {
        *self.fail.borrow_mut() = Some(Box::new(f));
    }

    pub(crate) fn operations(&self) -> Vec<Operation> {
        self.ops.borrow().clone()
    }

    /// Current mounts as (source, target).
    pub(crate) fn mounted(&self) -> Vec<(Utf8PathBuf, Utf8PathBuf)> {
        self.mounts
            .borrow()
            .iter()
            .map(|m| (m.source.clone(), m.target.clone()))
            .collect()
    }

    pub(crate) fn signature_checks(&self) -> Vec<SignatureTool> {
        self.checks.borrow().clone()
    }

    fn mount(&self, source: &Utf8Path, target: &Utf8Path, read_only: bool) -> Result<()> {
        if self.mounts.borrow().iter().any(|m| m.target == target) {
            bail!("{target} is already mounted");
        }
        let backing = self.device_dir(source);
        copy_tree(&backing, target)?;
        self.mounts.borrow_mut().push(Mounted {
            source: source.to_owned(),
            target: target.to_owned(),
            read_only,
        });
        Ok(())
    }

    fn unmount(&self, target: &Utf8Path) -> Result<()> {
        let mut mounts = self.mounts.borrow_mut();
        let Some(i) = mounts.iter().position(|m| m.target == target) else {
            bail!("{target} is not mounted");
        };
        let m = mounts.remove(i);
        drop(mounts);
        if !m.read_only {
            let backing = self.device_dir(&m.source);
            remove_path(&backing)?;
            copy_tree(target, &backing)?;
        }
        remove_path(target)?;
        std::fs::create_dir_all(target)?;
        Ok(())
    }
}

impl Host for FakeHost {
    fn execute(&self, op: &Operation) -> Result<Outcome> {
        self.ops.borrow_mut().push(op.clone());
        if let Some(f) = self.fail.borrow().as_ref() {
            if f(op) {
                bail!("Injected failure: {op}");
            }
        }
        match op {
            Operation::CreatePartitionTable { device, .. } => {
                let parts = [
                    (PartitionRole::Efi, partition_path(device, EFI_PARTNO)),
                    (PartitionRole::Root, partition_path(device, ROOT_PARTNO)),
                ];
                return Ok(Outcome::Partitions(parts.into_iter().collect()));
            }
            Operation::CreateRaid1 { .. } => return Ok(Outcome::Array("/dev/md0".into())),
            Operation::Mount {
                source,
                target,
                read_only,
                ..
            } => self.mount(source, target, *read_only)?,
            Operation::Unmount { target } => self.unmount(target)?,
            _ => {}
        }
        Ok(Outcome::Done)
    }

    fn list_disks(&self) -> Result<Vec<StorageDevice>> {
        Ok(self.disks.clone())
    }

    fn mounts_under(&self, prefix: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
        let mut r: Vec<Utf8PathBuf> = self
            .mounts
            .borrow()
            .iter()
            .filter(|m| m.target.starts_with(prefix))
            .map(|m| m.target.clone())
            .collect();
        r.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
        Ok(r)
    }

    fn is_live_boot(&self) -> Result<bool> {
        Ok(self.live.get())
    }

    fn running_image(&self) -> Result<Option<String>> {
        Ok(self.running.borrow().clone())
    }

    fn find_persistence(&self) -> Result<Option<Utf8PathBuf>> {
        Ok(self.persistence.borrow().clone())
    }

    fn download(&self, url: &str, dest: &Utf8Path) -> Result<()> {
        let Some(contents) = self.downloads.borrow().get(url).cloned() else {
            bail!("404 Not Found: {url}");
        };
        std::fs::write(dest, contents)?;
        Ok(())
    }

    fn check_signature(
        &self,
        tool: &SignatureTool,
        _file: &Utf8Path,
        signature: &Utf8Path,
    ) -> Result<bool> {
        assert!(signature.exists(), "{signature} missing");
        self.checks.borrow_mut().push(tool.clone());
        Ok(self.trusted.borrow().contains(tool))
    }

    fn hash_password(&self, _plaintext: &str) -> Result<String> {
        Ok(FAKE_HASH.to_owned())
    }
}

/// One scripted operator answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Answer {
    Confirm(bool),
    /// Free text; empty means "accept the default"
    Text(String),
    Select(usize),
}

/// An [`Operator`] answering from a script; running out of answers is an error.
#[derive(Debug, Default)]
pub(crate) struct ScriptedOperator {
    answers: RefCell<VecDeque<Answer>>,
    prompts: RefCell<Vec<String>>,
    messages: RefCell<Vec<String>>,
    interrupt: Rc<Interrupt>,
    interrupt_at: Option<usize>,
    answered: Cell<usize>,
}

impl ScriptedOperator {
    pub(crate) fn new(answers: impl IntoIterator<Item = Answer>) -> Self {
        Self {
            answers: RefCell::new(answers.into_iter().collect()),
            ..Default::default()
        }
    }

    /// Press Ctrl+C while the `n`th question (from 1) is waiting for its answer.
    pub(crate) fn interrupt_at(mut self, n: usize) -> Self {
        self.interrupt_at = Some(n);
        self
    }

    /// The stop request this operator honours, for interrupting from elsewhere.
    pub(crate) fn interrupt(&self) -> Rc<Interrupt> {
        Rc::clone(&self.interrupt)
    }

    fn next(&self, prompt: &str) -> Result<Answer> {
        self.prompts.borrow_mut().push(prompt.to_owned());
        self.interrupt.prompt(|| {
            let Some(a) = self.answers.borrow_mut().pop_front() else {
                bail!("Unexpected prompt: {prompt}");
            };
            let n = self.answered.get() + 1;
            self.answered.set(n);
            if self.interrupt_at == Some(n) {
                drop(self.interrupt.request());
            }
            Ok(a)
        })
    }

    fn next_text(&self, prompt: &str) -> Result<String> {
        match self.next(prompt)? {
            Answer::Text(s) => Ok(s),
            a => bail!("Expected text for {prompt:?}, scripted {a:?}"),
        }
    }

    /// Everything passed to [`Operator::message`].
    pub(crate) fn messages(&self) -> Vec<String> {
        self.messages.borrow().clone()
    }

    /// Every question asked, in order.
    pub(crate) fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }

    /// Answers not consumed.
    pub(crate) fn remaining(&self) -> usize {
        self.answers.borrow().len()
    }
}

impl Operator for ScriptedOperator {
    fn confirm(&self, prompt: &str, _default: bool) -> Result<bool> {
        match self.next(prompt)? {
            Answer::Confirm(b) => Ok(b),
            a => bail!("Expected yes/no for {prompt:?}, scripted {a:?}"),
        }
    }

    fn input(&self, prompt: &str, default: Option<&str>) -> Result<String> {
        let s = self.next_text(prompt)?;
        match default {
            Some(d) if s.is_empty() => Ok(d.to_owned()),
            _ => Ok(s),
        }
    }

    fn input_from(&self, prompt: &str, default: &str, valid: &[&str]) -> Result<String> {
        loop {
            let s = self.next_text(prompt)?;
            let s = if s.is_empty() { default.to_owned() } else { s };
            if valid.contains(&s.as_str()) {
                return Ok(s);
            }
        }
    }

    fn password(&self, prompt: &str, default: &str) -> Result<String> {
        let s = self.next_text(prompt)?;
        Ok(if s.is_empty() { default.to_owned() } else { s })
    }

    fn select(&self, _title: &str, prompt: &str, items: &[String]) -> Result<usize> {
        match self.next(prompt)? {
            Answer::Select(i) if i < items.len() => Ok(i),
            a => bail!("Invalid selection for {prompt:?}: {a:?}"),
        }
    }

    fn message(&self, text: &str) {
        self.messages.borrow_mut().push(text.to_owned());
    }

    fn checkpoint(&self) -> Result<()> {
        self.interrupt.check()
    }
}

/// A [`BootRegistry`] held in memory.
#[derive(Debug, Default)]
pub(crate) struct FakeRegistry {
    pub(crate) names: Vec<String>,
    pub(crate) default: Option<String>,
    pub(crate) running: Option<String>,
    pub(crate) refreshes: usize,
    pub(crate) fail_refresh: bool,
    pub(crate) fail_set_default: bool,
}

impl FakeRegistry {
    pub(crate) fn new<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            names: names.into_iter().map(ToOwned::to_owned).collect(),
            ..Default::default()
        }
    }

    pub(crate) fn with_default(mut self, name: &str) -> Self {
        self.default = Some(name.to_owned());
        self
    }

    pub(crate) fn with_running(mut self, name: &str) -> Self {
        self.running = Some(name.to_owned());
        self
    }
}

impl BootRegistry for FakeRegistry {
    fn list(&self) -> Result<Vec<String>> {
        Ok(self.names.clone())
    }

    fn default_image(&self) -> Result<Option<String>> {
        Ok(self.default.clone())
    }

    fn running_image(&self) -> Option<&str> {
        self.running.as_deref()
    }

    fn add(&mut self, name: &str) -> Result<()> {
        if !self.names.iter().any(|n| n == name) {
            self.names.push(name.to_owned());
        }
        Ok(())
    }

    fn remove(&mut self, name: &str) -> Result<()> {
        self.names.retain(|n| n != name);
        Ok(())
    }

    fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        if let Some(n) = self.names.iter_mut().find(|n| *n == old) {
            *n = new.to_owned();
        }
        Ok(())
    }

    fn set_default(&mut self, name: &str) -> Result<()> {
        if self.fail_set_default {
            bail!("set_default failed");
        }
        self.default = Some(name.to_owned());
        Ok(())
    }

    fn refresh(&mut self) -> Result<()> {
        self.refreshes += 1;
        if self.fail_refresh {
            bail!("refresh failed");
        }
        Ok(())
    }
}

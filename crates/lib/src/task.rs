use std::{
    ffi::OsStr,
    process::{Command, Stdio},
};

use anyhow::{Context, Result};
use sysimage_utils::CommandRunExt;

/// A described external command. The description is printed before
/// the command runs, unless the task is quiet.
#[derive(Debug)]
pub(crate) struct Task {
    description: String,
    quiet: bool,
    quiet_output: bool,
    pub(crate) cmd: Command,
}

impl Task {
    pub(crate) fn new(description: impl AsRef<str>, exe: impl AsRef<str>) -> Self {
        Self::new_cmd(description, Command::new(exe.as_ref()))
    }

    pub(crate) fn new_cmd(description: impl AsRef<str>, mut cmd: Command) -> Self {
        let description = description.as_ref().to_string();
        // Default to noninteractive
        cmd.stdin(Stdio::null());
        Self {
            description,
            quiet: false,
            quiet_output: false,
            cmd,
        }
    }

    pub(crate) fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    // Do not print stdout
    pub(crate) fn quiet_output(mut self) -> Self {
        self.quiet_output = true;
        self
    }

    pub(crate) fn args<S: AsRef<OsStr>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.cmd.args(args);
        self
    }

    pub(crate) fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.cmd.args([arg]);
        self
    }

    pub(crate) fn run(self) -> Result<()> {
        let description = self.description;
        let mut cmd = self.cmd;
        if !self.quiet {
            println!("{description}");
        }
        if self.quiet_output {
            cmd.stdout(Stdio::null());
        }
        cmd.log_debug();
        let st = cmd.status()?;
        if !st.success() {
            anyhow::bail!("Task {description} failed: {st:?}");
        }
        Ok(())
    }

    /// Like [`Self::run()`], but return stdout.
    pub(crate) fn read(self) -> Result<String> {
        let description = self.description;
        let mut cmd = self.cmd;
        if !self.quiet {
            println!("{description}");
        }
        cmd.log_debug()
            .run_get_string()
            .with_context(|| format!("Task {description} failed"))
    }

    pub(crate) fn new_and_run<'a>(
        description: impl AsRef<str>,
        exe: impl AsRef<str>,
        args: impl IntoIterator<Item = &'a str>,
    ) -> Result<()> {
        let mut t = Self::new(description.as_ref(), exe);
        t.cmd.args(args);
        t.run()
    }
}

//! Questions put to the person running the installer, and their requests to stop.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use dialoguer::{theme::ColorfulTheme, Confirm, Input, Password, Select};

use crate::error::ImageError;

/// Someone answering questions. Every method blocks until answered.
pub trait Operator {
    /// Ask a yes/no question.
    fn confirm(&self, prompt: &str, default: bool) -> Result<bool>;

    /// Ask for free text.
    fn input(&self, prompt: &str, default: Option<&str>) -> Result<String>;

    /// Ask for one of `valid`; re-asks until a valid answer is given.
    fn input_from(&self, prompt: &str, default: &str, valid: &[&str]) -> Result<String>;

    /// Ask for a secret; an empty answer yields `default`.
    fn password(&self, prompt: &str, default: &str) -> Result<String>;

    /// Pick one of `items`, returning its index.
    fn select(&self, title: &str, prompt: &str, items: &[String]) -> Result<usize>;

    /// Tell the operator something.
    fn message(&self, text: &str);

    /// Fail with [`ImageError::Aborted`] if the operator asked to stop.
    fn checkpoint(&self) -> Result<()>;

    /// Announce the next step, unless the operator asked to stop.
    fn step(&self, text: &str) -> Result<()> {
        self.checkpoint()?;
        self.message(text);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct InterruptState {
    requested: bool,
    prompting: bool,
}

/// A stop request (Ctrl+C) shared between the signal handler and the worker.
///
/// The worker notices a request at its next question or step; an external
/// operation that already started runs to completion first.
#[derive(Debug, Default)]
pub struct Interrupt {
    state: Mutex<InterruptState>,
}

/// Keeps a worker that is waiting for an answer from going any further.
/// See [`Interrupt::request`].
#[derive(Debug)]
pub struct InterruptGuard<'a> {
    _held: MutexGuard<'a, InterruptState>,
}

impl Interrupt {
    fn lock(&self) -> MutexGuard<'_, InterruptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail with [`ImageError::Aborted`] once a stop was requested.
    pub fn check(&self) -> Result<()> {
        if self.lock().requested {
            return Err(ImageError::Aborted.into());
        }
        Ok(())
    }

    /// Ask a question through `f`. A stop requested while waiting wins over the answer.
    pub(crate) fn prompt<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        {
            let mut state = self.lock();
            if state.requested {
                return Err(ImageError::Aborted.into());
            }
            state.prompting = true;
        }
        let r = f();
        let mut state = self.lock();
        state.prompting = false;
        if state.requested {
            return Err(ImageError::Aborted.into());
        }
        r
    }

    /// Request a stop.
    ///
    /// When the worker is blocked waiting for an answer, returns a guard: the
    /// worker cannot continue past its question while the guard is held, so
    /// the caller may release resources itself. Otherwise the worker stops
    /// at its next step and releases them on its way out.
    pub fn request(&self) -> Option<InterruptGuard<'_>> {
        let mut state = self.lock();
        state.requested = true;
        if state.prompting {
            Some(InterruptGuard { _held: state })
        } else {
            None
        }
    }
}

/// An [`Operator`] on the controlling terminal.
#[derive(Debug, Default)]
pub struct TerminalOperator {
    interrupt: Arc<Interrupt>,
}

impl TerminalOperator {
    /// An operator whose questions and steps honour `interrupt`.
    pub fn new(interrupt: Arc<Interrupt>) -> Self {
        Self { interrupt }
    }

    fn ask<T>(&self, f: impl FnOnce() -> dialoguer::Result<T>) -> Result<T> {
        self.interrupt.prompt(|| match f() {
            Ok(v) => Ok(v),
            // Raw-mode prompts read Ctrl+C as a key instead of a signal
            Err(dialoguer::Error::IO(e)) if e.kind() == std::io::ErrorKind::Interrupted => {
                println!("\nStopped by Ctrl+C");
                drop(self.interrupt.request());
                Err(ImageError::Aborted.into())
            }
            Err(e) => Err(e).context("Prompting"),
        })
    }
}

impl Operator for TerminalOperator {
    fn confirm(&self, prompt: &str, default: bool) -> Result<bool> {
        self.ask(|| {
            Confirm::with_theme(&ColorfulTheme::default())
                .with_prompt(prompt)
                .default(default)
                .wait_for_newline(true)
                .interact()
        })
    }

    fn input(&self, prompt: &str, default: Option<&str>) -> Result<String> {
        self.ask(|| {
            let theme = ColorfulTheme::default();
            let mut input = Input::<String>::with_theme(&theme)
                .with_prompt(prompt)
                .allow_empty(true);
            if let Some(default) = default {
                input = input.default(default.to_owned());
            }
            input.interact_text()
        })
    }

    fn input_from(&self, prompt: &str, default: &str, valid: &[&str]) -> Result<String> {
        let valid: Vec<String> = valid.iter().map(|s| s.to_string()).collect();
        let hint = valid.join(", ");
        self.ask(|| {
            Input::<String>::with_theme(&ColorfulTheme::default())
                .with_prompt(prompt)
                .default(default.to_owned())
                .validate_with(move |s: &String| -> std::result::Result<(), String> {
                    if valid.iter().any(|v| v == s.trim()) {
                        Ok(())
                    } else {
                        Err(format!("Please enter one of: {hint}"))
                    }
                })
                .interact_text()
                .map(|s| s.trim().to_owned())
        })
    }

    fn password(&self, prompt: &str, default: &str) -> Result<String> {
        let r = self.ask(|| {
            Password::with_theme(&ColorfulTheme::default())
                .with_prompt(format!("{prompt} (default: {default})"))
                .allow_empty_password(true)
                .interact()
        })?;
        if r.is_empty() {
            return Ok(default.to_owned());
        }
        Ok(r)
    }

    fn select(&self, title: &str, prompt: &str, items: &[String]) -> Result<usize> {
        println!("{title}");
        self.ask(|| {
            Select::with_theme(&ColorfulTheme::default())
                .with_prompt(prompt)
                .items(items)
                .default(0)
                .interact()
        })
    }

    fn message(&self, text: &str) {
        println!("{text}");
    }

    fn checkpoint(&self) -> Result<()> {
        self.interrupt.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_between_steps() {
        let interrupt = Interrupt::default();
        interrupt.check().unwrap();
        assert_eq!(interrupt.prompt(|| Ok(1)).unwrap(), 1);
        assert!(interrupt.request().is_none());
        assert!(ImageError::is_aborted(&interrupt.check().unwrap_err()));
        let r = interrupt.prompt(|| -> Result<()> { panic!("asked after a stop") });
        assert!(ImageError::is_aborted(&r.unwrap_err()));
    }

    #[test]
    fn test_interrupt_while_prompting() {
        let interrupt = Interrupt::default();
        let r = interrupt.prompt(|| {
            assert!(interrupt.request().is_some());
            Ok("answer")
        });
        assert!(ImageError::is_aborted(&r.unwrap_err()));
        assert!(interrupt.request().is_none());
    }

    #[test]
    fn test_guard_holds_worker() {
        let interrupt = Arc::new(Interrupt::default());
        let (asked_tx, asked_rx) = std::sync::mpsc::channel();
        let (answer_tx, answer_rx) = std::sync::mpsc::channel::<()>();
        let worker = {
            let interrupt = Arc::clone(&interrupt);
            std::thread::spawn(move || {
                interrupt.prompt(|| {
                    asked_tx.send(()).unwrap();
                    answer_rx.recv().unwrap();
                    Ok(())
                })
            })
        };
        asked_rx.recv().unwrap();
        let guard = interrupt.request().unwrap();
        answer_tx.send(()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!worker.is_finished());
        drop(guard);
        let r = worker.join().unwrap();
        assert!(ImageError::is_aborted(&r.unwrap_err()));
    }
}

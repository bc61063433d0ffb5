// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::errors::{Error, ErrorKind, Result};
use crate::jobs::{JobDescription, Streams};
use crate::queue::process::{InteractiveProcessFactory, Process};

use super::ADAPTOR_NAME;

/// A child process on this machine.
pub struct LocalProcess {
    child: Child,
    exit: Option<i32>,
}

#[async_trait]
impl Process for LocalProcess {
    async fn is_done(&mut self) -> bool {
        if self.exit.is_some() {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit = Some(status.code().unwrap_or(-1));
                true
            }
            Ok(None) => false,
            Err(e) => {
                log::warn!("{ADAPTOR_NAME}: failed to poll child process: {e}");
                self.exit = Some(-1);
                true
            }
        }
    }

    fn exit_status(&self) -> i32 {
        self.exit.unwrap_or(-1)
    }

    async fn destroy(&mut self) {
        if self.exit.is_some() {
            return;
        }
        if let Err(e) = self.child.kill().await {
            log::debug!("{ADAPTOR_NAME}: failed to kill child process: {e}");
        }
        match self.child.try_wait() {
            Ok(Some(status)) => self.exit = Some(status.code().unwrap_or(-1)),
            _ => self.exit = Some(-1),
        }
    }
}

/// Spawns children with piped streams for the job-queue engine.
pub struct LocalProcessFactory {
    open: AtomicBool,
}

impl LocalProcessFactory {
    pub fn new() -> Self {
        Self {
            open: AtomicBool::new(true),
        }
    }
}

impl Default for LocalProcessFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InteractiveProcessFactory for LocalProcessFactory {
    async fn create_interactive_process(
        &self,
        description: &JobDescription,
        working_directory: &str,
        job_identifier: &str,
        _startup_timeout_ms: u64,
    ) -> Result<(Box<dyn Process>, Streams)> {
        if !self.is_open() {
            return Err(Error::new(
                ErrorKind::NotConnected,
                ADAPTOR_NAME,
                "process factory is closed",
            ));
        }

        let executable = description.executable.as_deref().ok_or_else(|| {
            Error::new(
                ErrorKind::IncompleteJobDescription,
                ADAPTOR_NAME,
                "executable missing in job description",
            )
        })?;

        log::debug!(
            "{ADAPTOR_NAME}/{job_identifier} spawning {executable} {:?} in {working_directory}",
            description.arguments
        );

        let mut child = Command::new(executable)
            .args(&description.arguments)
            .envs(&description.environment)
            .current_dir(working_directory)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::from_io(
                    ADAPTOR_NAME,
                    format!("could not start process {executable}"),
                    e,
                )
            })?;

        let missing_pipe =
            || Error::new(ErrorKind::Internal, ADAPTOR_NAME, "child process pipe missing");
        let stdin = child.stdin.take().ok_or_else(missing_pipe)?;
        let stdout = child.stdout.take().ok_or_else(missing_pipe)?;
        let stderr = child.stderr.take().ok_or_else(missing_pipe)?;

        let streams = Streams::new(
            job_identifier,
            Box::new(stdin),
            Box::new(stdout),
            Box::new(stderr),
        );

        Ok((Box::new(LocalProcess { child, exit: None }), streams))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

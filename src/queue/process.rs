// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;

use crate::errors::Result;
use crate::jobs::{JobDescription, Streams};
use crate::scripting::protect_against_shell_metas;

/// A started external process, local or remote.
#[async_trait]
pub trait Process: Send {
    /// Has the process exited? May be polled repeatedly.
    async fn is_done(&mut self) -> bool;

    /// Exit status, meaningful once `is_done` returned true. `-1` when the
    /// process died without one (killed by a signal, destroyed).
    fn exit_status(&self) -> i32;

    /// Forcibly terminate the process. Idempotent.
    async fn destroy(&mut self);
}

/// Creates interactive processes for the job-queue engine. The local adaptor
/// spawns children directly; remote adaptors start them over their command
/// transport and hand back pipe-backed streams.
#[async_trait]
pub trait InteractiveProcessFactory: Send + Sync {
    async fn create_interactive_process(
        &self,
        description: &JobDescription,
        working_directory: &str,
        job_identifier: &str,
        startup_timeout_ms: u64,
    ) -> Result<(Box<dyn Process>, Streams)>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

/// A batch job: the command is wrapped in a `/bin/sh -c` line that redirects
/// stdin, stdout and stderr to files, `/dev/null` when unset, so nothing
/// needs to drain its streams.
pub struct BatchProcess {
    inner: Box<dyn Process>,
}

impl BatchProcess {
    pub async fn start(
        description: &JobDescription,
        working_directory: &str,
        job_identifier: &str,
        factory: &dyn InteractiveProcessFactory,
        startup_timeout_ms: u64,
    ) -> Result<Self> {
        let command = build_redirected_command(description);
        log::debug!("{job_identifier} batch command: {command}");
        let batch_description = JobDescription {
            executable: Some("/bin/sh".to_string()),
            arguments: vec!["-c".to_string(), command],
            environment: description.environment.clone(),
            working_directory: description.working_directory.clone(),
            ..JobDescription::default()
        };
        let (process, streams) = factory
            .create_interactive_process(
                &batch_description,
                working_directory,
                job_identifier,
                startup_timeout_ms,
            )
            .await?;
        // The shell owns the redirections; the pipes are unused.
        drop(streams);
        Ok(Self { inner: process })
    }
}

#[async_trait]
impl Process for BatchProcess {
    async fn is_done(&mut self) -> bool {
        self.inner.is_done().await
    }

    fn exit_status(&self) -> i32 {
        self.inner.exit_status()
    }

    async fn destroy(&mut self) {
        self.inner.destroy().await;
    }
}

/// Assemble the redirected command line. The executable and every argument
/// and path are shell-quoted; relative redirection targets resolve against
/// the working directory because the shell runs there.
fn build_redirected_command(description: &JobDescription) -> String {
    let mut command = String::new();
    if let Some(executable) = &description.executable {
        command.push_str(&protect_against_shell_metas(executable));
    }
    for argument in &description.arguments {
        command.push(' ');
        command.push_str(&protect_against_shell_metas(argument));
    }
    let stdin = description.stdin.as_deref().unwrap_or("/dev/null");
    let stdout = description.stdout.as_deref().unwrap_or("/dev/null");
    let stderr = description.stderr.as_deref().unwrap_or("/dev/null");
    command.push_str(" < ");
    command.push_str(&protect_against_shell_metas(stdin));
    command.push_str(" > ");
    command.push_str(&protect_against_shell_metas(stdout));
    command.push_str(" 2> ");
    command.push_str(&protect_against_shell_metas(stderr));
    command
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirected_command_defaults_to_dev_null() {
        let description = JobDescription {
            executable: Some("/bin/echo".to_string()),
            arguments: vec!["hello".to_string()],
            ..Default::default()
        };
        assert_eq!(
            build_redirected_command(&description),
            "/bin/echo hello < /dev/null > /dev/null 2> /dev/null"
        );
    }

    #[test]
    fn redirected_command_quotes_arguments_and_paths() {
        let description = JobDescription {
            executable: Some("/bin/echo".to_string()),
            arguments: vec!["a b".to_string()],
            stdout: Some("out put.txt".to_string()),
            ..Default::default()
        };
        assert_eq!(
            build_redirected_command(&description),
            "/bin/echo 'a b' < /dev/null > 'out put.txt' 2> /dev/null"
        );
    }
}

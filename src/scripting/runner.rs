// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::errors::{Error, Result, SharedError};
use crate::jobs::JobDescription;
use crate::scheduler::Scheduler;

/// One-shot remote command: submit an interactive job on the `unlimited`
/// queue, feed it stdin, collect stdout, stderr and the exit code.
///
/// Both output streams are drained concurrently with the stdin write; with
/// sequential reads a command producing more than a pipe buffer on the
/// stream read second would deadlock.
#[derive(Debug)]
pub struct RemoteCommandRunner {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

impl RemoteCommandRunner {
    pub async fn run(
        scheduler: &dyn Scheduler,
        stdin: &str,
        executable: &str,
        arguments: &[&str],
    ) -> Result<Self> {
        let start = std::time::Instant::now();

        let description = JobDescription {
            executable: Some(executable.to_string()),
            arguments: arguments.iter().map(|a| a.to_string()).collect(),
            queue_name: Some("unlimited".to_string()),
            ..Default::default()
        };

        let streams = scheduler.submit_interactive_job(&description).await?;
        let (job_identifier, mut input, mut output, mut error) = streams.into_parts();

        let stdin_bytes = stdin.as_bytes().to_vec();
        let write = async move {
            // A command may exit without reading its input; a broken pipe
            // here is not a failure of the command itself.
            if !stdin_bytes.is_empty() {
                if let Err(e) = input.write_all(&stdin_bytes).await {
                    log::debug!("writing stdin failed: {e}");
                    return;
                }
            }
            if let Err(e) = input.shutdown().await {
                log::debug!("closing stdin failed: {e}");
            }
        };

        let (_, stdout, stderr) = tokio::join!(write, drain(&mut output), drain(&mut error));

        let mut status = scheduler.get_job_status(&job_identifier).await?;
        if !status.is_done() {
            status = scheduler.wait_until_done(&job_identifier, 0).await?;
        }

        if let Some(cause) = status.error() {
            return Err(Error::wrapped(
                cause.kind(),
                scheduler.adaptor_name(),
                "could not run command remotely",
                SharedError(cause.clone()),
            ));
        }

        let exit_code = status.exit_code().unwrap_or(-1);

        log::debug!(
            "remote command took {:?}, executable = {executable}, arguments = {arguments:?}, exit code = {exit_code}",
            start.elapsed()
        );

        Ok(Self {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// The command ran cleanly: exit code 0 and nothing on stderr.
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.stderr.is_empty()
    }

    /// The command exited 0; stderr content is tolerated.
    pub fn success_ignore_error(&self) -> bool {
        self.exit_code == 0
    }
}

/// Read a stream to its end, keeping whatever arrived if it breaks early.
async fn drain(reader: &mut (dyn AsyncRead + Send + Unpin)) -> Vec<u8> {
    let mut collected = Vec::new();
    let mut buffer = [0u8; 8 * 1024];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => collected.extend_from_slice(&buffer[..n]),
            Err(e) => {
                log::debug!("draining stream failed: {e}");
                break;
            }
        }
    }
    collected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Credential;
    use crate::local;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn properties() -> HashMap<String, String> {
        HashMap::from([(
            local::PROPERTY_POLLING_DELAY.to_string(),
            "100".to_string(),
        )])
    }

    async fn scheduler_in(dir: &std::path::Path) -> Box<dyn Scheduler> {
        local::create_scheduler(dir.to_str().unwrap(), &Credential::Default, &properties())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn echo_collects_stdout_and_succeeds() {
        let tmp = tempdir().unwrap();
        let scheduler = scheduler_in(tmp.path()).await;

        let runner = RemoteCommandRunner::run(scheduler.as_ref(), "", "/bin/echo", &["hello world"])
            .await
            .unwrap();

        assert_eq!(runner.exit_code(), 0);
        assert_eq!(runner.stdout(), "hello world\n");
        assert_eq!(runner.stderr(), "");
        assert!(runner.success());
        scheduler.close().await.unwrap();
    }

    #[tokio::test]
    async fn stdin_reaches_the_command() {
        let tmp = tempdir().unwrap();
        let scheduler = scheduler_in(tmp.path()).await;

        let runner = RemoteCommandRunner::run(scheduler.as_ref(), "in through the pipe", "/bin/cat", &[])
            .await
            .unwrap();

        assert_eq!(runner.stdout(), "in through the pipe");
        assert!(runner.success());
        scheduler.close().await.unwrap();
    }

    #[tokio::test]
    async fn stderr_output_fails_success_but_not_success_ignore_error() {
        let tmp = tempdir().unwrap();
        let scheduler = scheduler_in(tmp.path()).await;

        let runner = RemoteCommandRunner::run(
            scheduler.as_ref(),
            "",
            "/bin/sh",
            &["-c", "echo warned 1>&2"],
        )
        .await
        .unwrap();

        assert_eq!(runner.exit_code(), 0);
        assert_eq!(runner.stderr(), "warned\n");
        assert!(!runner.success());
        assert!(runner.success_ignore_error());
        scheduler.close().await.unwrap();
    }

    #[tokio::test]
    async fn exit_code_is_reported() {
        let tmp = tempdir().unwrap();
        let scheduler = scheduler_in(tmp.path()).await;

        let runner =
            RemoteCommandRunner::run(scheduler.as_ref(), "", "/bin/sh", &["-c", "exit 3"])
                .await
                .unwrap();

        assert_eq!(runner.exit_code(), 3);
        assert!(!runner.success());
        assert!(!runner.success_ignore_error());
        scheduler.close().await.unwrap();
    }

    #[tokio::test]
    async fn large_output_on_both_streams_does_not_deadlock() {
        let tmp = tempdir().unwrap();
        let scheduler = scheduler_in(tmp.path()).await;

        // Well past any pipe buffer on both streams at once.
        let script = "i=0; while [ $i -lt 20000 ]; do echo 0123456789012345678901234567890123456789; echo e123456789012345678901234567890123456789 1>&2; i=$((i+1)); done";
        let runner = RemoteCommandRunner::run(scheduler.as_ref(), "", "/bin/sh", &["-c", script])
            .await
            .unwrap();

        assert_eq!(runner.exit_code(), 0);
        assert_eq!(runner.stdout().len(), 20000 * 41);
        assert_eq!(runner.stderr().len(), 20000 * 41);
        scheduler.close().await.unwrap();
    }
}

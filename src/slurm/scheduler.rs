// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::{Error, ErrorKind, Result};
use crate::filesystem::FileSystem;
use crate::jobs::{JobDescription, JobStatus, QueueStatus, Streams};
use crate::scheduler::Scheduler;
use crate::scripting::{
    parse_job_id_from_line, parse_key_value_record, parse_table, FieldSeparator,
    RemoteCommandRunner,
};
use crate::util;

use super::{
    generate, generate_interactive_arguments, job_status_from_sacct_info,
    job_status_from_scontrol_info, job_status_from_squeue_info, queue_status_from_sinfo,
    verify_job_description, ADAPTOR_NAME,
};

pub const PROPERTY_POLL_DELAY: &str = "gantry.adaptors.slurm.pollDelay";
pub const PROPERTY_DISABLE_ACCOUNTING: &str = "gantry.adaptors.slurm.disableAccounting";

const PROPERTY_NAMESPACE: &str = "gantry.adaptors.slurm.";

const DEFAULT_POLL_DELAY: u64 = 1000;

/// Runtime limit in minutes substituted for `max_runtime == -1`.
const DEFAULT_RUNTIME_MINUTES: i64 = 15;

/// How long an interactive job may take to appear in the queue listing.
const STARTUP_TIMEOUT_MS: u64 = 60_000;

const SQUEUE_FORMAT: &str = "--format=%i %P %j %u %T %M %l %D %R";
const SACCT_FORMAT: &str = "--format=JobID,JobName,Partition,NTasks,Elapsed,State,ExitCode";
const SINFO_FORMAT: &str = "--format=%P %a %l %F";

struct SlurmProperties {
    poll_delay: u64,
    disable_accounting: bool,
}

impl SlurmProperties {
    fn parse(properties: &HashMap<String, String>) -> Result<Self> {
        let mut result = Self {
            poll_delay: DEFAULT_POLL_DELAY,
            disable_accounting: false,
        };
        for (key, value) in properties {
            match key.as_str() {
                PROPERTY_POLL_DELAY => {
                    result.poll_delay = value.parse().map_err(|_| {
                        Error::new(
                            ErrorKind::InvalidProperty,
                            ADAPTOR_NAME,
                            format!("invalid value \"{value}\" for property {key}"),
                        )
                    })?;
                }
                PROPERTY_DISABLE_ACCOUNTING => {
                    result.disable_accounting = value.parse().map_err(|_| {
                        Error::new(
                            ErrorKind::InvalidProperty,
                            ADAPTOR_NAME,
                            format!("invalid value \"{value}\" for property {key}"),
                        )
                    })?;
                }
                _ if key.starts_with(PROPERTY_NAMESPACE) => {
                    return Err(Error::new(
                        ErrorKind::UnknownProperty,
                        ADAPTOR_NAME,
                        format!("unknown property: {key}"),
                    ));
                }
                _ => {}
            }
        }
        Ok(result)
    }
}

/// Drives a SLURM-style resource manager through whatever command transport
/// the inner scheduler provides: `sbatch` for batch submission, `srun` for
/// interactive jobs, `squeue`/`sacct`/`scontrol` for status, `scancel` for
/// cancellation and `sinfo` for the queue inventory.
pub struct SlurmScheduler {
    inner: Box<dyn Scheduler>,
    filesystem: FileSystem,
    location: String,
    queue_names: Vec<String>,
    default_queue_name: Option<String>,
    accounting_available: bool,
    poll_delay: u64,
}

impl SlurmScheduler {
    /// Probe the resource manager through `inner` and set up the dialect:
    /// fetches the partition inventory and checks whether the accounting
    /// database answers.
    pub async fn new(
        inner: Box<dyn Scheduler>,
        location: impl Into<String>,
        properties: &HashMap<String, String>,
    ) -> Result<Self> {
        let config = SlurmProperties::parse(properties)?;
        let filesystem = inner.get_file_system().await?;

        let runner =
            RemoteCommandRunner::run(inner.as_ref(), "", "sinfo", &["--noheader", "--format=%P"])
                .await?;
        if !runner.success_ignore_error() {
            return Err(Error::new(
                ErrorKind::Internal,
                ADAPTOR_NAME,
                format!("could not obtain the queue inventory: {}", runner.stderr()),
            ));
        }

        let mut queue_names = Vec::new();
        let mut default_queue_name = None;
        for line in runner.stdout().lines() {
            let name = line.trim();
            if name.is_empty() {
                continue;
            }
            match name.strip_suffix('*') {
                Some(default) => {
                    queue_names.push(default.to_string());
                    default_queue_name = Some(default.to_string());
                }
                None => queue_names.push(name.to_string()),
            }
        }

        let accounting_available = if config.disable_accounting {
            false
        } else {
            match RemoteCommandRunner::run(
                inner.as_ref(),
                "",
                "sacct",
                &["-X", "--noheader", "--format=JobID"],
            )
            .await
            {
                Ok(runner) => runner.success_ignore_error(),
                Err(e) => {
                    log::debug!("accounting probe failed: {e}");
                    false
                }
            }
        };

        log::debug!(
            "{ADAPTOR_NAME}: queues {queue_names:?}, default {default_queue_name:?}, accounting {accounting_available}"
        );

        Ok(Self {
            inner,
            filesystem,
            location: location.into(),
            queue_names,
            default_queue_name,
            accounting_available,
            poll_delay: config.poll_delay,
        })
    }

    async fn run_command(
        &self,
        stdin: &str,
        executable: &str,
        arguments: &[&str],
    ) -> Result<RemoteCommandRunner> {
        RemoteCommandRunner::run(self.inner.as_ref(), stdin, executable, arguments).await
    }

    fn assert_known_queues(&self, queue_names: &[&str]) -> Result<()> {
        for name in queue_names {
            if !self.queue_names.iter().any(|q| q == name) {
                return Err(Error::new(
                    ErrorKind::NoSuchQueue,
                    ADAPTOR_NAME,
                    format!("queue \"{name}\" does not exist"),
                ));
            }
        }
        Ok(())
    }

    async fn squeue_status(&self, job_identifier: &str) -> Result<Option<JobStatus>> {
        let runner = self
            .run_command("", "squeue", &[SQUEUE_FORMAT, "-j", job_identifier])
            .await?;
        if !runner.success_ignore_error() {
            // The queue listing fails outright for an id it does not know.
            return Ok(None);
        }
        let table = parse_table(
            runner.stdout(),
            "JOBID",
            FieldSeparator::Whitespace,
            ADAPTOR_NAME,
            &["*"],
        )?;
        job_status_from_squeue_info(&table, job_identifier)
    }

    async fn sacct_status(&self, job_identifier: &str) -> Result<Option<JobStatus>> {
        let runner = self
            .run_command("", "sacct", &["-X", "-p", SACCT_FORMAT, "-j", job_identifier])
            .await?;
        if !runner.success_ignore_error() {
            log::debug!("accounting lookup failed: {}", runner.stderr());
            return Ok(None);
        }
        let table = parse_table(
            runner.stdout(),
            "JobID",
            FieldSeparator::Bar,
            ADAPTOR_NAME,
            &[],
        )?;
        job_status_from_sacct_info(&table, job_identifier)
    }

    async fn scontrol_status(&self, job_identifier: &str) -> Result<Option<JobStatus>> {
        let runner = self
            .run_command("", "scontrol", &["-o", "show", "job", job_identifier])
            .await?;
        if !runner.success_ignore_error() {
            return Ok(None);
        }
        let record = parse_key_value_record(runner.stdout());
        job_status_from_scontrol_info(&record, job_identifier)
    }
}

#[async_trait]
impl Scheduler for SlurmScheduler {
    fn adaptor_name(&self) -> &str {
        ADAPTOR_NAME
    }

    fn location(&self) -> &str {
        &self.location
    }

    async fn get_queue_names(&self) -> Result<Vec<String>> {
        Ok(self.queue_names.clone())
    }

    async fn get_default_queue_name(&self) -> Result<String> {
        self.default_queue_name.clone().ok_or_else(|| {
            Error::new(
                ErrorKind::NoSuchQueue,
                ADAPTOR_NAME,
                "the resource manager does not mark a default queue",
            )
        })
    }

    fn get_default_runtime(&self) -> i64 {
        DEFAULT_RUNTIME_MINUTES
    }

    async fn get_jobs(&self, queue_names: &[&str]) -> Result<Vec<String>> {
        self.assert_known_queues(queue_names)?;
        let partitions = queue_names.join(",");
        let mut arguments = vec!["--noheader", "--format=%i"];
        if !queue_names.is_empty() {
            arguments.push("--partition");
            arguments.push(partitions.as_str());
        }
        let runner = self.run_command("", "squeue", &arguments).await?;
        if !runner.success_ignore_error() {
            return Err(Error::new(
                ErrorKind::Internal,
                ADAPTOR_NAME,
                format!("could not list jobs: {}", runner.stderr()),
            ));
        }
        Ok(runner
            .stdout()
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn get_queue_status(&self, queue_name: &str) -> Result<QueueStatus> {
        let runner = self.run_command("", "sinfo", &[SINFO_FORMAT]).await?;
        if !runner.success_ignore_error() {
            return Err(Error::new(
                ErrorKind::Internal,
                ADAPTOR_NAME,
                format!("could not obtain queue status: {}", runner.stderr()),
            ));
        }
        let table = parse_table(
            runner.stdout(),
            "PARTITION",
            FieldSeparator::Whitespace,
            ADAPTOR_NAME,
            &["*"],
        )?;
        queue_status_from_sinfo(&table, queue_name).ok_or_else(|| {
            Error::new(
                ErrorKind::NoSuchQueue,
                ADAPTOR_NAME,
                format!("no such queue: {queue_name}"),
            )
        })
    }

    async fn submit_batch_job(&self, description: &JobDescription) -> Result<String> {
        verify_job_description(description, &self.queue_names, false)?;

        let script = generate(
            description,
            &self.filesystem.get_working_directory(),
            self.get_default_runtime(),
        );

        let runner = self.run_command(&script, "sbatch", &[]).await?;
        if !runner.success() {
            return Err(Error::new(
                ErrorKind::Internal,
                ADAPTOR_NAME,
                format!("could not submit job: {}", runner.stderr()),
            ));
        }

        parse_job_id_from_line(runner.stdout(), "Submitted batch job", ADAPTOR_NAME)
    }

    async fn submit_interactive_job(&self, description: &JobDescription) -> Result<Streams> {
        verify_job_description(description, &self.queue_names, true)?;

        let tag = util::random_tag(22);
        let arguments = generate_interactive_arguments(
            description,
            &self.filesystem.get_working_directory(),
            &tag,
            self.get_default_runtime(),
        );

        let inner_description = JobDescription {
            executable: Some("srun".to_string()),
            arguments,
            queue_name: Some("unlimited".to_string()),
            ..Default::default()
        };
        let streams = self.inner.submit_interactive_job(&inner_description).await?;

        // Re-locate the job in the queue by its tag to learn the id the
        // resource manager assigned.
        let deadline = tokio::time::Instant::now() + Duration::from_millis(STARTUP_TIMEOUT_MS);
        let job_identifier = loop {
            let runner = self.run_command("", "squeue", &["--format=%i %j"]).await?;
            if runner.success_ignore_error() {
                let table = parse_table(
                    runner.stdout(),
                    "JOBID",
                    FieldSeparator::Whitespace,
                    ADAPTOR_NAME,
                    &["*"],
                )?;
                let found = table
                    .values()
                    .find(|record| record.get("NAME").is_some_and(|name| *name == tag))
                    .and_then(|record| record.get("JOBID").cloned());
                if let Some(id) = found {
                    break id;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                let _ = self.inner.cancel_job(streams.job_identifier()).await;
                return Err(Error::new(
                    ErrorKind::Internal,
                    ADAPTOR_NAME,
                    "interactive job did not appear in the queue",
                ));
            }
            tokio::time::sleep(Duration::from_millis(self.poll_delay)).await;
        };

        let (_, stdin, stdout, stderr) = streams.into_parts();
        Ok(Streams::new(job_identifier, stdin, stdout, stderr))
    }

    async fn get_job_status(&self, job_identifier: &str) -> Result<JobStatus> {
        let mut status = self.squeue_status(job_identifier).await?;
        if status.is_none() && self.accounting_available {
            status = self.sacct_status(job_identifier).await?;
        }
        if status.is_none() {
            status = self.scontrol_status(job_identifier).await?;
        }
        status.ok_or_else(|| {
            Error::new(
                ErrorKind::NoSuchJob,
                ADAPTOR_NAME,
                format!("job {job_identifier} does not exist"),
            )
        })
    }

    async fn cancel_job(&self, job_identifier: &str) -> Result<JobStatus> {
        let runner = self.run_command("", "scancel", &[job_identifier]).await?;
        if !runner.success_ignore_error() {
            return Err(Error::new(
                ErrorKind::Internal,
                ADAPTOR_NAME,
                format!("could not cancel job {job_identifier}: {}", runner.stderr()),
            ));
        }
        self.get_job_status(job_identifier).await
    }

    async fn wait_until_done(&self, job_identifier: &str, timeout_ms: u64) -> Result<JobStatus> {
        let deadline = util::deadline(timeout_ms);
        loop {
            let status = self.get_job_status(job_identifier).await?;
            if status.is_done() {
                return Ok(status);
            }
            let sleep_ms = match deadline {
                Some(at) => {
                    let now = tokio::time::Instant::now();
                    if now >= at {
                        return Ok(status);
                    }
                    (at.saturating_duration_since(now).as_millis() as u64).min(self.poll_delay)
                }
                None => self.poll_delay,
            };
            tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
        }
    }

    async fn wait_until_running(&self, job_identifier: &str, timeout_ms: u64) -> Result<JobStatus> {
        let deadline = util::deadline(timeout_ms);
        loop {
            let status = self.get_job_status(job_identifier).await?;
            if status.is_running() || status.is_done() {
                return Ok(status);
            }
            let sleep_ms = match deadline {
                Some(at) => {
                    let now = tokio::time::Instant::now();
                    if now >= at {
                        return Ok(status);
                    }
                    (at.saturating_duration_since(now).as_millis() as u64).min(self.poll_delay)
                }
                None => self.poll_delay,
            };
            tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
        }
    }

    async fn get_file_system(&self) -> Result<FileSystem> {
        Ok(self.filesystem.clone())
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Credential;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    type Call = (String, Vec<String>, String);
    type Handler = Arc<dyn Fn(&str, &[String], &str) -> (String, String, i32) + Send + Sync>;

    /// Command transport double: every interactive job is answered by the
    /// handler, and the submitted calls are recorded for assertions.
    struct MockTransport {
        handler: Handler,
        calls: Arc<StdMutex<Vec<Call>>>,
        next: AtomicU64,
        exits: Arc<StdMutex<HashMap<String, i32>>>,
        filesystem: FileSystem,
    }

    impl MockTransport {
        async fn new(handler: Handler, dir: &TempDir) -> Self {
            let filesystem = crate::local::create_file_system(
                dir.path().to_str().unwrap(),
                &Credential::Default,
                &HashMap::new(),
            )
            .await
            .unwrap();
            Self {
                handler,
                calls: Arc::new(StdMutex::new(Vec::new())),
                next: AtomicU64::new(0),
                exits: Arc::new(StdMutex::new(HashMap::new())),
                filesystem,
            }
        }
    }

    #[async_trait]
    impl Scheduler for MockTransport {
        fn adaptor_name(&self) -> &str {
            "mock"
        }

        fn location(&self) -> &str {
            ""
        }

        async fn get_queue_names(&self) -> Result<Vec<String>> {
            Ok(vec!["unlimited".to_string()])
        }

        async fn get_default_queue_name(&self) -> Result<String> {
            Ok("unlimited".to_string())
        }

        fn get_default_runtime(&self) -> i64 {
            0
        }

        async fn get_jobs(&self, _queue_names: &[&str]) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn get_queue_status(&self, queue_name: &str) -> Result<QueueStatus> {
            Ok(QueueStatus::new(queue_name, None, None))
        }

        async fn submit_batch_job(&self, _description: &JobDescription) -> Result<String> {
            Err(Error::new(
                ErrorKind::UnsupportedOperation,
                "mock",
                "batch not supported",
            ))
        }

        async fn submit_interactive_job(&self, description: &JobDescription) -> Result<Streams> {
            let id = format!("mock-{}", self.next.fetch_add(1, Ordering::SeqCst));
            let executable = description.executable.clone().unwrap_or_default();
            let arguments = description.arguments.clone();
            let (stdin_runner, mut stdin_mock) = tokio::io::duplex(1 << 20);
            let (mut stdout_mock, stdout_runner) = tokio::io::duplex(1 << 20);
            let (mut stderr_mock, stderr_runner) = tokio::io::duplex(1 << 20);
            let handler = Arc::clone(&self.handler);
            let calls = Arc::clone(&self.calls);
            let exits = Arc::clone(&self.exits);
            let job = id.clone();
            tokio::spawn(async move {
                // Only the submit command consumes its stdin; an interactive
                // run keeps the pipe open for the lifetime of the job, so
                // waiting for EOF there would stall the tag lookup.
                let input = if executable == "sbatch" {
                    let mut input = Vec::new();
                    let _ = stdin_mock.read_to_end(&mut input).await;
                    String::from_utf8_lossy(&input).into_owned()
                } else {
                    String::new()
                };
                let (out, err, code) = handler(&executable, &arguments, &input);
                calls.lock().unwrap().push((executable, arguments, input));
                exits.lock().unwrap().insert(job, code);
                let _ = stdout_mock.write_all(out.as_bytes()).await;
                let _ = stderr_mock.write_all(err.as_bytes()).await;
            });
            Ok(Streams::new(
                id,
                Box::new(stdin_runner),
                Box::new(stdout_runner),
                Box::new(stderr_runner),
            ))
        }

        async fn get_job_status(&self, job_identifier: &str) -> Result<JobStatus> {
            let exit = self
                .exits
                .lock()
                .unwrap()
                .get(job_identifier)
                .copied()
                .unwrap_or(0);
            Ok(JobStatus::new(
                job_identifier,
                None,
                "DONE",
                Some(exit),
                None,
                false,
                true,
                None,
            ))
        }

        async fn cancel_job(&self, job_identifier: &str) -> Result<JobStatus> {
            Ok(JobStatus::new(
                job_identifier,
                None,
                "KILLED",
                None,
                None,
                false,
                true,
                None,
            ))
        }

        async fn wait_until_done(
            &self,
            job_identifier: &str,
            _timeout_ms: u64,
        ) -> Result<JobStatus> {
            self.get_job_status(job_identifier).await
        }

        async fn wait_until_running(
            &self,
            job_identifier: &str,
            _timeout_ms: u64,
        ) -> Result<JobStatus> {
            self.get_job_status(job_identifier).await
        }

        async fn get_file_system(&self) -> Result<FileSystem> {
            Ok(self.filesystem.clone())
        }

        fn is_open(&self) -> bool {
            true
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    const SQUEUE_HEADER: &str =
        "JOBID PARTITION NAME USER STATE TIME TIME_LIMIT NODES NODELIST(REASON)\n";

    fn queue_inventory(exe: &str, args: &[String]) -> Option<(String, String, i32)> {
        match exe {
            "sinfo" if args.iter().any(|a| a == "--noheader") => {
                Some(("debug*\nlong\n".to_string(), String::new(), 0))
            }
            "sinfo" => Some((
                "PARTITION AVAIL TIMELIMIT NODES(A/I/O/T)\ndebug* up 15:00 4/4/0/8\nlong up infinite 2/6/0/8\n"
                    .to_string(),
                String::new(),
                0,
            )),
            "sacct" if args.iter().any(|a| a == "--noheader") => {
                Some((String::new(), String::new(), 0))
            }
            _ => None,
        }
    }

    fn properties() -> HashMap<String, String> {
        HashMap::from([(PROPERTY_POLL_DELAY.to_string(), "100".to_string())])
    }

    async fn slurm_with(
        handler: Handler,
        dir: &TempDir,
        properties: &HashMap<String, String>,
    ) -> (SlurmScheduler, Arc<StdMutex<Vec<Call>>>) {
        let transport = MockTransport::new(handler, dir).await;
        let calls = Arc::clone(&transport.calls);
        let scheduler = SlurmScheduler::new(Box::new(transport), "cluster", properties)
            .await
            .unwrap();
        (scheduler, calls)
    }

    #[tokio::test]
    async fn discovers_queues_and_default_queue() {
        let tmp = TempDir::new().unwrap();
        let handler: Handler = Arc::new(|exe, args, _| {
            queue_inventory(exe, args).unwrap_or((String::new(), "unexpected".to_string(), 1))
        });
        let (scheduler, _) = slurm_with(handler, &tmp, &properties()).await;

        assert_eq!(scheduler.get_queue_names().await.unwrap(), ["debug", "long"]);
        assert_eq!(scheduler.get_default_queue_name().await.unwrap(), "debug");
        assert!(scheduler.accounting_available);
    }

    #[tokio::test]
    async fn submit_batch_pipes_the_script_and_parses_the_id() {
        let tmp = TempDir::new().unwrap();
        let handler: Handler = Arc::new(|exe, args, _| {
            queue_inventory(exe, args).unwrap_or_else(|| match exe {
                "sbatch" => ("Submitted batch job 42\n".to_string(), String::new(), 0),
                _ => (String::new(), format!("unknown command {exe}"), 127),
            })
        });
        let (scheduler, calls) = slurm_with(handler, &tmp, &properties()).await;

        let description = JobDescription {
            executable: Some("/bin/myjob".to_string()),
            queue_name: Some("debug".to_string()),
            max_runtime: 5,
            ..Default::default()
        };
        let job = scheduler.submit_batch_job(&description).await.unwrap();
        assert_eq!(job, "42");

        let calls = calls.lock().unwrap();
        let sbatch = calls.iter().find(|(exe, _, _)| exe == "sbatch").unwrap();
        assert!(sbatch.2.starts_with("#!/bin/sh\n"));
        assert!(sbatch.2.contains("#SBATCH --partition=debug\n"));
        assert!(sbatch.2.contains("#SBATCH --time=5\n"));
    }

    #[tokio::test]
    async fn job_status_comes_from_the_queue_listing_first() {
        let tmp = TempDir::new().unwrap();
        let handler: Handler = Arc::new(|exe, args, _| {
            queue_inventory(exe, args).unwrap_or_else(|| match exe {
                "squeue" => (
                    format!("{SQUEUE_HEADER}42 debug myjob user RUNNING 1:00 15:00 1 node1\n"),
                    String::new(),
                    0,
                ),
                _ => (String::new(), format!("unknown command {exe}"), 127),
            })
        });
        let (scheduler, _) = slurm_with(handler, &tmp, &properties()).await;

        let status = scheduler.get_job_status("42").await.unwrap();
        assert_eq!(status.state(), "RUNNING");
        assert!(status.is_running());
        assert!(!status.is_done());
        assert_eq!(status.name(), Some("myjob"));
    }

    #[tokio::test]
    async fn job_status_falls_back_to_accounting() {
        let tmp = TempDir::new().unwrap();
        let handler: Handler = Arc::new(|exe, args, _| {
            queue_inventory(exe, args).unwrap_or_else(|| match exe {
                "squeue" => (SQUEUE_HEADER.to_string(), String::new(), 0),
                "sacct" => (
                    "JobID|JobName|Partition|NTasks|Elapsed|State|ExitCode|\n42|demo|debug|1|00:01:00|COMPLETED|0:0|\n"
                        .to_string(),
                    String::new(),
                    0,
                ),
                _ => (String::new(), format!("unknown command {exe}"), 127),
            })
        });
        let (scheduler, _) = slurm_with(handler, &tmp, &properties()).await;

        let status = scheduler.get_job_status("42").await.unwrap();
        assert_eq!(status.state(), "COMPLETED");
        assert!(status.is_done());
        assert_eq!(status.exit_code(), Some(0));
    }

    #[tokio::test]
    async fn job_status_falls_back_to_the_control_record_without_accounting() {
        let tmp = TempDir::new().unwrap();
        let handler: Handler = Arc::new(|exe, args, _| {
            queue_inventory(exe, args).unwrap_or_else(|| match exe {
                "squeue" => (SQUEUE_HEADER.to_string(), String::new(), 0),
                "scontrol" => (
                    "JobId=42 JobName=demo JobState=COMPLETED ExitCode=0:0 Reason=None\n"
                        .to_string(),
                    String::new(),
                    0,
                ),
                _ => (String::new(), format!("unknown command {exe}"), 127),
            })
        });
        let mut props = properties();
        props.insert(PROPERTY_DISABLE_ACCOUNTING.to_string(), "true".to_string());
        let (scheduler, _) = slurm_with(handler, &tmp, &props).await;

        assert!(!scheduler.accounting_available);
        let status = scheduler.get_job_status("42").await.unwrap();
        assert_eq!(status.state(), "COMPLETED");
        assert!(status.is_done());
    }

    #[tokio::test]
    async fn unknown_jobs_raise_no_such_job() {
        let tmp = TempDir::new().unwrap();
        let handler: Handler = Arc::new(|exe, args, _| {
            queue_inventory(exe, args).unwrap_or_else(|| match exe {
                "squeue" => (String::new(), "Invalid job id specified".to_string(), 1),
                "sacct" => ("JobID|JobName|State|ExitCode|\n".to_string(), String::new(), 0),
                "scontrol" => (String::new(), "Invalid job id specified".to_string(), 1),
                _ => (String::new(), format!("unknown command {exe}"), 127),
            })
        });
        let (scheduler, _) = slurm_with(handler, &tmp, &properties()).await;

        let err = scheduler.get_job_status("99").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSuchJob);
    }

    #[tokio::test]
    async fn cancel_issues_scancel_and_returns_the_resulting_status() {
        let tmp = TempDir::new().unwrap();
        let handler: Handler = Arc::new(|exe, args, _| {
            queue_inventory(exe, args).unwrap_or_else(|| match exe {
                "scancel" => (String::new(), String::new(), 0),
                "squeue" => (SQUEUE_HEADER.to_string(), String::new(), 0),
                "sacct" => (
                    "JobID|JobName|Partition|NTasks|Elapsed|State|ExitCode|\n42|demo|debug|1|00:01:00|CANCELLED by 1000|0:15|\n"
                        .to_string(),
                    String::new(),
                    0,
                ),
                _ => (String::new(), format!("unknown command {exe}"), 127),
            })
        });
        let (scheduler, calls) = slurm_with(handler, &tmp, &properties()).await;

        let status = scheduler.cancel_job("42").await.unwrap();
        assert!(status.is_done());
        assert_eq!(status.error().unwrap().kind(), ErrorKind::JobCanceled);
        assert!(calls
            .lock()
            .unwrap()
            .iter()
            .any(|(exe, args, _)| exe == "scancel" && args == &["42".to_string()]));
    }

    #[tokio::test]
    async fn wait_until_done_polls_until_the_job_leaves_the_queue() {
        let tmp = TempDir::new().unwrap();
        let polls = Arc::new(AtomicUsize::new(0));
        let polls_in_handler = Arc::clone(&polls);
        let handler: Handler = Arc::new(move |exe, args, _| {
            queue_inventory(exe, args).unwrap_or_else(|| match exe {
                "squeue" => {
                    if polls_in_handler.fetch_add(1, Ordering::SeqCst) < 2 {
                        (
                            format!("{SQUEUE_HEADER}42 debug myjob user RUNNING 1:00 15:00 1 node1\n"),
                            String::new(),
                            0,
                        )
                    } else {
                        (SQUEUE_HEADER.to_string(), String::new(), 0)
                    }
                }
                "sacct" => (
                    "JobID|JobName|Partition|NTasks|Elapsed|State|ExitCode|\n42|demo|debug|1|00:01:00|COMPLETED|0:0|\n"
                        .to_string(),
                    String::new(),
                    0,
                ),
                _ => (String::new(), format!("unknown command {exe}"), 127),
            })
        });
        let (scheduler, _) = slurm_with(handler, &tmp, &properties()).await;

        let status = scheduler.wait_until_done("42", 0).await.unwrap();
        assert_eq!(status.state(), "COMPLETED");
        assert!(polls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn interactive_jobs_are_relocated_by_their_tag() {
        let tmp = TempDir::new().unwrap();
        let tag_store: Arc<StdMutex<Option<String>>> = Arc::new(StdMutex::new(None));
        let tag_in_handler = Arc::clone(&tag_store);
        let handler: Handler = Arc::new(move |exe, args, _| {
            queue_inventory(exe, args).unwrap_or_else(|| match exe {
                "srun" => {
                    let tag = args
                        .iter()
                        .find_map(|a| a.strip_prefix("--job-name="))
                        .unwrap()
                        .to_string();
                    *tag_in_handler.lock().unwrap() = Some(tag);
                    ("interactive output".to_string(), String::new(), 0)
                }
                "squeue" => {
                    let tag = tag_in_handler.lock().unwrap().clone();
                    match tag {
                        Some(tag) => (format!("JOBID NAME\n77 {tag}\n"), String::new(), 0),
                        None => ("JOBID NAME\n".to_string(), String::new(), 0),
                    }
                }
                _ => (String::new(), format!("unknown command {exe}"), 127),
            })
        });
        let (scheduler, calls) = slurm_with(handler, &tmp, &properties()).await;

        let description = JobDescription {
            executable: Some("/bin/hostname".to_string()),
            queue_name: Some("debug".to_string()),
            max_runtime: 5,
            ..Default::default()
        };
        let streams = scheduler.submit_interactive_job(&description).await.unwrap();
        assert_eq!(streams.job_identifier(), "77");

        let (_, stdin, mut stdout, _) = streams.into_parts();
        drop(stdin);
        let mut out = String::new();
        stdout.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "interactive output");

        let calls = calls.lock().unwrap();
        let srun = calls.iter().find(|(exe, _, _)| exe == "srun").unwrap();
        assert!(srun.1.contains(&"--quiet".to_string()));
        assert!(srun.1.contains(&"--partition=debug".to_string()));
    }

    #[tokio::test]
    async fn get_jobs_rejects_unknown_queues_and_parses_ids() {
        let tmp = TempDir::new().unwrap();
        let handler: Handler = Arc::new(|exe, args, _| {
            queue_inventory(exe, args).unwrap_or_else(|| match exe {
                "squeue" => ("42\n43\n".to_string(), String::new(), 0),
                _ => (String::new(), format!("unknown command {exe}"), 127),
            })
        });
        let (scheduler, _) = slurm_with(handler, &tmp, &properties()).await;

        assert_eq!(scheduler.get_jobs(&["debug"]).await.unwrap(), ["42", "43"]);
        let err = scheduler.get_jobs(&["nope"]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSuchQueue);
    }

    #[tokio::test]
    async fn queue_status_carries_the_inventory_fields() {
        let tmp = TempDir::new().unwrap();
        let handler: Handler = Arc::new(|exe, args, _| {
            queue_inventory(exe, args).unwrap_or((String::new(), "unexpected".to_string(), 1))
        });
        let (scheduler, _) = slurm_with(handler, &tmp, &properties()).await;

        let status = scheduler.get_queue_status("debug").await.unwrap();
        assert_eq!(status.queue_name(), "debug");
        assert_eq!(
            status.scheduler_specific_information().unwrap()["AVAIL"],
            "up"
        );

        let err = scheduler.get_queue_status("nope").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSuchQueue);
    }
}

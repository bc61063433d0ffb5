// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

mod executor;
pub mod process;

pub use executor::{JobExecutor, JobState};
pub use process::{BatchProcess, InteractiveProcessFactory, Process};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::credentials::Credential;
use crate::errors::{Error, ErrorKind, Result};
use crate::filesystem::FileSystem;
use crate::jobs::{JobDescription, JobStatus, QueueStatus, Streams};
use crate::scheduler::Scheduler;

pub const SINGLE_QUEUE_NAME: &str = "single";
pub const MULTI_QUEUE_NAME: &str = "multi";
pub const UNLIMITED_QUEUE_NAME: &str = "unlimited";

/// The smallest accepted polling delay, in ms.
pub const MIN_POLLING_DELAY: u64 = 100;
/// The largest accepted polling delay, in ms.
pub const MAX_POLLING_DELAY: u64 = 60_000;

#[derive(Default)]
struct Queues {
    single: Vec<Arc<JobExecutor>>,
    multi: Vec<Arc<JobExecutor>>,
    unlimited: Vec<Arc<JobExecutor>>,
}

type ExecutorReceiver = Arc<Mutex<mpsc::UnboundedReceiver<Arc<JobExecutor>>>>;

/// A scheduler that multiplexes jobs over local worker pools.
///
/// Three queues are exposed: `single` runs one job at a time in submission
/// order, `multi` runs up to a configured number concurrently, `unlimited`
/// starts every job immediately. The actual processes come from a pluggable
/// [`InteractiveProcessFactory`], so the same engine serves the local adaptor
/// and any transport able to start a process with piped streams.
pub struct JobQueueScheduler {
    adaptor_name: String,
    location: String,
    #[allow(dead_code)]
    credential: Credential,
    #[allow(dead_code)]
    properties: HashMap<String, String>,
    filesystem: FileSystem,
    factory: Arc<dyn InteractiveProcessFactory>,
    polling_delay: u64,
    startup_timeout: u64,
    job_id: AtomicU64,
    queues: StdMutex<Queues>,
    single_tx: mpsc::UnboundedSender<Arc<JobExecutor>>,
    multi_tx: mpsc::UnboundedSender<Arc<JobExecutor>>,
    workers: StdMutex<Vec<JoinHandle<()>>>,
}

fn spawn_queue_worker(rx: ExecutorReceiver) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let executor = {
                let mut rx = rx.lock().await;
                match rx.recv().await {
                    Some(executor) => executor,
                    None => break,
                }
            };
            executor.run().await;
        }
    })
}

impl JobQueueScheduler {
    /// Build the engine and start its worker pools. Must run inside a tokio
    /// runtime.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        adaptor_name: impl Into<String>,
        location: impl Into<String>,
        credential: Credential,
        properties: HashMap<String, String>,
        factory: Arc<dyn InteractiveProcessFactory>,
        filesystem: FileSystem,
        multi_q_threads: usize,
        polling_delay: u64,
        startup_timeout: u64,
    ) -> Result<Self> {
        let adaptor_name = adaptor_name.into();

        if multi_q_threads < 1 {
            return Err(Error::new(
                ErrorKind::BadParameter,
                &adaptor_name,
                "number of slots for the multi queue cannot be smaller than one",
            ));
        }

        if !(MIN_POLLING_DELAY..=MAX_POLLING_DELAY).contains(&polling_delay) {
            return Err(Error::new(
                ErrorKind::BadParameter,
                &adaptor_name,
                format!(
                    "polling delay must be between {MIN_POLLING_DELAY} and {MAX_POLLING_DELAY}"
                ),
            ));
        }

        log::debug!(
            "creating job queue scheduler for adaptor {adaptor_name} with {multi_q_threads} multi-queue workers and polling delay {polling_delay}"
        );

        let (single_tx, single_rx) = mpsc::unbounded_channel();
        let (multi_tx, multi_rx) = mpsc::unbounded_channel();

        let mut workers = Vec::with_capacity(multi_q_threads + 1);
        workers.push(spawn_queue_worker(Arc::new(Mutex::new(single_rx))));
        let multi_rx: ExecutorReceiver = Arc::new(Mutex::new(multi_rx));
        for _ in 0..multi_q_threads {
            workers.push(spawn_queue_worker(Arc::clone(&multi_rx)));
        }

        Ok(Self {
            adaptor_name,
            location: location.into(),
            credential,
            properties,
            filesystem,
            factory,
            polling_delay,
            startup_timeout,
            job_id: AtomicU64::new(0),
            queues: StdMutex::new(Queues::default()),
            single_tx,
            multi_tx,
            workers: StdMutex::new(workers),
        })
    }

    fn verify_job_description(
        &self,
        description: &mut JobDescription,
        interactive: bool,
    ) -> Result<()> {
        if description.queue_name.is_none() {
            description.queue_name = Some(SINGLE_QUEUE_NAME.to_string());
        }
        let queue = description.queue_name.as_deref().unwrap_or(SINGLE_QUEUE_NAME);

        if queue != SINGLE_QUEUE_NAME && queue != MULTI_QUEUE_NAME && queue != UNLIMITED_QUEUE_NAME
        {
            return Err(Error::new(
                ErrorKind::NoSuchQueue,
                &self.adaptor_name,
                format!("queue \"{queue}\" is not available locally"),
            ));
        }

        if description.executable.is_none() {
            return Err(Error::new(
                ErrorKind::IncompleteJobDescription,
                &self.adaptor_name,
                "executable missing in job description",
            ));
        }

        if description.tasks != 1 {
            return Err(Error::new(
                ErrorKind::InvalidJobDescription,
                &self.adaptor_name,
                format!("unsupported task count: {}", description.tasks),
            ));
        }

        if description.tasks_per_node > 1 {
            return Err(Error::new(
                ErrorKind::InvalidJobDescription,
                &self.adaptor_name,
                format!("unsupported tasks per node count: {}", description.tasks_per_node),
            ));
        }

        if description.max_runtime < -1 {
            return Err(Error::new(
                ErrorKind::InvalidJobDescription,
                &self.adaptor_name,
                format!("illegal maximum runtime: {}", description.max_runtime),
            ));
        }

        if interactive {
            if description.stdin.is_some() {
                return Err(Error::new(
                    ErrorKind::InvalidJobDescription,
                    &self.adaptor_name,
                    "illegal stdin redirect for interactive job",
                ));
            }
            if description
                .stdout
                .as_deref()
                .is_some_and(|s| s != "stdout.txt")
            {
                return Err(Error::new(
                    ErrorKind::InvalidJobDescription,
                    &self.adaptor_name,
                    "illegal stdout redirect for interactive job",
                ));
            }
            if description
                .stderr
                .as_deref()
                .is_some_and(|s| s != "stderr.txt")
            {
                return Err(Error::new(
                    ErrorKind::InvalidJobDescription,
                    &self.adaptor_name,
                    "illegal stderr redirect for interactive job",
                ));
            }
        }

        Ok(())
    }

    fn submit(&self, description: &JobDescription, interactive: bool) -> Result<Arc<JobExecutor>> {
        if !self.factory.is_open() {
            return Err(Error::new(
                ErrorKind::NotConnected,
                &self.adaptor_name,
                "scheduler is closed",
            ));
        }

        let mut description = description.clone();
        self.verify_job_description(&mut description, interactive)?;

        let job_identifier = format!(
            "{}-{}",
            self.adaptor_name,
            self.job_id.fetch_add(1, Ordering::SeqCst)
        );
        log::debug!("{}: created job {job_identifier}", self.adaptor_name);

        let queue_name = description.queue_name.clone().unwrap_or_default();
        let executor = Arc::new(JobExecutor::new(
            &self.adaptor_name,
            self.filesystem.clone(),
            self.filesystem.get_working_directory(),
            Arc::clone(&self.factory),
            description,
            &job_identifier,
            interactive,
            self.polling_delay,
            self.startup_timeout,
        ));

        let closed = || {
            Error::new(
                ErrorKind::NotConnected,
                &self.adaptor_name,
                "scheduler is closed",
            )
        };

        let mut queues = self.queues.lock().unwrap();
        match queue_name.as_str() {
            UNLIMITED_QUEUE_NAME => {
                queues.unlimited.push(Arc::clone(&executor));
                let runner = Arc::clone(&executor);
                tokio::spawn(async move { runner.run().await });
            }
            MULTI_QUEUE_NAME => {
                queues.multi.push(Arc::clone(&executor));
                if self.multi_tx.send(Arc::clone(&executor)).is_err() {
                    queues.multi.pop();
                    return Err(closed());
                }
            }
            _ => {
                queues.single.push(Arc::clone(&executor));
                if self.single_tx.send(Arc::clone(&executor)).is_err() {
                    queues.single.pop();
                    return Err(closed());
                }
            }
        }

        Ok(executor)
    }

    fn find_job(&self, job_identifier: &str) -> Result<Arc<JobExecutor>> {
        let queues = self.queues.lock().unwrap();
        for queue in [&queues.single, &queues.multi, &queues.unlimited] {
            if let Some(executor) = queue.iter().find(|e| e.job_identifier() == job_identifier) {
                return Ok(Arc::clone(executor));
            }
        }
        Err(Error::new(
            ErrorKind::NoSuchJob,
            &self.adaptor_name,
            format!("job {job_identifier} does not exist"),
        ))
    }

    fn cleanup_job(&self, job_identifier: &str) {
        let mut queues = self.queues.lock().unwrap();
        let Queues {
            single,
            multi,
            unlimited,
        } = &mut *queues;
        for queue in [single, multi, unlimited] {
            if let Some(index) = queue.iter().position(|e| e.job_identifier() == job_identifier) {
                queue.remove(index);
                return;
            }
        }
    }

    fn queue_jobs(&self, out: &mut Vec<String>, queue_name: &str) -> Result<()> {
        let queues = self.queues.lock().unwrap();
        let queue = match queue_name {
            SINGLE_QUEUE_NAME => &queues.single,
            MULTI_QUEUE_NAME => &queues.multi,
            UNLIMITED_QUEUE_NAME => &queues.unlimited,
            _ => {
                return Err(Error::new(
                    ErrorKind::NoSuchQueue,
                    &self.adaptor_name,
                    format!("queue \"{queue_name}\" does not exist"),
                ));
            }
        };
        out.extend(queue.iter().map(|e| e.job_identifier().to_string()));
        Ok(())
    }
}

#[async_trait]
impl Scheduler for JobQueueScheduler {
    fn adaptor_name(&self) -> &str {
        &self.adaptor_name
    }

    fn location(&self) -> &str {
        &self.location
    }

    async fn get_queue_names(&self) -> Result<Vec<String>> {
        Ok(vec![
            SINGLE_QUEUE_NAME.to_string(),
            MULTI_QUEUE_NAME.to_string(),
            UNLIMITED_QUEUE_NAME.to_string(),
        ])
    }

    async fn get_default_queue_name(&self) -> Result<String> {
        Ok(SINGLE_QUEUE_NAME.to_string())
    }

    fn get_default_runtime(&self) -> i64 {
        0
    }

    async fn get_jobs(&self, queue_names: &[&str]) -> Result<Vec<String>> {
        let mut out = Vec::new();
        if queue_names.is_empty() {
            for name in [SINGLE_QUEUE_NAME, MULTI_QUEUE_NAME, UNLIMITED_QUEUE_NAME] {
                self.queue_jobs(&mut out, name)?;
            }
        } else {
            for name in queue_names {
                self.queue_jobs(&mut out, name)?;
            }
        }
        Ok(out)
    }

    async fn get_queue_status(&self, queue_name: &str) -> Result<QueueStatus> {
        match queue_name {
            SINGLE_QUEUE_NAME | MULTI_QUEUE_NAME | UNLIMITED_QUEUE_NAME => {
                Ok(QueueStatus::new(queue_name, None, None))
            }
            _ => Err(Error::new(
                ErrorKind::NoSuchQueue,
                &self.adaptor_name,
                format!("no such queue: {queue_name}"),
            )),
        }
    }

    async fn submit_batch_job(&self, description: &JobDescription) -> Result<String> {
        Ok(self.submit(description, false)?.job_identifier().to_string())
    }

    async fn submit_interactive_job(&self, description: &JobDescription) -> Result<Streams> {
        let executor = self.submit(description, true)?;

        log::debug!("{}: waiting for interactive job to start", self.adaptor_name);
        executor.wait_until_running(0).await;

        if executor.is_done() && !executor.has_run() {
            let job_identifier = executor.job_identifier().to_string();
            self.cleanup_job(&job_identifier);
            let mut error = Error::new(
                ErrorKind::Internal,
                &self.adaptor_name,
                format!("interactive job {job_identifier} failed to start"),
            );
            if let Some(cause) = executor.error() {
                error = Error::wrapped(
                    cause.kind(),
                    &self.adaptor_name,
                    format!("interactive job {job_identifier} failed to start"),
                    crate::errors::SharedError(cause),
                );
            }
            return Err(error);
        }

        executor.take_streams()
    }

    async fn get_job_status(&self, job_identifier: &str) -> Result<JobStatus> {
        let executor = self.find_job(job_identifier)?;
        let status = executor.get_status().await;
        if status.is_done() {
            self.cleanup_job(job_identifier);
        }
        Ok(status)
    }

    async fn cancel_job(&self, job_identifier: &str) -> Result<JobStatus> {
        log::debug!("{}: cancel job {job_identifier}", self.adaptor_name);
        let executor = self.find_job(job_identifier)?;

        let status = if executor.kill() {
            executor.get_status().await
        } else {
            executor.wait_until_done(self.polling_delay).await
        };

        if status.is_done() {
            self.cleanup_job(job_identifier);
        }
        Ok(status)
    }

    async fn wait_until_done(&self, job_identifier: &str, timeout_ms: u64) -> Result<JobStatus> {
        let executor = self.find_job(job_identifier)?;
        let status = executor.wait_until_done(timeout_ms).await;
        if status.is_done() {
            self.cleanup_job(job_identifier);
        }
        Ok(status)
    }

    async fn wait_until_running(&self, job_identifier: &str, timeout_ms: u64) -> Result<JobStatus> {
        let executor = self.find_job(job_identifier)?;
        let status = executor.wait_until_running(timeout_ms).await;
        if status.is_done() {
            self.cleanup_job(job_identifier);
        }
        Ok(status)
    }

    async fn get_file_system(&self) -> Result<FileSystem> {
        Ok(self.filesystem.clone())
    }

    fn is_open(&self) -> bool {
        self.factory.is_open()
    }

    async fn close(&self) -> Result<()> {
        for worker in self.workers.lock().unwrap().drain(..) {
            worker.abort();
        }
        self.factory.close().await
    }
}

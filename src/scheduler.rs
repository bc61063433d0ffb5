// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::credentials::Credential;
use crate::errors::{Error, ErrorKind, Result};
use crate::filesystem::FileSystem;
use crate::jobs::{JobDescription, JobStatus, QueueStatus, Streams};

/// A scheduler capable of running jobs, locally or on a remote resource
/// manager.
///
/// All timeouts are in milliseconds; `0` means wait indefinitely. Status
/// lookups are single-harvest: the first call that observes a terminal
/// status removes the job, and a later lookup of the same identifier raises
/// `NoSuchJob`.
#[async_trait]
pub trait Scheduler: Send + Sync {
    fn adaptor_name(&self) -> &str;

    fn location(&self) -> &str;

    async fn get_queue_names(&self) -> Result<Vec<String>>;

    async fn get_default_queue_name(&self) -> Result<String>;

    /// The runtime limit in minutes applied when a description asks for the
    /// adaptor default (`max_runtime == -1`). `0` means unlimited.
    fn get_default_runtime(&self) -> i64;

    /// Identifiers of the unharvested jobs in the given queues, or in all
    /// queues when none are named.
    async fn get_jobs(&self, queue_names: &[&str]) -> Result<Vec<String>>;

    async fn get_queue_status(&self, queue_name: &str) -> Result<QueueStatus>;

    /// Bulk variant of [`get_queue_status`](Scheduler::get_queue_status);
    /// per-queue failures are embedded in the corresponding entry instead of
    /// aborting the call.
    async fn get_queue_statuses(&self, queue_names: &[&str]) -> Result<Vec<QueueStatus>> {
        let names: Vec<String> = if queue_names.is_empty() {
            self.get_queue_names().await?
        } else {
            queue_names.iter().map(|s| s.to_string()).collect()
        };
        let mut result = Vec::with_capacity(names.len());
        for name in names {
            match self.get_queue_status(&name).await {
                Ok(status) => result.push(status),
                Err(e) => result.push(QueueStatus::new(name, Some(Arc::new(e)), None)),
            }
        }
        Ok(result)
    }

    /// Submit a batch job. The description is copied; the caller keeps
    /// ownership of its own instance.
    async fn submit_batch_job(&self, description: &JobDescription) -> Result<String>;

    /// Submit an interactive job and block until it is running (or failed to
    /// start), then hand its streams to the caller.
    async fn submit_interactive_job(&self, description: &JobDescription) -> Result<Streams>;

    async fn get_job_status(&self, job_identifier: &str) -> Result<JobStatus>;

    /// Bulk variant of [`get_job_status`](Scheduler::get_job_status);
    /// per-job failures are embedded in the corresponding entry.
    async fn get_job_statuses(&self, job_identifiers: &[&str]) -> Vec<JobStatus> {
        let mut result = Vec::with_capacity(job_identifiers.len());
        for id in job_identifiers {
            match self.get_job_status(id).await {
                Ok(status) => result.push(status),
                Err(e) => result.push(JobStatus::from_error(*id, e)),
            }
        }
        result
    }

    async fn cancel_job(&self, job_identifier: &str) -> Result<JobStatus>;

    async fn wait_until_done(&self, job_identifier: &str, timeout_ms: u64) -> Result<JobStatus>;

    async fn wait_until_running(&self, job_identifier: &str, timeout_ms: u64) -> Result<JobStatus>;

    /// The filesystem this scheduler stages its jobs on.
    async fn get_file_system(&self) -> Result<FileSystem>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

/// Create a scheduler on the given adaptor.
pub async fn create_scheduler(
    adaptor: &str,
    location: &str,
    credential: &Credential,
    properties: &HashMap<String, String>,
) -> Result<Box<dyn Scheduler>> {
    match adaptor {
        crate::local::ADAPTOR_NAME => {
            crate::local::create_scheduler(location, credential, properties).await
        }
        _ => Err(Error::new(
            ErrorKind::UnknownAdaptor,
            adaptor,
            format!("unknown scheduler adaptor: {adaptor}"),
        )),
    }
}

// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::errors::Error;

/// Everything a caller can say about a job before submitting it.
///
/// Descriptions are plain data: the scheduler copies them on submit, so a
/// caller may reuse and mutate its own instance freely afterwards.
/// `environment` is a sorted map so that anything generated from it (submit
/// scripts in particular) is deterministic; variable names are unique and
/// their relative order carries no meaning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescription {
    /// The executable to run. The only field without a usable default.
    pub executable: Option<String>,
    pub arguments: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub working_directory: Option<String>,
    pub queue_name: Option<String>,
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    /// Total number of tasks, at least 1.
    pub tasks: u32,
    /// Tasks per node; 0 leaves the choice to the back-end.
    pub tasks_per_node: u32,
    /// Cores per task, at least 1.
    pub cores_per_task: u32,
    /// Maximum memory in MiB; 0 means unset.
    pub max_memory: u64,
    /// Temporary space in MiB; 0 means unset.
    pub temp_space: u64,
    /// Maximum runtime in minutes. `-1` selects the adaptor default; `0` is
    /// rejected by script-driven back-ends.
    pub max_runtime: i64,
    /// Passed to the back-end verbatim, in order.
    pub scheduler_arguments: Vec<String>,
    /// Launch the command once per task through the back-end's task starter.
    pub start_per_task: bool,
    pub name: Option<String>,
}

impl Default for JobDescription {
    fn default() -> Self {
        Self {
            executable: None,
            arguments: Vec::new(),
            environment: BTreeMap::new(),
            working_directory: None,
            queue_name: None,
            stdin: None,
            stdout: None,
            stderr: None,
            tasks: 1,
            tasks_per_node: 0,
            cores_per_task: 1,
            max_memory: 0,
            temp_space: 0,
            max_runtime: -1,
            scheduler_arguments: Vec::new(),
            start_per_task: false,
            name: None,
        }
    }
}

/// A point-in-time observation of a submitted job.
#[derive(Debug, Clone)]
pub struct JobStatus {
    job_identifier: String,
    name: Option<String>,
    state: String,
    exit_code: Option<i32>,
    error: Option<Arc<Error>>,
    running: bool,
    done: bool,
    scheduler_specific: Option<HashMap<String, String>>,
}

impl JobStatus {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_identifier: impl Into<String>,
        name: Option<String>,
        state: impl Into<String>,
        exit_code: Option<i32>,
        error: Option<Arc<Error>>,
        running: bool,
        done: bool,
        scheduler_specific: Option<HashMap<String, String>>,
    ) -> Self {
        Self {
            job_identifier: job_identifier.into(),
            name,
            state: state.into(),
            exit_code,
            error,
            running,
            done,
            scheduler_specific,
        }
    }

    /// A status embedding a lookup failure, used by the bulk calls so a
    /// single unknown identifier does not abort the whole batch.
    pub fn from_error(job_identifier: impl Into<String>, error: Error) -> Self {
        Self {
            job_identifier: job_identifier.into(),
            name: None,
            state: "UNKNOWN".to_string(),
            exit_code: None,
            error: Some(Arc::new(error)),
            running: false,
            done: false,
            scheduler_specific: None,
        }
    }

    pub fn job_identifier(&self) -> &str {
        &self.job_identifier
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn error(&self) -> Option<&Arc<Error>> {
        self.error.as_ref()
    }

    pub fn has_exception(&self) -> bool {
        self.error.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn scheduler_specific_information(&self) -> Option<&HashMap<String, String>> {
        self.scheduler_specific.as_ref()
    }
}

/// Status of a queue as reported by a scheduler. Bulk lookups embed
/// per-queue failures here instead of aborting.
#[derive(Debug, Clone)]
pub struct QueueStatus {
    queue_name: String,
    error: Option<Arc<Error>>,
    scheduler_specific: Option<HashMap<String, String>>,
}

impl QueueStatus {
    pub fn new(
        queue_name: impl Into<String>,
        error: Option<Arc<Error>>,
        scheduler_specific: Option<HashMap<String, String>>,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            error,
            scheduler_specific,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn error(&self) -> Option<&Arc<Error>> {
        self.error.as_ref()
    }

    pub fn has_exception(&self) -> bool {
        self.error.is_some()
    }

    pub fn scheduler_specific_information(&self) -> Option<&HashMap<String, String>> {
        self.scheduler_specific.as_ref()
    }
}

/// Live stream handles of an interactive job. Handed to the caller by value;
/// the job keeps running after the streams are dropped.
pub struct Streams {
    job_identifier: String,
    stdin: Box<dyn AsyncWrite + Send + Unpin>,
    stdout: Box<dyn AsyncRead + Send + Unpin>,
    stderr: Box<dyn AsyncRead + Send + Unpin>,
}

impl Streams {
    pub fn new(
        job_identifier: impl Into<String>,
        stdin: Box<dyn AsyncWrite + Send + Unpin>,
        stdout: Box<dyn AsyncRead + Send + Unpin>,
        stderr: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Self {
        Self {
            job_identifier: job_identifier.into(),
            stdin,
            stdout,
            stderr,
        }
    }

    pub fn job_identifier(&self) -> &str {
        &self.job_identifier
    }

    /// Split into the job identifier and the three stream handles so they can
    /// be driven concurrently.
    #[allow(clippy::type_complexity)]
    pub fn into_parts(
        self,
    ) -> (
        String,
        Box<dyn AsyncWrite + Send + Unpin>,
        Box<dyn AsyncRead + Send + Unpin>,
        Box<dyn AsyncRead + Send + Unpin>,
    ) {
        (self.job_identifier, self.stdin, self.stdout, self.stderr)
    }
}

impl std::fmt::Debug for Streams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Streams")
            .field("job_identifier", &self.job_identifier)
            .finish_non_exhaustive()
    }
}

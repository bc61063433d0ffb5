// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::errors::{Error, ErrorKind};
use crate::filesystem::FileSystem;
use crate::jobs::{JobDescription, JobStatus, Streams};
use crate::path::Path;
use crate::queue::process::{BatchProcess, InteractiveProcessFactory, Process};
use crate::util;

/// Fallback wait used when an observer asks for an update without a bound.
const DEFAULT_POLLING_DELAY: u64 = 1000;

const MILLISECONDS_PER_MINUTE: u64 = 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Done,
    Error,
    Killed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Done => "DONE",
            JobState::Error => "ERROR",
            JobState::Killed => "KILLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Error | JobState::Killed)
    }
}

/// Everything observers can see of an executor, broadcast on a watch channel
/// so waits are spurious-wakeup-safe by construction.
struct Snapshot {
    state: JobState,
    exit_status: Option<i32>,
    has_run: bool,
    killed: bool,
    done: bool,
    /// Set once the driver has started; from then on a kill must go through
    /// the driver loop instead of being synthesized.
    driver_active: bool,
    update_signal: bool,
    error: Option<Arc<Error>>,
}

/// Runs a single job: resolves its working directory, starts the process,
/// then polls it until it finishes, is killed, or runs out of time.
///
/// One driver task calls [`run`](JobExecutor::run) exactly once; any number
/// of observers may poll and wait concurrently.
pub struct JobExecutor {
    adaptor_name: String,
    job_identifier: String,
    description: JobDescription,
    interactive: bool,
    filesystem: FileSystem,
    working_directory: Path,
    factory: Arc<dyn InteractiveProcessFactory>,
    polling_delay: u64,
    startup_timeout: u64,
    state_tx: watch::Sender<Snapshot>,
    nudge_tx: watch::Sender<()>,
    streams: Mutex<Option<Streams>>,
}

impl JobExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        adaptor_name: impl Into<String>,
        filesystem: FileSystem,
        working_directory: Path,
        factory: Arc<dyn InteractiveProcessFactory>,
        description: JobDescription,
        job_identifier: impl Into<String>,
        interactive: bool,
        polling_delay: u64,
        startup_timeout: u64,
    ) -> Self {
        let (state_tx, _) = watch::channel(Snapshot {
            state: JobState::Pending,
            exit_status: None,
            has_run: false,
            killed: false,
            done: false,
            driver_active: false,
            update_signal: false,
            error: None,
        });
        let (nudge_tx, _) = watch::channel(());
        Self {
            adaptor_name: adaptor_name.into(),
            job_identifier: job_identifier.into(),
            description,
            interactive,
            filesystem,
            working_directory,
            factory,
            polling_delay,
            startup_timeout,
            state_tx,
            nudge_tx,
            streams: Mutex::new(None),
        }
    }

    pub fn job_identifier(&self) -> &str {
        &self.job_identifier
    }

    pub fn job_description(&self) -> &JobDescription {
        &self.description
    }

    pub fn is_done(&self) -> bool {
        self.state_tx.borrow().done
    }

    pub fn has_run(&self) -> bool {
        self.state_tx.borrow().has_run
    }

    pub fn error(&self) -> Option<Arc<Error>> {
        self.state_tx.borrow().error.clone()
    }

    /// Ask the job to die. Returns true when the job is already terminal
    /// afterwards: it had finished before, or it had not started and a
    /// `KILLED` status was synthesized on the spot. Returns false when a
    /// running process still has to be destroyed by the driver.
    pub fn kill(&self) -> bool {
        let mut terminal = false;
        self.state_tx.send_modify(|s| {
            if s.done {
                terminal = true;
                return;
            }
            s.killed = true;
            if !s.driver_active {
                s.state = JobState::Killed;
                s.done = true;
                s.error = Some(Arc::new(Error::new(
                    ErrorKind::JobCanceled,
                    &self.adaptor_name,
                    "process cancelled by user",
                )));
                terminal = true;
            }
        });
        self.nudge();
        terminal
    }

    /// Take the interactive streams. They are handed out once.
    pub fn take_streams(&self) -> crate::errors::Result<Streams> {
        self.streams.lock().unwrap().take().ok_or_else(|| {
            Error::new(
                ErrorKind::Internal,
                &self.adaptor_name,
                "streams not available",
            )
        })
    }

    /// Current status. When the job is running, the driver is nudged first
    /// and given one polling interval to refresh, so the answer is at most
    /// one poll old.
    pub async fn get_status(&self) -> JobStatus {
        let (done, running) = {
            let s = self.state_tx.borrow();
            (s.done, s.state == JobState::Running)
        };
        if !done && running {
            self.trigger_status_update();
            self.wait_for_status_update(self.polling_delay).await;
        }
        self.snapshot_status()
    }

    fn snapshot_status(&self) -> JobStatus {
        let s = self.state_tx.borrow();
        JobStatus::new(
            &self.job_identifier,
            self.description.name.clone(),
            s.state.as_str(),
            s.exit_status,
            s.error.clone(),
            s.state == JobState::Running,
            s.done,
            None,
        )
    }

    /// Wait until the job has left `PENDING`, or until the timeout expires
    /// (0 = wait indefinitely).
    pub async fn wait_until_running(&self, timeout_ms: u64) -> JobStatus {
        self.trigger_status_update();
        let mut rx = self.state_tx.subscribe();
        let wait = rx.wait_for(|s| s.state != JobState::Pending);
        match util::deadline(timeout_ms) {
            Some(at) => {
                let _ = tokio::time::timeout_at(at, wait).await;
            }
            None => {
                let _ = wait.await;
            }
        }
        self.get_status().await
    }

    /// Wait until the job is terminal, or until the timeout expires
    /// (0 = wait indefinitely).
    pub async fn wait_until_done(&self, timeout_ms: u64) -> JobStatus {
        self.trigger_status_update();
        let mut rx = self.state_tx.subscribe();
        let wait = rx.wait_for(|s| s.done);
        match util::deadline(timeout_ms) {
            Some(at) => {
                let _ = tokio::time::timeout_at(at, wait).await;
            }
            None => {
                let _ = wait.await;
            }
        }
        self.get_status().await
    }

    /// Ask the driver for an eager re-poll.
    pub fn trigger_status_update(&self) {
        let mut changed = false;
        self.state_tx.send_modify(|s| {
            if !s.done {
                s.update_signal = true;
                changed = true;
            }
        });
        if changed {
            self.nudge();
        }
    }

    /// Wait until the driver has served the pending update request, bounded
    /// by `max_delay` ms.
    async fn wait_for_status_update(&self, max_delay: u64) {
        {
            let s = self.state_tx.borrow();
            if s.done || !s.update_signal {
                return;
            }
        }
        let delay = if max_delay > 0 {
            max_delay
        } else {
            DEFAULT_POLLING_DELAY
        };
        let mut rx = self.state_tx.subscribe();
        let _ = tokio::time::timeout(
            Duration::from_millis(delay),
            rx.wait_for(|s| s.done || !s.update_signal),
        )
        .await;
    }

    fn nudge(&self) {
        self.nudge_tx.send_replace(());
    }

    fn clear_update_request(&self) {
        self.state_tx.send_modify(|s| s.update_signal = false);
    }

    /// Sleep between polls, bounded by `max_delay` and cut short by a nudge.
    async fn sleep(&self, nudges: &mut watch::Receiver<()>, max_delay: u64) {
        {
            let s = self.state_tx.borrow();
            if s.done || s.update_signal {
                return;
            }
        }
        let _ = tokio::time::timeout(Duration::from_millis(max_delay), nudges.changed()).await;
    }

    /// Mark the driver active and read the kill flag, in one step so a
    /// concurrent `kill` either synthesizes the terminal state itself or is
    /// observed here.
    fn observed_killed(&self) -> bool {
        let mut killed = false;
        self.state_tx.send_modify(|s| {
            s.driver_active = true;
            killed = s.killed;
        });
        killed
    }

    fn update_state(&self, state: JobState, exit_status: i32, error: Option<Error>) {
        self.state_tx.send_modify(|s| {
            match state {
                JobState::Error | JobState::Killed => {
                    s.error = error.map(Arc::new);
                    s.done = true;
                }
                JobState::Done => {
                    s.exit_status = Some(exit_status);
                    s.done = true;
                }
                JobState::Running => {
                    s.has_run = true;
                }
                JobState::Pending => unreachable!("no transition back to PENDING"),
            }
            s.state = state;
            s.update_signal = false;
        });
    }

    fn canceled(&self, message: &str) -> Error {
        Error::new(ErrorKind::JobCanceled, &self.adaptor_name, message)
    }

    fn resolve_working_directory(&self) -> Path {
        match self.description.working_directory.as_deref() {
            None => self.working_directory.clone(),
            Some(p) => {
                let p = Path::new(p);
                if p.is_absolute() {
                    p
                } else {
                    self.working_directory.resolve(&p)
                }
            }
        }
    }

    /// The driver. Runs on a queue worker; everything it learns is published
    /// through the watch channel.
    pub async fn run(&self) {
        let mut nudges = self.nudge_tx.subscribe();

        log::debug!("{}/{} starting job", self.adaptor_name, self.job_identifier);

        if self.observed_killed() {
            self.update_state(
                JobState::Killed,
                -1,
                Some(self.canceled("process cancelled by user")),
            );
            log::debug!("{}/{} killed before start", self.adaptor_name, self.job_identifier);
            return;
        }

        let end_time = if self.description.max_runtime > 0 {
            Some(
                Instant::now()
                    + Duration::from_millis(
                        self.description.max_runtime as u64 * MILLISECONDS_PER_MINUTE,
                    ),
            )
        } else {
            None
        };

        let workdir = self.resolve_working_directory();

        match self.filesystem.exists(&workdir).await {
            Ok(true) => {}
            Ok(false) => {
                self.update_state(
                    JobState::Error,
                    -1,
                    Some(Error::new(
                        ErrorKind::InvalidPath,
                        &self.adaptor_name,
                        format!("working directory {workdir} does not exist"),
                    )),
                );
                return;
            }
            Err(e) => {
                self.update_state(JobState::Error, -1, Some(e));
                return;
            }
        }

        let mut process: Box<dyn Process> = if self.interactive {
            match self
                .factory
                .create_interactive_process(
                    &self.description,
                    &workdir.to_string(),
                    &self.job_identifier,
                    self.startup_timeout,
                )
                .await
            {
                Ok((process, streams)) => {
                    *self.streams.lock().unwrap() = Some(streams);
                    process
                }
                Err(e) => {
                    log::debug!("{}/{} error: {e}", self.adaptor_name, self.job_identifier);
                    self.update_state(JobState::Error, -1, Some(e));
                    return;
                }
            }
        } else {
            match BatchProcess::start(
                &self.description,
                &workdir.to_string(),
                &self.job_identifier,
                self.factory.as_ref(),
                self.startup_timeout,
            )
            .await
            {
                Ok(process) => Box::new(process),
                Err(e) => {
                    log::debug!("{}/{} error: {e}", self.adaptor_name, self.job_identifier);
                    self.update_state(JobState::Error, -1, Some(e));
                    return;
                }
            }
        };

        self.update_state(JobState::Running, -1, None);

        loop {
            if process.is_done().await {
                self.update_state(JobState::Done, process.exit_status(), None);
                log::debug!(
                    "{}/{} done with exit {}",
                    self.adaptor_name,
                    self.job_identifier,
                    process.exit_status()
                );
                return;
            }

            if self.observed_killed() {
                // Destroy first, publish last: a status reader must never see
                // KILLED while the process is still alive.
                process.destroy().await;
                self.update_state(
                    JobState::Killed,
                    -1,
                    Some(self.canceled("process cancelled by user")),
                );
                return;
            }

            if let Some(end) = end_time {
                if Instant::now() > end {
                    process.destroy().await;
                    self.update_state(JobState::Killed, -1, Some(self.canceled("process timed out")));
                    return;
                }
            }

            self.clear_update_request();
            self.sleep(&mut nudges, self.polling_delay).await;
        }
    }
}

// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! The SLURM dialect: submit-script and argument generation, output parsing
//! and state classification. The driving loop lives in
//! [`SlurmScheduler`](scheduler::SlurmScheduler).

mod scheduler;

pub use scheduler::SlurmScheduler;

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::errors::{Error, ErrorKind, Result};
use crate::jobs::{JobDescription, JobStatus, QueueStatus};
use crate::path::Path;
use crate::scripting::{protect_against_shell_metas, verify_job_info, working_dir_path};

pub const ADAPTOR_NAME: &str = "slurm";

/// Job name used when a description does not carry one.
const DEFAULT_JOB_NAME: &str = "xenon";

/// States of a job that gave up: terminated abnormally, was cancelled, lost
/// its nodes, ran out of time, was preempted, or failed to launch.
const FAILED_STATES: [&str; 6] = [
    "FAILED",
    "CANCELLED",
    "NODE_FAIL",
    "TIMEOUT",
    "PREEMPTED",
    "BOOT_FAIL",
];

/// States of a job that is executing, including resource preparation and
/// wind-down.
const RUNNING_STATES: [&str; 3] = ["CONFIGURING", "RUNNING", "COMPLETING"];

/// States of a job that holds or awaits an allocation without executing.
const PENDING_STATES: [&str; 4] = ["PENDING", "STOPPED", "SUSPENDED", "SPECIAL_EXIT"];

/// The job terminated and every process returned exit code 0.
const DONE_STATE: &str = "COMPLETED";

pub fn is_running_state(state: &str) -> bool {
    RUNNING_STATES.iter().any(|s| state.starts_with(s))
}

pub fn is_pending_state(state: &str) -> bool {
    PENDING_STATES.iter().any(|s| state.starts_with(s))
}

pub fn is_failed_state(state: &str) -> bool {
    FAILED_STATES.iter().any(|s| state.starts_with(s))
}

pub fn is_done_state(state: &str) -> bool {
    state == DONE_STATE
}

pub fn is_done_or_failed_state(state: &str) -> bool {
    is_done_state(state) || is_failed_state(state)
}

/// Parse the `ExitCode` field. The code may carry a `:<signal>` suffix,
/// which is ignored; a non-numeric code is an error.
pub fn exit_code_from_string(value: Option<&str>) -> Result<Option<i32>> {
    let Some(value) = value else {
        return Ok(None);
    };
    let code = value.split(':').next().unwrap_or(value);
    code.parse::<i32>().map(Some).map_err(|e| {
        Error::wrapped(
            ErrorKind::Internal,
            ADAPTOR_NAME,
            format!("job exit code \"{code}\" is not a number"),
            e,
        )
    })
}

fn failure_error(state: &str, reason: Option<&str>) -> Error {
    if state.starts_with("CANCELLED") {
        return Error::new(
            ErrorKind::JobCanceled,
            ADAPTOR_NAME,
            format!("job {}", state.to_lowercase()),
        );
    }
    match reason {
        Some(reason) if reason != "None" => Error::new(
            ErrorKind::Internal,
            ADAPTOR_NAME,
            format!("job failed with state \"{state}\" and reason: {reason}"),
        ),
        Some(_) => Error::new(
            ErrorKind::Internal,
            ADAPTOR_NAME,
            format!("job failed with state \"{state}\" for unknown reason"),
        ),
        None => Error::new(
            ErrorKind::Internal,
            ADAPTOR_NAME,
            "job failed for unknown reason",
        ),
    }
}

/// Derive a status from the accounting dump (record-per-job map keyed by
/// job id). `None` when the job does not appear in the dump.
pub fn job_status_from_sacct_info(
    info: &HashMap<String, HashMap<String, String>>,
    job_identifier: &str,
) -> Result<Option<JobStatus>> {
    let Some(job_info) = info.get(job_identifier) else {
        log::debug!("job {job_identifier} not found in accounting output");
        return Ok(None);
    };

    verify_job_info(
        job_info,
        job_identifier,
        ADAPTOR_NAME,
        "JobID",
        &["JobName", "State", "ExitCode"],
    )?;

    let state = job_info.get("State").cloned().unwrap_or_default();
    let exit_code = exit_code_from_string(job_info.get("ExitCode").map(String::as_str))?;

    // A FAILED state with a nonzero exit code is the user's process failing,
    // not the resource manager; that is not an error of the job run itself.
    let error = if !is_failed_state(&state)
        || (state == "FAILED" && exit_code.is_some_and(|c| c != 0))
    {
        None
    } else {
        Some(failure_error(&state, None))
    };

    Ok(Some(JobStatus::new(
        job_identifier,
        job_info.get("JobName").cloned(),
        &state,
        exit_code,
        error.map(Arc::new),
        is_running_state(&state),
        is_done_or_failed_state(&state),
        Some(job_info.clone()),
    )))
}

/// Derive a status from a single `key=value` control record. A record that
/// fails verification is treated as "job unknown": some resource-manager
/// versions answer with an unrelated record when they cannot parse the
/// requested id.
pub fn job_status_from_scontrol_info(
    job_info: &HashMap<String, String>,
    job_identifier: &str,
) -> Result<Option<JobStatus>> {
    if job_info.is_empty() {
        return Ok(None);
    }

    if verify_job_info(
        job_info,
        job_identifier,
        ADAPTOR_NAME,
        "JobId",
        &["JobName", "JobState", "ExitCode", "Reason"],
    )
    .is_err()
    {
        log::debug!("control record does not describe job {job_identifier}");
        return Ok(None);
    }

    let state = job_info.get("JobState").cloned().unwrap_or_default();
    let reason = job_info.get("Reason").cloned().unwrap_or_default();
    let exit_code = exit_code_from_string(job_info.get("ExitCode").map(String::as_str))?;

    let error = if !is_failed_state(&state) || (state == "FAILED" && reason == "NonZeroExitCode") {
        None
    } else {
        Some(failure_error(&state, Some(&reason)))
    };

    Ok(Some(JobStatus::new(
        job_identifier,
        job_info.get("JobName").cloned(),
        &state,
        exit_code,
        error.map(Arc::new),
        is_running_state(&state),
        is_done_or_failed_state(&state),
        Some(job_info.clone()),
    )))
}

/// Derive a status from the tabular queue listing. Jobs only appear there
/// while queued or running, so this never reports a terminal state; `None`
/// when the job has left the queue.
pub fn job_status_from_squeue_info(
    info: &HashMap<String, HashMap<String, String>>,
    job_identifier: &str,
) -> Result<Option<JobStatus>> {
    let Some(job_info) = info.get(job_identifier) else {
        log::debug!("job {job_identifier} not found in the queue");
        return Ok(None);
    };

    verify_job_info(job_info, job_identifier, ADAPTOR_NAME, "JOBID", &["NAME", "STATE"])?;

    let state = job_info.get("STATE").cloned().unwrap_or_default();

    Ok(Some(JobStatus::new(
        job_identifier,
        job_info.get("NAME").cloned(),
        &state,
        None,
        None,
        is_running_state(&state),
        false,
        Some(job_info.clone()),
    )))
}

/// Status of one queue out of the parsed queue-status listing.
pub fn queue_status_from_sinfo(
    info: &HashMap<String, HashMap<String, String>>,
    queue_name: &str,
) -> Option<QueueStatus> {
    info.get(queue_name)
        .map(|queue_info| QueueStatus::new(queue_name, None, Some(queue_info.clone())))
}

/// Checks applied before anything is generated. Interactive jobs are limited
/// by what survives the interactive transport: no redirections beyond the
/// fixed defaults and no environment exports.
pub fn verify_job_description(
    description: &JobDescription,
    queue_names: &[String],
    interactive: bool,
) -> Result<()> {
    if interactive {
        if description.stdin.is_some() {
            return Err(Error::new(
                ErrorKind::InvalidJobDescription,
                ADAPTOR_NAME,
                "stdin redirect not supported in interactive mode",
            ));
        }
        if description.stdout.as_deref().is_some_and(|s| s != "stdout.txt") {
            return Err(Error::new(
                ErrorKind::InvalidJobDescription,
                ADAPTOR_NAME,
                "stdout redirect not supported in interactive mode",
            ));
        }
        if description.stderr.as_deref().is_some_and(|s| s != "stderr.txt") {
            return Err(Error::new(
                ErrorKind::InvalidJobDescription,
                ADAPTOR_NAME,
                "stderr redirect not supported in interactive mode",
            ));
        }
        if !description.environment.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidJobDescription,
                ADAPTOR_NAME,
                "environment variables not supported in interactive mode",
            ));
        }
    }

    crate::scripting::verify_job_description(description, queue_names, ADAPTOR_NAME)?;

    if description.max_runtime == 0 {
        return Err(Error::new(
            ErrorKind::InvalidJobDescription,
            ADAPTOR_NAME,
            "illegal maximum runtime: 0",
        ));
    }

    Ok(())
}

/// The argument vector for an interactive run. The `--job-name` tag is how
/// the job is found back in the queue listing afterwards.
pub fn generate_interactive_arguments(
    description: &JobDescription,
    fs_entry_path: &Path,
    tag: &str,
    default_runtime: i64,
) -> Vec<String> {
    let mut arguments = Vec::new();

    // suppress status messages mixed into the output streams
    arguments.push("--quiet".to_string());

    arguments.push(format!("--job-name={tag}"));

    if let Some(path) = working_dir_path(description, fs_entry_path) {
        arguments.push(format!("--chdir={path}"));
    }

    if let Some(queue) = &description.queue_name {
        arguments.push(format!("--partition={queue}"));
    }

    arguments.push(format!("--ntasks={}", description.tasks));

    if description.tasks_per_node > 0 {
        arguments.push(format!("--ntasks-per-node={}", description.tasks_per_node));
    }

    arguments.push(format!("--cpus-per-task={}", description.cores_per_task));

    if description.max_memory > 0 {
        arguments.push(format!("--mem={}M", description.max_memory));
    }

    if description.temp_space > 0 {
        arguments.push(format!("--tmp={}M", description.temp_space));
    }

    let runtime = if description.max_runtime == -1 {
        default_runtime
    } else {
        description.max_runtime
    };
    arguments.push(format!("--time={runtime}"));

    arguments.extend(description.scheduler_arguments.iter().cloned());

    if let Some(executable) = &description.executable {
        arguments.push(executable.clone());
    }
    arguments.extend(description.arguments.iter().cloned());

    arguments
}

/// Generate the submit script for a batch job.
pub fn generate(description: &JobDescription, fs_entry_path: &Path, default_runtime: i64) -> String {
    let mut script = String::new();

    let _ = writeln!(script, "#!/bin/sh");

    let name = match description.name.as_deref() {
        Some(name) if !name.trim().is_empty() => name,
        _ => DEFAULT_JOB_NAME,
    };
    let _ = writeln!(script, "#SBATCH --job-name='{name}'");

    // The short -D form predates the rename of the long working-directory
    // option and is understood by every dialect version.
    if let Some(path) = working_dir_path(description, fs_entry_path) {
        let _ = writeln!(script, "#SBATCH -D '{path}'");
    }

    if let Some(queue) = &description.queue_name {
        let _ = writeln!(script, "#SBATCH --partition={queue}");
    }

    let _ = writeln!(script, "#SBATCH --ntasks={}", description.tasks);

    let _ = writeln!(script, "#SBATCH --cpus-per-task={}", description.cores_per_task);

    if description.tasks_per_node > 0 {
        let _ = writeln!(script, "#SBATCH --ntasks-per-node={}", description.tasks_per_node);
    }

    let runtime = if description.max_runtime == -1 {
        default_runtime
    } else {
        description.max_runtime
    };
    let _ = writeln!(script, "#SBATCH --time={runtime}");

    if description.max_memory > 0 {
        let _ = writeln!(script, "#SBATCH --mem={}M", description.max_memory);
    }

    if description.temp_space > 0 {
        let _ = writeln!(script, "#SBATCH --tmp={}M", description.temp_space);
    }

    if let Some(stdin) = &description.stdin {
        let _ = writeln!(script, "#SBATCH --input='{stdin}'");
    }

    // %j expansion of the job id inside the paths is handled by the
    // resource manager itself.
    match &description.stdout {
        None => {
            let _ = writeln!(script, "#SBATCH --output=/dev/null");
        }
        Some(stdout) => {
            let _ = writeln!(script, "#SBATCH --output='{stdout}'");
        }
    }
    match &description.stderr {
        None => {
            let _ = writeln!(script, "#SBATCH --error=/dev/null");
        }
        Some(stderr) => {
            let _ = writeln!(script, "#SBATCH --error='{stderr}'");
        }
    }

    for argument in &description.scheduler_arguments {
        let _ = writeln!(script, "#SBATCH {argument}");
    }

    for (key, value) in &description.environment {
        let _ = writeln!(script, "export {key}=\"{value}\"");
    }

    let _ = writeln!(script);

    if description.start_per_task {
        script.push_str("srun ");
    }

    if let Some(executable) = &description.executable {
        script.push_str(executable);
    }
    for argument in &description.arguments {
        script.push(' ');
        script.push_str(&protect_against_shell_metas(argument));
    }
    script.push('\n');

    log::debug!("created job script:\n{script}");

    script
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn states_classify_by_prefix() {
        assert!(is_failed_state("CANCELLED+"));
        assert!(is_failed_state("FAILED"));
        assert!(is_running_state("RUNNING+0"));
        assert!(is_running_state("COMPLETING"));
        assert!(is_pending_state("PENDING"));
        assert!(is_pending_state("SUSPENDED"));
        assert!(is_done_state("COMPLETED"));
        assert!(!is_done_state("COMPLETED+"));
        assert!(!is_failed_state("RUNNING"));
        assert!(is_done_or_failed_state("TIMEOUT"));
    }

    #[test]
    fn exit_codes_drop_the_signal_suffix() {
        assert_eq!(exit_code_from_string(Some("2:15")).unwrap(), Some(2));
        assert_eq!(exit_code_from_string(Some("0:0")).unwrap(), Some(0));
        assert_eq!(exit_code_from_string(Some("137")).unwrap(), Some(137));
        assert_eq!(exit_code_from_string(None).unwrap(), None);
        assert!(exit_code_from_string(Some("abc")).is_err());
    }

    fn sacct_record(state: &str, exit: &str) -> HashMap<String, HashMap<String, String>> {
        let record = HashMap::from([
            ("JobID".to_string(), "42".to_string()),
            ("JobName".to_string(), "demo".to_string()),
            ("State".to_string(), state.to_string()),
            ("ExitCode".to_string(), exit.to_string()),
        ]);
        HashMap::from([("42".to_string(), record)])
    }

    #[test]
    fn accounting_status_for_a_completed_job() {
        let status = job_status_from_sacct_info(&sacct_record("COMPLETED", "0:0"), "42")
            .unwrap()
            .unwrap();
        assert_eq!(status.state(), "COMPLETED");
        assert_eq!(status.exit_code(), Some(0));
        assert!(status.is_done());
        assert!(!status.is_running());
        assert!(!status.has_exception());
        assert_eq!(status.name(), Some("demo"));
    }

    #[test]
    fn user_process_failure_is_not_an_engine_error() {
        let status = job_status_from_sacct_info(&sacct_record("FAILED", "1:0"), "42")
            .unwrap()
            .unwrap();
        assert!(status.is_done());
        assert_eq!(status.exit_code(), Some(1));
        assert!(!status.has_exception());
    }

    #[test]
    fn cancelled_jobs_carry_a_cancellation_error() {
        let status = job_status_from_sacct_info(&sacct_record("CANCELLED by 1000", "0:15"), "42")
            .unwrap()
            .unwrap();
        assert!(status.is_done());
        assert_eq!(
            status.error().unwrap().kind(),
            crate::errors::ErrorKind::JobCanceled
        );
    }

    #[test]
    fn node_failure_is_an_unknown_reason_error() {
        let status = job_status_from_sacct_info(&sacct_record("NODE_FAIL", "0:0"), "42")
            .unwrap()
            .unwrap();
        assert!(status.has_exception());
        assert_eq!(
            status.error().unwrap().kind(),
            crate::errors::ErrorKind::Internal
        );
    }

    #[test]
    fn accounting_record_for_the_wrong_job_is_an_error() {
        let missing = job_status_from_sacct_info(&sacct_record("COMPLETED", "0:0"), "43").unwrap();
        assert!(missing.is_none());
        let mut info = sacct_record("COMPLETED", "0:0");
        let record = info["42"].clone();
        info.insert("43".to_string(), record);
        assert!(job_status_from_sacct_info(&info, "43").is_err());
    }

    fn scontrol_record(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn control_record_mismatch_is_treated_as_unknown() {
        let record = scontrol_record(&[
            ("JobId", "7"),
            ("JobName", "x"),
            ("JobState", "RUNNING"),
            ("ExitCode", "0:0"),
            ("Reason", "None"),
        ]);
        assert!(job_status_from_scontrol_info(&record, "42").unwrap().is_none());
        assert!(job_status_from_scontrol_info(&HashMap::new(), "42").unwrap().is_none());
    }

    #[test]
    fn control_record_reason_feeds_the_error() {
        let record = scontrol_record(&[
            ("JobId", "42"),
            ("JobName", "x"),
            ("JobState", "FAILED"),
            ("ExitCode", "0:0"),
            ("Reason", "launch failed requeued held"),
        ]);
        let status = job_status_from_scontrol_info(&record, "42").unwrap().unwrap();
        let error = status.error().unwrap();
        assert!(error.message().contains("launch failed requeued held"));

        let record = scontrol_record(&[
            ("JobId", "42"),
            ("JobName", "x"),
            ("JobState", "FAILED"),
            ("ExitCode", "1:0"),
            ("Reason", "NonZeroExitCode"),
        ]);
        let status = job_status_from_scontrol_info(&record, "42").unwrap().unwrap();
        assert!(!status.has_exception());
    }

    #[test]
    fn queue_listing_never_reports_terminal_states() {
        let record = HashMap::from([
            ("JOBID".to_string(), "42".to_string()),
            ("NAME".to_string(), "demo".to_string()),
            ("STATE".to_string(), "PENDING".to_string()),
        ]);
        let info = HashMap::from([("42".to_string(), record)]);
        let status = job_status_from_squeue_info(&info, "42").unwrap().unwrap();
        assert!(!status.is_done());
        assert!(!status.is_running());
        assert_eq!(status.state(), "PENDING");
        assert!(job_status_from_squeue_info(&info, "99").unwrap().is_none());
    }

    #[test]
    fn interactive_mode_forbids_redirects_and_environment() {
        let queues = vec!["debug".to_string()];
        let base = JobDescription {
            executable: Some("/bin/date".to_string()),
            ..Default::default()
        };

        assert!(verify_job_description(&base, &queues, true).is_ok());

        let mut with_env = base.clone();
        with_env.environment = BTreeMap::from([("A".to_string(), "1".to_string())]);
        assert!(verify_job_description(&with_env, &queues, true).is_err());
        assert!(verify_job_description(&with_env, &queues, false).is_ok());

        let mut with_stdout = base.clone();
        with_stdout.stdout = Some("stdout.txt".to_string());
        assert!(verify_job_description(&with_stdout, &queues, true).is_ok());
        with_stdout.stdout = Some("other.txt".to_string());
        assert!(verify_job_description(&with_stdout, &queues, true).is_err());
    }

    #[test]
    fn zero_runtime_is_rejected() {
        let description = JobDescription {
            executable: Some("/bin/date".to_string()),
            max_runtime: 0,
            ..Default::default()
        };
        let err = verify_job_description(&description, &[], false).unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::InvalidJobDescription);
    }

    #[test]
    fn generates_the_full_submit_script() {
        let description = JobDescription {
            executable: Some("/bin/myjob".to_string()),
            arguments: vec!["a b".to_string(), "c".to_string()],
            environment: BTreeMap::from([
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "2".to_string()),
            ]),
            queue_name: Some("short".to_string()),
            name: Some("J".to_string()),
            tasks: 4,
            cores_per_task: 2,
            max_runtime: 30,
            start_per_task: true,
            ..Default::default()
        };

        let script = generate(&description, &Path::new("/home/user"), 15);
        let expected = "#!/bin/sh\n\
                        #SBATCH --job-name='J'\n\
                        #SBATCH --partition=short\n\
                        #SBATCH --ntasks=4\n\
                        #SBATCH --cpus-per-task=2\n\
                        #SBATCH --time=30\n\
                        #SBATCH --output=/dev/null\n\
                        #SBATCH --error=/dev/null\n\
                        export A=\"1\"\n\
                        export B=\"2\"\n\
                        \n\
                        srun /bin/myjob 'a b' c\n";
        assert_eq!(script, expected);
    }

    #[test]
    fn script_carries_optional_resources_and_redirects() {
        let description = JobDescription {
            executable: Some("solver".to_string()),
            working_directory: Some("runs/7".to_string()),
            tasks_per_node: 2,
            max_memory: 2048,
            temp_space: 512,
            stdin: Some("input.txt".to_string()),
            stdout: Some("out-%j.txt".to_string()),
            stderr: Some("err-%j.txt".to_string()),
            scheduler_arguments: vec!["--constraint=avx2".to_string()],
            max_runtime: -1,
            ..Default::default()
        };

        let script = generate(&description, &Path::new("/home/user"), 15);
        assert!(script.contains("#SBATCH --job-name='xenon'\n"));
        assert!(script.contains("#SBATCH -D '/home/user/runs/7'\n"));
        assert!(script.contains("#SBATCH --ntasks-per-node=2\n"));
        assert!(script.contains("#SBATCH --time=15\n"));
        assert!(script.contains("#SBATCH --mem=2048M\n"));
        assert!(script.contains("#SBATCH --tmp=512M\n"));
        assert!(script.contains("#SBATCH --input='input.txt'\n"));
        assert!(script.contains("#SBATCH --output='out-%j.txt'\n"));
        assert!(script.contains("#SBATCH --error='err-%j.txt'\n"));
        assert!(script.contains("#SBATCH --constraint=avx2\n"));
    }

    #[test]
    fn interactive_arguments_follow_the_wire_contract() {
        let description = JobDescription {
            executable: Some("/bin/hostname".to_string()),
            arguments: vec!["-f".to_string()],
            queue_name: Some("debug".to_string()),
            working_directory: Some("/scratch".to_string()),
            tasks: 2,
            tasks_per_node: 1,
            cores_per_task: 4,
            max_memory: 1024,
            temp_space: 256,
            max_runtime: 10,
            scheduler_arguments: vec!["--exclusive".to_string()],
            ..Default::default()
        };

        let arguments =
            generate_interactive_arguments(&description, &Path::new("/home/user"), "tag123", 15);
        assert_eq!(
            arguments,
            vec![
                "--quiet",
                "--job-name=tag123",
                "--chdir=/scratch",
                "--partition=debug",
                "--ntasks=2",
                "--ntasks-per-node=1",
                "--cpus-per-task=4",
                "--mem=1024M",
                "--tmp=256M",
                "--time=10",
                "--exclusive",
                "/bin/hostname",
                "-f",
            ]
        );
    }

    #[test]
    fn default_runtime_fills_the_time_flag() {
        let description = JobDescription {
            executable: Some("x".to_string()),
            max_runtime: -1,
            ..Default::default()
        };
        let arguments =
            generate_interactive_arguments(&description, &Path::new("/"), "t", 15);
        assert!(arguments.contains(&"--time=15".to_string()));
    }
}

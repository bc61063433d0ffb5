// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Helpers shared by scheduler back-ends that drive a line-oriented,
//! text-parsed resource manager: shell quoting, tabular and key=value output
//! parsing, and the common job-description checks.

mod runner;

pub use runner::RemoteCommandRunner;

use std::collections::HashMap;

use crate::errors::{Error, ErrorKind, Result};
use crate::jobs::JobDescription;
use crate::path::Path;

const SHELL_METAS: &str = " \t\n'\"\\$`&|;()<>*?[]{}~#";

/// Quote an argument against shell interpretation when it contains
/// meta-characters. Uses the round-trippable single-quote scheme: an embedded
/// `'` becomes `'\''`.
pub fn protect_against_shell_metas(argument: &str) -> String {
    if !argument.chars().any(|c| SHELL_METAS.contains(c)) {
        return argument.to_string();
    }
    let mut out = String::with_capacity(argument.len() + 2);
    out.push('\'');
    for c in argument.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

/// How the fields of a tabular listing are separated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSeparator {
    Whitespace,
    Bar,
}

fn split_fields(line: &str, separator: FieldSeparator) -> Vec<String> {
    match separator {
        FieldSeparator::Whitespace => line.split_whitespace().map(str::to_string).collect(),
        FieldSeparator::Bar => {
            let mut fields: Vec<String> = line.split('|').map(|f| f.trim().to_string()).collect();
            // A trailing separator produces one empty field; drop it.
            if fields.last().is_some_and(String::is_empty) {
                fields.pop();
            }
            fields
        }
    }
}

fn strip_suffixes(value: &str, ignored_suffixes: &[&str]) -> String {
    for suffix in ignored_suffixes {
        if let Some(stripped) = value.strip_suffix(suffix) {
            return stripped.to_string();
        }
    }
    value.to_string()
}

/// Parse a tabular listing (header line followed by one record per line)
/// into a map keyed by the value of `key_field`. `ignored_suffixes` are
/// stripped from headers and values; resource managers use them to mark
/// defaults (e.g. the `*` on a default partition).
pub fn parse_table(
    input: &str,
    key_field: &str,
    separator: FieldSeparator,
    adaptor: &str,
    ignored_suffixes: &[&str],
) -> Result<HashMap<String, HashMap<String, String>>> {
    let mut lines = input.lines().filter(|l| !l.trim().is_empty());

    let mut result = HashMap::new();

    let Some(header_line) = lines.next() else {
        return Ok(result);
    };

    let headers: Vec<String> = split_fields(header_line, separator)
        .iter()
        .map(|h| strip_suffixes(h, ignored_suffixes))
        .collect();

    if !headers.iter().any(|h| h == key_field) {
        return Err(Error::new(
            ErrorKind::Internal,
            adaptor,
            format!("key field \"{key_field}\" not found in header \"{header_line}\""),
        ));
    }

    for line in lines {
        let fields = split_fields(line, separator);
        if fields.len() != headers.len() {
            return Err(Error::new(
                ErrorKind::Internal,
                adaptor,
                format!(
                    "expected {} fields but got {} in line \"{line}\"",
                    headers.len(),
                    fields.len()
                ),
            ));
        }
        let mut record = HashMap::new();
        for (header, field) in headers.iter().zip(fields) {
            record.insert(header.clone(), strip_suffixes(&field, ignored_suffixes));
        }
        let Some(key) = record.get(key_field).cloned() else {
            continue;
        };
        result.insert(key, record);
    }

    Ok(result)
}

/// Parse one `key=value key=value ...` record, the format resource managers
/// use for their one-line "show" dumps. Only the first `=` of a token splits
/// key from value, so values like `TRES=cpu=1,mem=100M` survive. Tokens
/// without `=` are skipped.
pub fn parse_key_value_record(input: &str) -> HashMap<String, String> {
    let mut record = HashMap::new();
    for token in input.split_whitespace() {
        if let Some(eq) = token.find('=') {
            let (key, value_with_eq) = token.split_at(eq);
            record.insert(key.to_string(), value_with_eq[1..].to_string());
        }
    }
    record
}

/// Extract the job identifier from submit output of the shape
/// `<prefix> <id>`, e.g. `Submitted batch job 42`.
pub fn parse_job_id_from_line(output: &str, prefix: &str, adaptor: &str) -> Result<String> {
    for line in output.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix(prefix) {
            let id = rest.trim();
            if !id.is_empty() {
                return Ok(id.split_whitespace().next_back().unwrap_or(id).to_string());
            }
        }
    }
    Err(Error::new(
        ErrorKind::Internal,
        adaptor,
        format!("could not find submitted job id in output \"{output}\""),
    ))
}

/// Verify that a parsed record describes the job we asked about: the
/// required fields are present and the record's own id matches. Back-ends
/// have been observed to return an unrelated record when they fail to parse
/// the requested id, so the mismatch case must be treated as "not found"
/// rather than trusted.
pub fn verify_job_info(
    job_info: &HashMap<String, String>,
    job_identifier: &str,
    adaptor: &str,
    id_field: &str,
    required_fields: &[&str],
) -> Result<()> {
    let Some(id) = job_info.get(id_field) else {
        return Err(Error::new(
            ErrorKind::Internal,
            adaptor,
            format!("job record does not contain required field \"{id_field}\""),
        ));
    };
    if id != job_identifier {
        return Err(Error::new(
            ErrorKind::Internal,
            adaptor,
            format!("job record is for job {id}, not for {job_identifier}"),
        ));
    }
    for field in required_fields {
        if !job_info.contains_key(*field) {
            return Err(Error::new(
                ErrorKind::Internal,
                adaptor,
                format!("job record for {job_identifier} does not contain field \"{field}\""),
            ));
        }
    }
    Ok(())
}

/// The checks every scripting back-end applies before generating anything.
pub fn verify_job_description(
    description: &JobDescription,
    queue_names: &[String],
    adaptor: &str,
) -> Result<()> {
    if description.executable.is_none() {
        return Err(Error::new(
            ErrorKind::IncompleteJobDescription,
            adaptor,
            "executable missing in job description",
        ));
    }
    if description.tasks < 1 {
        return Err(Error::new(
            ErrorKind::InvalidJobDescription,
            adaptor,
            format!("illegal task count: {}", description.tasks),
        ));
    }
    if description.cores_per_task < 1 {
        return Err(Error::new(
            ErrorKind::InvalidJobDescription,
            adaptor,
            format!("illegal cores per task: {}", description.cores_per_task),
        ));
    }
    if description.max_runtime < -1 {
        return Err(Error::new(
            ErrorKind::InvalidJobDescription,
            adaptor,
            format!("illegal maximum runtime: {}", description.max_runtime),
        ));
    }
    if let Some(queue) = &description.queue_name {
        if !queue_names.iter().any(|q| q == queue) {
            return Err(Error::new(
                ErrorKind::NoSuchQueue,
                adaptor,
                format!("queue \"{queue}\" does not exist"),
            ));
        }
    }
    Ok(())
}

/// The working directory a generated script or argument vector should name:
/// an absolute working directory wins, a relative one resolves against the
/// filesystem entry path of the scheduler.
pub fn working_dir_path(description: &JobDescription, fs_entry_path: &Path) -> Option<String> {
    description.working_directory.as_ref().map(|wd| {
        let path = Path::new(wd);
        if path.is_absolute() {
            path.to_string()
        } else {
            fs_entry_path.resolve(&path).normalize().to_string()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_arguments_are_left_alone() {
        assert_eq!(protect_against_shell_metas("abc"), "abc");
        assert_eq!(protect_against_shell_metas("/bin/echo"), "/bin/echo");
        assert_eq!(protect_against_shell_metas("a-b_c.d"), "a-b_c.d");
    }

    #[test]
    fn metas_are_single_quoted() {
        assert_eq!(protect_against_shell_metas("a b"), "'a b'");
        assert_eq!(protect_against_shell_metas("a;b"), "'a;b'");
        assert_eq!(protect_against_shell_metas("$HOME"), "'$HOME'");
        assert_eq!(protect_against_shell_metas("a'b"), "'a'\\''b'");
    }

    #[test]
    fn parses_whitespace_table() {
        let out = "JOBID NAME STATE\n42 myjob RUNNING\n43 other PENDING\n";
        let table =
            parse_table(out, "JOBID", FieldSeparator::Whitespace, "slurm", &[]).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table["42"]["STATE"], "RUNNING");
        assert_eq!(table["43"]["NAME"], "other");
    }

    #[test]
    fn parses_bar_table_with_trailing_separator() {
        let out = "JobID|JobName|State|ExitCode|\n42|demo|COMPLETED|0:0|\n";
        let table = parse_table(out, "JobID", FieldSeparator::Bar, "slurm", &[]).unwrap();
        assert_eq!(table["42"]["ExitCode"], "0:0");
    }

    #[test]
    fn strips_ignored_suffixes_from_headers_and_values() {
        let out = "PARTITION AVAIL\ndebug* up\nlong up\n";
        let table =
            parse_table(out, "PARTITION", FieldSeparator::Whitespace, "slurm", &["*"]).unwrap();
        assert!(table.contains_key("debug"));
        assert!(table.contains_key("long"));
    }

    #[test]
    fn field_count_mismatch_is_an_error() {
        let out = "JOBID NAME\n42 one two\n";
        assert!(parse_table(out, "JOBID", FieldSeparator::Whitespace, "slurm", &[]).is_err());
    }

    #[test]
    fn missing_key_field_is_an_error() {
        let out = "A B\n1 2\n";
        assert!(parse_table(out, "JOBID", FieldSeparator::Whitespace, "slurm", &[]).is_err());
    }

    #[test]
    fn empty_output_yields_empty_table() {
        let table = parse_table("", "JOBID", FieldSeparator::Whitespace, "slurm", &[]).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn key_value_record_splits_on_first_equals_only() {
        let record = parse_key_value_record("JobId=42 TRES=cpu=4,mem=100M Reason=None");
        assert_eq!(record["JobId"], "42");
        assert_eq!(record["TRES"], "cpu=4,mem=100M");
        assert_eq!(record["Reason"], "None");
    }

    #[test]
    fn job_id_is_extracted_from_submit_output() {
        let id = parse_job_id_from_line("Submitted batch job 42\n", "Submitted batch job", "slurm")
            .unwrap();
        assert_eq!(id, "42");
        assert!(parse_job_id_from_line("sbatch: error\n", "Submitted batch job", "slurm").is_err());
    }

    #[test]
    fn job_info_verification_rejects_wrong_or_incomplete_records() {
        let mut record = HashMap::new();
        record.insert("JobID".to_string(), "42".to_string());
        record.insert("State".to_string(), "RUNNING".to_string());

        assert!(verify_job_info(&record, "42", "slurm", "JobID", &["State"]).is_ok());
        assert!(verify_job_info(&record, "43", "slurm", "JobID", &["State"]).is_err());
        assert!(verify_job_info(&record, "42", "slurm", "JobID", &["ExitCode"]).is_err());
        assert!(verify_job_info(&record, "42", "slurm", "JobId", &[]).is_err());
    }

    #[test]
    fn description_checks_catch_the_basics() {
        let queues = vec!["short".to_string(), "long".to_string()];

        let description = JobDescription::default();
        assert!(verify_job_description(&description, &queues, "slurm").is_err());

        let description = JobDescription {
            executable: Some("/bin/date".to_string()),
            queue_name: Some("nope".to_string()),
            ..Default::default()
        };
        let err = verify_job_description(&description, &queues, "slurm").unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::NoSuchQueue);

        let description = JobDescription {
            executable: Some("/bin/date".to_string()),
            max_runtime: -2,
            ..Default::default()
        };
        assert!(verify_job_description(&description, &queues, "slurm").is_err());
    }

    #[test]
    fn working_dir_resolves_against_the_entry_path() {
        let entry = Path::new("/home/user");
        let description = JobDescription {
            working_directory: Some("runs/a".to_string()),
            ..Default::default()
        };
        assert_eq!(
            working_dir_path(&description, &entry),
            Some("/home/user/runs/a".to_string())
        );
        let description = JobDescription {
            working_directory: Some("/scratch".to_string()),
            ..Default::default()
        };
        assert_eq!(working_dir_path(&description, &entry), Some("/scratch".to_string()));
        assert_eq!(working_dir_path(&JobDescription::default(), &entry), None);
    }
}

// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! The `local` adaptor: jobs as child processes, files on the local disk.

mod filesystem;
mod process;

pub use filesystem::LocalFileSystemPort;
pub use process::{LocalProcess, LocalProcessFactory};

use std::collections::HashMap;
use std::sync::Arc;

use crate::credentials::Credential;
use crate::errors::{Error, ErrorKind, Result};
use crate::filesystem::FileSystem;
use crate::path::Path;
use crate::queue::JobQueueScheduler;
use crate::scheduler::Scheduler;

pub const ADAPTOR_NAME: &str = "local";

pub const PROPERTY_POLLING_DELAY: &str = "gantry.adaptors.local.pollingDelay";
pub const PROPERTY_MULTI_Q_THREADS: &str = "gantry.adaptors.local.multiQThreads";
pub const PROPERTY_BUFFER_SIZE: &str = "gantry.adaptors.local.bufferSize";

const PROPERTY_NAMESPACE: &str = "gantry.adaptors.local.";

const DEFAULT_POLLING_DELAY: u64 = 1000;
const DEFAULT_MULTI_Q_THREADS: usize = 4;
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
const DEFAULT_STARTUP_TIMEOUT: u64 = 60_000;

struct LocalProperties {
    polling_delay: u64,
    multi_q_threads: usize,
    buffer_size: usize,
}

impl LocalProperties {
    fn parse(properties: &HashMap<String, String>) -> Result<Self> {
        let mut result = Self {
            polling_delay: DEFAULT_POLLING_DELAY,
            multi_q_threads: DEFAULT_MULTI_Q_THREADS,
            buffer_size: DEFAULT_BUFFER_SIZE,
        };
        for (key, value) in properties {
            match key.as_str() {
                PROPERTY_POLLING_DELAY => result.polling_delay = parse_value(key, value)?,
                PROPERTY_MULTI_Q_THREADS => result.multi_q_threads = parse_value(key, value)?,
                PROPERTY_BUFFER_SIZE => result.buffer_size = parse_value(key, value)?,
                _ if key.starts_with(PROPERTY_NAMESPACE) => {
                    return Err(Error::new(
                        ErrorKind::UnknownProperty,
                        ADAPTOR_NAME,
                        format!("unknown property: {key}"),
                    ));
                }
                // Properties of other adaptors may travel in the same bag.
                _ => {}
            }
        }
        Ok(result)
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        Error::new(
            ErrorKind::InvalidProperty,
            ADAPTOR_NAME,
            format!("invalid value \"{value}\" for property {key}"),
        )
    })
}

/// The root directory this filesystem resolves relative paths against:
/// the current directory for an empty location, otherwise an absolute path.
fn resolve_location(location: &str) -> Result<Path> {
    if location.is_empty() {
        let cwd = std::env::current_dir()
            .map_err(|e| Error::from_io(ADAPTOR_NAME, "cannot determine current directory", e))?;
        return Ok(Path::new(&cwd.to_string_lossy()));
    }
    if location.starts_with('/') {
        return Ok(Path::new(location));
    }
    Err(Error::new(
        ErrorKind::InvalidLocation,
        ADAPTOR_NAME,
        format!("location must be empty or an absolute path, got \"{location}\""),
    ))
}

pub async fn create_file_system(
    location: &str,
    credential: &Credential,
    properties: &HashMap<String, String>,
) -> Result<FileSystem> {
    let root = resolve_location(location)?;
    let config = LocalProperties::parse(properties)?;
    let fs = FileSystem::new(
        ADAPTOR_NAME,
        location,
        credential.clone(),
        properties.clone(),
        root.clone(),
        config.buffer_size,
        Box::new(LocalFileSystemPort::new()),
    )?;
    fs.assert_directory_exists(&root).await?;
    Ok(fs)
}

pub async fn create_scheduler(
    location: &str,
    credential: &Credential,
    properties: &HashMap<String, String>,
) -> Result<Box<dyn Scheduler>> {
    let config = LocalProperties::parse(properties)?;
    let filesystem = create_file_system(location, credential, properties).await?;
    let scheduler = JobQueueScheduler::new(
        ADAPTOR_NAME,
        location,
        credential.clone(),
        properties.clone(),
        Arc::new(LocalProcessFactory::new()),
        filesystem,
        config.multi_q_threads,
        config.polling_delay,
        DEFAULT_STARTUP_TIMEOUT,
    )?;
    Ok(Box::new(scheduler))
}

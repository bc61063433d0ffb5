// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::io;

use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, Error>;

/// The error taxonomy shared by every adaptor. Transport-level failures are
/// translated into one of these kinds at the back-end boundary; the engines
/// only ever reason about kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    IncompleteJobDescription,
    InvalidJobDescription,
    NoSuchQueue,
    NoSuchJob,
    JobCanceled,
    NoSuchPath,
    PathAlreadyExists,
    InvalidPath,
    DirectoryNotEmpty,
    PermissionDenied,
    EndOfFile,
    NoSpace,
    NotConnected,
    CopyCancelled,
    NoSuchCopy,
    BadParameter,
    UnknownProperty,
    InvalidProperty,
    UnknownAdaptor,
    InvalidLocation,
    InvalidCredential,
    UnsupportedOperation,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::IncompleteJobDescription => "incomplete_job_description",
            ErrorKind::InvalidJobDescription => "invalid_job_description",
            ErrorKind::NoSuchQueue => "no_such_queue",
            ErrorKind::NoSuchJob => "no_such_job",
            ErrorKind::JobCanceled => "job_canceled",
            ErrorKind::NoSuchPath => "no_such_path",
            ErrorKind::PathAlreadyExists => "path_already_exists",
            ErrorKind::InvalidPath => "invalid_path",
            ErrorKind::DirectoryNotEmpty => "directory_not_empty",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::EndOfFile => "end_of_file",
            ErrorKind::NoSpace => "no_space",
            ErrorKind::NotConnected => "not_connected",
            ErrorKind::CopyCancelled => "copy_cancelled",
            ErrorKind::NoSuchCopy => "no_such_copy",
            ErrorKind::BadParameter => "bad_parameter",
            ErrorKind::UnknownProperty => "unknown_property",
            ErrorKind::InvalidProperty => "invalid_property",
            ErrorKind::UnknownAdaptor => "unknown_adaptor",
            ErrorKind::InvalidLocation => "invalid_location",
            ErrorKind::InvalidCredential => "invalid_credential",
            ErrorKind::UnsupportedOperation => "unsupported_operation",
            ErrorKind::Internal => "internal",
        }
    }
}

/// An error raised by an adaptor or one of the core engines.
///
/// Carries the name of the adaptor it originated from, a human-readable
/// message and optionally the transport error that caused it.
#[derive(Debug, thiserror::Error)]
#[error("{adaptor}: {message}")]
pub struct Error {
    kind: ErrorKind,
    adaptor: String,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind, adaptor: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            adaptor: adaptor.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn wrapped(
        kind: ErrorKind,
        adaptor: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            adaptor: adaptor.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Map an I/O failure from a local or stream-backed operation onto the
    /// common taxonomy. Unknown I/O kinds fall through to `Internal`.
    pub fn from_io(adaptor: impl Into<String>, message: impl Into<String>, err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::NotFound => ErrorKind::NoSuchPath,
            io::ErrorKind::AlreadyExists => ErrorKind::PathAlreadyExists,
            io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            io::ErrorKind::UnexpectedEof => ErrorKind::EndOfFile,
            io::ErrorKind::NotADirectory | io::ErrorKind::IsADirectory => ErrorKind::InvalidPath,
            io::ErrorKind::DirectoryNotEmpty => ErrorKind::DirectoryNotEmpty,
            io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded => ErrorKind::NoSpace,
            io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => ErrorKind::NotConnected,
            _ => ErrorKind::Internal,
        };
        Self::wrapped(kind, adaptor, message, err)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn adaptor_name(&self) -> &str {
        &self.adaptor
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Adapter so an error shared through a status object (`Arc<Error>`) can be
/// re-wrapped as the cause of a new error.
pub(crate) struct SharedError(pub(crate) std::sync::Arc<Error>);

impl std::fmt::Debug for SharedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl std::fmt::Display for SharedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(self.0.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_onto_the_taxonomy() {
        let e = Error::from_io(
            "local",
            "open failed",
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(e.kind(), ErrorKind::NoSuchPath);

        let e = Error::from_io(
            "local",
            "create failed",
            io::Error::new(io::ErrorKind::AlreadyExists, "there"),
        );
        assert_eq!(e.kind(), ErrorKind::PathAlreadyExists);

        let e = Error::from_io(
            "local",
            "something odd",
            io::Error::new(io::ErrorKind::Interrupted, "?"),
        );
        assert_eq!(e.kind(), ErrorKind::Internal);
    }

    #[test]
    fn display_carries_adaptor_and_message() {
        let e = Error::new(ErrorKind::NoSuchQueue, "local", "queue \"fast\" does not exist");
        assert_eq!(e.to_string(), "local: queue \"fast\" does not exist");
        assert_eq!(e.adaptor_name(), "local");
    }

    #[test]
    fn source_is_preserved() {
        let io = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        let e = Error::from_io("local", "chmod failed", io);
        assert_eq!(e.kind(), ErrorKind::PermissionDenied);
        assert!(std::error::Error::source(&e).is_some());
    }
}

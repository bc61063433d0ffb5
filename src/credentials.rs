// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use serde::{Deserialize, Serialize};

/// Credential handed to an adaptor when a scheduler or filesystem is created.
///
/// The core never interprets credentials; they travel to the back-end as-is.
/// Passwords are kept out of `Debug` output.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Credential {
    /// Whatever the local environment provides (current user, agent, ...).
    #[default]
    Default,
    UsernamePassword {
        username: String,
        password: String,
    },
    CertificateFile {
        certificate: String,
        username: Option<String>,
        passphrase: Option<String>,
    },
}

impl Credential {
    pub fn username(&self) -> Option<&str> {
        match self {
            Credential::Default => None,
            Credential::UsernamePassword { username, .. } => Some(username),
            Credential::CertificateFile { username, .. } => username.as_deref(),
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Default => write!(f, "Credential::Default"),
            Credential::UsernamePassword { username, .. } => f
                .debug_struct("Credential::UsernamePassword")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Credential::CertificateFile {
                certificate,
                username,
                ..
            } => f
                .debug_struct("Credential::CertificateFile")
                .field("certificate", certificate)
                .field("username", username)
                .field("passphrase", &"<redacted>")
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_secrets() {
        let c = Credential::UsernamePassword {
            username: "alice".to_string(),
            password: "hunter2".to_string(),
        };
        let out = format!("{c:?}");
        assert!(out.contains("alice"));
        assert!(!out.contains("hunter2"));
    }
}

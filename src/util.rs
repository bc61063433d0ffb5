// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::time::Duration;

use rand::{distr::Alphanumeric, Rng};

/// Turn a millisecond timeout into an absolute deadline. A timeout of zero
/// means "wait indefinitely" and maps to `None`.
pub(crate) fn deadline(timeout_ms: u64) -> Option<tokio::time::Instant> {
    if timeout_ms == 0 {
        None
    } else {
        Some(tokio::time::Instant::now() + Duration::from_millis(timeout_ms))
    }
}

/// Short random alphanumeric tag, unique enough to find a job back in a
/// shared queue listing.
pub(crate) fn random_tag(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_has_no_deadline() {
        assert!(deadline(0).is_none());
        assert!(deadline(1).is_some());
    }

    #[test]
    fn tags_are_alphanumeric_and_sized() {
        let tag = random_tag(16);
        assert_eq!(tag.len(), 16);
        assert!(tag.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(random_tag(16), random_tag(16));
    }
}

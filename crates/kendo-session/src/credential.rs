//! Credential type and renewal timing.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lead time before expiry at which a renewal is attempted.
pub const DEFAULT_RENEWAL_MARGIN: Duration = Duration::from_millis(20_000);

/// An issued token and its absolute expiry in epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub token: String,
    pub expires_at: i64,
}

impl Credential {
    /// Create a new credential.
    pub fn new(token: impl Into<String>, expires_at: i64) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    /// A credential is valid while its expiry is a positive timestamp in the future.
    #[inline]
    pub fn is_valid_at(&self, now_millis: i64) -> bool {
        self.expires_at > 0 && self.expires_at > now_millis
    }

    /// Milliseconds left until expiry, negative once expired.
    #[inline]
    pub fn remaining_millis(&self, now_millis: i64) -> i64 {
        self.expires_at.saturating_sub(now_millis)
    }

    /// Expiry as a UTC timestamp, if representable.
    pub fn expires_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.expires_at)
    }
}

/// Delay until the renewal of `credential` should fire.
///
/// Returns `None` when `expires_at - now - margin <= 0`: the renewal window has
/// already been entered and no timer is armed.
pub fn renewal_delay(credential: &Credential, now_millis: i64, margin: Duration) -> Option<Duration> {
    let margin_millis = i64::try_from(margin.as_millis()).unwrap_or(i64::MAX);
    let delay = credential
        .expires_at
        .saturating_sub(now_millis)
        .saturating_sub(margin_millis);

    if delay <= 0 {
        return None;
    }
    // delay is positive here
    Some(Duration::from_millis(delay as u64))
}

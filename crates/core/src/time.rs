//! Epoch-second helpers.
//!
//! Expiry and heartbeat fields are persisted as whole seconds since the Unix
//! epoch so the store can compare them numerically.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{DomainError, DomainResult};

pub fn to_epoch(at: DateTime<Utc>) -> i64 {
    at.timestamp()
}

pub fn from_epoch(epoch: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(epoch, 0)
}

pub fn now_epoch() -> i64 {
    to_epoch(Utc::now())
}

/// Epoch second `expire_in` from `now`.
pub fn epoch_after(now: DateTime<Utc>, expire_in: Duration) -> DomainResult<i64> {
    let delta = chrono::Duration::from_std(expire_in)
        .map_err(|e| DomainError::validation(format!("`expire_in` out of range: {e}")))?;
    now.checked_add_signed(delta)
        .map(to_epoch)
        .ok_or_else(|| DomainError::validation("`expire_in` overflows the calendar"))
}

/// Normalise timestamp-looking values to epoch seconds.
///
/// Hash values that parse as RFC 3339 are stored as their epoch second so the
/// monitoring side can compare them numerically; anything else is kept as is.
pub fn try_parse_to_epoch(value: &str) -> String {
    match DateTime::parse_from_rfc3339(value) {
        Ok(parsed) => to_epoch(parsed.with_timezone(&Utc)).to_string(),
        Err(_) => value.to_string(),
    }
}

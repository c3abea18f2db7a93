//! Bounded retry for optimistic writes.
//!
//! An attempt fails transiently when its version compare-and-swap misses, a
//! unique index catches a concurrent insert, or SQLite reports the database
//! busy or locked. The whole operation is then re-planned from fresh reads
//! after a short jittered backoff. Everything else is fatal and propagates
//! immediately.

use rand::Rng;
use std::fmt;
use std::time::Duration;

use crate::error::{Conflict, EntityKind, HoldError, HoldResult};

/// Retry budget for one logical operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_backoff: Duration::from_millis(2),
            max_backoff: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the sleep after failed attempt number `attempt` (1-based):
    /// exponential from `base_backoff`, capped at `max_backoff`.
    #[must_use]
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(1_u32 << exp)
            .min(self.max_backoff)
    }

    /// Jittered sleep in `[ceiling / 2, ceiling]`.
    fn backoff(&self, attempt: u32) -> Duration {
        let ceiling = u64::try_from(self.backoff_ceiling(attempt).as_micros()).unwrap_or(u64::MAX);
        if ceiling == 0 {
            return Duration::ZERO;
        }
        let half = ceiling / 2;
        let jitter = rand::thread_rng().gen_range(0..=ceiling - half);
        Duration::from_micros(half + jitter)
    }
}

/// Why an attempt should be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transient {
    /// A version compare-and-swap matched no row.
    StaleVersion,
    /// A unique index rejected a concurrent insert or bind.
    UniqueRace,
    /// SQLite reported `SQLITE_BUSY` / `SQLITE_LOCKED`.
    Busy,
}

impl fmt::Display for Transient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::StaleVersion => "stale version",
            Self::UniqueRace => "unique index race",
            Self::Busy => "database busy",
        })
    }
}

/// Outcome of a failed attempt.
#[derive(Debug)]
pub(crate) enum AttemptError {
    Transient(Transient),
    Fatal(HoldError),
}

impl From<HoldError> for AttemptError {
    fn from(err: HoldError) -> Self {
        Self::Fatal(err)
    }
}

impl From<Conflict> for AttemptError {
    fn from(conflict: Conflict) -> Self {
        Self::Fatal(HoldError::Conflict(conflict))
    }
}

impl AttemptError {
    /// Classify a SQLite error raised while planning or applying a write.
    pub(crate) fn from_sqlite(context: &str, err: &rusqlite::Error) -> Self {
        match classify(err) {
            Some(transient) => Self::Transient(transient),
            None => Self::Fatal(HoldError::storage(context, err)),
        }
    }
}

fn classify(err: &rusqlite::Error) -> Option<Transient> {
    let rusqlite::Error::SqliteFailure(failure, _) = err else {
        return None;
    };
    match failure.code {
        rusqlite::ffi::ErrorCode::DatabaseBusy | rusqlite::ffi::ErrorCode::DatabaseLocked => {
            Some(Transient::Busy)
        }
        rusqlite::ffi::ErrorCode::ConstraintViolation
            if matches!(
                failure.extended_code,
                rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
            ) =>
        {
            Some(Transient::UniqueRace)
        }
        _ => None,
    }
}

/// Attach attempt classification to `rusqlite` results.
pub(crate) trait AttemptResultExt<T> {
    fn attempt(self, context: &str) -> Result<T, AttemptError>;
}

impl<T> AttemptResultExt<T> for rusqlite::Result<T> {
    fn attempt(self, context: &str) -> Result<T, AttemptError> {
        self.map_err(|err| AttemptError::from_sqlite(context, &err))
    }
}

/// Run `attempt_fn` until it succeeds, fails fatally, or the budget runs out.
///
/// `attempt_fn` receives the 1-based attempt number.
pub(crate) fn run<T>(
    policy: &RetryPolicy,
    op: &'static str,
    entity: EntityKind,
    id: &str,
    mut attempt_fn: impl FnMut(u32) -> Result<T, AttemptError>,
) -> HoldResult<T> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match attempt_fn(attempt) {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(op, %entity, id, attempt, "write succeeded after retry");
                }
                return Ok(value);
            }
            Err(AttemptError::Fatal(err)) => return Err(err),
            Err(AttemptError::Transient(cause)) => {
                if attempt >= max_attempts {
                    tracing::warn!(op, %entity, id, attempts = attempt, %cause, "retry budget exhausted");
                    return Err(Conflict::RetriesExhausted {
                        entity,
                        id: id.to_string(),
                        attempts: attempt,
                    }
                    .into());
                }
                let delay = policy.backoff(attempt);
                tracing::debug!(
                    op,
                    %entity,
                    id,
                    attempt,
                    %cause,
                    delay_us = u64::try_from(delay.as_micros()).unwrap_or(u64::MAX),
                    "transient write conflict, retrying"
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

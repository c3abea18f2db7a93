//! The station-side handle onto the shared hold-tag database.
//!
//! A [`Store`] owns one SQLite connection. Reads go straight to the
//! connection; writes run through [`Store::optimistic`], which plans against
//! fresh reads and commits in a single `BEGIN IMMEDIATE` transaction guarded
//! by per-row version compare-and-swap.

pub mod hold_tags;
pub mod ledger;

use anyhow::{Context, Result};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;

use crate::config::HoldConfig;
use crate::coordinator::BindingCoordinator;
use crate::db;
use crate::db::rebuild::{self, RebuildReport};
use crate::error::{EntityKind, HoldResult};
use crate::retry::{self, AttemptError, AttemptResultExt};
use crate::verify::{self, InvariantReport};
use crate::workflow::DispositionWorkflow;

pub use hold_tags::{CloseReceipt, HoldTagStore, TagFilter};
pub use ledger::Ledger;

/// What the planning phase of a write decided.
pub(crate) enum Step<P, T> {
    /// Commit with this plan.
    Apply(P),
    /// Nothing to write; return this value as-is.
    Done(T),
}

/// One station's connection plus its configuration.
#[derive(Debug)]
pub struct Store {
    conn: Connection,
    config: HoldConfig,
}

impl Store {
    /// Open (creating and migrating if needed) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(path: &Path, config: HoldConfig) -> Result<Self> {
        let conn = db::open_database(path, config.busy_timeout())
            .with_context(|| format!("open hold-tag store at {}", path.display()))?;
        tracing::debug!(path = %path.display(), "opened hold-tag store");
        Ok(Self { conn, config })
    }

    /// Open a private in-memory store.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn open_in_memory(config: HoldConfig) -> Result<Self> {
        let conn = db::open_in_memory()?;
        Ok(Self { conn, config })
    }

    #[must_use]
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }

    #[must_use]
    pub const fn config(&self) -> &HoldConfig {
        &self.config
    }

    pub fn hold_tags(&mut self) -> HoldTagStore<'_> {
        HoldTagStore::new(self)
    }

    pub fn ledger(&mut self) -> Ledger<'_> {
        Ledger::new(self)
    }

    pub fn coordinator(&mut self) -> BindingCoordinator<'_> {
        BindingCoordinator::new(self)
    }

    pub fn workflow(&mut self) -> DispositionWorkflow<'_> {
        DispositionWorkflow::new(self)
    }

    /// See [`verify::check_invariants`].
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn check_invariants(&self) -> Result<InvariantReport> {
        verify::check_invariants(&self.conn)
    }

    /// See [`rebuild::rebuild_label_projection`].
    ///
    /// # Errors
    ///
    /// Returns an error if the event log is inconsistent or the swap fails.
    pub fn rebuild_label_projection(&mut self) -> Result<RebuildReport> {
        rebuild::rebuild_label_projection(&mut self.conn)
    }

    /// Run a plan/apply write under the configured retry budget.
    ///
    /// `plan` sees the connection outside any transaction and either
    /// short-circuits with [`Step::Done`] or hands a plan to `apply`, which
    /// runs inside an immediate transaction with the commit timestamp.
    pub(crate) fn optimistic<P, T>(
        &mut self,
        op: &'static str,
        entity: EntityKind,
        id: &str,
        mut plan: impl FnMut(&Connection) -> Result<Step<P, T>, AttemptError>,
        mut apply: impl FnMut(&Transaction<'_>, P, i64) -> Result<T, AttemptError>,
    ) -> HoldResult<T> {
        let policy = self.config.retry_policy();
        let conn = &mut self.conn;
        retry::run(&policy, op, entity, id, |_attempt| {
            let planned = match plan(conn)? {
                Step::Done(value) => return Ok(value),
                Step::Apply(planned) => planned,
            };
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .attempt("begin write transaction")?;
            let value = apply(&tx, planned, now_us())?;
            tx.commit().attempt("commit write transaction")?;
            Ok(value)
        })
    }
}

/// Wall clock in microseconds since the Unix epoch.
pub(crate) fn now_us() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_database_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("station-1/holdtag.sqlite3");
        let store = Store::open(&path, HoldConfig::default()).expect("open store");
        assert!(path.exists());
        assert_eq!(store.config().retry.max_attempts, 8);
    }

    #[test]
    fn two_stores_share_one_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("holdtag.sqlite3");
        let mut first = Store::open(&path, HoldConfig::default()).expect("open first");
        let mut second = Store::open(&path, HoldConfig::default()).expect("open second");

        first
            .ledger()
            .register_label("QR-1", "qc-lead")
            .expect("register on first station");
        let seen = second.ledger().get_binding("QR-1").expect("visible on second");
        assert!(!seen.is_active());
    }

    #[test]
    fn now_us_is_after_2020() {
        assert!(now_us() > 1_577_836_800_000_000);
    }
}

//! Whole-store invariant checks.
//!
//! Used by tests, the simulator's oracle and operators after a crash or a
//! manual database edit. Checks read only; nothing is repaired here.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{Context, Result};
use rusqlite::Connection;
use serde::Serialize;

use crate::db::rebuild::{replay_label_events, stored_label_projection};
use crate::event::{self, ChainBreak};
use crate::model::Binding;

/// One broken invariant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    /// A closed tag still has a label pointing at it.
    ClosedTagStillBound { tag_id: String, qr_id: String },
    /// More than one label points at the same tag.
    DuplicateActiveTag { tag_id: String, qr_ids: Vec<String> },
    /// A closed tag has no final disposition outcome.
    ClosedWithoutFinalDisposition { tag_id: String },
    /// A label's bindings overlap or go backwards in time.
    HistoryOutOfOrder { qr_id: String, detail: String },
    /// The audit log hash chain is broken at `seq`.
    BrokenEventChain { seq: i64, detail: String },
    /// The label tables differ from a replay of the label events.
    ProjectionDrift { detail: String },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClosedTagStillBound { tag_id, qr_id } => {
                write!(f, "closed tag {tag_id} still bound to label {qr_id}")
            }
            Self::DuplicateActiveTag { tag_id, qr_ids } => {
                write!(f, "tag {tag_id} bound to several labels: {}", qr_ids.join(", "))
            }
            Self::ClosedWithoutFinalDisposition { tag_id } => {
                write!(f, "tag {tag_id} closed without a final disposition")
            }
            Self::HistoryOutOfOrder { qr_id, detail } => {
                write!(f, "label {qr_id} history out of order: {detail}")
            }
            Self::BrokenEventChain { seq, detail } => {
                write!(f, "event chain broken at seq {seq}: {detail}")
            }
            Self::ProjectionDrift { detail } => write!(f, "label projection drift: {detail}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InvariantReport {
    pub tags_checked: usize,
    pub labels_checked: usize,
    pub events_checked: usize,
    pub violations: Vec<Violation>,
}

impl InvariantReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Run every invariant check against the store.
///
/// # Errors
///
/// Returns an error only if the store cannot be read; broken invariants are
/// reported in the [`InvariantReport`].
pub fn check_invariants(conn: &Connection) -> Result<InvariantReport> {
    let mut report = InvariantReport {
        tags_checked: count(conn, "hold_tags")?,
        labels_checked: count(conn, "qr_labels")?,
        events_checked: count(conn, "events")?,
        violations: Vec::new(),
    };

    check_closed_tags(conn, &mut report.violations)?;
    check_tag_uniqueness(conn, &mut report.violations)?;
    check_history_order(conn, &mut report.violations)?;
    check_event_chain(conn, &mut report.violations)?;
    check_projection(conn, &mut report.violations)?;

    if report.is_clean() {
        tracing::debug!(
            tags = report.tags_checked,
            labels = report.labels_checked,
            events = report.events_checked,
            "store invariants hold"
        );
    } else {
        for violation in &report.violations {
            tracing::warn!(%violation, "store invariant violated");
        }
    }
    Ok(report)
}

fn count(conn: &Connection, table: &str) -> Result<usize> {
    let n: i64 = conn
        .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        .with_context(|| format!("count {table}"))?;
    usize::try_from(n).with_context(|| format!("negative row count for {table}"))
}

fn check_closed_tags(conn: &Connection, out: &mut Vec<Violation>) -> Result<()> {
    let mut stmt = conn
        .prepare(
            "SELECT t.tag_id, l.qr_id FROM hold_tags t
             JOIN qr_labels l ON l.current_tag_id = t.tag_id
             WHERE t.status = 'closed'
             ORDER BY t.tag_id",
        )
        .context("prepare closed-tag binding check")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(Violation::ClosedTagStillBound {
                tag_id: row.get(0)?,
                qr_id: row.get(1)?,
            })
        })
        .context("run closed-tag binding check")?;
    for row in rows {
        out.push(row.context("read closed-tag binding row")?);
    }

    let mut stmt = conn
        .prepare(
            "SELECT tag_id FROM hold_tags
             WHERE status = 'closed' AND (outcome IS NULL OR outcome = 'pending')
             ORDER BY tag_id",
        )
        .context("prepare closed-tag disposition check")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(Violation::ClosedWithoutFinalDisposition { tag_id: row.get(0)? })
        })
        .context("run closed-tag disposition check")?;
    for row in rows {
        out.push(row.context("read closed-tag disposition row")?);
    }
    Ok(())
}

fn check_tag_uniqueness(conn: &Connection, out: &mut Vec<Violation>) -> Result<()> {
    let mut stmt = conn
        .prepare(
            "SELECT current_tag_id, qr_id FROM qr_labels
             WHERE current_tag_id IS NOT NULL
             ORDER BY current_tag_id, qr_id",
        )
        .context("prepare tag uniqueness check")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
        .context("run tag uniqueness check")?;

    let mut by_tag: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for row in rows {
        let (tag_id, qr_id) = row.context("read tag uniqueness row")?;
        by_tag.entry(tag_id).or_default().push(qr_id);
    }
    out.extend(
        by_tag
            .into_iter()
            .filter(|(_, qr_ids)| qr_ids.len() > 1)
            .map(|(tag_id, qr_ids)| Violation::DuplicateActiveTag { tag_id, qr_ids }),
    );
    Ok(())
}

fn check_history_order(conn: &Connection, out: &mut Vec<Violation>) -> Result<()> {
    let projection = stored_label_projection(conn)?;

    let mut last_release: BTreeMap<&str, i64> = BTreeMap::new();
    let mut flagged: BTreeMap<&str, String> = BTreeMap::new();
    for past in &projection.assignments {
        let qr_id = past.qr_id.as_str();
        if past.unassigned_at_us < past.assigned_at_us {
            flagged.entry(qr_id).or_insert_with(|| {
                format!("binding to {} released before it began", past.tag_id)
            });
        }
        let starts_early = last_release
            .get(qr_id)
            .is_some_and(|prev| past.assigned_at_us < *prev);
        if starts_early {
            flagged.entry(qr_id).or_insert_with(|| {
                format!("binding to {} starts before the previous one ended", past.tag_id)
            });
        }
        last_release.insert(qr_id, past.unassigned_at_us);
    }

    for label in projection.labels.values() {
        let Binding::Bound {
            tag_id,
            assigned_at_us,
            ..
        } = &label.binding
        else {
            continue;
        };
        let qr_id = label.qr_id.as_str();
        if last_release.get(qr_id).is_some_and(|prev| assigned_at_us < prev) {
            flagged.entry(qr_id).or_insert_with(|| {
                format!("current binding to {tag_id} starts before the previous one ended")
            });
        }
    }

    out.extend(flagged.into_iter().map(|(qr_id, detail)| Violation::HistoryOutOfOrder {
        qr_id: qr_id.to_string(),
        detail,
    }));
    Ok(())
}

fn check_event_chain(conn: &Connection, out: &mut Vec<Violation>) -> Result<()> {
    match event::verify_chain(conn).context("verify event chain")? {
        None => {}
        Some(ChainBreak::Link { seq }) => out.push(Violation::BrokenEventChain {
            seq,
            detail: "prev_hash does not match the preceding event".to_string(),
        }),
        Some(ChainBreak::Hash { seq }) => out.push(Violation::BrokenEventChain {
            seq,
            detail: "stored hash does not match event contents".to_string(),
        }),
    }
    Ok(())
}

fn check_projection(conn: &Connection, out: &mut Vec<Violation>) -> Result<()> {
    let events = event::label_events(conn).context("read label events")?;
    let replayed = match replay_label_events(&events) {
        Ok(projection) => projection,
        Err(err) => {
            out.push(Violation::ProjectionDrift {
                detail: format!("label events do not replay: {err}"),
            });
            return Ok(());
        }
    };
    let stored = stored_label_projection(conn)?;

    for (qr_id, label) in &stored.labels {
        match replayed.labels.get(qr_id) {
            None => out.push(Violation::ProjectionDrift {
                detail: format!("label {qr_id} has no register event"),
            }),
            Some(expected) if expected != label => out.push(Violation::ProjectionDrift {
                detail: format!("label {qr_id} differs from its event history"),
            }),
            Some(_) => {}
        }
    }
    for qr_id in replayed.labels.keys() {
        if !stored.labels.contains_key(qr_id) {
            out.push(Violation::ProjectionDrift {
                detail: format!("label {qr_id} missing from qr_labels"),
            });
        }
    }
    if stored.assignments != replayed.assignments {
        out.push(Violation::ProjectionDrift {
            detail: format!(
                "label_assignments has {} rows, event log implies {}",
                stored.assignments.len(),
                replayed.assignments.len()
            ),
        });
    }
    Ok(())
}

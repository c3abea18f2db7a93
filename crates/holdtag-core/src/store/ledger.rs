//! QR label ledger: registration, current binding and binding history.
//!
//! `qr_labels` holds one row per physical label with its current binding;
//! `label_assignments` receives a row each time a binding ends. Binding and
//! unbinding bump the label's `version`, which every write compare-and-swaps
//! against the value it planned with.

use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};

use super::{Step, Store};
use crate::coordinator::{self, BindOutcome, UnbindOutcome};
use crate::error::{Conflict, EntityKind, HoldError, HoldResult, StorageResultExt};
use crate::event::{self, EventData, LabelBindData, LabelRegisterData, LabelUnbindData};
use crate::model::ids::{validate_actor, validate_qr_id, validate_tag_ref};
use crate::model::{Binding, BindingHistory, HoldTag, PastAssignment, QrLabel, TagLabelAssignment};
use crate::retry::{AttemptError, AttemptResultExt, Transient};

const LABEL_COLUMNS: &str =
    "qr_id, current_tag_id, assigned_at_us, assigned_by, version, registered_by, created_at_us";

/// QR label operations on a [`Store`].
pub struct Ledger<'a> {
    store: &'a mut Store,
}

impl<'a> Ledger<'a> {
    pub(crate) fn new(store: &'a mut Store) -> Self {
        Self { store }
    }

    /// Register a physical label. It starts unbound with empty history.
    ///
    /// # Errors
    ///
    /// [`HoldError::Validation`] for a malformed code and
    /// [`Conflict::LabelAlreadyRegistered`] if the code is already known.
    pub fn register_label(&mut self, qr_id: &str, registered_by: &str) -> HoldResult<QrLabel> {
        validate_qr_id(qr_id)?;
        validate_actor("registered_by", registered_by)?;

        let label = self.store.optimistic(
            "register_label",
            EntityKind::QrLabel,
            qr_id,
            |conn| {
                if load_label(conn, qr_id).attempt("load label")?.is_some() {
                    return Err(Conflict::LabelAlreadyRegistered {
                        qr_id: qr_id.to_string(),
                    }
                    .into());
                }
                Ok(Step::Apply(()))
            },
            |tx, (), now| apply_register(tx, qr_id, registered_by, now),
        )?;

        tracing::info!(qr_id, registered_by, "label registered");
        Ok(label)
    }

    /// Current state of a label.
    ///
    /// # Errors
    ///
    /// [`HoldError::NotFound`] if the label was never registered.
    pub fn get_binding(&self, qr_id: &str) -> HoldResult<QrLabel> {
        validate_qr_id(qr_id)?;
        load_label(self.store.connection(), qr_id)
            .storage("load label")?
            .ok_or_else(|| HoldError::label_not_found(qr_id))
    }

    /// The label currently bound to `tag_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`HoldError::Storage`] if the lookup fails.
    pub fn find_active_label_for_tag(&self, tag_id: &str) -> HoldResult<Option<QrLabel>> {
        validate_tag_ref(tag_id)?;
        find_label_for_tag(self.store.connection(), tag_id).storage("find label for tag")
    }

    /// Bind an unassigned label to an open tag. Binding to the tag it is
    /// already on is a no-op.
    ///
    /// # Errors
    ///
    /// A [`Conflict`] when either side is bound elsewhere, plus the
    /// not-found and closed-tag errors of [`coordinator::BindingCoordinator::scan`].
    pub fn bind(&mut self, qr_id: &str, tag_id: &str, assigned_by: &str) -> HoldResult<QrLabel> {
        let outcome: BindOutcome = coordinator::bind_flow(self.store, qr_id, tag_id, assigned_by, None)?;
        Ok(outcome.label)
    }

    /// Release a label's binding into history. No-op when already unbound.
    ///
    /// # Errors
    ///
    /// [`HoldError::NotFound`] if the label was never registered.
    pub fn unbind(
        &mut self,
        qr_id: &str,
        reason: Option<&str>,
        actor: &str,
    ) -> HoldResult<Option<PastAssignment>> {
        let outcome: UnbindOutcome = coordinator::unbind_flow(self.store, qr_id, actor, reason)?;
        Ok(outcome.released)
    }

    /// Registered labels ordered by code, optionally only bound ones.
    ///
    /// # Errors
    ///
    /// Returns [`HoldError::Storage`] if the query fails.
    pub fn list_labels(&self, active_only: bool) -> HoldResult<Vec<QrLabel>> {
        list_labels(self.store.connection(), active_only).storage("list labels")
    }

    /// Current binding plus every earlier binding, oldest first.
    ///
    /// # Errors
    ///
    /// [`HoldError::NotFound`] if the label was never registered.
    pub fn history(&self, qr_id: &str) -> HoldResult<BindingHistory> {
        let label = self.get_binding(qr_id)?;
        let previous_assignments =
            load_history(self.store.connection(), qr_id).storage("load label history")?;
        Ok(BindingHistory {
            label,
            previous_assignments,
        })
    }
}

fn apply_register(
    tx: &Transaction<'_>,
    qr_id: &str,
    registered_by: &str,
    now: i64,
) -> Result<QrLabel, AttemptError> {
    tx.execute(
        "INSERT INTO qr_labels (qr_id, registered_by, created_at_us) VALUES (?1, ?2, ?3)",
        params![qr_id, registered_by, now],
    )
    .attempt("insert label")?;

    event::append(
        tx,
        now,
        registered_by,
        qr_id,
        EventData::LabelRegister(LabelRegisterData {}),
    )
    .attempt("append label.register event")?;

    reload_label(tx, qr_id)
}

/// Bind `qr_id` (unbound at `label_version`) to `tag`, guarding both rows.
///
/// The assignment is stamped no earlier than the label's last release.
pub(crate) fn apply_bind(
    tx: &Transaction<'_>,
    qr_id: &str,
    label_version: i64,
    tag: &HoldTag,
    assigned_by: &str,
    now: i64,
) -> Result<QrLabel, AttemptError> {
    super::hold_tags::touch_open_tag(tx, &tag.tag_id, tag.version)?;

    let last_release: Option<i64> = tx
        .query_row(
            "SELECT MAX(unassigned_at_us) FROM label_assignments WHERE qr_id = ?1",
            [qr_id],
            |row| row.get(0),
        )
        .attempt("read last release")?;
    let assigned_at_us = last_release.map_or(now, |last| now.max(last));

    let updated = tx
        .execute(
            "UPDATE qr_labels
             SET current_tag_id = ?1, assigned_at_us = ?2, assigned_by = ?3,
                 version = version + 1
             WHERE qr_id = ?4 AND version = ?5 AND current_tag_id IS NULL",
            params![tag.tag_id, assigned_at_us, assigned_by, qr_id, label_version],
        )
        .attempt("bind label")?;
    if updated == 0 {
        return Err(AttemptError::Transient(Transient::StaleVersion));
    }

    event::append(
        tx,
        assigned_at_us,
        assigned_by,
        qr_id,
        EventData::LabelBind(LabelBindData {
            tag_id: tag.tag_id.clone(),
        }),
    )
    .attempt("append label.bind event")?;

    reload_label(tx, qr_id)
}

/// Move `label`'s current binding into history and clear it.
///
/// The release is stamped no earlier than the assignment, so history rows
/// stay ordered even when station clocks disagree.
pub(crate) fn apply_unbind(
    tx: &Transaction<'_>,
    label: &QrLabel,
    actor: &str,
    reason: Option<&str>,
    now: i64,
) -> Result<PastAssignment, AttemptError> {
    let Binding::Bound {
        tag_id,
        assigned_at_us,
        assigned_by,
    } = &label.binding
    else {
        return Err(AttemptError::Transient(Transient::StaleVersion));
    };
    let unassigned_at_us = now.max(*assigned_at_us);

    let updated = tx
        .execute(
            "UPDATE qr_labels
             SET current_tag_id = NULL, assigned_at_us = NULL, assigned_by = NULL,
                 version = version + 1
             WHERE qr_id = ?1 AND version = ?2 AND current_tag_id = ?3",
            params![label.qr_id, label.version, tag_id],
        )
        .attempt("unbind label")?;
    if updated == 0 {
        return Err(AttemptError::Transient(Transient::StaleVersion));
    }

    let past = PastAssignment {
        qr_id: label.qr_id.clone(),
        tag_id: tag_id.clone(),
        assigned_at_us: *assigned_at_us,
        assigned_by: assigned_by.clone(),
        unassigned_at_us,
        unassigned_by: actor.to_string(),
        reason: reason.map(str::to_string),
    };
    insert_assignment(tx, &past).attempt("record label history")?;

    event::append(
        tx,
        unassigned_at_us,
        actor,
        &label.qr_id,
        EventData::LabelUnbind(LabelUnbindData {
            tag_id: tag_id.clone(),
            reason: past.reason.clone(),
        }),
    )
    .attempt("append label.unbind event")?;

    Ok(past)
}

pub(crate) fn insert_assignment(conn: &Connection, past: &PastAssignment) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO label_assignments (
            qr_id, tag_id, assigned_at_us, assigned_by, unassigned_at_us, unassigned_by, reason
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            past.qr_id,
            past.tag_id,
            past.assigned_at_us,
            past.assigned_by,
            past.unassigned_at_us,
            past.unassigned_by,
            past.reason,
        ],
    )?;
    Ok(())
}

pub(crate) fn reload_label(conn: &Connection, qr_id: &str) -> Result<QrLabel, AttemptError> {
    load_label(conn, qr_id)
        .attempt("reload label")?
        .ok_or_else(|| HoldError::label_not_found(qr_id).into())
}

pub(crate) fn load_label(conn: &Connection, qr_id: &str) -> rusqlite::Result<Option<QrLabel>> {
    conn.query_row(
        &format!("SELECT {LABEL_COLUMNS} FROM qr_labels WHERE qr_id = ?1"),
        [qr_id],
        row_to_label,
    )
    .optional()
}

pub(crate) fn find_label_for_tag(
    conn: &Connection,
    tag_id: &str,
) -> rusqlite::Result<Option<QrLabel>> {
    conn.query_row(
        &format!("SELECT {LABEL_COLUMNS} FROM qr_labels WHERE current_tag_id = ?1"),
        [tag_id],
        row_to_label,
    )
    .optional()
}

pub(crate) fn list_labels(conn: &Connection, active_only: bool) -> rusqlite::Result<Vec<QrLabel>> {
    let filter = if active_only {
        " WHERE current_tag_id IS NOT NULL"
    } else {
        ""
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT {LABEL_COLUMNS} FROM qr_labels{filter} ORDER BY qr_id"
    ))?;
    let rows = stmt.query_map([], row_to_label)?;
    rows.collect()
}

pub(crate) fn load_history(conn: &Connection, qr_id: &str) -> rusqlite::Result<Vec<PastAssignment>> {
    let mut stmt = conn.prepare(
        "SELECT qr_id, tag_id, assigned_at_us, assigned_by, unassigned_at_us, unassigned_by, reason
         FROM label_assignments WHERE qr_id = ?1 ORDER BY assignment_id",
    )?;
    let rows = stmt.query_map([qr_id], row_to_past_assignment)?;
    rows.collect()
}

/// Every label assignment a tag has had, the live one included, oldest first.
pub(crate) fn tag_history(
    conn: &Connection,
    tag_id: &str,
) -> rusqlite::Result<Vec<TagLabelAssignment>> {
    let mut stmt = conn.prepare(
        "SELECT qr_id, assigned_at_us, assigned_by, unassigned_at_us, reason
         FROM label_assignments WHERE tag_id = ?1 ORDER BY assigned_at_us, assignment_id",
    )?;
    let mut entries = stmt
        .query_map([tag_id], |row| {
            Ok(TagLabelAssignment {
                qr_id: row.get(0)?,
                assigned_at_us: row.get(1)?,
                assigned_by: row.get(2)?,
                unassigned_at_us: Some(row.get(3)?),
                reason: row.get(4)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    if let Some(QrLabel {
        qr_id,
        binding: Binding::Bound {
            assigned_at_us,
            assigned_by,
            ..
        },
        ..
    }) = find_label_for_tag(conn, tag_id)?
    {
        entries.push(TagLabelAssignment {
            qr_id,
            assigned_at_us,
            assigned_by,
            unassigned_at_us: None,
            reason: None,
        });
    }
    Ok(entries)
}

fn row_to_label(row: &Row<'_>) -> rusqlite::Result<QrLabel> {
    let binding = Binding::from_columns(row.get(1)?, row.get(2)?, row.get(3)?).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            "partial binding columns".into(),
        )
    })?;
    Ok(QrLabel {
        qr_id: row.get(0)?,
        binding,
        version: row.get(4)?,
        registered_by: row.get(5)?,
        created_at_us: row.get(6)?,
    })
}

fn row_to_past_assignment(row: &Row<'_>) -> rusqlite::Result<PastAssignment> {
    Ok(PastAssignment {
        qr_id: row.get(0)?,
        tag_id: row.get(1)?,
        assigned_at_us: row.get(2)?,
        assigned_by: row.get(3)?,
        unassigned_at_us: row.get(4)?,
        unassigned_by: row.get(5)?,
        reason: row.get(6)?,
    })
}

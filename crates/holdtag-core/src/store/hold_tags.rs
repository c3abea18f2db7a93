//! Hold tag records: creation, disposition updates and closure.

use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params, params_from_iter, types::Type};
use serde::Serialize;

use super::{Step, Store};
use crate::coordinator;
use crate::error::{Conflict, EntityKind, HoldError, HoldResult, StorageResultExt};
use crate::event::{self, EventData, TagCloseData, TagCreateData, TagDispositionData};
use crate::model::hold_tag::ValidatedHoldTag;
use crate::model::ids::{generate_tag_id, validate_actor, validate_tag_ref};
use crate::model::{
    Disposition, DispositionOutcome, HoldTag, NewHoldTag, PastAssignment, ProductInfo, QcDetails,
    Shift, TagStatus,
};
use crate::retry::{AttemptError, AttemptResultExt, Transient};

const TAG_COLUMNS: &str = "tag_id, tag_number, tag_date, product, size, code, location, \
     pallet_tag, amount, formula, upc, reason, shift, disposition, outcome, signed_by, qc_date, \
     latest_disposition, status, version, created_by, created_at_us, updated_at_us, \
     closed_at_us, closed_by";

/// Filter for [`HoldTagStore::list_hold_tags`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TagFilter {
    pub status: Option<TagStatus>,
    pub shift: Option<Shift>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Emitted when a tag transitions to closed, consumed by the binding
/// coordinator in the same transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TagClosed {
    pub tag_id: String,
    pub closed_by: String,
    pub closed_at_us: i64,
}

/// Result of closing a tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CloseReceipt {
    pub tag: HoldTag,
    /// The tag was already closed and nothing was written.
    pub already_closed: bool,
    /// The label binding released by the close cascade, if one was active.
    pub released: Option<PastAssignment>,
}

/// Hold tag operations on a [`Store`].
pub struct HoldTagStore<'a> {
    store: &'a mut Store,
}

impl<'a> HoldTagStore<'a> {
    pub(crate) fn new(store: &'a mut Store) -> Self {
        Self { store }
    }

    /// Record a new QC hold.
    ///
    /// # Errors
    ///
    /// [`HoldError::Validation`] for missing or malformed fields and
    /// [`Conflict::TagNumberTaken`] when the printed tag number is in use.
    pub fn create_hold_tag(&mut self, fields: &NewHoldTag, created_by: &str) -> HoldResult<HoldTag> {
        let validated = fields.validate()?;
        validate_actor("created_by", created_by)?;

        let tag = self.store.optimistic(
            "create_hold_tag",
            EntityKind::HoldTag,
            &validated.tag_number,
            |conn| {
                if let Some(tag_id) =
                    find_tag_by_number(conn, &validated.tag_number).attempt("look up tag number")?
                {
                    return Err(Conflict::TagNumberTaken {
                        tag_number: validated.tag_number.clone(),
                        tag_id,
                    }
                    .into());
                }
                Ok(Step::Apply(()))
            },
            |tx, (), now| apply_create(tx, &validated, created_by, now),
        )?;

        tracing::info!(
            tag_id = %tag.tag_id,
            tag_number = %tag.tag_number,
            shift = %tag.qc.shift,
            created_by,
            "hold tag created"
        );
        Ok(tag)
    }

    /// # Errors
    ///
    /// [`HoldError::NotFound`] if no tag has this id.
    pub fn get_hold_tag(&self, tag_id: &str) -> HoldResult<HoldTag> {
        load_hold_tag(self.store.connection(), tag_id)
            .storage("load hold tag")?
            .ok_or_else(|| HoldError::tag_not_found(tag_id))
    }

    /// Tags matching `filter`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`HoldError::Storage`] if the query fails.
    pub fn list_hold_tags(&self, filter: &TagFilter) -> HoldResult<Vec<HoldTag>> {
        list_hold_tags(self.store.connection(), filter).storage("list hold tags")
    }

    /// Write a disposition onto an open tag. Does not close the tag.
    ///
    /// # Errors
    ///
    /// [`HoldError::NotFound`] for an unknown tag, [`HoldError::InvalidState`]
    /// for a closed tag, [`HoldError::Validation`] for a blank signer or an
    /// over-long note.
    pub fn update_disposition(
        &mut self,
        tag_id: &str,
        disposition: &Disposition,
        signed_by: &str,
        qc_date: NaiveDate,
    ) -> HoldResult<HoldTag> {
        validate_tag_ref(tag_id)?;
        validate_actor("signed_by", signed_by)?;
        let max_note_len = self.store.config().disposition.max_note_len;
        if disposition.note.chars().count() > max_note_len {
            return Err(HoldError::validation(
                "note",
                format!("longer than {max_note_len} characters"),
            ));
        }

        let tag = self.store.optimistic(
            "update_disposition",
            EntityKind::HoldTag,
            tag_id,
            |conn| Ok(Step::<_, HoldTag>::Apply(plan_disposition(conn, tag_id)?)),
            |tx, current, now| apply_disposition(tx, &current, disposition, signed_by, qc_date, now),
        )?;

        tracing::info!(
            tag_id,
            outcome = %disposition.outcome,
            signed_by,
            version = tag.version,
            "disposition recorded"
        );
        Ok(tag)
    }

    /// Close a tag that has a final disposition, releasing its label.
    ///
    /// Closing an already-closed tag is a no-op.
    ///
    /// # Errors
    ///
    /// [`HoldError::NotFound`] for an unknown tag and
    /// [`HoldError::InvalidState`] when no final outcome has been recorded.
    pub fn close_hold_tag(&mut self, tag_id: &str, closed_by: &str) -> HoldResult<CloseReceipt> {
        validate_tag_ref(tag_id)?;
        validate_actor("closed_by", closed_by)?;

        let receipt = self.store.optimistic(
            "close_hold_tag",
            EntityKind::HoldTag,
            tag_id,
            |conn| plan_close(conn, tag_id),
            |tx, current, now| close_with_cascade(tx, &current, closed_by, now),
        )?;

        if receipt.already_closed {
            tracing::debug!(tag_id, "hold tag already closed");
        } else {
            tracing::info!(
                tag_id,
                closed_by,
                released_label = receipt.released.as_ref().map(|p| p.qr_id.as_str()),
                "hold tag closed"
            );
        }
        Ok(receipt)
    }
}

pub(crate) fn plan_disposition(conn: &Connection, tag_id: &str) -> Result<HoldTag, AttemptError> {
    let tag = load_hold_tag(conn, tag_id)
        .attempt("load hold tag")?
        .ok_or_else(|| HoldError::tag_not_found(tag_id))?;
    if !tag.is_open() {
        return Err(closed_tag(tag_id, "update disposition on").into());
    }
    Ok(tag)
}

pub(crate) fn plan_close(
    conn: &Connection,
    tag_id: &str,
) -> Result<Step<HoldTag, CloseReceipt>, AttemptError> {
    let tag = load_hold_tag(conn, tag_id)
        .attempt("load hold tag")?
        .ok_or_else(|| HoldError::tag_not_found(tag_id))?;
    if !tag.is_open() {
        return Ok(Step::Done(CloseReceipt {
            tag,
            already_closed: true,
            released: None,
        }));
    }
    if !tag.has_final_disposition() {
        return Err(HoldError::InvalidState {
            entity: EntityKind::HoldTag,
            id: tag_id.to_string(),
            state: "no final disposition recorded".to_string(),
            operation: "close",
        }
        .into());
    }
    Ok(Step::Apply(tag))
}

pub(crate) fn closed_tag(tag_id: &str, operation: &'static str) -> HoldError {
    HoldError::InvalidState {
        entity: EntityKind::HoldTag,
        id: tag_id.to_string(),
        state: "tag is closed".to_string(),
        operation,
    }
}

/// Close `tag` and release whatever label is bound to it, in `tx`.
pub(crate) fn close_with_cascade(
    tx: &Transaction<'_>,
    tag: &HoldTag,
    closed_by: &str,
    now: i64,
) -> Result<CloseReceipt, AttemptError> {
    let closed = apply_close(tx, tag, closed_by, now)?;
    let released = coordinator::on_tag_closed(tx, &closed)?;
    let tag = load_hold_tag(tx, &tag.tag_id)
        .attempt("reload hold tag")?
        .ok_or_else(|| HoldError::tag_not_found(&tag.tag_id))?;
    Ok(CloseReceipt {
        tag,
        already_closed: false,
        released,
    })
}

fn apply_create(
    tx: &Transaction<'_>,
    fields: &ValidatedHoldTag,
    created_by: &str,
    now: i64,
) -> Result<HoldTag, AttemptError> {
    let tag_id = generate_tag_id(&fields.tag_number, now);
    let tag_date = match fields.tag_date {
        Some(date) => date,
        None => chrono::DateTime::from_timestamp_micros(now)
            .map(|ts| ts.date_naive())
            .ok_or_else(|| HoldError::validation("date", "clock is out of range"))?,
    };
    let p = &fields.product;

    tx.execute(
        "INSERT INTO hold_tags (
            tag_id, tag_number, tag_date, product, size, code, location, pallet_tag,
            amount, formula, upc, reason, shift, created_by, created_at_us, updated_at_us
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)",
        params![
            tag_id,
            fields.tag_number,
            tag_date.to_string(),
            p.product,
            p.size,
            p.code,
            p.location,
            p.pallet_tag,
            p.amount,
            p.formula,
            p.upc,
            fields.reason,
            fields.shift.as_str(),
            created_by,
            now,
        ],
    )
    .attempt("insert hold tag")?;

    event::append(
        tx,
        now,
        created_by,
        &tag_id,
        EventData::TagCreate(TagCreateData {
            tag_number: fields.tag_number.clone(),
            product: p.product.clone(),
            amount: p.amount,
            shift: fields.shift,
            reason: fields.reason.clone(),
        }),
    )
    .attempt("append tag.create event")?;

    load_hold_tag(tx, &tag_id)
        .attempt("reload hold tag")?
        .ok_or_else(|| HoldError::tag_not_found(&tag_id).into())
}

pub(crate) fn apply_disposition(
    tx: &Transaction<'_>,
    current: &HoldTag,
    disposition: &Disposition,
    signed_by: &str,
    qc_date: NaiveDate,
    now: i64,
) -> Result<HoldTag, AttemptError> {
    let updated = tx
        .execute(
            "UPDATE hold_tags
             SET disposition = ?1, outcome = ?2, signed_by = ?3, qc_date = ?4,
                 latest_disposition = ?5, version = version + 1, updated_at_us = ?6
             WHERE tag_id = ?7 AND version = ?8 AND status = 'open'",
            params![
                disposition.note,
                disposition.outcome.as_str(),
                signed_by,
                qc_date.to_string(),
                disposition.summary(),
                now,
                current.tag_id,
                current.version,
            ],
        )
        .attempt("update disposition")?;
    if updated == 0 {
        return Err(AttemptError::Transient(Transient::StaleVersion));
    }

    event::append(
        tx,
        now,
        signed_by,
        &current.tag_id,
        EventData::TagDisposition(TagDispositionData {
            outcome: disposition.outcome,
            note: disposition.note.clone(),
            signed_by: signed_by.to_string(),
            qc_date: qc_date.to_string(),
        }),
    )
    .attempt("append tag.disposition event")?;

    load_hold_tag(tx, &current.tag_id)
        .attempt("reload hold tag")?
        .ok_or_else(|| HoldError::tag_not_found(&current.tag_id).into())
}

fn apply_close(
    tx: &Transaction<'_>,
    current: &HoldTag,
    closed_by: &str,
    now: i64,
) -> Result<TagClosed, AttemptError> {
    let updated = tx
        .execute(
            "UPDATE hold_tags
             SET status = 'closed', closed_at_us = ?1, closed_by = ?2,
                 version = version + 1, updated_at_us = ?1
             WHERE tag_id = ?3 AND version = ?4 AND status = 'open'",
            params![now, closed_by, current.tag_id, current.version],
        )
        .attempt("close hold tag")?;
    if updated == 0 {
        return Err(AttemptError::Transient(Transient::StaleVersion));
    }

    event::append(
        tx,
        now,
        closed_by,
        &current.tag_id,
        EventData::TagClose(TagCloseData {
            latest_disposition: current.latest_disposition.clone(),
        }),
    )
    .attempt("append tag.close event")?;

    Ok(TagClosed {
        tag_id: current.tag_id.clone(),
        closed_by: closed_by.to_string(),
        closed_at_us: now,
    })
}

/// Bump an open tag's version so concurrent writers touching it replan.
/// Misses when the tag changed or closed since it was read.
pub(crate) fn touch_open_tag(
    tx: &Transaction<'_>,
    tag_id: &str,
    expected_version: i64,
) -> Result<(), AttemptError> {
    let updated = tx
        .execute(
            "UPDATE hold_tags SET version = version + 1
             WHERE tag_id = ?1 AND version = ?2 AND status = 'open'",
            params![tag_id, expected_version],
        )
        .attempt("guard hold tag version")?;
    if updated == 0 {
        return Err(AttemptError::Transient(Transient::StaleVersion));
    }
    Ok(())
}

pub(crate) fn load_hold_tag(conn: &Connection, tag_id: &str) -> rusqlite::Result<Option<HoldTag>> {
    conn.query_row(
        &format!("SELECT {TAG_COLUMNS} FROM hold_tags WHERE tag_id = ?1"),
        [tag_id],
        row_to_hold_tag,
    )
    .optional()
}

fn find_tag_by_number(conn: &Connection, tag_number: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT tag_id FROM hold_tags WHERE tag_number = ?1",
        [tag_number],
        |row| row.get(0),
    )
    .optional()
}

fn list_hold_tags(conn: &Connection, filter: &TagFilter) -> rusqlite::Result<Vec<HoldTag>> {
    let mut conditions: Vec<String> = Vec::new();
    let mut param_values: Vec<&'static str> = Vec::new();

    if let Some(status) = filter.status {
        param_values.push(status.as_str());
        conditions.push(format!("status = ?{}", param_values.len()));
    }
    if let Some(shift) = filter.shift {
        param_values.push(shift.as_str());
        conditions.push(format!("shift = ?{}", param_values.len()));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };

    let limit_clause = match (filter.limit, filter.offset) {
        (Some(limit), Some(offset)) => format!(" LIMIT {limit} OFFSET {offset}"),
        (Some(limit), None) => format!(" LIMIT {limit}"),
        (None, Some(offset)) => format!(" LIMIT -1 OFFSET {offset}"),
        (None, None) => String::new(),
    };

    let sql = format!(
        "SELECT {TAG_COLUMNS} FROM hold_tags{where_clause} \
         ORDER BY created_at_us DESC, tag_id DESC{limit_clause}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(param_values), row_to_hold_tag)?;
    rows.collect()
}

fn parse_column<T: std::str::FromStr>(idx: usize, raw: &str) -> rusqlite::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_date(idx: usize, raw: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_hold_tag(row: &Row<'_>) -> rusqlite::Result<HoldTag> {
    let tag_date: String = row.get(2)?;
    let shift: String = row.get(12)?;
    let outcome: Option<String> = row.get(14)?;
    let qc_date: Option<String> = row.get(16)?;
    let status: String = row.get(18)?;

    Ok(HoldTag {
        tag_id: row.get(0)?,
        tag_number: row.get(1)?,
        tag_date: parse_date(2, &tag_date)?,
        product: ProductInfo {
            product: row.get(3)?,
            size: row.get(4)?,
            code: row.get(5)?,
            location: row.get(6)?,
            pallet_tag: row.get(7)?,
            amount: row.get(8)?,
            formula: row.get(9)?,
            upc: row.get(10)?,
        },
        qc: QcDetails {
            reason: row.get(11)?,
            shift: parse_column::<Shift>(12, &shift)?,
            disposition: row.get(13)?,
            outcome: outcome
                .as_deref()
                .map(|raw| parse_column::<DispositionOutcome>(14, raw))
                .transpose()?,
            signed_by: row.get(15)?,
            qc_date: qc_date.as_deref().map(|raw| parse_date(16, raw)).transpose()?,
        },
        latest_disposition: row.get(17)?,
        status: parse_column::<TagStatus>(18, &status)?,
        version: row.get(19)?,
        created_by: row.get(20)?,
        created_at_us: row.get(21)?,
        updated_at_us: row.get(22)?,
        closed_at_us: row.get(23)?,
        closed_by: row.get(24)?,
    })
}

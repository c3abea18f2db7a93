//! Append-only audit event log.
//!
//! Every mutation of a hold tag or QR label appends one [`Event`] inside the
//! same transaction that changes the current-state tables. Events are chained:
//! each row stores the hash of its predecessor, and its own hash covers that
//! predecessor plus its fields, so any rewrite of history breaks the chain.
//!
//! Hash input (UTF-8):
//!
//! ```text
//! {prev_hash}\t{wall_ts_us}\t{actor}\t{event_type}\t{entity_id}\t{data_json}\n
//! ```
//!
//! `prev_hash` is the empty string for the first event.

pub mod data;
pub mod types;

pub use data::{
    DataParseError, EventData, LabelBindData, LabelRegisterData, LabelUnbindData, TagCloseData,
    TagCreateData, TagDispositionData,
};
pub use types::{EventType, UnknownEventType};

use rusqlite::{Connection, OptionalExtension, params, types::Type};
use serde::Serialize;

/// One row of the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub seq: i64,
    pub wall_ts_us: i64,
    pub actor: String,
    pub event_type: EventType,
    /// Tag id for `tag.*` events, QR id for `label.*` events.
    pub entity_id: String,
    pub data: EventData,
    pub prev_hash: Option<String>,
    pub event_hash: String,
}

/// Compute the chained BLAKE3 hash for an event, in `blake3:<hex>` format.
#[must_use]
pub fn compute_event_hash(
    prev_hash: Option<&str>,
    wall_ts_us: i64,
    actor: &str,
    event_type: EventType,
    entity_id: &str,
    data_json: &str,
) -> String {
    let hash_input = format!(
        "{}\t{}\t{}\t{}\t{}\t{}\n",
        prev_hash.unwrap_or(""),
        wall_ts_us,
        actor,
        event_type,
        entity_id,
        data_json,
    );
    let hash = blake3::hash(hash_input.as_bytes());
    format!("blake3:{hash}")
}

/// Append an event to the log.
///
/// Must run inside the write transaction of the mutation it records so the
/// chain head cannot move underneath it.
///
/// # Errors
///
/// Returns an error if the payload cannot be serialized or the insert fails.
pub fn append(
    conn: &Connection,
    wall_ts_us: i64,
    actor: &str,
    entity_id: &str,
    data: EventData,
) -> rusqlite::Result<Event> {
    let event_type = data.event_type();
    let data_json = data
        .to_json()
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

    let prev_hash: Option<String> = conn
        .query_row(
            "SELECT event_hash FROM events ORDER BY seq DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;

    let event_hash = compute_event_hash(
        prev_hash.as_deref(),
        wall_ts_us,
        actor,
        event_type,
        entity_id,
        &data_json,
    );

    conn.execute(
        "INSERT INTO events (wall_ts_us, actor, event_type, entity_id, data_json, prev_hash, event_hash)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            wall_ts_us,
            actor,
            event_type.as_str(),
            entity_id,
            data_json,
            prev_hash,
            event_hash,
        ],
    )?;

    tracing::trace!(%event_type, entity_id, %event_hash, "appended audit event");

    Ok(Event {
        seq: conn.last_insert_rowid(),
        wall_ts_us,
        actor: actor.to_string(),
        event_type,
        entity_id: entity_id.to_string(),
        data,
        prev_hash,
        event_hash,
    })
}

const EVENT_COLUMNS: &str =
    "seq, wall_ts_us, actor, event_type, entity_id, data_json, prev_hash, event_hash";

/// Every event in log order.
///
/// # Errors
///
/// Returns an error if the query fails or a stored row cannot be decoded.
pub fn all_events(conn: &Connection) -> rusqlite::Result<Vec<Event>> {
    let mut stmt = conn.prepare(&format!("SELECT {EVENT_COLUMNS} FROM events ORDER BY seq"))?;
    let rows = stmt.query_map([], row_to_event)?;
    rows.collect()
}

/// Events for one tag or label, in log order.
///
/// # Errors
///
/// Returns an error if the query fails or a stored row cannot be decoded.
pub fn events_for_entity(conn: &Connection, entity_id: &str) -> rusqlite::Result<Vec<Event>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EVENT_COLUMNS} FROM events WHERE entity_id = ?1 ORDER BY seq"
    ))?;
    let rows = stmt.query_map([entity_id], row_to_event)?;
    rows.collect()
}

/// Label events only, in log order; the input for projection rebuilds.
///
/// # Errors
///
/// Returns an error if the query fails or a stored row cannot be decoded.
pub fn label_events(conn: &Connection) -> rusqlite::Result<Vec<Event>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EVENT_COLUMNS} FROM events WHERE event_type LIKE 'label.%' ORDER BY seq"
    ))?;
    let rows = stmt.query_map([], row_to_event)?;
    rows.collect()
}

/// Where the hash chain first breaks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainBreak {
    /// `prev_hash` does not match the preceding event's hash.
    Link { seq: i64 },
    /// The stored hash does not match the recomputed one.
    Hash { seq: i64 },
}

/// Walk the whole log and report the first broken link, if any.
///
/// # Errors
///
/// Returns an error if reading the log fails.
pub fn verify_chain(conn: &Connection) -> rusqlite::Result<Option<ChainBreak>> {
    let mut stmt = conn.prepare(
        "SELECT seq, wall_ts_us, actor, event_type, entity_id, data_json, prev_hash, event_hash
         FROM events ORDER BY seq",
    )?;
    let mut rows = stmt.query([])?;

    let mut expected_prev: Option<String> = None;
    while let Some(row) = rows.next()? {
        let seq: i64 = row.get(0)?;
        let wall_ts_us: i64 = row.get(1)?;
        let actor: String = row.get(2)?;
        let event_type = parse_event_type(row.get(3)?)?;
        let entity_id: String = row.get(4)?;
        let data_json: String = row.get(5)?;
        let prev_hash: Option<String> = row.get(6)?;
        let event_hash: String = row.get(7)?;

        if prev_hash != expected_prev {
            return Ok(Some(ChainBreak::Link { seq }));
        }
        let recomputed = compute_event_hash(
            prev_hash.as_deref(),
            wall_ts_us,
            &actor,
            event_type,
            &entity_id,
            &data_json,
        );
        if recomputed != event_hash {
            return Ok(Some(ChainBreak::Hash { seq }));
        }
        expected_prev = Some(event_hash);
    }

    Ok(None)
}

fn parse_event_type(raw: String) -> rusqlite::Result<EventType> {
    raw.parse::<EventType>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let event_type = parse_event_type(row.get(3)?)?;
    let data_json: String = row.get(5)?;
    let data = EventData::deserialize_for(event_type, &data_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;

    Ok(Event {
        seq: row.get(0)?,
        wall_ts_us: row.get(1)?,
        actor: row.get(2)?,
        event_type,
        entity_id: row.get(4)?,
        data,
        prev_hash: row.get(6)?,
        event_hash: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn bind(tag: &str) -> EventData {
        EventData::LabelBind(LabelBindData { tag_id: tag.into() })
    }

    #[test]
    fn append_chains_hashes() {
        let conn = db::open_in_memory().expect("open store");
        let first = append(&conn, 10, "op-1", "QR-1", EventData::LabelRegister(LabelRegisterData {}))
            .expect("append register");
        let second = append(&conn, 11, "op-1", "QR-1", bind("ht-1")).expect("append bind");

        assert_eq!(first.prev_hash, None);
        assert_eq!(second.prev_hash.as_deref(), Some(first.event_hash.as_str()));
        assert!(second.event_hash.starts_with("blake3:"));
        assert_eq!(verify_chain(&conn).expect("verify"), None);
    }

    #[test]
    fn events_for_entity_filters_and_orders() {
        let conn = db::open_in_memory().expect("open store");
        append(&conn, 1, "op", "QR-1", EventData::LabelRegister(LabelRegisterData {})).expect("a");
        append(&conn, 2, "op", "QR-2", EventData::LabelRegister(LabelRegisterData {})).expect("b");
        append(&conn, 3, "op", "QR-1", bind("ht-1")).expect("c");

        let events = events_for_entity(&conn, "QR-1").expect("read");
        let types: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec![EventType::LabelRegister, EventType::LabelBind]);
        assert_eq!(label_events(&conn).expect("labels").len(), 3);
        assert_eq!(all_events(&conn).expect("all").len(), 3);
    }

    #[test]
    fn events_cannot_be_rewritten() {
        let conn = db::open_in_memory().expect("open store");
        append(&conn, 1, "op", "QR-1", EventData::LabelRegister(LabelRegisterData {})).expect("a");
        assert!(conn.execute("UPDATE events SET actor = 'mallory'", []).is_err());
        assert!(conn.execute("DELETE FROM events", []).is_err());
    }

    #[test]
    fn verify_chain_detects_tampered_hash() {
        let conn = db::open_in_memory().expect("open store");
        append(&conn, 1, "op", "QR-1", EventData::LabelRegister(LabelRegisterData {})).expect("a");
        append(&conn, 2, "op", "QR-1", bind("ht-1")).expect("b");

        conn.execute_batch(
            "DROP TRIGGER events_no_update;
             UPDATE events SET data_json = '{\"tag_id\":\"ht-2\"}' WHERE seq = 2;",
        )
        .expect("tamper");

        assert_eq!(verify_chain(&conn).expect("verify"), Some(ChainBreak::Hash { seq: 2 }));
    }
}

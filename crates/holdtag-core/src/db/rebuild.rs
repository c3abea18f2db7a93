//! Label projection rebuild from the event log.
//!
//! `qr_labels` and `label_assignments` are derived state: replaying the
//! `label.*` events in log order reproduces them exactly, including label
//! versions. Rebuild replays in memory first, then swaps both tables inside
//! one immediate transaction with `store_meta.rebuilding` raised so the
//! history table's delete guard stands aside.

use std::collections::BTreeMap;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, TransactionBehavior, params};

use crate::event::{self, Event, EventData};
use crate::model::{Binding, PastAssignment, QrLabel};
use crate::store::ledger::insert_assignment;

/// Report returned after a rebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildReport {
    /// Label events replayed.
    pub event_count: usize,
    pub label_count: usize,
    pub assignment_count: usize,
    pub elapsed: std::time::Duration,
}

/// The label tables as implied by the event log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelProjection {
    /// Keyed by QR id.
    pub labels: BTreeMap<String, QrLabel>,
    /// In the order the bindings ended.
    pub assignments: Vec<PastAssignment>,
}

/// Fold label events into the projection they imply.
///
/// # Errors
///
/// Returns an error if the events are inconsistent: a label registered
/// twice, or bound or unbound in a state that does not allow it.
pub fn replay_label_events(events: &[Event]) -> Result<LabelProjection> {
    let mut projection = LabelProjection::default();

    for event in events {
        let qr_id = &event.entity_id;
        match &event.data {
            EventData::LabelRegister(_) => {
                if projection.labels.contains_key(qr_id) {
                    bail!("event {}: label {qr_id} registered twice", event.seq);
                }
                projection.labels.insert(
                    qr_id.clone(),
                    QrLabel {
                        qr_id: qr_id.clone(),
                        binding: Binding::Unbound,
                        version: 1,
                        registered_by: event.actor.clone(),
                        created_at_us: event.wall_ts_us,
                    },
                );
            }
            EventData::LabelBind(data) => {
                let label = registered(&mut projection.labels, event)?;
                if label.is_active() {
                    bail!("event {}: label {qr_id} bound while already bound", event.seq);
                }
                label.binding = Binding::Bound {
                    tag_id: data.tag_id.clone(),
                    assigned_at_us: event.wall_ts_us,
                    assigned_by: event.actor.clone(),
                };
                label.version += 1;
            }
            EventData::LabelUnbind(data) => {
                let label = registered(&mut projection.labels, event)?;
                let Binding::Bound {
                    tag_id,
                    assigned_at_us,
                    assigned_by,
                } = std::mem::replace(&mut label.binding, Binding::Unbound)
                else {
                    bail!("event {}: label {qr_id} unbound while unbound", event.seq);
                };
                if tag_id != data.tag_id {
                    bail!(
                        "event {}: label {qr_id} unbound from {} but was bound to {tag_id}",
                        event.seq,
                        data.tag_id
                    );
                }
                label.version += 1;
                projection.assignments.push(PastAssignment {
                    qr_id: qr_id.clone(),
                    tag_id,
                    assigned_at_us,
                    assigned_by,
                    unassigned_at_us: event.wall_ts_us,
                    unassigned_by: event.actor.clone(),
                    reason: data.reason.clone(),
                });
            }
            EventData::TagCreate(_) | EventData::TagDisposition(_) | EventData::TagClose(_) => {}
        }
    }

    Ok(projection)
}

fn registered<'a>(
    labels: &'a mut BTreeMap<String, QrLabel>,
    event: &Event,
) -> Result<&'a mut QrLabel> {
    labels
        .get_mut(&event.entity_id)
        .with_context(|| format!("event {}: label {} was never registered", event.seq, event.entity_id))
}

/// Read the label projection as currently stored.
///
/// # Errors
///
/// Returns an error if the tables cannot be read.
pub fn stored_label_projection(conn: &Connection) -> Result<LabelProjection> {
    let labels = crate::store::ledger::list_labels(conn, false)
        .context("read qr_labels")?
        .into_iter()
        .map(|label| (label.qr_id.clone(), label))
        .collect();

    let mut stmt = conn
        .prepare(
            "SELECT qr_id, tag_id, assigned_at_us, assigned_by, unassigned_at_us, unassigned_by, reason
             FROM label_assignments ORDER BY assignment_id",
        )
        .context("prepare label_assignments scan")?;
    let assignments = stmt
        .query_map([], |row| {
            Ok(PastAssignment {
                qr_id: row.get(0)?,
                tag_id: row.get(1)?,
                assigned_at_us: row.get(2)?,
                assigned_by: row.get(3)?,
                unassigned_at_us: row.get(4)?,
                unassigned_by: row.get(5)?,
                reason: row.get(6)?,
            })
        })
        .context("scan label_assignments")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("read label_assignments row")?;

    Ok(LabelProjection {
        labels,
        assignments,
    })
}

/// Replace `qr_labels` and `label_assignments` with the replay of the log.
///
/// # Errors
///
/// Returns an error if the log is inconsistent or any write fails; nothing
/// is changed in that case.
pub fn rebuild_label_projection(conn: &mut Connection) -> Result<RebuildReport> {
    let start = Instant::now();
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("begin rebuild transaction")?;

    let events = event::label_events(&tx).context("read label events")?;
    let projection = replay_label_events(&events)?;

    tx.execute("UPDATE store_meta SET rebuilding = 1 WHERE id = 1", [])
        .context("mark rebuild in progress")?;
    tx.execute("DELETE FROM label_assignments", [])
        .context("clear label_assignments")?;
    tx.execute("DELETE FROM qr_labels", []).context("clear qr_labels")?;

    for label in projection.labels.values() {
        let (tag_id, assigned_at_us, assigned_by) = match &label.binding {
            Binding::Unbound => (None, None, None),
            Binding::Bound {
                tag_id,
                assigned_at_us,
                assigned_by,
            } => (Some(tag_id), Some(*assigned_at_us), Some(assigned_by)),
        };
        tx.execute(
            "INSERT INTO qr_labels (
                qr_id, current_tag_id, assigned_at_us, assigned_by, version, registered_by,
                created_at_us
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                label.qr_id,
                tag_id,
                assigned_at_us,
                assigned_by,
                label.version,
                label.registered_by,
                label.created_at_us,
            ],
        )
        .with_context(|| format!("restore label {}", label.qr_id))?;
    }

    for past in &projection.assignments {
        insert_assignment(&tx, past)
            .with_context(|| format!("restore history of label {}", past.qr_id))?;
    }

    tx.execute(
        "UPDATE store_meta SET rebuilding = 0, last_rebuild_at_us = ?1 WHERE id = 1",
        [crate::store::now_us()],
    )
    .context("mark rebuild complete")?;
    tx.commit().context("commit rebuild")?;

    let report = RebuildReport {
        event_count: events.len(),
        label_count: projection.labels.len(),
        assignment_count: projection.assignments.len(),
        elapsed: start.elapsed(),
    };
    tracing::info!(
        events = report.event_count,
        labels = report.label_count,
        assignments = report.assignment_count,
        elapsed_ms = u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
        "label projection rebuilt"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{LabelBindData, LabelRegisterData, LabelUnbindData};

    fn ev(seq: i64, ts: i64, qr: &str, data: EventData) -> Event {
        Event {
            seq,
            wall_ts_us: ts,
            actor: "op".into(),
            event_type: data.event_type(),
            entity_id: qr.into(),
            data,
            prev_hash: None,
            event_hash: format!("blake3:{seq}"),
        }
    }

    fn register(seq: i64, qr: &str) -> Event {
        ev(seq, seq * 10, qr, EventData::LabelRegister(LabelRegisterData {}))
    }

    fn bind(seq: i64, qr: &str, tag: &str) -> Event {
        ev(
            seq,
            seq * 10,
            qr,
            EventData::LabelBind(LabelBindData { tag_id: tag.into() }),
        )
    }

    fn unbind(seq: i64, qr: &str, tag: &str, reason: Option<&str>) -> Event {
        ev(
            seq,
            seq * 10,
            qr,
            EventData::LabelUnbind(LabelUnbindData {
                tag_id: tag.into(),
                reason: reason.map(str::to_string),
            }),
        )
    }

    #[test]
    fn replay_tracks_binding_versions_and_history() {
        let events = vec![
            register(1, "QR-1"),
            bind(2, "QR-1", "ht-1"),
            unbind(3, "QR-1", "ht-1", Some("mislabel")),
            bind(4, "QR-1", "ht-2"),
        ];
        let projection = replay_label_events(&events).expect("replay");

        let label = &projection.labels["QR-1"];
        assert_eq!(label.version, 4);
        assert_eq!(label.current_tag_id(), Some("ht-2"));
        assert_eq!(projection.assignments.len(), 1);
        let past = &projection.assignments[0];
        assert_eq!((past.assigned_at_us, past.unassigned_at_us), (20, 30));
        assert_eq!(past.reason.as_deref(), Some("mislabel"));
    }

    #[test]
    fn replay_rejects_inconsistent_logs() {
        assert!(replay_label_events(&[bind(1, "QR-1", "ht-1")]).is_err());
        assert!(replay_label_events(&[register(1, "QR-1"), register(2, "QR-1")]).is_err());
        assert!(replay_label_events(&[register(1, "QR-1"), unbind(2, "QR-1", "ht-1", None)]).is_err());
        assert!(
            replay_label_events(&[
                register(1, "QR-1"),
                bind(2, "QR-1", "ht-1"),
                bind(3, "QR-1", "ht-2"),
            ])
            .is_err()
        );
    }
}

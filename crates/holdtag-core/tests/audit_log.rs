//! Event log integrity and label projection rebuilds on an on-disk store.

use holdtag_core::db::rebuild::{replay_label_events, stored_label_projection};
use holdtag_core::event::{self, ChainBreak, EventType};
use holdtag_core::model::{DispositionInput, NewHoldTag, ProductInfo};
use holdtag_core::verify::Violation;
use holdtag_core::{HoldConfig, Store};
use tempfile::TempDir;

fn busy_store(dir: &TempDir) -> Store {
    let mut store =
        Store::open(&dir.path().join("holdtag.db"), HoldConfig::default()).expect("open store");
    let mut tags = Vec::new();
    for n in 0..3 {
        let tag = store
            .hold_tags()
            .create_hold_tag(
                &NewHoldTag {
                    tag_number: format!("HT-{n}"),
                    product: ProductInfo {
                        product: "Wafers".to_string(),
                        amount: 5,
                        ..ProductInfo::default()
                    },
                    reason: "Foreign material".to_string(),
                    shift: "D".to_string(),
                    ..NewHoldTag::default()
                },
                "qc-lead",
            )
            .expect("create tag");
        tags.push(tag.tag_id);
    }
    for qr in ["QR-1", "QR-2"] {
        store.ledger().register_label(qr, "receiving").expect("register");
    }

    let mut coord = store.coordinator();
    coord.scan("QR-1", &tags[0], "op").expect("scan");
    coord
        .force_rebind("QR-1", &tags[1], "op", "mislabel")
        .expect("rebind");
    coord.scan("QR-2", &tags[0], "op").expect("scan");
    coord.unbind("QR-2", "op", Some("pallet split")).expect("unbind");
    coord.scan("QR-2", &tags[2], "op").expect("scan");

    store
        .workflow()
        .record_disposition(
            &tags[1],
            &DispositionInput {
                outcome: "release".to_string(),
                note: "retest passed".to_string(),
                signed_by: "qc-lead".to_string(),
                qc_date: "2024-05-03".to_string(),
            },
        )
        .expect("release");
    store
}

#[test]
fn every_mutation_is_logged_and_chained() {
    let dir = TempDir::new().expect("tempdir");
    let store = busy_store(&dir);
    let conn = store.connection();

    let events = event::all_events(conn).expect("events");
    assert_eq!(events[0].prev_hash, None);
    for pair in events.windows(2) {
        assert_eq!(pair[1].prev_hash.as_deref(), Some(pair[0].event_hash.as_str()));
    }
    assert_eq!(event::verify_chain(conn).expect("verify"), None);

    let qr1 = event::events_for_entity(conn, "QR-1").expect("QR-1 events");
    let kinds: Vec<EventType> = qr1.iter().map(|e| e.event_type).collect();
    assert_eq!(
        kinds,
        vec![
            EventType::LabelRegister,
            EventType::LabelBind,
            EventType::LabelUnbind,
            EventType::LabelBind,
            EventType::LabelUnbind,
        ]
    );
}

#[test]
fn replaying_label_events_matches_stored_tables() {
    let dir = TempDir::new().expect("tempdir");
    let store = busy_store(&dir);
    let conn = store.connection();

    let replayed = replay_label_events(&event::label_events(conn).expect("events")).expect("replay");
    let stored = stored_label_projection(conn).expect("stored");
    assert_eq!(replayed, stored);
    assert!(store.check_invariants().expect("check").is_clean());
}

#[test]
fn rebuild_reproduces_projection_exactly() {
    let dir = TempDir::new().expect("tempdir");
    let mut store = busy_store(&dir);
    let before = stored_label_projection(store.connection()).expect("before");

    let report = store.rebuild_label_projection().expect("rebuild");
    assert_eq!(report.label_count, 2);
    assert_eq!(report.assignment_count, before.assignments.len());

    let after = stored_label_projection(store.connection()).expect("after");
    assert_eq!(before, after);
    assert!(store.check_invariants().expect("check").is_clean());

    // The rebuilt tables keep working.
    let label = store.ledger().get_binding("QR-2").expect("label");
    let tag_id = label.current_tag_id().expect("QR-2 bound").to_string();
    store
        .coordinator()
        .unbind("QR-2", "op", None)
        .expect("unbind after rebuild");
    let history = store.ledger().history("QR-2").expect("history");
    assert_eq!(
        history.previous_assignments.last().map(|p| p.tag_id.as_str()),
        Some(tag_id.as_str())
    );
}

#[test]
fn rebuild_repairs_hand_deleted_binding() {
    let dir = TempDir::new().expect("tempdir");
    let mut store = busy_store(&dir);
    store
        .connection()
        .execute(
            "UPDATE qr_labels SET current_tag_id = NULL, assigned_at_us = NULL, assigned_by = NULL
             WHERE qr_id = 'QR-2'",
            [],
        )
        .expect("hand edit");

    let report = store.check_invariants().expect("check");
    assert!(
        report
            .violations
            .iter()
            .any(|v| matches!(v, Violation::ProjectionDrift { .. }))
    );

    store.rebuild_label_projection().expect("rebuild");
    assert!(store.check_invariants().expect("check").is_clean());
    assert!(store.ledger().get_binding("QR-2").expect("label").is_active());
}

#[test]
fn tampering_with_history_is_detected() {
    let dir = TempDir::new().expect("tempdir");
    let store = busy_store(&dir);
    let conn = store.connection();

    let target = event::events_for_entity(conn, "QR-1").expect("events")[2].seq;
    conn.execute_batch("DROP TRIGGER events_no_update;")
        .expect("drop guard");
    conn.execute(
        "UPDATE events SET actor = 'someone-else' WHERE seq = ?1",
        [target],
    )
    .expect("tamper");

    assert_eq!(
        event::verify_chain(conn).expect("verify"),
        Some(ChainBreak::Hash { seq: target })
    );
    let report = store.check_invariants().expect("check");
    assert!(
        report
            .violations
            .iter()
            .any(|v| matches!(v, Violation::BrokenEventChain { seq, .. } if *seq == target))
    );
}

#[test]
fn append_only_guards_reject_rewrites() {
    let dir = TempDir::new().expect("tempdir");
    let store = busy_store(&dir);
    let conn = store.connection();

    assert!(conn.execute("DELETE FROM events", []).is_err());
    assert!(conn.execute("UPDATE events SET actor = 'x'", []).is_err());
    assert!(conn.execute("DELETE FROM label_assignments", []).is_err());
}

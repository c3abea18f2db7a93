//! Property tests: arbitrary operation sequences keep the ledger consistent.

use holdtag_core::db::rebuild::{replay_label_events, stored_label_projection};
use holdtag_core::event;
use holdtag_core::model::{DispositionInput, DispositionOutcome, NewHoldTag, ProductInfo};
use holdtag_core::{ErrorCode, HoldConfig, HoldError, Store};
use proptest::prelude::*;

const TAGS: usize = 4;
const LABELS: usize = 4;

#[derive(Debug, Clone)]
enum Op {
    Scan(usize, usize),
    Force(usize, usize),
    Unbind(usize),
    Dispose(usize, DispositionOutcome),
    Close(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let outcome = prop_oneof![
        Just(DispositionOutcome::Pending),
        Just(DispositionOutcome::Release),
        Just(DispositionOutcome::Rework),
        Just(DispositionOutcome::Destroy),
    ];
    prop_oneof![
        4 => (0..LABELS, 0..TAGS).prop_map(|(l, t)| Op::Scan(l, t)),
        2 => (0..LABELS, 0..TAGS).prop_map(|(l, t)| Op::Force(l, t)),
        1 => (0..LABELS).prop_map(Op::Unbind),
        1 => (0..TAGS, outcome).prop_map(|(t, o)| Op::Dispose(t, o)),
        1 => (0..TAGS).prop_map(Op::Close),
    ]
}

fn seeded_store() -> (Store, Vec<String>) {
    let mut store = Store::open_in_memory(HoldConfig::default()).expect("open store");
    let tags = (0..TAGS)
        .map(|n| {
            store
                .hold_tags()
                .create_hold_tag(
                    &NewHoldTag {
                        tag_number: format!("HT-{n}"),
                        product: ProductInfo {
                            product: "Wafers".to_string(),
                            amount: 1,
                            ..ProductInfo::default()
                        },
                        reason: "Seal".to_string(),
                        shift: "A".to_string(),
                        ..NewHoldTag::default()
                    },
                    "qc",
                )
                .expect("create tag")
                .tag_id
        })
        .collect();
    for n in 0..LABELS {
        store
            .ledger()
            .register_label(&format!("QR-{n}"), "qc")
            .expect("register");
    }
    (store, tags)
}

fn run(store: &mut Store, tags: &[String], op: &Op) -> Result<(), HoldError> {
    match op {
        Op::Scan(l, t) => store
            .coordinator()
            .scan(&format!("QR-{l}"), &tags[*t], "op")
            .map(drop),
        Op::Force(l, t) => store
            .coordinator()
            .force_rebind(&format!("QR-{l}"), &tags[*t], "op", "relabel")
            .map(drop),
        Op::Unbind(l) => store
            .coordinator()
            .unbind(&format!("QR-{l}"), "op", None)
            .map(drop),
        Op::Dispose(t, outcome) => store
            .workflow()
            .record_disposition(
                &tags[*t],
                &DispositionInput {
                    outcome: outcome.as_str().to_string(),
                    note: String::new(),
                    signed_by: "qc".to_string(),
                    qc_date: "2024-05-01".to_string(),
                },
            )
            .map(drop),
        Op::Close(t) => store.workflow().close_hold_tag(&tags[*t], "qc").map(drop),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn random_sequences_keep_invariants(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let (mut store, tags) = seeded_store();
        for op in &ops {
            if let Err(err) = run(&mut store, &tags, op) {
                // Rejections are fine; infrastructure failures are not.
                prop_assert_ne!(err.code(), ErrorCode::StorageFailure, "{:?} failed: {}", op, err);
                prop_assert_ne!(err.code(), ErrorCode::RetriesExhausted, "{:?} failed: {}", op, err);
            }
        }

        let report = store.check_invariants().expect("check");
        prop_assert!(report.is_clean(), "{:?}", report.violations);

        let active = store.ledger().list_labels(true).expect("labels");
        for label in &active {
            let tag_id = label.current_tag_id().unwrap_or_default();
            let tag = store.hold_tags().get_hold_tag(tag_id).expect("tag");
            prop_assert!(tag.is_open());
        }

        let conn = store.connection();
        let replayed = replay_label_events(&event::label_events(conn).expect("events"))
            .expect("replay");
        prop_assert_eq!(replayed, stored_label_projection(conn).expect("stored"));
    }
}
